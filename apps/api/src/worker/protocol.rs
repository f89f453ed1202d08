//! Messages exchanged with the execution unit.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ranking::engine::{EngineError, RecommendationRequest, RecommendationResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Ping {
        id: Uuid,
    },
    Recommend {
        id: Uuid,
        payload: RecommendationRequest,
    },
}

impl WorkerRequest {
    pub fn ping() -> Self {
        WorkerRequest::Ping { id: Uuid::new_v4() }
    }

    pub fn recommend(payload: RecommendationRequest) -> Self {
        WorkerRequest::Recommend {
            id: Uuid::new_v4(),
            payload,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            WorkerRequest::Ping { id } | WorkerRequest::Recommend { id, .. } => *id,
        }
    }

    /// Rejects malformed payloads before they reach the unit.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            WorkerRequest::Ping { .. } => Ok(()),
            WorkerRequest::Recommend { payload, .. } => payload.validate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    Pong {
        id: Uuid,
        success: bool,
        #[serde(rename = "elapsedMs")]
        elapsed_ms: u64,
    },
    Result {
        id: Uuid,
        success: bool,
        data: Box<RecommendationResult>,
        #[serde(rename = "elapsedMs")]
        elapsed_ms: u64,
    },
    Error {
        id: Uuid,
        success: bool,
        error: ErrorBody,
        #[serde(rename = "elapsedMs")]
        elapsed_ms: u64,
    },
}

impl WorkerResponse {
    pub fn pong(id: Uuid, elapsed_ms: u64) -> Self {
        WorkerResponse::Pong {
            id,
            success: true,
            elapsed_ms,
        }
    }

    pub fn result(id: Uuid, data: RecommendationResult, elapsed_ms: u64) -> Self {
        WorkerResponse::Result {
            id,
            success: true,
            data: Box::new(data),
            elapsed_ms,
        }
    }

    pub fn error(id: Uuid, code: &str, message: impl Into<String>, elapsed_ms: u64) -> Self {
        WorkerResponse::Error {
            id,
            success: false,
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
            },
            elapsed_ms,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            WorkerResponse::Pong { id, .. }
            | WorkerResponse::Result { id, .. }
            | WorkerResponse::Error { id, .. } => *id,
        }
    }
}
