use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of bullets a role may contribute to a selection.
pub const DEFAULT_BULLETS_LIMIT: usize = 4;

/// A position held by the user. Owns projects, which own bullets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub title: String,
    pub company: Option<String>,
    /// Per-role quota enforced by the selector.
    pub bullets_limit: usize,
    pub created_at: DateTime<Utc>,
}

/// A project inside a role. The centroid is a derived cache of member embeddings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub role_id: Uuid,
    pub name: String,
    pub centroid: Option<Vec<f32>>,
    pub dims: usize,
    pub embedding_version: i64,
    pub bullet_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(role_id: Uuid, name: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role_id,
            name,
            centroid: None,
            dims: 0,
            embedding_version: 0,
            bullet_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingState {
    Pending,
    Ready,
    Stale,
    Failed,
}

impl EmbeddingState {
    pub const ALL: [EmbeddingState; 4] = [
        EmbeddingState::Pending,
        EmbeddingState::Ready,
        EmbeddingState::Stale,
        EmbeddingState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingState::Pending => "pending",
            EmbeddingState::Ready => "ready",
            EmbeddingState::Stale => "stale",
            EmbeddingState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }
}

/// Structural quality signals computed from bullet text when it is written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityFlags {
    pub has_strong_verb: bool,
    pub has_metric: bool,
    pub ideal_length: bool,
    pub has_weak_language: bool,
}

/// A single resume achievement statement.
///
/// Invariant: `embedding_state == Ready` implies an `Embedding` row exists for `id`
/// and `retry_count == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bullet {
    pub id: Uuid,
    pub role_id: Uuid,
    pub project_id: Uuid,
    pub text: String,
    pub fingerprint: String,
    pub flags: QualityFlags,
    pub embedding_state: EmbeddingState,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}
