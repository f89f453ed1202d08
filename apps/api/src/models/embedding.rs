use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bumped whenever the embedding input format changes (e.g. text preprocessing).
pub const EMBEDDING_SCHEMA_VERSION: i32 = 1;

/// Vector representation of a bullet. Replaced wholesale on re-embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub bullet_id: Uuid,
    pub vector: Vec<f32>,
    pub provider: String,
    pub model: String,
    pub schema_version: i32,
    pub created_at: DateTime<Utc>,
}

/// A unit of embedding work.
///
/// `created_at` is both the FIFO tie-break and the "not eligible before" timestamp:
/// a failed item is rescheduled by pushing it into the future.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedQueueItem {
    pub id: Uuid,
    pub bullet_id: Uuid,
    /// Lower is more urgent.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl EmbedQueueItem {
    pub fn new(bullet_id: Uuid, priority: i32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bullet_id,
            priority,
            created_at: now,
            retry_count: 0,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.created_at <= now
    }

    /// Drain order: priority ascending, then oldest first.
    pub fn drain_key(&self) -> (i32, DateTime<Utc>, Uuid) {
        (self.priority, self.created_at, self.id)
    }
}
