//! Persistence boundary.
//!
//! Reads are keyed or index lookups. Every write goes through [`Store::commit`], which
//! applies a [`WriteBatch`] atomically: either every op lands or none does. Coalesced
//! enqueue is expressed as the conditional [`WriteOp::InsertQueueItemIfAbsent`] so the
//! check-then-insert happens inside the same transaction as the rest of the batch.
//! A batch may also carry [`BulletVersion`] preconditions; if any bullet no longer
//! matches, the commit fails with [`StoreError::Conflict`] and nothing is written.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::embedding::{EmbedQueueItem, Embedding};
use crate::models::library::{Bullet, EmbeddingState, Project, Role};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{collection} {id} not found")]
    NotFound { collection: &'static str, id: Uuid },

    #[error("{collection} {id} was changed concurrently")]
    Conflict { collection: &'static str, id: Uuid },

    #[error("Corrupt row in {collection}: {message}")]
    Corrupt {
        collection: &'static str,
        message: String,
    },
}

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    PutRole(Role),
    PutProject(Project),
    PutBullet(Bullet),
    /// Updates only the embedding lifecycle columns of an existing bullet.
    SetEmbeddingState {
        bullet_id: Uuid,
        state: EmbeddingState,
        retry_count: u32,
    },
    /// Removes the bullet together with its embedding and queue items.
    DeleteBullet(Uuid),
    PutEmbedding(Embedding),
    /// Upsert by queue item id.
    PutQueueItem(EmbedQueueItem),
    /// Inserts only if the bullet has no live queue item.
    InsertQueueItemIfAbsent(EmbedQueueItem),
    DeleteQueueItem(Uuid),
    DeleteQueueItemsForBullet(Uuid),
}

/// The user-editable version of a bullet that a batch was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulletVersion {
    pub bullet_id: Uuid,
    pub text: String,
    pub last_modified: DateTime<Utc>,
}

impl BulletVersion {
    pub fn of(bullet: &Bullet) -> Self {
        Self {
            bullet_id: bullet.id,
            text: bullet.text.clone(),
            last_modified: bullet.last_modified,
        }
    }

    pub fn matches(&self, text: &str, last_modified: DateTime<Utc>) -> bool {
        self.text == text && self.last_modified == last_modified
    }

    fn conflict(&self) -> StoreError {
        StoreError::Conflict {
            collection: "bullet",
            id: self.bullet_id,
        }
    }
}

/// Ordered set of writes applied all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    expected: Vec<BulletVersion>,
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn with(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Fails the commit with [`StoreError::Conflict`] unless the bullet still exists
    /// with the same text and `last_modified`.
    pub fn expect_unchanged(mut self, bullet: &Bullet) -> Self {
        self.expected.push(BulletVersion::of(bullet));
        self
    }

    pub fn expected(&self) -> &[BulletVersion] {
        &self.expected
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }
}

/// What a committed batch actually changed, for ops whose effect is conditional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub queue_items_inserted: usize,
}

/// Abstract storage backend. Implementations must be safe to share across tasks.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_role(&self, id: Uuid) -> Result<Option<Role>, StoreError>;
    /// All roles, oldest first.
    async fn list_roles(&self) -> Result<Vec<Role>, StoreError>;

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError>;
    async fn list_projects_by_role(&self, role_id: Uuid) -> Result<Vec<Project>, StoreError>;

    async fn get_bullet(&self, id: Uuid) -> Result<Option<Bullet>, StoreError>;
    /// All bullets, oldest first.
    async fn list_bullets(&self) -> Result<Vec<Bullet>, StoreError>;
    async fn list_bullets_by_project(&self, project_id: Uuid) -> Result<Vec<Bullet>, StoreError>;
    async fn list_bullets_by_state(&self, state: EmbeddingState)
        -> Result<Vec<Bullet>, StoreError>;

    async fn get_embedding(&self, bullet_id: Uuid) -> Result<Option<Embedding>, StoreError>;
    async fn list_embeddings(&self, bullet_ids: &[Uuid]) -> Result<Vec<Embedding>, StoreError>;

    /// All queue items ordered by `(priority, created_at, id)`.
    async fn list_queue_items(&self) -> Result<Vec<EmbedQueueItem>, StoreError>;
    async fn queue_items_for_bullet(
        &self,
        bullet_id: Uuid,
    ) -> Result<Vec<EmbedQueueItem>, StoreError>;

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReport, StoreError>;
}
