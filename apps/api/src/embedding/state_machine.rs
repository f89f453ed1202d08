//! Per-bullet embedding lifecycle plus the durable priority queue of embedding work.
//!
//! ```text
//!   create ──► pending ──success──► ready ──edit──► stale ──requeue──► (queued)
//!                │  ▲                                 │
//!          fail  │  │ backoff 1s·2^(k-1)              │ success
//!                ▼  │                                 ▼
//!          retry ≤ 3? ──no──► failed (terminal until requeue_failed)
//! ```
//!
//! Every transition is a single [`WriteBatch`], so the bullet row and its queue item
//! never disagree after a crash. Transitions patch only the lifecycle columns and
//! are guarded on the text and `last_modified` they were computed from, so an edit
//! that lands mid-transition wins and keeps its queue item.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::embedding::{EmbedQueueItem, Embedding};
use crate::models::library::{Bullet, EmbeddingState};
use crate::store::{Store, StoreError, WriteBatch, WriteOp};

pub const MAX_RETRIES: u32 = 3;
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_MULTIPLIER: u32 = 2;

/// Newly created bullets.
pub const PRIORITY_NEW: i32 = 10;
/// Edited or explicitly requeued bullets.
pub const PRIORITY_EDIT: i32 = 20;
/// Stale bullets picked up by the periodic maintenance pass.
pub const PRIORITY_MAINTENANCE: i32 = 100;

/// Delay before the next attempt after the `failures`-th consecutive failure.
pub fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BACKOFF_BASE * BACKOFF_MULTIPLIER.pow(exponent)
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Queue item pushed into the future; the bullet keeps its state.
    Rescheduled {
        retry_count: u32,
        not_before: DateTime<Utc>,
    },
    /// Retry budget exhausted; the bullet is now `failed` and dequeued.
    Failed,
    /// The bullet was edited while the failure was being recorded; nothing changed.
    Superseded,
}

fn set_state(bullet_id: Uuid, state: EmbeddingState, retry_count: u32) -> WriteOp {
    WriteOp::SetEmbeddingState {
        bullet_id,
        state,
        retry_count,
    }
}

pub struct EmbeddingStateMachine {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl EmbeddingStateMachine {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The conditional write behind [`enqueue`](Self::enqueue), for callers that
    /// need the enqueue to land in the same batch as their own writes.
    pub fn enqueue_op(&self, bullet_id: Uuid, priority: i32) -> WriteOp {
        WriteOp::InsertQueueItemIfAbsent(EmbedQueueItem::new(bullet_id, priority, self.now()))
    }

    /// Idempotent. Returns `true` when a new queue item was created.
    pub async fn enqueue(&self, bullet_id: Uuid, priority: i32) -> Result<bool, StoreError> {
        let report = self
            .store
            .commit(WriteBatch::new().with(self.enqueue_op(bullet_id, priority)))
            .await?;
        let inserted = report.queue_items_inserted > 0;
        debug!(%bullet_id, priority, inserted, "enqueue");
        Ok(inserted)
    }

    /// Commits a guarded batch. A failed guard means the bullet was edited or
    /// deleted concurrently; that is reported as `Ok(false)` with nothing written.
    async fn commit_unless_changed(&self, batch: WriteBatch) -> Result<bool, StoreError> {
        match self.store.commit(batch).await {
            Ok(_) => Ok(true),
            Err(StoreError::Conflict { id, .. }) => {
                debug!(bullet_id = %id, "bullet changed concurrently; transition skipped");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Sets `ready`, resets the retry count and drops the queue entry.
    /// Refuses when no embedding row exists for the bullet. Returns `false` when
    /// the bullet was edited before the write landed.
    pub async fn mark_ready(&self, bullet_id: Uuid) -> Result<bool, StoreError> {
        let bullet = self.require_bullet(bullet_id).await?;
        if self.store.get_embedding(bullet_id).await?.is_none() {
            return Err(StoreError::NotFound {
                collection: "embedding",
                id: bullet_id,
            });
        }

        self.commit_unless_changed(
            WriteBatch::new()
                .expect_unchanged(&bullet)
                .with(WriteOp::DeleteQueueItemsForBullet(bullet_id))
                .with(set_state(bullet_id, EmbeddingState::Ready, 0)),
        )
        .await
    }

    /// Persists `embedding` (replacing any previous row) and marks its bullet ready
    /// in one batch, provided the bullet still matches `source`, the version whose
    /// text was embedded. Returns `false`, writing nothing, when it no longer does;
    /// the edit's queue item is then left for the next pass.
    pub async fn complete(
        &self,
        embedding: Embedding,
        source: &Bullet,
    ) -> Result<bool, StoreError> {
        let bullet_id = embedding.bullet_id;
        self.commit_unless_changed(
            WriteBatch::new()
                .expect_unchanged(source)
                .with(WriteOp::PutEmbedding(embedding))
                .with(WriteOp::DeleteQueueItemsForBullet(bullet_id))
                .with(set_state(bullet_id, EmbeddingState::Ready, 0)),
        )
        .await
    }

    /// Sets `stale` without touching the queue.
    pub async fn mark_stale(&self, bullet_id: Uuid) -> Result<bool, StoreError> {
        let bullet = self.require_bullet(bullet_id).await?;
        self.commit_unless_changed(
            WriteBatch::new()
                .expect_unchanged(&bullet)
                .with(set_state(bullet_id, EmbeddingState::Stale, bullet.retry_count)),
        )
        .await
    }

    /// Records one failed attempt and either reschedules with backoff or gives up.
    pub async fn mark_failed(&self, bullet_id: Uuid) -> Result<FailureOutcome, StoreError> {
        let Some(bullet) = self.store.get_bullet(bullet_id).await? else {
            // deleted while in flight
            self.store
                .commit(WriteBatch::new().with(WriteOp::DeleteQueueItemsForBullet(bullet_id)))
                .await?;
            return Ok(FailureOutcome::Failed);
        };

        let retry_count = bullet.retry_count + 1;

        if retry_count > MAX_RETRIES {
            let applied = self
                .commit_unless_changed(
                    WriteBatch::new()
                        .expect_unchanged(&bullet)
                        .with(WriteOp::DeleteQueueItemsForBullet(bullet_id))
                        .with(set_state(bullet_id, EmbeddingState::Failed, retry_count)),
                )
                .await?;
            if !applied {
                return Ok(FailureOutcome::Superseded);
            }
            warn!(%bullet_id, retry_count, "embedding failed permanently");
            return Ok(FailureOutcome::Failed);
        }

        let delay = backoff_delay(retry_count);
        let not_before = self.now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        let mut batch = WriteBatch::new().expect_unchanged(&bullet);
        match self.store.queue_items_for_bullet(bullet_id).await?.into_iter().next() {
            Some(mut item) => {
                item.created_at = not_before;
                item.retry_count = retry_count;
                batch.push(WriteOp::PutQueueItem(item));
            }
            None => {
                let priority = match bullet.embedding_state {
                    EmbeddingState::Stale => PRIORITY_EDIT,
                    _ => PRIORITY_NEW,
                };
                let mut item = EmbedQueueItem::new(bullet_id, priority, not_before);
                item.retry_count = retry_count;
                batch.push(WriteOp::InsertQueueItemIfAbsent(item));
            }
        }
        batch.push(set_state(bullet_id, bullet.embedding_state, retry_count));
        if !self.commit_unless_changed(batch).await? {
            return Ok(FailureOutcome::Superseded);
        }

        debug!(%bullet_id, retry_count, delay_ms = delay.as_millis() as u64, "embedding rescheduled");
        Ok(FailureOutcome::Rescheduled {
            retry_count,
            not_before,
        })
    }

    /// Most urgent currently-eligible item. Never mutates.
    pub async fn dequeue_next(&self) -> Result<Option<EmbedQueueItem>, StoreError> {
        Ok(self.eligible_items(1, &HashSet::new()).await?.into_iter().next())
    }

    /// Up to `limit` eligible items in drain order, at most one per bullet,
    /// skipping bullets in `exclude` (already in flight).
    pub async fn eligible_items(
        &self,
        limit: usize,
        exclude: &HashSet<Uuid>,
    ) -> Result<Vec<EmbedQueueItem>, StoreError> {
        let now = self.now();
        let mut seen = HashSet::new();
        Ok(self
            .store
            .list_queue_items()
            .await?
            .into_iter()
            .filter(|item| item.is_eligible(now))
            .filter(|item| !exclude.contains(&item.bullet_id))
            .filter(|item| seen.insert(item.bullet_id))
            .take(limit)
            .collect())
    }

    /// Total and eligible queue depth.
    pub async fn queue_depth(&self) -> Result<(usize, usize), StoreError> {
        let now = self.now();
        let items = self.store.list_queue_items().await?;
        let eligible = items.iter().filter(|i| i.is_eligible(now)).count();
        Ok((items.len(), eligible))
    }

    /// Removes duplicate queue entries, keeping the first in drain order per bullet.
    pub async fn coalesce(&self) -> Result<usize, StoreError> {
        let mut seen = HashSet::new();
        let mut batch = WriteBatch::new();
        for item in self.store.list_queue_items().await? {
            if !seen.insert(item.bullet_id) {
                batch.push(WriteOp::DeleteQueueItem(item.id));
            }
        }

        let removed = batch.ops().len();
        if removed > 0 {
            self.store.commit(batch).await?;
            info!(removed, "coalesced duplicate queue items");
        }
        Ok(removed)
    }

    /// Enqueues every `stale` bullet at `priority`. Returns how many were newly queued.
    pub async fn requeue_stale(&self, priority: i32) -> Result<usize, StoreError> {
        let mut queued = 0;
        for bullet in self.store.list_bullets_by_state(EmbeddingState::Stale).await? {
            if self.enqueue(bullet.id, priority).await? {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(queued, "requeued stale bullets");
        }
        Ok(queued)
    }

    /// Operator action: gives a `failed` bullet a fresh retry budget.
    /// Returns `false` when the bullet is not in the `failed` state.
    pub async fn requeue_failed(&self, bullet_id: Uuid) -> Result<bool, StoreError> {
        let bullet = self.require_bullet(bullet_id).await?;
        if bullet.embedding_state != EmbeddingState::Failed {
            return Ok(false);
        }

        self.store
            .commit(
                WriteBatch::new()
                    .expect_unchanged(&bullet)
                    .with(set_state(bullet_id, EmbeddingState::Pending, 0))
                    .with(self.enqueue_op(bullet_id, PRIORITY_EDIT)),
            )
            .await?;
        info!(%bullet_id, "failed bullet requeued");
        Ok(true)
    }

    async fn require_bullet(&self, bullet_id: Uuid) -> Result<Bullet, StoreError> {
        self.store
            .get_bullet(bullet_id)
            .await?
            .ok_or(StoreError::NotFound {
                collection: "bullet",
                id: bullet_id,
            })
    }
}
