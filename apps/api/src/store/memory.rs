//! In-memory [`Store`] for tests and zero-configuration runs.
//!
//! All collections sit behind one `tokio::sync::RwLock`, so a batch applied under the
//! write guard is atomic with respect to every reader.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::embedding::{EmbedQueueItem, Embedding};
use crate::models::library::{Bullet, EmbeddingState, Project, Role};

use super::{BulletVersion, CommitReport, Store, StoreError, WriteBatch, WriteOp};

#[derive(Default)]
struct Collections {
    roles: HashMap<Uuid, Role>,
    projects: HashMap<Uuid, Project>,
    bullets: HashMap<Uuid, Bullet>,
    embeddings: HashMap<Uuid, Embedding>,
    queue: HashMap<Uuid, EmbedQueueItem>,
}

impl Collections {
    fn check(&self, expected: &BulletVersion) -> Result<(), StoreError> {
        match self.bullets.get(&expected.bullet_id) {
            Some(b) if expected.matches(&b.text, b.last_modified) => Ok(()),
            _ => Err(expected.conflict()),
        }
    }

    fn apply(&mut self, op: WriteOp, report: &mut CommitReport) {
        match op {
            WriteOp::PutRole(role) => {
                self.roles.insert(role.id, role);
            }
            WriteOp::PutProject(project) => {
                self.projects.insert(project.id, project);
            }
            WriteOp::PutBullet(bullet) => {
                self.bullets.insert(bullet.id, bullet);
            }
            WriteOp::SetEmbeddingState {
                bullet_id,
                state,
                retry_count,
            } => {
                if let Some(bullet) = self.bullets.get_mut(&bullet_id) {
                    bullet.embedding_state = state;
                    bullet.retry_count = retry_count;
                }
            }
            WriteOp::DeleteBullet(id) => {
                self.bullets.remove(&id);
                self.embeddings.remove(&id);
                self.queue.retain(|_, item| item.bullet_id != id);
            }
            WriteOp::PutEmbedding(embedding) => {
                self.embeddings.insert(embedding.bullet_id, embedding);
            }
            WriteOp::PutQueueItem(item) => {
                self.queue.insert(item.id, item);
            }
            WriteOp::InsertQueueItemIfAbsent(item) => {
                let live = self.queue.values().any(|q| q.bullet_id == item.bullet_id);
                if !live {
                    self.queue.insert(item.id, item);
                    report.queue_items_inserted += 1;
                }
            }
            WriteOp::DeleteQueueItem(id) => {
                self.queue.remove(&id);
            }
            WriteOp::DeleteQueueItemsForBullet(bullet_id) => {
                self.queue.retain(|_, item| item.bullet_id != bullet_id);
            }
        }
    }
}

pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Collections::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_roles(mut roles: Vec<Role>) -> Vec<Role> {
    roles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    roles
}

fn sorted_projects(mut projects: Vec<Project>) -> Vec<Project> {
    projects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    projects
}

fn sorted_bullets(mut bullets: Vec<Bullet>) -> Vec<Bullet> {
    bullets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    bullets
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_role(&self, id: Uuid) -> Result<Option<Role>, StoreError> {
        Ok(self.inner.read().await.roles.get(&id).cloned())
    }

    async fn list_roles(&self) -> Result<Vec<Role>, StoreError> {
        let guard = self.inner.read().await;
        Ok(sorted_roles(guard.roles.values().cloned().collect()))
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        Ok(self.inner.read().await.projects.get(&id).cloned())
    }

    async fn list_projects_by_role(&self, role_id: Uuid) -> Result<Vec<Project>, StoreError> {
        let guard = self.inner.read().await;
        Ok(sorted_projects(
            guard
                .projects
                .values()
                .filter(|p| p.role_id == role_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_bullet(&self, id: Uuid) -> Result<Option<Bullet>, StoreError> {
        Ok(self.inner.read().await.bullets.get(&id).cloned())
    }

    async fn list_bullets(&self) -> Result<Vec<Bullet>, StoreError> {
        let guard = self.inner.read().await;
        Ok(sorted_bullets(guard.bullets.values().cloned().collect()))
    }

    async fn list_bullets_by_project(&self, project_id: Uuid) -> Result<Vec<Bullet>, StoreError> {
        let guard = self.inner.read().await;
        Ok(sorted_bullets(
            guard
                .bullets
                .values()
                .filter(|b| b.project_id == project_id)
                .cloned()
                .collect(),
        ))
    }

    async fn list_bullets_by_state(
        &self,
        state: EmbeddingState,
    ) -> Result<Vec<Bullet>, StoreError> {
        let guard = self.inner.read().await;
        Ok(sorted_bullets(
            guard
                .bullets
                .values()
                .filter(|b| b.embedding_state == state)
                .cloned()
                .collect(),
        ))
    }

    async fn get_embedding(&self, bullet_id: Uuid) -> Result<Option<Embedding>, StoreError> {
        Ok(self.inner.read().await.embeddings.get(&bullet_id).cloned())
    }

    async fn list_embeddings(&self, bullet_ids: &[Uuid]) -> Result<Vec<Embedding>, StoreError> {
        let guard = self.inner.read().await;
        Ok(bullet_ids
            .iter()
            .filter_map(|id| guard.embeddings.get(id).cloned())
            .collect())
    }

    async fn list_queue_items(&self) -> Result<Vec<EmbedQueueItem>, StoreError> {
        let guard = self.inner.read().await;
        let mut items: Vec<_> = guard.queue.values().cloned().collect();
        items.sort_by_key(|item| item.drain_key());
        Ok(items)
    }

    async fn queue_items_for_bullet(
        &self,
        bullet_id: Uuid,
    ) -> Result<Vec<EmbedQueueItem>, StoreError> {
        let guard = self.inner.read().await;
        let mut items: Vec<_> = guard
            .queue
            .values()
            .filter(|item| item.bullet_id == bullet_id)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.drain_key());
        Ok(items)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReport, StoreError> {
        let mut guard = self.inner.write().await;
        for expected in &batch.expected {
            guard.check(expected)?;
        }
        let mut report = CommitReport::default();
        for op in batch.ops {
            guard.apply(op, &mut report);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_insert_if_absent_coalesces_within_one_batch() {
        let store = MemoryStore::new();
        let bullet_id = Uuid::new_v4();
        let now = Utc::now();
        let batch = WriteBatch::new()
            .with(WriteOp::InsertQueueItemIfAbsent(EmbedQueueItem::new(
                bullet_id, 10, now,
            )))
            .with(WriteOp::InsertQueueItemIfAbsent(EmbedQueueItem::new(
                bullet_id, 5, now,
            )));

        let report = store.commit(batch).await.unwrap();
        assert_eq!(report.queue_items_inserted, 1);
        let items = store.queue_items_for_bullet(bullet_id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].priority, 10);
    }

    #[tokio::test]
    async fn test_stale_precondition_rejects_the_whole_batch() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let bullet = crate::embedding::state_machine::tests::bullet("Shipped v1", now);
        let item = EmbedQueueItem::new(bullet.id, 10, now);
        store
            .commit(
                WriteBatch::new()
                    .with(WriteOp::PutBullet(bullet.clone()))
                    .with(WriteOp::PutQueueItem(item.clone())),
            )
            .await
            .unwrap();

        let mut edited = bullet.clone();
        edited.text = "Shipped v2".to_string();
        edited.last_modified = now + Duration::seconds(1);
        store
            .commit(WriteBatch::new().with(WriteOp::PutBullet(edited)))
            .await
            .unwrap();

        let err = store
            .commit(
                WriteBatch::new()
                    .expect_unchanged(&bullet)
                    .with(WriteOp::DeleteQueueItemsForBullet(bullet.id))
                    .with(WriteOp::SetEmbeddingState {
                        bullet_id: bullet.id,
                        state: EmbeddingState::Ready,
                        retry_count: 0,
                    }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { id, .. } if id == bullet.id));

        let stored = store.get_bullet(bullet.id).await.unwrap().unwrap();
        assert_eq!(stored.text, "Shipped v2");
        assert_eq!(stored.embedding_state, EmbeddingState::Pending);
        assert_eq!(store.queue_items_for_bullet(bullet.id).await.unwrap(), vec![item]);
    }

    #[tokio::test]
    async fn test_queue_items_listed_in_drain_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let late = EmbedQueueItem::new(Uuid::new_v4(), 1, now + Duration::seconds(5));
        let urgent = EmbedQueueItem::new(Uuid::new_v4(), 1, now);
        let lazy = EmbedQueueItem::new(Uuid::new_v4(), 100, now - Duration::seconds(60));
        store
            .commit(
                WriteBatch::new()
                    .with(WriteOp::PutQueueItem(lazy.clone()))
                    .with(WriteOp::PutQueueItem(late.clone()))
                    .with(WriteOp::PutQueueItem(urgent.clone())),
            )
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list_queue_items()
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec![urgent.id, late.id, lazy.id]);
    }

    #[tokio::test]
    async fn test_delete_bullet_cascades_to_queue_and_embedding() {
        let store = MemoryStore::new();
        let bullet_id = Uuid::new_v4();
        let now = Utc::now();
        store
            .commit(
                WriteBatch::new()
                    .with(WriteOp::PutEmbedding(Embedding {
                        bullet_id,
                        vector: vec![1.0, 0.0],
                        provider: "test".to_string(),
                        model: "test".to_string(),
                        schema_version: 1,
                        created_at: now,
                    }))
                    .with(WriteOp::PutQueueItem(EmbedQueueItem::new(bullet_id, 10, now))),
            )
            .await
            .unwrap();

        store
            .commit(WriteBatch::new().with(WriteOp::DeleteBullet(bullet_id)))
            .await
            .unwrap();

        assert!(store.get_embedding(bullet_id).await.unwrap().is_none());
        assert!(store.list_queue_items().await.unwrap().is_empty());
    }
}
