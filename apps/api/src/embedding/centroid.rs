use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::library::{EmbeddingState, Project};
use crate::similarity::vector::centroid;
use crate::store::{Store, StoreError, WriteBatch, WriteOp};

/// Keeps each project's centroid in step with its members' embeddings.
///
/// Recomputations are serialised so two completions in the same project cannot
/// interleave their read-modify-write of the project row.
pub struct CentroidMaintainer {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl CentroidMaintainer {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            lock: Mutex::new(()),
        }
    }

    /// Recomputes the raw (not renormalised) mean of the embeddings of `ready` members
    /// and bumps `embedding_version`. Stale vectors describe old text and are left
    /// out. Returns `None` if the project no longer exists.
    pub async fn recompute(&self, project_id: Uuid) -> Result<Option<Project>, StoreError> {
        let _guard = self.lock.lock().await;

        let Some(mut project) = self.store.get_project(project_id).await? else {
            return Ok(None);
        };

        let member_ids: Vec<Uuid> = self
            .store
            .list_bullets_by_project(project_id)
            .await?
            .into_iter()
            .filter(|b| b.embedding_state == EmbeddingState::Ready)
            .map(|b| b.id)
            .collect();
        let mut embeddings = self.store.list_embeddings(&member_ids).await?;
        embeddings.sort_by_key(|e| e.bullet_id);

        let vectors: Vec<&[f32]> = embeddings.iter().map(|e| e.vector.as_slice()).collect();
        let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
        let contributing = vectors.iter().filter(|v| v.len() == dims).count();
        if contributing < vectors.len() {
            warn!(
                %project_id,
                skipped = vectors.len() - contributing,
                "skipping member embeddings with mismatched dimensions"
            );
        }

        project.centroid = centroid(&vectors);
        project.dims = project.centroid.as_ref().map(Vec::len).unwrap_or(0);
        project.bullet_count = if project.centroid.is_some() { contributing } else { 0 };
        project.embedding_version += 1;
        project.updated_at = self.clock.now();

        self.store
            .commit(WriteBatch::new().with(WriteOp::PutProject(project.clone())))
            .await?;
        debug!(
            %project_id,
            version = project.embedding_version,
            members = project.bullet_count,
            "project centroid recomputed"
        );
        Ok(Some(project))
    }
}
