//! Library management: roles, projects and bullets.
//!
//! Every bullet write lands in the same batch as its queue transition, so a bullet
//! is never `pending` or `stale` without a way back onto the embedding queue.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::embedding::centroid::CentroidMaintainer;
use crate::embedding::state_machine::{EmbeddingStateMachine, PRIORITY_EDIT, PRIORITY_NEW};
use crate::errors::AppError;
use crate::library::quality;
use crate::models::library::{
    Bullet, EmbeddingState, Project, Role, DEFAULT_BULLETS_LIMIT,
};
use crate::similarity::text::fingerprint;
use crate::store::{Store, WriteBatch, WriteOp};

pub const MAX_BULLET_CHARS: usize = 500;
pub const MAX_BULLETS_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
pub struct NewRole {
    pub title: String,
    pub company: Option<String>,
    pub bullets_limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct NewProject {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct NewBullet {
    pub project_id: Uuid,
    pub text: String,
}

pub struct LibraryService {
    store: Arc<dyn Store>,
    machine: Arc<EmbeddingStateMachine>,
    centroids: Arc<CentroidMaintainer>,
    clock: Arc<dyn Clock>,
}

impl LibraryService {
    pub fn new(
        store: Arc<dyn Store>,
        machine: Arc<EmbeddingStateMachine>,
        centroids: Arc<CentroidMaintainer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            machine,
            centroids,
            clock,
        }
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>, AppError> {
        Ok(self.store.list_roles().await?)
    }

    pub async fn create_role(&self, req: NewRole) -> Result<Role, AppError> {
        let title = non_empty("title", &req.title)?;
        let bullets_limit = req.bullets_limit.unwrap_or(DEFAULT_BULLETS_LIMIT);
        if !(1..=MAX_BULLETS_LIMIT).contains(&bullets_limit) {
            return Err(AppError::Validation(format!(
                "bullets_limit must be between 1 and {MAX_BULLETS_LIMIT}"
            )));
        }

        let role = Role {
            id: Uuid::new_v4(),
            title,
            company: req
                .company
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            bullets_limit,
            created_at: self.clock.now(),
        };
        self.store
            .commit(WriteBatch::new().with(WriteOp::PutRole(role.clone())))
            .await?;
        info!(role_id = %role.id, "role created");
        Ok(role)
    }

    pub async fn list_projects(&self, role_id: Uuid) -> Result<Vec<Project>, AppError> {
        if self.store.get_role(role_id).await?.is_none() {
            return Err(AppError::NotFound(format!("Role {role_id} not found")));
        }
        Ok(self.store.list_projects_by_role(role_id).await?)
    }

    pub async fn create_project(&self, role_id: Uuid, req: NewProject) -> Result<Project, AppError> {
        let name = non_empty("name", &req.name)?;
        if self.store.get_role(role_id).await?.is_none() {
            return Err(AppError::NotFound(format!("Role {role_id} not found")));
        }

        let project = Project::new(role_id, name, self.clock.now());
        self.store
            .commit(WriteBatch::new().with(WriteOp::PutProject(project.clone())))
            .await?;
        info!(project_id = %project.id, %role_id, "project created");
        Ok(project)
    }

    /// Creates a `pending` bullet and queues it for embedding in the same batch.
    pub async fn create_bullet(&self, req: NewBullet) -> Result<Bullet, AppError> {
        let text = validate_text(&req.text)?;
        let project = self
            .store
            .get_project(req.project_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Project {} not found", req.project_id)))?;

        let now = self.clock.now();
        let bullet = Bullet {
            id: Uuid::new_v4(),
            role_id: project.role_id,
            project_id: project.id,
            fingerprint: fingerprint(&text),
            flags: quality::assess(&text),
            text,
            embedding_state: EmbeddingState::Pending,
            retry_count: 0,
            created_at: now,
            last_modified: now,
        };

        self.store
            .commit(
                WriteBatch::new()
                    .with(WriteOp::PutBullet(bullet.clone()))
                    .with(self.machine.enqueue_op(bullet.id, PRIORITY_NEW)),
            )
            .await?;
        info!(bullet_id = %bullet.id, project_id = %project.id, "bullet created");
        Ok(bullet)
    }

    /// Replaces the text. A `ready` or `failed` bullet becomes `stale`; the enqueue
    /// is coalesced if the bullet is already waiting.
    pub async fn edit_bullet(&self, id: Uuid, text: &str) -> Result<Bullet, AppError> {
        let text = validate_text(text)?;
        let mut bullet = self.require_bullet(id).await?;
        if bullet.text == text {
            return Ok(bullet);
        }

        bullet.fingerprint = fingerprint(&text);
        bullet.flags = quality::assess(&text);
        bullet.text = text;
        bullet.last_modified = self.clock.now();
        if matches!(
            bullet.embedding_state,
            EmbeddingState::Ready | EmbeddingState::Failed
        ) {
            bullet.embedding_state = EmbeddingState::Stale;
            bullet.retry_count = 0;
        }

        self.store
            .commit(
                WriteBatch::new()
                    .with(WriteOp::PutBullet(bullet.clone()))
                    .with(self.machine.enqueue_op(bullet.id, PRIORITY_EDIT)),
            )
            .await?;
        info!(bullet_id = %id, state = bullet.embedding_state.as_str(), "bullet edited");
        Ok(bullet)
    }

    /// Removes the bullet, its embedding and its queue items, then refreshes the
    /// project centroid.
    pub async fn delete_bullet(&self, id: Uuid) -> Result<(), AppError> {
        let bullet = self.require_bullet(id).await?;
        self.store
            .commit(WriteBatch::new().with(WriteOp::DeleteBullet(id)))
            .await?;
        self.centroids.recompute(bullet.project_id).await?;
        info!(bullet_id = %id, "bullet deleted");
        Ok(())
    }

    /// Gives a `failed` bullet a fresh retry budget.
    pub async fn requeue_bullet(&self, id: Uuid) -> Result<Bullet, AppError> {
        let bullet = self.require_bullet(id).await?;
        if !self.machine.requeue_failed(id).await? {
            return Err(AppError::Validation(format!(
                "Bullet {id} is {}, only failed bullets can be requeued",
                bullet.embedding_state.as_str()
            )));
        }
        self.require_bullet(id).await
    }

    async fn require_bullet(&self, id: Uuid) -> Result<Bullet, AppError> {
        self.store
            .get_bullet(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Bullet {id} not found")))
    }
}

fn non_empty(field: &str, value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn validate_text(text: &str) -> Result<String, AppError> {
    let text = non_empty("text", text)?;
    if text.chars().count() > MAX_BULLET_CHARS {
        return Err(AppError::Validation(format!(
            "text must be at most {MAX_BULLET_CHARS} characters"
        )));
    }
    Ok(text)
}
