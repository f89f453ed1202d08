//! Postgres-backed [`Store`].
//!
//! Each [`WriteBatch`] runs inside a single transaction; dropping the transaction on
//! any error rolls the whole batch back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::embedding::{EmbedQueueItem, Embedding};
use crate::models::library::{Bullet, EmbeddingState, Project, QualityFlags, Role};

use super::{BulletVersion, CommitReport, Store, StoreError, WriteBatch, WriteOp};

// ────────────────────────────────────────────────────────────────────────────
// Row types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct RoleRow {
    id: Uuid,
    title: String,
    company: Option<String>,
    bullets_limit: i32,
    created_at: DateTime<Utc>,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Role {
            id: row.id,
            title: row.title,
            company: row.company,
            bullets_limit: row.bullets_limit.max(0) as usize,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct ProjectRow {
    id: Uuid,
    role_id: Uuid,
    name: String,
    centroid: Option<Vec<f32>>,
    dims: i32,
    embedding_version: i64,
    bullet_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProjectRow> for Project {
    fn from(row: ProjectRow) -> Self {
        Project {
            id: row.id,
            role_id: row.role_id,
            name: row.name,
            centroid: row.centroid,
            dims: row.dims.max(0) as usize,
            embedding_version: row.embedding_version,
            bullet_count: row.bullet_count.max(0) as usize,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct BulletRow {
    id: Uuid,
    role_id: Uuid,
    project_id: Uuid,
    text: String,
    fingerprint: String,
    flags: Json<QualityFlags>,
    embedding_state: String,
    retry_count: i32,
    created_at: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

impl TryFrom<BulletRow> for Bullet {
    type Error = StoreError;

    fn try_from(row: BulletRow) -> Result<Self, Self::Error> {
        let embedding_state =
            EmbeddingState::parse(&row.embedding_state).ok_or_else(|| StoreError::Corrupt {
                collection: "bullets",
                message: format!(
                    "bullet {} has unknown embedding_state '{}'",
                    row.id, row.embedding_state
                ),
            })?;
        Ok(Bullet {
            id: row.id,
            role_id: row.role_id,
            project_id: row.project_id,
            text: row.text,
            fingerprint: row.fingerprint,
            flags: row.flags.0,
            embedding_state,
            retry_count: row.retry_count.max(0) as u32,
            created_at: row.created_at,
            last_modified: row.last_modified,
        })
    }
}

#[derive(Debug, FromRow)]
struct EmbeddingRow {
    bullet_id: Uuid,
    vector: Vec<f32>,
    provider: String,
    model: String,
    schema_version: i32,
    created_at: DateTime<Utc>,
}

impl From<EmbeddingRow> for Embedding {
    fn from(row: EmbeddingRow) -> Self {
        Embedding {
            bullet_id: row.bullet_id,
            vector: row.vector,
            provider: row.provider,
            model: row.model,
            schema_version: row.schema_version,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct QueueRow {
    id: Uuid,
    bullet_id: Uuid,
    priority: i32,
    created_at: DateTime<Utc>,
    retry_count: i32,
}

impl From<QueueRow> for EmbedQueueItem {
    fn from(row: QueueRow) -> Self {
        EmbedQueueItem {
            id: row.id,
            bullet_id: row.bullet_id,
            priority: row.priority,
            created_at: row.created_at,
            retry_count: row.retry_count.max(0) as u32,
        }
    }
}

fn bullets_from_rows(rows: Vec<BulletRow>) -> Result<Vec<Bullet>, StoreError> {
    rows.into_iter().map(Bullet::try_from).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Store
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Row-locks the bullet for the rest of the transaction and checks it still
/// matches the version the batch was computed from.
async fn check_version(
    tx: &mut Transaction<'_, Postgres>,
    expected: &BulletVersion,
) -> Result<(), StoreError> {
    let row: Option<(String, DateTime<Utc>)> =
        sqlx::query_as("SELECT text, last_modified FROM bullets WHERE id = $1 FOR UPDATE")
            .bind(expected.bullet_id)
            .fetch_optional(&mut **tx)
            .await?;
    match row {
        Some((text, last_modified)) if expected.matches(&text, last_modified) => Ok(()),
        _ => Err(expected.conflict()),
    }
}

async fn apply_op(
    tx: &mut Transaction<'_, Postgres>,
    op: WriteOp,
    report: &mut CommitReport,
) -> Result<(), StoreError> {
    match op {
        WriteOp::PutRole(role) => {
            sqlx::query(
                r#"
                INSERT INTO roles (id, title, company, bullets_limit, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE
                SET title = EXCLUDED.title,
                    company = EXCLUDED.company,
                    bullets_limit = EXCLUDED.bullets_limit
                "#,
            )
            .bind(role.id)
            .bind(&role.title)
            .bind(&role.company)
            .bind(role.bullets_limit as i32)
            .bind(role.created_at)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::PutProject(project) => {
            sqlx::query(
                r#"
                INSERT INTO projects
                    (id, role_id, name, centroid, dims, embedding_version, bullet_count,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO UPDATE
                SET name = EXCLUDED.name,
                    centroid = EXCLUDED.centroid,
                    dims = EXCLUDED.dims,
                    embedding_version = EXCLUDED.embedding_version,
                    bullet_count = EXCLUDED.bullet_count,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(project.id)
            .bind(project.role_id)
            .bind(&project.name)
            .bind(&project.centroid)
            .bind(project.dims as i32)
            .bind(project.embedding_version)
            .bind(project.bullet_count as i32)
            .bind(project.created_at)
            .bind(project.updated_at)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::PutBullet(bullet) => {
            sqlx::query(
                r#"
                INSERT INTO bullets
                    (id, role_id, project_id, text, fingerprint, flags, embedding_state,
                     retry_count, created_at, last_modified)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id) DO UPDATE
                SET role_id = EXCLUDED.role_id,
                    project_id = EXCLUDED.project_id,
                    text = EXCLUDED.text,
                    fingerprint = EXCLUDED.fingerprint,
                    flags = EXCLUDED.flags,
                    embedding_state = EXCLUDED.embedding_state,
                    retry_count = EXCLUDED.retry_count,
                    last_modified = EXCLUDED.last_modified
                "#,
            )
            .bind(bullet.id)
            .bind(bullet.role_id)
            .bind(bullet.project_id)
            .bind(&bullet.text)
            .bind(&bullet.fingerprint)
            .bind(Json(&bullet.flags))
            .bind(bullet.embedding_state.as_str())
            .bind(bullet.retry_count as i32)
            .bind(bullet.created_at)
            .bind(bullet.last_modified)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::SetEmbeddingState {
            bullet_id,
            state,
            retry_count,
        } => {
            sqlx::query("UPDATE bullets SET embedding_state = $2, retry_count = $3 WHERE id = $1")
                .bind(bullet_id)
                .bind(state.as_str())
                .bind(retry_count as i32)
                .execute(&mut **tx)
                .await?;
        }
        WriteOp::DeleteBullet(id) => {
            // embeddings and embed_queue cascade
            sqlx::query("DELETE FROM bullets WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
        }
        WriteOp::PutEmbedding(embedding) => {
            sqlx::query(
                r#"
                INSERT INTO embeddings
                    (bullet_id, vector, provider, model, schema_version, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (bullet_id) DO UPDATE
                SET vector = EXCLUDED.vector,
                    provider = EXCLUDED.provider,
                    model = EXCLUDED.model,
                    schema_version = EXCLUDED.schema_version,
                    created_at = EXCLUDED.created_at
                "#,
            )
            .bind(embedding.bullet_id)
            .bind(&embedding.vector)
            .bind(&embedding.provider)
            .bind(&embedding.model)
            .bind(embedding.schema_version)
            .bind(embedding.created_at)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::PutQueueItem(item) => {
            sqlx::query(
                r#"
                INSERT INTO embed_queue (id, bullet_id, priority, created_at, retry_count)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE
                SET priority = EXCLUDED.priority,
                    created_at = EXCLUDED.created_at,
                    retry_count = EXCLUDED.retry_count
                "#,
            )
            .bind(item.id)
            .bind(item.bullet_id)
            .bind(item.priority)
            .bind(item.created_at)
            .bind(item.retry_count as i32)
            .execute(&mut **tx)
            .await?;
        }
        WriteOp::InsertQueueItemIfAbsent(item) => {
            let result = sqlx::query(
                r#"
                INSERT INTO embed_queue (id, bullet_id, priority, created_at, retry_count)
                SELECT $1, $2, $3, $4, $5
                WHERE NOT EXISTS (SELECT 1 FROM embed_queue WHERE bullet_id = $2)
                "#,
            )
            .bind(item.id)
            .bind(item.bullet_id)
            .bind(item.priority)
            .bind(item.created_at)
            .bind(item.retry_count as i32)
            .execute(&mut **tx)
            .await?;
            report.queue_items_inserted += result.rows_affected() as usize;
        }
        WriteOp::DeleteQueueItem(id) => {
            sqlx::query("DELETE FROM embed_queue WHERE id = $1")
                .bind(id)
                .execute(&mut **tx)
                .await?;
        }
        WriteOp::DeleteQueueItemsForBullet(bullet_id) => {
            sqlx::query("DELETE FROM embed_queue WHERE bullet_id = $1")
                .bind(bullet_id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn get_role(&self, id: Uuid) -> Result<Option<Role>, StoreError> {
        let row = sqlx::query_as::<_, RoleRow>("SELECT * FROM roles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Role::from))
    }

    async fn list_roles(&self) -> Result<Vec<Role>, StoreError> {
        let rows = sqlx::query_as::<_, RoleRow>("SELECT * FROM roles ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Role::from).collect())
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Project::from))
    }

    async fn list_projects_by_role(&self, role_id: Uuid) -> Result<Vec<Project>, StoreError> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            "SELECT * FROM projects WHERE role_id = $1 ORDER BY created_at, id",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Project::from).collect())
    }

    async fn get_bullet(&self, id: Uuid) -> Result<Option<Bullet>, StoreError> {
        let row = sqlx::query_as::<_, BulletRow>("SELECT * FROM bullets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Bullet::try_from).transpose()
    }

    async fn list_bullets(&self) -> Result<Vec<Bullet>, StoreError> {
        let rows = sqlx::query_as::<_, BulletRow>("SELECT * FROM bullets ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        bullets_from_rows(rows)
    }

    async fn list_bullets_by_project(&self, project_id: Uuid) -> Result<Vec<Bullet>, StoreError> {
        let rows = sqlx::query_as::<_, BulletRow>(
            "SELECT * FROM bullets WHERE project_id = $1 ORDER BY created_at, id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        bullets_from_rows(rows)
    }

    async fn list_bullets_by_state(
        &self,
        state: EmbeddingState,
    ) -> Result<Vec<Bullet>, StoreError> {
        let rows = sqlx::query_as::<_, BulletRow>(
            "SELECT * FROM bullets WHERE embedding_state = $1 ORDER BY created_at, id",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        bullets_from_rows(rows)
    }

    async fn get_embedding(&self, bullet_id: Uuid) -> Result<Option<Embedding>, StoreError> {
        let row =
            sqlx::query_as::<_, EmbeddingRow>("SELECT * FROM embeddings WHERE bullet_id = $1")
                .bind(bullet_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Embedding::from))
    }

    async fn list_embeddings(&self, bullet_ids: &[Uuid]) -> Result<Vec<Embedding>, StoreError> {
        if bullet_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, EmbeddingRow>(
            "SELECT * FROM embeddings WHERE bullet_id = ANY($1)",
        )
        .bind(bullet_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Embedding::from).collect())
    }

    async fn list_queue_items(&self) -> Result<Vec<EmbedQueueItem>, StoreError> {
        let rows = sqlx::query_as::<_, QueueRow>(
            "SELECT * FROM embed_queue ORDER BY priority, created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EmbedQueueItem::from).collect())
    }

    async fn queue_items_for_bullet(
        &self,
        bullet_id: Uuid,
    ) -> Result<Vec<EmbedQueueItem>, StoreError> {
        let rows = sqlx::query_as::<_, QueueRow>(
            "SELECT * FROM embed_queue WHERE bullet_id = $1 ORDER BY priority, created_at, id",
        )
        .bind(bullet_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EmbedQueueItem::from).collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReport, StoreError> {
        let mut report = CommitReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        let mut tx = self.pool.begin().await?;

        let has_conditional_insert = batch
            .ops()
            .iter()
            .any(|op| matches!(op, WriteOp::InsertQueueItemIfAbsent(_)));
        if has_conditional_insert {
            // Serialises concurrent coalesced enqueues for the same bullet.
            sqlx::query("LOCK TABLE embed_queue IN SHARE ROW EXCLUSIVE MODE")
                .execute(&mut *tx)
                .await?;
        }

        for expected in batch.expected() {
            check_version(&mut tx, expected).await?;
        }

        for op in batch.ops {
            apply_op(&mut tx, op, &mut report).await?;
        }

        tx.commit().await?;
        Ok(report)
    }
}
