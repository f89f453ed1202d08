use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::library::service::{NewBullet, NewProject, NewRole};
use crate::models::library::{Bullet, Project, Role};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct EditBullet {
    pub text: String,
}

/// GET /api/v1/roles
pub async fn handle_list_roles(State(state): State<AppState>) -> Result<Json<Vec<Role>>, AppError> {
    Ok(Json(state.library.list_roles().await?))
}

/// POST /api/v1/roles
pub async fn handle_create_role(
    State(state): State<AppState>,
    Json(req): Json<NewRole>,
) -> Result<(StatusCode, Json<Role>), AppError> {
    let role = state.library.create_role(req).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

/// GET /api/v1/roles/:id/projects
pub async fn handle_list_projects(
    State(state): State<AppState>,
    Path(role_id): Path<Uuid>,
) -> Result<Json<Vec<Project>>, AppError> {
    Ok(Json(state.library.list_projects(role_id).await?))
}

/// POST /api/v1/roles/:id/projects
pub async fn handle_create_project(
    State(state): State<AppState>,
    Path(role_id): Path<Uuid>,
    Json(req): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>), AppError> {
    let project = state.library.create_project(role_id, req).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// POST /api/v1/bullets
pub async fn handle_create_bullet(
    State(state): State<AppState>,
    Json(req): Json<NewBullet>,
) -> Result<(StatusCode, Json<Bullet>), AppError> {
    let bullet = state.library.create_bullet(req).await?;
    Ok((StatusCode::CREATED, Json(bullet)))
}

/// PATCH /api/v1/bullets/:id
pub async fn handle_edit_bullet(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<EditBullet>,
) -> Result<Json<Bullet>, AppError> {
    Ok(Json(state.library.edit_bullet(id, &req.text).await?))
}

/// DELETE /api/v1/bullets/:id
pub async fn handle_delete_bullet(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.library.delete_bullet(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/bullets/:id/requeue
pub async fn handle_requeue_bullet(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Bullet>, AppError> {
    Ok(Json(state.library.requeue_bullet(id).await?))
}
