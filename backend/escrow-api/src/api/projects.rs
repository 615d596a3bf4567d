//! Project and milestone endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode};
use serde::Deserialize;

use super::extract::{Json, Path, Query};
use super::{ApiState, Listing};
use crate::errors::Result;
use crate::milestones::{self, Milestone, MilestoneStatus, MilestoneUpdate, NewMilestone};
use crate::projects::{self, NewProject, Project, ProjectFilter, ProjectUpdate};

#[derive(Debug, Deserialize)]
pub struct MilestoneTransition {
    pub status: MilestoneStatus,
}

/// `POST /projects`
pub async fn create_project(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>)> {
    let project = projects::create(&state.pool, req).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// `GET /projects?user_id=&status=`
pub async fn list_projects(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<ProjectFilter>,
) -> Result<Json<Listing<Project>>> {
    Ok(Json(projects::list(&state.pool, &filter).await?.into()))
}

/// `GET /projects/:id`
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Project>> {
    Ok(Json(projects::get(&state.pool, id).await?))
}

/// `PATCH /projects/:id`
pub async fn update_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(patch): Json<ProjectUpdate>,
) -> Result<Json<Project>> {
    Ok(Json(projects::update(&state.pool, id, patch).await?))
}

/// `DELETE /projects/:id`
pub async fn delete_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    projects::delete(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /projects/:id/milestones`
pub async fn list_milestones(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
) -> Result<Json<Listing<Milestone>>> {
    projects::get(&state.pool, project_id).await?;
    let rows = milestones::list_for_project(&state.pool, project_id).await?;
    Ok(Json(rows.into()))
}

/// `POST /projects/:id/milestones`
pub async fn create_milestone(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
    Json(req): Json<NewMilestone>,
) -> Result<(StatusCode, Json<Milestone>)> {
    let milestone = milestones::create(&state.pool, project_id, req).await?;
    Ok((StatusCode::CREATED, Json(milestone)))
}

/// `GET /milestones/:id`
pub async fn get_milestone(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Milestone>> {
    Ok(Json(milestones::get(&state.pool, id).await?))
}

/// `PATCH /milestones/:id`
pub async fn update_milestone(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(patch): Json<MilestoneUpdate>,
) -> Result<Json<Milestone>> {
    Ok(Json(milestones::update(&state.pool, id, patch).await?))
}

/// `DELETE /milestones/:id`
pub async fn delete_milestone(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    milestones::delete(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /milestones/:id/transition`
pub async fn transition_milestone(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(req): Json<MilestoneTransition>,
) -> Result<Json<Milestone>> {
    Ok(Json(milestones::transition(&state.pool, id, req.status).await?))
}

/// `POST /milestones/:id/pay`
pub async fn pay_milestone(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Milestone>> {
    Ok(Json(milestones::mark_paid(&state.pool, id).await?))
}
