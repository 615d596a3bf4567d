//! User and KYC endpoints.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode};

use super::extract::{Json, Path};
use super::{ApiState, Listing};
use crate::errors::Result;
use crate::kyc::{self, KycSubmission, NewSubmission, Review};
use crate::users::{self, NewUser, User, UserUpdate};

/// `POST /users`
pub async fn create_user(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewUser>,
) -> Result<(StatusCode, Json<User>)> {
    let user = users::create(&state.pool, req).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

/// `GET /users`
pub async fn list_users(State(state): State<Arc<ApiState>>) -> Result<Json<Listing<User>>> {
    Ok(Json(users::list(&state.pool).await?.into()))
}

/// `GET /users/:id`
pub async fn get_user(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<User>> {
    Ok(Json(users::get(&state.pool, id).await?))
}

/// `PATCH /users/:id`
pub async fn update_user(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(patch): Json<UserUpdate>,
) -> Result<Json<User>> {
    Ok(Json(users::update(&state.pool, id, patch).await?))
}

/// `DELETE /users/:id`
pub async fn delete_user(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    users::delete(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /users/:id/kyc`
pub async fn user_kyc(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<Listing<KycSubmission>>> {
    users::get(&state.pool, id).await?;
    Ok(Json(kyc::list_for_user(&state.pool, id).await?.into()))
}

/// `POST /kyc`
pub async fn submit_kyc(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewSubmission>,
) -> Result<(StatusCode, Json<KycSubmission>)> {
    let submission = kyc::submit(&state.pool, req).await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

/// `GET /kyc/:id`
pub async fn get_kyc(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<KycSubmission>> {
    Ok(Json(kyc::get(&state.pool, id).await?))
}

/// `POST /kyc/:id/review`
pub async fn review_kyc(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(review): Json<Review>,
) -> Result<Json<KycSubmission>> {
    Ok(Json(kyc::review(&state.pool, id, review).await?))
}
