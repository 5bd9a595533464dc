//! User registration and lookup.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::db;
use crate::error::{ApiError, ApiJson};
use crate::model::{NewUser, User};
use crate::state::InstanceContext;

/// POST /users — register a user. Users are immutable afterwards.
pub async fn create_user(
    State(ctx): State<Arc<InstanceContext>>,
    ApiJson(new_user): ApiJson<NewUser>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    if new_user.user_id.trim().is_empty() {
        return Err(ApiError::Validation("user_id must not be empty".into()));
    }
    if !new_user.email.contains('@') {
        return Err(ApiError::Validation("email is malformed".into()));
    }

    let user_id = new_user.user_id.clone();
    let result = db::with_conn(&ctx.pool, ctx.acquire_timeout(), move |conn| {
        db::insert_user(conn, &new_user)
    })
    .await;

    match result {
        Ok(user) => Ok((StatusCode::CREATED, Json(user))),
        Err(err) if err.is_constraint_violation() => {
            Err(ApiError::Conflict(format!("user {user_id} already exists")))
        }
        Err(err) => Err(err.into()),
    }
}

/// GET /users/{user_id}
pub async fn get_user(
    State(ctx): State<Arc<InstanceContext>>,
    Path(user_id): Path<String>,
) -> Result<Json<User>, ApiError> {
    let lookup = user_id.clone();
    let user = db::with_conn(&ctx.pool, ctx.acquire_timeout(), move |conn| {
        db::get_user(conn, &lookup)
    })
    .await?;

    user.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("user {user_id}")))
}
