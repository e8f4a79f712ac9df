//! Handlers for the `/users` resource.
//!
//! Every successful mutation publishes a [`UserEvent`]. Publishing is
//! best-effort: failures are logged and never change the HTTP response or
//! roll back the database write.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use users_core::error::CoreError;
use users_core::types::DbId;
use users_db::models::user::{CreateUser, UpdateUser, User};
use users_db::repositories::UserRepo;
use users_events::UserEvent;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// POST /api/v1/users
pub async fn create(
    State(state): State<AppState>,
    payload: Result<Json<CreateUser>, JsonRejection>,
) -> AppResult<(StatusCode, Json<User>)> {
    let Json(input) = payload.map_err(bad_json)?;
    input.validate()?;

    let user = UserRepo::create(&state.pool, &input).await?;

    notify(
        &state,
        UserEvent::Created {
            user_id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            created_at: user.created_at,
        },
    )
    .await;

    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /api/v1/users
pub async fn list(State(state): State<AppState>) -> AppResult<Json<Vec<User>>> {
    let users = UserRepo::list(&state.pool).await?;
    Ok(Json(users))
}

/// GET /api/v1/users/{id}
pub async fn get_by_id(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
) -> AppResult<Json<User>> {
    let user = UserRepo::find_by_id(&state.pool, id)
        .await?
        .ok_or_else(|| not_found(id))?;
    Ok(Json(user))
}

/// PUT|PATCH /api/v1/users/{id}
///
/// Partial update: omitted fields keep their current value.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<DbId>,
    payload: Result<Json<UpdateUser>, JsonRejection>,
) -> AppResult<Json<User>> {
    let Json(input) = payload.map_err(bad_json)?;
    input.validate()?;

    let user = UserRepo::update(&state.pool, id, &input)
        .await?
        .ok_or_else(|| not_found(id))?;

    notify(
        &state,
        UserEvent::Updated {
            user_id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            updated_at: user.updated_at,
        },
    )
    .await;

    Ok(Json(user))
}

/// DELETE /api/v1/users/{id}
pub async fn delete(State(state): State<AppState>, Path(id): Path<DbId>) -> AppResult<StatusCode> {
    let user = UserRepo::delete(&state.pool, id)
        .await?
        .ok_or_else(|| not_found(id))?;

    notify(
        &state,
        UserEvent::Deleted {
            user_id: user.id,
            name: user.name,
            deleted_at: Utc::now(),
        },
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

// ---- helpers ----

/// Publish `event`, logging instead of propagating any failure.
async fn notify(state: &AppState, event: UserEvent) {
    let routing_key = event.routing_key();
    let user_id = event.user_id();

    match state.publisher.publish_event(&event).await {
        Ok(()) => tracing::info!(routing_key, user_id, "Published {routing_key} event"),
        Err(e) => tracing::error!(
            routing_key,
            user_id,
            error = %e,
            "Failed to publish {routing_key} event"
        ),
    }
}

fn not_found(id: DbId) -> AppError {
    AppError::Core(CoreError::NotFound { entity: "User", id })
}

fn bad_json(rejection: JsonRejection) -> AppError {
    AppError::BadRequest(rejection.body_text())
}
