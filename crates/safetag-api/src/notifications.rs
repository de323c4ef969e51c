use axum::{
    Extension,
    extract::{Path, State},
    response::IntoResponse,
};
use serde_json::json;
use uuid::Uuid;

use crate::convert;
use crate::error::{ApiResult, AppError};
use crate::middleware::AuthUser;
use crate::state::{AppState, success};

/// The feed only ever shows this many, newest first.
const FEED_LIMIT: u32 = 50;

pub async fn list_updates(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let user_id = auth.id.to_string();
    let rows = state.store(move |db| db.list_notifications(&user_id, FEED_LIMIT)).await?;
    let updates = convert::all(&rows, convert::notification)?;
    let unread = updates.iter().filter(|n| !n.read).count();

    Ok(success(json!({ "updates": updates, "unreadCount": unread })))
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let user_id = auth.id.to_string();
    let marked = state.store(move |db| db.mark_all_notifications_read(&user_id)).await?;

    Ok(success(json!({ "markedCount": marked })))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(notification_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let user_id = auth.id.to_string();
    let id = notification_id.to_string();
    if !state.store(move |db| db.mark_notification_read(&user_id, &id)).await? {
        return Err(AppError::NotFound("Update not found".into()));
    }

    Ok(success(json!({ "message": "Marked as read" })))
}
