use axum::{
    Extension, Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use safetag_db::models::{ChatSessionRow, NewMessage};
use safetag_gateway::user_room;
use safetag_types::api::{OwnerSendRequest, StrangerSendRequest};
use safetag_types::events::RoomEvent;
use safetag_types::models::{MessageKind, SenderRole};

use crate::convert;
use crate::error::{ApiResult, AppError};
use crate::middleware::{AuthUser, authenticate_stranger, stranger_token};
use crate::state::{AppState, Envelope, success};

/// What a client submitted, before it is checked against its kind.
struct Draft {
    kind: MessageKind,
    content: String,
    media_url: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl Draft {
    fn validate(&self) -> Result<(), AppError> {
        match self.kind {
            MessageKind::Text if self.content.trim().is_empty() => {
                Err(AppError::BadRequest("Message content is required".into()))
            }
            MessageKind::Location if self.latitude.is_none() || self.longitude.is_none() => {
                Err(AppError::BadRequest("Location messages need latitude and longitude".into()))
            }
            MessageKind::Voice
                if self.media_url.as_deref().is_none_or(str::is_empty) && self.content.trim().is_empty() =>
            {
                Err(AppError::BadRequest("Voice messages need a media url".into()))
            }
            MessageKind::System => Err(AppError::BadRequest("System messages cannot be sent".into())),
            _ => Ok(()),
        }
    }

    fn into_message(self, session_id: &str, sender_role: SenderRole) -> NewMessage {
        NewMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            sender_role,
            kind: self.kind,
            content: self.content,
            media_url: self.media_url,
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Persist, then fan out to the session room and the owner's own room.
async fn deliver(
    state: &AppState,
    session: &ChatSessionRow,
    draft: Draft,
    sender_role: SenderRole,
) -> ApiResult<(StatusCode, Json<Envelope<serde_json::Value>>)> {
    draft.validate()?;
    let message = draft.into_message(&session.id, sender_role);
    let row = state.store(move |db| db.insert_message(&message)).await?;

    let body = convert::chat_message(&row)?;
    let event = RoomEvent::NewMessage(body.clone());
    let owner_room = user_room(convert::id(&session.owner_id)?);
    let reached = state
        .rooms
        .emit_many(&[session.id.as_str(), owner_room.as_str()], &event)
        .await;
    debug!("Message {} in session {} reached {} connections", row.id, session.id, reached);

    Ok((StatusCode::CREATED, success(json!({ "message": body }))))
}

pub async fn send_as_owner(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<OwnerSendRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = owned_session(&state, &auth, req.session_id).await?;
    if !session.is_active {
        return Err(AppError::Gone("This chat session has been closed".into()));
    }

    let draft = Draft {
        kind: req.message_type,
        content: req.content,
        media_url: req.media_url,
        latitude: req.latitude,
        longitude: req.longitude,
    };
    deliver(&state, &session, draft, SenderRole::Owner).await
}

pub async fn send_as_stranger(
    State(state): State<AppState>,
    Json(req): Json<StrangerSendRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = authenticate_stranger(&state, req.stranger_token.trim()).await?;
    if !session.is_active {
        return Err(AppError::Gone("This chat session has been closed".into()));
    }

    let draft = Draft {
        kind: req.message_type,
        content: req.content,
        media_url: req.media_url,
        latitude: req.latitude,
        longitude: req.longitude,
    };
    deliver(&state, &session, draft, SenderRole::Stranger).await
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let owner_id = auth.id.to_string();
    let rows = state.store(move |db| db.list_sessions(&owner_id)).await?;
    let sessions = convert::all(&rows, convert::session_summary)?;

    Ok(success(json!({ "sessions": sessions })))
}

/// Owner view of a conversation. Reading it marks the stranger's messages read.
pub async fn session_messages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let session = owned_session(&state, &auth, session_id).await?;

    let rows = state
        .store(move |db| {
            db.mark_messages_read(&session.id, SenderRole::Stranger)?;
            db.list_messages(&session.id)
        })
        .await?;
    let messages = convert::all(&rows, convert::chat_message)?;

    Ok(success(json!({ "messages": messages })))
}

pub async fn stranger_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let token = stranger_token(&headers)
        .ok_or_else(|| AppError::Unauthorized("Missing stranger token".into()))?;
    let session = authenticate_stranger(&state, token).await?;

    let session_id = session.id.clone();
    let rows = state.store(move |db| db.list_messages(&session_id)).await?;
    let messages = convert::all(&rows, convert::chat_message)?;

    Ok(success(json!({
        "sessionId": convert::id(&session.id)?,
        "isActive": session.is_active,
        "messages": messages,
    })))
}

pub async fn close_session(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let session = owned_session(&state, &auth, session_id).await?;

    let id = session.id.clone();
    if state.store(move |db| db.close_session(&id)).await? {
        info!("Owner {} closed session {}", auth.id, session_id);
        state.rooms.emit(&session.id, &RoomEvent::SessionClosed { session_id }).await;
    }

    Ok(success(json!({ "message": "Session closed" })))
}

async fn owned_session(state: &AppState, auth: &AuthUser, session_id: Uuid) -> ApiResult<ChatSessionRow> {
    let id = session_id.to_string();
    let session = state
        .store(move |db| db.get_session(&id))
        .await?
        .ok_or_else(|| AppError::NotFound("Chat session not found".into()))?;

    if session.owner_id != auth.id.to_string() {
        return Err(AppError::Forbidden("This chat belongs to someone else".into()));
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(kind: MessageKind, content: &str) -> Draft {
        Draft { kind, content: content.into(), media_url: None, latitude: None, longitude: None }
    }

    #[test]
    fn message_kinds_require_their_payload() {
        assert!(draft(MessageKind::Text, "hi").validate().is_ok());
        assert!(draft(MessageKind::Text, "  ").validate().is_err());
        assert!(draft(MessageKind::Location, "").validate().is_err());
        assert!(
            Draft { latitude: Some(12.9), longitude: Some(77.6), ..draft(MessageKind::Location, "") }
                .validate()
                .is_ok()
        );
        assert!(draft(MessageKind::Voice, "").validate().is_err());
        assert!(
            Draft { media_url: Some("https://cdn/v.ogg".into()), ..draft(MessageKind::Voice, "") }
                .validate()
                .is_ok()
        );
        assert!(draft(MessageKind::System, "hello").validate().is_err());
    }
}
