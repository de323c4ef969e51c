use axum::{
    Extension, Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use safetag_db::models::{CallRow, EscalationOutcome, NewCall, TransitionOutcome};
use safetag_types::api::{
    CallTransitionResponse, EscalationRequest, InitiateCallRequest, InitiateCallResponse,
};
use safetag_types::events::{CallEventPayload, RoomEvent};
use safetag_types::models::{CallAction, QrStatus};

use crate::convert;
use crate::error::{ApiResult, AppError};
use crate::middleware::{AuthUser, Party, resolve_party};
use crate::state::{AppState, Envelope, success};

/// Start ringing. A stranger calls the tag's owner from their session; the
/// owner calls back into one of the tag's sessions.
pub async fn initiate(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    headers: HeaderMap,
    Json(req): Json<InitiateCallRequest>,
) -> ApiResult<impl IntoResponse> {
    let party = resolve_party(&state, bearer, &headers).await?;

    let qr_id = req.qr_id.to_string();
    let qr = state
        .store(move |db| db.get_qr_code(&qr_id))
        .await?
        .ok_or_else(|| AppError::NotFound("QR code not found".into()))?;

    let lapsed = qr.expires_at.as_deref().is_some_and(|exp| exp <= safetag_db::now().as_str());
    if qr.status != QrStatus::Active || lapsed {
        return Err(AppError::InvalidState("This tag is not active".into()));
    }

    let session_id = match &party {
        Party::Stranger(session) => {
            if session.qr_id != qr.id {
                return Err(AppError::Forbidden("Session was not opened from this tag".into()));
            }
            if !session.is_active {
                return Err(AppError::Gone("This chat session has been closed".into()));
            }
            if req.caller_id != session.id {
                return Err(AppError::BadRequest("callerId must be your session id".into()));
            }
            if req.callee_id != qr.owner_id {
                return Err(AppError::BadRequest("Callee does not own this tag".into()));
            }
            session.id.clone()
        }
        Party::Owner(user) => {
            if qr.owner_id != user.id.to_string() {
                return Err(AppError::Forbidden("This tag belongs to someone else".into()));
            }
            if req.caller_id != qr.owner_id {
                return Err(AppError::BadRequest("callerId must be your user id".into()));
            }
            let callee = req.callee_id.clone();
            let session = state
                .store(move |db| db.get_session(&callee))
                .await?
                .filter(|s| s.qr_id == qr.id)
                .ok_or_else(|| AppError::NotFound("No chat session with that id on this tag".into()))?;
            if !session.is_active {
                return Err(AppError::Gone("This chat session has been closed".into()));
            }
            session.id
        }
    };

    let new_call = NewCall {
        id: Uuid::new_v4().to_string(),
        qr_id: qr.id,
        session_id: Some(session_id),
        caller_id: req.caller_id,
        callee_id: req.callee_id,
    };
    let call = state.store(move |db| db.create_call(&new_call)).await?;
    info!("Call {} ringing for {}", call.id, call.callee_id);

    announce(&state, &call, RoomEvent::IncomingCall).await?;

    Ok((
        StatusCode::CREATED,
        success(InitiateCallResponse { call_id: convert::id(&call.id)? }),
    ))
}

pub async fn accept(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    headers: HeaderMap,
    Path(call_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let party = resolve_party(&state, bearer, &headers).await?;
    let call = load_call(&state, call_id).await?;
    ensure_callee(&call, &party)?;
    transition(&state, call_id, CallAction::Accept).await
}

pub async fn decline(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    headers: HeaderMap,
    Path(call_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let party = resolve_party(&state, bearer, &headers).await?;
    let call = load_call(&state, call_id).await?;
    ensure_callee(&call, &party)?;
    transition(&state, call_id, CallAction::Decline).await
}

/// Either side hangs up. A call nobody answered ends as missed.
pub async fn end(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    headers: HeaderMap,
    Path(call_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let party = resolve_party(&state, bearer, &headers).await?;
    let call = load_call(&state, call_id).await?;

    let participant = match &party {
        Party::Owner(user) => {
            let me = user.id.to_string();
            call.callee_id == me || call.caller_id == me
        }
        Party::Stranger(session) => call.session_id.as_deref() == Some(session.id.as_str()),
    };
    if !participant {
        return Err(AppError::Forbidden("You are not part of this call".into()));
    }

    transition(&state, call_id, CallAction::End).await
}

pub async fn record_escalation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(call_id): Path<Uuid>,
    Json(req): Json<EscalationRequest>,
) -> ApiResult<impl IntoResponse> {
    let call = load_call(&state, call_id).await?;
    if call.callee_id != auth.id.to_string() {
        return Err(AppError::Forbidden("Only the callee can do that".into()));
    }

    let escalated_to = req.escalated_to.trim().to_string();
    if escalated_to.is_empty() {
        return Err(AppError::BadRequest("escalatedTo is required".into()));
    }

    let id = call.id.clone();
    let result = req.result;
    let call = match state.store(move |db| db.record_escalation(&id, &escalated_to, result)).await? {
        EscalationOutcome::Recorded(call) => call,
        EscalationOutcome::NotFound => return Err(AppError::NotFound("Call not found".into())),
        EscalationOutcome::Rejected(status) => {
            return Err(AppError::InvalidState(format!(
                "Escalation can only be recorded once, on a declined or missed call (call is {})",
                status
            )));
        }
    };

    Ok(success(json!({ "call": convert::call(&call)? })))
}

pub async fn history(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(qr_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let id = qr_id.to_string();
    let (qr, calls) = state
        .store(move |db| Ok((db.get_qr_code(&id)?, db.list_calls_for_qr(&id)?)))
        .await?;

    let qr = qr.ok_or_else(|| AppError::NotFound("QR code not found".into()))?;
    if qr.owner_id != auth.id.to_string() {
        return Err(AppError::Forbidden("This tag belongs to someone else".into()));
    }

    let calls = convert::all(&calls, convert::call)?;
    Ok(success(json!({ "calls": calls })))
}

async fn load_call(state: &AppState, call_id: Uuid) -> ApiResult<CallRow> {
    let id = call_id.to_string();
    state
        .store(move |db| db.get_call(&id))
        .await?
        .ok_or_else(|| AppError::NotFound("Call not found".into()))
}

/// The owner answers with their bearer token, a stranger with their session token.
fn ensure_callee(call: &CallRow, party: &Party) -> Result<(), AppError> {
    let is_callee = match party {
        Party::Owner(user) => call.callee_id == user.id.to_string(),
        Party::Stranger(session) => call.callee_id == session.id,
    };
    if !is_callee {
        return Err(AppError::Forbidden("Only the callee can do that".into()));
    }
    Ok(())
}

async fn transition(
    state: &AppState,
    call_id: Uuid,
    action: CallAction,
) -> ApiResult<Json<Envelope<CallTransitionResponse>>> {
    let id = call_id.to_string();
    let call = match state.store(move |db| db.transition_call(&id, action)).await? {
        TransitionOutcome::Applied(call) => call,
        TransitionOutcome::NotFound => return Err(AppError::NotFound("Call not found".into())),
        TransitionOutcome::Rejected(status) => {
            return Err(AppError::InvalidState(format!("Cannot {} a call that is {}", action.as_str(), status)));
        }
    };
    info!("Call {} {} -> {}", call.id, action.as_str(), call.status);

    announce(state, &call, |payload| RoomEvent::for_call_action(action, payload)).await?;

    Ok(success(CallTransitionResponse {
        call_id,
        status: call.status,
        message: format!("Call {}", call.status),
    }))
}

/// Tell both ends about the call. Caller and callee ids are room names:
/// an owner's user id or a stranger's session id.
pub(crate) async fn announce(
    state: &AppState,
    call: &CallRow,
    event: impl FnOnce(CallEventPayload) -> RoomEvent,
) -> ApiResult<()> {
    let payload = convert::call_event(call)?;
    let rooms = [payload.callee_id.clone(), payload.caller_id.clone()];
    let event = event(payload);

    state.rooms.emit_many(&[rooms[0].as_str(), rooms[1].as_str()], &event).await;
    Ok(())
}
