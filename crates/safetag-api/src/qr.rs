use std::net::SocketAddr;

use axum::{
    Extension, Json,
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use safetag_db::hash_stranger_token;
use safetag_db::models::{ScanInput, ScanOutcome};
use safetag_gateway::user_room;
use safetag_types::api::{CreateQrRequest, ScanRejected, ScanResponse, ScannedQr};
use safetag_types::events::{QrScannedPayload, RoomEvent};
use safetag_types::models::{Purpose, QrStatus};

use crate::auth::new_stranger_token;
use crate::convert;
use crate::error::{ApiResult, AppError};
use crate::middleware::AuthUser;
use crate::state::{AppState, refusal, success};

const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const CODE_LEN: usize = 8;
const CODE_ATTEMPTS: usize = 5;

pub fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_CHARSET[rng.random_range(0..CODE_CHARSET.len())] as char)
        .collect()
}

pub async fn create_qr(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<CreateQrRequest>,
) -> ApiResult<impl IntoResponse> {
    let purpose = req
        .template_type
        .as_deref()
        .map(Purpose::from_template)
        .unwrap_or(Purpose::Custom);
    let custom_purpose = req.purpose.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
    let template = req.template;
    let owner_id = auth.id.to_string();

    let created = state
        .store(move |db| {
            for _ in 0..CODE_ATTEMPTS {
                let id = Uuid::new_v4().to_string();
                let code = generate_code();
                let row = db.create_qr_code(
                    &id,
                    &owner_id,
                    &code,
                    purpose,
                    custom_purpose.as_deref(),
                    template.as_deref(),
                )?;
                if row.is_some() {
                    return Ok(row);
                }
            }
            Ok(None)
        })
        .await?;

    let qr = created.ok_or_else(|| AppError::Conflict("Could not allocate a unique code, try again".into()))?;
    info!("{} created QR {} ({})", auth.id, qr.unique_code, qr.purpose);

    let body = convert::qr_code(&qr, &state.settings.app_url, None)?;
    Ok((StatusCode::CREATED, success(json!({ "qrCode": body }))))
}

pub async fn my_qrs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let owner_id = auth.id.to_string();
    let rows = state.store(move |db| db.list_qr_codes(&owner_id)).await?;

    let codes = rows
        .iter()
        .map(|r| convert::qr_code(&r.qr, &state.settings.app_url, Some(r.call_count)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(success(json!({ "qrCodes": codes })))
}

/// Public entry point behind the printed tag.
pub async fn scan(
    State(state): State<AppState>,
    Path(code): Path<String>,
    req: Request,
) -> ApiResult<Response> {
    let code = code.trim().to_uppercase();
    let stranger_token = new_stranger_token();
    let input = ScanInput {
        session_id: Uuid::new_v4().to_string(),
        stranger_token_hash: hash_stranger_token(&stranger_token),
        ip: client_ip(req.headers(), req.extensions().get::<ConnectInfo<SocketAddr>>()),
        user_agent: req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    let scan_code = code.clone();
    let record = match state.store(move |db| db.record_scan(&scan_code, &input)).await? {
        ScanOutcome::Started(record) => record,
        ScanOutcome::NotFound => return Err(AppError::NotFound("QR code not found".into())),
        ScanOutcome::Inactive => {
            return Ok(rejected("This tag has not been activated yet", QrStatus::Inactive));
        }
        ScanOutcome::Expired => {
            return Ok(rejected("This tag has expired", QrStatus::Expired));
        }
    };

    let qr_id = convert::id(&record.qr.id)?;
    let owner_id = convert::id(&record.qr.owner_id)?;
    let session_id = convert::id(&record.session_id)?;
    let purpose = record.qr.purpose_label();
    info!("QR {} scanned, session {}", code, session_id);

    let event = RoomEvent::QrScanned {
        owner_id,
        payload: QrScannedPayload { qr_id, session_id, purpose: purpose.clone() },
    };
    if state.rooms.emit(&user_room(owner_id), &event).await == 0 {
        warn!("Owner {} not connected; scan of {} only notified via feed", owner_id, code);
    }

    Ok(success(ScanResponse {
        session_id,
        stranger_token,
        purpose,
        qr: ScannedQr { id: qr_id, owner_id, owner_name: record.owner_name },
    })
    .into_response())
}

fn rejected(message: &str, status: QrStatus) -> Response {
    refusal(ScanRejected { message: message.to_string(), status }).into_response()
}

/// First hop of `X-Forwarded-For` when behind a proxy, else the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_the_tag_alphabet() {
        for _ in 0..100 {
            let code = generate_code();
            assert_eq!(code.len(), CODE_LEN);
            assert!(code.bytes().all(|b| CODE_CHARSET.contains(&b)));
        }
    }

    #[test]
    fn forwarded_for_wins_over_peer() {
        let mut headers = HeaderMap::new();
        let peer = ConnectInfo(SocketAddr::from(([10, 0, 0, 9], 4000)));
        assert_eq!(client_ip(&headers, Some(&peer)).as_deref(), Some("10.0.0.9"));

        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(&peer)).as_deref(), Some("203.0.113.7"));
        assert_eq!(client_ip(&HeaderMap::new(), None), None);
    }
}
