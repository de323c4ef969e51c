use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use safetag_db::models::OrderConfirm;
use safetag_types::api::{ConfirmOrderRequest, CreateOrderRequest};

use crate::convert;
use crate::error::{ApiResult, AppError};
use crate::middleware::AuthUser;
use crate::state::{AppState, success};

/// Price of a tag in paise when the client does not quote one.
pub const DEFAULT_AMOUNT: i64 = 23500;

pub async fn create_order(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(req): Json<CreateOrderRequest>,
) -> ApiResult<impl IntoResponse> {
    let amount = req.amount.unwrap_or(DEFAULT_AMOUNT);
    if amount <= 0 {
        return Err(AppError::BadRequest("Amount must be positive".into()));
    }

    let user_id = auth.id.to_string();
    let qr_id = req.qr_id.map(|id| id.to_string());
    let order_type = req.order_type;
    let order_id = Uuid::new_v4().to_string();

    let order = state
        .store(move |db| {
            if let Some(qr_id) = &qr_id {
                match db.get_qr_code(qr_id)? {
                    Some(qr) if qr.owner_id == user_id => {}
                    _ => return Ok(None),
                }
            }
            db.create_order(&order_id, &user_id, qr_id.as_deref(), order_type, amount)
                .map(Some)
        })
        .await?
        .ok_or_else(|| AppError::NotFound("QR code not found".into()))?;

    Ok((StatusCode::CREATED, success(json!({ "order": convert::order(&order)? }))))
}

pub async fn list_orders(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<impl IntoResponse> {
    let user_id = auth.id.to_string();
    let rows = state.store(move |db| db.list_orders(&user_id)).await?;

    Ok(success(json!({ "orders": convert::all(&rows, convert::order)? })))
}

/// Record a completed payment. Paying for a tag activates it for the
/// configured validity window.
pub async fn confirm_order(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<ConfirmOrderRequest>,
) -> ApiResult<impl IntoResponse> {
    let payment_id = req.payment_id.trim().to_string();
    if payment_id.is_empty() {
        return Err(AppError::BadRequest("paymentId is required".into()));
    }

    let user_id = auth.id.to_string();
    let id = order_id.to_string();
    let expires_at = Utc::now() + Duration::days(state.settings.qr_validity_days);

    let (order, activated_qr) =
        match state.store(move |db| db.confirm_order(&user_id, &id, &payment_id, expires_at)).await? {
            OrderConfirm::Confirmed { order, activated_qr } => (order, activated_qr),
            OrderConfirm::NotFound => return Err(AppError::NotFound("Order not found".into())),
            OrderConfirm::AlreadyPaid => {
                return Err(AppError::InvalidState("Order has already been paid".into()));
            }
        };

    if let Some(qr) = &activated_qr {
        info!("Order {} paid, QR {} active until {:?}", order.id, qr.unique_code, qr.expires_at);
    }

    let qr = activated_qr
        .as_ref()
        .map(|qr| convert::qr_code(qr, &state.settings.app_url, None))
        .transpose()?;

    Ok(success(json!({ "order": convert::order(&order)?, "qrCode": qr })))
}
