//! Store rows to wire types. Rows keep ids and timestamps as TEXT; a value
//! that does not parse means the database was written by something else, so
//! it surfaces as an upstream error.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use safetag_db::models::{
    CallRow, ChatMessageRow, ContactRow, NotificationRow, OrderRow, QrCodeRow, SessionSummaryRow, UserRow,
};
use safetag_types::api::{
    CallResponse, ChatMessageResponse, ChatSessionSummary, ContactResponse, NotificationResponse,
    OrderResponse, QrCodeResponse, UserProfile,
};
use safetag_types::events::CallEventPayload;

pub(crate) fn id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("stored id '{}' is not a uuid", raw))
}

pub(crate) fn time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("stored timestamp '{}' is not RFC 3339", raw))
}

fn opt_time(raw: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    raw.map(time).transpose()
}

pub(crate) fn user_profile(row: &UserRow) -> Result<UserProfile> {
    Ok(UserProfile {
        id: id(&row.id)?,
        name: row.name.clone(),
        email: row.email.clone(),
        phone: row.phone.clone(),
        avatar_url: row.avatar_url.clone(),
        is_verified: row.is_verified,
        created_at: time(&row.created_at)?,
    })
}

pub(crate) fn qr_code(row: &QrCodeRow, app_url: &str, call_count: Option<i64>) -> Result<QrCodeResponse> {
    Ok(QrCodeResponse {
        id: id(&row.id)?,
        unique_code: row.unique_code.clone(),
        purpose: row.purpose,
        purpose_label: row.purpose_label(),
        custom_purpose: row.custom_purpose.clone(),
        template: row.template.clone(),
        status: row.status,
        scan_count: row.scan_count,
        last_scanned_at: opt_time(row.last_scanned_at.as_deref())?,
        activated_at: opt_time(row.activated_at.as_deref())?,
        expires_at: opt_time(row.expires_at.as_deref())?,
        created_at: time(&row.created_at)?,
        scan_url: format!("{}/scan/{}", app_url.trim_end_matches('/'), row.unique_code),
        call_count,
    })
}

pub(crate) fn chat_message(row: &ChatMessageRow) -> Result<ChatMessageResponse> {
    Ok(ChatMessageResponse {
        id: id(&row.id)?,
        session_id: id(&row.session_id)?,
        sender_type: row.sender_role,
        message_type: row.kind,
        content: row.content.clone(),
        media_url: row.media_url.clone(),
        latitude: row.latitude,
        longitude: row.longitude,
        is_read: row.is_read,
        created_at: time(&row.created_at)?,
    })
}

pub(crate) fn session_summary(row: &SessionSummaryRow) -> Result<ChatSessionSummary> {
    let session = &row.session;
    Ok(ChatSessionSummary {
        id: id(&session.id)?,
        qr_id: id(&session.qr_id)?,
        qr_purpose: row.qr_purpose.clone(),
        is_active: session.is_active,
        last_message: row.last_message.clone(),
        last_message_at: time(row.last_message_at.as_deref().unwrap_or(&session.last_activity_at))?,
        created_at: time(&session.created_at)?,
    })
}

pub(crate) fn call(row: &CallRow) -> Result<CallResponse> {
    Ok(CallResponse {
        id: id(&row.id)?,
        qr_id: id(&row.qr_id)?,
        session_id: row.session_id.as_deref().map(id).transpose()?,
        caller_id: row.caller_id.clone(),
        callee_id: row.callee_id.clone(),
        status: row.status,
        escalated_to: row.escalated_to.clone(),
        escalation_result: row.escalation_result,
        started_at: time(&row.started_at)?,
        connected_at: opt_time(row.connected_at.as_deref())?,
        ended_at: opt_time(row.ended_at.as_deref())?,
    })
}

pub(crate) fn call_event(row: &CallRow) -> Result<CallEventPayload> {
    Ok(CallEventPayload {
        call_id: id(&row.id)?,
        qr_id: id(&row.qr_id)?,
        session_id: row.session_id.as_deref().map(id).transpose()?,
        caller_id: row.caller_id.clone(),
        callee_id: row.callee_id.clone(),
        status: row.status,
    })
}

pub(crate) fn contact(row: &ContactRow) -> Result<ContactResponse> {
    Ok(ContactResponse {
        id: id(&row.id)?,
        name: row.name.clone(),
        phone: row.phone.clone(),
        relation: row.relation.clone(),
        priority: row.priority,
        created_at: time(&row.created_at)?,
    })
}

pub(crate) fn notification(row: &NotificationRow) -> Result<NotificationResponse> {
    Ok(NotificationResponse {
        id: id(&row.id)?,
        kind: row.kind,
        title: row.title.clone(),
        body: row.body.clone(),
        data: serde_json::from_str(&row.data).unwrap_or(serde_json::Value::Null),
        read: row.is_read,
        created_at: time(&row.created_at)?,
    })
}

pub(crate) fn order(row: &OrderRow) -> Result<OrderResponse> {
    Ok(OrderResponse {
        id: id(&row.id)?,
        qr_id: row.qr_id.as_deref().map(id).transpose()?,
        order_type: row.order_type,
        amount: row.amount,
        currency: row.currency.clone(),
        status: row.status,
        payment_id: row.payment_id.clone(),
        created_at: time(&row.created_at)?,
    })
}

/// Convert every row, failing on the first bad one.
pub(crate) fn all<R, T>(rows: &[R], f: impl Fn(&R) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(f).collect()
}
