use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::models::{
    CallStatus, EscalationResult, MessageKind, NotificationKind, OrderStatus, OrderType, Purpose,
    QrStatus, SenderRole,
};

// -- JWT Claims --

/// Claims carried by owner bearer tokens. Shared by the REST middleware and
/// the WebSocket `identify` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub name: String,
    pub exp: usize,
}

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`) in partial updates. Use together with `#[serde(default)]`.
pub fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleSignInRequest {
    #[serde(default)]
    pub id_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    pub user: UserProfile,
    pub qr_count: i64,
    pub contact_count: i64,
}

/// Partial profile update. `phone` and `avatarUrl` may be cleared with `null`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateProfileRequest {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub avatar_url: Option<Option<String>>,
}

// -- QR codes --

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQrRequest {
    /// Template name as shown in the app, e.g. "Pet Tag".
    pub template_type: Option<String>,
    /// Free-form label the owner typed, shown to scanners instead of the template name.
    pub purpose: Option<String>,
    pub template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrCodeResponse {
    pub id: Uuid,
    pub unique_code: String,
    pub purpose: Purpose,
    pub purpose_label: String,
    pub custom_purpose: Option<String>,
    pub template: Option<String>,
    pub status: QrStatus,
    pub scan_count: i64,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub scan_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannedQr {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub owner_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResponse {
    pub session_id: Uuid,
    pub stranger_token: String,
    pub purpose: String,
    pub qr: ScannedQr,
}

/// Scan of a known code that cannot start a session right now.
#[derive(Debug, Serialize, Deserialize)]
pub struct ScanRejected {
    pub message: String,
    pub status: QrStatus,
}

// -- Chat --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSendRequest {
    pub session_id: Uuid,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_message_kind")]
    pub message_type: MessageKind,
    pub media_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrangerSendRequest {
    pub stranger_token: String,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_message_kind")]
    pub message_type: MessageKind,
    pub media_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

fn default_message_kind() -> MessageKind {
    MessageKind::Text
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageResponse {
    pub id: Uuid,
    pub session_id: Uuid,
    pub sender_type: SenderRole,
    pub message_type: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSessionSummary {
    pub id: Uuid,
    pub qr_id: Uuid,
    pub qr_purpose: String,
    pub is_active: bool,
    pub last_message: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// -- Calls --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallRequest {
    pub qr_id: Uuid,
    /// Room name of the caller: the stranger's session id, or the owner's user id.
    pub caller_id: String,
    /// The tag owner's user id when a stranger calls; a session id on this tag
    /// when the owner calls back.
    pub callee_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallResponse {
    pub call_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallTransitionResponse {
    pub call_id: Uuid,
    pub status: CallStatus,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRequest {
    pub escalated_to: String,
    pub result: EscalationResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub id: Uuid,
    pub qr_id: Uuid,
    pub session_id: Option<Uuid>,
    pub caller_id: String,
    pub callee_id: String,
    pub status: CallStatus,
    pub escalated_to: Option<String>,
    pub escalation_result: EscalationResult,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

// -- Emergency contacts --

/// A contact as submitted by the app. Fields are optional so bulk sync can
/// skip incomplete entries instead of rejecting the whole batch.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContactRequest {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub relation: Option<String>,
    pub priority: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct BulkContactsRequest {
    pub contacts: Vec<NewContactRequest>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateContactRequest {
    pub name: Option<String>,
    pub phone: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub relation: Option<Option<String>>,
    /// Moves the contact to this rank; the others shift to stay dense.
    pub priority: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderContactsRequest {
    pub ordered_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactResponse {
    pub id: Uuid,
    pub name: String,
    pub phone: String,
    pub relation: String,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
}

// -- Notifications --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResponse {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

// -- Orders --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub qr_id: Option<Uuid>,
    pub order_type: OrderType,
    /// Minor currency units (paise).
    pub amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmOrderRequest {
    pub payment_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: Uuid,
    pub qr_id: Option<Uuid>,
    pub order_type: OrderType,
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
