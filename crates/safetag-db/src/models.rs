//! Database row types. These map directly to SQLite rows and are kept apart
//! from the `safetag-types` API models so the store does not depend on the
//! wire format.

use std::str::FromStr;

use rusqlite::Row;
use rusqlite::types::Type;

use safetag_types::models::{
    CallStatus, EscalationResult, MessageKind, NotificationKind, OrderStatus, OrderType, Purpose,
    QrStatus, SenderRole, UnknownVariant,
};

/// Reads a TEXT column holding one of the `safetag-types` enums.
fn text_enum<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// -- Users --

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    /// Argon2 PHC string. `None` for accounts that only ever signed in with Google.
    pub password: Option<String>,
    pub google_id: Option<String>,
    pub avatar_url: Option<String>,
    pub is_verified: bool,
    pub created_at: String,
}

impl UserRow {
    pub(crate) const COLUMNS: &'static str =
        "id, name, email, phone, password, google_id, avatar_url, is_verified, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            phone: row.get(3)?,
            password: row.get(4)?,
            google_id: row.get(5)?,
            avatar_url: row.get(6)?,
            is_verified: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

pub struct NewUser {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub password_hash: String,
}

/// Identity vouched for by a verified Google ID token.
#[derive(Debug, Clone)]
pub struct GoogleProfile {
    pub google_id: String,
    pub email: String,
    pub name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug)]
pub enum UserInsert {
    Created(UserRow),
    EmailTaken,
    PhoneTaken,
}

/// Partial profile change: `None` keeps a field, `Some(None)` clears a nullable one.
#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub phone: Option<Option<String>>,
    pub avatar_url: Option<Option<String>>,
}

#[derive(Debug)]
pub enum ProfileChange {
    Updated(UserRow),
    NotFound,
    PhoneTaken,
}

// -- QR codes --

#[derive(Debug, Clone)]
pub struct QrCodeRow {
    pub id: String,
    pub owner_id: String,
    pub unique_code: String,
    pub purpose: Purpose,
    pub custom_purpose: Option<String>,
    pub template: Option<String>,
    pub status: QrStatus,
    pub scan_count: i64,
    pub last_scanned_at: Option<String>,
    pub activated_at: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
}

impl QrCodeRow {
    pub(crate) const COLUMNS: &'static str = "id, owner_id, unique_code, purpose, custom_purpose, template, status, \
         scan_count, last_scanned_at, activated_at, expires_at, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            unique_code: row.get(2)?,
            purpose: text_enum(row, 3)?,
            custom_purpose: row.get(4)?,
            template: row.get(5)?,
            status: text_enum(row, 6)?,
            scan_count: row.get(7)?,
            last_scanned_at: row.get(8)?,
            activated_at: row.get(9)?,
            expires_at: row.get(10)?,
            created_at: row.get(11)?,
        })
    }

    /// What scanners and notifications call this tag.
    pub fn purpose_label(&self) -> String {
        self.custom_purpose
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.purpose.label().to_string())
    }
}

#[derive(Debug, Clone)]
pub struct QrSummaryRow {
    pub qr: QrCodeRow,
    pub call_count: i64,
}

/// Request metadata recorded with each scan.
pub struct ScanInput {
    pub session_id: String,
    pub stranger_token_hash: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug)]
pub struct ScanRecord {
    pub qr: QrCodeRow,
    pub owner_name: String,
    pub session_id: String,
}

#[derive(Debug)]
pub enum ScanOutcome {
    NotFound,
    Inactive,
    Expired,
    Started(ScanRecord),
}

// -- Chat --

#[derive(Debug, Clone)]
pub struct ChatSessionRow {
    pub id: String,
    pub qr_id: String,
    pub owner_id: String,
    pub is_active: bool,
    pub created_at: String,
    pub last_activity_at: String,
}

impl ChatSessionRow {
    pub(crate) const COLUMNS: &'static str =
        "id, qr_id, owner_id, is_active, created_at, last_activity_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            qr_id: row.get(1)?,
            owner_id: row.get(2)?,
            is_active: row.get(3)?,
            created_at: row.get(4)?,
            last_activity_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummaryRow {
    pub session: ChatSessionRow,
    pub qr_purpose: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatMessageRow {
    pub seq: i64,
    pub id: String,
    pub session_id: String,
    pub sender_role: SenderRole,
    pub kind: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_read: bool,
    pub created_at: String,
}

impl ChatMessageRow {
    pub(crate) const COLUMNS: &'static str = "seq, id, session_id, sender_role, kind, content, media_url, \
         latitude, longitude, is_read, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            session_id: row.get(2)?,
            sender_role: text_enum(row, 3)?,
            kind: text_enum(row, 4)?,
            content: row.get(5)?,
            media_url: row.get(6)?,
            latitude: row.get(7)?,
            longitude: row.get(8)?,
            is_read: row.get(9)?,
            created_at: row.get(10)?,
        })
    }
}

pub struct NewMessage {
    pub id: String,
    pub session_id: String,
    pub sender_role: SenderRole,
    pub kind: MessageKind,
    pub content: String,
    pub media_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

// -- Calls --

#[derive(Debug, Clone)]
pub struct CallRow {
    pub id: String,
    pub qr_id: String,
    pub session_id: Option<String>,
    pub caller_id: String,
    pub callee_id: String,
    pub status: CallStatus,
    pub escalated_to: Option<String>,
    pub escalation_result: EscalationResult,
    pub started_at: String,
    pub connected_at: Option<String>,
    pub ended_at: Option<String>,
}

impl CallRow {
    /// True when the owner rang a stranger: the callee is then the session itself.
    pub fn callee_is_stranger(&self) -> bool {
        self.session_id.as_deref() == Some(self.callee_id.as_str())
    }

    pub(crate) const COLUMNS: &'static str = "id, qr_id, session_id, caller_id, callee_id, status, escalated_to, \
         escalation_result, started_at, connected_at, ended_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            qr_id: row.get(1)?,
            session_id: row.get(2)?,
            caller_id: row.get(3)?,
            callee_id: row.get(4)?,
            status: text_enum(row, 5)?,
            escalated_to: row.get(6)?,
            escalation_result: text_enum(row, 7)?,
            started_at: row.get(8)?,
            connected_at: row.get(9)?,
            ended_at: row.get(10)?,
        })
    }
}

pub struct NewCall {
    pub id: String,
    pub qr_id: String,
    pub session_id: Option<String>,
    pub caller_id: String,
    pub callee_id: String,
}

#[derive(Debug)]
pub enum TransitionOutcome {
    NotFound,
    /// The action is not allowed from the call's current status.
    Rejected(CallStatus),
    Applied(CallRow),
}

#[derive(Debug)]
pub enum EscalationOutcome {
    NotFound,
    /// Only declined or missed calls escalate, and only once.
    Rejected(CallStatus),
    Recorded(CallRow),
}

// -- Emergency contacts --

#[derive(Debug, Clone)]
pub struct ContactRow {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub phone: String,
    pub relation: String,
    pub priority: u32,
    pub created_at: String,
}

impl ContactRow {
    pub(crate) const COLUMNS: &'static str = "id, owner_id, name, phone, relation, priority, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            phone: row.get(3)?,
            relation: row.get(4)?,
            priority: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewContact {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub relation: String,
    /// 1-based rank to insert at; `None` appends.
    pub priority: Option<u32>,
}

#[derive(Debug)]
pub enum ContactInsert {
    Inserted(ContactRow),
    DuplicatePhone,
}

#[derive(Debug, Default)]
pub struct ContactUpdate {
    pub name: Option<String>,
    pub phone: Option<String>,
    /// `Some(None)` clears the relation.
    pub relation: Option<Option<String>>,
    pub priority: Option<u32>,
}

#[derive(Debug)]
pub enum ContactChange {
    Updated(ContactRow),
    NotFound,
    DuplicatePhone,
}

#[derive(Debug)]
pub enum ReorderOutcome {
    Reordered(Vec<ContactRow>),
    /// The ids were not exactly the owner's contacts.
    Mismatch,
}

// -- Notifications --

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: String,
    pub is_read: bool,
    pub created_at: String,
}

impl NotificationRow {
    pub(crate) const COLUMNS: &'static str = "id, user_id, kind, title, body, data, is_read, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            kind: text_enum(row, 2)?,
            title: row.get(3)?,
            body: row.get(4)?,
            data: row.get(5)?,
            is_read: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

pub struct NewNotification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

// -- Orders --

#[derive(Debug, Clone)]
pub struct OrderRow {
    pub id: String,
    pub user_id: String,
    pub qr_id: Option<String>,
    pub order_type: OrderType,
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_id: Option<String>,
    pub created_at: String,
}

impl OrderRow {
    pub(crate) const COLUMNS: &'static str =
        "id, user_id, qr_id, order_type, amount, currency, status, payment_id, created_at";

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            qr_id: row.get(2)?,
            order_type: text_enum(row, 3)?,
            amount: row.get(4)?,
            currency: row.get(5)?,
            status: text_enum(row, 6)?,
            payment_id: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[derive(Debug)]
pub enum OrderConfirm {
    NotFound,
    AlreadyPaid,
    Confirmed {
        order: OrderRow,
        activated_qr: Option<QrCodeRow>,
    },
}
