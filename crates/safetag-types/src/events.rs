use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::api::ChatMessageResponse;
use crate::models::{CallAction, CallStatus};

/// Wire shape of every real-time frame, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrScannedPayload {
    pub qr_id: Uuid,
    pub session_id: Uuid,
    pub purpose: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEventPayload {
    pub call_id: Uuid,
    pub qr_id: Uuid,
    pub session_id: Option<Uuid>,
    /// Room of whoever placed the call: an owner's user id or a stranger's session id.
    pub caller_id: String,
    /// Room of whoever is being rung, in the same form as `caller_id`.
    pub callee_id: String,
    pub status: CallStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Offer => "webrtc_offer",
            Self::Answer => "webrtc_answer",
            Self::IceCandidate => "webrtc_ice_candidate",
        }
    }
}

/// Events pushed from the server into rooms.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Sent once to a freshly connected socket.
    Ready { connection_id: Uuid },

    /// The socket proved an owner identity and joined that owner's room.
    Identified { user_id: Uuid },

    /// The socket proved it may follow a chat session and joined its room.
    SessionJoined { session_id: String },

    /// A `join_session` without valid proof for that session.
    JoinRefused { session_id: String },

    /// Someone scanned one of the owner's tags. The event name carries the
    /// owner id (`qr_scanned_<ownerId>`) so clients can bind a listener per account.
    QrScanned { owner_id: Uuid, payload: QrScannedPayload },

    NewMessage(ChatMessageResponse),

    IncomingCall(CallEventPayload),
    CallConnected(CallEventPayload),
    CallDeclined(CallEventPayload),
    CallEnded(CallEventPayload),
    CallMissed(CallEventPayload),

    SessionClosed { session_id: Uuid },

    /// WebRTC signaling, relayed verbatim.
    Signal { kind: SignalKind, payload: Value },
}

impl RoomEvent {
    pub fn name(&self) -> String {
        match self {
            Self::Ready { .. } => "ready".into(),
            Self::Identified { .. } => "identified".into(),
            Self::SessionJoined { .. } => "session_joined".into(),
            Self::JoinRefused { .. } => "join_refused".into(),
            Self::QrScanned { owner_id, .. } => format!("qr_scanned_{}", owner_id),
            Self::NewMessage(_) => "new_message".into(),
            Self::IncomingCall(_) => "incoming_call".into(),
            Self::CallConnected(_) => "call_connected".into(),
            Self::CallDeclined(_) => "call_declined".into(),
            Self::CallEnded(_) => "call_ended".into(),
            Self::CallMissed(_) => "call_missed".into(),
            Self::SessionClosed { .. } => "session_closed".into(),
            Self::Signal { kind, .. } => kind.event_name().into(),
        }
    }

    pub fn data(&self) -> serde_json::Result<Value> {
        match self {
            Self::Ready { connection_id } => Ok(serde_json::json!({ "connectionId": connection_id })),
            Self::Identified { user_id } => Ok(serde_json::json!({ "userId": user_id })),
            Self::SessionJoined { session_id } | Self::JoinRefused { session_id } => {
                Ok(serde_json::json!({ "sessionId": session_id }))
            }
            Self::QrScanned { payload, .. } => serde_json::to_value(payload),
            Self::NewMessage(message) => serde_json::to_value(message),
            Self::IncomingCall(call)
            | Self::CallConnected(call)
            | Self::CallDeclined(call)
            | Self::CallEnded(call)
            | Self::CallMissed(call) => serde_json::to_value(call),
            Self::SessionClosed { session_id } => Ok(serde_json::json!({ "sessionId": session_id })),
            Self::Signal { payload, .. } => Ok(payload.clone()),
        }
    }

    /// Serialize into the JSON text sent over the socket.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(&Frame {
            event: self.name(),
            data: self.data()?,
        })
    }

    /// The event announcing that `action` was applied to a call. The event
    /// follows the action: hanging up always sends `call_ended`, whatever
    /// final status the payload carries.
    pub fn for_call_action(action: CallAction, payload: CallEventPayload) -> Self {
        match action {
            CallAction::Accept => Self::CallConnected(payload),
            CallAction::Decline => Self::CallDeclined(payload),
            CallAction::End => Self::CallEnded(payload),
            CallAction::Timeout => Self::CallMissed(payload),
        }
    }
}

/// Commands sent FROM client TO server over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Prove an owner identity with a bearer token; joins the owner's room.
    Identify { token: String },

    /// Join the room of a chat session. Strangers prove the session with its
    /// token; identified owners may join any session on their own tags.
    JoinSession {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "strangerToken", default)]
        stranger_token: Option<String>,
    },

    /// Leave a session room (data is the session id).
    LeaveSession(String),

    WebrtcOffer(Value),
    WebrtcAnswer(Value),
    WebrtcIceCandidate(Value),
}

impl ClientCommand {
    /// Splits a signaling command into its kind and payload.
    pub fn into_signal(self) -> Option<(SignalKind, Value)> {
        match self {
            Self::WebrtcOffer(v) => Some((SignalKind::Offer, v)),
            Self::WebrtcAnswer(v) => Some((SignalKind::Answer, v)),
            Self::WebrtcIceCandidate(v) => Some((SignalKind::IceCandidate, v)),
            _ => None,
        }
    }
}

/// Room a signaling payload is addressed to (its `sessionId` field).
pub fn signal_room(payload: &Value) -> Option<&str> {
    payload.get("sessionId").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_event_name_carries_owner() {
        let owner_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let event = RoomEvent::QrScanned {
            owner_id,
            payload: QrScannedPayload {
                qr_id: Uuid::new_v4(),
                session_id,
                purpose: "Pet Tag".into(),
            },
        };

        let frame: Frame = serde_json::from_str(&event.to_frame().unwrap()).unwrap();
        assert_eq!(frame.event, format!("qr_scanned_{}", owner_id));
        assert_eq!(frame.data["sessionId"], session_id.to_string());
        assert_eq!(frame.data["purpose"], "Pet Tag");
    }

    #[test]
    fn client_commands_parse_from_socket_frames() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"event":"join_session","data":{"sessionId":"abc","strangerToken":"t"}}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            ClientCommand::JoinSession { ref session_id, stranger_token: Some(ref t) }
                if session_id == "abc" && t == "t"
        ));

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"event":"join_session","data":{"sessionId":"abc"}}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::JoinSession { stranger_token: None, .. }));

        let cmd: ClientCommand = serde_json::from_str(
            r#"{"event":"webrtc_ice_candidate","data":{"sessionId":"abc","candidate":"x"}}"#,
        )
        .unwrap();
        let (kind, payload) = cmd.into_signal().unwrap();
        assert_eq!(kind, SignalKind::IceCandidate);
        assert_eq!(signal_room(&payload), Some("abc"));
    }

    #[test]
    fn hanging_up_is_call_ended_even_when_missed() {
        let payload = CallEventPayload {
            call_id: Uuid::new_v4(),
            qr_id: Uuid::new_v4(),
            session_id: None,
            caller_id: "session".into(),
            callee_id: "owner".into(),
            status: CallStatus::Missed,
        };

        let ended = RoomEvent::for_call_action(CallAction::End, payload.clone());
        assert_eq!(ended.name(), "call_ended");
        assert_eq!(ended.data().unwrap()["status"], "missed");

        assert_eq!(RoomEvent::for_call_action(CallAction::Timeout, payload).name(), "call_missed");
    }
}
