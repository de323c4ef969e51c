use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Returned when a stored or submitted string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Enums that are stored as TEXT columns. The string form is the same one
/// serde uses on the wire.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident as $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

text_enum! {
    /// Lifecycle of a printed tag. Codes start inactive and become active once paid for.
    QrStatus as "qr status" {
        Inactive => "inactive",
        Active => "active",
        Expired => "expired",
    }
}

text_enum! {
    Purpose as "purpose" {
        FourWheeler => "four_wheeler",
        TwoWheeler => "two_wheeler",
        Bag => "bag",
        Key => "key",
        Child => "child",
        Elderly => "elderly",
        Pet => "pet",
        Custom => "custom",
    }
}

impl Purpose {
    /// Maps the template names the mobile app offers onto a purpose.
    /// Anything unrecognised is a custom tag.
    pub fn from_template(template: &str) -> Self {
        match template {
            "Four-Wheeler" => Self::FourWheeler,
            "Two-Wheeler" => Self::TwoWheeler,
            "Bag" => Self::Bag,
            "Key" => Self::Key,
            "Child Safety" => Self::Child,
            "Elderly Care" => Self::Elderly,
            "Pet Tag" => Self::Pet,
            _ => Self::Custom,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::FourWheeler => "Four-Wheeler",
            Self::TwoWheeler => "Two-Wheeler",
            Self::Bag => "Bag",
            Self::Key => "Key",
            Self::Child => "Child Safety",
            Self::Elderly => "Elderly Care",
            Self::Pet => "Pet Tag",
            Self::Custom => "Custom",
        }
    }
}

text_enum! {
    SenderRole as "sender role" {
        Owner => "owner",
        Stranger => "stranger",
    }
}

text_enum! {
    MessageKind as "message type" {
        Text => "text",
        Voice => "voice",
        Location => "location",
        System => "system",
    }
}

text_enum! {
    /// Call lifecycle.
    ///
    /// ```text
    /// Ringing ──► Connected ──► Ended
    ///    ├──────► Declined
    ///    └──────► Missed
    /// ```
    ///
    /// Ended, Declined and Missed are terminal.
    CallStatus as "call status" {
        Ringing => "ringing",
        Connected => "connected",
        Declined => "declined",
        Ended => "ended",
        Missed => "missed",
    }
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Declined | Self::Missed)
    }

    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (Self::Ringing, Self::Connected)
                | (Self::Ringing, Self::Declined)
                | (Self::Ringing, Self::Missed)
                | (Self::Connected, Self::Ended)
        )
    }
}

/// A participant-driven request to move a call along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    Accept,
    Decline,
    End,
    /// Nobody picked up within the ring window.
    Timeout,
}

impl CallAction {
    /// The status `from` moves to under this action, or `None` if the action
    /// is not allowed from `from`.
    ///
    /// Hanging up a call that never connected leaves it missed rather than
    /// ended, so `ended` always means a conversation took place and a ringing
    /// call only ever resolves to connected, declined or missed. The socket
    /// event for a hang-up is still `call_ended` (see `RoomEvent::for_call_action`).
    pub fn target(&self, from: CallStatus) -> Option<CallStatus> {
        let next = match (self, from) {
            (Self::Accept, _) => CallStatus::Connected,
            (Self::Decline, _) => CallStatus::Declined,
            (Self::End, CallStatus::Ringing) => CallStatus::Missed,
            (Self::End, _) => CallStatus::Ended,
            (Self::Timeout, _) => CallStatus::Missed,
        };
        from.can_transition_to(next).then_some(next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
            Self::End => "end",
            Self::Timeout => "timeout",
        }
    }
}

text_enum! {
    /// Outcome of the out-of-band fallback (e.g. a phone call) after the
    /// in-app call failed.
    EscalationResult as "escalation result" {
        Answered => "answered",
        Missed => "missed",
        NotAttempted => "not_attempted",
    }
}

text_enum! {
    NotificationKind as "notification type" {
        QrScanned => "qr_scanned",
        MissedCall => "missed_call",
        CallDeclined => "call_declined",
        OrderPaid => "order_paid",
    }
}

text_enum! {
    OrderType as "order type" {
        Pdf => "pdf",
        Sticker => "sticker",
    }
}

text_enum! {
    OrderStatus as "order status" {
        Pending => "pending",
        Paid => "paid",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CallStatus; 5] = [
        CallStatus::Ringing,
        CallStatus::Connected,
        CallStatus::Declined,
        CallStatus::Ended,
        CallStatus::Missed,
    ];

    #[test]
    fn only_documented_transitions_are_allowed() {
        let allowed = [
            (CallStatus::Ringing, CallStatus::Connected),
            (CallStatus::Ringing, CallStatus::Declined),
            (CallStatus::Ringing, CallStatus::Missed),
            (CallStatus::Connected, CallStatus::Ended),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_accept_no_action() {
        for from in ALL.into_iter().filter(CallStatus::is_terminal) {
            for action in [CallAction::Accept, CallAction::Decline, CallAction::End, CallAction::Timeout] {
                assert_eq!(action.target(from), None, "{:?} from {from}", action);
            }
        }
    }

    #[test]
    fn hanging_up_while_ringing_is_missed() {
        assert_eq!(CallAction::End.target(CallStatus::Ringing), Some(CallStatus::Missed));
        assert_eq!(CallAction::End.target(CallStatus::Connected), Some(CallStatus::Ended));
        assert_eq!(CallAction::Accept.target(CallStatus::Connected), None);
    }

    #[test]
    fn template_names_map_to_purposes() {
        assert_eq!(Purpose::from_template("Pet Tag"), Purpose::Pet);
        assert_eq!(Purpose::from_template("Four-Wheeler"), Purpose::FourWheeler);
        assert_eq!(Purpose::from_template("Spaceship"), Purpose::Custom);
    }

    #[test]
    fn text_form_matches_serde() {
        assert_eq!("not_attempted".parse::<EscalationResult>(), Ok(EscalationResult::NotAttempted));
        assert_eq!(
            serde_json::to_string(&EscalationResult::NotAttempted).unwrap(),
            "\"not_attempted\""
        );
        assert!("sideways".parse::<QrStatus>().is_err());
    }
}
