use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Message payload families the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Interactive,
    Template,
    Flow,
    Media,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Interactive => "interactive",
            MessageType::Template => "template",
            MessageType::Flow => "flow",
            MessageType::Media => "media",
        }
    }
}

/// Delivery status reported by the provider.
///
/// Transitions are monotonically non-decreasing in the order
/// `queued < sent < delivered < read`; `failed` is terminal and reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(MessageStatus::Queued),
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    fn rank(self) -> u8 {
        match self {
            MessageStatus::Queued => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    /// Whether moving from `self` to `next` is a legal status update.
    pub fn allows(self, next: MessageStatus) -> bool {
        if self == MessageStatus::Failed {
            return false;
        }
        if next == MessageStatus::Failed {
            return true;
        }
        next.rank() >= self.rank()
    }
}

/// Inbound payload variants the pipeline inspects. Anything else is kept as
/// raw JSON so it can be forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundKind {
    Text {
        body: String,
    },
    InteractiveReply {
        reply_id: String,
        title: String,
    },
    Media {
        media_type: String,
        media_id: String,
        caption: Option<String>,
    },
    Unknown {
        raw: Value,
    },
}

/// A provider message after verification and normalization, the unit of work
/// the automation pipeline consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub org_id: Uuid,
    pub account_id: Uuid,
    pub contact_id: Uuid,
    pub contact_phone: String,
    pub message_id: Uuid,
    pub provider_message_id: String,
    pub kind: InboundKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl InboundEvent {
    /// The text the cascade matches against: message body for text messages,
    /// the pressed button's id for interactive replies.
    pub fn match_text(&self) -> Option<&str> {
        match &self.kind {
            InboundKind::Text { body } => Some(body),
            InboundKind::InteractiveReply { reply_id, .. } => Some(reply_id),
            _ => None,
        }
    }

    pub fn interactive_reply(&self) -> Option<(&str, &str)> {
        match &self.kind {
            InboundKind::InteractiveReply { reply_id, title } => Some((reply_id, title)),
            _ => None,
        }
    }
}

/// Outbound subscriber event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEvent {
    MessageIncoming,
    MessageSent,
    ContactCreated,
    TransferCreated,
    TransferAssigned,
    TransferResumed,
}

impl WebhookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookEvent::MessageIncoming => "message_incoming",
            WebhookEvent::MessageSent => "message_sent",
            WebhookEvent::ContactCreated => "contact_created",
            WebhookEvent::TransferCreated => "transfer_created",
            WebhookEvent::TransferAssigned => "transfer_assigned",
            WebhookEvent::TransferResumed => "transfer_resumed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_transitions_are_monotonic() {
        assert!(MessageStatus::Queued.allows(MessageStatus::Sent));
        assert!(MessageStatus::Sent.allows(MessageStatus::Read));
        assert!(MessageStatus::Read.allows(MessageStatus::Read));
        assert!(!MessageStatus::Delivered.allows(MessageStatus::Sent));
        assert!(!MessageStatus::Read.allows(MessageStatus::Queued));
    }

    #[test]
    fn failed_is_terminal() {
        assert!(MessageStatus::Sent.allows(MessageStatus::Failed));
        assert!(!MessageStatus::Failed.allows(MessageStatus::Sent));
        assert!(!MessageStatus::Failed.allows(MessageStatus::Read));
    }

    #[test]
    fn match_text_prefers_reply_id() {
        let event = InboundEvent {
            org_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            contact_id: Uuid::new_v4(),
            contact_phone: "5511999".into(),
            message_id: Uuid::new_v4(),
            provider_message_id: "wamid.1".into(),
            kind: InboundKind::InteractiveReply {
                reply_id: "opt_billing".into(),
                title: "Billing".into(),
            },
            timestamp: OffsetDateTime::now_utc(),
        };
        assert_eq!(event.match_text(), Some("opt_billing"));
    }

    #[test]
    fn unknown_kind_round_trips_raw_json() {
        let kind = InboundKind::Unknown {
            raw: json!({"sticker": {"id": "123"}}),
        };
        let encoded = serde_json::to_string(&kind).unwrap();
        let decoded: InboundKind = serde_json::from_str(&encoded).unwrap();
        assert_eq!(kind, decoded);
    }
}
