use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Wire envelope for both directions of the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl WsMessage {
    pub fn new(message_type: &str, payload: Value) -> Self {
        Self {
            message_type: message_type.to_string(),
            payload,
        }
    }
}

// Server → client event types.
pub const TYPE_NEW_MESSAGE: &str = "new_message";
pub const TYPE_STATUS_UPDATE: &str = "status_update";
pub const TYPE_CONTACT_UPDATE: &str = "contact_update";
pub const TYPE_AGENT_TRANSFER: &str = "agent_transfer";
pub const TYPE_AGENT_TRANSFER_RESUME: &str = "agent_transfer_resume";
pub const TYPE_AGENT_TRANSFER_ASSIGN: &str = "agent_transfer_assign";
pub const TYPE_CAMPAIGN_STATS_UPDATE: &str = "campaign_stats_update";
pub const TYPE_PERMISSIONS_UPDATED: &str = "permissions_updated";
pub const TYPE_CONVERSATION_NOTE_CREATED: &str = "conversation_note_created";
pub const TYPE_CONVERSATION_NOTE_UPDATED: &str = "conversation_note_updated";
pub const TYPE_CONVERSATION_NOTE_DELETED: &str = "conversation_note_deleted";
pub const TYPE_PING: &str = "ping";

// Client → server frame types.
pub const TYPE_PONG: &str = "pong";
pub const TYPE_SET_CONTACT: &str = "set_contact";

/// A targeted broadcast. Tenant must always match; `user_id` narrows to one
/// user's clients, `contact_id` to clients currently viewing that contact;
/// both set means the intersection.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub message: WsMessage,
}

impl Broadcast {
    pub fn tenant(org_id: Uuid, message: WsMessage) -> Self {
        Self {
            org_id,
            user_id: None,
            contact_id: None,
            message,
        }
    }

    pub fn user(org_id: Uuid, user_id: Uuid, message: WsMessage) -> Self {
        Self {
            org_id,
            user_id: Some(user_id),
            contact_id: None,
            message,
        }
    }
}

/// Payload for client `set_contact` frames.
#[derive(Debug, Deserialize)]
pub struct SetContactPayload {
    pub contact_id: Option<Uuid>,
}
