//! Row types. Status-like columns stay `TEXT` in the database and `String`
//! here; the typed views live in `omc-core` and are parsed at the edges that
//! care (`MessageStatus::parse`, etc).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub phone_number_id: String,
    pub business_id: String,
    pub access_token: String,
    pub display_name: String,
}

impl Account {
    pub fn creds(&self) -> omc_core::AccountCreds {
        omc_core::AccountCreds {
            phone_number_id: self.phone_number_id.clone(),
            access_token: self.access_token.clone(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Contact {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub account_id: Uuid,
    pub phone: String,
    pub name: String,
    pub assigned_agent_id: Option<Uuid>,
    pub unread_count: i32,
    pub last_message_at: Option<OffsetDateTime>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub account_id: Uuid,
    pub contact_id: Uuid,
    pub direction: String,
    pub message_type: String,
    pub content: String,
    pub media_url: String,
    pub provider_message_id: String,
    pub status: String,
    pub error: String,
    pub sent_by_user_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChatbotSession {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub contact_id: Uuid,
    pub current_flow_id: Option<Uuid>,
    pub current_step_id: Option<String>,
    pub variables: Value,
    pub last_activity_at: OffsetDateTime,
}

#[derive(Debug, Clone, FromRow)]
pub struct KeywordRule {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub keywords: Vec<String>,
    pub match_type: String,
    pub priority: i32,
    pub enabled: bool,
    pub response_type: String,
    pub response_text: String,
    pub buttons: Option<Value>,
    pub transfer_team_id: Option<Uuid>,
    pub farewell_text: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, FromRow)]
pub struct AiContext {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub always_on: bool,
    pub trigger_keywords: Vec<String>,
    pub prompt: String,
    pub api_url: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChatbotFlow {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub trigger_keywords: Vec<String>,
    pub enabled: bool,
    pub steps: Value,
}

#[derive(Debug, Clone, FromRow)]
pub struct AgentTransfer {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub contact_id: Uuid,
    pub source: String,
    pub reason: String,
    pub status: String,
    pub agent_id: Option<Uuid>,
    pub team_id: Option<Uuid>,
    pub transferred_at: OffsetDateTime,
    pub assigned_at: Option<OffsetDateTime>,
    pub resumed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub account_id: Uuid,
    pub name: String,
    pub template_name: String,
    pub template_language: String,
    pub header_media_local_path: String,
    pub status: String,
    pub total_count: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub read_count: i32,
    pub failed_count: i32,
}

#[derive(Debug, Clone, FromRow)]
pub struct CampaignRecipient {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub campaign_id: Uuid,
    pub phone: String,
    pub variables: Value,
    pub content_hash: String,
    pub status: String,
    pub provider_message_id: String,
    pub error: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Webhook {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub url: String,
    pub events: Vec<String>,
    pub headers: Value,
    pub secret: String,
    pub is_active: bool,
}

impl Webhook {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }

    /// Configured custom headers as name/value pairs; non-string values in
    /// the JSON object are skipped.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,
    pub url: String,
    pub headers: Value,
    pub secret: String,
    pub payload: Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub next_attempt_at: OffsetDateTime,
    pub processing_started_at: Option<OffsetDateTime>,
    pub delivered_at: Option<OffsetDateTime>,
    pub last_error: String,
    pub last_status_code: i32,
}

impl WebhookDelivery {
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub name: String,
    pub role_id: Option<Uuid>,
    pub is_super_admin: bool,
    pub is_active: bool,
    pub availability: String,
    pub break_started_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Team {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub strategy: String,
    pub rr_cursor: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrgSettings {
    pub organization_id: Uuid,
    pub ai_enabled: bool,
    pub fallback_reply: String,
    pub session_idle_minutes: i32,
    pub auto_delete_media_enabled: bool,
    pub auto_delete_media_days: i32,
}

impl OrgSettings {
    pub fn defaults(organization_id: Uuid) -> Self {
        Self {
            organization_id,
            ai_enabled: false,
            fallback_reply: String::new(),
            session_idle_minutes: 30,
            auto_delete_media_enabled: false,
            auto_delete_media_days: 30,
        }
    }
}
