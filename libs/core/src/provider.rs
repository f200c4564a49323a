//! Narrow capability interfaces to the chat provider and the AI provider,
//! plus the production Cloud API client. Tests substitute in-memory fakes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};

/// Credentials for one provider channel. Identity is immutable; the token is
/// revocable and re-read from storage per send.
#[derive(Debug, Clone)]
pub struct AccountCreds {
    pub phone_number_id: String,
    pub access_token: String,
}

/// One inline reply button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub id: String,
    pub title: String,
}

pub const MAX_BUTTONS: usize = 10;
const BUTTON_TITLE_LIMIT: usize = 20;
const LIST_ROW_TITLE_LIMIT: usize = 24;

/// Outbound sends against the chat provider. Implementations return the
/// provider message id for delivery-status correlation.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn send_text(&self, account: &AccountCreds, to: &str, body: &str) -> Result<String>;

    /// Up to three buttons render as reply buttons; four to ten render as a
    /// list. Titles are truncated to the provider's per-format limit.
    async fn send_buttons(
        &self,
        account: &AccountCreds,
        to: &str,
        body: &str,
        buttons: &[Button],
    ) -> Result<String>;

    async fn send_template(
        &self,
        account: &AccountCreds,
        to: &str,
        template_name: &str,
        language: &str,
        body_params: &[String],
    ) -> Result<String>;

    /// Best-effort read receipt for an inbound provider message.
    async fn mark_read(&self, account: &AccountCreds, provider_message_id: &str) -> Result<()>;
}

/// Composes a reply from a prompt assembled by the automation pipeline.
#[async_trait]
pub trait AiResponder: Send + Sync {
    async fn respond(&self, prompt: &str) -> Result<String>;
}

/// HTTP client against the WhatsApp-family Cloud API.
#[derive(Clone)]
pub struct CloudApiClient {
    http: reqwest::Client,
    api_base: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    messages: Vec<ApiMessageId>,
}

#[derive(Deserialize)]
struct ApiMessageId {
    id: String,
}

impl CloudApiClient {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into(),
        }
    }

    fn messages_url(&self, account: &AccountCreds) -> String {
        format!(
            "{}/v19.0/{}/messages",
            self.api_base.trim_end_matches('/'),
            account.phone_number_id
        )
    }

    async fn post_messages(
        &self,
        account: &AccountCreds,
        payload: serde_json::Value,
    ) -> Result<String> {
        let response = self
            .http
            .post(self.messages_url(account))
            .bearer_auth(&account.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| Error::upstream("provider request failed").with_source(err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "provider send rejected");
            return Err(Error::upstream(format!("provider returned {status}")));
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|err| Error::upstream("provider response decode failed").with_source(err))?;
        parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| Error::upstream("no message id in provider response"))
    }
}

#[async_trait]
impl ChatProvider for CloudApiClient {
    async fn send_text(&self, account: &AccountCreds, to: &str, body: &str) -> Result<String> {
        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": body }
        });
        self.post_messages(account, payload).await
    }

    async fn send_buttons(
        &self,
        account: &AccountCreds,
        to: &str,
        body: &str,
        buttons: &[Button],
    ) -> Result<String> {
        if buttons.is_empty() {
            return Err(Error::invalid_input("at least one button is required"));
        }
        if buttons.len() > MAX_BUTTONS {
            return Err(Error::invalid_input(format!(
                "maximum {MAX_BUTTONS} buttons allowed"
            )));
        }

        let interactive = if buttons.len() <= 3 {
            json!({
                "type": "button",
                "body": { "text": body },
                "action": {
                    "buttons": buttons.iter().map(|b| json!({
                        "type": "reply",
                        "reply": {
                            "id": b.id,
                            "title": truncate_title(&b.title, BUTTON_TITLE_LIMIT),
                        }
                    })).collect::<Vec<_>>()
                }
            })
        } else {
            json!({
                "type": "list",
                "body": { "text": body },
                "action": {
                    "button": "Select an option",
                    "sections": [{
                        "title": "Options",
                        "rows": buttons.iter().map(|b| json!({
                            "id": b.id,
                            "title": truncate_title(&b.title, LIST_ROW_TITLE_LIMIT),
                        })).collect::<Vec<_>>()
                    }]
                }
            })
        };

        let payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "interactive",
            "interactive": interactive,
        });
        self.post_messages(account, payload).await
    }

    async fn send_template(
        &self,
        account: &AccountCreds,
        to: &str,
        template_name: &str,
        language: &str,
        body_params: &[String],
    ) -> Result<String> {
        let mut template = json!({
            "name": template_name,
            "language": { "code": language },
        });
        if !body_params.is_empty() {
            template["components"] = json!([{
                "type": "body",
                "parameters": body_params.iter().map(|p| json!({
                    "type": "text",
                    "text": p,
                })).collect::<Vec<_>>()
            }]);
        }

        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "template",
            "template": template,
        });
        self.post_messages(account, payload).await
    }

    async fn mark_read(&self, account: &AccountCreds, provider_message_id: &str) -> Result<()> {
        let payload = json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": provider_message_id,
        });
        let response = self
            .http
            .post(self.messages_url(account))
            .bearer_auth(&account.access_token)
            .json(&payload)
            .send()
            .await
            .map_err(|err| Error::upstream("provider request failed").with_source(err))?;
        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "mark-as-read rejected");
        }
        Ok(())
    }
}

fn truncate_title(title: &str, limit: usize) -> String {
    if title.chars().count() <= limit {
        return title.to_string();
    }
    title.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_truncation_respects_char_boundaries() {
        assert_eq!(truncate_title("short", 20), "short");
        let long = "a".repeat(25);
        assert_eq!(truncate_title(&long, 20).len(), 20);
        let accented = "ééééééééééééééééééééééééé";
        assert_eq!(truncate_title(accented, 24).chars().count(), 24);
    }

    #[test]
    fn messages_url_is_account_scoped() {
        let client = CloudApiClient::new(reqwest::Client::new(), "https://graph.example.com/");
        let account = AccountCreds {
            phone_number_id: "123".into(),
            access_token: "tok".into(),
        };
        assert_eq!(
            client.messages_url(&account),
            "https://graph.example.com/v19.0/123/messages"
        );
    }
}
