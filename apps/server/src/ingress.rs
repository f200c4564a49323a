//! Provider webhook ingress: challenge verification, signature check over
//! the raw body, normalization, dedup insert, fan-out, and handoff to the
//! automation pipeline.
//!
//! Body parsing failures after a valid signature still return 200 so the
//! provider does not disable the subscription over one malformed event.

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use omc_core::{
    verify_signature, InboundEvent, InboundKind, MessageStatus, WebhookEvent,
};
use omc_hub::{Broadcast, WsMessage, TYPE_CONTACT_UPDATE, TYPE_NEW_MESSAGE, TYPE_STATUS_UPDATE};
use omc_storage::messages::NewMessage;
use serde::Deserialize;
use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::state::AppState;

const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

#[derive(Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// `GET /webhook`: the provider's subscription challenge.
pub async fn verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> impl IntoResponse {
    if query.mode.as_deref() == Some("subscribe")
        && query.token.as_deref() == Some(state.config.verify_token.as_str())
    {
        (StatusCode::OK, query.challenge.unwrap_or_default())
    } else {
        (StatusCode::FORBIDDEN, "forbidden".to_string())
    }
}

/// `POST /webhook`: signature-checked event intake.
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_signature(&state.config.app_secret, &body, signature) {
        tracing::warn!("invalid webhook signature");
        return StatusCode::UNAUTHORIZED;
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "undecodable webhook payload");
            return StatusCode::OK;
        }
    };

    for message in extract_messages(&payload) {
        if let Err(err) = process_message(&state, message).await {
            tracing::error!(error = %err, "inbound message processing failed");
        }
    }
    for status in extract_statuses(&payload) {
        if let Err(err) = process_status(&state, status).await {
            tracing::error!(error = %err, "status update processing failed");
        }
    }

    StatusCode::OK
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

#[derive(Debug, Clone)]
struct NormalizedMessage {
    phone_number_id: String,
    from: String,
    profile_name: String,
    provider_message_id: String,
    kind: InboundKind,
    timestamp: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct NormalizedStatus {
    phone_number_id: String,
    provider_message_id: String,
    status: String,
    error: String,
}

async fn process_message(state: &AppState, msg: NormalizedMessage) -> omc_core::Result<()> {
    let Some(account) = state
        .store
        .account_by_phone_number_id(&msg.phone_number_id)
        .await?
    else {
        tracing::warn!(phone_number_id = %msg.phone_number_id, "webhook for unknown account");
        return Ok(());
    };
    let org_id = account.organization_id;

    let (contact, created) = state
        .store
        .upsert_contact(org_id, account.id, &msg.from, &msg.profile_name)
        .await?;
    if created {
        state
            .outbox
            .dispatch(
                org_id,
                WebhookEvent::ContactCreated,
                json!({
                    "contact_id": contact.id,
                    "contact_phone": contact.phone,
                    "contact_name": contact.name,
                    "whatsapp_account": account.display_name,
                }),
            )
            .await;
    }

    let (message_type, content, media_url) = describe_kind(&msg.kind);
    let raw_payload = match &msg.kind {
        InboundKind::Unknown { raw } => Some(raw.clone()),
        _ => None,
    };
    let inserted = state
        .store
        .insert_message(NewMessage {
            organization_id: org_id,
            account_id: account.id,
            contact_id: contact.id,
            direction: "inbound",
            message_type,
            content: &content,
            media_url: &media_url,
            provider_message_id: &msg.provider_message_id,
            status: MessageStatus::Delivered,
            error: "",
            payload: raw_payload.as_ref(),
            sent_by_user_id: None,
        })
        .await?;

    // The uniqueness constraint is the dedup authority: a second delivery of
    // the same provider id inserts nothing, and ingress stays idempotent.
    let Some(message_id) = inserted else {
        tracing::debug!(
            provider_message_id = %msg.provider_message_id,
            "duplicate webhook delivery ignored"
        );
        return Ok(());
    };

    state.store.bump_unread(contact.id, msg.timestamp).await?;

    // read receipt is best-effort and must not hold up ingress
    {
        let provider = state.provider.clone();
        let creds = account.creds();
        let provider_message_id = msg.provider_message_id.clone();
        tokio::spawn(async move {
            if let Err(err) = provider.mark_read(&creds, &provider_message_id).await {
                tracing::debug!(error = %err, "mark-as-read failed");
            }
        });
    }

    state
        .hub
        .broadcast(Broadcast {
            org_id,
            user_id: None,
            contact_id: Some(contact.id),
            message: WsMessage::new(
                TYPE_NEW_MESSAGE,
                json!({
                    "message_id": message_id,
                    "contact_id": contact.id,
                    "direction": "inbound",
                    "message_type": message_type,
                    "content": content,
                    "status": MessageStatus::Delivered.as_str(),
                }),
            ),
        })
        .await;
    state
        .hub
        .broadcast(Broadcast::tenant(
            org_id,
            WsMessage::new(
                TYPE_CONTACT_UPDATE,
                json!({
                    "contact_id": contact.id,
                    "contact_phone": contact.phone,
                    "unread_count": contact.unread_count + 1,
                    "last_message_at": msg.timestamp.unix_timestamp(),
                }),
            ),
        ))
        .await;

    state
        .outbox
        .dispatch(
            org_id,
            WebhookEvent::MessageIncoming,
            json!({
                "message_id": message_id,
                "contact_id": contact.id,
                "contact_phone": contact.phone,
                "contact_name": contact.name,
                "message_type": message_type,
                "content": content,
                "whatsapp_account": account.display_name,
                "direction": "inbound",
            }),
        )
        .await;

    let event = InboundEvent {
        org_id,
        account_id: account.id,
        contact_id: contact.id,
        contact_phone: contact.phone.clone(),
        message_id,
        provider_message_id: msg.provider_message_id.clone(),
        kind: msg.kind.clone(),
        timestamp: msg.timestamp,
    };
    // ingress returns 200 once the row is durable; a full pipeline queue
    // sheds automation rather than back-pressuring the provider
    if let Err(err) = state.pipeline_tx.try_send(event) {
        tracing::warn!(error = %err, contact = %contact.id, "pipeline queue full; automation skipped");
        metrics::counter!("pipeline_shed", 1);
    }
    Ok(())
}

async fn process_status(state: &AppState, status: NormalizedStatus) -> omc_core::Result<()> {
    let Some(parsed) = MessageStatus::parse(&status.status) else {
        tracing::debug!(status = %status.status, "unknown provider status");
        return Ok(());
    };
    let Some(account) = state
        .store
        .account_by_phone_number_id(&status.phone_number_id)
        .await?
    else {
        return Ok(());
    };

    let updated = state
        .store
        .update_message_status(
            account.id,
            &status.provider_message_id,
            parsed,
            &status.error,
        )
        .await?;
    if let Some(message) = updated {
        state
            .hub
            .broadcast(Broadcast::tenant(
                message.organization_id,
                WsMessage::new(
                    TYPE_STATUS_UPDATE,
                    json!({
                        "message_id": message.id,
                        "contact_id": message.contact_id,
                        "status": parsed.as_str(),
                    }),
                ),
            ))
            .await;
    }

    // campaign sends report through the same status stream
    state
        .store
        .record_recipient_status(&status.provider_message_id, parsed.as_str())
        .await?;
    Ok(())
}

fn describe_kind(kind: &InboundKind) -> (&'static str, String, String) {
    match kind {
        InboundKind::Text { body } => ("text", body.clone(), String::new()),
        InboundKind::InteractiveReply { title, .. } => ("interactive", title.clone(), String::new()),
        InboundKind::Media {
            media_type,
            media_id,
            caption,
        } => (
            "media",
            caption.clone().unwrap_or_else(|| format!("[{media_type}]")),
            media_id.clone(),
        ),
        InboundKind::Unknown { .. } => ("text", String::new(), String::new()),
    }
}

fn extract_messages(payload: &Value) -> Vec<NormalizedMessage> {
    let mut out = Vec::new();
    for value in change_values(payload) {
        let phone_number_id = value
            .pointer("/metadata/phone_number_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(messages) = value.get("messages").and_then(Value::as_array) else {
            continue;
        };
        for message in messages {
            if let Some(normalized) = normalize_message(&phone_number_id, value, message) {
                out.push(normalized);
            }
        }
    }
    out
}

fn normalize_message(
    phone_number_id: &str,
    change_value: &Value,
    message: &Value,
) -> Option<NormalizedMessage> {
    let from = message.get("from")?.as_str()?.to_string();
    let provider_message_id = message.get("id")?.as_str()?.to_string();
    let timestamp = message
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);

    let profile_name = change_value
        .get("contacts")
        .and_then(Value::as_array)
        .and_then(|contacts| {
            contacts
                .iter()
                .find(|c| c.get("wa_id").and_then(Value::as_str) == Some(from.as_str()))
        })
        .and_then(|c| c.pointer("/profile/name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let message_type = message.get("type").and_then(Value::as_str).unwrap_or("");
    let kind = match message_type {
        "text" => InboundKind::Text {
            body: message
                .pointer("/text/body")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        "interactive" => {
            let reply = message
                .pointer("/interactive/button_reply")
                .or_else(|| message.pointer("/interactive/list_reply"))?;
            InboundKind::InteractiveReply {
                reply_id: reply.get("id")?.as_str()?.to_string(),
                title: reply
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }
        }
        media @ ("image" | "audio" | "video" | "document" | "sticker") => {
            let body = message.get(media)?;
            InboundKind::Media {
                media_type: media.to_string(),
                media_id: body
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                caption: body
                    .get("caption")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        }
        _ => InboundKind::Unknown {
            raw: message.clone(),
        },
    };

    Some(NormalizedMessage {
        phone_number_id: phone_number_id.to_string(),
        from,
        profile_name,
        provider_message_id,
        kind,
        timestamp,
    })
}

fn extract_statuses(payload: &Value) -> Vec<NormalizedStatus> {
    let mut out = Vec::new();
    for value in change_values(payload) {
        let phone_number_id = value
            .pointer("/metadata/phone_number_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(statuses) = value.get("statuses").and_then(Value::as_array) else {
            continue;
        };
        for status in statuses {
            let (Some(id), Some(name)) = (
                status.get("id").and_then(Value::as_str),
                status.get("status").and_then(Value::as_str),
            ) else {
                continue;
            };
            let error = status
                .pointer("/errors/0/message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            out.push(NormalizedStatus {
                phone_number_id: phone_number_id.clone(),
                provider_message_id: id.to_string(),
                status: name.to_string(),
                error,
            });
        }
    }
    out
}

fn change_values(payload: &Value) -> Vec<&Value> {
    let mut out = Vec::new();
    let Some(entries) = payload.get("entry").and_then(Value::as_array) else {
        return out;
    };
    for entry in entries {
        let Some(changes) = entry.get("changes").and_then(Value::as_array) else {
            continue;
        };
        for change in changes {
            if let Some(value) = change.get("value") {
                out.push(value);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_payload() -> Value {
        json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": { "display_phone_number": "15550001111", "phone_number_id": "pn-1" },
                        "contacts": [{ "profile": { "name": "Ada" }, "wa_id": "5511999" }],
                        "messages": [{
                            "from": "5511999",
                            "id": "wamid.abc",
                            "timestamp": "1700000000",
                            "type": "text",
                            "text": { "body": "Hi there" }
                        }]
                    }
                }]
            }]
        })
    }

    #[test]
    fn extracts_text_message_with_profile_name() {
        let messages = extract_messages(&sample_payload());
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.phone_number_id, "pn-1");
        assert_eq!(msg.from, "5511999");
        assert_eq!(msg.profile_name, "Ada");
        assert_eq!(msg.provider_message_id, "wamid.abc");
        assert_eq!(
            msg.kind,
            InboundKind::Text {
                body: "Hi there".into()
            }
        );
        assert_eq!(msg.timestamp.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn extracts_interactive_button_reply() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "metadata": { "phone_number_id": "pn-1" },
                "messages": [{
                    "from": "5511999",
                    "id": "wamid.btn",
                    "timestamp": "1700000001",
                    "type": "interactive",
                    "interactive": {
                        "type": "button_reply",
                        "button_reply": { "id": "opt_billing", "title": "Billing" }
                    }
                }]
            }}]}]
        });
        let messages = extract_messages(&payload);
        assert_eq!(
            messages[0].kind,
            InboundKind::InteractiveReply {
                reply_id: "opt_billing".into(),
                title: "Billing".into()
            }
        );
    }

    #[test]
    fn unknown_types_are_preserved_as_raw() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "metadata": { "phone_number_id": "pn-1" },
                "messages": [{
                    "from": "5511999",
                    "id": "wamid.loc",
                    "timestamp": "1700000002",
                    "type": "location",
                    "location": { "latitude": 1.0, "longitude": 2.0 }
                }]
            }}]}]
        });
        let messages = extract_messages(&payload);
        assert!(matches!(messages[0].kind, InboundKind::Unknown { .. }));
    }

    #[test]
    fn extracts_statuses_with_errors() {
        let payload = json!({
            "entry": [{ "changes": [{ "value": {
                "metadata": { "phone_number_id": "pn-1" },
                "statuses": [
                    { "id": "wamid.abc", "status": "delivered" },
                    { "id": "wamid.def", "status": "failed",
                      "errors": [{ "message": "recipient opted out" }] }
                ]
            }}]}]
        });
        let statuses = extract_statuses(&payload);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].status, "delivered");
        assert_eq!(statuses[1].error, "recipient opted out");
    }

    #[test]
    fn malformed_payload_yields_nothing() {
        assert!(extract_messages(&json!({"object": "whatsapp"})).is_empty());
        assert!(extract_statuses(&json!([1, 2, 3])).is_empty());
    }
}
