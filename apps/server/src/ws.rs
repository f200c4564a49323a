//! WebSocket endpoint: token-authenticated upgrade, origin allow-list, and
//! the per-connection read/write pumps feeding the hub.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use omc_hub::{ClientId, SetContactPayload, WsMessage, TYPE_PING, TYPE_PONG, TYPE_SET_CONTACT};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::state::AppState;

/// Client → server availability toggle frame.
const TYPE_SET_AVAILABILITY: &str = "set_availability";

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get("Origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !origin_allowed(&state.config.ws_allowed_origins, origin) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let Some(token) = query.token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };
    let claims = match state.signer.verify(&token) {
        Ok(claims) => claims,
        Err(err) => {
            tracing::warn!(error = %err, "ws auth failed");
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    ws.on_upgrade(move |socket| client_session(state, socket, claims.sub, claims.org))
}

/// Empty allow-list admits every origin (including absent headers); a
/// configured list is exact-match.
fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().any(|candidate| candidate == origin)
}

async fn client_session(state: AppState, socket: WebSocket, user_id: Uuid, org_id: Uuid) {
    let client_id = ClientId::new();
    let mut outbound = state.hub.register(client_id, org_id, user_id).await;
    let (mut sink, mut source) = socket.split();

    // write pump: hub broadcasts out to the socket
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(error = %err, "unserializable ws message");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // read pump: client frames into the hub, until the connection closes
    while let Some(frame) = source.next().await {
        let Ok(frame) = frame else { break };
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(message) = serde_json::from_str::<WsMessage>(text.as_str()) else {
            continue;
        };
        handle_client_frame(&state, client_id, user_id, org_id, message).await;
    }

    state.hub.unregister(client_id).await;
    writer.abort();
    tracing::debug!(user = %user_id, org = %org_id, "ws session closed");
}

async fn handle_client_frame(
    state: &AppState,
    client_id: ClientId,
    user_id: Uuid,
    org_id: Uuid,
    message: WsMessage,
) {
    match message.message_type.as_str() {
        TYPE_PONG => state.hub.pong(client_id).await,
        TYPE_PING => {
            // clients may also probe; answer through the hub's channel
            state
                .hub
                .broadcast(omc_hub::Broadcast::user(
                    org_id,
                    user_id,
                    WsMessage::new(TYPE_PONG, json!({})),
                ))
                .await;
        }
        TYPE_SET_CONTACT => {
            let contact_id = serde_json::from_value::<SetContactPayload>(message.payload)
                .map(|payload| payload.contact_id)
                .unwrap_or_default();
            state.hub.set_contact(client_id, contact_id).await;
            if let Some(contact_id) = contact_id {
                // viewing a conversation clears its unread counter
                if let Err(err) = state.store.reset_unread(org_id, contact_id).await {
                    tracing::warn!(error = %err, contact = %contact_id, "unread reset failed");
                }
            }
        }
        TYPE_SET_AVAILABILITY => {
            let away = message
                .payload
                .get("away")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            match state.transfers.set_availability(org_id, user_id, away).await {
                Ok(user) => {
                    tracing::info!(user = %user.id, away, "availability changed");
                }
                Err(err) => {
                    tracing::warn!(error = %err, user = %user_id, "availability change failed");
                }
            }
        }
        other => {
            tracing::debug!(frame = %other, "unrecognized client frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_admits_all() {
        assert!(origin_allowed(&[], "https://anything.example"));
        assert!(origin_allowed(&[], ""));
    }

    #[test]
    fn configured_allow_list_is_exact() {
        let allowed = vec!["https://app.example.com".to_string()];
        assert!(origin_allowed(&allowed, "https://app.example.com"));
        assert!(!origin_allowed(&allowed, "https://evil.example.com"));
        assert!(!origin_allowed(&allowed, ""));
    }
}
