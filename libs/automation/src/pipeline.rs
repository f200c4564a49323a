//! The prioritized automation cascade, run once per inbound text or
//! interactive reply after persistence.
//!
//! Order: active-transfer gate, in-flow session, keyword rules, flow
//! trigger, AI, fallback — first terminal response wins. Any stage error is
//! logged with `{tenant, contact, stage}` and stops the pipeline for that
//! message; the inbound message itself is already durable.

use std::collections::HashMap;
use std::sync::Arc;

use omc_core::{
    Button, ChatProvider, Error, ErrorKind, InboundEvent, MessageStatus, Result, WebhookEvent,
};
use omc_hub::{Broadcast, HubHandle, WsMessage, TYPE_NEW_MESSAGE};
use omc_outbox::OutboxDispatcher;
use omc_storage::{messages::NewMessage, Account, OrgSettings, Store};
use omc_transfers::{TransferManager, TransferSource};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ai::AiStage;
use crate::flow::{self, FlowAction, FlowDefinition, FlowInput};
use crate::keyword::{keywords_match, rule_matches, RegexCache};

enum Stage {
    Handled,
    Continue,
}

pub struct Pipeline {
    store: Store,
    provider: Arc<dyn ChatProvider>,
    ai: Option<AiStage>,
    transfers: TransferManager,
    hub: HubHandle,
    outbox: OutboxDispatcher,
    regex_cache: RegexCache,
}

impl Pipeline {
    pub fn new(
        store: Store,
        provider: Arc<dyn ChatProvider>,
        ai: Option<AiStage>,
        transfers: TransferManager,
        hub: HubHandle,
        outbox: OutboxDispatcher,
    ) -> Self {
        Self {
            store,
            provider,
            ai,
            transfers,
            hub,
            outbox,
            regex_cache: RegexCache::new(),
        }
    }

    /// Entry point; never propagates an error.
    pub async fn handle_event(&self, event: InboundEvent) {
        if event.match_text().is_none() {
            // media and unknown payloads are persisted and fanned out by
            // ingress but do not drive automation
            return;
        }
        if let Err((stage, err)) = self.run(&event).await {
            tracing::error!(
                org = %event.org_id,
                contact = %event.contact_id,
                stage,
                error = %err,
                "automation pipeline stopped"
            );
            metrics::counter!("pipeline_failures", 1, "stage" => stage);
        }
    }

    async fn run(&self, event: &InboundEvent) -> std::result::Result<(), (&'static str, Error)> {
        let account = match self
            .store
            .account_scoped(event.org_id, event.account_id)
            .await
            .map_err(|e| ("load_account", e))?
        {
            Some(account) => account,
            None => {
                return Err((
                    "load_account",
                    Error::not_found("account vanished mid-pipeline"),
                ))
            }
        };
        let settings = self
            .store
            .org_settings(event.org_id)
            .await
            .map_err(|e| ("load_settings", e))?;

        match self
            .transfer_gate(event)
            .await
            .map_err(|e| ("transfer_gate", e))?
        {
            Stage::Handled => return Ok(()),
            Stage::Continue => {}
        }
        match self
            .flow_session(event, &account, &settings)
            .await
            .map_err(|e| ("flow_session", e))?
        {
            Stage::Handled => return Ok(()),
            Stage::Continue => {}
        }
        match self
            .keyword_rules(event, &account)
            .await
            .map_err(|e| ("keyword", e))?
        {
            Stage::Handled => return Ok(()),
            Stage::Continue => {}
        }
        match self
            .flow_trigger(event, &account)
            .await
            .map_err(|e| ("flow_trigger", e))?
        {
            Stage::Handled => return Ok(()),
            Stage::Continue => {}
        }

        // AI failures degrade to the fallback reply instead of aborting
        match self.ai_stage(event, &account, &settings).await {
            Ok(Stage::Handled) => return Ok(()),
            Ok(Stage::Continue) => {}
            Err(err) => {
                tracing::warn!(
                    org = %event.org_id,
                    contact = %event.contact_id,
                    error = %err,
                    "ai stage failed; falling back"
                );
            }
        }

        self.fallback(event, &account, &settings)
            .await
            .map_err(|e| ("fallback", e))?;
        Ok(())
    }

    /// Stage 1: a contact with an open transfer gets no automation; the
    /// message is relayed to the assigned agent's clients.
    async fn transfer_gate(&self, event: &InboundEvent) -> Result<Stage> {
        let Some(transfer) = self.transfers.active_for_contact(event.contact_id).await? else {
            return Ok(Stage::Continue);
        };
        if let Some(agent_id) = transfer.agent_id {
            self.hub
                .broadcast(Broadcast::user(
                    event.org_id,
                    agent_id,
                    WsMessage::new(TYPE_NEW_MESSAGE, inbound_payload(event)),
                ))
                .await;
        }
        Ok(Stage::Handled)
    }

    /// Stage 2: an in-flow session consumes the message, unless it idled out.
    async fn flow_session(
        &self,
        event: &InboundEvent,
        account: &Account,
        settings: &OrgSettings,
    ) -> Result<Stage> {
        let Some(session) = self.store.session_for_contact(event.contact_id).await? else {
            return Ok(Stage::Continue);
        };
        let Some(flow_id) = session.current_flow_id else {
            return Ok(Stage::Continue);
        };

        let idle_limit = time::Duration::minutes(settings.session_idle_minutes.max(1) as i64);
        if OffsetDateTime::now_utc() - session.last_activity_at > idle_limit {
            tracing::debug!(contact = %event.contact_id, "flow session idled out");
            self.store.clear_session(event.contact_id).await?;
            return Ok(Stage::Continue);
        }

        let Some(flow_row) = self.store.flow_scoped(event.org_id, flow_id).await? else {
            self.store.clear_session(event.contact_id).await?;
            return Ok(Stage::Continue);
        };
        if !flow_row.enabled {
            self.store.clear_session(event.contact_id).await?;
            return Ok(Stage::Continue);
        }

        let def = FlowDefinition::parse(&flow_row)?;
        let vars = vars_from_json(&session.variables);
        let input = FlowInput {
            value: event.match_text().unwrap_or_default().to_string(),
            title: event.interactive_reply().map(|(_, title)| title.to_string()),
        };
        let outcome = flow::advance(&def, session.current_step_id.as_deref(), vars, Some(input))?;

        self.execute_flow_actions(event, account, &outcome.actions)
            .await;
        self.persist_flow_cursor(event, flow_id, &outcome).await?;
        Ok(Stage::Handled)
    }

    /// Stage 3: first matching keyword rule responds.
    async fn keyword_rules(&self, event: &InboundEvent, account: &Account) -> Result<Stage> {
        let text = event.match_text().unwrap_or_default();
        let rules = self.store.enabled_keyword_rules(event.org_id).await?;
        let Some(rule) = rules
            .iter()
            .find(|rule| rule_matches(rule, text, &self.regex_cache))
        else {
            return Ok(Stage::Continue);
        };

        tracing::debug!(rule = %rule.id, contact = %event.contact_id, "keyword rule matched");
        match rule.response_type.as_str() {
            "transfer" => {
                if !rule.farewell_text.is_empty() {
                    self.send_text_reply(event, account, &rule.farewell_text)
                        .await;
                }
                match self
                    .transfers
                    .create(
                        event.org_id,
                        event.contact_id,
                        TransferSource::Keyword,
                        &rule.name,
                        rule.transfer_team_id,
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(err) if err.kind() == ErrorKind::Conflict => {
                        tracing::debug!(contact = %event.contact_id, "transfer already active");
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => {
                let buttons = parse_buttons(rule.buttons.as_ref());
                if buttons.is_empty() {
                    self.send_text_reply(event, account, &rule.response_text)
                        .await;
                } else {
                    self.send_buttons_reply(event, account, &rule.response_text, &buttons)
                        .await;
                }
            }
        }
        Ok(Stage::Handled)
    }

    /// Stage 4: a flow trigger keyword opens a fresh session.
    async fn flow_trigger(&self, event: &InboundEvent, account: &Account) -> Result<Stage> {
        let text = event.match_text().unwrap_or_default();
        let flows = self.store.enabled_flows(event.org_id).await?;
        let Some(flow_row) = flows
            .iter()
            .find(|flow| keywords_match(&flow.trigger_keywords, text))
        else {
            return Ok(Stage::Continue);
        };

        tracing::debug!(flow = %flow_row.id, contact = %event.contact_id, "flow triggered");
        let def = FlowDefinition::parse(flow_row)?;
        let outcome = flow::advance(&def, None, HashMap::new(), None)?;
        self.execute_flow_actions(event, account, &outcome.actions)
            .await;
        self.persist_flow_cursor(event, flow_row.id, &outcome).await?;
        Ok(Stage::Handled)
    }

    /// Stage 5: AI contexts, when the tenant has AI enabled.
    async fn ai_stage(
        &self,
        event: &InboundEvent,
        account: &Account,
        settings: &OrgSettings,
    ) -> Result<Stage> {
        if !settings.ai_enabled {
            return Ok(Stage::Continue);
        }
        let Some(ai) = &self.ai else {
            return Ok(Stage::Continue);
        };
        let text = event.match_text().unwrap_or_default();
        let contexts = self.store.enabled_ai_contexts(event.org_id).await?;
        match ai.respond(&contexts, text).await? {
            Some(reply) => {
                self.send_text_reply(event, account, &reply).await;
                Ok(Stage::Handled)
            }
            None => Ok(Stage::Continue),
        }
    }

    /// Stage 6: configured default reply, or silence.
    async fn fallback(
        &self,
        event: &InboundEvent,
        account: &Account,
        settings: &OrgSettings,
    ) -> Result<()> {
        if !settings.fallback_reply.is_empty() {
            self.send_text_reply(event, account, &settings.fallback_reply)
                .await;
        }
        Ok(())
    }

    async fn execute_flow_actions(
        &self,
        event: &InboundEvent,
        account: &Account,
        actions: &[FlowAction],
    ) {
        for action in actions {
            match action {
                FlowAction::SendText(text) => self.send_text_reply(event, account, text).await,
                FlowAction::SendButtons { text, buttons } => {
                    self.send_buttons_reply(event, account, text, buttons).await
                }
            }
        }
    }

    async fn persist_flow_cursor(
        &self,
        event: &InboundEvent,
        flow_id: Uuid,
        outcome: &flow::FlowOutcome,
    ) -> Result<()> {
        match &outcome.next_step_id {
            Some(step_id) => {
                self.store
                    .save_session(
                        event.org_id,
                        event.contact_id,
                        Some(flow_id),
                        Some(step_id),
                        &vars_to_json(&outcome.variables),
                        OffsetDateTime::now_utc(),
                    )
                    .await
            }
            None => self.store.clear_session(event.contact_id).await,
        }
    }

    /// Sends a text reply and records it. Provider failures land in the
    /// message status and never roll back session state.
    async fn send_text_reply(&self, event: &InboundEvent, account: &Account, body: &str) {
        let result = self
            .provider
            .send_text(&account.creds(), &event.contact_phone, body)
            .await;
        self.record_outbound(event, account, "text", body, result)
            .await;
    }

    async fn send_buttons_reply(
        &self,
        event: &InboundEvent,
        account: &Account,
        body: &str,
        buttons: &[Button],
    ) {
        let result = self
            .provider
            .send_buttons(&account.creds(), &event.contact_phone, body, buttons)
            .await;
        self.record_outbound(event, account, "interactive", body, result)
            .await;
    }

    async fn record_outbound(
        &self,
        event: &InboundEvent,
        account: &Account,
        message_type: &str,
        content: &str,
        send_result: Result<String>,
    ) {
        let now = OffsetDateTime::now_utc();
        let (provider_message_id, status, error) = match &send_result {
            Ok(pmid) => (pmid.clone(), MessageStatus::Sent, String::new()),
            Err(err) => {
                tracing::warn!(
                    org = %event.org_id,
                    contact = %event.contact_id,
                    error = %err,
                    "provider send failed"
                );
                (
                    format!("local-{}", Uuid::new_v4()),
                    MessageStatus::Failed,
                    err.to_string(),
                )
            }
        };

        let inserted = self
            .store
            .insert_message(NewMessage {
                organization_id: event.org_id,
                account_id: event.account_id,
                contact_id: event.contact_id,
                direction: "outbound",
                message_type,
                content,
                media_url: "",
                provider_message_id: &provider_message_id,
                status,
                error: &error,
                payload: None,
                sent_by_user_id: None,
            })
            .await;

        let message_id = match inserted {
            Ok(Some(id)) => id,
            Ok(None) => return, // duplicate provider id, already recorded
            Err(err) => {
                tracing::error!(error = %err, contact = %event.contact_id, "failed to record outbound message");
                return;
            }
        };

        if let Err(err) = self.store.touch_last_message(event.contact_id, now).await {
            tracing::warn!(error = %err, contact = %event.contact_id, "failed to touch contact");
        }

        self.hub
            .broadcast(Broadcast::tenant(
                event.org_id,
                WsMessage::new(
                    TYPE_NEW_MESSAGE,
                    json!({
                        "message_id": message_id,
                        "contact_id": event.contact_id,
                        "direction": "outbound",
                        "message_type": message_type,
                        "content": content,
                        "status": status.as_str(),
                    }),
                ),
            ))
            .await;

        if send_result.is_ok() {
            self.outbox
                .dispatch(
                    event.org_id,
                    WebhookEvent::MessageSent,
                    json!({
                        "message_id": message_id,
                        "contact_id": event.contact_id,
                        "contact_phone": event.contact_phone,
                        "message_type": message_type,
                        "content": content,
                        "whatsapp_account": account.display_name,
                    }),
                )
                .await;
        }
    }
}

/// Spawns the single pipeline consumer and returns its input channel. One
/// task owns the cascade so session writes for a contact never interleave;
/// ingress uses `try_send`, dropping to fallback-free persistence when the
/// queue is full rather than queueing without bound.
pub fn spawn(pipeline: Arc<Pipeline>, buffer: usize) -> mpsc::Sender<InboundEvent> {
    let (tx, mut rx) = mpsc::channel::<InboundEvent>(buffer);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            pipeline.handle_event(event).await;
        }
        tracing::debug!("automation pipeline stopped");
    });
    tx
}

fn inbound_payload(event: &InboundEvent) -> Value {
    json!({
        "message_id": event.message_id,
        "contact_id": event.contact_id,
        "direction": "inbound",
        "kind": event.kind,
    })
}

fn vars_from_json(value: &Value) -> HashMap<String, String> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let text = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), text)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn vars_to_json(vars: &HashMap<String, String>) -> Value {
    Value::Object(
        vars.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn parse_buttons(value: Option<&Value>) -> Vec<Button> {
    let Some(value) = value else {
        return Vec::new();
    };
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let id = item.get("id")?.as_str()?.to_string();
            let title = item.get("title")?.as_str()?.to_string();
            Some(Button { id, title })
        })
        .take(omc_core::MAX_BUTTONS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vars_round_trip_through_json() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "Ada".to_string());
        vars.insert("count".to_string(), "3".to_string());
        let json = vars_to_json(&vars);
        assert_eq!(vars_from_json(&json), vars);
    }

    #[test]
    fn non_string_json_values_coerce_to_text() {
        let value = json!({"n": 7, "ok": true});
        let vars = vars_from_json(&value);
        assert_eq!(vars.get("n").unwrap(), "7");
        assert_eq!(vars.get("ok").unwrap(), "true");
    }

    #[test]
    fn buttons_parse_and_cap_at_provider_limit() {
        let raw = json!([
            {"id": "a", "title": "A"},
            {"id": "b", "title": "B"},
            {"title": "missing id"},
        ]);
        let buttons = parse_buttons(Some(&raw));
        assert_eq!(buttons.len(), 2);
        assert_eq!(buttons[0].id, "a");

        let many: Vec<Value> = (0..15)
            .map(|i| json!({"id": format!("b{i}"), "title": format!("B{i}")}))
            .collect();
        let buttons = parse_buttons(Some(&Value::Array(many)));
        assert_eq!(buttons.len(), omc_core::MAX_BUTTONS);
    }

    #[test]
    fn buttons_absent_or_malformed_mean_plain_text() {
        assert!(parse_buttons(None).is_empty());
        assert!(parse_buttons(Some(&json!("not an array"))).is_empty());
    }
}
