//! Agent transfer manager.
//!
//! Owns handoff of a contact from automation to a human: queueing, the
//! auto-assignment strategies, away-mode requeue, and resume. Every state
//! change fans out over the hub and is mirrored to webhook subscribers.

use omc_core::{Error, ErrorKind, Result, WebhookEvent};
use omc_hub::{
    Broadcast, HubHandle, WsMessage, TYPE_AGENT_TRANSFER, TYPE_AGENT_TRANSFER_ASSIGN,
    TYPE_AGENT_TRANSFER_RESUME,
};
use omc_outbox::OutboxDispatcher;
use omc_storage::{AgentTransfer, Store, User};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

/// Permission agents need to participate in auto-assignment.
const AGENT_RESOURCE: &str = "transfers";
const AGENT_ACTION: &str = "handle";

/// How a transfer came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSource {
    Keyword,
    Flow,
    Ai,
    Manual,
}

impl TransferSource {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferSource::Keyword => "keyword",
            TransferSource::Flow => "flow",
            TransferSource::Ai => "ai",
            TransferSource::Manual => "manual",
        }
    }
}

#[derive(Clone)]
pub struct TransferManager {
    store: Store,
    hub: HubHandle,
    outbox: OutboxDispatcher,
}

impl TransferManager {
    pub fn new(store: Store, hub: HubHandle, outbox: OutboxDispatcher) -> Self {
        Self { store, hub, outbox }
    }

    /// Enqueues a transfer for the contact. The open-transfer constraint
    /// makes a second active transfer a `Conflict`. When the target team
    /// carries an auto-assignment strategy, assignment is attempted
    /// immediately.
    pub async fn create(
        &self,
        org_id: Uuid,
        contact_id: Uuid,
        source: TransferSource,
        reason: &str,
        team_id: Option<Uuid>,
    ) -> Result<AgentTransfer> {
        let transfer = self
            .store
            .create_transfer(org_id, contact_id, source.as_str(), reason, team_id)
            .await?;

        tracing::info!(
            org = %org_id,
            contact = %contact_id,
            transfer = %transfer.id,
            source = source.as_str(),
            "transfer queued"
        );

        self.emit(&transfer, TYPE_AGENT_TRANSFER).await;
        self.outbox
            .dispatch(org_id, WebhookEvent::TransferCreated, transfer_data(&transfer))
            .await;

        if let Some(team_id) = team_id {
            if let Some(assigned) = self.try_auto_assign(org_id, transfer.id, team_id).await? {
                return Ok(assigned);
            }
        }
        Ok(transfer)
    }

    /// Whether the contact currently has an open (queued or assigned)
    /// transfer; the pipeline short-circuits automation on it.
    pub async fn active_for_contact(&self, contact_id: Uuid) -> Result<Option<AgentTransfer>> {
        self.store.active_transfer_for_contact(contact_id).await
    }

    /// Closes the transfer; automation resumes on the next inbound message.
    pub async fn resume(&self, org_id: Uuid, transfer_id: Uuid) -> Result<AgentTransfer> {
        let transfer = self
            .store
            .resume_transfer(org_id, transfer_id)
            .await?
            .ok_or_else(|| Error::not_found("not found"))?;

        self.store
            .set_assigned_agent(org_id, transfer.contact_id, None)
            .await?;
        self.emit(&transfer, TYPE_AGENT_TRANSFER_RESUME).await;
        self.outbox
            .dispatch(org_id, WebhookEvent::TransferResumed, transfer_data(&transfer))
            .await;
        Ok(transfer)
    }

    /// Away transition: every transfer the agent held goes back to the
    /// queue atomically, each with a fan-out event, then auto-assignment
    /// gets a chance to place them elsewhere.
    pub async fn handle_agent_away(&self, org_id: Uuid, agent_id: Uuid) -> Result<Vec<AgentTransfer>> {
        let requeued = self.store.requeue_assigned_for_agent(org_id, agent_id).await?;
        if requeued.is_empty() {
            return Ok(requeued);
        }

        tracing::info!(org = %org_id, agent = %agent_id, count = requeued.len(), "requeued transfers for away agent");
        for transfer in &requeued {
            self.store
                .set_assigned_agent(org_id, transfer.contact_id, None)
                .await?;
            self.emit(transfer, TYPE_AGENT_TRANSFER).await;
        }

        for transfer in &requeued {
            if let Some(team_id) = transfer.team_id {
                if let Err(err) = self.try_auto_assign(org_id, transfer.id, team_id).await {
                    tracing::warn!(error = %err, transfer = %transfer.id, "auto-assign after requeue failed");
                }
            }
        }
        Ok(requeued)
    }

    /// Persists the availability flip and performs the away requeue. The WS
    /// layer calls this when a user toggles their state.
    pub async fn set_availability(&self, org_id: Uuid, user_id: Uuid, away: bool) -> Result<User> {
        let (availability, break_started_at) = if away {
            ("away", Some(OffsetDateTime::now_utc()))
        } else {
            ("available", None)
        };
        let user = self
            .store
            .set_availability(org_id, user_id, availability, break_started_at)
            .await?
            .ok_or_else(|| Error::not_found("not found"))?;

        if away {
            self.handle_agent_away(org_id, user_id).await?;
        } else {
            self.assign_queued(org_id).await?;
        }
        Ok(user)
    }

    /// Queue tick: offers every queued transfer with an auto-assigning team
    /// to an agent. Called periodically and after an agent returns.
    pub async fn assign_queued(&self, org_id: Uuid) -> Result<usize> {
        let queued = self.store.queued_transfers(org_id).await?;
        let mut assigned = 0;
        for transfer in queued {
            let Some(team_id) = transfer.team_id else {
                continue;
            };
            match self.try_auto_assign(org_id, transfer.id, team_id).await {
                Ok(Some(_)) => assigned += 1,
                Ok(None) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(error = %err, transfer = %transfer.id, "queue tick assignment failed")
                }
            }
        }
        Ok(assigned)
    }

    /// Picks an agent per the team strategy and assigns. `None` when the
    /// strategy is manual or no agent is eligible.
    async fn try_auto_assign(
        &self,
        org_id: Uuid,
        transfer_id: Uuid,
        team_id: Uuid,
    ) -> Result<Option<AgentTransfer>> {
        let team = self
            .store
            .team_scoped(org_id, team_id)
            .await?
            .ok_or_else(|| Error::not_found("not found"))?;

        let agents = self
            .store
            .available_team_agents(org_id, team_id, AGENT_RESOURCE, AGENT_ACTION)
            .await?;
        if agents.is_empty() {
            return Ok(None);
        }

        let chosen = match team.strategy.as_str() {
            "round_robin" => {
                let cursor = self.store.advance_rr_cursor(team_id).await?;
                let idx = (cursor as usize) % agents.len();
                agents[idx].id
            }
            "load_balanced" => self.least_loaded(org_id, &agents).await?,
            _ => return Ok(None), // manual: agents pull from the queue
        };

        let Some(assigned) = self.store.assign_transfer(org_id, transfer_id, chosen).await? else {
            return Ok(None);
        };
        self.store
            .set_assigned_agent(org_id, assigned.contact_id, Some(chosen))
            .await?;

        tracing::info!(
            org = %org_id,
            transfer = %assigned.id,
            agent = %chosen,
            strategy = %team.strategy,
            "transfer assigned"
        );

        // tenant-wide so queue views refresh, plus a nudge to the agent
        self.emit(&assigned, TYPE_AGENT_TRANSFER_ASSIGN).await;
        self.hub
            .broadcast(Broadcast::user(
                org_id,
                chosen,
                WsMessage::new(TYPE_AGENT_TRANSFER_ASSIGN, transfer_data(&assigned)),
            ))
            .await;
        self.outbox
            .dispatch(org_id, WebhookEvent::TransferAssigned, transfer_data(&assigned))
            .await;
        Ok(Some(assigned))
    }

    /// Fewest active transfers wins; ties go to the agent whose latest
    /// assignment is oldest.
    async fn least_loaded(&self, org_id: Uuid, agents: &[User]) -> Result<Uuid> {
        let ids: Vec<Uuid> = agents.iter().map(|a| a.id).collect();
        let mut loads = self.store.agent_loads(org_id, &ids).await?;
        loads.sort_by(|a, b| {
            a.active
                .cmp(&b.active)
                .then_with(|| a.last_assigned_at.cmp(&b.last_assigned_at))
        });
        loads
            .first()
            .map(|l| l.agent_id)
            .ok_or_else(|| Error::internal("no agent loads returned"))
    }

    async fn emit(&self, transfer: &AgentTransfer, message_type: &str) {
        self.hub
            .broadcast(Broadcast::tenant(
                transfer.organization_id,
                WsMessage::new(message_type, transfer_data(transfer)),
            ))
            .await;
    }
}

fn transfer_data(transfer: &AgentTransfer) -> serde_json::Value {
    json!({
        "transfer_id": transfer.id,
        "contact_id": transfer.contact_id,
        "source": transfer.source,
        "reason": transfer.reason,
        "status": transfer.status,
        "agent_id": transfer.agent_id,
        "team_id": transfer.team_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_labels() {
        assert_eq!(TransferSource::Keyword.as_str(), "keyword");
        assert_eq!(TransferSource::Flow.as_str(), "flow");
        assert_eq!(TransferSource::Ai.as_str(), "ai");
        assert_eq!(TransferSource::Manual.as_str(), "manual");
    }

    #[test]
    fn transfer_payload_shape() {
        let transfer = AgentTransfer {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            contact_id: Uuid::new_v4(),
            source: "keyword".into(),
            reason: "pricing question".into(),
            status: "queued".into(),
            agent_id: None,
            team_id: None,
            transferred_at: OffsetDateTime::now_utc(),
            assigned_at: None,
            resumed_at: None,
        };
        let data = transfer_data(&transfer);
        assert_eq!(data["status"], "queued");
        assert_eq!(data["source"], "keyword");
        assert!(data["agent_id"].is_null());
    }
}
