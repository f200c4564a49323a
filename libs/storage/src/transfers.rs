//! Agent transfer rows. The partial unique index on active statuses is the
//! authority for the one-active-transfer-per-contact invariant.

use omc_core::{Error, ErrorKind, Result};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{db_err, AgentTransfer, Store};

impl Store {
    pub async fn create_transfer(
        &self,
        org_id: Uuid,
        contact_id: Uuid,
        source: &str,
        reason: &str,
        team_id: Option<Uuid>,
    ) -> Result<AgentTransfer> {
        sqlx::query_as(
            r#"
            INSERT INTO agent_transfers
                (id, organization_id, contact_id, source, reason, status, team_id, transferred_at)
            VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(contact_id)
        .bind(source)
        .bind(reason)
        .bind(team_id)
        .bind(OffsetDateTime::now_utc())
        .fetch_one(self.pool())
        .await
        .map_err(|err| {
            let mapped = db_err(err);
            if mapped.kind() == ErrorKind::Conflict {
                Error::conflict("contact already has an active transfer")
            } else {
                mapped
            }
        })
    }

    pub async fn active_transfer_for_contact(
        &self,
        contact_id: Uuid,
    ) -> Result<Option<AgentTransfer>> {
        sqlx::query_as(
            r#"
            SELECT * FROM agent_transfers
            WHERE contact_id = $1 AND status IN ('queued', 'assigned')
            "#,
        )
        .bind(contact_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    /// Assigns a queued transfer to an agent; returns `None` when the row was
    /// not queued anymore (raced by another assignment or a resume).
    pub async fn assign_transfer(
        &self,
        org_id: Uuid,
        transfer_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<AgentTransfer>> {
        sqlx::query_as(
            r#"
            UPDATE agent_transfers
            SET status = 'assigned', agent_id = $3, assigned_at = $4
            WHERE organization_id = $1 AND id = $2 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(org_id)
        .bind(transfer_id)
        .bind(agent_id)
        .bind(OffsetDateTime::now_utc())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    /// Returns every transfer the agent held, atomically moved back to the
    /// queue. Used when the agent goes away.
    pub async fn requeue_assigned_for_agent(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Vec<AgentTransfer>> {
        sqlx::query_as(
            r#"
            UPDATE agent_transfers
            SET status = 'queued', agent_id = NULL, assigned_at = NULL
            WHERE organization_id = $1 AND agent_id = $2 AND status = 'assigned'
            RETURNING *
            "#,
        )
        .bind(org_id)
        .bind(agent_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }

    /// Closes the transfer; automation resumes on the contact's next message.
    pub async fn resume_transfer(
        &self,
        org_id: Uuid,
        transfer_id: Uuid,
    ) -> Result<Option<AgentTransfer>> {
        sqlx::query_as(
            r#"
            UPDATE agent_transfers
            SET status = 'resumed', resumed_at = $3
            WHERE organization_id = $1 AND id = $2 AND status IN ('queued', 'assigned')
            RETURNING *
            "#,
        )
        .bind(org_id)
        .bind(transfer_id)
        .bind(OffsetDateTime::now_utc())
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn queued_transfers(&self, org_id: Uuid) -> Result<Vec<AgentTransfer>> {
        sqlx::query_as(
            r#"
            SELECT * FROM agent_transfers
            WHERE organization_id = $1 AND status = 'queued'
            ORDER BY transferred_at ASC
            "#,
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }
}
