use omc_core::Result;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{db_err, Contact, Store};

impl Store {
    /// Finds or creates the contact for `(account, phone)`. Returns the row
    /// and whether it was created by this call.
    pub async fn upsert_contact(
        &self,
        org_id: Uuid,
        account_id: Uuid,
        phone: &str,
        name: &str,
    ) -> Result<(Contact, bool)> {
        let inserted: Option<Contact> = sqlx::query_as(
            r#"
            INSERT INTO contacts (id, organization_id, account_id, phone, name)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id, phone) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(account_id)
        .bind(phone)
        .bind(name)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        if let Some(contact) = inserted {
            return Ok((contact, true));
        }

        let existing: Contact = sqlx::query_as(
            "SELECT * FROM contacts WHERE account_id = $1 AND phone = $2",
        )
        .bind(account_id)
        .bind(phone)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;
        Ok((existing, false))
    }

    pub async fn contact_scoped(&self, org_id: Uuid, id: Uuid) -> Result<Option<Contact>> {
        sqlx::query_as("SELECT * FROM contacts WHERE organization_id = $1 AND id = $2")
            .bind(org_id)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)
    }

    /// Bumps the unread counter and last-message timestamp on ingress.
    pub async fn bump_unread(&self, contact_id: Uuid, at: OffsetDateTime) -> Result<()> {
        sqlx::query(
            "UPDATE contacts SET unread_count = unread_count + 1, last_message_at = $2 WHERE id = $1",
        )
        .bind(contact_id)
        .bind(at)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Clears the unread counter when an agent selects the conversation.
    pub async fn reset_unread(&self, org_id: Uuid, contact_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE contacts SET unread_count = 0 WHERE organization_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(contact_id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn touch_last_message(&self, contact_id: Uuid, at: OffsetDateTime) -> Result<()> {
        sqlx::query("UPDATE contacts SET last_message_at = $2 WHERE id = $1")
            .bind(contact_id)
            .bind(at)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn set_assigned_agent(
        &self,
        org_id: Uuid,
        contact_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE contacts SET assigned_agent_id = $3 WHERE organization_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(contact_id)
        .bind(agent_id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
