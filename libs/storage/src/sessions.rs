use omc_core::Result;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{db_err, ChatbotSession, Store};

impl Store {
    pub async fn session_for_contact(&self, contact_id: Uuid) -> Result<Option<ChatbotSession>> {
        sqlx::query_as("SELECT * FROM chatbot_sessions WHERE contact_id = $1")
            .bind(contact_id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)
    }

    /// Writes the session snapshot once, at the end of a pipeline run. The
    /// pipeline task is the single owner for the duration of one message.
    pub async fn save_session(
        &self,
        org_id: Uuid,
        contact_id: Uuid,
        current_flow_id: Option<Uuid>,
        current_step_id: Option<&str>,
        variables: &Value,
        last_activity_at: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chatbot_sessions
                (id, organization_id, contact_id, current_flow_id, current_step_id,
                 variables, last_activity_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (contact_id) DO UPDATE SET
                current_flow_id = EXCLUDED.current_flow_id,
                current_step_id = EXCLUDED.current_step_id,
                variables = EXCLUDED.variables,
                last_activity_at = EXCLUDED.last_activity_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(org_id)
        .bind(contact_id)
        .bind(current_flow_id)
        .bind(current_step_id)
        .bind(variables)
        .bind(last_activity_at)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Resets the session to the null flow (idle expiry, terminal step, or
    /// explicit end). Collected variables are discarded with it.
    pub async fn clear_session(&self, contact_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE chatbot_sessions
            SET current_flow_id = NULL, current_step_id = NULL,
                variables = '{}'::jsonb, last_activity_at = now()
            WHERE contact_id = $1
            "#,
        )
        .bind(contact_id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
