//! Message log. Append-mostly: rows are inserted once and only the delivery
//! status is updated in place, monotonically.

use omc_core::{MessageStatus, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::{db_err, MessageRow, Store};

pub struct NewMessage<'a> {
    pub organization_id: Uuid,
    pub account_id: Uuid,
    pub contact_id: Uuid,
    pub direction: &'a str,
    pub message_type: &'a str,
    pub content: &'a str,
    pub media_url: &'a str,
    pub provider_message_id: &'a str,
    pub status: MessageStatus,
    pub error: &'a str,
    pub payload: Option<&'a Value>,
    pub sent_by_user_id: Option<Uuid>,
}

impl Store {
    /// Inserts an inbound message. The provider id is unique per account, so
    /// a duplicate delivery inserts nothing and returns `None`; the caller
    /// treats that as success and skips automation and fan-out.
    pub async fn insert_message(&self, msg: NewMessage<'_>) -> Result<Option<Uuid>> {
        let id = Uuid::new_v4();
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO messages
                (id, organization_id, account_id, contact_id, direction, message_type,
                 content, media_url, provider_message_id, status, error, payload, sent_by_user_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (account_id, provider_message_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(msg.organization_id)
        .bind(msg.account_id)
        .bind(msg.contact_id)
        .bind(msg.direction)
        .bind(msg.message_type)
        .bind(msg.content)
        .bind(msg.media_url)
        .bind(msg.provider_message_id)
        .bind(msg.status.as_str())
        .bind(msg.error)
        .bind(msg.payload)
        .bind(msg.sent_by_user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        Ok(row.map(|(id,)| id))
    }

    /// Applies a provider status update. The guard enforces the monotonic
    /// order queued < sent < delivered < read with `failed` terminal; stale
    /// or illegal updates match no row and return `None`.
    pub async fn update_message_status(
        &self,
        account_id: Uuid,
        provider_message_id: &str,
        status: MessageStatus,
        error: &str,
    ) -> Result<Option<MessageRow>> {
        sqlx::query_as(
            r#"
            UPDATE messages
            SET status = $3, error = $4
            WHERE account_id = $1
              AND provider_message_id = $2
              AND status <> 'failed'
              AND ($3 = 'failed' OR
                   CASE status
                       WHEN 'queued' THEN 0
                       WHEN 'sent' THEN 1
                       WHEN 'delivered' THEN 2
                       WHEN 'read' THEN 3
                   END <=
                   CASE $3
                       WHEN 'queued' THEN 0
                       WHEN 'sent' THEN 1
                       WHEN 'delivered' THEN 2
                       WHEN 'read' THEN 3
                   END)
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(provider_message_id)
        .bind(status.as_str())
        .bind(error)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    /// Referenced media paths for a tenant, consumed by the cleanup sweeper.
    pub async fn media_paths(&self, org_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT media_url FROM messages WHERE organization_id = $1 AND media_url <> ''",
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }
}
