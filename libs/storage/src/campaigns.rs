//! Campaigns and recipients. Recipient batches are claimed inside a
//! transaction with `FOR UPDATE SKIP LOCKED`: a crashed worker's uncommitted
//! batch unlocks on rollback and stays `pending` for the next claimer, which
//! is what gives the queue its at-least-once shape.

use omc_core::{Error, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::{db_err, Campaign, CampaignRecipient, Store};

pub type PgTx = sqlx::Transaction<'static, sqlx::Postgres>;

impl Store {
    pub async fn campaign_scoped(&self, org_id: Uuid, id: Uuid) -> Result<Option<Campaign>> {
        sqlx::query_as("SELECT * FROM bulk_campaigns WHERE organization_id = $1 AND id = $2")
            .bind(org_id)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)
    }

    pub async fn campaign_by_id(&self, id: Uuid) -> Result<Option<Campaign>> {
        sqlx::query_as("SELECT * FROM bulk_campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_err)
    }

    /// `draft → queued`; the caller then publishes the id to the stream.
    pub async fn mark_campaign_queued(&self, org_id: Uuid, id: Uuid) -> Result<Campaign> {
        sqlx::query_as(
            r#"
            UPDATE bulk_campaigns
            SET status = 'queued',
                total_count = (SELECT COUNT(*) FROM campaign_recipients WHERE campaign_id = $2)
            WHERE organization_id = $1 AND id = $2 AND status = 'draft'
            RETURNING *
            "#,
        )
        .bind(org_id)
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::conflict("campaign is not in draft status"))
    }

    /// `queued → running`, idempotent for workers that pick the id up twice.
    pub async fn mark_campaign_running(&self, id: Uuid) -> Result<Option<Campaign>> {
        sqlx::query_as(
            r#"
            UPDATE bulk_campaigns SET status = 'running'
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn set_campaign_paused(&self, org_id: Uuid, id: Uuid, paused: bool) -> Result<bool> {
        let (from, to) = if paused {
            ("running", "paused")
        } else {
            ("paused", "running")
        };
        let result = sqlx::query(
            "UPDATE bulk_campaigns SET status = $3 WHERE organization_id = $1 AND id = $2 AND status = $4",
        )
        .bind(org_id)
        .bind(id)
        .bind(to)
        .bind(from)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    /// Current status only, polled by workers between batches to honor the
    /// pause flag without losing the cursor.
    pub async fn campaign_status(&self, id: Uuid) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM bulk_campaigns WHERE id = $1")
                .bind(id)
                .fetch_optional(self.pool())
                .await
                .map_err(db_err)?;
        Ok(row.map(|(s,)| s))
    }

    pub async fn add_campaign_recipient(
        &self,
        org_id: Uuid,
        campaign_id: Uuid,
        phone: &str,
        variables: &Value,
        content_hash: &str,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO campaign_recipients
                (id, organization_id, campaign_id, phone, variables, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(org_id)
        .bind(campaign_id)
        .bind(phone)
        .bind(variables)
        .bind(content_hash)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(id)
    }

    /// Opens a transaction and locks up to `limit` pending recipients.
    /// Terminal-status updates go through the same transaction; commit
    /// releases the locks, rollback returns the rows to the pool untouched.
    pub async fn begin_recipient_batch(
        &self,
        campaign_id: Uuid,
        limit: i64,
    ) -> Result<(PgTx, Vec<CampaignRecipient>)> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(db_err)?;
        let rows: Vec<CampaignRecipient> = sqlx::query_as(
            r#"
            SELECT id, organization_id, campaign_id, phone, variables, content_hash,
                   status, provider_message_id, error
            FROM campaign_recipients
            WHERE campaign_id = $1 AND status = 'pending'
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(campaign_id)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        Ok((tx, rows))
    }

    /// A send with this (phone, content hash) already recorded a provider id
    /// under the campaign; the duplicate-send detector for reclaimed work.
    pub async fn recipient_send_recorded(
        &self,
        campaign_id: Uuid,
        phone: &str,
        content_hash: &str,
    ) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM campaign_recipients
                WHERE campaign_id = $1 AND phone = $2 AND content_hash = $3
                  AND provider_message_id <> ''
            )
            "#,
        )
        .bind(campaign_id)
        .bind(phone)
        .bind(content_hash)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;
        Ok(exists)
    }

    /// Completion check: no recipients left outside a terminal status moves
    /// `running → completed`.
    pub async fn complete_campaign_if_done(&self, campaign_id: Uuid) -> Result<Option<Campaign>> {
        sqlx::query_as(
            r#"
            UPDATE bulk_campaigns SET status = 'completed'
            WHERE id = $1 AND status = 'running'
              AND NOT EXISTS (
                  SELECT 1 FROM campaign_recipients
                  WHERE campaign_id = $1 AND status = 'pending')
            RETURNING *
            "#,
        )
        .bind(campaign_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    /// Failed recipients back to `pending`; the caller republishes the id.
    pub async fn reset_failed_recipients(&self, org_id: Uuid, campaign_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_recipients
            SET status = 'pending', error = '', updated_at = now()
            WHERE organization_id = $1 AND campaign_id = $2 AND status = 'failed'
            "#,
        )
        .bind(org_id)
        .bind(campaign_id)
        .execute(self.pool())
        .await
        .map_err(db_err)?;

        if result.rows_affected() > 0 {
            sqlx::query(
                r#"
                UPDATE bulk_campaigns
                SET status = 'queued', failed_count = failed_count - $3
                WHERE organization_id = $1 AND id = $2
                "#,
            )
            .bind(org_id)
            .bind(campaign_id)
            .bind(result.rows_affected() as i64)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        }
        Ok(result.rows_affected())
    }

    /// Campaign header media still referenced by a tenant, for the sweeper.
    pub async fn campaign_media_paths(&self, org_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT header_media_local_path FROM bulk_campaigns
            WHERE organization_id = $1 AND header_media_local_path <> ''
            "#,
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    /// Applies a provider delivery-status update to the recipient row and the
    /// campaign counters.
    pub async fn record_recipient_status(
        &self,
        provider_message_id: &str,
        status: &str,
    ) -> Result<()> {
        let column = match status {
            "delivered" => "delivered_count",
            "read" => "read_count",
            _ => return Ok(()),
        };
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE campaign_recipients SET status = $2, updated_at = now()
            WHERE provider_message_id = $1 AND status IN ('sent', 'delivered')
            RETURNING campaign_id
            "#,
        )
        .bind(provider_message_id)
        .bind(status)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;

        if let Some((campaign_id,)) = row {
            sqlx::query(&format!(
                "UPDATE bulk_campaigns SET {column} = {column} + 1 WHERE id = $1"
            ))
            .bind(campaign_id)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }
}

/// Marks one claimed recipient sent inside the batch transaction.
pub async fn mark_recipient_sent(
    tx: &mut PgTx,
    recipient_id: Uuid,
    provider_message_id: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE campaign_recipients
        SET status = 'sent', provider_message_id = $2, error = '', updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(recipient_id)
    .bind(provider_message_id)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Marks one claimed recipient failed inside the batch transaction.
pub async fn mark_recipient_failed(tx: &mut PgTx, recipient_id: Uuid, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE campaign_recipients
        SET status = 'failed', error = $2, updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(recipient_id)
    .bind(error)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Folds the batch outcome into the campaign counters, inside the same
/// transaction so a crash cannot double-count.
pub async fn bump_campaign_counters(
    tx: &mut PgTx,
    campaign_id: Uuid,
    sent: i64,
    failed: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE bulk_campaigns
        SET sent_count = sent_count + $2, failed_count = failed_count + $3
        WHERE id = $1
        "#,
    )
    .bind(campaign_id)
    .bind(sent)
    .bind(failed)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub async fn commit_batch(tx: PgTx) -> Result<()> {
    tx.commit().await.map_err(db_err)
}
