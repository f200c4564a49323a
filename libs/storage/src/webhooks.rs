//! Outbound webhooks and the delivery outbox. Due rows are claimed and
//! marked in-progress in one statement so concurrent pollers never hand the
//! same delivery to two senders.

use omc_core::Result;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{db_err, Store, Webhook, WebhookDelivery};

impl Store {
    pub async fn active_webhooks(&self, org_id: Uuid) -> Result<Vec<Webhook>> {
        sqlx::query_as(
            r#"
            SELECT id, organization_id, name, url, events, headers, secret, is_active
            FROM webhooks WHERE organization_id = $1 AND is_active
            ORDER BY created_at ASC
            "#,
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn webhook_scoped(&self, org_id: Uuid, id: Uuid) -> Result<Option<Webhook>> {
        sqlx::query_as(
            r#"
            SELECT id, organization_id, name, url, events, headers, secret, is_active
            FROM webhooks WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(org_id)
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    /// Allocates one delivery row in the outbox. The payload is immutable
    /// from here on; URL/headers/secret are snapshotted but re-read before
    /// each attempt so config edits apply to queued work.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_delivery(
        &self,
        delivery_id: Uuid,
        org_id: Uuid,
        webhook: &Webhook,
        event: &str,
        payload: &Value,
        max_attempts: i32,
        now: OffsetDateTime,
    ) -> Result<WebhookDelivery> {
        sqlx::query_as(
            r#"
            INSERT INTO webhook_deliveries
                (id, organization_id, webhook_id, event, url, headers, secret, payload,
                 status, attempts, max_attempts, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', 0, $9, $10)
            RETURNING id, organization_id, webhook_id, event, url, headers, secret, payload,
                      status, attempts, max_attempts, next_attempt_at,
                      processing_started_at, delivered_at, last_error, last_status_code
            "#,
        )
        .bind(delivery_id)
        .bind(org_id)
        .bind(webhook.id)
        .bind(event)
        .bind(&webhook.url)
        .bind(&webhook.headers)
        .bind(&webhook.secret)
        .bind(payload)
        .bind(max_attempts)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)
    }

    /// Marks a freshly enqueued delivery in-progress for the immediate
    /// attempt; `None` when another worker got there first.
    pub async fn mark_delivery_in_progress(
        &self,
        delivery_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Option<WebhookDelivery>> {
        sqlx::query_as(
            r#"
            UPDATE webhook_deliveries
            SET status = 'in_progress', processing_started_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING id, organization_id, webhook_id, event, url, headers, secret, payload,
                      status, attempts, max_attempts, next_attempt_at,
                      processing_started_at, delivered_at, last_error, last_status_code
            "#,
        )
        .bind(delivery_id)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    /// Claims due work: pending rows whose retry time has arrived, plus
    /// in-progress rows orphaned by a crashed worker past the stale cutoff.
    /// Claimed rows flip to in-progress atomically under SKIP LOCKED.
    pub async fn claim_due_deliveries(
        &self,
        now: OffsetDateTime,
        stale_cutoff: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>> {
        sqlx::query_as(
            r#"
            WITH due AS (
                SELECT id FROM webhook_deliveries
                WHERE (status = 'pending' AND next_attempt_at <= $1)
                   OR (status = 'in_progress' AND processing_started_at <= $2)
                ORDER BY next_attempt_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE webhook_deliveries d
            SET status = 'in_progress', processing_started_at = $1
            FROM due
            WHERE d.id = due.id
            RETURNING d.id, d.organization_id, d.webhook_id, d.event, d.url, d.headers,
                      d.secret, d.payload, d.status, d.attempts, d.max_attempts,
                      d.next_attempt_at, d.processing_started_at, d.delivered_at,
                      d.last_error, d.last_status_code
            "#,
        )
        .bind(now)
        .bind(stale_cutoff)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }

    /// Re-reads a delivery so URL/secret/header edits land before the send.
    pub async fn delivery_by_id(&self, id: Uuid) -> Result<Option<WebhookDelivery>> {
        sqlx::query_as(
            r#"
            SELECT id, organization_id, webhook_id, event, url, headers, secret, payload,
                   status, attempts, max_attempts, next_attempt_at,
                   processing_started_at, delivered_at, last_error, last_status_code
            FROM webhook_deliveries WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn mark_delivery_delivered(&self, id: Uuid, now: OffsetDateTime) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'delivered', delivered_at = $2, processing_started_at = NULL,
                last_error = '', last_status_code = 0
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Records a failed attempt: either re-queued with the next retry time
    /// or terminal `failed` once attempts are exhausted.
    pub async fn record_delivery_failure(
        &self,
        id: Uuid,
        attempts: i32,
        terminal: bool,
        next_attempt_at: OffsetDateTime,
        error: &str,
        status_code: i32,
    ) -> Result<()> {
        if terminal {
            sqlx::query(
                r#"
                UPDATE webhook_deliveries
                SET status = 'failed', attempts = $2, last_error = $3,
                    last_status_code = $4, processing_started_at = NULL
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(attempts)
            .bind(error)
            .bind(status_code)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        } else {
            sqlx::query(
                r#"
                UPDATE webhook_deliveries
                SET status = 'pending', attempts = $2, last_error = $3,
                    last_status_code = $4, processing_started_at = NULL,
                    next_attempt_at = $5
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(attempts)
            .bind(error)
            .bind(status_code)
            .bind(next_attempt_at)
            .execute(self.pool())
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    /// The retry action: failed deliveries, plus pending/in-progress ones
    /// carrying an error, go back to the front of the queue. Attempt counts
    /// are preserved.
    pub async fn reset_deliveries_for_retry(
        &self,
        org_id: Uuid,
        webhook_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = 'pending', next_attempt_at = $3, processing_started_at = NULL,
                last_error = '', last_status_code = 0
            WHERE organization_id = $1 AND webhook_id = $2
              AND (status = 'failed'
                   OR (status IN ('pending', 'in_progress') AND last_error <> ''))
            "#,
        )
        .bind(org_id)
        .bind(webhook_id)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    /// `(failed, retrying)` counts surfaced on the webhook health view.
    pub async fn delivery_health(&self, org_id: Uuid, webhook_id: Uuid) -> Result<(i64, i64)> {
        let (failed,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM webhook_deliveries
            WHERE organization_id = $1 AND webhook_id = $2 AND status = 'failed'
            "#,
        )
        .bind(org_id)
        .bind(webhook_id)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;

        let (retrying,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM webhook_deliveries
            WHERE organization_id = $1 AND webhook_id = $2
              AND status IN ('pending', 'in_progress') AND last_error <> ''
            "#,
        )
        .bind(org_id)
        .bind(webhook_id)
        .fetch_one(self.pool())
        .await
        .map_err(db_err)?;

        Ok((failed, retrying))
    }
}
