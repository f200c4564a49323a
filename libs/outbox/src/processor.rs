//! Poller side: claims due and orphaned deliveries in batches and sends
//! them, walking the retry schedule on failure.

use std::time::Duration as StdDuration;

use omc_core::compute_signature;
use omc_safehttp::SafeHttpClient;
use omc_storage::{Store, WebhookDelivery};
use time::{Duration, OffsetDateTime};
use tokio::sync::watch;

use crate::dispatch::{SEND_TIMEOUT, SIGNATURE_HEADER};
use crate::retry_delay;

const BATCH_SIZE: i64 = 50;
/// An in-progress row older than this was orphaned by a crashed worker and
/// is claimed again.
pub const STALE_AFTER: Duration = Duration::minutes(15);

pub struct DeliveryProcessor {
    store: Store,
    http: SafeHttpClient,
    poll_interval: StdDuration,
}

impl DeliveryProcessor {
    pub fn new(store: Store, http: SafeHttpClient, poll_interval: StdDuration) -> Self {
        Self {
            store,
            http,
            poll_interval,
        }
    }

    /// Delivery loop. Stops after finishing the current batch when the
    /// shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.poll_interval, "webhook delivery processor started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("webhook delivery processor stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.drain_due().await;
                }
            }
        }
    }

    /// Claims and processes batches until no due rows remain.
    pub async fn drain_due(&self) {
        loop {
            let now = OffsetDateTime::now_utc();
            let stale_cutoff = now - STALE_AFTER;
            let batch = match self
                .store
                .claim_due_deliveries(now, stale_cutoff, BATCH_SIZE)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::error!(error = %err, "failed to claim webhook deliveries");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            for delivery in batch {
                process_delivery(&self.store, &self.http, delivery).await;
            }
        }
    }
}

/// Sends one claimed delivery and records the outcome. The row is re-read
/// first so URL/header/secret edits made since enqueue take effect.
pub async fn process_delivery(store: &Store, http: &SafeHttpClient, claimed: WebhookDelivery) {
    let delivery = match store.delivery_by_id(claimed.id).await {
        Ok(Some(fresh)) => fresh,
        Ok(None) => return,
        Err(err) => {
            tracing::error!(error = %err, delivery = %claimed.id, "failed to reload delivery");
            claimed
        }
    };

    let body = match serde_json::to_vec(&delivery.payload) {
        Ok(body) => body,
        Err(err) => {
            fail_delivery(store, &delivery, 0, &format!("failed to encode payload: {err}")).await;
            return;
        }
    };

    let mut headers = delivery.header_pairs();
    if !delivery.secret.is_empty() {
        headers.push((
            SIGNATURE_HEADER.to_string(),
            compute_signature(&delivery.secret, &body),
        ));
    }

    match http
        .post_json(&delivery.url, &headers, body, SEND_TIMEOUT)
        .await
    {
        Ok(response) if response.is_success() => {
            let now = OffsetDateTime::now_utc();
            if let Err(err) = store.mark_delivery_delivered(delivery.id, now).await {
                tracing::error!(error = %err, delivery = %delivery.id, "failed to record delivery");
            }
            metrics::counter!("webhook_deliveries", 1, "outcome" => "delivered");
        }
        Ok(response) => {
            let message = format!("webhook returned non-2xx status: {}", response.status);
            fail_delivery(store, &delivery, response.status as i32, &message).await;
        }
        // connect/TLS/timeout errors and SSRF blocks land here alike
        Err(err) => {
            fail_delivery(store, &delivery, 0, &err.to_string()).await;
        }
    }
}

async fn fail_delivery(store: &Store, delivery: &WebhookDelivery, status_code: i32, error: &str) {
    let attempts = delivery.attempts + 1;
    let max_attempts = if delivery.max_attempts > 0 {
        delivery.max_attempts
    } else {
        crate::MAX_ATTEMPTS
    };
    let terminal = attempts >= max_attempts;
    let next_attempt_at = OffsetDateTime::now_utc() + retry_delay(attempts);

    tracing::warn!(
        delivery = %delivery.id,
        org = %delivery.organization_id,
        attempts,
        terminal,
        error,
        "webhook delivery attempt failed"
    );
    metrics::counter!("webhook_deliveries", 1, "outcome" => if terminal { "failed" } else { "retrying" });

    if let Err(err) = store
        .record_delivery_failure(delivery.id, attempts, terminal, next_attempt_at, error, status_code)
        .await
    {
        tracing::error!(error = %err, delivery = %delivery.id, "failed to record delivery failure");
    }
}
