//! Enqueue side: match active webhooks, allocate delivery rows, attempt the
//! first send immediately in the background.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use dashmap::DashMap;
use omc_core::{compute_signature, Error, Result, WebhookEvent};
use omc_safehttp::SafeHttpClient;
use omc_storage::{Store, Webhook, WebhookDelivery};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::MAX_ATTEMPTS;

pub const SEND_TIMEOUT: StdDuration = StdDuration::from_secs(30);
pub const TEST_SEND_TIMEOUT: StdDuration = StdDuration::from_secs(15);
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
/// Pub/sub channel the webhook CRUD surface announces config changes on;
/// the payload is the tenant id whose cache entry must drop.
pub const CACHE_CHANNEL: &str = "omnichat:webhooks";

/// Per-tenant webhook-config cache, shape `tenant_id → [webhook]`.
/// Invalidated on webhook CRUD; callers on other processes learn through
/// the permission-style pub/sub channel wired in the server.
#[derive(Clone, Default)]
pub struct WebhookCache {
    entries: Arc<DashMap<Uuid, Arc<Vec<Webhook>>>>,
}

impl WebhookCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, store: &Store, org_id: Uuid) -> Result<Arc<Vec<Webhook>>> {
        if let Some(entry) = self.entries.get(&org_id) {
            return Ok(entry.clone());
        }
        let webhooks = Arc::new(store.active_webhooks(org_id).await?);
        self.entries.insert(org_id, webhooks.clone());
        Ok(webhooks)
    }

    pub fn invalidate(&self, org_id: Uuid) {
        self.entries.remove(&org_id);
    }
}

/// Handle used by ingress, the pipeline, and the transfer manager to emit
/// subscriber events. Cheap to clone.
#[derive(Clone)]
pub struct OutboxDispatcher {
    store: Store,
    http: SafeHttpClient,
    cache: WebhookCache,
}

impl OutboxDispatcher {
    pub fn new(store: Store, http: SafeHttpClient) -> Self {
        Self {
            store,
            http,
            cache: WebhookCache::new(),
        }
    }

    pub fn cache(&self) -> &WebhookCache {
        &self.cache
    }

    /// Enqueues the event for every subscribed webhook of the tenant and
    /// spawns an immediate delivery attempt per row. Failures inside the
    /// spawned task are recorded on the row, never propagated.
    pub async fn dispatch(&self, org_id: Uuid, event: WebhookEvent, data: Value) {
        let webhooks = match self.cache.get(&self.store, org_id).await {
            Ok(webhooks) => webhooks,
            Err(err) => {
                tracing::error!(error = %err, org = %org_id, "failed to load webhooks");
                return;
            }
        };

        let now = OffsetDateTime::now_utc();
        for webhook in webhooks.iter() {
            if !webhook.subscribes_to(event.as_str()) {
                continue;
            }

            let delivery_id = Uuid::new_v4();
            let envelope = json!({
                "delivery_id": delivery_id,
                "event": event.as_str(),
                "timestamp": now.format(&Rfc3339).unwrap_or_default(),
                "data": data,
            });

            let delivery = match self
                .store
                .enqueue_delivery(delivery_id, org_id, webhook, event.as_str(), &envelope, MAX_ATTEMPTS, now)
                .await
            {
                Ok(delivery) => delivery,
                Err(err) => {
                    tracing::error!(error = %err, org = %org_id, webhook = %webhook.id, "failed to enqueue delivery");
                    continue;
                }
            };

            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.attempt_now(delivery).await;
            });
        }
    }

    async fn attempt_now(&self, delivery: WebhookDelivery) {
        let now = OffsetDateTime::now_utc();
        let claimed = match self.store.mark_delivery_in_progress(delivery.id, now).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return, // a poller got there first
            Err(err) => {
                tracing::error!(error = %err, delivery = %delivery.id, "failed to claim delivery");
                return;
            }
        };
        crate::process_delivery(&self.store, &self.http, claimed).await;
    }

    /// Synchronous test send used by the webhook CRUD surface. Does not
    /// touch the outbox; a failure surfaces directly to the caller.
    pub async fn send_test_event(&self, org_id: Uuid, webhook_id: Uuid) -> Result<()> {
        let webhook = self
            .store
            .webhook_scoped(org_id, webhook_id)
            .await?
            .ok_or_else(|| Error::not_found("not found"))?;

        let now = OffsetDateTime::now_utc();
        let envelope = json!({
            "delivery_id": Uuid::new_v4(),
            "event": "test",
            "timestamp": now.format(&Rfc3339).unwrap_or_default(),
            "data": {
                "test": true,
                "message": "This is a test webhook from Omnichat",
            },
        });
        let body = serde_json::to_vec(&envelope)
            .map_err(|err| Error::internal("payload encode failed").with_source(err))?;

        let mut headers = webhook.header_pairs();
        if !webhook.secret.is_empty() {
            headers.push((
                SIGNATURE_HEADER.to_string(),
                compute_signature(&webhook.secret, &body),
            ));
        }

        let response = self
            .http
            .post_json(&webhook.url, &headers, body, TEST_SEND_TIMEOUT)
            .await?;
        if !response.is_success() {
            return Err(Error::upstream(format!(
                "webhook test returned {}",
                response.status
            )));
        }
        Ok(())
    }

    /// The retry action: failed (and errored pending/in-progress) deliveries
    /// back to the queue front. Returns how many rows were reset.
    pub async fn retry_failed(&self, org_id: Uuid, webhook_id: Uuid) -> Result<u64> {
        // scoped lookup first so a foreign tenant sees NotFound, not a count
        self.store
            .webhook_scoped(org_id, webhook_id)
            .await?
            .ok_or_else(|| Error::not_found("not found"))?;
        self.store
            .reset_deliveries_for_retry(org_id, webhook_id, OffsetDateTime::now_utc())
            .await
    }
}
