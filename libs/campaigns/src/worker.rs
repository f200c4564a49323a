//! Campaign workers: consumer-group readers that turn claimed campaign ids
//! into template sends, batch by batch.

use std::sync::Arc;

use omc_core::{ChatProvider, Result};
use omc_hub::{Broadcast, HubHandle, WsMessage, TYPE_CAMPAIGN_STATS_UPDATE};
use omc_storage::{
    campaigns::{bump_campaign_counters, commit_batch, mark_recipient_failed, mark_recipient_sent},
    Store,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::service::{content_hash, stats_payload};
use crate::stream::CampaignStream;

const BATCH_SIZE: i64 = 25;
/// Emit a `campaign_stats_update` at most once per this many outcomes.
const STATS_EVERY: usize = 10;
/// Reclaim scan cadence, counted in read timeouts.
const RECLAIM_EVERY: u32 = 16;

pub struct CampaignWorker {
    store: Store,
    redis: redis::Client,
    provider: Arc<dyn ChatProvider>,
    hub: HubHandle,
    consumer: String,
}

/// Spawns `count` workers into the shared consumer group. More workers (in
/// this process or another one pointed at the same Redis) scale the same
/// campaign horizontally with no coordination beyond the group semantics.
pub fn spawn_workers(
    count: usize,
    store: Store,
    redis: redis::Client,
    provider: Arc<dyn ChatProvider>,
    hub: HubHandle,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|i| {
            let worker = CampaignWorker {
                store: store.clone(),
                redis: redis.clone(),
                provider: provider.clone(),
                hub: hub.clone(),
                consumer: format!("worker-{}-{}", std::process::id(), i),
            };
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect()
}

impl CampaignWorker {
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        tracing::info!(consumer = %self.consumer, "campaign worker started");
        let mut stream = loop {
            match CampaignStream::connect(&self.redis, &self.consumer).await {
                Ok(stream) => break stream,
                Err(err) => {
                    tracing::error!(error = %err, "campaign stream connect failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        };

        let mut idle_reads: u32 = 0;
        loop {
            if *shutdown.borrow() {
                tracing::info!(consumer = %self.consumer, "campaign worker stopped");
                return;
            }

            match stream.next().await {
                Ok(Some(entry)) => {
                    self.handle_entry(&mut stream, entry.id, entry.campaign_id, &shutdown)
                        .await;
                }
                Ok(None) => {
                    idle_reads += 1;
                    if idle_reads >= RECLAIM_EVERY {
                        idle_reads = 0;
                        self.reclaim(&mut stream, &shutdown).await;
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, consumer = %self.consumer, "stream read failed");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// Picks up entries a crashed worker claimed but never acked.
    async fn reclaim(&self, stream: &mut CampaignStream, shutdown: &watch::Receiver<bool>) {
        match stream.reclaim_stale(8).await {
            Ok(entries) => {
                for entry in entries {
                    tracing::info!(
                        consumer = %self.consumer,
                        campaign = %entry.campaign_id,
                        "reclaimed stale campaign entry"
                    );
                    metrics::counter!("campaign_entries_reclaimed", 1);
                    self.handle_entry(stream, entry.id, entry.campaign_id, shutdown)
                        .await;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "stale reclaim failed");
            }
        }
    }

    /// Processes one claimed entry and acks it only after the campaign has
    /// no more work this worker can do right now. A crash before the ack
    /// leaves the entry pending for reclaim.
    async fn handle_entry(
        &self,
        stream: &mut CampaignStream,
        entry_id: String,
        campaign_id: Uuid,
        shutdown: &watch::Receiver<bool>,
    ) {
        match self.process_campaign(campaign_id, shutdown).await {
            Ok(()) => {
                if let Err(err) = stream.ack(&entry_id).await {
                    tracing::warn!(error = %err, entry = %entry_id, "ack failed");
                }
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    campaign = %campaign_id,
                    "campaign processing failed; leaving entry for reclaim"
                );
            }
        }
    }

    async fn process_campaign(
        &self,
        campaign_id: Uuid,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let Some(campaign) = self.store.mark_campaign_running(campaign_id).await? else {
            // paused, cancelled, completed, or unknown: nothing to do here
            return Ok(());
        };
        let Some(account) = self
            .store
            .account_scoped(campaign.organization_id, campaign.account_id)
            .await?
        else {
            tracing::error!(campaign = %campaign_id, "campaign account missing");
            return Ok(());
        };
        let creds = account.creds();
        let mut outcomes_since_stats = 0usize;

        loop {
            if *shutdown.borrow() {
                // stop cleanly between batches; pending recipients survive
                return Ok(());
            }
            match self.store.campaign_status(campaign_id).await?.as_deref() {
                Some("running") => {}
                other => {
                    tracing::info!(campaign = %campaign_id, status = ?other, "campaign paused or closed; parking");
                    return Ok(());
                }
            }

            let (mut tx, batch) = self
                .store
                .begin_recipient_batch(campaign_id, BATCH_SIZE)
                .await?;
            if batch.is_empty() {
                commit_batch(tx).await?;
                if let Some(done) = self.store.complete_campaign_if_done(campaign_id).await? {
                    tracing::info!(campaign = %campaign_id, sent = done.sent_count, failed = done.failed_count, "campaign completed");
                    self.emit_stats(campaign_id).await;
                }
                return Ok(());
            }

            let mut sent: i64 = 0;
            let mut failed: i64 = 0;
            for recipient in &batch {
                let params = body_params(&recipient.variables);
                let hash = if recipient.content_hash.is_empty() {
                    content_hash(&campaign.template_name, &campaign.template_language, &params)
                } else {
                    recipient.content_hash.clone()
                };

                // a reclaimed batch may contain work another worker already
                // pushed to the provider; skip instead of double-sending
                if self
                    .store
                    .recipient_send_recorded(campaign_id, &recipient.phone, &hash)
                    .await?
                {
                    mark_recipient_sent(&mut tx, recipient.id, "").await?;
                    continue;
                }

                match self
                    .provider
                    .send_template(
                        &creds,
                        &recipient.phone,
                        &campaign.template_name,
                        &campaign.template_language,
                        &params,
                    )
                    .await
                {
                    Ok(provider_message_id) => {
                        mark_recipient_sent(&mut tx, recipient.id, &provider_message_id).await?;
                        sent += 1;
                    }
                    Err(err) => {
                        mark_recipient_failed(&mut tx, recipient.id, &err.to_string()).await?;
                        failed += 1;
                    }
                }
            }

            bump_campaign_counters(&mut tx, campaign_id, sent, failed).await?;
            commit_batch(tx).await?;
            metrics::counter!("campaign_sends", sent as u64, "outcome" => "sent");
            metrics::counter!("campaign_sends", failed as u64, "outcome" => "failed");

            outcomes_since_stats += (sent + failed) as usize;
            if outcomes_since_stats >= STATS_EVERY {
                outcomes_since_stats = 0;
                self.emit_stats(campaign_id).await;
            }
        }
    }

    async fn emit_stats(&self, campaign_id: Uuid) {
        match self.store.campaign_by_id(campaign_id).await {
            Ok(Some(campaign)) => {
                self.hub
                    .broadcast(Broadcast::tenant(
                        campaign.organization_id,
                        WsMessage::new(TYPE_CAMPAIGN_STATS_UPDATE, stats_payload(&campaign)),
                    ))
                    .await;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, campaign = %campaign_id, "stats reload failed");
            }
        }
    }
}

/// Recipient variables become ordered template body parameters. Numeric
/// keys sort numerically (`"1", "2", ..., "10"`), anything else
/// lexicographically after them.
pub(crate) fn body_params(variables: &Value) -> Vec<String> {
    let Some(map) = variables.as_object() else {
        return Vec::new();
    };
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    });
    keys.into_iter()
        .map(|k| match &map[k] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_params_sort_numeric_keys_naturally() {
        let vars = json!({"2": "second", "10": "tenth", "1": "first"});
        assert_eq!(body_params(&vars), vec!["first", "second", "tenth"]);
    }

    #[test]
    fn body_params_mix_numeric_before_named() {
        let vars = json!({"name": "Ada", "1": "x"});
        assert_eq!(body_params(&vars), vec!["x", "Ada"]);
    }

    #[test]
    fn body_params_tolerate_non_object() {
        assert!(body_params(&json!("nope")).is_empty());
        assert!(body_params(&json!(null)).is_empty());
    }
}
