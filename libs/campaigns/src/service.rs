//! Control surface: start, pause/resume, retry-failed. Each action is a
//! status transition plus (where work remains) a republish of the campaign
//! id onto the stream.

use omc_core::{Error, Result};
use omc_hub::{Broadcast, HubHandle, WsMessage, TYPE_CAMPAIGN_STATS_UPDATE};
use omc_storage::{Campaign, Store};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::stream::CampaignStream;

/// One entry of the recipient list handed to `start`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RecipientSpec {
    pub phone: String,
    #[serde(default)]
    pub variables: serde_json::Value,
}

#[derive(Clone)]
pub struct CampaignService {
    store: Store,
    redis: redis::Client,
    hub: HubHandle,
}

impl CampaignService {
    pub fn new(store: Store, redis: redis::Client, hub: HubHandle) -> Self {
        Self { store, redis, hub }
    }

    /// Writes one `pending` row per recipient, transitions `draft → queued`,
    /// and puts the id on the stream for whichever worker gets there first.
    pub async fn start(
        &self,
        org_id: Uuid,
        campaign_id: Uuid,
        recipients: &[RecipientSpec],
    ) -> Result<Campaign> {
        let draft = self
            .store
            .campaign_scoped(org_id, campaign_id)
            .await?
            .ok_or_else(|| Error::not_found("not found"))?;

        for recipient in recipients {
            let params = crate::worker::body_params(&recipient.variables);
            let hash = content_hash(&draft.template_name, &draft.template_language, &params);
            self.store
                .add_campaign_recipient(
                    org_id,
                    campaign_id,
                    &recipient.phone,
                    &recipient.variables,
                    &hash,
                )
                .await?;
        }

        let campaign = self.store.mark_campaign_queued(org_id, campaign_id).await?;
        self.publish(campaign_id).await?;
        self.emit_stats(&campaign).await;
        tracing::info!(org = %org_id, campaign = %campaign_id, total = campaign.total_count, "campaign queued");
        Ok(campaign)
    }

    pub async fn pause(&self, org_id: Uuid, campaign_id: Uuid) -> Result<()> {
        if !self.store.set_campaign_paused(org_id, campaign_id, true).await? {
            return Err(Error::conflict("campaign is not running"));
        }
        Ok(())
    }

    /// `paused → running` and a republish so a worker resumes the cursor.
    pub async fn resume(&self, org_id: Uuid, campaign_id: Uuid) -> Result<()> {
        if !self.store.set_campaign_paused(org_id, campaign_id, false).await? {
            return Err(Error::conflict("campaign is not paused"));
        }
        self.publish(campaign_id).await
    }

    /// Failed recipients back to `pending` and the id back on the stream.
    pub async fn retry_failed(&self, org_id: Uuid, campaign_id: Uuid) -> Result<u64> {
        let reset = self.store.reset_failed_recipients(org_id, campaign_id).await?;
        if reset > 0 {
            self.publish(campaign_id).await?;
        }
        Ok(reset)
    }

    async fn publish(&self, campaign_id: Uuid) -> Result<()> {
        let mut stream = CampaignStream::connect(&self.redis, "control").await?;
        stream.publish(campaign_id).await?;
        Ok(())
    }

    async fn emit_stats(&self, campaign: &Campaign) {
        self.hub
            .broadcast(Broadcast::tenant(
                campaign.organization_id,
                WsMessage::new(TYPE_CAMPAIGN_STATS_UPDATE, stats_payload(campaign)),
            ))
            .await;
    }
}

/// Stable hash of what a recipient will receive, recorded on the row so a
/// reclaimed batch can detect an already-performed send.
pub fn content_hash(template_name: &str, language: &str, params: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(language.as_bytes());
    for param in params {
        hasher.update([0u8]);
        hasher.update(param.as_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn stats_payload(campaign: &Campaign) -> serde_json::Value {
    json!({
        "campaign_id": campaign.id,
        "status": campaign.status,
        "total": campaign.total_count,
        "sent": campaign.sent_count,
        "delivered": campaign.delivered_count,
        "read": campaign.read_count,
        "failed": campaign.failed_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_sensitive() {
        let a = content_hash("welcome", "en", &["Ada".into()]);
        let b = content_hash("welcome", "en", &["Ada".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, content_hash("welcome", "en", &["Bob".into()]));
        assert_ne!(a, content_hash("welcome", "pt", &["Ada".into()]));
        assert_ne!(a, content_hash("goodbye", "en", &["Ada".into()]));
    }

    #[test]
    fn stats_payload_carries_all_counters() {
        let campaign = Campaign {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            name: "promo".into(),
            template_name: "welcome".into(),
            template_language: "en".into(),
            header_media_local_path: String::new(),
            status: "running".into(),
            total_count: 10,
            sent_count: 4,
            delivered_count: 2,
            read_count: 1,
            failed_count: 1,
        };
        let payload = stats_payload(&campaign);
        assert_eq!(payload["total"], 10);
        assert_eq!(payload["sent"], 4);
        assert_eq!(payload["status"], "running");
    }
}
