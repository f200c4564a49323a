//! Automation configuration reads: keyword rules, flows, AI contexts.

use omc_core::Result;
use uuid::Uuid;

use crate::{db_err, AiContext, ChatbotFlow, KeywordRule, Store};

impl Store {
    /// Enabled rules in evaluation order: priority descending, then oldest
    /// first so rule creation order breaks ties deterministically.
    pub async fn enabled_keyword_rules(&self, org_id: Uuid) -> Result<Vec<KeywordRule>> {
        sqlx::query_as(
            r#"
            SELECT * FROM keyword_rules
            WHERE organization_id = $1 AND enabled
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn enabled_flows(&self, org_id: Uuid) -> Result<Vec<ChatbotFlow>> {
        sqlx::query_as(
            "SELECT * FROM chatbot_flows WHERE organization_id = $1 AND enabled ORDER BY created_at ASC",
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn flow_scoped(&self, org_id: Uuid, id: Uuid) -> Result<Option<ChatbotFlow>> {
        sqlx::query_as(
            "SELECT * FROM chatbot_flows WHERE organization_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn enabled_ai_contexts(&self, org_id: Uuid) -> Result<Vec<AiContext>> {
        sqlx::query_as(
            r#"
            SELECT id, organization_id, name, priority, enabled, always_on,
                   trigger_keywords, prompt, api_url
            FROM ai_contexts
            WHERE organization_id = $1 AND enabled
            ORDER BY priority DESC, created_at ASC
            "#,
        )
        .bind(org_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_err)
    }
}
