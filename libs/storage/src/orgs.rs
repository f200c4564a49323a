//! Organizations, per-tenant settings, and provider accounts.

use omc_core::Result;
use uuid::Uuid;

use crate::{db_err, Account, OrgSettings, Store};

impl Store {
    pub async fn org_ids(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM organizations")
            .fetch_all(self.pool())
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Settings row for a tenant; tenants without one get the defaults.
    pub async fn org_settings(&self, org_id: Uuid) -> Result<OrgSettings> {
        let row: Option<OrgSettings> = sqlx::query_as(
            "SELECT * FROM organization_settings WHERE organization_id = $1",
        )
        .bind(org_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)?;
        Ok(row.unwrap_or_else(|| OrgSettings::defaults(org_id)))
    }

    /// Account lookup by the provider's phone-number id, the key inbound
    /// webhook payloads carry.
    pub async fn account_by_phone_number_id(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<Account>> {
        sqlx::query_as(
            r#"
            SELECT id, organization_id, phone_number_id, business_id, access_token, display_name
            FROM accounts WHERE phone_number_id = $1
            "#,
        )
        .bind(phone_number_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }

    pub async fn account_scoped(&self, org_id: Uuid, id: Uuid) -> Result<Option<Account>> {
        sqlx::query_as(
            r#"
            SELECT id, organization_id, phone_number_id, business_id, access_token, display_name
            FROM accounts WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(org_id)
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_err)
    }
}
