use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request-scoped identity: which user is acting, inside which tenant.
///
/// Every persisted row carries the tenant id and every read filters by it;
/// the context is built once at the edge (WS upgrade, webhook ingress,
/// background job bootstrap) and threaded through the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCtx {
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    /// Super admins may impersonate a tenant via an explicit selector;
    /// the effective `org_id` above is the impersonated one.
    #[serde(default)]
    pub is_super_admin: bool,
}

impl TenantCtx {
    pub fn system(org_id: Uuid) -> Self {
        Self {
            org_id,
            user_id: None,
            is_super_admin: false,
        }
    }

    pub fn for_user(org_id: Uuid, user_id: Uuid) -> Self {
        Self {
            org_id,
            user_id: Some(user_id),
            is_super_admin: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_context_has_no_user() {
        let ctx = TenantCtx::system(Uuid::new_v4());
        assert!(ctx.user_id.is_none());
        assert!(!ctx.is_super_admin);
    }
}
