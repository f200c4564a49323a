//! Role → permission-set cache. Read-heavy; dropped on a pub/sub
//! invalidation broadcast whenever a role's permissions change, with a TTL
//! fallback in case a process misses the message.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use omc_core::{Result, TenantCtx};
use omc_storage::Store;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

pub const INVALIDATION_CHANNEL: &str = "omnichat:permissions";
const CACHE_TTL: Duration = Duration::minutes(5);

struct CachedSet {
    permissions: HashSet<String>,
    loaded_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct PermissionCache {
    entries: Arc<DashMap<Uuid, CachedSet>>,
}

impl Default for PermissionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// `HasPermission(user, resource, action)`: super admins pass, users
    /// without a role fail, everyone else resolves against the cached
    /// `"resource:action"` set for their role.
    pub async fn has_permission(
        &self,
        store: &Store,
        ctx: &TenantCtx,
        resource: &str,
        action: &str,
    ) -> Result<bool> {
        if ctx.is_super_admin {
            return Ok(true);
        }
        let Some(user_id) = ctx.user_id else {
            return Ok(false);
        };
        let Some(user) = store.user_scoped(ctx.org_id, user_id).await? else {
            return Ok(false);
        };
        let Some(role_id) = user.role_id else {
            return Ok(false);
        };

        let key = format!("{resource}:{action}");
        let now = OffsetDateTime::now_utc();

        if let Some(entry) = self.entries.get(&role_id) {
            if now - entry.loaded_at < CACHE_TTL {
                return Ok(entry.permissions.contains(&key));
            }
        }

        let permissions: HashSet<String> = store
            .permission_strings_for_role(role_id)
            .await?
            .into_iter()
            .collect();
        let allowed = permissions.contains(&key);
        self.entries.insert(
            role_id,
            CachedSet {
                permissions,
                loaded_at: now,
            },
        );
        Ok(allowed)
    }

    pub fn invalidate_role(&self, role_id: Uuid) {
        self.entries.remove(&role_id);
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
    }

    #[cfg(test)]
    fn prime(&self, role_id: Uuid, permissions: HashSet<String>) {
        self.entries.insert(
            role_id,
            CachedSet {
                permissions,
                loaded_at: OffsetDateTime::now_utc(),
            },
        );
    }

    #[cfg(test)]
    fn cached(&self, role_id: Uuid) -> bool {
        self.entries.contains_key(&role_id)
    }
}

/// Publishes an invalidation for one role (or `*` for all) to every process
/// of the deployment.
pub async fn publish_invalidation(
    redis: &redis::Client,
    role_id: Option<Uuid>,
) -> Result<()> {
    let mut conn = redis
        .get_multiplexed_async_connection()
        .await
        .map_err(|err| omc_core::Error::internal("redis connect failed").with_source(err))?;
    let message = role_id.map(|id| id.to_string()).unwrap_or_else(|| "*".into());
    redis::cmd("PUBLISH")
        .arg(INVALIDATION_CHANNEL)
        .arg(message)
        .query_async::<()>(&mut conn)
        .await
        .map_err(|err| omc_core::Error::internal("redis publish failed").with_source(err))?;
    Ok(())
}

/// Long-running subscriber that drops local cache entries when another
/// process announces a permission change. Exits when the connection dies;
/// the supervisor restarts it.
pub async fn run_invalidation_listener(
    redis: redis::Client,
    cache: PermissionCache,
) -> Result<()> {
    let mut pubsub = redis
        .get_async_pubsub()
        .await
        .map_err(|err| omc_core::Error::internal("redis pubsub connect failed").with_source(err))?;
    pubsub
        .subscribe(INVALIDATION_CHANNEL)
        .await
        .map_err(|err| omc_core::Error::internal("redis subscribe failed").with_source(err))?;

    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "bad invalidation payload");
                continue;
            }
        };
        match payload.as_str() {
            "*" => cache.invalidate_all(),
            role => match role.parse::<Uuid>() {
                Ok(role_id) => cache.invalidate_role(role_id),
                Err(_) => tracing::warn!(payload = %role, "unparseable role invalidation"),
            },
        }
        tracing::debug!(payload = %payload, "permission cache invalidated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidation_drops_entries() {
        let cache = PermissionCache::new();
        let role = Uuid::new_v4();
        cache.prime(role, HashSet::from(["contacts:read".to_string()]));
        assert!(cache.cached(role));

        cache.invalidate_role(role);
        assert!(!cache.cached(role));

        cache.prime(role, HashSet::new());
        cache.invalidate_all();
        assert!(!cache.cached(role));
    }
}
