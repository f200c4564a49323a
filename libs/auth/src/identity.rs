use omc_core::{Error, Result, TenantCtx};
use omc_storage::Store;
use uuid::Uuid;

/// Resolves `(user, tenant)` for a request. A super admin may act inside a
/// foreign tenant via the explicit `org_selector`; everyone else is pinned
/// to their own organization. Lookup misses fail closed: the caller gets
/// `NotFound`, never a tenant-existence oracle.
pub async fn resolve_identity(
    store: &Store,
    user_id: Uuid,
    org_selector: Option<Uuid>,
) -> Result<TenantCtx> {
    let user = store
        .user_by_id(user_id)
        .await?
        .ok_or_else(|| Error::not_found("not found"))?;

    if !user.is_active {
        return Err(Error::unauthenticated("account disabled"));
    }

    let org_id = match org_selector {
        Some(selected) if selected != user.organization_id => {
            if !user.is_super_admin {
                return Err(Error::permission_denied("cross-tenant access").fail_closed());
            }
            selected
        }
        _ => user.organization_id,
    };

    Ok(TenantCtx {
        org_id,
        user_id: Some(user.id),
        is_super_admin: user.is_super_admin,
    })
}

/// Tenant-scoped fetch guard: a `None` from a scoped repository lookup
/// becomes `NotFound` without leaking whether the row exists elsewhere.
pub fn require_scoped<T>(row: Option<T>) -> Result<T> {
    row.ok_or_else(|| Error::not_found("not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use omc_core::ErrorKind;

    #[test]
    fn require_scoped_masks_misses() {
        let err = require_scoped::<()>(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(require_scoped(Some(1)).is_ok());
    }
}
