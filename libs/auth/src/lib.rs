//! Tenant authorization: JWT identities, `(user, tenant)` resolution, and
//! the role permission cache with pub/sub invalidation.

pub mod identity;
pub mod jwt;
pub mod permissions;

pub use identity::*;
pub use jwt::*;
pub use permissions::*;
