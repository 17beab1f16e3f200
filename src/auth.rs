//! Authorization capability attached to a client stream (see spec §4.1, §4.2).
//!
//! The core never re-derives permissions from a role or policy store — it is
//! handed an `Authorizer` at connection establishment and consults it on
//! every tunnel operation. What backs that decision (a static allow-list, an
//! RBAC lookup, a signed capability token) is entirely up to the caller; the
//! coordinator only needs a yes/no per (subject, target) pair.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CoordinatorError;

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// May `subject` open or hold a tunnel to `target`?
    async fn authorize_tunnel(&self, subject: Uuid, target: Uuid) -> Result<(), CoordinatorError>;
}

/// Permits every tunnel. Used by tests and by deployments that enforce
/// authorization upstream of the coordinator.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize_tunnel(&self, _subject: Uuid, _target: Uuid) -> Result<(), CoordinatorError> {
        Ok(())
    }
}

/// Denies every tunnel. Useful in tests asserting the authorization-failure
/// path (spec §8 scenario list, "authorization failure on tunnel op").
pub struct DenyAll;

#[async_trait]
impl Authorizer for DenyAll {
    async fn authorize_tunnel(&self, _subject: Uuid, _target: Uuid) -> Result<(), CoordinatorError> {
        Err(CoordinatorError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_permits() {
        let a = AllowAll;
        assert!(a.authorize_tunnel(Uuid::new_v4(), Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn deny_all_rejects() {
        let a = DenyAll;
        let err = a
            .authorize_tunnel(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Unauthorized));
    }
}
