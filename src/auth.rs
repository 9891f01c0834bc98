//! Caller authentication and authorization seams
//!
//! User management lives outside the relay. The gateway only needs to turn a
//! bearer token into a [`CallerIdentity`], and the vault only needs a yes/no
//! on whether that caller may use a credential.

use async_trait::async_trait;
use subtle::ConstantTimeEq;

use crate::directory::ResourceType;

/// An authenticated caller, as resolved by the external user store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication token")]
    MissingToken,

    #[error("invalid or expired token")]
    InvalidToken,
}

/// Token validation seam to the external user store.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<CallerIdentity, AuthError>;
}

/// Per-credential authorization seam.
///
/// The vault consults this before decrypting; the decision logic (roles,
/// grants, expiry) belongs to the external permission tables.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn may_use(
        &self,
        caller: &CallerIdentity,
        resource_type: ResourceType,
        resource_id: i64,
    ) -> bool;
}

/// Authorizer that allows every caller. Single-operator deployments and tests.
pub struct PermitAll;

#[async_trait]
impl Authorizer for PermitAll {
    async fn may_use(&self, _: &CallerIdentity, _: ResourceType, _: i64) -> bool {
        true
    }
}

/// Authenticator that accepts exactly one preconfigured token.
///
/// Token comparison is constant-time; a timing oracle on the shared secret
/// would defeat the point of keeping it out of the browser.
pub struct StaticTokenAuthenticator {
    token: String,
    identity: CallerIdentity,
}

impl StaticTokenAuthenticator {
    pub fn new(token: impl Into<String>, identity: CallerIdentity) -> Self {
        Self {
            token: token.into(),
            identity,
        }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        let received = token.trim();
        if received.is_empty() {
            return Err(AuthError::MissingToken);
        }
        // Quick length check (doesn't leak token content)
        if received.len() != self.token.len() {
            return Err(AuthError::InvalidToken);
        }
        if bool::from(received.as_bytes().ct_eq(self.token.as_bytes())) {
            Ok(self.identity.clone())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator() -> CallerIdentity {
        CallerIdentity {
            user_id: 1,
            username: "operator".to_string(),
        }
    }

    #[tokio::test]
    async fn static_token_accepts_exact_match() {
        let auth = StaticTokenAuthenticator::new("sekrit-token", operator());
        let caller = auth.authenticate("sekrit-token").await.unwrap();
        assert_eq!(caller.username, "operator");
    }

    #[tokio::test]
    async fn static_token_rejects_mismatch_and_empty() {
        let auth = StaticTokenAuthenticator::new("sekrit-token", operator());
        assert!(matches!(
            auth.authenticate("sekrit-tokeX").await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            auth.authenticate("short").await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            auth.authenticate("  ").await,
            Err(AuthError::MissingToken)
        ));
    }
}
