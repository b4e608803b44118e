use std::sync::Arc;

use async_trait::async_trait;
use rearch::CapsuleHandle;
use thiserror::Error;
use tracing::{info, instrument};

use crate::{
    identity::{AuthorizeUrl, IdentityProvider, identity_provider_capsule},
    session::SessionUser,
};

pub fn auth_service_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn AuthService> {
    let identity_provider = Arc::clone(get.as_ref(identity_provider_capsule));
    Arc::new(AuthServiceImpl::new(identity_provider))
}

#[async_trait]
pub trait AuthService: Send + Sync {
    fn start_login(&self) -> AuthorizeUrl;

    /// Checks the callback's `state` against the one saved when the login started,
    /// then asks the identity provider who the user is.
    async fn complete_login(
        &self,
        expected_state: Option<&str>,
        state: Option<&str>,
        code: &str,
    ) -> Result<SessionUser, LoginError>;
}

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("login state is missing or does not match")]
    StateMismatch,
    #[error("identity provider error: {0}")]
    Provider(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

pub(crate) struct AuthServiceImpl {
    identity_provider: Arc<dyn IdentityProvider>,
}

impl AuthServiceImpl {
    pub(crate) const fn new(identity_provider: Arc<dyn IdentityProvider>) -> Self {
        Self { identity_provider }
    }
}

#[async_trait]
impl AuthService for AuthServiceImpl {
    fn start_login(&self) -> AuthorizeUrl {
        self.identity_provider.authorize_url()
    }

    #[instrument(skip_all)]
    async fn complete_login(
        &self,
        expected_state: Option<&str>,
        state: Option<&str>,
        code: &str,
    ) -> Result<SessionUser, LoginError> {
        if expected_state.is_none() || expected_state != state {
            return Err(LoginError::StateMismatch);
        }

        let identity = self
            .identity_provider
            .exchange_code(code)
            .await
            .map_err(LoginError::Provider)?;
        info!(email = identity.email, "User logged in");
        Ok(identity.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mockall::{mock, predicate::*};
    use url::Url;

    use crate::identity::Identity;

    use super::*;

    mock! {
        IdentityProvider {}

        #[async_trait]
        impl IdentityProvider for IdentityProvider {
            fn authorize_url(&self) -> AuthorizeUrl;
            async fn exchange_code(&self, code: &str) -> anyhow::Result<Identity>;
        }
    }

    fn service(identity_provider: MockIdentityProvider) -> AuthServiceImpl {
        AuthServiceImpl::new(Arc::new(identity_provider))
    }

    #[test]
    fn test_start_login_delegates_to_provider() {
        let mut identity_provider = MockIdentityProvider::new();
        identity_provider
            .expect_authorize_url()
            .once()
            .return_once(|| AuthorizeUrl {
                url: Url::parse("https://idp.example.com/auth?state=xyz").unwrap(),
                state: "xyz".to_owned(),
            });

        let authorize_url = service(identity_provider).start_login();

        assert_eq!(authorize_url.state, "xyz");
        assert_eq!(authorize_url.url.host_str(), Some("idp.example.com"));
    }

    #[tokio::test]
    async fn test_complete_login_success() {
        let mut identity_provider = MockIdentityProvider::new();
        identity_provider
            .expect_exchange_code()
            .with(eq("auth-code"))
            .once()
            .return_once(|_| {
                Ok(Identity {
                    name: "Ada Lovelace".to_owned(),
                    email: "ada@example.com".to_owned(),
                })
            });

        let user = service(identity_provider)
            .complete_login(Some("xyz"), Some("xyz"), "auth-code")
            .await
            .unwrap();

        assert_eq!(
            user,
            SessionUser {
                name: "Ada Lovelace".to_owned(),
                email: "ada@example.com".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn test_complete_login_state_mismatch_skips_provider() {
        let mut identity_provider = MockIdentityProvider::new();
        identity_provider.expect_exchange_code().never();

        let err = service(identity_provider)
            .complete_login(Some("xyz"), Some("abc"), "auth-code")
            .await
            .unwrap_err();

        assert!(matches!(err, LoginError::StateMismatch));
    }

    #[tokio::test]
    async fn test_complete_login_without_started_login() {
        let mut identity_provider = MockIdentityProvider::new();
        identity_provider.expect_exchange_code().never();

        let err = service(identity_provider)
            .complete_login(None, Some("xyz"), "auth-code")
            .await
            .unwrap_err();

        assert!(matches!(err, LoginError::StateMismatch));
    }

    #[tokio::test]
    async fn test_complete_login_without_returned_state() {
        let mut identity_provider = MockIdentityProvider::new();
        identity_provider.expect_exchange_code().never();

        let err = service(identity_provider)
            .complete_login(Some("xyz"), None, "auth-code")
            .await
            .unwrap_err();

        assert!(matches!(err, LoginError::StateMismatch));
    }

    #[tokio::test]
    async fn test_complete_login_provider_failure() {
        let mut identity_provider = MockIdentityProvider::new();
        identity_provider
            .expect_exchange_code()
            .once()
            .return_once(|_| Err(anyhow::anyhow!("invalid_grant")));

        let err = service(identity_provider)
            .complete_login(Some("xyz"), Some("xyz"), "auth-code")
            .await
            .unwrap_err();

        assert!(matches!(err, LoginError::Provider(err) if err.to_string() == "invalid_grant"));
    }
}
