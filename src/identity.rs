use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope, TokenResponse,
    TokenUrl, basic::BasicClient, reqwest::async_http_client,
};
use rearch::CapsuleHandle;
use serde::Deserialize;
use tracing::instrument;
use url::Url;

use crate::config::{GoogleCredentials, google_credentials_capsule, public_url_capsule};

/// Who the identity provider says the user is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// Where to send the browser to log in, and the CSRF state the callback must echo back.
#[derive(Clone, Debug)]
pub struct AuthorizeUrl {
    pub url: Url,
    pub state: String,
}

/// An external service that authenticates users for us.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn authorize_url(&self) -> AuthorizeUrl;

    /// Exchanges an authorization code from the login callback for the user's identity.
    async fn exchange_code(&self, code: &str) -> anyhow::Result<Identity>;
}

/// # Panics
/// Panics when the Google client cannot be configured from the environment.
pub fn identity_provider_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn IdentityProvider> {
    let GoogleCredentials {
        client_id,
        client_secret,
    } = get.as_ref(google_credentials_capsule).clone();
    let public_url = get.as_ref(public_url_capsule).clone();
    let provider = GoogleIdentityProvider::new(client_id, client_secret, &public_url)
        .expect("Google identity provider should be configurable from the environment");
    Arc::new(provider)
}

pub struct GoogleIdentityProvider {
    client: BasicClient,
    http: reqwest::Client,
}

impl GoogleIdentityProvider {
    pub const CALLBACK_PATH: &'static str = "/auth/google/callback";
    const AUTH_URL: &'static str = "https://accounts.google.com/o/oauth2/v2/auth";
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";
    const USERINFO_URL: &'static str = "https://openidconnect.googleapis.com/v1/userinfo";

    /// # Errors
    /// Will return [`Err`] if any of the provider URLs cannot be built.
    pub fn new(client_id: String, client_secret: String, public_url: &Url) -> anyhow::Result<Self> {
        let redirect_url = public_url
            .join(Self::CALLBACK_PATH)
            .context("Failed to build OAuth redirect URL")?;

        let client = BasicClient::new(
            ClientId::new(client_id),
            Some(ClientSecret::new(client_secret)),
            AuthUrl::new(Self::AUTH_URL.to_owned())?,
            Some(TokenUrl::new(Self::TOKEN_URL.to_owned())?),
        )
        .set_redirect_uri(RedirectUrl::from_url(redirect_url));

        Ok(Self {
            client,
            http: reqwest::Client::new(),
        })
    }
}

#[derive(Deserialize)]
struct UserInfo {
    email: String,
    #[serde(default)]
    name: Option<String>,
}

#[async_trait]
impl IdentityProvider for GoogleIdentityProvider {
    fn authorize_url(&self) -> AuthorizeUrl {
        let (url, state) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new("openid".to_owned()))
            .add_scope(Scope::new("email".to_owned()))
            .add_scope(Scope::new("profile".to_owned()))
            .url();

        AuthorizeUrl {
            url,
            state: state.secret().clone(),
        }
    }

    #[instrument(skip_all)]
    async fn exchange_code(&self, code: &str) -> anyhow::Result<Identity> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_owned()))
            .request_async(async_http_client)
            .await
            .map_err(|err| anyhow!("Failed to exchange authorization code: {err}"))?;

        let UserInfo { email, name } = self
            .http
            .get(Self::USERINFO_URL)
            .bearer_auth(token.access_token().secret())
            .send()
            .await
            .context("Failed to request user info")?
            .error_for_status()
            .context("User info request was rejected")?
            .json()
            .await
            .context("Failed to decode user info")?;

        Ok(Identity {
            name: name.unwrap_or_else(|| email.clone()),
            email,
        })
    }
}
