use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, PoisonError, RwLock},
    time::{Duration, Instant},
};

use axum::{extract::FromRequestParts, http::HeaderMap, http::request::Parts};
use axum_extra::extract::cookie::{Cookie, Key, SameSite, SignedCookieJar};
use rearch::{CapsuleHandle, Container};
use serde::Serialize;
use tracing::debug;

use crate::{
    config::{public_url_capsule, secret_key_capsule},
    identity::Identity,
};

const SESSION_COOKIE: &str = "session";
const OAUTH_STATE_COOKIE: &str = "oauth_state";
const KEY_DERIVATION_CONTEXT: &str = "fleeting-posts 2026-10 session cookie signing key";

/// How long a logged-in session stays valid on the server.
pub const SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long the browser has to come back from the identity provider.
const LOGIN_ATTEMPT_TTL: time::Duration = time::Duration::minutes(10);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        Self(base62::encode(rand::random::<u128>()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionUser {
    pub name: String,
    pub email: String,
}

impl From<Identity> for SessionUser {
    fn from(Identity { name, email }: Identity) -> Self {
        Self { name, email }
    }
}

/// Server-side half of logged-in sessions. Anonymous visitors never get an entry.
pub trait SessionStore: Send + Sync {
    fn load(&self, id: &SessionId) -> Option<SessionUser>;
    fn save(&self, id: SessionId, user: SessionUser);
    fn remove(&self, id: &SessionId);
}

pub fn session_store_capsule(_: CapsuleHandle) -> Arc<dyn SessionStore> {
    Arc::new(InMemorySessionStore::new(SESSION_TTL))
}

struct StoredSession {
    user: SessionUser,
    expires_at: Instant,
}

/// Keeps sessions in process memory; entries older than the TTL are dropped on the next save.
pub struct InMemorySessionStore {
    ttl: Duration,
    sessions: RwLock<HashMap<SessionId, StoredSession>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::default(),
        }
    }
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, id: &SessionId) -> Option<SessionUser> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .filter(|session| session.expires_at > Instant::now())
            .map(|session| session.user.clone())
    }

    fn save(&self, id: SessionId, user: SessionUser) {
        let now = Instant::now();
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|_, session| session.expires_at > now);
        sessions.insert(
            id,
            StoredSession {
                user,
                expires_at: now + self.ttl,
            },
        );
    }

    fn remove(&self, id: &SessionId) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

#[derive(Clone)]
pub struct SessionSettings {
    pub key: Key,
    pub secure_cookies: bool,
}

impl SessionSettings {
    /// Stretches a secret of any length into a cookie signing key.
    #[must_use]
    pub fn from_secret(secret: &str, secure_cookies: bool) -> Self {
        let mut key_material = [0; 64];
        blake3::Hasher::new_derive_key(KEY_DERIVATION_CONTEXT)
            .update(secret.as_bytes())
            .finalize_xof()
            .fill(&mut key_material);
        Self {
            key: Key::from(&key_material),
            secure_cookies,
        }
    }
}

pub fn session_settings_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> SessionSettings {
    let secure_cookies = get.as_ref(public_url_capsule).scheme() == "https";
    SessionSettings::from_secret(get.as_ref(secret_key_capsule), secure_cookies)
}

/// The current request's session.
///
/// The logged-in user lives in the [`SessionStore`] under the id in the `session` cookie.
/// A login in progress only lives in its own short-lived `oauth_state` cookie.
///
/// Methods that change the session consume it and return the cookie jar,
/// which must be part of the response for the change to reach the browser.
pub struct Session {
    jar: SignedCookieJar,
    id: Option<SessionId>,
    user: Option<SessionUser>,
    oauth_state: Option<String>,
    store: Arc<dyn SessionStore>,
    secure_cookies: bool,
}

impl Session {
    pub fn load(headers: &HeaderMap, settings: SessionSettings, store: Arc<dyn SessionStore>) -> Self {
        let jar = SignedCookieJar::from_headers(headers, settings.key);
        let (id, user) = jar
            .get(SESSION_COOKIE)
            .map(|cookie| SessionId(cookie.value().to_owned()))
            .and_then(|id| store.load(&id).map(|user| (id, user)))
            .unzip();
        let oauth_state = jar
            .get(OAUTH_STATE_COOKIE)
            .map(|cookie| cookie.value().to_owned());
        Self {
            jar,
            id,
            user,
            oauth_state,
            store,
            secure_cookies: settings.secure_cookies,
        }
    }

    #[must_use]
    pub const fn user(&self) -> Option<&SessionUser> {
        self.user.as_ref()
    }

    #[must_use]
    pub fn oauth_state(&self) -> Option<&str> {
        self.oauth_state.as_deref()
    }

    /// Remembers the CSRF state of a login that is about to start.
    #[must_use]
    pub fn begin_login(self, oauth_state: String) -> SignedCookieJar {
        let mut cookie = self.cookie(OAUTH_STATE_COOKIE, oauth_state);
        cookie.set_max_age(LOGIN_ATTEMPT_TTL);
        self.jar.add(cookie)
    }

    /// Forgets a login attempt that failed.
    #[must_use]
    pub fn abandon_login(self) -> SignedCookieJar {
        self.jar.remove(Cookie::build(OAUTH_STATE_COOKIE).path("/"))
    }

    /// Stores the logged-in user under a fresh session id, discarding the old session.
    #[must_use]
    pub fn log_in(self, user: SessionUser) -> SignedCookieJar {
        if let Some(old_id) = &self.id {
            self.store.remove(old_id);
        }
        let id = SessionId::generate();
        let cookie = self.cookie(SESSION_COOKIE, id.0.clone());
        self.store.save(id, user);
        self.jar
            .remove(Cookie::build(OAUTH_STATE_COOKIE).path("/"))
            .add(cookie)
    }

    #[must_use]
    pub fn clear(self) -> SignedCookieJar {
        if let Some(id) = &self.id {
            self.store.remove(id);
            debug!("Session cleared");
        }
        self.jar
            .remove(Cookie::build(SESSION_COOKIE).path("/"))
            .remove(Cookie::build(OAUTH_STATE_COOKIE).path("/"))
    }

    fn cookie(&self, name: &'static str, value: String) -> Cookie<'static> {
        Cookie::build((name, value))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure_cookies)
            .build()
    }
}

impl FromRequestParts<Container> for Session {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        container: &Container,
    ) -> Result<Self, Self::Rejection> {
        let (settings, store) = container.read((session_settings_capsule, session_store_capsule));
        Ok(Self::load(&parts.headers, settings, store))
    }
}

/// Plays the browser: turns the cookies a jar sets into a request `Cookie` header.
/// Cookies the jar removes are left out.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) fn browser_headers(jar: SignedCookieJar) -> HeaderMap {
    use axum::{
        http::header::{COOKIE, SET_COOKIE},
        response::IntoResponse,
    };

    let response = jar.into_response();
    let cookies = response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .map(|value| value.to_str().unwrap().split(';').next().unwrap().to_owned())
        .filter(|pair| !pair.ends_with('='))
        .collect::<Vec<_>>()
        .join("; ");
    let mut headers = HeaderMap::new();
    if !cookies.is_empty() {
        headers.insert(COOKIE, cookies.parse().unwrap());
    }
    headers
}
