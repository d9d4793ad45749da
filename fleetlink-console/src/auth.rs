//! Authentication gateway for the console's REST traffic
//!
//! Wraps outbound requests with the bearer credential, detects the
//! session-expired status, and performs exactly one refresh-and-retry
//! before giving up. Refresh attempts are serialized so two requests
//! expiring at the same moment cannot invalidate each other's fresh
//! tokens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::credentials::{CredentialStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};

/// Distinguished response status meaning the access credential must be
/// refreshed before retrying.
pub const SESSION_EXPIRED_STATUS: u16 = 419;
/// Route the redirect hook is pointed at after logout.
pub const LOGIN_ROUTE: &str = "/admin-login";

type RedirectHook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginTokens {
    access_token: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshTokens {
    new_access_token: String,
    new_refresh_token: String,
}

pub struct AuthGateway {
    http: reqwest::Client,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    authenticated: AtomicBool,
    /// Serializes refresh attempts per credential store.
    refresh_gate: AsyncMutex<()>,
    redirect: Mutex<Option<RedirectHook>>,
}

impl AuthGateway {
    pub fn new(base_url: impl Into<String>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
            authenticated: AtomicBool::new(false),
            refresh_gate: AsyncMutex::new(()),
            redirect: Mutex::new(None),
        }
    }

    /// Register the navigation side effect fired on logout.
    pub fn on_redirect<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.redirect.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Absolute URL for a backend route.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Authenticate against the backend.
    ///
    /// On success both tokens are stored and the authenticated flag is
    /// set. Failure of any kind returns false without mutating stored
    /// state; no detail is leaked to the caller.
    pub async fn login(&self, name: &str, password: &str) -> bool {
        let response = match self
            .http
            .post(self.endpoint("auth/login/admin"))
            .json(&json!({"name": name, "password": password}))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Login request failed");
                return false;
            }
        };
        if !response.status().is_success() {
            return false;
        }
        let tokens: LoginTokens = match response.json().await {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!(error = %e, "Login response unreadable");
                return false;
            }
        };

        if self.store.set(ACCESS_TOKEN_KEY, &tokens.access_token).is_err()
            || self.store.set(REFRESH_TOKEN_KEY, &tokens.refresh_token).is_err()
        {
            warn!("Failed to persist session tokens");
            return false;
        }
        self.authenticated.store(true, Ordering::SeqCst);
        true
    }

    /// End the session locally.
    ///
    /// Always succeeds regardless of network state; clears the token
    /// pair, drops the flag and fires the navigation hook.
    pub fn logout(&self) {
        if let Err(e) = self.store.clear_tokens() {
            warn!(error = %e, "Failed to clear stored tokens");
        }
        self.authenticated.store(false, Ordering::SeqCst);
        if let Some(hook) = self.redirect.lock().unwrap().as_ref() {
            hook(LOGIN_ROUTE);
        }
    }

    /// Send a request with the bearer credential attached, transparently
    /// refreshing the session once when the backend reports it expired.
    ///
    /// The factory is invoked for every (re)send, since a request cannot
    /// be retransmitted once consumed. At most one refresh and one resend
    /// happen per call; a second consecutive expired status is returned
    /// as-is.
    pub async fn send_authenticated<F>(&self, build: F) -> Result<reqwest::Response, reqwest::Error>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let used_token = self.token(ACCESS_TOKEN_KEY);
        let mut request = build(&self.http);
        if let Some(token) = &used_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if response.status().as_u16() != SESSION_EXPIRED_STATUS {
            return Ok(response);
        }

        // Single-flight recovery: one refresh at a time per store.
        let _gate = self.refresh_gate.lock().await;

        // A refresh that completed while we waited already rotated the
        // tokens; resend with the fresh one instead of refreshing again.
        let current = self.token(ACCESS_TOKEN_KEY);
        if current != used_token {
            if let Some(token) = &current {
                return build(&self.http).bearer_auth(token).send().await;
            }
        }

        let refresh_token = match self.token(REFRESH_TOKEN_KEY) {
            Some(token) => token,
            None => {
                self.drop_session();
                return Ok(response);
            }
        };

        let refreshed = self
            .http
            .post(self.endpoint("auth/refresh"))
            .json(&json!({"refreshToken": refresh_token}))
            .send()
            .await;
        let refreshed = match refreshed {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(status = %r.status(), "Session refresh rejected");
                self.drop_session();
                return Ok(response);
            }
            Err(e) => {
                debug!(error = %e, "Session refresh request failed");
                self.drop_session();
                return Ok(response);
            }
        };
        let tokens: RefreshTokens = match refreshed.json().await {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!(error = %e, "Session refresh response unreadable");
                self.drop_session();
                return Ok(response);
            }
        };

        if self.store.set(ACCESS_TOKEN_KEY, &tokens.new_access_token).is_err()
            || self.store.set(REFRESH_TOKEN_KEY, &tokens.new_refresh_token).is_err()
        {
            self.drop_session();
            return Ok(response);
        }

        build(&self.http).bearer_auth(&tokens.new_access_token).send().await
    }

    fn token(&self, key: &str) -> Option<String> {
        self.store.get(key).ok().flatten().filter(|token| !token.is_empty())
    }

    /// Clear credentials and force a re-login.
    fn drop_session(&self) {
        if let Err(e) = self.store.clear_tokens() {
            warn!(error = %e, "Failed to clear stored tokens");
        }
        self.authenticated.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryStore;
    use fleetlink_devkit::StubBackend;

    async fn gateway_with_session(backend: &StubBackend) -> (AuthGateway, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let gateway = AuthGateway::new(backend.base_url(), store.clone());
        store.set(ACCESS_TOKEN_KEY, &backend.current_access_token()).unwrap();
        store.set(REFRESH_TOKEN_KEY, &backend.current_refresh_token()).unwrap();
        (gateway, store)
    }

    #[tokio::test]
    async fn login_success_stores_both_tokens() {
        let backend = StubBackend::start().await.unwrap();
        backend.accept_login("admin", "hunter2");
        let store = Arc::new(MemoryStore::new());
        let gateway = AuthGateway::new(backend.base_url(), store.clone());

        assert!(gateway.login("admin", "hunter2").await);
        assert!(gateway.is_authenticated());
        assert_eq!(
            store.get(ACCESS_TOKEN_KEY).unwrap(),
            Some(backend.current_access_token())
        );
        assert_eq!(
            store.get(REFRESH_TOKEN_KEY).unwrap(),
            Some(backend.current_refresh_token())
        );
    }

    #[tokio::test]
    async fn login_failure_mutates_nothing() {
        let backend = StubBackend::start().await.unwrap();
        backend.accept_login("admin", "hunter2");
        let store = Arc::new(MemoryStore::new());
        let gateway = AuthGateway::new(backend.base_url(), store.clone());

        assert!(!gateway.login("admin", "wrong").await);
        assert!(!gateway.is_authenticated());
        assert!(store.get(ACCESS_TOKEN_KEY).unwrap().is_none());
        assert!(store.get(REFRESH_TOKEN_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn login_against_unreachable_backend_returns_false() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let gateway = AuthGateway::new(
            format!("http://127.0.0.1:{port}"),
            Arc::new(MemoryStore::new()),
        );
        assert!(!gateway.login("admin", "hunter2").await);
    }

    #[tokio::test]
    async fn valid_session_passes_straight_through() {
        let backend = StubBackend::start().await.unwrap();
        let (gateway, _store) = gateway_with_session(&backend).await;

        let url = gateway.endpoint("api/pc");
        let response = gateway.send_authenticated(|http| http.get(&url)).await.unwrap();

        assert!(response.status().is_success());
        assert_eq!(backend.refresh_calls(), 0);
        assert_eq!(backend.device_requests(), 1);
    }

    #[tokio::test]
    async fn expired_session_refreshes_once_and_resends_once() {
        let backend = StubBackend::start().await.unwrap();
        let (gateway, store) = gateway_with_session(&backend).await;
        backend.expire_access();

        let url = gateway.endpoint("api/pc");
        let response = gateway.send_authenticated(|http| http.get(&url)).await.unwrap();

        assert!(response.status().is_success(), "resend should carry the fresh token");
        assert_eq!(backend.refresh_calls(), 1);
        assert_eq!(backend.device_requests(), 2, "one send, one resend");
        assert_eq!(
            store.get(ACCESS_TOKEN_KEY).unwrap(),
            Some(backend.current_access_token()),
            "rotated tokens must be stored"
        );
    }

    #[tokio::test]
    async fn concurrent_expiries_share_one_refresh() {
        let backend = StubBackend::start().await.unwrap();
        let (gateway, _store) = gateway_with_session(&backend).await;
        backend.expire_access();

        let url = gateway.endpoint("api/pc");
        let (first, second) = tokio::join!(
            gateway.send_authenticated(|http| http.get(&url)),
            gateway.send_authenticated(|http| http.get(&url)),
        );

        assert!(first.unwrap().status().is_success());
        assert!(second.unwrap().status().is_success());
        assert_eq!(
            backend.refresh_calls(),
            1,
            "the waiter must reuse the rotated token instead of refreshing again"
        );
    }

    #[tokio::test]
    async fn second_consecutive_expiry_does_not_refresh_again() {
        let backend = StubBackend::start().await.unwrap();
        let (gateway, _store) = gateway_with_session(&backend).await;
        backend.set_rotate_on_refresh(false);
        backend.expire_access();

        let url = gateway.endpoint("api/pc");
        let response = gateway.send_authenticated(|http| http.get(&url)).await.unwrap();

        assert_eq!(response.status().as_u16(), SESSION_EXPIRED_STATUS);
        assert_eq!(backend.refresh_calls(), 1, "bounded retry: exactly one refresh");
        assert_eq!(backend.device_requests(), 2, "exactly one resend");
    }

    #[tokio::test]
    async fn missing_refresh_token_clears_the_pair_and_returns_the_expiry() {
        let backend = StubBackend::start().await.unwrap();
        let store = Arc::new(MemoryStore::new());
        let gateway = AuthGateway::new(backend.base_url(), store.clone());
        store.set(ACCESS_TOKEN_KEY, "stale").unwrap();

        let url = gateway.endpoint("api/pc");
        let response = gateway.send_authenticated(|http| http.get(&url)).await.unwrap();

        assert_eq!(response.status().as_u16(), SESSION_EXPIRED_STATUS);
        assert_eq!(backend.refresh_calls(), 0);
        assert!(store.get(ACCESS_TOKEN_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_refresh_clears_tokens_and_returns_the_expiry() {
        let backend = StubBackend::start().await.unwrap();
        let (gateway, store) = gateway_with_session(&backend).await;
        backend.set_refresh_ok(false);
        backend.expire_access();

        let url = gateway.endpoint("api/pc");
        let response = gateway.send_authenticated(|http| http.get(&url)).await.unwrap();

        assert_eq!(response.status().as_u16(), SESSION_EXPIRED_STATUS);
        assert_eq!(backend.refresh_calls(), 1);
        assert!(store.get(ACCESS_TOKEN_KEY).unwrap().is_none());
        assert!(store.get(REFRESH_TOKEN_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn logout_clears_the_session_and_navigates() {
        let backend = StubBackend::start().await.unwrap();
        backend.accept_login("admin", "hunter2");
        let store = Arc::new(MemoryStore::new());
        let gateway = AuthGateway::new(backend.base_url(), store.clone());

        let visited = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = visited.clone();
        gateway.on_redirect(move |route| log.lock().unwrap().push(route.to_string()));

        assert!(gateway.login("admin", "hunter2").await);
        gateway.logout();

        assert!(!gateway.is_authenticated());
        assert!(store.get(ACCESS_TOKEN_KEY).unwrap().is_none());
        assert!(store.get(REFRESH_TOKEN_KEY).unwrap().is_none());
        assert_eq!(visited.lock().unwrap().as_slice(), [LOGIN_ROUTE]);
    }
}
