/*!
Stub backend HTTP server for auth and device-registry development

Implements the backend routes the console client consumes:
- `POST /auth/login/admin` with a configurable accepted credential pair
- `POST /auth/refresh` with scriptable success, failure and rotation
- `GET/POST /api/pc` and `DELETE /api/pc/{uuid}` guarded by the current
  access token; a stale token gets the session-expired status (419)

Counters and token accessors let tests assert exactly how many refreshes
and resends a client performed.
*/

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Distinguished status the backend answers with when the access token
/// has expired and must be refreshed.
const SESSION_EXPIRED: u16 = 419;

pub struct BackendState {
    /// Credential pair `POST /auth/login/admin` accepts, if any.
    accepted_login: Mutex<Option<(String, String)>>,
    /// Access token the `/api` guard currently accepts.
    access_token: Mutex<String>,
    /// Refresh token `/auth/refresh` currently accepts.
    refresh_token: Mutex<String>,
    /// When false, `/auth/refresh` fails with a non-success status.
    refresh_ok: AtomicBool,
    /// When false, refresh hands out new tokens but the guard keeps
    /// expecting the old access token (drives the repeated-419 case).
    rotate_on_refresh: AtomicBool,
    refresh_calls: AtomicUsize,
    device_requests: AtomicUsize,
    devices: Mutex<Vec<Value>>,
    generation: AtomicUsize,
}

/// In-process backend double listening on an ephemeral localhost port.
pub struct StubBackend {
    addr: SocketAddr,
    state: Arc<BackendState>,
}

impl StubBackend {
    /// Bind on `127.0.0.1:0` and start serving.
    ///
    /// Initial tokens are `access-0` / `refresh-0`; no login is accepted
    /// until [`accept_login`](Self::accept_login) is called.
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(BackendState {
            accepted_login: Mutex::new(None),
            access_token: Mutex::new("access-0".to_string()),
            refresh_token: Mutex::new("refresh-0".to_string()),
            refresh_ok: AtomicBool::new(true),
            rotate_on_refresh: AtomicBool::new(true),
            refresh_calls: AtomicUsize::new(0),
            device_requests: AtomicUsize::new(0),
            devices: Mutex::new(Vec::new()),
            generation: AtomicUsize::new(0),
        });

        let router = build_router(Arc::clone(&state));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                log::warn!("[STUB] backend server stopped: {e}");
            }
        });

        Ok(Self { addr, state })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Configure the one credential pair login accepts.
    pub fn accept_login(&self, name: &str, password: &str) {
        *self.state.accepted_login.lock().unwrap() =
            Some((name.to_string(), password.to_string()));
    }

    /// The access token the `/api` guard currently accepts.
    pub fn current_access_token(&self) -> String {
        self.state.access_token.lock().unwrap().clone()
    }

    pub fn current_refresh_token(&self) -> String {
        self.state.refresh_token.lock().unwrap().clone()
    }

    /// Invalidate the outstanding access token without telling clients,
    /// so their next guarded request sees the session-expired status.
    pub fn expire_access(&self) {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.access_token.lock().unwrap() = format!("access-{generation}");
    }

    /// Script whether `/auth/refresh` succeeds.
    pub fn set_refresh_ok(&self, ok: bool) {
        self.state.refresh_ok.store(ok, Ordering::SeqCst);
    }

    /// Script whether a successful refresh actually rotates the token the
    /// guard accepts. With rotation off, a refreshed client keeps getting
    /// 419s (the bounded-retry scenario).
    pub fn set_rotate_on_refresh(&self, rotate: bool) {
        self.state.rotate_on_refresh.store(rotate, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn device_requests(&self) -> usize {
        self.state.device_requests.load(Ordering::SeqCst)
    }

    /// Seed the device list returned by `GET /api/pc`.
    pub fn push_device(&self, device: Value) {
        self.state.devices.lock().unwrap().push(device);
    }

    pub fn devices(&self) -> Vec<Value> {
        self.state.devices.lock().unwrap().clone()
    }
}

fn build_router(state: Arc<BackendState>) -> Router {
    Router::new()
        .route("/auth/login/admin", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/api/pc", get(list_devices).post(add_device))
        .route("/api/pc/{uuid}", delete(remove_device))
        .with_state(state)
}

async fn login(
    State(state): State<Arc<BackendState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let name = body["name"].as_str().unwrap_or_default();
    let password = body["password"].as_str().unwrap_or_default();
    let accepted = state.accepted_login.lock().unwrap().clone();

    match accepted {
        Some((expected_name, expected_password))
            if name == expected_name && password == expected_password =>
        {
            let tokens = json!({
                "accessToken": state.access_token.lock().unwrap().clone(),
                "refreshToken": state.refresh_token.lock().unwrap().clone(),
            });
            (StatusCode::OK, Json(tokens))
        }
        _ => (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid credentials"}))),
    }
}

async fn refresh(
    State(state): State<Arc<BackendState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);

    if !state.refresh_ok.load(Ordering::SeqCst) {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "refresh rejected"})));
    }
    let presented = body["refreshToken"].as_str().unwrap_or_default();
    if presented != *state.refresh_token.lock().unwrap() {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unknown refresh token"})));
    }

    let generation = state.generation.fetch_add(1, Ordering::SeqCst) + 1;
    let new_access = format!("access-{generation}");
    let new_refresh = format!("refresh-{generation}");
    if state.rotate_on_refresh.load(Ordering::SeqCst) {
        *state.access_token.lock().unwrap() = new_access.clone();
    }
    *state.refresh_token.lock().unwrap() = new_refresh.clone();

    let tokens = json!({
        "newAccessToken": new_access,
        "newRefreshToken": new_refresh,
    });
    (StatusCode::OK, Json(tokens))
}

/// Check the bearer token against the currently accepted access token.
fn authorized(state: &BackendState, headers: &HeaderMap) -> bool {
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    presented == *state.access_token.lock().unwrap()
}

fn session_expired() -> StatusCode {
    StatusCode::from_u16(SESSION_EXPIRED).expect("419 is a valid status code")
}

async fn list_devices(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.device_requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return (session_expired(), Json(json!({"error": "session expired"})));
    }
    let devices = state.devices.lock().unwrap().clone();
    (StatusCode::OK, Json(Value::Array(devices)))
}

async fn add_device(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.device_requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return (session_expired(), Json(json!({"error": "session expired"})));
    }
    state.devices.lock().unwrap().push(body);
    (StatusCode::OK, Json(json!({"ok": true})))
}

async fn remove_device(
    State(state): State<Arc<BackendState>>,
    headers: HeaderMap,
    Path(uuid): Path<String>,
) -> (StatusCode, Json<Value>) {
    state.device_requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(&state, &headers) {
        return (session_expired(), Json(json!({"error": "session expired"})));
    }
    state
        .devices
        .lock()
        .unwrap()
        .retain(|device| device["uuid"].as_str() != Some(uuid.as_str()));
    (StatusCode::OK, Json(json!({"ok": true})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn login_round_trip() {
        let backend = StubBackend::start().await.unwrap();
        backend.accept_login("admin", "hunter2");

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/auth/login/admin", backend.base_url()))
            .json(&json!({"name": "admin", "password": "hunter2"}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let tokens: Value = response.json().await.unwrap();
        assert_eq!(tokens["accessToken"], "access-0");
        assert_eq!(tokens["refreshToken"], "refresh-0");

        let response = client
            .post(format!("{}/auth/login/admin", backend.base_url()))
            .json(&json!({"name": "admin", "password": "wrong"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 401);
    }

    #[tokio::test]
    async fn stale_token_gets_session_expired() {
        let backend = StubBackend::start().await.unwrap();
        let stale = backend.current_access_token();
        backend.expire_access();

        let client = reqwest::Client::new();
        let response = client
            .get(format!("{}/api/pc", backend.base_url()))
            .bearer_auth(&stale)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 419);

        let response = client
            .get(format!("{}/api/pc", backend.base_url()))
            .bearer_auth(backend.current_access_token())
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    #[tokio::test]
    async fn refresh_rotates_tokens() {
        let backend = StubBackend::start().await.unwrap();
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/auth/refresh", backend.base_url()))
            .json(&json!({"refreshToken": backend.current_refresh_token()}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        let tokens: Value = response.json().await.unwrap();
        assert_eq!(tokens["newAccessToken"], backend.current_access_token());
        assert_eq!(backend.refresh_calls(), 1);
    }
}
