//! Persistent connection to a hub endpoint.
//!
//! [`HubConnection`] owns one logical connection to a hub and keeps it
//! alive across socket failures. A single supervisor task holds the raw
//! WebSocket: it drains a FIFO outbox (so invocations leave in call
//! order), routes completions back to their waiting callers, dispatches
//! hub-initiated events to registered handlers, and redials with backoff
//! when the socket drops. The raw socket is never exposed to callers;
//! they only see [`HubConnection::invoke`], [`HubConnection::on`] and the
//! current [`ConnectionState`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::HubError;
use crate::frames::{parse_frame, Frame};
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// The WebSocket stream type the channel runs over.
pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

type EventHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;
type PendingMap = HashMap<String, oneshot::Sender<Result<Option<Value>, String>>>;

/// Lifecycle states of a hub connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Configuration handle for one hub endpoint.
pub struct HubEndpoint {
    url: String,
    /// How long [`HubConnection::invoke`] waits for a completion.
    pub invoke_timeout: Duration,
    /// Fixed pause after an unexpected closure before redialing starts.
    pub close_retry_delay: Duration,
    /// Backoff parameters for the redial loop.
    pub reconnect: ReconnectConfig,
}

impl HubEndpoint {
    /// Create an endpoint for a hub URL.
    ///
    /// `http`/`https` URLs are rewritten to the `ws`/`wss` scheme the
    /// transport dials; `ws`/`wss` URLs pass through unchanged.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: normalize_ws_url(&url.into()),
            invoke_timeout: Duration::from_secs(30),
            close_retry_delay: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// The WebSocket URL this endpoint dials.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Dial the endpoint once.
    pub(crate) async fn dial(&self) -> Result<WsStream, HubError> {
        let (stream, _response) = connect_async(&self.url).await.map_err(|e| {
            HubError::Transport(format!("failed to connect to {}: {e}", self.url))
        })?;
        Ok(stream)
    }
}

/// Map an `http(s)` endpoint URL to the `ws(s)` scheme the transport dials.
pub fn normalize_ws_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// A persistent, auto-reconnecting connection to one hub endpoint.
///
/// Cheap to clone; all clones share the same underlying connection.
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: HubEndpoint,
    state: Mutex<ConnectionState>,
    /// FIFO into the supervisor's write half. Present once the first
    /// connect succeeds; survives reconnects.
    outbox: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pending: Mutex<PendingMap>,
    handlers: Mutex<HashMap<String, EventHandler>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Serializes connect attempts so state transitions never race.
    connect_gate: AsyncMutex<()>,
    cancel: CancellationToken,
}

impl HubConnection {
    pub fn new(endpoint: HubEndpoint) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                state: Mutex::new(ConnectionState::Disconnected),
                outbox: Mutex::new(None),
                pending: Mutex::new(PendingMap::new()),
                handlers: Mutex::new(HashMap::new()),
                supervisor: Mutex::new(None),
                connect_gate: AsyncMutex::new(()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    /// Establish the connection.
    ///
    /// Idempotent: already Connected is a no-op, and while a recovery is
    /// in flight (Connecting/Reconnecting) the call returns immediately
    /// and leaves the supervisor to finish it. Only from Disconnected
    /// does this dial the endpoint.
    pub async fn connect(&self) -> Result<(), HubError> {
        let _gate = self.inner.connect_gate.lock().await;
        if self.inner.cancel.is_cancelled() {
            return Err(HubError::Cancelled);
        }
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting | ConnectionState::Reconnecting => return Ok(()),
            ConnectionState::Disconnected => {}
        }

        self.inner.set_state(ConnectionState::Connecting);
        let stream = tokio::select! {
            _ = self.inner.cancel.cancelled() => {
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(HubError::Cancelled);
            }
            result = self.inner.endpoint.dial() => match result {
                Ok(stream) => stream,
                Err(e) => {
                    self.inner.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbox.lock().unwrap() = Some(tx);
        self.inner.set_state(ConnectionState::Connected);
        tracing::info!(url = %self.inner.endpoint.url(), "Connected to hub");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(supervise(inner, stream, rx));
        *self.inner.supervisor.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Send a remote call and await its single completion.
    ///
    /// Fails with [`HubError::NotConnected`] when no connection is live,
    /// [`HubError::RemoteRejected`] when the hub reports the target
    /// unknown or erroring, and [`HubError::Timeout`] when no completion
    /// arrives inside the endpoint's invoke window (a late completion is
    /// then dropped).
    pub async fn invoke(
        &self,
        target: &str,
        arguments: Vec<Value>,
    ) -> Result<Option<Value>, HubError> {
        let sender = {
            if self.state() != ConnectionState::Connected {
                return Err(HubError::NotConnected);
            }
            match self.inner.outbox.lock().unwrap().as_ref() {
                Some(tx) => tx.clone(),
                None => return Err(HubError::NotConnected),
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(id.clone(), reply_tx);

        let frame = Frame::Invocation {
            id: id.clone(),
            target: target.to_string(),
            arguments,
        };
        if sender.send(frame).is_err() {
            self.inner.pending.lock().unwrap().remove(&id);
            return Err(HubError::NotConnected);
        }

        let window = self.inner.endpoint.invoke_timeout;
        tokio::select! {
            _ = self.inner.cancel.cancelled() => {
                self.inner.pending.lock().unwrap().remove(&id);
                Err(HubError::Cancelled)
            }
            outcome = tokio::time::timeout(window, reply_rx) => match outcome {
                Err(_) => {
                    self.inner.pending.lock().unwrap().remove(&id);
                    Err(HubError::Timeout(window))
                }
                // Sender dropped: the connection died under us.
                Ok(Err(_)) => Err(HubError::NotConnected),
                Ok(Ok(Ok(result))) => Ok(result),
                Ok(Ok(Err(reason))) => Err(HubError::RemoteRejected(reason)),
            }
        }
    }

    /// Register the handler for a hub-initiated event.
    ///
    /// Exactly one handler per event name: registering again replaces the
    /// previous one. Handlers run on the supervisor task and must not
    /// block; a panicking handler is caught and logged, never fatal.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(event.to_string(), Arc::new(handler));
    }

    /// Shut the connection down.
    ///
    /// Best-effort close-then-drop: the supervisor performs the close
    /// handshake and is awaited for a bounded grace period. Errors during
    /// shutdown are logged, never returned.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                tracing::warn!(url = %self.inner.endpoint.url(), "Supervisor did not stop in time");
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
        tracing::info!(url = %self.inner.endpoint.url(), "Hub connection stopped");
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Drop all in-flight invocation waiters. Their receivers observe a
    /// closed channel, which `invoke` maps to `NotConnected`.
    fn fail_pending(&self) {
        self.pending.lock().unwrap().clear();
    }

    /// Dispatch one inbound text frame.
    fn route_frame(&self, text: &str) {
        match parse_frame(text) {
            Ok(Frame::Completion { id, result, error }) => {
                let waiter = self.pending.lock().unwrap().remove(&id);
                match waiter {
                    Some(tx) => {
                        let outcome = match error {
                            Some(reason) => Err(reason),
                            None => Ok(result),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => tracing::debug!(%id, "Completion for unknown or expired invocation"),
                }
            }
            Ok(Frame::Event { target, arguments }) => {
                let handler = self.handlers.lock().unwrap().get(&target).cloned();
                match handler {
                    Some(handler) => {
                        let caught = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            handler(arguments)
                        }));
                        if caught.is_err() {
                            tracing::warn!(event = %target, "Event handler panicked");
                        }
                    }
                    None => tracing::debug!(event = %target, "No handler registered for event"),
                }
            }
            Ok(Frame::Invocation { target, .. }) => {
                tracing::debug!(%target, "Ignoring client-bound invocation frame");
            }
            Err(e) => {
                tracing::warn!(error = %e, raw = %text, "Failed to parse hub frame");
            }
        }
    }
}

/// Supervisor loop: process the live socket, then recover or bail.
///
/// Runs until cancellation. On an unexpected closure it fails all pending
/// invocations, waits the fixed close delay, and redials with backoff;
/// the fresh socket is swapped in behind the same handle.
async fn supervise(inner: Arc<Inner>, mut stream: WsStream, mut outbox: mpsc::UnboundedReceiver<Frame>) {
    loop {
        run_io(&inner, &mut stream, &mut outbox).await;
        inner.fail_pending();

        if inner.cancel.is_cancelled() {
            inner.set_state(ConnectionState::Disconnected);
            return;
        }

        inner.set_state(ConnectionState::Reconnecting);
        tracing::warn!(
            url = %inner.endpoint.url(),
            "Hub connection closed unexpectedly, retrying in {:?}",
            inner.endpoint.close_retry_delay,
        );
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
            _ = tokio::time::sleep(inner.endpoint.close_retry_delay) => {}
        }

        match reconnect_loop(&inner.endpoint, &inner.endpoint.reconnect, &inner.cancel).await {
            Some(fresh) => {
                // Invocations queued against the dead socket were already
                // failed; drop their frames instead of replaying them.
                while outbox.try_recv().is_ok() {}
                stream = fresh;
                inner.set_state(ConnectionState::Connected);
            }
            None => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
        }
    }
}

/// Pump one socket until it closes, errors, or shutdown is requested.
async fn run_io(inner: &Inner, stream: &mut WsStream, outbox: &mut mpsc::UnboundedReceiver<Frame>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                // Best-effort close handshake on the way out.
                if let Err(e) = stream.close(None).await {
                    tracing::debug!(error = %e, "Close handshake failed");
                }
                return;
            }
            frame = outbox.recv() => match frame {
                Some(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to encode outbound frame");
                            continue;
                        }
                    };
                    if let Err(e) = stream.send(Message::Text(text)).await {
                        tracing::warn!(error = %e, "Hub write failed");
                        return;
                    }
                }
                // Every clone of the connection handle is gone.
                None => return,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => inner.route_frame(&text),
                Some(Ok(Message::Binary(_))) => {
                    tracing::trace!("Ignoring binary frame");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(?frame, "Hub closed the connection");
                    return;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Hub read error");
                    return;
                }
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_devkit::hub_stub::StubHub;
    use serde_json::json;
    use std::time::Duration;

    fn fast_endpoint(url: &str) -> HubEndpoint {
        let mut endpoint = HubEndpoint::new(url);
        endpoint.invoke_timeout = Duration::from_secs(2);
        endpoint.close_retry_delay = Duration::from_millis(50);
        endpoint.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: Duration::from_millis(10),
        };
        endpoint
    }

    #[test]
    fn http_urls_are_rewritten_to_ws() {
        assert_eq!(normalize_ws_url("http://10.0.0.1:5100/api/metrics-stream"),
                   "ws://10.0.0.1:5100/api/metrics-stream");
        assert_eq!(normalize_ws_url("https://hub.local/hub"), "wss://hub.local/hub");
        assert_eq!(normalize_ws_url("ws://10.0.0.1:5100/hub"), "ws://10.0.0.1:5100/hub");
    }

    #[tokio::test]
    async fn invoke_without_connect_is_not_connected() {
        let conn = HubConnection::new(fast_endpoint("http://127.0.0.1:9"));
        match conn.invoke("publishMetrics", vec![]).await {
            Err(HubError::NotConnected) => {}
            other => panic!("Expected NotConnected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let hub = StubHub::start(&["publishMetrics"]).await.unwrap();
        let conn = HubConnection::new(fast_endpoint(&hub.url()));

        conn.connect().await.unwrap();
        conn.connect().await.unwrap();
        conn.connect().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);
        // Give the stub a moment to register the (single) client.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.connected_clients(), 1);
        conn.stop().await;
    }

    #[tokio::test]
    async fn invoke_roundtrip_succeeds() {
        let hub = StubHub::start(&["publishMetrics"]).await.unwrap();
        let conn = HubConnection::new(fast_endpoint(&hub.url()));
        conn.connect().await.unwrap();

        conn.invoke("publishMetrics", vec![json!({"cpu": 40.0})]).await.unwrap();

        let recorded = hub.invocations_for("publishMetrics");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].arguments[0]["cpu"], 40.0);
        conn.stop().await;
    }

    #[tokio::test]
    async fn unknown_target_is_remote_rejected() {
        let hub = StubHub::start(&["publishMetrics"]).await.unwrap();
        let conn = HubConnection::new(fast_endpoint(&hub.url()));
        conn.connect().await.unwrap();

        match conn.invoke("sendMessage", vec![json!("hello")]).await {
            Err(HubError::RemoteRejected(reason)) => assert!(reason.contains("sendMessage")),
            other => panic!("Expected RemoteRejected, got {other:?}"),
        }
        conn.stop().await;
    }

    #[tokio::test]
    async fn event_reaches_registered_handler() {
        let hub = StubHub::start(&[]).await.unwrap();
        let conn = HubConnection::new(fast_endpoint(&hub.url()));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on("deviceAdded", move |arguments| {
            let _ = tx.send(arguments);
        });
        conn.connect().await.unwrap();

        hub.push_event("deviceAdded", vec![json!("abc")]).await;

        let arguments = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event should arrive")
            .unwrap();
        assert_eq!(arguments[0], "abc");
        conn.stop().await;
    }

    #[tokio::test]
    async fn reregistering_replaces_the_handler() {
        let hub = StubHub::start(&[]).await.unwrap();
        let conn = HubConnection::new(fast_endpoint(&hub.url()));

        let (old_tx, mut old_rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on("deviceAdded", move |_| {
            let _ = old_tx.send(());
        });
        let (new_tx, mut new_rx) = tokio::sync::mpsc::unbounded_channel();
        conn.on("deviceAdded", move |_| {
            let _ = new_tx.send(());
        });

        conn.connect().await.unwrap();
        hub.push_event("deviceAdded", vec![json!("abc")]).await;

        tokio::time::timeout(Duration::from_secs(2), new_rx.recv())
            .await
            .expect("replacement handler should fire")
            .unwrap();
        assert!(old_rx.try_recv().is_err());
        conn.stop().await;
    }

    #[tokio::test]
    async fn reconnects_after_server_drop() {
        let hub = StubHub::start(&["publishMetrics"]).await.unwrap();
        let conn = HubConnection::new(fast_endpoint(&hub.url()));
        conn.connect().await.unwrap();

        hub.drop_clients().await;

        // Wait out the close delay plus a couple of backoff rounds.
        let mut recovered = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            if conn.state() == ConnectionState::Connected {
                recovered = true;
                break;
            }
        }
        assert!(recovered, "connection should recover without intervention");
        conn.invoke("publishMetrics", vec![]).await.unwrap();
        conn.stop().await;
    }

    #[tokio::test]
    async fn stop_is_terminal() {
        let hub = StubHub::start(&["publishMetrics"]).await.unwrap();
        let conn = HubConnection::new(fast_endpoint(&hub.url()));
        conn.connect().await.unwrap();
        conn.stop().await;

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        match conn.connect().await {
            Err(HubError::Cancelled) => {}
            other => panic!("Expected Cancelled, got {other:?}"),
        }
    }
}
