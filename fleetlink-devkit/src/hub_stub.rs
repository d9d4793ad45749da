/*!
Scriptable stub hub for development without a live hub

Accepts WebSocket clients, answers invocations for a configurable set of
supported targets (anything else is rejected as an unknown target), records
every invocation for assertions, and can push events or drop clients on
demand to simulate hub-side behavior.
*/

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use fleetlink_hub::frames::{parse_frame, Frame};

/// One invocation received from a client, as the hub saw it.
#[derive(Debug, Clone)]
pub struct RecordedInvocation {
    pub target: String,
    pub arguments: Vec<Value>,
}

/// Commands the stub pushes into a connected client's session.
enum ClientCommand {
    Event(Frame),
    Close,
}

struct Shared {
    supported: Mutex<HashSet<String>>,
    invocations: Mutex<Vec<RecordedInvocation>>,
    clients: Mutex<Vec<mpsc::UnboundedSender<ClientCommand>>>,
}

/// In-process hub double listening on an ephemeral localhost port.
pub struct StubHub {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl StubHub {
    /// Bind on `127.0.0.1:0` and start accepting clients.
    ///
    /// `supported` lists the invocation targets the stub completes
    /// successfully; every other target gets an "unknown target" error
    /// completion.
    pub async fn start(supported: &[&str]) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            supported: Mutex::new(supported.iter().map(|s| s.to_string()).collect()),
            invocations: Mutex::new(Vec::new()),
            clients: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    return;
                };
                log::info!("[STUB] client connected from {peer}");
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    if let Err(e) = serve_client(shared, stream).await {
                        log::info!("[STUB] client session ended: {e}");
                    }
                });
            }
        });

        Ok(Self { addr, shared })
    }

    /// Base URL clients dial (`http://` scheme; the client side rewrites
    /// it to `ws://`). The stub ignores the request path, so any hub
    /// route can be appended.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Replace the set of targets the stub completes successfully.
    pub fn set_supported(&self, targets: &[&str]) {
        *self.shared.supported.lock().unwrap() =
            targets.iter().map(|s| s.to_string()).collect();
    }

    /// All invocations received so far, in arrival order.
    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.shared.invocations.lock().unwrap().clone()
    }

    /// Invocations received for one target, in arrival order.
    pub fn invocations_for(&self, target: &str) -> Vec<RecordedInvocation> {
        self.shared
            .invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|inv| inv.target == target)
            .cloned()
            .collect()
    }

    /// Poll until `target` has been invoked at least `count` times.
    ///
    /// Returns `false` on timeout so tests can assert with context.
    pub async fn wait_for_invocations(&self, target: &str, count: usize, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.invocations_for(target).len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    /// Number of currently connected clients.
    pub fn connected_clients(&self) -> usize {
        self.shared
            .clients
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Push an event frame to every connected client.
    pub async fn push_event(&self, target: &str, arguments: Vec<Value>) {
        let frame = Frame::Event {
            target: target.to_string(),
            arguments,
        };
        let clients = self.shared.clients.lock().unwrap().clone();
        for client in clients {
            let _ = client.send(ClientCommand::Event(frame.clone()));
        }
        log::info!("[STUB] pushed event: {target}");
    }

    /// Close every client connection, simulating a hub-side drop.
    pub async fn drop_clients(&self) {
        let clients: Vec<_> = self.shared.clients.lock().unwrap().drain(..).collect();
        for client in clients {
            let _ = client.send(ClientCommand::Close);
        }
        log::info!("[STUB] dropped all clients");
    }

    /// Forget all recorded invocations.
    pub fn clear(&self) {
        self.shared.invocations.lock().unwrap().clear();
    }
}

/// Drive one client session: record invocations, answer completions,
/// relay pushed events, honor a close command.
async fn serve_client(shared: Arc<Shared>, stream: tokio::net::TcpStream) -> Result<()> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    shared.clients.lock().unwrap().push(tx);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(ClientCommand::Event(frame)) => {
                    let text = serde_json::to_string(&frame)?;
                    ws.send(Message::Text(text)).await?;
                }
                Some(ClientCommand::Close) | None => {
                    let _ = ws.close(None).await;
                    return Ok(());
                }
            },
            message = ws.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(Frame::Invocation { id, target, arguments }) = parse_frame(&text) {
                        shared.invocations.lock().unwrap().push(RecordedInvocation {
                            target: target.clone(),
                            arguments,
                        });
                        let supported = shared.supported.lock().unwrap().contains(&target);
                        let completion = if supported {
                            Frame::Completion { id, result: None, error: None }
                        } else {
                            Frame::Completion {
                                id,
                                result: None,
                                error: Some(format!("unknown target: {target}")),
                            }
                        };
                        ws.send(Message::Text(serde_json::to_string(&completion)?)).await?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }
}
