//! Control link to the admin hub
//!
//! Separate from the notification router: this connection carries the
//! admin's device commands (register, delete) and relays the hub's
//! device-added events. Commands are fire-and-forget: only invoked
//! while connected, silently dropped otherwise.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use fleetlink_hub::{ConnectionState, HubConnection, HubEndpoint, HubError};

/// Hub event announcing a device registered elsewhere.
const DEVICE_ADDED_EVENT: &str = "deviceAdded";
/// Operation deleting a registered device.
const DELETE_DEVICE_TARGET: &str = "deletePc";
/// Operation announcing a newly registered device.
const ANNOUNCE_DEVICE_TARGET: &str = "pcAdded";

const SIGNAL_CAPACITY: usize = 32;

/// Ensure the configured URL carries the `/hub` suffix.
pub fn normalize_hub_url(url: &str) -> String {
    if url.ends_with("/hub") {
        url.to_string()
    } else {
        format!("{url}/hub")
    }
}

#[derive(Debug, Clone)]
pub enum ControlSignal {
    DeviceAdded(Uuid),
}

pub struct ControlLink {
    hub: HubConnection,
    signals: broadcast::Sender<ControlSignal>,
}

impl ControlLink {
    /// Connect to the admin hub at the configured URL.
    ///
    /// Unlike the notification router, a connect failure here surfaces
    /// to the caller; the console cannot issue commands without it.
    pub async fn connect(hub_url: &str) -> Result<Arc<Self>, HubError> {
        Self::connect_with(HubEndpoint::new(normalize_hub_url(hub_url))).await
    }

    /// Connect with a fully specified endpoint (timeouts, backoff).
    pub async fn connect_with(endpoint: HubEndpoint) -> Result<Arc<Self>, HubError> {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let link = Arc::new(Self {
            hub: HubConnection::new(endpoint),
            signals,
        });

        let weak = Arc::downgrade(&link);
        link.hub.on(DEVICE_ADDED_EVENT, move |arguments| {
            let Some(link) = weak.upgrade() else { return };
            match arguments.into_iter().next().map(serde_json::from_value::<Uuid>) {
                Some(Ok(uuid)) => {
                    let _ = link.signals.send(ControlSignal::DeviceAdded(uuid));
                }
                _ => warn!("deviceAdded event without a parseable uuid"),
            }
        });

        link.hub.connect().await?;
        Ok(link)
    }

    /// Subscribe to hub-side device events.
    pub fn subscribe(&self) -> broadcast::Receiver<ControlSignal> {
        self.signals.subscribe()
    }

    /// Ask the hub to delete a device. No-op while disconnected.
    pub async fn delete_device(&self, uuid: Uuid) {
        if self.hub.state() != ConnectionState::Connected {
            return;
        }
        if let Err(e) = self.hub.invoke(DELETE_DEVICE_TARGET, vec![json!(uuid)]).await {
            warn!(%uuid, error = %e, "Device deletion invocation failed");
        }
    }

    /// Announce a newly registered device to the hub. No-op while
    /// disconnected.
    pub async fn announce_device(&self, uuid: Uuid, name: &str, host_name: &str, ip: &str) {
        if self.hub.state() != ConnectionState::Connected {
            return;
        }
        let payload = json!({
            "uuid": uuid,
            "name": name,
            "hostName": host_name,
            "ip": ip,
        });
        if let Err(e) = self.hub.invoke(ANNOUNCE_DEVICE_TARGET, vec![payload]).await {
            warn!(%uuid, error = %e, "Device announcement failed");
        }
    }

    pub async fn shutdown(&self) {
        self.hub.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_devkit::StubHub;
    use fleetlink_hub::reconnect::ReconnectConfig;
    use std::time::Duration;

    fn fast_endpoint(url: &str) -> HubEndpoint {
        let mut endpoint = HubEndpoint::new(url);
        endpoint.invoke_timeout = Duration::from_secs(2);
        // Long close delay keeps the link in Reconnecting for the
        // disconnected-command test.
        endpoint.close_retry_delay = Duration::from_secs(30);
        endpoint.reconnect = ReconnectConfig::default();
        endpoint
    }

    #[test]
    fn hub_suffix_is_appended_once() {
        assert_eq!(
            normalize_hub_url("http://192.168.1.87:5100/api"),
            "http://192.168.1.87:5100/api/hub"
        );
        assert_eq!(
            normalize_hub_url("http://192.168.1.87:5100/api/hub"),
            "http://192.168.1.87:5100/api/hub"
        );
    }

    #[tokio::test]
    async fn connect_failure_surfaces_to_the_caller() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = ControlLink::connect(&format!("http://127.0.0.1:{port}/api")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn commands_reach_the_hub_while_connected() {
        let hub = StubHub::start(&[DELETE_DEVICE_TARGET, ANNOUNCE_DEVICE_TARGET]).await.unwrap();
        let link = ControlLink::connect_with(fast_endpoint(&hub.url())).await.unwrap();

        let uuid = Uuid::new_v4();
        link.delete_device(uuid).await;
        link.announce_device(uuid, "PC-02", "pc-02", "192.168.1.51").await;

        let deletes = hub.invocations_for(DELETE_DEVICE_TARGET);
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].arguments[0], uuid.to_string());

        let announcements = hub.invocations_for(ANNOUNCE_DEVICE_TARGET);
        assert_eq!(announcements.len(), 1);
        assert_eq!(announcements[0].arguments[0]["hostName"], "pc-02");
        link.shutdown().await;
    }

    #[tokio::test]
    async fn commands_are_dropped_while_disconnected() {
        let hub = StubHub::start(&[DELETE_DEVICE_TARGET]).await.unwrap();
        let link = ControlLink::connect_with(fast_endpoint(&hub.url())).await.unwrap();

        hub.drop_clients().await;
        // Wait until the link has noticed the drop.
        for _ in 0..80 {
            if link.hub.state() != ConnectionState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_ne!(link.hub.state(), ConnectionState::Connected);

        link.delete_device(Uuid::new_v4()).await;
        assert!(hub.invocations_for(DELETE_DEVICE_TARGET).is_empty());
        link.shutdown().await;
    }

    #[tokio::test]
    async fn device_added_event_raises_the_signal() {
        let hub = StubHub::start(&[]).await.unwrap();
        let link = ControlLink::connect_with(fast_endpoint(&hub.url())).await.unwrap();
        let mut signals = link.subscribe();

        let uuid = Uuid::new_v4();
        hub.push_event(DEVICE_ADDED_EVENT, vec![serde_json::json!(uuid)]).await;

        let signal = tokio::time::timeout(Duration::from_secs(2), signals.recv())
            .await
            .expect("signal should arrive")
            .unwrap();
        let ControlSignal::DeviceAdded(id) = signal;
        assert_eq!(id, uuid);
        link.shutdown().await;
    }
}
