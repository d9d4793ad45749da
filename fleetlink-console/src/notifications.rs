//! Notification routing for the admin console
//!
//! [`NotificationRouter`] keeps the ordered in-memory notification list
//! and owns its own hub subscription: session requests and
//! unknown-machine detections arrive as hub events and fan out to UI
//! observers as typed signals. A hub that cannot be reached at
//! construction time becomes a visible error notification instead of a
//! construction failure.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use fleetlink_hub::{ConnectionState, HubConnection, HubEndpoint};

/// Hub event announcing a user's session request.
const SESSION_REQUESTED_EVENT: &str = "sessionRequested";
/// Hub event announcing metrics from an unregistered machine.
const UNKNOWN_DEVICE_EVENT: &str = "unknownDeviceDetected";
/// Operation carrying the admin's answer to a session request.
const SESSION_RESPONSE_TARGET: &str = "sendSessionResponse";

const SIGNAL_CAPACITY: usize = 64;

/// A user's request to start a session on a machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub pc_id: i32,
    pub username: String,
}

/// The admin's answer, sent back through the hub in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub pc_id: i32,
    pub username: String,
    pub duration_minutes: i32,
    pub requested_at: DateTime<Utc>,
    pub is_approved: bool,
}

impl SessionResponse {
    /// Approve a request for the given session length.
    pub fn approve(request: &SessionRequest, duration_minutes: i32) -> Self {
        Self {
            pc_id: request.pc_id,
            username: request.username.clone(),
            duration_minutes,
            requested_at: Utc::now(),
            is_approved: true,
        }
    }
}

/// Payload of an unknown-machine detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnknownDeviceData {
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
    SessionRequest,
    UnknownDevice,
}

/// One entry in the console's notification list.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// Persistent notifications stay until explicitly dismissed.
    pub persistent: bool,
    /// Opaque event payload (session request, unknown device data).
    pub payload: Option<Value>,
}

impl Notification {
    pub fn new(kind: NotificationKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            title: title.into(),
            message: message.into(),
            created_at: Utc::now(),
            persistent: false,
            payload: None,
        }
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Signals fanned out to every subscribed observer.
#[derive(Debug, Clone)]
pub enum RouterSignal {
    /// The notification list changed (append, removal or clear).
    Changed,
    /// An unknown machine reported in; an observer may prompt to
    /// register it.
    AddDeviceRequested(Uuid),
}

pub struct NotificationRouter {
    notifications: Mutex<Vec<Notification>>,
    signals: broadcast::Sender<RouterSignal>,
    hub: HubConnection,
}

impl NotificationRouter {
    /// Create the router and establish its own hub subscription.
    ///
    /// Never fails: an unreachable hub is reported as a non-persistent
    /// error notification so the UI can surface it.
    pub async fn connect(endpoint: HubEndpoint) -> Arc<Self> {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        let router = Arc::new(Self {
            notifications: Mutex::new(Vec::new()),
            signals,
            hub: HubConnection::new(endpoint),
        });

        let weak = Arc::downgrade(&router);
        router.hub.on(SESSION_REQUESTED_EVENT, move |arguments| {
            if let Some(router) = weak.upgrade() {
                router.on_session_requested(arguments);
            }
        });
        let weak = Arc::downgrade(&router);
        router.hub.on(UNKNOWN_DEVICE_EVENT, move |arguments| {
            if let Some(router) = weak.upgrade() {
                router.on_unknown_device(arguments);
            }
        });

        if let Err(e) = router.hub.connect().await {
            warn!(error = %e, "Could not reach the notification hub");
            router.add(Notification::new(
                NotificationKind::Error,
                "Connection error",
                "Could not connect to the notification hub",
            ));
        }

        router
    }

    /// Subscribe to list changes and add-device requests.
    pub fn subscribe(&self) -> broadcast::Receiver<RouterSignal> {
        self.signals.subscribe()
    }

    /// Snapshot of the list in insertion order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    /// Append a notification and signal the change.
    pub fn add(&self, notification: Notification) {
        self.notifications.lock().unwrap().push(notification);
        let _ = self.signals.send(RouterSignal::Changed);
    }

    /// Remove the first notification with the given id.
    ///
    /// Removing an id that is not present is a silent no-op: the list is
    /// unchanged and no Changed signal is raised.
    pub fn remove(&self, id: &str) {
        let mut notifications = self.notifications.lock().unwrap();
        let Some(index) = notifications.iter().position(|n| n.id == id) else {
            return;
        };
        notifications.remove(index);
        drop(notifications);
        let _ = self.signals.send(RouterSignal::Changed);
    }

    /// Empty the list and signal the change.
    pub fn clear_all(&self) {
        self.notifications.lock().unwrap().clear();
        let _ = self.signals.send(RouterSignal::Changed);
    }

    /// Let a local caller raise the add-device prompt directly.
    pub fn request_add_device(&self, uuid: Uuid) {
        let _ = self.signals.send(RouterSignal::AddDeviceRequested(uuid));
    }

    /// Send the admin's answer back through the hub.
    ///
    /// Fire-and-forget: only invoked while connected, silently a no-op
    /// otherwise. No queuing, no retry.
    pub async fn send_session_response(&self, response: SessionResponse) {
        if self.hub.state() != ConnectionState::Connected {
            return;
        }
        let payload = match serde_json::to_value(&response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize session response");
                return;
            }
        };
        if let Err(e) = self.hub.invoke(SESSION_RESPONSE_TARGET, vec![payload]).await {
            warn!(error = %e, "Session response delivery failed");
        }
    }

    pub async fn shutdown(&self) {
        self.hub.stop().await;
    }

    fn on_session_requested(&self, arguments: Vec<Value>) {
        let Some(payload) = arguments.into_iter().next() else {
            debug!("sessionRequested event without payload");
            return;
        };
        let request: SessionRequest = match serde_json::from_value(payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Unparseable session request");
                return;
            }
        };
        self.add(
            Notification::new(
                NotificationKind::SessionRequest,
                "Session request",
                format!(
                    "User {} wants to start a session on machine {}",
                    request.username, request.pc_id
                ),
            )
            .persistent()
            .with_payload(payload),
        );
    }

    fn on_unknown_device(&self, arguments: Vec<Value>) {
        let Some(payload) = arguments.into_iter().next() else {
            debug!("unknownDeviceDetected event without payload");
            return;
        };
        let data: UnknownDeviceData = match serde_json::from_value(payload.clone()) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Unparseable unknown-device event");
                return;
            }
        };
        self.add(
            Notification::new(
                NotificationKind::UnknownDevice,
                "Unknown machine",
                format!("Machine {} sent metrics but is not registered", data.uuid),
            )
            .persistent()
            .with_payload(payload),
        );
        let _ = self.signals.send(RouterSignal::AddDeviceRequested(data.uuid));
    }
}
