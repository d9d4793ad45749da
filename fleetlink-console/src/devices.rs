//! Device directory for the admin console
//!
//! Caches the registered machine list from the backend and keeps it
//! current: REST CRUD through the auth gateway, plus an apply-metrics
//! entry point that matches incoming snapshots to cached records by
//! uuid or IP. Observers subscribe to a change signal and re-read the
//! snapshot; the cache itself is only mutated inside brief lock windows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AuthGateway;

const DEVICES_ROUTE: &str = "api/pc";
const SIGNAL_CAPACITY: usize = 64;

/// Latest metrics applied to a device record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetrics {
    pub uuid: Uuid,
    pub cpu: f32,
    pub ram: f32,
    pub ip: String,
    pub received_at: DateTime<Utc>,
}

/// One registered machine as the console sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub is_in_use: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latest_metrics: Option<DeviceMetrics>,
}

/// Registration payload for a new machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAnnouncement {
    uuid: Uuid,
    name: String,
    ip: String,
    host_name: String,
}

impl DeviceAnnouncement {
    fn into_record(self) -> DeviceRecord {
        DeviceRecord {
            uuid: self.uuid,
            name: self.name,
            ip: self.ip,
            host_name: self.host_name,
            is_online: false,
            is_in_use: false,
            last_seen: None,
            latest_metrics: None,
        }
    }
}

pub struct DeviceDirectory {
    gateway: Arc<AuthGateway>,
    devices: Mutex<Vec<DeviceRecord>>,
    initialized: AtomicBool,
    changed: broadcast::Sender<()>,
}

impl DeviceDirectory {
    pub fn new(gateway: Arc<AuthGateway>) -> Self {
        let (changed, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            gateway,
            devices: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            changed,
        }
    }

    /// Subscribe to cache changes.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changed.subscribe()
    }

    /// Snapshot of the cached list.
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.devices.lock().unwrap().clone()
    }

    pub fn device_by_uuid(&self, uuid: Uuid) -> Option<DeviceRecord> {
        self.devices.lock().unwrap().iter().find(|d| d.uuid == uuid).cloned()
    }

    /// Load the cache from the backend once.
    ///
    /// Failure is tolerated: the cache stays empty and uninitialized so
    /// a later call can retry; the UI simply shows an empty list.
    pub async fn initialize(&self) {
        if self.initialized.load(Ordering::SeqCst) {
            return;
        }
        let Some(list) = self.load().await else {
            return;
        };
        *self.devices.lock().unwrap() = list;
        self.initialized.store(true, Ordering::SeqCst);
        self.signal_changed();
    }

    /// Fetch a fresh list from the backend without touching the cache.
    ///
    /// Returns an empty list when the backend is unreachable.
    pub async fn fetch_devices(&self) -> Vec<DeviceRecord> {
        self.load().await.unwrap_or_default()
    }

    /// Register a machine on the backend and append it to the cache.
    pub async fn add_device(&self, uuid: Uuid, name: &str, ip: &str, host_name: &str) {
        let announcement = DeviceAnnouncement {
            uuid,
            name: name.to_string(),
            ip: ip.to_string(),
            host_name: host_name.to_string(),
        };
        if !self.post_device(&announcement).await {
            return;
        }
        self.devices.lock().unwrap().push(announcement.into_record());
        self.signal_changed();
    }

    /// Like [`add_device`](Self::add_device), but skips the local append
    /// when the uuid is already cached (used for hub-initiated prompts
    /// that may race a manual registration).
    pub async fn add_device_by_uuid(&self, uuid: Uuid, name: &str, ip: &str, host_name: &str) {
        let announcement = DeviceAnnouncement {
            uuid,
            name: name.to_string(),
            ip: ip.to_string(),
            host_name: host_name.to_string(),
        };
        if !self.post_device(&announcement).await {
            return;
        }
        {
            let mut devices = self.devices.lock().unwrap();
            if devices.iter().any(|d| d.uuid == uuid) {
                return;
            }
            devices.push(announcement.into_record());
        }
        self.signal_changed();
    }

    /// Delete a machine on the backend and drop it from the cache.
    pub async fn delete_device(&self, uuid: Uuid) {
        let url = self.gateway.endpoint(&format!("{DEVICES_ROUTE}/{uuid}"));
        let response = self.gateway.send_authenticated(|http| http.delete(&url)).await;
        match response {
            Ok(response) if response.status().is_success() => {
                self.devices.lock().unwrap().retain(|d| d.uuid != uuid);
                self.signal_changed();
            }
            Ok(response) => {
                warn!(%uuid, status = %response.status(), "Device deletion rejected");
            }
            Err(e) => {
                warn!(%uuid, error = %e, "Device deletion failed");
            }
        }
    }

    /// Apply one metrics snapshot to the matching device.
    ///
    /// Matches by uuid first, then by IP; an unmatched snapshot is a
    /// no-op (the hub separately reports unknown machines).
    pub fn apply_metrics(&self, metrics: DeviceMetrics) {
        let mut devices = self.devices.lock().unwrap();
        let Some(device) = devices
            .iter_mut()
            .find(|d| d.uuid == metrics.uuid || d.ip == metrics.ip)
        else {
            return;
        };
        device.last_seen = Some(metrics.received_at);
        device.latest_metrics = Some(metrics);
        drop(devices);
        self.signal_changed();
    }

    async fn load(&self) -> Option<Vec<DeviceRecord>> {
        let url = self.gateway.endpoint(DEVICES_ROUTE);
        let response = match self.gateway.send_authenticated(|http| http.get(&url)).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Device list request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            debug!(status = %response.status(), "Device list request rejected");
            return None;
        }
        match response.json::<Vec<DeviceRecord>>().await {
            Ok(list) => Some(list),
            Err(e) => {
                warn!(error = %e, "Device list unreadable");
                None
            }
        }
    }

    async fn post_device(&self, announcement: &DeviceAnnouncement) -> bool {
        let url = self.gateway.endpoint(DEVICES_ROUTE);
        let response = self
            .gateway
            .send_authenticated(|http| http.post(&url).json(announcement))
            .await;
        match response {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(uuid = %announcement.uuid, status = %response.status(), "Device registration rejected");
                false
            }
            Err(e) => {
                warn!(uuid = %announcement.uuid, error = %e, "Device registration failed");
                false
            }
        }
    }

    fn signal_changed(&self) {
        let _ = self.changed.send(());
    }
}
