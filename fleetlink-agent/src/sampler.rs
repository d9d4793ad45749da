//! System metrics sampling for the Fleetlink agent
//!
//! Produces one immutable [`MetricsSnapshot`] per publish tick:
//! - Device identity (hardware UUID with sentinel fallbacks)
//! - CPU usage percentage via sysinfo
//! - RAM usage percentage (used/total)
//! - Primary local IPv4 address
//!
//! Sampling never skips a tick: when collection fails, a fully
//! sentineled snapshot is produced instead so downstream consumers can
//! tell "unavailable" from true zero load.

use anyhow::Result;
use chrono::{DateTime, Utc};
use if_addrs::{get_if_addrs, IfAddr};
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::System;
use tracing::{debug, error};

/// Identity reported when the hardware UUID cannot be determined.
pub const IDENTITY_UNKNOWN: &str = "Unknown";
/// Identity reported when sampling itself failed.
pub const IDENTITY_ERROR: &str = "Error";
/// IP reported when sampling itself failed.
pub const IP_UNAVAILABLE: &str = "0.0.0.0";
/// IP reported when no non-loopback interface is found.
pub const IP_LOOPBACK: &str = "127.0.0.1";

/// Hardware UUID source on Linux.
const DMI_PRODUCT_UUID: &str = "/sys/class/dmi/id/product_uuid";

/// One sampled metrics record, immutable once produced.
///
/// Field names follow the hub wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uuid: String,
    pub cpu: f32,
    pub ram: f32,
    pub ip: String,
    pub received_at: DateTime<Utc>,
}

/// Produces metrics snapshots on demand.
pub struct SnapshotProducer {
    identity: String,
}

impl SnapshotProducer {
    /// Create a producer reporting under the given device identity.
    pub fn new(identity: String) -> Self {
        Self { identity }
    }

    /// Sample the system once. Never fails: a collection error yields
    /// the sentinel snapshot instead of skipping the tick.
    pub async fn sample(&self) -> MetricsSnapshot {
        match self.collect().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Metrics collection failed, reporting sentinel snapshot");
                Self::failure_snapshot()
            }
        }
    }

    async fn collect(&self) -> Result<MetricsSnapshot> {
        debug!("Collecting system metrics...");

        let mut sys = System::new_all();
        sys.refresh_all();

        // Wait a moment for accurate CPU readings
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
        sys.refresh_cpu_usage();

        let cpu = sys.global_cpu_info().cpu_usage();
        let ram = Self::ram_percent(&sys);
        let ip = Self::local_ip();

        Ok(MetricsSnapshot {
            uuid: self.identity.clone(),
            cpu,
            ram,
            ip,
            received_at: Utc::now(),
        })
    }

    /// RAM usage as used/total percentage; 0.0 when totals are unknown.
    fn ram_percent(sys: &System) -> f32 {
        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        let used = total - sys.available_memory();
        (used as f32 / total as f32) * 100.0
    }

    /// First non-loopback IPv4 address, or the loopback sentinel.
    fn local_ip() -> String {
        let interfaces = match get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                debug!(error = %e, "Interface enumeration failed");
                return IP_LOOPBACK.to_string();
            }
        };

        for interface in interfaces {
            if interface.is_loopback() {
                continue;
            }
            if let IfAddr::V4(v4) = interface.addr {
                return v4.ip.to_string();
            }
        }

        IP_LOOPBACK.to_string()
    }

    /// The snapshot reported when sampling fails outright.
    pub fn failure_snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            uuid: IDENTITY_ERROR.to_string(),
            cpu: 0.0,
            ram: 0.0,
            ip: IP_UNAVAILABLE.to_string(),
            received_at: Utc::now(),
        }
    }
}

/// Resolve the device identity once at startup.
///
/// A configured override wins; otherwise the hardware UUID is read from
/// DMI; otherwise the "Unknown" sentinel is reported.
pub fn resolve_identity(configured: Option<&str>) -> String {
    resolve_identity_from(Path::new(DMI_PRODUCT_UUID), configured)
}

fn resolve_identity_from(dmi_path: &Path, configured: Option<&str>) -> String {
    if let Some(id) = configured {
        if !id.is_empty() {
            return id.to_string();
        }
    }

    match std::fs::read_to_string(dmi_path) {
        Ok(contents) => {
            let uuid = contents.trim();
            if uuid.is_empty() {
                IDENTITY_UNKNOWN.to_string()
            } else {
                uuid.to_string()
            }
        }
        Err(_) => IDENTITY_UNKNOWN.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn failure_snapshot_uses_sentinels_everywhere() {
        let snapshot = SnapshotProducer::failure_snapshot();
        assert_eq!(snapshot.uuid, IDENTITY_ERROR);
        assert_eq!(snapshot.cpu, 0.0);
        assert_eq!(snapshot.ram, 0.0);
        assert_eq!(snapshot.ip, IP_UNAVAILABLE);
    }

    #[tokio::test]
    async fn sample_produces_bounded_values() {
        let producer = SnapshotProducer::new("test-device".to_string());
        let snapshot = producer.sample().await;

        assert_eq!(snapshot.uuid, "test-device");
        assert!(snapshot.cpu >= 0.0);
        assert!((0.0..=100.0).contains(&snapshot.ram));
        assert!(
            snapshot.ip.parse::<std::net::Ipv4Addr>().is_ok(),
            "ip should be dotted-quad, got {}",
            snapshot.ip
        );
    }

    #[test]
    fn snapshot_serializes_with_wire_field_names() {
        let snapshot = SnapshotProducer::failure_snapshot();
        let value = serde_json::to_value(&snapshot).unwrap();
        assert!(value.get("receivedAt").is_some());
        assert!(value.get("uuid").is_some());
        assert!(value.get("received_at").is_none());
    }

    #[test]
    fn configured_identity_wins() {
        let identity = resolve_identity_from(
            Path::new("/nonexistent/product_uuid"),
            Some("11111111-2222-3333-4444-555555555555"),
        );
        assert_eq!(identity, "11111111-2222-3333-4444-555555555555");
    }

    #[test]
    fn missing_hardware_uuid_is_unknown() {
        let identity = resolve_identity_from(Path::new("/nonexistent/product_uuid"), None);
        assert_eq!(identity, IDENTITY_UNKNOWN);
    }

    #[test]
    fn hardware_uuid_is_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "a9c4e8d0-0d55-4f0b-9a2e-5b3f7b1f2c3d").unwrap();

        let identity = resolve_identity_from(file.path(), None);
        assert_eq!(identity, "a9c4e8d0-0d55-4f0b-9a2e-5b3f7b1f2c3d");
    }

    #[test]
    fn empty_hardware_uuid_is_unknown() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let identity = resolve_identity_from(file.path(), None);
        assert_eq!(identity, IDENTITY_UNKNOWN);
    }
}
