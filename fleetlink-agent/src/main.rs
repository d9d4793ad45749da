//! Fleetlink Agent - machine-side metrics publisher
//!
//! Links one machine into the fleet:
//! - Resolves the device identity and samples CPU/RAM/IP on a fixed cadence
//! - Pushes snapshots to the hub over a persistent auto-reconnecting channel
//! - Degrades gracefully when the hub supports only part of the surface

mod config;
mod publisher;
mod sampler;

use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use config::AgentConfig;
use fleetlink_hub::{HubConnection, HubEndpoint};
use publisher::MetricsPublisher;
use sampler::SnapshotProducer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    info!("Fleetlink agent starting...");

    let config = AgentConfig::load()
        .await
        .context("Failed to load agent configuration")?;

    let identity = sampler::resolve_identity(config.device_uuid.as_deref());
    info!(%identity, hub = %config.hub.endpoint_url(), "Agent initialized");

    let hub = HubConnection::new(HubEndpoint::new(config.hub.endpoint_url()));
    let cancel = CancellationToken::new();
    let publisher = MetricsPublisher::new(
        hub.clone(),
        SnapshotProducer::new(identity),
        Duration::from_secs(config.publish_interval_secs),
        config.companion_text.clone(),
        cancel.clone(),
    );

    let loop_handle = tokio::spawn(async move { publisher.run().await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    cancel.cancel();
    let _ = loop_handle.await;
    hub.stop().await;

    Ok(())
}
