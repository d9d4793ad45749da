//! Periodic metrics publishing with capability fallbacks
//!
//! [`MetricsPublisher`] drives the agent's main loop: every tick it
//! ensures the hub connection is up, samples a snapshot, and delivers it
//! through an ordered chain of candidate operations. A hub that only
//! implements part of the expected surface degrades delivery, never the
//! loop: the cadence is fixed and transient failures are absorbed.

use std::time::Duration;

use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fleetlink_hub::{ConnectionState, HubConnection, HubError};

use crate::sampler::SnapshotProducer;

/// Operation carrying a metrics snapshot (or, as a last resort, text).
pub const METRICS_TARGET: &str = "publishMetrics";
/// Operation carrying the companion text message.
pub const MESSAGE_TARGET: &str = "sendMessage";

pub struct MetricsPublisher {
    hub: HubConnection,
    producer: SnapshotProducer,
    interval: Duration,
    companion_text: String,
    cancel: CancellationToken,
}

impl MetricsPublisher {
    pub fn new(
        hub: HubConnection,
        producer: SnapshotProducer,
        interval: Duration,
        companion_text: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hub,
            producer,
            interval,
            companion_text,
            cancel,
        }
    }

    /// Run the publish loop until cancellation.
    ///
    /// Cancellation exits cleanly at any suspension point; everything
    /// else is logged and retried on the next tick.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Starting publish loop");

        let mut ticker = tokio::time::interval(self.interval);
        // A tick that overruns (e.g. a slow fallback chain) delays the
        // schedule instead of bursting to catch up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Publish loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.publish_once().await;
        }
    }

    /// One publish cycle: ensure connected, deliver metrics, deliver the
    /// companion message.
    async fn publish_once(&self) {
        if self.hub.state() != ConnectionState::Connected {
            match self.hub.connect().await {
                Ok(()) => {}
                Err(HubError::Cancelled) => return,
                Err(e) => {
                    warn!(error = %e, "Hub unreachable, will retry next tick");
                    return;
                }
            }
        }

        let snapshot = self.producer.sample().await;
        debug!(uuid = %snapshot.uuid, cpu = snapshot.cpu, ram = snapshot.ram, "Publishing metrics");
        let snapshot_value = match serde_json::to_value(&snapshot) {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, "Failed to serialize snapshot");
                return;
            }
        };

        // A hub that does not accept the rich call signature may still
        // accept the bare one.
        self.deliver(
            "metrics",
            &[
                (METRICS_TARGET, vec![snapshot_value]),
                (METRICS_TARGET, vec![]),
            ],
        )
        .await;

        // The companion phrase has its own chain, repurposing the
        // metrics operation as the last resort.
        let text = Value::String(self.companion_text.clone());
        self.deliver(
            "message",
            &[
                (MESSAGE_TARGET, vec![text.clone()]),
                (METRICS_TARGET, vec![text]),
            ],
        )
        .await;
    }

    /// Attempt candidates in order, stopping at the first success.
    ///
    /// Only a hub-side rejection moves the chain along; a dead or silent
    /// connection aborts it, since every further candidate would fail
    /// the same way.
    async fn deliver(&self, path: &str, candidates: &[(&str, Vec<Value>)]) {
        for (index, (target, arguments)) in candidates.iter().enumerate() {
            match self.hub.invoke(target, arguments.clone()).await {
                Ok(_) => {
                    debug!(path, target, "Delivered");
                    return;
                }
                Err(HubError::RemoteRejected(reason)) => {
                    if index + 1 < candidates.len() {
                        warn!(path, target, %reason, "Operation rejected, trying fallback");
                    } else {
                        error!(path, target, %reason, "All delivery paths rejected");
                    }
                }
                Err(HubError::Cancelled) => return,
                Err(e) => {
                    warn!(path, target, error = %e, "Delivery failed");
                    return;
                }
            }
        }
    }
}
