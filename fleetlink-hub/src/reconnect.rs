//! Exponential-backoff reconnection for hub connections.
//!
//! When the socket to a hub drops, the connection supervisor calls
//! [`reconnect_loop`] to keep redialing with increasing, jittered delays
//! until either the connection is restored or the [`CancellationToken`]
//! is triggered.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::connection::{HubEndpoint, WsStream};

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Maximum random extra delay added to each wait, so a fleet of
    /// agents does not redial in lockstep.
    pub jitter: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Duration::from_millis(250),
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`]. Jitter is not
/// applied here; [`jittered`] adds it at sleep time so the growth sequence
/// itself stays deterministic.
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Add a random 0..=jitter slice on top of a base delay.
pub fn jittered(delay: Duration, config: &ReconnectConfig) -> Duration {
    if config.jitter.is_zero() {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64);
    delay + Duration::from_millis(extra)
}

/// Redial a hub endpoint with exponential backoff.
///
/// Returns `Some(stream)` once a dial succeeds, or `None` if the `cancel`
/// token fires first. Retries indefinitely; giving up is the caller's
/// decision via cancellation.
pub async fn reconnect_loop(
    endpoint: &HubEndpoint,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<WsStream> {
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        tracing::info!(
            url = %endpoint.url(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to hub",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(url = %endpoint.url(), "Reconnect cancelled");
                return None;
            }
            result = endpoint.dial() => {
                match result {
                    Ok(stream) => {
                        tracing::info!(url = %endpoint.url(), attempt, "Reconnected to hub");
                        return Some(stream);
                    }
                    Err(e) => {
                        tracing::warn!(
                            url = %endpoint.url(),
                            error = %e,
                            "Reconnect attempt {attempt} failed",
                        );
                    }
                }
            }
        }

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(jittered(delay, config)) => {}
        }

        delay = next_delay(delay, config);
    }
}
