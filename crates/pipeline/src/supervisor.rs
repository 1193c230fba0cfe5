//! Restarts replication sessions after lost connections.

use crate::consumer::SessionSummary;
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::retry::RetryPolicy;
use crate::transport::ReplicationTransport;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    /// Delays between reconnect attempts; `max_attempts` is not used.
    pub backoff: RetryPolicy,
    /// Give up after failing to hold a session for this long.
    pub max_reconnect_duration: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: RetryPolicy {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
                jitter: true,
            },
            max_reconnect_duration: Duration::from_secs(300),
        }
    }
}

pub struct Supervisor<'a> {
    pipeline: &'a Pipeline,
    policy: ReconnectPolicy,
}

impl<'a> Supervisor<'a> {
    pub fn new(pipeline: &'a Pipeline, policy: ReconnectPolicy) -> Self {
        Self { pipeline, policy }
    }

    /// Runs sessions until shutdown or a non-recoverable error.
    ///
    /// Every session reloads the resume position from the offset store.
    /// A session that decoded anything counts as healthy and resets the
    /// backoff.
    pub async fn run<T, F>(&self, mut connect: F, shutdown: &CancellationToken) -> Result<SessionSummary>
    where
        T: ReplicationTransport,
        F: FnMut() -> T,
    {
        let metrics = self.pipeline.metrics();
        let mut backoff = self.policy.backoff.backoff();
        let mut failing_since: Option<Instant> = None;

        loop {
            let decoded_before = metrics.records_decoded();
            let error = match self.pipeline.run_session(connect(), shutdown).await {
                Ok(summary) => return Ok(summary),
                Err(e) if e.is_reconnectable() && !shutdown.is_cancelled() => e,
                Err(e) => {
                    error!(kind = %e.kind(), "replication stopped: {e}");
                    return Err(e);
                }
            };

            if metrics.records_decoded() > decoded_before {
                backoff.reset();
                failing_since = None;
                metrics.set_healthy(true);
            }
            let since = *failing_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.policy.max_reconnect_duration {
                metrics.set_healthy(false);
                error!(
                    "giving up after {:?} without a working session: {error}",
                    since.elapsed()
                );
                return Err(error);
            }

            let delay = backoff.next_delay();
            metrics.record_reconnect();
            warn!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "replication session lost, reconnecting: {error}"
            );
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested while waiting to reconnect");
                    return Ok(SessionSummary {
                        confirmed: metrics.confirmed_position(),
                        records_decoded: 0,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
