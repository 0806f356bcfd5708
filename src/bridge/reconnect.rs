//! Upstream reconnect state machine
//!
//! Each link-loss event waits `min(2^attempt, cap)` seconds and then tries
//! one reconnect with the options built at startup. The attempt counter is
//! reset by a success and bumped by every failure. Handling is serialized
//! through the mutex around [`RetryState`], so overlapping events queue up
//! instead of racing on the counter. The count is mirrored into an atomic
//! so it can be read while a handler sleeps.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::upstream::{UpstreamLink, UpstreamOptions};

/// Backoff before reconnect attempt number `attempt` (0-based)
pub fn backoff_delay(attempt: u32, cap: Duration) -> Duration {
    let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}

/// Consecutive failed reconnect attempts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Result of handling one link-loss event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected,
    /// The attempt failed; the next event triggers another one
    Failed,
    /// Another handler already restored the link
    AlreadyConnected,
    Cancelled,
}

pub struct Reconnector {
    upstream: Arc<dyn UpstreamLink>,
    options: UpstreamOptions,
    retry: Mutex<RetryState>,
    attempts: AtomicU32,
    max_delay: Duration,
    retry_until_connected: bool,
}

impl Reconnector {
    pub fn new(
        upstream: Arc<dyn UpstreamLink>,
        options: UpstreamOptions,
        max_delay: Duration,
        retry_until_connected: bool,
    ) -> Self {
        Self {
            upstream,
            options,
            retry: Mutex::new(RetryState::default()),
            attempts: AtomicU32::new(0),
            max_delay,
            retry_until_connected,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Back off and reconnect. With `retry_until_connected` unset a single
    /// attempt is made per call.
    pub async fn handle_link_lost(&self, cancel: &CancellationToken) -> ReconnectOutcome {
        let mut retry = self.retry.lock().await;

        loop {
            if self.upstream.is_connected() {
                return ReconnectOutcome::AlreadyConnected;
            }

            let delay = backoff_delay(retry.attempts(), self.max_delay);
            warn!(
                attempt = retry.attempts(),
                "Upstream link down, reconnecting to {} in {:?}",
                self.options.address(),
                delay
            );

            tokio::select! {
                _ = cancel.cancelled() => return ReconnectOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.upstream.connect(&self.options, cancel).await {
                Ok(()) => {
                    retry.reset();
                    self.attempts.store(0, Ordering::SeqCst);
                    info!("Reconnected to upstream broker {}", self.options.address());
                    return ReconnectOutcome::Connected;
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return ReconnectOutcome::Cancelled;
                    }
                    retry.record_failure();
                    self.attempts.store(retry.attempts(), Ordering::SeqCst);
                    error!(
                        attempts = retry.attempts(),
                        "Reconnect to {} failed: {}",
                        self.options.address(),
                        e
                    );
                    if !self.retry_until_connected {
                        return ReconnectOutcome::Failed;
                    }
                }
            }
        }
    }
}
