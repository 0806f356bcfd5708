//! MQTT Bridge Module
//!
//! The orchestrator tying the local broker to the upstream link.
//!
//! Startup order:
//! 1. validate the configuration (no network activity on failure)
//! 2. connect the upstream link with the bridge user
//! 3. start the local broker with the four callbacks bound
//! 4. spawn the heartbeat
//!
//! A failed initial upstream connect is not fatal; it goes through the same
//! reconnect path as a dropped connection.

mod callbacks;
pub mod heartbeat;
pub mod reconnect;

#[cfg(test)]
mod tests;

pub use callbacks::BridgeCallbacks;
pub use heartbeat::{MemoryProbe, MemorySample, SysinfoProbe};
pub use reconnect::{backoff_delay, ReconnectOutcome, Reconnector, RetryState};

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::auth::CredentialStore;
use crate::broker::{BrokerError, LocalBrokerAdapter};
use crate::config::{Config, ConfigError};
use crate::upstream::{LinkEvent, UpstreamLink, UpstreamOptions};

/// Lifecycle of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Starting,
    Running,
    /// Running while the upstream link is being restored
    Reconnecting,
    Stopping,
}

#[derive(Debug)]
pub enum BridgeError {
    Config(ConfigError),
    Broker(BrokerError),
    AlreadyRunning,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Config(e) => write!(f, "Configuration error: {}", e),
            BridgeError::Broker(e) => write!(f, "Local broker error: {}", e),
            BridgeError::AlreadyRunning => write!(f, "Bridge is already running"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::Config(e)
    }
}

impl From<BrokerError> for BridgeError {
    fn from(e: BrokerError) -> Self {
        BridgeError::Broker(e)
    }
}

pub struct BridgeOrchestrator {
    config: Config,
    upstream: Arc<dyn UpstreamLink>,
    broker: Arc<dyn LocalBrokerAdapter>,
    probe: Arc<dyn MemoryProbe>,
    state: Arc<RwLock<BridgeState>>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconnector: Mutex<Option<Arc<Reconnector>>>,
}

impl BridgeOrchestrator {
    pub fn new(
        config: Config,
        upstream: Arc<dyn UpstreamLink>,
        broker: Arc<dyn LocalBrokerAdapter>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self {
            config,
            upstream,
            broker,
            probe,
            state: Arc::new(RwLock::new(BridgeState::Stopped)),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            reconnector: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.read()
    }

    /// Failed reconnect attempts since the last success
    pub fn retry_attempts(&self) -> u32 {
        self.reconnector
            .lock()
            .as_ref()
            .map_or(0, |reconnector| reconnector.attempts())
    }

    /// Token cancelled by [`stop`](Self::stop)
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    pub async fn start(&self) -> Result<(), BridgeError> {
        if *self.state.read() != BridgeState::Stopped {
            return Err(BridgeError::AlreadyRunning);
        }

        self.config.validate()?;
        let options = UpstreamOptions::from_config(&self.config)?;

        {
            let mut state = self.state.write();
            if *state != BridgeState::Stopped {
                return Err(BridgeError::AlreadyRunning);
            }
            *state = BridgeState::Starting;
        }
        info!(service = %self.config.service_name, "Starting service");

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        let reconnector = Arc::new(Reconnector::new(
            self.upstream.clone(),
            options.clone(),
            self.config.max_reconnect_delay(),
            self.config.retry_until_connected,
        ));
        *self.reconnector.lock() = Some(reconnector.clone());

        // Subscribe before connecting so an early drop is not missed
        let events = self.upstream.subscribe_events();
        let initial_failed = match self.upstream.connect(&options, &cancel).await {
            Ok(()) => false,
            Err(e) => {
                error!("Initial connection to {} failed: {}", options.address(), e);
                true
            }
        };

        let hooks = BridgeCallbacks::new(
            CredentialStore::new(&self.config.users),
            self.upstream.clone(),
            self.config.log_password_on_failure,
            cancel.clone(),
        )
        .into_hooks();

        if let Err(e) = self.broker.start(hooks, cancel.clone()).await {
            error!("Failed to start local broker: {}", e);
            cancel.cancel();
            self.upstream.disconnect().await;
            *self.state.write() = BridgeState::Stopped;
            return Err(e.into());
        }

        let link_watcher = tokio::spawn(watch_link(
            events,
            reconnector,
            self.state.clone(),
            cancel.clone(),
            initial_failed,
        ));
        let heartbeat = tokio::spawn(heartbeat::run(
            self.config.service_name.clone(),
            self.config.heartbeat_interval(),
            self.probe.clone(),
            cancel.clone(),
        ));
        self.tasks.lock().extend([link_watcher, heartbeat]);

        {
            let mut state = self.state.write();
            if *state == BridgeState::Starting {
                *state = BridgeState::Running;
            }
        }
        info!(service = %self.config.service_name, "Service started");
        Ok(())
    }

    /// Cancel every background task and close the upstream link. Calling it
    /// again, or before `start`, does nothing.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            match *state {
                BridgeState::Stopped | BridgeState::Stopping => return,
                _ => *state = BridgeState::Stopping,
            }
        }
        info!(service = %self.config.service_name, "Stopping service");

        self.cancel.lock().cancel();
        self.upstream.disconnect().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        *self.state.write() = BridgeState::Stopped;
        info!(service = %self.config.service_name, "Service stopped");
    }
}

/// Turn link-loss events into reconnect attempts until cancelled
async fn watch_link(
    mut events: broadcast::Receiver<LinkEvent>,
    reconnector: Arc<Reconnector>,
    state: Arc<RwLock<BridgeState>>,
    cancel: CancellationToken,
    initial_failed: bool,
) {
    if initial_failed {
        reconnect(&reconnector, &state, &cancel).await;
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(LinkEvent::Disconnected { reason }) => {
                debug!("Upstream link event: disconnected ({})", reason);
                reconnect(&reconnector, &state, &cancel).await;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn reconnect(
    reconnector: &Reconnector,
    state: &RwLock<BridgeState>,
    cancel: &CancellationToken,
) {
    set_state_if(state, BridgeState::Running, BridgeState::Reconnecting);
    let outcome = reconnector.handle_link_lost(cancel).await;
    debug!("Reconnect outcome: {:?}", outcome);
    set_state_if(state, BridgeState::Reconnecting, BridgeState::Running);
}

fn set_state_if(state: &RwLock<BridgeState>, from: BridgeState, to: BridgeState) {
    let mut state = state.write();
    if *state == from {
        *state = to;
    }
}
