//! Upstream Link
//!
//! The single persistent MQTT connection from the bridge to the remote
//! broker. Link loss is reported as a [`LinkEvent`] so the owner can decide
//! when to reconnect; the link itself never retries.

mod client;

pub use client::MqttUpstream;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, ConfigError, Secret};
use crate::protocol::{QoS, ReasonCode};
use crate::tls::TlsError;

/// Error type for upstream operations
#[derive(Debug)]
pub enum UpstreamError {
    /// Connection to the upstream broker failed or was lost
    ConnectionLost(String),
    /// The upstream broker refused the CONNECT
    Rejected(ReasonCode),
    /// Operation timed out
    Timeout,
    /// No connection is established
    NotConnected,
    /// TLS setup failed
    Tls(TlsError),
    /// Other error
    Other(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            UpstreamError::Rejected(code) => write!(f, "Rejected: {}", code),
            UpstreamError::Timeout => write!(f, "Operation timed out"),
            UpstreamError::NotConnected => write!(f, "Not connected"),
            UpstreamError::Tls(e) => write!(f, "TLS error: {}", e),
            UpstreamError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<TlsError> for UpstreamError {
    fn from(e: TlsError) -> Self {
        UpstreamError::Tls(e)
    }
}

impl From<std::io::Error> for UpstreamError {
    fn from(e: std::io::Error) -> Self {
        UpstreamError::ConnectionLost(e.to_string())
    }
}

/// Status of the upstream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Notifications from the upstream link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// An established connection dropped. Sent once per connection and
    /// never for a disconnect the owner asked for.
    Disconnected { reason: String },
}

/// Connection options built once at startup and reused for every reconnect
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub client_id: String,
    pub username: String,
    pub password: Secret,
    pub keep_alive: u16,
    /// Bounds the TCP/TLS/CONNACK handshake and each acknowledged publish
    pub connect_timeout: Duration,
}

impl UpstreamOptions {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let bridge_user = config
            .bridge_user
            .as_ref()
            .ok_or(ConfigError::Validation {
                field: "bridgeUser",
                message: "bridge user is required".to_string(),
            })?;

        Ok(Self {
            host: config.bridge_url.trim().to_string(),
            port: config.bridge_port as u16,
            use_tls: config.use_tls,
            client_id: bridge_user.client_id.clone(),
            username: bridge_user.user_name.clone(),
            password: bridge_user.password.clone(),
            keep_alive: config.keep_alive_seconds,
            connect_timeout: config.connect_timeout(),
        })
    }

    /// `host:port` of the upstream broker
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An application message forwarded upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Trait for the connection to the upstream broker
#[async_trait]
pub trait UpstreamLink: Send + Sync {
    /// Establish the connection. Succeeds immediately when already connected.
    async fn connect(
        &self,
        options: &UpstreamOptions,
        cancel: &CancellationToken,
    ) -> Result<(), UpstreamError>;

    /// Publish a message; QoS 1 and 2 wait for the broker's acknowledgement
    async fn publish(
        &self,
        message: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<(), UpstreamError>;

    /// Close the connection without raising a [`LinkEvent`]
    async fn disconnect(&self);

    fn status(&self) -> LinkStatus;

    fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Connected
    }

    /// Receive link events
    fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent>;
}
