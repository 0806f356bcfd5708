//! MQTT Bridge - local MQTT endpoint forwarding publishes to a remote broker
//!
//! Local clients authenticate against a configured user list and publish to
//! an embedded MQTT v3.1/v3.1.1 broker. Every accepted publish is delivered
//! to local subscribers and forwarded over a single persistent connection
//! to the upstream broker, which is re-established with capped exponential
//! backoff when it drops.

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod logging;
pub mod protocol;
pub mod tls;
pub mod topic;
pub mod upstream;

pub use bridge::{BridgeError, BridgeOrchestrator, BridgeState};
pub use broker::{Broker, BrokerConfig, LocalBrokerAdapter};
pub use config::Config;
pub use hooks::BrokerHooks;
pub use protocol::{ProtocolVersion, QoS};
pub use upstream::{MqttUpstream, UpstreamLink};
