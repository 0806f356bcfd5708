//! Hooks Module
//!
//! Interception points the local broker calls into. Each concern is its own
//! trait and is registered separately on [`BrokerHooks`]; anything left
//! unregistered falls back to [`AcceptAll`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::{ProtocolVersion, QoS, ReasonCode};


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Everything known about a connection attempt when CONNECT arrives
#[derive(Clone)]
pub struct ConnectionValidatorContext {
    pub client_id: String,
    pub endpoint: SocketAddr,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub clean_session: bool,
    pub protocol_version: ProtocolVersion,
}

impl fmt::Debug for ConnectionValidatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionValidatorContext")
            .field("client_id", &self.client_id)
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("clean_session", &self.clean_session)
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}

/// A single topic filter from a SUBSCRIBE packet
#[derive(Debug, Clone)]
pub struct SubscriptionContext {
    pub client_id: String,
    pub topic_filter: String,
    pub qos: QoS,
}

/// An application message published by a local client
#[derive(Debug, Clone)]
pub struct PublishContext {
    pub client_id: String,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Decides whether a connecting client is admitted
#[async_trait]
pub trait ConnectionValidator: Send + Sync {
    /// Returns the CONNACK reason code; anything but success rejects
    async fn validate_connection(&self, ctx: &ConnectionValidatorContext)
        -> HookResult<ReasonCode>;
}

/// Decides whether a topic filter is granted
#[async_trait]
pub trait SubscriptionInterceptor: Send + Sync {
    async fn intercept_subscription(&self, ctx: &SubscriptionContext) -> HookResult<bool>;
}

/// Sees every local publish before it is routed; `false` drops it
#[async_trait]
pub trait PublishInterceptor: Send + Sync {
    async fn intercept_publish(&self, ctx: &PublishContext) -> HookResult<bool>;
}

/// Notified when a local client session ends
#[async_trait]
pub trait ClientDisconnectedHandler: Send + Sync {
    /// `graceful` is true when the client sent DISCONNECT
    async fn client_disconnected(&self, client_id: &str, endpoint: SocketAddr, graceful: bool);
}

/// Accepts every connection, subscription and publish
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl ConnectionValidator for AcceptAll {
    async fn validate_connection(
        &self,
        _ctx: &ConnectionValidatorContext,
    ) -> HookResult<ReasonCode> {
        Ok(ReasonCode::Success)
    }
}

#[async_trait]
impl SubscriptionInterceptor for AcceptAll {
    async fn intercept_subscription(&self, _ctx: &SubscriptionContext) -> HookResult<bool> {
        Ok(true)
    }
}

#[async_trait]
impl PublishInterceptor for AcceptAll {
    async fn intercept_publish(&self, _ctx: &PublishContext) -> HookResult<bool> {
        Ok(true)
    }
}

#[async_trait]
impl ClientDisconnectedHandler for AcceptAll {
    async fn client_disconnected(&self, _client_id: &str, _endpoint: SocketAddr, _graceful: bool) {
    }
}

/// The four callback registration points of the local broker
#[derive(Clone)]
pub struct BrokerHooks {
    connection_validator: Arc<dyn ConnectionValidator>,
    subscription_interceptor: Arc<dyn SubscriptionInterceptor>,
    publish_interceptor: Arc<dyn PublishInterceptor>,
    disconnected_handler: Arc<dyn ClientDisconnectedHandler>,
}

impl Default for BrokerHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerHooks {
    pub fn new() -> Self {
        Self {
            connection_validator: Arc::new(AcceptAll),
            subscription_interceptor: Arc::new(AcceptAll),
            publish_interceptor: Arc::new(AcceptAll),
            disconnected_handler: Arc::new(AcceptAll),
        }
    }

    pub fn with_connection_validator(mut self, validator: Arc<dyn ConnectionValidator>) -> Self {
        self.connection_validator = validator;
        self
    }

    pub fn with_subscription_interceptor(
        mut self,
        interceptor: Arc<dyn SubscriptionInterceptor>,
    ) -> Self {
        self.subscription_interceptor = interceptor;
        self
    }

    pub fn with_publish_interceptor(mut self, interceptor: Arc<dyn PublishInterceptor>) -> Self {
        self.publish_interceptor = interceptor;
        self
    }

    pub fn with_client_disconnected_handler(
        mut self,
        handler: Arc<dyn ClientDisconnectedHandler>,
    ) -> Self {
        self.disconnected_handler = handler;
        self
    }

    /// Run the connection validator; hook errors reject with "server unavailable"
    pub async fn validate_connection(&self, ctx: &ConnectionValidatorContext) -> ReasonCode {
        match self.connection_validator.validate_connection(ctx).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(client_id = %ctx.client_id, "Connection validator failed: {}", e);
                ReasonCode::ServerUnavailable
            }
        }
    }

    /// Run the subscription interceptor; hook errors deny the filter
    pub async fn intercept_subscription(&self, ctx: &SubscriptionContext) -> bool {
        match self.subscription_interceptor.intercept_subscription(ctx).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(client_id = %ctx.client_id, filter = %ctx.topic_filter, "Subscription interceptor failed: {}", e);
                false
            }
        }
    }

    /// Run the publish interceptor; hook errors drop the message
    pub async fn intercept_publish(&self, ctx: &PublishContext) -> bool {
        match self.publish_interceptor.intercept_publish(ctx).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(client_id = %ctx.client_id, topic = %ctx.topic, "Publish interceptor failed: {}", e);
                false
            }
        }
    }

    pub async fn client_disconnected(&self, client_id: &str, endpoint: SocketAddr, graceful: bool) {
        self.disconnected_handler
            .client_disconnected(client_id, endpoint, graceful)
            .await;
    }
}
