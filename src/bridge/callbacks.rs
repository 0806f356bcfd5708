//! The bridge's implementations of the four broker callbacks

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::auth::CredentialStore;
use crate::hooks::{
    BrokerHooks, ClientDisconnectedHandler, ConnectionValidator, ConnectionValidatorContext,
    HookResult, PublishContext, PublishInterceptor, SubscriptionContext, SubscriptionInterceptor,
};
use crate::protocol::ReasonCode;
use crate::upstream::{OutboundMessage, UpstreamLink};

pub struct BridgeCallbacks {
    credentials: CredentialStore,
    upstream: Arc<dyn UpstreamLink>,
    log_password_on_failure: bool,
    cancel: CancellationToken,
}

impl BridgeCallbacks {
    pub fn new(
        credentials: CredentialStore,
        upstream: Arc<dyn UpstreamLink>,
        log_password_on_failure: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            credentials,
            upstream,
            log_password_on_failure,
            cancel,
        }
    }

    /// Register this instance at all four callback points
    pub fn into_hooks(self) -> BrokerHooks {
        let callbacks = Arc::new(self);
        BrokerHooks::new()
            .with_connection_validator(callbacks.clone())
            .with_subscription_interceptor(callbacks.clone())
            .with_publish_interceptor(callbacks.clone())
            .with_client_disconnected_handler(callbacks)
    }
}

#[async_trait]
impl ConnectionValidator for BridgeCallbacks {
    async fn validate_connection(
        &self,
        ctx: &ConnectionValidatorContext,
    ) -> HookResult<ReasonCode> {
        let user_name = ctx.username.as_deref().unwrap_or_default();

        match self.credentials.check(ctx.username.as_deref(), ctx.password.as_deref()) {
            Ok(_) => {
                info!(
                    client_id = %ctx.client_id,
                    endpoint = %ctx.endpoint,
                    user_name,
                    clean_session = ctx.clean_session,
                    "New connection"
                );
                Ok(ReasonCode::Success)
            }
            Err(reason) if self.log_password_on_failure => {
                let password = ctx
                    .password
                    .as_ref()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_default();
                warn!(
                    client_id = %ctx.client_id,
                    endpoint = %ctx.endpoint,
                    user_name,
                    password = %password,
                    clean_session = ctx.clean_session,
                    "Connection rejected: {}",
                    reason
                );
                Ok(ReasonCode::BadUserNameOrPassword)
            }
            Err(reason) => {
                warn!(
                    client_id = %ctx.client_id,
                    endpoint = %ctx.endpoint,
                    user_name,
                    clean_session = ctx.clean_session,
                    "Connection rejected: {}",
                    reason
                );
                Ok(ReasonCode::BadUserNameOrPassword)
            }
        }
    }
}

#[async_trait]
impl SubscriptionInterceptor for BridgeCallbacks {
    async fn intercept_subscription(&self, ctx: &SubscriptionContext) -> HookResult<bool> {
        info!(
            client_id = %ctx.client_id,
            topic_filter = %ctx.topic_filter,
            "New subscription"
        );
        Ok(true)
    }
}

#[async_trait]
impl PublishInterceptor for BridgeCallbacks {
    async fn intercept_publish(&self, ctx: &PublishContext) -> HookResult<bool> {
        let message = OutboundMessage {
            topic: ctx.topic.clone(),
            payload: ctx.payload.clone(),
            qos: ctx.qos,
            retain: ctx.retain,
        };

        match self.upstream.publish(message, &self.cancel).await {
            Ok(()) => info!(
                client_id = %ctx.client_id,
                topic = %ctx.topic,
                payload = %String::from_utf8_lossy(&ctx.payload),
                qos = %ctx.qos,
                retain = ctx.retain,
                "Message forwarded"
            ),
            Err(e) => error!(
                client_id = %ctx.client_id,
                topic = %ctx.topic,
                "Failed to forward message upstream: {}",
                e
            ),
        }

        // Local delivery never depends on the upstream
        Ok(true)
    }
}

#[async_trait]
impl ClientDisconnectedHandler for BridgeCallbacks {
    async fn client_disconnected(&self, client_id: &str, endpoint: SocketAddr, graceful: bool) {
        info!(client_id, endpoint = %endpoint, graceful, "Client disconnected");
    }
}
