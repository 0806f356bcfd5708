//! MQTT Connection Handler
//!
//! Drives a single local client from CONNECT to the end of its session.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::router::{ClientHandle, MessageRouter, OUTBOUND_CAPACITY};
use crate::codec::{Decoder, Encoder};
use crate::hooks::{BrokerHooks, ConnectionValidatorContext, PublishContext, SubscriptionContext};
use crate::protocol::{
    ConnAck, Connect, DecodeError, EncodeError, Packet, ProtocolError, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// Time a client gets to send CONNECT after the socket opens
pub(super) const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    Decode(DecodeError),
    Timeout,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

impl From<EncodeError> for ConnectionError {
    fn from(e: EncodeError) -> Self {
        ConnectionError::Protocol(e.into())
    }
}

/// Client id assigned when a clean-session client connects without one
fn generated_client_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    format!("auto-{:016x}", hasher.finish())
}

async fn keep_alive_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct Connection<S> {
    stream: S,
    addr: SocketAddr,
    decoder: Decoder,
    encoder: Encoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    router: Arc<MessageRouter>,
    hooks: BrokerHooks,
    cancel: CancellationToken,
    next_packet_id: u16,
    /// Inbound QoS 2 packet ids waiting for PUBREL
    awaiting_rel: HashSet<u16>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        router: Arc<MessageRouter>,
        hooks: BrokerHooks,
        max_packet_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            addr,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            encoder: Encoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            router,
            hooks,
            cancel,
            next_packet_id: 0,
            awaiting_rel: HashSet::new(),
        }
    }

    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let connect = match timeout(CONNECT_TIMEOUT, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("Connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        };

        let Some(client_id) = self.accept(&connect).await? else {
            return Ok(());
        };

        let (sender, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
        let kick = self.cancel.child_token();
        self.router.register(
            &client_id,
            ClientHandle {
                sender: sender.clone(),
                kick: kick.clone(),
            },
        );
        debug!(client_id = %client_id, addr = %self.addr, "Client connected");

        let keep_alive = match connect.keep_alive {
            0 => None,
            // 1.5x the negotiated interval
            secs => Some(Duration::from_millis(secs as u64 * 1500)),
        };

        let result = self
            .run_connected(&client_id, keep_alive, receiver, &kick)
            .await;

        self.router.unregister(&client_id, &sender);
        let graceful = matches!(result, Ok(true));
        debug!(client_id = %client_id, graceful, "Client session ended");
        self.hooks
            .client_disconnected(&client_id, self.addr, graceful)
            .await;

        result.map(|_| ())
    }

    async fn read_connect(&mut self) -> Result<Box<Connect>, ConnectionError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                self.read_buf.advance(consumed);
                return match packet {
                    Packet::Connect(connect) => Ok(connect),
                    _ => Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                        "first packet must be CONNECT",
                    ))),
                };
            }

            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    /// Validate the CONNECT and answer with CONNACK. Returns the session's
    /// client id when the connection was accepted.
    async fn accept(&mut self, connect: &Connect) -> Result<Option<Arc<str>>, ConnectionError> {
        let client_id = if connect.client_id.is_empty() {
            // Only 3.1.1 clean sessions may omit the client id
            if connect.protocol_version == ProtocolVersion::V31 || !connect.clean_session {
                self.write_packet(&Packet::ConnAck(ConnAck {
                    session_present: false,
                    reason_code: ReasonCode::ClientIdNotValid,
                }))
                .await?;
                return Ok(None);
            }
            generated_client_id()
        } else {
            connect.client_id.clone()
        };

        let ctx = ConnectionValidatorContext {
            client_id: client_id.clone(),
            endpoint: self.addr,
            username: connect.username.clone(),
            password: connect.password.clone(),
            clean_session: connect.clean_session,
            protocol_version: connect.protocol_version,
        };
        let reason_code = self.hooks.validate_connection(&ctx).await;

        self.write_packet(&Packet::ConnAck(ConnAck {
            session_present: false,
            reason_code,
        }))
        .await?;

        if !reason_code.is_success() {
            debug!(client_id = %client_id, addr = %self.addr, "Connection refused: {}", reason_code);
            return Ok(None);
        }

        Ok(Some(Arc::from(client_id)))
    }

    /// Returns `Ok(true)` when the client ended the session with DISCONNECT
    async fn run_connected(
        &mut self,
        client_id: &Arc<str>,
        keep_alive: Option<Duration>,
        mut outbound: mpsc::Receiver<Publish>,
        kick: &CancellationToken,
    ) -> Result<bool, ConnectionError> {
        let mut deadline = keep_alive.map(|d| Instant::now() + d);

        // Packets pipelined behind CONNECT are already buffered
        if self.process_buffered(client_id, &mut deadline, keep_alive).await? {
            return Ok(true);
        }

        loop {
            tokio::select! {
                _ = kick.cancelled() => {
                    debug!(client_id = %client_id, "Session closed by broker");
                    return Ok(false);
                }

                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result? {
                        0 => {
                            debug!(client_id = %client_id, "Connection closed without DISCONNECT");
                            return Ok(false);
                        }
                        _ => {
                            if self.process_buffered(client_id, &mut deadline, keep_alive).await? {
                                return Ok(true);
                            }
                        }
                    }
                }

                Some(publish) = outbound.recv() => {
                    self.send_publish(publish).await?;
                }

                _ = keep_alive_expired(deadline) => {
                    info!(client_id = %client_id, "Keep alive timeout - disconnecting");
                    return Err(ConnectionError::Protocol(ProtocolError::KeepAliveTimeout));
                }
            }
        }
    }

    /// Handle every complete packet in the read buffer; true on DISCONNECT
    async fn process_buffered(
        &mut self,
        client_id: &Arc<str>,
        deadline: &mut Option<Instant>,
        keep_alive: Option<Duration>,
    ) -> Result<bool, ConnectionError> {
        while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
            self.read_buf.advance(consumed);
            *deadline = keep_alive.map(|d| Instant::now() + d);

            if self.handle_packet(client_id, packet).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        packet: Packet,
    ) -> Result<bool, ConnectionError> {
        match packet {
            Packet::Connect(_) => {
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "duplicate CONNECT",
                )))
            }
            Packet::Publish(publish) => self.handle_publish(client_id, publish).await?,
            Packet::PubRel(pubrel) => {
                self.awaiting_rel.remove(&pubrel.packet_id);
                self.write_packet(&Packet::PubComp(PubComp {
                    packet_id: pubrel.packet_id,
                }))
                .await?;
            }
            Packet::PubRec(pubrec) => {
                self.write_packet(&Packet::PubRel(PubRel {
                    packet_id: pubrec.packet_id,
                }))
                .await?;
            }
            Packet::PubAck(_) | Packet::PubComp(_) => {}
            Packet::Subscribe(subscribe) => self.handle_subscribe(client_id, subscribe).await?,
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, unsubscribe).await?
            }
            Packet::PingReq => self.write_packet(&Packet::PingResp).await?,
            Packet::Disconnect => {
                debug!(client_id = %client_id, "DISCONNECT received");
                return Ok(true);
            }
            other => {
                warn!(
                    client_id = %client_id,
                    "Unexpected packet type {} from client",
                    other.packet_type()
                );
            }
        }
        Ok(false)
    }

    async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        // A retransmitted QoS 2 message must not be delivered twice
        let first_delivery = match (publish.qos, publish.packet_id) {
            (QoS::ExactlyOnce, Some(id)) => self.awaiting_rel.insert(id),
            _ => true,
        };

        if first_delivery {
            let ctx = PublishContext {
                client_id: client_id.to_string(),
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos,
                retain: publish.retain,
            };
            if self.hooks.intercept_publish(&ctx).await {
                self.router.route(&publish);
            } else {
                debug!(client_id = %client_id, topic = %publish.topic, "Publish rejected");
            }
        }

        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.write_packet(&Packet::PubAck(PubAck { packet_id }))
                    .await
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                self.write_packet(&Packet::PubRec(PubRec { packet_id }))
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let mut reason_codes = Vec::with_capacity(subscribe.subscriptions.len());

        for sub in subscribe.subscriptions {
            let ctx = SubscriptionContext {
                client_id: client_id.to_string(),
                topic_filter: sub.filter.clone(),
                qos: sub.qos,
            };
            if self.hooks.intercept_subscription(&ctx).await {
                self.router
                    .subscriptions()
                    .subscribe(client_id, &sub.filter, sub.qos);
                reason_codes.push(ReasonCode::granted(sub.qos));
            } else {
                reason_codes.push(ReasonCode::Failure);
            }
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
        }))
        .await
    }

    async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            self.router.subscriptions().unsubscribe(client_id, filter);
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await
    }

    async fn send_publish(&mut self, mut publish: Publish) -> Result<(), ConnectionError> {
        if publish.qos != QoS::AtMostOnce {
            self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
            publish.packet_id = Some(self.next_packet_id);
        }
        self.write_packet(&Packet::Publish(publish)).await
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
