//! MQTT Upstream Client
//!
//! Speaks MQTT 3.1.1 to the upstream broker over TCP or TLS. After the
//! CONNECT/CONNACK handshake a single background task owns the socket: it
//! writes queued publishes, matches acknowledgements, answers PUBREC and
//! keeps the connection alive with PINGREQ.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{LinkEvent, LinkStatus, OutboundMessage, UpstreamError, UpstreamLink, UpstreamOptions};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    Connect, Packet, ProtocolVersion, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
};
use crate::tls;

trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamStream for T {}

type BoxedStream = Box<dyn UpstreamStream>;

type PublishResult = Result<(), UpstreamError>;

/// Upper bound on unacknowledged QoS 1/2 publishes per connection
const MAX_INFLIGHT: usize = 1024;

enum Command {
    Publish {
        publish: Publish,
        done: oneshot::Sender<PublishResult>,
    },
    Disconnect,
}

struct ActiveLink {
    commands: mpsc::Sender<Command>,
    generation: u64,
    ack_timeout: Duration,
}

struct Shared {
    link: Mutex<Option<ActiveLink>>,
    status: RwLock<LinkStatus>,
    events: broadcast::Sender<LinkEvent>,
}

/// MQTT client implementation of [`UpstreamLink`]
pub struct MqttUpstream {
    shared: Arc<Shared>,
    generation: AtomicU64,
    /// Serializes connect attempts
    connect_lock: tokio::sync::Mutex<()>,
}

impl Default for MqttUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttUpstream {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            shared: Arc::new(Shared {
                link: Mutex::new(None),
                status: RwLock::new(LinkStatus::Disconnected),
                events,
            }),
            generation: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the transport and complete the CONNECT/CONNACK exchange.
    /// Returns the stream plus any bytes read past the CONNACK.
    async fn establish(options: &UpstreamOptions) -> Result<(BoxedStream, BytesMut), UpstreamError> {
        let tcp = TcpStream::connect((options.host.as_str(), options.port)).await?;
        let _ = tcp.set_nodelay(true);

        let mut stream: BoxedStream = if options.use_tls {
            let server_name = tls::server_name(&options.host)?;
            let tls_stream = tls::client_connector().connect(server_name, tcp).await?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };
        debug!("Upstream transport connected to {}", options.address());

        let connect = Packet::Connect(Box::new(Connect {
            protocol_version: ProtocolVersion::V311,
            client_id: options.client_id.clone(),
            clean_session: true,
            keep_alive: options.keep_alive,
            username: Some(options.username.clone()),
            password: Some(Bytes::copy_from_slice(options.password.expose().as_bytes())),
            will: None,
        }));

        let mut buf = BytesMut::new();
        Encoder::new()
            .encode(&connect, &mut buf)
            .map_err(|e| UpstreamError::Other(format!("Encode error: {}", e)))?;
        stream.write_all(&buf).await?;

        let decoder = Decoder::new();
        let mut read_buf = BytesMut::with_capacity(4096);
        loop {
            if let Some((packet, consumed)) = decoder
                .decode(&read_buf)
                .map_err(|e| UpstreamError::Other(format!("Decode error: {}", e)))?
            {
                read_buf.advance(consumed);
                return match packet {
                    Packet::ConnAck(connack) if connack.reason_code.is_success() => {
                        Ok((stream, read_buf))
                    }
                    Packet::ConnAck(connack) => Err(UpstreamError::Rejected(connack.reason_code)),
                    other => Err(UpstreamError::Other(format!(
                        "Expected CONNACK, got packet type {}",
                        other.packet_type()
                    ))),
                };
            }

            if stream.read_buf(&mut read_buf).await? == 0 {
                return Err(UpstreamError::ConnectionLost(
                    "Connection closed during handshake".to_string(),
                ));
            }
        }
    }
}

#[async_trait]
impl UpstreamLink for MqttUpstream {
    async fn connect(
        &self,
        options: &UpstreamOptions,
        cancel: &CancellationToken,
    ) -> Result<(), UpstreamError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        *self.shared.status.write() = LinkStatus::Connecting;
        info!(
            client_id = %options.client_id,
            tls = options.use_tls,
            "Connecting to upstream broker {}",
            options.address()
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(UpstreamError::Other("Cancelled".to_string())),
            result = timeout(options.connect_timeout, Self::establish(options)) => {
                result.unwrap_or(Err(UpstreamError::Timeout))
            }
        };

        let (stream, read_buf) = match result {
            Ok(established) => established,
            Err(e) => {
                *self.shared.status.write() = LinkStatus::Disconnected;
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (commands, command_rx) = mpsc::channel(64);
        *self.shared.link.lock() = Some(ActiveLink {
            commands,
            generation,
            ack_timeout: options.connect_timeout,
        });
        *self.shared.status.write() = LinkStatus::Connected;
        info!("Connected to upstream broker {}", options.address());

        let task = LinkTask {
            shared: self.shared.clone(),
            generation,
            keep_alive: options.keep_alive,
            read_buf,
            inflight: HashMap::new(),
            next_packet_id: 0,
            encoder: Encoder::new(),
            write_buf: BytesMut::with_capacity(1024),
        };
        tokio::spawn(task.run(stream, command_rx, cancel.clone()));

        Ok(())
    }

    async fn publish(
        &self,
        message: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<(), UpstreamError> {
        let (commands, ack_timeout) = {
            let link = self.shared.link.lock();
            let link = link.as_ref().ok_or(UpstreamError::NotConnected)?;
            (link.commands.clone(), link.ack_timeout)
        };

        let (done, done_rx) = oneshot::channel();
        let publish = Publish {
            dup: false,
            qos: message.qos,
            retain: message.retain,
            topic: message.topic,
            packet_id: None,
            payload: message.payload,
        };
        commands
            .send(Command::Publish { publish, done })
            .await
            .map_err(|_| UpstreamError::NotConnected)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(UpstreamError::Other("Cancelled".to_string())),
            result = timeout(ack_timeout, done_rx) => match result {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(UpstreamError::ConnectionLost(
                    "Connection closed before acknowledgement".to_string(),
                )),
                Err(_) => Err(UpstreamError::Timeout),
            },
        }
    }

    async fn disconnect(&self) {
        let link = self.shared.link.lock().take();
        if let Some(link) = link {
            let _ = link.commands.send(Command::Disconnect).await;
        }
        *self.shared.status.write() = LinkStatus::Disconnected;
    }

    fn status(&self) -> LinkStatus {
        *self.shared.status.read()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.shared.events.subscribe()
    }
}

/// Owns one established connection until it ends
struct LinkTask {
    shared: Arc<Shared>,
    generation: u64,
    keep_alive: u16,
    read_buf: BytesMut,
    /// Unacknowledged QoS 1/2 publishes by packet id
    inflight: HashMap<u16, oneshot::Sender<PublishResult>>,
    next_packet_id: u16,
    encoder: Encoder,
    write_buf: BytesMut,
}

impl LinkTask {
    async fn run(
        mut self,
        stream: BoxedStream,
        mut commands: mpsc::Receiver<Command>,
        cancel: CancellationToken,
    ) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let decoder = Decoder::new();

        let ping_period = Duration::from_secs(self.keep_alive.max(1) as u64);
        let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
        // Nothing heard for one and a half keep-alive periods means the link is dead
        let idle_limit = ping_period + ping_period / 2;
        let mut last_inbound = Instant::now();

        // Err carries the reason the connection dropped
        let outcome: Result<(), String> = loop {
            // Bytes already buffered behind the CONNACK
            if let Err(reason) = self.process_incoming(&decoder, &mut writer).await {
                break Err(reason);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = self.write(&mut writer, &Packet::Disconnect).await;
                    break Ok(());
                }

                command = commands.recv() => match command {
                    Some(Command::Publish { publish, done }) => {
                        if let Err(reason) = self.send_publish(&mut writer, publish, done).await {
                            break Err(reason);
                        }
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = self.write(&mut writer, &Packet::Disconnect).await;
                        break Ok(());
                    }
                },

                result = reader.read_buf(&mut self.read_buf) => match result {
                    Ok(0) => break Err("Connection closed by upstream broker".to_string()),
                    Ok(_) => last_inbound = Instant::now(),
                    Err(e) => break Err(e.to_string()),
                },

                _ = sleep_until(last_inbound + idle_limit), if self.keep_alive > 0 => {
                    break Err("keep-alive timeout".to_string());
                }

                _ = ping.tick(), if self.keep_alive > 0 => {
                    trace!("Sending PINGREQ upstream");
                    if let Err(e) = self.write(&mut writer, &Packet::PingReq).await {
                        break Err(e.to_string());
                    }
                }
            }
        };

        {
            let mut link = self.shared.link.lock();
            if link.as_ref().map(|l| l.generation) == Some(self.generation) {
                *link = None;
                *self.shared.status.write() = LinkStatus::Disconnected;
            }
        }

        // Pending publishes see their sender dropped
        self.inflight.clear();

        match outcome {
            Ok(()) => debug!("Upstream connection closed"),
            Err(reason) => {
                warn!("Upstream connection lost: {}", reason);
                let _ = self.shared.events.send(LinkEvent::Disconnected { reason });
            }
        }
    }

    /// Pick a free packet id. Entries whose caller already gave up are
    /// dropped first; `None` when the inflight window is full.
    fn allocate_packet_id(&mut self) -> Option<u16> {
        self.inflight.retain(|_, done| !done.is_closed());
        if self.inflight.len() >= MAX_INFLIGHT {
            return None;
        }
        loop {
            self.next_packet_id = self.next_packet_id.wrapping_add(1).max(1);
            if !self.inflight.contains_key(&self.next_packet_id) {
                return Some(self.next_packet_id);
            }
        }
    }

    async fn send_publish(
        &mut self,
        writer: &mut WriteHalf<BoxedStream>,
        mut publish: Publish,
        done: oneshot::Sender<PublishResult>,
    ) -> Result<(), String> {
        let packet_id = match publish.qos {
            QoS::AtMostOnce => None,
            _ => match self.allocate_packet_id() {
                Some(id) => Some(id),
                None => {
                    warn!("Upstream inflight window full, rejecting publish to {}", publish.topic);
                    let _ = done.send(Err(UpstreamError::Other(
                        "Too many unacknowledged publishes".to_string(),
                    )));
                    return Ok(());
                }
            },
        };
        publish.packet_id = packet_id;

        if let Err(e) = self.write(writer, &Packet::Publish(publish)).await {
            let reason = e.to_string();
            let _ = done.send(Err(UpstreamError::ConnectionLost(reason.clone())));
            return Err(reason);
        }

        match packet_id {
            Some(id) => {
                self.inflight.insert(id, done);
            }
            None => {
                let _ = done.send(Ok(()));
            }
        }
        Ok(())
    }

    /// Handle every complete packet in the read buffer
    async fn process_incoming(
        &mut self,
        decoder: &Decoder,
        writer: &mut WriteHalf<BoxedStream>,
    ) -> Result<(), String> {
        loop {
            let (packet, consumed) = match decoder.decode(&self.read_buf) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(()),
                Err(e) => return Err(format!("Decode error: {}", e)),
            };
            self.read_buf.advance(consumed);

            match packet {
                Packet::PubAck(PubAck { packet_id }) | Packet::PubComp(PubComp { packet_id }) => {
                    if let Some(done) = self.inflight.remove(&packet_id) {
                        let _ = done.send(Ok(()));
                    }
                }
                Packet::PubRec(PubRec { packet_id }) => {
                    self.write(writer, &Packet::PubRel(PubRel { packet_id }))
                        .await
                        .map_err(|e| e.to_string())?;
                }
                Packet::Publish(publish) => {
                    // Nothing is subscribed upstream; acknowledge and drop
                    let ack = match (publish.qos, publish.packet_id) {
                        (QoS::AtLeastOnce, Some(packet_id)) => Some(Packet::PubAck(PubAck { packet_id })),
                        (QoS::ExactlyOnce, Some(packet_id)) => Some(Packet::PubRec(PubRec { packet_id })),
                        _ => None,
                    };
                    if let Some(ack) = ack {
                        self.write(writer, &ack).await.map_err(|e| e.to_string())?;
                    }
                }
                Packet::PubRel(PubRel { packet_id }) => {
                    self.write(writer, &Packet::PubComp(PubComp { packet_id }))
                        .await
                        .map_err(|e| e.to_string())?;
                }
                Packet::PingResp => trace!("PINGRESP received"),
                other => debug!("Ignoring upstream packet type {}", other.packet_type()),
            }
        }
    }

    async fn write(
        &mut self,
        writer: &mut WriteHalf<BoxedStream>,
        packet: &Packet,
    ) -> std::io::Result<()> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        writer.write_all(&self.write_buf).await?;
        writer.flush().await
    }
}
