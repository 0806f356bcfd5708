//! Local MQTT Broker
//!
//! Accepts local MQTT 3.1 / 3.1.1 clients over plain TCP and, when a
//! certificate is configured, over TLS. Every connection is handled by its
//! own task; the callbacks in [`BrokerHooks`] decide what is admitted.

mod connection;
mod router;

pub use connection::{Connection, ConnectionError};

use connection::CONNECT_TIMEOUT;
pub use router::MessageRouter;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::config::Config;
use crate::hooks::BrokerHooks;
use crate::tls::{self, TlsError};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    /// TLS listener address; requires certificate and key
    pub tls_bind_addr: Option<SocketAddr>,
    pub tls_certificate: Option<PathBuf>,
    pub tls_private_key: Option<PathBuf>,
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            tls_bind_addr: None,
            tls_certificate: None,
            tls_private_key: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl From<&Config> for BrokerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_addr: config.local_addr(),
            tls_bind_addr: config.tls_addr(),
            tls_certificate: config.tls_certificate.clone(),
            tls_private_key: config.tls_private_key.clone(),
            max_packet_size: config.max_packet_size,
        }
    }
}

/// Errors that keep the broker from starting
#[derive(Debug)]
pub enum BrokerError {
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    Tls(TlsError),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Bind { addr, source } => write!(f, "Failed to bind {}: {}", addr, source),
            BrokerError::Tls(e) => write!(f, "TLS error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<TlsError> for BrokerError {
    fn from(e: TlsError) -> Self {
        BrokerError::Tls(e)
    }
}

/// The seam the bridge uses to run a local endpoint with its callbacks bound
#[async_trait]
pub trait LocalBrokerAdapter: Send + Sync {
    /// Bind the listeners and start accepting clients in the background.
    /// Returns once the listeners are bound.
    async fn start(&self, hooks: BrokerHooks, cancel: CancellationToken)
        -> Result<(), BrokerError>;
}

pub struct Broker {
    config: BrokerConfig,
    router: Arc<MessageRouter>,
    local_addr: Mutex<Option<SocketAddr>>,
    tls_local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            router: Arc::new(MessageRouter::new()),
            local_addr: Mutex::new(None),
            tls_local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bound address of the plain listener once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Bound address of the TLS listener once started
    pub fn tls_local_addr(&self) -> Option<SocketAddr> {
        *self.tls_local_addr.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.router.client_count()
    }

    /// Wait for the accept loops to finish after cancellation
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    async fn bind(addr: SocketAddr) -> Result<TcpListener, BrokerError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| BrokerError::Bind { addr, source })
    }

    fn spawn_accept_loop(
        &self,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        hooks: BrokerHooks,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let router = self.router.clone();
        let max_packet_size = self.config.max_packet_size;

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };

                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                debug!("New connection from {}", addr);
                let _ = stream.set_nodelay(true);

                let router = router.clone();
                let hooks = hooks.clone();
                let cancel = cancel.clone();
                let acceptor = acceptor.clone();

                tokio::spawn(async move {
                    let result = match acceptor {
                        Some(acceptor) => match accept_tls(&acceptor, stream, CONNECT_TIMEOUT).await {
                            Ok(tls_stream) => {
                                Connection::new(tls_stream, addr, router, hooks, max_packet_size, cancel)
                                    .run()
                                    .await
                            }
                            Err(e) => {
                                debug!("TLS handshake failed for {}: {}", addr, e);
                                return;
                            }
                        },
                        None => {
                            Connection::new(stream, addr, router, hooks, max_packet_size, cancel)
                                .run()
                                .await
                        }
                    };

                    if let Err(e) = result {
                        debug!("Connection error from {}: {}", addr, e);
                    }
                });
            }
            debug!("Accept loop stopped");
        })
    }
}

/// Complete the server side of the TLS handshake within `limit`
async fn accept_tls<IO>(acceptor: &TlsAcceptor, stream: IO, limit: Duration) -> io::Result<TlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    timeout(limit, acceptor.accept(stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))?
}

#[async_trait]
impl LocalBrokerAdapter for Broker {
    async fn start(
        &self,
        hooks: BrokerHooks,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        // Load TLS material before binding anything
        let tls_setup = match (
            self.config.tls_bind_addr,
            &self.config.tls_certificate,
            &self.config.tls_private_key,
        ) {
            (Some(addr), Some(cert), Some(key)) => Some((addr, tls::server_acceptor(cert, key)?)),
            _ => None,
        };

        let listener = Self::bind(self.config.bind_addr).await?;
        let addr = listener.local_addr().unwrap_or(self.config.bind_addr);
        *self.local_addr.lock() = Some(addr);
        info!("MQTT/TCP listening on {}", addr);

        let tls_listener = match tls_setup {
            Some((tls_addr, acceptor)) => {
                let tls_listener = Self::bind(tls_addr).await?;
                let bound = tls_listener.local_addr().unwrap_or(tls_addr);
                *self.tls_local_addr.lock() = Some(bound);
                info!("MQTT/TLS listening on {}", bound);
                Some((tls_listener, acceptor))
            }
            None => None,
        };

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_accept_loop(listener, None, hooks.clone(), cancel.clone()));
        if let Some((tls_listener, acceptor)) = tls_listener {
            tasks.push(self.spawn_accept_loop(tls_listener, Some(acceptor), hooks, cancel));
        }

        Ok(())
    }
}
