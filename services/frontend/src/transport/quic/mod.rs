//! QUIC bindings of the transport traits.
//!
//! Every listener binds its endpoint in `open` and runs one background task that completes
//! handshakes and hands ready channels to `accept` through a queue, so `accept` and
//! `receive` stay cancel-safe under their timeouts.
use anyhow::{Context, Result};
use broker_transport::{QuicConnection, QuicServer, TransportConfig};
use parking_lot::Mutex;
use quinn::ServerConfig;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::CallerIdentity;
use crate::error::TransportError;

pub mod codec;
pub mod duplex;
pub mod ingress;
pub mod request_reply;

pub use duplex::{QuicDuplexChannel, QuicDuplexListener};
pub use ingress::QuicIngressQueue;
pub use request_reply::{QuicReplyChannel, QuicReplyListener};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
const CHANNEL_BACKLOG: usize = 256;

/// Where and how a QUIC listener binds.
#[derive(Debug, Clone)]
pub struct QuicEndpointConfig {
    pub bind: SocketAddr,
    pub server_config: ServerConfig,
    pub transport: TransportConfig,
    pub max_frame_bytes: usize,
}

impl QuicEndpointConfig {
    pub fn new(bind: SocketAddr, server_config: ServerConfig) -> Self {
        Self {
            bind,
            server_config,
            transport: TransportConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

pub(crate) fn peer_identity(connection: &QuicConnection) -> CallerIdentity {
    CallerIdentity::anonymous(format!("quic/{}", connection.info().peer_addr))
}

/// A bound endpoint plus the queue its connection task feeds.
pub(crate) struct Endpoint<T> {
    config: QuicEndpointConfig,
    server: Mutex<Option<Arc<QuicServer>>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    ready_tx: Mutex<Option<mpsc::Sender<Arc<T>>>>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<T>>>,
}

impl<T: Send + Sync + 'static> Endpoint<T> {
    pub(crate) fn new(config: QuicEndpointConfig) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(CHANNEL_BACKLOG);
        Self {
            config,
            server: Mutex::new(None),
            acceptor: Mutex::new(None),
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx: tokio::sync::Mutex::new(ready_rx),
        }
    }

    pub(crate) fn max_frame_bytes(&self) -> usize {
        self.config.max_frame_bytes
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.server
            .lock()
            .as_ref()
            .and_then(|server| server.local_addr().ok())
    }

    /// Binds the endpoint and starts completing connections with `on_connection`, which
    /// turns each connection into ready channels pushed to the given sender.
    pub(crate) fn open<F, Fut>(&self, on_connection: F) -> Result<SocketAddr>
    where
        F: Fn(QuicConnection, mpsc::Sender<Arc<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let ready_tx = self
            .ready_tx
            .lock()
            .take()
            .context("QUIC listener already opened or closed")?;
        let server = Arc::new(QuicServer::bind(
            self.config.bind,
            self.config.server_config.clone(),
            self.config.transport.clone(),
        )?);
        let local_addr = server.local_addr()?;
        *self.server.lock() = Some(server.clone());
        let task = tokio::spawn(async move {
            loop {
                match server.accept().await {
                    Ok(Some(connection)) => {
                        tracing::debug!(
                            connection = connection.info().id.0,
                            peer = %connection.info().peer_addr,
                            "quic connection accepted"
                        );
                        tokio::spawn(on_connection(connection, ready_tx.clone()));
                    }
                    Ok(None) => break,
                    Err(err) => tracing::warn!(error = %err, "quic handshake failed"),
                }
            }
        });
        *self.acceptor.lock() = Some(task);
        Ok(local_addr)
    }

    pub(crate) async fn accept(&self, timeout: Duration) -> Result<Option<Arc<T>>, TransportError> {
        if self.server.lock().is_none() {
            return Err(TransportError::Closed);
        }
        tokio::time::timeout(timeout, async { self.ready_rx.lock().await.recv().await })
            .await
            .map_err(|_| TransportError::Timeout)
    }

    pub(crate) fn close(&self) {
        self.ready_tx.lock().take();
        if let Some(task) = self.acceptor.lock().take() {
            task.abort();
        }
        if let Some(server) = self.server.lock().as_ref() {
            server.close();
        }
    }
}
