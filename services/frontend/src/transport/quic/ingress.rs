// Polled ingress over QUIC: every unidirectional stream carries fire-and-forget messages.
use async_trait::async_trait;
use broker_transport::QuicConnection;
use bytes::BytesMut;
use quinn::RecvStream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Endpoint, QuicEndpointConfig, codec, peer_identity};
use crate::client::CallerIdentity;
use crate::error::TransportError;
use crate::transport::memory::MemoryQueue;
use crate::transport::{MessageQueue, QueuedMessage};

/// Messages from all connections land in one in-process queue that the poll loops drain.
pub struct QuicIngressQueue {
    // Carries no channels; connections push straight into `queue`.
    endpoint: Endpoint<()>,
    queue: Arc<MemoryQueue>,
}

impl QuicIngressQueue {
    pub fn new(config: QuicEndpointConfig) -> Self {
        Self {
            endpoint: Endpoint::new(config),
            queue: Arc::new(MemoryQueue::new()),
        }
    }

    /// Bounds the queue between ingress streams and the poll loops.
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue = Arc::new(MemoryQueue::with_capacity(depth));
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Messages received but not yet polled.
    pub fn depth(&self) -> usize {
        self.queue.depth()
    }
}

async fn drain_connection(
    connection: QuicConnection,
    sink: mpsc::Sender<QueuedMessage>,
    max_frame_bytes: usize,
) {
    let identity = peer_identity(&connection);
    loop {
        let recv = match connection.accept_uni().await {
            Ok(recv) => recv,
            Err(err) => {
                tracing::debug!(error = %err, "ingress connection closed");
                return;
            }
        };
        tokio::spawn(drain_stream(recv, identity.clone(), sink.clone(), max_frame_bytes));
    }
}

async fn drain_stream(
    mut recv: RecvStream,
    identity: CallerIdentity,
    sink: mpsc::Sender<QueuedMessage>,
    max_frame_bytes: usize,
) {
    let mut scratch = BytesMut::new();
    loop {
        match codec::read_message(&mut recv, max_frame_bytes, &mut scratch).await {
            Ok(Some(message)) => {
                let queued = QueuedMessage {
                    message,
                    identity: identity.clone(),
                };
                // Waits while the queue is full, so stream flow control pushes back on the peer.
                if sink.send(queued).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                metrics::counter!("broker_frontend_ingress_errors_total").increment(1);
                tracing::debug!(identity = identity.name(), error = %err, "ingress stream dropped");
                return;
            }
        }
    }
}

#[async_trait]
impl MessageQueue for QuicIngressQueue {
    async fn open(&self) -> anyhow::Result<()> {
        let sink = self
            .queue
            .sender()
            .ok_or_else(|| anyhow::anyhow!("ingress queue already closed"))?;
        let max_frame_bytes = self.endpoint.max_frame_bytes();
        let addr = self.endpoint.open(move |connection, _ready| {
            drain_connection(connection, sink.clone(), max_frame_bytes)
        })?;
        tracing::info!(addr = %addr, "quic ingress listener bound");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<QueuedMessage>, TransportError> {
        self.queue.poll(timeout).await
    }

    fn close(&self) {
        self.endpoint.close();
        self.queue.close();
    }
}
