// Request/reply over QUIC: one connection is a session channel, each bidirectional stream one exchange.
use async_trait::async_trait;
use broker_transport::QuicConnection;
use broker_wire::Message;
use bytes::BytesMut;
use quinn::{RecvStream, SendStream, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{Endpoint, QuicEndpointConfig, codec, peer_identity};
use crate::client::CallerIdentity;
use crate::error::TransportError;
use crate::transport::{
    Abortable, ChannelId, ChannelShape, InboundRequest, ReplyChannel, ReplyListener, Responder,
};

const REQUEST_DEPTH: usize = 64;
const CLOSE_ABORTED: u32 = 1;
const RESET_ABORTED: u32 = 1;

pub struct QuicReplyListener {
    endpoint: Endpoint<QuicReplyChannel>,
}

impl QuicReplyListener {
    pub fn new(config: QuicEndpointConfig) -> Self {
        Self {
            endpoint: Endpoint::new(config),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }
}

#[async_trait]
impl ReplyListener for QuicReplyListener {
    type Channel = QuicReplyChannel;

    fn shape(&self) -> ChannelShape {
        ChannelShape::Session
    }

    async fn open(&self) -> anyhow::Result<()> {
        let max_frame_bytes = self.endpoint.max_frame_bytes();
        let addr = self.endpoint.open(move |connection, ready| async move {
            let channel = QuicReplyChannel::start(connection, max_frame_bytes);
            if ready.send(Arc::new(channel)).await.is_err() {
                tracing::debug!("request listener closed before channel was accepted");
            }
        })?;
        tracing::info!(addr = %addr, "quic request/reply listener bound");
        Ok(())
    }

    async fn accept(&self, timeout: Duration) -> Result<Option<Arc<Self::Channel>>, TransportError> {
        self.endpoint.accept(timeout).await
    }

    fn close(&self) {
        self.endpoint.close();
    }
}

pub struct QuicReplyChannel {
    id: ChannelId,
    identity: CallerIdentity,
    connection: QuicConnection,
    requests: tokio::sync::Mutex<mpsc::Receiver<InboundRequest>>,
    streams: AbortHandle,
}

impl QuicReplyChannel {
    fn start(connection: QuicConnection, max_frame_bytes: usize) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_DEPTH);
        let streams = tokio::spawn(accept_exchanges(connection.clone(), tx, max_frame_bytes))
            .abort_handle();
        Self {
            id: ChannelId::next(),
            identity: peer_identity(&connection),
            connection,
            requests: tokio::sync::Mutex::new(rx),
            streams,
        }
    }
}

// Accepts streams until the connection ends; each stream is read concurrently so one slow
// sender cannot hold back the others.
async fn accept_exchanges(
    connection: QuicConnection,
    tx: mpsc::Sender<InboundRequest>,
    max_frame_bytes: usize,
) {
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(err) => {
                tracing::debug!(error = %err, "request connection closed");
                return;
            }
        };
        tokio::spawn(read_exchange(send, recv, tx.clone(), max_frame_bytes));
    }
}

async fn read_exchange(
    mut send: SendStream,
    mut recv: RecvStream,
    tx: mpsc::Sender<InboundRequest>,
    max_frame_bytes: usize,
) {
    let mut scratch = BytesMut::new();
    let message = match codec::read_message(&mut recv, max_frame_bytes, &mut scratch).await {
        Ok(Some(message)) => message,
        Ok(None) => return,
        Err(err) => {
            tracing::debug!(error = %err, "malformed request stream");
            let _ = send.reset(VarInt::from_u32(RESET_ABORTED));
            return;
        }
    };
    let request = InboundRequest {
        message,
        responder: Box::new(QuicResponder {
            send,
            max_frame_bytes,
        }),
    };
    if tx.send(request).await.is_err() {
        tracing::debug!("request channel closed before request was received");
    }
}

struct QuicResponder {
    send: SendStream,
    max_frame_bytes: usize,
}

#[async_trait]
impl Responder for QuicResponder {
    async fn respond(mut self: Box<Self>, message: Message) -> Result<(), TransportError> {
        codec::write_message(&mut self.send, &message, self.max_frame_bytes)
            .await
            .map_err(|err| TransportError::Communication(format!("{err:#}")))?;
        self.send
            .finish()
            .map_err(|err| TransportError::Communication(err.to_string()))
    }

    fn abort(mut self: Box<Self>) {
        let _ = self.send.reset(VarInt::from_u32(RESET_ABORTED));
    }
}

impl Abortable for QuicReplyChannel {
    fn abort(&self) {
        self.streams.abort();
        self.connection.close(CLOSE_ABORTED, b"aborted");
    }
}

#[async_trait]
impl ReplyChannel for QuicReplyChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn identity(&self) -> &CallerIdentity {
        &self.identity
    }

    async fn receive_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<InboundRequest>, TransportError> {
        tokio::time::timeout(timeout, async { self.requests.lock().await.recv().await })
            .await
            .map_err(|_| TransportError::Timeout)
    }

    async fn close(&self) {
        self.streams.abort();
        self.connection.close(0, b"closed");
    }
}
