// Duplex channels over QUIC: the first bidirectional stream of a connection carries the session.
use async_trait::async_trait;
use broker_transport::QuicConnection;
use broker_wire::Message;
use bytes::BytesMut;
use quinn::{RecvStream, SendStream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::{Endpoint, QuicEndpointConfig, codec, peer_identity};
use crate::client::CallerIdentity;
use crate::error::TransportError;
use crate::transport::{Abortable, ChannelId, DuplexChannel, DuplexListener, ReplySink};

const INBOUND_DEPTH: usize = 64;
const CLOSE_ABORTED: u32 = 1;

pub struct QuicDuplexListener {
    endpoint: Endpoint<QuicDuplexChannel>,
}

impl QuicDuplexListener {
    pub fn new(config: QuicEndpointConfig) -> Self {
        Self {
            endpoint: Endpoint::new(config),
        }
    }

    /// Bound address once `open` succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }
}

#[async_trait]
impl DuplexListener for QuicDuplexListener {
    type Channel = QuicDuplexChannel;

    async fn open(&self) -> anyhow::Result<()> {
        let max_frame_bytes = self.endpoint.max_frame_bytes();
        let addr = self.endpoint.open(move |connection, ready| async move {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let channel = QuicDuplexChannel::start(connection, send, recv, max_frame_bytes);
                    if ready.send(Arc::new(channel)).await.is_err() {
                        tracing::debug!("duplex listener closed before channel was accepted");
                    }
                }
                Err(err) => tracing::debug!(error = %err, "connection closed before opening a session"),
            }
        })?;
        tracing::info!(addr = %addr, "quic duplex listener bound");
        Ok(())
    }

    async fn accept(&self, timeout: Duration) -> Result<Option<Arc<Self::Channel>>, TransportError> {
        self.endpoint.accept(timeout).await
    }

    fn close(&self) {
        self.endpoint.close();
    }
}

pub struct QuicDuplexChannel {
    id: ChannelId,
    identity: CallerIdentity,
    connection: QuicConnection,
    send: tokio::sync::Mutex<SendStream>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Result<Message, TransportError>>>,
    reader: AbortHandle,
    faulted: AtomicBool,
    max_frame_bytes: usize,
}

impl QuicDuplexChannel {
    fn start(
        connection: QuicConnection,
        send: SendStream,
        recv: RecvStream,
        max_frame_bytes: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_DEPTH);
        let reader = tokio::spawn(read_session(recv, tx, max_frame_bytes)).abort_handle();
        Self {
            id: ChannelId::next(),
            identity: peer_identity(&connection),
            connection,
            send: tokio::sync::Mutex::new(send),
            inbound: tokio::sync::Mutex::new(rx),
            reader,
            faulted: AtomicBool::new(false),
            max_frame_bytes,
        }
    }
}

// Decodes frames off the session stream; a read error is the last item before the queue closes.
async fn read_session(
    mut recv: RecvStream,
    tx: mpsc::Sender<Result<Message, TransportError>>,
    max_frame_bytes: usize,
) {
    let mut scratch = BytesMut::new();
    loop {
        let item = match codec::read_message(&mut recv, max_frame_bytes, &mut scratch).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => return,
            Err(err) => Err(TransportError::Faulted(format!("{err:#}"))),
        };
        let last = item.is_err();
        if tx.send(item).await.is_err() || last {
            return;
        }
    }
}

#[async_trait]
impl ReplySink for QuicDuplexChannel {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        let mut send = self.send.lock().await;
        codec::write_message(&mut send, &message, self.max_frame_bytes)
            .await
            .map_err(|err| TransportError::Communication(format!("{err:#}")))
    }
}

impl Abortable for QuicDuplexChannel {
    fn abort(&self) {
        self.reader.abort();
        self.connection.close(CLOSE_ABORTED, b"aborted");
    }
}

#[async_trait]
impl DuplexChannel for QuicDuplexChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn identity(&self) -> &CallerIdentity {
        &self.identity
    }

    fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        let next = tokio::time::timeout(timeout, async { self.inbound.lock().await.recv().await })
            .await
            .map_err(|_| TransportError::Timeout)?;
        match next {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(err)) => {
                self.faulted.store(true, Ordering::Release);
                Err(err)
            }
            None => Ok(None),
        }
    }

    async fn close(&self) {
        if let Err(err) = self.send.lock().await.finish() {
            tracing::debug!(channel = %self.id, error = %err, "session stream already closed");
        }
        self.reader.abort();
        self.connection.close(0, b"closed");
    }
}
