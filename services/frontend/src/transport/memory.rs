// In-process transports for embedding the front end and for tests.
use anyhow::bail;
use async_trait::async_trait;
use broker_wire::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::{
    Abortable, ChannelId, ChannelShape, DuplexChannel, DuplexListener, InboundRequest,
    MessageQueue, QueuedMessage, ReplyChannel, ReplyListener, ReplySink, Responder,
};
use crate::client::CallerIdentity;
use crate::error::TransportError;

// Errors scripted by a test, returned ahead of real I/O in FIFO order.
#[derive(Debug, Default)]
struct FaultScript(Mutex<VecDeque<TransportError>>);

impl FaultScript {
    fn push(&self, err: TransportError) {
        self.0.lock().push_back(err);
    }

    fn next(&self) -> Option<TransportError> {
        self.0.lock().pop_front()
    }
}

#[derive(Debug, Default)]
struct ChannelFlags {
    closed: AtomicBool,
    aborted: AtomicBool,
    faulted: AtomicBool,
}

impl ChannelFlags {
    fn is_shut(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.aborted.load(Ordering::Acquire)
    }
}

async fn recv_within<T>(
    rx: &tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    timeout: Duration,
) -> Result<Option<T>, TransportError> {
    tokio::time::timeout(timeout, async { rx.lock().await.recv().await })
        .await
        .map_err(|_| TransportError::Timeout)
}

struct Acceptor<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<Arc<T>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<T>>>,
    faults: FaultScript,
    fail_open: AtomicBool,
}

impl<T> Acceptor<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            faults: FaultScript::default(),
            fail_open: AtomicBool::new(false),
        }
    }

    fn push(&self, channel: Arc<T>) -> Result<(), TransportError> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(channel).map_err(|_| TransportError::Closed)
    }

    fn open(&self) -> anyhow::Result<()> {
        if self.fail_open.load(Ordering::Acquire) {
            bail!("memory listener refused to open");
        }
        Ok(())
    }

    async fn accept(&self, timeout: Duration) -> Result<Option<Arc<T>>, TransportError> {
        if let Some(err) = self.faults.next() {
            return Err(err);
        }
        recv_within(&self.rx, timeout).await
    }

    // Channels already queued are still handed out; `accept` yields `None` after them.
    fn close(&self) {
        self.tx.lock().take();
    }
}

/// Listener side of an in-process duplex transport.
pub struct MemoryDuplexListener {
    acceptor: Acceptor<MemoryDuplexChannel>,
}

impl Default for MemoryDuplexListener {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDuplexListener {
    pub fn new() -> Self {
        Self {
            acceptor: Acceptor::new(),
        }
    }

    /// A listener whose `open` fails, for exercising start-up errors.
    pub fn failing_open() -> Self {
        let listener = Self::new();
        listener.acceptor.fail_open.store(true, Ordering::Release);
        listener
    }

    pub fn inject_accept_error(&self, err: TransportError) {
        self.acceptor.faults.push(err);
    }

    /// Opens a new channel as `identity` and returns the caller's end of it.
    pub fn connect(&self, identity: CallerIdentity) -> Result<MemoryDuplexPeer, TransportError> {
        let (to_server, server_inbound) = mpsc::unbounded_channel();
        let (to_peer, peer_inbound) = mpsc::unbounded_channel();
        let flags = Arc::new(ChannelFlags::default());
        let faults = Arc::new(FaultScript::default());
        let channel = Arc::new(MemoryDuplexChannel {
            id: ChannelId::next(),
            identity,
            inbound: tokio::sync::Mutex::new(server_inbound),
            outbound: to_peer,
            flags: flags.clone(),
            faults: faults.clone(),
        });
        let channel_id = channel.id;
        self.acceptor.push(channel)?;
        Ok(MemoryDuplexPeer {
            channel_id,
            outbound: Mutex::new(Some(to_server)),
            inbound: tokio::sync::Mutex::new(peer_inbound),
            flags,
            faults,
        })
    }
}

#[async_trait]
impl DuplexListener for MemoryDuplexListener {
    type Channel = MemoryDuplexChannel;

    async fn open(&self) -> anyhow::Result<()> {
        self.acceptor.open()
    }

    async fn accept(&self, timeout: Duration) -> Result<Option<Arc<Self::Channel>>, TransportError> {
        self.acceptor.accept(timeout).await
    }

    fn close(&self) {
        self.acceptor.close();
    }
}

pub struct MemoryDuplexChannel {
    id: ChannelId,
    identity: CallerIdentity,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    outbound: mpsc::UnboundedSender<Message>,
    flags: Arc<ChannelFlags>,
    faults: Arc<FaultScript>,
}

#[async_trait]
impl ReplySink for MemoryDuplexChannel {
    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.flags.is_shut() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }
}

impl Abortable for MemoryDuplexChannel {
    fn abort(&self) {
        self.flags.aborted.store(true, Ordering::Release);
    }
}

#[async_trait]
impl DuplexChannel for MemoryDuplexChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn identity(&self) -> &CallerIdentity {
        &self.identity
    }

    fn is_faulted(&self) -> bool {
        self.flags.faulted.load(Ordering::Acquire)
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        if self.flags.is_shut() {
            return Err(TransportError::Closed);
        }
        if let Some(err) = self.faults.next() {
            if matches!(err, TransportError::Faulted(_)) {
                self.flags.faulted.store(true, Ordering::Release);
            }
            return Err(err);
        }
        recv_within(&self.inbound, timeout).await
    }

    async fn close(&self) {
        self.flags.closed.store(true, Ordering::Release);
    }
}

/// The caller's end of an in-process duplex channel.
pub struct MemoryDuplexPeer {
    channel_id: ChannelId,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    flags: Arc<ChannelFlags>,
    faults: Arc<FaultScript>,
}

impl MemoryDuplexPeer {
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        let outbound = self.outbound.lock();
        let outbound = outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound.send(message).map_err(|_| TransportError::Closed)
    }

    /// Next reply from the front end, or `None` after `timeout`.
    pub async fn recv(&self, timeout: Duration) -> Option<Message> {
        recv_within(&self.inbound, timeout).await.ok().flatten()
    }

    /// Orderly close: the front end sees end-of-stream after draining what was sent.
    pub fn hang_up(&self) {
        self.outbound.lock().take();
    }

    /// Makes the server side's next receive fail with `err`.
    pub fn inject_error(&self, err: TransportError) {
        self.faults.push(err);
    }

    pub fn is_aborted(&self) -> bool {
        self.flags.aborted.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::Acquire)
    }
}

/// Listener side of an in-process request/reply transport.
pub struct MemoryReplyListener {
    shape: ChannelShape,
    acceptor: Arc<Acceptor<MemoryReplyChannel>>,
}

impl MemoryReplyListener {
    pub fn new(shape: ChannelShape) -> Self {
        Self {
            shape,
            acceptor: Arc::new(Acceptor::new()),
        }
    }

    pub fn failing_open(shape: ChannelShape) -> Self {
        let listener = Self::new(shape);
        listener.acceptor.fail_open.store(true, Ordering::Release);
        listener
    }

    pub fn inject_accept_error(&self, err: TransportError) {
        self.acceptor.faults.push(err);
    }

    /// Returns a caller bound to `identity`. Session-shaped listeners get one channel per
    /// caller; one-shot listeners get a fresh channel per request.
    pub fn connect(&self, identity: CallerIdentity) -> Result<MemoryReplyPeer, TransportError> {
        let session = match self.shape {
            ChannelShape::Session => {
                let (tx, channel) = MemoryReplyChannel::new(identity.clone());
                self.acceptor.push(Arc::new(channel))?;
                Some(tx)
            }
            ChannelShape::OneShot => None,
        };
        Ok(MemoryReplyPeer {
            identity,
            session: Mutex::new(session),
            acceptor: self.acceptor.clone(),
        })
    }
}

#[async_trait]
impl ReplyListener for MemoryReplyListener {
    type Channel = MemoryReplyChannel;

    fn shape(&self) -> ChannelShape {
        self.shape
    }

    async fn open(&self) -> anyhow::Result<()> {
        self.acceptor.open()
    }

    async fn accept(&self, timeout: Duration) -> Result<Option<Arc<Self::Channel>>, TransportError> {
        self.acceptor.accept(timeout).await
    }

    fn close(&self) {
        self.acceptor.close();
    }
}

pub struct MemoryReplyChannel {
    id: ChannelId,
    identity: CallerIdentity,
    requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundRequest>>,
    flags: ChannelFlags,
}

impl MemoryReplyChannel {
    fn new(identity: CallerIdentity) -> (mpsc::UnboundedSender<InboundRequest>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            id: ChannelId::next(),
            identity,
            requests: tokio::sync::Mutex::new(rx),
            flags: ChannelFlags::default(),
        };
        (tx, channel)
    }
}

impl Abortable for MemoryReplyChannel {
    fn abort(&self) {
        self.flags.aborted.store(true, Ordering::Release);
    }
}

#[async_trait]
impl ReplyChannel for MemoryReplyChannel {
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
        if self.flags.is_shut() {
            return Err(TransportError::Closed);
        }
        recv_within(&self.requests, timeout).await
    }

    async fn close(&self) {
        self.flags.closed.store(true, Ordering::Release);
    }
}

struct MemoryResponder {
    tx: oneshot::Sender<Message>,
}

#[async_trait]
impl Responder for MemoryResponder {
    async fn respond(self: Box<Self>, message: Message) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }

    fn abort(self: Box<Self>) {}
}

/// The caller's end of an in-process request/reply transport.
pub struct MemoryReplyPeer {
    identity: CallerIdentity,
    session: Mutex<Option<mpsc::UnboundedSender<InboundRequest>>>,
    acceptor: Arc<Acceptor<MemoryReplyChannel>>,
}

impl MemoryReplyPeer {
    /// Sends one request and waits for its reply.
    ///
    /// `Err(Faulted)` means the front end dropped the request without answering.
    pub async fn request(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let (tx, rx) = oneshot::channel();
        let request = InboundRequest {
            message,
            responder: Box::new(MemoryResponder { tx }),
        };
        let session = self.session.lock().clone();
        match session {
            Some(session) => session
                .send(request)
                .map_err(|_| TransportError::Closed)?,
            None => {
                let (one_shot, channel) = MemoryReplyChannel::new(self.identity.clone());
                one_shot
                    .send(request)
                    .map_err(|_| TransportError::Closed)?;
                self.acceptor.push(Arc::new(channel))?;
            }
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Faulted("request dropped without reply".into())),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    pub fn hang_up(&self) {
        self.session.lock().take();
    }
}

/// Default bound of a polled queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

/// In-process polled queue, bounded so producers feel a throttled consumer.
pub struct MemoryQueue {
    tx: Mutex<Option<mpsc::Sender<QueuedMessage>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<QueuedMessage>>,
    faults: FaultScript,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            faults: FaultScript::default(),
        }
    }

    /// Enqueues without waiting; a full queue is a transient communication failure.
    pub fn push(&self, message: Message, identity: CallerIdentity) -> Result<(), TransportError> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(TransportError::Closed)?;
        match tx.try_send(QueuedMessage { message, identity }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("broker_frontend_queue_full_total").increment(1);
                Err(TransportError::Communication(format!(
                    "queue full ({} pending)",
                    tx.max_capacity()
                )))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    /// Messages waiting to be polled.
    pub fn depth(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    pub fn inject_error(&self, err: TransportError) {
        self.faults.push(err);
    }

    /// A sender that outlives borrows of the queue, for ingress tasks.
    pub(crate) fn sender(&self) -> Option<mpsc::Sender<QueuedMessage>> {
        self.tx.lock().clone()
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn poll(&self, timeout: Duration) -> Result<Option<QueuedMessage>, TransportError> {
        if let Some(err) = self.faults.next() {
            return Err(err);
        }
        let polled = tokio::time::timeout(timeout, async { self.rx.lock().await.recv().await });
        match polled.await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const SHORT: Duration = Duration::from_millis(50);

    fn alice() -> CallerIdentity {
        CallerIdentity::user("alice")
    }

    #[tokio::test]
    async fn duplex_round_trip_and_hang_up() {
        let listener = MemoryDuplexListener::new();
        let peer = listener.connect(alice()).unwrap();
        let channel = listener.accept(SHORT).await.unwrap().expect("channel");
        assert_eq!(channel.id(), peer.channel_id());

        peer.send(Message::request("Ping", Bytes::new())).unwrap();
        let request = channel.receive(SHORT).await.unwrap().expect("request");
        channel
            .send(Message::reply_to(&request, Bytes::from_static(b"pong")))
            .await
            .unwrap();
        assert_eq!(
            peer.recv(SHORT).await.expect("reply").body,
            Bytes::from_static(b"pong")
        );

        assert_eq!(channel.receive(SHORT).await, Err(TransportError::Timeout));
        peer.hang_up();
        assert_eq!(channel.receive(SHORT).await, Ok(None));
    }

    #[tokio::test]
    async fn injected_fault_marks_channel_faulted() {
        let listener = MemoryDuplexListener::new();
        let peer = listener.connect(alice()).unwrap();
        let channel = listener.accept(SHORT).await.unwrap().expect("channel");
        peer.inject_error(TransportError::Faulted("reset".into()));
        assert!(matches!(
            channel.receive(SHORT).await,
            Err(TransportError::Faulted(_))
        ));
        assert!(channel.is_faulted());
        channel.abort();
        assert!(peer.is_aborted());
        assert_eq!(channel.receive(SHORT).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn closed_listener_drains_then_ends() {
        let listener = MemoryDuplexListener::new();
        let _peer = listener.connect(alice()).unwrap();
        listener.close();
        assert!(listener.connect(alice()).is_err());
        assert!(listener.accept(SHORT).await.unwrap().is_some());
        assert!(listener.accept(SHORT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_shot_peer_gets_a_channel_per_request() {
        let listener = MemoryReplyListener::new(ChannelShape::OneShot);
        let peer = listener.connect(alice()).unwrap();
        let exchange = tokio::spawn(async move {
            peer.request(Message::request("Calc", Bytes::new()), Duration::from_secs(5))
                .await
        });
        let channel = listener
            .accept(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("channel");
        let inbound = channel.receive_request(SHORT).await.unwrap().expect("request");
        let reply = Message::reply_to(&inbound.message, Bytes::from_static(b"ok"));
        inbound.responder.respond(reply).await.unwrap();
        assert_eq!(channel.receive_request(SHORT).await.unwrap().map(|r| r.message), None);
        let reply = exchange.await.unwrap().unwrap();
        assert_eq!(reply.body, Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn queue_poll_times_out_then_closes() {
        let queue = MemoryQueue::new();
        assert_eq!(queue.poll(SHORT).await.unwrap().map(|m| m.message), None);
        queue
            .push(Message::request("Work", Bytes::new()), alice())
            .unwrap();
        let polled = queue.poll(SHORT).await.unwrap().expect("message");
        assert_eq!(polled.identity, alice());
        queue.close();
        assert_eq!(queue.poll(SHORT).await.unwrap_err(), TransportError::Closed);
    }

    #[tokio::test]
    async fn full_queue_refuses_until_polled() {
        let queue = MemoryQueue::with_capacity(2);
        for _ in 0..2 {
            queue
                .push(Message::request("Work", Bytes::new()), alice())
                .unwrap();
        }
        assert_eq!(queue.depth(), 2);
        let err = queue
            .push(Message::request("Work", Bytes::new()), alice())
            .unwrap_err();
        assert!(err.is_transient());

        queue.poll(SHORT).await.unwrap().expect("message");
        assert_eq!(queue.depth(), 1);
        queue
            .push(Message::request("Work", Bytes::new()), alice())
            .unwrap();
    }
}
