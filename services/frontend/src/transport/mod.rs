//! Transport abstraction the front-end variants are written against.
//!
//! Each variant talks to one trait family: [`DuplexListener`] for duplex sessions,
//! [`ReplyListener`] for request/reply exchanges and [`MessageQueue`] for polled ingress.
//! `Err(TransportError::Timeout)` and `Err(TransportError::Communication(_))` are transient and
//! re-arm the calling loop; the other errors end it.
use async_trait::async_trait;
use broker_wire::Message;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::client::CallerIdentity;
use crate::error::TransportError;

pub use crate::reply::{ReplySink, Responder};

pub mod memory;
pub mod quic;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
    pub fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Anything the front end can tear down without waiting on the peer.
pub trait Abortable: Send + Sync {
    fn abort(&self);
}

/// A long-lived channel carrying many requests and their replies.
#[async_trait]
pub trait DuplexChannel: ReplySink + Abortable {
    fn id(&self) -> ChannelId;

    fn identity(&self) -> &CallerIdentity;

    fn is_faulted(&self) -> bool;

    /// `Ok(None)` means the peer closed its side in an orderly way.
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait DuplexListener: Send + Sync + 'static {
    type Channel: DuplexChannel + 'static;

    async fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// `Ok(None)` means the listener shut down and no more channels will arrive.
    async fn accept(&self, timeout: Duration)
    -> Result<Option<Arc<Self::Channel>>, TransportError>;

    fn close(&self);
}

/// A request paired with the transport's native way of answering it.
pub struct InboundRequest {
    pub message: Message,
    pub responder: Box<dyn Responder>,
}

impl fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundRequest")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelShape {
    /// One channel carries many request/reply exchanges.
    Session,
    /// Every channel carries exactly one exchange.
    OneShot,
}

#[async_trait]
pub trait ReplyChannel: Abortable {
    fn id(&self) -> ChannelId;

    fn identity(&self) -> &CallerIdentity;

    /// `Ok(None)` means no more requests will arrive on this channel.
    async fn receive_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<InboundRequest>, TransportError>;

    async fn close(&self);
}

#[async_trait]
pub trait ReplyListener: Send + Sync + 'static {
    type Channel: ReplyChannel + 'static;

    fn shape(&self) -> ChannelShape;

    async fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn accept(&self, timeout: Duration)
    -> Result<Option<Arc<Self::Channel>>, TransportError>;

    fn close(&self);
}

/// One message taken off a polled queue and the identity that put it there.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: Message,
    pub identity: CallerIdentity,
}

#[async_trait]
pub trait MessageQueue: Send + Sync + 'static {
    async fn open(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// `Ok(None)` when nothing arrived within `timeout`; `Err(Closed)` once the queue is gone.
    async fn poll(&self, timeout: Duration) -> Result<Option<QueuedMessage>, TransportError>;

    fn close(&self);
}
