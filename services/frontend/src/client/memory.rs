// In-process client pipeline: echoes requests back or buffers them for a consumer.
use async_trait::async_trait;
use broker_wire::Message;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

use super::{ClientId, ClientPipeline, ClientState, ClientStatus, EnqueueError};
use crate::error::PipelineError;
use crate::reply::ReplyContext;

pub const DEFAULT_PIPELINE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Reply to every request with its own body.
    Echo,
    /// Hold requests until a consumer takes them.
    Buffer,
}

/// A request held by a buffering pipeline together with the means to answer it.
#[derive(Debug)]
pub struct PendingRequest {
    pub request: Message,
    pub reply: ReplyContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMark {
    pub batch_id: String,
    pub count: u64,
}

#[derive(Debug)]
struct PipelineInner {
    state: ClientState,
    pending: VecDeque<PendingRequest>,
    received: u64,
    disconnects: u64,
    flushed: Option<BatchMark>,
}

#[derive(Debug)]
pub struct MemoryPipeline {
    client_id: ClientId,
    mode: PipelineMode,
    capacity: usize,
    inner: Mutex<PipelineInner>,
    notify: Notify,
}

impl MemoryPipeline {
    pub fn new(client_id: ClientId, mode: PipelineMode) -> Self {
        Self::with_capacity(client_id, mode, DEFAULT_PIPELINE_CAPACITY)
    }

    pub fn with_capacity(client_id: ClientId, mode: PipelineMode, capacity: usize) -> Self {
        Self {
            client_id,
            mode,
            capacity: capacity.max(1),
            inner: Mutex::new(PipelineInner {
                state: ClientState::Active,
                pending: VecDeque::new(),
                received: 0,
                disconnects: 0,
                flushed: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn mode(&self) -> PipelineMode {
        self.mode
    }

    /// Drains every buffered request in arrival order.
    pub fn take_pending(&self) -> Vec<PendingRequest> {
        self.inner.lock().pending.drain(..).collect()
    }

    /// Waits up to `timeout` for the next buffered request.
    pub async fn next_pending(&self, timeout: Duration) -> Option<PendingRequest> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Registered before the check so a push between the check and the wait is not missed.
            let notified = self.notify.notified();
            if let Some(pending) = self.inner.lock().pending.pop_front() {
                return Some(pending);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.lock().pending.pop_front();
            }
        }
    }

    pub fn received_total(&self) -> u64 {
        self.inner.lock().received
    }

    pub fn disconnect_count(&self) -> u64 {
        self.inner.lock().disconnects
    }

    pub fn last_flush(&self) -> Option<BatchMark> {
        self.inner.lock().flushed.clone()
    }

    fn ensure_not_purged(&self, inner: &PipelineInner) -> Result<(), PipelineError> {
        if inner.state == ClientState::Purged {
            return Err(PipelineError::ClientPurged(self.client_id.to_string()));
        }
        Ok(())
    }

    fn mark_batch(
        &self,
        count: u64,
        batch_id: &str,
        timeout: Duration,
        end: bool,
    ) -> Result<(), PipelineError> {
        if timeout.is_zero() {
            return Err(PipelineError::Timeout(timeout));
        }
        let mut inner = self.inner.lock();
        self.ensure_not_purged(&inner)?;
        inner.flushed = Some(BatchMark {
            batch_id: batch_id.to_string(),
            count,
        });
        if end {
            inner.state = ClientState::EndOfMessage;
        }
        Ok(())
    }
}

#[async_trait]
impl ClientPipeline for MemoryPipeline {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    fn state(&self) -> ClientState {
        self.inner.lock().state
    }

    async fn enqueue(&self, request: Message, reply: ReplyContext) -> Result<(), EnqueueError> {
        {
            let mut inner = self.inner.lock();
            if let Err(error) = self.ensure_not_purged(&inner) {
                return Err(EnqueueError { error, reply });
            }
            if self.mode == PipelineMode::Buffer && inner.pending.len() >= self.capacity {
                return Err(EnqueueError {
                    error: PipelineError::QueueFull(inner.pending.len()),
                    reply,
                });
            }
            // A new request revives a client whose previous channel went away.
            if inner.state == ClientState::Disconnected {
                inner.state = ClientState::Active;
            }
            inner.received += 1;
            if self.mode == PipelineMode::Buffer {
                inner.pending.push_back(PendingRequest { request, reply });
                drop(inner);
                self.notify.notify_waiters();
                return Ok(());
            }
        }

        let response = Message::reply_to(&request, request.body.clone());
        if let Err(err) = reply.reply(response).await {
            tracing::debug!(client_id = %self.client_id, error = %err, "echo reply not delivered");
        }
        Ok(())
    }

    fn notify_disconnected(&self) {
        let mut inner = self.inner.lock();
        inner.disconnects += 1;
        if inner.state == ClientState::Active {
            inner.state = ClientState::Disconnected;
        }
    }

    async fn flush(
        &self,
        count: u64,
        batch_id: &str,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        self.mark_batch(count, batch_id, timeout, false)
    }

    async fn end_of_message(
        &self,
        count: u64,
        batch_id: &str,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        self.mark_batch(count, batch_id, timeout, true)
    }

    async fn status(&self) -> Result<ClientStatus, PipelineError> {
        let inner = self.inner.lock();
        Ok(ClientStatus {
            client_id: self.client_id.to_string(),
            state: inner.state,
            pending_requests: inner.pending.len() as u64,
            received_requests: inner.received,
        })
    }

    async fn requests_count(&self) -> Result<u64, PipelineError> {
        let inner = self.inner.lock();
        self.ensure_not_purged(&inner)?;
        Ok(inner.pending.len() as u64)
    }

    async fn purge(&self) -> Result<(), PipelineError> {
        let dropped: Vec<PendingRequest> = {
            let mut inner = self.inner.lock();
            inner.state = ClientState::Purged;
            inner.pending.drain(..).collect()
        };
        for pending in dropped {
            pending.reply.abort();
        }
        Ok(())
    }
}
