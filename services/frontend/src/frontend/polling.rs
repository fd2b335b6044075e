// Polling front end: fire-and-forget messages taken off a queue; nothing is ever replied.
use std::sync::Arc;

use super::{FrontEnd, FrontEndContext, FrontEndCore, LoopFuture, TransportKind, open_failed};
use crate::admission::Admission;
use crate::error::{BrokerFault, TransportError};
use crate::reply::ReplyContext;
use crate::transport::{MessageQueue, QueuedMessage};

pub struct PollingFrontEnd<Q: MessageQueue> {
    core: Arc<FrontEndCore>,
    queue: Arc<Q>,
}

impl<Q: MessageQueue> PollingFrontEnd<Q> {
    pub async fn open(queue: Q, context: FrontEndContext) -> Result<Self, BrokerFault> {
        let queue = Arc::new(queue);
        queue
            .open()
            .await
            .map_err(|err| open_failed(TransportKind::Polling, err))?;
        let core = FrontEndCore::new(TransportKind::Polling, context);
        let on_close = queue.clone();
        core.on_close(move || on_close.close());
        core.start_backpressure();
        let loops = core.accept_loop_count();
        for _ in 0..loops {
            core.spawn_tracked(poll_loop(core.clone(), queue.clone()));
        }
        tracing::info!(poll_loops = loops, "polling front end opened");
        Ok(Self { core, queue })
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }
}

impl<Q: MessageQueue> FrontEnd for PollingFrontEnd<Q> {
    fn core(&self) -> &Arc<FrontEndCore> {
        &self.core
    }
}

impl<Q: MessageQueue> Drop for PollingFrontEnd<Q> {
    fn drop(&mut self) {
        self.core.close();
    }
}

fn resume_poll<Q: MessageQueue>(core: Arc<FrontEndCore>, queue: Arc<Q>) -> LoopFuture {
    Box::pin(poll_loop(core, queue))
}

async fn poll_loop<Q: MessageQueue>(core: Arc<FrontEndCore>, queue: Arc<Q>) {
    let timeout = core.settings().poll_timeout;
    let mut next = Some(queue);
    while let Some(queue) = next.take() {
        let queue = match core.try_begin_receive_with_throttling(queue, resume_poll::<Q>) {
            Admission::Proceed(queue) => queue,
            Admission::Deferred => return,
        };
        let polled = tokio::select! {
            _ = core.wait_closed() => return,
            polled = queue.poll(timeout) => polled,
        };
        match polled {
            Ok(Some(queued)) => handle_polled(&core, queued).await,
            Ok(None) => {}
            Err(TransportError::Closed) => {
                tracing::info!("polled queue closed");
                core.close();
                return;
            }
            Err(err) => tracing::debug!(error = %err, "poll re-armed"),
        }
        next = Some(queue);
    }
}

// Nothing can be replied here, so every refusal is a drop with a log line.
async fn handle_polled(core: &FrontEndCore, queued: QueuedMessage) {
    let QueuedMessage {
        mut message,
        identity,
    } = queued;
    let client_id = match core.resolve_client_id(&message, &identity) {
        Ok(client_id) => client_id,
        Err(fault) => {
            core.record("dropped");
            tracing::debug!(identity = identity.name(), fault = %fault, "polled request dropped");
            return;
        }
    };
    let client = match core.resolve_client(&client_id, &identity).await {
        Ok(client) => client,
        Err(fault) => {
            core.record("dropped");
            tracing::warn!(
                identity = identity.name(),
                client_id = %client_id,
                fault = %fault,
                "polled request dropped"
            );
            return;
        }
    };
    core.strip_security_header(&mut message);
    let reply = ReplyContext::noop(&message, Some(client_id));
    core.forward(&client, message, reply).await;
}
