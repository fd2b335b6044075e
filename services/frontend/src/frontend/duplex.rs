// Duplex front end: long-lived channels, each bound to one client after its first request.
use broker_wire::{FaultCode, Message, USER_DATA_HEADER};
use std::sync::Arc;

use super::{
    FrontEnd, FrontEndContext, FrontEndCore, LoopFuture, PendingReceive, TransportKind,
    open_failed,
};
use crate::admission::Admission;
use crate::affinity::BindError;
use crate::client::ClientHandle;
use crate::error::{BrokerFault, TransportError};
use crate::reply::ReplyContext;
use crate::transport::{Abortable, DuplexChannel, DuplexListener};

pub struct DuplexFrontEnd<L: DuplexListener> {
    core: Arc<FrontEndCore>,
    listener: Arc<L>,
}

impl<L: DuplexListener> DuplexFrontEnd<L> {
    /// Opens the listener and starts the accept loops. Only start-up failures surface here.
    pub async fn open(listener: L, context: FrontEndContext) -> Result<Self, BrokerFault> {
        let listener = Arc::new(listener);
        listener
            .open()
            .await
            .map_err(|err| open_failed(TransportKind::Duplex, err))?;
        let core = FrontEndCore::new(TransportKind::Duplex, context);
        let on_close = listener.clone();
        core.on_close(move || on_close.close());
        core.start_backpressure();
        let loops = core.accept_loop_count();
        for _ in 0..loops {
            core.spawn_tracked(accept_loop(core.clone(), listener.clone()));
        }
        tracing::info!(accept_loops = loops, "duplex front end opened");
        Ok(Self { core, listener })
    }

    pub fn listener(&self) -> &Arc<L> {
        &self.listener
    }
}

impl<L: DuplexListener> FrontEnd for DuplexFrontEnd<L> {
    fn core(&self) -> &Arc<FrontEndCore> {
        &self.core
    }
}

// Dropping the handle stops the loops, which otherwise keep the core alive.
impl<L: DuplexListener> Drop for DuplexFrontEnd<L> {
    fn drop(&mut self) {
        self.core.close();
    }
}

async fn accept_loop<L: DuplexListener>(core: Arc<FrontEndCore>, listener: Arc<L>) {
    let timeout = core.settings().accept_timeout;
    loop {
        let accepted = tokio::select! {
            _ = core.wait_closed() => return,
            accepted = listener.accept(timeout) => accepted,
        };
        match accepted {
            Ok(Some(channel)) => {
                if !core.track_channel(channel.id(), channel.clone()) {
                    channel.abort();
                    return;
                }
                tracing::debug!(
                    channel = %channel.id(),
                    identity = channel.identity().name(),
                    "duplex channel accepted"
                );
                core.spawn_tracked(receive_loop(core.clone(), PendingReceive::new(channel)));
            }
            Ok(None) => {
                tracing::info!("duplex listener shut down");
                core.close();
                return;
            }
            Err(err) if err.is_transient() => {
                tracing::debug!(error = %err, "duplex accept re-armed");
            }
            Err(err) => {
                tracing::error!(error = %err, "duplex listener failed");
                core.close();
                return;
            }
        }
    }
}

fn resume_receive<C: DuplexChannel + 'static>(
    core: Arc<FrontEndCore>,
    pending: PendingReceive<C>,
) -> LoopFuture {
    Box::pin(receive_loop(core, pending))
}

async fn receive_loop<C: DuplexChannel + 'static>(
    core: Arc<FrontEndCore>,
    pending: PendingReceive<C>,
) {
    let channel = pending.channel().clone();
    let mut pending = Some(pending);
    let timeout = core.settings().receive_timeout;
    while let Some(state) = pending.take() {
        let mut state = match core.try_begin_receive_with_throttling(state, resume_receive::<C>) {
            Admission::Proceed(state) => state,
            // The gate owns the state now; the channel stays tracked.
            Admission::Deferred => return,
        };
        let received = tokio::select! {
            _ = core.wait_closed() => return,
            received = channel.receive(timeout) => received,
        };
        match received {
            Ok(Some(message)) => {
                dispatch(&core, &mut state, message).await;
                pending = Some(state);
            }
            Ok(None) => {
                tracing::debug!(channel = %channel.id(), "duplex channel closed by peer");
                notify_disconnected(state.client());
                channel.close().await;
            }
            Err(TransportError::Timeout) => pending = Some(state),
            Err(err) => {
                notify_disconnected(state.client());
                if channel.is_faulted() || !err.is_transient() {
                    tracing::debug!(channel = %channel.id(), error = %err, "duplex channel faulted");
                    channel.abort();
                } else {
                    tracing::debug!(channel = %channel.id(), error = %err, "duplex receive re-armed");
                    pending = Some(state);
                }
            }
        }
    }
    core.untrack_channel(channel.id());
}

fn notify_disconnected(client: Option<&ClientHandle>) {
    if let Some(client) = client {
        client.notify_disconnected();
    }
}

async fn dispatch<C: DuplexChannel + 'static>(
    core: &Arc<FrontEndCore>,
    pending: &mut PendingReceive<C>,
    mut message: Message,
) {
    let channel = pending.channel().clone();
    let identity = channel.identity().clone();
    let client_id = match core.resolve_client_id(&message, &identity) {
        Ok(client_id) => client_id,
        Err(fault) => return reject(core, channel.as_ref(), &message, fault).await,
    };

    let client = match pending.client() {
        Some(bound) if bound.client_id() != &client_id => {
            let fault = mismatch(bound.client_id().as_str(), client_id.as_str());
            return reject(core, channel.as_ref(), &message, fault).await;
        }
        Some(bound) => bound.clone(),
        None => {
            let client = match core.resolve_client(&client_id, &identity).await {
                Ok(client) => client,
                Err(fault) => return reject(core, channel.as_ref(), &message, fault).await,
            };
            match core.affinity().bind(channel.id(), client) {
                Ok(bound) => pending.bind_client(bound).clone(),
                Err(BindError::Mismatch { bound }) => {
                    let fault = mismatch(bound.as_str(), client_id.as_str());
                    return reject(core, channel.as_ref(), &message, fault).await;
                }
                // Shutdown raced with this request.
                Err(BindError::UnknownChannel | BindError::Closed) => return,
            }
        }
    };

    core.strip_security_header(&mut message);
    let reply = if message.headers.contains(USER_DATA_HEADER) {
        ReplyContext::noop(&message, Some(client_id))
    } else {
        ReplyContext::session(&message, Some(client_id), channel.clone())
    };
    core.forward(&client, message, reply).await;
}

fn mismatch(bound: &str, requested: &str) -> BrokerFault {
    BrokerFault::new(
        FaultCode::ClientIdMismatch,
        format!("channel is bound to client {bound}, request names {requested}"),
    )
}

async fn reject<C: DuplexChannel>(
    core: &FrontEndCore,
    channel: &C,
    request: &Message,
    fault: BrokerFault,
) {
    core.record("rejected");
    tracing::debug!(channel = %channel.id(), fault = %fault, "duplex request rejected");
    let reply = core.replies().fault_for(request, &fault);
    if let Err(err) = channel.send(reply).await {
        tracing::debug!(channel = %channel.id(), error = %err, "fault reply not delivered");
    }
}
