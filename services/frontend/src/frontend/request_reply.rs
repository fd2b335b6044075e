// Request/reply front end: every request carries its own reply handle.
use broker_wire::{Message, USER_DATA_HEADER};
use std::sync::Arc;

use super::{FrontEnd, FrontEndContext, FrontEndCore, LoopFuture, TransportKind, open_failed};
use crate::admission::Admission;
use crate::client::{CallerIdentity, ClientHandle, ClientState};
use crate::error::{BrokerFault, TransportError};
use crate::reply::ReplyContext;
use crate::transport::{
    Abortable, ChannelShape, InboundRequest, ReplyChannel, ReplyListener, Responder,
};

pub struct RequestReplyFrontEnd<L: ReplyListener> {
    core: Arc<FrontEndCore>,
    listener: Arc<L>,
}

impl<L: ReplyListener> RequestReplyFrontEnd<L> {
    /// Session-shaped listeners get the usual accept loops; one-shot listeners get a single
    /// accept loop that is gated before every accept.
    pub async fn open(listener: L, context: FrontEndContext) -> Result<Self, BrokerFault> {
        let listener = Arc::new(listener);
        listener
            .open()
            .await
            .map_err(|err| open_failed(TransportKind::RequestReply, err))?;
        let core = FrontEndCore::new(TransportKind::RequestReply, context);
        let on_close = listener.clone();
        core.on_close(move || on_close.close());
        core.start_backpressure();
        match listener.shape() {
            ChannelShape::Session => {
                let loops = core.accept_loop_count();
                for _ in 0..loops {
                    core.spawn_tracked(accept_sessions(core.clone(), listener.clone()));
                }
                tracing::info!(accept_loops = loops, "request/reply front end opened");
            }
            ChannelShape::OneShot => {
                core.spawn_tracked(accept_one_shot(core.clone(), listener.clone()));
                tracing::info!("one-shot request/reply front end opened");
            }
        }
        Ok(Self { core, listener })
    }

    pub fn listener(&self) -> &Arc<L> {
        &self.listener
    }
}

impl<L: ReplyListener> FrontEnd for RequestReplyFrontEnd<L> {
    fn core(&self) -> &Arc<FrontEndCore> {
        &self.core
    }
}

impl<L: ReplyListener> Drop for RequestReplyFrontEnd<L> {
    fn drop(&mut self) {
        self.core.close();
    }
}

/// What a session loop carries between requests. The client is re-resolved when it goes
/// stale, because infrastructure may pool one channel across callers.
struct Session<C> {
    channel: Arc<C>,
    last_client: Option<ClientHandle>,
}

enum AcceptStep<C> {
    Channel(Arc<C>),
    Rearm,
    Stop,
}

async fn accept_next<L: ReplyListener>(
    core: &FrontEndCore,
    listener: &L,
) -> AcceptStep<L::Channel> {
    let accepted = tokio::select! {
        _ = core.wait_closed() => return AcceptStep::Stop,
        accepted = listener.accept(core.settings().accept_timeout) => accepted,
    };
    match accepted {
        Ok(Some(channel)) => AcceptStep::Channel(channel),
        Ok(None) => {
            tracing::info!("request/reply listener shut down");
            core.close();
            AcceptStep::Stop
        }
        Err(err) if err.is_transient() => {
            tracing::debug!(error = %err, "request/reply accept re-armed");
            AcceptStep::Rearm
        }
        Err(err) => {
            tracing::error!(error = %err, "request/reply listener failed");
            core.close();
            AcceptStep::Stop
        }
    }
}

async fn accept_sessions<L: ReplyListener>(core: Arc<FrontEndCore>, listener: Arc<L>) {
    loop {
        match accept_next(&core, listener.as_ref()).await {
            AcceptStep::Channel(channel) => {
                if !core.track_channel(channel.id(), channel.clone()) {
                    channel.abort();
                    return;
                }
                let session = Session {
                    channel,
                    last_client: None,
                };
                core.spawn_tracked(session_loop(core.clone(), session));
            }
            AcceptStep::Rearm => {}
            AcceptStep::Stop => return,
        }
    }
}

fn resume_session<C: ReplyChannel + 'static>(
    core: Arc<FrontEndCore>,
    session: Session<C>,
) -> LoopFuture {
    Box::pin(session_loop(core, session))
}

async fn session_loop<C: ReplyChannel + 'static>(core: Arc<FrontEndCore>, session: Session<C>) {
    let channel = session.channel.clone();
    let timeout = core.settings().receive_timeout;
    let mut next = Some(session);
    while let Some(session) = next.take() {
        let mut session = match core.try_begin_receive_with_throttling(session, resume_session::<C>)
        {
            Admission::Proceed(session) => session,
            Admission::Deferred => return,
        };
        let received = tokio::select! {
            _ = core.wait_closed() => return,
            received = channel.receive_request(timeout) => received,
        };
        match received {
            Ok(Some(request)) => {
                let identity = channel.identity().clone();
                handle_request(&core, &identity, &mut session.last_client, request).await;
                next = Some(session);
            }
            Ok(None) => {
                tracing::debug!(channel = %channel.id(), "request channel closed by peer");
                channel.close().await;
            }
            Err(TransportError::Timeout) => next = Some(session),
            Err(err) if err.is_transient() => {
                tracing::debug!(channel = %channel.id(), error = %err, "request receive re-armed");
                next = Some(session);
            }
            Err(err) => {
                tracing::debug!(channel = %channel.id(), error = %err, "request channel faulted");
                channel.abort();
            }
        }
    }
    core.untrack_channel(channel.id());
}

fn resume_one_shot<L: ReplyListener>(core: Arc<FrontEndCore>, listener: Arc<L>) -> LoopFuture {
    Box::pin(accept_one_shot(core, listener))
}

// A single outstanding accept; each channel is served to completion before the next accept.
async fn accept_one_shot<L: ReplyListener>(core: Arc<FrontEndCore>, listener: Arc<L>) {
    let timeout = core.settings().receive_timeout;
    let mut next = Some(listener);
    while let Some(listener) = next.take() {
        let listener =
            match core.try_begin_receive_with_throttling(listener, resume_one_shot::<L>) {
                Admission::Proceed(listener) => listener,
                Admission::Deferred => return,
            };
        let channel = match accept_next(&core, listener.as_ref()).await {
            AcceptStep::Channel(channel) => channel,
            AcceptStep::Rearm => {
                next = Some(listener);
                continue;
            }
            AcceptStep::Stop => return,
        };
        if !core.track_channel(channel.id(), channel.clone()) {
            channel.abort();
            return;
        }
        let received = tokio::select! {
            _ = core.wait_closed() => return,
            received = channel.receive_request(timeout) => received,
        };
        match received {
            Ok(Some(request)) => {
                let identity = channel.identity().clone();
                let mut client = None;
                handle_request(&core, &identity, &mut client, request).await;
                channel.close().await;
            }
            Ok(None) => channel.close().await,
            Err(err) => {
                tracing::debug!(channel = %channel.id(), error = %err, "one-shot exchange dropped");
                channel.abort();
            }
        }
        core.untrack_channel(channel.id());
        next = Some(listener);
    }
}

async fn handle_request(
    core: &FrontEndCore,
    identity: &CallerIdentity,
    last_client: &mut Option<ClientHandle>,
    request: InboundRequest,
) {
    let InboundRequest {
        mut message,
        responder,
    } = request;
    let client_id = match core.resolve_client_id(&message, identity) {
        Ok(client_id) => client_id,
        Err(fault) => return reject(core, &message, responder, fault).await,
    };

    let client = match last_client.as_ref() {
        Some(client)
            if client.client_id() == &client_id
                && client.state() != ClientState::Disconnected =>
        {
            client.clone()
        }
        _ => match core.resolve_client(&client_id, identity).await {
            Ok(client) => last_client.insert(client).clone(),
            Err(fault) => return reject(core, &message, responder, fault).await,
        },
    };

    core.strip_security_header(&mut message);
    let reply = if message.headers.contains(USER_DATA_HEADER) {
        let ack = core.replies().acknowledgement(&message);
        if let Err(err) = responder.respond(ack).await {
            tracing::debug!(client_id = %client_id, error = %err, "acknowledgement not delivered");
        }
        ReplyContext::noop(&message, Some(client_id))
    } else {
        ReplyContext::request(&message, Some(client_id), responder)
    };
    core.forward(&client, message, reply).await;
}

async fn reject(
    core: &FrontEndCore,
    request: &Message,
    responder: Box<dyn Responder>,
    fault: BrokerFault,
) {
    core.record("rejected");
    tracing::debug!(fault = %fault, "request rejected");
    let reply = core.replies().fault_for(request, &fault);
    if let Err(err) = responder.respond(reply).await {
        tracing::debug!(error = %err, "fault reply not delivered");
    }
}
