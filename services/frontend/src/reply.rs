// Reply contexts handed to client pipelines, and fault construction for every transport.
use async_trait::async_trait;
use broker_wire::{
    AddressingMode, FaultCode, FaultDetail, Message, MessageId, SECURITY_HEADER, USER_DATA_HEADER,
};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

use crate::client::ClientId;
use crate::error::{BrokerFault, PipelineError, TransportError};

/// Send side of a duplex channel; replies travel back over the channel the request came in on.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), TransportError>;
}

/// Native reply handle of a request/reply transport. Exactly one reply per request.
#[async_trait]
pub trait Responder: Send {
    async fn respond(self: Box<Self>, message: Message) -> Result<(), TransportError>;

    fn abort(self: Box<Self>);
}

/// The parts of a request a reply or fault needs after the request itself moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEcho {
    pub addressing: AddressingMode,
    pub message_id: Option<MessageId>,
    pub action: Option<String>,
    pub user_data: Option<String>,
}

impl RequestEcho {
    pub fn from_message(request: &Message) -> Self {
        Self {
            addressing: request.addressing,
            message_id: request.message_id,
            action: request.action.clone(),
            user_data: request.headers.get(USER_DATA_HEADER).map(str::to_string),
        }
    }

    pub fn correlation(&self) -> Option<MessageId> {
        if self.addressing.supports_correlation() {
            self.message_id
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Noop,
    Session,
    Request,
}

enum ReplyTarget {
    Noop,
    Session(Arc<dyn ReplySink>),
    Request(Box<dyn Responder>),
}

/// Per-request reply handle. Consumed by exactly one `reply`, `fault` or `abort`.
pub struct ReplyContext {
    echo: RequestEcho,
    client_id: Option<ClientId>,
    target: ReplyTarget,
}

impl fmt::Debug for ReplyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyContext")
            .field("kind", &self.kind())
            .field("client_id", &self.client_id)
            .field("echo", &self.echo)
            .finish()
    }
}

impl ReplyContext {
    // Caller asked for no reply; everything sent here is dropped.
    pub fn noop(request: &Message, client_id: Option<ClientId>) -> Self {
        Self {
            echo: RequestEcho::from_message(request),
            client_id,
            target: ReplyTarget::Noop,
        }
    }

    pub fn session(
        request: &Message,
        client_id: Option<ClientId>,
        sink: Arc<dyn ReplySink>,
    ) -> Self {
        Self {
            echo: RequestEcho::from_message(request),
            client_id,
            target: ReplyTarget::Session(sink),
        }
    }

    pub fn request(
        request: &Message,
        client_id: Option<ClientId>,
        responder: Box<dyn Responder>,
    ) -> Self {
        Self {
            echo: RequestEcho::from_message(request),
            client_id,
            target: ReplyTarget::Request(responder),
        }
    }

    pub fn kind(&self) -> ReplyKind {
        match self.target {
            ReplyTarget::Noop => ReplyKind::Noop,
            ReplyTarget::Session(_) => ReplyKind::Session,
            ReplyTarget::Request(_) => ReplyKind::Request,
        }
    }

    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.as_ref()
    }

    pub fn echo(&self) -> &RequestEcho {
        &self.echo
    }

    /// Message id the reply will be correlated to, if the request's addressing allows it.
    pub fn correlation(&self) -> Option<MessageId> {
        self.echo.correlation()
    }

    pub async fn reply(self, mut message: Message) -> Result<(), TransportError> {
        if message.relates_to.is_none() {
            message.relates_to = self.echo.correlation();
        }
        message.addressing = self.echo.addressing;
        match self.target {
            ReplyTarget::Noop => Ok(()),
            ReplyTarget::Session(sink) => sink.send(message).await,
            ReplyTarget::Request(responder) => responder.respond(message).await,
        }
    }

    pub async fn fault(self, fault: &BrokerFault) -> Result<(), TransportError> {
        let message = build_fault_for(&self.echo, fault.detail());
        self.reply(message).await
    }

    pub fn abort(self) {
        if let ReplyTarget::Request(responder) = self.target {
            responder.abort();
        }
    }
}

/// Fault replies, header hygiene and error translation shared by all front-end variants.
#[derive(Debug, Clone, Default)]
pub struct ReplyPipeline {
    strip_security_header: bool,
}

impl ReplyPipeline {
    pub fn new(strip_security_header: bool) -> Self {
        Self {
            strip_security_header,
        }
    }

    pub fn build_fault(
        &self,
        request: &Message,
        code: FaultCode,
        reason: impl Into<String>,
    ) -> Message {
        let detail = FaultDetail {
            code,
            reason: reason.into(),
        };
        build_fault_for(&RequestEcho::from_message(request), detail)
    }

    pub fn fault_for(&self, request: &Message, fault: &BrokerFault) -> Message {
        build_fault_for(&RequestEcho::from_message(request), fault.detail())
    }

    /// Empty reply used to satisfy one-reply-per-request transports for fire-and-forget calls.
    pub fn acknowledgement(&self, request: &Message) -> Message {
        let mut ack = Message::reply_to(request, Bytes::new());
        copy_allowed_headers(&RequestEcho::from_message(request), &mut ack);
        ack
    }

    /// Removes the security header when this front end is configured to. Returns whether one was removed.
    pub fn strip_security_header(&self, message: &mut Message) -> bool {
        if !self.strip_security_header {
            return false;
        }
        message.headers.remove_all(SECURITY_HEADER) > 0
    }
}

pub(crate) fn build_fault_for(echo: &RequestEcho, detail: FaultDetail) -> Message {
    metrics::counter!("broker_frontend_faults_total", "code" => detail.code.as_str()).increment(1);
    let mut fault = Message {
        addressing: echo.addressing,
        message_id: Some(MessageId::new()),
        relates_to: echo.correlation(),
        action: None,
        headers: Default::default(),
        body: Bytes::new(),
        fault: Some(detail),
    };
    copy_allowed_headers(echo, &mut fault);
    fault
}

// Only the action and the caller's opaque user data travel back on replies.
fn copy_allowed_headers(echo: &RequestEcho, reply: &mut Message) {
    if let Some(action) = &echo.action {
        reply.action = Some(action.clone());
    }
    if let Some(user_data) = &echo.user_data {
        reply.headers.insert(USER_DATA_HEADER, user_data.clone());
    }
}

/// Maps the queue layer's error taxonomy onto the stable fault codes.
pub fn translate_pipeline_error(err: &PipelineError) -> BrokerFault {
    let code = match err {
        PipelineError::AccessDenied(_) => FaultCode::AccessDenied,
        PipelineError::ClientPurged(_) => FaultCode::ClientPurged,
        PipelineError::Timeout(_) => FaultCode::OperationTimeout,
        PipelineError::QueueFull(_) | PipelineError::Storage(_) | PipelineError::Closed => {
            FaultCode::BrokerQueueFailure
        }
    };
    BrokerFault::new(code, err.to_string())
}
