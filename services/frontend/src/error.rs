// Error vocabulary shared by the front-end loops, the reply pipeline and client pipelines.
use broker_wire::{FaultCode, FaultDetail};
use std::time::Duration;

/// A fault that is surfaced to callers with one of the stable fault codes.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {reason}")]
pub struct BrokerFault {
    pub code: FaultCode,
    pub reason: String,
}

impl BrokerFault {
    pub fn new(code: FaultCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn detail(&self) -> FaultDetail {
        FaultDetail {
            code: self.code,
            reason: self.reason.clone(),
        }
    }
}

/// Outcome of a transport primitive that did not yield a message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("communication failure: {0}")]
    Communication(String),
    #[error("channel faulted: {0}")]
    Faulted(String),
    #[error("channel closed")]
    Closed,
}

impl TransportError {
    // Transient conditions re-arm the loop that observed them.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Communication(_))
    }
}

/// Queue-layer errors reported by client pipelines.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("access denied for user {0}")]
    AccessDenied(String),
    #[error("client {0} was purged")]
    ClientPurged(String),
    #[error("client queue is full ({0} pending)")]
    QueueFull(usize),
    #[error("queue storage failure: {0}")]
    Storage(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("client pipeline is closed")]
    Closed,
}
