//! Broker front-end library crate.
//!
//! # Purpose
//! Admits messages arriving over duplex, request/reply and polled transports, resolves each
//! one to a client pipeline and routes replies back to the caller. The binary wires the QUIC
//! transports; integration tests drive the in-memory ones.
pub mod admission;
pub mod affinity;
pub mod auth;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod frontend;
pub mod reply;
pub mod transport;

pub use admission::{Admission, AdmissionGate};
pub use affinity::ChannelAffinityRegistry;
pub use control::{ClientRef, ControlFacade};
pub use error::{BrokerFault, PipelineError, TransportError};
pub use frontend::{
    DuplexFrontEnd, FrontEnd, FrontEndContext, FrontEndCore, FrontEndSettings, FrontEnds,
    PollingFrontEnd, RequestReplyFrontEnd, TransportKind,
};
pub use reply::{ReplyContext, ReplyPipeline};
