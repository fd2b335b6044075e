//! Client identity and the boundary to client pipelines.
//!
//! A client is a logical unit-of-work queue bound to a distributed job. The front end never
//! stores requests itself; it resolves a [`ClientId`] from request headers, asks the
//! [`ClientRegistry`] for the pipeline that owns that id and hands the request over.
//!
//! # Key invariants
//! - Client ids compare and hash case-insensitively.
//! - A registry returns the same pipeline instance for equal ids for its whole lifetime.
use async_trait::async_trait;
use broker_wire::{CLIENT_ID_HEADER, FaultCode, Headers, Message};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{BrokerFault, PipelineError};
use crate::reply::ReplyContext;

pub mod memory;
pub mod registry;

pub use memory::{MemoryPipeline, PendingRequest, PipelineMode};
pub use registry::LocalClientRegistry;

pub const DEFAULT_MAX_CLIENT_ID_LEN: usize = 256;
pub const DEFAULT_CLIENT_ID_PREFIX: &str = "default-";
pub const CLIENT_ID_PATTERN: &str = r"^[0-9A-Za-z_\-{} ]+$";

static CLIENT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(CLIENT_ID_PATTERN).expect("client id pattern compiles"));

#[derive(Debug, Clone)]
pub struct ClientId {
    value: String,
    key: String,
}

impl ClientId {
    fn new(value: String) -> Self {
        let key = value.to_lowercase();
        Self { value, key }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl PartialEq for ClientId {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ClientId {}

impl Hash for ClientId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Security identity of the caller as established by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    name: String,
    authenticated: bool,
}

impl CallerIdentity {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            authenticated: true,
        }
    }

    // Peer-address identities carry no proof of who the caller is.
    pub fn anonymous(peer: impl Into<String>) -> Self {
        Self {
            name: peer.into(),
            authenticated: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

/// Validation rules for client ids taken from request headers.
#[derive(Debug, Clone)]
pub struct ClientIdPolicy {
    max_len: usize,
    default_prefix: String,
}

impl Default for ClientIdPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CLIENT_ID_LEN, DEFAULT_CLIENT_ID_PREFIX)
    }
}

impl ClientIdPolicy {
    pub fn new(max_len: usize, default_prefix: impl Into<String>) -> Self {
        Self {
            max_len,
            default_prefix: default_prefix.into(),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn validate(&self, raw: &str) -> Result<ClientId, BrokerFault> {
        if raw.chars().count() > self.max_len {
            return Err(BrokerFault::new(
                FaultCode::InvalidClientId,
                format!("client id exceeds {} characters", self.max_len),
            ));
        }
        if !CLIENT_ID_RE.is_match(raw) {
            return Err(BrokerFault::new(
                FaultCode::InvalidClientId,
                format!("client id {raw:?} contains characters outside {CLIENT_ID_PATTERN}"),
            ));
        }
        Ok(ClientId::new(raw.to_string()))
    }

    /// Id used when the caller did not name a client: the default prefix plus the caller identity.
    pub fn synthesize(&self, identity: &CallerIdentity) -> Result<ClientId, BrokerFault> {
        let value = format!("{}{}", self.default_prefix, identity.name());
        if value.chars().count() > self.max_len {
            return Err(BrokerFault::new(
                FaultCode::InvalidClientId,
                format!("synthesized client id exceeds {} characters", self.max_len),
            ));
        }
        Ok(ClientId::new(value))
    }

    pub fn resolve(
        &self,
        headers: &Headers,
        identity: &CallerIdentity,
    ) -> Result<ClientId, BrokerFault> {
        match headers.get(CLIENT_ID_HEADER) {
            Some(raw) if !raw.is_empty() => self.validate(raw),
            _ => self.synthesize(identity),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Active,
    Disconnected,
    EndOfMessage,
    Purged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub client_id: String,
    pub state: ClientState,
    pub pending_requests: u64,
    pub received_requests: u64,
}

/// A request the pipeline refused; the reply context comes back so the caller can fault it.
#[derive(Debug)]
pub struct EnqueueError {
    pub error: PipelineError,
    pub reply: ReplyContext,
}

/// Per-client request queue owned outside the front end.
#[async_trait]
pub trait ClientPipeline: Send + Sync {
    fn client_id(&self) -> &ClientId;

    fn state(&self) -> ClientState;

    /// Accepts one request. Returning means the request is owned by the pipeline, so the
    /// caller may arm its next receive.
    async fn enqueue(&self, request: Message, reply: ReplyContext) -> Result<(), EnqueueError>;

    // Best-effort; called when the channel that carried this client's requests goes away.
    fn notify_disconnected(&self);

    async fn flush(
        &self,
        count: u64,
        batch_id: &str,
        timeout: Duration,
    ) -> Result<(), PipelineError>;

    async fn end_of_message(
        &self,
        count: u64,
        batch_id: &str,
        timeout: Duration,
    ) -> Result<(), PipelineError>;

    async fn status(&self) -> Result<ClientStatus, PipelineError>;

    async fn requests_count(&self) -> Result<u64, PipelineError>;

    async fn purge(&self) -> Result<(), PipelineError>;
}

pub type ClientHandle = Arc<dyn ClientPipeline>;

#[async_trait]
pub trait ClientRegistry: Send + Sync {
    async fn get_or_create(
        &self,
        client_id: &ClientId,
        user: &CallerIdentity,
    ) -> Result<ClientHandle, PipelineError>;

    /// Backpressure signal published by the queue layer; `true` while overloaded.
    fn backpressure(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_compare_case_insensitively() {
        let policy = ClientIdPolicy::default();
        let upper = policy.validate("AB-12").unwrap();
        let lower = policy.validate("ab-12").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.as_str(), "AB-12");
        let set: HashSet<ClientId> = [upper, lower].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn over_long_id_is_rejected() {
        let policy = ClientIdPolicy::default();
        let fault = policy.validate(&"a".repeat(300)).unwrap_err();
        assert_eq!(fault.code, FaultCode::InvalidClientId);
        assert!(policy.validate(&"a".repeat(256)).is_ok());
    }

    #[test]
    fn disallowed_characters_are_rejected_the_same_way_twice() {
        let policy = ClientIdPolicy::default();
        let first = policy.validate("bad/id").unwrap_err();
        let second = policy.validate("bad/id").unwrap_err();
        assert_eq!(first, second);
        assert_eq!(first.code, FaultCode::InvalidClientId);
        assert!(policy.validate("{job 7}_x").is_ok());
    }

    #[test]
    fn missing_or_empty_header_synthesizes_from_identity() {
        let policy = ClientIdPolicy::default();
        let identity = CallerIdentity::user("CONTOSO\\alice");
        let id = policy.resolve(&Headers::new(), &identity).unwrap();
        assert_eq!(id.as_str(), "default-CONTOSO\\alice");

        let mut headers = Headers::new();
        headers.insert(CLIENT_ID_HEADER, "");
        assert_eq!(policy.resolve(&headers, &identity).unwrap(), id);

        headers.insert(CLIENT_ID_HEADER, "job-1");
        assert_eq!(policy.resolve(&headers, &identity).unwrap().as_str(), "job-1");
    }

    #[test]
    fn synthesized_id_respects_max_len() {
        let policy = ClientIdPolicy::new(10, "default-");
        let fault = policy
            .synthesize(&CallerIdentity::user("a-very-long-user"))
            .unwrap_err();
        assert_eq!(fault.code, FaultCode::InvalidClientId);
    }
}
