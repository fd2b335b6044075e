//! Channel → client bindings for session transports.
//!
//! # Key invariants
//! - A live channel is bound to at most one client, and the binding never changes.
//! - All access goes through one lock; `close_all` swaps the map out under that lock and
//!   aborts the channels after releasing it.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::client::{ClientHandle, ClientId};
use crate::transport::{Abortable, ChannelId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("channel is bound to client {bound}")]
    Mismatch { bound: ClientId },
    #[error("channel is not registered")]
    UnknownChannel,
    #[error("affinity registry is closed")]
    Closed,
}

struct Entry {
    channel: Arc<dyn Abortable>,
    client: Option<ClientHandle>,
}

pub struct ChannelAffinityRegistry {
    channels: Mutex<Option<HashMap<ChannelId, Entry>>>,
}

impl Default for ChannelAffinityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelAffinityRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Tracks a live channel so shutdown can abort it. Returns `false` once closed.
    pub fn register(&self, id: ChannelId, channel: Arc<dyn Abortable>) -> bool {
        let mut channels = self.channels.lock();
        let Some(map) = channels.as_mut() else {
            return false;
        };
        map.insert(
            id,
            Entry {
                channel,
                client: None,
            },
        );
        true
    }

    /// Binds `client` to the channel, or returns the client it is already bound to.
    ///
    /// Binding the same client twice is a no-op; a different client is a mismatch.
    pub fn bind(&self, id: ChannelId, client: ClientHandle) -> Result<ClientHandle, BindError> {
        let mut channels = self.channels.lock();
        let map = channels.as_mut().ok_or(BindError::Closed)?;
        let entry = map.get_mut(&id).ok_or(BindError::UnknownChannel)?;
        match &entry.client {
            Some(bound) if bound.client_id() == client.client_id() => Ok(bound.clone()),
            Some(bound) => Err(BindError::Mismatch {
                bound: bound.client_id().clone(),
            }),
            None => {
                entry.client = Some(client.clone());
                Ok(client)
            }
        }
    }

    pub fn client(&self, id: ChannelId) -> Option<ClientHandle> {
        self.channels
            .lock()
            .as_ref()
            .and_then(|map| map.get(&id))
            .and_then(|entry| entry.client.clone())
    }

    /// Drops the channel's binding. Returns the client it was bound to.
    pub fn remove(&self, id: ChannelId) -> Option<ClientHandle> {
        self.channels
            .lock()
            .as_mut()
            .and_then(|map| map.remove(&id))
            .and_then(|entry| entry.client)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.channels.lock().is_none()
    }

    /// Aborts every live channel and refuses further registrations. Idempotent.
    pub fn close_all(&self) -> usize {
        let Some(map) = self.channels.lock().take() else {
            return 0;
        };
        let aborted = map.len();
        for entry in map.into_values() {
            entry.channel.abort();
        }
        aborted
    }
}
