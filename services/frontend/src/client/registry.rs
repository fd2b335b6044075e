// Get-or-create client registry backed by a single map lock.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use super::{
    CallerIdentity, ClientHandle, ClientId, ClientPipeline, ClientRegistry, MemoryPipeline,
    PipelineMode,
};
use crate::error::PipelineError;

type PipelineFactory<P> = Box<dyn Fn(&ClientId) -> Arc<P> + Send + Sync>;

struct Entry<P> {
    owner: CallerIdentity,
    pipeline: Arc<P>,
}

/// Registry that keeps every pipeline it creates for its own lifetime.
///
/// A client created by an authenticated user may only be resolved by that same user;
/// anonymous identities are per-connection and never pin ownership.
pub struct LocalClientRegistry<P> {
    clients: Mutex<HashMap<ClientId, Entry<P>>>,
    factory: PipelineFactory<P>,
    backpressure: watch::Sender<bool>,
}

impl<P: ClientPipeline + 'static> LocalClientRegistry<P> {
    pub fn new(factory: impl Fn(&ClientId) -> Arc<P> + Send + Sync + 'static) -> Self {
        let (backpressure, _) = watch::channel(false);
        Self {
            clients: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
            backpressure,
        }
    }

    pub fn client(&self, client_id: &ClientId) -> Option<Arc<P>> {
        self.clients
            .lock()
            .get(client_id)
            .map(|entry| entry.pipeline.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes the overload signal front ends throttle on.
    pub fn set_throttled(&self, throttled: bool) {
        self.backpressure.send_replace(throttled);
    }
}

impl LocalClientRegistry<MemoryPipeline> {
    pub fn memory(mode: PipelineMode) -> Self {
        Self::new(move |id| Arc::new(MemoryPipeline::new(id.clone(), mode)))
    }
}

fn same_owner(owner: &CallerIdentity, user: &CallerIdentity) -> bool {
    !owner.is_authenticated()
        || !user.is_authenticated()
        || owner.name().eq_ignore_ascii_case(user.name())
}

#[async_trait]
impl<P: ClientPipeline + 'static> ClientRegistry for LocalClientRegistry<P> {
    async fn get_or_create(
        &self,
        client_id: &ClientId,
        user: &CallerIdentity,
    ) -> Result<ClientHandle, PipelineError> {
        let mut clients = self.clients.lock();
        if let Some(entry) = clients.get(client_id) {
            if !same_owner(&entry.owner, user) {
                return Err(PipelineError::AccessDenied(user.name().to_string()));
            }
            return Ok(entry.pipeline.clone());
        }
        let pipeline = (self.factory)(client_id);
        clients.insert(
            client_id.clone(),
            Entry {
                owner: user.clone(),
                pipeline: pipeline.clone(),
            },
        );
        drop(clients);
        metrics::counter!("broker_frontend_clients_created_total").increment(1);
        tracing::info!(client_id = %client_id, user = user.name(), "client created");
        Ok(pipeline)
    }

    fn backpressure(&self) -> Option<watch::Receiver<bool>> {
        Some(self.backpressure.subscribe())
    }
}
