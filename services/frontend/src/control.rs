//! Control operations on clients, resolved with the same rules as the data path.
//!
//! Every operation validates the client id (or synthesizes one from the caller), authorizes
//! the caller and honours the channel binding when the call arrives on a bound channel.
//! `flush` and `end_of_message` also wait for the admission gate to open, failing with
//! `ThrottlingTimeout` when it stays throttled past the caller's budget.
use broker_wire::FaultCode;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{CallerIdentity, ClientHandle, ClientStatus};
use crate::error::BrokerFault;
use crate::frontend::FrontEndCore;
use crate::reply::translate_pipeline_error;
use crate::transport::ChannelId;

/// Identifies the client a control call targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientRef<'a> {
    pub client_id: Option<&'a str>,
    /// The channel the call arrived on, when the transport has one.
    pub channel: Option<ChannelId>,
}

impl<'a> ClientRef<'a> {
    pub fn id(client_id: &'a str) -> Self {
        Self {
            client_id: Some(client_id),
            channel: None,
        }
    }

    pub fn on_channel(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }
}

#[derive(Clone)]
pub struct ControlFacade {
    core: Arc<FrontEndCore>,
}

impl ControlFacade {
    pub fn new(core: Arc<FrontEndCore>) -> Self {
        Self { core }
    }

    pub async fn resolve(
        &self,
        caller: &CallerIdentity,
        target: ClientRef<'_>,
    ) -> Result<ClientHandle, BrokerFault> {
        let policy = self.core.policy();
        let client_id = match target.client_id {
            Some(raw) if !raw.is_empty() => policy.validate(raw)?,
            _ => policy.synthesize(caller)?,
        };
        self.core.check_access(caller)?;
        let bound = target
            .channel
            .and_then(|id| self.core.affinity().client(id))
            .filter(|bound| bound.client_id() != &client_id);
        if let Some(bound) = bound {
            return Err(BrokerFault::new(
                FaultCode::ClientIdMismatch,
                format!(
                    "channel is bound to client {}, call names {client_id}",
                    bound.client_id()
                ),
            ));
        }
        self.core.resolve_client(&client_id, caller).await
    }

    async fn wait_for_gate(&self, throttle_timeout: Duration) -> Result<(), BrokerFault> {
        if self.core.gate().wait_not_throttled(throttle_timeout).await {
            return Ok(());
        }
        Err(BrokerFault::new(
            FaultCode::ThrottlingTimeout,
            format!("broker still throttled after {throttle_timeout:?}"),
        ))
    }

    pub async fn flush(
        &self,
        caller: &CallerIdentity,
        target: ClientRef<'_>,
        count: u64,
        batch_id: &str,
        throttle_timeout: Duration,
        flush_timeout: Duration,
    ) -> Result<(), BrokerFault> {
        let client = self.resolve(caller, target).await?;
        self.wait_for_gate(throttle_timeout).await?;
        client
            .flush(count, batch_id, flush_timeout)
            .await
            .map_err(|err| translate_pipeline_error(&err))
    }

    pub async fn end_of_message(
        &self,
        caller: &CallerIdentity,
        target: ClientRef<'_>,
        count: u64,
        batch_id: &str,
        throttle_timeout: Duration,
        eom_timeout: Duration,
    ) -> Result<(), BrokerFault> {
        let client = self.resolve(caller, target).await?;
        self.wait_for_gate(throttle_timeout).await?;
        client
            .end_of_message(count, batch_id, eom_timeout)
            .await
            .map_err(|err| translate_pipeline_error(&err))
    }

    pub async fn client_status(
        &self,
        caller: &CallerIdentity,
        target: ClientRef<'_>,
    ) -> Result<ClientStatus, BrokerFault> {
        let client = self.resolve(caller, target).await?;
        client
            .status()
            .await
            .map_err(|err| translate_pipeline_error(&err))
    }

    pub async fn requests_count(
        &self,
        caller: &CallerIdentity,
        target: ClientRef<'_>,
    ) -> Result<u64, BrokerFault> {
        let client = self.resolve(caller, target).await?;
        client
            .requests_count()
            .await
            .map_err(|err| translate_pipeline_error(&err))
    }

    pub async fn purge(
        &self,
        caller: &CallerIdentity,
        target: ClientRef<'_>,
    ) -> Result<(), BrokerFault> {
        let client = self.resolve(caller, target).await?;
        tracing::info!(client_id = %client.client_id(), caller = caller.name(), "purging client");
        client
            .purge()
            .await
            .map_err(|err| translate_pipeline_error(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientState, LocalClientRegistry, PipelineMode};
    use crate::frontend::{FrontEndContext, TransportKind};

    fn facade() -> (ControlFacade, Arc<FrontEndCore>) {
        let registry = Arc::new(LocalClientRegistry::memory(PipelineMode::Buffer));
        let core = FrontEndCore::new(TransportKind::Duplex, FrontEndContext::new(registry));
        (core.control(), core)
    }

    #[tokio::test]
    async fn malformed_id_faults_without_touching_affinity() {
        let (control, core) = facade();
        let alice = CallerIdentity::user("alice");
        for _ in 0..2 {
            let fault = control
                .client_status(&alice, ClientRef::id("bad/id"))
                .await
                .unwrap_err();
            assert_eq!(fault.code, FaultCode::InvalidClientId);
        }
        assert!(core.affinity().is_empty());
    }

    #[tokio::test]
    async fn flush_waits_for_gate_or_times_out() {
        let (control, core) = facade();
        let alice = CallerIdentity::user("alice");
        core.gate().start_throttling();
        let fault = control
            .flush(
                &alice,
                ClientRef::id("job"),
                1,
                "b1",
                Duration::from_millis(20),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert_eq!(fault.code, FaultCode::ThrottlingTimeout);

        core.gate().stop_throttling();
        control
            .end_of_message(
                &alice,
                ClientRef::id("JOB"),
                4,
                "b2",
                Duration::from_millis(20),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let status = control
            .client_status(&alice, ClientRef::id("job"))
            .await
            .unwrap();
        assert_eq!(status.state, ClientState::EndOfMessage);
    }

    #[tokio::test]
    async fn missing_id_is_synthesized_from_caller() {
        let (control, _core) = facade();
        let alice = CallerIdentity::user("alice");
        let client = control
            .resolve(&alice, ClientRef::default())
            .await
            .unwrap();
        assert_eq!(client.client_id().as_str(), "default-alice");
        assert_eq!(
            control
                .requests_count(&alice, ClientRef::default())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn purge_is_translated_for_later_calls() {
        let (control, _core) = facade();
        let alice = CallerIdentity::user("alice");
        control.purge(&alice, ClientRef::id("job")).await.unwrap();
        let fault = control
            .requests_count(&alice, ClientRef::id("job"))
            .await
            .unwrap_err();
        assert_eq!(fault.code, FaultCode::ClientPurged);
    }
}
