//! Front-end core shared by the duplex, request/reply and polling variants.
//!
//! A front end accepts channels (or polls a queue), resolves each request to a client
//! pipeline and forwards it there. [`FrontEndCore`] owns everything the variants share: the
//! admission gate, the channel affinity registry, the reply pipeline and the task set of the
//! accept/receive loops.
//!
//! # Key invariants
//! - Every loop is a plain `loop` inside one task; a receive that completes immediately just
//!   continues the loop, so stack depth does not grow with the number of completions.
//! - A loop checks the admission gate before arming each receive. When deferred, the loop task
//!   ends and the gate later starts a fresh task with the same state.
//! - `close` is idempotent and never waits on the transport.
use broker_wire::{FaultCode, Message};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::admission::{Admission, AdmissionGate};
use crate::affinity::ChannelAffinityRegistry;
use crate::auth::{AccessChecker, AllowAll};
use crate::client::{
    CallerIdentity, ClientHandle, ClientId, ClientIdPolicy, ClientRegistry, EnqueueError,
};
use crate::control::ControlFacade;
use crate::error::BrokerFault;
use crate::reply::{ReplyContext, ReplyPipeline, translate_pipeline_error};
use crate::transport::{Abortable, ChannelId};

pub mod duplex;
pub mod polling;
pub mod request_reply;

pub use duplex::DuplexFrontEnd;
pub use polling::PollingFrontEnd;
pub use request_reply::RequestReplyFrontEnd;

pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Boxed loop future; spelled out so a loop can name its own resumption.
pub type LoopFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Duplex,
    RequestReply,
    Polling,
}

impl TransportKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            TransportKind::Duplex => "duplex",
            TransportKind::RequestReply => "request_reply",
            TransportKind::Polling => "polling",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrontEndSettings {
    /// Concurrent accept (or poll) loops; `None` uses available parallelism + 2.
    pub accept_loops: Option<usize>,
    pub accept_timeout: Duration,
    pub receive_timeout: Duration,
    pub poll_timeout: Duration,
    pub strip_security_header: bool,
    pub client_id_policy: ClientIdPolicy,
}

impl Default for FrontEndSettings {
    fn default() -> Self {
        Self {
            accept_loops: None,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            strip_security_header: true,
            client_id_policy: ClientIdPolicy::default(),
        }
    }
}

/// Collaborators every front end is opened with.
#[derive(Clone)]
pub struct FrontEndContext {
    pub registry: Arc<dyn ClientRegistry>,
    pub access: Arc<dyn AccessChecker>,
    pub settings: FrontEndSettings,
}

impl FrontEndContext {
    pub fn new(registry: Arc<dyn ClientRegistry>) -> Self {
        Self {
            registry,
            access: Arc::new(AllowAll),
            settings: FrontEndSettings::default(),
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessChecker>) -> Self {
        self.access = access;
        self
    }

    pub fn with_settings(mut self, settings: FrontEndSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// The state a duplex receive loop carries between receives.
pub struct PendingReceive<C> {
    channel: Arc<C>,
    client: Option<ClientHandle>,
}

impl<C> PendingReceive<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self {
            channel,
            client: None,
        }
    }

    pub fn channel(&self) -> &Arc<C> {
        &self.channel
    }

    pub fn client(&self) -> Option<&ClientHandle> {
        self.client.as_ref()
    }

    /// Records the bound client. The first binding wins; later calls return it unchanged.
    pub fn bind_client(&mut self, client: ClientHandle) -> &ClientHandle {
        self.client.get_or_insert(client)
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

pub struct FrontEndCore {
    kind: TransportKind,
    settings: FrontEndSettings,
    registry: Arc<dyn ClientRegistry>,
    access: Arc<dyn AccessChecker>,
    gate: Arc<AdmissionGate>,
    affinity: ChannelAffinityRegistry,
    replies: ReplyPipeline,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    runtime: Handle,
    tasks: Mutex<JoinSet<()>>,
    backpressure: Mutex<Option<JoinHandle<()>>>,
    close_hooks: Mutex<Vec<CloseHook>>,
}

impl FrontEndCore {
    /// Must be called from within a tokio runtime; loops are spawned onto it.
    pub fn new(kind: TransportKind, context: FrontEndContext) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let replies = ReplyPipeline::new(context.settings.strip_security_header);
        Arc::new(Self {
            kind,
            settings: context.settings,
            registry: context.registry,
            access: context.access,
            gate: Arc::new(AdmissionGate::new(kind.as_str())),
            affinity: ChannelAffinityRegistry::new(),
            replies,
            closed: AtomicBool::new(false),
            shutdown,
            runtime: Handle::current(),
            tasks: Mutex::new(JoinSet::new()),
            backpressure: Mutex::new(None),
            close_hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn settings(&self) -> &FrontEndSettings {
        &self.settings
    }

    pub fn gate(&self) -> &Arc<AdmissionGate> {
        &self.gate
    }

    pub fn affinity(&self) -> &ChannelAffinityRegistry {
        &self.affinity
    }

    pub fn replies(&self) -> &ReplyPipeline {
        &self.replies
    }

    pub fn registry(&self) -> &Arc<dyn ClientRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &ClientIdPolicy {
        &self.settings.client_id_policy
    }

    pub fn accept_loop_count(&self) -> usize {
        self.settings
            .accept_loops
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
                    + 2
            })
            .max(1)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once `close` has been called.
    pub async fn wait_closed(&self) {
        let mut rx = self.shutdown.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Runs `hook` during `close`; used by variants to release their listener.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.close_hooks.lock();
        if !self.is_closed() {
            hooks.push(Box::new(hook));
            return;
        }
        drop(hooks);
        hook();
    }

    /// Follows the registry's overload signal, if it publishes one.
    pub fn start_backpressure(&self) {
        if let Some(signal) = self.registry.backpressure() {
            let _guard = self.runtime.enter();
            let task = self.gate.follow(signal);
            if let Some(previous) = self.backpressure.lock().replace(task) {
                previous.abort();
            }
        }
    }

    pub fn spawn_tracked(&self, task: impl Future<Output = ()> + Send + 'static) {
        if self.is_closed() {
            return;
        }
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(task, &self.runtime);
    }

    /// Returns the state when the loop may arm its receive now. Otherwise the state is parked
    /// in the gate and `resume` starts a new loop task with it once throttling stops.
    pub fn try_begin_receive_with_throttling<S>(
        self: &Arc<Self>,
        state: S,
        resume: fn(Arc<FrontEndCore>, S) -> LoopFuture,
    ) -> Admission<S>
    where
        S: Send + 'static,
    {
        if self.is_closed() {
            return Admission::Deferred;
        }
        let core = Arc::downgrade(self);
        self.gate.try_admit(state, move |state| {
            if let Some(core) = core.upgrade() {
                let task = resume(core.clone(), state);
                core.spawn_tracked(task);
            }
        })
    }

    /// Client id from the request headers, or one synthesized from the caller identity.
    pub fn resolve_client_id(
        &self,
        message: &Message,
        identity: &CallerIdentity,
    ) -> Result<ClientId, BrokerFault> {
        self.policy().resolve(&message.headers, identity)
    }

    pub fn check_access(&self, identity: &CallerIdentity) -> Result<(), BrokerFault> {
        if self.access.is_allowed(identity) {
            return Ok(());
        }
        Err(BrokerFault::new(
            FaultCode::AccessDenied,
            format!("user {} is not allowed to submit requests", identity.name()),
        ))
    }

    /// Authorizes the caller and gets (or creates) the pipeline for `client_id`.
    pub async fn resolve_client(
        &self,
        client_id: &ClientId,
        identity: &CallerIdentity,
    ) -> Result<ClientHandle, BrokerFault> {
        self.check_access(identity)?;
        self.registry
            .get_or_create(client_id, identity)
            .await
            .map_err(|err| translate_pipeline_error(&err))
    }

    pub fn strip_security_header(&self, message: &mut Message) -> bool {
        self.replies.strip_security_header(message)
    }

    /// Hands the request to the pipeline; a refused request is faulted through its context.
    pub async fn forward(&self, client: &ClientHandle, request: Message, reply: ReplyContext) {
        match client.enqueue(request, reply).await {
            Ok(()) => self.record("accepted"),
            Err(EnqueueError { error, reply }) => {
                self.record("failed");
                let fault = translate_pipeline_error(&error);
                tracing::warn!(
                    transport = self.kind.as_str(),
                    client_id = %client.client_id(),
                    error = %error,
                    "client pipeline refused request"
                );
                if let Err(err) = reply.fault(&fault).await {
                    tracing::debug!(error = %err, "fault reply not delivered");
                }
            }
        }
    }

    pub fn record(&self, outcome: &'static str) {
        metrics::counter!(
            "broker_frontend_requests_total",
            "transport" => self.kind.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Tracks a live channel so `close` can abort it. Returns `false` once closed.
    pub fn track_channel(&self, id: ChannelId, channel: Arc<dyn Abortable>) -> bool {
        if !self.affinity.register(id, channel) {
            return false;
        }
        metrics::gauge!("broker_frontend_channels", "transport" => self.kind.as_str())
            .increment(1.0);
        true
    }

    /// Forgets a channel that ended; returns the client it was bound to.
    pub fn untrack_channel(&self, id: ChannelId) -> Option<ClientHandle> {
        let client = self.affinity.remove(id);
        if !self.affinity.is_closed() {
            metrics::gauge!("broker_frontend_channels", "transport" => self.kind.as_str())
                .decrement(1.0);
        }
        client
    }

    pub fn control(self: &Arc<Self>) -> ControlFacade {
        ControlFacade::new(self.clone())
    }

    /// Stops every loop, aborts live channels, drops deferred receives and releases the
    /// listener. Safe to call any number of times from any task.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);
        if let Some(task) = self.backpressure.lock().take() {
            task.abort();
        }
        self.gate.close();
        let hooks = std::mem::take(&mut *self.close_hooks.lock());
        for hook in hooks {
            hook();
        }
        let aborted = self.affinity.close_all();
        metrics::gauge!("broker_frontend_channels", "transport" => self.kind.as_str())
            .set(0.0);
        self.tasks.lock().abort_all();
        tracing::info!(transport = self.kind.as_str(), aborted, "front end closed");
    }
}

impl Drop for FrontEndCore {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn open_failed(kind: TransportKind, err: anyhow::Error) -> BrokerFault {
    tracing::error!(transport = kind.as_str(), error = %err, "front end failed to open");
    BrokerFault::new(
        FaultCode::OpenFrontEndFailed,
        format!("{} front end failed to open: {err:#}", kind.as_str()),
    )
}

pub trait FrontEnd: Send + Sync {
    fn core(&self) -> &Arc<FrontEndCore>;

    fn kind(&self) -> TransportKind {
        self.core().kind()
    }

    fn control(&self) -> ControlFacade {
        self.core().control()
    }

    fn close(&self) {
        self.core().close();
    }
}

/// The running front ends of one process, closed together.
#[derive(Default)]
pub struct FrontEnds {
    members: Vec<Box<dyn FrontEnd>>,
}

impl FrontEnds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, front_end: impl FrontEnd + 'static) {
        self.members.push(Box::new(front_end));
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        self.members.iter().map(|member| member.kind()).collect()
    }

    pub fn get(&self, kind: TransportKind) -> Option<&dyn FrontEnd> {
        self.members
            .iter()
            .find(|member| member.kind() == kind)
            .map(|member| member.as_ref())
    }

    pub fn close_all(&self) {
        for member in &self.members {
            member.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{LocalClientRegistry, PipelineMode};
    use std::sync::atomic::AtomicUsize;

    fn core_with(settings: FrontEndSettings) -> Arc<FrontEndCore> {
        let registry = Arc::new(LocalClientRegistry::memory(PipelineMode::Buffer));
        FrontEndCore::new(
            TransportKind::Duplex,
            FrontEndContext::new(registry).with_settings(settings),
        )
    }

    fn bump(core: Arc<FrontEndCore>, counter: Arc<AtomicUsize>) -> LoopFuture {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(core);
        })
    }

    #[tokio::test]
    async fn accept_loop_count_defaults_to_parallelism_plus_two() {
        let core = core_with(FrontEndSettings::default());
        let parallelism = std::thread::available_parallelism().map_or(1, |n| n.get());
        assert_eq!(core.accept_loop_count(), parallelism + 2);

        let core = core_with(FrontEndSettings {
            accept_loops: Some(0),
            ..FrontEndSettings::default()
        });
        assert_eq!(core.accept_loop_count(), 1);
    }

    #[tokio::test]
    async fn deferred_loop_resumes_as_new_task() {
        let core = core_with(FrontEndSettings::default());
        let counter = Arc::new(AtomicUsize::new(0));
        core.gate().start_throttling();
        let admission = core.try_begin_receive_with_throttling(counter.clone(), bump);
        assert!(matches!(admission, Admission::Deferred));
        assert_eq!(core.gate().stop_throttling(), 1);
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_runs_hooks_once() {
        let core = core_with(FrontEndSettings::default());
        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = hooks.clone();
        core.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        core.close();
        core.close();
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert!(core.is_closed());
        assert!(core.affinity().is_closed());
        core.wait_closed().await;

        let counter = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            core.try_begin_receive_with_throttling(counter, bump),
            Admission::Deferred
        ));
    }

    #[tokio::test]
    async fn access_denied_is_a_typed_fault() {
        let registry = Arc::new(LocalClientRegistry::memory(PipelineMode::Buffer));
        let core = FrontEndCore::new(
            TransportKind::Polling,
            FrontEndContext::new(registry)
                .with_access(Arc::new(crate::auth::AllowList::new(["alice"]))),
        );
        let bob = CallerIdentity::user("bob");
        let id = core.policy().validate("job").unwrap();
        let fault = core.resolve_client(&id, &bob).await.err().expect("denied");
        assert_eq!(fault.code, FaultCode::AccessDenied);
        assert!(core
            .resolve_client(&id, &CallerIdentity::user("alice"))
            .await
            .is_ok());
    }
}
