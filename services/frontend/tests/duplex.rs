//! Duplex front-end integration tests over the in-memory transport.
//!
//! Covers session correlation, channel-to-client affinity, throttling and the way receive
//! and accept failures are classified.
mod common;

use broker_wire::{AddressingMode, FaultCode, SECURITY_HEADER, USER_DATA_HEADER};
use common::*;
use frontend::client::{
    CallerIdentity, ClientPipeline, ClientState, LocalClientRegistry, MemoryPipeline,
    PipelineMode,
};
use frontend::error::TransportError;
use frontend::transport::memory::MemoryDuplexListener;
use frontend::{DuplexFrontEnd, FrontEnd};
use std::sync::Arc;
use std::time::Duration;

fn alice() -> CallerIdentity {
    CallerIdentity::user("alice")
}

async fn open(
    registry: &Arc<LocalClientRegistry<MemoryPipeline>>,
) -> DuplexFrontEnd<MemoryDuplexListener> {
    match DuplexFrontEnd::open(MemoryDuplexListener::new(), context(registry)).await {
        Ok(front_end) => front_end,
        Err(fault) => panic!("open failed: {fault}"),
    }
}

#[tokio::test]
async fn session_replies_are_correlated_to_requests() {
    let registry = registry(PipelineMode::Echo);
    let front_end = open(&registry).await;
    let peer = front_end.listener().connect(alice()).unwrap();

    let request = request_for("AB-12", "hello");
    peer.send(request.clone()).unwrap();
    let reply = peer.recv(PATIENCE).await.expect("echo reply");
    assert_eq!(reply.relates_to, request.message_id);
    assert_eq!(reply.body.as_ref(), b"hello");
    assert!(!reply.is_fault());

    let unaddressed = request_for("AB-12", "again").with_addressing(AddressingMode::Unaddressed);
    peer.send(unaddressed).unwrap();
    let reply = peer.recv(PATIENCE).await.expect("echo reply");
    assert_eq!(reply.relates_to, None);
}

#[tokio::test]
async fn bound_channel_rejects_a_different_client() {
    let registry = registry(PipelineMode::Buffer);
    let front_end = open(&registry).await;
    let peer = front_end.listener().connect(alice()).unwrap();

    peer.send(request_for("AB-12", "first")).unwrap();
    let bound = pipeline(&registry, "ab-12").await;

    let foreign = request_for("CD-34", "second");
    peer.send(foreign.clone()).unwrap();
    let fault = peer.recv(PATIENCE).await.expect("fault reply");
    assert_eq!(fault.fault.map(|detail| detail.code), Some(FaultCode::ClientIdMismatch));
    assert_eq!(fault.relates_to, foreign.message_id);
    assert!(registry.client(&client_id("CD-34")).is_none());
    assert_eq!(bound.received_total(), 1);
}

#[tokio::test]
async fn invalid_client_id_is_faulted_even_with_user_data() {
    let registry = registry(PipelineMode::Echo);
    let front_end = open(&registry).await;
    let peer = front_end.listener().connect(alice()).unwrap();

    peer.send(request_for("bad/id", "x").with_header(USER_DATA_HEADER, "token-7"))
        .unwrap();
    let fault = peer.recv(PATIENCE).await.expect("fault reply");
    let detail = fault.fault.clone().expect("fault detail");
    assert_eq!(detail.code, FaultCode::InvalidClientId);
    assert_eq!(fault.headers.get(USER_DATA_HEADER), Some("token-7"));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn user_data_requests_get_no_session_reply() {
    let registry = registry(PipelineMode::Echo);
    let front_end = open(&registry).await;
    let peer = front_end.listener().connect(alice()).unwrap();

    peer.send(request_for("AB-12", "quiet").with_header(USER_DATA_HEADER, "u1"))
        .unwrap();
    let client = pipeline(&registry, "AB-12").await;
    eventually(|| client.received_total() == 1).await;
    assert!(peer.recv(SHORT).await.is_none());
}

#[tokio::test]
async fn security_header_is_stripped_before_forwarding() {
    let registry = registry(PipelineMode::Buffer);
    let front_end = open(&registry).await;
    let peer = front_end.listener().connect(alice()).unwrap();

    peer.send(request_for("AB-12", "signed").with_header(SECURITY_HEADER, "<wsse/>"))
        .unwrap();
    let client = pipeline(&registry, "AB-12").await;
    let pending = within(client.next_pending(PATIENCE)).await.expect("pending");
    assert!(!pending.request.headers.contains(SECURITY_HEADER));
}

#[tokio::test]
async fn throttled_receives_resume_in_arrival_order() {
    let registry = registry(PipelineMode::Buffer);
    let front_end = open(&registry).await;
    let peer = front_end.listener().connect(alice()).unwrap();

    peer.send(request_for("AB-12", "0")).unwrap();
    let client = pipeline(&registry, "AB-12").await;
    eventually(|| client.received_total() == 1).await;

    let gate = front_end.core().gate().clone();
    assert!(gate.start_throttling());
    for body in ["1", "2", "3"] {
        peer.send(request_for("AB-12", body)).unwrap();
    }
    // A receive armed before throttling may still complete once.
    eventually(|| gate.deferred_len() == 1).await;
    tokio::time::sleep(SHORT).await;
    assert!(client.received_total() <= 2);

    assert_eq!(gate.stop_throttling(), 1);
    eventually(|| client.received_total() == 4).await;
    let bodies: Vec<_> = client
        .take_pending()
        .into_iter()
        .map(|pending| pending.request.body)
        .collect();
    assert_eq!(bodies, ["0", "1", "2", "3"].map(|body| body.as_bytes()));
}

#[tokio::test]
async fn registry_backpressure_throttles_the_gate() {
    let registry = registry(PipelineMode::Buffer);
    let front_end = open(&registry).await;
    let gate = front_end.core().gate().clone();

    registry.set_throttled(true);
    eventually(|| gate.is_throttled()).await;
    registry.set_throttled(false);
    eventually(|| !gate.is_throttled()).await;
}

#[tokio::test]
async fn peer_hang_up_marks_client_disconnected() {
    let registry = registry(PipelineMode::Echo);
    let front_end = open(&registry).await;
    let peer = front_end.listener().connect(alice()).unwrap();

    peer.send(request_for("AB-12", "hi")).unwrap();
    peer.recv(PATIENCE).await.expect("reply");
    let client = pipeline(&registry, "AB-12").await;

    peer.hang_up();
    eventually(|| peer.is_closed()).await;
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(client.disconnect_count(), 1);
    eventually(|| front_end.core().affinity().is_empty()).await;
}

#[tokio::test]
async fn transient_receive_error_keeps_the_channel() {
    let registry = registry(PipelineMode::Echo);
    let front_end = open(&registry).await;
    let peer = front_end.listener().connect(alice()).unwrap();

    peer.send(request_for("AB-12", "one")).unwrap();
    peer.recv(PATIENCE).await.expect("reply");
    let client = pipeline(&registry, "AB-12").await;

    peer.inject_error(TransportError::Communication("reset".into()));
    eventually(|| client.disconnect_count() == 1).await;
    assert!(!peer.is_aborted());

    peer.send(request_for("AB-12", "two")).unwrap();
    let reply = peer.recv(PATIENCE).await.expect("reply after re-arm");
    assert_eq!(reply.body.as_ref(), b"two");
    assert_eq!(client.state(), ClientState::Active);
}

#[tokio::test]
async fn faulted_channel_is_aborted() {
    let registry = registry(PipelineMode::Echo);
    let front_end = open(&registry).await;
    let peer = front_end.listener().connect(alice()).unwrap();

    peer.send(request_for("AB-12", "one")).unwrap();
    peer.recv(PATIENCE).await.expect("reply");
    let client = pipeline(&registry, "AB-12").await;

    peer.inject_error(TransportError::Faulted("bad frame".into()));
    eventually(|| peer.is_aborted()).await;
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(!front_end.core().is_closed());
}

#[tokio::test]
async fn transient_accept_error_keeps_listening() {
    let registry = registry(PipelineMode::Echo);
    let listener = MemoryDuplexListener::new();
    listener.inject_accept_error(TransportError::Communication("accept reset".into()));
    let front_end = DuplexFrontEnd::open(listener, context(&registry))
        .await
        .map_err(|fault| fault.to_string())
        .unwrap();

    let peer = front_end.listener().connect(alice()).unwrap();
    peer.send(request_for("AB-12", "ok")).unwrap();
    assert!(peer.recv(PATIENCE).await.is_some());
    assert!(!front_end.core().is_closed());
}

#[tokio::test]
async fn fatal_accept_error_closes_the_front_end() {
    let registry = registry(PipelineMode::Echo);
    let listener = MemoryDuplexListener::new();
    listener.inject_accept_error(TransportError::Faulted("listener broken".into()));
    let front_end = DuplexFrontEnd::open(listener, context(&registry))
        .await
        .map_err(|fault| fault.to_string())
        .unwrap();

    eventually(|| front_end.core().is_closed()).await;
    assert!(front_end.listener().connect(alice()).is_err());
}

#[tokio::test]
async fn open_failure_is_reported_as_a_fault() {
    let registry = registry(PipelineMode::Echo);
    let result = DuplexFrontEnd::open(MemoryDuplexListener::failing_open(), context(&registry)).await;
    let Err(fault) = result else {
        panic!("open should fail");
    };
    assert_eq!(fault.code, FaultCode::OpenFrontEndFailed);
}

#[tokio::test]
async fn close_aborts_live_channels() {
    let registry = registry(PipelineMode::Echo);
    let front_end = open(&registry).await;
    let peer = front_end.listener().connect(alice()).unwrap();
    peer.send(request_for("AB-12", "hi")).unwrap();
    peer.recv(PATIENCE).await.expect("reply");

    front_end.close();
    front_end.close();
    assert!(peer.is_aborted());
    assert!(front_end.core().affinity().is_closed());
    assert!(front_end.listener().connect(alice()).is_err());
}

// Thousands of receives that complete without suspending must not grow the stack.
#[test]
fn synchronous_completions_do_not_grow_the_stack() {
    const MESSAGES: u64 = 100_000;
    let worker = std::thread::Builder::new()
        .stack_size(1024 * 1024)
        .spawn(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let registry = Arc::new(LocalClientRegistry::new(|id| {
                    Arc::new(MemoryPipeline::with_capacity(
                        id.clone(),
                        PipelineMode::Buffer,
                        MESSAGES as usize,
                    ))
                }));
                let listener = MemoryDuplexListener::new();
                let peer = listener.connect(alice()).unwrap();
                for _ in 0..MESSAGES {
                    peer.send(request_for("AB-12", "x")).unwrap();
                }
                let front_end = DuplexFrontEnd::open(listener, context(&registry))
                    .await
                    .map_err(|fault| fault.to_string())
                    .unwrap();
                let client = pipeline(&registry, "AB-12").await;
                let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
                while client.received_total() < MESSAGES {
                    assert!(tokio::time::Instant::now() < deadline);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                front_end.close();
            });
        })
        .unwrap();
    worker.join().expect("worker finished without overflowing");
}
