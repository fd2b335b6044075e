//! Shared fixtures for front-end integration tests.
#![allow(dead_code)]

use broker_wire::{CLIENT_ID_HEADER, Message};
use frontend::client::{ClientId, ClientIdPolicy, LocalClientRegistry, MemoryPipeline, PipelineMode};
use frontend::{FrontEndContext, FrontEndSettings};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const SHORT: Duration = Duration::from_millis(100);
pub const PATIENCE: Duration = Duration::from_secs(5);

pub fn settings() -> FrontEndSettings {
    FrontEndSettings {
        accept_loops: Some(2),
        accept_timeout: Duration::from_millis(50),
        receive_timeout: Duration::from_millis(100),
        poll_timeout: Duration::from_millis(50),
        ..FrontEndSettings::default()
    }
}

pub fn registry(mode: PipelineMode) -> Arc<LocalClientRegistry<MemoryPipeline>> {
    Arc::new(LocalClientRegistry::memory(mode))
}

pub fn context(registry: &Arc<LocalClientRegistry<MemoryPipeline>>) -> FrontEndContext {
    FrontEndContext::new(registry.clone()).with_settings(settings())
}

pub fn client_id(raw: &str) -> ClientId {
    ClientIdPolicy::default()
        .validate(raw)
        .expect("valid client id")
}

pub fn request_for(client: &str, body: &'static str) -> Message {
    Message::request("submit", body.as_bytes()).with_header(CLIENT_ID_HEADER, client)
}

/// Waits for the pipeline of `raw` to be created by the front end.
pub async fn pipeline(
    registry: &LocalClientRegistry<MemoryPipeline>,
    raw: &str,
) -> Arc<MemoryPipeline> {
    let id = client_id(raw);
    let mut found = None;
    eventually(|| {
        found = registry.client(&id);
        found.is_some()
    })
    .await;
    found.expect("pipeline created")
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in {PATIENCE:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(PATIENCE, future)
        .await
        .expect("completed in time")
}
