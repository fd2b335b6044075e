// Broker front-end service main entry point.
mod observability;

use anyhow::{Context, Result};
use broker_transport::tls::self_signed_server_config;
use frontend::client::{LocalClientRegistry, PipelineMode};
use frontend::config::FrontEndConfig;
use frontend::transport::quic::{QuicDuplexListener, QuicIngressQueue, QuicReplyListener};
use frontend::{DuplexFrontEnd, FrontEndContext, FrontEnds, PollingFrontEnd, RequestReplyFrontEnd};
use observability::Readiness;
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("broker-frontend");
    let config = FrontEndConfig::from_env_or_yaml()?;

    let readiness = Readiness::default();
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        readiness.clone(),
        config.metrics_bind,
    ));

    let front_ends = open_front_ends(&config).await?;
    readiness.set(true);
    tracing::info!(front_ends = front_ends.len(), "broker front end started");

    shutdown.await;
    readiness.set(false);
    front_ends.close_all();
    metrics_task.abort();
    tracing::info!("broker front end stopped");
    Ok(())
}

// Pipelines are in-process echo clients until a broker back end is attached.
async fn open_front_ends(config: &FrontEndConfig) -> Result<FrontEnds> {
    let (server_config, _cert) =
        self_signed_server_config().context("build QUIC server config")?;
    let registry = Arc::new(LocalClientRegistry::memory(PipelineMode::Echo));
    let context = || {
        FrontEndContext::new(registry.clone())
            .with_access(config.access_checker())
            .with_settings(config.settings())
    };

    let mut front_ends = FrontEnds::new();
    let duplex =
        QuicDuplexListener::new(config.endpoint(config.duplex_bind, server_config.clone()));
    front_ends.push(
        DuplexFrontEnd::open(duplex, context())
            .await
            .context("open duplex front end")?,
    );
    let request =
        QuicReplyListener::new(config.endpoint(config.request_bind, server_config.clone()));
    front_ends.push(
        RequestReplyFrontEnd::open(request, context())
            .await
            .context("open request/reply front end")?,
    );
    let queue = QuicIngressQueue::new(config.endpoint(config.queue_bind, server_config))
        .with_queue_depth(config.ingress_queue_depth);
    front_ends.push(
        PollingFrontEnd::open(queue, context())
            .await
            .context("open polling front end")?,
    );
    for kind in front_ends.kinds() {
        tracing::info!(transport = kind.as_str(), "front end listening");
    }
    Ok(front_ends)
}
