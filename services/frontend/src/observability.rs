//! Tracing and metrics wiring for the front-end service.
//!
//! Logs go to a `fmt` subscriber filtered by `RUST_LOG` (default `info`). Spans are also
//! exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set; exporter failures fall back
//! to local logging. Metrics use a Prometheus recorder served over HTTP together with the
//! liveness and readiness probes.

use axum::http::StatusCode;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace as sdktrace;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

// Optional resource attributes: (env var, attribute key).
const RESOURCE_ENV: &[(&str, &str)] = &[
    ("K8S_CLUSTER_NAME", "k8s.cluster.name"),
    ("K8S_NAMESPACE_NAME", "k8s.namespace.name"),
    ("K8S_POD_NAME", "k8s.pod.name"),
    ("CLOUD_REGION", "cloud.region"),
    ("DEPLOYMENT_ENVIRONMENT", "deployment.environment"),
];

/// Installs the tracing subscriber and the Prometheus recorder.
pub fn init_observability(service_name: &str) -> PrometheusHandle {
    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match otlp_enabled().then(|| build_tracer_provider(service_name)).flatten() {
        Some(provider) => {
            let tracer = provider.tracer(service_name.to_string());
            init_subscriber(registry.with(tracing_opentelemetry::layer().with_tracer(tracer)));
        }
        None => init_subscriber(registry),
    }

    install_metrics_recorder()
}

fn otlp_enabled() -> bool {
    std::env::var(OTLP_ENDPOINT_ENV)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
}

fn build_tracer_provider(service_name: &str) -> Option<sdktrace::TracerProvider> {
    let resource = Resource::new(resource_attributes(service_name));
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(sdktrace::Config::default().with_resource(resource))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .ok()
}

fn resource_attributes(service_name: &str) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("service.name", service_name.to_string())];
    if let Ok(value) =
        std::env::var("BROKER_SERVICE_INSTANCE_ID").or_else(|_| std::env::var("HOSTNAME"))
    {
        attrs.push(KeyValue::new("service.instance.id", value));
    }
    for (env, key) in RESOURCE_ENV {
        if let Ok(value) = std::env::var(env) {
            attrs.push(KeyValue::new(*key, value));
        }
    }
    attrs
}

/// Readiness flag flipped once every front end is open and cleared on shutdown.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Serves `/metrics`, `/live` and `/ready` on `addr`.
pub async fn serve_metrics(
    handle: PrometheusHandle,
    readiness: Readiness,
    addr: SocketAddr,
) -> std::io::Result<()> {
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route(
            "/ready",
            axum::routing::get(move || async move {
                if readiness.is_ready() {
                    (StatusCode::OK, "ok")
                } else {
                    (StatusCode::SERVICE_UNAVAILABLE, "starting")
                }
            }),
        );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await
}

fn install_metrics_recorder() -> PrometheusHandle {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return handle.clone();
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder");
        let _ = METRICS_HANDLE.set(handle.clone());
        handle
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::EnvGuard;
    use serial_test::serial;

    #[test]
    #[serial]
    fn resource_attributes_pick_up_deployment_env() {
        let _g1 = EnvGuard::set("BROKER_SERVICE_INSTANCE_ID", "fe-1");
        let _g2 = EnvGuard::set("K8S_POD_NAME", "frontend-0");
        let _g3 = EnvGuard::unset("CLOUD_REGION");

        let attrs = resource_attributes("broker-frontend");
        let keys: Vec<&str> = attrs.iter().map(|kv| kv.key.as_str()).collect();
        assert!(keys.contains(&"service.name"));
        assert!(keys.contains(&"service.instance.id"));
        assert!(keys.contains(&"k8s.pod.name"));
        assert!(!keys.contains(&"cloud.region"));
    }

    #[test]
    #[serial]
    fn otlp_needs_a_non_empty_endpoint() {
        let _g = EnvGuard::set(OTLP_ENDPOINT_ENV, "  ");
        assert!(!otlp_enabled());
        let _g = EnvGuard::set(OTLP_ENDPOINT_ENV, "http://collector:4317");
        assert!(otlp_enabled());
    }

    #[test]
    fn readiness_toggles() {
        let readiness = Readiness::default();
        assert!(!readiness.is_ready());
        readiness.clone().set(true);
        assert!(readiness.is_ready());
    }
}
