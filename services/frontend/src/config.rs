use anyhow::{Context, Result};
use quinn::ServerConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AccessChecker, AllowAll, AllowList};
use crate::client::{ClientIdPolicy, DEFAULT_CLIENT_ID_PREFIX, DEFAULT_MAX_CLIENT_ID_LEN};
use crate::frontend::FrontEndSettings;
use crate::transport::memory::DEFAULT_QUEUE_DEPTH;
use crate::transport::quic::QuicEndpointConfig;

// Front-end service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct FrontEndConfig {
    // QUIC bind address of the duplex front end.
    pub duplex_bind: SocketAddr,
    // QUIC bind address of the request/reply front end.
    pub request_bind: SocketAddr,
    // QUIC bind address of the polled ingress queue.
    pub queue_bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    pub max_client_id_len: usize,
    // Prefix of ids synthesized for callers that send none.
    pub default_client_prefix: String,
    pub accept_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    // Max frame size accepted on QUIC streams.
    pub max_frame_bytes: usize,
    pub strip_security_header: bool,
    // Empty means every caller is allowed.
    pub allowed_users: Vec<String>,
    // Whether unauthenticated peers pass an allow list.
    pub allow_anonymous: bool,
    // Overrides the default of available parallelism + 2 accept loops.
    pub accept_loops: Option<usize>,
    // Ingress messages buffered ahead of the poll loops.
    pub ingress_queue_depth: usize,
}

const DEFAULT_ACCEPT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct FrontEndConfigOverride {
    duplex_bind: Option<String>,
    request_bind: Option<String>,
    queue_bind: Option<String>,
    metrics_bind: Option<String>,
    max_client_id_len: Option<usize>,
    default_client_prefix: Option<String>,
    accept_timeout_ms: Option<u64>,
    receive_timeout_ms: Option<u64>,
    poll_timeout_ms: Option<u64>,
    max_frame_bytes: Option<usize>,
    strip_security_header: Option<bool>,
    allowed_users: Option<Vec<String>>,
    allow_anonymous: Option<bool>,
    accept_loops: Option<usize>,
    ingress_queue_depth: Option<usize>,
}

fn env_addr(key: &str, default: &str) -> Result<SocketAddr> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("parse {key}"))
}

fn env_positive<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn parse_users(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string)
        .collect()
}

impl FrontEndConfig {
    pub fn from_env() -> Result<Self> {
        let duplex_bind = env_addr("BROKER_DUPLEX_BIND", "0.0.0.0:9090")?;
        let request_bind = env_addr("BROKER_REQUEST_BIND", "0.0.0.0:9091")?;
        let queue_bind = env_addr("BROKER_QUEUE_BIND", "0.0.0.0:9092")?;
        let metrics_bind = env_addr("BROKER_METRICS_BIND", "0.0.0.0:8081")?;
        let max_client_id_len =
            env_positive("BROKER_MAX_CLIENT_ID_LEN").unwrap_or(DEFAULT_MAX_CLIENT_ID_LEN);
        let default_client_prefix = std::env::var("BROKER_DEFAULT_CLIENT_PREFIX")
            .unwrap_or_else(|_| DEFAULT_CLIENT_ID_PREFIX.to_string());
        let accept_timeout_ms =
            env_positive("BROKER_ACCEPT_TIMEOUT_MS").unwrap_or(DEFAULT_ACCEPT_TIMEOUT_MS);
        let receive_timeout_ms =
            env_positive("BROKER_RECEIVE_TIMEOUT_MS").unwrap_or(DEFAULT_RECEIVE_TIMEOUT_MS);
        let poll_timeout_ms =
            env_positive("BROKER_POLL_TIMEOUT_MS").unwrap_or(DEFAULT_POLL_TIMEOUT_MS);
        let max_frame_bytes =
            env_positive("BROKER_MAX_FRAME_BYTES").unwrap_or(DEFAULT_MAX_FRAME_BYTES);
        let strip_security_header = env_flag("BROKER_STRIP_SECURITY_HEADER", true);
        let allow_anonymous = env_flag("BROKER_ALLOW_ANONYMOUS", true);
        let allowed_users = std::env::var("BROKER_ALLOWED_USERS")
            .map(|value| parse_users(&value))
            .unwrap_or_default();
        let accept_loops = env_positive("BROKER_ACCEPT_LOOPS");
        let ingress_queue_depth =
            env_positive("BROKER_INGRESS_QUEUE_DEPTH").unwrap_or(DEFAULT_QUEUE_DEPTH);
        Ok(Self {
            duplex_bind,
            request_bind,
            queue_bind,
            metrics_bind,
            max_client_id_len,
            default_client_prefix,
            accept_timeout_ms,
            receive_timeout_ms,
            poll_timeout_ms,
            max_frame_bytes,
            strip_security_header,
            allowed_users,
            allow_anonymous,
            accept_loops,
            ingress_queue_depth,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("BROKER_FRONTEND_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read BROKER_FRONTEND_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: FrontEndConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse front-end config yaml")?;
        if let Some(value) = override_cfg.duplex_bind {
            self.duplex_bind = value.parse().with_context(|| "parse duplex_bind")?;
        }
        if let Some(value) = override_cfg.request_bind {
            self.request_bind = value.parse().with_context(|| "parse request_bind")?;
        }
        if let Some(value) = override_cfg.queue_bind {
            self.queue_bind = value.parse().with_context(|| "parse queue_bind")?;
        }
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.max_client_id_len
            && value > 0
        {
            self.max_client_id_len = value;
        }
        if let Some(value) = override_cfg.default_client_prefix {
            self.default_client_prefix = value;
        }
        if let Some(value) = override_cfg.accept_timeout_ms
            && value > 0
        {
            self.accept_timeout_ms = value;
        }
        if let Some(value) = override_cfg.receive_timeout_ms
            && value > 0
        {
            self.receive_timeout_ms = value;
        }
        if let Some(value) = override_cfg.poll_timeout_ms
            && value > 0
        {
            self.poll_timeout_ms = value;
        }
        if let Some(value) = override_cfg.max_frame_bytes
            && value > 0
        {
            self.max_frame_bytes = value;
        }
        if let Some(value) = override_cfg.strip_security_header {
            self.strip_security_header = value;
        }
        if let Some(value) = override_cfg.allowed_users {
            self.allowed_users = value;
        }
        if let Some(value) = override_cfg.allow_anonymous {
            self.allow_anonymous = value;
        }
        if let Some(value) = override_cfg.ingress_queue_depth
            && value > 0
        {
            self.ingress_queue_depth = value;
        }
        if let Some(value) = override_cfg.accept_loops
            && value > 0
        {
            self.accept_loops = Some(value);
        }
        Ok(())
    }

    pub fn client_id_policy(&self) -> ClientIdPolicy {
        ClientIdPolicy::new(self.max_client_id_len, self.default_client_prefix.clone())
    }

    /// Allows everyone when no users are configured.
    pub fn access_checker(&self) -> Arc<dyn AccessChecker> {
        if self.allowed_users.is_empty() {
            return Arc::new(AllowAll);
        }
        Arc::new(AllowList::new(&self.allowed_users).allow_anonymous(self.allow_anonymous))
    }

    pub fn endpoint(&self, bind: SocketAddr, server_config: ServerConfig) -> QuicEndpointConfig {
        QuicEndpointConfig::new(bind, server_config).with_max_frame_bytes(self.max_frame_bytes)
    }

    pub fn settings(&self) -> FrontEndSettings {
        FrontEndSettings {
            accept_loops: self.accept_loops,
            accept_timeout: Duration::from_millis(self.accept_timeout_ms),
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            strip_security_header: self.strip_security_header,
            client_id_policy: self.client_id_policy(),
        }
    }
}
