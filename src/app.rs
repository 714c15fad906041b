use crate::config::{ConfigStore, GatewayConfig, RelayPolicy};
use crate::error::{AppError, AppResult};
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub config: ConfigStore,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub config_path: Option<PathBuf>,
    pub admin_token: Option<String>,
    /// Gateway-wide fallback key, used when the config file sets none.
    pub default_key: Option<String>,
    /// Relay policy used when the config file has no `relay` section.
    pub relay: RelayPolicy,
    pub connect_timeout_ms: u64,
    /// Upper bound on waiting for upstream response headers and error bodies.
    pub upstream_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            config_path: None,
            admin_token: None,
            default_key: None,
            relay: RelayPolicy::default(),
            connect_timeout_ms: 10_000,
            upstream_timeout_ms: 30_000,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the runtime config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let number = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());
        let defaults = Self::default();

        let mut relay = RelayPolicy::default();
        if let Some(bytes) = number("CHATRELAY_BATCH_BYTES") {
            relay.max_batch_bytes = bytes as usize;
        }
        if let Some(ms) = number("CHATRELAY_BATCH_DELAY_MS") {
            relay.max_batch_delay_ms = ms;
        }
        if let Some(ms) = number("CHATRELAY_IDLE_TIMEOUT_MS") {
            relay.idle_timeout_ms = ms;
        }

        Self {
            listen: var("CHATRELAY_LISTEN").unwrap_or(defaults.listen),
            metrics_path: var("CHATRELAY_METRICS_PATH").unwrap_or(defaults.metrics_path),
            config_path: var("CHATRELAY_CONFIG").map(PathBuf::from),
            admin_token: var("CHATRELAY_ADMIN_TOKEN"),
            default_key: var("CHATRELAY_DEFAULT_API_KEY"),
            relay,
            connect_timeout_ms: number("CHATRELAY_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
            upstream_timeout_ms: number("CHATRELAY_UPSTREAM_TIMEOUT_MS")
                .unwrap_or(defaults.upstream_timeout_ms),
        }
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// Reads the gateway file named by `config_path`, or an empty catalog when unset.
    pub fn load_gateway_config(&self) -> AppResult<GatewayConfig> {
        let mut config = match &self.config_path {
            Some(path) => GatewayConfig::from_file(path).map_err(|err| {
                AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "config_load_failed",
                    err.to_string(),
                )
            })?,
            None => {
                tracing::warn!("CHATRELAY_CONFIG not set; starting with an empty model catalog");
                GatewayConfig::default()
            }
        };
        if config.default_key.is_none() {
            config.default_key = self.default_key.clone();
        }
        Ok(config)
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let config = runtime.load_gateway_config()?;
    load_state_with_config(runtime, config).await
}

pub async fn load_state_with_config(
    runtime: RuntimeConfig,
    config: GatewayConfig,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("chatrelay/0.1")
        .connect_timeout(Duration::from_millis(runtime.connect_timeout_ms))
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let metrics = init_metrics()?;

    tracing::info!(
        providers = config.providers.len(),
        models = config.models.len(),
        "gateway config loaded"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        config: ConfigStore::new(config),
        http,
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let chat_router = build_chat_router();
    Router::<AppState>::new()
        .nest("/v1", chat_router.clone())
        .nest("/api", chat_router)
        .route("/v1/models", get(crate::handlers::list_models))
        .route(&metrics_path, get(crate::handlers::metrics))
        .route("/admin/reload", post(crate::handlers::admin_reload))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_chat_router() -> Router<AppState> {
    Router::new()
        .route("/chat", post(crate::handlers::chat_ndjson))
        .route("/chat/{provider}", post(crate::handlers::chat_provider_sse))
        .route("/proxy", post(crate::handlers::proxy_passthrough))
}

#[cfg(test)]
mod tests {
    use super::RuntimeConfig;
    use std::collections::HashMap;

    #[test]
    fn runtime_config_reads_overrides_and_ignores_blanks() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CHATRELAY_LISTEN", "127.0.0.1:9999"),
            ("CHATRELAY_METRICS_PATH", "  "),
            ("CHATRELAY_IDLE_TIMEOUT_MS", "5000"),
            ("CHATRELAY_BATCH_BYTES", "not-a-number"),
            ("CHATRELAY_DEFAULT_API_KEY", "sk-default"),
        ]);
        let runtime = RuntimeConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(runtime.listen, "127.0.0.1:9999");
        assert_eq!(runtime.metrics_path, "/metrics");
        assert_eq!(runtime.relay.idle_timeout_ms, 5000);
        assert_eq!(runtime.relay.max_batch_bytes, 2048);
        assert_eq!(runtime.default_key.as_deref(), Some("sk-default"));
        assert!(runtime.admin_token.is_none());
        assert!(runtime.config_path.is_none());
    }
}
