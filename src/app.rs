use crate::config::ConversationConfig;
use crate::error::{AppError, AppResult};
use crate::pool::EndpointPool;
use crate::request::RequestBuilder;
use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub conversation: Arc<ConversationConfig>,
    pub pool: EndpointPool,
    pub builder: RequestBuilder,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub static_dir: PathBuf,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("CHATRELAY_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path = std::env::var("CHATRELAY_METRICS_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "/metrics".to_string());
        let static_dir = std::env::var("CHATRELAY_STATIC_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "static".to_string());
        Self {
            listen,
            metrics_path,
            static_dir: PathBuf::from(static_dir),
        }
    }
}

pub fn load_state() -> AppResult<AppState> {
    let conversation = ConversationConfig::from_env()?;
    load_state_with(RuntimeConfig::from_env(), conversation)
}

pub fn load_state_with(
    runtime: RuntimeConfig,
    conversation: ConversationConfig,
) -> AppResult<AppState> {
    let pool = EndpointPool::from_configs(&conversation.endpoints, conversation.start_policy);
    load_state_with_pool(runtime, conversation, pool)
}

/// Like [`load_state_with`], with a caller-built pool (e.g. a pinned start index).
pub fn load_state_with_pool(
    runtime: RuntimeConfig,
    conversation: ConversationConfig,
    pool: EndpointPool,
) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("chatrelay/0.1")
        .connect_timeout(Duration::from_millis(conversation.request_timeout_ms))
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let metrics = init_metrics()?;
    let conversation = Arc::new(conversation);
    let builder = RequestBuilder::new(conversation.clone());

    tracing::info!(
        endpoints = pool.len(),
        start_policy = ?pool.policy(),
        use_data = conversation.search.is_some(),
        stream = conversation.stream,
        request_timeout_ms = conversation.request_timeout_ms,
        "conversation relay configured"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        conversation,
        pool,
        builder,
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
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
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
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route(
            "/conversation",
            get(crate::handlers::conversation).post(crate::handlers::conversation),
        )
        .route(&metrics_path, get(crate::handlers::metrics))
        .fallback(crate::frontend::frontend_fallback)
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
