use crate::config::Config;
use crate::core::{ProxyError, ProxyRequest, ResolveError, ResolveRequest, ResolvedFile, Resolver, StreamingProxy};
use anyhow::Context;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{
        header::{ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub proxy: Arc<StreamingProxy>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        Ok(Self {
            resolver: Arc::new(Resolver::from_config(&config)?),
            proxy: Arc::new(StreamingProxy::with_timeout(config.upstream_timeout())?),
            config: Arc::new(config),
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
    hint: Option<&'static str>,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
            hint: None,
        }
    }

    fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "Internal server error".to_string(),
            hint: None,
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Internal(detail) => {
                error!("Unexpected resolve error: {}", detail);
                ApiError::internal()
            }
            other => {
                warn!("Resolve error: {}", other);
                ApiError {
                    hint: other.hint(),
                    ..ApiError::bad_request(other.to_string())
                }
            }
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::InvalidRequest(detail) => ApiError::bad_request(detail),
            ProxyError::UpstreamStatus { status, detail } => ApiError {
                status: StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                detail,
                hint: None,
            },
            ProxyError::Unreachable(e) => {
                warn!("Upstream HTTP error: {}", e);
                ApiError {
                    status: StatusCode::BAD_GATEWAY,
                    detail: "Upstream HTTP error".to_string(),
                    hint: None,
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            detail: self.detail,
            hint: self.hint,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub url: String,
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub use_browser: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DownloadParams {
    pub url: String,
    pub filename: Option<String>,
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/resolve", post(resolve))
        .route("/download", get(download))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(config: Config) -> anyhow::Result<()> {
    let bind = config.bind.clone();
    let app = router(AppState::from_config(config)?);

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("Listening on http://{}", bind);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn resolve(
    State(state): State<AppState>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<ResolvedFile>, ApiError> {
    let config = &state.config;
    let req = ResolveRequest::new(
        &body.url,
        body.cookie,
        body.user_agent.or_else(|| Some(config.user_agent.clone())),
        body.timeout_seconds.unwrap_or(config.timeout_seconds),
        body.use_browser.unwrap_or(true),
    )?
    .with_default_cookie(config.stored_cookie().await);

    // Stays on the request's task: a client that hangs up cancels the work.
    let resolved = AssertUnwindSafe(state.resolver.resolve(&req))
        .catch_unwind()
        .await
        .map_err(|panic| ResolveError::Internal(panic_message(panic.as_ref())))??;
    Ok(Json(resolved))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "resolver panicked".to_string())
}

async fn download(
    State(state): State<AppState>,
    Query(params): Query<DownloadParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let cookie = match params.cookie {
        Some(cookie) => Some(cookie),
        None => state.config.stored_cookie().await,
    };
    let req = ProxyRequest::new(&params.url)
        .map_err(ApiError::bad_request)?
        .with_range(range)
        .with_cookie(cookie)
        .with_filename(params.filename)
        .with_user_agent(params.user_agent.or_else(|| Some(state.config.user_agent.clone())));

    let upstream = state.proxy.open(req).await?;
    let disposition = upstream.content_disposition();

    let mut response = Response::new(Body::from_stream(upstream.body));
    *response.status_mut() = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::OK);

    let out = response.headers_mut();
    out.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&upstream.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(length) = upstream.content_length {
        out.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }
    for (name, value) in [
        (ACCEPT_RANGES, upstream.accept_ranges),
        (CONTENT_RANGE, upstream.content_range),
        (CONTENT_DISPOSITION, disposition),
    ] {
        if let Some(value) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
            out.insert(name, value);
        }
    }

    Ok(response)
}
