use crate::error::ContactError;
use crate::pipeline::{AdmissionPipeline, ContactRequest, RenderStatus, Rendered, RequestKind};
use crate::resource_cache::DEFAULT_KEY;
use crate::templates::TemplateCache;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path as UrlPath, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tower_http::trace::TraceLayer;

const STATIC_CACHE_CONTROL: &str = "public, max-age=3600";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AdmissionPipeline>,
    pub templates: Arc<TemplateCache>,
    pub static_dir: PathBuf,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/contact", get(contact).post(contact))
        .route("/contact/*path", get(static_file))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Tenant domain from the Host header: lowercased, port stripped. Hosts that
/// are not plain DNS names fall back to the default tenant.
pub fn request_domain(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim();

    let name = if let Some(rest) = host.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else {
        host.split(':').next().unwrap_or_default()
    };
    let name = name.to_lowercase();

    let plain = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ':');
    if plain {
        name
    } else {
        DEFAULT_KEY.to_string()
    }
}

async fn contact(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let domain = request_domain(&headers);
    let kind = if method == Method::POST {
        RequestKind::Submit(body)
    } else {
        RequestKind::Show
    };

    let rendered = state
        .pipeline
        .handle(ContactRequest {
            domain: domain.clone(),
            peer: peer.ip(),
            headers,
            kind,
        })
        .await;

    render(&state.templates, &domain, rendered).await
}

async fn render(templates: &TemplateCache, domain: &str, rendered: Rendered) -> Response {
    let status = match rendered.status {
        RenderStatus::Ok => StatusCode::OK,
        RenderStatus::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
        RenderStatus::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let template = match templates.resolve(domain).await {
        Ok(template) => template,
        Err(e) => {
            let err = ContactError::TemplateResolution(e);
            log::error!("{domain}: {err:?}");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    match template.render(&rendered.data) {
        Ok(html) => (status, Html(html)).into_response(),
        Err(e) => {
            log::error!("{domain}: failed to render {}: {e}", template.path());
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to render template").into_response()
        }
    }
}

/// Only plain relative paths; no `..`, roots or prefixes.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    let mut components = path.components().peekable();
    components.peek()?;
    if components.all(|c| matches!(c, Component::Normal(_))) {
        Some(path.to_path_buf())
    } else {
        None
    }
}

async fn static_file(
    State(state): State<AppState>,
    UrlPath(path): UrlPath<String>,
    request: Request,
) -> Response {
    let Some(relative) = safe_relative(path.trim_start_matches('/')) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let domain = request_domain(request.headers());

    let mut found = None;
    for tenant in [domain.as_str(), DEFAULT_KEY] {
        let candidate = state.static_dir.join(tenant).join(&relative);
        if tokio::fs::metadata(&candidate)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
        {
            found = Some(candidate);
            break;
        }
    }
    let Some(file) = found else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut response = ServeFile::new(file).oneshot(request).await.into_response();
    if response.status().is_success() {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(STATIC_CACHE_CONTROL),
        );
    }
    response
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    templates: usize,
    cached_configs: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        templates: state.templates.len().await,
        cached_configs: state.pipeline.configs().cached_domains().await.len(),
    })
}
