use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::logging::{operations, services, status};
use crate::module::{ModuleName, NetworkId, TokenId};
use crate::render::{PreviewRequest, RenderError, RenderKind, RenderService, Rendered};

/// HTTP server state
#[derive(Clone)]
struct AppState {
    service: Arc<RenderService>,
    /// SHA-256 of the configured admin token
    admin_token_digest: Option<[u8; 32]>,
}

/// HTTP front end for the render service
///
/// Public routes:
/// - GET  /health
/// - GET  /stats
/// - GET  /network/{networkId}/tokens/{tokenId}          - token metadata (JSON)
/// - GET  /network/{networkId}/tokens/{tokenId}/render   - composed document (HTML)
/// - GET  /network/{networkId}/tokens/{tokenId}/image    - snapshot (PNG)
/// - POST /network/{networkId}/tokens/{tokenId}/invalidate
/// - POST /network/{networkId}/tokens/{tokenId}/{render|image}/invalidate
/// - GET  /network/{networkId}/modules/{name}            - module + closure
/// - POST /network/{networkId}/preview                   - compose an unsaved module
///
/// Admin routes (bearer token, only mounted when a token is configured):
/// - PUT        /admin/template
/// - GET        /admin/featured
/// - POST|DELETE /admin/featured/{name}
/// - GET        /admin/network/{networkId}/whitelisted
/// - POST|DELETE /admin/network/{networkId}/whitelisted/{name}
pub struct HttpServer {
    bind: String,
    service: Arc<RenderService>,
    admin_token: Option<String>,
}

impl HttpServer {
    pub fn new(bind: impl Into<String>, service: Arc<RenderService>) -> Self {
        Self {
            bind: bind.into(),
            service,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, admin_token: Option<String>) -> Self {
        self.admin_token = admin_token;
        self
    }

    /// Create the Axum router with all endpoints
    pub fn router(self) -> Router {
        let state = AppState {
            service: self.service,
            admin_token_digest: self
                .admin_token
                .as_deref()
                .map(|token| Sha256::digest(token.as_bytes()).into()),
        };

        let public = Router::new()
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/network/{network_id}/tokens/{token_id}", get(get_metadata))
            .route("/network/{network_id}/tokens/{token_id}/render", get(get_render))
            .route("/network/{network_id}/tokens/{token_id}/image", get(get_image))
            .route(
                "/network/{network_id}/tokens/{token_id}/invalidate",
                post(invalidate_metadata),
            )
            .route(
                "/network/{network_id}/tokens/{token_id}/{kind}/invalidate",
                post(invalidate_kind),
            )
            .route("/network/{network_id}/modules/{name}", get(get_module))
            .route("/network/{network_id}/preview", post(preview_handler));

        let router = if state.admin_token_digest.is_some() {
            let admin = Router::new()
                .route("/template", put(put_template))
                .route("/featured", get(list_featured))
                .route("/featured/{name}", post(add_featured).delete(remove_featured))
                .route(
                    "/network/{network_id}/whitelisted",
                    get(list_whitelisted),
                )
                .route(
                    "/network/{network_id}/whitelisted/{name}",
                    post(add_whitelisted).delete(remove_whitelisted),
                )
                .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
            public.nest("/admin", admin)
        } else {
            public
        };

        router
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn run(self) -> Result<()> {
        let bind = self.bind.clone();
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind HTTP server to {}", bind))?;
        info!(service = services::HTTP, "HTTP server listening on {}", bind);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server failed")?;

        info!(service = services::HTTP, "HTTP server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

impl IntoResponse for RenderError {
    fn into_response(self) -> Response {
        let code = match &self {
            RenderError::NotFound { .. }
            | RenderError::ModuleNotFound(_)
            | RenderError::NetworkUnavailable(_) => StatusCode::NOT_FOUND,
            RenderError::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
            RenderError::Resolve(_) | RenderError::Composition(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            RenderError::Snapshot(_) | RenderError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if code.is_server_error() && code != StatusCode::SERVICE_UNAVAILABLE {
            warn!(service = services::HTTP, status = status::ERROR, "{}", self);
        }

        let body = match &self {
            RenderError::NotFound { .. } => "Token does not exist".to_string(),
            RenderError::NetworkUnavailable(_) => "Network is not available".to_string(),
            other => other.to_string(),
        };
        (code, body).into_response()
    }
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.service.stats().snapshot();
    let limiter = state.service.limiter();
    Json(serde_json::json!({
        "render": stats,
        "hitRate": stats.hit_rate(),
        "snapshotSlots": {
            "active": limiter.active(),
            "max": limiter.max(),
        },
        "networks": state.service.network_ids(),
    }))
}

async fn get_metadata(
    State(state): State<AppState>,
    Path((network_id, token_id)): Path<(NetworkId, TokenId)>,
    headers: HeaderMap,
) -> Result<Response, RenderError> {
    render_response(&state, network_id, token_id, RenderKind::Json, &headers).await
}

async fn get_render(
    State(state): State<AppState>,
    Path((network_id, token_id)): Path<(NetworkId, TokenId)>,
    headers: HeaderMap,
) -> Result<Response, RenderError> {
    render_response(&state, network_id, token_id, RenderKind::Html, &headers).await
}

async fn get_image(
    State(state): State<AppState>,
    Path((network_id, token_id)): Path<(NetworkId, TokenId)>,
    headers: HeaderMap,
) -> Result<Response, RenderError> {
    render_response(&state, network_id, token_id, RenderKind::Image, &headers).await
}

async fn render_response(
    state: &AppState,
    network_id: NetworkId,
    token_id: TokenId,
    kind: RenderKind,
    headers: &HeaderMap,
) -> Result<Response, RenderError> {
    let rendered = state.service.render(network_id, token_id, kind).await?;
    Ok(content_response(&rendered, headers))
}

fn content_response(rendered: &Rendered, request_headers: &HeaderMap) -> Response {
    let etag = rendered.etag();
    let not_modified = request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.split(',').any(|tag| tag.trim() == etag));

    let mut response = if not_modified {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        Response::new(Body::from(rendered.content.clone()))
    };

    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(rendered.content_type()),
    );
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&rendered.source.to_string()) {
        headers.insert("x-cache", value);
    }
    response
}

async fn invalidate_metadata(
    State(state): State<AppState>,
    Path((network_id, token_id)): Path<(NetworkId, TokenId)>,
) -> Result<&'static str, RenderError> {
    invalidate(&state, network_id, token_id, RenderKind::Json).await
}

async fn invalidate_kind(
    State(state): State<AppState>,
    Path((network_id, token_id, kind)): Path<(NetworkId, TokenId, String)>,
) -> Result<Response, RenderError> {
    // Route segments name kinds the way the GET routes do
    let kind = match kind.as_str() {
        "render" => RenderKind::Html,
        "image" => RenderKind::Image,
        _ => return Ok((StatusCode::NOT_FOUND, "Unknown render kind").into_response()),
    };
    Ok(invalidate(&state, network_id, token_id, kind).await?.into_response())
}

async fn invalidate(
    state: &AppState,
    network_id: NetworkId,
    token_id: TokenId,
    kind: RenderKind,
) -> Result<&'static str, RenderError> {
    let removed = state.service.invalidate(network_id, token_id, kind).await?;
    Ok(if removed { "Done" } else { "Not in cache" })
}

async fn get_module(
    State(state): State<AppState>,
    Path((network_id, name)): Path<(NetworkId, ModuleName)>,
) -> Result<Response, RenderError> {
    let inspection = state.service.inspect(network_id, &name)?;
    Ok(Json(inspection).into_response())
}

async fn preview_handler(
    State(state): State<AppState>,
    Path(network_id): Path<NetworkId>,
    Json(request): Json<PreviewRequest>,
) -> Result<Response, RenderError> {
    let html = state.service.preview(network_id, &request)?;
    Ok((
        [(header::CONTENT_TYPE, RenderKind::Html.content_type())],
        html,
    )
        .into_response())
}

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.admin_token_digest else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        None => (StatusCode::UNAUTHORIZED, "Missing bearer token").into_response(),
        Some(token) => {
            let digest: [u8; 32] = Sha256::digest(token.trim().as_bytes()).into();
            if digest == expected {
                next.run(request).await
            } else {
                warn!(service = services::ADMIN, status = status::REJECTED, "Rejected admin token");
                (StatusCode::FORBIDDEN, "Invalid admin token").into_response()
            }
        }
    }
}

async fn put_template(State(state): State<AppState>, body: String) -> Response {
    match state.service.templates().replace(&body) {
        Ok(_) => {
            info!(
                service = services::ADMIN,
                operation = operations::SET_TEMPLATE,
                status = status::SUCCESS,
                size_bytes = body.len(),
                "Template updated"
            );
            (StatusCode::OK, "Done").into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn list_featured(State(state): State<AppState>) -> Json<Vec<ModuleName>> {
    Json(state.service.flags().featured())
}

async fn add_featured(State(state): State<AppState>, Path(name): Path<ModuleName>) -> Response {
    flag_response(state.service.flags().add_featured(&name).map(|_| true), "featured", &name)
}

async fn remove_featured(State(state): State<AppState>, Path(name): Path<ModuleName>) -> Response {
    flag_response(state.service.flags().remove_featured(&name), "unfeatured", &name)
}

async fn list_whitelisted(
    State(state): State<AppState>,
    Path(network_id): Path<NetworkId>,
) -> Result<Json<Vec<ModuleName>>, RenderError> {
    state.service.network(network_id)?;
    Ok(Json(state.service.flags().whitelisted(network_id)))
}

async fn add_whitelisted(
    State(state): State<AppState>,
    Path((network_id, name)): Path<(NetworkId, ModuleName)>,
) -> Result<Response, RenderError> {
    state.service.network(network_id)?;
    let result = state
        .service
        .flags()
        .add_whitelisted(network_id, &name)
        .map(|_| true);
    Ok(flag_response(result, "whitelisted", &name))
}

async fn remove_whitelisted(
    State(state): State<AppState>,
    Path((network_id, name)): Path<(NetworkId, ModuleName)>,
) -> Result<Response, RenderError> {
    state.service.network(network_id)?;
    let result = state.service.flags().remove_whitelisted(network_id, &name);
    Ok(flag_response(result, "unwhitelisted", &name))
}

fn flag_response(result: Result<bool>, action: &str, name: &ModuleName) -> Response {
    match result {
        Ok(changed) => {
            info!(
                service = services::ADMIN,
                operation = operations::SET_FLAG,
                status = status::SUCCESS,
                module = %name,
                changed,
                "Module {}",
                action
            );
            (StatusCode::OK, if changed { "Done" } else { "Not flagged" }).into_response()
        }
        Err(e) => {
            warn!(service = services::ADMIN, module = %name, "Flag update failed: {:#}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response()
        }
    }
}
