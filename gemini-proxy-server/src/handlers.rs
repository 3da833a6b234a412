use crate::bridge::{self, ChatStream};
use crate::error::ProxyError;
use crate::gemini::GenerativeBackend;
use crate::mapper;
use crate::middleware::log_requests;
use crate::patch::PatchPolicy;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::header,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use gemini_proxy_shared::{ChatRequest, ModelList};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Largest accepted request body. IDE clients send whole files as context.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn GenerativeBackend>,
    patch_policy: Arc<PatchPolicy>,
}

impl AppState {
    pub fn new(backend: Arc<dyn GenerativeBackend>, patch_policy: PatchPolicy) -> Self {
        Self {
            backend,
            patch_policy: Arc::new(patch_policy),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/tags", get(tags))
        .route("/api/chat", post(chat))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(log_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "Ollama is running."
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn tags(State(state): State<AppState>) -> Result<Json<ModelList>, ProxyError> {
    let models = state.backend.list_models().await?;
    let list = mapper::to_model_list(models);
    info!("Returning {} models", list.models.len());
    Ok(Json(list))
}

async fn chat(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ProxyError> {
    let started = Instant::now();
    let request = parse_chat_request(body)?;
    let patch = state.patch_policy.classify(&request);
    let backend_request = mapper::to_backend_request(&request, &patch)?;

    info!(
        model = %request.model,
        messages = request.messages.len(),
        stream = request.wants_stream(),
        is_patch = patch.is_patch,
        "Chat request"
    );
    let chunks = state.backend.stream_generate(&backend_request).await?;

    if request.wants_stream() {
        // Headers are not sent until the backend has produced something.
        let chunks = bridge::await_first_chunk(chunks).await?;
        let cancel = CancellationToken::new();
        let records = bridge::stream_chat(chunks, patch, request.model, started, cancel);
        return Ok(ndjson_response(records));
    }

    let response = bridge::collect_chat(chunks, &request.model, started).await?;
    Ok(Json(response).into_response())
}

/// OpenAI-compatible alias. Streaming requests get the same ndjson as `/api/chat`.
async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ProxyError> {
    let body = body.map_err(rejected_body)?;
    let request = parse_chat_request(Ok(body.clone()))?;
    if request.wants_stream() {
        return chat(State(state), Ok(body)).await;
    }

    let patch = state.patch_policy.classify(&request);
    let backend_request = mapper::to_backend_request(&request, &patch)?;
    info!(
        model = %request.model,
        messages = request.messages.len(),
        "Chat completion request"
    );

    let response = state.backend.generate(&backend_request).await?;
    Ok(Json(mapper::to_completion(&response, &request.model)).into_response())
}

fn rejected_body(rejection: BytesRejection) -> ProxyError {
    ProxyError::InvalidRequest(rejection.body_text())
}

fn parse_chat_request(body: Result<Bytes, BytesRejection>) -> Result<ChatRequest, ProxyError> {
    let body = body.map_err(rejected_body)?;
    serde_json::from_slice(&body).map_err(|e| ProxyError::InvalidRequest(e.to_string()))
}

fn ndjson_response(records: ChatStream) -> Response {
    let lines = records.map(|record| bridge::ndjson_line(&record));
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}
