use std::convert::Infallible;
use std::net::SocketAddr;

use async_stream::stream;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Extension, Request, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use uuid::Uuid;

use chatrelay_core::{ChatError, ChatResult};
use chatrelay_document::ExtractLimits;
use chatrelay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use chatrelay_wire::{
    ChatRequest, ChatResponse, ContentResponse, DocumentTaskRequest, DocumentTaskResponse,
    ErrorEnvelope, ImagePromptRequest, ImageResponse, SearchSummarizeRequest, UrlRequest,
};

use crate::AppState;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
struct RequestId(String);

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("chatrelay listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/providers", get(list_providers))
        .route("/tools", get(list_tools))
        .route("/config", get(effective_config))
        .route("/api/chat", post(chat))
        .route("/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/search-and-summarize", post(search_and_summarize))
        .route("/api/generate-image", post(generate_image))
        .route("/api/scrape", post(scrape))
        .route("/api/youtube-transcript", post(youtube_transcript))
        .route(
            "/api/process-document",
            post(process_document).layer(DefaultBodyLimit::max(document_body_limit())),
        )
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// A base64 upload at the extraction size limit, plus room for the rest of
/// the JSON body.
fn document_body_limit() -> usize {
    let max_file = usize::try_from(ExtractLimits::default().max_file_bytes).unwrap_or(usize::MAX);
    max_file.div_ceil(3).saturating_mul(4).saturating_add(1024 * 1024)
}

/// Reuses the caller's `x-request-id` or assigns a fresh one, and echoes it
/// on the response.
async fn request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

struct ApiError(ChatError);

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ChatError::invalid(format!(
            "invalid JSON body: {}",
            rejection.body_text()
        )))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ChatError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ChatError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        };
        if status.is_server_error() {
            tracing::warn!(code = self.0.code(), "request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorEnvelope {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health(State(state): State<AppState>) -> Json<Value> {
    let providers = state
        .chat
        .providers()
        .list()
        .await
        .into_iter()
        .map(|p| p.id)
        .collect::<Vec<_>>();
    let tools = state
        .chat
        .tools()
        .list()
        .await
        .into_iter()
        .map(|t| t.name)
        .collect::<Vec<_>>();
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.uptime_secs(),
        "providers": providers,
        "tools": tools,
    }))
}

async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.chat.providers().list().await)
}

async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.chat.tools().list().await)
}

async fn effective_config(State(state): State<AppState>) -> Json<Value> {
    Json(state.config.get_redacted_value().await)
}

async fn chat(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Json<ChatResponse>> {
    let Json(request) = payload?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let result = state.chat.chat(request, Some(&request_id), cancel).await;
    log_outcome(&request_id, "chat", result.as_ref().err());
    Ok(Json(ChatResponse { response: result? }))
}

/// Text is written as it is produced. Errors raised before the first chunk
/// get the JSON envelope; later ones end the body with an `[error]` line.
async fn chat_stream(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let mut chunks = state
        .chat
        .chat_stream(request, Some(&request_id), cancel)
        .await?;
    let first = match chunks.next().await {
        Some(Err(err)) => {
            log_outcome(&request_id, "chat_stream", Some(&err));
            return Err(err.into());
        }
        Some(Ok(text)) => Some(text),
        None => None,
    };

    let body = Body::from_stream(text_body(first, chunks, guard, request_id));
    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            ),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        ],
        body,
    )
        .into_response())
}

fn text_body(
    first: Option<String>,
    mut rest: BoxStream<'static, ChatResult<String>>,
    guard: DropGuard,
    request_id: String,
) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
    stream! {
        // dropping the body (client went away) cancels the run
        let _guard = guard;
        if let Some(text) = first {
            yield Ok(text);
        }
        while let Some(item) = rest.next().await {
            match item {
                Ok(text) => yield Ok(text),
                Err(ChatError::Cancelled) => return,
                Err(err) => {
                    log_outcome(&request_id, "chat_stream", Some(&err));
                    yield Ok(format!("\n[error] {err}\n"));
                    return;
                }
            }
        }
        log_outcome(&request_id, "chat_stream", None);
    }
}

async fn search_and_summarize(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    payload: Result<Json<SearchSummarizeRequest>, JsonRejection>,
) -> ApiResult<Json<ChatResponse>> {
    let Json(request) = payload?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let response = state
        .chat
        .search_and_summarize(request.query.as_deref(), Some(&request_id), cancel)
        .await?;
    Ok(Json(ChatResponse { response }))
}

async fn generate_image(
    State(state): State<AppState>,
    payload: Result<Json<ImagePromptRequest>, JsonRejection>,
) -> ApiResult<Json<ImageResponse>> {
    let Json(request) = payload?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let image_url = state
        .chat
        .generate_image(request.prompt.as_deref(), cancel)
        .await?;
    Ok(Json(ImageResponse { image_url }))
}

async fn scrape(
    State(state): State<AppState>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> ApiResult<Json<ContentResponse>> {
    let Json(request) = payload?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let content = state.chat.scrape(request.url.as_deref(), cancel).await?;
    Ok(Json(ContentResponse { content }))
}

async fn youtube_transcript(
    State(state): State<AppState>,
    payload: Result<Json<UrlRequest>, JsonRejection>,
) -> ApiResult<Json<ContentResponse>> {
    let Json(request) = payload?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let content = state
        .chat
        .youtube_transcript(request.url.as_deref(), cancel)
        .await?;
    Ok(Json(ContentResponse { content }))
}

async fn process_document(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    payload: Result<Json<DocumentTaskRequest>, JsonRejection>,
) -> ApiResult<Json<DocumentTaskResponse>> {
    let Json(request) = payload?;
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let result = state
        .chat
        .process_document(request, Some(&request_id), cancel)
        .await?;
    Ok(Json(DocumentTaskResponse { result }))
}

fn log_outcome(request_id: &str, route: &str, error: Option<&ChatError>) {
    let (level, status) = match error {
        None => (Level::INFO, "ok"),
        Some(_) => (Level::WARN, "error"),
    };
    let detail = match error {
        None => format!("route={route}"),
        Some(err) => format!("route={route} error={err}"),
    };
    emit_event(
        level,
        ProcessKind::Server,
        ObservabilityEvent {
            event: "request.finish",
            component: "server.http",
            request_id: Some(request_id),
            status: Some(status),
            error_code: error.map(ChatError::code),
            detail: Some(&detail),
            ..ObservabilityEvent::default()
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::to_bytes;
    use axum::http::Request as HttpRequest;
    use chatrelay_core::{ChatService, ConfigStore, RelayConfig};
    use chatrelay_providers::{
        ChunkStream, GenerateRequest, LocalEchoProvider, ModelResponse, Provider,
        ProviderRegistry, StreamChunk,
    };
    use chatrelay_tools::{ToolRegistry, ToolsConfig};
    use chatrelay_types::{ModelInfo, ProviderInfo};
    use tower::ServiceExt;

    /// Fails every call, or (when `partial` is set) streams some text and
    /// then drops the connection.
    struct FlakyProvider {
        partial: Option<&'static str>,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "flaky".to_string(),
                name: "Flaky".to_string(),
                models: vec![ModelInfo {
                    id: "flaky-1".to_string(),
                    provider_id: "flaky".to_string(),
                    display_name: "Flaky".to_string(),
                    context_window: 1024,
                }],
            }
        }

        async fn generate(
            &self,
            _request: GenerateRequest,
            _model_override: Option<&str>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ModelResponse> {
            anyhow::bail!("quota exceeded")
        }

        async fn stream(
            &self,
            _request: GenerateRequest,
            _model_override: Option<&str>,
            _cancel: CancellationToken,
        ) -> anyhow::Result<ChunkStream> {
            let Some(partial) = self.partial else {
                anyhow::bail!("quota exceeded")
            };
            let chunks: Vec<anyhow::Result<StreamChunk>> = vec![
                Ok(StreamChunk::TextDelta(partial.to_string())),
                Err(anyhow::anyhow!("connection reset")),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    async fn state_with(provider: Arc<dyn Provider>, config: ConfigStore) -> AppState {
        let tools = ToolRegistry::new(&ToolsConfig::from(&RelayConfig::default()));
        state_with_tools(provider, tools, config)
    }

    fn state_with_tools(
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        config: ConfigStore,
    ) -> AppState {
        let relay = RelayConfig::default();
        let providers = ProviderRegistry::from_providers(vec![provider], None);
        AppState::new(ChatService::new(&relay, providers, tools), config)
    }

    async fn test_state() -> AppState {
        state_with(Arc::new(LocalEchoProvider), empty_config()).await
    }

    fn empty_config() -> ConfigStore {
        ConfigStore::from_layers(None, json!({}), json!({}), json!({}))
    }

    fn post_json(uri: &str, body: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn json_body(resp: Response) -> Value {
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&body).expect("json")
    }

    #[tokio::test]
    async fn health_route_lists_providers_and_tools() {
        let app = app_router(test_state().await);
        let req = HttpRequest::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
        let payload = json_body(resp).await;
        assert_eq!(payload.get("healthy").and_then(|v| v.as_bool()), Some(true));
        assert_eq!(payload["providers"], json!(["local"]));
        let tools = payload["tools"].as_array().expect("tools");
        assert!(tools.iter().any(|t| t == "web_search"));
    }

    #[tokio::test]
    async fn chat_route_returns_response() {
        let app = app_router(test_state().await);
        let req = post_json(
            "/api/chat",
            r#"{"history":[{"role":"model","parts":[{"text":"Welcome"}]}],"message":"Hello"}"#,
        );
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await, json!({"response": "Echo: Hello"}));
    }

    #[tokio::test]
    async fn legacy_chat_path_and_request_id_echo() {
        let app = app_router(test_state().await);
        let mut req = post_json("/chat", r#"{"prompt":"hi there"}"#);
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-42"));
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("req-42")
        );
        assert_eq!(json_body(resp).await["response"], "Echo: hi there");
    }

    #[tokio::test]
    async fn chat_route_rejects_missing_message_and_bad_json() {
        let app = app_router(test_state().await);
        let resp = app
            .clone()
            .oneshot(post_json("/api/chat", r#"{"history":[]}"#))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await, json!({"error": "message is required"}));

        let resp = app
            .oneshot(post_json("/api/chat", "{not json"))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let payload = json_body(resp).await;
        assert!(payload["error"]
            .as_str()
            .unwrap_or_default()
            .starts_with("invalid JSON body"));
    }

    #[tokio::test]
    async fn upstream_failure_maps_to_bad_gateway() {
        let state = state_with(Arc::new(FlakyProvider { partial: None }), empty_config()).await;
        let app = app_router(state);
        let resp = app
            .clone()
            .oneshot(post_json("/api/chat", r#"{"message":"hello"}"#))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(resp).await, json!({"error": "quota exceeded"}));

        let resp = app
            .oneshot(post_json("/api/chat/stream", r#"{"message":"hello"}"#))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(resp).await, json!({"error": "quota exceeded"}));
    }

    #[tokio::test]
    async fn stream_route_writes_plain_text() {
        let app = app_router(test_state().await);
        let resp = app
            .oneshot(post_json("/api/chat/stream", r#"{"message":"Hello"}"#))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("text/plain; charset=utf-8")
        );
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        assert_eq!(String::from_utf8_lossy(&body), "Echo: Hello");
    }

    #[tokio::test]
    async fn stream_failure_after_first_chunk_appends_error_line() {
        // without tools the text streams as it arrives
        let state = state_with_tools(
            Arc::new(FlakyProvider {
                partial: Some("The answer is"),
            }),
            ToolRegistry::empty(),
            empty_config(),
        );
        let resp = app_router(state)
            .oneshot(post_json("/api/chat/stream", r#"{"message":"question"}"#))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        assert_eq!(
            String::from_utf8_lossy(&body),
            "The answer is\n[error] connection reset\n"
        );
    }

    #[tokio::test]
    async fn stream_failure_in_a_held_back_round_uses_json_envelope() {
        let state = state_with(
            Arc::new(FlakyProvider {
                partial: Some("The answer is"),
            }),
            empty_config(),
        )
        .await;
        let resp = app_router(state)
            .oneshot(post_json("/api/chat/stream", r#"{"message":"question"}"#))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert!(json_body(resp)
            .await["error"]
            .as_str()
            .unwrap_or_default()
            .contains("connection reset"));
    }

    #[tokio::test]
    async fn config_route_redacts_api_keys() {
        let config = ConfigStore::from_layers(
            None,
            json!({"providers": {"gemini": {"api_key": "AIzaSyA-very-secret-key"}}}),
            json!({}),
            json!({"default_provider": "gemini"}),
        );
        let app = app_router(state_with(Arc::new(LocalEchoProvider), config).await);
        let req = HttpRequest::builder()
            .method("GET")
            .uri("/config")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = json_body(resp).await;
        assert_eq!(payload["default_provider"], "gemini");
        assert!(!payload.to_string().contains("AIzaSyA-very-secret-key"));
    }

    #[tokio::test]
    async fn process_document_route_returns_result() {
        let app = app_router(test_state().await);
        let resp = app
            .oneshot(post_json(
                "/api/process-document",
                r#"{"task":"summarize","text":"Rust has no garbage collector."}"#,
            ))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let result = json_body(resp).await["result"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        assert!(result.starts_with("Echo: "));
        assert!(result.contains("Rust has no garbage collector."));
    }

    #[tokio::test]
    async fn document_route_accepts_bodies_over_the_default_limit() {
        let text = "word ".repeat(600 * 1024);
        let body = json!({"task": "keywords", "text": text}).to_string();
        assert!(body.len() > 2 * 1024 * 1024);

        let app = app_router(test_state().await);
        let resp = app
            .clone()
            .oneshot(post_json("/api/process-document", &body))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::OK);

        let chat_body = json!({"message": text}).to_string();
        let resp = app
            .oneshot(post_json("/api/chat", &chat_body))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn single_purpose_routes_validate_input() {
        let app = app_router(test_state().await);
        for (uri, body) in [
            ("/api/scrape", r#"{}"#),
            ("/api/youtube-transcript", r#"{"url":"https://example.com/video"}"#),
            ("/api/generate-image", r#"{"prompt":""}"#),
            ("/api/search-and-summarize", r#"{"query":"  "}"#),
            ("/api/process-document", r#"{"task":"quiz"}"#),
        ] {
            let resp = app
                .clone()
                .oneshot(post_json(uri, body))
                .await
                .expect("response");
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert!(json_body(resp).await["error"].is_string());
        }
    }

    #[tokio::test]
    async fn image_route_without_key_is_upstream_error() {
        let app = app_router(test_state().await);
        let resp = app
            .oneshot(post_json("/api/generate-image", r#"{"prompt":"a red fox"}"#))
            .await
            .expect("response");
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
