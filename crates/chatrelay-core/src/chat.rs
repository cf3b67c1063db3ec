use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use chatrelay_document::{extract_bytes_text, DocumentKind, ExtractLimits};
use chatrelay_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use chatrelay_providers::ProviderRegistry;
use chatrelay_tools::{
    format_hits, require_http_url, youtube_video_id, ImageClient, PageFetcher, SearchClient,
    ToolRegistry, ToolsConfig, TranscriptFetcher,
};
use chatrelay_types::{Part, Role, Turn};
use chatrelay_wire::{decode_history_entry, ChatAction, ChatRequest, DocumentTaskRequest, InlineFile};

use crate::config::RelayConfig;
use crate::documents::DocumentTask;
use crate::error::{ChatError, ChatResult};
use crate::history::{normalize_history, truncate_history};
use crate::resolver::{ResolveRequest, ToolCallResolver};

/// Turns client requests into resolver runs and serves the single-purpose
/// endpoints (search summary, images, scraping, transcripts, documents).
#[derive(Clone)]
pub struct ChatService {
    resolver: ToolCallResolver,
    providers: ProviderRegistry,
    tools: ToolRegistry,
    search: SearchClient,
    images: ImageClient,
    pages: PageFetcher,
    transcripts: TranscriptFetcher,
    system_prompt: Option<String>,
    max_history_turns: usize,
    process: ProcessKind,
}

impl ChatService {
    pub fn new(config: &RelayConfig, providers: ProviderRegistry, tools: ToolRegistry) -> Self {
        let tools_config = ToolsConfig::from(config);
        let client = tools_config.http_client();
        Self {
            resolver: ToolCallResolver::new(providers.clone(), tools.clone())
                .with_max_round_trips(config.chat.max_tool_iterations()),
            providers,
            tools,
            search: SearchClient::new(client.clone(), &tools_config.search),
            images: ImageClient::new(client.clone(), &tools_config.image),
            pages: PageFetcher::new(client.clone()),
            transcripts: TranscriptFetcher::new(client),
            system_prompt: config.chat.system_prompt().map(str::to_string),
            max_history_turns: config.chat.max_history_turns(),
            process: ProcessKind::Server,
        }
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self.resolver = self.resolver.with_process(process);
        self
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Builds the resolver input for one chat request: normalized history,
    /// the new user turn (with context, search results or an image) and the
    /// configured system instruction.
    pub async fn prepare(
        &self,
        mut request: ChatRequest,
        request_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> ChatResult<ResolveRequest> {
        let action = ChatAction::parse(request.action.as_deref()).ok_or_else(|| {
            ChatError::invalid(format!(
                "unknown action `{}`",
                request.action.as_deref().unwrap_or_default().trim()
            ))
        })?;
        let message = take_message(&mut request)?;

        let image = match (request.attachment(), action) {
            (Some(file), _) => Some(inline_part(file)?),
            (None, ChatAction::ImageChat) => {
                return Err(ChatError::invalid("imageData is required for image_chat"))
            }
            (None, _) => None,
        };

        let conversation = truncate_history(
            normalize_history(&request.history),
            self.max_history_turns,
        );

        emit_event(
            Level::INFO,
            self.process,
            ObservabilityEvent {
                event: "request.start",
                component: "core.chat",
                request_id,
                status: Some("start"),
                detail: Some(&format!(
                    "action={:?} history_turns={} message={}",
                    action,
                    conversation.len(),
                    redact_text(&message)
                )),
                ..ObservabilityEvent::default()
            },
        );

        let mut prompt = match action {
            ChatAction::WebSearch => self.search_context(&message, cancel).await,
            ChatAction::Chat | ChatAction::ImageChat => message,
        };
        if let Some(context) = request
            .context
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            prompt = format!("Background information:\n{context}\n\n{prompt}");
        }

        let mut parts = vec![Part::text(prompt)];
        parts.extend(image);
        let mut conversation = conversation;
        conversation.push_user(Turn::new(Role::User, parts));

        Ok(ResolveRequest {
            conversation,
            system_instruction: self.system_prompt.clone(),
            declare_tools: action == ChatAction::Chat,
            request_id: request_id.map(str::to_string),
            ..ResolveRequest::default()
        })
    }

    pub async fn chat(
        &self,
        request: ChatRequest,
        request_id: Option<&str>,
        cancel: CancellationToken,
    ) -> ChatResult<String> {
        let prepared = self.prepare(request, request_id, &cancel).await?;
        Ok(self.resolver.resolve(prepared, cancel).await?.text)
    }

    /// Validation errors are returned before any text is produced; later
    /// failures arrive as the stream's error item.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
        request_id: Option<&str>,
        cancel: CancellationToken,
    ) -> ChatResult<BoxStream<'static, ChatResult<String>>> {
        let prepared = self.prepare(request, request_id, &cancel).await?;
        Ok(self.resolver.resolve_stream(prepared, cancel))
    }

    pub async fn search_and_summarize(
        &self,
        query: Option<&str>,
        request_id: Option<&str>,
        cancel: CancellationToken,
    ) -> ChatResult<String> {
        let query = required(query, "query is required")?;
        let hits = self
            .search
            .search(query, cancel.clone())
            .await
            .map_err(|err| upstream_or_cancelled(err, &cancel))?;
        if hits.is_empty() {
            return Ok(format!("No web results were found for \"{query}\"."));
        }
        let prompt = format!(
            "Using the information below, write a clear, well-organized answer to the question \
             \"{query}\" and list the sources you used.\n\nInformation:\n{}",
            format_hits(&hits)
        );
        self.complete(prompt, request_id, cancel).await
    }

    pub async fn generate_image(
        &self,
        prompt: Option<&str>,
        cancel: CancellationToken,
    ) -> ChatResult<String> {
        let prompt = required(prompt, "prompt is required")?;
        self.images
            .generate(prompt, cancel.clone())
            .await
            .map_err(|err| upstream_or_cancelled(err, &cancel))
    }

    pub async fn scrape(&self, url: Option<&str>, cancel: CancellationToken) -> ChatResult<String> {
        let url = required(url, "url is required")?;
        require_http_url(url).map_err(|e| ChatError::invalid(e.to_string()))?;
        let (content, truncated) = self
            .pages
            .fetch_text(url, cancel.clone())
            .await
            .map_err(|err| upstream_or_cancelled(err, &cancel))?;
        if truncated {
            tracing::debug!("scraped content from {} was truncated", url);
        }
        Ok(content)
    }

    pub async fn youtube_transcript(
        &self,
        url: Option<&str>,
        cancel: CancellationToken,
    ) -> ChatResult<String> {
        let url = required(url, "url is required")?;
        if youtube_video_id(url).is_none() {
            return Err(ChatError::invalid("url is not a YouTube video link"));
        }
        self.transcripts
            .fetch(url, cancel.clone())
            .await
            .map_err(|err| upstream_or_cancelled(err, &cancel))
    }

    pub async fn process_document(
        &self,
        request: DocumentTaskRequest,
        request_id: Option<&str>,
        cancel: CancellationToken,
    ) -> ChatResult<String> {
        let task = DocumentTask::parse(required(request.task.as_deref(), "task is required")?);
        let text = match (non_blank(request.text.as_deref()), &request.file) {
            (Some(text), _) => text.to_string(),
            (None, Some(file)) => extract_file(file).await?,
            (None, None) => return Err(ChatError::invalid("text or file is required")),
        };
        if text.trim().is_empty() {
            return Err(ChatError::invalid("document contains no readable text"));
        }
        self.complete(task.prompt(&text), request_id, cancel).await
    }

    async fn complete(
        &self,
        prompt: String,
        request_id: Option<&str>,
        cancel: CancellationToken,
    ) -> ChatResult<String> {
        let request = ResolveRequest {
            request_id: request_id.map(str::to_string),
            ..ResolveRequest::single_prompt(prompt)
        };
        Ok(self.resolver.resolve(request, cancel).await?.text)
    }

    /// Runs the search up front and folds the hits into the prompt. A failed
    /// or empty search still produces a prompt the model can answer.
    async fn search_context(&self, message: &str, cancel: &CancellationToken) -> String {
        match self.search.search(message, cancel.clone()).await {
            Ok(hits) if !hits.is_empty() => format!(
                "Answer the question using the web search results below. Cite the sources you \
                 rely on by their link.\n\nSearch results:\n{}\n\nQuestion: {message}",
                format_hits(&hits)
            ),
            Ok(_) => format!(
                "A web search found nothing relevant. Answer from general knowledge and mention \
                 that no sources were found.\n\nQuestion: {message}"
            ),
            Err(err) => {
                tracing::warn!("web search failed, answering without results: {}", err);
                format!(
                    "Web search is unavailable right now. Answer from general knowledge and \
                     mention that no sources could be checked.\n\nQuestion: {message}"
                )
            }
        }
    }
}

/// The new message, or (for clients that send it as the last history entry)
/// the trailing user turn's text.
fn take_message(request: &mut ChatRequest) -> ChatResult<String> {
    if let Some(message) = request.message_text() {
        return Ok(message.to_string());
    }
    let trailing = request
        .history
        .last()
        .and_then(decode_history_entry)
        .filter(|turn| turn.role == Role::User)
        .map(|turn| turn.text())
        .filter(|text| !text.trim().is_empty());
    match trailing {
        Some(text) => {
            request.history.pop();
            Ok(text.trim().to_string())
        }
        None => Err(ChatError::invalid("message is required")),
    }
}

fn inline_part(file: &InlineFile) -> ChatResult<Part> {
    let (mime_type, payload) = file.parts();
    if payload.is_empty() {
        return Err(ChatError::invalid("imageData must contain base64 data"));
    }
    STANDARD
        .decode(payload)
        .map_err(|_| ChatError::invalid("imageData is not valid base64"))?;
    Ok(Part::inline(mime_type, payload))
}

async fn extract_file(file: &InlineFile) -> ChatResult<String> {
    let (mime_type, payload) = file.parts();
    let bytes = STANDARD
        .decode(payload)
        .map_err(|_| ChatError::invalid("file is not valid base64"))?;
    let kind = DocumentKind::detect(file.name.as_deref(), Some(&mime_type));
    tokio::task::spawn_blocking(move || {
        extract_bytes_text(&bytes, kind, &ExtractLimits::default())
    })
    .await
    .map_err(|e| ChatError::upstream(format!("document extraction did not complete: {e}")))?
    .map_err(|err| ChatError::invalid(err.to_string()))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(value: Option<&'a str>, message: &str) -> ChatResult<&'a str> {
    non_blank(value).ok_or_else(|| ChatError::invalid(message))
}

fn upstream_or_cancelled(err: anyhow::Error, cancel: &CancellationToken) -> ChatError {
    if cancel.is_cancelled() {
        ChatError::Cancelled
    } else {
        ChatError::upstream(err)
    }
}
