use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use chatrelay_observability::{emit_event, ObservabilityEvent, ProcessKind};
use chatrelay_providers::{GenerateRequest, ProviderRegistry, StreamChunk};
use chatrelay_tools::{Dispatch, ToolRegistry};
use chatrelay_types::{Conversation, ToolInvocation, ToolSchema, Turn};

use crate::config::{DEFAULT_MAX_TOOL_ITERATIONS, MAX_TOOL_ITERATIONS_CAP};
use crate::error::{ChatError, ChatResult};

pub const EMPTY_REPLY: &str =
    "Sorry, I couldn't come up with an answer to that. Could you try rephrasing it?";
pub const SAFETY_REPLY: &str =
    "I can't help with that request: the response was blocked by the model's safety filters.";
pub const TOOL_FAILURE_REPLY: &str =
    "Sorry, I couldn't finish that request because a capability I needed isn't available.";

#[derive(Debug, Clone, PartialEq)]
pub enum ResolverState {
    AwaitingModel,
    ExecutingTool(ToolInvocation),
    Done(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Done,
    Failed,
}

impl ResolutionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub text: String,
    pub outcome: ResolutionOutcome,
    pub round_trips: usize,
    pub tools_executed: Vec<String>,
}

/// Everything one resolution needs. The conversation must already be
/// normalized and end with the new user turn.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub conversation: Conversation,
    pub system_instruction: Option<String>,
    pub declare_tools: bool,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub request_id: Option<String>,
}

impl ResolveRequest {
    pub fn single_prompt(prompt: impl Into<String>) -> Self {
        Self {
            conversation: Conversation::from_turns(vec![Turn::user_text(prompt)]),
            ..Self::default()
        }
    }
}

/// Drives model round-trips until the model answers in plain text, asks for
/// a capability that is not registered, or the round-trip bound is reached.
#[derive(Clone)]
pub struct ToolCallResolver {
    providers: ProviderRegistry,
    tools: ToolRegistry,
    max_round_trips: usize,
    process: ProcessKind,
}

impl ToolCallResolver {
    pub fn new(providers: ProviderRegistry, tools: ToolRegistry) -> Self {
        Self {
            providers,
            tools,
            max_round_trips: DEFAULT_MAX_TOOL_ITERATIONS,
            process: ProcessKind::Server,
        }
    }

    pub fn with_max_round_trips(mut self, max: usize) -> Self {
        self.max_round_trips = max.clamp(1, MAX_TOOL_ITERATIONS_CAP);
        self
    }

    pub fn with_process(mut self, process: ProcessKind) -> Self {
        self.process = process;
        self
    }

    pub fn max_round_trips(&self) -> usize {
        self.max_round_trips
    }

    pub async fn resolve(
        &self,
        request: ResolveRequest,
        cancel: CancellationToken,
    ) -> ChatResult<Resolution> {
        let (mut run, tools) = self.start(request).await;
        let mut state = ResolverState::AwaitingModel;

        loop {
            state = match state {
                ResolverState::AwaitingModel => {
                    if cancel.is_cancelled() {
                        return Err(run.cancelled());
                    }
                    run.round_trips += 1;
                    run.trace.emit(Level::INFO, "provider.call.start", "start", None, None);
                    let response = self
                        .providers
                        .generate_for_provider(
                            run.provider_id.as_deref(),
                            run.model_id.as_deref(),
                            run.generate_request(&tools),
                            cancel.clone(),
                        )
                        .await
                        .map_err(|err| run.provider_failed(err, &cancel))?;
                    let finish = response.finish_reason.clone().unwrap_or_default();
                    run.trace.emit(
                        Level::INFO,
                        "provider.call.finish",
                        "ok",
                        None,
                        Some(&finish),
                    );
                    let calls = response.function_calls().into_iter().cloned().collect();
                    run.on_model_output(
                        &response.text(),
                        calls,
                        response.is_safety_blocked(),
                        self.max_round_trips,
                    )
                }
                ResolverState::ExecutingTool(invocation) => {
                    run.execute(&self.tools, invocation, &cancel).await?
                }
                ResolverState::Done(text) => break Ok(run.finish(text, ResolutionOutcome::Done)),
                ResolverState::Failed(text) => {
                    break Ok(run.finish(text, ResolutionOutcome::Failed))
                }
            };
        }
    }

    /// Same state machine and same final text as [`resolve`](Self::resolve).
    /// Without declared tools deltas are yielded as the provider produces them;
    /// with tools each round is held until it ends without a call. Dropping
    /// the stream stops the resolution at the next await point.
    pub fn resolve_stream(
        &self,
        request: ResolveRequest,
        cancel: CancellationToken,
    ) -> BoxStream<'static, ChatResult<String>> {
        Box::pin(self.clone().run_stream(request, cancel))
    }

    fn run_stream(
        self,
        request: ResolveRequest,
        cancel: CancellationToken,
    ) -> impl Stream<Item = ChatResult<String>> + Send + 'static {
        try_stream! {
            let (mut run, tools) = self.start(request).await;
            let mut state = ResolverState::AwaitingModel;

            loop {
                state = match state {
                    ResolverState::AwaitingModel => {
                        if cancel.is_cancelled() {
                            Err::<(), _>(run.cancelled())?;
                        }
                        run.round_trips += 1;
                        run.trace.emit(Level::INFO, "provider.call.start", "start", None, None);
                        let mut chunks = self
                            .providers
                            .stream_for_provider(
                                run.provider_id.as_deref(),
                                run.model_id.as_deref(),
                                run.generate_request(&tools),
                                cancel.clone(),
                            )
                            .await
                            .map_err(|err| run.provider_failed(err, &cancel))?;

                        // With tools declared a round may still end in a call, so its
                        // text is held back until the round is known to be final.
                        let live = !run.declared_tools;
                        let mut text = String::new();
                        let mut calls = Vec::new();
                        let mut finish_reason = String::new();
                        while let Some(chunk) = chunks.next().await {
                            match chunk.map_err(|err| run.provider_failed(err, &cancel))? {
                                StreamChunk::TextDelta(delta) => {
                                    if delta.is_empty() {
                                        continue;
                                    }
                                    text.push_str(&delta);
                                    if live && run.streamed {
                                        yield delta;
                                    } else if live && !text.trim().is_empty() {
                                        // blank prefixes wait so a fallback reply stays clean
                                        run.streamed = true;
                                        yield text.clone();
                                    }
                                }
                                StreamChunk::ToolCall(call) => calls.push(call),
                                StreamChunk::Done { finish_reason: reason, .. } => {
                                    finish_reason = reason;
                                    break;
                                }
                            }
                        }
                        run.trace.emit(
                            Level::INFO,
                            "provider.call.finish",
                            "ok",
                            None,
                            Some(&finish_reason),
                        );
                        let safety = finish_reason.eq_ignore_ascii_case("SAFETY");
                        run.on_model_output(&text, calls, safety, self.max_round_trips)
                    }
                    ResolverState::ExecutingTool(invocation) => {
                        run.execute(&self.tools, invocation, &cancel).await?
                    }
                    ResolverState::Done(text) => {
                        if !run.streamed {
                            yield text.clone();
                        }
                        run.finish(text, ResolutionOutcome::Done);
                        break;
                    }
                    ResolverState::Failed(text) => {
                        if !run.streamed {
                            yield text.clone();
                        }
                        run.finish(text, ResolutionOutcome::Failed);
                        break;
                    }
                };
            }
        }
    }

    async fn start(&self, request: ResolveRequest) -> (Run, Vec<ToolSchema>) {
        let tools = if request.declare_tools {
            self.tools.list().await
        } else {
            Vec::new()
        };
        let (provider, default_model) = self
            .providers
            .describe(request.provider_id.as_deref())
            .await
            .unwrap_or_default();
        let trace = Trace {
            process: self.process,
            request_id: request.request_id.unwrap_or_default(),
            provider_id: provider,
            model_id: request.model_id.clone().unwrap_or(default_model),
        };
        let run = Run {
            conversation: request.conversation,
            system_instruction: request.system_instruction,
            provider_id: request.provider_id,
            model_id: request.model_id,
            declared_tools: !tools.is_empty(),
            round_trips: 0,
            last_text: String::new(),
            streamed: false,
            tools_executed: Vec::new(),
            trace,
        };
        (run, tools)
    }
}

/// Mutable bookkeeping for a single resolution.
struct Run {
    conversation: Conversation,
    system_instruction: Option<String>,
    provider_id: Option<String>,
    model_id: Option<String>,
    declared_tools: bool,
    round_trips: usize,
    last_text: String,
    /// Set once any text has reached a streaming caller.
    streamed: bool,
    tools_executed: Vec<String>,
    trace: Trace,
}

impl Run {
    fn generate_request(&self, tools: &[ToolSchema]) -> GenerateRequest {
        GenerateRequest {
            system_instruction: self.system_instruction.clone(),
            contents: self.conversation.turns().to_vec(),
            tools: tools.to_vec(),
        }
    }

    fn on_model_output(
        &mut self,
        text: &str,
        calls: Vec<ToolInvocation>,
        safety_blocked: bool,
        max_round_trips: usize,
    ) -> ResolverState {
        let has_text = !text.trim().is_empty();
        if has_text {
            self.last_text = text.to_string();
        }

        if !self.declared_tools && !calls.is_empty() {
            tracing::warn!(
                "model requested tool `{}` although no tools were declared; ignoring",
                calls[0].name
            );
        }
        let calls = if self.declared_tools { calls } else { Vec::new() };
        let mut calls = calls.into_iter();
        let Some(call) = calls.next() else {
            if has_text {
                return ResolverState::Done(text.to_string());
            }
            let fallback = if safety_blocked { SAFETY_REPLY } else { EMPTY_REPLY };
            return ResolverState::Done(fallback.to_string());
        };

        let ignored = calls.map(|c| c.name).collect::<Vec<_>>();
        if !ignored.is_empty() {
            tracing::warn!(
                "model requested {} extra tool call(s) in one turn; only `{}` runs, ignoring: {}",
                ignored.len(),
                call.name,
                ignored.join(", ")
            );
        }

        if self.round_trips >= max_round_trips {
            self.trace.emit(
                Level::WARN,
                "resolver.bound_reached",
                "failed",
                Some(&call.name),
                Some("model still requested a tool on the last allowed round-trip"),
            );
            return ResolverState::Failed(self.fallback_text());
        }

        self.conversation.push(Turn::model_call(call.clone()));
        ResolverState::ExecutingTool(call)
    }

    async fn execute(
        &mut self,
        tools: &ToolRegistry,
        invocation: ToolInvocation,
        cancel: &CancellationToken,
    ) -> ChatResult<ResolverState> {
        self.trace.emit(
            Level::INFO,
            "tool.call.start",
            "start",
            Some(&invocation.name),
            None,
        );
        match tools.dispatch(&invocation, cancel.clone()).await {
            Dispatch::UnknownTool => {
                self.trace.emit(
                    Level::WARN,
                    "tool.call.finish",
                    "unknown_tool",
                    Some(&invocation.name),
                    Some("model requested an unregistered tool"),
                );
                Ok(ResolverState::Failed(self.fallback_text()))
            }
            Dispatch::Completed(_) if cancel.is_cancelled() => Err(self.cancelled()),
            Dispatch::Completed(result) => {
                let status = if result.is_failure() { "failed" } else { "ok" };
                self.trace.emit(
                    Level::INFO,
                    "tool.call.finish",
                    status,
                    Some(&invocation.name),
                    None,
                );
                self.tools_executed.push(invocation.name.clone());
                self.conversation
                    .push(Turn::tool_result(invocation.name, &result));
                Ok(ResolverState::AwaitingModel)
            }
        }
    }

    fn fallback_text(&self) -> String {
        if self.last_text.trim().is_empty() {
            TOOL_FAILURE_REPLY.to_string()
        } else {
            self.last_text.clone()
        }
    }

    fn provider_failed(&self, err: anyhow::Error, cancel: &CancellationToken) -> ChatError {
        if cancel.is_cancelled() {
            return self.cancelled();
        }
        let detail = err.to_string();
        self.trace.emit_error("provider.call.error", "PROVIDER_ERROR", &detail);
        ChatError::Upstream(detail)
    }

    fn cancelled(&self) -> ChatError {
        self.trace.emit(
            Level::INFO,
            "resolver.finished",
            "cancelled",
            None,
            Some(&format!("round_trips={}", self.round_trips)),
        );
        ChatError::Cancelled
    }

    fn finish(&mut self, text: String, outcome: ResolutionOutcome) -> Resolution {
        let detail = format!(
            "round_trips={} tools=[{}]",
            self.round_trips,
            self.tools_executed.join(",")
        );
        self.trace.emit(
            Level::INFO,
            "resolver.finished",
            outcome.as_str(),
            None,
            Some(&detail),
        );
        Resolution {
            text,
            outcome,
            round_trips: self.round_trips,
            tools_executed: std::mem::take(&mut self.tools_executed),
        }
    }
}

struct Trace {
    process: ProcessKind,
    request_id: String,
    provider_id: String,
    model_id: String,
}

impl Trace {
    fn emit(
        &self,
        level: Level,
        event: &str,
        status: &str,
        tool: Option<&str>,
        detail: Option<&str>,
    ) {
        emit_event(
            level,
            self.process,
            ObservabilityEvent {
                event,
                component: "core.resolver",
                request_id: Some(&self.request_id),
                provider_id: Some(&self.provider_id),
                model_id: Some(&self.model_id),
                tool,
                status: Some(status),
                error_code: None,
                detail: detail.filter(|d| !d.is_empty()),
            },
        );
    }

    fn emit_error(&self, event: &str, error_code: &str, detail: &str) {
        emit_event(
            Level::ERROR,
            self.process,
            ObservabilityEvent {
                event,
                component: "core.resolver",
                request_id: Some(&self.request_id),
                provider_id: Some(&self.provider_id),
                model_id: Some(&self.model_id),
                tool: None,
                status: Some("failed"),
                error_code: Some(error_code),
                detail: Some(detail),
            },
        );
    }
}
