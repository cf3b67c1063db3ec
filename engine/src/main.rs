use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatrelay_core::{ChatService, ConfigStore, DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT};
use chatrelay_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
    ProcessKind, DEFAULT_RETENTION_DAYS,
};
use chatrelay_providers::ProviderRegistry;
use chatrelay_server::{serve, AppState};
use chatrelay_tools::{validate_tool_schemas, Dispatch, ToolRegistry, ToolsConfig};
use chatrelay_types::ToolInvocation;
use chatrelay_wire::ChatRequest;

const SUPPORTED_PROVIDER_IDS: [&str; 2] = ["gemini", "local"];

#[derive(Parser, Debug)]
#[command(name = "chatrelay-engine")]
#[command(about = "Stateless chat relay with server-side tool calling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long, env = "CHATRELAY_CONFIG")]
        config: Option<String>,
        #[arg(long, env = "CHATRELAY_LOGS_DIR")]
        logs_dir: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    Run {
        prompt: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, env = "CHATRELAY_CONFIG")]
        config: Option<String>,
    },
    Tool {
        /// Inline JSON, `@path` to read a file, or `-` for stdin.
        #[arg(long)]
        json: String,
        #[arg(long, env = "CHATRELAY_CONFIG")]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            config,
            logs_dir,
            api_key,
            provider,
            model,
        } => {
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let logs_dir = logs_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| canonical_logs_dir_from_root(Path::new(".chatrelay")));
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, DEFAULT_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("engine jsonl logging initialized"),
                    ..ObservabilityEvent::default()
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let config_path = config.map(PathBuf::from);
            let (config, chat) = build_runtime(config_path.as_deref(), overrides).await?;
            log_startup_paths(config.path(), &addr);
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "engine.startup.ready",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some(&format!("addr={addr}")),
                    ..ObservabilityEvent::default()
                },
            );
            serve(addr, AppState::new(chat, config)).await?;
        }
        Command::Run {
            prompt,
            api_key,
            provider,
            model,
            config,
        } => {
            init_cli_logging();
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let config_path = config.map(PathBuf::from);
            let (_, chat) = build_runtime(config_path.as_deref(), overrides).await?;
            let chat = chat.with_process(ProcessKind::Engine);
            let request = ChatRequest {
                message: Some(prompt),
                ..ChatRequest::default()
            };
            let reply = chat
                .chat(request, None, cancel_on_ctrl_c())
                .await
                .map_err(|err| anyhow::anyhow!("{}: {}", err.code(), err))?;
            println!("{reply}");
        }
        Command::Tool { json, config } => {
            init_cli_logging();
            let config_path = config.map(PathBuf::from);
            let (_, chat) = build_runtime(config_path.as_deref(), None).await?;
            let payload = read_tool_json(&json)?;
            let tool = payload
                .get("tool")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if tool.is_empty() {
                anyhow::bail!("tool is required in input json");
            }
            let args = match payload.get("args") {
                Some(Value::Object(args)) => args.clone(),
                Some(Value::Null) | None => Map::new(),
                Some(_) => anyhow::bail!("args must be a JSON object"),
            };
            let invocation = ToolInvocation::new(tool.clone(), args);
            match chat.tools().dispatch(&invocation, cancel_on_ctrl_c()).await {
                Dispatch::Completed(result) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&result.to_response_value())?
                    );
                }
                Dispatch::UnknownTool => anyhow::bail!("tool `{}` is not registered", tool),
            }
        }
    }

    Ok(())
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = Map::new();

    if let Some(p) = &provider {
        root.insert("default_provider".to_string(), Value::String(p.clone()));
    }

    // key and model go to the selected provider, or gemini when none was given
    let target_provider = provider.as_deref().unwrap_or("gemini");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), Value::String(m));
        }

        let mut providers = Map::new();
        providers.insert(target_provider.to_string(), Value::Object(provider_config));
        root.insert("providers".to_string(), Value::Object(providers));
    }

    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = match provider.trim().to_lowercase().as_str() {
        "google" => "gemini".to_string(),
        other => other.to_string(),
    };
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn read_tool_json(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path)?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

fn log_startup_paths(config_path: Option<&Path>, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting chatrelay-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} config_path={}",
        exe.display(),
        cwd.display(),
        config_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
}

/// One-shot commands log to stderr only; stdout carries the result.
fn init_cli_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .ok();
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    cancel
}

async fn build_runtime(
    config_path: Option<&Path>,
    cli_overrides: Option<Value>,
) -> anyhow::Result<(ConfigStore, ChatService)> {
    let config = ConfigStore::new(config_path, cli_overrides).await?;
    let relay = config.get().await;
    let providers = ProviderRegistry::new((&relay).into());
    let tools = ToolRegistry::new(&ToolsConfig::from(&relay));
    validate_tool_schemas(&tools.list().await).context("tool registry failed validation")?;
    for provider in providers.list().await {
        info!(
            "provider available: id={} models={}",
            provider.id,
            provider
                .models
                .iter()
                .map(|m| m.id.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );
    }
    let chat = ChatService::new(&relay, providers, tools);
    Ok((config, chat))
}
