//! Router Daemon - Command-Line Host for the Inference Router
//!
//! Loads the router configuration, connects to a local Ollama runtime and
//! routes prompts read from the command line or from stdin, one per line.
//!
//! # Usage
//!
//! ```bash
//! # One prompt
//! router-daemon --prompt "Explain TCP"
//!
//! # Interactive: one prompt per line until EOF or Ctrl-C
//! router-daemon --strategy costOptimized
//!
//! # Stream tokens as they arrive
//! router-daemon --stream
//!
//! # With config file
//! router-daemon --config /etc/inference-router/config.toml
//!
//! # Verbose logging
//! RUST_LOG=debug router-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: Stop reading prompts, drain background tasks, exit

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use router_core::backend::{FileStore, InMemoryStore, OllamaInvoker};
use router_core::config::{load_config, load_config_from_path};
use router_core::{
    InferenceRequest, InferenceResponse, PersistentStore, Router, RouterConfig, RouterError,
    SelectionStrategy, StreamingToken,
};

/// Router Daemon - Routes prompts across local and remote models
#[derive(Parser, Debug)]
#[command(name = "router-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "ROUTER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Route this prompt and exit instead of reading stdin
    #[arg(short = 'p', long, value_name = "TEXT")]
    prompt: Option<String>,

    /// Selection strategy (balanced, qualityFirst, costOptimized, speedPriority)
    #[arg(short = 's', long, value_name = "NAME")]
    strategy: Option<String>,

    /// Directory for the Cold cache tier (defaults to the user cache dir)
    #[arg(long, env = "ROUTER_COLD_DIR", value_name = "PATH")]
    cold_dir: Option<PathBuf>,

    /// Keep the Cold tier in memory
    #[arg(long)]
    no_disk_cache: bool,

    /// Print tokens as they arrive
    #[arg(long)]
    stream: bool,

    /// Print router statistics as JSON on exit
    #[arg(long)]
    stats: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "ROUTER_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("router_daemon={level},router_core={level}"))
    });

    // Responses go to stdout; keep logs out of the way
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the configuration and apply command-line overrides
fn resolve_config(args: &Args) -> Result<RouterConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => load_config().context("Failed to load default config")?,
    };

    if let Some(name) = &args.strategy {
        config.strategy = name
            .parse::<SelectionStrategy>()
            .map_err(anyhow::Error::msg)
            .context("Invalid --strategy")?;
    }

    Ok(config)
}

/// Pick the Cold-tier store
fn resolve_store(args: &Args) -> Arc<dyn PersistentStore> {
    if args.no_disk_cache {
        return Arc::new(InMemoryStore::new());
    }
    match args.cold_dir.clone().or_else(FileStore::default_root) {
        Some(root) => {
            info!(path = %root.display(), "Cold tier on disk");
            Arc::new(FileStore::new(root))
        }
        None => {
            warn!("No cache directory available, keeping Cold tier in memory");
            Arc::new(InMemoryStore::new())
        }
    }
}

/// Build the router around an Ollama runtime
fn build_router(config: RouterConfig, store: Arc<dyn PersistentStore>) -> Result<Router> {
    let ollama = Arc::new(
        OllamaInvoker::from_settings(&config.backend, config.models.clone())
            .context("Failed to create Ollama client")?,
    );
    info!(url = %ollama.base_url(), "Ollama backend");

    Router::builder(config, ollama.clone())
        .catalog(ollama.clone())
        .lifecycle(ollama)
        .store(store)
        .build()
        .context("Invalid router configuration")
}

/// Route one prompt and write the answer to stdout
async fn serve_prompt(router: &Router, prompt: &str, stream: bool) -> Result<()> {
    let request = InferenceRequest::new(prompt);
    let request_id = request.request_id().to_string();

    let outcome = if stream {
        let (tx, mut rx) = mpsc::channel(64);
        let printer = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(token) = rx.recv().await {
                let chunk = match token {
                    StreamingToken::Token(text) => text,
                    StreamingToken::Restarted { model_id } => {
                        format!("\n[restarted on {model_id}]\n")
                    }
                };
                stdout.write_all(chunk.as_bytes()).await?;
                stdout.flush().await?;
            }
            stdout.write_all(b"\n").await?;
            stdout.flush().await
        });
        let outcome = router.submit_streaming(request, tx).await;
        printer
            .await
            .context("Token printer panicked")?
            .context("Failed to write to stdout")?;
        outcome
    } else {
        router.submit(request).await
    };

    match outcome {
        Ok(response) => {
            if !stream {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(response.text.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            log_response(&request_id, &response);
        }
        Err(e) => report_failure(&request_id, &e),
    }
    Ok(())
}

fn log_response(request_id: &str, response: &InferenceResponse) {
    info!(
        request_id = %request_id,
        model = %response.model_id,
        tokens = response.tokens_used,
        cost = response.cost,
        latency_ms = response.latency_ms,
        fallback_depth = response.fallback_depth,
        served_from = ?response.served_from,
        "Request served"
    );
}

fn report_failure(request_id: &str, error: &RouterError) {
    match error {
        RouterError::ResourceExhausted(_) => {
            warn!(request_id = %request_id, error = %error, "Request refused");
        }
        _ => error!(request_id = %request_id, error = %error, "Request failed"),
    }
}

/// Read prompts from stdin until EOF or Ctrl-C
async fn serve_stdin(router: &Router, stream: bool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    info!("Input closed");
                    return Ok(());
                };
                let prompt = line.trim();
                if prompt.is_empty() {
                    continue;
                }
                serve_prompt(router, prompt, stream).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, initiating shutdown");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Router Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    if let Some(ref config_path) = args.config {
        info!(config_path = ?config_path, "Config file");
    }

    let config = resolve_config(&args)?;
    info!(strategy = %config.strategy, models = config.models.len(), "Configuration loaded");

    let store = resolve_store(&args);
    let router = build_router(config, store)?;

    match router.refresh_catalog().await {
        Ok(count) => info!(models = count, "Model catalog loaded"),
        Err(e) => warn!(error = %e, "Model catalog unavailable, using configured models"),
    }

    router.start_background();

    let result = match args.prompt.as_deref() {
        Some(prompt) => {
            tokio::select! {
                result = serve_prompt(&router, prompt, args.stream) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, initiating shutdown");
                    Ok(())
                }
            }
        }
        None => serve_stdin(&router, args.stream).await,
    };

    // Cleanup
    info!("Shutting down...");
    router.shutdown().await;

    if args.stats {
        let stats = serde_json::to_string_pretty(&router.stats())?;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(stats.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    match result {
        Ok(()) => {
            info!("Router daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
