//! Kadabra LSP - Entry Point
//!
//! Opens files with a language server, waits for it to analyze them, and
//! prints diagnostics, connected files and request statistics.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kadabra_lsp::config::Timeouts;
use kadabra_lsp::lsp::types::path_to_url;
use kadabra_lsp::lsp::{
    LoggingObserver, ObserverSet, ServerDefinition, SessionContext, SessionRegistry,
};
use kadabra_lsp::settings::{ConfigurationSource, EmptyConfiguration, ServerConfiguration};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Runs a language server against a set of files.
#[derive(Parser, Debug)]
#[command(name = "kadabra-lsp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project root the server is started for.
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Language server command.
    #[arg(short, long, default_value = "rust-analyzer")]
    server: String,

    /// Arguments to pass to the language server.
    #[arg(long)]
    args: Vec<String>,

    /// Extensions the server handles, separated by `;`.
    #[arg(short, long, default_value = "rs")]
    extensions: String,

    /// Connect over a local socket on this port (0 picks one) instead of stdio.
    #[arg(long)]
    socket_port: Option<u16>,

    /// JSON file with server settings.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// JSON file with request timeouts in milliseconds.
    #[arg(long)]
    timeouts: Option<PathBuf>,

    /// How long to wait for diagnostics after opening the files.
    #[arg(long, default_value_t = 2000)]
    wait_ms: u64,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Files to open.
    files: Vec<PathBuf>,
}

impl Args {
    /// Parses the log level string into a tracing Level.
    fn parse_log_level(&self) -> Result<Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            other => anyhow::bail!("invalid log level: {}", other),
        }
    }

    fn definition(&self) -> ServerDefinition {
        let definition = ServerDefinition::exe(&self.extensions, &self.server, self.args.clone());
        match self.socket_port {
            Some(port) => definition.with_socket(port),
            None => definition,
        }
    }

    fn timeouts(&self) -> Result<Timeouts> {
        let Some(path) = self.timeouts.clone().or_else(Timeouts::default_path) else {
            return Ok(Timeouts::default());
        };
        Timeouts::load_or_default(&path)
            .with_context(|| format!("failed to load timeouts from {}", path.display()))
    }

    fn settings(&self) -> Result<Arc<dyn ConfigurationSource>> {
        match &self.settings {
            Some(path) => {
                let config = ServerConfiguration::load(path)
                    .with_context(|| format!("failed to load settings from {}", path.display()))?;
                Ok(Arc::new(config))
            }
            None => Ok(Arc::new(EmptyConfiguration)),
        }
    }
}

/// Initializes the tracing subscriber for logging.
fn init_tracing(level: Level) -> Result<()> {
    // Create an env filter that respects RUST_LOG but has a default level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kadabra_lsp={level}")));

    // Logs go to stderr; stdout carries the report
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(())
}

async fn open_files(registry: &SessionRegistry, files: &[PathBuf]) -> Result<()> {
    for file in files {
        let uri = path_to_url(file).with_context(|| format!("cannot open {}", file.display()))?;
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        match registry.open_document(uri.clone(), &text).await {
            Ok(_) => info!(%uri, "document connected"),
            Err(e) => warn!(%uri, error = %e, "document not connected"),
        }
    }
    Ok(())
}

fn report(registry: &SessionRegistry, files: &[PathBuf]) -> Result<()> {
    for file in files {
        let Ok(uri) = path_to_url(Path::new(file)) else {
            continue;
        };
        let Some(doc) = registry.wrapper_for_uri(&uri).and_then(|w| w.document(&uri)) else {
            continue;
        };
        println!("{} (version {})", file.display(), doc.version());
        for diagnostic in doc.diagnostics() {
            let start = diagnostic.range.start;
            println!(
                "  {}:{} {}",
                start.line + 1,
                start.character + 1,
                diagnostic.message
            );
        }
    }

    println!(
        "statuses: {}",
        serde_json::to_string_pretty(&registry.statuses())?
    );
    println!(
        "connected files: {}",
        serde_json::to_string_pretty(&registry.connected_files())?
    );
    println!("stats: {}", serde_json::to_string_pretty(&registry.stats())?);
    Ok(())
}

/// Main entry point.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.parse_log_level()?;
    init_tracing(log_level)?;

    let workspace = args.workspace.canonicalize().context(format!(
        "failed to canonicalize workspace path: {}",
        args.workspace.display()
    ))?;

    let observers = ObserverSet::default();
    observers.subscribe(Arc::new(LoggingObserver));
    let context = SessionContext::default()
        .with_timeouts(args.timeouts()?.shared())
        .with_config(args.settings()?)
        .with_observers(observers);

    let registry = SessionRegistry::new(&workspace, context);
    registry.add_definition(args.definition());

    info!(
        workspace = %workspace.display(),
        server = %args.server,
        files = args.files.len(),
        "starting kadabra-lsp"
    );

    open_files(&registry, &args.files).await?;
    tokio::time::sleep(Duration::from_millis(args.wait_ms)).await;
    let reported = report(&registry, &args.files);

    registry.shutdown_all().await;
    info!("all language servers stopped");
    reported
}
