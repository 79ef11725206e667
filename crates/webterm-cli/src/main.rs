//! webterm CLI
//!
//! Serves the code-execution dispatcher over WebSocket, or runs a single
//! file locally through the same pipeline.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;
use webterm::{
    ChunkKind, Config, Dispatcher, EXAMPLE_CONFIG, ExecutionLimits, ExecutionRequest, SessionEvent,
    SessionId,
};

mod server;

#[derive(Parser)]
#[command(name = "webterm")]
#[command(about = "Remote code execution for a browser code playground")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: webterm.toml)
        #[arg(short, long, default_value = "webterm.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Accept WebSocket clients
    Serve {
        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// First port to try
        #[arg(short, long)]
        port: Option<u16>,

        /// Origin allowed to connect (repeatable)
        #[arg(long = "allowed-origin", value_name = "ORIGIN")]
        allowed_origins: Vec<String>,
    },

    /// Run a source file (compile if needed, then execute)
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language ID (e.g., python, cpp); unknown IDs use the fallback
        #[arg(short, long)]
        language: String,

        /// Wall clock limit per phase in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Per-stream output ceiling in bytes
        #[arg(short, long)]
        max_output_bytes: Option<u64>,
    },

    /// List available languages
    Languages,

    /// Show effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Serve {
            host,
            port,
            allowed_origins,
        } => {
            let mut config = load_config(cli.config.as_deref())?;

            // CLI overrides config
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if !allowed_origins.is_empty() {
                config.server.allowed_origins = allowed_origins;
            }
            server::serve(&config).await
        }
        Commands::Run {
            source,
            language,
            timeout_ms,
            max_output_bytes,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let mut limits = ExecutionLimits::unset();
            limits.timeout_ms = timeout_ms;
            limits.max_output_bytes = max_output_bytes;
            run_file(&config, &source, &language, limits).await
        }
        Commands::Languages => {
            list_languages(&load_config(cli.config.as_deref())?);
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&load_config(cli.config.as_deref())?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => info!(?path, "loading configuration"),
        None => debug!("using built-in configuration"),
    }
    Config::load(path).context("failed to load configuration")
}

async fn run_file(
    config: &Config,
    source: &Path,
    language: &str,
    limits: ExecutionLimits,
) -> Result<()> {
    let code = tokio::fs::read_to_string(source)
        .await
        .with_context(|| format!("failed to read source file '{}'", source.display()))?;

    let dispatcher = Dispatcher::new(config).context("invalid language configuration")?;
    let session_id = SessionId::generate();
    let (events, mut received) = mpsc::channel(256);
    let session = dispatcher.session(session_id.clone(), session_id.as_str(), events);

    info!(language, session = %session_id, "running program");
    let handle = session
        .start(ExecutionRequest::new(code, language).with_limits(limits))
        .context("session is busy")?;

    // Program output goes to stdout/stderr untouched, everything else is a
    // dispatcher message and goes to stderr.
    let mut result = None;
    while let Some(event) = received.recv().await {
        match event {
            SessionEvent::Output(chunk) => match chunk.kind {
                ChunkKind::Stdout => print!("{}", chunk.text),
                ChunkKind::Stderr | ChunkKind::Notice | ChunkKind::Error => {
                    eprint!("{}", chunk.text)
                }
            },
            SessionEvent::Complete(done) => {
                result = Some(done);
                break;
            }
        }
    }

    handle.await.context("execution task failed")?;
    session.teardown().await;

    let result = result.context("execution ended without a result")?;
    info!(
        outcome = %result.outcome,
        duration_ms = result.duration_ms,
        exit_code = result.exit_code,
        signal = result.signal,
        truncated = result.truncated,
        "execution result"
    );

    if result.is_success() {
        Ok(())
    } else {
        std::process::exit(result.exit_code.filter(|code| *code != 0).unwrap_or(1));
    }
}

fn list_languages(config: &Config) {
    println!("Available languages:\n");

    for (id, lang) in &config.languages {
        let lang_type = if lang.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        let marker = if *id == config.fallback_language {
            " [fallback]"
        } else {
            ""
        };
        println!("  {:<15} {} ({}){}", id, lang.name, lang_type, marker);
    }
}

fn show_config(config: &Config) {
    println!("Server:");
    println!("  Listen: {}:{}", config.server.host, config.server.port);
    println!("  Port attempts: {}", config.server.max_port_attempts);
    println!(
        "  Allowed origins: {}",
        config.server.allowed_origins.join(", ")
    );
    println!();
    println!("Default limits:");
    println!("  Timeout: {:?} ms", config.default_limits.timeout_ms);
    println!(
        "  Max output: {:?} bytes",
        config.default_limits.max_output_bytes
    );
    println!();
    println!("Workspace root: {}", config.workspace_root.display());
    println!("Environment passed through: {}", config.env_allowlist.join(", "));
    println!();
    println!("Fallback language: {}", config.fallback_language);
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
