//! PDF Compositor Service
//!
//! Serves the compositing HTTP API, or runs a single composite from the
//! command line and prints a JSON result.
//!
//! ## Commands
//!
//! - `serve` (default): HTTP API on `BIND_ADDR` / `PORT`
//! - `composite <template> <artwork> <output>`: one-shot composite
//! - `layers <template>`: list optional content groups
//! - `tools`: report which external tools are installed
//!
//! Configuration is read from the environment; see `config::Config::from_env`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pdf_compositor::compositor::{CompositeRequest, Compositor};
use pdf_compositor::config::Config;
use pdf_compositor::server::{self, AppState};
use pdf_compositor::store::JobStore;
use pdf_compositor::strategy::Strategy;
use pdf_compositor::telemetry;
use pdf_compositor::tools::ProcessRunner;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "pdf-compositor")]
#[command(about = "Composite artwork into print template PDFs", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve,

    /// Composite one artwork into one template
    Composite {
        /// Template PDF
        template: PathBuf,

        /// Artwork image
        artwork: PathBuf,

        /// Where to write the composited PDF
        output: PathBuf,

        /// Layer the artwork belongs to
        #[arg(short, long)]
        layer: Option<String>,

        /// Raster resolution for raster strategies
        #[arg(short, long)]
        dpi: Option<u32>,

        /// Run only this strategy
        #[arg(short, long)]
        strategy: Option<Strategy>,
    },

    /// List a template's layers
    Layers {
        /// Template PDF
        template: PathBuf,

        /// Layer to look for
        #[arg(short, long)]
        layer: Option<String>,
    },

    /// Report installed tools
    Tools,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            println!("{}", json!({ "success": false, "error": format!("{:#}", e) }));
            return ExitCode::FAILURE;
        }
    };

    telemetry::init_logging(config.json_logs);

    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Composite {
            template,
            artwork,
            output,
            layer,
            dpi,
            strategy,
        } => {
            let request = CompositeRequest {
                template,
                artwork,
                output,
                layer_name: layer.unwrap_or_else(|| config.default_layer_name.clone()),
                dpi: dpi.unwrap_or(config.default_dpi),
                strategy,
            };
            composite(config, request).await
        }
        Commands::Layers { template, layer } => {
            let target = layer.unwrap_or_else(|| config.default_layer_name.clone());
            list_layers(config, template, target).await
        }
        Commands::Tools => tools(config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            println!("{}", json!({ "success": false, "error": format!("{:#}", e) }));
            ExitCode::FAILURE
        }
    }
}

fn build_compositor(config: &Config) -> Compositor {
    Compositor::new(
        Arc::new(ProcessRunner::new()),
        config.tools.clone(),
        config.tool_timeout,
        config.work_dir.clone(),
    )
}

async fn serve(config: Config) -> Result<ExitCode> {
    match telemetry::init_telemetry() {
        Ok(true) => {}
        Ok(false) => info!("OTEL_EXPORTER_OTLP_ENDPOINT not set, span export disabled"),
        Err(e) => warn!("Failed to initialize telemetry: {}", e),
    }

    info!(
        "Configuration: bind_addr={}, concurrency={}, timeout={}s, max_upload={}MB",
        config.bind_addr,
        config.concurrency,
        config.tool_timeout.as_secs(),
        config.max_upload_bytes / (1024 * 1024)
    );

    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Failed to create work dir {}", config.work_dir.display()))?;

    let store = JobStore::from_config(config.redis_url.as_deref(), config.job_ttl_secs).await?;
    let compositor = build_compositor(&config);
    let state = AppState::new(compositor, store, config);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    server::serve(state, shutdown).await?;
    telemetry::shutdown_telemetry();
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("Received shutdown signal, draining in-flight requests...");
    shutdown.cancel();
}

async fn composite(config: Config, request: CompositeRequest) -> Result<ExitCode> {
    let range = pdf_compositor::validation::DPI_RANGE;
    if !range.contains(&request.dpi) {
        anyhow::bail!("dpi must be between {} and {}", range.start(), range.end());
    }

    let compositor = build_compositor(&config);
    let output = request.output.display().to_string();

    let result = tokio::task::spawn_blocking(move || compositor.composite(&request))
        .await
        .context("Composite task panicked")?;

    match result {
        Ok(outcome) => {
            println!(
                "{}",
                json!({
                    "success": true,
                    "output": output,
                    "strategy": outcome.strategy,
                    "attempts": outcome.attempts,
                    "layers": outcome.layers,
                })
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!(
                "{}",
                json!({
                    "success": false,
                    "error": e.to_string(),
                    "attempts": e.attempts(),
                })
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn list_layers(config: Config, template: PathBuf, target: String) -> Result<ExitCode> {
    let compositor = build_compositor(&config);
    let report = tokio::task::spawn_blocking(move || compositor.inspect_layers(&template, &target))
        .await
        .context("Layer task panicked")??;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

async fn tools(config: Config) -> Result<ExitCode> {
    let compositor = build_compositor(&config);
    let statuses = tokio::task::spawn_blocking(move || compositor.tool_status())
        .await
        .context("Tool probe task panicked")?;
    let strategies = pdf_compositor::compositor::runnable_strategies(&statuses);

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "tools": statuses, "strategies": strategies }))?
    );
    Ok(if strategies.is_empty() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
