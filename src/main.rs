//! Shield Stack - layered prompt-injection defense
//!
//! Runs adversarial inputs through five defense layers and records how
//! they interact, with and without inter-layer coordination.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod domain;
mod engine;
mod error;
mod experiment;
mod logging;
mod storage;

use crate::api::build_router;
use crate::config::{Config, LayerToggles};
use crate::domain::IsolationMode;
use crate::engine::{build_target, DefensePipeline};
use crate::experiment::{load_corpus, write_summary, ExperimentArm, ExperimentPlan, ExperimentRunner};
use crate::storage::TraceRepository;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The defense pipeline.
    pub pipeline: Arc<DefensePipeline>,
    /// Trace repository.
    pub repository: TraceRepository,
    /// Isolation mode for requests that do not pick one.
    pub isolation: IsolationMode,
    /// Coordination default for requests that do not pick one.
    pub coordination_enabled: bool,
}

#[derive(Parser)]
#[command(name = "shield-stack", version, about = "Coordinated vs isolated prompt-injection defense")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve,
    /// Run the coordination experiment over an attack corpus.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Defense configuration to run.
    #[arg(long = "config", value_enum)]
    arm: ExperimentArm,

    /// JSON attack corpus: an array of {"type", "prompt"}.
    #[arg(long)]
    corpus: PathBuf,

    /// Trials per attack (default from configuration).
    #[arg(long)]
    trials: Option<u32>,

    /// Output database path (default: <output_dir>/exp5_<config>.db).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Isolation mode: good or bad (default from configuration).
    #[arg(long)]
    isolation: Option<IsolationMode>,

    /// Concurrent runs (default from configuration).
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Note: No .env file loaded ({e})");
    }

    logging::init();

    let cli = Cli::parse();

    tracing::info!("Starting Shield Stack v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().map_err(|e| {
        tracing::error!(error = %e, "Failed to load configuration");
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Run(args) => run_experiment(config, args).await,
    }
}

fn build_pipeline(config: &Config) -> anyhow::Result<DefensePipeline> {
    let target = build_target(&config.target).map_err(|e| {
        tracing::error!(error = %e, "Failed to build protected system client");
        anyhow::anyhow!("Target configuration error: {}", e)
    })?;

    let pipeline = DefensePipeline::new(
        &config.pipeline,
        target,
        Duration::from_secs(config.target.timeout_secs),
    )?;

    tracing::info!(
        layers = ?pipeline.enabled_layers(),
        target = pipeline.target_name(),
        "Defense pipeline ready"
    );

    Ok(pipeline)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        database = %config.database.url,
        isolation = %config.pipeline.isolation_mode,
        coordination = config.pipeline.coordination_enabled,
        "Configuration loaded"
    );

    let pool = storage::connect(&config.database.url).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to connect to database");
        anyhow::anyhow!("Database connection error: {}", e)
    })?;

    let repository = TraceRepository::new(pool);
    repository.init_schema().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to initialize database schema");
        anyhow::anyhow!("Schema initialization error: {}", e)
    })?;

    tracing::info!("Database connected and schema initialized");

    let state = AppState {
        pipeline: Arc::new(build_pipeline(&config)?),
        repository,
        isolation: config.pipeline.isolation()?,
        coordination_enabled: config.pipeline.coordination_enabled,
    };

    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!(address = %addr, "Server listening");
    tracing::info!("Swagger UI available at http://{}/swagger-ui/", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}

async fn run_experiment(mut config: Config, args: RunArgs) -> anyhow::Result<()> {
    // The experiment always runs the full stack.
    config.pipeline.layers = LayerToggles::all(true);

    let output_db = args.output.unwrap_or_else(|| {
        PathBuf::from(&config.experiment.output_dir).join(format!("exp5_{}.db", args.arm))
    });
    if let Some(dir) = output_db.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }

    let plan = ExperimentPlan {
        arm: args.arm,
        isolation: match args.isolation {
            Some(mode) => mode,
            None => config.pipeline.isolation()?,
        },
        trials: args.trials.unwrap_or(config.experiment.trials),
        concurrency: args.concurrency.unwrap_or(config.experiment.concurrency),
        output_db,
    };

    let corpus = load_corpus(&args.corpus).await?;

    let pool = storage::connect(&format!("sqlite://{}", plan.output_db.display())).await?;
    let repository = TraceRepository::new(pool);
    repository.init_schema().await?;

    let runner = ExperimentRunner::new(Arc::new(build_pipeline(&config)?), Arc::new(repository));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight runs");
            on_signal.cancel();
        }
    });

    let summary = runner.run(&plan, &corpus, cancel).await?;
    let summary_path = plan.summary_path();
    write_summary(&summary, &summary_path).await?;

    tracing::info!(
        config = %plan.arm,
        attack_success_rate = summary.attack_success_rate,
        database = %plan.output_db.display(),
        summary = %summary_path.display(),
        "Experiment finished"
    );

    Ok(())
}
