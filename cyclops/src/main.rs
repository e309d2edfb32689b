mod config;

use crate::config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use clap::{Args, Parser};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const METRICS_PREFIX: &str = "cyclops";

#[derive(Parser)]
#[command(version, about = "Deduplicating front-end for Sentry event ingestion")]
enum CliCommand {
    /// Serve store requests
    Run(ConfigArgs),
    /// Load and validate a configuration file, then exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid configuration: {0}")]
    Validation(#[from] ingest::config::ValidationError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Ingest(#[from] ingest::errors::IngestError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match cli {
        CliCommand::Run(args) => run(&args.config),
        CliCommand::CheckConfig(args) => check_config(&args.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("cyclops: {err}");
            ExitCode::FAILURE
        }
    }
}

fn check_config(path: &std::path::Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    config.ingest.validate()?;
    println!("{} is valid", path.display());
    Ok(())
}

fn run(path: &std::path::Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    config.ingest.validate()?;

    let logging = config.common.logging.unwrap_or_default();
    // Must outlive the runtime so pending reports are flushed on exit
    let _sentry = init_sentry(&logging);
    init_logging(&logging);

    if let Some(metrics) = &config.common.metrics {
        init_metrics(metrics)?;
    }
    shared::metrics_defs::describe_all(ingest::metrics_defs::ALL_METRICS);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let ingest_config = config.ingest;
    runtime.block_on(async move {
        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Could not listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            tracing::info!("Received Ctrl-C, shutting down");
        };
        ingest::run(ingest_config, shutdown)
            .await
            .map_err(CliError::from)
    })
}

fn init_sentry(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = logging.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            logging
                .sentry_dsn
                .is_some()
                .then(sentry::integrations::tracing::layer),
        )
        .init();
}

fn init_metrics(metrics: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(metrics.statsd_host.as_str(), metrics.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| CliError::Metrics(e.to_string()))?;

    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;

    tracing::info!(
        host = %metrics.statsd_host,
        port = metrics.statsd_port,
        "Metrics reported to statsd"
    );
    Ok(())
}
