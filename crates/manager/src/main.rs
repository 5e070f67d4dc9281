//! certherd - Main entry point
//!
//! Certificate lifecycle manager for label-discovered container services.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use certherd_config::validate::{certs, lint, network, validate_settings};
use certherd_config::Config;
use certherd_manager::App;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// certherd - TLS certificates for label-discovered services
#[derive(Parser, Debug)]
#[command(name = "certherd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the environment configuration, probe endpoints and exit
    Test,
    /// Run the certificate manager (default)
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Test) => test_config(cli.verbose),
        Some(Commands::Run) | None => run_manager(cli.verbose),
    }
}

fn init_logging(debug: bool) {
    let log_level = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")
}

/// Validate configuration and exit
fn test_config(verbose: bool) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration from environment")?;
    init_logging(verbose || config.debug);

    info!("Testing configuration from environment");

    let mut result = validate_settings(&config);
    result.merge(lint::lint_config(&config));

    let runtime = runtime()?;
    runtime.block_on(async {
        result.merge(network::validate_endpoints(&config).await);
        result.merge(certs::validate_stored_certificates(&config).await);
    });

    for warning in &result.warnings {
        warn!("{}", warning.message);
    }
    for err in &result.errors {
        error!("{}", err);
    }

    if result.has_errors() {
        anyhow::bail!(
            "configuration test failed with {} error(s)",
            result.errors.len()
        );
    }

    info!("Configuration test successful:");
    info!("  - {} static domain(s)", config.static_domains().len());
    info!(
        "  - docker polling {}",
        if config.docker_polling { "enabled" } else { "disabled" }
    );
    info!(
        "  - webhook {}",
        config
            .webhook()
            .map(|w| w.url_for(certherd_config::CERT_SUBJECT_PLACEHOLDER))
            .unwrap_or_else(|| "disabled".to_string())
    );

    println!("certherd: configuration test is successful");
    Ok(())
}

/// Run the certificate manager until SIGINT or SIGTERM
fn run_manager(verbose: bool) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration from environment")?;
    init_logging(verbose || config.debug);

    config.validate().context("Configuration validation failed")?;

    let runtime = runtime()?;
    runtime.block_on(async {
        let app = App::new(config).await?;
        app.run(shutdown_signal()).await
    })?;

    info!("certherd stopped");
    Ok(())
}

/// Complete on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
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
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, initiating graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}
