//! relay-runner binary: `register` and `daemon` commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_cache::{CacheConfig, CacheServer};
use relay_client::{ControlPlane, HttpControlPlane};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_runner::config::Config;
use relay_runner::registration::Registration;
use relay_runner::scheduler::{Poller, PollerConfig};
use relay_runner::service::{ProcessEngine, TaskRunner};

#[derive(Parser)]
#[command(name = "relay-runner")]
#[command(about = "Self-hosted CI runner", version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this runner with a control plane
    Register {
        /// Control-plane URL (e.g., "https://forge.example.com")
        #[arg(long, env = "RELAY_INSTANCE")]
        instance: String,

        /// One-time registration token
        #[arg(long, env = "RELAY_REGISTRATION_TOKEN")]
        token: String,

        /// Runner name (default: host name)
        #[arg(long)]
        name: Option<String>,

        /// Comma-separated labels
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,
    },
    /// Run the runner daemon
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = load_config()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = &config.log_level;
                format!(
                    "relay_runner={level},relay_cache={level},relay_client={level},tower_http=info"
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Register {
            instance,
            token,
            name,
            labels,
        } => register(&config, &instance, &token, name, labels).await,
        Commands::Daemon => daemon(config).await,
    }
}

/// Loads configuration from environment variables
fn load_config() -> Result<Config> {
    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    Ok(config)
}

async fn register(
    config: &Config,
    instance: &str,
    token: &str,
    name: Option<String>,
    labels: Vec<String>,
) -> Result<()> {
    let name = name
        .or_else(|| std::env::var("HOSTNAME").ok())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "relay-runner".to_string());
    let labels: Vec<String> = labels
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    info!("Registering runner {} with {}", name, instance);

    let client = HttpControlPlane::build(instance, config.insecure)?;
    let reg = register_with_retry(&client, instance, &name, token, labels).await?;
    reg.save(&config.registration_file)?;

    info!(
        "Runner registered successfully, saved to {}",
        config.registration_file.display()
    );
    Ok(())
}

/// Register with the control plane, retrying with exponential backoff
///
/// The control plane may not be reachable yet when the runner starts
/// (common in container environments).
async fn register_with_retry(
    client: &HttpControlPlane,
    instance: &str,
    name: &str,
    token: &str,
    labels: Vec<String>,
) -> Result<Registration> {
    const MAX_RETRIES: u32 = 10;
    const INITIAL_DELAY_MS: u64 = 500;
    const MAX_DELAY_MS: u64 = 30_000;

    let mut attempt = 0;
    let mut delay_ms = INITIAL_DELAY_MS;

    loop {
        attempt += 1;

        match Registration::register(client, instance, name, token, labels.clone()).await {
            Ok(reg) => return Ok(reg),
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    error!("Failed to register after {} attempts", MAX_RETRIES);
                    return Err(e);
                }

                warn!(
                    "Failed to register (attempt {}/{}): {:#}",
                    attempt, MAX_RETRIES, e
                );
                warn!("Retrying in {} ms...", delay_ms);

                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                // Exponential backoff with cap
                delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
            }
        }
    }
}

async fn daemon(config: Config) -> Result<()> {
    info!("Starting runner daemon");

    if !config.registration_file.exists() {
        anyhow::bail!(
            "registration file {} not found, please register the runner first",
            config.registration_file.display()
        );
    }
    let reg = Registration::load(&config.registration_file)?;
    info!("Loaded registration: name={}, address={}", reg.name, reg.address);

    let client: Arc<dyn ControlPlane> = Arc::new(
        HttpControlPlane::build(&reg.address, config.insecure)?
            .with_credentials(&reg.uuid, &reg.token),
    );
    let engine = Arc::new(ProcessEngine::from_command_line(&config.engine)?);

    let mut runner = TaskRunner::new(&reg.name, Arc::clone(&client), engine, config.envs.clone())
        .with_report_interval(config.report_interval);

    let cache = if config.cache.enabled {
        let cache_config = CacheConfig::new(&config.cache.dir)
            .with_host(config.cache.host.clone())
            .with_port(config.cache.port);
        match CacheServer::start(cache_config).await {
            Ok(server) => {
                info!(
                    "Artifact cache enabled at {} (bound to {})",
                    server.external_url(),
                    server.local_addr()
                );
                runner = runner.with_cache_url(server.external_url());
                Some(server)
            }
            Err(e) => {
                error!("Cannot init cache server, it will be disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let root = CancellationToken::new();
    let poller = Arc::new(Poller::new(
        PollerConfig::from(&config),
        client,
        Arc::new(runner),
        root.clone(),
    ));

    let shutdown = CancellationToken::new();
    let polling = {
        let poller = Arc::clone(&poller);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { poller.poll(shutdown).await })
    };

    shutdown_signal().await;
    info!("Shutting down, waiting for running tasks (signal again to cancel them)");
    shutdown.cancel();
    polling.await.context("Poller task failed")?;

    tokio::select! {
        _ = poller.wait() => {}
        _ = shutdown_signal() => {
            warn!("Cancelling running tasks");
            root.cancel();
            poller.wait().await;
        }
    }

    if let Some(cache) = cache {
        cache.shutdown().await;
    }

    info!("Runner stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
}
