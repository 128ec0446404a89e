use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sluice::clock::{SharedClock, SystemClock};
use sluice::config::{SluiceConfig, StoreBackend};
use sluice::ratelimit::{LimitType, PolicySet, RateLimitConfig, RateLimiterService};
use sluice::store::{MemoryStore, RedisStore, WindowStore};

#[derive(Debug, Parser)]
#[command(name = "sluice", version, about = "Distributed sliding-window rate limiter")]
struct Args {
    /// Path to the configuration file (YAML, TOML or JSON)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Emit logs as JSON objects
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check one identity against a policy
    Check {
        #[command(flatten)]
        policy: PolicyArgs,
        /// Caller identity
        #[arg(long)]
        id: String,
        /// Number of consecutive checks
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Check several identities in one round trip
    Batch {
        #[command(flatten)]
        policy: PolicyArgs,
        /// Comma separated caller identities
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<String>,
    },
    /// Forget the window and burst state of one identity
    Clear {
        #[command(flatten)]
        policy: PolicyArgs,
        #[arg(long)]
        id: String,
    },
    /// Show aggregated usage for a limit type
    Metrics {
        #[arg(long = "type")]
        limit_type: LimitType,
        #[arg(long, default_value_t = 60)]
        minutes: u64,
    },
    /// Show recent high usage alerts for a limit type
    Alerts {
        #[arg(long = "type")]
        limit_type: LimitType,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Show this instance's circuit breaker
    Breaker,
    /// Run metric cleanup until interrupted
    Run,
}

/// A named policy from the policy file, or one given inline.
#[derive(Debug, ClapArgs)]
struct PolicyArgs {
    /// Policy name in the policy file
    #[arg(long, conflicts_with_all = ["limit_type", "max_requests", "window_ms"])]
    policy: Option<String>,
    #[arg(long = "type")]
    limit_type: Option<LimitType>,
    #[arg(long)]
    max_requests: Option<u64>,
    #[arg(long)]
    window_ms: Option<u64>,
    #[arg(long)]
    cost: Option<u64>,
    /// Burst multiplier; enables burst credit
    #[arg(long)]
    burst_multiplier: Option<f64>,
    #[arg(long, default_value_t = 3600)]
    burst_ttl_seconds: u64,
}

impl PolicyArgs {
    fn resolve(&self, config: &SluiceConfig) -> anyhow::Result<RateLimitConfig> {
        if let Some(name) = &self.policy {
            let path = config
                .policies_path
                .as_deref()
                .context("--policy requires policies_path in the configuration")?;
            let policies = PolicySet::from_file(path)?;
            return policies
                .get(name)
                .cloned()
                .with_context(|| format!("no policy named '{}' in {}", name, path));
        }

        let (Some(limit_type), Some(max_requests), Some(window_ms)) =
            (self.limit_type, self.max_requests, self.window_ms)
        else {
            bail!("give either --policy or all of --type, --max-requests and --window-ms");
        };

        let mut builder = RateLimitConfig::builder(limit_type, "cli")
            .max_requests(max_requests)
            .window_ms(window_ms);
        if let Some(cost) = self.cost {
            builder = builder.cost(cost);
        }
        if let Some(multiplier) = self.burst_multiplier {
            builder = builder.burst(multiplier, self.burst_ttl_seconds);
        }
        Ok(builder.build()?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config_path = args.config.as_deref().map(|p| p.to_string_lossy().into_owned());
    let config = SluiceConfig::load(config_path.as_deref())?;

    let clock: SharedClock = Arc::new(SystemClock);
    let store = connect_store(&config, clock.clone()).await?;
    let service = Arc::new(RateLimiterService::from_config(&config, store, clock));

    match args.command {
        Command::Check { policy, id, count } => {
            let policy = policy.resolve(&config)?;
            for _ in 0..count.max(1) {
                print_json(&service.check_rate_limit(&id, &policy).await)?;
            }
        }
        Command::Batch { policy, ids } => {
            let policy = policy.resolve(&config)?;
            print_json(&service.batch_check_rate_limit(&ids, &policy).await)?;
        }
        Command::Clear { policy, id } => {
            let policy = policy.resolve(&config)?;
            service.clear_rate_limit(&id, &policy).await;
            info!(id = %id, "Rate limit cleared");
        }
        Command::Metrics { limit_type, minutes } => {
            print_json(&service.get_rate_limit_metrics(limit_type, minutes).await?)?;
        }
        Command::Alerts { limit_type, limit } => {
            print_json(&service.get_alerts(limit_type, limit).await?)?;
        }
        Command::Breaker => {
            print_json(&service.circuit_breaker_snapshot())?;
        }
        Command::Run => {
            info!("Starting Sluice metric cleanup");
            info!("Version: {}", env!("CARGO_PKG_VERSION"));

            let cleanup = service.monitoring().clone().spawn_cleanup(shutdown_signal());
            cleanup.await.context("cleanup task failed")?;

            info!("Sluice stopped");
        }
    }

    service.flush_usage().await;
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn connect_store(config: &SluiceConfig, clock: SharedClock) -> anyhow::Result<Arc<dyn WindowStore>> {
    match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store)
                .await
                .with_context(|| format!("failed to connect to {}", config.store.url))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; limits are not shared between processes");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
