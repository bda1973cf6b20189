use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use collab_relay_cluster::hot_reload::{ConfigWatcher, apply_rate_limit_changes};
use collab_relay_cluster::maintenance::MaintenanceScheduler;
use collab_relay_cluster::{
    ClusterCoordinator, CoordinatorSettings, RateLimiter, RelayState, TracingEventHandler,
    start_admin_server,
};
use collab_relay_core::config::{Config, LoggingConfig, StoreBackend};
use collab_relay_core::memory_store::MemoryStore;
use collab_relay_core::redis_store::RedisStore;
use collab_relay_core::store::SharedStore;

#[derive(Parser)]
#[command(
    name = "collab-relay",
    about = "Cluster coordinator and distributed rate limiter for collaboration gateways",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cluster node with its admin server
    Serve {
        /// Admin port (default: 18790)
        #[arg(long)]
        port: Option<u16>,
    },

    /// List active instances
    Instances,

    /// Rate limit inspection and moderation
    Limits {
        #[command(subcommand)]
        action: LimitsAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum LimitsAction {
    /// Show a user's bucket, penalty and connections
    Status { user: String },
    /// Cluster-wide usage statistics
    Stats {
        #[arg(long, default_value_t = 60)]
        minutes: u32,
    },
    /// Put a user in the penalty box
    Penalize {
        user: String,
        /// Penalty length (default: rate_limit.penalty_duration_ms)
        #[arg(long)]
        duration_ms: Option<u64>,
    },
    /// Lift a user's penalty and refill their bucket
    Pardon { user: String },
    /// Delete old usage counters
    Cleanup {
        /// Retention window (default: maintenance.retention_hours)
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose)?;

    match cli.command {
        Commands::Serve { port } => serve(config, config_path, port).await?,
        Commands::Instances => {
            let store = connect_store(&config).await?;
            let coordinator = ClusterCoordinator::new(
                store,
                Arc::new(TracingEventHandler),
                CoordinatorSettings::from_config(&config),
            );
            let instances = coordinator.get_instance_details().await?;
            if instances.is_empty() {
                println!("No active instances.");
            }
            for record in instances {
                println!(
                    "{:<40} host={} pid={} uptime={}s last_heartbeat={}",
                    record.instance_id,
                    record.hostname,
                    record.pid,
                    record.uptime,
                    record.last_heartbeat.to_rfc3339()
                );
            }
        }
        Commands::Limits { action } => {
            let store = connect_store(&config).await?;
            let limiter = RateLimiter::new(store, config.rate_limit());
            match action {
                LimitsAction::Status { user } => {
                    let status = limiter.get_rate_limit_status(&user).await?;
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
                LimitsAction::Stats { minutes } => {
                    let stats = limiter.get_stats(minutes).await?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
                LimitsAction::Penalize { user, duration_ms } => {
                    let until = limiter.apply_penalty(&user, duration_ms).await?;
                    println!("{user} penalized until {until} (epoch ms)");
                }
                LimitsAction::Pardon { user } => {
                    limiter.remove_penalty(&user).await;
                    println!("{user} pardoned");
                }
                LimitsAction::Cleanup { older_than_hours } => {
                    let hours =
                        older_than_hours.unwrap_or_else(|| config.maintenance().retention_hours);
                    let deleted = limiter.cleanup(hours).await?;
                    println!("Deleted {deleted} usage counters older than {hours}h");
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                if !errors.is_empty() {
                    anyhow::bail!(
                        "{} has {} error(s)",
                        config_path.display(),
                        errors.len()
                    );
                }
                println!("{} is valid", config_path.display());
            }
        },
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    let mut filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    for directive in &logging.filters {
        filter = filter.add_directive(directive.parse()?);
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let to_stdout = logging.output == "stdout";
    match (logging.format.as_str(), to_stdout) {
        ("json", true) => builder.json().with_writer(std::io::stdout).init(),
        ("json", false) => builder.json().with_writer(std::io::stderr).init(),
        (_, true) => builder.with_writer(std::io::stdout).init(),
        (_, false) => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn SharedStore>> {
    match config.store_backend() {
        StoreBackend::Redis => {
            let url = config.store_url();
            let store = RedisStore::connect(&url).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using the process-local memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn serve(config: Config, config_path: PathBuf, port: Option<u16>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for w in &warnings {
        warn!("{w}");
    }
    if !errors.is_empty() {
        anyhow::bail!("Invalid configuration: {}", errors.join("; "));
    }

    #[cfg(feature = "prometheus")]
    let metrics_handle = collab_relay_cluster::metrics::install_prometheus_recorder()?;

    let store = connect_store(&config).await?;
    let coordinator = Arc::new(ClusterCoordinator::new(
        store.clone(),
        Arc::new(TracingEventHandler),
        CoordinatorSettings::from_config(&config),
    ));
    coordinator.start().await?;

    let rate_limiter = Arc::new(RateLimiter::new(store, config.rate_limit()));
    let cancel = CancellationToken::new();

    let maintenance =
        Arc::new(MaintenanceScheduler::new(&config.maintenance(), rate_limiter.clone()))
            .start(cancel.clone());

    let _watcher = start_hot_reload(&config_path, &config, &rate_limiter, &cancel);

    let state = RelayState::new(
        Arc::new(config.clone()),
        coordinator.clone(),
        rate_limiter,
    );
    #[cfg(feature = "prometheus")]
    let state = state.with_metrics(metrics_handle);

    let port = port.unwrap_or_else(|| config.admin_port());
    let bind = config.admin_bind();
    let mut server = tokio::spawn({
        let state = Arc::new(state);
        let cancel = cancel.clone();
        async move { start_admin_server(state, &bind, port, cancel).await }
    });

    info!(instance_id = %coordinator.instance_id(), "Collab Relay node running");

    let server_result = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Shutdown signal received");
            None
        }
        res = &mut server => Some(res),
    };

    // Stop timers and the admin server, then leave the cluster.
    cancel.cancel();
    if let Err(e) = coordinator.shutdown().await {
        warn!(%e, "Coordinator shutdown incomplete");
    }
    let _ = maintenance.await;

    let server_result = match server_result {
        Some(res) => res,
        None => server.await,
    };
    match server_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(%e, "Admin server failed");
            Err(e)
        }
        Err(e) => Err(e.into()),
    }
}

fn start_hot_reload(
    config_path: &Path,
    config: &Config,
    rate_limiter: &Arc<RateLimiter>,
    cancel: &CancellationToken,
) -> Option<ConfigWatcher> {
    match ConfigWatcher::start(config_path.to_path_buf(), config.clone()) {
        Ok((watcher, rx)) => {
            apply_rate_limit_changes(rx, rate_limiter.clone(), cancel.clone());
            Some(watcher)
        }
        Err(e) => {
            warn!(path = %config_path.display(), %e, "Config hot-reload disabled");
            None
        }
    }
}
