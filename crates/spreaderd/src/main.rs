//! spreaderd — multicloud workload spreader daemon.
//!
//! Reconciles each registered stack's per-cloud instance count toward its
//! configured weight split, rerouting weight away from unhealthy clouds.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use spread_config::SchedulerConfig;
use spread_driver::{CloudStackDriver, RestDriver};
use spread_reconcile::Scheduler;
use spread_store::{JsonFileStore, StackStore};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "spreaderd")]
#[command(about = "Multicloud workload spreader daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation loop until interrupted.
    Run {
        #[arg(short, long, default_value = "spreaderd.json")]
        config: PathBuf,
    },

    /// Load and validate a config file without starting the loop.
    ValidateConfig {
        #[arg(short, long, default_value = "spreaderd.json")]
        config: PathBuf,
    },

    /// Print the update plan one tick would produce for a stack, without applying it.
    Plan {
        #[arg(short, long, default_value = "spreaderd.json")]
        config: PathBuf,

        /// Name of the stack to preview.
        #[arg(long)]
        stack: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("spreaderd=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::ValidateConfig { config } => validate_config(config),
        Commands::Plan { config, stack } => print_plan(config, stack).await,
    }
}

fn build_drivers(config: &SchedulerConfig) -> IndexMap<String, Arc<dyn CloudStackDriver>> {
    let timeout = Duration::from_secs(config.driver_timeout_seconds);
    config
        .clouds
        .iter()
        .map(|cloud| {
            let mut rest = RestDriver::new(cloud.base_url.clone(), timeout);
            if let Some(env_var) = &cloud.auth_token_env {
                match std::env::var(env_var) {
                    Ok(token) => rest = rest.with_auth_token(token),
                    Err(_) => warn!(cloud_name = %cloud.name, env_var, "auth token env var not set, calling unauthenticated"),
                }
            }
            let driver: Arc<dyn CloudStackDriver> = Arc::new(rest);
            (cloud.name.clone(), driver)
        })
        .collect()
}

async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting spreaderd");

    let config = SchedulerConfig::load(&config_path)?;
    config.validate()?;

    let store: Arc<dyn StackStore> = Arc::new(JsonFileStore::new(config.store_path.clone()));
    let drivers = build_drivers(&config);

    info!(clouds = config.clouds.len(), store = %config.store_path.display(), "loaded config");

    let scheduler = Arc::new(Scheduler::new(
        store,
        drivers,
        Duration::from_secs(config.update_frequency_seconds),
        config.driver_pool_size,
    ));

    let run_scheduler = scheduler.clone();
    let run_handle = tokio::spawn(async move { run_scheduler.run().await });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install ctrl-c handler, stopping anyway");
    }

    info!("interrupt received, stopping");
    scheduler.stop();
    run_handle.await?;

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    let config = SchedulerConfig::load(&config_path)?;
    config.validate()?;
    println!("{} is valid ({} cloud(s) configured)", config_path.display(), config.clouds.len());
    Ok(())
}

async fn print_plan(config_path: PathBuf, stack_name: String) -> anyhow::Result<()> {
    let config = SchedulerConfig::load(&config_path)?;
    config.validate()?;

    let store = JsonFileStore::new(config.store_path.clone());
    let drivers = build_drivers(&config);

    let stacks = store.list().await?;
    let stack = stacks
        .into_iter()
        .find(|s| s.stack_name == stack_name)
        .ok_or_else(|| anyhow::anyhow!("no stack named {stack_name:?} in {}", config.store_path.display()))?;

    let health = Arc::new(spread_health::HealthRegistry::new());
    let reconciler = spread_reconcile::Reconciler::new(health, Arc::new(drivers), config.driver_pool_size);
    let running = AtomicBool::new(true);

    let (current, plan) = reconciler.plan(&stack, &running).await;

    println!("plan for {stack_name:?}:");
    for cloud in stack.weights.keys() {
        let current = current.get(cloud).copied().flatten();
        println!(
            "  {cloud}: current={}",
            current.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
        );
    }
    println!("  scale_up:   {:?}", plan.scale_up);
    println!("  scale_down: {:?}", plan.scale_down);

    Ok(())
}
