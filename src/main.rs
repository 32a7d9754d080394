use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use tollgate::{Clock, CounterStore, SystemClock, TollgateConfig};

/// Run rate limit checks against limiters defined in a YAML file.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Path to the YAML configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Name of the limiter to check
    limiter: String,

    /// Identifier being limited (user id, IP address, API key, ...)
    identifier: String,

    /// Number of consecutive checks to run
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u32,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // RUST_LOG takes precedence over -v
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TollgateConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = config.store.build(clock.clone());
    let sweeper = match config.store.sweep_interval()? {
        Some(interval) => Some(store.spawn_sweeper(interval)),
        None => None,
    };

    let shared: Arc<dyn CounterStore> = Arc::new(store.clone());
    let mut limiters = config.build_limiters(shared, clock)?;
    let Some(limiter) = limiters.remove(&cli.limiter) else {
        bail!(
            "unknown limiter \"{}\"; configured: {}",
            cli.limiter,
            limiters.keys().cloned().collect::<Vec<_>>().join(", ")
        );
    };

    info!(
        limiter = %limiter.name(),
        algorithm = %limiter.algorithm(),
        limit = limiter.limit(),
        "Limiter ready"
    );

    for _ in 0..cli.count {
        let decision = limiter.check(&cli.identifier).await?;
        println!("{}", serde_json::to_string(&decision)?);
    }

    if let Some(sweeper) = sweeper {
        sweeper.shutdown().await;
    }
    store.clear();

    Ok(())
}
