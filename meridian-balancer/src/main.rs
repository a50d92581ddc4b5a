//! Meridian balancer daemon.
//!
//! Mirrors the store's virtual services onto this host's forwarding,
//! firewall and address configuration, and takes part in the cluster's
//! leader election.
//!
//! ```bash
//! meridian --config /etc/meridian/meridian.toml
//! meridian --dry-run --log-level debug
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use meridian_balancer::{Balancer, ConfigLoader};

/// Meridian load-balancer control plane.
#[derive(Parser, Debug)]
#[command(name = "meridian")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file. Defaults are used when it does not exist.
    #[arg(long, default_value = "/etc/meridian/meridian.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Log host commands instead of running them.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = ConfigLoader::new().load_or_default(&args.config)?;
    config.dry_run |= args.dry_run;
    info!(
        config = %args.config.display(),
        name = %config.name,
        mode = ?config.cluster_mode,
        dry_run = config.dry_run,
        "starting meridian"
    );

    let balancer = Balancer::new(config).await?;

    tokio::select! {
        result = balancer.wait() => {
            if let Err(e) = result {
                error!(error = %e, "balancer stopped");
                return Err(e.into());
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutting down");
            balancer.shutdown().await;
            balancer.wait().await?;
        }
    }

    info!("shut down gracefully");
    Ok(())
}
