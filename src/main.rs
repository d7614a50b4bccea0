use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use trustgate::auth::{SqliteDeviceStore, TrustedDeviceService, REVOKED_BY_USER};
use trustgate::config::Config;
use trustgate::jobs::{run_cleanup, run_periodic};

/// Trusted-device token maintenance.
#[derive(Parser)]
#[command(name = "trustgate", version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.trustgate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Delete long-expired and long-revoked devices
    Cleanup {
        /// Keep running, sweeping every N hours until Ctrl-C
        #[arg(long, value_name = "HOURS", value_parser = clap::value_parser!(u64).range(1..))]
        every: Option<u64>,
    },

    /// List a user's active devices as JSON
    List {
        #[arg(long)]
        user: String,
    },

    /// Revoke one device, or all of a user's devices
    Revoke {
        #[arg(long)]
        user: String,

        /// Device to revoke
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        device: Option<String>,

        /// Revoke every active device of the user
        #[arg(long)]
        all: bool,

        /// Recorded as `revoked_by`
        #[arg(long, default_value = REVOKED_BY_USER)]
        by: String,
    },

    /// Print the JSON schema of the config file
    ConfigSchema,

    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::ConfigSchema => {
            println!("{}", Config::json_schema()?);
            Ok(())
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "trustgate", &mut std::io::stdout());
            Ok(())
        }
        command => {
            let service = open_service(cli.config.as_deref())?;
            run(command, service).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_service(config_path: Option<&std::path::Path>) -> Result<TrustedDeviceService> {
    let config = Config::load(config_path)?;
    let db_path = config.storage.resolved_db_path();
    let store = SqliteDeviceStore::open(&db_path)
        .with_context(|| format!("Failed to open device store at {}", db_path.display()))?;
    tracing::debug!(db = %db_path.display(), "Device store opened");
    Ok(TrustedDeviceService::new(
        Arc::new(store),
        config.trusted_devices,
    ))
}

fn sweep_interval(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

async fn run(command: Commands, service: TrustedDeviceService) -> Result<()> {
    match command {
        Commands::Cleanup { every: None } => {
            let report = tokio::task::spawn_blocking(move || run_cleanup(&service)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                bail!("Cleanup failed; see log for details");
            }
        }
        Commands::Cleanup { every: Some(hours) } => {
            tracing::info!(hours, "Starting periodic cleanup (Ctrl-C to stop)");
            let reports = run_periodic(service, sweep_interval(hours), async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl-C: {e}");
                }
            })
            .await;
            let total: u64 = reports.iter().map(|r| r.count).sum();
            tracing::info!(runs = reports.len(), total, "Periodic cleanup finished");
        }
        Commands::List { user } => {
            let devices = service.list_user_devices(&user);
            println!("{}", serde_json::to_string_pretty(&devices)?);
        }
        Commands::Revoke {
            user,
            device: Some(device),
            by,
            ..
        } => {
            if !service.revoke_device(&user, &device, &by)? {
                bail!("No active device {device} for user {user}");
            }
            println!("Revoked {device}");
        }
        Commands::Revoke { user, by, .. } => {
            let count = service.revoke_all_devices(&user, &by)?;
            println!("Revoked {count} device(s) for {user}");
        }
        Commands::ConfigSchema | Commands::Completions { .. } => {}
    }
    Ok(())
}
