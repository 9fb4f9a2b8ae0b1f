use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "fleetsync")]
#[command(about = "Device deployment sync between the ticket queue and the deployment sheet")]
struct Cli {
    /// Level for fleetsync targets when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the whole pipeline once with retries.
    Run,
    /// Run a single built-in stage once, without retries or cleanup.
    Stage { id: String },
    /// Run the pipeline on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("fleetsync={},info", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let outcome = fleetsync_sync::run_from_env().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.succeeded() {
                bail!(
                    "sync run {} failed after {} pass(es)",
                    outcome.run_id,
                    outcome.passes
                );
            }
        }
        Commands::Stage { id } => {
            let report = fleetsync_sync::run_stage_from_env(&id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Schedule => {
            let config = fleetsync_sync::SyncConfig::from_env();
            let Some(mut sched) = fleetsync_sync::maybe_build_scheduler(&config).await? else {
                bail!("scheduler is disabled; set FLEETSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await?;
            info!(cron = %config.sync_cron, "scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down scheduler");
            sched.shutdown().await?;
        }
    }

    Ok(())
}
