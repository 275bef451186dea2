use std::sync::Arc;

use anyhow::{Context, Result};
use campwatch_extract::BrowserCalendar;
use campwatch_notify::{SmtpConfig, SmtpMessenger};
use campwatch_store::MemoryStore;
use campwatch_sync::{AppConfig, Orchestrator};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "campwatch")]
#[command(about = "Camping availability watcher")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape cycle immediately and exit.
    Run,
    /// Run on the recurring schedule until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("campwatch=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = AppConfig::from_env();
    let smtp = SmtpConfig::from_env()
        .context("SMTP configuration missing; set SMTP_HOST, SMTP_USER and SMTP_PASSWORD")?;
    let store = Arc::new(MemoryStore::new());
    let source = Arc::new(BrowserCalendar::new(config.site.clone()));
    let messenger = Arc::new(SmtpMessenger::new(smtp));
    let orchestrator = Orchestrator::new(config, store, source, messenger);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = orchestrator.run_now().await?;
            println!(
                "run complete: run_id={} months={} items={} notified={}",
                summary.run_id,
                summary
                    .months
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(","),
                summary.items_scraped,
                summary.notifications_sent
            );
        }
        Commands::Watch => {
            orchestrator.start().await?;
            info!("watching; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            orchestrator.stop().await;
        }
    }

    Ok(())
}
