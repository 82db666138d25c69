// meshlink-cli: local maintenance for a meshlink relay installation
//
// Inspects and edits the service config, manages offloaded attachments and
// looks into the durable event store. Does not start a runtime.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use config::CliConfig;
use meshlink_core::config::ServiceConfig;
use meshlink_core::offload::AttachmentOffloader;
use meshlink_core::store::SledEventStore;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "meshlink: mesh runtime relay maintenance", long_about = None)]
#[command(version)]
struct Cli {
    /// Also write logs to a daily rolling file under the data directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or edit the service configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage offloaded attachments
    Attachments {
        #[command(subcommand)]
        action: AttachmentAction,
    },
    /// Inspect the event store
    Events {
        #[command(subcommand)]
        action: EventAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    /// Write the default configuration if none exists
    Init {
        #[arg(short, long)]
        force: bool,
    },
    Set {
        key: String,
        value: String,
    },
}

#[derive(Subcommand)]
enum AttachmentAction {
    /// Remove attachment directories older than the given age
    Cleanup {
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
    /// Remove every attachment of one message
    Purge { message: String },
    /// Copy one offloaded payload out of the store
    Load {
        path: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[derive(Subcommand)]
enum EventAction {
    Counts,
    /// Print a stored message and its delivery status
    Message { hash: String },
    Block { source: String },
    Unblock { source: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_file)?;

    match cli.command {
        Commands::Config { action } => cmd_config(action),
        Commands::Attachments { action } => cmd_attachments(action).await,
        Commands::Events { action } => cmd_events(action),
    }
}

fn init_logging(to_file: bool) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    if !to_file {
        registry.init();
        return Ok(None);
    }

    let log_dir = CliConfig::data_dir()?.join("logs");
    let appender = tracing_appender::rolling::daily(&log_dir, "meshlink.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    registry
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer),
        )
        .init();
    Ok(Some(guard))
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = CliConfig::load()?;
            println!("{}", "Configuration".bold());
            println!("  File: {}", CliConfig::config_file()?.display());
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to render config")?
            );
        }
        ConfigAction::Init { force } => {
            let file = CliConfig::config_file()?;
            if file.exists() && !force {
                println!(
                    "  {} Config already exists at {} (use --force to overwrite)",
                    "!".yellow(),
                    file.display()
                );
                return Ok(());
            }
            let config = ServiceConfig::with_storage(CliConfig::data_dir()?);
            let file = CliConfig::save(&config)?;
            println!("  {} Wrote {}", "✓".green(), file.display());
            println!("  {} Storage: {}", "✓".green(), config.storage_path.display());
        }
        ConfigAction::Set { key, value } => {
            let mut config = CliConfig::load()?;
            CliConfig::set(&mut config, &key, &value)?;
            CliConfig::save(&config)?;
            println!("  {} {} = {}", "✓".green(), key.bold(), value);
        }
    }
    Ok(())
}

fn offloader(config: &ServiceConfig) -> AttachmentOffloader {
    AttachmentOffloader::new(config.attachments_dir(), &config.offload)
}

async fn cmd_attachments(action: AttachmentAction) -> Result<()> {
    let config = CliConfig::load()?;
    let offloader = offloader(&config);

    match action {
        AttachmentAction::Cleanup { older_than_hours } => {
            let age = older_than_hours
                .map(|h| Duration::from_secs(h * 60 * 60))
                .unwrap_or_else(|| config.offload.max_age());
            let removed = tokio::task::spawn_blocking(move || offloader.cleanup_older_than(age))
                .await
                .context("Cleanup worker failed")?
                .context("Failed to clean up attachments")?;
            println!(
                "  {} Removed {} attachment director{} older than {}h",
                "✓".green(),
                removed,
                if removed == 1 { "y" } else { "ies" },
                age.as_secs() / 3600
            );
        }
        AttachmentAction::Purge { message } => {
            if offloader
                .delete_attachments(&message)
                .with_context(|| format!("Failed to purge attachments of {}", message))?
            {
                println!("  {} Purged attachments of {}", "✓".green(), message);
            } else {
                println!("  {} No attachments stored for {}", "!".yellow(), message);
            }
        }
        AttachmentAction::Load { path, out } => {
            let data = offloader
                .load_attachment(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            std::fs::write(&out, &data)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!(
                "  {} Wrote {} bytes to {}",
                "✓".green(),
                data.len(),
                out.display()
            );
        }
    }
    Ok(())
}

fn cmd_events(action: EventAction) -> Result<()> {
    let config = CliConfig::load()?;
    let store = SledEventStore::open(&config.store_dir()).context("Failed to open event store")?;

    match action {
        EventAction::Counts => {
            println!("{}", "Event store".bold());
            println!("  Announces: {}", store.announce_count());
            println!("  Messages:  {}", store.message_count());
        }
        EventAction::Message { hash } => {
            let key = hex::decode(&hash).context("Message hash must be hex")?;
            match store.message_json(&key)? {
                Some(message) => {
                    println!("{}", serde_json::to_string_pretty(&message)?);
                    let status = store
                        .delivery_status(&key)?
                        .unwrap_or_else(|| "unknown".to_string());
                    println!("  Delivery: {}", status.cyan());
                }
                None => println!("  {} No message {}", "!".yellow(), hash),
            }
        }
        EventAction::Block { source } => {
            let key = hex::decode(&source).context("Source hash must be hex")?;
            store.block_sender(&key)?;
            store.flush()?;
            println!("  {} Blocked {}", "✓".green(), source);
        }
        EventAction::Unblock { source } => {
            let key = hex::decode(&source).context("Source hash must be hex")?;
            store.unblock_sender(&key)?;
            store.flush()?;
            println!("  {} Unblocked {}", "✓".green(), source);
        }
    }
    Ok(())
}
