use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use gazette::config::Config;
use gazette::feed::{export_to_file, Fetcher};
use gazette::scheduler::Poller;
use gazette::shutdown::{shutdown_channel, ShutdownTrigger};
use gazette::snapshot::write_snapshot;
use gazette::storage::{Database, DatabaseError};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser, Debug)]
#[command(name = "gazette", about = "Polls RSS/Atom feeds and stores new posts in SQLite")]
struct Args {
    /// Configuration file with the feed list
    #[arg(long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Database file (overrides `database_path` from the config)
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Poll every due feed once and exit
    #[arg(long)]
    once: bool,

    /// Write the feed list as OPML and exit
    #[arg(long, value_name = "FILE")]
    export_opml: Option<PathBuf>,

    /// Write a JSON snapshot of feeds and posts and exit
    #[arg(long, value_name = "FILE")]
    snapshot: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {} ({})", e, args.config.display());
            std::process::exit(1);
        }
    };

    let db_path = args.database.clone().unwrap_or_else(|| config.database_path.clone());
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of gazette appears to be using {}. Please stop it and try again.",
                db_path.display()
            );
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: Failed to open database {}: {}", db_path.display(), e);
            std::process::exit(1);
        }
    };

    let seeds = config.seeds();
    db.sync_feeds(&seeds)
        .await
        .context("Failed to sync feeds from config")?;
    tracing::info!(feeds = seeds.len(), database = %db_path.display(), "Feed list synced");

    if let Some(path) = &args.export_opml {
        let feeds = db.list_feeds().await.context("Failed to load feeds")?;
        export_to_file(&feeds, path)?;
        println!("Exported {} feeds to {}", feeds.len(), path.display());
        return Ok(());
    }

    if let Some(path) = &args.snapshot {
        write_snapshot(&db, path).await?;
        println!("Snapshot written to {}", path.display());
        return Ok(());
    }

    let (trigger, signal) = shutdown_channel();
    let fetcher = Fetcher::new(config.retry_policy(), signal.clone())
        .context("Failed to build HTTP client")?;
    let poller = Poller::new(db, fetcher, config.poll_settings(), signal);

    // Installed before either mode so a signal during --once also stops
    // in-flight fetches
    tokio::spawn(wait_for_shutdown(trigger));

    if args.once {
        let stats = poller.run_once().await.context("Failed to list due feeds")?;
        println!(
            "Polled {} feeds: {} succeeded, {} failed, {} new posts",
            stats.succeeded + stats.failed,
            stats.succeeded,
            stats.failed,
            stats.new_posts
        );
        return Ok(());
    }

    poller.run().await;

    Ok(())
}

/// Trigger shutdown on SIGINT or SIGTERM.
async fn wait_for_shutdown(trigger: ShutdownTrigger) {
    #[cfg(unix)]
    {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down gracefully"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Received Ctrl-C, shutting down gracefully");
    }

    trigger.trigger();
}
