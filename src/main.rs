use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use discord_forum_mirror::config::{Config, RunMode};
use discord_forum_mirror::db::Database;
use discord_forum_mirror::hasher::IdentityHasher;
use discord_forum_mirror::live::{run_event_loop, LiveHandler};
use discord_forum_mirror::media::MediaPipeline;
use discord_forum_mirror::platform::{PlatformApi, PlatformEvent, RestClient};
use discord_forum_mirror::s3::S3Store;
use discord_forum_mirror::staff::import_staff_csv;
use discord_forum_mirror::sync::{poll_loop, Orchestrator, Reconciler, SyncOptions, SyncScope};

#[derive(Parser)]
#[command(author, version, about = "Mirror Discord forum channels into a relational store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one synchronization pass and exit.
    Sync {
        /// Limit the run to one guild.
        #[arg(long)]
        guild: Option<i64>,
        /// Limit the run to one forum channel.
        #[arg(long)]
        channel: Option<i64>,
        /// Limit the run to one thread.
        #[arg(long)]
        thread: Option<i64>,
        /// Cap the number of threads processed.
        #[arg(long)]
        limit: Option<usize>,
        /// Skip threads that are already mirrored.
        #[arg(long)]
        skip_existing: bool,
        /// Platform credential, overriding DISCORD_TOKEN.
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // Bad flags print usage and exit 1 rather than clap's default 2.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli).await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting discord-forum-mirror");

    if let Some(Command::Sync {
        token: Some(token), ..
    }) = &cli.command
    {
        std::env::set_var("DISCORD_TOKEN", token);
    }

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let hasher = IdentityHasher::from_hex_pepper(&config.pii_pepper)
        .context("PII_PEPPER is not a usable pepper")?;

    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized");

    let media = match &config.s3_bucket {
        Some(bucket) => {
            let store = S3Store::new(bucket, &config.s3_region)
                .await
                .context("Failed to initialize S3 store")?;
            info!(bucket = %bucket, region = %config.s3_region, "Attachment mirroring enabled");
            Some(Arc::new(
                MediaPipeline::new(
                    Arc::new(store),
                    config.image_max_mb,
                    config.image_max_w,
                    config.image_max_h,
                )
                .context("Failed to build media pipeline")?,
            ))
        }
        None => {
            info!("S3_BUCKET not set, attachment mirroring disabled");
            None
        }
    };

    if let Some(path) = &config.staff_csv_path {
        if let Err(e) = import_staff_csv(&db, &hasher, path).await {
            warn!("Staff CSV import failed: {e:#}");
        }
    }

    let api: Arc<dyn PlatformApi> =
        Arc::new(RestClient::new(&config.discord_token).context("Failed to build REST client")?);

    let cancel = CancellationToken::new();
    let reconciler = Arc::new(Reconciler::new(
        db.clone(),
        hasher.clone(),
        media.clone(),
        "sync",
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        db.clone(),
        Arc::clone(&api),
        Arc::clone(&reconciler),
        cancel.clone(),
    ));

    // Cancel in-flight work on SIGINT/SIGTERM; the current page completes,
    // writes flush, and the cursor stays untouched.
    tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

    // Explicit `sync` invocation: one pass, exit code reflects the outcome.
    if let Some(Command::Sync {
        guild,
        channel,
        thread,
        limit,
        skip_existing,
        ..
    }) = cli.command
    {
        let options = SyncOptions {
            force_full: config.force_full_sync,
            scope: SyncScope {
                guild,
                channel,
                thread,
            },
            limit,
            skip_existing,
        };
        let stats = orchestrator.run(&options).await?;
        info!(
            threads = stats.threads,
            posts = stats.posts,
            errors = stats.errors,
            "Sync finished"
        );
        return Ok(());
    }

    // Service mode: optional startup sync, then watch or exit per RUN_MODE.
    if config.enable_historical_sync {
        let options = SyncOptions {
            force_full: config.force_full_sync,
            ..SyncOptions::default()
        };
        match orchestrator.run(&options).await {
            Ok(stats) => info!(
                threads = stats.threads,
                posts = stats.posts,
                errors = stats.errors,
                "Startup sync finished"
            ),
            Err(e) => error!("Startup sync failed: {e:#}"),
        }
    }

    if config.exit_after_sync || config.run_mode == RunMode::Once {
        info!("Run mode is once, exiting");
        return Ok(());
    }

    // Watch mode: periodic delta sync plus the live event loop. A gateway
    // integration clones `gateway_tx` and feeds push events into it.
    let (gateway_tx, gateway_rx) = mpsc::channel::<PlatformEvent>(256);

    let live = LiveHandler::new(
        db.clone(),
        Arc::clone(&api),
        Arc::new(Reconciler::new(db, hasher, media, "live")),
        cancel.clone(),
    );
    let live_handle = tokio::spawn(run_event_loop(live, gateway_rx));

    let poll_handle = tokio::spawn(poll_loop(
        Arc::clone(&orchestrator),
        config.poll_interval,
        cancel.clone(),
    ));

    cancel.cancelled().await;
    drop(gateway_tx);

    info!("Shutting down...");
    let _ = poll_handle.await;
    let _ = live_handle.await;
    info!("Shutdown complete");

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,discord_forum_mirror=debug"));

    // LOG_FORMAT=json switches to structured output for production.
    let json = std::env::var("LOG_FORMAT")
        .is_ok_and(|v| v.eq_ignore_ascii_case("json") || v.eq_ignore_ascii_case("structured"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    Ok(())
}

/// Wait for SIGINT or SIGTERM, then fire the cancellation token. Everything
/// holding a child of this token winds down cooperatively.
async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {e}");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    cancel.cancel();
}
