//! Top-level sync orchestration: mode selection, traversal, cursor state.

mod reconcile;
mod traversal;

pub use reconcile::{Reconciler, ThreadStats};
pub use traversal::{collect_threads, fetch_thread_messages, SyncMode, SyncScope};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::RECONCILE_CONCURRENCY;
use crate::db::{self, find_thread, get_cursor, now_iso, set_cursor, Channel, Database};
use crate::platform::{snowflake_timestamp, ApiError, PlatformApi};
use crate::slug::slugify;

/// Options for one orchestrator run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Ignore the cursor and re-walk everything.
    pub force_full: bool,
    /// Narrow the run to a guild/channel/thread.
    pub scope: SyncScope,
    /// Cap on threads processed across the whole run.
    pub limit: Option<usize>,
    /// Skip threads that already have a row in the store.
    pub skip_existing: bool,
}

/// Aggregate counters for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub guilds: usize,
    pub channels: usize,
    pub threads: usize,
    pub posts: usize,
    pub errors: usize,
}

/// Drives full or delta synchronization runs.
pub struct Orchestrator {
    db: Database,
    api: Arc<dyn PlatformApi>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        db: Database,
        api: Arc<dyn PlatformApi>,
        reconciler: Arc<Reconciler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            api,
            reconciler,
            cancel,
        }
    }

    /// Run one sync. Reads the cursor to pick full or delta mode, walks the
    /// platform, and advances the cursor only on a clean, uncancelled return.
    ///
    /// Per-entity failures are counted in the stats; only orchestrator-level
    /// failures (connectivity, auth, store) propagate as errors, leaving the
    /// cursor untouched so the next run retries the same window.
    ///
    /// # Errors
    ///
    /// Returns an error on orchestrator-level failure.
    pub async fn run(&self, options: &SyncOptions) -> Result<SyncStats> {
        let cursor = get_cursor(self.db.pool()).await?;
        let mode = if options.force_full || cursor.is_first_run() {
            SyncMode::Full
        } else {
            let since: DateTime<Utc> = cursor
                .last_sync
                .parse()
                .with_context(|| format!("Invalid cursor timestamp {:?}", cursor.last_sync))?;
            SyncMode::Delta { since }
        };

        // Captured before traversal so events arriving mid-run stay after the
        // watermark and are re-fetched next time.
        let start_ts = now_iso();
        info!(
            full = mode.is_full(),
            first_run = cursor.is_first_run(),
            "Starting sync run"
        );

        let mut stats = SyncStats::default();
        let mut budget = options.limit;

        let guilds = self
            .api
            .list_guilds()
            .await
            .context("Failed to list guilds")?;

        for guild in guilds {
            if options.scope.guild.is_some_and(|id| id != guild.id) {
                continue;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            stats.guilds += 1;

            let channels = self
                .api
                .list_forum_channels(guild.id)
                .await
                .with_context(|| format!("Failed to list channels for guild {}", guild.id))?;

            for channel in channels {
                if options.scope.channel.is_some_and(|id| id != channel.id) {
                    continue;
                }
                if self.cancel.is_cancelled() {
                    break;
                }
                if budget == Some(0) {
                    break;
                }

                match self
                    .sync_channel(guild.id, &channel, mode, options, &mut budget)
                    .await
                {
                    Ok(channel_stats) => {
                        stats.channels += 1;
                        stats.threads += channel_stats.threads;
                        stats.posts += channel_stats.posts;
                        stats.errors += channel_stats.errors;
                    }
                    Err(e) if is_rate_limit(&e) => {
                        // Abort this channel, move on; the cursor stays put on
                        // failure so nothing is lost.
                        warn!(channel_id = channel.id, "Rate limited, aborting channel");
                        stats.errors += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            guilds = stats.guilds,
            channels = stats.channels,
            threads = stats.threads,
            posts = stats.posts,
            errors = stats.errors,
            "Sync run complete"
        );

        if self.cancel.is_cancelled() {
            info!("Run was cancelled; cursor left unchanged");
            return Ok(stats);
        }

        set_cursor(self.db.pool(), &start_ts).await?;
        Ok(stats)
    }

    async fn sync_channel(
        &self,
        guild_id: i64,
        channel: &crate::platform::ForumChannel,
        mode: SyncMode,
        options: &SyncOptions,
        budget: &mut Option<usize>,
    ) -> Result<SyncStats> {
        let mut stats = SyncStats::default();

        db::upsert_channel(
            self.db.pool(),
            "sync",
            &Channel {
                id: channel.id,
                slug: slugify(&channel.name),
                name: channel.name.clone(),
                description: channel.topic.clone(),
                position: channel.position,
                created_at: snowflake_timestamp(channel.id)
                    .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            },
        )
        .await?;

        let mut threads = collect_threads(self.api.as_ref(), guild_id, channel, mode, options.scope)
            .await
            .map_err(anyhow::Error::from)?;

        if options.skip_existing {
            let mut fresh = Vec::with_capacity(threads.len());
            for thread in threads {
                if find_thread(self.db.pool(), thread.id).await?.is_none() {
                    fresh.push(thread);
                }
            }
            threads = fresh;
        }
        if let Some(remaining) = budget {
            threads.truncate(*remaining);
            *remaining -= threads.len();
        }

        // Threads fan out up to the worker bound; messages inside one thread
        // always stay sequential so deferred-reference repair is not racy.
        let semaphore = Arc::new(Semaphore::new(RECONCILE_CONCURRENCY));
        let mut handles = Vec::new();

        for summary in threads {
            if self.cancel.is_cancelled() {
                break;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("Reconcile semaphore closed")?;
            let api = Arc::clone(&self.api);
            let reconciler = Arc::clone(&self.reconciler);
            let cancel = self.cancel.clone();
            let channel = channel.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                let tags = channel.tag_names(&summary.applied_tag_ids);

                let messages =
                    match fetch_thread_messages(api.as_ref(), summary.id, mode, &cancel).await {
                        Ok(messages) => messages,
                        Err(e) => {
                            warn!(thread_id = summary.id, "Failed to fetch messages: {e:#}");
                            return ThreadStats {
                                errors: 1,
                                ..ThreadStats::default()
                            };
                        }
                    };

                match reconciler
                    .reconcile_thread(channel.id, Some(tags), &summary, &messages, &cancel)
                    .await
                {
                    Ok(thread_stats) => thread_stats,
                    Err(e) => {
                        warn!(thread_id = summary.id, "Failed to reconcile thread: {e:#}");
                        ThreadStats {
                            errors: 1,
                            ..ThreadStats::default()
                        }
                    }
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            match handle.await {
                Ok(thread_stats) => {
                    if !thread_stats.skipped {
                        stats.threads += 1;
                    }
                    stats.posts += thread_stats.posts;
                    stats.errors += thread_stats.errors;
                }
                Err(e) => {
                    error!("Thread reconcile task panicked: {e}");
                    stats.errors += 1;
                }
            }
        }

        Ok(stats)
    }
}

fn is_rate_limit(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::RateLimited { .. })
    )
}

/// Periodic delta sync for watch mode.
///
/// Backs off toward a capped interval while runs keep coming back empty.
pub async fn poll_loop(
    orchestrator: Arc<Orchestrator>,
    base_interval: Duration,
    cancel: CancellationToken,
) {
    let max_interval = base_interval * 4;
    let mut consecutive_empty = 0u32;

    loop {
        match orchestrator.run(&SyncOptions::default()).await {
            Ok(stats) => {
                if stats.posts > 0 || stats.threads > 0 {
                    consecutive_empty = 0;
                } else {
                    consecutive_empty = consecutive_empty.saturating_add(1);
                    debug!(consecutive_empty, "Delta sync found nothing new");
                }
            }
            Err(e) => {
                error!("Delta sync failed: {e:#}");
                consecutive_empty = consecutive_empty.saturating_add(1);
            }
        }

        let interval = if consecutive_empty > 10 {
            max_interval
        } else if consecutive_empty > 5 {
            base_interval * 2
        } else {
            base_interval
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
