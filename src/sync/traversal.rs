//! Rate-aware traversal of guilds, forum channels, threads, and messages.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::constants::{MESSAGE_PAGE_SIZE, PAGE_SLEEP_MS};
use crate::platform::{ApiResult, ForumChannel, Message, PlatformApi, ThreadSummary};

/// How a sync run selects threads and messages.
#[derive(Debug, Clone, Copy)]
pub enum SyncMode {
    /// Everything: all archived threads, all messages.
    Full,
    /// Only threads and messages newer than the cursor watermark.
    Delta { since: DateTime<Utc> },
}

impl SyncMode {
    #[must_use]
    pub fn is_full(self) -> bool {
        matches!(self, Self::Full)
    }
}

/// Optional narrowing of a sync run (CLI overrides).
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncScope {
    pub guild: Option<i64>,
    pub channel: Option<i64>,
    pub thread: Option<i64>,
}

/// Collect the threads to visit under one forum channel: active threads
/// first, then public archived threads, unioned by ID with the archived
/// listing winning.
///
/// Active threads are always visited; a reply can land in an old thread at
/// any time, and delta message pagination makes quiet threads cheap. The
/// archived listing is the one filtered by the watermark — only threads
/// created or archived after it are re-walked.
pub async fn collect_threads(
    api: &dyn PlatformApi,
    guild_id: i64,
    channel: &ForumChannel,
    mode: SyncMode,
    scope: SyncScope,
) -> ApiResult<Vec<ThreadSummary>> {
    let mut by_id: HashMap<i64, ThreadSummary> = HashMap::new();

    for thread in api.list_active_threads(guild_id).await? {
        if thread.parent_id == channel.id {
            by_id.insert(thread.id, thread);
        }
    }
    for thread in api.list_archived_threads(channel.id).await? {
        let keep = match mode {
            SyncMode::Full => true,
            SyncMode::Delta { since } => {
                thread.created_at() > since
                    || thread.archive_timestamp.is_some_and(|ts| ts > since)
            }
        };
        if keep {
            by_id.insert(thread.id, thread);
        }
    }

    let mut threads: Vec<ThreadSummary> = by_id
        .into_values()
        .filter(|t| scope.thread.is_none_or(|id| t.id == id))
        .collect();

    // Oldest first so a capped run mirrors history front-to-back.
    threads.sort_by_key(|t| t.id);
    debug!(
        channel_id = channel.id,
        count = threads.len(),
        "Collected threads for channel"
    );
    Ok(threads)
}

/// Fetch a thread's messages, paging backwards 100 at a time until an empty
/// page (or, in delta mode, a page entirely at-or-before the watermark).
///
/// Returns messages in chronological ascending order with the starter
/// guaranteed present when it still exists. Checks the cancellation token
/// before each page; partial results are safe because downstream writes are
/// idempotent.
pub async fn fetch_thread_messages(
    api: &dyn PlatformApi,
    thread_id: i64,
    mode: SyncMode,
    cancel: &CancellationToken,
) -> ApiResult<Vec<Message>> {
    let mut by_id: HashMap<i64, Message> = HashMap::new();
    let mut before: Option<i64> = None;

    loop {
        if cancel.is_cancelled() {
            debug!(thread_id, "Cancellation requested, stopping pagination");
            break;
        }

        let page = api
            .list_messages(thread_id, before, MESSAGE_PAGE_SIZE)
            .await?;
        if page.is_empty() {
            trace!(thread_id, "Empty page, pagination complete");
            break;
        }

        // Pages arrive newest first.
        let oldest_id = page.iter().map(|m| m.id).min();
        let newest_ts = page.iter().map(|m| m.timestamp).max();
        for msg in page {
            by_id.insert(msg.id, msg);
        }
        before = oldest_id;

        if let SyncMode::Delta { since } = mode {
            if newest_ts.is_some_and(|ts| ts <= since) {
                trace!(thread_id, "Page entirely before watermark, stopping");
                break;
            }
        }

        tokio::time::sleep(Duration::from_millis(PAGE_SLEEP_MS)).await;
    }

    // The starter can fall outside the fetched window in delta mode.
    if !by_id.contains_key(&thread_id) {
        if let Some(starter) = api.fetch_starter_message(thread_id).await? {
            by_id.insert(starter.id, starter);
        }
    }

    let mut messages: Vec<Message> = by_id.into_values().collect();
    messages.sort_by_key(|m| (m.timestamp, m.id));
    Ok(messages)
}
