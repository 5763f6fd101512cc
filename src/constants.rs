//! Shared constants used across the application.

/// User agent string sent with platform API and attachment requests.
pub const MIRROR_USER_AGENT: &str =
    "discord-forum-mirror (https://github.com/forum-mirror/discord-forum-mirror, 0.3)";

/// Messages fetched per page when walking a thread's history.
pub const MESSAGE_PAGE_SIZE: u8 = 100;

/// Cooperative pause between message pages, in milliseconds.
pub const PAGE_SLEEP_MS: u64 = 100;

/// Archived-thread pages fetched per channel before giving up.
///
/// The platform caps archived listings at 100 threads per page; this bound
/// only exists to stop a runaway loop on a pathological channel.
pub const MAX_ARCHIVED_PAGES: u32 = 100;

/// Threads reconciled in parallel. Message order inside one thread is always
/// sequential; this only fans out across independent threads.
pub const RECONCILE_CONCURRENCY: usize = 4;

/// Database connection pool size.
pub const DB_POOL_SIZE: u32 = 10;

/// Key in the `config` table that holds the sync cursor.
pub const SYNC_STATE_KEY: &str = "sync_state";
