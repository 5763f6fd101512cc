//! Shared fixtures: an in-memory platform mock and object store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use discord_forum_mirror::db::Database;
use discord_forum_mirror::hasher::IdentityHasher;
use discord_forum_mirror::media::ObjectStore;
use discord_forum_mirror::platform::{
    ApiError, ApiResult, Author, ForumChannel, ForumTag, Guild, Message, MessageReference,
    PlatformApi, ThreadSummary,
};
use tempfile::TempDir;

pub const TEST_PEPPER: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Build a snowflake whose embedded creation time is `ts`.
pub fn snowflake_at(ts: DateTime<Utc>) -> i64 {
    (ts.timestamp_millis() - SNOWFLAKE_EPOCH_MS) << 22
}

/// A fixed, convenient base time for fixtures.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

pub fn test_hasher() -> IdentityHasher {
    IdentityHasher::from_hex_pepper(TEST_PEPPER).expect("test pepper")
}

pub fn guild(id: i64, name: &str) -> Guild {
    Guild {
        id,
        name: name.to_string(),
    }
}

pub fn forum_channel(id: i64, guild_id: i64, name: &str) -> ForumChannel {
    ForumChannel {
        id,
        guild_id,
        name: name.to_string(),
        topic: None,
        position: 0,
        available_tags: vec![
            ForumTag {
                id: 11,
                name: "help".to_string(),
            },
            ForumTag {
                id: 12,
                name: "solved".to_string(),
            },
        ],
    }
}

pub fn thread_summary(id: i64, parent_id: i64, title: &str) -> ThreadSummary {
    ThreadSummary {
        id,
        parent_id,
        title: title.to_string(),
        applied_tag_ids: Vec::new(),
        archive_timestamp: None,
    }
}

pub fn message(
    id: i64,
    channel_id: i64,
    author_id: i64,
    content: &str,
    ts: DateTime<Utc>,
    reply_to: Option<i64>,
) -> Message {
    Message {
        id,
        channel_id,
        author: Author {
            id: author_id,
            bot: false,
        },
        content: content.to_string(),
        timestamp: ts,
        edited_timestamp: None,
        attachments: Vec::new(),
        reference: reply_to.map(|message_id| MessageReference {
            message_id: Some(message_id),
        }),
    }
}

pub fn bot_message(id: i64, channel_id: i64, content: &str, ts: DateTime<Utc>) -> Message {
    Message {
        author: Author {
            id: 999_000_999_000_999_000,
            bot: true,
        },
        ..message(id, channel_id, 0, content, ts, None)
    }
}

/// In-memory platform backing one or more mocked guilds.
#[derive(Default)]
pub struct MockPlatform {
    pub guilds: Vec<Guild>,
    pub channels: Vec<ForumChannel>,
    pub active_threads: Mutex<Vec<ThreadSummary>>,
    pub archived_threads: Mutex<Vec<ThreadSummary>>,
    /// thread_id -> messages, any order; pagination sorts.
    pub messages: Mutex<HashMap<i64, Vec<Message>>>,
    /// Total message pages served, across all threads.
    pub pages_served: AtomicUsize,
    /// Cancel this token once the first message page has been served.
    pub cancel_after_first_page: Mutex<Option<CancellationToken>>,
    /// Fail `list_guilds` with a transport-level error.
    pub fail_guilds: AtomicBool,
    /// Respond 429 to archived-thread listings for this channel.
    pub rate_limited_channel: Mutex<Option<i64>>,
}

impl MockPlatform {
    pub fn add_thread(&self, summary: ThreadSummary, messages: Vec<Message>) {
        self.active_threads.lock().unwrap().push(summary.clone());
        self.messages.lock().unwrap().insert(summary.id, messages);
    }

    pub fn push_message(&self, thread_id: i64, msg: Message) {
        self.messages
            .lock()
            .unwrap()
            .entry(thread_id)
            .or_default()
            .push(msg);
    }
}

#[async_trait]
impl PlatformApi for MockPlatform {
    async fn list_guilds(&self) -> ApiResult<Vec<Guild>> {
        if self.fail_guilds.load(Ordering::SeqCst) {
            return Err(ApiError::Http {
                status: 503,
                endpoint: "/users/@me/guilds".to_string(),
            });
        }
        Ok(self.guilds.clone())
    }

    async fn list_forum_channels(&self, guild_id: i64) -> ApiResult<Vec<ForumChannel>> {
        Ok(self
            .channels
            .iter()
            .filter(|c| c.guild_id == guild_id)
            .cloned()
            .collect())
    }

    async fn list_active_threads(&self, _guild_id: i64) -> ApiResult<Vec<ThreadSummary>> {
        Ok(self.active_threads.lock().unwrap().clone())
    }

    async fn list_archived_threads(&self, channel_id: i64) -> ApiResult<Vec<ThreadSummary>> {
        if *self.rate_limited_channel.lock().unwrap() == Some(channel_id) {
            return Err(ApiError::RateLimited {
                retry_after_secs: Some(1.5),
            });
        }
        Ok(self
            .archived_threads
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.parent_id == channel_id)
            .cloned()
            .collect())
    }

    async fn list_messages(
        &self,
        channel_id: i64,
        before: Option<i64>,
        limit: u8,
    ) -> ApiResult<Vec<Message>> {
        let mut msgs: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .get(&channel_id)
            .cloned()
            .unwrap_or_default();

        // Newest first, like the real API.
        msgs.sort_by_key(|m| std::cmp::Reverse((m.timestamp, m.id)));
        let page: Vec<Message> = msgs
            .into_iter()
            .filter(|m| before.is_none_or(|b| m.id < b))
            .take(limit as usize)
            .collect();

        self.pages_served.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.cancel_after_first_page.lock().unwrap().as_ref() {
            token.cancel();
        }

        Ok(page)
    }

    async fn fetch_starter_message(&self, thread_id: i64) -> ApiResult<Option<Message>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .get(&thread_id)
            .and_then(|msgs| msgs.iter().find(|m| m.id == thread_id).cloned()))
    }
}

/// In-memory [`ObjectStore`] capturing every upload.
#[derive(Default)]
pub struct MemoryStore {
    pub objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: &[u8],
        content_type: &str,
        _original_filename: &str,
    ) -> Result<()> {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            (bytes.to_vec(), content_type.to_string()),
        );
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("https://test-bucket.s3.us-east-1.amazonaws.com/{key}")
    }
}
