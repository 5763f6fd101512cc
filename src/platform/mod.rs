//! Narrow interface to the source chat platform.
//!
//! The traversal and live layers only ever see these types and the
//! [`PlatformApi`] trait; swapping the REST implementation (or injecting a
//! mock in tests) never touches the reconciler.

pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

pub use rest::RestClient;

/// Milliseconds of the platform's snowflake epoch (2015-01-01T00:00:00Z).
const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

/// Extract the creation time embedded in a snowflake ID.
#[must_use]
pub fn snowflake_timestamp(id: i64) -> DateTime<Utc> {
    let ms = (id >> 22) + SNOWFLAKE_EPOCH_MS;
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limited by the platform (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<f64> },
    #[error("platform API returned HTTP {status} for {endpoint}")]
    Http { status: u16, endpoint: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected payload: {0}")]
    Payload(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// A top-level tenant on the source platform.
#[derive(Debug, Clone, Deserialize)]
pub struct Guild {
    #[serde(with = "snowflake")]
    pub id: i64,
    pub name: String,
}

/// A selectable tag defined on a forum channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ForumTag {
    #[serde(with = "snowflake")]
    pub id: i64,
    pub name: String,
}

/// A forum-type channel whose children are threads.
#[derive(Debug, Clone)]
pub struct ForumChannel {
    pub id: i64,
    pub guild_id: i64,
    pub name: String,
    pub topic: Option<String>,
    pub position: i64,
    pub available_tags: Vec<ForumTag>,
}

impl ForumChannel {
    /// Resolve applied tag IDs to their display names, preserving order.
    #[must_use]
    pub fn tag_names(&self, applied: &[i64]) -> Vec<String> {
        applied
            .iter()
            .filter_map(|id| {
                self.available_tags
                    .iter()
                    .find(|t| t.id == *id)
                    .map(|t| t.name.clone())
            })
            .collect()
    }
}

/// A thread as listed by the platform (active or archived).
#[derive(Debug, Clone)]
pub struct ThreadSummary {
    pub id: i64,
    pub parent_id: i64,
    pub title: String,
    pub applied_tag_ids: Vec<i64>,
    pub archive_timestamp: Option<DateTime<Utc>>,
}

impl ThreadSummary {
    /// Thread creation time, derived from its snowflake ID.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        snowflake_timestamp(self.id)
    }
}

/// Message author, reduced to what the mirror needs.
#[derive(Debug, Clone, Deserialize)]
pub struct Author {
    #[serde(with = "snowflake")]
    pub id: i64,
    #[serde(default)]
    pub bot: bool,
}

/// An attachment as reported by the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Reference to another message (a reply).
#[derive(Debug, Clone, Deserialize)]
pub struct MessageReference {
    #[serde(default, with = "snowflake_opt")]
    pub message_id: Option<i64>,
}

/// A message within a thread.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(with = "snowflake")]
    pub id: i64,
    #[serde(with = "snowflake")]
    pub channel_id: i64,
    pub author: Author,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub edited_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, rename = "message_reference")]
    pub reference: Option<MessageReference>,
}

impl Message {
    /// The referenced message ID, if this message is a reply.
    #[must_use]
    pub fn referenced_id(&self) -> Option<i64> {
        self.reference.as_ref().and_then(|r| r.message_id)
    }
}

/// A push event from the platform's gateway.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    MessageCreate(Message),
    MessageUpdate(Message),
    MessageDelete { channel_id: i64, message_id: i64 },
    ThreadCreate(ThreadSummary),
    ThreadUpdate(ThreadSummary),
    ThreadDelete { thread_id: i64 },
}

/// REST surface of the platform, as much of it as the mirror needs.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Guilds visible to the credential.
    async fn list_guilds(&self) -> ApiResult<Vec<Guild>>;

    /// Forum-type channels in a guild.
    async fn list_forum_channels(&self, guild_id: i64) -> ApiResult<Vec<ForumChannel>>;

    /// Currently active threads across a guild.
    async fn list_active_threads(&self, guild_id: i64) -> ApiResult<Vec<ThreadSummary>>;

    /// Public archived threads under a channel, newest-archived first.
    async fn list_archived_threads(&self, channel_id: i64) -> ApiResult<Vec<ThreadSummary>>;

    /// One page of messages, newest first, optionally strictly before the
    /// given message ID.
    async fn list_messages(
        &self,
        channel_id: i64,
        before: Option<i64>,
        limit: u8,
    ) -> ApiResult<Vec<Message>>;

    /// A thread's starter message, if it still exists.
    async fn fetch_starter_message(&self, thread_id: i64) -> ApiResult<Option<Message>>;
}

pub(crate) mod snowflake {
    use serde::{Deserialize, Deserializer};

    /// Snowflake IDs cross the wire as strings to survive JSON number
    /// precision limits; decode either representation.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(i64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Num(n) => Ok(n),
        }
    }
}

pub(crate) mod snowflake_opt {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(i64),
        }
        let raw: Option<Raw> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(Raw::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
            Some(Raw::Num(n)) => Ok(Some(n)),
        }
    }
}
