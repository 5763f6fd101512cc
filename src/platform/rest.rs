//! REST implementation of [`PlatformApi`] over the platform's HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use super::{
    snowflake, snowflake_opt, ApiError, ApiResult, ForumChannel, ForumTag, Guild, Message,
    PlatformApi, ThreadSummary,
};
use crate::constants::{MAX_ARCHIVED_PAGES, MIRROR_USER_AGENT};

const API_BASE: &str = "https://discord.com/api/v10";

/// Channel type discriminator for forum channels.
const CHANNEL_TYPE_FORUM: u8 = 15;

/// Authenticated REST client.
pub struct RestClient {
    http: reqwest::Client,
    token: String,
}

impl RestClient {
    /// Build a client for the given bot token.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(token: &str) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            token: token.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ApiResult<T> {
        let url = format!("{API_BASE}{path}");
        trace!(url = %url, "Platform API request");

        let response = self
            .http
            .get(&url)
            .query(query)
            .header("Authorization", format!("Bot {}", self.token))
            .header("User-Agent", MIRROR_USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            #[derive(Deserialize)]
            struct RateLimitBody {
                retry_after: Option<f64>,
            }
            let retry_after_secs = response
                .json::<RateLimitBody>()
                .await
                .ok()
                .and_then(|b| b.retry_after);
            warn!(path, retry_after_secs, "Rate limited by platform API");
            return Err(ApiError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            return Err(ApiError::Http {
                status: status.as_u16(),
                endpoint: path.to_string(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Payload(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    #[serde(with = "snowflake")]
    id: i64,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    position: i64,
    #[serde(default)]
    available_tags: Vec<ForumTag>,
}

#[derive(Debug, Deserialize)]
struct RawThreadMetadata {
    #[serde(default)]
    archive_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RawThread {
    #[serde(with = "snowflake")]
    id: i64,
    #[serde(default, with = "snowflake_opt")]
    parent_id: Option<i64>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    applied_tags: Vec<String>,
    #[serde(default)]
    thread_metadata: Option<RawThreadMetadata>,
}

impl RawThread {
    fn into_summary(self) -> Option<ThreadSummary> {
        let parent_id = self.parent_id?;
        let applied_tag_ids = self
            .applied_tags
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        Some(ThreadSummary {
            id: self.id,
            parent_id,
            title: self.name,
            applied_tag_ids,
            archive_timestamp: self.thread_metadata.and_then(|m| m.archive_timestamp),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ThreadListResponse {
    #[serde(default)]
    threads: Vec<RawThread>,
    #[serde(default)]
    has_more: bool,
}

#[async_trait]
impl PlatformApi for RestClient {
    async fn list_guilds(&self) -> ApiResult<Vec<Guild>> {
        self.get_json("/users/@me/guilds", &[]).await
    }

    async fn list_forum_channels(&self, guild_id: i64) -> ApiResult<Vec<ForumChannel>> {
        let raw: Vec<RawChannel> = self
            .get_json(&format!("/guilds/{guild_id}/channels"), &[])
            .await?;
        Ok(raw
            .into_iter()
            .filter(|c| c.kind == CHANNEL_TYPE_FORUM)
            .map(|c| ForumChannel {
                id: c.id,
                guild_id,
                name: c.name.unwrap_or_default(),
                topic: c.topic,
                position: c.position,
                available_tags: c.available_tags,
            })
            .collect())
    }

    async fn list_active_threads(&self, guild_id: i64) -> ApiResult<Vec<ThreadSummary>> {
        let response: ThreadListResponse = self
            .get_json(&format!("/guilds/{guild_id}/threads/active"), &[])
            .await?;
        Ok(response
            .threads
            .into_iter()
            .filter_map(RawThread::into_summary)
            .collect())
    }

    async fn list_archived_threads(&self, channel_id: i64) -> ApiResult<Vec<ThreadSummary>> {
        let mut all = Vec::new();
        let mut before: Option<DateTime<Utc>> = None;

        for page in 0..MAX_ARCHIVED_PAGES {
            let mut query = vec![("limit", "100".to_string())];
            if let Some(ts) = before {
                query.push(("before", ts.to_rfc3339_opts(SecondsFormat::Millis, true)));
            }

            let response: ThreadListResponse = self
                .get_json(
                    &format!("/channels/{channel_id}/threads/archived/public"),
                    &query,
                )
                .await?;

            let batch: Vec<ThreadSummary> = response
                .threads
                .into_iter()
                .filter_map(RawThread::into_summary)
                .collect();

            before = batch.iter().filter_map(|t| t.archive_timestamp).min();
            let empty = batch.is_empty();
            all.extend(batch);

            if !response.has_more || empty || before.is_none() {
                break;
            }
            debug!(channel_id, page, total = all.len(), "Fetching more archived threads");
        }

        Ok(all)
    }

    async fn list_messages(
        &self,
        channel_id: i64,
        before: Option<i64>,
        limit: u8,
    ) -> ApiResult<Vec<Message>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(id) = before {
            query.push(("before", id.to_string()));
        }
        self.get_json(&format!("/channels/{channel_id}/messages"), &query)
            .await
    }

    async fn fetch_starter_message(&self, thread_id: i64) -> ApiResult<Option<Message>> {
        match self
            .get_json::<Message>(&format!("/channels/{thread_id}/messages/{thread_id}"), &[])
            .await
        {
            Ok(msg) => Ok(Some(msg)),
            Err(ApiError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the token.
        f.debug_struct("RestClient").finish_non_exhaustive()
    }
}
