use serde::{Deserialize, Serialize};

/// A mirrored forum channel.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Channel {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub position: i64,
    pub created_at: String,
}

/// A mirrored conversation. Carries its starter message inline as `body_html`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Thread {
    pub id: i64,
    pub channel_id: i64,
    pub slug: String,
    pub title: String,
    pub author_alias: String,
    pub body_html: String,
    /// JSON array of tag names, ordered as applied on the source platform.
    pub tags: String,
    pub reply_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Thread {
    /// Decode the stored tag list.
    #[must_use]
    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }
}

/// A reply within a thread.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: i64,
    pub thread_id: i64,
    pub author_alias: String,
    pub body_html: String,
    pub reply_to_id: Option<i64>,
    pub reply_to_author_alias: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Values for a thread upsert. `reply_count` is maintained separately.
#[derive(Debug, Clone)]
pub struct NewThread {
    pub id: i64,
    pub channel_id: i64,
    pub slug: String,
    pub title: String,
    pub author_alias: String,
    pub body_html: String,
    pub tags: Vec<String>,
    pub created_at: String,
}

/// Values for a post upsert.
#[derive(Debug, Clone)]
pub struct NewPost {
    pub id: i64,
    pub thread_id: i64,
    pub author_alias: String,
    pub body_html: String,
    pub reply_to_id: Option<i64>,
    pub reply_to_author_alias: Option<String>,
    pub created_at: String,
}

/// Public staff label attached to an identity hash.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StaffRole {
    pub user_id_hash: String,
    pub public_tag: String,
    pub added_by: Option<String>,
    pub added_at: String,
}

/// Persisted sync state, one row in `config` under `sync_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// ISO-8601 timestamp of the last successful orchestrator run.
    pub last_sync: String,
    /// 1 until the first full sync completes, then 0.
    pub is_first_run: u8,
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self {
            last_sync: "1970-01-01T00:00:00.000Z".to_string(),
            is_first_run: 1,
        }
    }
}

impl SyncCursor {
    #[must_use]
    pub fn is_first_run(&self) -> bool {
        self.is_first_run != 0
    }
}

/// Audit log action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// One append-only audit log row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub table_name: String,
    pub old_val: Option<String>,
    pub new_val: Option<String>,
    pub ts: String,
}

/// Kind of content sitting in the moderation queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationContentType {
    Thread,
    Post,
}

impl ModerationContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Post => "post",
        }
    }
}

/// A row awaiting (or past) moderation review.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ModerationItem {
    pub id: i64,
    pub content_type: String,
    pub content_id: i64,
    pub status: String,
    pub reason: Option<String>,
    pub flagged_at: String,
    pub reviewed_at: Option<String>,
    pub reviewed_by: Option<String>,
}
