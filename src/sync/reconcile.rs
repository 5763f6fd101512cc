//! Per-entity reconciliation: normalized writes for threads and posts.
//!
//! A thread's starter message is stored twice on purpose: inline on the
//! thread row (`body_html`) and as a post row under its own ID, so replies to
//! the starter can satisfy the posts self-reference. The maintained
//! `reply_count` therefore excludes the starter row.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::SecondsFormat;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::{
    count_posts, find_post, find_thread, find_thread_by_slug, flag_content, get_staff_role,
    set_post_reply, set_thread_reply_count, upsert_post, upsert_thread, Database,
    ModerationContentType, NewPost, NewThread,
};
use crate::hasher::IdentityHasher;
use crate::media::MediaPipeline;
use crate::platform::{Message, ThreadSummary};
use crate::sanitize::{sanitize, Sanitized};
use crate::slug::{collision_suffix, slugify};

/// Outcome of reconciling one thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadStats {
    pub posts: usize,
    pub errors: usize,
    /// True when the thread was skipped entirely (bot starter, no starter).
    pub skipped: bool,
}

/// Produces normalized writes for observed threads and posts.
///
/// Shared by the sync orchestrator and the live event handler; both surfaces
/// get the same idempotent semantics.
pub struct Reconciler {
    db: Database,
    hasher: IdentityHasher,
    media: Option<Arc<MediaPipeline>>,
    actor: String,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        db: Database,
        hasher: IdentityHasher,
        media: Option<Arc<MediaPipeline>>,
        actor: &str,
    ) -> Self {
        Self {
            db,
            hasher,
            media,
            actor: actor.to_string(),
        }
    }

    /// Public alias for an author, decorated with a staff tag when one exists.
    pub async fn author_alias(&self, user_id: i64) -> Result<String> {
        let alias = self.hasher.alias(user_id);
        match get_staff_role(self.db.pool(), &alias).await? {
            Some(role) => Ok(format!("{}:{}", &alias[..8], role.public_tag)),
            None => Ok(alias),
        }
    }

    /// Sanitize a message and append its mirrored images.
    pub async fn render_body(
        &self,
        msg: &Message,
        cancel: &CancellationToken,
    ) -> (String, Sanitized) {
        let sanitized = sanitize(&msg.content);
        let mut html = sanitized.html.clone();

        if let Some(media) = &self.media {
            let images = media.process_attachments(&msg.attachments, cancel).await;
            if !images.is_empty() {
                let tags: Vec<String> = images
                    .iter()
                    .map(|img| {
                        format!(
                            r#"<img src="{}" width="{}" height="{}">"#,
                            img.url, img.width, img.height
                        )
                    })
                    .collect();
                if html.is_empty() {
                    html = tags.join("<br>");
                } else {
                    html = format!("{html}<br>{}", tags.join("<br>"));
                }
            }
        }

        (html, sanitized)
    }

    /// Reconcile a thread from its starter and in-thread messages.
    ///
    /// `tags` carries resolved tag names when the caller knows them (the sync
    /// traversal does); `None` preserves whatever the store already has.
    /// Messages are applied in chronological order; a second pass repairs
    /// reply references that could not resolve on first sight.
    pub async fn reconcile_thread(
        &self,
        channel_id: i64,
        tags: Option<Vec<String>>,
        summary: &ThreadSummary,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<ThreadStats> {
        let mut stats = ThreadStats::default();

        let Some(starter) = messages.iter().find(|m| m.id == summary.id) else {
            bail!("thread {} has no starter message", summary.id);
        };
        if starter.author.bot {
            debug!(thread_id = summary.id, "Skipping bot-started thread");
            stats.skipped = true;
            return Ok(stats);
        }

        let author_alias = self.author_alias(starter.author.id).await?;
        let (body_html, sanitized) = self.render_body(starter, cancel).await;
        let slug = self.unique_slug(&summary.title, summary.id).await?;
        let created_at = summary
            .created_at()
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        let tags = match tags {
            Some(tags) => tags,
            None => match find_thread(self.db.pool(), summary.id).await? {
                Some(existing) => existing.tag_list(),
                None => Vec::new(),
            },
        };

        let mut new_thread = NewThread {
            id: summary.id,
            channel_id,
            slug,
            title: summary.title.clone(),
            author_alias: author_alias.clone(),
            body_html: body_html.clone(),
            tags,
            created_at,
        };
        if let Err(e) = upsert_thread(self.db.pool(), &self.actor, &new_thread).await {
            // Threads reconcile in parallel, so two identical titles can both
            // pass the slug pre-check and race on the unique constraint.
            if !is_unique_violation(&e) {
                return Err(e);
            }
            let mut base = new_thread.slug;
            base.truncate(248);
            new_thread.slug = format!("{base}-{}", collision_suffix(summary.id));
            upsert_thread(self.db.pool(), &self.actor, &new_thread).await?;
        }

        if sanitized.had_script || sanitized.redacted_pii {
            flag_content(
                self.db.pool(),
                ModerationContentType::Thread,
                summary.id,
                flag_reason(&sanitized),
            )
            .await?;
        }

        // The starter also lives in posts so replies can reference it.
        upsert_post(
            self.db.pool(),
            &self.actor,
            &NewPost {
                id: starter.id,
                thread_id: summary.id,
                author_alias,
                body_html,
                reply_to_id: None,
                reply_to_author_alias: None,
                created_at: starter
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        )
        .await?;

        // First pass: replies in chronological order.
        let mut replies: Vec<&Message> = messages
            .iter()
            .filter(|m| m.id != summary.id && !m.author.bot)
            .collect();
        replies.sort_by_key(|m| (m.timestamp, m.id));

        // No cancellation check here: whatever traversal handed over is
        // in-flight work, and in-flight writes flush before shutdown.
        let mut unresolved: Vec<(i64, i64)> = Vec::new();
        for msg in replies {
            match self.reconcile_post(summary.id, msg, cancel).await {
                Ok(Some(ref_id)) => {
                    stats.posts += 1;
                    unresolved.push((msg.id, ref_id));
                }
                Ok(None) => stats.posts += 1,
                Err(e) => {
                    warn!(message_id = msg.id, "Failed to reconcile post: {e:#}");
                    stats.errors += 1;
                }
            }
        }

        // Second pass: referents that arrived after their referrers.
        for (post_id, ref_id) in unresolved {
            if let Some(referent) = find_post(self.db.pool(), ref_id).await? {
                set_post_reply(
                    self.db.pool(),
                    &self.actor,
                    post_id,
                    ref_id,
                    &referent.author_alias,
                )
                .await?;
            }
        }

        self.refresh_reply_count(summary.id).await?;
        Ok(stats)
    }

    /// Reconcile a single reply message into its thread.
    ///
    /// Returns the referenced message ID when the reference could not be
    /// resolved yet (the referent may arrive later).
    pub async fn reconcile_post(
        &self,
        thread_id: i64,
        msg: &Message,
        cancel: &CancellationToken,
    ) -> Result<Option<i64>> {
        let author_alias = self.author_alias(msg.author.id).await?;

        let mut unresolved = None;
        let (reply_to_id, reply_to_author_alias) = match msg.referenced_id() {
            Some(ref_id) => match find_post(self.db.pool(), ref_id).await? {
                Some(referent) => (Some(ref_id), Some(referent.author_alias)),
                None => {
                    unresolved = Some(ref_id);
                    (None, None)
                }
            },
            None => (None, None),
        };

        let (body_html, sanitized) = self.render_body(msg, cancel).await;

        upsert_post(
            self.db.pool(),
            &self.actor,
            &NewPost {
                id: msg.id,
                thread_id,
                author_alias,
                body_html,
                reply_to_id,
                reply_to_author_alias,
                created_at: msg.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            },
        )
        .await?;

        if sanitized.had_script || sanitized.redacted_pii {
            flag_content(
                self.db.pool(),
                ModerationContentType::Post,
                msg.id,
                flag_reason(&sanitized),
            )
            .await?;
        }

        Ok(unresolved)
    }

    /// Recompute and store a thread's reply count (starter excluded).
    pub async fn refresh_reply_count(&self, thread_id: i64) -> Result<i64> {
        let count = (count_posts(self.db.pool(), thread_id).await? - 1).max(0);
        set_thread_reply_count(self.db.pool(), thread_id, count).await?;
        Ok(count)
    }

    /// Slugify a title, falling back to the thread ID for titles that slugify
    /// to nothing and appending a short hash when a different thread already
    /// owns the slug.
    async fn unique_slug(&self, title: &str, thread_id: i64) -> Result<String> {
        let mut slug = slugify(title);
        if slug.is_empty() {
            slug = thread_id.to_string();
        }

        match find_thread_by_slug(self.db.pool(), &slug).await? {
            Some(owner) if owner.id != thread_id => {
                let mut base = slug;
                base.truncate(248);
                Ok(format!("{base}-{}", collision_suffix(thread_id)))
            }
            _ => Ok(slug),
        }
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<sqlx::Error>(),
            Some(sqlx::Error::Database(db)) if db.is_unique_violation()
        )
    })
}

fn flag_reason(sanitized: &Sanitized) -> &'static str {
    match (sanitized.had_script, sanitized.redacted_pii) {
        (true, true) => "script tag and PII redacted during sanitization",
        (true, false) => "script tag removed during sanitization",
        _ => "PII redacted during sanitization",
    }
}
