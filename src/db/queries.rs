use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use sqlx::{Executor, Sqlite, SqlitePool};

use super::models::{
    AuditAction, AuditEvent, Channel, ModerationContentType, ModerationItem, NewPost, NewThread,
    Post, StaffRole, SyncCursor, Thread,
};
use crate::constants::SYNC_STATE_KEY;

/// Current wall-clock time in the store's timestamp format.
#[must_use]
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

async fn append_audit<'a, E>(
    exec: E,
    actor: &str,
    action: AuditAction,
    table_name: &str,
    old_val: Option<&str>,
    new_val: Option<&str>,
) -> Result<()>
where
    E: Executor<'a, Database = Sqlite>,
{
    sqlx::query(
        r"
        INSERT INTO audit_log (actor, action, table_name, old_val, new_val, ts)
        VALUES (?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(actor)
    .bind(action.as_str())
    .bind(table_name)
    .bind(old_val)
    .bind(new_val)
    .bind(now_iso())
    .execute(exec)
    .await
    .context("Failed to append audit event")?;
    Ok(())
}

/// Fetch recent audit events, newest first.
pub async fn recent_audit_events(pool: &SqlitePool, limit: i64) -> Result<Vec<AuditEvent>> {
    sqlx::query_as("SELECT * FROM audit_log ORDER BY id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to fetch audit events")
}

// ========== Channels ==========

/// Get a channel by its source ID.
pub async fn find_channel(pool: &SqlitePool, id: i64) -> Result<Option<Channel>> {
    sqlx::query_as("SELECT * FROM channels WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch channel")
}

/// Insert or update a channel keyed on its source ID.
///
/// Channels are never deleted by the mirror, even when the source channel
/// disappears. Unchanged observations are a no-op so repeated runs leave the
/// row (and the audit log) untouched.
pub async fn upsert_channel(pool: &SqlitePool, actor: &str, channel: &Channel) -> Result<()> {
    let existing = find_channel(pool, channel.id).await?;

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    match existing {
        None => {
            sqlx::query(
                r"
                INSERT INTO channels (id, slug, name, description, position, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(channel.id)
            .bind(&channel.slug)
            .bind(&channel.name)
            .bind(&channel.description)
            .bind(channel.position)
            .bind(&channel.created_at)
            .execute(&mut *tx)
            .await
            .context("Failed to insert channel")?;

            let new_val = serde_json::to_string(channel)?;
            append_audit(
                &mut *tx,
                actor,
                AuditAction::Insert,
                "channels",
                None,
                Some(&new_val),
            )
            .await?;
        }
        Some(ref old)
            if old.slug != channel.slug
                || old.name != channel.name
                || old.description != channel.description
                || old.position != channel.position =>
        {
            sqlx::query(
                r"
                UPDATE channels SET slug = ?, name = ?, description = ?, position = ?
                WHERE id = ?
                ",
            )
            .bind(&channel.slug)
            .bind(&channel.name)
            .bind(&channel.description)
            .bind(channel.position)
            .bind(channel.id)
            .execute(&mut *tx)
            .await
            .context("Failed to update channel")?;

            let old_val = serde_json::to_string(old)?;
            let new_val = serde_json::to_string(channel)?;
            append_audit(
                &mut *tx,
                actor,
                AuditAction::Update,
                "channels",
                Some(&old_val),
                Some(&new_val),
            )
            .await?;
        }
        Some(_) => {}
    }
    tx.commit().await.context("Failed to commit channel upsert")?;
    Ok(())
}

// ========== Threads ==========

/// Get a thread by its source ID.
pub async fn find_thread(pool: &SqlitePool, id: i64) -> Result<Option<Thread>> {
    sqlx::query_as("SELECT * FROM threads WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch thread")
}

/// Get a thread by slug (used for collision repair).
pub async fn find_thread_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<Thread>> {
    sqlx::query_as("SELECT * FROM threads WHERE slug = ?")
        .bind(slug)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch thread by slug")
}

/// Insert or update a thread keyed on its source ID.
///
/// `reply_count` is never touched by this call; it is maintained through
/// [`set_thread_reply_count`]. `created_at` is immutable after insert.
pub async fn upsert_thread(pool: &SqlitePool, actor: &str, thread: &NewThread) -> Result<()> {
    let existing = find_thread(pool, thread.id).await?;
    let tags_json = serde_json::to_string(&thread.tags)?;

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    match existing {
        None => {
            let now = now_iso();
            sqlx::query(
                r"
                INSERT INTO threads
                    (id, channel_id, slug, title, author_alias, body_html, tags,
                     reply_count, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
                ",
            )
            .bind(thread.id)
            .bind(thread.channel_id)
            .bind(&thread.slug)
            .bind(&thread.title)
            .bind(&thread.author_alias)
            .bind(&thread.body_html)
            .bind(&tags_json)
            .bind(&thread.created_at)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert thread")?;

            let new_val = serde_json::json!({
                "id": thread.id,
                "channel_id": thread.channel_id,
                "slug": thread.slug,
                "title": thread.title,
            })
            .to_string();
            append_audit(
                &mut *tx,
                actor,
                AuditAction::Insert,
                "threads",
                None,
                Some(&new_val),
            )
            .await?;
        }
        Some(ref old)
            if old.channel_id != thread.channel_id
                || old.slug != thread.slug
                || old.title != thread.title
                || old.author_alias != thread.author_alias
                || old.body_html != thread.body_html
                || old.tags != tags_json =>
        {
            sqlx::query(
                r"
                UPDATE threads
                SET channel_id = ?, slug = ?, title = ?, author_alias = ?,
                    body_html = ?, tags = ?, updated_at = ?
                WHERE id = ?
                ",
            )
            .bind(thread.channel_id)
            .bind(&thread.slug)
            .bind(&thread.title)
            .bind(&thread.author_alias)
            .bind(&thread.body_html)
            .bind(&tags_json)
            .bind(now_iso())
            .bind(thread.id)
            .execute(&mut *tx)
            .await
            .context("Failed to update thread")?;

            let old_val = serde_json::to_string(old)?;
            let new_val = serde_json::json!({
                "id": thread.id,
                "slug": thread.slug,
                "title": thread.title,
            })
            .to_string();
            append_audit(
                &mut *tx,
                actor,
                AuditAction::Update,
                "threads",
                Some(&old_val),
                Some(&new_val),
            )
            .await?;
        }
        Some(_) => {}
    }
    tx.commit().await.context("Failed to commit thread upsert")?;
    Ok(())
}

/// Delete a thread; posts cascade. Returns whether a row was removed.
pub async fn delete_thread(pool: &SqlitePool, actor: &str, id: i64) -> Result<bool> {
    let Some(old) = find_thread(pool, id).await? else {
        return Ok(false);
    };

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    sqlx::query("DELETE FROM threads WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to delete thread")?;

    let old_val = serde_json::to_string(&old)?;
    append_audit(
        &mut *tx,
        actor,
        AuditAction::Delete,
        "threads",
        Some(&old_val),
        None,
    )
    .await?;
    tx.commit().await.context("Failed to commit thread delete")?;
    Ok(true)
}

/// Store the maintained reply count for a thread.
///
/// Derived bookkeeping, so it neither bumps `updated_at` nor writes audit
/// rows; unchanged values are a no-op.
pub async fn set_thread_reply_count(pool: &SqlitePool, thread_id: i64, n: i64) -> Result<()> {
    sqlx::query("UPDATE threads SET reply_count = ? WHERE id = ? AND reply_count <> ?")
        .bind(n)
        .bind(thread_id)
        .bind(n)
        .execute(pool)
        .await
        .context("Failed to set reply count")?;
    Ok(())
}

// ========== Posts ==========

/// Get a post by its source ID.
pub async fn find_post(pool: &SqlitePool, id: i64) -> Result<Option<Post>> {
    sqlx::query_as("SELECT * FROM posts WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch post")
}

/// List a thread's posts in chronological order.
pub async fn list_posts(pool: &SqlitePool, thread_id: i64) -> Result<Vec<Post>> {
    sqlx::query_as("SELECT * FROM posts WHERE thread_id = ? ORDER BY created_at ASC, id ASC")
        .bind(thread_id)
        .fetch_all(pool)
        .await
        .context("Failed to list posts")
}

/// Count the posts stored for a thread.
pub async fn count_posts(pool: &SqlitePool, thread_id: i64) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE thread_id = ?")
        .bind(thread_id)
        .fetch_one(pool)
        .await
        .context("Failed to count posts")?;
    Ok(row.0)
}

/// Insert or update a post keyed on its source ID.
///
/// `created_at` is immutable after insert; unchanged observations are a
/// no-op.
pub async fn upsert_post(pool: &SqlitePool, actor: &str, post: &NewPost) -> Result<()> {
    let existing = find_post(pool, post.id).await?;

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    match existing {
        None => {
            let now = now_iso();
            sqlx::query(
                r"
                INSERT INTO posts
                    (id, thread_id, author_alias, body_html, reply_to_id,
                     reply_to_author_alias, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(post.id)
            .bind(post.thread_id)
            .bind(&post.author_alias)
            .bind(&post.body_html)
            .bind(post.reply_to_id)
            .bind(&post.reply_to_author_alias)
            .bind(&post.created_at)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .context("Failed to insert post")?;

            let new_val = serde_json::json!({
                "id": post.id,
                "thread_id": post.thread_id,
                "reply_to_id": post.reply_to_id,
            })
            .to_string();
            append_audit(
                &mut *tx,
                actor,
                AuditAction::Insert,
                "posts",
                None,
                Some(&new_val),
            )
            .await?;
        }
        Some(ref old)
            if old.author_alias != post.author_alias
                || old.body_html != post.body_html
                || old.reply_to_id != post.reply_to_id
                || old.reply_to_author_alias != post.reply_to_author_alias =>
        {
            sqlx::query(
                r"
                UPDATE posts
                SET author_alias = ?, body_html = ?, reply_to_id = ?,
                    reply_to_author_alias = ?, updated_at = ?
                WHERE id = ?
                ",
            )
            .bind(&post.author_alias)
            .bind(&post.body_html)
            .bind(post.reply_to_id)
            .bind(&post.reply_to_author_alias)
            .bind(now_iso())
            .bind(post.id)
            .execute(&mut *tx)
            .await
            .context("Failed to update post")?;

            let old_val = serde_json::to_string(old)?;
            let new_val = serde_json::json!({
                "id": post.id,
                "reply_to_id": post.reply_to_id,
            })
            .to_string();
            append_audit(
                &mut *tx,
                actor,
                AuditAction::Update,
                "posts",
                Some(&old_val),
                Some(&new_val),
            )
            .await?;
        }
        Some(_) => {}
    }
    tx.commit().await.context("Failed to commit post upsert")?;
    Ok(())
}

/// Repair a post's reply fields after its referent arrived.
pub async fn set_post_reply(
    pool: &SqlitePool,
    actor: &str,
    id: i64,
    reply_to_id: i64,
    reply_to_author_alias: &str,
) -> Result<()> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    let changed = sqlx::query(
        r"
        UPDATE posts SET reply_to_id = ?, reply_to_author_alias = ?, updated_at = ?
        WHERE id = ? AND reply_to_id IS NULL
        ",
    )
    .bind(reply_to_id)
    .bind(reply_to_author_alias)
    .bind(now_iso())
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("Failed to repair post reply")?
    .rows_affected();

    if changed > 0 {
        let new_val = serde_json::json!({ "id": id, "reply_to_id": reply_to_id }).to_string();
        append_audit(
            &mut *tx,
            actor,
            AuditAction::Update,
            "posts",
            None,
            Some(&new_val),
        )
        .await?;
    }
    tx.commit().await.context("Failed to commit reply repair")?;
    Ok(())
}

/// Delete a post. Referring posts keep their rows; their `reply_to_id`
/// becomes null via the FK and the cached alias is cleared to match.
/// Returns whether a row was removed.
pub async fn delete_post(pool: &SqlitePool, actor: &str, id: i64) -> Result<bool> {
    let Some(old) = find_post(pool, id).await? else {
        return Ok(false);
    };

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    sqlx::query("DELETE FROM posts WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to delete post")?;

    sqlx::query(
        r"
        UPDATE posts SET reply_to_author_alias = NULL
        WHERE thread_id = ? AND reply_to_id IS NULL AND reply_to_author_alias IS NOT NULL
        ",
    )
    .bind(old.thread_id)
    .execute(&mut *tx)
    .await
    .context("Failed to clear dangling reply aliases")?;

    let old_val = serde_json::to_string(&old)?;
    append_audit(
        &mut *tx,
        actor,
        AuditAction::Delete,
        "posts",
        Some(&old_val),
        None,
    )
    .await?;
    tx.commit().await.context("Failed to commit post delete")?;
    Ok(true)
}

// ========== Sync cursor ==========

/// Read the sync cursor. Falls back to the epoch/first-run default if the
/// row is missing or unreadable.
pub async fn get_cursor(pool: &SqlitePool) -> Result<SyncCursor> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key_name = ?")
        .bind(SYNC_STATE_KEY)
        .fetch_optional(pool)
        .await
        .context("Failed to read sync cursor")?;

    Ok(row
        .and_then(|(value,)| serde_json::from_str(&value).ok())
        .unwrap_or_default())
}

/// Persist the cursor with the given run-start timestamp and clear the
/// first-run flag.
///
/// The timestamp must be captured at the *start* of the sync run so events
/// arriving mid-run fall after the watermark and are re-fetched next time.
pub async fn set_cursor(pool: &SqlitePool, start_ts: &str) -> Result<()> {
    let cursor = SyncCursor {
        last_sync: start_ts.to_string(),
        is_first_run: 0,
    };
    let value = serde_json::to_string(&cursor)?;

    sqlx::query(
        r"
        INSERT INTO config (key_name, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(key_name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        ",
    )
    .bind(SYNC_STATE_KEY)
    .bind(&value)
    .bind(now_iso())
    .execute(pool)
    .await
    .context("Failed to write sync cursor")?;
    Ok(())
}

// ========== Staff roles ==========

/// Get a staff role by identity hash.
pub async fn get_staff_role(pool: &SqlitePool, user_id_hash: &str) -> Result<Option<StaffRole>> {
    sqlx::query_as("SELECT * FROM staff_roles WHERE user_id_hash = ?")
        .bind(user_id_hash)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch staff role")
}

/// Insert or overwrite a staff role keyed by identity hash.
pub async fn upsert_staff_role(
    pool: &SqlitePool,
    actor: &str,
    user_id_hash: &str,
    public_tag: &str,
    added_by: Option<&str>,
) -> Result<()> {
    let existing = get_staff_role(pool, user_id_hash).await?;
    if existing.as_ref().is_some_and(|r| r.public_tag == public_tag) {
        return Ok(());
    }

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    sqlx::query(
        r"
        INSERT INTO staff_roles (user_id_hash, public_tag, added_by, added_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(user_id_hash) DO UPDATE SET public_tag = excluded.public_tag
        ",
    )
    .bind(user_id_hash)
    .bind(public_tag)
    .bind(added_by)
    .bind(now_iso())
    .execute(&mut *tx)
    .await
    .context("Failed to upsert staff role")?;

    let action = if existing.is_some() {
        AuditAction::Update
    } else {
        AuditAction::Insert
    };
    let old_val = existing.map(|r| serde_json::to_string(&r)).transpose()?;
    let new_val =
        serde_json::json!({ "user_id_hash": user_id_hash, "public_tag": public_tag }).to_string();
    append_audit(
        &mut *tx,
        actor,
        action,
        "staff_roles",
        old_val.as_deref(),
        Some(&new_val),
    )
    .await?;
    tx.commit().await.context("Failed to commit staff upsert")?;
    Ok(())
}

// ========== Moderation queue ==========

/// Flag content for moderation review. Each content item is flagged at most
/// once; repeat flags are ignored.
pub async fn flag_content(
    pool: &SqlitePool,
    content_type: ModerationContentType,
    content_id: i64,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r"
        INSERT OR IGNORE INTO moderation_queue (content_type, content_id, status, reason, flagged_at)
        VALUES (?, ?, 'pending', ?, ?)
        ",
    )
    .bind(content_type.as_str())
    .bind(content_id)
    .bind(reason)
    .bind(now_iso())
    .execute(pool)
    .await
    .context("Failed to flag content for moderation")?;
    Ok(())
}

/// List items awaiting review, oldest first.
pub async fn list_pending_moderation(pool: &SqlitePool) -> Result<Vec<ModerationItem>> {
    sqlx::query_as("SELECT * FROM moderation_queue WHERE status = 'pending' ORDER BY flagged_at ASC")
        .fetch_all(pool)
        .await
        .context("Failed to list moderation queue")
}

/// Resolve a moderation item as approved or rejected.
pub async fn resolve_moderation(
    pool: &SqlitePool,
    id: i64,
    approve: bool,
    reviewed_by: &str,
) -> Result<()> {
    let status = if approve { "approved" } else { "rejected" };
    sqlx::query(
        r"
        UPDATE moderation_queue SET status = ?, reviewed_at = ?, reviewed_by = ?
        WHERE id = ? AND status = 'pending'
        ",
    )
    .bind(status)
    .bind(now_iso())
    .bind(reviewed_by)
    .bind(id)
    .execute(pool)
    .await
    .context("Failed to resolve moderation item")?;
    Ok(())
}
