use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

use crate::constants::SYNC_STATE_KEY;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    if current_version < 3 {
        debug!("Running migration v3");
        run_migration_v3(pool).await?;
        set_schema_version(pool, 3).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema_migrations table")?;
    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i64> {
    let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await
        .context("Failed to read schema version")?;
    Ok(row.0.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("INSERT INTO schema_migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to record migration v{version}"))?;
    Ok(())
}

/// Core mirror tables plus the seeded sync cursor.
async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE channels (
            id INTEGER PRIMARY KEY,
            slug TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            position INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create channels table")?;

    sqlx::query(
        r"
        CREATE TABLE threads (
            id INTEGER PRIMARY KEY,
            channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            slug TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            author_alias TEXT NOT NULL,
            body_html TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            reply_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create threads table")?;

    sqlx::query(
        r"
        CREATE TABLE posts (
            id INTEGER PRIMARY KEY,
            thread_id INTEGER NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            author_alias TEXT NOT NULL,
            body_html TEXT NOT NULL,
            reply_to_id INTEGER REFERENCES posts(id) ON DELETE SET NULL,
            reply_to_author_alias TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create posts table")?;

    sqlx::query(
        r"
        CREATE TABLE staff_roles (
            user_id_hash TEXT PRIMARY KEY,
            public_tag TEXT NOT NULL,
            added_by TEXT,
            added_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create staff_roles table")?;

    sqlx::query(
        r"
        CREATE TABLE audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('INSERT', 'UPDATE', 'DELETE')),
            table_name TEXT NOT NULL,
            old_val TEXT,
            new_val TEXT,
            ts TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create audit_log table")?;

    sqlx::query(
        r"
        CREATE TABLE config (
            key_name TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create config table")?;

    // Seed the cursor so get_cursor always finds a row.
    sqlx::query(
        r"
        INSERT INTO config (key_name, value, updated_at)
        VALUES (?, ?, datetime('now'))
        ",
    )
    .bind(SYNC_STATE_KEY)
    .bind(r#"{"last_sync":"1970-01-01T00:00:00.000Z","is_first_run":1}"#)
    .execute(pool)
    .await
    .context("Failed to seed sync cursor")?;

    Ok(())
}

/// Moderation queue for content the sanitizer flagged.
async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE moderation_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_type TEXT NOT NULL CHECK (content_type IN ('thread', 'post')),
            content_id INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'approved', 'rejected')),
            reason TEXT,
            flagged_at TEXT NOT NULL,
            reviewed_at TEXT,
            reviewed_by TEXT,
            UNIQUE (content_type, content_id)
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create moderation_queue table")?;
    Ok(())
}

/// Lookup indexes for the hot paths.
async fn run_migration_v3(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE INDEX idx_threads_channel ON threads(channel_id)")
        .execute(pool)
        .await
        .context("Failed to create threads index")?;

    sqlx::query("CREATE INDEX idx_posts_thread ON posts(thread_id, created_at)")
        .execute(pool)
        .await
        .context("Failed to create posts index")?;

    sqlx::query("CREATE INDEX idx_audit_ts ON audit_log(ts)")
        .execute(pool)
        .await
        .context("Failed to create audit index")?;

    Ok(())
}
