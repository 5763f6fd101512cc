//! Staff role bootstrap from a two-column CSV.
//!
//! Format: `discord_user_id,tag` per line, no header. Whitespace is trimmed,
//! empty rows are skipped, and re-imports overwrite `public_tag` keyed by the
//! hashed ID — the raw user ID never reaches the store.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::db::{upsert_staff_role, Database};
use crate::hasher::IdentityHasher;

/// One parsed CSV row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffEntry {
    pub user_id: i64,
    pub tag: String,
}

/// Parse staff CSV content. Malformed rows are skipped with a count of how
/// many were dropped.
#[must_use]
pub fn parse_staff_csv(content: &str) -> (Vec<StaffEntry>, usize) {
    let mut entries = Vec::new();
    let mut skipped = 0;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((id_part, tag_part)) = line.split_once(',') else {
            skipped += 1;
            continue;
        };
        let tag = tag_part.trim();
        match id_part.trim().parse::<i64>() {
            Ok(user_id) if !tag.is_empty() => entries.push(StaffEntry {
                user_id,
                tag: tag.to_string(),
            }),
            _ => skipped += 1,
        }
    }

    (entries, skipped)
}

/// Import staff roles from a CSV file into the store.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the store rejects a write.
pub async fn import_staff_csv(
    db: &Database,
    hasher: &IdentityHasher,
    path: &Path,
) -> Result<usize> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read staff CSV: {}", path.display()))?;

    let (entries, skipped) = parse_staff_csv(&content);
    if skipped > 0 {
        warn!(skipped, "Skipped malformed staff CSV rows");
    }

    let count = entries.len();
    for entry in entries {
        let hash = hasher.alias(entry.user_id);
        upsert_staff_role(db.pool(), "staff-import", &hash, &entry.tag, None).await?;
    }

    info!(count, path = %path.display(), "Imported staff roles");
    Ok(count)
}
