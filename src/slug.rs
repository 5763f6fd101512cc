//! URL-safe slug generation for channel and thread names.

use sha2::{Digest, Sha256};

/// Maximum slug length, matching the store column.
const MAX_SLUG_LEN: usize = 255;

/// Turn a title into a url-safe slug.
///
/// Lowercases, strips everything outside `[a-z0-9 -]`, collapses whitespace
/// runs to single hyphens, collapses hyphen runs, trims leading/trailing
/// hyphens, and truncates to 255 characters. Titles made entirely of stripped
/// characters produce an empty slug.
#[must_use]
pub fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    let kept: String = lowered
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == ' ' || *c == '-')
        .collect();

    let mut slug = String::with_capacity(kept.len());
    let mut prev_hyphen = false;
    for c in kept.chars() {
        let mapped = if c == ' ' { '-' } else { c };
        if mapped == '-' {
            if !prev_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            prev_hyphen = true;
        } else {
            slug.push(mapped);
            prev_hyphen = false;
        }
    }

    let trimmed = slug.trim_matches('-');
    let mut out = trimmed.to_string();
    out.truncate(MAX_SLUG_LEN);
    // Truncation can leave a trailing hyphen behind.
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Short deterministic suffix for slug collision repair.
///
/// Distinct titles can slugify identically; appending six hex chars of the
/// owning thread's ID hash keeps the unique constraint satisfiable without
/// renaming the slug's original owner.
#[must_use]
pub fn collision_suffix(thread_id: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(thread_id.to_string().as_bytes());
    hex::encode(hasher.finalize())[..6].to_string()
}
