//! Content sanitization and markdown conversion.
//!
//! Raw message text goes through a fixed pass order: platform tokens, script
//! stripping, PII redaction, then lightweight markdown to HTML. Each pass
//! operates on the previous pass's output, so placeholders inserted early are
//! never re-examined as content later.
//!
//! The source platform rejects raw HTML, so inputs arrive unescaped. Output
//! is trusted only inside a wrapping CSP; this is a best-effort filter, not a
//! full HTML allowlist sanitizer (see DESIGN.md).

use once_cell::sync::Lazy;
use regex::Regex;

static USER_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<@!?\d{17,19}>").unwrap());
static CHANNEL_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<#\d{17,19}>").unwrap());
static ROLE_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<@&\d{17,19}>").unwrap());
static CUSTOM_EMOJI: Lazy<Regex> = Lazy::new(|| Regex::new(r"<a?:\w+:\d{17,19}>").unwrap());
static TIMESTAMP_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<t:\d{1,13}(?::[tTdDfFR])?>").unwrap());

static SCRIPT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").unwrap());
static SCRIPT_ORPHAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</?script[^>]*>").unwrap());
static JS_PROTOCOL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)javascript:").unwrap());
static EVENT_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i) on\w+=").unwrap());

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static SSN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").unwrap());
// The regex crate has no lookbehind; digit boundaries are captured explicitly
// so ten digits inside a longer run (e.g. a raw snowflake) are left alone.
static PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<pre>^|[^0-9])(?P<phone>(?:\+?1[-. ]?)?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4})(?P<post>$|[^0-9])")
        .unwrap()
});

static CODE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```(.*?)```").unwrap());
static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
static ITALIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());
static STRIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~~(.+?)~~").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`\n]+)`").unwrap());
// A URL preceded by a quote lives in an href we emitted; preceded by `>` it is
// anchor text. Both must survive a second sanitization pass untouched.
static BARE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?P<pre>^|[^"'>])(?P<url>https?://[^\s<>"']+)"#).unwrap());

/// Result of sanitizing one piece of source text.
#[derive(Debug, Clone, Default)]
pub struct Sanitized {
    pub html: String,
    pub redacted_pii: bool,
    pub had_script: bool,
    pub removed_mentions: Vec<String>,
    pub removed_emoji: Vec<String>,
}

/// Sanitize free-form source text into safe-ish HTML.
///
/// Idempotent: feeding the output back through produces identical HTML.
#[must_use]
pub fn sanitize(input: &str) -> Sanitized {
    let mut removed_mentions = Vec::new();
    let mut removed_emoji = Vec::new();

    // Pass 1: platform mention tokens.
    for m in USER_MENTION.find_iter(input) {
        removed_mentions.push(m.as_str().to_string());
    }
    for m in CHANNEL_MENTION.find_iter(input) {
        removed_mentions.push(m.as_str().to_string());
    }
    for m in ROLE_MENTION.find_iter(input) {
        removed_mentions.push(m.as_str().to_string());
    }
    let text = USER_MENTION.replace_all(input, "[User Mention]");
    let text = CHANNEL_MENTION.replace_all(&text, "[Channel Mention]");
    let text = ROLE_MENTION.replace_all(&text, "[Role Mention]");

    // Pass 2: custom emoji tokens.
    for m in CUSTOM_EMOJI.find_iter(&text) {
        removed_emoji.push(m.as_str().to_string());
    }
    let text = CUSTOM_EMOJI.replace_all(&text, "[Emoji]");

    // Pass 3: timestamp tokens.
    let text = TIMESTAMP_TOKEN.replace_all(&text, "[Timestamp]");

    // Pass 4: script stripping and attribute defusal.
    let had_script = SCRIPT_BLOCK.is_match(&text) || SCRIPT_ORPHAN.is_match(&text);
    let text = SCRIPT_BLOCK.replace_all(&text, "");
    let text = SCRIPT_ORPHAN.replace_all(&text, "");
    let text = JS_PROTOCOL.replace_all(&text, "javascript-removed:");
    let text = EVENT_ATTR.replace_all(&text, " data-removed-event=");

    // Pass 5: PII redaction. Card goes before phone or the phone pattern
    // chews ten digits out of a sixteen-digit card number.
    let mut redacted_pii = false;
    let text = redact(&EMAIL, &text, "[Email Redacted]", &mut redacted_pii);
    let text = redact(&SSN, &text, "[SSN Redacted]", &mut redacted_pii);
    let text = redact(&CARD, &text, "[Card Number Redacted]", &mut redacted_pii);
    let text = if PHONE.is_match(&text) {
        redacted_pii = true;
        PHONE
            .replace_all(&text, "${pre}[Phone Redacted]${post}")
            .into_owned()
    } else {
        text
    };

    // Pass 6: markdown to HTML, inner patterns before wrapping.
    let text = CODE_BLOCK.replace_all(&text, "<pre><code>$1</code></pre>");
    let text = BOLD.replace_all(&text, "<strong>$1</strong>");
    let text = ITALIC.replace_all(&text, "<em>$1</em>");
    let text = STRIKE.replace_all(&text, "<del>$1</del>");
    let text = INLINE_CODE.replace_all(&text, "<code>$1</code>");
    let text = text.replace('\n', "<br>");
    let html = BARE_URL
        .replace_all(
            &text,
            r#"${pre}<a href="${url}" rel="noopener noreferrer" target="_blank">${url}</a>"#,
        )
        .into_owned();

    Sanitized {
        html,
        redacted_pii,
        had_script,
        removed_mentions,
        removed_emoji,
    }
}

fn redact(re: &Regex, text: &str, placeholder: &str, flag: &mut bool) -> String {
    if re.is_match(text) {
        *flag = true;
        re.replace_all(text, placeholder).into_owned()
    } else {
        text.to_string()
    }
}
