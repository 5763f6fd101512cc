//! End-to-end sync scenarios against the mock platform.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{
    base_time, forum_channel, guild, message, bot_message, setup_db, snowflake_at, test_hasher,
    thread_summary, MockPlatform,
};
use discord_forum_mirror::db::{
    count_posts, find_channel, find_post, find_thread, get_cursor, list_pending_moderation,
    list_posts, recent_audit_events, Database,
};
use discord_forum_mirror::platform::PlatformApi;
use discord_forum_mirror::sync::{
    fetch_thread_messages, Orchestrator, Reconciler, SyncMode, SyncOptions,
};

const GUILD_ID: i64 = 1;
const CHANNEL_ID: i64 = 10;
const AUTHOR_A: i64 = 500_000_000_000_000_001;
const AUTHOR_B: i64 = 500_000_000_000_000_002;

fn orchestrator(db: &Database, api: Arc<MockPlatform>, cancel: CancellationToken) -> Orchestrator {
    let reconciler = Arc::new(Reconciler::new(db.clone(), test_hasher(), None, "sync"));
    Orchestrator::new(db.clone(), api, reconciler, cancel)
}

fn basic_mock() -> Arc<MockPlatform> {
    let mock = MockPlatform {
        guilds: vec![guild(GUILD_ID, "Test Guild")],
        channels: vec![forum_channel(CHANNEL_ID, GUILD_ID, "General")],
        ..MockPlatform::default()
    };
    Arc::new(mock)
}

/// Seed the S1 fixture: one thread with a starter and two replies, the first
/// reply referencing the starter.
fn seed_s1(mock: &MockPlatform) -> (i64, i64, i64) {
    let t0 = base_time();
    let thread_id = snowflake_at(t0);
    let m2_id = snowflake_at(t0 + chrono::Duration::seconds(60));
    let m3_id = snowflake_at(t0 + chrono::Duration::seconds(120));

    let starter = message(thread_id, thread_id, AUTHOR_A, "How do I do X?", t0, None);
    let m2 = message(
        m2_id,
        thread_id,
        AUTHOR_B,
        "Have you tried Y?",
        t0 + chrono::Duration::seconds(60),
        Some(thread_id),
    );
    let m3 = message(
        m3_id,
        thread_id,
        AUTHOR_A,
        "That worked, thanks!",
        t0 + chrono::Duration::seconds(120),
        None,
    );

    mock.add_thread(
        thread_summary(thread_id, CHANNEL_ID, "How do I X?"),
        vec![starter, m2, m3],
    );
    (thread_id, m2_id, m3_id)
}

#[tokio::test]
async fn s1_first_run_full_sync() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();
    let (thread_id, m2_id, _m3_id) = seed_s1(&mock);

    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    let stats = orch.run(&SyncOptions::default()).await.unwrap();

    assert_eq!(stats.guilds, 1);
    assert_eq!(stats.channels, 1);
    assert_eq!(stats.threads, 1);
    assert_eq!(stats.posts, 2);
    assert_eq!(stats.errors, 0);

    let channel = find_channel(db.pool(), CHANNEL_ID).await.unwrap().unwrap();
    assert_eq!(channel.slug, "general");

    let thread = find_thread(db.pool(), thread_id).await.unwrap().unwrap();
    assert_eq!(thread.slug, "how-do-i-x");
    assert_eq!(thread.reply_count, 2);
    assert_eq!(thread.author_alias.len(), 12);
    assert!(thread.author_alias.chars().all(|c| c.is_ascii_hexdigit()));

    // Starter row plus two replies.
    assert_eq!(count_posts(db.pool(), thread_id).await.unwrap(), 3);
    let m2 = find_post(db.pool(), m2_id).await.unwrap().unwrap();
    assert_eq!(m2.reply_to_id, Some(thread_id));
    assert!(m2.reply_to_author_alias.is_some());

    let cursor = get_cursor(db.pool()).await.unwrap();
    assert!(!cursor.is_first_run());
}

#[tokio::test]
async fn s2_delta_sync_picks_up_new_reply() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();
    let (thread_id, m2_id, _) = seed_s1(&mock);

    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    orch.run(&SyncOptions::default()).await.unwrap();
    let cursor_after_full = get_cursor(db.pool()).await.unwrap();
    let thread_before = find_thread(db.pool(), thread_id).await.unwrap().unwrap();
    let m2_before = find_post(db.pool(), m2_id).await.unwrap().unwrap();

    // A new reply appears upstream.
    let m4_id = snowflake_at(base_time() + chrono::Duration::seconds(300));
    mock.push_message(
        thread_id,
        message(
            m4_id,
            thread_id,
            AUTHOR_B,
            "Following up on this.",
            base_time() + chrono::Duration::seconds(300),
            Some(m2_id),
        ),
    );

    let stats = orch.run(&SyncOptions::default()).await.unwrap();
    assert_eq!(stats.posts, 3, "delta re-walks the active thread");

    let thread = find_thread(db.pool(), thread_id).await.unwrap().unwrap();
    assert_eq!(thread.reply_count, 3);
    assert_eq!(thread.created_at, thread_before.created_at);

    let m4 = find_post(db.pool(), m4_id).await.unwrap().unwrap();
    assert_eq!(m4.reply_to_id, Some(m2_id));

    // Untouched rows stay untouched.
    let m2_after = find_post(db.pool(), m2_id).await.unwrap().unwrap();
    assert_eq!(m2_before.created_at, m2_after.created_at);
    assert_eq!(m2_before.updated_at, m2_after.updated_at);

    let cursor = get_cursor(db.pool()).await.unwrap();
    assert!(cursor.last_sync >= cursor_after_full.last_sync, "cursor is monotonic");
}

#[tokio::test]
async fn s3_out_of_order_arrivals_resolve_references() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();

    let t0 = base_time();
    let thread_id = snowflake_at(t0);
    let m2_id = snowflake_at(t0 + chrono::Duration::seconds(30));
    let m3_id = snowflake_at(t0 + chrono::Duration::seconds(60));

    // Injected newest-first; pagination reads in reverse-chronological pages
    // and the reconciler applies chronological order.
    let m3 = message(m3_id, thread_id, AUTHOR_A, "third", t0 + chrono::Duration::seconds(60), Some(m2_id));
    let m1 = message(thread_id, thread_id, AUTHOR_B, "first", t0, None);
    let m2 = message(m2_id, thread_id, AUTHOR_A, "second", t0 + chrono::Duration::seconds(30), Some(thread_id));
    mock.add_thread(thread_summary(thread_id, CHANNEL_ID, "Ordering"), vec![m3, m1, m2]);

    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    orch.run(&SyncOptions::default()).await.unwrap();

    assert_eq!(count_posts(db.pool(), thread_id).await.unwrap(), 3);
    let m2 = find_post(db.pool(), m2_id).await.unwrap().unwrap();
    assert_eq!(m2.reply_to_id, Some(thread_id));
    let m3 = find_post(db.pool(), m3_id).await.unwrap().unwrap();
    assert_eq!(m3.reply_to_id, Some(m2_id));
}

#[tokio::test]
async fn deferred_repair_fixes_forward_references() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();

    let t0 = base_time();
    let thread_id = snowflake_at(t0);
    let early_id = snowflake_at(t0 + chrono::Duration::seconds(10));
    let late_id = snowflake_at(t0 + chrono::Duration::seconds(20));

    // `early` references a message that is chronologically later, so the
    // first pass cannot resolve it and the second pass must.
    let starter = message(thread_id, thread_id, AUTHOR_A, "start", t0, None);
    let early = message(early_id, thread_id, AUTHOR_B, "early", t0 + chrono::Duration::seconds(10), Some(late_id));
    let late = message(late_id, thread_id, AUTHOR_A, "late", t0 + chrono::Duration::seconds(20), None);
    mock.add_thread(
        thread_summary(thread_id, CHANNEL_ID, "Repair"),
        vec![starter, early, late],
    );

    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    orch.run(&SyncOptions::default()).await.unwrap();

    let early = find_post(db.pool(), early_id).await.unwrap().unwrap();
    assert_eq!(early.reply_to_id, Some(late_id));
    assert!(early.reply_to_author_alias.is_some());
}

#[tokio::test]
async fn s4_pii_is_redacted_and_flagged() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();

    let t0 = base_time();
    let thread_id = snowflake_at(t0);
    let starter = message(
        thread_id,
        thread_id,
        AUTHOR_A,
        "Contact me at alice@example.com or 555-123-4567, SSN 123-45-6789, card 4111 1111 1111 1111",
        t0,
        None,
    );
    mock.add_thread(thread_summary(thread_id, CHANNEL_ID, "Contact info"), vec![starter]);

    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    orch.run(&SyncOptions::default()).await.unwrap();

    let thread = find_thread(db.pool(), thread_id).await.unwrap().unwrap();
    for placeholder in [
        "[Email Redacted]",
        "[Phone Redacted]",
        "[SSN Redacted]",
        "[Card Number Redacted]",
    ] {
        assert!(thread.body_html.contains(placeholder), "missing {placeholder}");
    }
    assert!(!thread.body_html.contains("alice@example.com"));
    assert!(!thread.body_html.contains("4111"));

    let pending = list_pending_moderation(db.pool()).await.unwrap();
    assert!(pending.iter().any(|m| m.content_id == thread_id));
}

#[tokio::test]
async fn sync_is_idempotent_down_to_updated_at() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();
    let (thread_id, _, _) = seed_s1(&mock);

    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    orch.run(&SyncOptions::default()).await.unwrap();

    let thread_before = find_thread(db.pool(), thread_id).await.unwrap().unwrap();
    let posts_before = list_posts(db.pool(), thread_id).await.unwrap();
    let audit_before = recent_audit_events(db.pool(), 1000).await.unwrap().len();

    tokio::time::sleep(Duration::from_millis(10)).await;
    orch.run(&SyncOptions::default()).await.unwrap();

    let thread_after = find_thread(db.pool(), thread_id).await.unwrap().unwrap();
    let posts_after = list_posts(db.pool(), thread_id).await.unwrap();
    let audit_after = recent_audit_events(db.pool(), 1000).await.unwrap().len();

    assert_eq!(thread_before.updated_at, thread_after.updated_at);
    assert_eq!(thread_before.body_html, thread_after.body_html);
    assert_eq!(posts_before.len(), posts_after.len());
    for (before, after) in posts_before.iter().zip(&posts_after) {
        assert_eq!(before.id, after.id);
        assert_eq!(before.body_html, after.body_html);
        assert_eq!(before.updated_at, after.updated_at);
        assert_eq!(before.created_at, after.created_at);
    }
    assert_eq!(audit_before, audit_after, "no-op runs add no audit entries");
}

#[tokio::test]
async fn orchestrator_failure_leaves_cursor_untouched() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();
    seed_s1(&mock);

    mock.fail_guilds.store(true, std::sync::atomic::Ordering::SeqCst);
    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    assert!(orch.run(&SyncOptions::default()).await.is_err());

    let cursor = get_cursor(db.pool()).await.unwrap();
    assert!(cursor.is_first_run(), "failed run must not advance the cursor");
    assert_eq!(cursor.last_sync, "1970-01-01T00:00:00.000Z");
}

#[tokio::test]
async fn rate_limited_channel_is_skipped_not_fatal() {
    let (db, _tmp) = setup_db().await;
    let mock = MockPlatform {
        guilds: vec![guild(GUILD_ID, "Test Guild")],
        channels: vec![
            forum_channel(CHANNEL_ID, GUILD_ID, "General"),
            forum_channel(CHANNEL_ID + 1, GUILD_ID, "Support"),
        ],
        ..MockPlatform::default()
    };
    let mock = Arc::new(mock);
    *mock.rate_limited_channel.lock().unwrap() = Some(CHANNEL_ID);

    let t0 = base_time();
    let thread_id = snowflake_at(t0);
    mock.add_thread(
        thread_summary(thread_id, CHANNEL_ID + 1, "Survivor"),
        vec![message(thread_id, thread_id, AUTHOR_A, "hello", t0, None)],
    );

    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    let stats = orch.run(&SyncOptions::default()).await.unwrap();

    assert!(stats.errors >= 1, "rate-limited channel counts as an error");
    assert!(find_thread(db.pool(), thread_id).await.unwrap().is_some());
}

#[tokio::test]
async fn s6_cancellation_is_safe_and_resumable() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();

    let t0 = base_time();
    let thread_id = snowflake_at(t0);
    let mut messages = vec![message(thread_id, thread_id, AUTHOR_A, "start", t0, None)];
    for i in 1..=250 {
        let ts = t0 + chrono::Duration::seconds(i);
        messages.push(message(snowflake_at(ts), thread_id, AUTHOR_B, "reply", ts, None));
    }
    mock.add_thread(thread_summary(thread_id, CHANNEL_ID, "Big thread"), messages);

    // Cancel as soon as the first message page is served.
    let cancel = CancellationToken::new();
    *mock.cancel_after_first_page.lock().unwrap() = Some(cancel.clone());

    let orch = orchestrator(&db, Arc::clone(&mock), cancel);
    orch.run(&SyncOptions::default()).await.unwrap();

    let persisted = count_posts(db.pool(), thread_id).await.unwrap();
    assert!(persisted > 0, "in-flight page flushes");
    assert!(persisted < 251, "later pages were not fetched");

    let thread = find_thread(db.pool(), thread_id).await.unwrap().unwrap();
    assert!(thread.reply_count <= 250, "stale reply count stays below the true value");

    let cursor = get_cursor(db.pool()).await.unwrap();
    assert!(cursor.is_first_run(), "cancelled run leaves the cursor unchanged");

    // A fresh run completes the thread without duplicating rows.
    *mock.cancel_after_first_page.lock().unwrap() = None;
    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    orch.run(&SyncOptions::default()).await.unwrap();

    assert_eq!(count_posts(db.pool(), thread_id).await.unwrap(), 251);
    let thread = find_thread(db.pool(), thread_id).await.unwrap().unwrap();
    assert_eq!(thread.reply_count, 250);
    assert!(!get_cursor(db.pool()).await.unwrap().is_first_run());
}

#[tokio::test]
async fn delta_pagination_stops_at_the_watermark() {
    let mock = basic_mock();

    let t0 = base_time();
    let thread_id = snowflake_at(t0);
    let mut messages = vec![message(thread_id, thread_id, AUTHOR_A, "start", t0, None)];
    for i in 1..=250 {
        let ts = t0 + chrono::Duration::seconds(i);
        messages.push(message(snowflake_at(ts), thread_id, AUTHOR_B, "reply", ts, None));
    }
    mock.add_thread(thread_summary(thread_id, CHANNEL_ID, "Big thread"), messages);

    // Watermark sits inside the newest page: everything older is mirrored.
    let since = t0 + chrono::Duration::seconds(200);
    let fetched = fetch_thread_messages(
        mock.as_ref() as &dyn PlatformApi,
        thread_id,
        SyncMode::Delta { since },
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    // Page one (newest 100) has messages past the watermark, page two is
    // entirely at-or-before it, so pagination stops after two pages.
    assert_eq!(mock.pages_served.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert!(fetched.len() >= 200, "both fetched pages are kept");
    // Chronological ascending with the starter present.
    assert_eq!(fetched.first().unwrap().id, thread_id);
    for pair in fetched.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn bot_messages_are_filtered_including_starters() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();

    let t0 = base_time();
    // Thread with a bot reply: reply skipped, thread mirrored.
    let t1 = snowflake_at(t0);
    let bot_reply_id = snowflake_at(t0 + chrono::Duration::seconds(5));
    mock.add_thread(
        thread_summary(t1, CHANNEL_ID, "Humans here"),
        vec![
            message(t1, t1, AUTHOR_A, "hi", t0, None),
            bot_message(bot_reply_id, t1, "beep", t0 + chrono::Duration::seconds(5)),
        ],
    );
    // Bot-started thread: skipped entirely.
    let t2_ts = t0 + chrono::Duration::seconds(100);
    let t2 = snowflake_at(t2_ts);
    mock.add_thread(
        thread_summary(t2, CHANNEL_ID, "Bot announcement"),
        vec![bot_message(t2, t2, "announcement", t2_ts)],
    );

    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    orch.run(&SyncOptions::default()).await.unwrap();

    assert!(find_thread(db.pool(), t1).await.unwrap().is_some());
    assert!(find_post(db.pool(), bot_reply_id).await.unwrap().is_none());
    assert!(find_thread(db.pool(), t2).await.unwrap().is_none());
}

#[tokio::test]
async fn slug_collisions_get_a_suffix() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();

    let t0 = base_time();
    let t1 = snowflake_at(t0);
    let t2_ts = t0 + chrono::Duration::seconds(100);
    let t2 = snowflake_at(t2_ts);
    mock.add_thread(
        thread_summary(t1, CHANNEL_ID, "Hello!"),
        vec![message(t1, t1, AUTHOR_A, "a", t0, None)],
    );
    mock.add_thread(
        thread_summary(t2, CHANNEL_ID, "Hello?"),
        vec![message(t2, t2, AUTHOR_B, "b", t2_ts, None)],
    );

    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    orch.run(&SyncOptions::default()).await.unwrap();

    let slug1 = find_thread(db.pool(), t1).await.unwrap().unwrap().slug;
    let slug2 = find_thread(db.pool(), t2).await.unwrap().unwrap().slug;
    assert_ne!(slug1, slug2);
    let mut slugs = [slug1.as_str(), slug2.as_str()];
    slugs.sort_unstable();
    assert!(slugs.contains(&"hello"));
    assert!(slugs.iter().any(|s| s.starts_with("hello-") && s.len() == "hello-".len() + 6));
}

#[tokio::test]
async fn limit_caps_threads_processed() {
    let (db, _tmp) = setup_db().await;
    let mock = basic_mock();

    let t0 = base_time();
    for i in 0..3 {
        let ts = t0 + chrono::Duration::seconds(i * 100);
        let id = snowflake_at(ts);
        mock.add_thread(
            thread_summary(id, CHANNEL_ID, &format!("Thread {i}")),
            vec![message(id, id, AUTHOR_A, "content", ts, None)],
        );
    }

    let orch = orchestrator(&db, Arc::clone(&mock), CancellationToken::new());
    let stats = orch
        .run(&SyncOptions {
            limit: Some(2),
            ..SyncOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(stats.threads, 2);
}
