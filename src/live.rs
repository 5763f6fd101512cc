//! Live push-event handling.
//!
//! Applies the same reconciler primitives as the sync path, so a burst of
//! duplicate or replayed events converges on the same rows. Live handlers
//! never touch the sync cursor.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{
    delete_post, delete_thread, find_channel, find_post, find_thread, upsert_thread, Database,
    NewThread,
};
use crate::platform::{Message, PlatformApi, PlatformEvent, ThreadSummary};
use crate::sync::Reconciler;

/// Dispatches platform push events onto the store.
pub struct LiveHandler {
    db: Database,
    api: Arc<dyn PlatformApi>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
}

impl LiveHandler {
    #[must_use]
    pub fn new(
        db: Database,
        api: Arc<dyn PlatformApi>,
        reconciler: Arc<Reconciler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            api,
            reconciler,
            cancel,
        }
    }

    /// Apply one event. Events for channels or threads the mirror does not
    /// track are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects a write.
    pub async fn handle(&self, event: PlatformEvent) -> Result<()> {
        match event {
            PlatformEvent::MessageCreate(msg) => self.on_message_create(msg).await,
            PlatformEvent::MessageUpdate(msg) => self.on_message_update(msg).await,
            PlatformEvent::MessageDelete {
                channel_id,
                message_id,
            } => self.on_message_delete(channel_id, message_id).await,
            PlatformEvent::ThreadCreate(summary) | PlatformEvent::ThreadUpdate(summary) => {
                self.on_thread_upsert(summary).await
            }
            PlatformEvent::ThreadDelete { thread_id } => {
                if delete_thread(self.db.pool(), "live", thread_id).await? {
                    info!(thread_id, "Thread deleted from mirror");
                }
                Ok(())
            }
        }
    }

    async fn on_message_create(&self, msg: Message) -> Result<()> {
        let Some(thread) = find_thread(self.db.pool(), msg.channel_id).await? else {
            debug!(channel_id = msg.channel_id, "Message in untracked channel, ignoring");
            return Ok(());
        };
        if msg.author.bot {
            return Ok(());
        }

        self.reconciler
            .reconcile_post(thread.id, &msg, &self.cancel)
            .await?;
        self.reconciler.refresh_reply_count(thread.id).await?;
        Ok(())
    }

    async fn on_message_update(&self, msg: Message) -> Result<()> {
        if let Some(post) = find_post(self.db.pool(), msg.id).await? {
            // Starter edits arrive as message updates for the thread's own ID;
            // those refresh the inline thread body as well as the post row.
            if let Some(thread) = find_thread(self.db.pool(), msg.id).await? {
                self.update_thread_body(&thread, &msg).await?;
            }
            self.reconciler
                .reconcile_post(post.thread_id, &msg, &self.cancel)
                .await?;
            return Ok(());
        }

        if let Some(thread) = find_thread(self.db.pool(), msg.id).await? {
            self.update_thread_body(&thread, &msg).await?;
            return Ok(());
        }

        debug!(message_id = msg.id, "Update for unknown message, ignoring");
        Ok(())
    }

    async fn on_message_delete(&self, channel_id: i64, message_id: i64) -> Result<()> {
        if delete_post(self.db.pool(), "live", message_id).await? {
            if let Some(thread) = find_thread(self.db.pool(), channel_id).await? {
                self.reconciler.refresh_reply_count(thread.id).await?;
            }
        }
        Ok(())
    }

    async fn on_thread_upsert(&self, summary: ThreadSummary) -> Result<()> {
        if find_channel(self.db.pool(), summary.parent_id).await?.is_none() {
            debug!(
                thread_id = summary.id,
                channel_id = summary.parent_id,
                "Thread event for untracked channel, ignoring"
            );
            return Ok(());
        }

        let Some(starter) = self.api.fetch_starter_message(summary.id).await? else {
            warn!(thread_id = summary.id, "Thread event without a starter message");
            return Ok(());
        };

        self.reconciler
            .reconcile_thread(
                summary.parent_id,
                None,
                &summary,
                std::slice::from_ref(&starter),
                &self.cancel,
            )
            .await?;
        Ok(())
    }

    /// Refresh a thread's inline body after a starter edit, keeping every
    /// other column as stored.
    async fn update_thread_body(&self, thread: &crate::db::Thread, msg: &Message) -> Result<()> {
        let (body_html, _) = self.reconciler.render_body(msg, &self.cancel).await;
        upsert_thread(
            self.db.pool(),
            "live",
            &NewThread {
                id: thread.id,
                channel_id: thread.channel_id,
                slug: thread.slug.clone(),
                title: thread.title.clone(),
                author_alias: thread.author_alias.clone(),
                body_html,
                tags: thread.tag_list(),
                created_at: thread.created_at.clone(),
            },
        )
        .await
    }
}

/// Consume events until the channel closes or cancellation fires.
pub async fn run_event_loop(handler: LiveHandler, mut rx: mpsc::Receiver<PlatformEvent>) {
    loop {
        tokio::select! {
            () = handler.cancel.cancelled() => {
                info!("Event loop shutting down");
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else {
                    info!("Event stream closed");
                    break;
                };
                if let Err(e) = handler.handle(event).await {
                    error!("Failed to apply live event: {e:#}");
                }
            }
        }
    }
}
