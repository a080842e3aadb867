//! Per-conversation unread counts merged into a single badge signal.
//!
//! Counts are cached, adjusted incrementally (+1 per qualifying push event)
//! between full recomputes, and repaired by full recomputes on membership
//! change, reconnect and a fixed drift interval.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::watermarks::WatermarkStore;
use crate::backend::Backend;
use crate::errors::SyncError;
use crate::models::{ConversationClass, ConversationRef, Message, UnreadSummary, UserId};

pub struct UnreadAggregator {
    user: UserId,
    backend: Arc<dyn Backend>,
    watermarks: Arc<WatermarkStore>,
    counts: Mutex<HashMap<ConversationRef, u64>>,
    /// Externally supplied counts (announcements, generic notifications),
    /// keyed by source label and merged into the grand total only.
    external: Mutex<HashMap<String, u64>>,
    tx: watch::Sender<UnreadSummary>,
}

impl UnreadAggregator {
    pub fn new(user: UserId, backend: Arc<dyn Backend>, watermarks: Arc<WatermarkStore>) -> Self {
        let (tx, _) = watch::channel(UnreadSummary::default());
        Self {
            user,
            backend,
            watermarks,
            counts: Mutex::new(HashMap::new()),
            external: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Receiver of `{direct, group, external, total}` snapshots, updated on
    /// every change.
    pub fn subscribe(&self) -> watch::Receiver<UnreadSummary> {
        self.tx.subscribe()
    }

    /// Full count query replacing the cached value. On failure the prior
    /// cached count is retained (stale-but-available) to avoid false
    /// "all read" flashes.
    pub async fn recompute(&self, conversation: &ConversationRef) -> Result<u64, SyncError> {
        let after = self.watermarks.watermark(conversation);
        match self
            .backend
            .count_unread(&self.user, conversation, after)
            .await
        {
            Ok(count) => {
                self.counts.lock().insert(conversation.clone(), count);
                self.publish();
                Ok(count)
            }
            Err(err) => {
                warn!(%conversation, %err, "unread recompute failed; keeping cached count");
                Err(err)
            }
        }
    }

    /// Incremental adjustment for one newly inserted push row. Self-authored
    /// messages never count.
    pub fn apply_delta(&self, conversation: &ConversationRef, message: &Message) {
        if message.sender_id == self.user {
            return;
        }
        if message.created_at <= self.watermarks.watermark(conversation) {
            return;
        }
        let mut counts = self.counts.lock();
        *counts.entry(conversation.clone()).or_insert(0) += 1;
        drop(counts);
        debug!(%conversation, "unread +1");
        self.publish();
    }

    /// Reset one conversation to zero after the user viewed it.
    pub fn clear(&self, conversation: &ConversationRef) {
        self.counts.lock().insert(conversation.clone(), 0);
        self.publish();
    }

    /// Forget a conversation entirely (left group, closed surface).
    pub fn remove(&self, conversation: &ConversationRef) {
        self.counts.lock().remove(conversation);
        self.publish();
    }

    pub fn count(&self, conversation: &ConversationRef) -> u64 {
        self.counts.lock().get(conversation).copied().unwrap_or(0)
    }

    pub fn total(&self, class: ConversationClass) -> u64 {
        self.counts
            .lock()
            .iter()
            .filter(|(c, _)| c.class() == class)
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn grand_total(&self) -> u64 {
        self.summary().total
    }

    /// Merge a count owned by an out-of-scope collaborator into the badge.
    pub fn set_external_count(&self, source: impl Into<String>, count: u64) {
        self.external.lock().insert(source.into(), count);
        self.publish();
    }

    pub fn summary(&self) -> UnreadSummary {
        let direct = self.total(ConversationClass::Direct);
        let group = self.total(ConversationClass::Group);
        let external: u64 = self.external.lock().values().sum();
        UnreadSummary::new(direct, group, external)
    }

    /// Conversations with a cached count, used for drift recomputes and
    /// reconnect repair.
    pub fn tracked(&self) -> Vec<ConversationRef> {
        self.counts.lock().keys().cloned().collect()
    }

    fn publish(&self) {
        self.tx.send_replace(self.summary());
    }
}
