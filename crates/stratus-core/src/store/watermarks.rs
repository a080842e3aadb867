//! Per-(conversation, user) read watermarks.
//!
//! The in-memory map is the session source of truth; every advance is also
//! persisted through the backend so unread state survives restarts. Absent
//! watermarks read as epoch zero. Self-authored messages are excluded by
//! the unread derivation, so a thread the user started still reads as
//! caught up for them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::backend::Backend;
use crate::errors::SyncError;
use crate::models::{now_ms, ConversationRef, UserId};

pub struct WatermarkStore {
    user: UserId,
    backend: Arc<dyn Backend>,
    inner: Mutex<HashMap<ConversationRef, i64>>,
}

impl WatermarkStore {
    pub fn new(user: UserId, backend: Arc<dyn Backend>) -> Self {
        Self {
            user,
            backend,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Populate from persisted state. Called once at startup.
    pub async fn load(&self) -> Result<(), SyncError> {
        let persisted = self.backend.load_watermarks(&self.user).await?;
        let mut inner = self.inner.lock();
        for (conversation, at) in persisted {
            let entry = inner.entry(conversation).or_insert(0);
            if at > *entry {
                *entry = at;
            }
        }
        Ok(())
    }

    /// Advance the watermark to now. Monotonic: an earlier stored value is
    /// never restored, and a no-op advance skips the persistence write.
    ///
    /// A failed persistence write is logged and otherwise ignored: the
    /// session-local value stays advanced so the conversation the user is
    /// looking at reads as read, and the next advance retries the write.
    pub async fn mark_read(&self, conversation: &ConversationRef) -> i64 {
        let now = now_ms();
        let advanced = {
            let mut inner = self.inner.lock();
            let entry = inner.entry(conversation.clone()).or_insert(0);
            if now > *entry {
                *entry = now;
                true
            } else {
                false
            }
        };
        if advanced {
            if let Err(err) = self
                .backend
                .save_watermark(&self.user, conversation, now)
                .await
            {
                warn!(%conversation, %err, "watermark persistence failed; keeping session-local value");
            }
        }
        self.watermark(conversation)
    }

    /// Idempotent read; epoch zero when absent.
    pub fn watermark(&self, conversation: &ConversationRef) -> i64 {
        self.inner.lock().get(conversation).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn set_for_test(&self, conversation: &ConversationRef, at: i64) {
        self.inner.lock().insert(conversation.clone(), at);
    }
}
