//! In-memory ordered log of messages for one open conversation.
//!
//! Owns dedup and provisional/authoritative reconciliation. Entries are
//! sorted ascending by `created_at`; ties keep stable insertion order.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::constants::DEDUP_WINDOW_MS;
use crate::models::{ConversationRef, Message, MessageRow, ProfileSummary, UserId};

/// Result of merging one authoritative push row into the store.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// A provisional entry was replaced in place by the authoritative row.
    Merged(Message),
    /// The row originated elsewhere and was inserted as a new message.
    Inserted(Message),
    /// The row's authoritative id is already present (redelivery).
    Duplicate,
}

/// Whether `pending` and `row` are the same logical message.
///
/// Exact client-tag equality wins when both sides carry a tag; rows lacking
/// a tag fall back to the legacy `(sender, content, 5s window)` heuristic.
fn row_matches(pending: &Message, row: &MessageRow) -> bool {
    if let (Some(a), Some(b)) = (&pending.client_tag, &row.client_tag) {
        return a == b;
    }
    pending.sender_id == row.sender_id
        && pending.content == row.content
        && (pending.created_at - row.created_at).abs() <= DEDUP_WINDOW_MS
}

/// Same identity check between an authoritative entry and a still-pending
/// one, used when rebuilding from a history refetch.
fn covers(authoritative: &Message, pending: &Message) -> bool {
    if let (Some(a), Some(b)) = (&authoritative.client_tag, &pending.client_tag) {
        return a == b;
    }
    authoritative.sender_id == pending.sender_id
        && authoritative.content == pending.content
        && (authoritative.created_at - pending.created_at).abs() <= DEDUP_WINDOW_MS
}

pub struct ConversationStore {
    conversation: ConversationRef,
    messages: Vec<Message>,
    /// Advanced on sends and merges; drives conversation-list ordering,
    /// which is an external concern.
    last_activity: i64,
}

impl ConversationStore {
    pub fn new(conversation: ConversationRef) -> Self {
        Self {
            conversation,
            messages: Vec::new(),
            last_activity: 0,
        }
    }

    pub fn conversation(&self) -> &ConversationRef {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity
    }

    pub fn touch_activity(&mut self, at: i64) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    /// Insert preserving ascending `created_at` order; equal timestamps
    /// land after existing entries (stable insertion).
    fn insert_sorted(&mut self, message: Message) {
        let pos = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(pos, message);
    }

    pub fn insert_provisional(&mut self, message: Message) {
        debug_assert!(message.pending);
        self.touch_activity(message.created_at);
        self.insert_sorted(message);
    }

    /// Remove a provisional entry after a failed durable write.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        before != self.messages.len()
    }

    /// Merge one authoritative row. Postcondition: at most one entry per
    /// dedup identity.
    pub fn reconcile(&mut self, row: MessageRow) -> ReconcileOutcome {
        if self.messages.iter().any(|m| m.id == row.id) {
            return ReconcileOutcome::Duplicate;
        }

        if let Some(idx) = self
            .messages
            .iter()
            .position(|m| m.pending && row_matches(m, &row))
        {
            // Replace in place: adopt the authoritative id and timestamp but
            // keep an already-resolved profile so the UI never flashes a
            // missing avatar after confirmation.
            let mut message = self.messages.remove(idx);
            message.id = row.id;
            message.created_at = row.created_at;
            message.pending = false;
            if message.sender_profile.is_none() {
                message.sender_profile = row.sender_profile;
            }
            self.touch_activity(message.created_at);
            self.insert_sorted(message.clone());
            return ReconcileOutcome::Merged(message);
        }

        let message = Message::from_row(row);
        self.touch_activity(message.created_at);
        self.insert_sorted(message.clone());
        ReconcileOutcome::Inserted(message)
    }

    /// Rebuild from a full history refetch (reconnect path). Provisional
    /// entries not yet covered by an authoritative row are re-applied.
    pub fn replace_all(&mut self, rows: Vec<MessageRow>) {
        let pending: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.pending)
            .cloned()
            .collect();
        self.messages.clear();
        for row in rows {
            self.reconcile(row);
        }
        for p in pending {
            let confirmed = self.messages.iter().any(|m| !m.pending && covers(m, &p));
            if !confirmed {
                self.insert_sorted(p);
            }
        }
    }

    /// Attach a resolved profile to every message by `sender_id` that still
    /// lacks one. Returns how many entries were patched.
    pub fn patch_profiles(&mut self, sender_id: &UserId, profile: &ProfileSummary) -> usize {
        let mut patched = 0;
        for m in &mut self.messages {
            if &m.sender_id == sender_id && m.sender_profile.is_none() {
                m.sender_profile = Some(profile.clone());
                patched += 1;
            }
        }
        patched
    }

    /// Unread count derived from a watermark: messages after `watermark`
    /// not authored by `self_id`.
    pub fn unread_after(&self, watermark: i64, self_id: &UserId) -> u64 {
        self.messages
            .iter()
            .filter(|m| m.created_at > watermark && &m.sender_id != self_id)
            .count() as u64
    }
}

/// All open conversation stores, keyed by reference. One writer context per
/// store is enforced by the fan-in coordinator; the mutex preserves the
/// invariant when embedded in a multithreaded host.
#[derive(Default)]
pub struct ConversationRegistry {
    inner: Mutex<HashMap<ConversationRef, ConversationStore>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against the store for `conversation`, creating it if absent.
    pub fn with<R>(
        &self,
        conversation: &ConversationRef,
        f: impl FnOnce(&mut ConversationStore) -> R,
    ) -> R {
        let mut inner = self.inner.lock();
        let store = inner
            .entry(conversation.clone())
            .or_insert_with(|| ConversationStore::new(conversation.clone()));
        f(store)
    }

    /// Run `f` against the store for `conversation` only if one exists.
    /// Late completions of in-flight work use this so a closed conversation
    /// is not resurrected as an empty entry.
    pub fn with_existing<R>(
        &self,
        conversation: &ConversationRef,
        f: impl FnOnce(&mut ConversationStore) -> R,
    ) -> Option<R> {
        self.inner.lock().get_mut(conversation).map(f)
    }

    pub fn insert_provisional(&self, message: Message) {
        let conversation = message.conversation.clone();
        self.with(&conversation, |s| s.insert_provisional(message));
    }

    pub fn remove_message(&self, conversation: &ConversationRef, id: &str) -> bool {
        self.with_existing(conversation, |s| s.remove(id))
            .unwrap_or(false)
    }

    pub fn reconcile(&self, row: MessageRow) -> ReconcileOutcome {
        let conversation = row.conversation.clone();
        self.with(&conversation, |s| s.reconcile(row))
    }

    pub fn replace_all(&self, conversation: &ConversationRef, rows: Vec<MessageRow>) {
        self.with(conversation, |s| s.replace_all(rows));
    }

    /// Patch every open conversation containing unenriched messages by this
    /// sender. Returns the conversations that changed.
    pub fn patch_profiles(
        &self,
        sender_id: &UserId,
        profile: &ProfileSummary,
    ) -> Vec<ConversationRef> {
        let mut inner = self.inner.lock();
        inner
            .values_mut()
            .filter_map(|store| {
                (store.patch_profiles(sender_id, profile) > 0)
                    .then(|| store.conversation().clone())
            })
            .collect()
    }

    pub fn snapshot(&self, conversation: &ConversationRef) -> Vec<Message> {
        self.inner
            .lock()
            .get(conversation)
            .map(|s| s.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn remove(&self, conversation: &ConversationRef) {
        self.inner.lock().remove(conversation);
    }

    pub fn tracked(&self) -> Vec<ConversationRef> {
        self.inner.lock().keys().cloned().collect()
    }
}
