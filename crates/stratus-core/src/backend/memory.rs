//! In-memory backend used by the CLI scenarios and the test suite.
//!
//! Implements the full collaborator surface over process-local state and
//! offers failure-injection knobs (rejected writes, failing profile lookups,
//! dropped subscriptions) so reconnect and rollback paths can be exercised
//! deterministically.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use super::{Backend, InsertAck, MembershipEvent, NewMessage, Presence, PushSubscription};
use crate::errors::SyncError;
use crate::models::{ConversationRef, GroupId, MessageRow, ProfileSummary, Surface, UserId};

/// Row as persisted. For direct messages `conversation` holds the
/// recipient side, exactly as the sender wrote it.
#[derive(Debug, Clone)]
struct StoredRow {
    id: String,
    conversation: ConversationRef,
    sender_id: UserId,
    content: String,
    created_at: i64,
    client_tag: Option<String>,
}

struct Subscriber {
    user: UserId,
    surface: Surface,
    tx: mpsc::Sender<MessageRow>,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    rows: Vec<StoredRow>,
    subscribers: Vec<Subscriber>,
    profiles: HashMap<UserId, ProfileSummary>,
    profile_failures: HashMap<UserId, u32>,
    groups: HashMap<UserId, Vec<GroupId>>,
    watermarks: HashMap<(UserId, ConversationRef), i64>,
    presence: HashMap<UserId, Presence>,
    denied_sends: HashSet<(UserId, ConversationRef)>,
    fail_inserts: bool,
    fail_counts: bool,
    fail_watermarks: bool,
    refuse_subscribe: bool,
}

pub struct MemoryBackend {
    inner: Mutex<Inner>,
    membership_tx: broadcast::Sender<MembershipEvent>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (membership_tx, _) = broadcast::channel(16);
        Self {
            inner: Mutex::new(Inner::default()),
            membership_tx,
        }
    }

    pub fn set_profile(&self, user: impl Into<UserId>, profile: ProfileSummary) {
        self.inner.lock().profiles.insert(user.into(), profile);
    }

    /// The next `n` profile lookups for `user` fail before succeeding.
    pub fn fail_profile_lookups(&self, user: impl Into<UserId>, n: u32) {
        self.inner.lock().profile_failures.insert(user.into(), n);
    }

    pub fn set_groups(&self, user: impl Into<UserId>, groups: Vec<GroupId>) {
        let user = user.into();
        self.inner.lock().groups.insert(user.clone(), groups);
        let _ = self.membership_tx.send(MembershipEvent { user_id: user });
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.inner.lock().fail_inserts = fail;
    }

    pub fn set_fail_counts(&self, fail: bool) {
        self.inner.lock().fail_counts = fail;
    }

    pub fn set_fail_watermarks(&self, fail: bool) {
        self.inner.lock().fail_watermarks = fail;
    }

    pub fn set_refuse_subscribe(&self, refuse: bool) {
        self.inner.lock().refuse_subscribe = refuse;
    }

    pub fn deny_send(&self, user: impl Into<UserId>, conversation: ConversationRef) {
        self.inner.lock().denied_sends.insert((user.into(), conversation));
    }

    pub fn set_presence(&self, user: impl Into<UserId>, presence: Presence) {
        self.inner.lock().presence.insert(user.into(), presence);
    }

    /// Disconnect every live subscription on `surface`, simulating a dropped
    /// push stream. Rows inserted before resubscription are silently missed.
    pub fn drop_surface(&self, surface: &Surface) {
        self.inner
            .lock()
            .subscribers
            .retain(|s| &s.surface != surface);
    }

    /// Row as seen by `viewer`, or None when not visible to them.
    /// Direct rows are rewritten to the viewer's perspective.
    fn view_for(viewer: &UserId, row: &StoredRow) -> Option<MessageRow> {
        let conversation = match &row.conversation {
            ConversationRef::Direct { partner_id } => {
                if &row.sender_id == viewer {
                    ConversationRef::direct(partner_id.clone())
                } else if partner_id == viewer {
                    ConversationRef::direct(row.sender_id.clone())
                } else {
                    return None;
                }
            }
            other => other.clone(),
        };
        Some(MessageRow {
            id: row.id.clone(),
            conversation,
            sender_id: row.sender_id.clone(),
            content: row.content.clone(),
            created_at: row.created_at,
            client_tag: row.client_tag.clone(),
            // Push payloads do not carry profiles; enrichment fills them in.
            sender_profile: None,
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn insert_message(&self, row: NewMessage) -> Result<InsertAck, SyncError> {
        let mut inner = self.inner.lock();
        if inner.fail_inserts {
            return Err(SyncError::SendFailure("write rejected".to_string()));
        }
        inner.seq += 1;
        let stored = StoredRow {
            id: format!("srv-{}", inner.seq),
            conversation: row.conversation,
            sender_id: row.sender_id,
            content: row.content,
            created_at: row.created_at,
            client_tag: Some(row.client_tag),
        };
        let ack = InsertAck {
            id: stored.id.clone(),
            created_at: stored.created_at,
        };

        // Fan out to matching live subscriptions, pruning closed ones.
        let mut closed = Vec::new();
        for (idx, sub) in inner.subscribers.iter().enumerate() {
            let visible = match (&sub.surface, &stored.conversation) {
                (Surface::Sector(s), ConversationRef::Sector { sector_id }) => s == sector_id,
                (Surface::Group(g), ConversationRef::Group { group_id }) => g == group_id,
                (Surface::DirectInbox, ConversationRef::Direct { partner_id }) => {
                    sub.user == stored.sender_id || &sub.user == partner_id
                }
                _ => false,
            };
            if !visible {
                continue;
            }
            if let Some(view) = Self::view_for(&sub.user, &stored) {
                if sub.tx.try_send(view).is_err() {
                    closed.push(idx);
                }
            }
        }
        for idx in closed.into_iter().rev() {
            inner.subscribers.remove(idx);
        }

        inner.rows.push(stored);
        Ok(ack)
    }

    async fn fetch_history(
        &self,
        user: &UserId,
        conversation: &ConversationRef,
    ) -> Result<Vec<MessageRow>, SyncError> {
        let inner = self.inner.lock();
        let mut rows: Vec<MessageRow> = inner
            .rows
            .iter()
            .filter_map(|r| Self::view_for(user, r))
            .filter(|r| &r.conversation == conversation)
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn count_unread(
        &self,
        user: &UserId,
        conversation: &ConversationRef,
        after: i64,
    ) -> Result<u64, SyncError> {
        let inner = self.inner.lock();
        if inner.fail_counts {
            return Err(SyncError::RecomputeFailure {
                conversation: conversation.clone(),
                reason: "count query unavailable".to_string(),
            });
        }
        let count = inner
            .rows
            .iter()
            .filter_map(|r| Self::view_for(user, r))
            .filter(|r| &r.conversation == conversation)
            .filter(|r| r.created_at > after && &r.sender_id != user)
            .count();
        Ok(count as u64)
    }

    async fn subscribe(
        &self,
        user: &UserId,
        surface: &Surface,
    ) -> Result<PushSubscription, SyncError> {
        let mut inner = self.inner.lock();
        if inner.refuse_subscribe {
            return Err(SyncError::SubscriptionFailure(format!(
                "subscribe refused for {surface}"
            )));
        }
        let (tx, rx) = mpsc::channel(256);
        inner.subscribers.push(Subscriber {
            user: user.clone(),
            surface: surface.clone(),
            tx,
        });
        Ok(PushSubscription { rows: rx })
    }

    async fn get_profile(&self, user: &UserId) -> Result<Option<ProfileSummary>, SyncError> {
        let mut inner = self.inner.lock();
        if let Some(remaining) = inner.profile_failures.get_mut(user) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::EnrichmentFailure {
                    sender_id: user.clone(),
                    reason: "lookup unavailable".to_string(),
                });
            }
        }
        Ok(inner.profiles.get(user).cloned())
    }

    async fn groups_for_user(&self, user: &UserId) -> Result<Vec<GroupId>, SyncError> {
        Ok(self.inner.lock().groups.get(user).cloned().unwrap_or_default())
    }

    fn membership_changes(&self) -> broadcast::Receiver<MembershipEvent> {
        self.membership_tx.subscribe()
    }

    async fn can_send(
        &self,
        user: &UserId,
        conversation: &ConversationRef,
    ) -> Result<bool, SyncError> {
        let inner = self.inner.lock();
        Ok(!inner
            .denied_sends
            .contains(&(user.clone(), conversation.clone())))
    }

    async fn get_presence(&self, user: &UserId) -> Result<Presence, SyncError> {
        Ok(self.inner.lock().presence.get(user).copied().unwrap_or_default())
    }

    async fn save_watermark(
        &self,
        user: &UserId,
        conversation: &ConversationRef,
        last_read_at: i64,
    ) -> Result<(), SyncError> {
        let mut inner = self.inner.lock();
        if inner.fail_watermarks {
            return Err(SyncError::Backend("watermark store unavailable".to_string()));
        }
        inner
            .watermarks
            .insert((user.clone(), conversation.clone()), last_read_at);
        Ok(())
    }

    async fn load_watermarks(
        &self,
        user: &UserId,
    ) -> Result<Vec<(ConversationRef, i64)>, SyncError> {
        Ok(self
            .inner
            .lock()
            .watermarks
            .iter()
            .filter(|((u, _), _)| u == user)
            .map(|((_, c), at)| (c.clone(), *at))
            .collect())
    }
}
