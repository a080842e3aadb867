//! Collaborator interfaces consumed by the sync core.
//!
//! Authentication, permissions, the storage engine and presence computation
//! all live behind these traits; the core never talks to a concrete server.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::errors::SyncError;
use crate::models::{ConversationRef, GroupId, MessageRow, ProfileSummary, Surface, UserId};

pub use memory::MemoryBackend;

/// Row submitted through the durable write. The server assigns the final
/// id and timestamp; `client_tag` is persisted verbatim for reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation: ConversationRef,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: i64,
    pub client_tag: String,
}

/// Acknowledgement of a durable write.
#[derive(Debug, Clone)]
pub struct InsertAck {
    pub id: String,
    pub created_at: i64,
}

/// Read-only presence snapshot, merged into UI only.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Presence {
    pub is_online: bool,
    pub last_heartbeat: i64,
}

/// Notification that a user's group membership set changed.
#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub user_id: UserId,
}

/// A live push subscription. Dropping the receiver unsubscribes; the stream
/// ending early signals a dropped subscription.
pub struct PushSubscription {
    pub rows: mpsc::Receiver<MessageRow>,
}

/// The managed backend as seen by the sync core. Delivery over `subscribe`
/// is at-least-once with no ordering guarantee across surfaces.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Durable write. No server-side dedup is assumed.
    async fn insert_message(&self, row: NewMessage) -> Result<InsertAck, SyncError>;

    /// Full ordered history for one conversation, as visible to `user`.
    async fn fetch_history(
        &self,
        user: &UserId,
        conversation: &ConversationRef,
    ) -> Result<Vec<MessageRow>, SyncError>;

    /// Count of messages in `conversation` after `after` (exclusive) not
    /// authored by `user`.
    async fn count_unread(
        &self,
        user: &UserId,
        conversation: &ConversationRef,
        after: i64,
    ) -> Result<u64, SyncError>;

    /// Subscribe to insert events for one surface.
    async fn subscribe(
        &self,
        user: &UserId,
        surface: &Surface,
    ) -> Result<PushSubscription, SyncError>;

    async fn get_profile(&self, user: &UserId) -> Result<Option<ProfileSummary>, SyncError>;

    async fn groups_for_user(&self, user: &UserId) -> Result<Vec<GroupId>, SyncError>;

    /// Change notifications for group membership; each call returns a fresh
    /// receiver.
    fn membership_changes(&self) -> broadcast::Receiver<MembershipEvent>;

    async fn can_send(
        &self,
        user: &UserId,
        conversation: &ConversationRef,
    ) -> Result<bool, SyncError>;

    async fn get_presence(&self, user: &UserId) -> Result<Presence, SyncError>;

    async fn save_watermark(
        &self,
        user: &UserId,
        conversation: &ConversationRef,
        last_read_at: i64,
    ) -> Result<(), SyncError>;

    async fn load_watermarks(
        &self,
        user: &UserId,
    ) -> Result<Vec<(ConversationRef, i64)>, SyncError>;
}
