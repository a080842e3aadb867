//! Optimistic send: provisional local echo, durable write, rollback.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backend::{Backend, NewMessage};
use crate::errors::SyncError;
use crate::events::CoreEvent;
use crate::models::{now_ms, ConversationRef, Message, ProfileSummary, SendReceipt, UserId};
use crate::store::ConversationRegistry;

pub struct SendCoordinator {
    user: UserId,
    /// The caller's own cached profile, attached to provisional entries so
    /// the sender's name/avatar render instantly.
    own_profile: Mutex<Option<ProfileSummary>>,
    backend: Arc<dyn Backend>,
    registry: Arc<ConversationRegistry>,
    events: broadcast::Sender<CoreEvent>,
    send_timeout: Duration,
}

impl SendCoordinator {
    pub fn new(
        user: UserId,
        backend: Arc<dyn Backend>,
        registry: Arc<ConversationRegistry>,
        events: broadcast::Sender<CoreEvent>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            user,
            own_profile: Mutex::new(None),
            backend,
            registry,
            events,
            send_timeout,
        }
    }

    pub fn set_own_profile(&self, profile: Option<ProfileSummary>) {
        *self.own_profile.lock() = profile;
    }

    /// Insert a provisional echo, issue the durable write, and roll back on
    /// failure or timeout. No explicit replace happens on success: the push
    /// echo is the single source of truth for the final id, and the
    /// reconciler resolves the provisional entry against it.
    ///
    /// Concurrent sends queue independently; the client tag on each
    /// provisional entry keeps rapid identical-content sends distinct.
    pub async fn send(
        &self,
        conversation: ConversationRef,
        content: String,
    ) -> Result<SendReceipt, SyncError> {
        // Attachment references are embedded in the body, so an all-
        // whitespace body has nothing to send.
        if content.trim().is_empty() {
            return Err(SyncError::EmptyMessage);
        }

        let message = Message::provisional(
            conversation.clone(),
            self.user.clone(),
            content.clone(),
            now_ms(),
            self.own_profile.lock().clone(),
        );
        let provisional_id = message.id.clone();
        let client_tag = message.client_tag.clone().unwrap_or_default();
        let created_at = message.created_at;

        self.registry.insert_provisional(message);
        let _ = self
            .events
            .send(CoreEvent::MessagesChanged(conversation.clone()));
        debug!(%conversation, %provisional_id, "provisional echo inserted");

        let write = self.backend.insert_message(NewMessage {
            conversation: conversation.clone(),
            sender_id: self.user.clone(),
            content,
            created_at,
            client_tag: client_tag.clone(),
        });

        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(Ok(ack)) => {
                self.registry
                    .with_existing(&conversation, |s| s.touch_activity(ack.created_at));
                Ok(SendReceipt {
                    id: ack.id,
                    created_at: ack.created_at,
                    client_tag,
                })
            }
            Ok(Err(err)) => {
                warn!(%conversation, %err, "durable write failed; rolling back");
                self.rollback(&conversation, &provisional_id);
                Err(err)
            }
            Err(_) => {
                warn!(%conversation, "durable write timed out; rolling back");
                self.rollback(&conversation, &provisional_id);
                Err(SyncError::SendTimeout(self.send_timeout.as_millis() as u64))
            }
        }
    }

    fn rollback(&self, conversation: &ConversationRef, provisional_id: &str) {
        if self.registry.remove_message(conversation, provisional_id) {
            let _ = self
                .events
                .send(CoreEvent::MessagesChanged(conversation.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn coordinator() -> (Arc<MemoryBackend>, Arc<ConversationRegistry>, SendCoordinator) {
        let backend = Arc::new(MemoryBackend::new());
        let registry = Arc::new(ConversationRegistry::new());
        let (events, _) = broadcast::channel(64);
        let sender = SendCoordinator::new(
            "alice".to_string(),
            backend.clone(),
            registry.clone(),
            events,
            Duration::from_millis(500),
        );
        (backend, registry, sender)
    }

    #[tokio::test]
    async fn test_send_leaves_provisional_until_echo() {
        let (_backend, registry, sender) = coordinator();
        let conv = ConversationRef::direct("bob");

        let receipt = sender.send(conv.clone(), "Hello".to_string()).await.unwrap();
        assert!(receipt.id.starts_with("srv-"));

        // No push echo has been reconciled yet: the optimistic entry stays
        // provisional with its local id.
        let messages = registry.snapshot(&conv);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].pending);
        assert_eq!(messages[0].client_tag.as_deref(), Some(receipt.client_tag.as_str()));
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let (backend, registry, sender) = coordinator();
        let conv = ConversationRef::direct("bob");
        backend.set_fail_inserts(true);

        let err = sender.send(conv.clone(), "Hello".to_string()).await.unwrap_err();
        assert!(matches!(err, SyncError::SendFailure(_)));
        assert!(registry.snapshot(&conv).is_empty());
    }

    #[tokio::test]
    async fn test_empty_content_rejected_before_any_echo() {
        let (_backend, registry, sender) = coordinator();
        let conv = ConversationRef::group("eng");

        let err = sender.send(conv.clone(), "   \n".to_string()).await.unwrap_err();
        assert!(matches!(err, SyncError::EmptyMessage));
        assert!(registry.snapshot(&conv).is_empty());
    }

    #[tokio::test]
    async fn test_own_profile_attached_to_provisional() {
        let (_backend, registry, sender) = coordinator();
        sender.set_own_profile(Some(ProfileSummary {
            display_name: "Alice".to_string(),
            avatar_url: None,
            sector_id: Some("hq".to_string()),
        }));

        let conv = ConversationRef::sector("hq");
        sender.send(conv.clone(), "ship it".to_string()).await.unwrap();

        let messages = registry.snapshot(&conv);
        assert_eq!(
            messages[0].sender_profile.as_ref().unwrap().display_name,
            "Alice"
        );
    }

    #[tokio::test]
    async fn test_rapid_identical_sends_stay_distinct() {
        let (_backend, registry, sender) = coordinator();
        let conv = ConversationRef::direct("bob");

        let first = sender.send(conv.clone(), "ping".to_string()).await.unwrap();
        let second = sender.send(conv.clone(), "ping".to_string()).await.unwrap();
        assert_ne!(first.client_tag, second.client_tag);
        assert_eq!(registry.snapshot(&conv).len(), 2);
    }
}
