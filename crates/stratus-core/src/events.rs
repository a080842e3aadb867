use crate::models::{ConversationRef, Surface, UnreadSummary};
use crate::sync::coordinator::SubscriptionState;

/// Events emitted by the runtime so a presentation layer can re-render.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// The ordered message log for a conversation changed (insert, merge,
    /// rollback, profile patch or history refetch).
    MessagesChanged(ConversationRef),
    /// The unread summary changed; carries the new snapshot.
    CountsChanged(UnreadSummary),
    /// A push subscription changed state (UI may show a "reconnecting" hint).
    SubscriptionState {
        surface: Surface,
        state: SubscriptionState,
    },
}
