use crate::models::ConversationRef;

/// Error taxonomy for the sync subsystem.
///
/// None of these are fatal to the process: every variant degrades to a
/// visibly stale or user-retriable state.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Durable write rejected by the backend. The provisional message has
    /// already been rolled back; the user may resend manually.
    #[error("send failed: {0}")]
    SendFailure(String),

    /// Durable write did not resolve within the configured bound.
    #[error("send timed out after {0}ms")]
    SendTimeout(u64),

    /// Push stream could not be established or dropped mid-flight.
    #[error("push subscription failed: {0}")]
    SubscriptionFailure(String),

    /// Profile lookup failed; the message keeps its placeholder identity.
    #[error("profile lookup failed for {sender_id}: {reason}")]
    EnrichmentFailure { sender_id: String, reason: String },

    /// Unread count query failed; the prior cached count is retained.
    #[error("unread recompute failed for {conversation}: {reason}")]
    RecomputeFailure {
        conversation: ConversationRef,
        reason: String,
    },

    /// Message content empty after trimming and no attachment reference.
    #[error("message content is empty")]
    EmptyMessage,

    /// The permission collaborator denied the send.
    #[error("not permitted to send to {0}")]
    PermissionDenied(ConversationRef),

    /// Any other backend failure surfaced through a collaborator trait.
    #[error("backend error: {0}")]
    Backend(String),
}
