use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::conversation::{ConversationRef, UserId};
use crate::constants::{PLACEHOLDER_DISPLAY_NAME, PROVISIONAL_ID_PREFIX};

/// Denormalized sender display metadata. Populated lazily; never required
/// for ordering or dedup correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub sector_id: Option<String>,
}

/// One message in a conversation log. A single shape covers all three
/// conversation kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Stable identifier once persisted; provisional messages carry a
    /// `local-` prefixed id until the push echo confirms them.
    pub id: String,
    pub conversation: ConversationRef,
    pub sender_id: UserId,
    /// Text body. May embed formatting markers and attachment links,
    /// opaque to this subsystem.
    pub content: String,
    /// Unix milliseconds. Server-assigned once persisted, clock-of-send
    /// for provisional entries.
    pub created_at: i64,
    /// Client-generated idempotency key carried through the durable write
    /// and matched exactly on reconciliation.
    pub client_tag: Option<String>,
    pub sender_profile: Option<ProfileSummary>,
    /// True until the authoritative push echo replaces this entry.
    pub pending: bool,
}

impl Message {
    /// Synthesize a provisional message for optimistic local echo.
    pub fn provisional(
        conversation: ConversationRef,
        sender_id: UserId,
        content: String,
        created_at: i64,
        sender_profile: Option<ProfileSummary>,
    ) -> Self {
        Self {
            id: format!("{PROVISIONAL_ID_PREFIX}{}", Uuid::new_v4()),
            conversation,
            sender_id,
            content,
            created_at,
            client_tag: Some(Uuid::new_v4().to_string()),
            sender_profile,
            pending: true,
        }
    }

    /// Build an authoritative message from a push row.
    pub fn from_row(row: MessageRow) -> Self {
        Self {
            id: row.id,
            conversation: row.conversation,
            sender_id: row.sender_id,
            content: row.content,
            created_at: row.created_at,
            client_tag: row.client_tag,
            sender_profile: row.sender_profile,
            pending: false,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.pending
    }

    /// Name to render for the sender; a placeholder until enrichment
    /// resolves the profile.
    pub fn display_name(&self) -> &str {
        self.sender_profile
            .as_ref()
            .map(|p| p.display_name.as_str())
            .unwrap_or(PLACEHOLDER_DISPLAY_NAME)
    }
}

/// Minimal row shape delivered by the push stream and history queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub conversation: ConversationRef,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_profile: Option<ProfileSummary>,
}

/// Outcome of a successful durable write. The authoritative echo still
/// arrives over the push stream; this only acknowledges submission.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    /// Server-assigned id of the persisted row.
    pub id: String,
    /// Server-assigned timestamp, unix milliseconds.
    pub created_at: i64,
    /// Idempotency key the reconciler will match the echo against.
    pub client_tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisional_message_is_marked() {
        let msg = Message::provisional(
            ConversationRef::direct("bob"),
            "alice".to_string(),
            "hello".to_string(),
            1_000,
            None,
        );
        assert!(msg.is_provisional());
        assert!(msg.id.starts_with(PROVISIONAL_ID_PREFIX));
        assert!(msg.client_tag.is_some());
        assert_eq!(msg.display_name(), PLACEHOLDER_DISPLAY_NAME);
    }

    #[test]
    fn test_from_row_is_authoritative() {
        let row = MessageRow {
            id: "srv-1".to_string(),
            conversation: ConversationRef::group("eng"),
            sender_id: "bob".to_string(),
            content: "hi".to_string(),
            created_at: 2_000,
            client_tag: None,
            sender_profile: None,
        };
        let msg = Message::from_row(row);
        assert!(!msg.is_provisional());
        assert_eq!(msg.id, "srv-1");
    }

    #[test]
    fn test_row_serde_omits_absent_optionals() {
        let row = MessageRow {
            id: "srv-2".to_string(),
            conversation: ConversationRef::sector("hq"),
            sender_id: "carol".to_string(),
            content: "announcement".to_string(),
            created_at: 3_000,
            client_tag: None,
            sender_profile: None,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("client_tag").is_none());
        assert!(json.get("sender_profile").is_none());
    }
}
