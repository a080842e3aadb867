pub mod conversation;
pub mod message;
pub mod unread;

pub use conversation::{ConversationClass, ConversationRef, GroupId, SectorId, Surface, UserId};
pub use message::{Message, MessageRow, ProfileSummary, SendReceipt};
pub use unread::UnreadSummary;

use chrono::Utc;

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
