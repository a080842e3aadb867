pub mod conversation;
pub mod unread;
pub mod watermarks;

pub use conversation::{ConversationRegistry, ConversationStore, ReconcileOutcome};
pub use unread::UnreadAggregator;
pub use watermarks::WatermarkStore;
