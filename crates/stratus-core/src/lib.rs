//! Client-side conversation sync core.
//!
//! Keeps per-conversation message logs consistent under optimistic local
//! sends and authoritative push delivery, maintains read watermarks and
//! unread counts, and multiplexes one push subscription per surface.
//! UI-agnostic: frontends consume [`CoreRuntime`] and the [`CoreEvent`]
//! broadcast.

pub mod backend;
pub mod config;
pub mod constants;
pub mod errors;
pub mod events;
pub mod models;
pub mod runtime;
pub mod store;
pub mod sync;

pub use backend::{Backend, MemoryBackend};
pub use config::CoreConfig;
pub use errors::SyncError;
pub use events::CoreEvent;
pub use models::{
    ConversationClass, ConversationRef, Message, ProfileSummary, SendReceipt, Surface,
    UnreadSummary, UserId,
};
pub use runtime::CoreRuntime;
pub use sync::SubscriptionState;
