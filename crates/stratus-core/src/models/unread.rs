use serde::{Deserialize, Serialize};

/// Cross-cutting unread snapshot pushed to notification surfaces.
///
/// `external` carries counts owned by out-of-scope collaborators
/// (announcements, generic notifications) merged here for the single
/// badge value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    pub direct: u64,
    pub group: u64,
    pub external: u64,
    pub total: u64,
}

impl UnreadSummary {
    pub fn new(direct: u64, group: u64, external: u64) -> Self {
        Self {
            direct,
            group,
            external,
            total: direct + group + external,
        }
    }
}
