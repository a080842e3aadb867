use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = String;
pub type SectorId = String;
pub type GroupId = String;

/// Discriminated reference to one of the three conversation kinds.
///
/// `Direct` carries the partner id; the local user's side is implicit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationRef {
    Sector { sector_id: SectorId },
    Direct { partner_id: UserId },
    Group { group_id: GroupId },
}

/// Conversation class used for unread aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationClass {
    Sector,
    Direct,
    Group,
}

impl ConversationRef {
    pub fn sector(id: impl Into<SectorId>) -> Self {
        Self::Sector { sector_id: id.into() }
    }

    pub fn direct(partner: impl Into<UserId>) -> Self {
        Self::Direct { partner_id: partner.into() }
    }

    pub fn group(id: impl Into<GroupId>) -> Self {
        Self::Group { group_id: id.into() }
    }

    pub fn class(&self) -> ConversationClass {
        match self {
            Self::Sector { .. } => ConversationClass::Sector,
            Self::Direct { .. } => ConversationClass::Direct,
            Self::Group { .. } => ConversationClass::Group,
        }
    }

    /// The push surface whose subscription delivers rows for this conversation.
    /// All direct threads share the single inbox surface.
    pub fn surface(&self) -> Surface {
        match self {
            Self::Sector { sector_id } => Surface::Sector(sector_id.clone()),
            Self::Direct { .. } => Surface::DirectInbox,
            Self::Group { group_id } => Surface::Group(group_id.clone()),
        }
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sector { sector_id } => write!(f, "sector:{sector_id}"),
            Self::Direct { partner_id } => write!(f, "direct:{partner_id}"),
            Self::Group { group_id } => write!(f, "group:{group_id}"),
        }
    }
}

/// A logical push surface: exactly one live subscription exists per surface
/// actively relevant to the current user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Surface {
    /// The single currently open sector broadcast channel.
    Sector(SectorId),
    /// The user's direct-message inbox, covering every direct thread.
    DirectInbox,
    /// One private group the user belongs to.
    Group(GroupId),
}

impl Surface {
    /// Whether rows for `conversation` arrive over this surface's subscription.
    pub fn owns(&self, conversation: &ConversationRef) -> bool {
        match (self, conversation) {
            (Surface::Sector(s), ConversationRef::Sector { sector_id }) => s == sector_id,
            (Surface::DirectInbox, ConversationRef::Direct { .. }) => true,
            (Surface::Group(g), ConversationRef::Group { group_id }) => g == group_id,
            _ => false,
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sector(id) => write!(f, "sector:{id}"),
            Self::DirectInbox => write!(f, "direct-inbox"),
            Self::Group(id) => write!(f, "group:{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_ownership() {
        let inbox = Surface::DirectInbox;
        assert!(inbox.owns(&ConversationRef::direct("alice")));
        assert!(inbox.owns(&ConversationRef::direct("bob")));
        assert!(!inbox.owns(&ConversationRef::group("eng")));

        let group = Surface::Group("eng".to_string());
        assert!(group.owns(&ConversationRef::group("eng")));
        assert!(!group.owns(&ConversationRef::group("ops")));

        let sector = Surface::Sector("hq".to_string());
        assert!(sector.owns(&ConversationRef::sector("hq")));
        assert!(!sector.owns(&ConversationRef::direct("hq")));
    }

    #[test]
    fn test_conversation_surface_roundtrip() {
        assert_eq!(
            ConversationRef::direct("alice").surface(),
            Surface::DirectInbox
        );
        assert_eq!(
            ConversationRef::group("eng").surface(),
            Surface::Group("eng".to_string())
        );
        let sector = ConversationRef::sector("hq");
        assert!(sector.surface().owns(&sector));
    }

    #[test]
    fn test_serde_tagged_representation() {
        let json = serde_json::to_value(ConversationRef::direct("alice")).unwrap();
        assert_eq!(json["kind"], "direct");
        assert_eq!(json["partner_id"], "alice");

        let back: ConversationRef = serde_json::from_value(json).unwrap();
        assert_eq!(back, ConversationRef::direct("alice"));
    }
}
