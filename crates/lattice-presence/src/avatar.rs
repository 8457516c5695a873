//! Identity of the avatar a presence set belongs to.

use uuid::Uuid;

/// Stable identity of one avatar.
#[derive(Debug, Clone)]
pub struct AvatarIdentity {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    /// Synthetic (bot) avatars never hold remote presences; every
    /// lifecycle entry point is a no-op for them.
    pub synthetic: bool,
}

impl AvatarIdentity {
    #[must_use]
    pub fn new(id: Uuid, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            synthetic: false,
        }
    }

    #[must_use]
    pub fn synthetic(id: Uuid, first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            synthetic: true,
            ..Self::new(id, first_name, last_name)
        }
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}
