//! Cache key definitions
//!
//! Typed composite keys for per-membership buffers and caches.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Key for one user's membership in one community
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipKey {
    pub user_id: String,
    pub community_id: String,
}

impl MembershipKey {
    /// Create a new membership key
    pub fn new(user_id: impl Into<String>, community_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            community_id: community_id.into(),
        }
    }

    /// Store document id, `{user}_{community}`
    ///
    /// Only for persistence; in-process maps key on the struct itself.
    pub fn document_id(&self) -> String {
        format!("{}_{}", self.user_id, self.community_id)
    }

    /// Whether this key belongs to the given community
    pub fn in_community(&self, community_id: &str) -> bool {
        self.community_id == community_id
    }
}

impl fmt::Display for MembershipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.community_id)
    }
}
