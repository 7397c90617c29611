//! Data model shared by policy stores and coordinators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::error::{PolicyError, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identity of a gossip member (policy store or coordinator)
    PeerId
);

string_id!(
    /// Dataset or protected object governed by a policy
    Subject
);

string_id!(
    /// Storage node identity; referenced, never owned
    Node
);

string_id!(
    /// Identity entitled to request access to datasets
    DataUser
);

impl PeerId {
    /// Peer identities end up inside transport subjects, so they must be a
    /// single non-empty token.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(PolicyError::Config("peer identity cannot be empty".to_string()));
        }
        if self
            .0
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
        {
            return Err(PolicyError::Config(format!(
                "peer identity '{}' contains reserved characters",
                self.0
            )));
        }
        Ok(())
    }
}

/// Opaque access decision. `"true"` allows, `"false"` denies, anything else
/// is a richer rule that the allow/deny projection treats as a denial.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyContent(String);

impl PolicyContent {
    pub fn new(content: impl Into<String>) -> Self {
        Self(content.into())
    }

    pub fn allow() -> Self {
        Self::from(true)
    }

    pub fn deny() -> Self {
        Self::from(false)
    }

    pub fn allows(&self) -> bool {
        self.0 == "true"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<bool> for PolicyContent {
    fn from(allow: bool) -> Self {
        Self(allow.to_string())
    }
}

impl fmt::Display for PolicyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single access-control statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Store or coordinator that authored the policy
    pub issuer: PeerId,
    /// Subject the policy governs
    pub object: Subject,
    /// Access decision
    pub content: PolicyContent,
    /// Issuance order, monotonically increasing per issuer
    pub order: u64,
    /// Wall-clock time of issuance, informational only
    pub issued_at: DateTime<Utc>,
}

impl Policy {
    pub fn new(issuer: PeerId, object: Subject, content: PolicyContent, order: u64) -> Self {
        Self {
            issuer,
            object,
            content,
            order,
            issued_at: Utc::now(),
        }
    }

    /// Reject policies that could never have been issued by a well-behaved peer
    pub fn validate(&self) -> Result<()> {
        if self.issuer.as_str().is_empty() {
            return Err(PolicyError::Dropped("policy without issuer".to_string()));
        }
        if self.object.as_str().is_empty() {
            return Err(PolicyError::Dropped("policy without object identifier".to_string()));
        }
        Ok(())
    }
}

/// Verb carried by a permission grant, e.g. `read` or `append`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(String);

impl Permission {
    pub const USE: &'static str = "use";

    pub fn new(permission: impl Into<String>) -> Self {
        Self(permission.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Permission {
    fn default() -> Self {
        Self(Self::USE.to_string())
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Recipient of a permission directive on a given store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grantee {
    Node(Node),
    User(DataUser),
}

/// Node-local record of a grant or revocation for one grantee
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub issuer: PeerId,
    pub order: u64,
    pub granted: bool,
    pub permission: Option<Permission>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_content_projection() {
        assert!(PolicyContent::from(true).allows());
        assert!(!PolicyContent::from(false).allows());
        assert!(!PolicyContent::new("allow if weekday").allows());
        assert_eq!(PolicyContent::allow().as_str(), "true");
    }

    #[test]
    fn test_peer_id_validation() {
        assert!(PeerId::new("P1").validate().is_ok());
        assert!(PeerId::new("").validate().is_err());
        assert!(PeerId::new("store.one").validate().is_err());
        assert!(PeerId::new("store one").validate().is_err());
        assert!(PeerId::new("all>").validate().is_err());
    }

    #[test]
    fn test_policy_validation() {
        let policy = Policy::new("P1".into(), "d1".into(), PolicyContent::allow(), 1);
        assert!(policy.validate().is_ok());

        let orphan = Policy::new("P1".into(), "".into(), PolicyContent::allow(), 1);
        assert!(matches!(orphan.validate(), Err(PolicyError::Dropped(_))));
    }

    #[test]
    fn test_ids_serialize_transparently() {
        let json = serde_json::to_string(&Subject::new("d1")).unwrap();
        assert_eq!(json, "\"d1\"");

        let grantee: Grantee = serde_json::from_str(r#"{"user":"alice"}"#).unwrap();
        assert_eq!(grantee, Grantee::User(DataUser::new("alice")));
    }
}
