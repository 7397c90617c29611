//! Gossip wire messages
//!
//! Every payload handed to a [`GossipTransport`](crate::transport::GossipTransport)
//! is a JSON-encoded [`GossipEnvelope`]. The `type` tag on [`GossipMessage`]
//! distinguishes policy updates, permission directives, queries and query
//! responses; directives carry their scope and issuance order explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{PolicyError, Result};
use crate::types::{DataUser, Node, PeerId, Permission, Policy, Subject};

/// Current envelope version; anything else is dropped on decode
pub const WIRE_VERSION: u8 = 1;

/// Versioned wrapper around every gossip message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipEnvelope {
    pub version: u8,
    /// Member that produced the message
    pub sender: PeerId,
    pub sent_at: DateTime<Utc>,
    pub message: GossipMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// A policy committed at its node of record
    PolicyUpdate(PolicyUpdate),
    /// Grant or revocation issued by a coordinator
    Directive(PermissionDirective),
    /// Network query for permitted nodes or users
    Query(PermissionQuery),
    /// Direct answer to a query
    QueryResponse(QueryResponse),
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::PolicyUpdate(_) => "policy_update",
            GossipMessage::Directive(_) => "directive",
            GossipMessage::Query(_) => "query",
            GossipMessage::QueryResponse(_) => "query_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub policy: Policy,
    /// Storage node holding the dataset, so first-time receivers can track it
    pub node_of_record: Node,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Verb {
    Grant { permission: Permission },
    Revoke,
}

impl Verb {
    pub fn is_grant(&self) -> bool {
        matches!(self, Verb::Grant { .. })
    }
}

/// Recipient filter of a directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "members", rename_all = "snake_case")]
pub enum Scope {
    /// Every storage node and every data user
    All,
    StorageNodes(BTreeSet<Node>),
    DataUsers(BTreeSet<DataUser>),
}

impl Scope {
    pub fn storage_nodes<I, N>(nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        Scope::StorageNodes(nodes.into_iter().map(Into::into).collect())
    }

    pub fn data_users<I, U>(users: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<DataUser>,
    {
        Scope::DataUsers(users.into_iter().map(Into::into).collect())
    }

    /// A scoped filter with no members addresses nobody
    pub fn is_empty(&self) -> bool {
        match self {
            Scope::All => false,
            Scope::StorageNodes(nodes) => nodes.is_empty(),
            Scope::DataUsers(users) => users.is_empty(),
        }
    }

    pub fn includes_node(&self, node: &Node) -> bool {
        match self {
            Scope::All => true,
            Scope::StorageNodes(nodes) => nodes.contains(node),
            Scope::DataUsers(_) => false,
        }
    }

    pub fn includes_user(&self, user: &DataUser) -> bool {
        match self {
            Scope::All => true,
            Scope::StorageNodes(_) => false,
            Scope::DataUsers(users) => users.contains(user),
        }
    }
}

/// Ephemeral grant/revoke instruction; never persisted as such
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionDirective {
    pub id: Uuid,
    pub issuer: PeerId,
    pub order: u64,
    pub subject: Subject,
    #[serde(flatten)]
    pub verb: Verb,
    pub scope: Scope,
    pub issued_at: DateTime<Utc>,
}

impl PermissionDirective {
    pub fn new(issuer: PeerId, order: u64, subject: Subject, verb: Verb, scope: Scope) -> Self {
        Self {
            id: Uuid::new_v4(),
            issuer,
            order,
            subject,
            verb,
            scope,
            issued_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.subject.as_str().is_empty() {
            return Err(PolicyError::Dropped("directive without subject".to_string()));
        }
        if self.issuer.as_str().is_empty() {
            return Err(PolicyError::Dropped("directive without issuer".to_string()));
        }
        if self.scope.is_empty() {
            return Err(PolicyError::Dropped(format!(
                "directive {} has an empty recipient scope",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryTarget {
    StorageNodes,
    DataUsers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionQuery {
    pub request_id: Uuid,
    pub subject: Subject,
    pub target: QueryTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub request_id: Uuid,
    pub responder: PeerId,
    pub subject: Subject,
    #[serde(default)]
    pub storage_nodes: Vec<Node>,
    #[serde(default)]
    pub data_users: Vec<DataUser>,
}

impl GossipEnvelope {
    pub fn new(sender: PeerId, message: GossipMessage) -> Self {
        Self {
            version: WIRE_VERSION,
            sender,
            sent_at: Utc::now(),
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| PolicyError::Internal(format!("failed to encode gossip message: {}", e)))
    }

    /// Decode and structurally validate an inbound payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        let envelope: GossipEnvelope = serde_json::from_slice(data)
            .map_err(|e| PolicyError::Dropped(format!("malformed gossip payload: {}", e)))?;

        if envelope.version != WIRE_VERSION {
            return Err(PolicyError::Dropped(format!(
                "unsupported wire version {}",
                envelope.version
            )));
        }

        match &envelope.message {
            GossipMessage::PolicyUpdate(update) => update.policy.validate()?,
            GossipMessage::Directive(directive) => directive.validate()?,
            GossipMessage::Query(query) if query.subject.as_str().is_empty() => {
                return Err(PolicyError::Dropped("query without subject".to_string()));
            }
            _ => {}
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PolicyContent;

    #[test]
    fn test_directive_wire_shape_is_self_describing() {
        let directive = PermissionDirective::new(
            PeerId::new("coordinator"),
            42,
            Subject::new("d1"),
            Verb::Revoke,
            Scope::data_users(["alice", "bob"]),
        );
        let envelope = GossipEnvelope::new(PeerId::new("coordinator"), GossipMessage::Directive(directive));
        let json: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();

        assert_eq!(json["version"], 1);
        assert_eq!(json["message"]["type"], "directive");
        assert_eq!(json["message"]["verb"], "revoke");
        assert_eq!(json["message"]["order"], 42);
        assert_eq!(json["message"]["scope"]["scope"], "data_users");
        assert_eq!(json["message"]["scope"]["members"][0], "alice");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = GossipEnvelope::decode(b"not json at all").unwrap_err();
        assert!(matches!(err, PolicyError::Dropped(_)));
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        let policy = Policy::new("P1".into(), "d1".into(), PolicyContent::allow(), 1);
        let mut envelope = GossipEnvelope::new(
            "P1".into(),
            GossipMessage::PolicyUpdate(PolicyUpdate {
                policy,
                node_of_record: "N1".into(),
            }),
        );
        envelope.version = 99;
        let bytes = serde_json::to_vec(&envelope).unwrap();

        assert!(matches!(GossipEnvelope::decode(&bytes), Err(PolicyError::Dropped(_))));
    }

    #[test]
    fn test_decode_rejects_empty_scope() {
        let directive = PermissionDirective::new(
            "coordinator".into(),
            1,
            "d1".into(),
            Verb::Grant { permission: Permission::default() },
            Scope::StorageNodes(BTreeSet::new()),
        );
        let bytes = GossipEnvelope::new("coordinator".into(), GossipMessage::Directive(directive))
            .encode()
            .unwrap();

        assert!(matches!(GossipEnvelope::decode(&bytes), Err(PolicyError::Dropped(_))));
    }

    #[test]
    fn test_scope_membership() {
        let scope = Scope::storage_nodes(["N1"]);
        assert!(scope.includes_node(&Node::new("N1")));
        assert!(!scope.includes_node(&Node::new("N2")));
        assert!(!scope.includes_user(&DataUser::new("N1")));

        assert!(Scope::All.includes_user(&DataUser::new("anyone")));
        assert!(!Scope::All.is_empty());
    }
}
