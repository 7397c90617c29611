//! Policy registry
//!
//! Per-node table of every subject this store knows about, either because it
//! was registered locally or because it arrived through gossip. Each entry
//! holds the node of record and exactly one active policy. Entries are only
//! ever superseded, never removed.
//!
//! Access is sharded per subject: a write to one entry excludes readers and
//! writers of that entry only.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use policy_common::{resolve, MergeOutcome, Node, Policy, PolicyError, Result, Subject};

/// State tracked for one subject
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetEntry {
    /// Storage node holding the dataset durably
    pub node: Node,
    /// Active policy
    pub policy: Policy,
    /// Last time the active policy changed
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PolicyRegistry {
    entries: DashMap<Subject, DatasetEntry>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry with `initial` as its active policy
    ///
    /// Returns `false` and leaves the existing entry untouched when the
    /// subject is already tracked.
    pub fn register(&self, node: Node, initial: Policy) -> bool {
        match self.entries.entry(initial.object.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(DatasetEntry {
                    node,
                    policy: initial,
                    updated_at: Utc::now(),
                });
                true
            }
        }
    }

    pub fn contains(&self, subject: &str) -> bool {
        self.entries.contains_key(subject)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the known subject identifiers, in no particular order
    pub fn identifiers(&self) -> Vec<Subject> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get(&self, subject: &str) -> Option<DatasetEntry> {
        self.entries.get(subject).map(|entry| entry.value().clone())
    }

    pub fn active_policy(&self, subject: &str) -> Result<Policy> {
        self.entries
            .get(subject)
            .map(|entry| entry.policy.clone())
            .ok_or_else(|| PolicyError::NotFound(subject.to_string()))
    }

    pub fn node_of_record(&self, subject: &str) -> Result<Node> {
        self.entries
            .get(subject)
            .map(|entry| entry.node.clone())
            .ok_or_else(|| PolicyError::NotFound(subject.to_string()))
    }

    /// Merge a policy into an existing entry
    ///
    /// This is the only way an active policy changes, for local commits and
    /// gossip alike.
    pub fn merge(&self, incoming: Policy) -> Result<MergeOutcome> {
        let mut entry = self
            .entries
            .get_mut(incoming.object.as_str())
            .ok_or_else(|| PolicyError::NotFound(incoming.object.to_string()))?;
        Ok(merge_entry(&mut entry, incoming))
    }

    /// Merge a policy, creating the entry first if the subject is new
    pub fn merge_or_track(&self, incoming: Policy, node: Node) -> MergeOutcome {
        match self.entries.entry(incoming.object.clone()) {
            Entry::Occupied(mut slot) => merge_entry(slot.get_mut(), incoming),
            Entry::Vacant(slot) => {
                debug!(subject = %incoming.object, node = %node, "Tracking subject learned from gossip");
                slot.insert(DatasetEntry {
                    node,
                    policy: incoming,
                    updated_at: Utc::now(),
                });
                MergeOutcome::Applied
            }
        }
    }
}

fn merge_entry(entry: &mut DatasetEntry, incoming: Policy) -> MergeOutcome {
    let outcome = resolve(&entry.policy, &incoming);
    if outcome == MergeOutcome::Applied {
        entry.policy = incoming;
        entry.updated_at = Utc::now();
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_common::{PeerId, PolicyContent};

    fn policy(issuer: &str, subject: &str, order: u64, allow: bool) -> Policy {
        Policy::new(
            PeerId::new(issuer),
            Subject::new(subject),
            PolicyContent::from(allow),
            order,
        )
    }

    #[test]
    fn test_register_is_first_writer_only() {
        let registry = PolicyRegistry::new();
        assert!(registry.register(Node::new("N1"), policy("P1", "d1", 0, false)));
        assert!(!registry.register(Node::new("N2"), policy("P1", "d1", 0, true)));

        assert_eq!(registry.node_of_record("d1").unwrap(), Node::new("N1"));
        assert!(!registry.active_policy("d1").unwrap().content.allows());
    }

    #[test]
    fn test_unknown_subject_is_not_found() {
        let registry = PolicyRegistry::new();
        assert!(matches!(registry.active_policy("d1"), Err(PolicyError::NotFound(_))));
        assert!(matches!(
            registry.merge(policy("P1", "d1", 1, true)),
            Err(PolicyError::NotFound(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_merge_supersedes_but_never_removes() {
        let registry = PolicyRegistry::new();
        registry.register(Node::new("N1"), policy("P1", "d1", 0, false));

        assert_eq!(registry.merge(policy("P1", "d1", 5, true)).unwrap(), MergeOutcome::Applied);
        assert_eq!(registry.merge(policy("P1", "d1", 3, false)).unwrap(), MergeOutcome::Stale);
        assert_eq!(registry.merge(policy("P1", "d1", 6, false)).unwrap(), MergeOutcome::Applied);

        let active = registry.active_policy("d1").unwrap();
        assert_eq!(active.order, 6);
        assert!(!active.content.allows());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_merge_or_track_creates_entry() {
        let registry = PolicyRegistry::new();
        let outcome = registry.merge_or_track(policy("P2", "d9", 4, true), Node::new("N7"));

        assert_eq!(outcome, MergeOutcome::Applied);
        let entry = registry.get("d9").unwrap();
        assert_eq!(entry.node, Node::new("N7"));
        assert_eq!(entry.policy.order, 4);
    }

    #[test]
    fn test_identifiers_snapshot() {
        let registry = PolicyRegistry::new();
        for id in ["a", "b", "c"] {
            registry.register(Node::new("N1"), policy("P1", id, 0, false));
        }
        let mut ids = registry.identifiers();
        ids.sort();
        assert_eq!(ids, vec![Subject::new("a"), Subject::new("b"), Subject::new("c")]);
    }
}
