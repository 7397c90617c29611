// Convergence rule for replicated policy state
//
// Every replicated record (an active Policy in a registry, a Grant in a
// permission table) carries a precedence:
//
//     (issuance order, issuer identity, content)
//
// compared lexicographically. An incoming record replaces the current one
// only when its precedence is strictly greater.
//
// Properties:
// - Commutative: the winner of {A, B} does not depend on arrival order
// - Idempotent: re-applying the active record is a no-op
// - Convergent: replicas that saw the same set of records hold the same winner

use std::cmp::Ordering;

use crate::types::{Grant, Policy};

/// Total order used to pick the active record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Precedence<'a> {
    pub order: u64,
    pub issuer: &'a str,
    pub content: &'a str,
}

/// Anything replicated through gossip and merged last-writer-wins
pub trait Versioned {
    fn precedence(&self) -> Precedence<'_>;
}

impl Versioned for Policy {
    fn precedence(&self) -> Precedence<'_> {
        Precedence {
            order: self.order,
            issuer: self.issuer.as_str(),
            content: self.content.as_str(),
        }
    }
}

impl Versioned for Grant {
    fn precedence(&self) -> Precedence<'_> {
        Precedence {
            order: self.order,
            issuer: self.issuer.as_str(),
            content: if self.granted { "grant" } else { "revoke" },
        }
    }
}

/// Result of merging an incoming record into local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The incoming record is now active
    Applied,
    /// Same precedence as the active record (duplicate delivery)
    Duplicate,
    /// The active record takes precedence; incoming discarded
    Stale,
}

impl MergeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeOutcome::Applied => "applied",
            MergeOutcome::Duplicate => "duplicate",
            MergeOutcome::Stale => "stale",
        }
    }
}

/// Decide whether `incoming` should replace `current`
pub fn resolve<T: Versioned>(current: &T, incoming: &T) -> MergeOutcome {
    match incoming.precedence().cmp(&current.precedence()) {
        Ordering::Greater => MergeOutcome::Applied,
        Ordering::Equal => MergeOutcome::Duplicate,
        Ordering::Less => MergeOutcome::Stale,
    }
}

/// Merge `incoming` into an optional slot, replacing the value when it wins
///
/// An empty slot always accepts the incoming record.
pub fn merge_into<T: Versioned>(slot: &mut Option<T>, incoming: T) -> MergeOutcome {
    let outcome = match slot.as_ref() {
        Some(current) => resolve(current, &incoming),
        None => MergeOutcome::Applied,
    };
    if outcome == MergeOutcome::Applied {
        *slot = Some(incoming);
    }
    outcome
}
