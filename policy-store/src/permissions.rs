//! Node-local permission table
//!
//! Records, per subject, the grants and revocations addressed to the storage
//! nodes this store manages and the data users it serves. Directives are
//! merged with the same last-writer-wins rule as policies, so duplicated or
//! reordered directives converge.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::debug;

use policy_common::{
    resolve, DataUser, Grant, Grantee, MergeOutcome, Node, PermissionDirective, Scope, Subject, Verb,
};

/// Per-directive tally of what happened to each local recipient
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectiveOutcome {
    pub applied: usize,
    pub duplicate: usize,
    pub stale: usize,
}

impl DirectiveOutcome {
    /// No local recipient was inside the directive's scope
    pub fn is_ignored(&self) -> bool {
        self.applied + self.duplicate + self.stale == 0
    }

    fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied => self.applied += 1,
            MergeOutcome::Duplicate => self.duplicate += 1,
            MergeOutcome::Stale => self.stale += 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct PermissionTable {
    managed_nodes: DashSet<Node>,
    local_users: DashSet<DataUser>,
    grants: DashMap<(Subject, Grantee), Grant>,
}

impl PermissionTable {
    pub fn new<N, U>(nodes: N, users: U) -> Self
    where
        N: IntoIterator<Item = Node>,
        U: IntoIterator<Item = DataUser>,
    {
        let table = Self::default();
        for node in nodes {
            table.manage_node(node);
        }
        for user in users {
            table.serve_user(user);
        }
        table
    }

    pub fn manage_node(&self, node: Node) {
        self.managed_nodes.insert(node);
    }

    pub fn serve_user(&self, user: DataUser) {
        self.local_users.insert(user);
    }

    pub fn managed_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.managed_nodes.iter().map(|n| n.key().clone()).collect();
        nodes.sort();
        nodes
    }

    pub fn local_users(&self) -> Vec<DataUser> {
        let mut users: Vec<DataUser> = self.local_users.iter().map(|u| u.key().clone()).collect();
        users.sort();
        users
    }

    /// Local recipients that fall inside `scope`
    pub fn recipients(&self, scope: &Scope) -> Vec<Grantee> {
        let nodes = self
            .managed_nodes()
            .into_iter()
            .filter(|node| scope.includes_node(node))
            .map(Grantee::Node);
        let users = self
            .local_users()
            .into_iter()
            .filter(|user| scope.includes_user(user))
            .map(Grantee::User);
        nodes.chain(users).collect()
    }

    /// Apply a directive to every local recipient in its scope
    ///
    /// Recipients outside the scope are left untouched.
    pub fn apply(&self, directive: &PermissionDirective) -> DirectiveOutcome {
        let mut outcome = DirectiveOutcome::default();
        let incoming = Grant {
            issuer: directive.issuer.clone(),
            order: directive.order,
            granted: directive.verb.is_grant(),
            permission: match &directive.verb {
                Verb::Grant { permission } => Some(permission.clone()),
                Verb::Revoke => None,
            },
        };

        for grantee in self.recipients(&directive.scope) {
            let result = match self.grants.entry((directive.subject.clone(), grantee.clone())) {
                Entry::Occupied(mut slot) => {
                    let result = resolve(slot.get(), &incoming);
                    if result == MergeOutcome::Applied {
                        slot.insert(incoming.clone());
                    }
                    result
                }
                Entry::Vacant(slot) => {
                    slot.insert(incoming.clone());
                    MergeOutcome::Applied
                }
            };
            debug!(
                subject = %directive.subject,
                grantee = ?grantee,
                outcome = result.as_str(),
                "Directive merged"
            );
            outcome.record(result);
        }
        outcome
    }

    pub fn grant_for(&self, subject: &Subject, grantee: &Grantee) -> Option<Grant> {
        self.grants
            .get(&(subject.clone(), grantee.clone()))
            .map(|grant| grant.value().clone())
    }

    /// Explicit decision for a node, if any directive reached it
    pub fn node_decision(&self, subject: &Subject, node: &Node) -> Option<bool> {
        self.grant_for(subject, &Grantee::Node(node.clone()))
            .map(|grant| grant.granted)
    }

    /// Explicit decision for a user, if any directive reached it
    pub fn user_decision(&self, subject: &Subject, user: &DataUser) -> Option<bool> {
        self.grant_for(subject, &Grantee::User(user.clone()))
            .map(|grant| grant.granted)
    }

    /// Local users currently holding a grant on `subject`
    pub fn permitted_users(&self, subject: &Subject) -> Vec<DataUser> {
        self.local_users()
            .into_iter()
            .filter(|user| self.user_decision(subject, user) == Some(true))
            .collect()
    }

    /// Whether any directive for `subject` has reached this store
    pub fn knows_subject(&self, subject: &Subject) -> bool {
        self.grants.iter().any(|entry| &entry.key().0 == subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy_common::{PeerId, Permission};

    fn table() -> PermissionTable {
        PermissionTable::new(
            [Node::new("N1"), Node::new("N2")],
            [DataUser::new("A"), DataUser::new("B"), DataUser::new("C")],
        )
    }

    fn directive(order: u64, verb: Verb, scope: Scope) -> PermissionDirective {
        PermissionDirective::new(PeerId::new("coordinator"), order, Subject::new("d1"), verb, scope)
    }

    fn grant() -> Verb {
        Verb::Grant {
            permission: Permission::default(),
        }
    }

    #[test]
    fn test_user_scope_leaves_others_untouched() {
        let table = table();
        let outcome = table.apply(&directive(1, grant(), Scope::data_users(["A", "B"])));

        assert_eq!(outcome.applied, 2);
        let d1 = Subject::new("d1");
        assert_eq!(table.user_decision(&d1, &DataUser::new("A")), Some(true));
        assert_eq!(table.user_decision(&d1, &DataUser::new("B")), Some(true));
        assert_eq!(table.user_decision(&d1, &DataUser::new("C")), None);
        assert_eq!(table.node_decision(&d1, &Node::new("N1")), None);
    }

    #[test]
    fn test_out_of_scope_directive_is_ignored() {
        let table = table();
        let outcome = table.apply(&directive(1, grant(), Scope::storage_nodes(["N9"])));

        assert!(outcome.is_ignored());
        assert!(!table.knows_subject(&Subject::new("d1")));
    }

    #[test]
    fn test_scope_all_reaches_nodes_and_users() {
        let table = table();
        let outcome = table.apply(&directive(1, Verb::Revoke, Scope::All));

        assert_eq!(outcome.applied, 5);
        let d1 = Subject::new("d1");
        assert_eq!(table.node_decision(&d1, &Node::new("N2")), Some(false));
        assert_eq!(table.user_decision(&d1, &DataUser::new("C")), Some(false));
    }

    #[test]
    fn test_later_revoke_beats_earlier_grant_in_any_order() {
        let grant_first = table();
        let revoke_first = table();
        let g = directive(1, grant(), Scope::data_users(["A"]));
        let r = directive(2, Verb::Revoke, Scope::data_users(["A"]));

        grant_first.apply(&g);
        grant_first.apply(&r);
        revoke_first.apply(&r);
        let late = revoke_first.apply(&g);

        assert_eq!(late.stale, 1);
        let d1 = Subject::new("d1");
        assert_eq!(grant_first.user_decision(&d1, &DataUser::new("A")), Some(false));
        assert_eq!(revoke_first.user_decision(&d1, &DataUser::new("A")), Some(false));
    }

    #[test]
    fn test_duplicate_directive_is_noop() {
        let table = table();
        let d = directive(3, grant(), Scope::storage_nodes(["N1"]));
        table.apply(&d);
        let again = table.apply(&d);

        assert_eq!(again, DirectiveOutcome { applied: 0, duplicate: 1, stale: 0 });
        assert_eq!(
            table.permitted_users(&Subject::new("d1")),
            Vec::<DataUser>::new()
        );
    }
}
