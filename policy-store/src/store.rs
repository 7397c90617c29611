// Policy Store
//
// Per-node control plane over the datasets this node is responsible for or
// has learned about through gossip. It provides:
// - Synchronous policy changes, committed at the node of record first
// - Background distribution of committed policies over gossip
// - Convergent application of gossiped policies and permission directives
// - Answers to network queries for permitted storage nodes and data users

use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use policy_common::{
    DataUser, GossipEnvelope, GossipMessage, GossipTransport, IssuanceClock, MergeOutcome, Node,
    PeerId, PermissionDirective, PermissionQuery, Policy, PolicyContent, PolicyError, PolicyUpdate,
    QueryResponse, QueryTarget, Result, Scope, Subject,
};

use crate::permissions::PermissionTable;
use crate::registry::PolicyRegistry;
use crate::storage_node::StorageDirectory;

/// Runtime options of a policy store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Upper bound on a storage node commit
    pub store_timeout: Duration,
    /// Capacity of the distribution queue
    pub distribution_queue: usize,
    /// Track subjects first seen in gossip
    pub track_gossiped_subjects: bool,
    /// Content of the policy installed when a dataset is registered
    pub default_content: PolicyContent,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(30),
            distribution_queue: 1024,
            track_gossiped_subjects: true,
            default_content: PolicyContent::deny(),
        }
    }
}

/// Snapshot of store activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub datasets: usize,
    pub local_commits: u64,
    pub failed_commits: u64,
    pub gossip_applied: u64,
    pub gossip_duplicate: u64,
    pub gossip_stale: u64,
    pub directives_applied: u64,
    pub directives_ignored: u64,
    pub queries_answered: u64,
    pub messages_dropped: u64,
    pub distributions_enqueued: u64,
    pub distributions_failed: u64,
}

#[derive(Debug, Default)]
struct StoreCounters {
    local_commits: AtomicU64,
    failed_commits: AtomicU64,
    gossip_applied: AtomicU64,
    gossip_duplicate: AtomicU64,
    gossip_stale: AtomicU64,
    directives_applied: AtomicU64,
    directives_ignored: AtomicU64,
    queries_answered: AtomicU64,
    messages_dropped: AtomicU64,
    distributions_enqueued: AtomicU64,
    distributions_failed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl StoreCounters {
    fn record_merge(&self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied => bump(&self.gossip_applied),
            MergeOutcome::Duplicate => bump(&self.gossip_duplicate),
            MergeOutcome::Stale => bump(&self.gossip_stale),
        }
        counter!("policy_gossip_merges_total", 1, "outcome" => outcome.as_str());
    }
}

pub struct PolicyStore {
    peer: PeerId,
    options: StoreOptions,
    registry: PolicyRegistry,
    permissions: PermissionTable,
    storage: StorageDirectory,
    clock: IssuanceClock,
    transport: Arc<dyn GossipTransport>,
    distribution_tx: mpsc::Sender<PolicyUpdate>,
    distribution_rx: Mutex<Option<mpsc::Receiver<PolicyUpdate>>>,
    counters: Arc<StoreCounters>,
}

impl PolicyStore {
    pub fn new(
        options: StoreOptions,
        storage: StorageDirectory,
        permissions: PermissionTable,
        transport: Arc<dyn GossipTransport>,
    ) -> Self {
        let peer = transport.local_peer().clone();
        let (distribution_tx, distribution_rx) = mpsc::channel(options.distribution_queue.max(1));

        info!(peer = %peer, "Initializing policy store");

        Self {
            peer,
            options,
            registry: PolicyRegistry::new(),
            permissions,
            storage,
            clock: IssuanceClock::new(),
            transport,
            distribution_tx,
            distribution_rx: Mutex::new(Some(distribution_rx)),
            counters: Arc::new(StoreCounters::default()),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn permissions(&self) -> &PermissionTable {
        &self.permissions
    }

    /// Register the gossip broadcast handler with the transport
    ///
    /// The handler holds a weak reference, so dropping the store detaches it.
    pub fn attach(self: &Arc<Self>) {
        let store: Weak<Self> = Arc::downgrade(self);
        self.transport.register_broadcast_handler(Arc::new(move |data: &[u8]| {
            match store.upgrade() {
                Some(store) => store.handle_gossip(data),
                None => Ok(None),
            }
        }));
        debug!(peer = %self.peer, "Gossip handler attached");
    }

    /// Start the distributor task draining the distribution queue
    ///
    /// The task ends once the store is dropped.
    pub fn start(&self) -> Result<JoinHandle<()>> {
        let mut queue = self
            .distribution_rx
            .lock()
            .map_err(|_| PolicyError::Internal("distribution queue lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| PolicyError::Internal("policy store already started".to_string()))?;

        let transport = Arc::clone(&self.transport);
        let counters = Arc::clone(&self.counters);
        let peer = self.peer.clone();

        Ok(tokio::spawn(async move {
            info!(peer = %peer, "Policy distributor started");
            while let Some(update) = queue.recv().await {
                let subject = update.policy.object.clone();
                let envelope = GossipEnvelope::new(peer.clone(), GossipMessage::PolicyUpdate(update));
                match envelope.encode() {
                    Ok(payload) => {
                        transport.publish_broadcast(payload);
                        counter!("policy_distributions_published_total", 1);
                        debug!(subject = %subject, "Policy published to gossip");
                    }
                    Err(e) => {
                        bump(&counters.distributions_failed);
                        error!(subject = %subject, error = %e, "Failed to encode policy update");
                    }
                }
            }
            debug!(peer = %peer, "Policy distributor stopped");
        }))
    }

    /// Register a dataset held by `node`
    ///
    /// Installs an order-0 policy with the configured default content.
    /// Returns `false` when the dataset is already tracked.
    pub fn register_dataset(&self, dataset_id: impl Into<Subject>, node: impl Into<Node>) -> bool {
        let dataset_id = dataset_id.into();
        let node = node.into();
        let initial = Policy::new(
            self.peer.clone(),
            dataset_id.clone(),
            self.options.default_content.clone(),
            0,
        );

        self.permissions.manage_node(node.clone());
        let created = self.registry.register(node.clone(), initial);
        if created {
            info!(dataset = %dataset_id, node = %node, "Dataset registered");
        }
        created
    }

    /// Identifiers of every dataset this store knows about
    pub fn get_dataset_identifiers(&self) -> Vec<Subject> {
        self.registry.identifiers()
    }

    pub fn get_object_policy(&self, dataset_id: &str) -> Result<PolicyContent> {
        if dataset_id.trim().is_empty() {
            return Err(PolicyError::BadRequest("missing dataset identifier".to_string()));
        }
        Ok(self.registry.active_policy(dataset_id)?.content)
    }

    /// Commit a new policy at the node of record, then distribute it
    ///
    /// Nothing changes locally and nothing is distributed unless the node of
    /// record acknowledged the policy.
    #[instrument(skip(self, content), fields(peer = %self.peer))]
    pub async fn set_object_policy(&self, dataset_id: &str, content: PolicyContent) -> Result<Policy> {
        if dataset_id.trim().is_empty() {
            return Err(PolicyError::BadRequest("missing dataset identifier".to_string()));
        }
        let node = self.registry.node_of_record(dataset_id)?;
        let subject = Subject::new(dataset_id);
        let policy = Policy::new(self.peer.clone(), subject.clone(), content, self.clock.next());

        if let Err(e) = self.store_policy(&node, &subject, &policy).await {
            bump(&self.counters.failed_commits);
            counter!("policy_commits_failed_total", 1, "kind" => e.kind());
            warn!(dataset = %subject, node = %node, error = %e, "Policy commit failed");
            return Err(e);
        }

        let outcome = self.registry.merge(policy.clone())?;
        bump(&self.counters.local_commits);
        counter!("policy_commits_total", 1);
        info!(
            dataset = %subject,
            order = policy.order,
            content = %policy.content,
            outcome = outcome.as_str(),
            "Policy committed"
        );

        self.submit_policy_for_distribution(policy.clone());
        Ok(policy)
    }

    /// Send a policy to a storage node and wait, bounded, for its acknowledgment
    pub async fn store_policy(&self, node: &Node, dataset_id: &Subject, policy: &Policy) -> Result<()> {
        let client = self.storage.resolve(node)?;
        match tokio::time::timeout(self.options.store_timeout, client.store(dataset_id, policy)).await {
            Ok(result) => result,
            Err(_) => Err(PolicyError::Unavailable(format!(
                "storage node {} did not acknowledge within {:?}",
                node, self.options.store_timeout
            ))),
        }
    }

    /// Queue a committed policy for gossip distribution
    ///
    /// Never blocks; a full or closed queue is logged and counted.
    pub fn submit_policy_for_distribution(&self, policy: Policy) {
        let node_of_record = match self.registry.node_of_record(policy.object.as_str()) {
            Ok(node) => node,
            Err(_) => {
                bump(&self.counters.distributions_failed);
                warn!(subject = %policy.object, "Not distributing policy for untracked subject");
                return;
            }
        };

        let subject = policy.object.clone();
        match self.distribution_tx.try_send(PolicyUpdate { policy, node_of_record }) {
            Ok(()) => bump(&self.counters.distributions_enqueued),
            Err(e) => {
                bump(&self.counters.distributions_failed);
                counter!("policy_distributions_dropped_total", 1);
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "queue full",
                    mpsc::error::TrySendError::Closed(_) => "distributor stopped",
                };
                warn!(subject = %subject, reason, "Policy distribution dropped");
            }
        }
    }

    /// Inbound gossip entry point
    ///
    /// Malformed messages are dropped and logged. `Some` bytes are a response
    /// for the broadcast's origin.
    pub fn handle_gossip(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let envelope = match GossipEnvelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                bump(&self.counters.messages_dropped);
                counter!("policy_gossip_dropped_total", 1);
                warn!(peer = %self.peer, error = %e, "Dropping gossip message");
                return Ok(None);
            }
        };

        if envelope.sender == self.peer {
            return Ok(None);
        }

        match envelope.message {
            GossipMessage::PolicyUpdate(update) => {
                self.apply_policy_update(update);
                Ok(None)
            }
            GossipMessage::Directive(directive) => {
                self.apply_directive(&directive);
                Ok(None)
            }
            GossipMessage::Query(query) => self.answer_query(&query),
            GossipMessage::QueryResponse(response) => {
                debug!(request_id = %response.request_id, "Ignoring query response addressed to a coordinator");
                Ok(None)
            }
        }
    }

    /// Merge a gossiped policy into the registry
    pub fn apply_policy_update(&self, update: PolicyUpdate) -> Option<MergeOutcome> {
        let PolicyUpdate { policy, node_of_record } = update;
        if !self.clock.witness(policy.order) {
            self.drop_implausible(&policy.object, &policy.issuer, policy.order);
            return None;
        }

        let subject = policy.object.clone();
        let issuer = policy.issuer.clone();
        let order = policy.order;

        let outcome = if self.registry.contains(subject.as_str()) {
            self.registry.merge(policy).ok()
        } else if self.options.track_gossiped_subjects {
            Some(self.registry.merge_or_track(policy, node_of_record))
        } else {
            debug!(subject = %subject, "Ignoring policy update for untracked subject");
            None
        };

        if let Some(outcome) = outcome {
            self.counters.record_merge(outcome);
            debug!(
                subject = %subject,
                issuer = %issuer,
                order,
                outcome = outcome.as_str(),
                "Gossiped policy merged"
            );
        }
        outcome
    }

    /// Apply a permission directive to the local recipients in its scope
    pub fn apply_directive(&self, directive: &PermissionDirective) {
        if !self.clock.witness(directive.order) {
            self.drop_implausible(&directive.subject, &directive.issuer, directive.order);
            return;
        }

        let outcome = self.permissions.apply(directive);

        // Unscoped directives also change the subject's active policy
        let mut policy_changed = false;
        if directive.scope == Scope::All && self.registry.contains(directive.subject.as_str()) {
            let mut policy = Policy::new(
                directive.issuer.clone(),
                directive.subject.clone(),
                PolicyContent::from(directive.verb.is_grant()),
                directive.order,
            );
            policy.issued_at = directive.issued_at;
            if let Ok(merged) = self.registry.merge(policy) {
                policy_changed = merged == MergeOutcome::Applied;
            }
        }

        if outcome.is_ignored() && !policy_changed {
            bump(&self.counters.directives_ignored);
            debug!(
                directive = %directive.id,
                subject = %directive.subject,
                "Directive not addressed to this store"
            );
            return;
        }

        bump(&self.counters.directives_applied);
        counter!("policy_directives_applied_total", 1);
        info!(
            directive = %directive.id,
            subject = %directive.subject,
            grant = directive.verb.is_grant(),
            applied = outcome.applied,
            duplicate = outcome.duplicate,
            stale = outcome.stale,
            policy_changed,
            "Directive applied"
        );
    }

    fn drop_implausible(&self, subject: &Subject, issuer: &PeerId, order: u64) {
        bump(&self.counters.messages_dropped);
        counter!("policy_gossip_dropped_total", 1);
        warn!(
            subject = %subject,
            issuer = %issuer,
            order,
            "Dropping gossip with an order too far ahead of the local clock"
        );
    }

    fn answer_query(&self, query: &PermissionQuery) -> Result<Option<Vec<u8>>> {
        if !self.registry.contains(query.subject.as_str())
            && !self.permissions.knows_subject(&query.subject)
        {
            debug!(subject = %query.subject, "Not answering query for unknown subject");
            return Ok(None);
        }

        let mut response = QueryResponse {
            request_id: query.request_id,
            responder: self.peer.clone(),
            subject: query.subject.clone(),
            storage_nodes: Vec::new(),
            data_users: Vec::new(),
        };
        match query.target {
            QueryTarget::StorageNodes => response.storage_nodes = self.permitted_storage_nodes(&query.subject),
            QueryTarget::DataUsers => response.data_users = self.permitted_data_users(&query.subject),
        }

        let payload =
            GossipEnvelope::new(self.peer.clone(), GossipMessage::QueryResponse(response)).encode()?;
        bump(&self.counters.queries_answered);
        counter!("policy_queries_answered_total", 1);
        Ok(Some(payload))
    }

    /// Storage nodes permitted for `subject` as seen by this store
    ///
    /// An explicit directive decides; otherwise the node of record follows
    /// the active policy.
    pub fn permitted_storage_nodes(&self, subject: &Subject) -> Vec<Node> {
        let entry = self.registry.get(subject.as_str());
        let mut candidates = self.permissions.managed_nodes();
        if let Some(entry) = &entry {
            if !candidates.contains(&entry.node) {
                candidates.push(entry.node.clone());
            }
        }

        let mut nodes: Vec<Node> = candidates
            .into_iter()
            .filter(|node| match self.permissions.node_decision(subject, node) {
                Some(granted) => granted,
                None => entry
                    .as_ref()
                    .map(|e| &e.node == node && e.policy.content.allows())
                    .unwrap_or(false),
            })
            .collect();
        nodes.sort();
        nodes
    }

    pub fn permitted_data_users(&self, subject: &Subject) -> Vec<DataUser> {
        self.permissions.permitted_users(subject)
    }

    /// Allow/deny projection for a data user reading `subject`
    ///
    /// A directive addressed to the user decides; otherwise the active
    /// policy does. Unknown subjects are denied.
    pub fn is_access_allowed(&self, subject: &Subject, user: &DataUser) -> bool {
        if let Some(granted) = self.permissions.user_decision(subject, user) {
            return granted;
        }
        self.registry
            .active_policy(subject.as_str())
            .map(|policy| policy.content.allows())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        StoreStats {
            datasets: self.registry.len(),
            local_commits: load(&c.local_commits),
            failed_commits: load(&c.failed_commits),
            gossip_applied: load(&c.gossip_applied),
            gossip_duplicate: load(&c.gossip_duplicate),
            gossip_stale: load(&c.gossip_stale),
            directives_applied: load(&c.directives_applied),
            directives_ignored: load(&c.directives_ignored),
            queries_answered: load(&c.queries_answered),
            messages_dropped: load(&c.messages_dropped),
            distributions_enqueued: load(&c.distributions_enqueued),
            distributions_failed: load(&c.distributions_failed),
        }
    }
}
