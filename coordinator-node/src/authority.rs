// Coordinating Authority
//
// Issues global or scoped permission directives, relays directives issued
// by other coordinators, and answers permission questions by querying the
// network. It holds no subject, policy or dataset state between calls:
// - Directives are published and forgotten
// - Queries are a bounded fan-out and aggregate over the responses
// - The only local state is the issuance clock, the relay cache of
//   directive ids and the table of in-flight queries

use lru::LruCache;
use metrics::counter;
use serde::Serialize;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use policy_common::{
    DataUser, GossipEnvelope, GossipMessage, GossipTransport, IssuanceClock, Node, PeerId,
    Permission, PermissionDirective, PermissionQuery, QueryResponse, QueryTarget, Result, Scope,
    Subject, Verb,
};

use crate::pending::PendingQueries;

/// Runtime options of a coordinating authority
#[derive(Debug, Clone)]
pub struct AuthorityOptions {
    /// How long a query collects responses
    pub query_window: Duration,
    /// Responses buffered per query
    pub response_buffer: usize,
    /// Stop collecting once this many stores answered
    pub expected_responders: Option<usize>,
    /// Re-publish directives issued by other coordinators
    pub relay_directives: bool,
    /// Number of directive ids remembered for relay deduplication
    pub relay_cache_size: usize,
}

impl Default for AuthorityOptions {
    fn default() -> Self {
        Self {
            query_window: Duration::from_secs(2),
            response_buffer: 256,
            expected_responders: None,
            relay_directives: true,
            relay_cache_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthorityStats {
    pub directives_issued: u64,
    pub directives_relayed: u64,
    pub queries_issued: u64,
    pub responses_received: u64,
    pub messages_dropped: u64,
    pub pending_queries: usize,
}

#[derive(Debug, Default)]
struct AuthorityCounters {
    directives_issued: AtomicU64,
    directives_relayed: AtomicU64,
    queries_issued: AtomicU64,
    responses_received: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct CoordinatingAuthority {
    peer: PeerId,
    options: AuthorityOptions,
    transport: Arc<dyn GossipTransport>,
    clock: IssuanceClock,
    pending: Arc<PendingQueries>,
    seen_directives: Mutex<LruCache<uuid::Uuid, ()>>,
    counters: AuthorityCounters,
}

impl CoordinatingAuthority {
    pub fn new(options: AuthorityOptions, transport: Arc<dyn GossipTransport>) -> Self {
        let peer = transport.local_peer().clone();
        let cache_size = NonZeroUsize::new(options.relay_cache_size).unwrap_or(NonZeroUsize::MIN);

        info!(peer = %peer, "Initializing coordinating authority");

        Self {
            peer,
            pending: PendingQueries::new(options.response_buffer),
            options,
            transport,
            clock: IssuanceClock::new(),
            seen_directives: Mutex::new(LruCache::new(cache_size)),
            counters: AuthorityCounters::default(),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Register the broadcast and response handlers with the transport
    pub fn attach(self: &Arc<Self>) {
        let authority: Weak<Self> = Arc::downgrade(self);
        self.transport.register_broadcast_handler(Arc::new(move |data: &[u8]| {
            match authority.upgrade() {
                Some(authority) => authority.handle_gossip(data),
                None => Ok(None),
            }
        }));

        let authority: Weak<Self> = Arc::downgrade(self);
        self.transport.register_response_handler(Arc::new(move |data: &[u8]| {
            if let Some(authority) = authority.upgrade() {
                authority.handle_response(data);
            }
        }));
        debug!(peer = %self.peer, "Gossip handlers attached");
    }

    /// Grant `permission` on `subject` to every storage node and data user
    pub fn broadcast_permission_to_storage_network(&self, subject: Subject, permission: Permission) {
        self.grant(subject, permission, Scope::All);
    }

    /// Grant `permission` on `subject` to a subset of storage nodes
    pub fn broadcast_permission<I>(&self, subject: Subject, permission: Permission, nodes: I)
    where
        I: IntoIterator<Item = Node>,
    {
        self.grant(subject, permission, Scope::storage_nodes(nodes));
    }

    /// Grant the default permission on `subject` to a set of data users
    pub fn permit_data_users<I>(&self, subject: Subject, users: I)
    where
        I: IntoIterator<Item = DataUser>,
    {
        self.grant(subject, Permission::default(), Scope::data_users(users));
    }

    /// Revoke `subject` from every storage node and every data user
    pub fn revoke_all(&self, subject: Subject) {
        self.revoke(subject, Scope::All);
    }

    pub fn revoke_data_users<I>(&self, subject: Subject, users: I)
    where
        I: IntoIterator<Item = DataUser>,
    {
        self.revoke(subject, Scope::data_users(users));
    }

    pub fn revoke_storage_nodes<I>(&self, subject: Subject, nodes: I)
    where
        I: IntoIterator<Item = Node>,
    {
        self.revoke(subject, Scope::storage_nodes(nodes));
    }

    pub fn grant(&self, subject: Subject, permission: Permission, scope: Scope) {
        self.issue(subject, Verb::Grant { permission }, scope);
    }

    pub fn revoke(&self, subject: Subject, scope: Scope) {
        self.issue(subject, Verb::Revoke, scope);
    }

    /// Publish a directive without waiting for delivery
    fn issue(&self, subject: Subject, verb: Verb, scope: Scope) {
        if scope.is_empty() {
            warn!(subject = %subject, "Directive with an empty recipient set not published");
            return;
        }

        let directive = PermissionDirective::new(self.peer.clone(), self.clock.next(), subject, verb, scope);
        self.remember(directive.id);

        let id = directive.id;
        let subject = directive.subject.clone();
        let grant = directive.verb.is_grant();
        match GossipEnvelope::new(self.peer.clone(), GossipMessage::Directive(directive)).encode() {
            Ok(payload) => {
                self.transport.publish_broadcast(payload);
                self.counters.directives_issued.fetch_add(1, Ordering::Relaxed);
                counter!("coordinator_directives_issued_total", 1);
                info!(directive = %id, subject = %subject, grant, "Directive published");
            }
            Err(e) => error!(directive = %id, error = %e, "Failed to encode directive"),
        }
    }

    /// Storage nodes permitted for `subject`, as reported by the network
    ///
    /// Best effort: stores that do not answer within the query window are
    /// missing from the result.
    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn get_permitted_storage_nodes(&self, subject: Subject) -> Vec<Node> {
        let responses = self.query(subject.clone(), QueryTarget::StorageNodes).await;
        let nodes: BTreeSet<Node> = responses
            .into_iter()
            .filter(|response| response.subject == subject)
            .flat_map(|response| response.storage_nodes)
            .collect();
        nodes.into_iter().collect()
    }

    /// Data users permitted for `subject`, as reported by the network
    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn get_permitted_data_users(&self, subject: Subject) -> Vec<DataUser> {
        let responses = self.query(subject.clone(), QueryTarget::DataUsers).await;
        let users: BTreeSet<DataUser> = responses
            .into_iter()
            .filter(|response| response.subject == subject)
            .flat_map(|response| response.data_users)
            .collect();
        users.into_iter().collect()
    }

    async fn query(&self, subject: Subject, target: QueryTarget) -> Vec<QueryResponse> {
        // Registered before publishing: responses may arrive during the publish
        let pending = self.pending.register();
        let query = PermissionQuery {
            request_id: pending.request_id(),
            subject,
            target,
        };

        match GossipEnvelope::new(self.peer.clone(), GossipMessage::Query(query)).encode() {
            Ok(payload) => self.transport.publish_broadcast(payload),
            Err(e) => {
                error!(error = %e, "Failed to encode permission query");
                return Vec::new();
            }
        }
        self.counters.queries_issued.fetch_add(1, Ordering::Relaxed);
        counter!("coordinator_queries_total", 1);

        let responses = pending
            .collect(self.options.query_window, self.options.expected_responders)
            .await;
        if responses.is_empty() {
            warn!("Query window closed without any response");
        }
        responses
    }

    /// Inbound broadcast handler
    ///
    /// Directives from other coordinators are relayed once; everything else
    /// is validated and logged. Malformed messages are dropped.
    pub fn handle_gossip(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let envelope = match GossipEnvelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.record_drop();
                warn!(peer = %self.peer, error = %e, "Dropping gossip message");
                return Ok(None);
            }
        };

        if envelope.sender == self.peer {
            return Ok(None);
        }

        match &envelope.message {
            GossipMessage::Directive(directive) => {
                if directive.issuer == self.peer {
                    return Ok(None);
                }
                if self.options.relay_directives && self.remember(directive.id) {
                    self.transport.publish_broadcast(data.to_vec());
                    self.counters.directives_relayed.fetch_add(1, Ordering::Relaxed);
                    counter!("coordinator_directives_relayed_total", 1);
                    debug!(directive = %directive.id, issuer = %directive.issuer, "Directive relayed");
                }
            }
            GossipMessage::PolicyUpdate(update) => {
                debug!(
                    subject = %update.policy.object,
                    issuer = %update.policy.issuer,
                    order = update.policy.order,
                    "Observed policy update"
                );
            }
            GossipMessage::Query(_) | GossipMessage::QueryResponse(_) => {}
        }
        Ok(None)
    }

    /// Inbound direct-response handler; never blocks
    pub fn handle_response(&self, data: &[u8]) {
        match GossipEnvelope::decode(data) {
            Ok(GossipEnvelope {
                message: GossipMessage::QueryResponse(response),
                ..
            }) => {
                self.counters.responses_received.fetch_add(1, Ordering::Relaxed);
                counter!("coordinator_query_responses_total", 1);
                self.pending.deliver(response);
            }
            Ok(envelope) => {
                self.record_drop();
                warn!(kind = envelope.message.kind(), "Unexpected direct message dropped");
            }
            Err(e) => {
                self.record_drop();
                warn!(error = %e, "Dropping malformed response");
            }
        }
    }

    pub fn pending_queries(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> AuthorityStats {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        AuthorityStats {
            directives_issued: load(&self.counters.directives_issued),
            directives_relayed: load(&self.counters.directives_relayed),
            queries_issued: load(&self.counters.queries_issued),
            responses_received: load(&self.counters.responses_received),
            messages_dropped: load(&self.counters.messages_dropped),
            pending_queries: self.pending.len(),
        }
    }

    /// Remember a directive id; `true` if it was not seen before
    fn remember(&self, id: uuid::Uuid) -> bool {
        self.seen_directives
            .lock()
            .map(|mut seen| seen.put(id, ()).is_none())
            .unwrap_or(false)
    }

    fn record_drop(&self) {
        self.counters.messages_dropped.fetch_add(1, Ordering::Relaxed);
        counter!("coordinator_gossip_dropped_total", 1);
    }
}
