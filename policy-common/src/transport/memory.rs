//! In-process gossip network
//!
//! Delivers synchronously on the publishing task, which keeps tests
//! deterministic. Faults can be injected: every delivery may be repeated
//! a configurable number of times, and members can be partitioned so they
//! neither send nor receive.

use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{BroadcastHandler, GossipTransport, HandlerSlots, ResponseHandler};
use crate::types::PeerId;

#[derive(Default)]
pub struct MemoryNetwork {
    members: DashMap<PeerId, Arc<HandlerSlots>>,
    partitioned: DashSet<PeerId>,
    extra_deliveries: AtomicUsize,
    delivered: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a member and hand back its transport
    pub fn join(self: &Arc<Self>, peer: impl Into<PeerId>) -> Arc<MemoryTransport> {
        let peer = peer.into();
        let slots = Arc::new(HandlerSlots::new());
        self.members.insert(peer.clone(), Arc::clone(&slots));
        Arc::new(MemoryTransport {
            peer,
            slots,
            network: Arc::clone(self),
        })
    }

    pub fn leave(&self, peer: &PeerId) {
        self.members.remove(peer);
    }

    /// Cut a member off from the network until `heal` is called
    pub fn partition(&self, peer: &PeerId) {
        self.partitioned.insert(peer.clone());
    }

    pub fn heal(&self, peer: &PeerId) {
        self.partitioned.remove(peer);
    }

    /// Deliver every message `extra` additional times
    pub fn set_extra_deliveries(&self, extra: usize) {
        self.extra_deliveries.store(extra, Ordering::Relaxed);
    }

    /// Total handler invocations so far
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn is_cut_off(&self, peer: &PeerId) -> bool {
        self.partitioned.contains(peer)
    }

    fn broadcast_from(&self, origin: &PeerId, payload: &[u8]) {
        if self.is_cut_off(origin) {
            debug!(origin = %origin, "Broadcast dropped, origin is partitioned");
            return;
        }

        // Collect first so no map shard stays locked while handlers run
        let targets: Vec<(PeerId, Arc<HandlerSlots>)> = self
            .members
            .iter()
            .filter(|member| member.key() != origin && !self.is_cut_off(member.key()))
            .map(|member| (member.key().clone(), Arc::clone(member.value())))
            .collect();

        let repeats = 1 + self.extra_deliveries.load(Ordering::Relaxed);
        for (peer, slots) in targets {
            let Some(handler) = slots.broadcast() else {
                continue;
            };
            for _ in 0..repeats {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                match handler(payload) {
                    Ok(Some(response)) => self.respond(&peer, origin, &response),
                    Ok(None) => {}
                    Err(e) => warn!(peer = %peer, error = %e, "Broadcast handler failed"),
                }
            }
        }
    }

    fn respond(&self, from: &PeerId, to: &PeerId, payload: &[u8]) {
        if self.is_cut_off(from) || self.is_cut_off(to) {
            debug!(from = %from, to = %to, "Response dropped, member is partitioned");
            return;
        }

        let Some(slots) = self.members.get(to).map(|member| Arc::clone(member.value())) else {
            debug!(to = %to, "Response dropped, unknown member");
            return;
        };
        let Some(handler) = slots.response() else {
            return;
        };

        let repeats = 1 + self.extra_deliveries.load(Ordering::Relaxed);
        for _ in 0..repeats {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            handler(payload);
        }
    }
}

/// One member's view of a [`MemoryNetwork`]
pub struct MemoryTransport {
    peer: PeerId,
    slots: Arc<HandlerSlots>,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

impl GossipTransport for MemoryTransport {
    fn local_peer(&self) -> &PeerId {
        &self.peer
    }

    fn publish_broadcast(&self, payload: Vec<u8>) {
        self.network.broadcast_from(&self.peer, &payload);
    }

    fn send_response(&self, peer: &PeerId, payload: Vec<u8>) {
        self.network.respond(&self.peer, peer, &payload);
    }

    fn register_broadcast_handler(&self, handler: BroadcastHandler) {
        self.slots.set_broadcast(handler);
    }

    fn register_response_handler(&self, handler: ResponseHandler) {
        self.slots.set_response(handler);
    }
}
