//! Gossip transport boundary
//!
//! The policy engine consumes gossip as an injected capability. Delivery is
//! best-effort, at-least-once and unordered; implementations never deliver a
//! member's own broadcasts back to it.

use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::types::PeerId;

pub mod memory;
pub mod nats;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use nats::{NatsTransport, NatsTransportConfig};

/// Handles one inbound broadcast; `Some(bytes)` is sent back to the origin
/// as a direct response.
pub type BroadcastHandler = Arc<dyn Fn(&[u8]) -> Result<Option<Vec<u8>>> + Send + Sync>;

/// Handles one inbound direct response
pub type ResponseHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Capability exposed by the gossip layer
///
/// All methods return immediately; publishing is an enqueue, not a wait.
pub trait GossipTransport: Send + Sync {
    fn local_peer(&self) -> &PeerId;

    /// Publish content to every other member
    fn publish_broadcast(&self, payload: Vec<u8>);

    /// Send a point-to-point message to one member
    fn send_response(&self, peer: &PeerId, payload: Vec<u8>);

    fn register_broadcast_handler(&self, handler: BroadcastHandler);

    fn register_response_handler(&self, handler: ResponseHandler);
}

/// Registered handlers of one member, swappable at runtime
#[derive(Default)]
pub struct HandlerSlots {
    broadcast: RwLock<Option<BroadcastHandler>>,
    response: RwLock<Option<ResponseHandler>>,
}

impl HandlerSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_broadcast(&self, handler: BroadcastHandler) {
        if let Ok(mut slot) = self.broadcast.write() {
            *slot = Some(handler);
        }
    }

    pub fn set_response(&self, handler: ResponseHandler) {
        if let Ok(mut slot) = self.response.write() {
            *slot = Some(handler);
        }
    }

    /// Clone of the current broadcast handler; callers invoke it without
    /// holding the slot lock.
    pub fn broadcast(&self) -> Option<BroadcastHandler> {
        self.broadcast.read().ok().and_then(|slot| slot.clone())
    }

    pub fn response(&self) -> Option<ResponseHandler> {
        self.response.read().ok().and_then(|slot| slot.clone())
    }
}
