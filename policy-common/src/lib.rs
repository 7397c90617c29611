//! Policy Common Library
//!
//! Shared building blocks of the policy-dissemination network: the data
//! model, the gossip wire format, the convergence rule that keeps replicas
//! consistent, the issuance clock, and the gossip transport boundary.

pub mod clock;
pub mod convergence;
pub mod error;
pub mod logging;
pub mod message;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use clock::{IssuanceClock, MAX_WITNESS_SKEW};
pub use convergence::{merge_into, resolve, MergeOutcome, Precedence, Versioned};
pub use error::{PolicyError, Result};
pub use logging::{init_tracing, LoggingConfig};
pub use message::{
    GossipEnvelope, GossipMessage, PermissionDirective, PermissionQuery, PolicyUpdate, QueryResponse,
    QueryTarget, Scope, Verb, WIRE_VERSION,
};
pub use transport::{
    BroadcastHandler, GossipTransport, MemoryNetwork, MemoryTransport, NatsTransport,
    NatsTransportConfig, ResponseHandler,
};
pub use types::{DataUser, Grant, Grantee, Node, PeerId, Permission, Policy, PolicyContent, Subject};
