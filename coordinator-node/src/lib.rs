//! Coordinator Node Library
//!
//! Stateless coordinating authority of the policy network. It issues global
//! and scoped permission directives over gossip, relays directives from other
//! coordinators once, and answers permission questions by querying the
//! stores within a bounded window.

pub mod api;
pub mod authority;
pub mod config;
pub mod pending;

// Re-export commonly used types
pub use api::{create_router, start_api};
pub use authority::{AuthorityOptions, AuthorityStats, CoordinatingAuthority};
pub use config::CoordinatorConfig;
pub use pending::{PendingQueries, PendingQuery};
