//! Policy Store Library
//!
//! Per-node control plane of the policy network: the policy registry, the
//! node-local permission table, the storage node boundary, the policy store
//! service that commits locally before distributing over gossip, and its
//! HTTP control API.

pub mod api;
pub mod config;
pub mod permissions;
pub mod registry;
pub mod storage_node;
pub mod store;

// Re-export commonly used types
pub use api::{create_router, start_control_api};
pub use config::StoreConfig;
pub use permissions::{DirectiveOutcome, PermissionTable};
pub use registry::{DatasetEntry, PolicyRegistry};
pub use storage_node::{HttpStorageNode, MemoryStorageNode, StorageDirectory, StorageNode};
pub use store::{PolicyStore, StoreOptions, StoreStats};
