//! Storage node boundary
//!
//! A storage node durably holds datasets and their policies. Committing a
//! policy to the dataset's node of record is the linearization point of a
//! local policy change, so `store` is awaited before anything else happens.
//! Implementations must be idempotent under retry.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use policy_common::{Node, Policy, PolicyError, Result, Subject};

#[async_trait]
pub trait StorageNode: Send + Sync {
    fn id(&self) -> &Node;

    /// Durably store `policy` for `dataset_id`
    async fn store(&self, dataset_id: &Subject, policy: &Policy) -> Result<()>;
}

/// Storage node reached over HTTP
///
/// Policies are sent as `PUT {base_url}/policies/{dataset_id}` with the
/// policy as JSON body.
pub struct HttpStorageNode {
    id: Node,
    base_url: String,
    client: Client,
}

impl HttpStorageNode {
    pub fn new(id: Node, base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PolicyError::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            id,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn policy_url(&self, dataset_id: &Subject) -> String {
        format!("{}/policies/{}", self.base_url, dataset_id)
    }
}

#[async_trait]
impl StorageNode for HttpStorageNode {
    fn id(&self) -> &Node {
        &self.id
    }

    #[instrument(skip(self, policy), fields(node = %self.id))]
    async fn store(&self, dataset_id: &Subject, policy: &Policy) -> Result<()> {
        let response = self
            .client
            .put(self.policy_url(dataset_id))
            .json(policy)
            .send()
            .await
            .map_err(|e| {
                PolicyError::Unavailable(format!("storage node {} unreachable: {}", self.id, e))
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(dataset = %dataset_id, "Storage node acknowledged policy");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        warn!(dataset = %dataset_id, status = %status, "Storage node rejected policy");
        if status.is_client_error() {
            Err(PolicyError::BadRequest(format!(
                "storage node {} rejected policy with status {}: {}",
                self.id, status, body
            )))
        } else {
            Err(PolicyError::Unavailable(format!(
                "storage node {} failed with status {}: {}",
                self.id, status, body
            )))
        }
    }
}

/// In-process storage node for development mode and tests
///
/// Keeps the latest policy per dataset. Failures and latency can be injected.
pub struct MemoryStorageNode {
    id: Node,
    stored: DashMap<Subject, Policy>,
    calls: AtomicUsize,
    failure: RwLock<Option<PolicyError>>,
    delay_ms: AtomicU64,
}

impl MemoryStorageNode {
    pub fn new(id: impl Into<Node>) -> Self {
        Self {
            id: id.into(),
            stored: DashMap::new(),
            calls: AtomicUsize::new(0),
            failure: RwLock::new(None),
            delay_ms: AtomicU64::new(0),
        }
    }

    /// Make every following `store` fail with `error`, or succeed again with `None`
    pub fn set_failure(&self, error: Option<PolicyError>) {
        if let Ok(mut failure) = self.failure.write() {
            *failure = error;
        }
    }

    /// Delay every following `store` call
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn stored(&self, dataset_id: &str) -> Option<Policy> {
        self.stored.get(dataset_id).map(|p| p.value().clone())
    }

    /// Number of `store` invocations, successful or not
    pub fn store_calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StorageNode for MemoryStorageNode {
    fn id(&self) -> &Node {
        &self.id
    }

    async fn store(&self, dataset_id: &Subject, policy: &Policy) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if let Some(error) = self.failure.read().ok().and_then(|f| f.clone()) {
            return Err(error);
        }

        self.stored.insert(dataset_id.clone(), policy.clone());
        Ok(())
    }
}

/// Resolves storage node identities to their clients
#[derive(Default)]
pub struct StorageDirectory {
    nodes: DashMap<Node, Arc<dyn StorageNode>>,
}

impl StorageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, node: Arc<dyn StorageNode>) {
        info!(node = %node.id(), "Storage node added to directory");
        self.nodes.insert(node.id().clone(), node);
    }

    pub fn resolve(&self, node: &Node) -> Result<Arc<dyn StorageNode>> {
        self.nodes
            .get(node)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PolicyError::Unavailable(format!("no client for storage node {}", node)))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
