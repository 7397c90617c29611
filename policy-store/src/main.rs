use anyhow::{Context, Result};
use metrics::describe_counter;
use std::sync::Arc;
use tracing::{error, info, warn};

use policy_common::{init_tracing, GossipTransport, MemoryNetwork, NatsTransport};
use policy_store::{start_control_api, PolicyStore, StoreConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("POLICY_STORE_CONFIG").unwrap_or_else(|_| "config/policy-store".to_string());

    // Load configuration from file if available, otherwise use defaults
    let (config, load_error) = match StoreConfig::from_file(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (StoreConfig::default(), Some(e)),
    };

    init_tracing(&config.logging).context("Failed to initialize logging")?;

    info!("Starting Policy Store v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        None => info!(path = %config_path, "Configuration loaded"),
        Some(e) => warn!(path = %config_path, error = %e, "Failed to load config file, using defaults"),
    }

    if config.metrics.enabled {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(config.metrics.listen_addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(metrics_addr = %config.metrics.listen_addr, "Prometheus metrics server started");
    }
    initialize_metrics();

    let peer = config.peer_id();
    let transport: Arc<dyn GossipTransport> = match config.gossip.transport.as_str() {
        "memory" => {
            warn!("Using in-process gossip transport, policies will not leave this process");
            MemoryNetwork::new().join(peer.clone())
        }
        _ => NatsTransport::connect(peer.clone(), config.gossip.nats.clone())
            .await
            .context("Failed to connect gossip transport")?,
    };

    let store = Arc::new(PolicyStore::new(
        config.store_options(),
        config.storage_directory().context("Failed to build storage nodes")?,
        config.permission_table(),
        transport,
    ));

    for dataset in &config.datasets {
        store.register_dataset(dataset.id.as_str(), dataset.node.as_str());
    }

    store.attach();
    let distributor = store.start().context("Failed to start policy distributor")?;

    info!(
        peer = %peer,
        datasets = config.datasets.len(),
        storage_nodes = config.storage.nodes.len(),
        "Policy store ready"
    );

    let api_config = config.api.clone();
    let api_store = Arc::clone(&store);
    let api = tokio::spawn(async move {
        if let Err(e) = start_control_api(api_config, api_store).await {
            error!(error = %e, "Control API server failed");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = api => warn!("Control API stopped"),
        _ = distributor => warn!("Policy distributor stopped"),
    }

    info!(stats = ?store.stats(), "Policy store terminated");
    Ok(())
}

fn initialize_metrics() {
    describe_counter!("policy_commits_total", "Policies committed at their node of record");
    describe_counter!(
        "policy_commits_failed_total",
        "Policy changes rejected because the node of record failed to commit"
    );
    describe_counter!("policy_gossip_merges_total", "Gossiped records merged, by outcome");
    describe_counter!("policy_gossip_dropped_total", "Malformed gossip messages dropped");
    describe_counter!("policy_directives_applied_total", "Permission directives applied locally");
    describe_counter!("policy_queries_answered_total", "Permission queries answered");
    describe_counter!(
        "policy_distributions_published_total",
        "Committed policies published to gossip"
    );
    describe_counter!(
        "policy_distributions_dropped_total",
        "Committed policies dropped before distribution"
    );
}
