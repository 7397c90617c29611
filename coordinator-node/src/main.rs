use anyhow::{Context, Result};
use metrics::describe_counter;
use std::sync::Arc;
use tracing::{error, info, warn};

use coordinator_node::{start_api, CoordinatingAuthority, CoordinatorConfig};
use policy_common::{init_tracing, GossipTransport, MemoryNetwork, NatsTransport};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("COORDINATOR_CONFIG").unwrap_or_else(|_| "config/coordinator".to_string());

    let (config, load_error) = match CoordinatorConfig::from_file(&config_path) {
        Ok(config) => (config, None),
        Err(e) => (CoordinatorConfig::default(), Some(e)),
    };

    init_tracing(&config.logging).context("Failed to initialize logging")?;

    info!("Starting Policy Coordinator v{}", env!("CARGO_PKG_VERSION"));
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
            warn!("Using in-process gossip transport, directives will not leave this process");
            MemoryNetwork::new().join(peer.clone())
        }
        _ => NatsTransport::connect(peer.clone(), config.gossip.nats.clone())
            .await
            .context("Failed to connect gossip transport")?,
    };

    let authority = Arc::new(CoordinatingAuthority::new(config.authority_options(), transport));
    authority.attach();

    info!(
        peer = %peer,
        query_window_ms = config.query.window_ms,
        relay = config.relay.enabled,
        "Coordinator ready"
    );

    let api_config = config.api.clone();
    let api_authority = Arc::clone(&authority);
    let api = tokio::spawn(async move {
        if let Err(e) = start_api(api_config, api_authority).await {
            error!(error = %e, "Coordinator API server failed");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = api, if config.api.enabled => warn!("Coordinator API stopped"),
    }

    info!(stats = ?authority.stats(), "Coordinator terminated");
    Ok(())
}

fn initialize_metrics() {
    describe_counter!("coordinator_directives_issued_total", "Permission directives published");
    describe_counter!(
        "coordinator_directives_relayed_total",
        "Directives from other coordinators relayed once"
    );
    describe_counter!("coordinator_queries_total", "Permission queries issued to the network");
    describe_counter!("coordinator_query_responses_total", "Query responses received");
    describe_counter!("coordinator_gossip_dropped_total", "Malformed or unexpected messages dropped");
}
