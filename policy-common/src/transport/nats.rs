//! NATS-backed gossip transport
//!
//! Broadcasts go to `{prefix}.broadcast`, direct responses to
//! `{prefix}.response.{peer}`. The origin of every message travels in the
//! `Gossip-Origin` header so handlers' responses can be routed back.
//! Outbound traffic is queued on a bounded channel and drained by a single
//! publisher task.

use async_nats::{Client, ConnectOptions, HeaderMap, Message, Subscriber};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use super::{BroadcastHandler, GossipTransport, HandlerSlots, ResponseHandler};
use crate::error::{PolicyError, Result};
use crate::types::PeerId;

const ORIGIN_HEADER: &str = "Gossip-Origin";

/// NATS transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsTransportConfig {
    /// NATS server URL
    pub server_url: String,
    /// Subject prefix shared by every member of one policy network
    pub subject_prefix: String,
    /// Capacity of the outbound queue; messages beyond it are dropped
    pub outbound_queue: usize,
}

impl Default for NatsTransportConfig {
    fn default() -> Self {
        Self {
            server_url: "nats://127.0.0.1:4222".to_string(),
            subject_prefix: "policy.gossip".to_string(),
            outbound_queue: 1024,
        }
    }
}

impl NatsTransportConfig {
    fn broadcast_subject(&self) -> String {
        format!("{}.broadcast", self.subject_prefix)
    }

    fn response_subject(&self, peer: &PeerId) -> String {
        format!("{}.response.{}", self.subject_prefix, peer)
    }
}

enum Outbound {
    Broadcast(Vec<u8>),
    Response { peer: PeerId, payload: Vec<u8> },
}

pub struct NatsTransport {
    peer: PeerId,
    slots: Arc<HandlerSlots>,
    outbound: mpsc::Sender<Outbound>,
}

impl NatsTransport {
    /// Connect to NATS, subscribe to the gossip subjects and start the
    /// publisher and listener tasks
    pub async fn connect(peer: PeerId, config: NatsTransportConfig) -> Result<Arc<Self>> {
        peer.validate()?;

        info!(nats_url = %config.server_url, peer = %peer, "Connecting gossip transport to NATS");

        let options = ConnectOptions::new()
            .name(peer.as_str())
            .retry_on_initial_connect()
            .reconnect_delay_callback(|attempts| {
                if attempts < 10 {
                    Duration::from_millis(200 * attempts as u64)
                } else {
                    Duration::from_secs(10)
                }
            });

        let client = async_nats::connect_with_options(config.server_url.as_str(), options)
            .await
            .map_err(|e| PolicyError::Unavailable(format!("failed to connect to NATS: {}", e)))?;

        let broadcasts = client
            .subscribe(config.broadcast_subject())
            .await
            .map_err(|e| PolicyError::Unavailable(format!("failed to subscribe to broadcasts: {}", e)))?;
        let responses = client
            .subscribe(config.response_subject(&peer))
            .await
            .map_err(|e| PolicyError::Unavailable(format!("failed to subscribe to responses: {}", e)))?;

        let (outbound, queue) = mpsc::channel(config.outbound_queue.max(1));
        let slots = Arc::new(HandlerSlots::new());

        tokio::spawn(publisher_task(client, queue, peer.clone(), config.clone()));
        tokio::spawn(broadcast_listener(
            broadcasts,
            Arc::clone(&slots),
            outbound.clone(),
            peer.clone(),
        ));
        tokio::spawn(response_listener(responses, Arc::clone(&slots)));

        info!(
            peer = %peer,
            subject = %config.broadcast_subject(),
            "Gossip transport connected"
        );

        Ok(Arc::new(Self {
            peer,
            slots,
            outbound,
        }))
    }

    fn enqueue(&self, message: Outbound) {
        if let Err(e) = self.outbound.try_send(message) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "publisher stopped",
            };
            warn!(peer = %self.peer, reason, "Outbound gossip message dropped");
        }
    }
}

impl GossipTransport for NatsTransport {
    fn local_peer(&self) -> &PeerId {
        &self.peer
    }

    fn publish_broadcast(&self, payload: Vec<u8>) {
        self.enqueue(Outbound::Broadcast(payload));
    }

    fn send_response(&self, peer: &PeerId, payload: Vec<u8>) {
        self.enqueue(Outbound::Response {
            peer: peer.clone(),
            payload,
        });
    }

    fn register_broadcast_handler(&self, handler: BroadcastHandler) {
        self.slots.set_broadcast(handler);
    }

    fn register_response_handler(&self, handler: ResponseHandler) {
        self.slots.set_response(handler);
    }
}

fn origin_of(message: &Message) -> Option<PeerId> {
    message
        .headers
        .as_ref()
        .and_then(|headers| headers.get(ORIGIN_HEADER))
        .map(|value| PeerId::new(value.as_str()))
}

async fn publisher_task(
    client: Client,
    mut queue: mpsc::Receiver<Outbound>,
    peer: PeerId,
    config: NatsTransportConfig,
) {
    while let Some(message) = queue.recv().await {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN_HEADER, peer.as_str());

        let (subject, payload) = match message {
            Outbound::Broadcast(payload) => (config.broadcast_subject(), payload),
            Outbound::Response { peer: to, payload } => (config.response_subject(&to), payload),
        };

        if let Err(e) = client
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
        {
            error!(subject = %subject, error = %e, "Failed to publish gossip message");
        }
    }
    debug!(peer = %peer, "Gossip publisher stopped");
}

async fn broadcast_listener(
    mut subscriber: Subscriber,
    slots: Arc<HandlerSlots>,
    outbound: mpsc::Sender<Outbound>,
    peer: PeerId,
) {
    while let Some(message) = subscriber.next().await {
        let Some(origin) = origin_of(&message) else {
            warn!("Broadcast without origin header dropped");
            continue;
        };
        // NATS echoes our own publications back to us
        if origin == peer {
            continue;
        }
        let Some(handler) = slots.broadcast() else {
            continue;
        };

        match handler(&message.payload) {
            Ok(Some(response)) => {
                if outbound
                    .try_send(Outbound::Response {
                        peer: origin,
                        payload: response,
                    })
                    .is_err()
                {
                    warn!("Response to broadcast dropped, outbound queue unavailable");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(origin = %origin, error = %e, "Broadcast handler failed"),
        }
    }
    warn!(peer = %peer, "Broadcast subscription closed");
}

async fn response_listener(mut subscriber: Subscriber, slots: Arc<HandlerSlots>) {
    while let Some(message) = subscriber.next().await {
        if let Some(handler) = slots.response() {
            handler(&message.payload);
        }
    }
    warn!("Response subscription closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_layout() {
        let config = NatsTransportConfig::default();
        assert_eq!(config.broadcast_subject(), "policy.gossip.broadcast");
        assert_eq!(
            config.response_subject(&PeerId::new("P1")),
            "policy.gossip.response.P1"
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_peer() {
        let result = NatsTransport::connect(PeerId::new("bad.peer"), NatsTransportConfig::default()).await;
        assert!(matches!(result, Err(PolicyError::Config(_))));
    }
}
