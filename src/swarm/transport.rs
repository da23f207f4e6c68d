//! Message transport capability.
//!
//! The engine never owns a socket: it is handed something that can
//! deliver a message to a named peer. Inbound delivery is a channel the
//! engine's dispatch loop consumes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};

use super::{Message, PeerId, SwarmError};

/// Abstract peer-addressed message delivery.
///
/// Implementations are assumed best-effort, in-order, and reliable per
/// peer. The production transport is provided by the hosting process
/// (e.g. a session-addressed pub/sub channel).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers `message` to the peer identified by `target`.
    ///
    /// # Errors
    ///
    /// - `SwarmError::TransportClosed` - If the peer's endpoint is gone
    async fn send(&self, target: &PeerId, message: Message) -> Result<(), SwarmError>;
}

/// In-process transport routing messages over per-peer mpsc channels.
///
/// Each engine registers an endpoint and consumes its receiver;
/// unknown targets are a delivery failure, not a panic. Used by tests
/// and by single-process simulations.
#[derive(Default)]
pub struct ChannelTransport {
    endpoints: RwLock<HashMap<PeerId, mpsc::Sender<Message>>>,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates an inbound mailbox for `peer_id` and returns its receiver.
    ///
    /// Re-registering replaces the previous endpoint.
    pub async fn register_endpoint(&self, peer_id: PeerId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(256);
        self.endpoints.write().await.insert(peer_id, tx);
        rx
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, target: &PeerId, message: Message) -> Result<(), SwarmError> {
        let sender = {
            let endpoints = self.endpoints.read().await;
            endpoints.get(target).cloned()
        };

        match sender {
            Some(tx) => tx
                .send(message)
                .await
                .map_err(|_| SwarmError::TransportClosed {
                    peer_id: target.clone(),
                }),
            None => Err(SwarmError::TransportClosed {
                peer_id: target.clone(),
            }),
        }
    }
}
