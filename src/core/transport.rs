//! Outbound message delivery
//!
//! `TransportAdapter` is what coordinators talk to: it owns the configured
//! [`TransportChannel`], applies the default transport hint and logs every
//! send. `InMemoryNetwork` is a routed set of channels between agents living
//! in one process, used for embedding and end-to-end tests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::traits::{TransportChannel, TransportHint};
use crate::types::{DeliveryError, Did, ProtocolMessage};

/// Sends protocol messages to DIDs over the configured channel
pub struct TransportAdapter {
    channel: Arc<dyn TransportChannel>,
    default_hint: Option<TransportHint>,
}

impl TransportAdapter {
    pub fn new(channel: Arc<dyn TransportChannel>, default_hint: Option<TransportHint>) -> Self {
        TransportAdapter {
            channel,
            default_hint,
        }
    }

    /// Send a message, falling back to the default hint when none is given
    pub async fn send(
        &self,
        to: &Did,
        message: ProtocolMessage,
        hint: Option<TransportHint>,
    ) -> Result<(), DeliveryError> {
        let hint = hint.or(self.default_hint);
        let thid = message.thid.clone();
        let kind = message.kind();

        match self.channel.send(to, message, hint).await {
            Ok(()) => {
                debug!(%thid, kind, %to, ?hint, "message sent");
                Ok(())
            }
            Err(e) => {
                warn!(%thid, kind, %to, error = %e, "message delivery failed");
                Err(e)
            }
        }
    }
}

/// Inbound item: sender DID and message
pub type Envelope = (Did, ProtocolMessage);

/// In-process network routing messages between registered DIDs
#[derive(Debug, Default)]
pub struct InMemoryNetwork {
    inboxes: DashMap<Did, mpsc::UnboundedSender<Envelope>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a DID and return the receiving end of its inbox
    pub fn register(&self, did: &Did) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(did.clone(), tx);
        rx
    }

    /// Remove a DID; later sends to it fail with `Unreachable`
    pub fn disconnect(&self, did: &Did) {
        self.inboxes.remove(did);
    }

    /// A channel that sends on behalf of `from`
    pub fn channel(self: &Arc<Self>, from: &Did) -> Arc<dyn TransportChannel> {
        Arc::new(NetworkChannel {
            network: Arc::clone(self),
            from: from.clone(),
        })
    }

    fn deliver(&self, from: &Did, to: &Did, message: ProtocolMessage) -> Result<(), DeliveryError> {
        let inbox = self
            .inboxes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| DeliveryError::Unreachable { did: to.to_string() })?;
        inbox
            .send((from.clone(), message))
            .map_err(|_| DeliveryError::ChannelClosed { did: to.to_string() })
    }
}

struct NetworkChannel {
    network: Arc<InMemoryNetwork>,
    from: Did,
}

#[async_trait]
impl TransportChannel for NetworkChannel {
    async fn send(
        &self,
        to: &Did,
        message: ProtocolMessage,
        _hint: Option<TransportHint>,
    ) -> Result<(), DeliveryError> {
        self.network.deliver(&self.from, to, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;

    #[tokio::test]
    async fn test_network_routes_by_did() {
        let network = InMemoryNetwork::new();
        let alice = Did::from("did:peer:alice");
        let bob = Did::from("did:peer:bob");
        let mut bob_inbox = network.register(&bob);
        let adapter = TransportAdapter::new(network.channel(&alice), Some(TransportHint::Nfc));

        let message = ProtocolMessage::problem_report(TransactionId::from("t"), "code", "comment");
        adapter.send(&bob, message.clone(), None).await.unwrap();

        let (from, received) = bob_inbox.recv().await.unwrap();
        assert_eq!(from, alice);
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_unknown_did_is_unreachable() {
        let network = InMemoryNetwork::new();
        let adapter = TransportAdapter::new(network.channel(&Did::from("did:peer:a")), None);
        let nobody = Did::from("did:peer:nobody");

        let result = adapter
            .send(
                &nobody,
                ProtocolMessage::problem_report(TransactionId::from("t"), "c", "x"),
                Some(TransportHint::Http),
            )
            .await;

        assert_eq!(
            result,
            Err(DeliveryError::Unreachable {
                did: nobody.to_string()
            })
        );
    }
}
