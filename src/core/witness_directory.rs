//! Witness discovery and table gossip
//!
//! The `WitnessDirectory` caches the table of known witnesses, answers
//! table queries and pushes the table to parties that asked for it.
//!
//! The cache is last-writer-wins at whole-table granularity: a received table
//! replaces the local one outright. There is no version check, so a stale
//! table delivered late overwrites a fresher one.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::event_bus::{EventBus, TransferEvent};
use super::transport::TransportAdapter;
use crate::types::{
    Did, MessageBody, ProtocolMessage, TransactionId, ValueTransferError, WitnessInfo,
    WitnessTable,
};

pub struct WitnessDirectory {
    table: RwLock<WitnessTable>,
    /// Parties that queried the table and receive propagated updates
    interested: RwLock<BTreeSet<Did>>,
    events: Arc<EventBus>,
    transport: Arc<TransportAdapter>,
}

impl WitnessDirectory {
    pub fn new(events: Arc<EventBus>, transport: Arc<TransportAdapter>) -> Self {
        WitnessDirectory {
            table: RwLock::new(WitnessTable::default()),
            interested: RwLock::new(BTreeSet::new()),
            events,
            transport,
        }
    }

    /// The locally known table
    pub fn query(&self) -> WitnessTable {
        self.table.read().clone()
    }

    /// Add or refresh a local entry, used when a witness announces itself
    pub fn register(&self, info: WitnessInfo) {
        debug!(witness = %info.did, "witness registered");
        self.table.write().entries.insert(info.did.clone(), info);
    }

    /// Replace the cached table with one received from a peer
    pub fn on_table_received(&self, from: &Did, table: WitnessTable) {
        info!(%from, witnesses = table.len(), "witness table replaced");
        *self.table.write() = table.clone();
        self.events.publish(TransferEvent::WitnessTableReceived(table));
    }

    /// Answer a `WitnessTableQuery` and remember the requester for gossip
    ///
    /// A requester the answer cannot reach is not remembered.
    pub async fn process_query(&self, from: &Did) -> Result<WitnessTable, ValueTransferError> {
        let table = self.query();
        let message =
            ProtocolMessage::new(TransactionId::generate(), MessageBody::WitnessTable(table.clone()));
        self.transport.send(from, message, None).await?;
        self.interested.write().insert(from.clone());
        Ok(table)
    }

    /// Ask a witness for its table
    pub async fn request_table(&self, witness: &Did) -> Result<(), ValueTransferError> {
        let message = ProtocolMessage::new(TransactionId::generate(), MessageBody::WitnessTableQuery);
        self.transport.send(witness, message, None).await?;
        Ok(())
    }

    /// Push the current table to every interested party
    ///
    /// Unreachable parties are logged and dropped from the interested set;
    /// they are pushed to again only after a new query.
    ///
    /// # Returns
    ///
    /// The number of parties the table was delivered to.
    pub async fn propagate(&self) -> usize {
        let table = self.query();
        let targets: Vec<Did> = self.interested.read().iter().cloned().collect();

        let sends = targets.iter().map(|did| {
            let message = ProtocolMessage::new(
                TransactionId::generate(),
                MessageBody::WitnessTable(table.clone()),
            );
            async move { (did, self.transport.send(did, message, None).await) }
        });

        let mut unreachable = Vec::new();
        for (did, result) in join_all(sends).await {
            if let Err(e) = result {
                warn!(%did, error = %e, "witness table gossip failed, party dropped");
                unreachable.push(did);
            }
        }
        if !unreachable.is_empty() {
            let mut interested = self.interested.write();
            for did in &unreachable {
                interested.remove(*did);
            }
        }
        targets.len() - unreachable.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InMemoryNetwork, InMemoryTransactionRepository};

    fn directory(network: &Arc<InMemoryNetwork>, me: &Did) -> (WitnessDirectory, Arc<EventBus>) {
        let events = Arc::new(EventBus::new(
            Arc::new(InMemoryTransactionRepository::new()),
            16,
        ));
        let transport = Arc::new(TransportAdapter::new(network.channel(me), None));
        (WitnessDirectory::new(events.clone(), transport), events)
    }

    #[tokio::test]
    async fn test_received_table_replaces_wholesale() {
        let network = InMemoryNetwork::new();
        let (dir, events) = directory(&network, &Did::from("did:peer:me"));
        let mut sub = events.subscribe();
        dir.register(WitnessInfo::new(Did::from("did:peer:w1")));

        let fresh = WitnessTable::from_entries([WitnessInfo::new(Did::from("did:peer:w2"))]);
        dir.on_table_received(&Did::from("did:peer:w2"), fresh.clone());

        assert_eq!(dir.query(), fresh);
        assert!(dir.query().get(&Did::from("did:peer:w1")).is_none());
        assert!(matches!(
            sub.recv().await.unwrap(),
            TransferEvent::WitnessTableReceived(table) if table == fresh
        ));
    }

    #[tokio::test]
    async fn test_query_answers_and_registers_interest() {
        let network = InMemoryNetwork::new();
        let witness = Did::from("did:peer:w1");
        let party = Did::from("did:peer:party");
        let mut inbox = network.register(&party);
        let (dir, _) = directory(&network, &witness);
        dir.register(WitnessInfo::new(witness.clone()));

        let answered = dir.process_query(&party).await.unwrap();
        assert_eq!(answered.len(), 1);
        let (_, first) = inbox.recv().await.unwrap();
        assert!(matches!(first.body, MessageBody::WitnessTable(_)));

        dir.register(WitnessInfo::new(Did::from("did:peer:w3")));
        assert_eq!(dir.propagate().await, 1);
        let (_, pushed) = inbox.recv().await.unwrap();
        match pushed.body {
            MessageBody::WitnessTable(table) => assert_eq!(table.len(), 2),
            other => panic!("Expected witness table, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_propagate_drops_unreachable() {
        let network = InMemoryNetwork::new();
        let (dir, _) = directory(&network, &Did::from("did:peer:w1"));
        let party = Did::from("did:peer:party");
        let mut inbox = network.register(&party);
        dir.process_query(&party).await.unwrap();
        inbox.recv().await.unwrap();
        dir.interested.write().insert(Did::from("did:peer:gone"));

        assert_eq!(dir.propagate().await, 1);
        assert!(!dir.interested.read().contains(&Did::from("did:peer:gone")));
        assert!(dir.interested.read().contains(&party));

        assert_eq!(dir.propagate().await, 1);
        assert_eq!(dir.interested.read().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_requester_is_not_remembered() {
        let network = InMemoryNetwork::new();
        let (dir, _) = directory(&network, &Did::from("did:peer:w1"));

        let result = dir.process_query(&Did::from("did:peer:gone")).await;

        assert!(matches!(result, Err(ValueTransferError::Delivery(_))));
        assert!(dir.interested.read().is_empty());
    }
}
