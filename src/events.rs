//! Ledger events and the in-process bus that fans them out
//!
//! Events are published only after the change they describe has been
//! committed. Subscribers (websocket sessions, the webhook dispatcher) each
//! hold their own receiver, so a slow subscriber lags and drops events
//! without holding up the publisher or anyone else.

use crate::blockchain::{Block, TransactionRecord};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Transaction,
    Block,
    Name,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Transaction => "transaction",
            EventKind::Block => "block",
            EventKind::Name => "name",
        }
    }

    /// Whether an address whitelist means anything for this kind.
    pub fn supports_address_filter(self) -> bool {
        matches!(self, EventKind::Transaction | EventKind::Name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transaction" => Ok(EventKind::Transaction),
            "block" => Ok(EventKind::Block),
            "name" => Ok(EventKind::Name),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameAction {
    Purchase,
    Transfer,
    Update,
}

/// Emitted by the name subsystem, which lives outside this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameEvent {
    pub name: String,
    pub owner: String,
    pub previous_owner: Option<String>,
    pub action: NameAction,
}

#[derive(Debug, Clone)]
pub enum LedgerEvent {
    Block { block: Block, new_work: u64 },
    Transaction(TransactionRecord),
    Name(NameEvent),
}

impl LedgerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LedgerEvent::Block { .. } => EventKind::Block,
            LedgerEvent::Transaction(_) => EventKind::Transaction,
            LedgerEvent::Name(_) => EventKind::Name,
        }
    }

    /// Addresses this event concerns.
    pub fn participants(&self) -> Vec<&str> {
        match self {
            LedgerEvent::Block { block, .. } => vec![block.address.as_str()],
            LedgerEvent::Transaction(tx) => tx
                .from
                .as_deref()
                .into_iter()
                .chain(std::iter::once(tx.to.as_str()))
                .collect(),
            LedgerEvent::Name(name) => std::iter::once(name.owner.as_str())
                .chain(name.previous_owner.as_deref())
                .collect(),
        }
    }

    pub fn involves(&self, address: &str) -> bool {
        self.participants().contains(&address)
    }

    /// Flat object delivered to webhooks: `{event, ...fields}`.
    pub fn webhook_payload(&self) -> Map<String, Value> {
        let body = match self {
            LedgerEvent::Block { block, new_work } => {
                let mut body = to_object(block);
                body.insert("new_work".to_string(), json!(new_work));
                body
            }
            LedgerEvent::Transaction(tx) => to_object(tx),
            LedgerEvent::Name(name) => to_object(name),
        };
        let mut payload = Map::with_capacity(body.len() + 1);
        payload.insert("event".to_string(), json!(self.kind().as_str()));
        payload.extend(body);
        payload
    }

    /// Message pushed to websocket subscribers.
    pub fn websocket_message(&self) -> Value {
        match self {
            LedgerEvent::Block { block, new_work } => json!({
                "type": "event",
                "event": "block",
                "block": block,
                "new_work": new_work,
            }),
            LedgerEvent::Transaction(tx) => json!({
                "type": "event",
                "event": "transaction",
                "transaction": tx,
            }),
            LedgerEvent::Name(name) => json!({
                "type": "event",
                "event": "name",
                "name": name,
            }),
        }
    }
}

fn to_object<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Cloneable handle to the broadcast channel every subscriber listens on.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; returns how many received it.
    pub fn publish(&self, event: LedgerEvent) -> usize {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                tracing::trace!(event = %kind, "events.no_subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::TransactionKind;
    use chrono::Utc;

    fn transfer() -> TransactionRecord {
        TransactionRecord {
            id: 7,
            from: Some("kuf03bap3u".to_string()),
            to: "k74tq2hsh6".to_string(),
            value: 3,
            time: Utc::now(),
            metadata: None,
            kind: TransactionKind::Transfer,
        }
    }

    #[test]
    fn test_participants() {
        let tx = LedgerEvent::Transaction(transfer());
        assert!(tx.involves("kuf03bap3u"));
        assert!(tx.involves("k74tq2hsh6"));
        assert!(!tx.involves("krqtnrp18z"));

        let block = LedgerEvent::Block {
            block: Block::new(2, "kuf03bap3u", "ab".repeat(32), 25, 100, Utc::now()),
            new_work: 99,
        };
        assert_eq!(block.participants(), vec!["kuf03bap3u"]);
    }

    #[test]
    fn test_webhook_payload_is_flat() {
        let payload = LedgerEvent::Transaction(transfer()).webhook_payload();
        assert_eq!(payload["event"], "transaction");
        assert_eq!(payload["id"], 7);
        assert_eq!(payload["type"], "transfer");
        assert_eq!(payload["to"], "k74tq2hsh6");
    }

    #[test]
    fn test_websocket_message_shape() {
        let name = LedgerEvent::Name(NameEvent {
            name: "example".to_string(),
            owner: "kuf03bap3u".to_string(),
            previous_owner: None,
            action: NameAction::Purchase,
        });
        let msg = name.websocket_message();
        assert_eq!(msg["type"], "event");
        assert_eq!(msg["event"], "name");
        assert_eq!(msg["name"]["action"], "purchase");
    }

    #[tokio::test]
    async fn test_bus_delivers_in_emission_order() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish(LedgerEvent::Transaction(transfer())), 0);

        let mut rx = bus.subscribe();
        for id in 1..=3 {
            let mut tx = transfer();
            tx.id = id;
            bus.publish(LedgerEvent::Transaction(tx));
        }
        for id in 1..=3 {
            match rx.recv().await.unwrap() {
                LedgerEvent::Transaction(tx) => assert_eq!(tx.id, id),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("block".parse::<EventKind>(), Ok(EventKind::Block));
        assert!("blocks".parse::<EventKind>().is_err());
        assert!(EventKind::Name.supports_address_filter());
        assert!(!EventKind::Block.supports_address_filter());
    }
}
