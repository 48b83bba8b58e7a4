//! Websocket sessions
//!
//! A client first asks for a single-use token over HTTP, then upgrades on
//! `/ws/gateway/:token`. Each session runs one loop that interleaves client
//! requests with ledger events from the bus, filtered by the session's
//! subscription levels.

use crate::blockchain::Nonce;
use crate::crypto::AddressVersion;
use crate::error::{ChainError, Result};
use crate::events::{EventKind, LedgerEvent};
use crate::node::Node;
use crate::submission::SubmitOutcome;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSession {
    pub address: Option<String>,
    expires_at: Instant,
}

/// Tokens handed out by `/ws/start` and not yet redeemed.
#[derive(Debug)]
pub struct SessionTokens {
    pending: DashMap<String, PendingSession>,
    ttl: Duration,
}

impl SessionTokens {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn issue(&self, address: Option<String>) -> String {
        let token = Uuid::new_v4().to_string();
        self.pending.insert(
            token.clone(),
            PendingSession {
                address,
                expires_at: Instant::now() + self.ttl,
            },
        );
        token
    }

    /// Consume `token`. Expired tokens are removed and yield nothing.
    pub fn redeem(&self, token: &str) -> Option<PendingSession> {
        let (_, pending) = self.pending.remove(token)?;
        (pending.expires_at > Instant::now()).then_some(pending)
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.pending.len();
        let now = Instant::now();
        self.pending.retain(|_, p| p.expires_at > now);
        before.saturating_sub(self.pending.len())
    }
}

/// Turn the configured HTTP base URL into the gateway URL for `token`.
pub fn gateway_url(public_url: &str, token: &str) -> String {
    let base = public_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/ws/gateway/{}", base, token)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionLevel {
    Blocks,
    OwnBlocks,
    Transactions,
    OwnTransactions,
    Names,
    OwnNames,
}

impl SubscriptionLevel {
    pub const ALL: [SubscriptionLevel; 6] = [
        SubscriptionLevel::Blocks,
        SubscriptionLevel::OwnBlocks,
        SubscriptionLevel::Transactions,
        SubscriptionLevel::OwnTransactions,
        SubscriptionLevel::Names,
        SubscriptionLevel::OwnNames,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionLevel::Blocks => "blocks",
            SubscriptionLevel::OwnBlocks => "ownBlocks",
            SubscriptionLevel::Transactions => "transactions",
            SubscriptionLevel::OwnTransactions => "ownTransactions",
            SubscriptionLevel::Names => "names",
            SubscriptionLevel::OwnNames => "ownNames",
        }
    }

    fn split(self) -> (EventKind, bool) {
        match self {
            SubscriptionLevel::Blocks => (EventKind::Block, false),
            SubscriptionLevel::OwnBlocks => (EventKind::Block, true),
            SubscriptionLevel::Transactions => (EventKind::Transaction, false),
            SubscriptionLevel::OwnTransactions => (EventKind::Transaction, true),
            SubscriptionLevel::Names => (EventKind::Name, false),
            SubscriptionLevel::OwnNames => (EventKind::Name, true),
        }
    }
}

impl FromStr for SubscriptionLevel {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SubscriptionLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub address: Option<String>,
    pub levels: BTreeSet<SubscriptionLevel>,
}

impl Session {
    pub fn new(address: Option<String>) -> Self {
        Self {
            address,
            levels: [SubscriptionLevel::OwnTransactions, SubscriptionLevel::Blocks]
                .into_iter()
                .collect(),
        }
    }

    pub fn is_guest(&self) -> bool {
        self.address.is_none()
    }

    /// Whether `event` should be pushed to this session.
    pub fn wants(&self, event: &LedgerEvent) -> bool {
        let kind = event.kind();
        self.levels.iter().any(|level| match level.split() {
            (k, _) if k != kind => false,
            (_, false) => true,
            (_, true) => self.address.as_deref().is_some_and(|a| event.involves(a)),
        })
    }

    fn level_names(&self) -> Vec<&'static str> {
        self.levels.iter().map(|l| l.as_str()).collect()
    }
}

pub fn hello_message(node: &Node) -> Value {
    json!({
        "type": "hello",
        "ok": true,
        "motd": node.config.server.motd,
        "last_block": node.submitter.head(),
        "work": node.submitter.current_work(),
    })
}

/// Shape a submission result the way both HTTP and websocket report it.
pub fn submit_body(outcome: &SubmitOutcome) -> Value {
    match outcome {
        SubmitOutcome::Accepted(accepted) => json!({
            "ok": true,
            "success": true,
            "work": accepted.work,
            "address": accepted.address,
            "block": accepted.block,
        }),
        SubmitOutcome::NoMatch { .. } => json!({ "ok": true, "success": false }),
    }
}

fn str_field<'a>(msg: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    msg.get(key).and_then(Value::as_str)
}

/// Answer one client frame. The reply echoes the request `id` when present.
pub fn handle_message(node: &Node, session: &mut Session, text: &str) -> Value {
    let msg = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(msg)) => msg,
        _ => return ChainError::InvalidParameter("message").body(),
    };
    let kind = str_field(&msg, "type").unwrap_or_default().to_string();

    let mut reply = match dispatch(node, session, &kind, &msg) {
        Ok(body) => body,
        Err(e) => e.body(),
    };
    if let Value::Object(reply) = &mut reply {
        if let Some(id) = msg.get("id") {
            reply.insert("id".to_string(), id.clone());
        }
        if !kind.is_empty() {
            reply.insert("type".to_string(), json!("response"));
            reply.insert("responding_to".to_string(), json!(kind));
        }
    }
    reply
}

fn dispatch(node: &Node, session: &mut Session, kind: &str, msg: &Map<String, Value>) -> Result<Value> {
    match kind {
        "" => Err(ChainError::MissingParameter("type")),
        "submit_block" => {
            let address = match msg.get("address") {
                Some(Value::String(address)) => Some(address.as_str()),
                Some(Value::Null) | None => session.address.as_deref(),
                Some(_) => return Err(ChainError::InvalidParameter("address")),
            };
            let nonce = msg.get("nonce").map(Nonce::from_json).transpose()?;
            let outcome = node.submitter.submit(address, nonce)?;
            Ok(submit_body(&outcome))
        }
        "work" => Ok(json!({ "ok": true, "work": node.submitter.current_work() })),
        "address" => {
            let address = str_field(msg, "address").ok_or(ChainError::MissingParameter("address"))?;
            let record = node.ledger.get(address)?;
            Ok(json!({ "ok": true, "address": record }))
        }
        "login" => {
            let key = str_field(msg, "privatekey").ok_or(ChainError::MissingParameter("privatekey"))?;
            let address = node.auth.derive(key, AddressVersion::V2);
            let record = node.auth.verify_owner(&address, key)?;
            session.address = Some(address);
            Ok(json!({ "ok": true, "isGuest": false, "address": record }))
        }
        "logout" => {
            session.address = None;
            Ok(json!({ "ok": true, "isGuest": true }))
        }
        "me" => match &session.address {
            Some(address) => {
                let record = node.ledger.get_or_create(address)?;
                Ok(json!({ "ok": true, "isGuest": false, "address": record }))
            }
            None => Ok(json!({ "ok": true, "isGuest": true })),
        },
        "subscribe" | "unsubscribe" => {
            let level = str_field(msg, "event")
                .ok_or(ChainError::MissingParameter("event"))?
                .parse::<SubscriptionLevel>()
                .map_err(|_| ChainError::InvalidParameter("event"))?;
            if kind == "subscribe" {
                session.levels.insert(level);
            } else {
                session.levels.remove(&level);
            }
            Ok(json!({ "ok": true, "subscription_level": session.level_names() }))
        }
        "get_subscription_level" => Ok(json!({ "ok": true, "subscription_level": session.level_names() })),
        "get_valid_subscription_levels" => {
            let all: Vec<&str> = SubscriptionLevel::ALL.iter().map(|l| l.as_str()).collect();
            Ok(json!({ "ok": true, "valid_subscription_levels": all }))
        }
        _ => Err(ChainError::InvalidParameter("type")),
    }
}

/// Drive one upgraded connection until either side goes away.
pub async fn run_session(socket: WebSocket, node: Arc<Node>, mut session: Session) {
    let (mut sink, mut stream) = socket.split();
    let mut events = node.events.subscribe();
    tracing::debug!(address = ?session.address, "websocket.connected");

    if sink
        .send(Message::Text(hello_message(&node).to_string()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let reply = handle_message(&node, &mut session, &text);
                if sink.send(Message::Text(reply.to_string())).await.is_err() {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if session.wants(&event)
                            && sink.send(Message::Text(event.websocket_message().to_string())).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "websocket.lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    tracing::debug!(address = ?session.address, "websocket.disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Block, TransactionKind, TransactionRecord};
    use crate::config::Config;
    use crate::persistence::InMemoryPersistence;
    use chrono::Utc;

    fn node() -> Node {
        Node::with_persistence(Config::default(), Arc::new(InMemoryPersistence::new())).unwrap()
    }

    fn transfer(from: &str, to: &str) -> LedgerEvent {
        LedgerEvent::Transaction(TransactionRecord {
            id: 1,
            from: Some(from.to_string()),
            to: to.to_string(),
            value: 1,
            time: Utc::now(),
            metadata: None,
            kind: TransactionKind::Transfer,
        })
    }

    fn block(address: &str) -> LedgerEvent {
        LedgerEvent::Block {
            block: Block::new(2, address, "00".repeat(32), 25, 1, Utc::now()),
            new_work: 1,
        }
    }

    #[test]
    fn test_tokens_are_single_use() {
        let tokens = SessionTokens::new(Duration::from_secs(30));
        let token = tokens.issue(Some("kuf03bap3u".to_string()));
        let pending = tokens.redeem(&token).unwrap();
        assert_eq!(pending.address.as_deref(), Some("kuf03bap3u"));
        assert!(tokens.redeem(&token).is_none());
    }

    #[test]
    fn test_expired_tokens_are_refused() {
        let tokens = SessionTokens::new(Duration::ZERO);
        let token = tokens.issue(None);
        assert!(tokens.redeem(&token).is_none());
        tokens.issue(None);
        assert_eq!(tokens.purge_expired(), 1);
        assert!(tokens.is_empty());
    }

    #[test]
    fn test_gateway_url() {
        assert_eq!(
            gateway_url("http://localhost:8080/", "abc"),
            "ws://localhost:8080/ws/gateway/abc"
        );
        assert_eq!(
            gateway_url("https://ledger.example", "abc"),
            "wss://ledger.example/ws/gateway/abc"
        );
    }

    #[test]
    fn test_default_levels() {
        let guest = Session::new(None);
        assert!(guest.wants(&block("k74tq2hsh6")));
        assert!(!guest.wants(&transfer("kuf03bap3u", "k74tq2hsh6")));

        let owner = Session::new(Some("kuf03bap3u".to_string()));
        assert!(owner.wants(&transfer("kuf03bap3u", "k74tq2hsh6")));
        assert!(!owner.wants(&transfer("krqtnrp18z", "k74tq2hsh6")));
    }

    #[test]
    fn test_subscribe_round_trip() {
        let node = node();
        let mut session = Session::new(None);
        let reply = handle_message(&node, &mut session, r#"{"id":3,"type":"subscribe","event":"transactions"}"#);
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["id"], 3);
        assert!(session.wants(&transfer("kuf03bap3u", "k74tq2hsh6")));

        let reply = handle_message(&node, &mut session, r#"{"type":"unsubscribe","event":"blocks"}"#);
        assert_eq!(reply["subscription_level"], json!(["transactions", "ownTransactions"]));

        let reply = handle_message(&node, &mut session, r#"{"type":"subscribe","event":"everything"}"#);
        assert_eq!(reply["error"], "invalid_parameter");
        assert_eq!(reply["parameter"], "event");
    }

    #[test]
    fn test_login_binds_session() {
        let node = node();
        let mut session = Session::new(None);
        let reply = handle_message(&node, &mut session, r#"{"type":"login","privatekey":"hello"}"#);
        assert_eq!(reply["isGuest"], false);
        assert_eq!(reply["address"]["address"], "kuf03bap3u");
        assert_eq!(session.address.as_deref(), Some("kuf03bap3u"));

        let reply = handle_message(&node, &mut session, r#"{"type":"me"}"#);
        assert_eq!(reply["address"]["address"], "kuf03bap3u");

        handle_message(&node, &mut session, r#"{"type":"logout"}"#);
        assert!(session.is_guest());
    }

    #[test]
    fn test_submit_block_uses_session_address() {
        let mut config = Config::default();
        config.mining.initial_work = crate::work::MAX_DIGEST_VALUE;
        config.mining.max_work = crate::work::MAX_DIGEST_VALUE;
        let node = Node::with_persistence(config, Arc::new(InMemoryPersistence::new())).unwrap();

        let mut guest = Session::new(None);
        let reply = handle_message(&node, &mut guest, r#"{"id":1,"type":"submit_block","nonce":"1"}"#);
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "missing_parameter");
        assert_eq!(reply["parameter"], "address");

        let mut owner = Session::new(Some("kuf03bap3u".to_string()));
        let reply = handle_message(&node, &mut owner, r#"{"id":2,"type":"submit_block","nonce":[49]}"#);
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["success"], true);
        assert_eq!(reply["block"]["height"], 2);
        assert_eq!(reply["address"]["balance"], 25);

        let reply = handle_message(&node, &mut owner, r#"{"id":3,"type":"submit_block","address":123,"nonce":"1"}"#);
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "invalid_parameter");
        assert_eq!(reply["parameter"], "address");
        assert_eq!(reply["id"], 3);
        assert_eq!(node.submitter.head().height, 2);
    }

    #[test]
    fn test_bad_frames() {
        let node = node();
        let mut session = Session::new(None);
        let reply = handle_message(&node, &mut session, "not json");
        assert_eq!(reply["parameter"], "message");
        let reply = handle_message(&node, &mut session, r#"{"type":"fly"}"#);
        assert_eq!(reply["parameter"], "type");
        let reply = handle_message(&node, &mut session, r#"{"id":9}"#);
        assert_eq!(reply["error"], "missing_parameter");
        assert_eq!(reply["id"], 9);
    }
}
