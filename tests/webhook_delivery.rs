//! Webhook callbacks delivered to a throwaway receiver.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use kledger::blockchain::Nonce;
use kledger::config::Config;
use kledger::node::Node;
use kledger::persistence::InMemoryPersistence;
use kledger::webhooks::WebhookRequest;
use kledger::work::MAX_DIGEST_VALUE;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

async fn receiver() -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let app = Router::new()
        .route(
            "/post",
            post(|State(tx): State<mpsc::UnboundedSender<Value>>, Json(body): Json<Value>| async move {
                let _ = tx.send(body);
                "ok"
            }),
        )
        .route(
            "/get",
            get(
                |State(tx): State<mpsc::UnboundedSender<Value>>,
                 Query(query): Query<HashMap<String, String>>| async move {
                    let _ = tx.send(json!(query));
                    "ok"
                },
            ),
        )
        .route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "late"
            }),
        )
        .with_state(tx);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, rx)
}

fn node_with(timeout_secs: u64, max_in_flight: usize) -> Arc<Node> {
    let mut config = Config::default();
    config.mining.initial_work = MAX_DIGEST_VALUE;
    config.mining.max_work = MAX_DIGEST_VALUE;
    config.webhooks.timeout_secs = timeout_secs;
    config.webhooks.max_in_flight = max_in_flight;
    Arc::new(Node::with_persistence(config, Arc::new(InMemoryPersistence::new())).unwrap())
}

fn node() -> Arc<Node> {
    node_with(2, 64)
}

fn request(event: &str, url: String, method: Option<&str>, addresses: Option<Value>) -> WebhookRequest {
    WebhookRequest {
        event: Some(event.to_string()),
        url: Some(url),
        method: method.map(str::to_string),
        addresses,
    }
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a webhook")
        .expect("receiver closed")
}

#[tokio::test]
async fn test_block_webhook_posts_payload_with_token() {
    let (addr, mut rx) = receiver().await;
    let node = node();
    let _tasks = node.spawn_background().unwrap();

    let hook = node
        .webhooks
        .register("hello", "kuf03bap3u", request("block", format!("http://{}/post", addr), None, None))
        .unwrap();

    node.submitter
        .submit(Some("k74tq2hsh6"), Some(Nonce::from_text("1")))
        .unwrap();

    let body = recv(&mut rx).await;
    assert_eq!(body["event"], "block");
    assert_eq!(body["height"], 2);
    assert_eq!(body["address"], "k74tq2hsh6");
    assert_eq!(body["token"], hook.token);
    assert!(body["new_work"].is_number());
}

#[tokio::test]
async fn test_get_webhook_honours_address_filter() {
    let (addr, mut rx) = receiver().await;
    let node = node();
    let _tasks = node.spawn_background().unwrap();
    node.ledger.credit("kuf03bap3u", 10).unwrap();

    let hook = node
        .webhooks
        .register(
            "hello",
            "kuf03bap3u",
            request(
                "transaction",
                format!("http://{}/get", addr),
                Some("get"),
                Some(json!(["krqtnrp18z"])),
            ),
        )
        .unwrap();

    // Not involving the filtered address: no callback.
    node.transfer("hello", kledger::crypto::AddressVersion::V2, Some("k74tq2hsh6"), Some(1), None)
        .unwrap();
    // Involving it: one callback.
    node.transfer("hello", kledger::crypto::AddressVersion::V2, Some("krqtnrp18z"), Some(2), None)
        .unwrap();

    let query = recv(&mut rx).await;
    assert_eq!(query["event"], "transaction");
    assert_eq!(query["to"], "krqtnrp18z");
    assert_eq!(query["value"], "2");
    assert_eq!(query["token"], hook.token);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unreachable_receiver_does_not_affect_ledger() {
    let node = node();
    let _tasks = node.spawn_background().unwrap();
    node.webhooks
        .register(
            "hello",
            "kuf03bap3u",
            request("block", "http://127.0.0.1:9/unreachable".to_string(), None, None),
        )
        .unwrap();

    let outcome = node
        .submitter
        .submit(Some("kuf03bap3u"), Some(Nonce::from_text("1")))
        .unwrap();
    assert!(matches!(outcome, kledger::submission::SubmitOutcome::Accepted(_)));
    assert_eq!(node.ledger.get("kuf03bap3u").unwrap().balance, 25);
}

#[tokio::test]
async fn test_slow_receiver_times_out_and_frees_its_slot() {
    let (addr, mut rx) = receiver().await;
    // One delivery at a time: the fast hook has to wait for the slow one.
    let node = node_with(1, 1);
    let _tasks = node.spawn_background().unwrap();

    node.webhooks
        .register("hello", "kuf03bap3u", request("block", format!("http://{}/slow", addr), None, None))
        .unwrap();
    let fast = node
        .webhooks
        .register("hello", "kuf03bap3u", request("block", format!("http://{}/post", addr), None, None))
        .unwrap();

    node.submitter
        .submit(Some("kuf03bap3u"), Some(Nonce::from_text("1")))
        .unwrap();

    let body = recv(&mut rx).await;
    assert_eq!(body["token"], fast.token);
    assert_eq!(body["height"], 2);
}
