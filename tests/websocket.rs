//! Websocket sessions against a real listener.

use futures::{SinkExt, StreamExt};
use kledger::api::build_api_router;
use kledger::config::Config;
use kledger::node::Node;
use kledger::persistence::InMemoryPersistence;
use kledger::work::MAX_DIGEST_VALUE;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn serve() -> (SocketAddr, Arc<Node>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.mining.initial_work = MAX_DIGEST_VALUE;
    config.mining.max_work = MAX_DIGEST_VALUE;
    config.server.public_url = format!("http://{}", addr);
    config.server.motd = "testing".to_string();
    let node = Arc::new(Node::with_persistence(config, Arc::new(InMemoryPersistence::new())).unwrap());

    let app = build_api_router(node.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, node)
}

async fn start_session(addr: SocketAddr, body: Value) -> String {
    let json: Value = reqwest::Client::new()
        .post(format!("http://{}/ws/start", addr))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["ok"], true);
    json["url"].as_str().unwrap().to_string()
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(client: &mut Client, value: Value) {
    client.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_hello_then_submit_then_block_event() {
    let (addr, _node) = serve().await;
    let url = start_session(addr, json!({})).await;
    let (mut client, _) = connect_async(url).await.unwrap();

    let hello = next_json(&mut client).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["motd"], "testing");
    assert_eq!(hello["last_block"]["height"], 1);

    send(
        &mut client,
        json!({ "id": 7, "type": "submit_block", "address": "kuf03bap3u", "nonce": "1" }),
    )
    .await;
    let reply = next_json(&mut client).await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["success"], true);
    assert_eq!(reply["block"]["height"], 2);

    // Guests get blocks by default, but not other people's transactions.
    let event = next_json(&mut client).await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "block");
    assert_eq!(event["block"]["height"], 2);

    send(&mut client, json!({ "id": 8, "type": "work" })).await;
    let reply = next_json(&mut client).await;
    assert_eq!(reply["id"], 8);
    assert!(reply["work"].is_number());
}

#[tokio::test]
async fn test_bound_session_sees_own_transactions() {
    let (addr, node) = serve().await;
    node.ledger.credit("kuf03bap3u", 50).unwrap();

    let url = start_session(addr, json!({ "privatekey": "test" })).await;
    let (mut recipient, _) = connect_async(url).await.unwrap();
    next_json(&mut recipient).await;

    send(&mut recipient, json!({ "id": 1, "type": "me" })).await;
    let me = next_json(&mut recipient).await;
    assert_eq!(me["isGuest"], false);
    assert_eq!(me["address"]["address"], "k74tq2hsh6");

    let response = reqwest::Client::new()
        .post(format!("http://{}/transactions", addr))
        .json(&json!({ "privatekey": "hello", "to": "k74tq2hsh6", "amount": 5 }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let event = next_json(&mut recipient).await;
    assert_eq!(event["event"], "transaction");
    assert_eq!(event["transaction"]["to"], "k74tq2hsh6");
    assert_eq!(event["transaction"]["value"], 5);
}

#[tokio::test]
async fn test_token_is_single_use() {
    let (addr, _node) = serve().await;
    let url = start_session(addr, json!({})).await;
    let (client, _) = connect_async(url.clone()).await.unwrap();
    drop(client);
    assert!(connect_async(url).await.is_err());
}

#[tokio::test]
async fn test_empty_key_starts_guest_session() {
    let (addr, node) = serve().await;
    let response = reqwest::Client::new()
        .post(format!("http://{}/ws/start", addr))
        .json(&json!({ "privatekey": "" }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert_eq!(node.sessions.len(), 1);
}
