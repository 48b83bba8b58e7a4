//! HTTP API for kledger
//!
//! JSON endpoints for mining, authentication, webhooks, transfers and
//! lookups, the legacy plaintext query interface on `/`, and the websocket
//! handshake. Every error leaves as `{ok:false, error, parameter?}`.

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, Request, State},
    http::{self, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::blockchain::Nonce;
use crate::crypto::AddressVersion;
use crate::error::{ChainError, ErrorKind};
use crate::node::Node;
use crate::submission::SubmitOutcome;
use crate::webhooks::WebhookRequest;
use crate::websocket::{gateway_url, run_session, submit_body, Session};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError(pub ChainError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::MissingParameter | ErrorKind::InvalidParameter => StatusCode::BAD_REQUEST,
            ErrorKind::AuthFailed => StatusCode::UNAUTHORIZED,
            ErrorKind::AddressNotFound | ErrorKind::BlockNotFound | ErrorKind::WebhookNotFound => {
                StatusCode::NOT_FOUND
            }
            ErrorKind::InsufficientFunds => StatusCode::FORBIDDEN,
            ErrorKind::MiningDisabled => StatusCode::LOCKED,
            ErrorKind::Storage | ErrorKind::Config => {
                tracing::error!(error = %self.0, "api.server_error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(self.0.body())).into_response()
    }
}

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError(err)
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct SubmitRequest {
    address: Option<String>,
    nonce: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct KeyRequest {
    privatekey: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OwnerRequest {
    privatekey: Option<String>,
    owner: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RegisterWebhookRequest {
    privatekey: Option<String>,
    owner: Option<String>,
    event: Option<String>,
    url: Option<String>,
    method: Option<String>,
    addresses: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TransferRequest {
    privatekey: Option<String>,
    to: Option<String>,
    amount: Option<Value>,
    metadata: Option<String>,
}

fn body_or_default<T: Default>(body: Option<Json<T>>) -> T {
    body.map(|Json(b)| b).unwrap_or_default()
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ChainError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ChainError::MissingParameter(name))
}

fn version_param(query: &HashMap<String, String>) -> Result<AddressVersion, ChainError> {
    AddressVersion::from_query(query.get("v").map(String::as_str))
        .ok_or(ChainError::InvalidParameter("v"))
}

// ============================================================================
// Middleware
// ============================================================================

/// Request logging middleware. Logs method, path, status and duration.
async fn logging_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        path = %path,
        status = %response.status().as_u16(),
        duration_ms = %start.elapsed().as_millis(),
        "api.request"
    );

    response
}

// ============================================================================
// API Server
// ============================================================================

/// Build the API router with all endpoints (also used by tests).
pub fn build_api_router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods(vec![
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(vec![http::header::CONTENT_TYPE])
        .allow_credentials(true);

    Router::new()
        // Legacy plaintext interface
        .route("/", get(legacy_query))
        // Mining
        .route("/submit", post(submit_block))
        .route("/work", get(get_work))
        .route("/work/day", get(get_work_day))
        // Identity
        .route("/login", post(login))
        .route("/v2/:key", get(derive_v2))
        // Webhooks
        .route("/webhooks", post(register_webhook))
        .route("/webhooks/:key", post(list_webhooks).delete(delete_webhook))
        .route("/webhooks/:key/delete", post(delete_webhook))
        .route("/address/:owner/webhooks", post(list_webhooks))
        // Ledger
        .route("/transactions", post(make_transaction))
        .route("/addresses/:address", get(get_address))
        .route("/blocks/last", get(get_last_block))
        .route("/blocks/:height", get(get_block))
        .route("/motd", get(get_motd))
        // Websocket
        .route("/ws/start", post(start_websocket))
        .route("/ws/gateway/:token", get(websocket_gateway))
        .layer(middleware::from_fn(logging_middleware))
        .with_state(node)
        .layer(cors)
}

/// Bind the configured address and serve until the listener fails.
pub async fn run_api_server(node: Arc<Node>) -> crate::error::Result<()> {
    let addr = format!("{}:{}", node.config.server.host, node.config.server.port);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    tracing::info!(addr = %addr, "api.listening");

    let app = build_api_router(node);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Route Handlers
// ============================================================================

/// `/?submitblock&address=&nonce=`, `/?getwork`, `/?v2=<key>`.
async fn legacy_query(
    State(node): State<Arc<Node>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if query.contains_key("submitblock") {
        let nonce = query.get("nonce").map(|n| Nonce::from_text(n));
        let text = match node
            .submitter
            .submit(query.get("address").map(String::as_str), nonce)
        {
            Ok(SubmitOutcome::Accepted(_)) => "Block solved".to_string(),
            Ok(SubmitOutcome::NoMatch { attempt }) => attempt,
            Err(ChainError::MissingParameter("address")) | Err(ChainError::InvalidParameter("address")) => {
                "Invalid address".to_string()
            }
            Err(ChainError::MissingParameter("nonce")) | Err(ChainError::InvalidParameter("nonce")) => {
                "Nonce is too large".to_string()
            }
            Err(e) => {
                tracing::warn!(error = %e, "api.legacy_submit_rejected");
                "Solution rejected".to_string()
            }
        };
        return text.into_response();
    }
    if query.contains_key("getwork") {
        return node.submitter.current_work().to_string().into_response();
    }
    if let Some(key) = query.get("v2") {
        let address = node.auth.derive(key, AddressVersion::V2);
        return Json(json!({ "ok": true, "address": address })).into_response();
    }
    get_motd(State(node)).await.into_response()
}

async fn submit_block(State(node): State<Arc<Node>>, body: Option<Json<SubmitRequest>>) -> ApiResult {
    let body = body_or_default(body);
    let nonce = body.nonce.as_ref().map(Nonce::from_json).transpose()?;
    let outcome = node.submitter.submit(body.address.as_deref(), nonce)?;
    Ok(Json(submit_body(&outcome)))
}

async fn get_work(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({ "ok": true, "work": node.submitter.current_work() }))
}

async fn get_work_day(State(node): State<Arc<Node>>) -> Json<Value> {
    let work = node.work.work_over_time(chrono::Utc::now());
    Json(json!({ "ok": true, "work": work }))
}

async fn login(
    State(node): State<Arc<Node>>,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<KeyRequest>>,
) -> ApiResult {
    let body = body_or_default(body);
    let key = required(body.privatekey, "privatekey")?;
    let version = version_param(&query)?;
    let result = node.auth.login(&key, version);
    let mut response = json!({ "ok": true, "authed": result.authed });
    if let Some(address) = result.address {
        response["address"] = json!(address);
    }
    Ok(Json(response))
}

async fn derive_v2(State(node): State<Arc<Node>>, Path(key): Path<String>) -> Json<Value> {
    let address = node.auth.derive(&key, AddressVersion::V2);
    Json(json!({ "ok": true, "address": address }))
}

async fn register_webhook(
    State(node): State<Arc<Node>>,
    body: Option<Json<RegisterWebhookRequest>>,
) -> ApiResult {
    let body = body_or_default(body);
    let key = required(body.privatekey, "privatekey")?;
    let owner = required(body.owner, "owner")?;
    let webhook = node.webhooks.register(
        &key,
        &owner,
        WebhookRequest {
            event: body.event,
            url: body.url,
            method: body.method,
            addresses: body.addresses,
        },
    )?;
    Ok(Json(json!({ "ok": true, "webhook": webhook })))
}

async fn list_webhooks(
    State(node): State<Arc<Node>>,
    Path(owner): Path<String>,
    body: Option<Json<KeyRequest>>,
) -> ApiResult {
    let key = required(body_or_default(body).privatekey, "privatekey")?;
    let webhooks = node.webhooks.list_by_owner(&key, &owner)?;
    Ok(Json(json!({ "ok": true, "count": webhooks.len(), "webhooks": webhooks })))
}

async fn delete_webhook(
    State(node): State<Arc<Node>>,
    Path(id): Path<String>,
    body: Option<Json<OwnerRequest>>,
) -> ApiResult {
    let id = id.parse::<u64>().map_err(|_| ChainError::InvalidParameter("id"))?;
    let body = body_or_default(body);
    let key = required(body.privatekey, "privatekey")?;
    let owner = required(body.owner, "owner")?;
    node.webhooks.delete(&key, &owner, id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn make_transaction(
    State(node): State<Arc<Node>>,
    Query(query): Query<HashMap<String, String>>,
    body: Option<Json<TransferRequest>>,
) -> ApiResult {
    let body = body_or_default(body);
    let key = required(body.privatekey, "privatekey")?;
    let version = version_param(&query)?;
    let amount = body
        .amount
        .map(|a| a.as_u64().ok_or(ChainError::InvalidParameter("amount")))
        .transpose()?;
    let transaction = node.transfer(&key, version, body.to.as_deref(), amount, body.metadata)?;
    Ok(Json(json!({ "ok": true, "transaction": transaction })))
}

async fn get_address(State(node): State<Arc<Node>>, Path(address): Path<String>) -> ApiResult {
    let record = node.ledger.get(&address)?;
    Ok(Json(json!({ "ok": true, "address": record })))
}

async fn get_last_block(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({ "ok": true, "block": node.submitter.head() }))
}

async fn get_block(State(node): State<Arc<Node>>, Path(height): Path<String>) -> ApiResult {
    let height = height
        .parse::<u64>()
        .map_err(|_| ChainError::InvalidParameter("height"))?;
    let block = node.submitter.block(height)?;
    Ok(Json(json!({ "ok": true, "block": block })))
}

async fn get_motd(State(node): State<Arc<Node>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "motd": node.config.server.motd,
        "mining_enabled": node.submitter.rules().enabled,
        "work": node.submitter.current_work(),
        "last_block": node.submitter.head(),
    }))
}

async fn start_websocket(State(node): State<Arc<Node>>, body: Option<Json<KeyRequest>>) -> ApiResult {
    let address = match body_or_default(body).privatekey.filter(|k| !k.is_empty()) {
        Some(key) => {
            let address = node.auth.derive(&key, AddressVersion::V2);
            node.auth.verify_owner(&address, &key)?;
            Some(address)
        }
        None => None,
    };
    let token = node.sessions.issue(address);
    Ok(Json(json!({
        "ok": true,
        "url": gateway_url(&node.config.server.public_url, &token),
        "expires": node.sessions.ttl().as_secs(),
    })))
}

async fn websocket_gateway(
    State(node): State<Arc<Node>>,
    Path(token): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let pending = node
        .sessions
        .redeem(&token)
        .ok_or(ChainError::InvalidParameter("token"))?;
    let session = Session::new(pending.address);
    Ok(ws.on_upgrade(move |socket| run_session(socket, node, session)))
}
