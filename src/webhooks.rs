//! Owner-registered outbound callbacks for ledger events
//!
//! Registration, listing and deletion are gated on proof of ownership. The
//! dispatcher listens on the event bus and fires each matching webhook in its
//! own task, with a request timeout and a cap on deliveries in flight. A slow
//! receiver never holds up the ledger; it can only delay other deliveries
//! until its request times out.

use crate::auth::AuthService;
use crate::config::WebhookConfig;
use crate::crypto::AddressScheme;
use crate::error::{ChainError, Result};
use crate::events::{EventBus, EventKind, LedgerEvent};
use crate::persistence::Persistence;
use parking_lot::RwLock;
use rand::RngCore;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookMethod {
    Get,
    #[default]
    Post,
}

impl WebhookMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookMethod::Get => "get",
            WebhookMethod::Post => "post",
        }
    }
}

impl FromStr for WebhookMethod {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Ok(WebhookMethod::Get),
            "post" => Ok(WebhookMethod::Post),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: u64,
    pub event: EventKind,
    pub url: String,
    pub owner: String,
    pub token: String,
    pub addresses: Option<Vec<String>>,
    pub method: WebhookMethod,
}

impl Webhook {
    pub fn matches(&self, event: &LedgerEvent) -> bool {
        if self.event != event.kind() {
            return false;
        }
        match &self.addresses {
            Some(filter) if self.event.supports_address_filter() => {
                filter.iter().any(|a| event.involves(a))
            }
            _ => true,
        }
    }
}

/// A validated webhook waiting for its store-assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWebhook {
    pub event: EventKind,
    pub url: String,
    pub owner: String,
    pub token: String,
    pub addresses: Option<Vec<String>>,
    pub method: WebhookMethod,
}

impl NewWebhook {
    pub fn with_id(self, id: u64) -> Webhook {
        Webhook {
            id,
            event: self.event,
            url: self.url,
            owner: self.owner,
            token: self.token,
            addresses: self.addresses,
            method: self.method,
        }
    }
}

/// Raw registration fields as they arrive from a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookRequest {
    pub event: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub addresses: Option<Value>,
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Accepts `["a", "b"]` or `"a,b"`.
pub fn parse_address_list(scheme: &AddressScheme, value: &Value) -> Result<Vec<String>> {
    let raw: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or(ChainError::InvalidParameter("addresses")))
            .collect::<Result<_>>()?,
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Null => Vec::new(),
        _ => return Err(ChainError::InvalidParameter("addresses")),
    };
    if raw.iter().any(|a| !scheme.is_valid(a)) {
        return Err(ChainError::InvalidParameter("addresses"));
    }
    Ok(raw)
}

fn validate_url(url: Option<&str>) -> Result<String> {
    let url = url
        .filter(|u| !u.is_empty())
        .ok_or(ChainError::MissingParameter("url"))?;
    let parsed = Url::parse(url).map_err(|_| ChainError::InvalidParameter("url"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ChainError::InvalidParameter("url"));
    }
    Ok(url.to_string())
}

pub struct WebhookRegistry {
    hooks: RwLock<BTreeMap<u64, Webhook>>,
    persistence: Arc<dyn Persistence>,
    auth: Arc<AuthService>,
}

impl WebhookRegistry {
    pub fn load(persistence: Arc<dyn Persistence>, auth: Arc<AuthService>) -> Result<Self> {
        let hooks = persistence
            .load_webhooks()?
            .into_iter()
            .map(|h| (h.id, h))
            .collect();
        Ok(Self {
            hooks: RwLock::new(hooks),
            persistence,
            auth,
        })
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    pub fn register(&self, private_key: &str, owner: &str, request: WebhookRequest) -> Result<Webhook> {
        self.auth.verify_owner(owner, private_key)?;

        let event = request
            .event
            .as_deref()
            .filter(|e| !e.is_empty())
            .ok_or(ChainError::MissingParameter("event"))?
            .parse::<EventKind>()
            .map_err(|_| ChainError::InvalidParameter("event"))?;
        let url = validate_url(request.url.as_deref())?;
        let method = match request.method.as_deref() {
            None | Some("") => WebhookMethod::default(),
            Some(m) => m
                .parse::<WebhookMethod>()
                .map_err(|_| ChainError::InvalidParameter("method"))?,
        };
        let addresses = match (&request.addresses, event.supports_address_filter()) {
            (Some(value), true) => {
                let list = parse_address_list(self.auth.scheme(), value)?;
                (!list.is_empty()).then_some(list)
            }
            _ => None,
        };

        let webhook = self.persistence.insert_webhook(&NewWebhook {
            event,
            url,
            owner: owner.to_string(),
            token: generate_token(),
            addresses,
            method,
        })?;
        tracing::info!(id = webhook.id, owner = %owner, event = %event, "webhook.registered");
        self.hooks.write().insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    pub fn list_by_owner(&self, private_key: &str, owner: &str) -> Result<Vec<Webhook>> {
        self.auth.verify_owner(owner, private_key)?;
        Ok(self
            .hooks
            .read()
            .values()
            .filter(|h| h.owner == owner)
            .cloned()
            .collect())
    }

    pub fn delete(&self, private_key: &str, owner: &str, id: u64) -> Result<()> {
        self.auth.verify_owner(owner, private_key)?;
        let mut hooks = self.hooks.write();
        match hooks.get(&id) {
            Some(hook) if hook.owner == owner => {}
            _ => return Err(ChainError::WebhookNotFound(id)),
        }
        self.persistence.delete_webhook(id)?;
        hooks.remove(&id);
        tracing::info!(id, owner = %owner, "webhook.deleted");
        Ok(())
    }

    pub fn matching(&self, event: &LedgerEvent) -> Vec<Webhook> {
        self.hooks
            .read()
            .values()
            .filter(|h| h.matches(event))
            .cloned()
            .collect()
    }
}

/// Flatten a payload into query pairs for GET deliveries.
fn query_pairs(payload: &Map<String, Value>) -> Vec<(String, String)> {
    payload
        .iter()
        .filter_map(|(k, v)| match v {
            Value::Null => None,
            Value::String(s) => Some((k.clone(), s.clone())),
            other => Some((k.clone(), other.to_string())),
        })
        .collect()
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    registry: Arc<WebhookRegistry>,
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
}

impl WebhookDispatcher {
    pub fn new(registry: Arc<WebhookRegistry>, config: &WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ChainError::ConfigError(format!("Failed to build webhook client: {}", e)))?;
        Ok(Self {
            registry,
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        })
    }

    /// Listen on `bus` until it closes.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        self.dispatch(&event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "webhook.dispatcher_lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Fire every webhook matching `event`; returns how many were scheduled.
    /// Each delivery holds an in-flight permit from before it is spawned, so
    /// when every permit is taken this waits and later events queue in the
    /// bounded bus instead of as tasks.
    pub async fn dispatch(&self, event: &LedgerEvent) -> usize {
        let hooks = self.registry.matching(event);
        let payload = event.webhook_payload();
        let mut scheduled = 0;
        for hook in hooks {
            let Ok(permit) = self.in_flight.clone().acquire_owned().await else {
                break;
            };
            let this = self.clone();
            let mut body = payload.clone();
            body.insert("token".to_string(), Value::String(hook.token.clone()));
            tokio::spawn(async move {
                let _permit = permit;
                match this.deliver(&hook, &body).await {
                    Ok(status) if status.is_success() => {
                        tracing::debug!(id = hook.id, status = status.as_u16(), "webhook.delivered");
                    }
                    Ok(status) => {
                        tracing::warn!(id = hook.id, url = %hook.url, status = status.as_u16(), "webhook.rejected");
                    }
                    Err(e) => {
                        tracing::warn!(id = hook.id, url = %hook.url, error = %e, "webhook.delivery_failed");
                    }
                }
            });
            scheduled += 1;
        }
        scheduled
    }

    async fn deliver(
        &self,
        hook: &Webhook,
        body: &Map<String, Value>,
    ) -> std::result::Result<reqwest::StatusCode, reqwest::Error> {
        let request = match hook.method {
            WebhookMethod::Get => self.client.get(&hook.url).query(&query_pairs(body)),
            WebhookMethod::Post => self.client.post(&hook.url).json(body),
        };
        Ok(request.send().await?.status())
    }
}
