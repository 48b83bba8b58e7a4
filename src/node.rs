//! Node orchestration: wires storage, ledger, work, submission and event
//! fanout together and owns the background tasks.

use crate::auth::AuthService;
use crate::blockchain::{validate_address, Block, Chain, Ledger, TransactionRecord};
use crate::config::Config;
use crate::crypto::{AddressScheme, AddressVersion};
use crate::error::{ChainError, Result};
use crate::events::{EventBus, LedgerEvent};
use crate::persistence::{Database, Persistence};
use crate::submission::{BlockSubmitter, MiningRules};
use crate::webhooks::{WebhookDispatcher, WebhookRegistry};
use crate::websocket::SessionTokens;
use crate::work::{ProportionalRetarget, WorkTracker, WORK_HISTORY_MINUTES};
use chrono::Utc;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Node {
    pub config: Config,
    pub persistence: Arc<dyn Persistence>,
    pub ledger: Arc<Ledger>,
    pub auth: Arc<AuthService>,
    pub work: Arc<WorkTracker>,
    pub submitter: Arc<BlockSubmitter>,
    pub events: EventBus,
    pub webhooks: Arc<WebhookRegistry>,
    pub sessions: SessionTokens,
}

impl Node {
    /// Open the SQLite database named in `config`, creating its directory.
    pub fn open(config: Config) -> Result<Self> {
        let db_path = std::path::Path::new(&config.database.path);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ChainError::IoError(format!("Failed to create data dir {:?}: {}", parent, e))
                })?;
            }
        }
        let database = Database::open(&config.database.path)?;
        Self::with_persistence(config, Arc::new(database))
    }

    /// Restore state from `persistence`, seeding the genesis block when the
    /// store is empty.
    pub fn with_persistence(config: Config, persistence: Arc<dyn Persistence>) -> Result<Self> {
        config.validate()?;
        let mining = &config.mining;

        let ledger = Arc::new(Ledger::load(persistence.clone())?);

        let blocks = persistence.load_blocks()?;
        let chain = if blocks.is_empty() {
            let genesis = Block::genesis(&mining.genesis_hash, mining.initial_work);
            persistence.save_block(&genesis)?;
            info!(hash = %genesis.short_hash, "node.genesis_created");
            Chain::new(genesis)
        } else {
            Chain::from_blocks(blocks)?
        };

        let current = persistence.load_work()?.unwrap_or(mining.initial_work);
        let since = Utc::now() - chrono::Duration::minutes(WORK_HISTORY_MINUTES as i64);
        let samples = persistence.load_work_samples(since)?;
        let policy = ProportionalRetarget {
            seconds_per_block: mining.seconds_per_block,
            work_factor: mining.work_factor,
            min_work: mining.min_work,
            max_work: mining.max_work,
        };
        let work = Arc::new(WorkTracker::with_samples(current, samples, Box::new(policy)));

        let scheme = AddressScheme::new(mining.address_prefix);
        let auth = Arc::new(AuthService::new(ledger.clone(), scheme));
        let webhooks = Arc::new(WebhookRegistry::load(persistence.clone(), auth.clone())?);
        let events = EventBus::new(config.websocket.event_buffer);
        let submitter = Arc::new(BlockSubmitter::new(
            chain,
            ledger.clone(),
            work.clone(),
            persistence.clone(),
            events.clone(),
            MiningRules::from_config(mining),
        ));
        let sessions = SessionTokens::new(Duration::from_secs(config.websocket.token_ttl_secs));

        info!(
            height = submitter.head().height,
            addresses = ledger.len(),
            webhooks = webhooks.len(),
            work = current,
            "node.loaded"
        );

        Ok(Self {
            config,
            persistence,
            ledger,
            auth,
            work,
            submitter,
            events,
            webhooks,
            sessions,
        })
    }

    /// Move value from the key's address to `to` and announce it.
    pub fn transfer(
        &self,
        private_key: &str,
        version: AddressVersion,
        to: Option<&str>,
        amount: Option<u64>,
        metadata: Option<String>,
    ) -> Result<TransactionRecord> {
        let to = validate_address(self.auth.scheme(), to).map_err(|e| match e {
            ChainError::MissingParameter(_) => ChainError::MissingParameter("to"),
            _ => ChainError::InvalidParameter("to"),
        })?;
        let amount = amount.ok_or(ChainError::MissingParameter("amount"))?;
        // The sender is derived from the key, so the key owns it by construction.
        let from = self.auth.derive(private_key, version);

        let record = self.ledger.transfer(&from, &to, amount, metadata)?;
        info!(id = record.id, from = %from, to = %to, amount, "transaction.transfer");
        self.events.publish(LedgerEvent::Transaction(record.clone()));
        Ok(record)
    }

    /// Start webhook delivery and the once-a-minute work sampler.
    pub fn spawn_background(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        let dispatcher = WebhookDispatcher::new(self.webhooks.clone(), &self.config.webhooks)?;
        let dispatch_task = dispatcher.spawn(&self.events);

        let node = self.clone();
        let ticker_task = tokio::spawn(async move {
            let mut ticker = time::interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = node.submitter.sample_work(Utc::now()) {
                    warn!(error = %e, "work.sample_failed");
                }
                let purged = node.sessions.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "websocket.tokens_expired");
                }
            }
        });

        Ok(vec![dispatch_task, ticker_task])
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        let _tasks = self.spawn_background()?;
        Node::start_api(self).await
    }

    #[cfg(feature = "api")]
    async fn start_api(node: Arc<Self>) -> Result<()> {
        crate::api::run_api_server(node).await
    }

    #[cfg(not(feature = "api"))]
    async fn start_api(_node: Arc<Self>) -> Result<()> {
        Err(ChainError::ConfigError("API feature not enabled in this build".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::TransactionKind;
    use crate::persistence::InMemoryPersistence;

    fn node() -> Node {
        Node::with_persistence(Config::default(), Arc::new(InMemoryPersistence::new())).unwrap()
    }

    #[test]
    fn test_empty_store_gets_genesis() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let node = Node::with_persistence(Config::default(), persistence.clone()).unwrap();
        let head = node.submitter.head();
        assert_eq!(head.height, 1);
        assert_eq!(head.address, "0000000000");
        assert_eq!(head.value, 0);
        assert_eq!(persistence.load_blocks().unwrap().len(), 1);
        assert_eq!(node.work.current_work(), 100_000);

        // Reopening does not seed twice.
        let again = Node::with_persistence(Config::default(), persistence.clone()).unwrap();
        assert_eq!(again.submitter.head(), head);
        assert_eq!(persistence.load_blocks().unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_restores_work_and_balances() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.database.path = dir.path().join("nested/ledger.db").to_string_lossy().into_owned();
        {
            let node = Node::open(config.clone()).unwrap();
            node.ledger.credit("kuf03bap3u", 40).unwrap();
            node.persistence.save_work(4242).unwrap();
        }
        let node = Node::open(config).unwrap();
        assert_eq!(node.ledger.get("kuf03bap3u").unwrap().balance, 40);
        assert_eq!(node.work.current_work(), 4242);
    }

    #[tokio::test]
    async fn test_transfer_emits_event() {
        let node = node();
        node.ledger.credit("kuf03bap3u", 30).unwrap();
        let mut rx = node.events.subscribe();

        let tx = node
            .transfer("hello", AddressVersion::V2, Some("k74tq2hsh6"), Some(12), None)
            .unwrap();
        assert_eq!(tx.kind, TransactionKind::Transfer);
        assert_eq!(node.ledger.get("kuf03bap3u").unwrap().balance, 18);
        match rx.recv().await.unwrap() {
            LedgerEvent::Transaction(event) => assert_eq!(event, tx),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transfer_validation() {
        let node = node();
        assert!(matches!(
            node.transfer("hello", AddressVersion::V2, None, Some(1), None),
            Err(ChainError::MissingParameter("to"))
        ));
        assert!(matches!(
            node.transfer("hello", AddressVersion::V2, Some("bogus"), Some(1), None),
            Err(ChainError::InvalidParameter("to"))
        ));
        assert!(matches!(
            node.transfer("hello", AddressVersion::V2, Some("k74tq2hsh6"), None, None),
            Err(ChainError::MissingParameter("amount"))
        ));
        assert!(matches!(
            node.transfer("hello", AddressVersion::V2, Some("k74tq2hsh6"), Some(1), None),
            Err(ChainError::InsufficientFunds(_))
        ));
        assert!(node.ledger.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.mining.nonce_max_size = 0;
        assert!(Node::with_persistence(config, Arc::new(InMemoryPersistence::new())).is_err());
    }
}
