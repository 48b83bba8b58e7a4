//! Database persistence layer for kledger
//!
//! Every state change that spans more than one row (an accepted block, a
//! transfer) goes through a single method so the backend can apply it in one
//! transaction. Times are stored as Unix milliseconds.

use crate::blockchain::{AddressRecord, Block, NewTransaction, TransactionKind, TransactionRecord};
use crate::error::{ChainError, Result};
use crate::events::EventKind;
use crate::webhooks::{NewWebhook, Webhook, WebhookMethod};
use crate::work::WorkSample;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Everything an accepted block changes, written together or not at all.
#[derive(Debug, Clone, Copy)]
pub struct BlockCommit<'a> {
    pub block: &'a Block,
    pub address: &'a AddressRecord,
    pub reward: &'a NewTransaction,
    pub work: u64,
    pub sample: Option<&'a WorkSample>,
}

/// Abstraction for persistence backends.
pub trait Persistence: Send + Sync {
    fn load_addresses(&self) -> Result<Vec<AddressRecord>>;
    fn save_address(&self, record: &AddressRecord) -> Result<()>;

    fn load_blocks(&self) -> Result<Vec<Block>>;
    fn save_block(&self, block: &Block) -> Result<()>;

    fn load_work(&self) -> Result<Option<u64>>;
    fn save_work(&self, work: u64) -> Result<()>;
    fn load_work_samples(&self, since: DateTime<Utc>) -> Result<Vec<WorkSample>>;
    /// Keeps the first sample stored for a minute.
    fn save_work_sample(&self, sample: &WorkSample) -> Result<()>;

    fn commit_block(&self, commit: &BlockCommit<'_>) -> Result<TransactionRecord>;
    fn commit_transfer(
        &self,
        from: &AddressRecord,
        to: &AddressRecord,
        tx: &NewTransaction,
    ) -> Result<TransactionRecord>;

    fn insert_webhook(&self, webhook: &NewWebhook) -> Result<Webhook>;
    fn load_webhooks(&self) -> Result<Vec<Webhook>>;
    /// Returns whether a row was removed.
    fn delete_webhook(&self, id: u64) -> Result<bool>;
}

fn from_millis(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}

fn invalid_column(column: usize, kind: Type, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, kind, format!("unexpected value {:?}", value).into())
}

/// Amounts, heights and ids are stored as signed integers but never negative.
fn unsigned(row: &Row<'_>, column: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(column)?;
    u64::try_from(value).map_err(|_| invalid_column(column, Type::Integer, value.to_string()))
}

fn row_id(id: i64) -> Result<u64> {
    u64::try_from(id).map_err(|_| ChainError::DatabaseError(format!("Unexpected row id {}", id)))
}

fn address_from_row(row: &Row<'_>) -> rusqlite::Result<AddressRecord> {
    Ok(AddressRecord {
        address: row.get(0)?,
        balance: unsigned(row, 1)?,
        totalin: unsigned(row, 2)?,
        totalout: unsigned(row, 3)?,
        firstseen: from_millis(4, row.get(4)?)?,
    })
}

fn block_from_row(row: &Row<'_>) -> rusqlite::Result<Block> {
    let height = unsigned(row, 0)?;
    let address: String = row.get(1)?;
    let hash: String = row.get(2)?;
    let value = unsigned(row, 3)?;
    let time = from_millis(4, row.get(4)?)?;
    let difficulty = unsigned(row, 5)?;
    Ok(Block::new(height, address, hash, value, difficulty, time))
}

fn webhook_from_row(row: &Row<'_>) -> rusqlite::Result<Webhook> {
    let event: String = row.get(1)?;
    let event = event.parse::<EventKind>().map_err(|_| invalid_column(1, Type::Text, event))?;
    let addresses: Option<String> = row.get(5)?;
    let addresses = match addresses {
        Some(json) => Some(serde_json::from_str::<Vec<String>>(&json).map_err(|_| invalid_column(5, Type::Text, json))?),
        None => None,
    };
    let method: String = row.get(6)?;
    let method = method.parse::<WebhookMethod>().map_err(|_| invalid_column(6, Type::Text, method))?;
    Ok(Webhook {
        id: unsigned(row, 0)?,
        event,
        url: row.get(2)?,
        owner: row.get(3)?,
        token: row.get(4)?,
        addresses,
        method,
    })
}

fn upsert_address(tx: &Transaction<'_>, record: &AddressRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO addresses (address, balance, totalin, totalout, firstseen)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(address) DO UPDATE SET
            balance = excluded.balance,
            totalin = excluded.totalin,
            totalout = excluded.totalout",
        params![
            record.address,
            record.balance as i64,
            record.totalin as i64,
            record.totalout as i64,
            record.firstseen.timestamp_millis(),
        ],
    )
    .map_err(|e| ChainError::DatabaseError(format!("Failed to save address: {}", e)))?;
    Ok(())
}

fn insert_transaction(tx: &Transaction<'_>, record: &NewTransaction) -> Result<TransactionRecord> {
    tx.execute(
        "INSERT INTO transactions (from_address, to_address, value, time, metadata, kind)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.from,
            record.to,
            record.value as i64,
            record.time.timestamp_millis(),
            record.metadata,
            record.kind.as_str(),
        ],
    )
    .map_err(|e| ChainError::DatabaseError(format!("Failed to save transaction: {}", e)))?;
    Ok(record.clone().with_id(row_id(tx.last_insert_rowid())?))
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`; `:memory:` gives a private
    /// in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS addresses (
                address TEXT PRIMARY KEY,
                balance INTEGER NOT NULL,
                totalin INTEGER NOT NULL,
                totalout INTEGER NOT NULL,
                firstseen INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS blocks (
                height INTEGER PRIMARY KEY,
                address TEXT NOT NULL,
                hash TEXT NOT NULL,
                value INTEGER NOT NULL,
                time INTEGER NOT NULL,
                difficulty INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_address TEXT,
                to_address TEXT NOT NULL,
                value INTEGER NOT NULL,
                time INTEGER NOT NULL,
                metadata TEXT,
                kind TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS work_samples (
                minute INTEGER PRIMARY KEY,
                work INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS webhooks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event TEXT NOT NULL,
                url TEXT NOT NULL,
                owner TEXT NOT NULL,
                token TEXT NOT NULL,
                addresses TEXT,
                method TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create tables: {}", e)))?;

        Ok(Database { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    /// Every stored transaction, oldest first.
    pub fn load_transactions(&self) -> Result<Vec<TransactionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, from_address, to_address, value, time, metadata, kind
             FROM transactions ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let kind: String = row.get(6)?;
            let kind = TransactionKind::parse(&kind).ok_or_else(|| invalid_column(6, Type::Text, kind))?;
            Ok(TransactionRecord {
                id: unsigned(row, 0)?,
                from: row.get(1)?,
                to: row.get(2)?,
                value: unsigned(row, 3)?,
                time: from_millis(4, row.get(4)?)?,
                metadata: row.get(5)?,
                kind,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to load transactions: {}", e)))
    }
}

impl Persistence for Database {
    fn load_addresses(&self) -> Result<Vec<AddressRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT address, balance, totalin, totalout, firstseen FROM addresses")?;
        let rows = stmt.query_map([], address_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to load addresses: {}", e)))
    }

    fn save_address(&self, record: &AddressRecord) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        upsert_address(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<Block>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT height, address, hash, value, time, difficulty FROM blocks ORDER BY height ASC",
        )?;
        let rows = stmt.query_map([], block_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to load blocks: {}", e)))
    }

    fn save_block(&self, block: &Block) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO blocks (height, address, hash, value, time, difficulty)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                block.height as i64,
                block.address,
                block.hash,
                block.value as i64,
                block.time.timestamp_millis(),
                block.difficulty as i64,
            ],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;
        Ok(())
    }

    fn load_work(&self) -> Result<Option<u64>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM metadata WHERE key = 'work'", [], |row| row.get(0))
            .optional()?;
        value
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| ChainError::DatabaseError(format!("Stored work is not a number: {}", v)))
            })
            .transpose()
    }

    fn save_work(&self, work: u64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('work', ?1)",
            params![work.to_string()],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save work: {}", e)))?;
        Ok(())
    }

    fn load_work_samples(&self, since: DateTime<Utc>) -> Result<Vec<WorkSample>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT minute, work FROM work_samples WHERE minute >= ?1 ORDER BY minute ASC")?;
        let rows = stmt.query_map(params![since.timestamp_millis()], |row| {
            Ok(WorkSample {
                minute: from_millis(0, row.get(0)?)?,
                work: unsigned(row, 1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to load work samples: {}", e)))
    }

    fn save_work_sample(&self, sample: &WorkSample) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO work_samples (minute, work) VALUES (?1, ?2)",
            params![sample.minute.timestamp_millis(), sample.work as i64],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save work sample: {}", e)))?;
        Ok(())
    }

    fn commit_block(&self, commit: &BlockCommit<'_>) -> Result<TransactionRecord> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let block = commit.block;
        tx.execute(
            "INSERT INTO blocks (height, address, hash, value, time, difficulty)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                block.height as i64,
                block.address,
                block.hash,
                block.value as i64,
                block.time.timestamp_millis(),
                block.difficulty as i64,
            ],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;

        upsert_address(&tx, commit.address)?;
        let record = insert_transaction(&tx, commit.reward)?;

        tx.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES ('work', ?1)",
            params![commit.work.to_string()],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save work: {}", e)))?;

        if let Some(sample) = commit.sample {
            tx.execute(
                "INSERT OR IGNORE INTO work_samples (minute, work) VALUES (?1, ?2)",
                params![sample.minute.timestamp_millis(), sample.work as i64],
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to save work sample: {}", e)))?;
        }

        tx.commit()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to commit transaction: {}", e)))?;
        Ok(record)
    }

    fn commit_transfer(
        &self,
        from: &AddressRecord,
        to: &AddressRecord,
        tx_record: &NewTransaction,
    ) -> Result<TransactionRecord> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        upsert_address(&tx, from)?;
        upsert_address(&tx, to)?;
        let record = insert_transaction(&tx, tx_record)?;
        tx.commit()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to commit transaction: {}", e)))?;
        Ok(record)
    }

    fn insert_webhook(&self, webhook: &NewWebhook) -> Result<Webhook> {
        let addresses = webhook
            .addresses
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to serialize addresses: {}", e)))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO webhooks (event, url, owner, token, addresses, method)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                webhook.event.as_str(),
                webhook.url,
                webhook.owner,
                webhook.token,
                addresses,
                webhook.method.as_str(),
            ],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save webhook: {}", e)))?;
        Ok(webhook.clone().with_id(row_id(conn.last_insert_rowid())?))
    }

    fn load_webhooks(&self) -> Result<Vec<Webhook>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, event, url, owner, token, addresses, method FROM webhooks ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], webhook_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ChainError::DatabaseError(format!("Failed to load webhooks: {}", e)))
    }

    fn delete_webhook(&self, id: u64) -> Result<bool> {
        let conn = self.conn()?;
        let removed = conn
            .execute("DELETE FROM webhooks WHERE id = ?1", params![id as i64])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to delete webhook: {}", e)))?;
        Ok(removed > 0)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    addresses: BTreeMap<String, AddressRecord>,
    blocks: BTreeMap<u64, Block>,
    transactions: Vec<TransactionRecord>,
    work: Option<u64>,
    samples: BTreeMap<DateTime<Utc>, u64>,
    webhooks: BTreeMap<u64, Webhook>,
    next_webhook_id: u64,
}

impl MemoryState {
    fn push_transaction(&mut self, tx: &NewTransaction) -> TransactionRecord {
        let record = tx.clone().with_id(self.transactions.len() as u64 + 1);
        self.transactions.push(record.clone());
        record
    }
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    state: Mutex<MemoryState>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }

    /// Every stored transaction, oldest first.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.state().map(|s| s.transactions.clone()).unwrap_or_default()
    }
}

impl Persistence for InMemoryPersistence {
    fn load_addresses(&self) -> Result<Vec<AddressRecord>> {
        Ok(self.state()?.addresses.values().cloned().collect())
    }

    fn save_address(&self, record: &AddressRecord) -> Result<()> {
        self.state()?
            .addresses
            .insert(record.address.clone(), record.clone());
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<Block>> {
        Ok(self.state()?.blocks.values().cloned().collect())
    }

    fn save_block(&self, block: &Block) -> Result<()> {
        let mut state = self.state()?;
        if state.blocks.contains_key(&block.height) {
            return Err(ChainError::DatabaseError(format!(
                "Block {} already stored",
                block.height
            )));
        }
        state.blocks.insert(block.height, block.clone());
        Ok(())
    }

    fn load_work(&self) -> Result<Option<u64>> {
        Ok(self.state()?.work)
    }

    fn save_work(&self, work: u64) -> Result<()> {
        self.state()?.work = Some(work);
        Ok(())
    }

    fn load_work_samples(&self, since: DateTime<Utc>) -> Result<Vec<WorkSample>> {
        Ok(self
            .state()?
            .samples
            .range(since..)
            .map(|(minute, work)| WorkSample {
                minute: *minute,
                work: *work,
            })
            .collect())
    }

    fn save_work_sample(&self, sample: &WorkSample) -> Result<()> {
        self.state()?.samples.entry(sample.minute).or_insert(sample.work);
        Ok(())
    }

    fn commit_block(&self, commit: &BlockCommit<'_>) -> Result<TransactionRecord> {
        let mut state = self.state()?;
        if state.blocks.contains_key(&commit.block.height) {
            return Err(ChainError::DatabaseError(format!(
                "Block {} already stored",
                commit.block.height
            )));
        }
        state.blocks.insert(commit.block.height, commit.block.clone());
        state
            .addresses
            .insert(commit.address.address.clone(), commit.address.clone());
        let record = state.push_transaction(commit.reward);
        state.work = Some(commit.work);
        if let Some(sample) = commit.sample {
            state.samples.entry(sample.minute).or_insert(sample.work);
        }
        Ok(record)
    }

    fn commit_transfer(
        &self,
        from: &AddressRecord,
        to: &AddressRecord,
        tx: &NewTransaction,
    ) -> Result<TransactionRecord> {
        let mut state = self.state()?;
        state.addresses.insert(from.address.clone(), from.clone());
        state.addresses.insert(to.address.clone(), to.clone());
        Ok(state.push_transaction(tx))
    }

    fn insert_webhook(&self, webhook: &NewWebhook) -> Result<Webhook> {
        let mut state = self.state()?;
        state.next_webhook_id += 1;
        let hook = webhook.clone().with_id(state.next_webhook_id);
        state.webhooks.insert(hook.id, hook.clone());
        Ok(hook)
    }

    fn load_webhooks(&self) -> Result<Vec<Webhook>> {
        Ok(self.state()?.webhooks.values().cloned().collect())
    }

    fn delete_webhook(&self, id: u64) -> Result<bool> {
        Ok(self.state()?.webhooks.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn time(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn block(height: u64) -> Block {
        Block::new(height, "kuf03bap3u", format!("{:064x}", height), 25, 1000, time(0))
    }

    fn commit_one(persistence: &dyn Persistence, height: u64) -> Result<TransactionRecord> {
        let block = block(height);
        let address = AddressRecord::new("kuf03bap3u", time(0)).credited(25).unwrap();
        let reward = NewTransaction::mined("kuf03bap3u", 25, time(0));
        let sample = WorkSample {
            minute: time(1),
            work: 990,
        };
        persistence.commit_block(&BlockCommit {
            block: &block,
            address: &address,
            reward: &reward,
            work: 990,
            sample: Some(&sample),
        })
    }

    #[test]
    fn test_database_open() {
        let db = Database::open(":memory:").unwrap();
        assert!(db.conn().unwrap().is_autocommit());
        assert!(db.load_blocks().unwrap().is_empty());
        assert_eq!(db.load_work().unwrap(), None);
    }

    #[test]
    fn test_commit_block_writes_everything() {
        let db = Database::open(":memory:").unwrap();
        db.save_block(&Block::genesis(&"0".repeat(64), 1000)).unwrap();
        let tx = commit_one(&db, 2).unwrap();
        assert_eq!(tx.id, 1);
        assert_eq!(tx.kind, TransactionKind::Mined);

        let blocks = db.load_blocks().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1], block(2));
        assert_eq!(db.load_addresses().unwrap()[0].balance, 25);
        assert_eq!(db.load_work().unwrap(), Some(990));
        assert_eq!(db.load_work_samples(time(0)).unwrap().len(), 1);
        assert_eq!(db.load_transactions().unwrap(), vec![tx]);
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let db = Database::open(":memory:").unwrap();
        commit_one(&db, 2).unwrap();
        db.save_work(5).unwrap();
        // Same height again: the block insert fails and nothing else lands.
        assert!(commit_one(&db, 2).is_err());
        assert_eq!(db.load_work().unwrap(), Some(5));
        assert_eq!(db.load_transactions().unwrap().len(), 1);
    }

    #[test]
    fn test_first_sample_of_a_minute_wins() {
        let db = Database::open(":memory:").unwrap();
        db.save_work_sample(&WorkSample { minute: time(3), work: 10 }).unwrap();
        db.save_work_sample(&WorkSample { minute: time(3), work: 20 }).unwrap();
        db.save_work_sample(&WorkSample { minute: time(1), work: 30 }).unwrap();
        let samples = db.load_work_samples(time(2)).unwrap();
        assert_eq!(samples, vec![WorkSample { minute: time(3), work: 10 }]);
        assert_eq!(db.load_work_samples(time(0) - Duration::days(1)).unwrap().len(), 2);
    }

    #[test]
    fn test_webhook_rows() {
        let db = Database::open(":memory:").unwrap();
        let hook = db
            .insert_webhook(&NewWebhook {
                event: EventKind::Transaction,
                url: "http://localhost/hook".to_string(),
                owner: "kuf03bap3u".to_string(),
                token: "ab".repeat(32),
                addresses: Some(vec!["k74tq2hsh6".to_string()]),
                method: WebhookMethod::Get,
            })
            .unwrap();
        assert_eq!(db.load_webhooks().unwrap(), vec![hook.clone()]);
        assert!(db.delete_webhook(hook.id).unwrap());
        assert!(!db.delete_webhook(hook.id).unwrap());
        assert!(db.load_webhooks().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();
        {
            let db = Database::open(path).unwrap();
            commit_one(&db, 2).unwrap();
        }
        let db = Database::open(path).unwrap();
        assert_eq!(db.load_blocks().unwrap().len(), 1);
        assert_eq!(db.load_work().unwrap(), Some(990));
        let address = &db.load_addresses().unwrap()[0];
        assert_eq!(address.firstseen, time(0));
        assert!(address.is_consistent());
    }

    #[test]
    fn test_negative_amounts_are_rejected_on_load() {
        let db = Database::open(":memory:").unwrap();
        db.conn()
            .unwrap()
            .execute(
                "INSERT INTO addresses (address, balance, totalin, totalout, firstseen) VALUES (?1, -5, 0, 0, 0)",
                params!["kuf03bap3u"],
            )
            .unwrap();
        assert!(db.load_addresses().is_err());

        db.conn()
            .unwrap()
            .execute(
                "INSERT INTO blocks (height, address, hash, value, time, difficulty) VALUES (-1, ?1, ?2, 25, 0, 1000)",
                params!["kuf03bap3u", "0".repeat(64)],
            )
            .unwrap();
        assert!(db.load_blocks().is_err());
    }

    #[test]
    fn test_in_memory_matches_database() {
        let memory = InMemoryPersistence::new();
        let tx = commit_one(&memory, 2).unwrap();
        assert_eq!(memory.transactions(), vec![tx]);
        assert!(commit_one(&memory, 2).is_err());
        assert_eq!(memory.transactions().len(), 1);
        assert_eq!(memory.load_work().unwrap(), Some(990));
    }
}
