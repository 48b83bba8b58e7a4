use crate::error::{ChainError, Result};
use crate::persistence::Persistence;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const MAX_METADATA_LENGTH: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub balance: u64,
    pub totalin: u64,
    pub totalout: u64,
    pub firstseen: DateTime<Utc>,
}

impl AddressRecord {
    pub fn new(address: impl Into<String>, firstseen: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            balance: 0,
            totalin: 0,
            totalout: 0,
            firstseen,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.totalin.checked_sub(self.totalout) == Some(self.balance)
    }

    /// The record after receiving `amount`.
    pub fn credited(&self, amount: u64) -> Result<Self> {
        let balance = self
            .balance
            .checked_add(amount)
            .ok_or(ChainError::InvalidParameter("amount"))?;
        let totalin = self
            .totalin
            .checked_add(amount)
            .ok_or(ChainError::InvalidParameter("amount"))?;
        Ok(Self {
            balance,
            totalin,
            ..self.clone()
        })
    }

    /// The record after spending `amount`; never goes negative.
    pub fn debited(&self, amount: u64) -> Result<Self> {
        let balance = self
            .balance
            .checked_sub(amount)
            .ok_or_else(|| ChainError::InsufficientFunds(self.address.clone()))?;
        let totalout = self
            .totalout
            .checked_add(amount)
            .ok_or(ChainError::InvalidParameter("amount"))?;
        Ok(Self {
            balance,
            totalout,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Transfer,
    Mined,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Transfer => "transfer",
            TransactionKind::Mined => "mined",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transfer" => Some(TransactionKind::Transfer),
            "mined" => Some(TransactionKind::Mined),
            _ => None,
        }
    }
}

/// A transaction before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub from: Option<String>,
    pub to: String,
    pub value: u64,
    pub time: DateTime<Utc>,
    pub metadata: Option<String>,
    pub kind: TransactionKind,
}

impl NewTransaction {
    pub fn mined(to: &str, value: u64, time: DateTime<Utc>) -> Self {
        Self {
            from: None,
            to: to.to_string(),
            value,
            time,
            metadata: None,
            kind: TransactionKind::Mined,
        }
    }

    pub fn with_id(self, id: u64) -> TransactionRecord {
        TransactionRecord {
            id,
            from: self.from,
            to: self.to,
            value: self.value,
            time: self.time,
            metadata: self.metadata,
            kind: self.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: u64,
    pub from: Option<String>,
    pub to: String,
    pub value: u64,
    pub time: DateTime<Utc>,
    pub metadata: Option<String>,
    #[serde(rename = "type")]
    pub kind: TransactionKind,
}

type Slot = Arc<Mutex<AddressRecord>>;

/// Address balances. Each address sits behind its own mutex so unrelated
/// addresses never contend; every change is written through to persistence
/// before it becomes visible.
pub struct Ledger {
    accounts: DashMap<String, Slot>,
    persistence: Arc<dyn Persistence>,
}

impl Ledger {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            accounts: DashMap::new(),
            persistence,
        }
    }

    /// Rebuild the in-memory view from stored addresses.
    pub fn load(persistence: Arc<dyn Persistence>) -> Result<Self> {
        let ledger = Self::new(persistence);
        for record in ledger.persistence.load_addresses()? {
            if !record.is_consistent() {
                return Err(ChainError::DatabaseError(format!(
                    "Stored address {} violates balance = totalin - totalout",
                    record.address
                )));
            }
            ledger
                .accounts
                .insert(record.address.clone(), Arc::new(Mutex::new(record)));
        }
        Ok(ledger)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn find(&self, address: &str) -> Option<AddressRecord> {
        let slot = self.accounts.get(address).map(|s| s.value().clone())?;
        let record = slot.lock().clone();
        Some(record)
    }

    pub fn get(&self, address: &str) -> Result<AddressRecord> {
        self.find(address)
            .ok_or_else(|| ChainError::AddressNotFound(address.to_string()))
    }

    /// Existing slot for `address`, or a freshly persisted empty one.
    fn slot(&self, address: &str) -> Result<Slot> {
        if let Some(slot) = self.accounts.get(address) {
            return Ok(slot.value().clone());
        }
        match self.accounts.entry(address.to_string()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let record = AddressRecord::new(address, Utc::now());
                self.persistence.save_address(&record)?;
                tracing::debug!(address = %address, "ledger.address_created");
                let slot = Arc::new(Mutex::new(record));
                e.insert(slot.clone());
                Ok(slot)
            }
        }
    }

    pub fn get_or_create(&self, address: &str) -> Result<AddressRecord> {
        let slot = self.slot(address)?;
        let record = slot.lock().clone();
        Ok(record)
    }

    fn existing(&self, address: &str) -> Option<Slot> {
        self.accounts.get(address).map(|s| s.value().clone())
    }

    /// Credit `amount` to `address`, handing the updated record to `commit`
    /// while the address is held. Memory only changes if `commit` succeeds,
    /// and an address seen for the first time only appears once it has.
    pub fn apply_credit<T, F>(&self, address: &str, amount: u64, commit: F) -> Result<(AddressRecord, T)>
    where
        F: FnOnce(&AddressRecord) -> Result<T>,
    {
        if let Some(slot) = self.existing(address) {
            return credit_slot(&slot, amount, commit);
        }
        match self.accounts.entry(address.to_string()) {
            Entry::Occupied(e) => {
                let slot = e.get().clone();
                drop(e);
                credit_slot(&slot, amount, commit)
            }
            Entry::Vacant(e) => {
                let updated = AddressRecord::new(address, Utc::now()).credited(amount)?;
                let out = commit(&updated)?;
                e.insert(Arc::new(Mutex::new(updated.clone())));
                tracing::debug!(address = %address, "ledger.address_created");
                Ok((updated, out))
            }
        }
    }

    pub fn credit(&self, address: &str, amount: u64) -> Result<AddressRecord> {
        let persistence = self.persistence.clone();
        let (record, ()) = self.apply_credit(address, amount, |r| persistence.save_address(r))?;
        Ok(record)
    }

    pub fn debit(&self, address: &str, amount: u64) -> Result<AddressRecord> {
        let slot = self
            .existing(address)
            .ok_or_else(|| ChainError::InsufficientFunds(address.to_string()))?;
        let mut guard = slot.lock();
        let updated = guard.debited(amount)?;
        self.persistence.save_address(&updated)?;
        *guard = updated.clone();
        Ok(updated)
    }

    /// Move `amount` from `from` to `to` and record it as one stored
    /// transaction. Existing addresses are locked in ascending order; a new
    /// recipient is only added once the transfer is stored.
    pub fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        metadata: Option<String>,
    ) -> Result<TransactionRecord> {
        if from == to {
            return Err(ChainError::InvalidParameter("to"));
        }
        if amount == 0 {
            return Err(ChainError::InvalidParameter("amount"));
        }
        if metadata.as_ref().is_some_and(|m| m.chars().count() > MAX_METADATA_LENGTH) {
            return Err(ChainError::InvalidParameter("metadata"));
        }

        let sender = self
            .existing(from)
            .ok_or_else(|| ChainError::InsufficientFunds(from.to_string()))?;
        let tx = NewTransaction {
            from: Some(from.to_string()),
            to: to.to_string(),
            value: amount,
            time: Utc::now(),
            metadata,
            kind: TransactionKind::Transfer,
        };

        loop {
            if let Some(recipient) = self.existing(to) {
                return self.transfer_between(&sender, &recipient, from < to, &tx);
            }

            let mut sender_guard = sender.lock();
            let debited = sender_guard.debited(amount)?;
            match self.accounts.entry(to.to_string()) {
                // Created since the lookup above; take the two-slot path.
                Entry::Occupied(_) => continue,
                Entry::Vacant(e) => {
                    let credited = AddressRecord::new(to, tx.time).credited(amount)?;
                    let record = self.persistence.commit_transfer(&debited, &credited, &tx)?;
                    *sender_guard = debited;
                    e.insert(Arc::new(Mutex::new(credited)));
                    return Ok(record);
                }
            }
        }
    }

    fn transfer_between(
        &self,
        sender: &Slot,
        recipient: &Slot,
        sender_first: bool,
        tx: &NewTransaction,
    ) -> Result<TransactionRecord> {
        let (mut sender_guard, mut recipient_guard) = if sender_first {
            let s = sender.lock();
            let r = recipient.lock();
            (s, r)
        } else {
            let r = recipient.lock();
            let s = sender.lock();
            (s, r)
        };

        let debited = sender_guard.debited(tx.value)?;
        let credited = recipient_guard.credited(tx.value)?;
        let record = self.persistence.commit_transfer(&debited, &credited, tx)?;

        *sender_guard = debited;
        *recipient_guard = credited;
        Ok(record)
    }

    /// Point-in-time copy of every address, in no particular order.
    pub fn snapshot(&self) -> Vec<AddressRecord> {
        let slots: Vec<Slot> = self.accounts.iter().map(|e| e.value().clone()).collect();
        slots.into_iter().map(|s| s.lock().clone()).collect()
    }
}

fn credit_slot<T, F>(slot: &Slot, amount: u64, commit: F) -> Result<(AddressRecord, T)>
where
    F: FnOnce(&AddressRecord) -> Result<T>,
{
    let mut guard = slot.lock();
    let updated = guard.credited(amount)?;
    let out = commit(&updated)?;
    *guard = updated.clone();
    Ok((updated, out))
}
