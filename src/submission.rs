//! Proof-of-work block submission
//!
//! Every transport (JSON, legacy plaintext, websocket) calls
//! [`BlockSubmitter::submit`]. The digest is computed against a snapshot of
//! the chain head taken under a read lock; only a candidate that meets the
//! work target takes the write lock, where it is re-checked against the head
//! it now holds before anything is committed. Block and reward events are
//! published while that lock is still held.

use crate::blockchain::{
    block_digest, meets_work, validate_address, validate_nonce, AddressRecord, Block, Chain,
    Ledger, NewTransaction, Nonce, RewardSchedule, TransactionRecord,
};
use crate::config::MiningConfig;
use crate::crypto::AddressScheme;
use crate::error::{ChainError, Result};
use crate::events::{EventBus, LedgerEvent};
use crate::persistence::{BlockCommit, Persistence};
use crate::work::{WorkSample, WorkTracker};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// The mining parameters a submitter enforces.
#[derive(Debug, Clone)]
pub struct MiningRules {
    pub enabled: bool,
    pub scheme: AddressScheme,
    pub nonce_max_size: usize,
    pub rewards: RewardSchedule,
}

impl MiningRules {
    pub fn from_config(config: &MiningConfig) -> Self {
        Self {
            enabled: config.enabled,
            scheme: AddressScheme::new(config.address_prefix),
            nonce_max_size: config.nonce_max_size,
            rewards: RewardSchedule {
                base: config.base_reward,
                reduced: config.reduced_reward,
                reduction_height: config.reward_reduction_height,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedBlock {
    pub block: Block,
    /// The solver's address after the reward.
    pub address: AddressRecord,
    /// Work in force for the next block.
    pub work: u64,
    pub transaction: TransactionRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(AcceptedBlock),
    /// The digest missed the target. `attempt` is the hashed input.
    NoMatch { attempt: String },
}

pub struct BlockSubmitter {
    chain: RwLock<Chain>,
    ledger: Arc<Ledger>,
    work: Arc<WorkTracker>,
    persistence: Arc<dyn Persistence>,
    events: EventBus,
    rules: MiningRules,
}

impl BlockSubmitter {
    pub fn new(
        chain: Chain,
        ledger: Arc<Ledger>,
        work: Arc<WorkTracker>,
        persistence: Arc<dyn Persistence>,
        events: EventBus,
        rules: MiningRules,
    ) -> Self {
        Self {
            chain: RwLock::new(chain),
            ledger,
            work,
            persistence,
            events,
            rules,
        }
    }

    pub fn rules(&self) -> &MiningRules {
        &self.rules
    }

    pub fn head(&self) -> Block {
        self.chain.read().head().clone()
    }

    pub fn block(&self, height: u64) -> Result<Block> {
        self.chain
            .read()
            .get(height)
            .cloned()
            .ok_or(ChainError::BlockNotFound(height))
    }

    pub fn current_work(&self) -> u64 {
        self.work.current_work()
    }

    pub fn submit(&self, address: Option<&str>, nonce: Option<Nonce>) -> Result<SubmitOutcome> {
        if !self.rules.enabled {
            return Err(ChainError::MiningDisabled);
        }
        let address = validate_address(&self.rules.scheme, address)?;
        let nonce = validate_nonce(nonce, self.rules.nonce_max_size)?;

        // Work only changes under the chain write lock, so this pair is consistent.
        let (prefix, work) = {
            let chain = self.chain.read();
            (chain.head().prefix().to_string(), self.work.current_work())
        };

        let digest = block_digest(&address, &prefix, &nonce);
        if !meets_work(&digest, work) {
            return Ok(SubmitOutcome::NoMatch {
                attempt: format!("{}{}{}", address, prefix, nonce.to_text()),
            });
        }

        match self.accept(&address, &nonce, &prefix, digest)? {
            Some(accepted) => Ok(SubmitOutcome::Accepted(accepted)),
            None => Ok(SubmitOutcome::NoMatch {
                attempt: format!("{}{}{}", address, prefix, nonce.to_text()),
            }),
        }
    }

    /// Compare-and-append under the chain write lock. `None` when the head
    /// moved and the attempt no longer meets the target against the new head.
    /// Events go out before the lock is released so block events stay in
    /// height order.
    fn accept(
        &self,
        address: &str,
        nonce: &Nonce,
        seen_prefix: &str,
        digest: String,
    ) -> Result<Option<AcceptedBlock>> {
        let mut chain = self.chain.write();
        let head = chain.head().clone();
        let work = self.work.current_work();

        let digest = if head.prefix() == seen_prefix {
            digest
        } else {
            block_digest(address, head.prefix(), nonce)
        };
        if !meets_work(&digest, work) {
            tracing::debug!(address = %address, height = head.height, "block.stale_attempt");
            return Ok(None);
        }

        let now = Utc::now();
        let elapsed = (now - head.time).to_std().unwrap_or_default();
        let next_work = self.work.next_work(work, elapsed);
        let height = head.height + 1;
        let value = self.rules.rewards.value_at(height);
        let block = Block::new(height, address, digest, value, work, now);
        let reward = NewTransaction::mined(address, value, now);
        let sample = self.work.sample_for(now, next_work);

        let persistence = self.persistence.clone();
        let (record, transaction) = self
            .ledger
            .apply_credit(address, value, |credited| {
                persistence.commit_block(&BlockCommit {
                    block: &block,
                    address: credited,
                    reward: &reward,
                    work: next_work,
                    sample: sample.as_ref(),
                })
            })
            .map_err(|e| {
                tracing::error!(height, address = %address, error = %e, "block.commit_failed");
                e
            })?;

        chain.append(block.clone())?;
        self.work.set_work(next_work);
        if sample.is_some() {
            self.work.record_sample(now, next_work);
        }
        self.events.publish(LedgerEvent::Block {
            block: block.clone(),
            new_work: next_work,
        });
        self.events.publish(LedgerEvent::Transaction(transaction.clone()));
        drop(chain);

        tracing::info!(height, address = %address, value, work = next_work, "block.accepted");
        Ok(Some(AcceptedBlock {
            block,
            address: record,
            work: next_work,
            transaction,
        }))
    }

    /// Record the current work for this minute if no sample exists yet.
    pub fn sample_work(&self, now: DateTime<Utc>) -> Result<Option<WorkSample>> {
        let _chain = self.chain.read();
        let work = self.work.current_work();
        let Some(sample) = self.work.sample_for(now, work) else {
            return Ok(None);
        };
        self.persistence.save_work_sample(&sample)?;
        Ok(self.work.record_sample(now, work))
    }
}
