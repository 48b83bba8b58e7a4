use crate::error::ChainError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Number of hex characters of a block hash that feed the next attempt.
pub const SHORT_HASH_LENGTH: usize = 12;

pub const GENESIS_HEIGHT: u64 = 1;
pub const GENESIS_ADDRESS: &str = "0000000000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub address: String,
    pub hash: String,
    pub short_hash: String,
    pub value: u64,
    pub time: DateTime<Utc>,
    pub difficulty: u64,
}

impl Block {
    pub fn new(
        height: u64,
        address: impl Into<String>,
        hash: impl Into<String>,
        value: u64,
        difficulty: u64,
        time: DateTime<Utc>,
    ) -> Self {
        let hash = hash.into();
        let short_hash = hash.chars().take(SHORT_HASH_LENGTH).collect();
        Block {
            height,
            address: address.into(),
            hash,
            short_hash,
            value,
            time,
            difficulty,
        }
    }

    /// The first block of every chain. It mints nothing.
    pub fn genesis(hash: &str, difficulty: u64) -> Self {
        let time = Utc
            .with_ymd_and_hms(2015, 2, 14, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Block::new(GENESIS_HEIGHT, GENESIS_ADDRESS, hash, 0, difficulty, time)
    }

    /// The part of this block's hash that the next attempt commits to.
    pub fn prefix(&self) -> &str {
        &self.short_hash
    }
}

/// Block value as a function of height: a flat base reward that drops to a
/// reduced reward from a configured height on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardSchedule {
    pub base: u64,
    pub reduced: u64,
    pub reduction_height: u64,
}

impl Default for RewardSchedule {
    fn default() -> Self {
        Self {
            base: 25,
            reduced: 1,
            reduction_height: 222_222,
        }
    }
}

impl RewardSchedule {
    pub fn value_at(&self, height: u64) -> u64 {
        if height >= self.reduction_height {
            self.reduced
        } else {
            self.base
        }
    }
}

/// Append-only block history. Never empty: it starts at a genesis block.
#[derive(Debug, Clone)]
pub struct Chain {
    blocks: Vec<Block>,
}

impl Chain {
    pub fn new(genesis: Block) -> Self {
        Self {
            blocks: vec![genesis],
        }
    }

    /// Rebuild from stored blocks, which must be contiguous by height.
    pub fn from_blocks(mut blocks: Vec<Block>) -> Result<Self, ChainError> {
        if blocks.is_empty() {
            return Err(ChainError::DatabaseError("Cannot rebuild an empty chain".to_string()));
        }
        blocks.sort_by_key(|b| b.height);
        for pair in blocks.windows(2) {
            if pair[1].height != pair[0].height + 1 {
                return Err(ChainError::DatabaseError(format!(
                    "Chain has a gap between heights {} and {}",
                    pair[0].height, pair[1].height
                )));
            }
        }
        Ok(Self { blocks })
    }

    pub fn head(&self) -> &Block {
        // Non-empty by construction.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u64 {
        self.head().height
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, height: u64) -> Option<&Block> {
        let first = self.blocks[0].height;
        let index = height.checked_sub(first)?;
        self.blocks.get(usize::try_from(index).ok()?)
    }

    pub fn append(&mut self, block: Block) -> Result<(), ChainError> {
        let expected = self.height() + 1;
        if block.height != expected {
            return Err(ChainError::DatabaseError(format!(
                "Invalid block height. Expected {}, but got {}.",
                expected, block.height
            )));
        }
        self.blocks.push(block);
        Ok(())
    }
}
