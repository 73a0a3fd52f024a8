//! Chain heads and their ancestor windows

use ethers::types::H256;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Head {
    pub number: i64,
    pub hash: H256,
    pub parent_hash: H256,
}

/// A head followed by its ancestors, newest first and contiguous by height.
///
/// Built once by the head tracker and handed out by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadChain {
    heads: Vec<Head>,
}

impl HeadChain {
    /// `heads` must be newest first, each linking to the next by parent hash.
    /// Returns `None` for an empty or broken chain.
    pub fn new(heads: Vec<Head>) -> Option<Self> {
        if heads.is_empty() {
            return None;
        }
        let linked = heads
            .windows(2)
            .all(|w| w[0].parent_hash == w[1].hash && w[0].number == w[1].number + 1);
        if !linked {
            return None;
        }
        Some(Self { heads })
    }

    pub fn single(head: Head) -> Self {
        Self { heads: vec![head] }
    }

    pub fn head(&self) -> &Head {
        &self.heads[0]
    }

    pub fn number(&self) -> i64 {
        self.heads[0].number
    }

    pub fn hash(&self) -> H256 {
        self.heads[0].hash
    }

    /// Oldest ancestor held
    pub fn earliest(&self) -> &Head {
        &self.heads[self.heads.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Canonical hash at `number`, if the window covers it
    pub fn hash_at_height(&self, number: i64) -> Option<H256> {
        let offset = self.number().checked_sub(number)?;
        if offset < 0 {
            return None;
        }
        self.heads.get(offset as usize).map(|h| h.hash)
    }

    pub fn is_in_chain(&self, hash: H256) -> bool {
        self.heads.iter().any(|h| h.hash == hash)
    }

    pub fn get(&self, hash: H256) -> Option<&Head> {
        self.heads.iter().find(|h| h.hash == hash)
    }

    pub fn heads(&self) -> &[Head] {
        &self.heads
    }

    /// Keep at most `len` heads
    pub fn truncate(&mut self, len: usize) {
        self.heads.truncate(len.max(1));
    }
}
