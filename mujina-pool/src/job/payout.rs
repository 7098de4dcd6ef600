//! Fixed coinbase outputs mandated by a chain.
//!
//! Some chains require a slice of each block reward to go to founders,
//! a development fund, or similar. Which outputs apply is a pure function of
//! block height, block time and chain parameters, so it is modelled as a
//! [`PayoutSchedule`] that the coinbase builder consults. Configured
//! schedules come from a [`PayoutTable`]; chains without mandated outputs use
//! [`NoPayouts`].

use std::fmt::Debug;

use bitcoin::ScriptBuf;
use serde::Deserialize;

use super::coinbase::CoinbaseError;
use crate::chain::ChainParams;

/// One coinbase output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutOutput {
    pub amount: u64,
    pub script: ScriptBuf,
}

/// Source of the fixed outputs for a block.
pub trait PayoutSchedule: Debug + Send + Sync {
    /// Outputs that must appear in the coinbase of the block at `height`,
    /// mined at `block_time` (Unix seconds).
    fn outputs(
        &self,
        height: u32,
        block_time: u64,
        chain: &ChainParams,
    ) -> Result<Vec<PayoutOutput>, CoinbaseError>;
}

/// Schedule with no mandated outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPayouts;

impl PayoutSchedule for NoPayouts {
    fn outputs(
        &self,
        _height: u32,
        _block_time: u64,
        _chain: &ChainParams,
    ) -> Result<Vec<PayoutOutput>, CoinbaseError> {
        Ok(Vec::new())
    }
}

/// A fixed output active within a height and time window.
///
/// Bounds are inclusive on the `from_` side and exclusive on the `until_`
/// side; an absent bound is open.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PayoutEntry {
    pub address: String,

    /// Satoshis
    pub amount: u64,

    #[serde(default)]
    pub from_height: Option<u32>,

    #[serde(default)]
    pub until_height: Option<u32>,

    #[serde(default)]
    pub from_time: Option<u64>,

    #[serde(default)]
    pub until_time: Option<u64>,
}

impl PayoutEntry {
    fn is_active(&self, height: u32, block_time: u64) -> bool {
        self.from_height.map_or(true, |h| height >= h)
            && self.until_height.map_or(true, |h| height < h)
            && self.from_time.map_or(true, |t| block_time >= t)
            && self.until_time.map_or(true, |t| block_time < t)
    }
}

/// Table-driven payout schedule, usually loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayoutTable {
    entries: Vec<PayoutEntry>,
}

impl PayoutTable {
    pub fn new(entries: Vec<PayoutEntry>) -> Self {
        Self { entries }
    }

    /// Check every address up front, so a typo aborts startup instead of
    /// the first template build.
    pub fn validate(&self, chain: &ChainParams) -> Result<(), CoinbaseError> {
        for entry in &self.entries {
            chain.address_to_script(&entry.address)?;
        }
        Ok(())
    }
}

impl PayoutSchedule for PayoutTable {
    fn outputs(
        &self,
        height: u32,
        block_time: u64,
        chain: &ChainParams,
    ) -> Result<Vec<PayoutOutput>, CoinbaseError> {
        self.entries
            .iter()
            .filter(|entry| entry.is_active(height, block_time))
            .map(|entry| {
                Ok(PayoutOutput {
                    amount: entry.amount,
                    script: chain.address_to_script(&entry.address)?,
                })
            })
            .collect()
    }
}
