//! Coinbase transaction construction.
//!
//! The coinbase is built once per job and split around the extranonce that
//! every share fills in:
//!
//! ```text
//! part1: version | 1 input | null outpoint | scriptSig length |
//!        height | aux flags | time | extranonce push opcode
//! (extranonce1 | extranonce2)
//! part2: brand push | sequence | outputs | lock time [| payload]
//! ```
//!
//! Outputs are ordered: chain-mandated payouts, pool fee, pool reward,
//! masternode payees, then the witness commitment.

use std::sync::Arc;

use bitcoin::consensus::encode::{serialize, VarInt};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Amount, ScriptBuf, TxOut};
use thiserror::Error;

use super::payout::{PayoutOutput, PayoutSchedule};
use super::template::BlockTemplate;
use crate::chain::{AddressError, ChainParams};

/// Largest brand that still fits a single-byte push opcode.
pub const MAX_BRAND_LEN: usize = 75;

/// Consensus limit on the coinbase scriptSig.
const MAX_SCRIPT_SIG_LEN: usize = 100;

const TX_VERSION: u32 = 1;

/// Special-transaction coinbase: version 3, type 5.
const TX_VERSION_COINBASE_PAYLOAD: u32 = 3 | (5 << 16);

const SEQUENCE_FINAL: [u8; 4] = [0xff; 4];

/// Fatal problems building a coinbase. These indicate misconfiguration or
/// a bad template, never a bad share.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoinbaseError {
    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("block brand is {0} bytes, at most {MAX_BRAND_LEN} allowed")]
    BrandTooLong(usize),

    #[error("coinbase scriptSig would be {0} bytes, at most {MAX_SCRIPT_SIG_LEN} allowed")]
    ScriptSigTooLong(usize),

    #[error("fee of {0} basis points exceeds 100%")]
    FeeTooHigh(u16),

    #[error("outputs need {needed} satoshis but coinbase value is {available}")]
    Overspent { needed: u64, available: u64 },

    #[error("template field {field}: {reason}")]
    Template { field: &'static str, reason: String },
}

/// Pool fee taken from the pool's own reward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolFee {
    /// Hundredths of a percent
    pub basis_points: u16,
    pub script: ScriptBuf,
}

/// Everything about the coinbase that stays the same from job to job.
#[derive(Debug, Clone)]
pub struct CoinbaseConfig {
    pub pool_script: ScriptBuf,
    pub fee: Option<PoolFee>,

    /// Pool identification placed after the extranonce
    pub brand: Vec<u8>,

    pub payouts: Arc<dyn PayoutSchedule>,
    pub chain: ChainParams,
}

impl CoinbaseConfig {
    /// Resolve addresses and check limits.
    pub fn new(
        chain: ChainParams,
        pool_address: &str,
        fee: Option<(u16, &str)>,
        brand: &str,
        payouts: Arc<dyn PayoutSchedule>,
    ) -> Result<Self, CoinbaseError> {
        if brand.len() > MAX_BRAND_LEN {
            return Err(CoinbaseError::BrandTooLong(brand.len()));
        }

        let fee = match fee {
            Some((basis_points, _)) if basis_points > 10_000 => {
                return Err(CoinbaseError::FeeTooHigh(basis_points));
            }
            Some((basis_points, address)) if basis_points > 0 => Some(PoolFee {
                basis_points,
                script: chain.address_to_script(address)?,
            }),
            _ => None,
        };

        Ok(Self {
            pool_script: chain.address_to_script(pool_address)?,
            fee,
            brand: brand.as_bytes().to_vec(),
            payouts,
            chain,
        })
    }
}

/// A coinbase transaction split around its extranonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coinbase {
    part1: Vec<u8>,
    part2: Vec<u8>,
    extranonce_size: usize,
    output_count: usize,
    output_value: u64,
    has_witness_commitment: bool,
}

impl Coinbase {
    /// Build the coinbase for `template`.
    ///
    /// `extranonce_size` is the total number of bytes miners and the server
    /// contribute between the two halves. `now` is stamped into the
    /// scriptSig.
    pub fn build(
        template: &BlockTemplate,
        config: &CoinbaseConfig,
        extranonce_size: usize,
        now: u64,
    ) -> Result<Self, CoinbaseError> {
        let payload = template
            .coinbase_payload
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(hex::decode)
            .transpose()
            .map_err(|e| template_error("coinbase_payload", e))?;

        let flags = hex::decode(&template.coinbaseaux.flags)
            .map_err(|e| template_error("coinbaseaux.flags", e))?;

        if config.brand.len() > MAX_BRAND_LEN {
            return Err(CoinbaseError::BrandTooLong(config.brand.len()));
        }

        let mut script_prefix = serialize_number(template.height as u64);
        script_prefix.extend_from_slice(&flags);
        script_prefix.extend_from_slice(&serialize_number(now));
        script_prefix.push(extranonce_size as u8);

        let brand_push = serialize_string(&config.brand);
        let script_len = script_prefix.len() + extranonce_size + brand_push.len();
        if script_len > MAX_SCRIPT_SIG_LEN {
            return Err(CoinbaseError::ScriptSigTooLong(script_len));
        }

        let version = if payload.is_some() {
            TX_VERSION_COINBASE_PAYLOAD
        } else {
            TX_VERSION
        };

        let mut part1 = Vec::with_capacity(64);
        part1.extend_from_slice(&version.to_le_bytes());
        part1.extend_from_slice(&serialize(&VarInt(1)));
        part1.extend_from_slice(&[0u8; 32]);
        part1.extend_from_slice(&SEQUENCE_FINAL);
        part1.extend_from_slice(&serialize(&VarInt(script_len as u64)));
        part1.extend_from_slice(&script_prefix);

        let outputs = build_outputs(template, config)?;
        let has_witness_commitment = template.default_witness_commitment.is_some();

        let mut part2 = Vec::with_capacity(128);
        part2.extend_from_slice(&brand_push);
        part2.extend_from_slice(&SEQUENCE_FINAL);
        part2.extend_from_slice(&serialize(&VarInt(outputs.len() as u64)));
        for output in &outputs {
            part2.extend_from_slice(&serialize(output));
        }
        part2.extend_from_slice(&0u32.to_le_bytes());

        if let Some(payload) = &payload {
            part2.extend_from_slice(&serialize(&VarInt(payload.len() as u64)));
            part2.extend_from_slice(payload);
        }

        Ok(Self {
            part1,
            part2,
            extranonce_size,
            output_count: outputs.len(),
            output_value: outputs.iter().map(|o| o.value.to_sat()).sum(),
            has_witness_commitment: has_witness_commitment && payload.is_none(),
        })
    }

    /// Bytes before the extranonce.
    pub fn part1(&self) -> &[u8] {
        &self.part1
    }

    /// Bytes after the extranonce.
    pub fn part2(&self) -> &[u8] {
        &self.part2
    }

    pub fn extranonce_size(&self) -> usize {
        self.extranonce_size
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    /// Sum of all output values, in satoshis.
    pub fn output_value(&self) -> u64 {
        self.output_value
    }

    /// Complete coinbase in its txid (non-witness) serialization.
    pub fn assemble(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Vec<u8> {
        let mut tx = Vec::with_capacity(
            self.part1.len() + extranonce1.len() + extranonce2.len() + self.part2.len(),
        );
        tx.extend_from_slice(&self.part1);
        tx.extend_from_slice(extranonce1);
        tx.extend_from_slice(extranonce2);
        tx.extend_from_slice(&self.part2);
        tx
    }

    /// Double SHA-256 of an assembled coinbase, in internal byte order.
    pub fn hash(assembled: &[u8]) -> [u8; 32] {
        sha256d::Hash::hash(assembled).to_byte_array()
    }

    /// Serialization of an assembled coinbase as it goes into a block.
    ///
    /// With a witness commitment the coinbase must carry the witness reserved
    /// value: a single 32-byte zero item.
    pub fn block_form(&self, assembled: &[u8]) -> Vec<u8> {
        if !self.has_witness_commitment || assembled.len() < 8 {
            return assembled.to_vec();
        }

        let (body, lock_time) = assembled.split_at(assembled.len() - 4);
        let mut tx = Vec::with_capacity(assembled.len() + 36);
        tx.extend_from_slice(&body[..4]);
        tx.extend_from_slice(&[0x00, 0x01]);
        tx.extend_from_slice(&body[4..]);
        tx.push(0x01);
        tx.push(0x20);
        tx.extend_from_slice(&[0u8; 32]);
        tx.extend_from_slice(lock_time);
        tx
    }
}

fn build_outputs(
    template: &BlockTemplate,
    config: &CoinbaseConfig,
) -> Result<Vec<TxOut>, CoinbaseError> {
    let fixed: Vec<PayoutOutput> =
        config
            .payouts
            .outputs(template.height, template.curtime as u64, &config.chain)?;

    let fixed_total = checked_total(fixed.iter().map(|o| o.amount), template.coinbasevalue)?;
    let mut remaining = template.coinbasevalue - fixed_total;

    let mut payees = Vec::new();
    for payee in template.payees() {
        let script = match &payee.script {
            Some(script_hex) => ScriptBuf::from_bytes(
                hex::decode(script_hex).map_err(|e| template_error("payee script", e))?,
            ),
            None => config.chain.address_to_script(&payee.payee)?,
        };
        payees.push(txout(payee.amount, script));
    }

    if config.chain.masternode_payments_in_coinbase_value {
        let payee_total = checked_total(payees.iter().map(|o| o.value.to_sat()), remaining)?;
        remaining -= payee_total;
    }

    let mut outputs: Vec<TxOut> = fixed
        .into_iter()
        .map(|o| txout(o.amount, o.script))
        .collect();

    if let Some(fee) = &config.fee {
        let fee_amount = fee_amount(remaining, fee.basis_points);
        if fee_amount > 0 {
            outputs.push(txout(fee_amount, fee.script.clone()));
            remaining -= fee_amount;
        }
    }

    outputs.push(txout(remaining, config.pool_script.clone()));
    outputs.extend(payees);

    if let Some(commitment) = &template.default_witness_commitment {
        let script =
            hex::decode(commitment).map_err(|e| template_error("default_witness_commitment", e))?;
        outputs.push(txout(0, ScriptBuf::from_bytes(script)));
    }

    Ok(outputs)
}

/// Fee in satoshis, rounded half up.
pub fn fee_amount(reward: u64, basis_points: u16) -> u64 {
    ((reward as u128 * basis_points as u128 + 5_000) / 10_000) as u64
}

fn checked_total(
    amounts: impl Iterator<Item = u64>,
    available: u64,
) -> Result<u64, CoinbaseError> {
    let mut total: u64 = 0;
    for amount in amounts {
        total = total.saturating_add(amount);
    }
    if total > available {
        return Err(CoinbaseError::Overspent {
            needed: total,
            available,
        });
    }
    Ok(total)
}

fn txout(amount: u64, script: ScriptBuf) -> TxOut {
    TxOut {
        value: Amount::from_sat(amount),
        script_pubkey: script,
    }
}

fn template_error(field: &'static str, err: impl std::fmt::Display) -> CoinbaseError {
    CoinbaseError::Template {
        field,
        reason: err.to_string(),
    }
}

/// Script number encoding used for height and time in the scriptSig.
///
/// Values 1 through 16 use the single-byte `OP_1`..`OP_16` opcodes; anything
/// else is a length-prefixed little-endian push with room for a sign bit.
pub fn serialize_number(n: u64) -> Vec<u8> {
    if (1..=16).contains(&n) {
        return vec![0x50 + n as u8];
    }

    let mut buf = vec![0u8];
    let mut n = n;
    while n > 0x7f {
        buf.push((n & 0xff) as u8);
        n >>= 8;
    }
    buf.push(n as u8);
    buf[0] = (buf.len() - 1) as u8;
    buf
}

/// Length-prefixed push of a short string.
fn serialize_string(s: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(s.len() + 1);
    buf.push(s.len() as u8);
    buf.extend_from_slice(s);
    buf
}
