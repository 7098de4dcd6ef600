//! Share validation.
//!
//! A [`Share`] is one `mining.submit`. Validation runs an ordered list of
//! checks and stops at the first failure, recording exactly one
//! [`ShareError`]. Cheap checks come first; in particular the duplicate
//! check runs before any hashing so a replayed submission costs almost
//! nothing. The verdict is cached: validating again returns it unchanged
//! and touches nothing.
//!
//! Results are data on the share, never errors: the session reports them
//! to the miner and the pool reports the share onward.

use bitcoin::consensus::encode::{serialize, VarInt};
use serde::Serialize;

use crate::algorithm::{Algorithm, Submission};
use crate::job::{Coinbase, JobSet};
use crate::stratum_v1::ShareError;
use crate::target::hash_to_difficulty;
use crate::tracing::prelude::*;

/// How far in the future a submitted ntime may be, in seconds.
pub const MAX_TIME_DRIFT: u64 = 7200;

/// Shares below this fraction of the session difficulty are rejected.
const LOW_DIFFICULTY_TOLERANCE: f64 = 0.999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Unvalidated,
    Valid,
    Invalid,
}

/// Session context captured when the share arrives.
#[derive(Debug, Clone)]
pub struct ShareContext {
    pub subscription_id: String,
    pub extranonce1: Vec<u8>,

    /// Worker the session authorized, if any
    pub authorized_worker: Option<String>,

    pub session_difficulty: f64,

    /// Unix seconds
    pub submit_time: u64,
}

/// One submitted share and, once validated, its verdict.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    job_id: String,
    job_height: u32,
    submit_time: u64,
    subscription_id: String,
    miner_address: String,
    worker_name: String,
    share_diff: f64,
    stratum_diff: f64,
    expected_blocks: f64,
    is_valid_block: bool,
    validity: Validity,
    is_block_accepted: bool,
    error: Option<ShareError>,
    block_hex: Option<String>,
    block_id: Option<String>,
    block_tx_id: Option<String>,

    #[serde(skip)]
    submission: Submission,

    #[serde(skip)]
    extranonce1: Vec<u8>,

    #[serde(skip)]
    authorized_worker: Option<String>,
}

impl Share {
    pub fn new(submission: Submission, context: ShareContext) -> Self {
        let miner_address = submission
            .worker_name
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();

        Self {
            job_id: submission.job_id.clone(),
            job_height: 0,
            submit_time: context.submit_time,
            subscription_id: context.subscription_id,
            miner_address,
            worker_name: submission.worker_name.clone(),
            share_diff: 0.0,
            stratum_diff: context.session_difficulty,
            expected_blocks: 0.0,
            is_valid_block: false,
            validity: Validity::Unvalidated,
            is_block_accepted: false,
            error: None,
            block_hex: None,
            block_id: None,
            block_tx_id: None,
            submission,
            extranonce1: context.extranonce1,
            authorized_worker: context.authorized_worker,
        }
    }

    /// Validate against the live job set.
    ///
    /// Returns whether the share is valid. Only the first call does any
    /// work.
    pub fn validate(&mut self, jobs: &JobSet, algorithm: &dyn Algorithm) -> bool {
        if self.validity == Validity::Unvalidated {
            self.validity = match self.run_checks(jobs, algorithm) {
                Ok(()) => Validity::Valid,
                Err(error) => {
                    self.error = Some(error);
                    Validity::Invalid
                }
            };
        }
        self.validity == Validity::Valid
    }

    fn run_checks(&mut self, jobs: &JobSet, algorithm: &dyn Algorithm) -> Result<(), ShareError> {
        if self.authorized_worker.as_deref() != Some(self.worker_name.as_str()) {
            return Err(ShareError::UnauthorizedWorker);
        }

        let job = jobs.get(&self.job_id).ok_or(ShareError::StaleShare)?;
        self.job_height = job.height();

        let sub = &self.submission;
        if sub.nonce.len() != algorithm.nonce_size() {
            return Err(ShareError::IncorrectNonceSize);
        }
        if sub.extranonce2.len() != algorithm.extranonce2_size() {
            return Err(ShareError::IncorrectExtranonce2Size);
        }
        let time = if algorithm.submits_time() {
            Some(sub.time_u32().ok_or(ShareError::IncorrectTimeSize)?)
        } else {
            None
        };
        algorithm.check_proof_sizes(sub)?;

        if let Some(time) = time {
            if time < job.curtime() || time as u64 > self.submit_time + MAX_TIME_DRIFT {
                return Err(ShareError::TimeOutOfRange);
            }
        }

        if !job.register_submission(&algorithm.fingerprint(sub, &self.extranonce1)) {
            return Err(ShareError::DuplicateShare);
        }

        algorithm.check_structure(sub, &self.extranonce1)?;

        let coinbase = job.coinbase().assemble(&self.extranonce1, &sub.extranonce2);
        let merkle_root = job.merkle_tree().with_first_hash(Coinbase::hash(&coinbase));
        let header = job.header_with_root(merkle_root);

        let proof = algorithm.prove(&job, header, sub)?;

        self.share_diff = hash_to_difficulty(algorithm.diff1(), algorithm.multiplier(), proof.hash);
        self.is_valid_block = proof.hash <= job.target();

        if self.is_valid_block {
            let mut block = proof.block_header;
            block.extend_from_slice(&serialize(&VarInt(job.tx_count() as u64 + 1)));
            block.extend_from_slice(&job.coinbase().block_form(&coinbase));
            block.extend_from_slice(job.tx_data());

            self.block_hex = Some(hex::encode(block));
            self.block_id = Some(proof.block_id.clone());

            info!(
                block_id = %proof.block_id,
                height = job.height(),
                worker = %self.worker_name,
                "Winning nonce submitted"
            );
        }

        // A block can still be flagged here if the session difficulty is
        // above the network's; it stays a block either way.
        if self.share_diff / self.stratum_diff < LOW_DIFFICULTY_TOLERANCE {
            return Err(ShareError::LowDifficulty);
        }

        self.expected_blocks = self.stratum_diff / job.pool_difficulty();
        Ok(())
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Height of the referenced job; zero until validated against it.
    pub fn job_height(&self) -> u32 {
        self.job_height
    }

    pub fn submit_time(&self) -> u64 {
        self.submit_time
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Worker name up to the first `.`.
    pub fn miner_address(&self) -> &str {
        &self.miner_address
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Difficulty of the submitted hash, on the pool scale.
    pub fn share_diff(&self) -> f64 {
        self.share_diff
    }

    /// Session difficulty when the share was submitted.
    pub fn stratum_diff(&self) -> f64 {
        self.stratum_diff
    }

    pub fn expected_blocks(&self) -> f64 {
        self.expected_blocks
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub fn is_valid_share(&self) -> bool {
        self.validity == Validity::Valid
    }

    pub fn is_valid_block(&self) -> bool {
        self.is_valid_block
    }

    /// Override block validity, e.g. when the node rejects the block.
    pub fn set_valid_block(&mut self, valid: bool) {
        self.is_valid_block = valid;
    }

    pub fn is_block_accepted(&self) -> bool {
        self.is_block_accepted
    }

    pub fn error(&self) -> Option<ShareError> {
        self.error
    }

    /// Serialized candidate block, present only for valid blocks.
    pub fn block_hex(&self) -> Option<&str> {
        self.block_hex.as_deref()
    }

    pub fn block_id(&self) -> Option<&str> {
        self.block_id.as_deref()
    }

    /// Coinbase txid of the accepted block.
    pub fn block_tx_id(&self) -> Option<&str> {
        self.block_tx_id.as_deref()
    }

    /// Record the node's acceptance (or not) of the block.
    pub fn set_block_tx_id(&mut self, tx_id: Option<String>) {
        self.is_block_accepted = tx_id.is_some();
        self.block_tx_id = tx_id;
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }
}
