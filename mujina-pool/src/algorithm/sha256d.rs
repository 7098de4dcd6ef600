//! Bitcoin-style double SHA-256.

use bitcoin::hashes::{sha256d, Hash};
use serde_json::{json, Value};

use super::{Algorithm, Proof, SessionWork, Submission};
use crate::job::Job;
use crate::stratum_v1::messages::{hex_param, str_param, word_swap_hex};
use crate::stratum_v1::{
    JsonRpcMessage, ShareError, StratumResult, METHOD_NOTIFY, METHOD_SET_DIFFICULTY,
};
use crate::target::U256;

const EXTRANONCE2_SIZE: usize = 4;
const NONCE_SIZE: usize = 4;

/// Double SHA-256 over an 80-byte header.
///
/// Submit params: `[worker, job_id, extranonce2, ntime, nonce]`, all hex
/// except the first two.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256d;

impl Algorithm for Sha256d {
    fn name(&self) -> &'static str {
        "sha256d"
    }

    fn diff1(&self) -> U256 {
        U256::from(0xffffu64) << 208
    }

    fn multiplier(&self) -> f64 {
        1.0
    }

    fn extranonce2_size(&self) -> usize {
        EXTRANONCE2_SIZE
    }

    fn nonce_size(&self) -> usize {
        NONCE_SIZE
    }

    fn submits_time(&self) -> bool {
        true
    }

    fn header_tail(&self, _height: u32) -> [u8; 4] {
        [0; 4]
    }

    fn parse_submit(&self, params: &[Value]) -> StratumResult<Submission> {
        Ok(Submission {
            worker_name: str_param(params, 0, "worker name")?.to_string(),
            job_id: str_param(params, 1, "job id")?.to_string(),
            extranonce2: hex_param(params, 2, "extranonce2")?,
            time: Some(hex_param(params, 3, "ntime")?),
            nonce: hex_param(params, 4, "nonce")?,
            header_hash: None,
            mix_hash: None,
            mtp: None,
        })
    }

    fn fingerprint(&self, submission: &Submission, extranonce1: &[u8]) -> String {
        format!(
            "{}:{}:{}:{}",
            hex::encode(&submission.nonce),
            hex::encode(submission.time.as_deref().unwrap_or_default()),
            hex::encode(extranonce1),
            hex::encode(&submission.extranonce2),
        )
    }

    fn prove(
        &self,
        _job: &Job,
        header: [u8; 80],
        submission: &Submission,
    ) -> Result<Proof, ShareError> {
        let header = fill_header(header, submission)?;
        let hash = sha256d::Hash::hash(&header).to_byte_array();

        Ok(Proof {
            hash: U256::from_le_bytes(hash),
            block_header: header.to_vec(),
            block_id: block_id(&header),
        })
    }

    fn subscribe_result(&self, subscription_id: &str, extranonce1: &[u8]) -> Value {
        json!([
            [
                [METHOD_SET_DIFFICULTY, subscription_id],
                [METHOD_NOTIFY, subscription_id]
            ],
            hex::encode(extranonce1),
            EXTRANONCE2_SIZE
        ])
    }

    fn job_messages(&self, job: &Job, session: SessionWork<'_>, clean: bool) -> Vec<JsonRpcMessage> {
        vec![
            JsonRpcMessage::notification(METHOD_SET_DIFFICULTY, json!([session.difficulty])),
            JsonRpcMessage::notification(METHOD_NOTIFY, notify_params(job, clean)),
        ]
    }
}

/// `mining.notify` params for miners that build the coinbase themselves.
pub(super) fn notify_params(job: &Job, clean: bool) -> Value {
    json!([
        job.id(),
        word_swap_hex(job.prev_hash_le()),
        hex::encode(job.coinbase().part1()),
        hex::encode(job.coinbase().part2()),
        job.merkle_tree().steps_hex(),
        format!("{:08x}", job.version()),
        format!("{:08x}", job.bits()),
        format!("{:08x}", job.curtime()),
        clean
    ])
}

/// Write the submitted ntime and nonce into a header template.
pub(super) fn fill_header(
    mut header: [u8; 80],
    submission: &Submission,
) -> Result<[u8; 80], ShareError> {
    let time = submission.time_u32().ok_or(ShareError::IncorrectTimeSize)?;
    let nonce: [u8; 4] = submission
        .nonce
        .as_slice()
        .try_into()
        .map_err(|_| ShareError::IncorrectNonceSize)?;

    header[68..72].copy_from_slice(&time.to_le_bytes());
    header[76..80].copy_from_slice(&u32::from_be_bytes(nonce).to_le_bytes());
    Ok(header)
}

/// Display-order double SHA-256 of an 80-byte header.
pub(super) fn block_id(header: &[u8; 80]) -> String {
    let mut id = sha256d::Hash::hash(header).to_byte_array();
    id.reverse();
    hex::encode(id)
}
