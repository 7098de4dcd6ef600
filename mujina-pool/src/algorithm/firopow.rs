//! FiroPow, Firo's ProgPow variant.
//!
//! Unlike SHA-256d, miners never see the coinbase. The server folds the
//! session's extranonce1 into the coinbase, hashes the 80-byte header
//! template (which ends in the block height rather than a nonce) and sends
//! that header hash out. Miners search 8-byte nonces and return the nonce
//! together with the header hash they used and the ProgPow mix hash.
//!
//! The ProgPow hash itself is supplied by a [`ProgPowVerifier`].

use std::fmt::Debug;

use bitcoin::hashes::{sha256d, Hash};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};

use super::{Algorithm, Proof, SessionWork, Submission};
use crate::job::{Coinbase, Job};
use crate::stratum_v1::messages::{hex_param, str_param};
use crate::stratum_v1::{
    JsonRpcMessage, ShareError, StratumResult, METHOD_NOTIFY, METHOD_SET_TARGET,
};
use crate::target::{difficulty_to_target, target_to_hex, U256};

/// Blocks per ProgPow epoch.
pub const EPOCH_LENGTH: u32 = 1300;

const NONCE_SIZE: usize = 8;
const HASH_SIZE: usize = 32;

/// External ProgPow evaluation.
pub trait ProgPowVerifier: Debug + Send + Sync {
    /// Evaluate ProgPow for `height` over `header_hash` and `nonce`.
    ///
    /// Returns the final hash (big-endian) if `mix_hash` is the correct mix
    /// for these inputs, `None` otherwise.
    fn verify(
        &self,
        height: u32,
        header_hash: &[u8; 32],
        nonce: u64,
        mix_hash: &[u8; 32],
    ) -> Option<[u8; 32]>;
}

/// FiroPow with a pluggable ProgPow verifier.
///
/// Submit params: `[worker, job_id, nonce, header_hash, mix_hash]`.
#[derive(Debug)]
pub struct FiroPow<V> {
    verifier: V,
    seed_cache: Mutex<Option<(u32, [u8; 32])>>,
}

impl<V: ProgPowVerifier> FiroPow<V> {
    pub fn new(verifier: V) -> Self {
        Self {
            verifier,
            seed_cache: Mutex::new(None),
        }
    }

    /// Seed hash for the epoch containing `height`: Keccak-256 applied
    /// `epoch` times to 32 zero bytes.
    pub fn seed_hash(&self, height: u32) -> [u8; 32] {
        let epoch = height / EPOCH_LENGTH;
        let mut cache = self.seed_cache.lock();
        if let Some((cached_epoch, seed)) = *cache {
            if cached_epoch == epoch {
                return seed;
            }
        }

        let seed = compute_seed_hash(epoch);
        *cache = Some((epoch, seed));
        seed
    }

    /// Header hash a session with `extranonce1` mines on for `job`.
    pub fn header_hash(&self, job: &Job, extranonce1: &[u8]) -> [u8; 32] {
        let coinbase = job.coinbase().assemble(extranonce1, &[]);
        let root = job.merkle_tree().with_first_hash(Coinbase::hash(&coinbase));
        header_hash(&job.header_with_root(root))
    }
}

fn compute_seed_hash(epoch: u32) -> [u8; 32] {
    let mut seed = [0u8; 32];
    for _ in 0..epoch {
        seed = Keccak256::digest(seed).into();
    }
    seed
}

/// Reversed double SHA-256 of the 80-byte header template.
fn header_hash(header: &[u8; 80]) -> [u8; 32] {
    let mut hash = sha256d::Hash::hash(header).to_byte_array();
    hash.reverse();
    hash
}

impl<V: ProgPowVerifier> Algorithm for FiroPow<V> {
    fn name(&self) -> &'static str {
        "firopow"
    }

    fn diff1(&self) -> U256 {
        U256::from(0xffffu64) << 208
    }

    fn multiplier(&self) -> f64 {
        256.0
    }

    fn extranonce2_size(&self) -> usize {
        0
    }

    fn nonce_size(&self) -> usize {
        NONCE_SIZE
    }

    fn submits_time(&self) -> bool {
        false
    }

    fn header_tail(&self, height: u32) -> [u8; 4] {
        height.to_le_bytes()
    }

    fn parse_submit(&self, params: &[Value]) -> StratumResult<Submission> {
        Ok(Submission {
            worker_name: str_param(params, 0, "worker name")?.to_string(),
            job_id: str_param(params, 1, "job id")?.to_string(),
            extranonce2: Vec::new(),
            time: None,
            nonce: hex_param(params, 2, "nonce")?,
            header_hash: Some(hex_param(params, 3, "header hash")?),
            mix_hash: Some(hex_param(params, 4, "mix hash")?),
            mtp: None,
        })
    }

    fn fingerprint(&self, submission: &Submission, extranonce1: &[u8]) -> String {
        format!(
            "{}:{}",
            hex::encode(&submission.nonce),
            hex::encode(extranonce1)
        )
    }

    fn check_proof_sizes(&self, submission: &Submission) -> Result<(), ShareError> {
        if submission.header_hash.as_ref().map(Vec::len) != Some(HASH_SIZE) {
            return Err(ShareError::IncorrectHeaderHashSize);
        }
        if submission.mix_hash.as_ref().map(Vec::len) != Some(HASH_SIZE) {
            return Err(ShareError::IncorrectMixHashSize);
        }
        Ok(())
    }

    fn check_structure(
        &self,
        submission: &Submission,
        extranonce1: &[u8],
    ) -> Result<(), ShareError> {
        // The nonce space is partitioned per session by an extranonce1
        // prefix.
        if !submission.nonce.starts_with(extranonce1) {
            return Err(ShareError::IncorrectNoncePrefix);
        }
        Ok(())
    }

    fn prove(
        &self,
        job: &Job,
        header: [u8; 80],
        submission: &Submission,
    ) -> Result<Proof, ShareError> {
        let expected = header_hash(&header);
        let claimed = submission.header_hash.as_deref().unwrap_or_default();
        if claimed != expected.as_slice() {
            return Err(ShareError::IncorrectHeaderHash);
        }

        let nonce: [u8; 8] = submission
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| ShareError::IncorrectNonceSize)?;
        let nonce = u64::from_be_bytes(nonce);
        let mix: [u8; 32] = submission
            .mix_hash
            .as_deref()
            .unwrap_or_default()
            .try_into()
            .map_err(|_| ShareError::IncorrectMixHashSize)?;

        let final_hash = self
            .verifier
            .verify(job.height(), &expected, nonce, &mix)
            .ok_or(ShareError::ProofOfWorkVerifyFailed)?;

        let mut mix_le = mix;
        mix_le.reverse();

        let mut block_header = Vec::with_capacity(80 + NONCE_SIZE + HASH_SIZE);
        block_header.extend_from_slice(&header);
        block_header.extend_from_slice(&nonce.to_le_bytes());
        block_header.extend_from_slice(&mix_le);

        let mut block_id = sha256d::Hash::hash(&block_header).to_byte_array();
        block_id.reverse();

        Ok(Proof {
            hash: U256::from_be_bytes(final_hash),
            block_header,
            block_id: hex::encode(block_id),
        })
    }

    fn subscribe_result(&self, subscription_id: &str, extranonce1: &[u8]) -> Value {
        json!([subscription_id, hex::encode(extranonce1)])
    }

    fn job_messages(&self, job: &Job, session: SessionWork<'_>, clean: bool) -> Vec<JsonRpcMessage> {
        let share_target = target_to_hex(difficulty_to_target(
            self.diff1(),
            self.multiplier(),
            session.difficulty,
        ));

        let notify = json!([
            job.id(),
            hex::encode(self.header_hash(job, session.extranonce1)),
            hex::encode(self.seed_hash(job.height())),
            share_target,
            clean,
            job.height(),
            format!("{:08x}", job.bits())
        ]);

        vec![
            JsonRpcMessage::notification(METHOD_SET_TARGET, json!([share_target])),
            JsonRpcMessage::notification(METHOD_NOTIFY, notify),
        ]
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::FakeProgPow;
    use super::*;
    use crate::algorithm::test_util::header_for;
    use crate::job::template::test_data::{regtest, PREV_HASH};
    use crate::job::test_util::job_for;

    const EXTRANONCE1: [u8; 4] = [0xaa, 0xbb, 0xcc, 0xdd];

    fn algorithm() -> FiroPow<FakeProgPow> {
        FiroPow::new(FakeProgPow)
    }

    fn submission(job: &Job, header_hash: [u8; 32], nonce: u64) -> Submission {
        Submission {
            worker_name: "w".into(),
            job_id: job.id().to_string(),
            extranonce2: Vec::new(),
            time: None,
            nonce: nonce.to_be_bytes().to_vec(),
            header_hash: Some(header_hash.to_vec()),
            mix_hash: Some(header_hash.to_vec()),
            mtp: None,
        }
    }

    #[test]
    fn test_seed_hash() {
        let algo = algorithm();
        assert_eq!(algo.seed_hash(0), [0u8; 32]);
        assert_eq!(algo.seed_hash(EPOCH_LENGTH - 1), [0u8; 32]);

        // keccak256 of 32 zero bytes
        assert_eq!(
            hex::encode(algo.seed_hash(EPOCH_LENGTH)),
            "290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563"
        );

        let two = algo.seed_hash(2 * EPOCH_LENGTH + 5);
        assert_eq!(two, compute_seed_hash(2));
        assert_eq!(algo.seed_hash(2 * EPOCH_LENGTH), two);
    }

    #[test]
    fn test_header_template_ends_with_height() {
        let algo = algorithm();
        let job = job_for(regtest(1234, PREV_HASH, 2), &algo);
        let header = header_for(&job, &EXTRANONCE1, &[]);
        assert_eq!(&header[76..80], &1234u32.to_le_bytes());
        assert_eq!(algo.header_hash(&job, &EXTRANONCE1), header_hash(&header));
    }

    #[test]
    fn test_parse_submit() {
        let params = vec![
            json!("addr.rig"),
            json!("00000001"),
            json!("0xaabbccdd00000001"),
            json!("11".repeat(32)),
            json!("22".repeat(32)),
        ];
        let sub = algorithm().parse_submit(&params).unwrap();
        assert_eq!(sub.nonce, vec![0xaa, 0xbb, 0xcc, 0xdd, 0, 0, 0, 1]);
        assert_eq!(sub.header_hash, Some(vec![0x11; 32]));
        assert_eq!(sub.time, None);
    }

    #[test]
    fn test_non_hex_proof_fields_fail_size_checks() {
        let algo = algorithm();
        let params = vec![
            json!("addr.rig"),
            json!("00000001"),
            json!("aabbccdd00000001"),
            json!("g".repeat(64)),
            json!("22".repeat(32)),
        ];
        let sub = algo.parse_submit(&params).unwrap();
        assert_eq!(
            algo.check_proof_sizes(&sub),
            Err(ShareError::IncorrectHeaderHashSize)
        );

        let mut params = params;
        params[3] = json!("11".repeat(32));
        params[4] = json!("2".repeat(63));
        let sub = algo.parse_submit(&params).unwrap();
        assert_eq!(
            algo.check_proof_sizes(&sub),
            Err(ShareError::IncorrectMixHashSize)
        );
    }

    #[test]
    fn test_proof_field_sizes() {
        let algo = algorithm();
        let job = job_for(regtest(1, PREV_HASH, 0), &algo);
        let mut sub = submission(&job, [0; 32], 0);
        assert_eq!(algo.check_proof_sizes(&sub), Ok(()));

        sub.header_hash = Some(vec![0; 31]);
        assert_eq!(
            algo.check_proof_sizes(&sub),
            Err(ShareError::IncorrectHeaderHashSize)
        );

        sub.header_hash = Some(vec![0; 32]);
        sub.mix_hash = Some(vec![0; 33]);
        assert_eq!(
            algo.check_proof_sizes(&sub),
            Err(ShareError::IncorrectMixHashSize)
        );
    }

    #[test]
    fn test_nonce_prefix() {
        let algo = algorithm();
        let job = job_for(regtest(1, PREV_HASH, 0), &algo);
        let good = submission(&job, [0; 32], 0xaabbccdd_00000001);
        let bad = submission(&job, [0; 32], 0x00000001_aabbccdd);
        assert_eq!(algo.check_structure(&good, &EXTRANONCE1), Ok(()));
        assert_eq!(
            algo.check_structure(&bad, &EXTRANONCE1),
            Err(ShareError::IncorrectNoncePrefix)
        );
    }

    #[test]
    fn test_prove() {
        let algo = algorithm();
        let job = job_for(regtest(1000, PREV_HASH, 3), &algo);
        let header = header_for(&job, &EXTRANONCE1, &[]);
        let hh = header_hash(&header);
        let nonce = 0xaabbccdd_00000042;

        let proof = algo.prove(&job, header, &submission(&job, hh, nonce)).unwrap();
        assert_eq!(
            proof.hash,
            U256::from_be_bytes(FakeProgPow::final_hash(&hh, nonce))
        );
        assert_eq!(proof.block_header.len(), 120);
        assert_eq!(&proof.block_header[80..88], &nonce.to_le_bytes());
        let mut mix_le = hh;
        mix_le.reverse();
        assert_eq!(&proof.block_header[88..], &mix_le);
    }

    #[test]
    fn test_prove_rejects_wrong_header_hash() {
        let algo = algorithm();
        let job = job_for(regtest(1000, PREV_HASH, 3), &algo);
        let header = header_for(&job, &EXTRANONCE1, &[]);
        // Header hash computed for a different session.
        let other = algo.header_hash(&job, &[1, 2, 3, 4]);

        assert_eq!(
            algo.prove(&job, header, &submission(&job, other, 1)),
            Err(ShareError::IncorrectHeaderHash)
        );
    }

    #[test]
    fn test_prove_rejects_bad_mix() {
        let algo = algorithm();
        let job = job_for(regtest(1000, PREV_HASH, 3), &algo);
        let header = header_for(&job, &EXTRANONCE1, &[]);
        let mut sub = submission(&job, header_hash(&header), 1);
        sub.mix_hash = Some(vec![0x55; 32]);

        assert_eq!(
            algo.prove(&job, header, &sub),
            Err(ShareError::ProofOfWorkVerifyFailed)
        );
    }

    #[test]
    fn test_job_messages() {
        let algo = algorithm();
        let job = job_for(regtest(1000, PREV_HASH, 3), &algo);
        let session = SessionWork {
            subscription_id: "00000001",
            extranonce1: &EXTRANONCE1,
            difficulty: 256.0,
        };
        let messages = algo.job_messages(&job, session, false);

        assert_eq!(messages[0].method(), Some(METHOD_SET_TARGET));
        // Pool difficulty 256 is network difficulty 1.
        let target = "00000000ffff0000000000000000000000000000000000000000000000000000";
        assert_eq!(messages[0].params(), Some(&json!([target])));

        let params = messages[1].params().unwrap();
        assert_eq!(params[0], json!(job.id()));
        assert_eq!(
            params[1],
            json!(hex::encode(algo.header_hash(&job, &EXTRANONCE1)))
        );
        assert_eq!(params[2], json!(hex::encode([0u8; 32])));
        assert_eq!(params[3], json!(target));
        assert_eq!(params[4], json!(false));
        assert_eq!(params[5], json!(1000));
        assert_eq!(params[6], json!("207fffff"));
    }

    #[test]
    fn test_subscribe_result() {
        assert_eq!(
            algorithm().subscribe_result("00000002", &EXTRANONCE1),
            json!(["00000002", "aabbccdd"])
        );
    }
}
