//! Merkle Tree Proof, Zcoin's memory-hard proof of work.
//!
//! Work is handed out the SHA-256d way: miners build the coinbase, roll
//! extranonce2 and ntime, and search a 4-byte nonce. A solution adds three
//! fields to the submit, the MTP hash root, the MTP block and the MTP
//! proof, and those follow the 80-byte header when the block is
//! serialized. Evaluating MTP is left to an [`MtpVerifier`].

use std::fmt::Debug;

use serde_json::{json, Value};

use super::sha256d::{block_id, fill_header, notify_params};
use super::{Algorithm, Proof, SessionWork, Sha256d, Submission};
use crate::job::Job;
use crate::stratum_v1::messages::hex_param;
use crate::stratum_v1::{
    JsonRpcMessage, ShareError, StratumResult, METHOD_NOTIFY, METHOD_SET_TARGET,
};
use crate::target::{difficulty_to_target, target_to_hex, U256};

pub const HASH_ROOT_SIZE: usize = 16;

/// The MTP fields of a submitted solution, as sent by the miner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MtpSolution {
    pub hash_root: Vec<u8>,
    pub block: Vec<u8>,
    pub proof: Vec<u8>,
}

/// External MTP evaluation.
pub trait MtpVerifier: Debug + Send + Sync {
    /// Check `solution` against the finished 80-byte `header`.
    ///
    /// Returns the final hash in internal byte order if the solution is
    /// valid, `None` otherwise.
    fn verify(&self, header: &[u8; 80], solution: &MtpSolution) -> Option<[u8; 32]>;
}

/// MTP with a pluggable verifier.
///
/// Submit params: `[worker, job_id, extranonce2, ntime, nonce, hash_root,
/// mtp_block, mtp_proof]`, all hex except the first two.
#[derive(Debug)]
pub struct Mtp<V> {
    verifier: V,
}

impl<V: MtpVerifier> Mtp<V> {
    pub fn new(verifier: V) -> Self {
        Self { verifier }
    }
}

impl<V: MtpVerifier> Algorithm for Mtp<V> {
    fn name(&self) -> &'static str {
        "mtp"
    }

    fn diff1(&self) -> U256 {
        Sha256d.diff1()
    }

    fn multiplier(&self) -> f64 {
        256.0
    }

    fn extranonce2_size(&self) -> usize {
        Sha256d.extranonce2_size()
    }

    fn nonce_size(&self) -> usize {
        Sha256d.nonce_size()
    }

    fn submits_time(&self) -> bool {
        true
    }

    fn header_tail(&self, height: u32) -> [u8; 4] {
        Sha256d.header_tail(height)
    }

    fn parse_submit(&self, params: &[Value]) -> StratumResult<Submission> {
        let mut submission = Sha256d.parse_submit(params)?;
        submission.mtp = Some(MtpSolution {
            hash_root: hex_param(params, 5, "mtp hash root")?,
            block: hex_param(params, 6, "mtp block")?,
            proof: hex_param(params, 7, "mtp proof")?,
        });
        Ok(submission)
    }

    fn fingerprint(&self, submission: &Submission, extranonce1: &[u8]) -> String {
        Sha256d.fingerprint(submission, extranonce1)
    }

    fn check_proof_sizes(&self, submission: &Submission) -> Result<(), ShareError> {
        let solution = submission
            .mtp
            .as_ref()
            .ok_or(ShareError::IncorrectMtpHashRootSize)?;
        if solution.hash_root.len() != HASH_ROOT_SIZE {
            return Err(ShareError::IncorrectMtpHashRootSize);
        }
        if solution.block.is_empty() {
            return Err(ShareError::IncorrectMtpBlockSize);
        }
        if solution.proof.is_empty() {
            return Err(ShareError::IncorrectMtpProofSize);
        }
        Ok(())
    }

    fn prove(
        &self,
        _job: &Job,
        header: [u8; 80],
        submission: &Submission,
    ) -> Result<Proof, ShareError> {
        let header = fill_header(header, submission)?;
        let solution = submission
            .mtp
            .as_ref()
            .ok_or(ShareError::IncorrectMtpHashRootSize)?;
        let hash = self
            .verifier
            .verify(&header, solution)
            .ok_or(ShareError::ProofOfWorkVerifyFailed)?;

        let mut block_header = Vec::with_capacity(
            header.len() + solution.hash_root.len() + solution.block.len() + solution.proof.len(),
        );
        block_header.extend_from_slice(&header);
        block_header.extend_from_slice(&solution.hash_root);
        block_header.extend_from_slice(&solution.block);
        block_header.extend_from_slice(&solution.proof);

        Ok(Proof {
            hash: U256::from_le_bytes(hash),
            block_header,
            block_id: block_id(&header),
        })
    }

    fn subscribe_result(&self, subscription_id: &str, extranonce1: &[u8]) -> Value {
        Sha256d.subscribe_result(subscription_id, extranonce1)
    }

    fn job_messages(&self, job: &Job, session: SessionWork<'_>, clean: bool) -> Vec<JsonRpcMessage> {
        let share_target = target_to_hex(difficulty_to_target(
            self.diff1(),
            self.multiplier(),
            session.difficulty,
        ));

        vec![
            JsonRpcMessage::notification(METHOD_SET_TARGET, json!([share_target])),
            JsonRpcMessage::notification(METHOD_NOTIFY, notify_params(job, clean)),
        ]
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use bitcoin::hashes::{sha256d, Hash};

    use super::*;

    /// Stand-in for MTP: the hash root must be the first 16 bytes of the
    /// header's double SHA-256, and the final hash is double SHA-256 over
    /// header, block and proof.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FakeMtp;

    impl FakeMtp {
        pub fn hash_root(header: &[u8; 80]) -> Vec<u8> {
            sha256d::Hash::hash(header).to_byte_array()[..HASH_ROOT_SIZE].to_vec()
        }

        pub fn final_hash(header: &[u8; 80], solution: &MtpSolution) -> [u8; 32] {
            let mut buf = header.to_vec();
            buf.extend_from_slice(&solution.block);
            buf.extend_from_slice(&solution.proof);
            sha256d::Hash::hash(&buf).to_byte_array()
        }
    }

    impl MtpVerifier for FakeMtp {
        fn verify(&self, header: &[u8; 80], solution: &MtpSolution) -> Option<[u8; 32]> {
            (solution.hash_root == Self::hash_root(header))
                .then(|| Self::final_hash(header, solution))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::FakeMtp;
    use super::*;
    use crate::algorithm::test_util::header_for;
    use crate::job::template::test_data::{regtest, PREV_HASH};
    use crate::job::test_util::job_for;

    const EXTRANONCE1: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

    fn algorithm() -> Mtp<FakeMtp> {
        Mtp::new(FakeMtp)
    }

    fn submission(job: &Job, nonce: u32, solution: MtpSolution) -> Submission {
        Submission {
            worker_name: "w".into(),
            job_id: job.id().to_string(),
            extranonce2: vec![0, 0, 0, 7],
            time: Some(job.curtime().to_be_bytes().to_vec()),
            nonce: nonce.to_be_bytes().to_vec(),
            header_hash: None,
            mix_hash: None,
            mtp: Some(solution),
        }
    }

    fn solved(job: &Job, nonce: u32) -> Submission {
        let mut sub = submission(job, nonce, MtpSolution::default());
        let header = fill_header(header_for(job, &EXTRANONCE1, &sub.extranonce2), &sub).unwrap();
        sub.mtp = Some(MtpSolution {
            hash_root: FakeMtp::hash_root(&header),
            block: vec![0xb1; 64],
            proof: vec![0xc2; 48],
        });
        sub
    }

    #[test]
    fn test_parse_submit() {
        let params = vec![
            json!("addr.rig"),
            json!("0000000a"),
            json!("00000007"),
            json!("6553f100"),
            json!("deadbeef"),
            json!("11".repeat(HASH_ROOT_SIZE)),
            json!("b1b2"),
            json!("0xc3"),
        ];
        let sub = algorithm().parse_submit(&params).unwrap();
        assert_eq!(sub.time_u32(), Some(0x6553f100));
        assert_eq!(sub.nonce, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            sub.mtp,
            Some(MtpSolution {
                hash_root: vec![0x11; HASH_ROOT_SIZE],
                block: vec![0xb1, 0xb2],
                proof: vec![0xc3],
            })
        );
    }

    #[test]
    fn test_parse_submit_needs_mtp_fields() {
        let params = vec![
            json!("addr.rig"),
            json!("0000000a"),
            json!("00000007"),
            json!("6553f100"),
            json!("deadbeef"),
        ];
        assert!(algorithm().parse_submit(&params).is_err());
    }

    #[test]
    fn test_proof_field_sizes() {
        let algo = algorithm();
        let job = job_for(regtest(1, PREV_HASH, 0), &algo);
        let good = MtpSolution {
            hash_root: vec![0; HASH_ROOT_SIZE],
            block: vec![1],
            proof: vec![2],
        };
        assert_eq!(algo.check_proof_sizes(&submission(&job, 0, good.clone())), Ok(()));

        let cases = [
            (
                MtpSolution { hash_root: vec![0; 15], ..good.clone() },
                ShareError::IncorrectMtpHashRootSize,
            ),
            (
                MtpSolution { block: Vec::new(), ..good.clone() },
                ShareError::IncorrectMtpBlockSize,
            ),
            (
                MtpSolution { proof: Vec::new(), ..good.clone() },
                ShareError::IncorrectMtpProofSize,
            ),
        ];
        for (solution, error) in cases {
            assert_eq!(algo.check_proof_sizes(&submission(&job, 0, solution)), Err(error));
        }
    }

    #[test]
    fn test_non_hex_hash_root_fails_size_check() {
        let algo = algorithm();
        let params = vec![
            json!("addr.rig"),
            json!("0000000a"),
            json!("00000007"),
            json!("6553f100"),
            json!("deadbeef"),
            json!("x".repeat(2 * HASH_ROOT_SIZE)),
            json!("b1"),
            json!("c3"),
        ];
        let sub = algo.parse_submit(&params).unwrap();
        assert_eq!(
            algo.check_proof_sizes(&sub),
            Err(ShareError::IncorrectMtpHashRootSize)
        );
    }

    #[test]
    fn test_prove_appends_mtp_fields() {
        let algo = algorithm();
        let job = job_for(regtest(1000, PREV_HASH, 3), &algo);
        let sub = solved(&job, 0x01020304);
        let template = header_for(&job, &EXTRANONCE1, &sub.extranonce2);

        let proof = algo.prove(&job, template, &sub).unwrap();
        let solution = sub.mtp.as_ref().unwrap();
        let header: [u8; 80] = proof.block_header[..80].try_into().unwrap();

        assert_eq!(&header[76..80], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&header[68..72], &job.curtime().to_le_bytes());
        assert_eq!(&proof.block_header[80..96], solution.hash_root.as_slice());
        assert_eq!(&proof.block_header[96..160], solution.block.as_slice());
        assert_eq!(&proof.block_header[160..], solution.proof.as_slice());
        assert_eq!(proof.hash, U256::from_le_bytes(FakeMtp::final_hash(&header, solution)));
        assert_eq!(proof.block_id, block_id(&header));
    }

    #[test]
    fn test_prove_rejects_wrong_hash_root() {
        let algo = algorithm();
        let job = job_for(regtest(1000, PREV_HASH, 3), &algo);
        let mut sub = solved(&job, 1);
        if let Some(solution) = sub.mtp.as_mut() {
            solution.hash_root[0] ^= 0xff;
        }
        let template = header_for(&job, &EXTRANONCE1, &sub.extranonce2);
        assert_eq!(
            algo.prove(&job, template, &sub),
            Err(ShareError::ProofOfWorkVerifyFailed)
        );
    }

    #[test]
    fn test_job_messages() {
        let algo = algorithm();
        let job = job_for(regtest(1000, PREV_HASH, 2), &algo);
        let session = SessionWork {
            subscription_id: "00000001",
            extranonce1: &EXTRANONCE1,
            difficulty: 256.0,
        };
        let messages = algo.job_messages(&job, session, false);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].method(), Some(METHOD_SET_TARGET));
        assert_eq!(
            messages[0].params(),
            Some(&json!([target_to_hex(algo.diff1())]))
        );
        assert_eq!(messages[1].params(), Some(&notify_params(&job, false)));
    }
}
