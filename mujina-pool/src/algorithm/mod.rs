//! Proof-of-work algorithm capabilities.
//!
//! Everything that differs between mining algorithms sits behind the
//! [`Algorithm`] trait: field sizes, the layout of `mining.submit`, how a
//! header is finished and proven, the scale of difficulty, and the shape of
//! the messages that hand work to miners. Jobs, shares and sessions are
//! written once against this trait and the configured algorithm is chosen at
//! startup.
//!
//! Three implementations exist:
//!
//! - [`Sha256d`]: Bitcoin-style double SHA-256 with extranonce2 rolling.
//! - [`FiroPow`]: ProgPow variant where the server hands out a header hash
//!   and the final hash comes from an external [`ProgPowVerifier`].
//! - [`Mtp`]: SHA-256d style work whose solutions carry a Merkle Tree
//!   Proof, checked by an external [`MtpVerifier`].

mod firopow;
mod mtp;
mod sha256d;

use std::fmt::Debug;

use serde_json::Value;

pub use firopow::{FiroPow, ProgPowVerifier, EPOCH_LENGTH};
pub use mtp::{Mtp, MtpSolution, MtpVerifier};
pub use sha256d::Sha256d;

use crate::job::Job;
use crate::stratum_v1::{JsonRpcMessage, ShareError, StratumResult};
use crate::target::U256;

/// Fields of a `mining.submit`, decoded from hex.
///
/// Byte strings keep the order they had on the wire; sizes are checked later
/// so that a wrong size is a share rejection rather than a protocol error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    pub worker_name: String,
    pub job_id: String,
    pub extranonce2: Vec<u8>,

    /// Big-endian ntime, for algorithms where miners roll it
    pub time: Option<Vec<u8>>,

    /// Big-endian nonce
    pub nonce: Vec<u8>,

    /// Header hash claimed by the miner (big-endian)
    pub header_hash: Option<Vec<u8>>,

    /// Mix hash (big-endian)
    pub mix_hash: Option<Vec<u8>>,

    pub mtp: Option<MtpSolution>,
}

impl Submission {
    /// The submitted ntime as an integer, if it has the right size.
    pub fn time_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.time.as_deref()?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

/// Outcome of proving a share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    /// Hash compared against targets
    pub hash: U256,

    /// Header as serialized at the start of a block, with any auxiliary
    /// proof fields
    pub block_header: Vec<u8>,

    /// Display-order hex id of the block this share would produce
    pub block_id: String,
}

/// Per-session values an algorithm needs to render work.
#[derive(Debug, Clone, Copy)]
pub struct SessionWork<'a> {
    pub subscription_id: &'a str,
    pub extranonce1: &'a [u8],
    pub difficulty: f64,
}

pub trait Algorithm: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Target at network difficulty 1.
    fn diff1(&self) -> U256;

    /// Pool difficulty units per network difficulty unit.
    fn multiplier(&self) -> f64;

    /// Bytes of extranonce1 assigned per session.
    fn extranonce1_size(&self) -> usize {
        4
    }

    /// Bytes of extranonce2 miners roll; zero if they roll none.
    fn extranonce2_size(&self) -> usize;

    fn nonce_size(&self) -> usize;

    /// Whether miners submit their own ntime.
    fn submits_time(&self) -> bool;

    /// Last four bytes of the header template (nonce slot or height).
    fn header_tail(&self, height: u32) -> [u8; 4];

    /// Decode `mining.submit` params.
    fn parse_submit(&self, params: &[Value]) -> StratumResult<Submission>;

    /// Key under which a submission is recorded for duplicate detection.
    fn fingerprint(&self, submission: &Submission, extranonce1: &[u8]) -> String;

    /// Size checks on algorithm-specific proof fields.
    fn check_proof_sizes(&self, _submission: &Submission) -> Result<(), ShareError> {
        Ok(())
    }

    /// Structural checks that run after duplicate detection.
    fn check_structure(
        &self,
        _submission: &Submission,
        _extranonce1: &[u8],
    ) -> Result<(), ShareError> {
        Ok(())
    }

    /// Finish `header` (the job's template with this share's merkle root)
    /// and verify the proof of work.
    fn prove(
        &self,
        job: &Job,
        header: [u8; 80],
        submission: &Submission,
    ) -> Result<Proof, ShareError>;

    /// Result of a `mining.subscribe` request.
    fn subscribe_result(&self, subscription_id: &str, extranonce1: &[u8]) -> Value;

    /// Messages that hand `job` to a session, difficulty first.
    fn job_messages(&self, job: &Job, session: SessionWork<'_>, clean: bool) -> Vec<JsonRpcMessage>;
}
