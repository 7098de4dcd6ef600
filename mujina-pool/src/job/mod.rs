//! Mining jobs.
//!
//! A [`Job`] is one block template turned into work: a coinbase split around
//! the extranonce, the merkle branch, and an 80-byte header template missing
//! only its merkle root (and, for some algorithms, ntime and nonce). All of
//! that is computed once when the job is built. The only thing that changes
//! afterwards is the set of submissions seen for it, used to reject
//! duplicates.
//!
//! The [`JobSet`] is the registry of jobs shares may still reference.

pub mod coinbase;
pub mod merkle;
pub mod payout;
pub mod scheduler;
pub mod template;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

pub use coinbase::{Coinbase, CoinbaseConfig, CoinbaseError, PoolFee};
pub use merkle::MerkleTree;
pub use payout::{NoPayouts, PayoutEntry, PayoutOutput, PayoutSchedule, PayoutTable};
pub use scheduler::{JobUpdate, Scheduler, SchedulerConfig, SchedulerHandle};
pub use template::BlockTemplate;

use crate::algorithm::Algorithm;
use crate::error::{Error, Result};
use crate::target::{target_from_bits, target_from_hex, target_to_difficulty, U256};

/// Current Unix time in seconds.
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Immutable unit of work derived from one block template.
#[derive(Debug)]
pub struct Job {
    id: String,
    height: u32,
    prev_hash: String,
    prev_hash_le: [u8; 32],
    version: u32,
    bits: u32,
    curtime: u32,
    target: U256,
    network_difficulty: f64,
    pool_difficulty: f64,
    coinbase: Coinbase,
    merkle_tree: MerkleTree,
    tx_data: Vec<u8>,
    tx_count: usize,
    header_template: [u8; 80],
    created_at: u64,

    /// Fingerprints of every submission seen for this job
    submitted: Mutex<HashSet<String>>,
}

impl Job {
    /// Build a job from `template`.
    ///
    /// Errors here mean the template or the pool configuration is unusable.
    pub fn new(
        id: String,
        template: &BlockTemplate,
        algorithm: &dyn Algorithm,
        coinbase_config: &CoinbaseConfig,
        now: u64,
    ) -> Result<Self> {
        let bits = template.bits_u32()?;
        let target = match &template.target {
            Some(hex_str) => target_from_hex(hex_str)
                .ok_or_else(|| Error::Template(format!("target {:?}", hex_str)))?,
            None => target_from_bits(bits),
        };
        if target.is_zero() {
            return Err(Error::Template("zero target".into()));
        }

        let network_difficulty = target_to_difficulty(algorithm.diff1(), target);
        let prev_hash_le = template.prev_hash_le()?;
        let extranonce_size = algorithm.extranonce1_size() + algorithm.extranonce2_size();
        let coinbase = Coinbase::build(template, coinbase_config, extranonce_size, now)?;
        let merkle_tree = MerkleTree::new(&template.tx_hashes_le()?);

        let mut header_template = [0u8; 80];
        header_template[0..4].copy_from_slice(&template.version.to_le_bytes());
        header_template[4..36].copy_from_slice(&prev_hash_le);
        // 36..68 is the merkle root
        header_template[68..72].copy_from_slice(&template.curtime.to_le_bytes());
        header_template[72..76].copy_from_slice(&bits.to_le_bytes());
        header_template[76..80].copy_from_slice(&algorithm.header_tail(template.height));

        Ok(Self {
            id,
            height: template.height,
            prev_hash: template.previousblockhash.clone(),
            prev_hash_le,
            version: template.version,
            bits,
            curtime: template.curtime,
            target,
            network_difficulty,
            pool_difficulty: network_difficulty * algorithm.multiplier(),
            coinbase,
            merkle_tree,
            tx_data: template.tx_data()?,
            tx_count: template.transactions.len(),
            header_template,
            created_at: now,
            submitted: Mutex::new(HashSet::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Previous block hash, display hex.
    pub fn prev_hash(&self) -> &str {
        &self.prev_hash
    }

    /// Previous block hash, internal byte order.
    pub fn prev_hash_le(&self) -> &[u8; 32] {
        &self.prev_hash_le
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn curtime(&self) -> u32 {
        self.curtime
    }

    /// Block target.
    pub fn target(&self) -> U256 {
        self.target
    }

    pub fn network_difficulty(&self) -> f64 {
        self.network_difficulty
    }

    /// Block difficulty on the pool's scale.
    pub fn pool_difficulty(&self) -> f64 {
        self.pool_difficulty
    }

    pub fn coinbase(&self) -> &Coinbase {
        &self.coinbase
    }

    pub fn merkle_tree(&self) -> &MerkleTree {
        &self.merkle_tree
    }

    /// Raw bytes of the non-coinbase transactions.
    pub fn tx_data(&self) -> &[u8] {
        &self.tx_data
    }

    /// Number of non-coinbase transactions.
    pub fn tx_count(&self) -> usize {
        self.tx_count
    }

    /// Unix time the job was built.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Header template with `merkle_root` filled in.
    pub fn header_with_root(&self, merkle_root: [u8; 32]) -> [u8; 80] {
        let mut header = self.header_template;
        header[36..68].copy_from_slice(&merkle_root);
        header
    }

    /// Record a submission fingerprint.
    ///
    /// Returns false if it was already recorded, meaning the share is a
    /// duplicate. The check and insert are atomic.
    pub fn register_submission(&self, fingerprint: &str) -> bool {
        let mut submitted = self.submitted.lock();
        if submitted.contains(fingerprint) {
            return false;
        }
        submitted.insert(fingerprint.to_string())
    }

    pub fn submission_count(&self) -> usize {
        self.submitted.lock().len()
    }
}

/// Registry of jobs that shares may reference.
///
/// Cloning gives another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct JobSet {
    inner: Arc<RwLock<JobSetInner>>,
}

#[derive(Debug, Default)]
struct JobSetInner {
    jobs: HashMap<String, Arc<Job>>,
    current: Option<Arc<Job>>,
}

impl JobSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.inner.read().jobs.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().jobs.contains_key(id)
    }

    /// Most recently added job.
    pub fn current(&self) -> Option<Arc<Job>> {
        self.inner.read().current.clone()
    }

    /// Add `job` and make it current.
    ///
    /// A job for a new block invalidates every earlier job.
    pub fn insert(&self, job: Arc<Job>, is_new_block: bool) {
        let mut inner = self.inner.write();
        if is_new_block {
            inner.jobs.clear();
        }
        inner.jobs.insert(job.id().to_string(), job.clone());
        inner.current = Some(job);
    }

    pub fn len(&self) -> usize {
        self.inner.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::algorithm::Sha256d;
    use crate::job::template::test_data::{regtest, NEXT_PREV_HASH, PREV_HASH};
    use serde_json::json;

    #[test]
    fn test_job_fields() {
        let job = job_for(regtest(1000, PREV_HASH, 2), &Sha256d);
        assert_eq!(job.height(), 1000);
        assert_eq!(job.bits(), 0x207fffff);
        assert_eq!(job.target(), target_from_bits(0x207fffff));
        assert_eq!(job.tx_count(), 2);
        assert_eq!(job.tx_data().len(), 120);
        assert_eq!(job.prev_hash(), PREV_HASH);
        // Regtest difficulty is far below 1.
        assert!(job.network_difficulty() < 1e-9);
        assert_eq!(job.pool_difficulty(), job.network_difficulty());
    }

    #[test]
    fn test_header_template_layout() {
        let job = job_for(regtest(1000, PREV_HASH, 0), &Sha256d);
        let header = job.header_with_root([0x77; 32]);
        assert_eq!(&header[0..4], &0x20000000u32.to_le_bytes());
        assert_eq!(&header[4..36], job.prev_hash_le());
        assert_eq!(&header[36..68], &[0x77; 32]);
        assert_eq!(&header[68..72], &job.curtime().to_le_bytes());
        assert_eq!(&header[72..76], &[0xff, 0xff, 0x7f, 0x20]);
        assert_eq!(&header[76..80], &[0; 4]);
    }

    #[test]
    fn test_template_target_overrides_bits() {
        let mut template = regtest(1000, PREV_HASH, 0);
        template.target =
            Some("00000000ffff0000000000000000000000000000000000000000000000000000".into());
        let job = job_for(template, &Sha256d);
        assert_eq!(job.target(), U256::from(0xffffu64) << 208);
        assert!((job.network_difficulty() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_bad_template_is_an_error() {
        let template = BlockTemplate::from_json(json!({
            "version": 1,
            "previousblockhash": PREV_HASH,
            "coinbasevalue": 1,
            "curtime": 1,
            "bits": "nothex",
            "height": 1,
        }))
        .unwrap();
        let result = Job::new("1".into(), &template, &Sha256d, &coinbase_config(), 1);
        assert!(matches!(result, Err(Error::Template(_))));
    }

    #[test]
    fn test_register_submission() {
        let job = job_for(regtest(1000, PREV_HASH, 0), &Sha256d);
        assert!(job.register_submission("a:b"));
        assert!(!job.register_submission("a:b"));
        assert!(job.register_submission("a:c"));
        assert_eq!(job.submission_count(), 2);
    }

    #[test]
    fn test_job_set_new_block_clears() {
        let jobs = JobSet::new();
        let first = job_with_id("00000001", regtest(1000, PREV_HASH, 0), &Sha256d);
        let refresh = job_with_id("00000002", regtest(1000, PREV_HASH, 1), &Sha256d);
        let next = job_with_id("00000003", regtest(1001, NEXT_PREV_HASH, 0), &Sha256d);

        jobs.insert(first, true);
        jobs.insert(refresh, false);
        assert!(jobs.contains("00000001"));
        assert!(jobs.contains("00000002"));
        assert_eq!(jobs.current().unwrap().id(), "00000002");

        jobs.insert(next, true);
        assert_eq!(jobs.len(), 1);
        assert!(jobs.get("00000001").is_none());
        assert_eq!(jobs.current().unwrap().id(), "00000003");
    }
}
