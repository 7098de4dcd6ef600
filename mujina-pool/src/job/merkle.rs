//! Merkle branch for a block whose coinbase changes per share.
//!
//! Every share carries its own extranonce, so the coinbase hash (leaf 0) is
//! different each time while the other transactions stay fixed. We keep only
//! the left-edge siblings of the tree: hashing them onto a coinbase hash in
//! order yields the root in O(log n). The same list goes out to miners in
//! `mining.notify`, so they can do the identical climb.

use bitcoin::hashes::{sha256d, Hash};

/// Left-edge merkle branch over a block's non-coinbase transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    steps: Vec<[u8; 32]>,
}

impl MerkleTree {
    /// Build from the non-coinbase transaction hashes in block order.
    ///
    /// Hashes are in internal (little-endian) byte order.
    pub fn new(tx_hashes: &[[u8; 32]]) -> Self {
        let mut steps = Vec::new();
        let mut level: Vec<[u8; 32]> = tx_hashes.to_vec();

        // `level` holds every node of the current tree level except the
        // leftmost, which is the one that depends on the coinbase.
        while !level.is_empty() {
            steps.push(level[0]);

            // With the coinbase-side node included the level has
            // `level.len() + 1` nodes; odd counts duplicate the last.
            if (level.len() + 1) % 2 == 1 {
                let last = level[level.len() - 1];
                level.push(last);
            }

            level = level[1..]
                .chunks(2)
                .map(|pair| merkle_join(&pair[0], &pair[1]))
                .collect();
        }

        Self { steps }
    }

    /// Sibling hashes from the leaves upward.
    pub fn steps(&self) -> &[[u8; 32]] {
        &self.steps
    }

    /// Steps as hex strings, in the byte order miners expect.
    pub fn steps_hex(&self) -> Vec<String> {
        self.steps.iter().map(hex::encode).collect()
    }

    /// Compute the merkle root with `first_hash` as leaf 0.
    pub fn with_first_hash(&self, first_hash: [u8; 32]) -> [u8; 32] {
        self.steps
            .iter()
            .fold(first_hash, |acc, step| merkle_join(&acc, step))
    }
}

/// Double SHA-256 of two concatenated nodes.
pub fn merkle_join(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left);
    buf[32..].copy_from_slice(right);
    sha256d::Hash::hash(&buf).to_byte_array()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    // Straightforward full-tree computation to compare against.
    fn naive_root(leaves: &[[u8; 32]]) -> [u8; 32] {
        let mut level = leaves.to_vec();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(level[level.len() - 1]);
            }
            level = level
                .chunks(2)
                .map(|pair| merkle_join(&pair[0], &pair[1]))
                .collect();
        }
        level[0]
    }

    fn leaf(i: u8) -> [u8; 32] {
        sha256d::Hash::hash(&[i]).to_byte_array()
    }

    #[test]
    fn test_no_transactions() {
        let tree = MerkleTree::new(&[]);
        assert!(tree.steps().is_empty());
        assert_eq!(tree.with_first_hash(leaf(0)), leaf(0));
    }

    #[test_case(1; "one")]
    #[test_case(2; "two")]
    #[test_case(3; "three")]
    #[test_case(4; "four")]
    #[test_case(6; "six")]
    #[test_case(7; "seven")]
    #[test_case(15; "fifteen")]
    #[test_case(32; "thirty_two")]
    fn test_matches_full_tree(tx_count: u8) {
        let txs: Vec<[u8; 32]> = (1..=tx_count).map(leaf).collect();
        let tree = MerkleTree::new(&txs);

        let coinbase = leaf(0);
        let mut all = vec![coinbase];
        all.extend_from_slice(&txs);

        assert_eq!(tree.with_first_hash(coinbase), naive_root(&all));
    }

    #[test]
    fn test_branch_length_is_logarithmic() {
        let txs: Vec<[u8; 32]> = (1..=100).map(leaf).collect();
        let tree = MerkleTree::new(&txs);
        // 101 leaves need 7 levels.
        assert_eq!(tree.steps().len(), 7);
    }

    #[test]
    fn test_first_step_is_first_transaction() {
        let txs = [leaf(1), leaf(2), leaf(3)];
        let tree = MerkleTree::new(&txs);
        assert_eq!(tree.steps()[0], leaf(1));
        assert_eq!(tree.steps()[1], merkle_join(&leaf(2), &leaf(3)));
        assert_eq!(tree.steps_hex()[0], hex::encode(leaf(1)));
    }
}
