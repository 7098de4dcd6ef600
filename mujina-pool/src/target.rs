//! Difficulty and target arithmetic.
//!
//! Targets and proof hashes are 256-bit unsigned integers. Hash bytes coming
//! out of SHA-256d are interpreted little-endian, matching how Bitcoin compares
//! a block hash against its target.
//!
//! Two difficulty scales are in play:
//!
//! - **Network difficulty** is `diff1 / target`, where `diff1` is the
//!   algorithm's maximum target.
//! - **Pool difficulty** is network difficulty times the algorithm's
//!   multiplier. This is what miners see in `mining.set_difficulty`.

use bitcoin::pow::{CompactTarget, Target};

pub use ruint::aliases::U256;

/// 2^32 as f64, for fixed-point scaling of fractional difficulties.
const TWO_POW_32: f64 = 4_294_967_296.0;

/// Decode a compact `nBits` value into a full-width target.
pub fn target_from_bits(bits: u32) -> U256 {
    let target = Target::from_compact(CompactTarget::from_consensus(bits));
    U256::from_le_bytes(target.to_le_bytes())
}

/// Parse a big-endian hex target as found in `getblocktemplate.target`.
pub fn target_from_hex(hex_str: &str) -> Option<U256> {
    let bytes = hex::decode(hex_str).ok()?;
    U256::try_from_be_slice(&bytes)
}

/// Convert a pool difficulty into a share target.
///
/// `target = diff1 / (difficulty / multiplier)`. The division is carried out
/// in 32.32 fixed point so that fractional difficulties (common on
/// testnets) still produce a sensible target. A non-positive or non-finite
/// difficulty maps to the easiest possible target.
pub fn difficulty_to_target(diff1: U256, multiplier: f64, difficulty: f64) -> U256 {
    let network_diff = difficulty / multiplier;
    if !network_diff.is_finite() || network_diff <= 0.0 {
        return U256::MAX;
    }

    // `as u128` saturates, so absurd difficulties clamp rather than wrap.
    let scaled = (network_diff * TWO_POW_32).round() as u128;
    if scaled == 0 {
        return U256::MAX;
    }
    let divisor = U256::from(scaled);

    match diff1.checked_shl(32) {
        Some(shifted) => shifted / divisor,
        None => (diff1 / divisor).checked_shl(32).unwrap_or(U256::MAX),
    }
}

/// Difficulty of a proof hash, on the pool scale.
///
/// Returns infinity for a zero hash.
pub fn hash_to_difficulty(diff1: U256, multiplier: f64, hash: U256) -> f64 {
    if hash.is_zero() {
        return f64::INFINITY;
    }
    u256_to_f64(diff1) / u256_to_f64(hash) * multiplier
}

/// Network difficulty implied by a target.
pub fn target_to_difficulty(diff1: U256, target: U256) -> f64 {
    hash_to_difficulty(diff1, 1.0, target)
}

/// Lossy conversion for ratios; exact below 2^53.
pub fn u256_to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .rev()
        .fold(0.0, |acc, &limb| acc * 18_446_744_073_709_551_616.0 + limb as f64)
}

/// Big-endian hex of a target, zero padded to 64 digits.
pub fn target_to_hex(target: U256) -> String {
    hex::encode(target.to_be_bytes::<32>())
}
