//! Proof-of-work primitives: header hashing, compact targets, work.
//!
//! A header's PoW hash is blake3 over its serialized bytes. The hash plays
//! two roles:
//!
//!   1. Difficulty: interpreted as a big-endian 256-bit integer, it must be
//!      less than or equal to the block's expanded target.
//!   2. Chain assignment: `hash mod G²` decides which of the `G × G` chains
//!      the block lands on, so miners grind the nonce until both conditions
//!      hold for the chain they are building a template for.
//!
//! Targets travel in the compact exponent/mantissa form (Bitcoin-style
//! `nBits`): the low 24 bits are the mantissa, the high byte is the size of
//! the full target in bytes. Difficulty adjustment expands the compact form
//! to a `BigUint`, scales it, and re-compacts.
//!
//! Cumulative chain weight uses `work(target) = floor(2^256 / (target + 1))`
//! saturated into a `u128`. Saturation only matters for targets below
//! 2^128, far beyond any realistic deployment of this chain.

use num_bigint::BigUint;
use num_traits::{One, Zero};

use crate::core::types::Hash256;

/// PoW hash of a serialized header
pub fn pow_hash(header_bytes: &[u8]) -> Hash256 {
    *blake3::hash(header_bytes).as_bytes()
}

// ─── Compact Target Codec ───────────────────────────────────────────

/// Expand a compact target to its 256-bit value.
/// Returns zero for a zero or negative-mantissa encoding.
pub fn compact_to_target(compact: u32) -> BigUint {
    let mantissa = compact & 0x007f_ffff;
    let exponent = (compact >> 24) as u32;
    if mantissa == 0 || compact & 0x0080_0000 != 0 {
        return BigUint::zero();
    }
    let mantissa = BigUint::from(mantissa);
    if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    }
}

/// Re-compact a 256-bit target. Lossy: only the top three bytes survive.
pub fn target_to_compact(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let bytes = target.to_bytes_be();
    let mut exponent = bytes.len() as u32;
    let mut mantissa: u32 = 0;
    for (i, b) in bytes.iter().take(3).enumerate() {
        mantissa |= (*b as u32) << (8 * (2 - i));
    }
    // Keep the sign bit clear; shift the mantissa down one byte if set
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        exponent += 1;
    }
    (exponent << 24) | mantissa
}

/// Work contributed by one block at the given compact target:
/// `floor(2^256 / (target + 1))`, saturating into u128.
pub fn target_to_work(compact: u32) -> u128 {
    let target = compact_to_target(compact);
    if target.is_zero() {
        return u128::MAX;
    }
    let numerator = BigUint::one() << 256u32;
    let work = numerator / (target + BigUint::one());
    let digits = work.to_u64_digits();
    match digits.len() {
        0 => 0,
        1 => digits[0] as u128,
        2 => (digits[1] as u128) << 64 | digits[0] as u128,
        _ => u128::MAX,
    }
}

// ─── PoW Check ──────────────────────────────────────────────────────

/// Does the hash, read as a big-endian integer, meet the compact target?
pub fn hash_meets_target(hash: &Hash256, compact: u32) -> bool {
    BigUint::from_bytes_be(hash) <= compact_to_target(compact)
}
