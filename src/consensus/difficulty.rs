// Compact difficulty encoding and retargeting.
//
// `bits` is 4 bytes as 8 hex chars: one exponent byte then a 3-byte
// mantissa. target = mantissa * 2^(8 * (exponent - 3)). Encoding
// normalizes a set mantissa high bit by shifting right and bumping the
// exponent, mirroring Bitcoin's compact format.

use primitive_types::U256;

use crate::config::{BLOCK_TIME_TARGET_SEC, DIFFICULTY_ADJUSTMENT_INTERVAL, DIFFICULTY_CLAMP_FACTOR};
use crate::primitives::Block;

/// Easiest permitted bits: mantissa 0x7FFFFF at full 32-byte width.
pub const MAX_BITS: &str = "207fffff";

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum DifficultyError {
    #[error("malformed difficulty bits: {0}")]
    BadBits(String),
    #[error("target out of range")]
    TargetOutOfRange,
}

/// Easiest allowed target: 0x7FFFFF << (8 * 29).
pub fn max_target() -> U256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x7F;
    bytes[1] = 0xFF;
    bytes[2] = 0xFF;
    U256::from_big_endian(&bytes)
}

pub fn bits_to_target(bits: &str) -> Result<U256, DifficultyError> {
    if bits.len() != 8 || !bits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DifficultyError::BadBits(bits.to_string()));
    }
    let exp = u8::from_str_radix(&bits[..2], 16).map_err(|_| DifficultyError::BadBits(bits.into()))?;
    let mant = u32::from_str_radix(&bits[2..], 16).map_err(|_| DifficultyError::BadBits(bits.into()))?;

    // an exponent past 32 bytes cannot describe a 256-bit target
    if exp > 32 {
        return Err(DifficultyError::TargetOutOfRange);
    }
    let target = if exp >= 3 {
        U256::from(mant) << (8 * (exp as usize - 3))
    } else {
        U256::from(mant) >> (8 * (3 - exp as usize))
    };
    Ok(target)
}

pub fn target_to_bits(target: U256) -> Result<String, DifficultyError> {
    if target.is_zero() {
        return Err(DifficultyError::TargetOutOfRange);
    }

    let mut raw = [0u8; 32];
    target.to_big_endian(&mut raw);
    let stripped: Vec<u8> = raw.iter().copied().skip_while(|&b| b == 0).collect();

    // mantissa = leading three bytes, left-aligned for short targets so
    // bits_to_target inverts exactly
    let mut exp = stripped.len();
    let mut mant_bytes = [0u8; 3];
    for (i, b) in stripped.iter().take(3).enumerate() {
        mant_bytes[i] = *b;
    }

    // normalize: a set high bit would read as a sign in compact form
    if mant_bytes[0] & 0x80 != 0 {
        mant_bytes = [0, mant_bytes[0], mant_bytes[1]];
        exp += 1;
    }

    Ok(format!(
        "{:02x}{:02x}{:02x}{:02x}",
        exp, mant_bytes[0], mant_bytes[1], mant_bytes[2]
    ))
}

/// Does a block hash satisfy the proof-of-work for `bits`?
pub fn hash_meets_target(hash_hex: &str, bits: &str) -> bool {
    let target = match bits_to_target(bits) {
        Ok(t) => t,
        Err(_) => return false,
    };
    let raw = match hex::decode(hash_hex) {
        Ok(r) if r.len() == 32 => r,
        _ => return false,
    };
    U256::from_big_endian(&raw) <= target
}

/// Retarget fires on every positive multiple of the adjustment interval.
pub fn should_adjust(block_index: u64) -> bool {
    block_index > 0 && block_index % DIFFICULTY_ADJUSTMENT_INTERVAL == 0
}

/// New bits from the previous window's bits and its wall-clock span,
/// clamped to [expected/4, expected*4] and capped at the easiest target.
pub fn retarget(old_bits: &str, actual_timespan_sec: u64) -> Result<String, DifficultyError> {
    let expected = DIFFICULTY_ADJUSTMENT_INTERVAL * BLOCK_TIME_TARGET_SEC;
    let clamped = actual_timespan_sec.clamp(
        expected / DIFFICULTY_CLAMP_FACTOR,
        expected * DIFFICULTY_CLAMP_FACTOR,
    );

    let old_target = bits_to_target(old_bits)?;
    let actual = U256::from(clamped);
    let expected = U256::from(expected);

    let mut new_target = if U256::MAX / actual < old_target {
        U256::MAX
    } else {
        (old_target * actual / expected).max(U256::one())
    };
    if new_target > max_target() {
        new_target = max_target();
    }
    target_to_bits(new_target)
}

/// The bits a block at `parent.index + 1` must carry, given the chain's
/// retarget anchor (the block one interval back). Both the miner and the
/// consensus check call this, so they cannot disagree.
pub fn expected_bits(anchor: &Block, parent: &Block) -> Result<String, DifficultyError> {
    let actual = parent.timestamp.saturating_sub(anchor.timestamp).max(1);
    retarget(&parent.bits, actual)
}
