//! Numeric aid to public bvid transform.

use crate::error::{Result, ShimError};

const ALPHABET: &[u8; 58] = b"FcwAPNKTMug3GV5Lj7EJnHpWsx4tb8haYeviqBz6rkCy12mUSDQX9RdoZf";
const XOR_CODE: i64 = 23_442_827_791_579;
const MAX_AID_FLAG: i64 = 1 << 51;
const BASE: i64 = 58;
const PREFIX: &[u8; 3] = b"BV1";
const BVID_LEN: usize = 12;

/// Encodes `aid` into its 12-character public id.
///
/// Digits are written right-to-left into positions 3..12 and the result is
/// finished with two fixed transpositions (3↔9, 4↔7).
pub fn encode(aid: i64) -> Result<String> {
    if aid <= 0 {
        return Err(ShimError::InvalidAid(aid));
    }

    let mut out = [b'0'; BVID_LEN];
    out[..PREFIX.len()].copy_from_slice(PREFIX);

    let mut tmp = (MAX_AID_FLAG | aid) ^ XOR_CODE;
    let mut idx = BVID_LEN - 1;
    while tmp > 0 && idx >= PREFIX.len() {
        out[idx] = ALPHABET[(tmp % BASE) as usize];
        tmp /= BASE;
        idx -= 1;
    }

    out.swap(3, 9);
    out.swap(4, 7);

    // Every byte comes from the ASCII prefix or alphabet.
    Ok(out.iter().map(|&b| b as char).collect())
}

/// Parses a decimal aid string and encodes it, returning `None` for anything
/// that is not a positive integer.
pub fn encode_str(aid: &str) -> Option<String> {
    aid.trim().parse::<i64>().ok().and_then(|aid| encode(aid).ok())
}
