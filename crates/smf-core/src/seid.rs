//! SEID text form.
//!
//! Documents and cache values are JSON, and JSON numbers lose precision past
//! 2^53. SEIDs are therefore stored as lowercase base-16 strings without a
//! prefix or padding (`0` for zero, `ffffffffffffffff` for u64::MAX).

use std::num::ParseIntError;

/// Render a SEID in its stored form.
pub fn to_hex(seid: u64) -> String {
    format!("{seid:x}")
}

/// Parse a stored SEID. Empty strings, non-hex digits and values past
/// u64::MAX are all rejected.
pub fn from_hex(text: &str) -> Result<u64, ParseIntError> {
    u64::from_str_radix(text, 16)
}
