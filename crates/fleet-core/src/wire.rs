//! Fleet wire primitives — the integer encodings every packet shares.
//!
//! Lengths, chunk sizes and chunk indices travel as unsigned LEB128
//! varints (7 bits per byte, low group first, at most 5 bytes for a
//! `u32`). Fixed-width integers are big-endian. UUIDs are 16 raw bytes.
//! Changing anything here is a breaking change for every peer.

use bytes::{Buf, BufMut};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Longest encoding of a `u32` varint.
pub const MAX_VARINT_LEN: usize = 5;

/// Encoded size of a session id.
pub const UUID_LEN: usize = 16;

// ── Varints ───────────────────────────────────────────────────────────────────

/// Append `value` as a varint.
pub fn put_varint<B: BufMut>(dst: &mut B, mut value: u32) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Read one varint from the front of `src`.
pub fn get_varint<B: Buf>(src: &mut B) -> Result<u32, WireError> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        if !src.has_remaining() {
            return Err(WireError::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        let byte = src.get_u8();
        let group = u32::from(byte & 0x7f);
        // The fifth byte may only carry the top four bits of a u32.
        if i == MAX_VARINT_LEN - 1 && group > 0x0f {
            return Err(WireError::VarIntTooLong);
        }
        value |= group << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(WireError::VarIntTooLong)
}

/// Number of bytes `put_varint` emits for `value`.
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("varint exceeds {} bytes", MAX_VARINT_LEN)]
    VarIntTooLong,

    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("string is not valid utf-8")]
    InvalidUtf8,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
