// Copyright (c) 2024 Botho Foundation

//! Compact-u16 length prefixes.
//!
//! Lengths are written 7 bits at a time, least significant group first, with
//! the high bit of each byte flagging a continuation. A value never takes more
//! than three bytes. Only the canonical (shortest) encoding is accepted on
//! decode, which keeps `encode(decode(b)) == b` for every accepted buffer.

use thiserror::Error;

/// Largest number of bytes a compact-u16 may occupy.
pub const MAX_ENCODING_LENGTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShortVecError {
    #[error("length prefix truncated at offset {0}")]
    Truncated(usize),

    #[error("length prefix at offset {0} is not in canonical form")]
    NonCanonical(usize),

    #[error("length prefix at offset {0} overflows u16")]
    Overflow(usize),
}

/// Append the compact encoding of `value` to `out`.
pub fn encode_len(value: u16, out: &mut Vec<u8>) {
    let mut rem = value;
    loop {
        let mut byte = (rem & 0x7f) as u8;
        rem >>= 7;
        if rem == 0 {
            out.push(byte);
            return;
        }
        byte |= 0x80;
        out.push(byte);
    }
}

/// Number of bytes `encode_len(value)` writes.
pub fn encoded_len(value: u16) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        _ => 3,
    }
}

/// Decode a compact-u16 starting at `offset`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_len(bytes: &[u8], offset: usize) -> Result<(u16, usize), ShortVecError> {
    let mut value: u32 = 0;
    for i in 0..MAX_ENCODING_LENGTH {
        let byte = *bytes
            .get(offset + i)
            .ok_or(ShortVecError::Truncated(offset + i))?;
        value |= ((byte & 0x7f) as u32) << (7 * i);

        if byte & 0x80 == 0 {
            // A zero group after the first byte means a shorter form existed.
            if i > 0 && byte == 0 {
                return Err(ShortVecError::NonCanonical(offset));
            }
            if value > u16::MAX as u32 {
                return Err(ShortVecError::Overflow(offset));
            }
            return Ok((value as u16, i + 1));
        }

        if i == MAX_ENCODING_LENGTH - 1 {
            return Err(ShortVecError::Overflow(offset));
        }
    }
    Err(ShortVecError::Overflow(offset))
}
