//! Hex helpers for RSP fields.
//!
//! Numeric fields are parsed leniently: parsing stops at the first non-hex
//! byte, so `m1000,4` yields `0x1000` for the address field without the
//! caller having to split on the comma first.

use crate::ProtoError;

const DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Decode a single hex digit.
#[inline]
pub const fn decode_digit(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}

/// Encode the low nibble of `value` as a lowercase hex digit.
#[inline]
pub const fn encode_digit(value: u8) -> u8 {
    DIGITS[(value & 0xf) as usize]
}

/// Decode an unsigned hex number.
///
/// `-1` decodes to `u64::MAX` (the protocol's "all" marker). At most 16
/// digits are consumed.
pub fn decode_uint(data: &[u8]) -> u64 {
    if data.first() == Some(&b'-') {
        return if data.get(1) == Some(&b'1') { u64::MAX } else { 0 };
    }
    let mut value = 0u64;
    for &ch in data.iter().take(16) {
        let Some(digit) = decode_digit(ch) else {
            break;
        };
        value = (value << 4) | u64::from(digit);
    }
    value
}

/// Decode `out.len()` bytes from hex pairs in `data`.
///
/// # Errors
///
/// Fails if `data` holds fewer than `2 * out.len()` bytes or contains a
/// non-hex byte. `out` may be partially written on failure.
pub fn decode_bytes(data: &[u8], out: &mut [u8]) -> Result<(), ProtoError> {
    let needed = out.len() * 2;
    if data.len() < needed {
        return Err(ProtoError::ShortHex {
            expected: out.len(),
            actual: data.len() / 2,
        });
    }
    for (byte, pair) in out.iter_mut().zip(data.chunks_exact(2)) {
        let hi = decode_digit(pair[0]).ok_or(ProtoError::InvalidHex(pair[0]))?;
        let lo = decode_digit(pair[1]).ok_or(ProtoError::InvalidHex(pair[1]))?;
        *byte = (hi << 4) | lo;
    }
    Ok(())
}

/// Encode bytes as lowercase hex pairs.
pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &byte in data {
        out.push(encode_digit(byte >> 4));
        out.push(encode_digit(byte));
    }
    out
}

/// Find `delim` in `data` and return the bytes after it.
#[inline]
pub fn after(data: &[u8], delim: u8) -> Option<&[u8]> {
    data.iter()
        .position(|&b| b == delim)
        .map(|pos| &data[pos + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_uint_stops_at_delimiter() {
        assert_eq!(decode_uint(b"1000,4"), 0x1000);
        assert_eq!(decode_uint(b"DeadBeef"), 0xdead_beef);
        assert_eq!(decode_uint(b""), 0);
        assert_eq!(decode_uint(b"zz"), 0);
    }

    #[test]
    fn test_decode_uint_all_marker() {
        assert_eq!(decode_uint(b"-1"), u64::MAX);
        assert_eq!(decode_uint(b"-2"), 0);
    }

    #[test]
    fn test_decode_uint_caps_digits() {
        assert_eq!(decode_uint(b"11111111111111112"), 0x1111_1111_1111_1111);
    }

    #[test]
    fn test_decode_bytes() {
        let mut out = [0u8; 4];
        decode_bytes(b"000020d4", &mut out).unwrap();
        assert_eq!(out, [0x00, 0x00, 0x20, 0xd4]);

        assert_eq!(
            decode_bytes(b"0011", &mut out),
            Err(ProtoError::ShortHex {
                expected: 4,
                actual: 2
            })
        );
        assert_eq!(
            decode_bytes(b"00g0000000", &mut out),
            Err(ProtoError::InvalidHex(b'g'))
        );
    }

    #[test]
    fn test_encode_bytes() {
        assert_eq!(encode_bytes(&[0x00, 0xab, 0x7f]), b"00ab7f");
    }

    #[test]
    fn test_after() {
        assert_eq!(after(b"P1f=0011", b'='), Some(&b"0011"[..]));
        assert_eq!(after(b"P1f", b'='), None);
    }
}
