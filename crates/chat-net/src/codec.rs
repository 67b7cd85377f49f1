//! Wire primitives: fixed-width integers and length-prefixed byte strings.
//!
//! Integers are 4 bytes, host-native byte order (no `htonl`/`ntohl`
//! equivalent — see the endianness note in the crate's design docs).
//! Strings are a 4-byte length prefix followed by that many UTF-8 bytes, no
//! trailing null.

use crate::error::ShortRead;

pub const LEN_PREFIX_SIZE: usize = core::mem::size_of::<u32>();

/// Appends `n` to `out` as a 4-byte native-endian integer.
#[inline]
pub fn encode_u32(out: &mut Vec<u8>, n: u32) {
    out.extend_from_slice(&n.to_ne_bytes());
}

/// Appends `s` to `out` as a length prefix followed by its UTF-8 bytes.
#[inline]
pub fn encode_string(out: &mut Vec<u8>, s: &str) {
    encode_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

/// Reads a 4-byte integer at `offset`. Returns the value and the offset just
/// past it, or [`ShortRead`] if `buf` doesn't yet hold enough bytes.
#[inline]
pub fn decode_u32(buf: &[u8], offset: usize) -> Result<(u32, usize), ShortRead> {
    let end = offset + LEN_PREFIX_SIZE;
    let bytes = buf.get(offset..end).ok_or(ShortRead)?;
    Ok((u32::from_ne_bytes(bytes.try_into().unwrap()), end))
}

/// Reads a length-prefixed UTF-8 string at `offset`. Returns the string slice
/// and the offset just past it, or [`ShortRead`] if `buf` doesn't yet hold
/// the full prefix plus payload.
///
/// Non-UTF-8 payloads are treated as a short read of infinite length never
/// satisfied by the caller's buffer growth, which the session layer turns
/// into a protocol violation instead of looping forever — see
/// [`crate::session`].
#[inline]
pub fn decode_string(buf: &[u8], offset: usize) -> Result<(&str, usize), ShortRead> {
    let (len, str_start) = decode_u32(buf, offset)?;
    let str_end = str_start + len as usize;
    let bytes = buf.get(str_start..str_end).ok_or(ShortRead)?;
    let s = core::str::from_utf8(bytes).map_err(|_| ShortRead)?;
    Ok((s, str_end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_roundtrip() {
        for n in [0u32, 1, 255, 65536, u32::MAX] {
            let mut buf = Vec::new();
            encode_u32(&mut buf, n);
            assert_eq!(decode_u32(&buf, 0), Ok((n, 4)));
        }
    }

    #[test]
    fn string_roundtrip() {
        for s in ["", "a", "hello world", "utf-8: \u{1F980}"] {
            let mut buf = Vec::new();
            encode_string(&mut buf, s);
            assert_eq!(decode_string(&buf, 0), Ok((s, 4 + s.len())));
        }
    }

    #[test]
    fn short_read_on_missing_length() {
        assert_eq!(decode_u32(&[0, 0], 0), Err(ShortRead));
    }

    #[test]
    fn short_read_on_missing_payload() {
        let mut buf = Vec::new();
        encode_u32(&mut buf, 10);
        buf.extend_from_slice(b"short");
        assert_eq!(decode_string(&buf, 0), Err(ShortRead));
    }

    #[test]
    fn prefix_unambiguous() {
        // Two differently-lengthed strings never share an encoded prefix.
        let mut a = Vec::new();
        encode_string(&mut a, "ab");
        let mut b = Vec::new();
        encode_string(&mut b, "abc");
        assert_ne!(a, b[..a.len()]);
    }

    #[test]
    fn nested_frame_with_trailing_bytes() {
        // A packet frame: 4-byte id, then a length-prefixed string, with
        // extra trailing bytes the caller doesn't consume.
        let mut buf = Vec::new();
        encode_u32(&mut buf, 0); // packet id
        encode_string(&mut buf, "hi");
        buf.push(0xFF); // simulate more data already buffered
        let (id, off) = decode_u32(&buf, 0).unwrap();
        assert_eq!(id, 0);
        let (s, off) = decode_string(&buf, off).unwrap();
        assert_eq!(s, "hi");
        assert_eq!(off, buf.len() - 1);
    }
}
