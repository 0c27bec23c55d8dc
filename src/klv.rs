//! SMPTE-336M-style Key-Length-Value metadata parser (component H).
//!
//! This sits on the trust boundary (a companion metadata device may be fed
//! adversarial or malformed data) and must never read out of bounds, panic,
//! or loop unboundedly on any input. Parsed items alias the input buffer
//! (zero-copy); their lifetime is bound to it by the borrow checker.

use crate::error::{Error, Result};

/// Length, in bytes, of a universal-label key. Short local-set keys are
/// permitted via [`parse_with_key_len`].
pub const UNIVERSAL_KEY_LEN: usize = 16;

/// A parsed KLV item whose key and value slices alias the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item<'a> {
    /// The key bytes, `key_len` long.
    pub key: &'a [u8],
    /// The value bytes, `length` long — guaranteed to lie within the input
    /// buffer the item was parsed from.
    pub value: &'a [u8],
}

/// Parses a buffer of concatenated KLV triples using 16-byte universal-label
/// keys.
///
/// # Errors
///
/// See [`parse_with_key_len`].
pub fn parse(buf: &[u8]) -> Result<Vec<Item<'_>>> {
    parse_with_key_len(buf, UNIVERSAL_KEY_LEN)
}

/// Parses a buffer of concatenated KLV triples using `key_len`-byte keys
/// (16 for universal labels, shorter for local sets as the caller
/// indicates).
///
/// Length is BER-OID style: if the first length byte has its high bit
/// clear, it *is* the length (0..=127). Otherwise the low 7 bits give the
/// byte count of a big-endian length that follows.
///
/// This function never reads past `buf` for any input, rejects any item
/// whose declared length would exceed the remaining buffer, and rejects
/// length encodings whose advertised byte-count exceeds `size_of::<usize>()`
/// or would overflow when accumulated. It runs in O(items) time and
/// O(items) auxiliary memory — no value bytes are copied.
///
/// # Errors
///
/// Returns [`Error::ParseError`] if a key, length, or value would run past
/// the end of `buf`, or if a long-form length encoding is unrepresentable.
pub fn parse_with_key_len(buf: &[u8], key_len: usize) -> Result<Vec<Item<'_>>> {
    let mut items = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let key_end = pos.checked_add(key_len).ok_or_else(overflow)?;
        if key_end > buf.len() {
            return Err(Error::ParseError("truncated key".into()));
        }
        let key = &buf[pos..key_end];
        pos = key_end;

        let (length, length_bytes) = read_ber_length(&buf[pos..])?;
        pos = pos.checked_add(length_bytes).ok_or_else(overflow)?;

        let value_end = pos.checked_add(length).ok_or_else(overflow)?;
        if value_end > buf.len() {
            return Err(Error::ParseError("declared length exceeds remaining buffer".into()));
        }
        let value = &buf[pos..value_end];
        pos = value_end;

        items.push(Item { key, value });
    }
    Ok(items)
}

fn overflow() -> Error {
    Error::ParseError("length accumulation overflow".into())
}

/// Reads a BER-OID-style length from the start of `buf`. Returns the decoded
/// length and the number of bytes the encoding itself occupied.
fn read_ber_length(buf: &[u8]) -> Result<(usize, usize)> {
    let first = *buf.first().ok_or_else(|| Error::ParseError("truncated length".into()))?;
    if first & 0x80 == 0 {
        return Ok((usize::from(first), 1));
    }
    let count = usize::from(first & 0x7f);
    if count == 0 || count > std::mem::size_of::<usize>() {
        return Err(Error::ParseError("length-of-length exceeds machine word".into()));
    }
    if buf.len() < 1 + count {
        return Err(Error::ParseError("truncated long-form length".into()));
    }
    let mut length: usize = 0;
    for &byte in &buf[1..1 + count] {
        length = length.checked_shl(8).ok_or_else(overflow)?;
        length |= usize::from(byte);
    }
    Ok((length, 1 + count))
}

/// Returns the first item in `items` whose key is byte-equal to `key`.
#[must_use]
pub fn find<'a, 'b>(items: &'b [Item<'a>], key: &[u8]) -> Option<&'b Item<'a>> {
    items.iter().find(|item| item.key == key)
}

/// A buffer with an associated capture timestamp, used by [`sync_metadata`].
#[derive(Debug, Clone, Copy)]
pub struct TimestampedBuffer {
    /// Capture timestamp, in nanoseconds.
    pub timestamp_ns: u64,
}

/// Returns the index of the buffer in `buffers` whose `timestamp_ns` is
/// nearest to `target_ns`. Ties break to the lower index. Returns `-1` if
/// `buffers` is empty.
#[must_use]
pub fn sync_metadata(target_ns: u64, buffers: &[TimestampedBuffer]) -> i64 {
    let mut best: Option<(usize, u64)> = None;
    for (index, buffer) in buffers.iter().enumerate() {
        let delta = target_ns.abs_diff(buffer.timestamp_ns);
        match best {
            Some((_, best_delta)) if delta >= best_delta => {}
            _ => best = Some((index, delta)),
        }
    }
    best.map_or(-1, |(index, _)| i64::try_from(index).unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_is_zero_items() {
        assert_eq!(parse(&[]).unwrap().len(), 0);
    }

    #[test]
    fn klv_roundtrip_short_form_length() {
        let key: [u8; 16] =
            [0x06, 0x0E, 0x2B, 0x34, 0x02, 0x0B, 0x01, 0x01, 0x0E, 0x01, 0x03, 0x01, 0x01, 0x00, 0x00, 0x00];
        let mut buf = Vec::new();
        buf.extend_from_slice(&key);
        buf.push(0x08);
        buf.extend_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);

        let items = parse(&buf).unwrap();
        assert_eq!(items.len(), 1);
        let found = find(&items, &key).unwrap();
        assert_eq!(found.value, &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn long_form_length_of_length_overflow_is_parse_error() {
        let mut buf = vec![0u8; 16];
        buf.push(0xFF); // high bit set, low 7 bits = 0x7F (127) byte length-of-length
        buf.extend(std::iter::repeat(0u8).take(8));
        let err = parse(&buf).unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
    }

    #[test]
    fn length_exceeding_remaining_buffer_is_rejected() {
        let mut buf = vec![0u8; 16];
        buf.push(0x7F); // declares 127 bytes of value, none present
        let err = parse(&buf).unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
    }

    #[test]
    fn never_reads_past_buffer_for_truncated_key() {
        let buf = vec![0u8; 5];
        let err = parse(&buf).unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
    }

    #[test]
    fn sync_metadata_picks_nearest_with_lower_index_tiebreak() {
        let buffers = [
            TimestampedBuffer { timestamp_ns: 1_000_000_000 },
            TimestampedBuffer { timestamp_ns: 1_100_000_000 },
            TimestampedBuffer { timestamp_ns: 1_200_000_000 },
        ];
        assert_eq!(sync_metadata(1_150_000_000, &buffers), 1);
    }

    #[test]
    fn sync_metadata_empty_is_negative_one() {
        assert_eq!(sync_metadata(0, &[]), -1);
    }

    #[test]
    fn multiple_items_parsed_in_sequence() {
        let mut buf = Vec::new();
        for tag in 0u8..3 {
            let mut key = [0u8; 16];
            key[15] = tag;
            buf.extend_from_slice(&key);
            buf.push(0x02);
            buf.extend_from_slice(&[tag, tag]);
        }
        let items = parse(&buf).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].value, &[2, 2]);
    }
}
