//! Minimal HPACK wire encoding (RFC 7541 §6.2.2: "Literal Header Field
//! Never Indexed", no Huffman, no dynamic table).
//!
//! Full HPACK (dynamic table eviction, Huffman coding, static-table
//! lookups) is itself a compression scheme and out of scope here; this
//! module covers only the literal encoding needed to stay wire-valid and
//! interoperable, while [`super::Http2Session`] still tracks
//! `local_table_size`/`remote_table_size` as negotiated via SETTINGS. See
//! DESIGN.md for the accepted simplification.

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};

/// Encodes every header in `headers` as a literal-never-indexed field.
pub fn encode(headers: &HeaderMap) -> Bytes {
    let mut out = BytesMut::new();
    for (name, value) in headers.iter() {
        encode_field(&mut out, name.as_str().as_bytes(), value.as_bytes());
    }
    out.freeze()
}

fn encode_field(out: &mut BytesMut, name: &[u8], value: &[u8]) {
    out.put_u8(0x10); // 0001_0000: literal header field never indexed, new name
    write_string(out, name);
    write_string(out, value);
}

fn write_string(out: &mut BytesMut, s: &[u8]) {
    write_prefixed_int(out, 7, s.len() as u64);
    out.put_slice(s);
}

fn write_prefixed_int(out: &mut BytesMut, prefix_bits: u32, mut value: u64) {
    let max_prefix = (1u64 << prefix_bits) - 1;
    if value < max_prefix {
        out.put_u8(value as u8);
        return;
    }
    out.put_u8(max_prefix as u8);
    value -= max_prefix;
    while value >= 0x80 {
        out.put_u8(((value % 0x80) as u8) | 0x80);
        value /= 0x80;
    }
    out.put_u8(value as u8);
}

#[derive(Debug)]
pub enum DecodeError {
    Truncated,
    InvalidName,
    InvalidValue,
    Indexed,
}

/// Decodes a block produced by [`encode`]. Any indexed (non-literal)
/// representation is reported as [`DecodeError::Indexed`] rather than
/// silently mishandled, since this decoder never builds a table to
/// resolve indices against.
pub fn decode(mut buf: &[u8]) -> Result<HeaderMap, DecodeError> {
    let mut headers = HeaderMap::new();
    while !buf.is_empty() {
        let prefix = buf[0];
        if prefix & 0x80 != 0 || (prefix & 0xc0) == 0x40 || (prefix & 0xf0) == 0x00 {
            // Indexed field, or literal-with-incremental-indexing, or
            // literal-without-indexing: not produced by `encode`.
            if prefix != 0x10 {
                return Err(DecodeError::Indexed);
            }
        }
        buf = &buf[1..];
        let (name, rest) = read_string(buf)?;
        let (value, rest) = read_string(rest)?;
        buf = rest;
        let name = HeaderName::from_bytes(&name).map_err(|_| DecodeError::InvalidName)?;
        let value = HeaderValue::from_bytes(&value).map_err(|_| DecodeError::InvalidValue)?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn read_string(buf: &[u8]) -> Result<(Vec<u8>, &[u8]), DecodeError> {
    let (len, rest) = read_prefixed_int(buf, 7)?;
    if rest.len() < len as usize {
        return Err(DecodeError::Truncated);
    }
    let (value, rest) = rest.split_at(len as usize);
    Ok((value.to_vec(), rest))
}

fn read_prefixed_int(buf: &[u8], prefix_bits: u32) -> Result<(u64, &[u8]), DecodeError> {
    if buf.is_empty() {
        return Err(DecodeError::Truncated);
    }
    let max_prefix = (1u64 << prefix_bits) - 1;
    let mut value = (buf[0] as u64) & max_prefix;
    let mut rest = &buf[1..];
    if value < max_prefix {
        return Ok((value, rest));
    }
    let mut shift = 0u32;
    loop {
        if rest.is_empty() {
            return Err(DecodeError::Truncated);
        }
        let byte = rest[0];
        rest = &rest[1..];
        value += ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    Ok((value, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(":status", HeaderValue::from_static("200"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        let encoded = encode(&headers);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.get(":status").unwrap(), "200");
        assert_eq!(decoded.get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn round_trips_long_values_needing_continuation_bytes() {
        let mut headers = HeaderMap::new();
        let long_value = "x".repeat(300);
        headers.insert("x-long", HeaderValue::from_str(&long_value).unwrap());
        let encoded = encode(&headers);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.get("x-long").unwrap(), long_value.as_str());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("a", HeaderValue::from_static("b"));
        let encoded = encode(&headers);
        let err = decode(&encoded[..encoded.len() - 1]);
        assert!(matches!(err, Err(DecodeError::Truncated)));
    }
}
