//! HPACK header compression (RFC 7541).
//!
//! The encoder never inserts into the dynamic table, so the block it
//! produces depends only on the header list. The decoder is
//! complete: static and dynamic table, Huffman strings, size updates.

use std::collections::VecDeque;

use super::huffman;
use crate::error::{Error, Result};

/// RFC 7541 Appendix A. Index 1 is the first entry.
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Size overhead per entry (RFC 7541 section 4.1).
const ENTRY_OVERHEAD: usize = 32;

fn compression_error(what: &str) -> Error {
    Error::remote_protocol(format!("HPACK decoding failed: {} (COMPRESSION_ERROR)", what))
}

/// Append an integer with an N-bit prefix; `first` carries the pattern bits
/// above the prefix.
pub fn encode_integer(value: usize, prefix_bits: u8, first: u8, buf: &mut Vec<u8>) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        buf.push(first | value as u8);
        return;
    }
    buf.push(first | max as u8);
    let mut rest = value - max;
    while rest >= 128 {
        buf.push((rest % 128 + 128) as u8);
        rest /= 128;
    }
    buf.push(rest as u8);
}

/// Decode an integer with an N-bit prefix, returning `(value, consumed)`.
pub fn decode_integer(data: &[u8], prefix_bits: u8) -> Result<(usize, usize)> {
    let first = *data.first().ok_or_else(|| compression_error("truncated integer"))?;
    let max = (1usize << prefix_bits) - 1;
    let mut value = (first as usize) & max;
    if value < max {
        return Ok((value, 1));
    }
    let mut shift = 0u32;
    for (i, &b) in data[1..].iter().enumerate() {
        if shift > 28 {
            return Err(compression_error("integer overflow"));
        }
        value += ((b & 0x7f) as usize) << shift;
        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }
        shift += 7;
    }
    Err(compression_error("truncated integer"))
}

fn encode_string(s: &[u8], buf: &mut Vec<u8>) {
    let huff_len = huffman::encoded_len(s);
    if huff_len < s.len() {
        encode_integer(huff_len, 7, 0x80, buf);
        huffman::encode(s, buf);
    } else {
        encode_integer(s.len(), 7, 0, buf);
        buf.extend_from_slice(s);
    }
}

fn decode_string(data: &[u8]) -> Result<(Vec<u8>, usize)> {
    let first = *data.first().ok_or_else(|| compression_error("truncated string"))?;
    let (len, used) = decode_integer(data, 7)?;
    let end = used
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| compression_error("string longer than block"))?;
    let raw = &data[used..end];
    let value = if first & 0x80 != 0 {
        huffman::decode(raw).ok_or_else(|| compression_error("invalid Huffman string"))?
    } else {
        raw.to_vec()
    };
    Ok((value, end))
}

/// Stateless HPACK encoder.
#[derive(Debug, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode `(name, value)` pairs in the given order. Names must already
    /// be lowercase.
    pub fn encode<'a, I>(&mut self, headers: I) -> Vec<u8>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut buf = Vec::with_capacity(256);
        for (name, value) in headers {
            let mut name_idx = None;
            let mut full_idx = None;
            for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
                if *n == name {
                    name_idx.get_or_insert(i + 1);
                    if *v == value {
                        full_idx = Some(i + 1);
                        break;
                    }
                }
            }
            match (full_idx, name_idx) {
                (Some(idx), _) => encode_integer(idx, 7, 0x80, &mut buf),
                // literal without indexing, indexed name
                (None, Some(idx)) => {
                    encode_integer(idx, 4, 0x00, &mut buf);
                    encode_string(value.as_bytes(), &mut buf);
                }
                (None, None) => {
                    buf.push(0x00);
                    encode_string(name.as_bytes(), &mut buf);
                    encode_string(value.as_bytes(), &mut buf);
                }
            }
        }
        buf
    }
}

/// HPACK decoder with a dynamic table bounded by the size we advertised in
/// SETTINGS_HEADER_TABLE_SIZE.
#[derive(Debug)]
pub struct Decoder {
    table: VecDeque<(String, String)>,
    size: usize,
    max_size: usize,
    limit: usize,
}

impl Decoder {
    pub fn new(limit: usize) -> Self {
        Self {
            table: VecDeque::new(),
            size: 0,
            max_size: limit,
            limit,
        }
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        let mut pos = 0;
        let mut seen_field = false;
        while pos < block.len() {
            let b = block[pos];
            let rest = &block[pos..];
            if b & 0x80 != 0 {
                let (idx, used) = decode_integer(rest, 7)?;
                if idx == 0 {
                    return Err(compression_error("index 0"));
                }
                out.push(self.lookup(idx)?);
                pos += used;
                seen_field = true;
            } else if b & 0x40 != 0 {
                let (field, used) = self.literal(rest, 6)?;
                self.insert(field.0.clone(), field.1.clone());
                out.push(field);
                pos += used;
                seen_field = true;
            } else if b & 0x20 != 0 {
                if seen_field {
                    return Err(compression_error("table size update after header field"));
                }
                let (size, used) = decode_integer(rest, 5)?;
                if size > self.limit {
                    return Err(compression_error("table size update above limit"));
                }
                self.max_size = size;
                self.evict(0);
                pos += used;
            } else {
                // without indexing (0000) or never indexed (0001)
                let (field, used) = self.literal(rest, 4)?;
                out.push(field);
                pos += used;
                seen_field = true;
            }
        }
        Ok(out)
    }

    fn literal(&self, data: &[u8], prefix_bits: u8) -> Result<((String, String), usize)> {
        let (idx, mut pos) = decode_integer(data, prefix_bits)?;
        let name = if idx == 0 {
            let (raw, used) = decode_string(&data[pos..])?;
            pos += used;
            into_string(raw)
        } else {
            self.lookup(idx)?.0
        };
        let (raw, used) = decode_string(&data[pos..])?;
        pos += used;
        Ok(((name, into_string(raw)), pos))
    }

    fn lookup(&self, idx: usize) -> Result<(String, String)> {
        if idx <= STATIC_TABLE.len() {
            let (n, v) = STATIC_TABLE[idx - 1];
            return Ok((n.to_string(), v.to_string()));
        }
        self.table
            .get(idx - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or_else(|| compression_error("index out of range"))
    }

    fn insert(&mut self, name: String, value: String) {
        let size = ENTRY_OVERHEAD + name.len() + value.len();
        if size > self.max_size {
            self.table.clear();
            self.size = 0;
            return;
        }
        self.evict(size);
        self.size += size;
        self.table.push_front((name, value));
    }

    fn evict(&mut self, incoming: usize) {
        while self.size + incoming > self.max_size {
            match self.table.pop_back() {
                Some((n, v)) => self.size -= ENTRY_OVERHEAD + n.len() + v.len(),
                None => break,
            }
        }
    }
}

fn into_string(raw: Vec<u8>) -> String {
    // obs-text bytes are legal on the wire; map them as latin-1
    match String::from_utf8(raw) {
        Ok(s) => s,
        Err(e) => e.into_bytes().iter().map(|&b| b as char).collect(),
    }
}
