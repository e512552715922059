//! HPACK header compression, RFC 7541, with the field validation rules of
//! RFC 9113 §8.2 layered on top.
//!
//! Encoder and decoder each own their dynamic table; the two stay in sync
//! through the indexing decisions carried inside the header blocks
//! themselves, which is why blocks must be processed strictly in wire order.

use crate::huffman;
use crate::types::U31_MAX;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

/// Cap on the uncompressed size of one header list (name + value + 32 per
/// field), applied when the peer advertises nothing smaller.
pub const DEFAULT_MAX_HEADER_LIST_SIZE: usize = 256 * 1024;
/// Fields per block before the decoder gives up.
pub const MAX_HEADERS_PER_LIST: usize = 100;
pub const MAX_NAME_LENGTH: usize = 8 * 1024;
pub const MAX_VALUE_LENGTH: usize = 32 * 1024;
/// Literal octets decoded per encoded octet before a block is treated as a
/// decompression bomb. Indexed fields are exempt: their expansion is bounded
/// by the table, not the input.
pub const MAX_COMPRESSION_RATIO: usize = 10;
/// Values longer than this are never entered into the dynamic table.
pub const SENSITIVE_VALUE_THRESHOLD: usize = 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("empty field name")]
    EmptyName,
    #[error("uppercase character in field name")]
    UppercaseName,
    #[error("invalid character {0:#04x} in field name")]
    InvalidNameChar(u8),
    #[error("invalid character {0:#04x} in field value")]
    InvalidValueChar(u8),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("integer exceeds 2^31-1")]
    IntegerOverflow,
    #[error("truncated header block")]
    Truncated,
    #[error("index {0} is not in the table")]
    InvalidIndex(usize),
    #[error("dynamic table size update past the start of a block")]
    LateTableSizeUpdate,
    #[error("table size {0} exceeds the negotiated limit {1}")]
    TableSizeExceedsLimit(usize, usize),
    #[error("{0}")]
    Huffman(#[from] huffman::HuffmanError),
    #[error("header list exceeds {0} bytes")]
    ListTooLarge(usize),
    #[error("more than {0} headers in a block")]
    TooManyHeaders(usize),
    #[error("header name exceeds {0} bytes")]
    NameTooLong(usize),
    #[error("header value exceeds {0} bytes")]
    ValueTooLong(usize),
    #[error("decoded block expands suspiciously far past its encoded size")]
    CompressionBomb,
    #[error("{0}")]
    Field(#[from] FieldError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{0}")]
    Field(#[from] FieldError),
    #[error("header value exceeds {0} bytes")]
    ValueTooLong(usize),
}

#[derive(Debug, Clone)]
struct TableEntry {
    pub size: usize,
    pub name: Bytes,
    pub value: Bytes,
}

impl TableEntry {
    pub fn new(name: Bytes, value: Bytes) -> Self {
        Self {
            size: name.len() + value.len() + 32,
            name,
            value,
        }
    }
}

macro_rules! static_table {
    ( $( $name:expr => $value:expr ),+ ) => {
        [
            $(
                TableEntry {
                    size: $name.len() + $value.len() + 32,
                    name: Bytes::from_static($name),
                    value: Bytes::from_static($value),
                }
            ),+
        ]
    };
}

/// https://httpwg.org/specs/rfc7541.html#static.table.definition
static STATIC_TABLE: [TableEntry; 61] = static_table![
    b":authority" => b"",
    b":method" => b"GET",
    b":method" => b"POST",
    b":path" => b"/",
    b":path" => b"/index.html",
    b":scheme" => b"http",
    b":scheme" => b"https",
    b":status" => b"200",
    b":status" => b"204",
    b":status" => b"206",
    b":status" => b"304",
    b":status" => b"400",
    b":status" => b"404",
    b":status" => b"500",
    b"accept-charset" => b"",
    b"accept-encoding" => b"gzip, deflate",
    b"accept-language" => b"",
    b"accept-ranges" => b"",
    b"accept" => b"",
    b"access-control-allow-origin" => b"",
    b"age" => b"",
    b"allow" => b"",
    b"authorization" => b"",
    b"cache-control" => b"",
    b"content-disposition" => b"",
    b"content-encoding" => b"",
    b"content-language" => b"",
    b"content-length" => b"",
    b"content-location" => b"",
    b"content-range" => b"",
    b"content-type" => b"",
    b"cookie" => b"",
    b"date" => b"",
    b"etag" => b"",
    b"expect" => b"",
    b"expires" => b"",
    b"from" => b"",
    b"host" => b"",
    b"if-match" => b"",
    b"if-modified-since" => b"",
    b"if-none-match" => b"",
    b"if-range" => b"",
    b"if-unmodified-since" => b"",
    b"last-modified" => b"",
    b"link" => b"",
    b"location" => b"",
    b"max-forwards" => b"",
    b"proxy-authenticate" => b"",
    b"proxy-authorization" => b"",
    b"range" => b"",
    b"referer" => b"",
    b"refresh" => b"",
    b"retry-after" => b"",
    b"server" => b"",
    b"set-cookie" => b"",
    b"strict-transport-security" => b"",
    b"transfer-encoding" => b"",
    b"user-agent" => b"",
    b"vary" => b"",
    b"via" => b"",
    b"www-authenticate" => b""
];

/// First index addressing the dynamic table.
const DYNAMIC_BASE: usize = STATIC_TABLE.len() + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Full(usize),
    Name(usize),
    Miss,
}

#[derive(Debug, Clone)]
struct Table {
    max_size: usize,
    current_size: usize,
    table: VecDeque<TableEntry>,
}

impl Table {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            table: VecDeque::new(),
        }
    }

    /// Entry at an HPACK index (static table from 1, dynamic from 62).
    pub fn get(&self, index: usize) -> Option<&TableEntry> {
        if index == 0 {
            return None;
        }
        STATIC_TABLE
            .get(index - 1)
            .or_else(|| self.table.get(index - DYNAMIC_BASE))
    }

    pub fn lookup(&self, name: &[u8], value: &[u8]) -> Lookup {
        let mut name_index = None;
        for (i, entry) in STATIC_TABLE.iter().enumerate() {
            if entry.name == name {
                if entry.value == value {
                    return Lookup::Full(i + 1);
                }
                if name_index.is_none() {
                    name_index = Some(i + 1);
                }
            }
        }
        for (i, entry) in self.table.iter().enumerate() {
            if entry.name == name {
                if entry.value == value {
                    return Lookup::Full(DYNAMIC_BASE + i);
                }
                if name_index.is_none() {
                    name_index = Some(DYNAMIC_BASE + i);
                }
            }
        }
        name_index.map_or(Lookup::Miss, Lookup::Name)
    }

    /// Insert at index 62. An entry larger than the whole table clears it
    /// and is not inserted (RFC 7541 §4.4).
    pub fn push(&mut self, name: Bytes, value: Bytes) {
        let entry = TableEntry::new(name, value);
        if entry.size > self.max_size {
            self.table.clear();
            self.current_size = 0;
            return;
        }
        self.current_size += entry.size;
        self.table.push_front(entry);
        self.evict();
    }

    pub fn resize(&mut self, size: usize) {
        self.max_size = size;
        self.evict();
    }

    fn evict(&mut self) {
        while self.current_size > self.max_size {
            if let Some(popped) = self.table.pop_back() {
                self.current_size -= popped.size;
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table.len()
    }
}

// ---------------------------------------------------------------------------
// integers and strings

/// https://httpwg.org/specs/rfc7541.html#integer.representation
fn encode_integer(value: u32, prefix_bits: u8, first_byte: u8, dst: &mut BytesMut) {
    let cap = (1u32 << prefix_bits) - 1;
    if value < cap {
        dst.put_u8(first_byte | value as u8);
        return;
    }
    dst.put_u8(first_byte | cap as u8);
    let mut rest = value - cap;
    while rest >= 128 {
        dst.put_u8((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    dst.put_u8(rest as u8);
}

fn decode_integer(src: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<u32, DecodeError> {
    let cap = (1u32 << prefix_bits) - 1;
    let first = *src.get(*pos).ok_or(DecodeError::Truncated)?;
    *pos += 1;
    let mut value = u64::from(first & cap as u8);
    if value < u64::from(cap) {
        return Ok(value as u32);
    }
    let mut shift = 0u32;
    loop {
        let byte = *src.get(*pos).ok_or(DecodeError::Truncated)?;
        *pos += 1;
        value += u64::from(byte & 0x7f) << shift;
        if value > u64::from(U31_MAX) {
            return Err(DecodeError::IntegerOverflow);
        }
        if byte & 0x80 == 0 {
            return Ok(value as u32);
        }
        shift += 7;
        if shift > 35 {
            return Err(DecodeError::IntegerOverflow);
        }
    }
}

/// Base64-alphabet share of a string; values that are mostly base64 (tokens,
/// digests, cookies) gain nothing from Huffman.
fn looks_high_entropy(s: &[u8]) -> bool {
    if s.is_empty() {
        return false;
    }
    let base64ish = s
        .iter()
        .filter(|c| {
            matches!(c, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/' | b'=' | b'-' | b'_')
        })
        .count();
    base64ish * 10 >= s.len() * 9
}

fn encode_string(s: &[u8], dst: &mut BytesMut) {
    let huffman_len = huffman::encoded_len(s);
    if huffman_len < s.len() && !looks_high_entropy(s) {
        encode_integer(huffman_len as u32, 7, 0x80, dst);
        huffman::encode(s, dst);
    } else {
        encode_integer(s.len() as u32, 7, 0x00, dst);
        dst.put_slice(s);
    }
}

fn decode_string(src: &[u8], pos: &mut usize, limit: usize) -> Result<Bytes, DecodeError> {
    let first = *src.get(*pos).ok_or(DecodeError::Truncated)?;
    let huffman_coded = first & 0x80 != 0;
    let len = decode_integer(src, pos, 7)? as usize;
    let end = pos.checked_add(len).ok_or(DecodeError::Truncated)?;
    let raw = src.get(*pos..end).ok_or(DecodeError::Truncated)?;
    *pos = end;
    if huffman_coded {
        Ok(Bytes::from(huffman::decode(raw, limit)?))
    } else {
        if raw.len() > limit {
            return Err(DecodeError::ValueTooLong(limit));
        }
        Ok(Bytes::copy_from_slice(raw))
    }
}

// ---------------------------------------------------------------------------
// field validation (RFC 9113 §8.2)

pub fn validate_name(name: &[u8]) -> Result<(), FieldError> {
    if name.is_empty() {
        return Err(FieldError::EmptyName);
    }
    for &byte in name {
        match byte {
            0x41..=0x5a => return Err(FieldError::UppercaseName),
            0x00..=0x20 | 0x7f..=0xff => return Err(FieldError::InvalidNameChar(byte)),
            _ => {}
        }
    }
    Ok(())
}

pub fn validate_value(value: &[u8]) -> Result<(), FieldError> {
    for &byte in value {
        match byte {
            // tab and space are legal inside a value, controls are not
            0x09 | 0x20..=0x7e | 0x80..=0xff => {}
            _ => return Err(FieldError::InvalidValueChar(byte)),
        }
    }
    Ok(())
}

fn is_sensitive(name: &[u8], value: &[u8]) -> bool {
    matches!(name, b"authorization" | b"cookie" | b"set-cookie")
        || value.len() > SENSITIVE_VALUE_THRESHOLD
}

fn is_pseudo(name: &[u8]) -> bool {
    name.first() == Some(&b':')
}

// ---------------------------------------------------------------------------
// encoder

#[derive(Debug, Clone)]
pub struct Encoder {
    table: Table,
    pending_resize: Option<usize>,
}

impl Encoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            pending_resize: None,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. Evicts immediately and
    /// schedules the size-update instruction for the next block.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.table.resize(size);
        self.pending_resize = Some(size);
    }

    pub fn encode<'a>(
        &mut self,
        headers: impl IntoIterator<Item = (&'a [u8], &'a [u8])>,
    ) -> Result<Bytes, EncodeError> {
        let mut dst = BytesMut::new();
        if let Some(size) = self.pending_resize.take() {
            encode_integer(size as u32, 5, 0x20, &mut dst);
        }
        for (name, value) in headers {
            self.encode_field(name, value, &mut dst)?;
        }
        Ok(dst.freeze())
    }

    fn encode_field(
        &mut self,
        name: &[u8],
        value: &[u8],
        dst: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        validate_name(name)?;
        validate_value(value)?;
        if value.len() > MAX_VALUE_LENGTH {
            return Err(EncodeError::ValueTooLong(MAX_VALUE_LENGTH));
        }

        let lookup = self.table.lookup(name, value);
        if let Lookup::Full(index) = lookup {
            encode_integer(index as u32, 7, 0x80, dst);
            return Ok(());
        }

        let name_index = match lookup {
            Lookup::Name(index) => Some(index),
            _ => None,
        };

        if is_sensitive(name, value) {
            // literal never-indexed, https://httpwg.org/specs/rfc7541.html#literal.header.never.indexed
            Self::encode_literal(0x10, 4, name_index, name, value, dst);
        } else if is_pseudo(name) {
            // pseudo-headers stay out of the dynamic table
            Self::encode_literal(0x00, 4, name_index, name, value, dst);
        } else {
            // literal with incremental indexing
            Self::encode_literal(0x40, 6, name_index, name, value, dst);
            self.table
                .push(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
        }
        Ok(())
    }

    fn encode_literal(
        first_byte: u8,
        prefix_bits: u8,
        name_index: Option<usize>,
        name: &[u8],
        value: &[u8],
        dst: &mut BytesMut,
    ) {
        match name_index {
            Some(index) => encode_integer(index as u32, prefix_bits, first_byte, dst),
            None => {
                dst.put_u8(first_byte);
                encode_string(name, dst);
            }
        }
        encode_string(value, dst);
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::with_size(4096)
    }
}

// ---------------------------------------------------------------------------
// decoder

/// Bomb/flood ceilings applied while decoding a block.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_header_list_size: usize,
    pub max_headers: usize,
    pub max_name_len: usize,
    pub max_value_len: usize,
    pub max_compression_ratio: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_list_size: DEFAULT_MAX_HEADER_LIST_SIZE,
            max_headers: MAX_HEADERS_PER_LIST,
            max_name_len: MAX_NAME_LENGTH,
            max_value_len: MAX_VALUE_LENGTH,
            max_compression_ratio: MAX_COMPRESSION_RATIO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decoder {
    table: Table,
    /// Ceiling the peer may raise its table to: our last acknowledged
    /// SETTINGS_HEADER_TABLE_SIZE.
    max_size_limit: usize,
    limits: Limits,
}

impl Decoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            max_size_limit: dynamic_table_size,
            limits: Limits::default(),
        }
    }

    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    /// Lower (or re-raise) the negotiated table ceiling after a SETTINGS
    /// round-trip. Shrinking evicts from the oldest end immediately.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.max_size_limit = size;
        if self.table.max_size > size {
            self.table.resize(size);
        }
    }

    pub fn decode(&mut self, src: &[u8]) -> Result<Vec<(Bytes, Bytes)>, DecodeError> {
        let mut headers = Vec::new();
        let mut pos = 0usize;
        let mut at_block_start = true;
        let mut list_size = 0usize;
        let mut literal_octets = 0usize;

        while pos < src.len() {
            let first = src[pos];
            if first & 0x80 != 0 {
                // indexed field
                let index = decode_integer(src, &mut pos, 7)? as usize;
                let entry = self
                    .table
                    .get(index)
                    .ok_or(DecodeError::InvalidIndex(index))?;
                headers.push((entry.name.clone(), entry.value.clone()));
            } else if first & 0xc0 == 0x40 {
                // literal with incremental indexing
                let (name, value, literal) = self.decode_literal(src, &mut pos, 6)?;
                literal_octets += literal;
                self.table.push(name.clone(), value.clone());
                headers.push((name, value));
            } else if first & 0xe0 == 0x20 {
                // dynamic table size update
                if !at_block_start {
                    return Err(DecodeError::LateTableSizeUpdate);
                }
                let size = decode_integer(src, &mut pos, 5)? as usize;
                if size > self.max_size_limit {
                    return Err(DecodeError::TableSizeExceedsLimit(size, self.max_size_limit));
                }
                self.table.resize(size);
                continue;
            } else {
                // literal without indexing (0000) or never indexed (0001)
                let (name, value, literal) = self.decode_literal(src, &mut pos, 4)?;
                literal_octets += literal;
                headers.push((name, value));
            }
            at_block_start = false;

            let (name, value) = &headers[headers.len() - 1];
            self.check_field(name, value)?;
            list_size += name.len() + value.len() + 32;
            if list_size > self.limits.max_header_list_size {
                return Err(DecodeError::ListTooLarge(self.limits.max_header_list_size));
            }
            if headers.len() > self.limits.max_headers {
                return Err(DecodeError::TooManyHeaders(self.limits.max_headers));
            }
            if literal_octets > src.len().saturating_mul(self.limits.max_compression_ratio) {
                return Err(DecodeError::CompressionBomb);
            }
        }
        Ok(headers)
    }

    fn decode_literal(
        &self,
        src: &[u8],
        pos: &mut usize,
        prefix_bits: u8,
    ) -> Result<(Bytes, Bytes, usize), DecodeError> {
        let index = decode_integer(src, pos, prefix_bits)? as usize;
        let name = if index == 0 {
            decode_string(src, pos, self.limits.max_name_len)
                .map_err(|err| match err {
                    DecodeError::ValueTooLong(n) => DecodeError::NameTooLong(n),
                    other => other,
                })?
        } else {
            self.table
                .get(index)
                .ok_or(DecodeError::InvalidIndex(index))?
                .name
                .clone()
        };
        if name.len() > self.limits.max_name_len {
            return Err(DecodeError::NameTooLong(self.limits.max_name_len));
        }
        let value = decode_string(src, pos, self.limits.max_value_len)?;
        let literal = name.len() + value.len();
        Ok((name, value, literal))
    }

    fn check_field(&self, name: &Bytes, value: &Bytes) -> Result<(), DecodeError> {
        validate_name(name)?;
        validate_value(value)?;
        if name.len() > self.limits.max_name_len {
            return Err(DecodeError::NameTooLong(self.limits.max_name_len));
        }
        if value.len() > self.limits.max_value_len {
            return Err(DecodeError::ValueTooLong(self.limits.max_value_len));
        }
        Ok(())
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_size(4096)
    }
}

// ---------------------------------------------------------------------------
// header list validation (RFC 9113 §8.3)

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ListError {
    #[error("pseudo-header {0:?} after a regular header")]
    PseudoAfterRegular(String),
    #[error("duplicate pseudo-header {0:?}")]
    DuplicatePseudo(String),
    #[error("unknown pseudo-header {0:?}")]
    UnknownPseudo(String),
    #[error("missing required pseudo-header {0:?}")]
    MissingPseudo(&'static str),
    #[error("connection-specific header {0:?} is forbidden")]
    ConnectionSpecific(String),
    #[error("te header may only be \"trailers\"")]
    BadTe,
    #[error("conflicting content-length values")]
    ConflictingContentLength,
    #[error("malformed content-length")]
    MalformedContentLength,
    #[error("malformed :status")]
    MalformedStatus,
    #[error("{0}")]
    Field(#[from] FieldError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Request,
    Response,
    /// Trailer block after the response body. No pseudo-headers at all.
    Trailers,
}

/// Outcome of validating a header list: the bits the engine needs later.
#[derive(Debug, Clone, Default)]
pub struct ValidatedList {
    pub content_length: Option<u64>,
    pub status: Option<u16>,
}

const REQUEST_PSEUDO: [&str; 4] = [":method", ":scheme", ":path", ":authority"];

/// Validate pseudo-header placement, connection-specific bans and
/// content-length agreement for one header list.
pub fn validate_header_list<N, V>(headers: &[(N, V)], kind: ListKind) -> Result<ValidatedList, ListError>
where
    N: AsRef<str>,
    V: AsRef<str>,
{
    let mut seen_regular = false;
    let mut seen_pseudo: Vec<&str> = Vec::new();
    let mut out = ValidatedList::default();
    let mut is_connect = false;

    for (name, value) in headers {
        let name = name.as_ref();
        let value = value.as_ref();
        validate_name(name.as_bytes())?;
        validate_value(value.as_bytes())?;

        if name.starts_with(':') {
            if seen_regular {
                return Err(ListError::PseudoAfterRegular(name.to_owned()));
            }
            if seen_pseudo.iter().any(|seen| *seen == name) {
                return Err(ListError::DuplicatePseudo(name.to_owned()));
            }
            match kind {
                ListKind::Request => {
                    if !REQUEST_PSEUDO.contains(&name) {
                        return Err(ListError::UnknownPseudo(name.to_owned()));
                    }
                    if name == ":method" && value == "CONNECT" {
                        is_connect = true;
                    }
                }
                ListKind::Response => {
                    if name != ":status" {
                        return Err(ListError::UnknownPseudo(name.to_owned()));
                    }
                    out.status =
                        Some(value.parse::<u16>().map_err(|_| ListError::MalformedStatus)?);
                }
                ListKind::Trailers => {
                    return Err(ListError::UnknownPseudo(name.to_owned()));
                }
            }
            seen_pseudo.push(name);
            continue;
        }
        seen_regular = true;

        match name {
            "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade" => {
                return Err(ListError::ConnectionSpecific(name.to_owned()));
            }
            "te" if value != "trailers" => return Err(ListError::BadTe),
            "content-length" => {
                let parsed = value
                    .parse::<u64>()
                    .map_err(|_| ListError::MalformedContentLength)?;
                match out.content_length {
                    Some(existing) if existing != parsed => {
                        return Err(ListError::ConflictingContentLength)
                    }
                    _ => out.content_length = Some(parsed),
                }
            }
            _ => {}
        }
    }

    match kind {
        ListKind::Request if !is_connect => {
            for required in [":method", ":scheme", ":path"] {
                if !seen_pseudo.iter().any(|seen| *seen == required) {
                    return Err(ListError::MissingPseudo(required));
                }
            }
        }
        ListKind::Request => {}
        ListKind::Response => {
            if out.status.is_none() {
                return Err(ListError::MissingPseudo(":status"));
            }
        }
        ListKind::Trailers => {}
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(encoder: &mut Encoder, headers: &[(&str, &str)]) -> Bytes {
        encoder
            .encode(
                headers
                    .iter()
                    .map(|(name, value)| (name.as_bytes(), value.as_bytes())),
            )
            .unwrap()
    }

    fn assert_decodes(decoder: &mut Decoder, block: &[u8], expected: &[(&str, &str)]) {
        let decoded = decoder.decode(block).unwrap();
        let decoded: Vec<(&str, &str)> = decoded
            .iter()
            .map(|(name, value)| {
                (
                    std::str::from_utf8(name).unwrap(),
                    std::str::from_utf8(value).unwrap(),
                )
            })
            .collect();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn encode_integer_examples() {
        // https://httpwg.org/specs/rfc7541.html#integer.representation.examples
        let mut dst = BytesMut::new();
        encode_integer(10, 5, 0, &mut dst);
        assert_eq!(dst.as_ref(), &[0b0000_1010]);

        let mut dst = BytesMut::new();
        encode_integer(1337, 5, 0, &mut dst);
        assert_eq!(dst.as_ref(), &[0b0001_1111, 0b1001_1010, 0b0000_1010]);

        let mut dst = BytesMut::new();
        encode_integer(42, 8, 0, &mut dst);
        assert_eq!(dst.as_ref(), &[42]);
    }

    #[test]
    fn decode_integer_examples() {
        let mut pos = 0;
        assert_eq!(decode_integer(&[0b0000_1010], &mut pos, 5).unwrap(), 10);

        let mut pos = 0;
        assert_eq!(
            decode_integer(&[0b0001_1111, 0b1001_1010, 0b0000_1010], &mut pos, 5).unwrap(),
            1337
        );
    }

    #[test]
    fn integer_boundaries() {
        for value in [0u32, 127, 128, U31_MAX] {
            let mut dst = BytesMut::new();
            encode_integer(value, 7, 0, &mut dst);
            let mut pos = 0;
            assert_eq!(decode_integer(&dst, &mut pos, 7).unwrap(), value);
            assert_eq!(pos, dst.len());
        }

        // 2^31 must be rejected
        let mut dst = BytesMut::new();
        dst.put_u8(0x7f);
        let mut rest = u64::from(U31_MAX) + 1 - 127;
        while rest >= 128 {
            dst.put_u8((rest % 128) as u8 | 0x80);
            rest /= 128;
        }
        dst.put_u8(rest as u8);
        let mut pos = 0;
        assert_eq!(
            decode_integer(&dst, &mut pos, 7),
            Err(DecodeError::IntegerOverflow)
        );
    }

    #[test]
    fn rfc_c3_requests_without_huffman() {
        // https://httpwg.org/specs/rfc7541.html#request.examples.without.huffman.coding
        let mut decoder = Decoder::default();
        let first: &[u8] = &[
            0x82, 0x86, 0x84, 0x41, 0x0f, 0x77, 0x77, 0x77, 0x2e, 0x65, 0x78, 0x61, 0x6d, 0x70,
            0x6c, 0x65, 0x2e, 0x63, 0x6f, 0x6d,
        ];
        assert_decodes(
            &mut decoder,
            first,
            &[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ],
        );

        let second: &[u8] = &[
            0x82, 0x86, 0x84, 0xbe, 0x58, 0x08, 0x6e, 0x6f, 0x2d, 0x63, 0x61, 0x63, 0x68, 0x65,
        ];
        assert_decodes(
            &mut decoder,
            second,
            &[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
                ("cache-control", "no-cache"),
            ],
        );
    }

    #[test]
    fn rfc_c4_requests_with_huffman() {
        // https://httpwg.org/specs/rfc7541.html#request.examples.with.huffman.coding
        let mut decoder = Decoder::default();
        let first: &[u8] = &[
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        assert_decodes(
            &mut decoder,
            first,
            &[
                (":method", "GET"),
                (":scheme", "http"),
                (":path", "/"),
                (":authority", "www.example.com"),
            ],
        );
    }

    #[test]
    fn dynamic_table_sync_across_blocks() {
        let mut encoder = Encoder::default();
        let mut decoder = Decoder::default();

        let headers = [
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/"),
            ("user-agent", "x/1"),
        ];
        let first = encode_all(&mut encoder, &headers);
        assert_decodes(&mut decoder, &first, &headers);

        let second = encode_all(&mut encoder, &headers);
        assert_decodes(&mut decoder, &second, &headers);
        // the user-agent pair is now index 62: one indexed byte
        assert_eq!(*second.last().unwrap(), 0x80 | 62);
        assert!(second.len() < first.len());
    }

    #[test]
    fn sensitive_fields_stay_out_of_the_table() {
        let mut encoder = Encoder::default();
        let block = encode_all(
            &mut encoder,
            &[("authorization", "Bearer secret"), ("cookie", "session=1")],
        );
        assert_eq!(encoder.table.len(), 0);
        // never-indexed literal, indexed name authorization = 23 (4-bit prefix
        // saturates at 15, continuation byte carries the remaining 8)
        assert_eq!(&block[..2], &[0x1f, 0x08]);

        let mut decoder = Decoder::default();
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoder.table.len(), 0);
    }

    #[test]
    fn oversized_values_never_indexed() {
        let mut encoder = Encoder::default();
        let large = "v".repeat(SENSITIVE_VALUE_THRESHOLD + 1);
        let _ = encode_all(&mut encoder, &[("x-large", large.as_str())]);
        assert_eq!(encoder.table.len(), 0);
    }

    #[test]
    fn pseudo_headers_never_indexed_dynamically() {
        let mut encoder = Encoder::default();
        let _ = encode_all(&mut encoder, &[(":path", "/unique-path-value")]);
        assert_eq!(encoder.table.len(), 0);
    }

    #[test]
    fn oversized_entry_clears_table() {
        let mut table = Table::new(128);
        table.push(Bytes::from_static(b"a"), Bytes::from_static(b"b"));
        assert_eq!(table.len(), 1);
        table.push(
            Bytes::from(vec![b'x'; 200]),
            Bytes::from_static(b""),
        );
        assert_eq!(table.len(), 0);
        assert_eq!(table.current_size, 0);
    }

    #[test]
    fn shrinking_limit_evicts_oldest() {
        let mut table = Table::new(4096);
        table.push(Bytes::from_static(b"first"), Bytes::from_static(b"1"));
        table.push(Bytes::from_static(b"second"), Bytes::from_static(b"2"));
        table.resize(39); // second (6 + 1 + 32) fits, first does not
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(62).unwrap().name, "second");
    }

    #[test]
    fn table_size_update_rules() {
        let mut decoder = Decoder::with_size(4096);

        // update above the negotiated ceiling
        let mut block = BytesMut::new();
        encode_integer(8192, 5, 0x20, &mut block);
        assert_eq!(
            decoder.decode(&block),
            Err(DecodeError::TableSizeExceedsLimit(8192, 4096))
        );

        // update after a field
        let mut block = BytesMut::new();
        block.put_u8(0x82); // :method GET
        encode_integer(0, 5, 0x20, &mut block);
        assert_eq!(
            decoder.decode(&block),
            Err(DecodeError::LateTableSizeUpdate)
        );

        // valid update at block start
        let mut block = BytesMut::new();
        encode_integer(0, 5, 0x20, &mut block);
        block.put_u8(0x82);
        assert!(decoder.decode(&block).is_ok());
    }

    #[test]
    fn header_count_limit() {
        let mut decoder = Decoder::default();
        let mut limits = Limits::default();
        limits.max_headers = 3;
        decoder.set_limits(limits);
        let block = vec![0x82u8; 4];
        assert_eq!(decoder.decode(&block), Err(DecodeError::TooManyHeaders(3)));
    }

    #[test]
    fn list_size_limit() {
        let mut decoder = Decoder::default();
        let mut limits = Limits::default();
        limits.max_header_list_size = 64;
        decoder.set_limits(limits);

        let mut encoder = Encoder::default();
        let block = encode_all(&mut encoder, &[("x-big", "abcdefghijklmnopqrstuvwxyz0123456789")]);
        assert_eq!(decoder.decode(&block), Err(DecodeError::ListTooLarge(64)));
    }

    #[test]
    fn rejects_invalid_names() {
        let mut decoder = Decoder::default();
        // literal without indexing, raw name "Bad" (uppercase)
        let mut block = BytesMut::new();
        block.put_u8(0x00);
        encode_string(b"Bad", &mut block);
        encode_string(b"v", &mut block);
        assert_eq!(
            decoder.decode(&block),
            Err(DecodeError::Field(FieldError::UppercaseName))
        );
    }

    #[test]
    fn rejects_invalid_value_bytes() {
        let mut decoder = Decoder::default();
        let mut block = BytesMut::new();
        block.put_u8(0x00);
        encode_string(b"x-h", &mut block);
        encode_string(b"line1\nline2", &mut block);
        assert!(matches!(
            decoder.decode(&block),
            Err(DecodeError::Field(FieldError::InvalidValueChar(0x0a)))
        ));
    }

    #[test]
    fn request_list_validation() {
        let ok = validate_header_list(
            &[
                (":method", "GET"),
                (":scheme", "https"),
                (":path", "/"),
                ("accept", "*/*"),
            ],
            ListKind::Request,
        )
        .unwrap();
        assert_eq!(ok.content_length, None);

        assert_eq!(
            validate_header_list(
                &[(":method", "GET"), (":scheme", "https")],
                ListKind::Request
            )
            .unwrap_err(),
            ListError::MissingPseudo(":path")
        );

        assert_eq!(
            validate_header_list(
                &[
                    (":method", "GET"),
                    (":scheme", "https"),
                    (":path", "/"),
                    ("accept", "*/*"),
                    (":authority", "late.example"),
                ],
                ListKind::Request
            )
            .unwrap_err(),
            ListError::PseudoAfterRegular(":authority".to_owned())
        );

        assert_eq!(
            validate_header_list(
                &[
                    (":method", "GET"),
                    (":method", "GET"),
                    (":scheme", "https"),
                    (":path", "/"),
                ],
                ListKind::Request
            )
            .unwrap_err(),
            ListError::DuplicatePseudo(":method".to_owned())
        );

        assert_eq!(
            validate_header_list(
                &[
                    (":method", "GET"),
                    (":scheme", "https"),
                    (":path", "/"),
                    ("connection", "keep-alive"),
                ],
                ListKind::Request
            )
            .unwrap_err(),
            ListError::ConnectionSpecific("connection".to_owned())
        );

        assert_eq!(
            validate_header_list(
                &[
                    (":method", "GET"),
                    (":scheme", "https"),
                    (":path", "/"),
                    ("te", "gzip"),
                ],
                ListKind::Request
            )
            .unwrap_err(),
            ListError::BadTe
        );
    }

    #[test]
    fn response_list_validation() {
        let ok = validate_header_list(
            &[(":status", "200"), ("content-length", "12")],
            ListKind::Response,
        )
        .unwrap();
        assert_eq!(ok.status, Some(200));
        assert_eq!(ok.content_length, Some(12));

        assert_eq!(
            validate_header_list(&[("server", "x")], ListKind::Response).unwrap_err(),
            ListError::MissingPseudo(":status")
        );

        assert_eq!(
            validate_header_list(
                &[(":status", "200"), (":path", "/")],
                ListKind::Response
            )
            .unwrap_err(),
            ListError::UnknownPseudo(":path".to_owned())
        );

        assert_eq!(
            validate_header_list(
                &[
                    (":status", "200"),
                    ("content-length", "5"),
                    ("content-length", "6"),
                ],
                ListKind::Response
            )
            .unwrap_err(),
            ListError::ConflictingContentLength
        );

        // identical duplicates are tolerated
        assert!(validate_header_list(
            &[
                (":status", "200"),
                ("content-length", "5"),
                ("content-length", "5"),
            ],
            ListKind::Response
        )
        .is_ok());
    }
}
