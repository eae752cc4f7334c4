//! Shared binary record codec for the persisted-state layout under
//! `<workspace>/.builder-cache/` (spec §6): cache entries, graph snapshots,
//! and checkpoints all frame their payload the same way.
//!
//! Layout (little-endian throughout):
//! ```text
//! magic:       4 bytes, b"BLDR"
//! version:     u16
//! field_count: u16
//! fields[]:    { tag: u16, len: u32, bytes: [u8; len] }
//! ```
//! A record's CRC32 and declared-length integrity check live one layer up
//! (see `checkpoint/integrity.rs`), since not every consumer of this codec
//! wants the extra 8 bytes of header.

use std::collections::BTreeMap;

use crate::error::{BuildError, BuildResult, ErrorKind};

pub const MAGIC: &[u8; 4] = b"BLDR";
pub const FORMAT_VERSION: u16 = 1;

/// A single `{tag, bytes}` field inside a record. Tags are small integers
/// assigned per record type (see each module's `field` constants) rather
/// than strings, to keep the encoding compact and order-independent.
#[derive(Debug, Clone, Default)]
pub struct RecordFields(BTreeMap<u16, Vec<u8>>);

impl RecordFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, tag: u16, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.0.insert(tag, bytes.into());
        self
    }

    pub fn set_u64(&mut self, tag: u16, value: u64) -> &mut Self {
        self.set(tag, value.to_le_bytes().to_vec())
    }

    pub fn set_str(&mut self, tag: u16, value: &str) -> &mut Self {
        self.set(tag, value.as_bytes().to_vec())
    }

    pub fn get(&self, tag: u16) -> Option<&[u8]> {
        self.0.get(&tag).map(Vec::as_slice)
    }

    pub fn get_u64(&self, tag: u16) -> BuildResult<u64> {
        let bytes = self
            .get(tag)
            .ok_or_else(|| missing_field(tag))?;
        let arr: [u8; 8] = bytes.try_into().map_err(|_| malformed_field(tag))?;
        Ok(u64::from_le_bytes(arr))
    }

    pub fn get_str(&self, tag: u16) -> BuildResult<String> {
        let bytes = self.get(tag).ok_or_else(|| missing_field(tag))?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed_field(tag))
    }

    pub fn get_bytes(&self, tag: u16) -> BuildResult<Vec<u8>> {
        self.get(tag).map(<[u8]>::to_vec).ok_or_else(|| missing_field(tag))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.0.values().map(Vec::len).sum::<usize>());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.0.len() as u16).to_le_bytes());
        for (&tag, bytes) in &self.0 {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        out
    }

    pub fn decode(data: &[u8]) -> BuildResult<Self> {
        if data.len() < 8 {
            return Err(BuildError::new(
                ErrorKind::Internal,
                "RECORD_TOO_SMALL",
                format!("record has {} bytes, need at least 8", data.len()),
            ));
        }
        if &data[0..4] != MAGIC {
            return Err(BuildError::new(
                ErrorKind::Internal,
                "RECORD_BAD_MAGIC",
                "record magic bytes do not match BLDR",
            ));
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > FORMAT_VERSION {
            return Err(BuildError::new(
                ErrorKind::Internal,
                "RECORD_UNSUPPORTED_VERSION",
                format!("record format version {version} is newer than supported {FORMAT_VERSION}"),
            ));
        }
        let field_count = u16::from_le_bytes([data[6], data[7]]);
        let mut fields = BTreeMap::new();
        let mut cursor = 8usize;
        for _ in 0..field_count {
            if cursor + 6 > data.len() {
                return Err(truncated());
            }
            let tag = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
            let len = u32::from_le_bytes([
                data[cursor + 2],
                data[cursor + 3],
                data[cursor + 4],
                data[cursor + 5],
            ]) as usize;
            cursor += 6;
            if cursor + len > data.len() {
                return Err(truncated());
            }
            fields.insert(tag, data[cursor..cursor + len].to_vec());
            cursor += len;
        }
        Ok(Self(fields))
    }
}

fn missing_field(tag: u16) -> BuildError {
    BuildError::new(
        ErrorKind::Internal,
        "RECORD_MISSING_FIELD",
        format!("field {tag} missing from record"),
    )
}

fn malformed_field(tag: u16) -> BuildError {
    BuildError::new(
        ErrorKind::Internal,
        "RECORD_MALFORMED_FIELD",
        format!("field {tag} has an unexpected encoding"),
    )
}

fn truncated() -> BuildError {
    BuildError::new(ErrorKind::Internal, "RECORD_TRUNCATED", "record ends mid-field")
}
