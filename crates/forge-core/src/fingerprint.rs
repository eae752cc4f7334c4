//! Content fingerprinting: a 256-bit BLAKE3 digest used as the identity of
//! file content, action keys, and cache outputs (spec §4.1).
//!
//! Structured values are fingerprinted by first serializing into a canonical
//! form -- sorted map keys, length-prefixed strings, fixed-width integers --
//! so that two logically-equal values always hash identically regardless of
//! construction order.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, BuildResult, ErrorKind};

/// 32-byte BLAKE3 content digest.
///
/// Equality is byte equality; there is no weaker notion of "close enough".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// The fingerprint of the empty byte sequence. Defined and fixed so that
    /// "no content" always hashes the same way.
    pub fn empty() -> Self {
        Self::of_bytes(&[])
    }

    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Stream a file's contents through the hasher rather than reading it
    /// fully into memory first.
    pub fn of_file(path: &Path) -> BuildResult<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| BuildError::io("IO_NOT_FOUND", &e, path).wrap("fingerprinting file"))?;
        let mut reader = std::io::BufReader::new(file);
        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| BuildError::io("IO_READ_FAILED", &e, path).wrap("fingerprinting file"))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Fingerprint a sequence of already-computed fingerprints, in the order
    /// given. Used to combine ordered source/dep fingerprints into an
    /// [`crate::action_cache::ActionKey`] without re-reading their content.
    pub fn of_sequence<'a>(items: impl IntoIterator<Item = &'a Fingerprint>) -> Self {
        let mut canon = CanonicalWriter::new();
        for item in items {
            canon.write_bytes(item.as_bytes());
        }
        Self::of_bytes(&canon.into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Wraps a raw 32-byte array with no hashing. Used when decoding a
    /// fingerprint that was already computed and stored verbatim (e.g. an
    /// [`crate::action_cache::ActionKey`] read back from a cache entry).
    pub fn from_bytes_unchecked(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> BuildResult<Self> {
        let bytes = hex::decode(s).map_err(|e| {
            BuildError::new(ErrorKind::Internal, "FINGERPRINT_BAD_HEX", e.to_string())
        })?;
        if bytes.len() != 32 {
            return Err(BuildError::new(
                ErrorKind::Internal,
                "FINGERPRINT_BAD_LENGTH",
                format!("expected 32 bytes, got {}", bytes.len()),
            ));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Builds a canonical byte encoding of structured values for fingerprinting:
/// every string is length-prefixed, every integer is fixed-width
/// little-endian, and callers are responsible for sorting any map-like data
/// before writing it (see [`CanonicalWriter::write_sorted_map`]).
#[derive(Default)]
pub struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_bytes(s.as_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.buf.push(u8::from(v));
        self
    }

    /// Writes a sequence of strings in the order given. Callers that need
    /// order-independence must sort before calling this.
    pub fn write_ordered_strings<'a>(&mut self, items: impl IntoIterator<Item = &'a str>) -> &mut Self {
        let mut count = 0u64;
        let mut body = CanonicalWriter::new();
        for item in items {
            body.write_str(item);
            count += 1;
        }
        self.write_u64(count);
        self.buf.extend_from_slice(&body.buf);
        self
    }

    /// Writes key/value string pairs sorted by key, guaranteeing the same
    /// encoding regardless of the map's iteration order.
    pub fn write_sorted_map<'a>(&mut self, entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> &mut Self {
        let mut pairs: Vec<(&str, &str)> = entries.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        self.write_u64(pairs.len() as u64);
        for (k, v) in pairs {
            self.write_str(k);
            self.write_str(v);
        }
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fingerprint_is_fixed() {
        assert_eq!(Fingerprint::empty(), Fingerprint::of_bytes(&[]));
        assert_eq!(Fingerprint::empty(), Fingerprint::empty());
    }

    #[test]
    fn equal_bytes_hash_equal() {
        assert_eq!(Fingerprint::of_bytes(b"hello"), Fingerprint::of_bytes(b"hello"));
        assert_ne!(Fingerprint::of_bytes(b"hello"), Fingerprint::of_bytes(b"world"));
    }

    #[test]
    fn hex_round_trip() {
        let fp = Fingerprint::of_bytes(b"round trip me");
        let hex = fp.to_hex();
        assert_eq!(Fingerprint::from_hex(&hex).unwrap(), fp);
    }

    #[test]
    fn sorted_map_is_order_independent() {
        let mut a = CanonicalWriter::new();
        a.write_sorted_map([("b", "2"), ("a", "1")]);
        let mut b = CanonicalWriter::new();
        b.write_sorted_map([("a", "1"), ("b", "2")]);
        assert_eq!(a.into_bytes(), b.into_bytes());
    }

    #[test]
    fn ordered_strings_are_order_sensitive() {
        let mut a = CanonicalWriter::new();
        a.write_ordered_strings(["x", "y"]);
        let mut b = CanonicalWriter::new();
        b.write_ordered_strings(["y", "x"]);
        assert_ne!(a.into_bytes(), b.into_bytes());
    }

    #[test]
    fn file_fingerprint_matches_byte_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"stream me").unwrap();
        assert_eq!(Fingerprint::of_file(&path).unwrap(), Fingerprint::of_bytes(b"stream me"));
    }
}
