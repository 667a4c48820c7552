//! 128-bit content hashes used as cache keys.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::ProtocolVersion;

/// Marker separating the hashed part of a v2 request from its diagnostic
/// trailer (request line, project, tags, mail recipients).
pub const HASH_STOP_MARKER: &[u8] = b"HashStop";

/// A 128-bit content hash (BLAKE3 truncated to 16 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash128(pub [u8; 16]);

impl Hash128 {
    pub const LEN: usize = 16;

    /// Hash an arbitrary byte slice.
    pub fn of(bytes: &[u8]) -> Self {
        Self::from_hasher(blake3::Hasher::new().update(bytes))
    }

    /// Finish an incremental hasher into a 128-bit hash.
    pub fn from_hasher(hasher: &blake3::Hasher) -> Self {
        let digest = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        use fmt::Write;
        let mut s = String::with_capacity(32);
        for b in self.0 {
            let _ = write!(s, "{b:02x}");
        }
        s
    }
}

impl fmt::Debug for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash128({})", self.to_hex())
    }
}

impl fmt::Display for Hash128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The part of a raw request body that identifies its compiled output.
///
/// For v2+ requests everything from the first `HashStop` marker on is
/// diagnostic-only and excluded.
pub fn hashed_region(raw: &[u8], version: ProtocolVersion) -> &[u8] {
    if !version.uses_hash_stop() {
        return raw;
    }
    match memchr::memmem::find(raw, HASH_STOP_MARKER) {
        Some(pos) => &raw[..pos],
        None => raw,
    }
}

/// Cache key for a raw request body.
pub fn request_hash(raw: &[u8], version: ProtocolVersion) -> Hash128 {
    Hash128::of(hashed_region(raw, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let _guard = crate::test_guard!();
        assert_eq!(Hash128::of(b"abc"), Hash128::of(b"abc"));
        assert_ne!(Hash128::of(b"abc"), Hash128::of(b"abd"));
        assert_eq!(Hash128::of(b"abc").to_hex().len(), 32);
    }

    #[test]
    fn v2_hash_ignores_trailer_after_marker() {
        let _guard = crate::test_guard!();
        let a = br#"<Job Version="2.0" Program="x" HashStop="1" Project="A"/>"#;
        let b = br#"<Job Version="2.0" Program="x" HashStop="1" Project="B"/>"#;
        assert_eq!(
            request_hash(a, ProtocolVersion::V2),
            request_hash(b, ProtocolVersion::V2)
        );
    }

    #[test]
    fn v1_hash_covers_whole_body() {
        let _guard = crate::test_guard!();
        let a = br#"<Job Program="x" HashStop="1" Project="A"/>"#;
        let b = br#"<Job Program="x" HashStop="1" Project="B"/>"#;
        assert_ne!(
            request_hash(a, ProtocolVersion::V1),
            request_hash(b, ProtocolVersion::V1)
        );
    }

    #[test]
    fn missing_marker_hashes_everything() {
        let _guard = crate::test_guard!();
        let raw = b"<Job Program=\"y\"/>";
        assert_eq!(hashed_region(raw, ProtocolVersion::V2_1), raw);
    }
}
