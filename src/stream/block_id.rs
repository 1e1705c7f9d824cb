//! Block ID generation for block blob uploads.
//!
//! The service requires every block ID in a blob to be base64 and the
//! same length.  IDs are derived from a random per-session prefix plus
//! a zero-padded sequence number, so the generator is a pure function
//! of session state: the Nth dispatched chunk always gets the same ID.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use uuid::Uuid;

/// Number of hex characters taken from the session UUID.
const PREFIX_LEN: usize = 8;

/// Deterministic block ID source for one upload session.
#[derive(Debug, Clone)]
pub struct BlockIdGenerator {
    prefix: String,
}

impl BlockIdGenerator {
    /// Generator with a fresh random prefix.
    pub fn new() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        Self {
            prefix: uuid[..PREFIX_LEN].to_string(),
        }
    }

    /// Generator with a caller-supplied prefix.  Used by tests to get
    /// reproducible IDs.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Block ID for the chunk at `sequence` (count of chunks dispatched
    /// before it): `base64("{prefix}{sequence:06}")`.
    pub fn block_id(&self, sequence: usize) -> String {
        let raw = format!("{}{:06}", self.prefix, sequence);
        BASE64_STANDARD.encode(raw.as_bytes())
    }
}

impl Default for BlockIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_id_format() {
        let ids = BlockIdGenerator::with_prefix("aabbccdd");
        let decoded = BASE64_STANDARD.decode(ids.block_id(0)).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "aabbccdd000000");
    }

    #[test]
    fn test_block_id_padding() {
        let ids = BlockIdGenerator::with_prefix("aabbccdd");
        let decoded = BASE64_STANDARD.decode(ids.block_id(99999)).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "aabbccdd099999");
    }

    #[test]
    fn test_block_ids_same_length() {
        // The service requires uniform ID length within one blob.
        let ids = BlockIdGenerator::new();
        assert_eq!(ids.block_id(0).len(), ids.block_id(999_999).len());
    }

    #[test]
    fn test_block_id_deterministic() {
        let ids = BlockIdGenerator::with_prefix("aabbccdd");
        assert_eq!(ids.block_id(7), ids.block_id(7));
    }

    #[test]
    fn test_different_sessions_differ() {
        let a = BlockIdGenerator::new();
        let b = BlockIdGenerator::new();
        assert_ne!(a.block_id(0), b.block_id(0));
    }
}
