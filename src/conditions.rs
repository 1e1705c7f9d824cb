//! Access conditions and blob value types.
//!
//! These small structs travel with every chunk dispatch and with the
//! final block-list commit.  They carry optimistic-concurrency
//! preconditions (lease, ETag) and the headers/metadata applied when a
//! block blob is committed.

use std::collections::HashMap;

/// Preconditions the service checks before applying a write.
#[derive(Debug, Clone, Default)]
pub struct AccessConditions {
    /// Active lease ID; sent as `x-ms-lease-id`.
    pub lease_id: Option<String>,
    /// ETag the target blob must currently have; sent as `If-Match`.
    pub if_match: Option<String>,
}

impl AccessConditions {
    /// Conditions with no preconditions set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Conditions carrying a lease ID.
    pub fn with_lease(lease_id: impl Into<String>) -> Self {
        Self {
            lease_id: Some(lease_id.into()),
            if_match: None,
        }
    }
}

/// Standard content headers applied when a block blob is committed.
#[derive(Debug, Clone, Default)]
pub struct BlobHeaders {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub cache_control: Option<String>,
}

/// User-defined metadata applied at commit (`x-ms-meta-*` headers).
pub type BlobMetadata = HashMap<String, String>;

/// Properties of a committed blob, as reported by the service.
#[derive(Debug, Clone, Default)]
pub struct BlobDescriptor {
    /// ETag of the committed blob.
    pub etag: Option<String>,
    /// `Last-Modified` response header, verbatim.
    pub last_modified: Option<String>,
}
