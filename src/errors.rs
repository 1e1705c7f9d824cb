//! Upload error types.
//!
//! Every failure an upload session can surface is a variant of
//! [`UploadError`].  All variants are `Clone`: the session latches the
//! first failure it observes and hands the same error back from every
//! subsequent `write`/`flush`/`close` call.

use thiserror::Error;

/// A typed failure reported by the storage service for a single
/// request (a staged chunk, a page write, an append, or the final
/// block-list commit).
#[derive(Debug, Clone, Error)]
#[error("{operation} failed{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
pub struct ServiceError {
    /// Which service operation failed (e.g. `put_block`).
    pub operation: String,
    /// HTTP status, if the request reached the service.
    pub status: Option<u16>,
    /// Error detail, typically the response body.
    pub message: String,
}

impl ServiceError {
    /// Build a `ServiceError` for a request that got an HTTP response.
    pub fn http(operation: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Build a `ServiceError` for a request that failed before any
    /// response arrived (connect error, timeout, signing failure).
    pub fn transport(operation: &str, message: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            status: None,
            message: message.into(),
        }
    }
}

/// Errors surfaced by [`ChunkedUploadStream`](crate::ChunkedUploadStream).
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// Malformed call parameters (out-of-bounds source range).  Surfaced
    /// synchronously and never latched into the session fault.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Invalid construction parameters (unaligned page blob length,
    /// zero or over-limit chunk threshold).
    #[error("invalid upload configuration: {message}")]
    Configuration { message: String },

    /// A page blob chunk whose length is not a multiple of 512 bytes.
    /// Fatal: latched before any network dispatch is attempted.
    #[error("page chunk of {length} bytes is not 512-byte aligned")]
    ChunkAlignment { length: usize },

    /// An append would push the blob past its configured maximum size.
    /// Fatal: latched before the dispatch is attempted.
    #[error("append to offset {projected} exceeds maximum blob size {max}")]
    MaxSizeExceeded { projected: u64, max: u64 },

    /// A dispatched chunk or the final commit failed at the service.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The session has been closed; no further operations are allowed.
    #[error("upload stream is closed")]
    StreamClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_error_display_with_status() {
        let e = ServiceError::http("put_block", 412, "precondition failed");
        let s = e.to_string();
        assert!(s.contains("put_block"));
        assert!(s.contains("412"));
        assert!(s.contains("precondition failed"));
    }

    #[test]
    fn service_error_display_without_status() {
        let e = ServiceError::transport("append_block", "connection reset");
        let s = e.to_string();
        assert!(s.contains("append_block"));
        assert!(!s.contains("HTTP"));
    }

    #[test]
    fn upload_error_is_cloneable() {
        let e = UploadError::ChunkAlignment { length: 513 };
        let c = e.clone();
        assert_eq!(e.to_string(), c.to_string());
    }

    #[test]
    fn service_variant_is_transparent() {
        let inner = ServiceError::http("commit_block_list", 500, "boom");
        let e = UploadError::from(inner.clone());
        assert_eq!(e.to_string(), inner.to_string());
    }
}
