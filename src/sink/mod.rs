//! Storage service capability consumed by the upload stream.
//!
//! Every sink must implement [`ChunkSink`].  The trait is the narrow
//! slice of the Blob service the chunked upload core needs: stage a
//! block, write a page range, append a block, commit a block list, and
//! read the current blob length.  Everything else the service offers is
//! out of scope here.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

use crate::conditions::{AccessConditions, BlobDescriptor, BlobHeaders, BlobMetadata};
use crate::errors::ServiceError;

pub mod azure;
pub mod memory;

/// Async chunk-upload contract.
///
/// Implementations run each call as an independent network operation;
/// the upload stream dispatches them concurrently and joins on flush.
pub trait ChunkSink: Send + Sync + 'static {
    /// Stage `data` as an uncommitted block under `block_id`
    /// (Put Block).  Staged blocks become blob content only once a
    /// block list naming them is committed.
    fn stage_chunk(
        &self,
        block_id: &str,
        data: Bytes,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>>;

    /// Write `data` to the inclusive page range `[start, end]`
    /// (Put Page with `update`).  The range length must equal
    /// `data.len()` and be a multiple of 512.
    fn upload_page_range(
        &self,
        start: u64,
        end: u64,
        data: Bytes,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>>;

    /// Append `data` at `expected_offset` (Append Block).  The service
    /// rejects the write if the blob's current length differs from
    /// `expected_offset`, guarding against concurrent appenders.
    fn append_chunk(
        &self,
        expected_offset: u64,
        data: Bytes,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>>;

    /// Commit previously staged blocks, in order, as the blob's content
    /// (Put Block List), applying `headers` and `metadata`.
    fn commit_block_list(
        &self,
        block_ids: &[String],
        headers: &BlobHeaders,
        metadata: &BlobMetadata,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<BlobDescriptor, ServiceError>> + Send + '_>>;

    /// Current committed length of the target blob, in bytes.  Used
    /// when an append session starts without an explicit offset.
    fn blob_length(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ServiceError>> + Send + '_>>;
}
