//! blobstream — chunked upload engine for Azure Blob Storage.
//!
//! The core type is [`ChunkedUploadStream`]: a single-writer byte sink
//! that buffers writes into fixed-size chunks, dispatches each chunk as
//! a concurrent operation against a [`ChunkSink`], latches the first
//! failure, and commits a block-list manifest on close for block blobs.
//! Page and append blobs need no commit step; their chunks are durable
//! as soon as they complete.
//!
//! Two sinks ship with the crate: [`sink::azure::AzureChunkSink`]
//! speaks the Azure Blob REST API over `reqwest`, and
//! [`sink::memory::MemorySink`] records calls in memory for tests.

pub mod conditions;
pub mod config;
pub mod errors;
pub mod sink;
pub mod stream;

pub use conditions::{AccessConditions, BlobDescriptor, BlobHeaders, BlobMetadata};
pub use errors::{ServiceError, UploadError};
pub use sink::ChunkSink;
pub use stream::{
    AppendBlobOptions, BlobKind, BlockBlobOptions, ChunkedUploadStream, PageBlobOptions,
};
