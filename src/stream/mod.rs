//! Chunked upload stream core.

pub mod block_id;
mod upload;

pub use upload::{
    AppendBlobOptions, BlobKind, BlockBlobOptions, ChunkedUploadStream, PageBlobOptions,
};
