//! Chunked upload stream.
//!
//! [`ChunkedUploadStream`] is a single-writer byte sink layered over a
//! [`ChunkSink`].  Writes accumulate in a buffer; whenever the buffer
//! reaches the chunk threshold, its contents are dispatched as one
//! concurrent service operation.  `flush` joins all in-flight chunks;
//! `close` flushes and, for block blobs, commits the staged block list
//! in dispatch order.
//!
//! The session latches the first failure any chunk reports.  Once
//! faulted, every later `write`/`flush`/`close` fails with that same
//! error and no further chunk is dispatched; in-flight chunks are left
//! to finish on their own and are still drained at close so nothing
//! leaks.
//!
//! `write` must be called from within a tokio runtime: chunk dispatch
//! is `tokio::spawn`, fire-and-forget relative to the writer.  Only
//! `flush` and `close` await completion of outstanding work.

use bytes::BytesMut;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::block_id::BlockIdGenerator;
use crate::conditions::{AccessConditions, BlobDescriptor, BlobHeaders, BlobMetadata};
use crate::config::{UploadConfig, MAX_APPEND_CHUNK_SIZE, MAX_BLOCK_CHUNK_SIZE, PAGE_SIZE};
use crate::errors::{ServiceError, UploadError};
use crate::sink::ChunkSink;

/// Blob kind an upload session targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Block,
    Page,
    Append,
}

/// Options for a block blob upload session.
#[derive(Debug, Clone, Default)]
pub struct BlockBlobOptions {
    /// Chunk threshold override, in bytes.  Default 4 MiB, max 100 MiB.
    pub chunk_size: Option<u64>,
    /// Preconditions applied to every staged block and the commit.
    pub conditions: AccessConditions,
    /// Content headers applied at commit.
    pub headers: BlobHeaders,
    /// User metadata applied at commit.
    pub metadata: BlobMetadata,
}

impl BlockBlobOptions {
    /// Options taking the chunk threshold from `config`.
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            chunk_size: Some(config.block_chunk_size),
            ..Default::default()
        }
    }
}

/// Options for a page blob upload session.
#[derive(Debug, Clone, Default)]
pub struct PageBlobOptions {
    /// Chunk threshold override, in bytes.  Must be a multiple of 512;
    /// clamped to the total upload length.
    pub chunk_size: Option<u64>,
    /// Preconditions applied to every page write.
    pub conditions: AccessConditions,
}

impl PageBlobOptions {
    /// Options taking the chunk threshold from `config`.
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            chunk_size: Some(config.page_chunk_size),
            ..Default::default()
        }
    }
}

/// Options for an append blob upload session.
#[derive(Debug, Clone, Default)]
pub struct AppendBlobOptions {
    /// Chunk threshold override, in bytes.  Default 4 MiB, max 4 MiB.
    pub chunk_size: Option<u64>,
    /// Preconditions applied to every append.
    pub conditions: AccessConditions,
    /// Starting offset.  When absent, the current blob length is
    /// queried from the service at construction.
    pub start_offset: Option<u64>,
    /// Maximum blob size; an append that would cross it fails before
    /// dispatch with `MaxSizeExceeded`.
    pub max_size: Option<u64>,
}

impl AppendBlobOptions {
    /// Options taking the chunk threshold from `config`.
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            chunk_size: Some(config.append_chunk_size),
            ..Default::default()
        }
    }
}

/// First failure observed by any chunk operation.  First write wins;
/// completion callbacks from concurrent chunk tasks race on this cell.
#[derive(Clone, Default)]
struct FaultCell {
    inner: Arc<Mutex<Option<UploadError>>>,
}

impl FaultCell {
    fn record(&self, err: UploadError) {
        let mut slot = self.inner.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn get(&self) -> Option<UploadError> {
        self.inner.lock().unwrap().clone()
    }
}

/// Per-kind session state.  The kind never changes after construction.
enum KindState {
    Block {
        ids: BlockIdGenerator,
        /// Block IDs in dispatch order; this order defines the blob's
        /// content at commit.
        staged: Vec<String>,
        headers: BlobHeaders,
        metadata: BlobMetadata,
    },
    Page {
        /// Next destination offset in the blob.
        offset: u64,
    },
    Append {
        /// Next expected append position.
        offset: u64,
        max_size: Option<u64>,
    },
}

/// Single-use chunked upload session.
///
/// Not safe to drive from multiple writers concurrently; the contract
/// is one logical writer, as with any output stream.  The internal
/// fault bookkeeping is safe against concurrent chunk completions.
pub struct ChunkedUploadStream {
    sink: Arc<dyn ChunkSink>,
    kind: KindState,
    conditions: AccessConditions,
    /// Dispatch threshold; `buffer.len()` never exceeds it.
    chunk_threshold: usize,
    buffer: BytesMut,
    /// In-flight chunk tasks in dispatch order.  Completion order is
    /// unordered; `flush` drains them all.
    pending: Vec<JoinHandle<()>>,
    fault: FaultCell,
    closed: bool,
}

impl std::fmt::Debug for ChunkedUploadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedUploadStream")
            .field("chunk_threshold", &self.chunk_threshold)
            .field("buffered", &self.buffer.len())
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ChunkedUploadStream {
    /// Open a block blob session.  Chunks are staged as uncommitted
    /// blocks; `close` commits them in dispatch order.
    pub fn block_blob(
        sink: Arc<dyn ChunkSink>,
        options: BlockBlobOptions,
    ) -> Result<Self, UploadError> {
        let threshold = options
            .chunk_size
            .unwrap_or_else(|| UploadConfig::default().block_chunk_size);
        if threshold == 0 || threshold > MAX_BLOCK_CHUNK_SIZE {
            return Err(UploadError::Configuration {
                message: format!(
                    "block chunk size {} outside 1..={}",
                    threshold, MAX_BLOCK_CHUNK_SIZE
                ),
            });
        }

        Ok(Self::with_kind(
            sink,
            KindState::Block {
                ids: BlockIdGenerator::new(),
                staged: Vec::new(),
                headers: options.headers,
                metadata: options.metadata,
            },
            options.conditions,
            threshold as usize,
        ))
    }

    /// Open a page blob session uploading exactly `total_length` bytes.
    /// `total_length` must be a positive multiple of 512; the chunk
    /// threshold is clamped to it.
    pub fn page_blob(
        sink: Arc<dyn ChunkSink>,
        total_length: u64,
        options: PageBlobOptions,
    ) -> Result<Self, UploadError> {
        if total_length == 0 || total_length % PAGE_SIZE != 0 {
            return Err(UploadError::Configuration {
                message: format!(
                    "page blob length {} is not a positive multiple of {}",
                    total_length, PAGE_SIZE
                ),
            });
        }

        let configured = options
            .chunk_size
            .unwrap_or_else(|| UploadConfig::default().page_chunk_size);
        if configured == 0 || configured % PAGE_SIZE != 0 {
            return Err(UploadError::Configuration {
                message: format!(
                    "page chunk size {} is not a positive multiple of {}",
                    configured, PAGE_SIZE
                ),
            });
        }
        let threshold = configured.min(total_length);

        Ok(Self::with_kind(
            sink,
            KindState::Page { offset: 0 },
            options.conditions,
            threshold as usize,
        ))
    }

    /// Open an append blob session.  When no starting offset is given
    /// the current blob length is queried from the service.
    pub async fn append_blob(
        sink: Arc<dyn ChunkSink>,
        options: AppendBlobOptions,
    ) -> Result<Self, UploadError> {
        let threshold = options
            .chunk_size
            .unwrap_or_else(|| UploadConfig::default().append_chunk_size);
        if threshold == 0 || threshold > MAX_APPEND_CHUNK_SIZE {
            return Err(UploadError::Configuration {
                message: format!(
                    "append chunk size {} outside 1..={}",
                    threshold, MAX_APPEND_CHUNK_SIZE
                ),
            });
        }

        let offset = match options.start_offset {
            Some(offset) => offset,
            None => sink.blob_length().await.map_err(UploadError::Service)?,
        };

        Ok(Self::with_kind(
            sink,
            KindState::Append {
                offset,
                max_size: options.max_size,
            },
            options.conditions,
            threshold as usize,
        ))
    }

    fn with_kind(
        sink: Arc<dyn ChunkSink>,
        kind: KindState,
        conditions: AccessConditions,
        chunk_threshold: usize,
    ) -> Self {
        Self {
            sink,
            kind,
            conditions,
            chunk_threshold,
            buffer: BytesMut::with_capacity(chunk_threshold),
            pending: Vec::new(),
            fault: FaultCell::default(),
            closed: false,
        }
    }

    /// Blob kind this session targets.
    pub fn kind(&self) -> BlobKind {
        match self.kind {
            KindState::Block { .. } => BlobKind::Block,
            KindState::Page { .. } => BlobKind::Page,
            KindState::Append { .. } => BlobKind::Append,
        }
    }

    /// Dispatch threshold in bytes.
    pub fn chunk_threshold(&self) -> usize {
        self.chunk_threshold
    }

    /// Bytes currently buffered and not yet dispatched.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Block IDs staged so far, in dispatch order (block blob only).
    pub fn staged_block_ids(&self) -> Option<&[String]> {
        match &self.kind {
            KindState::Block { staged, .. } => Some(staged),
            _ => None,
        }
    }

    /// Next destination offset (page and append blobs only).
    pub fn current_offset(&self) -> Option<u64> {
        match &self.kind {
            KindState::Page { offset } => Some(*offset),
            KindState::Append { offset, .. } => Some(*offset),
            KindState::Block { .. } => None,
        }
    }

    /// Append the whole of `buf` to the stream.
    ///
    /// Buffers the bytes, dispatching a chunk each time the buffer
    /// fills.  Never waits for network completion.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), UploadError> {
        self.write_range(buf, 0, buf.len())
    }

    /// Append `len` bytes of `buf` starting at `offset`.
    ///
    /// Fails with `InvalidArgument` if the range falls outside `buf`.
    pub fn write_range(
        &mut self,
        buf: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<(), UploadError> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| UploadError::InvalidArgument {
                message: format!("range {}+{} overflows", offset, len),
            })?;
        if end > buf.len() {
            return Err(UploadError::InvalidArgument {
                message: format!(
                    "range {}..{} out of bounds for source of {} bytes",
                    offset,
                    end,
                    buf.len()
                ),
            });
        }

        if let Some(err) = self.fault.get() {
            return Err(err);
        }

        let mut remaining = &buf[offset..end];
        while !remaining.is_empty() {
            // Re-check before every append: a chunk completion may have
            // latched a fault while this call was filling the buffer.
            if let Some(err) = self.fault.get() {
                return Err(err);
            }

            let room = self.chunk_threshold - self.buffer.len();
            let take = remaining.len().min(room);
            self.buffer.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            if self.buffer.len() == self.chunk_threshold {
                self.dispatch_chunk()?;
            }
        }
        Ok(())
    }

    /// Take the buffered bytes and dispatch them as one chunk.
    ///
    /// The network operation is spawned fire-and-forget; its failure,
    /// if any, is recorded into the fault cell at completion time.
    /// Page alignment and append max-size violations fail here, before
    /// any dispatch, and latch the session fault.
    fn dispatch_chunk(&mut self) -> Result<(), UploadError> {
        let chunk = self.buffer.split().freeze();
        let len = chunk.len();
        let sink = Arc::clone(&self.sink);
        let conditions = self.conditions.clone();
        let fault = self.fault.clone();

        let handle = match &mut self.kind {
            KindState::Block { ids, staged, .. } => {
                // Recorded optimistically at dispatch time: commit only
                // runs after every dispatch has been drained.
                let block_id = ids.block_id(staged.len());
                staged.push(block_id.clone());
                debug!(block_id = %block_id, len, "dispatching block chunk");

                tokio::spawn(async move {
                    if let Err(err) = sink.stage_chunk(&block_id, chunk, &conditions).await {
                        warn!(block_id = %block_id, error = %err, "block chunk failed");
                        fault.record(UploadError::Service(err));
                    }
                })
            }
            KindState::Page { offset } => {
                if len as u64 % PAGE_SIZE != 0 {
                    let err = UploadError::ChunkAlignment { length: len };
                    warn!(len, "page chunk rejected before dispatch");
                    self.fault.record(err.clone());
                    return Err(err);
                }
                let start = *offset;
                let end = start + len as u64 - 1;
                *offset += len as u64;
                debug!(start, end, "dispatching page chunk");

                tokio::spawn(async move {
                    if let Err(err) = sink.upload_page_range(start, end, chunk, &conditions).await
                    {
                        warn!(start, end, error = %err, "page chunk failed");
                        fault.record(UploadError::Service(err));
                    }
                })
            }
            KindState::Append { offset, max_size } => {
                let start = *offset;
                let projected = start + len as u64;
                if let Some(max) = *max_size {
                    if projected > max {
                        let err = UploadError::MaxSizeExceeded { projected, max };
                        warn!(projected, max, "append rejected before dispatch");
                        self.fault.record(err.clone());
                        return Err(err);
                    }
                }
                *offset = projected;
                debug!(offset = start, len, "dispatching append chunk");

                tokio::spawn(async move {
                    if let Err(err) = sink.append_chunk(start, chunk, &conditions).await {
                        warn!(offset = start, error = %err, "append chunk failed");
                        fault.record(UploadError::Service(err));
                    }
                })
            }
        };

        self.pending.push(handle);
        Ok(())
    }

    /// Dispatch any buffered remainder, then wait for every in-flight
    /// chunk to complete.  Fails with the latched error if any chunk
    /// has failed.
    ///
    /// This is the only synchronization point: after `flush` returns
    /// `Ok`, every previously written byte has been accepted by the
    /// service.
    pub async fn flush(&mut self) -> Result<(), UploadError> {
        if !self.buffer.is_empty() && self.fault.get().is_none() {
            // A dispatch-time failure latches the fault; it is surfaced
            // after the drain below.
            let _ = self.dispatch_chunk();
        }

        // Drain in dispatch order.  Completion order underneath is
        // whatever the service produced; outcomes were already recorded
        // by the tasks themselves.
        for handle in self.pending.drain(..) {
            if let Err(join_err) = handle.await {
                self.fault.record(UploadError::Service(ServiceError::transport(
                    "chunk_task",
                    format!("chunk task failed: {}", join_err),
                )));
            }
        }

        match self.fault.get() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flush, commit (block blob), and retire the session.
    ///
    /// Returns the committed blob's descriptor for block blobs; page
    /// and append chunks are already durable, so those kinds return
    /// `None`.  A second call fails with `StreamClosed`.  On a faulted
    /// session the pending chunks are still drained before the fault is
    /// surfaced.
    pub async fn close(&mut self) -> Result<Option<BlobDescriptor>, UploadError> {
        if self.closed {
            return Err(UploadError::StreamClosed);
        }

        let result = self.finalize().await;

        self.closed = true;
        // Stray writes after close must fail deterministically even if
        // the session never faulted.
        self.fault.record(UploadError::StreamClosed);
        result
    }

    async fn finalize(&mut self) -> Result<Option<BlobDescriptor>, UploadError> {
        self.flush().await?;

        match &self.kind {
            KindState::Block {
                staged,
                headers,
                metadata,
                ..
            } => {
                info!(blocks = staged.len(), "committing block list");
                let descriptor = self
                    .sink
                    .commit_block_list(staged, headers, metadata, &self.conditions)
                    .await
                    .map_err(UploadError::Service)?;
                Ok(Some(descriptor))
            }
            KindState::Page { .. } | KindState::Append { .. } => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::memory::MemorySink;

    fn block_stream(sink: Arc<MemorySink>, chunk_size: u64) -> ChunkedUploadStream {
        ChunkedUploadStream::block_blob(
            sink,
            BlockBlobOptions {
                chunk_size: Some(chunk_size),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn fault_cell_first_write_wins() {
        let cell = FaultCell::default();
        cell.record(UploadError::ChunkAlignment { length: 1 });
        cell.record(UploadError::StreamClosed);
        assert!(matches!(
            cell.get(),
            Some(UploadError::ChunkAlignment { length: 1 })
        ));
    }

    #[test]
    fn block_chunk_size_validated() {
        let sink = Arc::new(MemorySink::new());
        assert!(matches!(
            ChunkedUploadStream::block_blob(
                sink.clone(),
                BlockBlobOptions {
                    chunk_size: Some(0),
                    ..Default::default()
                }
            ),
            Err(UploadError::Configuration { .. })
        ));
        assert!(matches!(
            ChunkedUploadStream::block_blob(
                sink,
                BlockBlobOptions {
                    chunk_size: Some(MAX_BLOCK_CHUNK_SIZE + 1),
                    ..Default::default()
                }
            ),
            Err(UploadError::Configuration { .. })
        ));
    }

    #[test]
    fn page_length_must_be_aligned() {
        let sink = Arc::new(MemorySink::new());
        assert!(matches!(
            ChunkedUploadStream::page_blob(sink.clone(), 513, PageBlobOptions::default()),
            Err(UploadError::Configuration { .. })
        ));
        assert!(matches!(
            ChunkedUploadStream::page_blob(sink, 0, PageBlobOptions::default()),
            Err(UploadError::Configuration { .. })
        ));
    }

    #[test]
    fn options_from_config_pick_up_kind_thresholds() {
        let config = UploadConfig {
            block_chunk_size: 8 * 1024 * 1024,
            append_chunk_size: 1024,
            page_chunk_size: 2048,
        };
        assert_eq!(
            BlockBlobOptions::from_config(&config).chunk_size,
            Some(8 * 1024 * 1024)
        );
        assert_eq!(AppendBlobOptions::from_config(&config).chunk_size, Some(1024));
        assert_eq!(PageBlobOptions::from_config(&config).chunk_size, Some(2048));
    }

    #[test]
    fn kind_reports_the_target_blob_kind() {
        let sink = Arc::new(MemorySink::new());
        let stream = block_stream(sink.clone(), 4);
        assert_eq!(stream.kind(), BlobKind::Block);

        let stream =
            ChunkedUploadStream::page_blob(sink, 512, PageBlobOptions::default()).unwrap();
        assert_eq!(stream.kind(), BlobKind::Page);
    }

    #[test]
    fn page_threshold_clamped_to_total_length() {
        let sink = Arc::new(MemorySink::new());
        let stream =
            ChunkedUploadStream::page_blob(sink, 1024, PageBlobOptions::default()).unwrap();
        assert_eq!(stream.chunk_threshold(), 1024);
    }

    #[tokio::test]
    async fn write_range_bounds_checked() {
        let sink = Arc::new(MemorySink::new());
        let mut stream = block_stream(sink, 4);

        let buf = [0u8; 4];
        assert!(matches!(
            stream.write_range(&buf, 2, 3),
            Err(UploadError::InvalidArgument { .. })
        ));
        assert!(matches!(
            stream.write_range(&buf, usize::MAX, 1),
            Err(UploadError::InvalidArgument { .. })
        ));
        // In-bounds sub-range is fine and buffers without dispatch.
        stream.write_range(&buf, 1, 2).unwrap();
        assert_eq!(stream.buffered(), 2);
    }

    #[tokio::test]
    async fn empty_write_is_a_noop() {
        let sink = Arc::new(MemorySink::new());
        let mut stream = block_stream(sink.clone(), 4);
        stream.write(&[]).unwrap();
        assert_eq!(stream.buffered(), 0);
        assert!(sink.staged_blocks().is_empty());
    }

    #[tokio::test]
    async fn buffer_never_exceeds_threshold() {
        let sink = Arc::new(MemorySink::new());
        let mut stream = block_stream(sink, 4);

        stream.write(b"ABCDEFG").unwrap();
        // 7 bytes at threshold 4: one dispatch, 3 buffered.
        assert_eq!(stream.buffered(), 3);
        assert_eq!(stream.staged_block_ids().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_blob_queries_length_when_no_offset() {
        let sink = Arc::new(MemorySink::new());
        sink.set_blob_length(1024);
        let stream = ChunkedUploadStream::append_blob(sink, AppendBlobOptions::default())
            .await
            .unwrap();
        assert_eq!(stream.current_offset(), Some(1024));
    }

    #[tokio::test]
    async fn append_blob_length_query_failure_propagates() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_blob_length(ServiceError::http("get_properties", 404, "no blob"));
        let err = ChunkedUploadStream::append_blob(sink, AppendBlobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Service(_)));
    }
}
