//! In-memory chunk sink.
//!
//! Records every call the upload stream makes — staged blocks, page
//! writes, append blocks, and the committed block list — so tests can
//! assert on dispatch order and payloads without a network.  Individual
//! calls can be made to fail or to complete after a delay, which lets
//! tests exercise the sticky-fault path and out-of-order completion.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use super::ChunkSink;
use crate::conditions::{AccessConditions, BlobDescriptor, BlobHeaders, BlobMetadata};
use crate::errors::ServiceError;

/// One recorded write call, in arrival order.
#[derive(Debug, Clone)]
pub enum SinkCall {
    /// A staged block (Put Block).
    Stage { block_id: String, data: Bytes },
    /// A page range write (Put Page).
    Page { start: u64, end: u64, data: Bytes },
    /// An append block (Append Block).
    Append { offset: u64, data: Bytes },
}

#[derive(Default)]
struct SinkState {
    /// Write calls in arrival order.
    calls: Vec<SinkCall>,
    /// Identifiers of calls in the order they completed.
    completions: Vec<String>,
    /// Block list passed to `commit_block_list`, once committed.
    committed: Option<Vec<String>>,
    /// Headers and metadata captured at commit.
    commit_headers: Option<BlobHeaders>,
    commit_metadata: Option<BlobMetadata>,
    /// Conditions seen on the most recent call.
    last_conditions: Option<AccessConditions>,
    /// Injected failures, keyed by per-operation call ordinal.
    stage_failures: HashMap<usize, ServiceError>,
    page_failures: HashMap<usize, ServiceError>,
    append_failures: HashMap<usize, ServiceError>,
    commit_failure: Option<ServiceError>,
    /// Injected completion delays, keyed by per-operation call ordinal.
    stage_delays: HashMap<usize, Duration>,
    /// Per-operation call counters.
    stage_count: usize,
    page_count: usize,
    append_count: usize,
    commit_count: usize,
    /// Reported blob length for `blob_length()`.
    blob_length: u64,
    blob_length_failure: Option<ServiceError>,
}

/// In-memory [`ChunkSink`] for tests and local development.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `nth` (0-based) `stage_chunk` call fail with `err`.
    pub fn fail_stage(&self, nth: usize, err: ServiceError) {
        self.state.lock().unwrap().stage_failures.insert(nth, err);
    }

    /// Make the `nth` (0-based) `upload_page_range` call fail with `err`.
    pub fn fail_page(&self, nth: usize, err: ServiceError) {
        self.state.lock().unwrap().page_failures.insert(nth, err);
    }

    /// Make the `nth` (0-based) `append_chunk` call fail with `err`.
    pub fn fail_append(&self, nth: usize, err: ServiceError) {
        self.state.lock().unwrap().append_failures.insert(nth, err);
    }

    /// Make `commit_block_list` fail with `err`.
    pub fn fail_commit(&self, err: ServiceError) {
        self.state.lock().unwrap().commit_failure = Some(err);
    }

    /// Delay completion of the `nth` (0-based) `stage_chunk` call so a
    /// later chunk can complete first.
    pub fn delay_stage(&self, nth: usize, delay: Duration) {
        self.state.lock().unwrap().stage_delays.insert(nth, delay);
    }

    /// Set the length reported by `blob_length()`.
    pub fn set_blob_length(&self, len: u64) {
        self.state.lock().unwrap().blob_length = len;
    }

    /// Make `blob_length()` fail with `err`.
    pub fn fail_blob_length(&self, err: ServiceError) {
        self.state.lock().unwrap().blob_length_failure = Some(err);
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// All write calls, in arrival order.
    pub fn calls(&self) -> Vec<SinkCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Staged blocks in arrival order, as `(block_id, data)`.
    pub fn staged_blocks(&self) -> Vec<(String, Bytes)> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Stage { block_id, data } => Some((block_id.clone(), data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Page writes in arrival order, as `(start, end, data)`.
    pub fn page_writes(&self) -> Vec<(u64, u64, Bytes)> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Page { start, end, data } => Some((*start, *end, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Append blocks in arrival order, as `(offset, data)`.
    pub fn append_blocks(&self) -> Vec<(u64, Bytes)> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter_map(|c| match c {
                SinkCall::Append { offset, data } => Some((*offset, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Call identifiers in the order they completed (success or failure).
    pub fn completion_order(&self) -> Vec<String> {
        self.state.lock().unwrap().completions.clone()
    }

    /// The committed block list, if `commit_block_list` ran.
    pub fn committed_block_list(&self) -> Option<Vec<String>> {
        self.state.lock().unwrap().committed.clone()
    }

    /// Headers captured at commit.
    pub fn commit_headers(&self) -> Option<BlobHeaders> {
        self.state.lock().unwrap().commit_headers.clone()
    }

    /// Metadata captured at commit.
    pub fn commit_metadata(&self) -> Option<BlobMetadata> {
        self.state.lock().unwrap().commit_metadata.clone()
    }

    /// Conditions seen on the most recent call.
    pub fn last_conditions(&self) -> Option<AccessConditions> {
        self.state.lock().unwrap().last_conditions.clone()
    }

    /// Number of `commit_block_list` calls.
    pub fn commit_count(&self) -> usize {
        self.state.lock().unwrap().commit_count
    }
}

impl ChunkSink for MemorySink {
    fn stage_chunk(
        &self,
        block_id: &str,
        data: Bytes,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        let block_id = block_id.to_string();
        let conditions = conditions.clone();
        Box::pin(async move {
            let (ordinal, delay, failure) = {
                let mut state = self.state.lock().unwrap();
                let ordinal = state.stage_count;
                state.stage_count += 1;
                state.calls.push(SinkCall::Stage {
                    block_id: block_id.clone(),
                    data,
                });
                state.last_conditions = Some(conditions);
                (
                    ordinal,
                    state.stage_delays.remove(&ordinal),
                    state.stage_failures.remove(&ordinal),
                )
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let result = match failure {
                Some(err) => Err(err),
                None => Ok(()),
            };

            self.state
                .lock()
                .unwrap()
                .completions
                .push(format!("stage:{}", ordinal));
            result
        })
    }

    fn upload_page_range(
        &self,
        start: u64,
        end: u64,
        data: Bytes,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        let conditions = conditions.clone();
        Box::pin(async move {
            let (ordinal, failure) = {
                let mut state = self.state.lock().unwrap();
                let ordinal = state.page_count;
                state.page_count += 1;
                state.calls.push(SinkCall::Page { start, end, data });
                state.last_conditions = Some(conditions);
                (ordinal, state.page_failures.remove(&ordinal))
            };

            let result = match failure {
                Some(err) => Err(err),
                None => Ok(()),
            };

            self.state
                .lock()
                .unwrap()
                .completions
                .push(format!("page:{}", ordinal));
            result
        })
    }

    fn append_chunk(
        &self,
        expected_offset: u64,
        data: Bytes,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send + '_>> {
        let conditions = conditions.clone();
        Box::pin(async move {
            let (ordinal, failure) = {
                let mut state = self.state.lock().unwrap();
                let ordinal = state.append_count;
                state.append_count += 1;
                state.calls.push(SinkCall::Append {
                    offset: expected_offset,
                    data,
                });
                state.last_conditions = Some(conditions);
                (ordinal, state.append_failures.remove(&ordinal))
            };

            let result = match failure {
                Some(err) => Err(err),
                None => Ok(()),
            };

            self.state
                .lock()
                .unwrap()
                .completions
                .push(format!("append:{}", ordinal));
            result
        })
    }

    fn commit_block_list(
        &self,
        block_ids: &[String],
        headers: &BlobHeaders,
        metadata: &BlobMetadata,
        conditions: &AccessConditions,
    ) -> Pin<Box<dyn Future<Output = Result<BlobDescriptor, ServiceError>> + Send + '_>> {
        let block_ids = block_ids.to_vec();
        let headers = headers.clone();
        let metadata = metadata.clone();
        let conditions = conditions.clone();
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.commit_count += 1;
            state.last_conditions = Some(conditions);

            if let Some(err) = state.commit_failure.take() {
                return Err(err);
            }

            state.committed = Some(block_ids);
            state.commit_headers = Some(headers);
            state.commit_metadata = Some(metadata);

            Ok(BlobDescriptor {
                etag: Some("\"memory-etag\"".to_string()),
                last_modified: None,
            })
        })
    }

    fn blob_length(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, ServiceError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.blob_length_failure.take() {
                return Err(err);
            }
            Ok(state.blob_length)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_staged_blocks_in_order() {
        let sink = MemorySink::new();
        let conditions = AccessConditions::none();

        sink.stage_chunk("id-a", Bytes::from_static(b"aaaa"), &conditions)
            .await
            .unwrap();
        sink.stage_chunk("id-b", Bytes::from_static(b"bbbb"), &conditions)
            .await
            .unwrap();

        let staged = sink.staged_blocks();
        assert_eq!(staged.len(), 2);
        assert_eq!(staged[0].0, "id-a");
        assert_eq!(staged[1].0, "id-b");
    }

    #[tokio::test]
    async fn injected_stage_failure_fires_once() {
        let sink = MemorySink::new();
        sink.fail_stage(0, ServiceError::http("put_block", 500, "boom"));

        let err = sink
            .stage_chunk("id-a", Bytes::from_static(b"x"), &AccessConditions::none())
            .await
            .unwrap_err();
        assert_eq!(err.status, Some(500));

        // The second call succeeds; the failure was consumed.
        sink.stage_chunk("id-b", Bytes::from_static(b"y"), &AccessConditions::none())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commit_captures_block_list_and_metadata() {
        let sink = MemorySink::new();
        let mut metadata = BlobMetadata::new();
        metadata.insert("origin".to_string(), "test".to_string());

        let ids = vec!["a".to_string(), "b".to_string()];
        let desc = sink
            .commit_block_list(
                &ids,
                &BlobHeaders::default(),
                &metadata,
                &AccessConditions::none(),
            )
            .await
            .unwrap();

        assert!(desc.etag.is_some());
        assert_eq!(sink.committed_block_list().unwrap(), ids);
        assert_eq!(
            sink.commit_metadata().unwrap().get("origin").unwrap(),
            "test"
        );
    }

    #[tokio::test]
    async fn blob_length_reports_configured_value() {
        let sink = MemorySink::new();
        sink.set_blob_length(42);
        assert_eq!(sink.blob_length().await.unwrap(), 42);
    }
}
