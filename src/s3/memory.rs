//! An in-memory [ObjectStore], for exercising transfers without S3.
//!
//! Objects carry an ETag which changes on every write, so conditional range
//! requests behave like S3: a range fetched with a stale ETag fails with status 412.
//! Latency and failures can be injected per operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::store::{ObjectMetadata, ObjectStore, StoreError, UploadedPart, PRECONDITION_FAILED};
use super::S3Object;
use crate::transfer::ByteRange;

type PartLatency = Arc<dyn Fn(i32) -> Duration + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    e_tag: String,
}

#[derive(Debug)]
struct PendingUpload {
    object: S3Object,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    objects: HashMap<S3Object, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    aborted: Vec<String>,
    range_requests: Vec<ByteRange>,
}

impl State {
    fn next_tag(&mut self) -> String {
        self.next_id += 1;
        format!("\"{:032x}\"", self.next_id)
    }
}

/// An [ObjectStore] holding everything in memory.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    latency: Duration,
    part_latency: Option<PartLatency>,
    failing_parts: Arc<HashSet<i32>>,
    failing_range_starts: Arc<HashSet<u64>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("latency", &self.latency)
            .field("failing_parts", &self.failing_parts)
            .field("failing_range_starts", &self.failing_range_starts)
            .finish_non_exhaustive()
    }
}

/// Decrements the in-flight counter when a request finishes or is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn backend_error(status: u16, code: &str) -> StoreError {
    StoreError::Backend {
        status: Some(status),
        source: code.to_owned().into(),
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every range fetch and part upload by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Delay each part upload by a duration computed from its part number.
    pub fn with_part_latency(
        mut self,
        latency: impl Fn(i32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.part_latency = Some(Arc::new(latency));
        self
    }

    /// Make uploads of the given part numbers fail with status 500.
    pub fn with_failing_parts(mut self, parts: impl IntoIterator<Item = i32>) -> Self {
        self.failing_parts = Arc::new(parts.into_iter().collect());
        self
    }

    /// Make range fetches starting at the given offsets fail with status 500.
    pub fn with_failing_ranges(mut self, starts: impl IntoIterator<Item = u64>) -> Self {
        self.failing_range_starts = Arc::new(starts.into_iter().collect());
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another test thread panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    /// Current contents of `object`.
    pub fn object_bytes(&self, object: &S3Object) -> Option<Bytes> {
        self.state().objects.get(object).map(|o| o.data.clone())
    }

    /// Multipart sessions which have been neither completed nor aborted.
    pub fn open_uploads(&self) -> Vec<String> {
        self.state().uploads.keys().cloned().collect()
    }

    /// Upload ids of aborted multipart sessions.
    pub fn aborted_uploads(&self) -> Vec<String> {
        self.state().aborted.clone()
    }

    /// Every range requested so far, in request order.
    pub fn range_requests(&self) -> Vec<ByteRange> {
        self.state().range_requests.clone()
    }

    /// The largest number of range fetches and part uploads seen running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn head_object(&self, object: &S3Object) -> Result<ObjectMetadata, StoreError> {
        let state = self.state();
        let stored = state.objects.get(object).ok_or(StoreError::NotFound)?;
        Ok(ObjectMetadata {
            size: stored.data.len() as u64,
            e_tag: stored.e_tag.clone(),
        })
    }

    async fn get_range(
        &self,
        object: &S3Object,
        range: ByteRange,
        if_match: &str,
    ) -> Result<Bytes, StoreError> {
        let _in_flight = self.enter();
        self.state().range_requests.push(range);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing_range_starts.contains(&range.start()) {
            return Err(backend_error(500, "InternalError"));
        }

        let state = self.state();
        let stored = state
            .objects
            .get(object)
            .ok_or_else(|| backend_error(404, "NoSuchKey"))?;
        if stored.e_tag != if_match {
            return Err(StoreError::PreconditionFailed {
                status: PRECONDITION_FAILED,
            });
        }
        let len = stored.data.len() as u64;
        if range.start() >= len {
            return Err(backend_error(416, "InvalidRange"));
        }
        let end = range.end().min(len);
        Ok(stored.data.slice(range.start() as usize..end as usize))
    }

    async fn put_object(&self, object: &S3Object, body: Bytes) -> Result<(), StoreError> {
        let mut state = self.state();
        let e_tag = state.next_tag();
        state.objects.insert(
            object.clone(),
            StoredObject {
                data: body,
                e_tag,
            },
        );
        Ok(())
    }

    async fn create_multipart_upload(&self, object: &S3Object) -> Result<String, StoreError> {
        let mut state = self.state();
        state.next_id += 1;
        let upload_id = format!("upload-{}", state.next_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                object: object.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _object: &S3Object,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let _in_flight = self.enter();
        let delay = self.latency
            + self
                .part_latency
                .as_ref()
                .map_or(Duration::ZERO, |latency| latency(part_number));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_parts.contains(&part_number) {
            return Err(backend_error(500, "InternalError"));
        }

        let mut state = self.state();
        let e_tag = state.next_tag();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| backend_error(404, "NoSuchUpload"))?;
        upload.parts.insert(part_number, (e_tag.clone(), body));
        Ok(e_tag)
    }

    async fn complete_multipart_upload(
        &self,
        object: &S3Object,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| backend_error(404, "NoSuchUpload"))?;
        if &upload.object != object {
            return Err(backend_error(400, "InvalidRequest"));
        }
        if parts.is_empty() || !parts.windows(2).all(|w| w[0].part_number < w[1].part_number) {
            return Err(backend_error(400, "InvalidPartOrder"));
        }

        let mut data = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((e_tag, body)) if *e_tag == part.e_tag => data.extend_from_slice(body),
                _ => return Err(backend_error(400, "InvalidPart")),
            }
        }

        state.uploads.remove(upload_id);
        let e_tag = state.next_tag();
        state.objects.insert(
            object.clone(),
            StoredObject {
                data: data.freeze(),
                e_tag,
            },
        );
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        _object: &S3Object,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| backend_error(404, "NoSuchUpload"))?;
        state.aborted.push(upload_id.to_owned());
        Ok(())
    }
}
