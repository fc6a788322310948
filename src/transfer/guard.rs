use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use super::probe::ObjectHandle;
use super::range::ByteRange;
use crate::error::{Operation, TransferError};
use crate::s3::{ObjectStore, StoreError};

/// Fetches ranges of an object on the condition that it has not changed since it
/// was probed.
///
/// Concurrent range requests have no other way to notice that the object was
/// replaced part way through a download, so every request carries `If-Match`
/// with the captured version tag. A replaced object fails the request with
/// [TransferError::PreconditionFailed] instead of mixing two versions in one file.
#[derive(Clone)]
pub struct ConsistencyGuard {
    store: Arc<dyn ObjectStore>,
    handle: Arc<ObjectHandle>,
}

impl std::fmt::Debug for ConsistencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistencyGuard")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ConsistencyGuard {
    pub fn new(store: Arc<dyn ObjectStore>, handle: ObjectHandle) -> Self {
        ConsistencyGuard {
            store,
            handle: Arc::new(handle),
        }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    /// Fetch `range`, failing if the object's ETag no longer matches or if the
    /// response is not exactly the length of the range.
    #[instrument(skip(self), fields(object = %self.handle.object))]
    pub async fn fetch_range(&self, range: ByteRange) -> Result<Bytes, TransferError> {
        let object = &self.handle.object;
        let bytes = self
            .store
            .get_range(object, range, &self.handle.version_tag)
            .await
            .map_err(|e| TransferError::from_store(Operation::RangeDownload, object, e))?;

        if bytes.len() as u64 != range.len() {
            return Err(TransferError::from_store(
                Operation::RangeDownload,
                object,
                StoreError::Backend {
                    status: None,
                    source: format!(
                        "expected {} bytes for range {range}, received {}",
                        range.len(),
                        bytes.len()
                    )
                    .into(),
                },
            ));
        }
        debug!(%range, "Fetched range");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::{InMemoryStore, S3Object};
    use crate::transfer::probe::probe;
    use assert_matches::assert_matches;

    async fn setup(data: &'static str) -> (InMemoryStore, S3Object, ConsistencyGuard) {
        let store = InMemoryStore::new();
        let object = S3Object::new("bucket", "test");
        store.put_object(&object, data.into()).await.unwrap();
        let handle = probe(&store, &object).await.unwrap();
        let guard = ConsistencyGuard::new(Arc::new(store.clone()), handle);
        (store, object, guard)
    }

    #[tokio::test]
    async fn test_fetch_range_unchanged_object() {
        let (_, _, guard) = setup("Hello world! ").await;
        let bytes = guard.fetch_range(ByteRange::new(6, 11).unwrap()).await.unwrap();
        assert_eq!(&bytes[..], b"world");
    }

    #[tokio::test]
    async fn test_fetch_range_after_overwrite() {
        let (store, object, guard) = setup("Hello world! ").await;
        store.put_object(&object, "Goodbye world! ".into()).await.unwrap();

        let err = guard.fetch_range(ByteRange::new(0, 5).unwrap()).await.unwrap_err();
        assert_matches!(err, TransferError::PreconditionFailed { status: 412, .. });
        assert!(err
            .to_string()
            .starts_with("Got wrong status code 412 on range download of bucket/test"));
    }

    #[tokio::test]
    async fn test_fetch_range_short_body() {
        let (_, _, guard) = setup("short").await;
        // The store clamps ranges that run past the end of the object.
        let err = guard.fetch_range(ByteRange::new(0, 10).unwrap()).await.unwrap_err();
        assert_matches!(
            err,
            TransferError::TransferWorker {
                operation: Operation::RangeDownload,
                status: None,
                ..
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_range_backend_failure() {
        let store = InMemoryStore::new().with_failing_ranges([4]);
        let object = S3Object::new("bucket", "test");
        store.put_object(&object, "0123456789".into()).await.unwrap();
        let handle = probe(&store, &object).await.unwrap();
        let guard = ConsistencyGuard::new(Arc::new(store), handle);

        let err = guard.fetch_range(ByteRange::new(4, 8).unwrap()).await.unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert_eq!(
            err.to_string(),
            "Got wrong status code 500 on range download of bucket/test"
        );
    }
}
