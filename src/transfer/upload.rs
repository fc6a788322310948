use std::error::Error as StdError;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use bytesize::{GIB, MIB};
use futures::stream::{self, Stream, StreamExt, TryStream, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use typed_builder::TypedBuilder;

use super::pool::{until_cancelled, WorkerPool};
use super::TransferState;
use crate::error::{Operation, TransferError};
use crate::s3::{ObjectStore, S3Object, UploadedPart};

/// The smallest part S3 accepts, other than the last part of an upload.
/// Chunks are not coalesced, so every chunk but the last should be at least this large.
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// The largest part S3 accepts. Larger chunks are split.
pub const MAX_PART_SIZE: u64 = 5 * GIB;

/// The largest number of parts in one multipart upload.
pub const MAX_PARTS: i32 = 10_000;

/// One numbered part of a multipart upload.
#[derive(derive_more::Debug, Clone, PartialEq, Eq)]
pub struct PartDescriptor {
    /// 1-based, in the order the payloads appear in the object.
    pub part_number: i32,
    #[debug("{} bytes", payload.len())]
    pub payload: Bytes,
}

/// Split a chunk into pieces of at most `max_part_size` bytes. Empty chunks yield nothing.
fn split_chunk(chunk: Bytes, max_part_size: usize) -> Vec<Bytes> {
    if chunk.len() <= max_part_size {
        return if chunk.is_empty() { vec![] } else { vec![chunk] };
    }
    (0..chunk.len())
        .step_by(max_part_size)
        .map(|start| chunk.slice(start..(start + max_part_size).min(chunk.len())))
        .collect()
}

/// Number the parts of `chunks` lazily, in order, starting at 1.
fn into_parts<S>(
    chunks: S,
    max_part_size: usize,
) -> impl Stream<Item = Result<PartDescriptor, TransferError>>
where
    S: TryStream<Ok = Bytes>,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    chunks
        .into_stream()
        .flat_map(move |chunk| {
            let pieces: Vec<Result<Bytes, TransferError>> = match chunk {
                Ok(chunk) => split_chunk(chunk, max_part_size).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(TransferError::ChunkSource(e.into()))],
            };
            stream::iter(pieces)
        })
        .enumerate()
        .map(|(index, payload)| -> Result<PartDescriptor, TransferError> {
            let payload = payload?;
            let part_number = i32::try_from(index + 1)
                .ok()
                .filter(|n| *n <= MAX_PARTS)
                .ok_or_else(|| {
                    TransferError::Config(format!(
                        "an upload can have at most {MAX_PARTS} parts"
                    ))
                })?;
            Ok(PartDescriptor {
                part_number,
                payload,
            })
        })
}

/// A multipart upload session on the backend.
///
/// Exactly one of [MultipartSession::complete] or [MultipartSession::abort]
/// ends the session; both consume it.
#[derive(derive_more::Debug)]
pub struct MultipartSession {
    #[debug(skip)]
    store: Arc<dyn ObjectStore>,
    object: S3Object,
    upload_id: String,
    parts: Mutex<Vec<UploadedPart>>,
}

impl MultipartSession {
    /// Start a multipart upload of `object`.
    #[instrument(skip(store))]
    pub async fn create(
        store: Arc<dyn ObjectStore>,
        object: S3Object,
    ) -> Result<Self, TransferError> {
        let upload_id = store
            .create_multipart_upload(&object)
            .await
            .map_err(|e| TransferError::from_store(Operation::CreateMultipartUpload, &object, e))?;
        Ok(MultipartSession {
            store,
            object,
            upload_id,
            parts: Mutex::new(vec![]),
        })
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    fn recorded_parts(&self) -> std::sync::MutexGuard<'_, Vec<UploadedPart>> {
        self.parts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Upload one part and record its ETag.
    #[instrument(skip(self, part), fields(upload_id = %self.upload_id, part_number = part.part_number))]
    pub async fn upload_part(&self, part: PartDescriptor) -> Result<(), TransferError> {
        let size = part.payload.len();
        let e_tag = self
            .store
            .upload_part(&self.object, &self.upload_id, part.part_number, part.payload)
            .await
            .map_err(|e| TransferError::from_store(Operation::PartUpload, &self.object, e))?;
        debug!(size, "Uploaded part");
        self.recorded_parts().push(UploadedPart {
            part_number: part.part_number,
            e_tag,
        });
        Ok(())
    }

    /// Assemble the recorded parts in part number order. The session is aborted
    /// if the backend rejects the completion.
    #[instrument(skip(self), fields(upload_id = %self.upload_id))]
    pub async fn complete(self) -> Result<(), TransferError> {
        let mut parts = std::mem::take(&mut *self.recorded_parts());
        parts.sort_by_key(|part| part.part_number);
        info!(parts = parts.len(), "All parts uploaded, completing");

        let result = self
            .store
            .complete_multipart_upload(&self.object, &self.upload_id, &parts)
            .await;
        if let Err(e) = result {
            let e = TransferError::from_store(Operation::CompleteMultipartUpload, &self.object, e);
            self.abort().await;
            return Err(e);
        }
        Ok(())
    }

    /// Discard the session. Failing to abort is logged, not returned, so the
    /// error which caused the abort is the one the caller sees.
    #[instrument(skip(self), fields(upload_id = %self.upload_id))]
    pub async fn abort(self) {
        match self
            .store
            .abort_multipart_upload(&self.object, &self.upload_id)
            .await
        {
            Ok(()) => info!("Multipart upload aborted"),
            Err(e) => warn!(error = %e, "Failed to abort multipart upload"),
        }
    }
}

/// Uploads a stream of chunks as one object, uploading parts concurrently.
///
/// Each chunk becomes one part (chunks over [MAX_PART_SIZE] become several),
/// numbered in stream order. Parts may finish in any order; they are sorted by
/// part number before the upload is completed. If any part fails, the other
/// uploads are cancelled, the multipart upload is aborted and the part's error
/// is returned. Failed parts are not retried.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use bytes::Bytes;
/// use futures::stream;
/// use cobalt_s3_transfer::config::load_from_env;
/// use cobalt_s3_transfer::s3::{Client, S3Object};
/// use cobalt_s3_transfer::transfer::MultipartUpload;
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let client = Arc::new(Client::new(&shared_config));
/// let chunks = (0..8).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![0; 5 * 1024 * 1024])));
///
/// MultipartUpload::builder()
///     .store(client)
///     .destination(S3Object::new("my-bucket", "my-key"))
///     .workers_count(4)
///     .build()
///     .send(stream::iter(chunks))
///     .await
///     .unwrap();
/// # })
/// ```
#[derive(derive_more::Debug, TypedBuilder)]
pub struct MultipartUpload {
    #[debug(skip)]
    store: Arc<dyn ObjectStore>,
    destination: S3Object,
    workers_count: usize,
    #[builder(default = MAX_PART_SIZE)]
    max_part_size: u64,
    #[builder(default, setter(strip_option))]
    cancellation: Option<CancellationToken>,
}

impl MultipartUpload {
    fn pool(&self) -> Result<WorkerPool, TransferError> {
        let pool = WorkerPool::new(self.workers_count)?;
        Ok(match &self.cancellation {
            Some(token) => pool.with_cancellation(token),
            None => pool,
        })
    }

    /// Upload every chunk of `chunks` and complete the object.
    #[instrument(skip(self, chunks), fields(destination = %self.destination, workers = self.workers_count))]
    pub async fn send<S>(&self, chunks: S) -> Result<(), TransferError>
    where
        S: TryStream<Ok = Bytes>,
        S::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let pool = self.pool()?;
        let max_part_size = match self.max_part_size {
            size @ 1..=MAX_PART_SIZE => size as usize,
            size => {
                return Err(TransferError::Config(format!(
                    "max part size must be between 1 and {MAX_PART_SIZE} bytes, was {size}"
                )))
            }
        };

        info!(state = %TransferState::Planned, "Creating multipart upload");
        let session =
            MultipartSession::create(self.store.clone(), self.destination.clone()).await?;
        info!(state = %TransferState::InProgress, upload_id = session.upload_id());

        let session_ref = &session;
        let units = into_parts(chunks, max_part_size).map(|part| {
            move |token: CancellationToken| async move {
                let part = part?;
                until_cancelled(&token, session_ref.upload_part(part)).await?
            }
        });
        let mut result = pool.run(units).await.map(|_| ());

        if result.is_ok() && session.recorded_parts().is_empty() {
            // S3 cannot complete an upload without parts, so an empty source
            // is stored as a single empty part.
            result = session
                .upload_part(PartDescriptor {
                    part_number: 1,
                    payload: Bytes::new(),
                })
                .await;
        }

        match result {
            Ok(()) => {
                let completed = session.complete().await;
                let state = match completed {
                    Ok(()) => TransferState::Completed,
                    Err(_) => TransferState::Aborted,
                };
                info!(state = %state, "Multipart upload finished");
                completed
            }
            Err(e) => {
                warn!(error = %e, "Part upload failed, aborting multipart upload");
                session.abort().await;
                info!(state = %TransferState::Aborted, "Multipart upload finished");
                Err(e)
            }
        }
    }
}

/// Upload `chunks` to `destination` as a multipart upload with `workers_count`
/// concurrent part uploads. See [MultipartUpload].
pub async fn put_multipart<S>(
    store: Arc<dyn ObjectStore>,
    destination: &S3Object,
    chunks: S,
    workers_count: usize,
) -> Result<(), TransferError>
where
    S: TryStream<Ok = Bytes>,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    MultipartUpload::builder()
        .store(store)
        .destination(destination.clone())
        .workers_count(workers_count)
        .build()
        .send(chunks)
        .await
}
