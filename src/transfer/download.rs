use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use typed_builder::TypedBuilder;

use super::guard::ConsistencyGuard;
use super::pool::{until_cancelled, WorkerPool};
use super::probe::probe;
use super::range::{plan, ByteRange};
use super::writer::{FileWriter, WriteStrategy};
use super::TransferState;
use crate::config::DEFAULT_RANGE_STEP;
use crate::error::TransferError;
use crate::s3::{ObjectStore, S3Object};

/// The state of one download: what is being fetched, where it is written, and
/// how far it has got.
#[derive(Debug)]
struct TransferSession {
    guard: ConsistencyGuard,
    ranges: Vec<ByteRange>,
    state: TransferState,
}

impl TransferSession {
    fn transition(&mut self, state: TransferState) {
        debug!(from = %self.state, to = %state, "Download state changed");
        self.state = state;
    }
}

/// Downloads a single object to a local file by fetching byte ranges concurrently.
///
/// The object's size and ETag are read first. The destination is then created
/// (or truncated) at the object's full size and each range is written at its own
/// offset as it arrives. Every range is requested with `If-Match` set to the
/// ETag, so if the object is overwritten during the download the transfer fails
/// with [TransferError::PreconditionFailed] rather than producing a mix of both
/// versions.
///
/// Any failure removes the destination file; a file is only left behind when
/// every range was written.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use cobalt_s3_transfer::config::load_from_env;
/// use cobalt_s3_transfer::s3::{Client, S3Object};
/// use cobalt_s3_transfer::transfer::ParallelDownload;
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let client = Arc::new(Client::new(&shared_config));
///
/// let path = ParallelDownload::builder()
///     .store(client)
///     .source(S3Object::new("my-bucket", "my-key"))
///     .destination("/tmp/my-key")
///     .workers_count(4)
///     .build()
///     .send()
///     .await
///     .unwrap();
/// # })
/// ```
#[derive(derive_more::Debug, TypedBuilder)]
pub struct ParallelDownload {
    #[debug(skip)]
    store: Arc<dyn ObjectStore>,
    source: S3Object,
    #[builder(setter(into))]
    destination: PathBuf,
    workers_count: usize,
    /// Size of each requested range, in bytes. Zero fetches the whole object
    /// in one request.
    #[builder(default = DEFAULT_RANGE_STEP)]
    range_step: u64,
    #[builder(default)]
    write_strategy: WriteStrategy,
    #[builder(default, setter(strip_option))]
    cancellation: Option<CancellationToken>,
}

impl ParallelDownload {
    fn pool(&self) -> Result<WorkerPool, TransferError> {
        let pool = WorkerPool::new(self.workers_count)?;
        Ok(match &self.cancellation {
            Some(token) => pool.with_cancellation(token),
            None => pool,
        })
    }

    /// Run the download, returning the path of the completed file.
    #[instrument(skip(self), fields(source = %self.source, destination = %self.destination.display()))]
    pub async fn send(&self) -> Result<PathBuf, TransferError> {
        let pool = self.pool()?;
        let handle = probe(self.store.as_ref(), &self.source).await?;

        let mut session = TransferSession {
            ranges: plan(handle.size, self.range_step),
            guard: ConsistencyGuard::new(self.store.clone(), handle),
            state: TransferState::Planned,
        };
        info!(
            size = session.guard.handle().size,
            ranges = session.ranges.len(),
            workers = pool.max_concurrency(),
            "Planned download"
        );

        let writer = FileWriter::open_for_write(
            &self.destination,
            session.guard.handle().size,
            self.write_strategy,
        )
        .await?;
        session.transition(TransferState::InProgress);

        let result = {
            let writer = &writer;
            let guard = &session.guard;
            let units = stream::iter(session.ranges.iter().copied()).map(|range| {
                move |token: CancellationToken| async move {
                    let bytes = until_cancelled(&token, guard.fetch_range(range)).await??;
                    if token.is_cancelled() {
                        return Err(TransferError::Cancelled);
                    }
                    writer.write_range(range.start(), bytes).await
                }
            });
            pool.run(units).await
        };

        match result {
            Ok(_) => {
                let path = writer.close_and_finalize().await;
                match &path {
                    Ok(_) => session.transition(TransferState::Completed),
                    Err(_) => session.transition(TransferState::Aborted),
                }
                info!(state = %session.state, "Download finished");
                path
            }
            Err(e) => {
                warn!(error = %e, "Download failed, removing the destination file");
                writer.abort().await;
                session.transition(TransferState::Aborted);
                Err(e)
            }
        }
    }
}

/// Download `source` into `destination` with `workers_count` concurrent range
/// requests of `range_step` bytes each ([DEFAULT_RANGE_STEP] if `None`).
/// See [ParallelDownload].
pub async fn get_file_parallel(
    store: Arc<dyn ObjectStore>,
    source: &S3Object,
    destination: impl AsRef<Path>,
    workers_count: usize,
    range_step: Option<u64>,
) -> Result<PathBuf, TransferError> {
    ParallelDownload::builder()
        .store(store)
        .source(source.clone())
        .destination(destination.as_ref())
        .workers_count(workers_count)
        .range_step(range_step.unwrap_or(DEFAULT_RANGE_STEP))
        .build()
        .send()
        .await
}
