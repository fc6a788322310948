//! Parallel transfers of single objects.
//!
//! [get_file_parallel] downloads an object into a local file using concurrent
//! ranged requests, and [put_multipart] uploads a stream of chunks as a multipart
//! upload with concurrent part uploads. Both bound their concurrency with a
//! [WorkerPool] and stop at the first failure, cleaning up after themselves: a
//! failed download removes its file, a failed upload aborts its multipart session.

use derive_more::Display;

mod download;
mod guard;
mod pool;
mod probe;
mod range;
mod upload;
mod writer;

pub use download::{get_file_parallel, ParallelDownload};
pub use guard::ConsistencyGuard;
pub use pool::{until_cancelled, WorkerPool};
pub use probe::{probe, ObjectHandle};
pub use range::{plan, ByteRange};
pub use upload::{
    put_multipart, MultipartSession, MultipartUpload, PartDescriptor, MAX_PARTS, MAX_PART_SIZE,
    MIN_PART_SIZE,
};
pub use writer::{FileWriter, WriteStrategy};

/// Lifecycle of a transfer, as reported in its logs.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    #[display("planned")]
    Planned,
    #[display("in progress")]
    InProgress,
    #[display("completed")]
    Completed,
    #[display("aborted")]
    Aborted,
}
