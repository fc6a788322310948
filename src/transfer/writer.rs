use std::fs::File;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use crate::error::TransferError;

/// How a [FileWriter] places ranges in the destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Positional writes at each range's offset. Ranges never overlap, so
    /// concurrent writers need no coordination.
    DirectOffsetWrite,
    /// Seek then write while holding a lock, one range at a time. Produces the
    /// same file as [WriteStrategy::DirectOffsetWrite].
    SerializedSeekWrite,
}

impl WriteStrategy {
    /// The strategy to use on the current platform.
    pub fn detect() -> Self {
        if cfg!(any(unix, windows)) {
            WriteStrategy::DirectOffsetWrite
        } else {
            WriteStrategy::SerializedSeekWrite
        }
    }
}

impl Default for WriteStrategy {
    fn default() -> Self {
        Self::detect()
    }
}

#[derive(Debug)]
enum Target {
    Direct(Arc<File>),
    Serialized(Mutex<tokio::fs::File>),
}

/// A destination file, sized up front, that ranges are written into at their offsets.
#[derive(Debug)]
pub struct FileWriter {
    path: PathBuf,
    size: u64,
    strategy: WriteStrategy,
    target: Target,
    /// Positional writes run on blocking threads and outlive a dropped
    /// [FileWriter::write_range] future; they are drained before the file is
    /// synced or removed.
    writes: TaskTracker,
}

impl FileWriter {
    /// Create or truncate `path` and set its length to `total_size`, so the file
    /// has its final length before any range is written.
    #[instrument]
    pub async fn open_for_write(
        path: &Path,
        total_size: u64,
        strategy: WriteStrategy,
    ) -> Result<Self, TransferError> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| TransferError::filesystem("open", path, e))?;
        if let Err(e) = file.set_len(total_size).await {
            drop(file);
            remove_quietly(path).await;
            return Err(TransferError::filesystem("resize", path, e));
        }

        let target = match strategy {
            WriteStrategy::DirectOffsetWrite => Target::Direct(Arc::new(file.into_std().await)),
            WriteStrategy::SerializedSeekWrite => Target::Serialized(Mutex::new(file)),
        };
        Ok(FileWriter {
            path: path.to_owned(),
            size: total_size,
            strategy,
            target,
            writes: TaskTracker::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn strategy(&self) -> WriteStrategy {
        self.strategy
    }

    /// Write `bytes` at `offset`. The write must lie within the file's size.
    ///
    /// With [WriteStrategy::DirectOffsetWrite] the write is handed to a blocking
    /// thread and completes even if this future is dropped. Both
    /// [FileWriter::close_and_finalize] and [FileWriter::abort] wait for such
    /// writes before touching the file.
    pub async fn write_range(&self, offset: u64, bytes: Bytes) -> Result<(), TransferError> {
        let in_bounds = offset
            .checked_add(bytes.len() as u64)
            .is_some_and(|end| end <= self.size);
        if !in_bounds {
            return Err(TransferError::filesystem(
                "write",
                &self.path,
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "{} bytes at offset {offset} exceed the file size {}",
                        bytes.len(),
                        self.size
                    ),
                ),
            ));
        }

        let result = match &self.target {
            Target::Direct(file) => {
                let file = file.clone();
                self.writes
                    .spawn_blocking(move || write_all_at(&file, &bytes, offset))
                    .await
                    .map_err(io::Error::other)
                    .and_then(|r| r)
            }
            Target::Serialized(file) => {
                let mut file = file.lock().await;
                async {
                    file.seek(SeekFrom::Start(offset)).await?;
                    file.write_all(&bytes).await?;
                    file.flush().await
                }
                .await
            }
        };
        result.map_err(|e| TransferError::filesystem("write", &self.path, e))
    }

    /// Flush outstanding writes and close the file. The file is removed if
    /// it cannot be synced.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn close_and_finalize(self) -> Result<PathBuf, TransferError> {
        self.drain_writes().await;
        let result = match self.target {
            Target::Direct(file) => tokio::task::spawn_blocking(move || file.sync_all())
                .await
                .map_err(io::Error::other)
                .and_then(|r| r),
            Target::Serialized(file) => file.into_inner().sync_all().await,
        };
        if let Err(e) = result {
            remove_quietly(&self.path).await;
            return Err(TransferError::filesystem("sync", &self.path, e));
        }
        debug!("Destination file finalised");
        Ok(self.path)
    }

    /// Close and delete the file, leaving nothing behind.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn abort(self) {
        self.drain_writes().await;
        drop(self.target);
        remove_quietly(&self.path).await;
    }

    async fn drain_writes(&self) {
        self.writes.close();
        self.writes.wait().await;
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed destination file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove destination file"),
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn write_all_at(_file: &File, _buf: &[u8], _offset: u64) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "positional writes are not available on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::future::try_join_all;

    const STRATEGIES: [WriteStrategy; 2] = [
        WriteStrategy::DirectOffsetWrite,
        WriteStrategy::SerializedSeekWrite,
    ];

    #[tokio::test]
    async fn test_file_is_presized() {
        for strategy in STRATEGIES {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("presized.dat");
            let writer = FileWriter::open_for_write(&path, 4096, strategy).await.unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);
            writer.close_and_finalize().await.unwrap();
            assert_eq!(std::fs::read(&path).unwrap(), vec![0; 4096]);
        }
    }

    #[tokio::test]
    async fn test_out_of_order_writes() {
        let data: Vec<u8> = (0..=255).cycle().take(1000).collect();
        for strategy in STRATEGIES {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("out.dat");
            let writer = FileWriter::open_for_write(&path, data.len() as u64, strategy)
                .await
                .unwrap();

            let writes = data.chunks(64).enumerate().rev().map(|(i, chunk)| {
                writer.write_range(i as u64 * 64, Bytes::copy_from_slice(chunk))
            });
            try_join_all(writes).await.unwrap();
            writer.close_and_finalize().await.unwrap();

            assert_eq!(std::fs::read(&path).unwrap(), data, "{strategy:?}");
        }
    }

    #[tokio::test]
    async fn test_existing_file_is_replaced() {
        for strategy in STRATEGIES {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("existing.dat");
            std::fs::write(&path, vec![b'x'; 10_000]).unwrap();

            let writer = FileWriter::open_for_write(&path, 5, strategy).await.unwrap();
            writer.write_range(0, Bytes::from_static(b"hello")).await.unwrap();
            writer.close_and_finalize().await.unwrap();

            assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        }
    }

    #[tokio::test]
    async fn test_write_past_end_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.dat");
        let writer = FileWriter::open_for_write(&path, 4, WriteStrategy::detect())
            .await
            .unwrap();
        let err = writer
            .write_range(2, Bytes::from_static(b"abc"))
            .await
            .unwrap_err();
        assert_matches!(err, TransferError::Filesystem { action: "write", .. });
    }

    #[tokio::test]
    async fn test_abort_removes_file() {
        for strategy in STRATEGIES {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("aborted.dat");
            let writer = FileWriter::open_for_write(&path, 16, strategy).await.unwrap();
            writer.write_range(0, Bytes::from_static(b"partial")).await.unwrap();
            writer.abort().await;
            assert!(!path.exists());
        }
    }

    #[tokio::test]
    async fn test_finalize_waits_for_dropped_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.dat");
        let writer = FileWriter::open_for_write(&path, 5, WriteStrategy::DirectOffsetWrite)
            .await
            .unwrap();

        // Start the write, then give up on it before it reports back.
        let mut write = Box::pin(writer.write_range(0, Bytes::from_static(b"hello")));
        let _ = futures::poll!(&mut write);
        drop(write);

        writer.close_and_finalize().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_abort_waits_for_dropped_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dropped.dat");
        let writer = FileWriter::open_for_write(&path, 5, WriteStrategy::DirectOffsetWrite)
            .await
            .unwrap();

        let mut write = Box::pin(writer.write_range(0, Bytes::from_static(b"hello")));
        let _ = futures::poll!(&mut write);
        drop(write);

        writer.abort().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_open_in_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("file.dat");
        let err = FileWriter::open_for_write(&path, 16, WriteStrategy::detect())
            .await
            .unwrap_err();
        assert_matches!(err, TransferError::Filesystem { action: "open", .. });
        assert!(!path.exists());
    }
}
