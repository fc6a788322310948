//! Download an object in parallel, or upload a local file as a multipart upload.
//!
//! ```text
//! cargo run --example transfer -- get s3://my-bucket/my-key ./my-key
//! cargo run --example transfer -- put ./my-file s3://my-bucket/my-file
//! ```
//!
//! Concurrency, range size and part size are read from `S3_TRANSFER_WORKERS`,
//! `S3_TRANSFER_RANGE_STEP` and `S3_TRANSFER_PART_SIZE`.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use clap::{Parser, Subcommand};
use cobalt_s3_transfer::config::{load_from_env, TransferEnv};
use cobalt_s3_transfer::s3::{Client, S3Object};
use cobalt_s3_transfer::transfer::{get_file_parallel, put_multipart};
use futures::stream;
use tokio::io::AsyncReadExt;
use tracing_subscriber::filter::EnvFilter;

#[derive(Debug, Parser)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download an S3 object to a local file.
    Get { source: S3Object, destination: PathBuf },
    /// Upload a local file to S3.
    Put { source: PathBuf, destination: S3Object },
}

/// Read `file` in chunks of `part_size` bytes. Only the last chunk may be shorter.
fn read_chunks(
    file: tokio::fs::File,
    part_size: usize,
) -> impl futures::Stream<Item = std::io::Result<Bytes>> {
    stream::try_unfold(file, move |mut file| async move {
        let mut chunk = BytesMut::with_capacity(part_size);
        while chunk.len() < part_size {
            let read = (&mut file)
                .take((part_size - chunk.len()) as u64)
                .read_buf(&mut chunk)
                .await?;
            if read == 0 {
                break;
            }
        }
        Ok((!chunk.is_empty()).then(|| (chunk.freeze(), file)))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let args = Args::parse();
    let env = TransferEnv::from_env()?;
    tracing::info!("Env: {:?}", env);

    let shared_config = load_from_env().await?;
    let client = Arc::new(Client::new(&shared_config));

    match args.command {
        Command::Get {
            source,
            destination,
        } => {
            let path = get_file_parallel(
                client,
                &source,
                &destination,
                env.workers_count,
                Some(env.range_step),
            )
            .await?;
            tracing::info!("Downloaded {} to {}", source, path.display());
        }
        Command::Put {
            source,
            destination,
        } => {
            let file = tokio::fs::File::open(&source)
                .await
                .with_context(|| format!("Failed to open {}", source.display()))?;
            let part_size = usize::try_from(env.part_size).context("Part size is too large")?;
            put_multipart(
                client,
                &destination,
                read_chunks(file, part_size),
                env.workers_count,
            )
            .await?;
            tracing::info!("Uploaded {} to {}", source.display(), destination);
        }
    }
    Ok(())
}
