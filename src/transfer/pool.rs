use std::future::Future;
use std::pin::pin;

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::TransferError;

/// Runs units of work concurrently, with at most `max_concurrency` in flight.
///
/// Units are admitted in the order the source yields them and complete in any
/// order. All units are polled from the calling task; nothing is spawned.
///
/// When a unit fails the pool stops admitting, cancels the token handed to every
/// unit, waits for all in-flight units to return and then reports the first
/// failure. Units are expected to stop promptly once their token is cancelled,
/// see [until_cancelled].
#[derive(Debug, Clone)]
pub struct WorkerPool {
    max_concurrency: usize,
    parent: CancellationToken,
}

impl WorkerPool {
    /// Create a pool. `max_concurrency` must be at least 1.
    pub fn new(max_concurrency: usize) -> Result<Self, TransferError> {
        if max_concurrency == 0 {
            return Err(TransferError::Config("workers count must be at least 1".into()));
        }
        Ok(WorkerPool {
            max_concurrency,
            parent: CancellationToken::new(),
        })
    }

    /// Stop the pool, as if a unit had failed, when `parent` is cancelled.
    /// A run stopped this way returns [TransferError::Cancelled].
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.parent = parent.clone();
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run every unit produced by `units`, returning their outputs in completion order.
    #[instrument(skip_all, fields(max_concurrency = self.max_concurrency))]
    pub async fn run<S, F, Fut, T>(&self, units: S) -> Result<Vec<T>, TransferError>
    where
        S: Stream<Item = F>,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        // A fresh child per run, so cancelling one run leaves the pool reusable.
        let token = self.parent.child_token();
        let mut units = pin!(units.fuse());
        let mut in_flight = FuturesUnordered::new();
        let mut outputs = Vec::new();
        let mut first_error: Option<TransferError> = None;
        let mut exhausted = false;

        loop {
            let admitting = !exhausted
                && first_error.is_none()
                && !token.is_cancelled()
                && in_flight.len() < self.max_concurrency;
            if !admitting && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(result) = in_flight.next(), if !in_flight.is_empty() => match result {
                    Ok(output) => outputs.push(output),
                    Err(e) if first_error.is_none() => {
                        debug!(error = %e, in_flight = in_flight.len(), "Unit failed, cancelling the rest");
                        token.cancel();
                        first_error = Some(e);
                    }
                    Err(TransferError::Cancelled) => {}
                    Err(e) => warn!(error = %e, "Unit failed after the pool was cancelled"),
                },
                unit = units.next(), if admitting => match unit {
                    Some(unit) => in_flight.push(unit(token.clone())),
                    None => exhausted = true,
                },
                _ = token.cancelled(), if !token.is_cancelled() => {
                    debug!("Worker pool cancelled by its parent");
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None if !exhausted => Err(TransferError::Cancelled),
            None => Ok(outputs),
        }
    }
}

/// Await `fut` unless `token` is cancelled first, in which case `fut` is dropped
/// and [TransferError::Cancelled] is returned.
pub async fn until_cancelled<F: Future>(
    token: &CancellationToken,
    fut: F,
) -> Result<F::Output, TransferError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TransferError::Cancelled),
        output = fut => Ok(output),
    }
}
