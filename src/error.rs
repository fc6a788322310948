//! Errors returned by parallel transfers.

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use derive_more::Display;
use thiserror::Error;

use crate::s3::{S3Object, StoreError};

/// The storage operation a [TransferError::TransferWorker] failed in.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    #[display("metadata request")]
    Probe,
    #[display("range download")]
    RangeDownload,
    #[display("multipart upload creation")]
    CreateMultipartUpload,
    #[display("part upload")]
    PartUpload,
    #[display("multipart upload completion")]
    CompleteMultipartUpload,
}

/// Custom error types for parallel transfers.
///
/// Any single failed range or part fails the whole transfer, so every variant is
/// terminal for the operation that returned it.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Object {object} does not exist")]
    ObjectNotFound { object: S3Object },
    /// The object changed after its size and ETag were captured.
    #[error("Got wrong status code {status} on range download of {object}")]
    PreconditionFailed { status: u16, object: S3Object },
    #[error("{}", worker_message(.operation, .object, .status))]
    TransferWorker {
        operation: Operation,
        object: S3Object,
        status: Option<u16>,
        #[source]
        source: StoreError,
    },
    #[error("Failed to {action} {}", .path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to read the next chunk to upload")]
    ChunkSource(#[source] Box<dyn StdError + Send + Sync>),
    #[error("Transfer was cancelled")]
    Cancelled,
    #[error("Invalid transfer configuration: {0}")]
    Config(String),
    #[error("Missing {field} in response for {object}")]
    MissingField {
        field: &'static str,
        object: S3Object,
    },
}

fn worker_message(operation: &Operation, object: &S3Object, status: &Option<u16>) -> String {
    match status {
        Some(status) => format!("Got wrong status code {status} on {operation} of {object}"),
        None => format!("{operation} of {object} failed"),
    }
}

impl TransferError {
    /// Classify a storage error raised while performing `operation` on `object`.
    pub(crate) fn from_store(operation: Operation, object: &S3Object, error: StoreError) -> Self {
        match error {
            StoreError::NotFound if operation == Operation::Probe => {
                TransferError::ObjectNotFound {
                    object: object.clone(),
                }
            }
            StoreError::PreconditionFailed { status } if operation == Operation::RangeDownload => {
                TransferError::PreconditionFailed {
                    status,
                    object: object.clone(),
                }
            }
            StoreError::MissingField(field) => TransferError::MissingField {
                field,
                object: object.clone(),
            },
            error => TransferError::TransferWorker {
                operation,
                object: object.clone(),
                status: error.status(),
                source: error,
            },
        }
    }

    pub(crate) fn filesystem(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }

    /// The HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransferError::ObjectNotFound { .. } => Some(404),
            TransferError::PreconditionFailed { status, .. } => Some(*status),
            TransferError::TransferWorker { status, .. } => *status,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_precondition_failed_message() {
        let object = S3Object::new("bucket", "test");
        let err = TransferError::from_store(
            Operation::RangeDownload,
            &object,
            StoreError::PreconditionFailed { status: 412 },
        );
        assert_eq!(err.status(), Some(412));
        assert!(err
            .to_string()
            .starts_with("Got wrong status code 412 on range download of bucket/test"));
    }

    #[test]
    fn test_not_found_on_probe() {
        let object = S3Object::new("bucket", "missing");
        let err = TransferError::from_store(Operation::Probe, &object, StoreError::NotFound);
        assert_matches!(err, TransferError::ObjectNotFound { object: o } if o == object);
    }

    #[test]
    fn test_worker_message_with_status() {
        let object = S3Object::new("bucket", "key");
        let err = TransferError::from_store(
            Operation::PartUpload,
            &object,
            StoreError::Backend {
                status: Some(500),
                source: "InternalError".to_owned().into(),
            },
        );
        assert_eq!(err.status(), Some(500));
        assert_eq!(
            err.to_string(),
            "Got wrong status code 500 on part upload of bucket/key"
        );
    }

    #[test]
    fn test_worker_message_without_status() {
        let object = S3Object::new("bucket", "key");
        let err = TransferError::from_store(
            Operation::RangeDownload,
            &object,
            StoreError::Backend {
                status: None,
                source: "connection reset".to_owned().into(),
            },
        );
        assert_eq!(err.to_string(), "range download of bucket/key failed");
    }
}
