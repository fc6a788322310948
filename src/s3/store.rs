//! The storage-protocol operations a transfer needs, and their implementation
//! on top of [aws_sdk_s3::Client].

use std::error::Error as StdError;

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use bytes::Bytes;
use thiserror::Error;
use tracing::instrument;

use super::S3Object;
use crate::transfer::ByteRange;

/// HTTP status returned by S3 when an `If-Match` precondition does not hold.
pub const PRECONDITION_FAILED: u16 = 412;

/// Errors returned by an [ObjectStore].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object does not exist")]
    NotFound,
    #[error("Precondition failed with status {status}")]
    PreconditionFailed { status: u16 },
    #[error("Missing {0} in response")]
    MissingField(&'static str),
    #[error("S3 request failed: {source}")]
    Backend {
        status: Option<u16>,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl StoreError {
    /// The HTTP status attached to this error, when the backend produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::NotFound => Some(404),
            StoreError::PreconditionFailed { status } => Some(*status),
            StoreError::MissingField(_) => None,
            StoreError::Backend { status, .. } => *status,
        }
    }
}

impl<E: StdError + Send + Sync + 'static> From<SdkError<E, HttpResponse>> for StoreError {
    fn from(value: SdkError<E, HttpResponse>) -> Self {
        let status = value.raw_response().map(|r| r.status().as_u16());
        match status {
            Some(PRECONDITION_FAILED) => StoreError::PreconditionFailed {
                status: PRECONDITION_FAILED,
            },
            status => StoreError::Backend {
                status,
                source: Box::new(value),
            },
        }
    }
}

/// Size and version of an object, as reported by a metadata-only request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub e_tag: String,
}

/// A part that has been uploaded to a multipart session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub e_tag: String,
}

/// The object storage operations used by parallel transfers.
///
/// Implemented for [aws_sdk_s3::Client]. With the `test-utils` feature an
/// in-memory implementation is also available.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the size and ETag of `object`. Returns [StoreError::NotFound] when
    /// the object does not exist.
    async fn head_object(&self, object: &S3Object) -> Result<ObjectMetadata, StoreError>;

    /// Fetch `range` of `object`, but only if its current ETag equals `if_match`.
    async fn get_range(
        &self,
        object: &S3Object,
        range: ByteRange,
        if_match: &str,
    ) -> Result<Bytes, StoreError>;

    /// Single-shot upload of `body`.
    async fn put_object(&self, object: &S3Object, body: Bytes) -> Result<(), StoreError>;

    /// Start a multipart session, returning its upload id.
    async fn create_multipart_upload(&self, object: &S3Object) -> Result<String, StoreError>;

    /// Upload one part, returning the ETag assigned to it.
    async fn upload_part(
        &self,
        object: &S3Object,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError>;

    /// Assemble `parts`, which must be sorted by part number.
    async fn complete_multipart_upload(
        &self,
        object: &S3Object,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError>;

    /// Discard a multipart session and any parts uploaded to it.
    async fn abort_multipart_upload(
        &self,
        object: &S3Object,
        upload_id: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl ObjectStore for Client {
    #[instrument(skip(self))]
    async fn head_object(&self, object: &S3Object) -> Result<ObjectMetadata, StoreError> {
        let head = self
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|e| e.is_not_found()) {
                    StoreError::NotFound
                } else {
                    StoreError::from(e)
                }
            })?;

        let size = head
            .content_length()
            .ok_or(StoreError::MissingField("content length"))?;
        let size = u64::try_from(size).map_err(|e| StoreError::Backend {
            status: None,
            source: Box::new(e),
        })?;
        let e_tag = head
            .e_tag()
            .ok_or(StoreError::MissingField("ETag"))?
            .to_owned();
        Ok(ObjectMetadata { size, e_tag })
    }

    #[instrument(skip(self))]
    async fn get_range(
        &self,
        object: &S3Object,
        range: ByteRange,
        if_match: &str,
    ) -> Result<Bytes, StoreError> {
        let response = self
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .range(range.header_value())
            .if_match(if_match)
            .send()
            .await?;
        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend {
                status: None,
                source: Box::new(e),
            })?;
        Ok(body.into_bytes())
    }

    #[instrument(skip(self, body))]
    async fn put_object(&self, object: &S3Object, body: Bytes) -> Result<(), StoreError> {
        self.put_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .body(ByteStream::from(body))
            .send()
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn create_multipart_upload(&self, object: &S3Object) -> Result<String, StoreError> {
        let output = self
            .create_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await?;
        Ok(output
            .upload_id()
            .ok_or(StoreError::MissingField("upload id"))?
            .to_owned())
    }

    #[instrument(skip(self, body))]
    async fn upload_part(
        &self,
        object: &S3Object,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        let output = self
            .upload_part()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await?;
        Ok(output
            .e_tag()
            .ok_or(StoreError::MissingField("part ETag"))?
            .to_owned())
    }

    #[instrument(skip(self, parts))]
    async fn complete_multipart_upload(
        &self,
        object: &S3Object,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), StoreError> {
        let parts = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .e_tag(&part.e_tag)
                    .part_number(part.part_number)
                    .build()
            })
            .collect();
        let completed_multipart_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.complete_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .multipart_upload(completed_multipart_upload)
            .send()
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(
        &self,
        object: &S3Object,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.abort_multipart_upload()
            .bucket(&object.bucket)
            .key(&object.key)
            .upload_id(upload_id)
            .send()
            .await?;
        Ok(())
    }
}
