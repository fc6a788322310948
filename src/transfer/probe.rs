use tracing::instrument;

use crate::error::{Operation, TransferError};
use crate::s3::{ObjectStore, S3Object};

/// An object as it was when a download started.
///
/// The `version_tag` is the ETag reported by the metadata request; every range
/// of the download is fetched on the condition that it still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHandle {
    pub object: S3Object,
    pub size: u64,
    pub version_tag: String,
}

/// Fetch the size and version of `object` with a metadata-only request.
#[instrument(skip(store))]
pub async fn probe(store: &dyn ObjectStore, object: &S3Object) -> Result<ObjectHandle, TransferError> {
    let metadata = store
        .head_object(object)
        .await
        .map_err(|e| TransferError::from_store(Operation::Probe, object, e))?;
    Ok(ObjectHandle {
        object: object.clone(),
        size: metadata.size,
        version_tag: metadata.e_tag,
    })
}
