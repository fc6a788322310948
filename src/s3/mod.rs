//! S3 object addressing and the storage operations used by transfers.
//!
//! [ObjectStore] is implemented for [aws_sdk_s3::Client], so a client created from
//! [crate::config::load_from_env] can be handed straight to a transfer.

/// Re-export of [aws_sdk_s3::client::Client](https://docs.rs/aws-sdk-s3/latest/aws_sdk_s3/client/struct.Client.html).
///
pub use aws_sdk_s3::Client;

#[cfg(any(test, feature = "test-utils"))]
mod memory;
mod s3_object;
mod store;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::InMemoryStore;
pub use s3_object::S3Object;
pub use store::{ObjectMetadata, ObjectStore, StoreError, UploadedPart, PRECONDITION_FAILED};

#[cfg(test)]
pub(crate) mod test {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use anyhow::Result;
    use aws_sdk_s3::error::SdkError;
    use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::config::load_from_env;
    use crate::test_utils::wait_for_localstack;

    pub async fn localstack_test_client() -> Client {
        wait_for_localstack().await;
        let shared_config = load_from_env().await.unwrap();
        let config = aws_sdk_s3::config::Builder::from(&shared_config)
            .force_path_style(true)
            .build();
        Client::from_conf(config)
    }

    pub async fn create_bucket(client: &Client, bucket: &str) -> Result<()> {
        let constraint = CreateBucketConfiguration::builder()
            .location_constraint(BucketLocationConstraint::ApSoutheast2)
            .build();
        match client
            .create_bucket()
            .bucket(bucket)
            .create_bucket_configuration(constraint)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(ref context))
                if context.err().is_bucket_already_owned_by_you() =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn seeded_rng<H: Hash + ?Sized>(seed: &H) -> impl Rng {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        ChaCha8Rng::seed_from_u64(hasher.finish())
    }

    pub fn generate_random_bytes(length: usize, rng: &mut impl Rng) -> Vec<u8> {
        (0..length).map(|_| rng.gen()).collect()
    }
}
