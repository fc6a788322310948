//! Loading of the shared [aws_types::SdkConfig](https://docs.rs/aws-types/latest/aws_types/sdk_config/struct.SdkConfig.html)
//! and of transfer tuning parameters from the environment.

use std::env;
use std::ffi::OsString;
use std::iter::empty;
use std::str::FromStr;

use anyhow::{Context, Result};
use aws_types::SdkConfig;
use bytesize::MIB;
use clap::Parser;
use http::Uri;

/// Range size used by parallel downloads when none is given.
pub const DEFAULT_RANGE_STEP: u64 = 5 * MIB;

/// Construct an endpoint URI from the environment.
///
/// `S3_ENDPOINT_URL` takes precedence. Otherwise, if `LOCALSTACK_HOSTNAME` is set,
/// a [LocalStack](https://docs.localstack.cloud/localstack/configuration/) endpoint is
/// built from it and `EDGE_PORT` (default `4566`).
pub(crate) fn get_endpoint_uri() -> Result<Option<Uri>> {
    if let Ok(url) = env::var("S3_ENDPOINT_URL") {
        let uri = Uri::from_str(&url).context(format!("Failed to parse S3_ENDPOINT_URL: {url}"))?;
        return Ok(Some(uri));
    }
    match env::var("LOCALSTACK_HOSTNAME") {
        Ok(host) => {
            let port = env::var("EDGE_PORT").unwrap_or_else(|_| "4566".to_string());
            let uri = format!("http://{}:{}", host, port);
            let uri =
                Uri::from_str(&uri).context(format!("Failed to parse LocalStack URI: {}", uri))?;
            Ok(Some(uri))
        }
        Err(_) => Ok(None),
    }
}

/// Create a shared `SdkConfig`, honouring an endpoint override.
///
/// # Example
///
/// ```
/// use cobalt_s3_transfer::config::load_from_env;
/// use cobalt_s3_transfer::s3::Client;
///
/// # tokio_test::block_on(async {
/// let shared_config = load_from_env().await.unwrap();
/// let client = Client::new(&shared_config);
/// # })
/// ```
///
/// Set `S3_ENDPOINT_URL` to talk to any S3 compatible service, or
/// `LOCALSTACK_HOSTNAME` (and optionally `EDGE_PORT`) to talk to LocalStack.
///
/// ## Errors
///
/// An error will be returned if an endpoint is configured but a valid URI cannot be constructed.
pub async fn load_from_env() -> Result<SdkConfig> {
    let mut shared_config = aws_config::from_env();
    if let Some(uri) = get_endpoint_uri()? {
        shared_config = shared_config.endpoint_url(uri.to_string());
    }
    Ok(shared_config.load().await)
}

/// Transfer tuning parameters, read from environment variables.
///
/// ```
/// use cobalt_s3_transfer::config::TransferEnv;
///
/// let env = TransferEnv::from_env().unwrap();
/// assert!(env.workers_count > 0);
/// ```
#[derive(Debug, Clone, Parser)]
pub struct TransferEnv {
    /// How many ranges or parts are transferred concurrently.
    #[arg(long, env = "S3_TRANSFER_WORKERS", default_value_t = 4)]
    pub workers_count: usize,
    /// Size in bytes of each ranged GET of a parallel download.
    #[arg(long, env = "S3_TRANSFER_RANGE_STEP", default_value_t = DEFAULT_RANGE_STEP)]
    pub range_step: u64,
    /// Size in bytes of the chunks a local file is split into for upload.
    #[arg(long, env = "S3_TRANSFER_PART_SIZE", default_value_t = 5 * MIB)]
    pub part_size: u64,
}

impl TransferEnv {
    /// Parse the parameters from the environment only, ignoring command line arguments.
    pub fn from_env() -> Result<Self> {
        TransferEnv::try_parse_from(empty::<OsString>())
            .context("An error occurred while parsing transfer environment variables.")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use serial_test::serial;

    /// Run `f` with the given variables set, restoring the environment afterwards.
    fn with_env<T>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> T) -> T {
        let original: Vec<_> = vars
            .iter()
            .map(|(name, _)| (*name, env::var(name).ok()))
            .collect();
        for (name, value) in vars {
            match value {
                Some(value) => env::set_var(name, value),
                None => env::remove_var(name),
            }
        }
        let result = f();
        for (name, value) in original {
            match value {
                Some(value) => env::set_var(name, value),
                None => env::remove_var(name),
            }
        }
        result
    }

    #[test]
    #[serial]
    fn test_endpoint_empty() {
        let uri = with_env(
            &[("S3_ENDPOINT_URL", None), ("LOCALSTACK_HOSTNAME", None)],
            get_endpoint_uri,
        )
        .unwrap();
        assert_eq!(uri, None);
    }

    #[test]
    #[serial]
    fn test_endpoint_localstack_host_port() {
        let uri = with_env(
            &[
                ("S3_ENDPOINT_URL", None),
                ("LOCALSTACK_HOSTNAME", Some("test_hostname")),
                ("EDGE_PORT", Some("1234")),
            ],
            get_endpoint_uri,
        )
        .unwrap();
        assert_eq!(uri, Some(Uri::from_static("http://test_hostname:1234")));
    }

    #[test]
    #[serial]
    fn test_endpoint_url_takes_precedence() {
        let uri = with_env(
            &[
                ("S3_ENDPOINT_URL", Some("http://minio:9000")),
                ("LOCALSTACK_HOSTNAME", Some("test_hostname")),
            ],
            get_endpoint_uri,
        )
        .unwrap();
        assert_eq!(uri, Some(Uri::from_static("http://minio:9000")));
    }

    #[test]
    #[serial]
    fn test_endpoint_bad_uri() {
        let err = with_env(
            &[
                ("S3_ENDPOINT_URL", None),
                ("LOCALSTACK_HOSTNAME", Some("bad:host")),
                ("EDGE_PORT", Some("not-a-number")),
            ],
            get_endpoint_uri,
        )
        .unwrap_err();
        assert!(err.to_string().contains("http"));
    }

    #[test]
    #[serial]
    fn test_transfer_env_defaults() {
        let env = with_env(
            &[
                ("S3_TRANSFER_WORKERS", None),
                ("S3_TRANSFER_RANGE_STEP", None),
                ("S3_TRANSFER_PART_SIZE", None),
            ],
            TransferEnv::from_env,
        )
        .unwrap();
        assert_eq!(env.workers_count, 4);
        assert_eq!(env.range_step, DEFAULT_RANGE_STEP);
        assert_eq!(env.part_size, 5 * MIB);
    }

    #[test]
    #[serial]
    fn test_transfer_env_overrides() {
        let env = with_env(
            &[
                ("S3_TRANSFER_WORKERS", Some("16")),
                ("S3_TRANSFER_RANGE_STEP", Some("128")),
            ],
            TransferEnv::from_env,
        )
        .unwrap();
        assert_eq!(env.workers_count, 16);
        assert_eq!(env.range_step, 128);
    }

    #[tokio::test]
    #[serial]
    async fn test_load_from_env() {
        load_from_env().await.unwrap();
    }
}
