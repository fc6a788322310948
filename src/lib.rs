//! # Cobalt S3 transfers
//!
//! This library provides parallel transfers of single S3 objects, built on the
//! [aws-sdk-rust](https://github.com/awslabs/aws-sdk-rust) packages.
//!
//! * [transfer::get_file_parallel] downloads an object to a local file using
//!   concurrent ranged `GET` requests. Every range is requested with `If-Match`
//!   on the object's ETag, so an object which is overwritten mid-download fails
//!   the transfer instead of producing a corrupt file.
//! * [transfer::put_multipart] uploads a stream of chunks as a multipart upload
//!   with concurrent part uploads, aborting the upload on any failure.
//!
//! Transfers run against the [s3::ObjectStore] trait, which is implemented for
//! [s3::Client]. Enable the `test-utils` feature for an in-memory store.
//!
//! ### About harrison.ai
//!
//! This crate is maintained by the Data Engineering team at [harrison.ai](https://harrison.ai).
//!
//! At [harrison.ai](https://harrison.ai) our mission is to create AI-as-a-medical-device solutions through
//! ventures and ultimately improve the standard of healthcare for 1 million lives every day.
//!

// Public modules

pub mod config;
pub mod error;
pub mod s3;
pub mod transfer;
// Internal shared modules
#[cfg(test)]
mod test_utils;
