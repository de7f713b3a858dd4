// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Google Cloud Client Libraries for Rust - Storage JSON API
//!
//! This crate is a client for the Cloud Storage JSON API: bucket and object
//! lifecycle, access controls, IAM, change notifications, HMAC keys, signed
//! URLs, and robust bulk data transfer:
//!
//! - resumable chunked uploads with `Content-Range` offset reconciliation
//!   and end-to-end CRC32C/MD5 validation
//!   ([resumable_upload]),
//! - XML multipart uploads with resumable parts maps
//!   ([multipart_upload]),
//! - streaming, checksum-validated reads ([read_object]),
//! - a transfer manager running bulk operations on a bounded-concurrency
//!   scheduler with admission backpressure ([transfer]).
//!
//! Start with a [client::Storage]:
//!
//! ```no_run
//! # async fn sample() -> anyhow::Result<()> {
//! use google_cloud_storage_v1::client::Storage;
//! use google_cloud_storage_v1::credentials::StaticTokenCredentials;
//!
//! let client = Storage::builder()
//!     .with_credentials(StaticTokenCredentials::new("access-token"))
//!     .build()?;
//! let object = client
//!     .resumable_upload("my-bucket", "greeting.txt", "hello world")
//!     .send()
//!     .await?;
//! println!("uploaded generation {}", object.generation);
//! # Ok(()) }
//! ```
//!
//! The client does not acquire tokens; see [credentials] for the pluggable
//! provider interface.

pub mod backoff_policy;
pub mod checksum;
pub mod client;
pub mod credentials;
pub mod error;
pub mod model;
pub mod multipart_upload;
pub mod read_object;
pub mod resumable_upload;
mod retry_loop;
pub mod retry_policy;
pub mod signed_url;
pub mod transfer;
mod transport;
pub mod upload_source;

pub use error::Error;
pub use transport::KeyAes256;

/// The result type used by all operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;
