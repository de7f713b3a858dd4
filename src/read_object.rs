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

//! Object reads.
//!
//! Reads stream the object data (`alt=media`). Full reads validate the
//! CRC32C checksum (and optionally the MD5 hash) of the received bytes
//! against the values the service reports in `x-goog-hash`; ranged reads
//! cannot be validated and skip that step.

use crate::checksum::HashingSink;
use crate::error::ReadError;
use crate::model::ObjectChecksums;
use crate::transport::{InvocationId, KeyAes256, RequestOptions, StorageInner, enc};
use crate::{Error, Result};
use std::sync::Arc;

/// The byte range of a read.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum ReadRange {
    /// The whole object.
    #[default]
    Full,
    /// Everything starting at the given offset.
    Offset(u64),
    /// `count` bytes starting at `start`.
    Segment { start: u64, count: u64 },
    /// The last `count` bytes of the object.
    Tail(u64),
}

impl ReadRange {
    /// All the bytes starting at `offset`.
    pub fn offset(offset: u64) -> Self {
        Self::Offset(offset)
    }

    /// `count` bytes starting at `start`.
    pub fn segment(start: u64, count: u64) -> Self {
        Self::Segment { start, count }
    }

    /// The last `count` bytes.
    pub fn tail(count: u64) -> Self {
        Self::Tail(count)
    }

    fn header_value(&self) -> Result<Option<String>> {
        match self {
            Self::Full => Ok(None),
            Self::Offset(0) => Ok(None),
            Self::Offset(o) => Ok(Some(format!("bytes={o}-"))),
            Self::Segment { count: 0, .. } => {
                Err(Error::validation(crate::error::RangeError::ZeroLimit))
            }
            Self::Segment { start, count } => {
                Ok(Some(format!("bytes={start}-{}", start + count - 1)))
            }
            Self::Tail(count) => Ok(Some(format!("bytes=-{count}"))),
        }
    }
}

/// The request builder for object reads.
///
/// # Example
/// ```no_run
/// # use google_cloud_storage_v1::client::Storage;
/// # async fn sample(client: &Storage) -> anyhow::Result<()> {
/// let contents = client
///     .read_object("my-bucket", "my-object")
///     .send()
///     .await?
///     .all_bytes()
///     .await?;
/// println!("object contents={contents:?}");
/// # Ok(()) }
/// ```
#[derive(Clone, Debug)]
pub struct ReadObject {
    inner: Arc<StorageInner>,
    bucket: String,
    object: String,
    generation: Option<i64>,
    if_generation_match: Option<i64>,
    if_metageneration_match: Option<i64>,
    range: ReadRange,
    key: Option<KeyAes256>,
    compute_md5: bool,
    options: RequestOptions,
}

impl ReadObject {
    pub(crate) fn new<B, O>(inner: Arc<StorageInner>, bucket: B, object: O) -> Self
    where
        B: Into<String>,
        O: Into<String>,
    {
        let options = inner.request_options();
        Self {
            inner,
            bucket: bucket.into(),
            object: object.into(),
            generation: None,
            if_generation_match: None,
            if_metageneration_match: None,
            range: ReadRange::Full,
            key: None,
            compute_md5: false,
            options,
        }
    }

    /// Read a specific object generation instead of the live one.
    pub fn with_generation(mut self, v: i64) -> Self {
        self.generation = Some(v);
        self
    }

    pub fn with_if_generation_match(mut self, v: i64) -> Self {
        self.if_generation_match = Some(v);
        self
    }

    pub fn with_if_metageneration_match(mut self, v: i64) -> Self {
        self.if_metageneration_match = Some(v);
        self
    }

    /// Restrict the read to a byte range. Ranged reads skip checksum
    /// validation: the service checksums cover the whole object.
    pub fn with_read_range(mut self, range: ReadRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_key(mut self, key: KeyAes256) -> Self {
        self.key = Some(key);
        self
    }

    /// Validate the MD5 hash in addition to CRC32C on full reads.
    pub fn with_md5(mut self, enabled: bool) -> Self {
        self.compute_md5 = enabled;
        self
    }

    pub fn with_retry_policy<V: Into<crate::retry_policy::RetryPolicyArg>>(mut self, v: V) -> Self {
        self.options.retry_policy = v.into().into();
        self
    }

    pub fn with_backoff_policy<V: Into<crate::backoff_policy::BackoffPolicyArg>>(
        mut self,
        v: V,
    ) -> Self {
        self.options.backoff_policy = v.into().into();
        self
    }

    pub(crate) fn with_feature(mut self, feature: &'static str) -> Self {
        self.options.feature = Some(feature);
        self
    }

    /// Sends the request and returns the streaming response.
    pub async fn send(self) -> Result<ReadObjectResponse> {
        if self.bucket.is_empty() {
            return Err(Error::validation("the bucket name must not be empty"));
        }
        if self.object.is_empty() {
            return Err(Error::validation("the object name must not be empty"));
        }
        let range_header = self.range.header_value()?;
        let invocation = InvocationId::new();
        let retry = self.options.retry_policy.clone();
        let backoff = self.options.backoff_policy.clone();
        let response = crate::retry_loop::retry_loop(
            async move |_| self.read_attempt(&invocation, &range_header).await,
            async |duration| tokio::time::sleep(duration).await,
            true,
            retry,
            backoff,
        )
        .await?;
        Ok(response)
    }

    async fn read_attempt(
        &self,
        invocation: &InvocationId,
        range_header: &Option<String>,
    ) -> Result<ReadObjectResponse> {
        let url = self
            .inner
            .json_url(&format!("/b/{}/o/{}", self.bucket, enc(&self.object)));
        let builder = self
            .inner
            .builder(reqwest::Method::GET, url, invocation, self.options.feature)
            .query(&[("alt", "media")])
            // Disable decompressive transcoding so ranged reads and
            // checksums line up with the stored bytes.
            .header("accept-encoding", "gzip");
        let builder = self
            .generation
            .iter()
            .fold(builder, |b, v| b.query(&[("generation", v)]));
        let builder = self
            .if_generation_match
            .iter()
            .fold(builder, |b, v| b.query(&[("ifGenerationMatch", v)]));
        let builder = self
            .if_metageneration_match
            .iter()
            .fold(builder, |b, v| b.query(&[("ifMetagenerationMatch", v)]));
        let builder = match range_header {
            Some(v) => builder.header("range", v.as_str()),
            None => builder,
        };
        let builder = crate::transport::apply_encryption_headers(builder, &self.key);
        let builder = self.inner.apply_auth_headers(builder).await?;
        let response = builder.send().await.map_err(Error::io)?;
        if !response.status().is_success() {
            return Err(crate::transport::to_http_error(response).await);
        }
        // Reads without a range header cover the whole object and can be
        // checksum validated.
        ReadObjectResponse::new(response, range_header.is_none(), self.compute_md5)
    }
}

/// A streaming read of one object.
///
/// Pull the data with [next][ReadObjectResponse::next] or collect it with
/// [all_bytes][ReadObjectResponse::all_bytes]. The end of a validated read
/// reports `CONTENT_DOWNLOAD_MISMATCH` if the computed checksums disagree
/// with the service's.
#[derive(Debug)]
pub struct ReadObjectResponse {
    response: reqwest::Response,
    sink: HashingSink,
    expected: Option<ObjectChecksums>,
    expected_size: Option<u64>,
    generation: Option<i64>,
    received: u64,
    done: bool,
}

impl ReadObjectResponse {
    fn new(response: reqwest::Response, full_read: bool, compute_md5: bool) -> Result<Self> {
        // Only a complete 200 response can be checksum validated: a 206
        // covers a slice of the object while the reported checksums cover
        // all of it.
        let expected = if full_read && response.status() == reqwest::StatusCode::OK {
            response
                .headers()
                .get("x-goog-hash")
                .and_then(|v| v.to_str().ok())
                .map(ObjectChecksums::from_goog_hash_header)
        } else {
            None
        };
        let validate = expected.as_ref().is_some_and(|e| !e.is_empty());
        let expected_size = response.content_length();
        let generation = response
            .headers()
            .get("x-goog-generation")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        Ok(Self {
            response,
            sink: if validate {
                HashingSink::new(true, compute_md5)
            } else {
                HashingSink::disabled()
            },
            expected,
            expected_size,
            generation,
            received: 0,
            done: false,
        })
    }

    /// The generation of the object being read, from `x-goog-generation`.
    pub fn generation(&self) -> Option<i64> {
        self.generation
    }

    /// The size of this read, from `Content-Length`.
    pub fn size(&self) -> Option<u64> {
        self.expected_size
    }

    /// The next buffer of object data.
    ///
    /// Returns `None` at the end of a successful stream. The final buffer
    /// may be followed by a checksum or short-read error.
    pub async fn next(&mut self) -> Option<Result<bytes::Bytes>> {
        if self.done {
            return None;
        }
        match self.response.chunk().await {
            Err(e) => {
                self.done = true;
                Some(Err(Error::io(e)))
            }
            Ok(Some(chunk)) => {
                self.sink.update(self.received, &chunk);
                self.received += chunk.len() as u64;
                Some(Ok(chunk))
            }
            Ok(None) => {
                self.done = true;
                self.finish().err().map(Err)
            }
        }
    }

    /// Collects the remaining data into one buffer.
    pub async fn all_bytes(mut self) -> Result<bytes::Bytes> {
        let mut collected = Vec::new();
        while let Some(chunk) = self.next().await.transpose()? {
            collected.extend_from_slice(&chunk);
        }
        Ok(bytes::Bytes::from_owner(collected))
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(expected_size) = self.expected_size {
            if self.received < expected_size {
                return Err(Error::io(ReadError::ShortRead(
                    expected_size - self.received,
                )));
            }
            if self.received > expected_size {
                return Err(Error::io(ReadError::LongRead {
                    got: self.received,
                    expected: expected_size,
                }));
            }
        }
        let Some(expected) = self.expected.take() else {
            return Ok(());
        };
        let computed = self.sink.finalize();
        crate::checksum::validate(&expected, &computed)
            .map_err(|mismatch| Error::checksum(ReadError::ChecksumMismatch(mismatch)))
    }
}
