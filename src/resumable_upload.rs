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

//! Resumable uploads.
//!
//! The engine negotiates a session URI, then either streams the whole
//! object in one `PUT` (no chunk size configured) or pushes `Content-Range`
//! chunks in sequence. The service acknowledges progress with
//! `308 Resume Incomplete` and a `Range` header; acknowledged bytes are
//! dropped from the local cache, unacknowledged tails are re-sent. After
//! transient failures the engine probes the session for the committed
//! offset before sending more data.

mod progress;

use crate::checksum::{ChecksummedSource, HashingSink};
use crate::error::UploadError;
use crate::model::{Object, ObjectChecksums};
use crate::retry_policy::ContinueOn308;
use crate::transport::{
    InvocationId, KeyAes256, RESUME_INCOMPLETE, RequestOptions, StorageInner,
    apply_encryption_headers,
};
use crate::upload_source::{Seek, StreamingSource};
use crate::{Error, Result};
use progress::InProgressUpload;
pub(crate) use progress::UPLOAD_QUANTUM;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The persisted state of a resumable upload session.
///
/// Holding on to this record makes an interrupted upload recoverable: a
/// later process reconstructs the upload with [ResumableUpload::with_session]
/// and the engine continues from the committed offset.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumableSession {
    /// The server-issued session URI.
    pub uri: String,
    /// The highest offset the server confirmed, if known. `None` forces a
    /// status probe before any data is sent.
    pub committed_offset: Option<u64>,
}

/// A request builder for resumable uploads.
///
/// # Example
/// ```no_run
/// # use google_cloud_storage_v1::client::Storage;
/// # async fn sample(client: &Storage) -> anyhow::Result<()> {
/// let object = client
///     .resumable_upload("my-bucket", "my-object", "hello world")
///     .send()
///     .await?;
/// println!("uploaded: {object:?}");
/// # Ok(()) }
/// ```
pub struct ResumableUpload<S> {
    inner: Arc<StorageInner>,
    bucket: String,
    object: String,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    if_generation_match: Option<i64>,
    if_metageneration_match: Option<i64>,
    kms_key_name: Option<String>,
    predefined_acl: Option<String>,
    origin: Option<String>,
    chunk_size: Option<usize>,
    known_size: Option<u64>,
    session: Option<ResumableSession>,
    key: Option<KeyAes256>,
    crc32c_enabled: bool,
    md5_enabled: bool,
    precomputed: Option<ObjectChecksums>,
    options: RequestOptions,
    cancel: CancellationToken,
    payload: S,
}

impl<S> ResumableUpload<S> {
    pub(crate) fn new<B, O>(inner: Arc<StorageInner>, bucket: B, object: O, payload: S) -> Self
    where
        B: Into<String>,
        O: Into<String>,
    {
        let options = inner.request_options();
        Self {
            inner,
            bucket: bucket.into(),
            object: object.into(),
            content_type: None,
            metadata: HashMap::new(),
            if_generation_match: None,
            if_metageneration_match: None,
            kms_key_name: None,
            predefined_acl: None,
            origin: None,
            chunk_size: None,
            known_size: None,
            session: None,
            key: None,
            crc32c_enabled: true,
            md5_enabled: false,
            precomputed: None,
            options,
            cancel: CancellationToken::new(),
            payload,
        }
    }

    /// Upload the object in chunks of `size` bytes.
    ///
    /// The size must be a positive multiple of 256 KiB. Without a chunk size
    /// the engine streams the object in a single request.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = Some(size);
        self
    }

    /// Declares the total object size up front, overriding the source's own
    /// size hint.
    pub fn with_known_size(mut self, size: u64) -> Self {
        self.known_size = Some(size);
        self
    }

    /// Resume a previously interrupted session.
    ///
    /// With a committed offset the source is fast-forwarded to it; without
    /// one the engine probes the session before sending any data.
    pub fn with_session(mut self, session: ResumableSession) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_content_type<T: Into<String>>(mut self, v: T) -> Self {
        self.content_type = Some(v.into());
        self
    }

    pub fn with_metadata<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.metadata.insert(key.into(), value.into());
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

    pub fn with_kms_key_name<T: Into<String>>(mut self, v: T) -> Self {
        self.kms_key_name = Some(v.into());
        self
    }

    pub fn with_predefined_acl<T: Into<String>>(mut self, v: T) -> Self {
        self.predefined_acl = Some(v.into());
        self
    }

    pub fn with_origin<T: Into<String>>(mut self, v: T) -> Self {
        self.origin = Some(v.into());
        self
    }

    /// Use a customer-supplied encryption key.
    pub fn with_key(mut self, key: KeyAes256) -> Self {
        self.key = Some(key);
        self
    }

    /// Enable or disable client-side CRC32C computation. On by default.
    pub fn with_crc32c(mut self, enabled: bool) -> Self {
        self.crc32c_enabled = enabled;
        self
    }

    /// Enable or disable client-side MD5 computation. Off by default.
    pub fn with_md5(mut self, enabled: bool) -> Self {
        self.md5_enabled = enabled;
        self
    }

    /// Provide known checksums for the data. They are sent with the
    /// finalizing request and checked against the service's values.
    pub fn with_precomputed_checksums(mut self, v: ObjectChecksums) -> Self {
        self.precomputed = Some(v);
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

    /// Interrupting the upload via this token preserves the session state in
    /// the returned error, see [UploadError::Aborted].
    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn validate(&self, partial: bool) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(Error::validation("the bucket name must not be empty"));
        }
        if self.object.is_empty() {
            return Err(Error::validation("the object name must not be empty"));
        }
        if let Some(size) = self.chunk_size {
            if size == 0 || size % UPLOAD_QUANTUM != 0 {
                return Err(Error::validation(format!(
                    "chunk size must be a positive multiple of {UPLOAD_QUANTUM}, got {size}"
                )));
            }
        }
        if partial && self.chunk_size.is_none() {
            return Err(Error::validation(
                "partial uploads require a chunk size",
            ));
        }
        Ok(())
    }
}

impl<S> ResumableUpload<S>
where
    S: StreamingSource + Seek + Send + Sync + 'static,
{
    /// Performs the upload and returns the finalized object.
    pub async fn send(self) -> Result<Object> {
        self.validate(false)?;
        let (engine, chunk_size, hint) = self.into_engine().await?;
        match chunk_size {
            None => engine.single_shot(hint).await,
            Some(chunk_size) => match engine.chunked(chunk_size, hint, false).await? {
                ChunkedOutcome::Finalized(object) => Ok(*object),
                ChunkedOutcome::Session(_) => unreachable!("non-partial uploads finalize"),
            },
        }
    }

    /// Uploads the source as a prefix of the object without finalizing it.
    ///
    /// The object stays incomplete; the returned session lets a later
    /// [ResumableUpload::with_session] call append more data or finalize.
    /// Requires a chunk size.
    pub async fn send_partial(self) -> Result<ResumableSession> {
        self.validate(true)?;
        let (engine, chunk_size, hint) = self.into_engine().await?;
        let chunk_size = chunk_size.expect("validated above");
        match engine.chunked(chunk_size, hint, true).await? {
            ChunkedOutcome::Session(session) => Ok(session),
            ChunkedOutcome::Finalized(_) => Err(Error::other(
                "the service finalized an upload marked as partial",
            )),
        }
    }

    async fn into_engine(self) -> Result<(Engine<S>, Option<usize>, (u64, Option<u64>))> {
        let hint = match self.known_size {
            Some(n) => (n, Some(n)),
            None => self.payload.size_hint().await.map_err(Error::io)?,
        };
        let sink = HashingSink::new(self.crc32c_enabled, self.md5_enabled);
        let upload_content_length = match hint {
            (min, Some(max)) if min == max => Some(min),
            _ => None,
        };
        let engine = Engine {
            upload_content_length,
            inner: self.inner,
            bucket: self.bucket,
            object: self.object,
            content_type: self.content_type,
            metadata: self.metadata,
            if_generation_match: self.if_generation_match,
            if_metageneration_match: self.if_metageneration_match,
            kms_key_name: self.kms_key_name,
            predefined_acl: self.predefined_acl,
            origin: self.origin,
            session: self.session,
            key: self.key,
            precomputed: self.precomputed,
            options: self.options,
            cancel: self.cancel,
            invocation: std::sync::Mutex::new(InvocationId::new()),
            payload: Arc::new(Mutex::new(ChecksummedSource::new(sink, self.payload))),
        };
        Ok((engine, self.chunk_size, hint))
    }
}

enum ChunkedOutcome {
    Finalized(Box<Object>),
    Session(ResumableSession),
}

#[derive(Debug, PartialEq)]
enum UploadStatus {
    Finalized(Box<Object>),
    Partial(u64),
}

struct Engine<S> {
    inner: Arc<StorageInner>,
    /// The declared total size, announced when creating the session.
    upload_content_length: Option<u64>,
    bucket: String,
    object: String,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    if_generation_match: Option<i64>,
    if_metageneration_match: Option<i64>,
    kms_key_name: Option<String>,
    predefined_acl: Option<String>,
    origin: Option<String>,
    session: Option<ResumableSession>,
    key: Option<KeyAes256>,
    precomputed: Option<ObjectChecksums>,
    options: RequestOptions,
    cancel: CancellationToken,
    invocation: std::sync::Mutex<InvocationId>,
    payload: Arc<Mutex<ChecksummedSource<S>>>,
}

impl<S> Engine<S>
where
    S: StreamingSource + Seek + Send + Sync + 'static,
{
    fn invocation(&self) -> InvocationId {
        self.invocation.lock().expect("invocation lock").clone()
    }

    /// A logically new call starts: rotate the invocation id.
    fn rotate_invocation(&self) {
        *self.invocation.lock().expect("invocation lock") = InvocationId::new();
    }

    fn check_cancelled(&self, uri: &str, committed: u64) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(UploadError::Aborted {
                uri: uri.to_string(),
                committed,
            }));
        }
        Ok(())
    }

    async fn seek_to(&self, offset: u64) -> Result<()> {
        self.payload
            .lock()
            .await
            .seek(offset)
            .await
            .map_err(Error::data_loss)
    }

    async fn single_shot(self, hint: (u64, Option<u64>)) -> Result<Object> {
        let total = match hint {
            (min, Some(max)) if min == max => Some(min),
            _ => None,
        };
        let mut url = self.session.as_ref().map(|s| s.uri.clone());
        let retry = Arc::new(ContinueOn308::new(self.options.retry_policy.clone()));
        let backoff = self.options.backoff_policy.clone();
        crate::retry_loop::retry_loop(
            async move |_| self.single_shot_attempt(&mut url, total).await,
            async |duration| tokio::time::sleep(duration).await,
            true,
            retry,
            backoff,
        )
        .await
    }

    async fn single_shot_attempt(
        &self,
        url: &mut Option<String>,
        total: Option<u64>,
    ) -> Result<Object> {
        let (offset, upload_url) = if let Some(upload_url) = url.as_deref() {
            match self.probe_attempt(upload_url).await? {
                UploadStatus::Finalized(object) => return self.validate_object(*object).await,
                UploadStatus::Partial(offset) => (offset, upload_url),
            }
        } else {
            let created = self.create_session_attempt().await?;
            (0_u64, url.insert(created).as_str())
        };
        self.check_cancelled(upload_url, offset)?;

        let range = match (total, offset) {
            (Some(0), _) => "bytes */0".to_string(),
            (Some(t), o) => format!("bytes {o}-*/{t}"),
            (None, o) => format!("bytes {o}-*/*"),
        };
        let invocation = self.invocation();
        let builder = self
            .inner
            .builder(
                reqwest::Method::PUT,
                upload_url.to_string(),
                &invocation,
                self.options.feature,
            )
            .header("content-type", "application/octet-stream")
            .header("Content-Range", range);
        // Caller-provided checksums are the only values known before the
        // body streams; computed ones are validated against the response.
        let builder = match self.precomputed.as_ref().and_then(|p| p.as_goog_hash_header()) {
            Some(value) => builder.header("X-Goog-Hash", value),
            None => builder,
        };
        let builder = apply_encryption_headers(builder, &self.key);
        let builder = self.inner.apply_auth_headers(builder).await?;
        let builder = if total == Some(0) {
            builder
        } else {
            self.seek_to(offset).await?;
            builder.body(self.streaming_body())
        };
        let response = builder.send().await.map_err(Error::io)?;
        match self::handle_upload_response(response).await? {
            UploadStatus::Finalized(object) => self.validate_object(*object).await,
            // The service has only part of the data; surface as an error so
            // the retry loop probes and re-sends the tail.
            UploadStatus::Partial(_) => Err(Error::http(crate::error::HttpError::new(
                RESUME_INCOMPLETE.as_u16(),
                Default::default(),
                None,
            ))),
        }
    }

    /// The whole remaining payload as a streaming request body.
    fn streaming_body(&self) -> reqwest::Body {
        let payload = self.payload.clone();
        let stream = Box::pin(futures::stream::unfold(
            Some(payload),
            move |state| async move {
                if let Some(payload) = state {
                    let next = payload.lock().await.next().await;
                    if let Some(next) = next {
                        return Some((next.map_err(Error::io), Some(payload)));
                    }
                }
                None
            },
        ));
        reqwest::Body::wrap_stream(stream)
    }

    async fn chunked(
        self,
        chunk_size: usize,
        hint: (u64, Option<u64>),
        partial: bool,
    ) -> Result<ChunkedOutcome> {
        let mut progress = InProgressUpload::new(chunk_size, hint, partial);
        let mut url = None;
        if let Some(session) = self.session.clone() {
            if let Some(offset) = session.committed_offset {
                self.seek_to(offset).await?;
                progress.start_at(offset);
            }
            url = Some(session.uri);
        }
        let retry = Arc::new(ContinueOn308::new(self.options.retry_policy.clone()));
        let backoff = self.options.backoff_policy.clone();
        crate::retry_loop::retry_loop(
            async move |_| self.chunked_attempt(&mut progress, &mut url).await,
            async |duration| tokio::time::sleep(duration).await,
            true,
            retry,
            backoff,
        )
        .await
    }

    async fn chunked_attempt(
        &self,
        progress: &mut InProgressUpload,
        url: &mut Option<String>,
    ) -> Result<ChunkedOutcome> {
        let upload_url = if let Some(u) = url.as_deref() {
            u
        } else {
            let created = self.create_session_attempt().await?;
            progress.session_created();
            self.rotate_invocation();
            url.insert(created).as_str()
        };

        if progress.needs_probe() {
            match self.probe_attempt(upload_url).await? {
                UploadStatus::Finalized(object) => {
                    return Ok(ChunkedOutcome::Finalized(Box::new(
                        self.validate_object(*object).await?,
                    )));
                }
                UploadStatus::Partial(persisted) => {
                    if progress.started() {
                        progress.handle_partial(persisted)?;
                    } else {
                        // Resuming a prior session: fast-forward the source
                        // to the committed offset.
                        self.seek_to(persisted).await?;
                        progress.start_at(persisted);
                    }
                }
            }
        }

        loop {
            self.check_cancelled(upload_url, progress.offset())?;
            progress
                .next_chunk(&mut *self.payload.lock().await)
                .await?;
            if progress.buffer_size() == 0 && !progress.finalizes() {
                // A partial upload with nothing left to flush: hand the
                // session back for a later append.
                return Ok(ChunkedOutcome::Session(ResumableSession {
                    uri: upload_url.to_string(),
                    committed_offset: Some(progress.offset()),
                }));
            }
            let builder = self.chunk_request(upload_url, progress).await?;
            let response = builder.send().await.map_err(Error::io)?;
            match self::handle_upload_response(response).await {
                Err(e) => {
                    progress.on_error();
                    return Err(e);
                }
                Ok(UploadStatus::Finalized(object)) => {
                    return Ok(ChunkedOutcome::Finalized(Box::new(
                        self.validate_object(*object).await?,
                    )));
                }
                Ok(UploadStatus::Partial(persisted)) => {
                    progress.handle_partial(persisted)?;
                    self.rotate_invocation();
                }
            }
        }
    }

    async fn chunk_request(
        &self,
        upload_url: &str,
        progress: &InProgressUpload,
    ) -> Result<reqwest::RequestBuilder> {
        let invocation = self.invocation();
        let builder = self
            .inner
            .builder(
                reqwest::Method::PUT,
                upload_url.to_string(),
                &invocation,
                self.options.feature,
            )
            .header("content-type", "application/octet-stream")
            .header("Content-Range", progress.content_range());
        // The hash header goes only on the request that finalizes the
        // object.
        let builder = match self.finalizing_checksums(progress).await {
            Some(value) => builder.header("X-Goog-Hash", value),
            None => builder,
        };
        let builder = apply_encryption_headers(builder, &self.key);
        let builder = self.inner.apply_auth_headers(builder).await?;
        Ok(builder.body(progress.put_body()))
    }

    async fn finalizing_checksums(&self, progress: &InProgressUpload) -> Option<String> {
        if !progress.finalizes() {
            return None;
        }
        let total = progress.offset() + progress.buffer_size() as u64;
        self.expected_checksums(total).await.as_goog_hash_header()
    }

    /// The checksums to compare against the service: caller-provided values
    /// take precedence over computed ones. Computed values only count when
    /// this engine hashed all `total` bytes of the object; a resumed upload
    /// that skipped a server-held prefix has nothing valid to compare.
    async fn expected_checksums(&self, total: u64) -> ObjectChecksums {
        let computed = self.payload.lock().await.final_checksums(total);
        let pre = self.precomputed.clone().unwrap_or_default();
        ObjectChecksums {
            crc32c: pre.crc32c.or(computed.crc32c),
            md5_hash: pre.md5_hash.or(computed.md5_hash),
        }
    }

    async fn validate_object(&self, object: Object) -> Result<Object> {
        let expected = self.expected_checksums(object.size).await;
        let received = object.checksums().unwrap_or_default();
        crate::checksum::validate(&expected, &received).map_err(|mismatch| {
            Error::checksum(UploadError::ChecksumMismatch {
                mismatch,
                bucket: self.bucket.clone(),
                object: self.object.clone(),
            })
        })?;
        Ok(object)
    }

    async fn create_session_attempt(&self) -> Result<String> {
        let invocation = self.invocation();
        let builder = self
            .inner
            .builder(
                reqwest::Method::POST,
                self.inner.upload_url(&format!("/b/{}/o", self.bucket)),
                &invocation,
                self.options.feature,
            )
            .query(&[("uploadType", "resumable"), ("name", self.object.as_str())])
            .header("content-type", "application/json");
        let builder = self
            .if_generation_match
            .iter()
            .fold(builder, |b, v| b.query(&[("ifGenerationMatch", v)]));
        let builder = self
            .if_metageneration_match
            .iter()
            .fold(builder, |b, v| b.query(&[("ifMetagenerationMatch", v)]));
        let builder = [
            ("kmsKeyName", &self.kms_key_name),
            ("predefinedAcl", &self.predefined_acl),
        ]
        .into_iter()
        .fold(builder, |b, (k, v)| match v {
            Some(v) => b.query(&[(k, v)]),
            None => b,
        });
        let builder = match &self.content_type {
            Some(v) => builder.header("X-Upload-Content-Type", v),
            None => builder,
        };
        let builder = match self.upload_content_length {
            Some(v) => builder.header("X-Upload-Content-Length", v),
            None => builder,
        };
        let builder = match &self.origin {
            Some(v) => builder.header("Origin", v),
            None => builder,
        };
        let builder = apply_encryption_headers(builder, &self.key);
        let builder = self.inner.apply_auth_headers(builder).await?;
        let builder = builder.json(&self.insert_body());
        let response = builder.send().await.map_err(Error::io)?;
        if !response.status().is_success() {
            return Err(crate::transport::to_http_error(response).await);
        }
        let location = response
            .headers()
            .get("Location")
            .ok_or_else(|| Error::deser("missing Location header in session creation"))?;
        location.to_str().map_err(Error::deser).map(str::to_string)
    }

    /// The object metadata sent when creating the session. The content type
    /// and length travel as `X-Upload-Content-*` headers instead.
    fn insert_body(&self) -> serde_json::Value {
        let mut body = serde_json::Map::new();
        body.insert("name".to_string(), self.object.clone().into());
        if !self.metadata.is_empty() {
            body.insert(
                "metadata".to_string(),
                serde_json::to_value(&self.metadata).expect("string map serializes"),
            );
        }
        if let Some(pre) = &self.precomputed {
            if let Some(crc32c) = pre.crc32c_base64() {
                body.insert("crc32c".to_string(), crc32c.into());
            }
            if let Some(md5) = &pre.md5_hash {
                body.insert("md5Hash".to_string(), md5.clone().into());
            }
        }
        body.into()
    }

    /// Queries the session for the committed offset.
    async fn probe_attempt(&self, upload_url: &str) -> Result<UploadStatus> {
        let invocation = self.invocation();
        let builder = self
            .inner
            .builder(
                reqwest::Method::PUT,
                upload_url.to_string(),
                &invocation,
                self.options.feature,
            )
            .header("content-type", "application/octet-stream")
            .header("content-length", "0")
            .header("Content-Range", "bytes */*");
        let builder = self.inner.apply_auth_headers(builder).await?;
        let response = builder.send().await.map_err(Error::io)?;
        self::handle_upload_response(response).await
    }
}

/// Interprets a response in the resumable protocol: `308` reports progress,
/// 2xx finalizes, anything else is an error.
async fn handle_upload_response(response: reqwest::Response) -> Result<UploadStatus> {
    if response.status() == RESUME_INCOMPLETE {
        let Some(end) = self::parse_range_end(response.headers()) else {
            return Err(crate::transport::to_http_error(response).await);
        };
        // `Range: bytes=0-999` means 1000 bytes are persisted; a missing
        // header means none are.
        let persisted = match end {
            0 => 0,
            e => e + 1,
        };
        return Ok(UploadStatus::Partial(persisted));
    }
    if !response.status().is_success() {
        return Err(crate::transport::to_http_error(response).await);
    }
    let object = crate::transport::handle_json::<Object>(response).await?;
    Ok(UploadStatus::Finalized(Box::new(object)))
}

/// Parses the `Range` header of a 308 response.
///
/// Resumable uploads are sequential, so the persisted range always starts
/// at zero; a hole would violate the protocol.
fn parse_range_end(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let Some(range) = headers.get("range") else {
        return Some(0_u64);
    };
    let end = std::str::from_utf8(range.as_bytes().strip_prefix(b"bytes=0-")?).ok()?;
    end.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::{test_backoff, test_inner};
    use base64::Engine as _;
    use base64::prelude::BASE64_STANDARD;
    use httptest::{Expectation, Server, matchers::*, responders::status_code};

    type Result = anyhow::Result<()>;

    const QUANTUM: usize = UPLOAD_QUANTUM;

    fn test_engine_inner(server: &Server) -> Arc<StorageInner> {
        Arc::new(StorageInner {
            backoff_policy: Arc::new(test_backoff()),
            ..test_inner(format!("http://{}", server.addr()))
        })
    }

    fn upload(
        inner: Arc<StorageInner>,
        payload: bytes::Bytes,
    ) -> ResumableUpload<crate::upload_source::UploadPayload<crate::upload_source::BytesSource>>
    {
        ResumableUpload::new(inner, "test-bucket", "test-object", payload.into())
    }

    fn object_json(payload: &[u8]) -> String {
        let crc32c = BASE64_STANDARD.encode(crc32c::crc32c(payload).to_be_bytes());
        serde_json::json!({
            "name": "test-object",
            "bucket": "test-bucket",
            "generation": "123",
            "size": format!("{}", payload.len()),
            "crc32c": crc32c,
        })
        .to_string()
    }

    fn expect_session_create(server: &Server) {
        let location = format!("http://{}/upload/session/test-1", server.addr());
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/upload/storage/v1/b/test-bucket/o"),
                request::query(url_decoded(contains(("uploadType", "resumable")))),
                request::query(url_decoded(contains(("name", "test-object")))),
            ])
            .respond_with(status_code(200).append_header("Location", location)),
        );
    }

    #[tokio::test]
    async fn single_shot_known_size() -> Result {
        let payload = b"hello world";
        let server = Server::run();
        expect_session_create(&server);
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/test-1"),
                request::headers(contains(("content-range", "bytes 0-*/11"))),
            ])
            .respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json(payload)),
            ),
        );

        let inner = test_engine_inner(&server);
        let object = upload(inner, bytes::Bytes::from_static(payload))
            .send()
            .await?;
        assert_eq!(object.name, "test-object");
        assert_eq!(object.size, 11);
        Ok(())
    }

    #[tokio::test]
    async fn single_shot_empty_object() -> Result {
        let server = Server::run();
        expect_session_create(&server);
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/test-1"),
                request::headers(contains(("content-range", "bytes */0"))),
            ])
            .respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json(b"")),
            ),
        );

        let inner = test_engine_inner(&server);
        let object = upload(inner, bytes::Bytes::new()).send().await?;
        assert_eq!(object.size, 0);
        Ok(())
    }

    #[tokio::test]
    async fn chunked_two_chunks() -> Result {
        let mut payload = vec![0_u8; QUANTUM];
        payload.extend_from_slice(&vec![1_u8; QUANTUM / 2]);
        let total = payload.len();

        let server = Server::run();
        expect_session_create(&server);
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/test-1"),
                request::headers(contains((
                    "content-range",
                    format!("bytes 0-{}/{total}", QUANTUM - 1)
                ))),
            ])
            .respond_with(
                status_code(308).append_header("Range", format!("bytes=0-{}", QUANTUM - 1)),
            ),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/test-1"),
                request::headers(contains((
                    "content-range",
                    format!("bytes {QUANTUM}-{}/{total}", total - 1)
                ))),
                request::headers(contains(key("x-goog-hash"))),
            ])
            .respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json(&payload)),
            ),
        );

        let inner = test_engine_inner(&server);
        let object = upload(inner, bytes::Bytes::from_owner(payload))
            .with_chunk_size(QUANTUM)
            .send()
            .await?;
        assert_eq!(object.name, "test-object");
        Ok(())
    }

    // The server acknowledges only half of the first chunk. The tail must
    // be re-sent starting at the committed offset.
    #[tokio::test]
    async fn chunked_partial_ack() -> Result {
        let payload = vec![7_u8; 2 * QUANTUM];
        let total = payload.len();
        let half = QUANTUM / 2;

        let server = Server::run();
        expect_session_create(&server);
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/test-1"),
                request::headers(contains((
                    "content-range",
                    format!("bytes 0-{}/{total}", QUANTUM - 1)
                ))),
            ])
            .respond_with(
                status_code(308).append_header("Range", format!("bytes=0-{}", half - 1)),
            ),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/test-1"),
                request::headers(contains((
                    "content-range",
                    format!("bytes {half}-{}/{total}", half + QUANTUM - 1)
                ))),
            ])
            .respond_with(
                status_code(308)
                    .append_header("Range", format!("bytes=0-{}", half + QUANTUM - 1)),
            ),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/test-1"),
                request::headers(contains((
                    "content-range",
                    format!("bytes {}-{}/{total}", half + QUANTUM, total - 1)
                ))),
            ])
            .respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json(&payload)),
            ),
        );

        let inner = test_engine_inner(&server);
        let object = upload(inner, bytes::Bytes::from_owner(payload.clone()))
            .with_chunk_size(QUANTUM)
            .send()
            .await?;
        assert_eq!(object.size as usize, total);
        Ok(())
    }

    #[tokio::test]
    async fn chunked_retries_after_503() -> Result {
        let payload = vec![3_u8; QUANTUM / 4];
        let server = Server::run();
        expect_session_create(&server);
        // First chunk attempt fails; the engine must probe and re-send.
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/test-1"),
                request::headers(contains(("content-range", format!("bytes 0-{}/{}", payload.len() - 1, payload.len())))),
            ])
            .times(2)
            .respond_with(httptest::cycle![
                status_code(503),
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json(&vec![3_u8; QUANTUM / 4])),
            ]),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/test-1"),
                request::headers(contains(("content-range", "bytes */*"))),
            ])
            .respond_with(status_code(308)),
        );

        let inner = test_engine_inner(&server);
        let object = upload(inner, bytes::Bytes::from_owner(payload))
            .with_chunk_size(QUANTUM)
            .send()
            .await?;
        assert_eq!(object.name, "test-object");
        Ok(())
    }

    #[tokio::test]
    async fn resume_with_uri_probes_first() -> Result {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/resume-1"),
                request::headers(contains(("content-range", "bytes */*"))),
            ])
            .respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json(b"")),
            ),
        );

        let inner = test_engine_inner(&server);
        let uri = format!("http://{}/upload/session/resume-1", server.addr());
        let object = upload(inner, bytes::Bytes::new())
            .with_chunk_size(QUANTUM)
            .with_session(ResumableSession {
                uri,
                committed_offset: None,
            })
            .send()
            .await?;
        assert_eq!(object.name, "test-object");
        Ok(())
    }

    #[tokio::test]
    async fn partial_upload_returns_session() -> Result {
        let payload = vec![9_u8; QUANTUM];
        let server = Server::run();
        expect_session_create(&server);
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/upload/session/test-1"),
                // A partial upload must not announce a total size.
                request::headers(contains((
                    "content-range",
                    format!("bytes 0-{}/*", QUANTUM - 1)
                ))),
                request::headers(not(contains(key("x-goog-hash")))),
            ])
            .respond_with(
                status_code(308).append_header("Range", format!("bytes=0-{}", QUANTUM - 1)),
            ),
        );

        let inner = test_engine_inner(&server);
        let session = upload(inner, bytes::Bytes::from_owner(payload))
            .with_chunk_size(QUANTUM)
            .send_partial()
            .await?;
        assert_eq!(session.committed_offset, Some(QUANTUM as u64));
        assert!(session.uri.ends_with("/upload/session/test-1"), "{session:?}");
        Ok(())
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_upload() -> Result {
        let payload = b"hello world";
        let server = Server::run();
        expect_session_create(&server);
        server.expect(
            Expectation::matching(request::method_path("PUT", "/upload/session/test-1"))
                .respond_with(
                    status_code(200)
                        .append_header("content-type", "application/json")
                        // Same length, different bytes: the service-side
                        // checksum cannot match the uploaded data.
                        .body(object_json(b"dlrow olleh")),
                ),
        );

        let inner = test_engine_inner(&server);
        let err = upload(inner, bytes::Bytes::from_static(payload))
            .send()
            .await
            .unwrap_err();
        assert!(err.is_checksum(), "{err:?}");
        let source = err.as_inner::<UploadError>().unwrap();
        assert!(
            matches!(source, UploadError::ChecksumMismatch { .. }),
            "{source:?}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn invalid_chunk_size_is_validation() {
        // No server: validation fails before any I/O.
        let inner = Arc::new(test_inner("http://127.0.0.1:1".to_string()));
        let err = upload(inner.clone(), bytes::Bytes::new())
            .with_chunk_size(QUANTUM + 1)
            .send()
            .await
            .unwrap_err();
        assert!(err.is_validation(), "{err:?}");

        let err = upload(inner.clone(), bytes::Bytes::new())
            .with_chunk_size(0)
            .send()
            .await
            .unwrap_err();
        assert!(err.is_validation(), "{err:?}");

        // Partial uploads require a chunk size.
        let err = upload(inner, bytes::Bytes::new())
            .send_partial()
            .await
            .unwrap_err();
        assert!(err.is_validation(), "{err:?}");
    }

    #[tokio::test]
    async fn cancellation_preserves_session() -> Result {
        let server = Server::run();
        expect_session_create(&server);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let inner = test_engine_inner(&server);
        let err = upload(inner, bytes::Bytes::from_static(b"data"))
            .with_chunk_size(QUANTUM)
            .with_cancellation_token(cancel)
            .send()
            .await
            .unwrap_err();
        assert!(err.is_cancelled(), "{err:?}");
        let source = err.as_inner::<UploadError>().unwrap();
        assert!(
            matches!(source, UploadError::Aborted { committed: 0, .. }),
            "{source:?}"
        );
        Ok(())
    }

    #[test]
    fn parse_range_end_variants() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_range_end(&headers), Some(0));
        headers.insert("range", "bytes=0-999".parse().unwrap());
        assert_eq!(parse_range_end(&headers), Some(999));
        headers.insert("range", "bytes=100-999".parse().unwrap());
        assert_eq!(parse_range_end(&headers), None);
        headers.insert("range", "bytes=0-abc".parse().unwrap());
        assert_eq!(parse_range_end(&headers), None);
    }
}
