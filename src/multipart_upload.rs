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

//! Multipart uploads over the XML API.
//!
//! The protocol is S3-style: `POST {object}?uploads` starts an upload and
//! returns an upload id, parts are `PUT {object}?partNumber=N&uploadId=U`,
//! and `POST {object}?uploadId=U` completes the object from the recorded
//! part ETags. Parts may be uploaded in any order and in parallel; the
//! completion list is sorted by part number. The client uses path-style
//! URLs (`{endpoint}/{bucket}/{object}`).
//!
//! See <https://cloud.google.com/storage/docs/multipart-uploads>.

use crate::error::MultipartUploadError;
use crate::transport::{KeyAes256, RequestOptions, StorageInner, apply_encryption_headers};
use crate::{Error, Result};
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The ordered mapping from part number to the ETag the service returned
/// for it.
///
/// Part numbers start at 1. Inserting a part number twice overwrites the
/// previous entry. The ordering of the map is what makes the completion
/// request sorted.
pub type PartsMap = BTreeMap<i32, String>;

/// A handle for one object's multipart upload lifecycle.
///
/// # Example
/// ```no_run
/// # use google_cloud_storage_v1::client::Storage;
/// # async fn sample(client: &Storage) -> anyhow::Result<()> {
/// let upload = client.multipart_upload("my-bucket", "my-object");
/// let upload_id = upload.initiate().await?;
/// let mut parts = google_cloud_storage_v1::multipart_upload::PartsMap::new();
/// let etag = upload
///     .upload_part(&upload_id, 1, bytes::Bytes::from_static(b"part data"))
///     .await?;
/// parts.insert(1, etag);
/// upload.complete(&upload_id, &parts).await?;
/// # Ok(()) }
/// ```
#[derive(Clone, Debug)]
pub struct MultipartUpload {
    inner: Arc<StorageInner>,
    bucket: String,
    object: String,
    content_type: Option<String>,
    part_md5: bool,
    auto_abort: bool,
    key: Option<KeyAes256>,
    options: RequestOptions,
}

impl MultipartUpload {
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
            content_type: None,
            part_md5: false,
            auto_abort: true,
            key: None,
            options,
        }
    }

    pub fn with_content_type<T: Into<String>>(mut self, v: T) -> Self {
        self.content_type = Some(v.into());
        self
    }

    /// Attach a `Content-MD5` header to every part.
    pub fn with_part_md5(mut self, enabled: bool) -> Self {
        self.part_md5 = enabled;
        self
    }

    /// Whether a permanent failure aborts the upload on the server. On by
    /// default; disable to keep the upload id alive for a manual resume.
    pub fn with_auto_abort(mut self, enabled: bool) -> Self {
        self.auto_abort = enabled;
        self
    }

    pub fn with_key(mut self, key: KeyAes256) -> Self {
        self.key = Some(key);
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

    fn url(&self) -> String {
        self.inner.xml_url(&self.bucket, &self.object)
    }

    /// Starts the upload, returning the upload id.
    pub async fn initiate(&self) -> Result<String> {
        let invocation = crate::transport::InvocationId::new();
        let response = crate::retry_loop::retry_loop(
            async move |_| {
                let builder = self
                    .inner
                    .builder(
                        reqwest::Method::POST,
                        self.url(),
                        &invocation,
                        self.options.feature,
                    )
                    .query(&[("uploads", "")])
                    .header("content-length", "0");
                let builder = match &self.content_type {
                    Some(v) => builder.header("content-type", v.as_str()),
                    None => builder,
                };
                let builder = apply_encryption_headers(builder, &self.key);
                let builder = self.inner.apply_auth_headers(builder).await?;
                let response = builder.send().await.map_err(Error::io)?;
                if !response.status().is_success() {
                    return Err(crate::transport::to_http_error(response).await);
                }
                response.bytes().await.map_err(Error::io)
            },
            async |duration| tokio::time::sleep(duration).await,
            true,
            self.options.retry_policy.clone(),
            self.options.backoff_policy.clone(),
        )
        .await?;
        let result: InitiateMultipartUploadResult =
            quick_xml::de::from_reader(response.as_ref()).map_err(Error::io)?;
        Ok(result.upload_id)
    }

    /// Uploads one part and returns its ETag.
    ///
    /// Part numbers start at 1. Re-uploading a part number replaces the
    /// previous content, which also makes this call safe to retry.
    pub async fn upload_part(
        &self,
        upload_id: &str,
        part_number: i32,
        data: bytes::Bytes,
    ) -> Result<String> {
        if part_number < 1 {
            return Err(Error::validation(format!(
                "part numbers start at 1, got {part_number}"
            )));
        }
        // Owning a clone (rather than capturing `&self`/`&str` by reference)
        // keeps the retry closure's future free of borrowed lifetimes, which
        // is required for this method to be usable from a spawned task.
        let me = self.clone();
        let upload_id = upload_id.to_string();
        let content_md5 = me
            .part_md5
            .then(|| BASE64_STANDARD.encode(md5::compute(&data).0));
        let invocation = crate::transport::InvocationId::new();
        let retry_policy = me.options.retry_policy.clone();
        let backoff_policy = me.options.backoff_policy.clone();
        let response = crate::retry_loop::retry_loop(
            async move |_| {
                let builder = me
                    .inner
                    .builder(
                        reqwest::Method::PUT,
                        me.url(),
                        &invocation,
                        me.options.feature,
                    )
                    .query(&[
                        ("partNumber", part_number.to_string().as_str()),
                        ("uploadId", upload_id.as_str()),
                    ]);
                let builder = match &content_md5 {
                    Some(v) => builder.header("Content-MD5", v.as_str()),
                    None => builder,
                };
                let builder = apply_encryption_headers(builder, &me.key);
                let builder = me.inner.apply_auth_headers(builder).await?;
                let response = builder.body(data.clone()).send().await.map_err(Error::io)?;
                if !response.status().is_success() {
                    return Err(crate::transport::to_http_error(response).await);
                }
                Ok(response)
            },
            async |duration| tokio::time::sleep(duration).await,
            true,
            retry_policy,
            backoff_policy,
        )
        .await?;
        let etag = response
            .headers()
            .get("etag")
            .ok_or_else(|| Error::deser("missing ETag header in part upload"))?;
        etag.to_str().map_err(Error::deser).map(str::to_string)
    }

    /// Completes the upload from the recorded parts, returning the object's
    /// ETag.
    ///
    /// The map keys keep the completion list sorted by part number, as the
    /// protocol requires.
    pub async fn complete(&self, upload_id: &str, parts: &PartsMap) -> Result<String> {
        if parts.is_empty() {
            return Err(Error::validation(
                "multipart uploads require at least one part",
            ));
        }
        let body = CompleteMultipartUpload {
            part: parts
                .iter()
                .map(|(&part_number, e_tag)| CompletePart {
                    part_number,
                    e_tag: e_tag.clone(),
                })
                .collect(),
        };
        let body = quick_xml::se::to_string(&body)
            .map_err(Error::other)?
            // ETags contain double quotes; quick-xml insists on escaping
            // them in text nodes.
            .replace("&quot;", "\"");
        let invocation = crate::transport::InvocationId::new();
        let response = crate::retry_loop::retry_loop(
            async move |_| {
                let builder = self
                    .inner
                    .builder(
                        reqwest::Method::POST,
                        self.url(),
                        &invocation,
                        self.options.feature,
                    )
                    .query(&[("uploadId", upload_id)])
                    .header("content-type", "application/xml");
                let builder = self.inner.apply_auth_headers(builder).await?;
                let response = builder.body(body.clone()).send().await.map_err(Error::io)?;
                if !response.status().is_success() {
                    return Err(crate::transport::to_http_error(response).await);
                }
                response.bytes().await.map_err(Error::io)
            },
            async |duration| tokio::time::sleep(duration).await,
            true,
            self.options.retry_policy.clone(),
            self.options.backoff_policy.clone(),
        )
        .await?;
        let result: CompleteMultipartUploadResult =
            quick_xml::de::from_reader(response.as_ref()).map_err(Error::io)?;
        Ok(result.e_tag)
    }

    /// Abandons the upload, releasing the parts on the server.
    pub async fn abort(&self, upload_id: &str) -> Result<()> {
        let invocation = crate::transport::InvocationId::new();
        crate::retry_loop::retry_loop(
            async move |_| {
                let builder = self
                    .inner
                    .builder(
                        reqwest::Method::DELETE,
                        self.url(),
                        &invocation,
                        self.options.feature,
                    )
                    .query(&[("uploadId", upload_id)])
                    .header("content-length", "0");
                let builder = self.inner.apply_auth_headers(builder).await?;
                let response = builder.send().await.map_err(Error::io)?;
                if !response.status().is_success() {
                    return Err(crate::transport::to_http_error(response).await);
                }
                Ok(())
            },
            async |duration| tokio::time::sleep(duration).await,
            true,
            self.options.retry_policy.clone(),
            self.options.backoff_policy.clone(),
        )
        .await
    }

    /// Wraps a lifecycle failure so the caller can resume: aborts the
    /// server-side upload when configured to, and attaches the upload id and
    /// parts map to the error.
    pub(crate) async fn fail(&self, upload_id: String, parts: PartsMap, error: Error) -> Error {
        if self.auto_abort {
            if let Err(abort_error) = self.abort(&upload_id).await {
                tracing::warn!("failed to abort multipart upload {upload_id}: {abort_error}");
            }
        }
        Error::new(
            error.kind(),
            MultipartUploadError {
                upload_id,
                parts,
                source: error.into(),
            },
        )
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InitiateMultipartUploadResult {
    upload_id: String,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload {
    #[serde(rename = "Part")]
    part: Vec<CompletePart>,
}

#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
struct CompletePart {
    part_number: i32,
    e_tag: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CompleteMultipartUploadResult {
    e_tag: String,
}
