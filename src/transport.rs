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

//! The authenticated HTTP transport shared by all operations.
//!
//! The transport assembles request URLs and standard headers, fetches
//! credentials before every attempt, and drives the retry loop. Each logical
//! operation mints one invocation id; retries of that operation repeat the
//! id so the service can deduplicate, while logically new calls (a new
//! chunk, a fresh status probe) rotate it.

use crate::backoff_policy::BackoffPolicy;
use crate::credentials::Credentials;
use crate::error::HttpError;
use crate::retry_policy::RetryPolicy;
use crate::{Error, Result};
use std::sync::Arc;

/// The default service endpoint.
pub(crate) const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// The resume-incomplete status used by the resumable upload protocol.
pub(crate) const RESUME_INCOMPLETE: reqwest::StatusCode = reqwest::StatusCode::PERMANENT_REDIRECT;

pub(crate) mod info {
    const VERSION: &str = env!("CARGO_PKG_VERSION");
    lazy_static::lazy_static! {
        /// The constant prefix of the `x-goog-api-client` header.
        pub(crate) static ref API_CLIENT_PREFIX: String = format!("gl-rust gccl/{VERSION}");
        /// The default `User-Agent` for this client.
        pub(crate) static ref USER_AGENT: String = format!("gccl/{VERSION}");
    }
}

/// Identifies all attempts belonging to one logical operation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct InvocationId(String);

impl InvocationId {
    /// Mints a fresh id. Call once per logical operation, and again whenever
    /// the protocol moves to a logically new call.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Renders the `x-goog-api-client` header for one attempt.
pub(crate) fn api_client_header(invocation: &InvocationId, feature: Option<&str>) -> String {
    let mut value = format!(
        "{} gccl-invocation-id/{}",
        *info::API_CLIENT_PREFIX,
        invocation.as_str()
    );
    if let Some(feature) = feature {
        value.push_str(&format!(" gccl-gcs-cmd/{feature}"));
    }
    value
}

/// The set of characters that are percent encoded in object names and query
/// strings.
///
/// Defined at https://cloud.google.com/storage/docs/request-endpoints#encoding.
const ENCODED_CHARS: percent_encoding::AsciiSet = percent_encoding::CONTROLS
    .add(b'!')
    .add(b'#')
    .add(b'$')
    .add(b'&')
    .add(b'\'')
    .add(b'(')
    .add(b')')
    .add(b'*')
    .add(b'+')
    .add(b',')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'=')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b']')
    .add(b' ');

/// Percent encode an object name for use in a request path.
pub(crate) fn enc(value: &str) -> String {
    percent_encoding::utf8_percent_encode(value, &ENCODED_CHARS).to_string()
}

/// A customer-supplied AES-256 encryption key.
///
/// The key must be exactly 32 bytes of raw (unencoded) key material. The
/// client derives the SHA-256 digest the service requires alongside it.
#[derive(Clone)]
pub struct KeyAes256 {
    key: [u8; 32],
}

impl std::fmt::Debug for KeyAes256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material is a secret.
        f.debug_struct("KeyAes256").finish()
    }
}

impl KeyAes256 {
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; 32] = key
            .try_into()
            .map_err(|_| Error::validation("customer-supplied keys must be exactly 32 bytes"))?;
        Ok(Self { key })
    }

    pub(crate) fn key_base64(&self) -> String {
        use base64::Engine as _;
        base64::prelude::BASE64_STANDARD.encode(self.key)
    }

    pub(crate) fn key_sha256_base64(&self) -> String {
        use base64::Engine as _;
        use sha2::Digest as _;
        let digest = sha2::Sha256::digest(self.key);
        base64::prelude::BASE64_STANDARD.encode(digest)
    }
}

/// Attaches the customer-supplied encryption headers, if a key is configured.
pub(crate) fn apply_encryption_headers(
    builder: reqwest::RequestBuilder,
    key: &Option<KeyAes256>,
) -> reqwest::RequestBuilder {
    match key {
        None => builder,
        Some(key) => builder
            .header("x-goog-encryption-algorithm", "AES256")
            .header("x-goog-encryption-key", key.key_base64())
            .header("x-goog-encryption-key-sha256", key.key_sha256_base64()),
    }
}

/// Per-operation request options.
///
/// Every operation starts from the client-wide defaults and may override the
/// retry or backoff policy. The `feature` tag identifies transfer manager
/// operations in the `x-goog-api-client` header.
#[derive(Clone, Debug)]
pub(crate) struct RequestOptions {
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub backoff_policy: Arc<dyn BackoffPolicy>,
    pub feature: Option<&'static str>,
}

/// The shared state behind a `Storage` client.
#[derive(Clone, Debug)]
pub(crate) struct StorageInner {
    pub client: reqwest::Client,
    pub credentials: Credentials,
    pub endpoint: String,
    pub user_agent: String,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub backoff_policy: Arc<dyn BackoffPolicy>,
}

impl StorageInner {
    /// The default options for one operation.
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            retry_policy: self.retry_policy.clone(),
            backoff_policy: self.backoff_policy.clone(),
            feature: None,
        }
    }

    /// The base URL for JSON API requests.
    pub fn json_url(&self, path: &str) -> String {
        format!("{}/storage/v1{path}", self.endpoint)
    }

    /// The base URL for upload requests.
    pub fn upload_url(&self, path: &str) -> String {
        format!("{}/upload/storage/v1{path}", self.endpoint)
    }

    /// The URL for XML API requests, path-style.
    pub fn xml_url(&self, bucket: &str, object: &str) -> String {
        format!("{}/{}/{}", self.endpoint, bucket, enc(object))
    }

    /// Starts a request with the standard headers for one attempt.
    ///
    /// `url` may be a service path produced by one of the `*_url` helpers or
    /// an absolute URL (session URIs are used verbatim).
    pub fn builder(
        &self,
        method: reqwest::Method,
        url: String,
        invocation: &InvocationId,
        feature: Option<&str>,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("user-agent", &self.user_agent)
            .header("x-goog-api-client", api_client_header(invocation, feature))
    }

    /// Attaches the authentication headers for one attempt.
    pub async fn apply_auth_headers(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder> {
        let headers = self.credentials.headers().await?;
        Ok(builder.headers(headers))
    }

    /// Executes a JSON API request with retries, decoding the response body.
    pub async fn execute_json<T>(
        &self,
        method: reqwest::Method,
        url: String,
        query: Vec<(String, String)>,
        body: Option<serde_json::Value>,
        idempotent: bool,
        options: &RequestOptions,
    ) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let response = self
            .execute(method, url, query, body, idempotent, options)
            .await?;
        self::handle_json(response).await
    }

    /// Executes a JSON API request with retries, discarding the response
    /// body.
    pub async fn execute_unit(
        &self,
        method: reqwest::Method,
        url: String,
        query: Vec<(String, String)>,
        idempotent: bool,
        options: &RequestOptions,
    ) -> Result<()> {
        let _ = self
            .execute(method, url, query, None, idempotent, options)
            .await?;
        Ok(())
    }

    /// Like [execute_unit][StorageInner::execute_unit], with a JSON request
    /// body.
    pub async fn execute_unit_with_body(
        &self,
        method: reqwest::Method,
        url: String,
        body: serde_json::Value,
        idempotent: bool,
        options: &RequestOptions,
    ) -> Result<()> {
        let _ = self
            .execute(method, url, vec![], Some(body), idempotent, options)
            .await?;
        Ok(())
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        url: String,
        query: Vec<(String, String)>,
        body: Option<serde_json::Value>,
        idempotent: bool,
        options: &RequestOptions,
    ) -> Result<reqwest::Response> {
        let invocation = InvocationId::new();
        let feature = options.feature;
        crate::retry_loop::retry_loop(
            async move |remaining: Option<std::time::Duration>| {
                let builder = self
                    .builder(method.clone(), url.clone(), &invocation, feature)
                    .query(&query);
                let builder = match &body {
                    None => builder,
                    Some(body) => builder.json(body),
                };
                // The attempt must not outlive the retry budget.
                let builder = match remaining {
                    Some(deadline) => builder.timeout(deadline),
                    None => builder,
                };
                let builder = self.apply_auth_headers(builder).await?;
                let response = builder.send().await.map_err(Error::io)?;
                if !response.status().is_success() {
                    return Err(self::to_http_error(response).await);
                }
                Ok(response)
            },
            async |duration| tokio::time::sleep(duration).await,
            idempotent,
            options.retry_policy.clone(),
            options.backoff_policy.clone(),
        )
        .await
    }
}

/// Converts a non-success response into an [Error].
pub(crate) async fn to_http_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (k.as_str().to_string(), v.to_string()))
        })
        .collect();
    let payload = response.bytes().await.ok();
    Error::http(HttpError::new(status, headers, payload))
}

/// Decodes a 2xx JSON response body.
///
/// A success status with a body that does not decode indicates the response
/// was corrupted in transit (or an HTML error page slipped through a
/// proxy); both are reported as I/O problems so the retry policy treats
/// them as transient.
pub(crate) async fn handle_json<T>(response: reqwest::Response) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let bytes = response.bytes().await.map_err(Error::io)?;
    serde_json::from_slice::<T>(&bytes).map_err(Error::io)
}
