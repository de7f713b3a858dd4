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

//! Signed URLs.
//!
//! A signed URL grants time-limited access to an object without
//! credentials. The builder supports both signing schemes; callers must
//! choose one explicitly, there is no implicit default version.

use crate::credentials::Credentials;
use crate::{Error, Result};
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use url::form_urlencoded;

/// The longest allowed expiration: seven days.
pub const MAX_EXPIRATION: Duration = Duration::from_secs(604_800);

/// https://cloud.google.com/storage/docs/request-endpoints#encoding
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// The signing scheme for a URL.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SignedUrlVersion {
    /// The legacy scheme: a newline-joined blob signed with RSA-SHA256,
    /// presented as `GoogleAccessId`/`Expires`/`Signature` parameters.
    V2,
    /// The current scheme: a canonical request hashed with SHA-256 and
    /// signed with `GOOG4-RSA-SHA256`.
    V4,
}

/// A builder for signed URLs.
pub struct SignedUrlBuilder {
    credentials: Credentials,
    endpoint: String,
    bucket: String,
    object: String,
    version: Option<SignedUrlVersion>,
    method: String,
    expiration: Duration,
    content_md5: Option<String>,
    content_type: Option<String>,
    headers: BTreeMap<String, String>,
    query_parameters: BTreeMap<String, String>,
    virtual_hosted: bool,
    client_email: Option<String>,
}

impl SignedUrlBuilder {
    pub(crate) fn new<B, O>(
        credentials: Credentials,
        endpoint: String,
        bucket: B,
        object: O,
    ) -> Self
    where
        B: Into<String>,
        O: Into<String>,
    {
        Self {
            credentials,
            endpoint,
            bucket: bucket.into(),
            object: object.into(),
            version: None,
            method: "GET".to_string(),
            expiration: Duration::from_secs(3600),
            content_md5: None,
            content_type: None,
            headers: BTreeMap::new(),
            query_parameters: BTreeMap::new(),
            virtual_hosted: true,
            client_email: None,
        }
    }

    /// Selects the signing scheme. Required.
    pub fn with_version(mut self, version: SignedUrlVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// The HTTP method the URL grants. Default `GET`.
    pub fn with_method<T: Into<String>>(mut self, method: T) -> Self {
        self.method = method.into();
        self
    }

    /// How long the URL stays valid, up to seven days. Default one hour.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// A header the request must carry when using the URL.
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.insert(key.into().to_lowercase(), value.into());
        self
    }

    /// An extra query parameter embedded in the signature.
    pub fn with_query_param<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.query_parameters.insert(key.into(), value.into());
        self
    }

    /// The `Content-MD5` the request must carry (V2 only).
    pub fn with_content_md5<T: Into<String>>(mut self, v: T) -> Self {
        self.content_md5 = Some(v.into());
        self
    }

    /// The `Content-Type` the request must carry (V2 only).
    pub fn with_content_type<T: Into<String>>(mut self, v: T) -> Self {
        self.content_type = Some(v.into());
        self
    }

    /// Use `https://{host}/{bucket}/{object}` instead of the virtual-hosted
    /// `https://{bucket}.{host}/{object}` style.
    pub fn with_path_style(mut self) -> Self {
        self.virtual_hosted = false;
        self
    }

    /// Overrides the signing account email; fetched from the credentials
    /// otherwise.
    pub fn with_client_email<T: Into<String>>(mut self, v: T) -> Self {
        self.client_email = Some(v.into());
        self
    }

    /// Produces the signed URL.
    pub async fn build(self) -> Result<String> {
        if self.bucket.is_empty() {
            return Err(Error::validation("the bucket name must not be empty"));
        }
        if self.object.is_empty() {
            return Err(Error::validation("the object name must not be empty"));
        }
        if self.expiration.is_zero() || self.expiration > MAX_EXPIRATION {
            return Err(Error::validation(format!(
                "expiration must be positive and at most {} seconds, got {:?}",
                MAX_EXPIRATION.as_secs(),
                self.expiration
            )));
        }
        match self.version {
            None => Err(Error::validation(
                "a signed URL version must be selected explicitly",
            )),
            Some(SignedUrlVersion::V2) => self.build_v2().await,
            Some(SignedUrlVersion::V4) => self.build_v4().await,
        }
    }

    fn client_email_or_fetch(&self) -> Option<String> {
        self.client_email.clone()
    }

    /// The scheme, host, and canonical path for the chosen URL style.
    fn location(&self) -> Result<(String, String, String)> {
        let endpoint =
            url::Url::parse(&self.endpoint).map_err(|e| Error::validation(e.to_string()))?;
        let host = endpoint
            .host_str()
            .ok_or_else(|| Error::validation("the endpoint has no host"))?;
        let encoded_object = utf8_percent_encode(&self.object, PATH_ENCODE_SET).to_string();
        let (host, path) = if self.virtual_hosted {
            (format!("{}.{host}", self.bucket), format!("/{encoded_object}"))
        } else {
            (
                host.to_string(),
                format!("/{}/{encoded_object}", self.bucket),
            )
        };
        Ok((endpoint.scheme().to_string(), host, path))
    }

    async fn build_v4(self) -> Result<String> {
        let (scheme, host, canonical_uri) = self.location()?;
        let now = chrono::Utc::now();
        let request_timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d");
        let credential_scope = format!("{datestamp}/auto/storage/goog4_request");
        let client_email = match self.client_email_or_fetch() {
            Some(email) => email,
            None => self.credentials.client_email().await?,
        };
        let credential = format!("{client_email}/{credential_scope}");

        let mut headers = self.headers;
        headers.insert("host".to_string(), host.clone());
        let canonical_headers = headers
            .iter()
            .fold(String::new(), |acc, (k, v)| format!("{acc}{k}:{v}\n"));
        let signed_headers = headers.keys().cloned().collect::<Vec<_>>().join(";");

        let mut query_parameters = self.query_parameters;
        query_parameters.insert("X-Goog-Algorithm".to_string(), "GOOG4-RSA-SHA256".to_string());
        query_parameters.insert("X-Goog-Credential".to_string(), credential);
        query_parameters.insert("X-Goog-Date".to_string(), request_timestamp.clone());
        query_parameters.insert(
            "X-Goog-Expires".to_string(),
            self.expiration.as_secs().to_string(),
        );
        query_parameters.insert("X-Goog-SignedHeaders".to_string(), signed_headers.clone());

        let mut canonical_query = form_urlencoded::Serializer::new(String::new());
        query_parameters.iter().for_each(|(k, v)| {
            canonical_query.append_pair(k, v);
        });
        let canonical_query_string = canonical_query.finish();

        let canonical_request = [
            self.method.as_str(),
            canonical_uri.as_str(),
            canonical_query_string.as_str(),
            canonical_headers.as_str(),
            signed_headers.as_str(),
            "UNSIGNED-PAYLOAD",
        ]
        .join("\n");
        let canonical_request_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));

        let string_to_sign = [
            "GOOG4-RSA-SHA256",
            request_timestamp.as_str(),
            credential_scope.as_str(),
            canonical_request_hash.as_str(),
        ]
        .join("\n");

        let signature = self.credentials.sign(string_to_sign.as_bytes()).await?;
        let signature = hex::encode(signature);

        Ok(format!(
            "{scheme}://{host}{canonical_uri}?{canonical_query_string}&x-goog-signature={signature}"
        ))
    }

    async fn build_v2(self) -> Result<String> {
        let (scheme, host, _) = self.location()?;
        let encoded_object = utf8_percent_encode(&self.object, PATH_ENCODE_SET).to_string();
        // The signed resource always names the bucket, even for
        // virtual-hosted URLs.
        let resource = format!("/{}/{encoded_object}", self.bucket);
        let expires = (chrono::Utc::now() + self.expiration).timestamp();
        let client_email = match self.client_email_or_fetch() {
            Some(email) => email,
            None => self.credentials.client_email().await?,
        };

        let extension_headers = self
            .headers
            .iter()
            .fold(String::new(), |acc, (k, v)| format!("{acc}{k}:{v}\n"));
        let blob = format!(
            "{}\n{}\n{}\n{expires}\n{extension_headers}{resource}",
            self.method,
            self.content_md5.as_deref().unwrap_or(""),
            self.content_type.as_deref().unwrap_or(""),
        );
        let signature = self.credentials.sign(blob.as_bytes()).await?;
        let signature = BASE64_STANDARD.encode(signature);

        let path = if self.virtual_hosted {
            format!("/{encoded_object}")
        } else {
            resource.clone()
        };
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("GoogleAccessId", &client_email);
        query.append_pair("Expires", &expires.to_string());
        query.append_pair("Signature", &signature);
        let query = query.finish();
        Ok(format!("{scheme}://{host}{path}?{query}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::testing::FakeSigningCredentials;

    type Result = anyhow::Result<()>;

    fn builder(bucket: &str, object: &str) -> SignedUrlBuilder {
        SignedUrlBuilder::new(
            Credentials::from(FakeSigningCredentials),
            "https://storage.googleapis.com".to_string(),
            bucket,
            object,
        )
    }

    #[tokio::test]
    async fn v4_virtual_hosted() -> Result {
        let url = builder("test-bucket", "test-object")
            .with_version(SignedUrlVersion::V4)
            .with_method("PUT")
            .with_expiration(Duration::from_secs(3600))
            .with_header("x-goog-meta-test", "value")
            .build()
            .await?;
        assert!(
            url.starts_with("https://test-bucket.storage.googleapis.com/test-object?"),
            "{url}"
        );
        assert!(url.contains("X-Goog-Algorithm=GOOG4-RSA-SHA256"), "{url}");
        assert!(url.contains("X-Goog-Credential=test%40example.com"), "{url}");
        assert!(url.contains("X-Goog-Expires=3600"), "{url}");
        assert!(
            url.contains("X-Goog-SignedHeaders=host%3Bx-goog-meta-test"),
            "{url}"
        );
        // The fake signer returns `signed-<len>`; the signature is its hex.
        assert!(url.contains("&x-goog-signature="), "{url}");
        let signature = url.split("x-goog-signature=").nth(1).unwrap();
        assert!(
            hex::decode(signature).unwrap().starts_with(b"signed-"),
            "{url}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn v4_path_style_and_escaping() -> Result {
        let url = builder("test-bucket", "folder/test object.txt")
            .with_version(SignedUrlVersion::V4)
            .with_path_style()
            .build()
            .await?;
        assert!(
            url.starts_with(
                "https://storage.googleapis.com/test-bucket/folder/test%20object.txt?"
            ),
            "{url}"
        );
        Ok(())
    }

    #[tokio::test]
    async fn v2_query_parameters() -> Result {
        let url = builder("test-bucket", "test-object")
            .with_version(SignedUrlVersion::V2)
            .with_method("GET")
            .with_content_type("text/plain")
            .with_expiration(Duration::from_secs(600))
            .build()
            .await?;
        assert!(
            url.starts_with("https://test-bucket.storage.googleapis.com/test-object?"),
            "{url}"
        );
        assert!(url.contains("GoogleAccessId=test%40example.com"), "{url}");
        assert!(url.contains("Expires="), "{url}");
        assert!(url.contains("Signature="), "{url}");
        Ok(())
    }

    #[tokio::test]
    async fn version_must_be_explicit() {
        let err = builder("b", "o").build().await.unwrap_err();
        assert!(err.is_validation(), "{err:?}");
    }

    #[tokio::test]
    async fn expiration_is_bounded() {
        let err = builder("b", "o")
            .with_version(SignedUrlVersion::V4)
            .with_expiration(MAX_EXPIRATION + Duration::from_secs(1))
            .build()
            .await
            .unwrap_err();
        assert!(err.is_validation(), "{err:?}");

        let err = builder("b", "o")
            .with_version(SignedUrlVersion::V4)
            .with_expiration(Duration::ZERO)
            .build()
            .await
            .unwrap_err();
        assert!(err.is_validation(), "{err:?}");
    }

    #[tokio::test]
    async fn anonymous_credentials_cannot_sign() {
        let builder = SignedUrlBuilder::new(
            crate::credentials::testing::test_credentials(),
            "https://storage.googleapis.com".to_string(),
            "b",
            "o",
        );
        let err = builder
            .with_version(SignedUrlVersion::V4)
            .build()
            .await
            .unwrap_err();
        assert!(err.is_authentication(), "{err:?}");
    }
}
