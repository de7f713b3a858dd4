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

//! Pluggable credentials for the Cloud Storage client.
//!
//! The client does not acquire tokens itself. Applications supply a
//! [CredentialsProvider] that produces the request headers for each attempt
//! and, for signed URLs, exposes a service account email and a signing
//! operation. Providers that cache or refresh tokens must serialize the
//! refresh internally; the client may call [CredentialsProvider::headers]
//! concurrently from many transfers.

use crate::{Error, Result};
use http::HeaderMap;
use std::sync::Arc;

/// Produces authentication material for requests and signed URLs.
#[async_trait::async_trait]
pub trait CredentialsProvider: std::fmt::Debug + Send + Sync {
    /// The headers to attach to one request attempt.
    ///
    /// Called before every attempt, including retries of the same logical
    /// operation, so expired tokens are replaced mid retry loop.
    async fn headers(&self) -> Result<HeaderMap>;

    /// The service account email used in signed URL credentials.
    async fn client_email(&self) -> Result<String> {
        Err(Error::authentication(
            "these credentials do not expose a client email",
        ))
    }

    /// Sign `content` with the service account's RSA key.
    ///
    /// Returns the raw signature bytes; callers encode them as the consuming
    /// protocol requires (hex for V4 signed URLs, base64 for V2).
    async fn sign(&self, _content: &[u8]) -> Result<Vec<u8>> {
        Err(Error::authentication(
            "these credentials do not support signing",
        ))
    }
}

/// A shared handle to a [CredentialsProvider].
#[derive(Clone, Debug)]
pub struct Credentials {
    inner: Arc<dyn CredentialsProvider>,
}

impl Credentials {
    pub async fn headers(&self) -> Result<HeaderMap> {
        self.inner.headers().await
    }

    pub async fn client_email(&self) -> Result<String> {
        self.inner.client_email().await
    }

    pub async fn sign(&self, content: &[u8]) -> Result<Vec<u8>> {
        self.inner.sign(content).await
    }
}

impl<T> From<T> for Credentials
where
    T: CredentialsProvider + 'static,
{
    fn from(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }
}

/// Credentials that attach a fixed bearer token to every request.
#[derive(Clone)]
pub struct StaticTokenCredentials {
    token: String,
}

impl StaticTokenCredentials {
    pub fn new<T: Into<String>>(token: T) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The token is a secret, never include it in debug output.
        f.debug_struct("StaticTokenCredentials").finish()
    }
}

#[async_trait::async_trait]
impl CredentialsProvider for StaticTokenCredentials {
    async fn headers(&self) -> Result<HeaderMap> {
        let value = format!("Bearer {}", self.token);
        let mut value =
            http::HeaderValue::from_str(&value).map_err(Error::authentication)?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, value);
        Ok(headers)
    }
}

/// Credentials that attach nothing. Useful against emulators and in tests.
#[derive(Clone, Debug, Default)]
pub struct AnonymousCredentials;

#[async_trait::async_trait]
impl CredentialsProvider for AnonymousCredentials {
    async fn headers(&self) -> Result<HeaderMap> {
        Ok(HeaderMap::new())
    }
}

/// Credentials for tests.
pub mod testing {
    use super::*;

    /// Anonymous credentials for use against local test servers.
    pub fn test_credentials() -> Credentials {
        Credentials::from(AnonymousCredentials)
    }

    /// Credentials with a deterministic signer, for signed URL tests.
    #[derive(Debug)]
    pub struct FakeSigningCredentials;

    #[async_trait::async_trait]
    impl CredentialsProvider for FakeSigningCredentials {
        async fn headers(&self) -> Result<HeaderMap> {
            Ok(HeaderMap::new())
        }
        async fn client_email(&self) -> Result<String> {
            Ok("test@example.com".to_string())
        }
        async fn sign(&self, content: &[u8]) -> Result<Vec<u8>> {
            // Not a real signature: the content length keeps tests honest
            // about what was signed.
            Ok(format!("signed-{}", content.len()).into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_token_headers() -> anyhow::Result<()> {
        let credentials = Credentials::from(StaticTokenCredentials::new("token-123"));
        let headers = credentials.headers().await?;
        let auth = headers.get(http::header::AUTHORIZATION).unwrap();
        assert!(auth.is_sensitive());
        assert_eq!(auth.to_str()?, "Bearer token-123");
        Ok(())
    }

    #[tokio::test]
    async fn static_token_debug_hides_token() {
        let credentials = StaticTokenCredentials::new("super-secret");
        let fmt = format!("{credentials:?}");
        assert!(!fmt.contains("super-secret"), "{fmt}");
    }

    #[tokio::test]
    async fn anonymous_headers_empty() -> anyhow::Result<()> {
        let credentials = testing::test_credentials();
        assert!(credentials.headers().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn anonymous_cannot_sign() {
        let credentials = testing::test_credentials();
        let err = credentials.sign(b"blob").await.unwrap_err();
        assert!(err.is_authentication(), "{err:?}");
        let err = credentials.client_email().await.unwrap_err();
        assert!(err.is_authentication(), "{err:?}");
    }
}
