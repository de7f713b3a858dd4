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

//! The Cloud Storage client and its resource surfaces.
//!
//! [Storage] is a cheaply clonable handle over shared state (connection
//! pool, credentials, default policies). The resource surfaces (buckets,
//! objects, ACLs, notifications, HMAC keys) are thin wrappers over the
//! transport; data transfer goes through the dedicated engines
//! ([resumable_upload][crate::resumable_upload],
//! [multipart_upload][crate::multipart_upload],
//! [read_object][crate::read_object], [transfer][crate::transfer]).
//!
//! Each mutation computes its idempotency before submission: requests with
//! preconditions or etags may be retried, bucket creation and deletion are
//! safely retriable, and other mutations are not re-sent after failures.

use crate::credentials::Credentials;
use crate::model::*;
use crate::multipart_upload::MultipartUpload;
use crate::read_object::ReadObject;
use crate::resumable_upload::ResumableUpload;
use crate::signed_url::SignedUrlBuilder;
use crate::transfer::TransferManager;
use crate::transport::{DEFAULT_ENDPOINT, StorageInner, enc, info};
use crate::upload_source::UploadPayload;
use crate::{Error, Result};
use reqwest::Method;
use std::sync::Arc;

/// A client for the Cloud Storage JSON API.
///
/// # Example
/// ```no_run
/// # use google_cloud_storage_v1::client::Storage;
/// # use google_cloud_storage_v1::credentials::StaticTokenCredentials;
/// # async fn sample() -> anyhow::Result<()> {
/// let client = Storage::builder()
///     .with_credentials(StaticTokenCredentials::new("token"))
///     .build()?;
/// let bucket = client.buckets().get("my-bucket").await?;
/// println!("bucket: {bucket:?}");
/// # Ok(()) }
/// ```
///
/// The client holds a connection pool; create one and clone it freely, the
/// clones share the pool.
#[derive(Clone, Debug)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Returns a builder for [Storage].
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Bucket operations.
    pub fn buckets(&self) -> Buckets {
        Buckets {
            inner: self.inner.clone(),
        }
    }

    /// Object metadata operations. Data transfer goes through
    /// [resumable_upload][Storage::resumable_upload] and
    /// [read_object][Storage::read_object].
    pub fn objects(&self) -> Objects {
        Objects {
            inner: self.inner.clone(),
        }
    }

    /// Access controls on one object.
    pub fn object_acls<B, O>(&self, bucket: B, object: O) -> AccessControls
    where
        B: Into<String>,
        O: Into<String>,
    {
        AccessControls {
            inner: self.inner.clone(),
            base_path: format!("/b/{}/o/{}/acl", bucket.into(), enc(&object.into())),
        }
    }

    /// The default access controls applied to new objects in a bucket.
    pub fn default_object_acls<B: Into<String>>(&self, bucket: B) -> AccessControls {
        AccessControls {
            inner: self.inner.clone(),
            base_path: format!("/b/{}/defaultObjectAcl", bucket.into()),
        }
    }

    /// Access controls on the bucket itself.
    pub fn bucket_acls<B: Into<String>>(&self, bucket: B) -> AccessControls {
        AccessControls {
            inner: self.inner.clone(),
            base_path: format!("/b/{}/acl", bucket.into()),
        }
    }

    /// Notification configurations on a bucket.
    pub fn notifications<B: Into<String>>(&self, bucket: B) -> Notifications {
        Notifications {
            inner: self.inner.clone(),
            bucket: bucket.into(),
        }
    }

    /// HMAC keys for a project.
    pub fn hmac_keys<P: Into<String>>(&self, project: P) -> HmacKeys {
        HmacKeys {
            inner: self.inner.clone(),
            project: project.into(),
        }
    }

    /// Watch channel control.
    pub fn channels(&self) -> Channels {
        Channels {
            inner: self.inner.clone(),
        }
    }

    /// Starts a resumable upload of `payload` to `bucket`/`object`.
    pub fn resumable_upload<B, O, T, P>(
        &self,
        bucket: B,
        object: O,
        payload: T,
    ) -> ResumableUpload<UploadPayload<P>>
    where
        B: Into<String>,
        O: Into<String>,
        T: Into<UploadPayload<P>>,
    {
        ResumableUpload::new(self.inner.clone(), bucket, object, payload.into())
    }

    /// Starts an XML multipart upload of `bucket`/`object`.
    pub fn multipart_upload<B, O>(&self, bucket: B, object: O) -> MultipartUpload
    where
        B: Into<String>,
        O: Into<String>,
    {
        MultipartUpload::new(self.inner.clone(), bucket, object)
    }

    /// Reads the data of `bucket`/`object`.
    pub fn read_object<B, O>(&self, bucket: B, object: O) -> ReadObject
    where
        B: Into<String>,
        O: Into<String>,
    {
        ReadObject::new(self.inner.clone(), bucket, object)
    }

    /// Bulk parallel transfers.
    pub fn transfer_manager(&self) -> TransferManager {
        TransferManager::new(self.inner.clone())
    }

    /// Builds a signed URL for `bucket`/`object`.
    pub fn signed_url<B, O>(&self, bucket: B, object: O) -> SignedUrlBuilder
    where
        B: Into<String>,
        O: Into<String>,
    {
        SignedUrlBuilder::new(
            self.inner.credentials.clone(),
            self.inner.endpoint.clone(),
            bucket,
            object,
        )
    }
}

/// Configures and builds a [Storage] client.
pub struct ClientBuilder {
    endpoint: Option<String>,
    credentials: Option<Credentials>,
    user_agent: Option<String>,
    retry_policy: Option<Arc<dyn crate::retry_policy::RetryPolicy>>,
    backoff_policy: Option<Arc<dyn crate::backoff_policy::BackoffPolicy>>,
}

impl ClientBuilder {
    fn new() -> Self {
        Self {
            endpoint: None,
            credentials: None,
            user_agent: None,
            retry_policy: None,
            backoff_policy: None,
        }
    }

    /// Override the service endpoint, e.g. to talk to an emulator.
    pub fn with_endpoint<T: Into<String>>(mut self, v: T) -> Self {
        self.endpoint = Some(v.into());
        self
    }

    /// The credential provider. Defaults to anonymous credentials, which
    /// only work against emulators and public data.
    pub fn with_credentials<T: Into<Credentials>>(mut self, v: T) -> Self {
        self.credentials = Some(v.into());
        self
    }

    /// Prepend an application identifier to the `User-Agent`.
    pub fn with_user_agent<T: Into<String>>(mut self, v: T) -> Self {
        self.user_agent = Some(v.into());
        self
    }

    /// The default retry policy for all operations.
    pub fn with_retry_policy<V: Into<crate::retry_policy::RetryPolicyArg>>(mut self, v: V) -> Self {
        self.retry_policy = Some(v.into().into());
        self
    }

    /// The default backoff policy for all operations.
    pub fn with_backoff_policy<V: Into<crate::backoff_policy::BackoffPolicyArg>>(
        mut self,
        v: V,
    ) -> Self {
        self.backoff_policy = Some(v.into().into());
        self
    }

    pub fn build(self) -> Result<Storage> {
        let client = reqwest::Client::builder().build().map_err(Error::other)?;
        let credentials = self
            .credentials
            .unwrap_or_else(|| Credentials::from(crate::credentials::AnonymousCredentials));
        let user_agent = match self.user_agent {
            Some(ua) => format!("{ua} {}", *info::USER_AGENT),
            None => info::USER_AGENT.clone(),
        };
        let inner = StorageInner {
            client,
            credentials,
            endpoint: self
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            user_agent,
            retry_policy: self
                .retry_policy
                .unwrap_or_else(|| Arc::new(crate::retry_policy::default())),
            backoff_policy: self
                .backoff_policy
                .unwrap_or_else(|| Arc::new(crate::backoff_policy::default())),
        };
        Ok(Storage {
            inner: Arc::new(inner),
        })
    }
}

/// Bucket operations.
#[derive(Clone, Debug)]
pub struct Buckets {
    inner: Arc<StorageInner>,
}

impl Buckets {
    /// Fetches a bucket's metadata.
    pub async fn get(&self, bucket: &str) -> Result<Bucket> {
        check_name(bucket, "bucket")?;
        self.inner
            .execute_json(
                Method::GET,
                self.inner.json_url(&format!("/b/{bucket}")),
                vec![],
                None,
                true,
                &self.inner.request_options(),
            )
            .await
    }

    /// Creates a bucket in `project`.
    ///
    /// Bucket names are globally unique, so re-sending a create after an
    /// ambiguous failure cannot clobber anything: the request is safely
    /// retriable.
    pub async fn create(&self, project: &str, bucket: &Bucket) -> Result<Bucket> {
        check_name(project, "project")?;
        check_name(&bucket.name, "bucket")?;
        self.inner
            .execute_json(
                Method::POST,
                self.inner.json_url("/b"),
                vec![("project".to_string(), project.to_string())],
                Some(serde_json::to_value(bucket).map_err(Error::other)?),
                true,
                &self.inner.request_options(),
            )
            .await
    }

    /// Fetches a bucket, creating it when it does not exist.
    pub async fn get_auto_create(&self, project: &str, bucket: &str) -> Result<Bucket> {
        match self.get(bucket).await {
            Err(e) if e.is_not_found() => {
                let request = Bucket {
                    name: bucket.to_string(),
                    ..Bucket::default()
                };
                self.create(project, &request).await
            }
            other => other,
        }
    }

    /// Creates a bucket, fetching it when it already exists.
    pub async fn get_or_create(&self, project: &str, bucket: &str) -> Result<Bucket> {
        let request = Bucket {
            name: bucket.to_string(),
            ..Bucket::default()
        };
        match self.create(project, &request).await {
            Err(e) if e.is_already_exists() => self.get(bucket).await,
            other => other,
        }
    }

    /// Lists all buckets in `project`.
    pub async fn list(&self, project: &str) -> Result<Vec<Bucket>> {
        check_name(project, "project")?;
        let mut buckets = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("project".to_string(), project.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken".to_string(), token));
            }
            let page: ListBucketsResponse = self
                .inner
                .execute_json(
                    Method::GET,
                    self.inner.json_url("/b"),
                    query,
                    None,
                    true,
                    &self.inner.request_options(),
                )
                .await?;
            buckets.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(buckets),
            }
        }
    }

    /// Updates bucket metadata.
    ///
    /// Only retried when `if_metageneration_match` makes the patch
    /// conditional.
    pub async fn patch(
        &self,
        bucket: &str,
        metadata: serde_json::Value,
        if_metageneration_match: Option<i64>,
    ) -> Result<Bucket> {
        check_name(bucket, "bucket")?;
        let mut query = vec![];
        if let Some(v) = if_metageneration_match {
            query.push(("ifMetagenerationMatch".to_string(), v.to_string()));
        }
        self.inner
            .execute_json(
                Method::PATCH,
                self.inner.json_url(&format!("/b/{bucket}")),
                query,
                Some(metadata),
                if_metageneration_match.is_some(),
                &self.inner.request_options(),
            )
            .await
    }

    /// Deletes an empty bucket. Safely retriable: a duplicate delete gets
    /// 404 and nothing else changes.
    pub async fn delete(&self, bucket: &str) -> Result<()> {
        check_name(bucket, "bucket")?;
        self.inner
            .execute_unit(
                Method::DELETE,
                self.inner.json_url(&format!("/b/{bucket}")),
                vec![],
                true,
                &self.inner.request_options(),
            )
            .await
    }

    /// Fetches the IAM policy of a bucket.
    pub async fn get_iam_policy(&self, bucket: &str) -> Result<Policy> {
        check_name(bucket, "bucket")?;
        self.inner
            .execute_json(
                Method::GET,
                self.inner.json_url(&format!("/b/{bucket}/iam")),
                vec![],
                None,
                true,
                &self.inner.request_options(),
            )
            .await
    }

    /// Replaces the IAM policy of a bucket.
    ///
    /// A policy carrying the etag from a previous read is conditional and
    /// therefore retriable.
    pub async fn set_iam_policy(&self, bucket: &str, policy: &Policy) -> Result<Policy> {
        check_name(bucket, "bucket")?;
        self.inner
            .execute_json(
                Method::PUT,
                self.inner.json_url(&format!("/b/{bucket}/iam")),
                vec![],
                Some(serde_json::to_value(policy).map_err(Error::other)?),
                !policy.etag.is_empty(),
                &self.inner.request_options(),
            )
            .await
    }

    /// Tests which of `permissions` the caller holds on the bucket.
    pub async fn test_iam_permissions(
        &self,
        bucket: &str,
        permissions: &[&str],
    ) -> Result<TestIamPermissionsResponse> {
        check_name(bucket, "bucket")?;
        let query = permissions
            .iter()
            .map(|p| ("permissions".to_string(), p.to_string()))
            .collect();
        self.inner
            .execute_json(
                Method::GET,
                self.inner
                    .json_url(&format!("/b/{bucket}/iam/testPermissions")),
                query,
                None,
                true,
                &self.inner.request_options(),
            )
            .await
    }
}

/// The query parameters of an object listing.
#[derive(Clone, Debug, Default)]
pub struct ListObjectsRequest {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub page_token: Option<String>,
    pub max_results: Option<i32>,
    pub versions: bool,
}

/// Object metadata operations.
#[derive(Clone, Debug)]
pub struct Objects {
    inner: Arc<StorageInner>,
}

impl Objects {
    /// Fetches an object's metadata.
    pub async fn get(&self, bucket: &str, object: &str) -> Result<Object> {
        check_name(bucket, "bucket")?;
        check_name(object, "object")?;
        self.inner
            .execute_json(
                Method::GET,
                self.inner.json_url(&format!("/b/{bucket}/o/{}", enc(object))),
                vec![],
                None,
                true,
                &self.inner.request_options(),
            )
            .await
    }

    /// Lists one page of objects.
    pub async fn list(
        &self,
        bucket: &str,
        request: ListObjectsRequest,
    ) -> Result<ListObjectsResponse> {
        check_name(bucket, "bucket")?;
        let mut query = Vec::new();
        if let Some(v) = request.prefix {
            query.push(("prefix".to_string(), v));
        }
        if let Some(v) = request.delimiter {
            query.push(("delimiter".to_string(), v));
        }
        if let Some(v) = request.page_token {
            query.push(("pageToken".to_string(), v));
        }
        if let Some(v) = request.max_results {
            query.push(("maxResults".to_string(), v.to_string()));
        }
        if request.versions {
            query.push(("versions".to_string(), "true".to_string()));
        }
        self.inner
            .execute_json(
                Method::GET,
                self.inner.json_url(&format!("/b/{bucket}/o")),
                query,
                None,
                true,
                &self.inner.request_options(),
            )
            .await
    }

    /// Updates object metadata.
    pub async fn patch(
        &self,
        bucket: &str,
        object: &str,
        metadata: serde_json::Value,
        if_metageneration_match: Option<i64>,
    ) -> Result<Object> {
        check_name(bucket, "bucket")?;
        check_name(object, "object")?;
        let mut query = Vec::new();
        if let Some(v) = if_metageneration_match {
            query.push(("ifMetagenerationMatch".to_string(), v.to_string()));
        }
        self.inner
            .execute_json(
                Method::PATCH,
                self.inner.json_url(&format!("/b/{bucket}/o/{}", enc(object))),
                query,
                Some(metadata),
                if_metageneration_match.is_some(),
                &self.inner.request_options(),
            )
            .await
    }

    /// Deletes an object (or one generation of it).
    pub async fn delete(
        &self,
        bucket: &str,
        object: &str,
        if_generation_match: Option<i64>,
    ) -> Result<()> {
        check_name(bucket, "bucket")?;
        check_name(object, "object")?;
        let mut query = Vec::new();
        if let Some(v) = if_generation_match {
            query.push(("ifGenerationMatch".to_string(), v.to_string()));
        }
        self.inner
            .execute_unit(
                Method::DELETE,
                self.inner.json_url(&format!("/b/{bucket}/o/{}", enc(object))),
                query,
                if_generation_match.is_some(),
                &self.inner.request_options(),
            )
            .await
    }

    /// Concatenates source objects into `destination`.
    pub async fn compose(
        &self,
        bucket: &str,
        destination: &str,
        request: &ComposeRequest,
        if_generation_match: Option<i64>,
    ) -> Result<Object> {
        check_name(bucket, "bucket")?;
        check_name(destination, "object")?;
        if request.source_objects.len() < 2 {
            return Err(Error::validation(
                "compose requires at least two source objects",
            ));
        }
        let mut query = Vec::new();
        if let Some(v) = if_generation_match {
            query.push(("ifGenerationMatch".to_string(), v.to_string()));
        }
        self.inner
            .execute_json(
                Method::POST,
                self.inner.json_url(&format!(
                    "/b/{bucket}/o/{}/compose",
                    enc(destination)
                )),
                query,
                Some(serde_json::to_value(request).map_err(Error::other)?),
                if_generation_match.is_some(),
                &self.inner.request_options(),
            )
            .await
    }

    /// Watches the bucket's object changes through a webhook channel.
    pub async fn watch_all(&self, bucket: &str, id: &str, address: &str) -> Result<Channel> {
        check_name(bucket, "bucket")?;
        check_name(id, "channel id")?;
        check_name(address, "address")?;
        let body = serde_json::json!({
            "id": id,
            "type": "web_hook",
            "address": address,
        });
        self.inner
            .execute_json(
                Method::POST,
                self.inner.json_url(&format!("/b/{bucket}/o/watch")),
                vec![],
                Some(body),
                false,
                &self.inner.request_options(),
            )
            .await
    }
}

/// An access-control role.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AclRole {
    Owner,
    Reader,
    Writer,
}

impl AclRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Reader => "READER",
            Self::Writer => "WRITER",
        }
    }
}

/// The entity an access-control entry grants to.
#[derive(Clone, Debug, PartialEq)]
pub enum AclEntity {
    AllUsers,
    AllAuthenticatedUsers,
    User(String),
    Group(String),
    Domain(String),
    Project(String),
}

impl std::fmt::Display for AclEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllUsers => write!(f, "allUsers"),
            Self::AllAuthenticatedUsers => write!(f, "allAuthenticatedUsers"),
            Self::User(id) => write!(f, "user-{id}"),
            Self::Group(id) => write!(f, "group-{id}"),
            Self::Domain(id) => write!(f, "domain-{id}"),
            Self::Project(id) => write!(f, "project-{id}"),
        }
    }
}

/// An access-control mutation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AclOp {
    Add,
    Delete,
}

/// Access-control entries on one resource (an object, or a bucket's
/// default object ACLs).
///
/// All grants go through one [modify][AccessControls::modify] operation
/// over the role × entity × op table instead of per-combination methods.
#[derive(Clone, Debug)]
pub struct AccessControls {
    inner: Arc<StorageInner>,
    base_path: String,
}

impl AccessControls {
    /// Applies one ACL mutation. Returns the created entry for
    /// [AclOp::Add], `None` for [AclOp::Delete].
    ///
    /// ACL mutations carry no preconditions, so they are not retried.
    pub async fn modify(
        &self,
        entity: AclEntity,
        role: AclRole,
        op: AclOp,
    ) -> Result<Option<ObjectAccessControl>> {
        match op {
            AclOp::Add => {
                let body = serde_json::json!({
                    "entity": entity.to_string(),
                    "role": role.as_str(),
                });
                let acl = self
                    .inner
                    .execute_json(
                        Method::POST,
                        self.inner.json_url(&self.base_path),
                        vec![],
                        Some(body),
                        false,
                        &self.inner.request_options(),
                    )
                    .await?;
                Ok(Some(acl))
            }
            AclOp::Delete => {
                self.inner
                    .execute_unit(
                        Method::DELETE,
                        self.inner
                            .json_url(&format!("{}/{}", self.base_path, entity)),
                        vec![],
                        false,
                        &self.inner.request_options(),
                    )
                    .await?;
                Ok(None)
            }
        }
    }

    /// Lists all entries on the resource.
    pub async fn list(&self) -> Result<Vec<ObjectAccessControl>> {
        let response: ListObjectAccessControlsResponse = self
            .inner
            .execute_json(
                Method::GET,
                self.inner.json_url(&self.base_path),
                vec![],
                None,
                true,
                &self.inner.request_options(),
            )
            .await?;
        Ok(response.items)
    }

    /// Fetches the entry for one entity.
    pub async fn get(&self, entity: AclEntity) -> Result<ObjectAccessControl> {
        self.inner
            .execute_json(
                Method::GET,
                self.inner
                    .json_url(&format!("{}/{}", self.base_path, entity)),
                vec![],
                None,
                true,
                &self.inner.request_options(),
            )
            .await
    }

    /// Replaces the role of an existing entry.
    pub async fn update(
        &self,
        entity: AclEntity,
        role: AclRole,
    ) -> Result<ObjectAccessControl> {
        let body = serde_json::json!({
            "entity": entity.to_string(),
            "role": role.as_str(),
        });
        self.inner
            .execute_json(
                Method::PUT,
                self.inner
                    .json_url(&format!("{}/{}", self.base_path, entity)),
                vec![],
                Some(body),
                false,
                &self.inner.request_options(),
            )
            .await
    }
}

/// Notification configurations on a bucket.
#[derive(Clone, Debug)]
pub struct Notifications {
    inner: Arc<StorageInner>,
    bucket: String,
}

impl Notifications {
    fn path(&self) -> String {
        format!("/b/{}/notificationConfigs", self.bucket)
    }

    /// Creates a notification configuration. Not retried: a duplicate
    /// create produces a second configuration.
    pub async fn create(&self, notification: &Notification) -> Result<Notification> {
        check_name(&notification.topic, "topic")?;
        self.inner
            .execute_json(
                Method::POST,
                self.inner.json_url(&self.path()),
                vec![],
                Some(serde_json::to_value(notification).map_err(Error::other)?),
                false,
                &self.inner.request_options(),
            )
            .await
    }

    pub async fn list(&self) -> Result<Vec<Notification>> {
        let response: ListNotificationsResponse = self
            .inner
            .execute_json(
                Method::GET,
                self.inner.json_url(&self.path()),
                vec![],
                None,
                true,
                &self.inner.request_options(),
            )
            .await?;
        Ok(response.items)
    }

    pub async fn get(&self, id: &str) -> Result<Notification> {
        check_name(id, "notification id")?;
        self.inner
            .execute_json(
                Method::GET,
                self.inner.json_url(&format!("{}/{id}", self.path())),
                vec![],
                None,
                true,
                &self.inner.request_options(),
            )
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        check_name(id, "notification id")?;
        self.inner
            .execute_unit(
                Method::DELETE,
                self.inner.json_url(&format!("{}/{id}", self.path())),
                vec![],
                false,
                &self.inner.request_options(),
            )
            .await
    }
}

/// HMAC keys of a project's service accounts.
#[derive(Clone, Debug)]
pub struct HmacKeys {
    inner: Arc<StorageInner>,
    project: String,
}

impl HmacKeys {
    fn path(&self) -> String {
        format!("/projects/{}/hmacKeys", self.project)
    }

    /// Creates a key for `service_account_email`. The response is the only
    /// time the secret is available. Not retried: a duplicate create mints
    /// a second key.
    pub async fn create(&self, service_account_email: &str) -> Result<HmacKey> {
        check_name(service_account_email, "service account email")?;
        self.inner
            .execute_json(
                Method::POST,
                self.inner.json_url(&self.path()),
                vec![(
                    "serviceAccountEmail".to_string(),
                    service_account_email.to_string(),
                )],
                None,
                false,
                &self.inner.request_options(),
            )
            .await
    }

    pub async fn list(&self) -> Result<Vec<HmacKeyMetadata>> {
        let mut keys = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = Vec::new();
            if let Some(token) = page_token.take() {
                query.push(("pageToken".to_string(), token));
            }
            let page: ListHmacKeysResponse = self
                .inner
                .execute_json(
                    Method::GET,
                    self.inner.json_url(&self.path()),
                    query,
                    None,
                    true,
                    &self.inner.request_options(),
                )
                .await?;
            keys.extend(page.items);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(keys),
            }
        }
    }

    pub async fn get(&self, access_id: &str) -> Result<HmacKeyMetadata> {
        check_name(access_id, "access id")?;
        self.inner
            .execute_json(
                Method::GET,
                self.inner.json_url(&format!("{}/{access_id}", self.path())),
                vec![],
                None,
                true,
                &self.inner.request_options(),
            )
            .await
    }

    /// Updates a key's state (`ACTIVE` or `INACTIVE`).
    ///
    /// Passing the etag from a previous read makes the update conditional
    /// and therefore retriable.
    pub async fn update(
        &self,
        access_id: &str,
        state: &str,
        etag: Option<&str>,
    ) -> Result<HmacKeyMetadata> {
        check_name(access_id, "access id")?;
        if state.is_empty() {
            return Err(Error::validation("the new key state must not be empty"));
        }
        let mut body = serde_json::Map::new();
        body.insert("state".to_string(), state.into());
        if let Some(etag) = etag {
            body.insert("etag".to_string(), etag.into());
        }
        self.inner
            .execute_json(
                Method::PUT,
                self.inner.json_url(&format!("{}/{access_id}", self.path())),
                vec![],
                Some(body.into()),
                etag.is_some(),
                &self.inner.request_options(),
            )
            .await
    }

    /// Deletes an inactive key.
    pub async fn delete(&self, access_id: &str) -> Result<()> {
        check_name(access_id, "access id")?;
        self.inner
            .execute_unit(
                Method::DELETE,
                self.inner.json_url(&format!("{}/{access_id}", self.path())),
                vec![],
                false,
                &self.inner.request_options(),
            )
            .await
    }
}

/// Watch channel control.
#[derive(Clone, Debug)]
pub struct Channels {
    inner: Arc<StorageInner>,
}

impl Channels {
    /// Stops receiving notifications on a watch channel.
    pub async fn stop(&self, channel: &Channel) -> Result<()> {
        check_name(&channel.id, "channel id")?;
        check_name(&channel.resource_id, "resource id")?;
        let body = serde_json::json!({
            "id": channel.id,
            "resourceId": channel.resource_id,
        });
        self.inner
            .execute_unit_with_body(
                Method::POST,
                self.inner.json_url("/channels/stop"),
                body,
                false,
                &self.inner.request_options(),
            )
            .await
    }
}

fn check_name(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::validation(format!("the {what} must not be empty")));
    }
    Ok(())
}
