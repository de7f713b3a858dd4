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

//! Bulk data transfer.
//!
//! The transfer manager decomposes batch operations into unit tasks and
//! runs them on a bounded-concurrency scheduler: parallel uploads and
//! downloads of many objects, sharded downloads of one large object via
//! ranged reads, and sharded uploads of one large file via the XML
//! multipart protocol. Requests carry a `gccl-gcs-cmd` tag naming the
//! operation that produced them.

mod scheduler;

use crate::error::ReadError;
use crate::multipart_upload::{MultipartUpload, PartsMap};
use crate::read_object::{ReadObject, ReadRange};
use crate::resumable_upload::ResumableUpload;
use crate::transport::{StorageInner, enc};
use crate::upload_source::UploadPayload;
use crate::{Error, Result};
use scheduler::TransferScheduler;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;
/// The default parallelism for bulk operations.
const DEFAULT_CONCURRENCY: usize = 2;
/// Sharded downloads below this size degrade to one ranged read.
const SHARDED_DOWNLOAD_THRESHOLD: u64 = 32 * MIB;
/// The default shard size for downloads.
const SHARDED_DOWNLOAD_CHUNK: u64 = 10 * MIB;
/// The default part size for sharded uploads.
const SHARDED_UPLOAD_CHUNK: u64 = 32 * MIB;

/// Options for [TransferManager::upload_many_files].
#[derive(Clone, Debug)]
pub struct UploadManyOptions {
    concurrency_limit: usize,
    max_queue_size: Option<usize>,
    skip_if_exists: bool,
    prefix: Option<String>,
    continue_on_error: bool,
    cancel: CancellationToken,
}

impl Default for UploadManyOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY,
            max_queue_size: None,
            skip_if_exists: false,
            prefix: None,
            continue_on_error: false,
            cancel: CancellationToken::new(),
        }
    }
}

impl UploadManyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency_limit(mut self, v: usize) -> Self {
        self.concurrency_limit = v;
        self
    }

    pub fn with_max_queue_size(mut self, v: usize) -> Self {
        self.max_queue_size = Some(v);
        self
    }

    /// Skip objects that already exist, via an `ifGenerationMatch=0`
    /// precondition.
    pub fn with_skip_if_exists(mut self, v: bool) -> Self {
        self.skip_if_exists = v;
        self
    }

    /// Prepend a prefix to every destination object name.
    pub fn with_prefix<T: Into<String>>(mut self, v: T) -> Self {
        self.prefix = Some(v.into());
        self
    }

    /// Collect per-file errors instead of failing the batch on the first
    /// one.
    pub fn with_continue_on_error(mut self, v: bool) -> Self {
        self.continue_on_error = v;
        self
    }

    pub fn with_cancellation_token(mut self, v: CancellationToken) -> Self {
        self.cancel = v;
        self
    }
}

/// Options for [TransferManager::download_many_files].
#[derive(Clone, Debug)]
pub struct DownloadManyOptions {
    concurrency_limit: usize,
    strip_prefix: Option<String>,
    continue_on_error: bool,
    cancel: CancellationToken,
}

impl Default for DownloadManyOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY,
            strip_prefix: None,
            continue_on_error: false,
            cancel: CancellationToken::new(),
        }
    }
}

impl DownloadManyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency_limit(mut self, v: usize) -> Self {
        self.concurrency_limit = v;
        self
    }

    /// Remove a prefix from object names when computing local paths.
    pub fn with_strip_prefix<T: Into<String>>(mut self, v: T) -> Self {
        self.strip_prefix = Some(v.into());
        self
    }

    pub fn with_continue_on_error(mut self, v: bool) -> Self {
        self.continue_on_error = v;
        self
    }

    pub fn with_cancellation_token(mut self, v: CancellationToken) -> Self {
        self.cancel = v;
        self
    }
}

/// Options for [TransferManager::download_file_in_chunks].
#[derive(Clone, Debug)]
pub struct DownloadChunksOptions {
    concurrency_limit: usize,
    chunk_size: u64,
    crc32c_validation: bool,
    cancel: CancellationToken,
    // Visible to tests; the protocol constant is 32 MiB.
    threshold: u64,
}

impl Default for DownloadChunksOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY,
            chunk_size: SHARDED_DOWNLOAD_CHUNK,
            crc32c_validation: false,
            cancel: CancellationToken::new(),
            threshold: SHARDED_DOWNLOAD_THRESHOLD,
        }
    }
}

impl DownloadChunksOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency_limit(mut self, v: usize) -> Self {
        self.concurrency_limit = v;
        self
    }

    pub fn with_chunk_size(mut self, v: u64) -> Self {
        self.chunk_size = v;
        self
    }

    /// Recompute the CRC32C of the assembled file and compare it against
    /// the object's stored checksum.
    pub fn with_crc32c_validation(mut self, v: bool) -> Self {
        self.crc32c_validation = v;
        self
    }

    pub fn with_cancellation_token(mut self, v: CancellationToken) -> Self {
        self.cancel = v;
        self
    }
}

/// Options for [TransferManager::upload_file_in_chunks].
#[derive(Clone, Debug)]
pub struct UploadChunksOptions {
    concurrency_limit: usize,
    max_queue_size: Option<usize>,
    chunk_size: u64,
    part_md5: bool,
    auto_abort: bool,
    resume: Option<(String, PartsMap)>,
    cancel: CancellationToken,
}

impl Default for UploadChunksOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY,
            max_queue_size: None,
            chunk_size: SHARDED_UPLOAD_CHUNK,
            part_md5: false,
            auto_abort: true,
            resume: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl UploadChunksOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency_limit(mut self, v: usize) -> Self {
        self.concurrency_limit = v;
        self
    }

    /// Bound resident chunks to `v`; defaults to the concurrency limit.
    /// Peak memory is roughly `max_queue_size × chunk_size`.
    pub fn with_max_queue_size(mut self, v: usize) -> Self {
        self.max_queue_size = Some(v);
        self
    }

    pub fn with_chunk_size(mut self, v: u64) -> Self {
        self.chunk_size = v;
        self
    }

    pub fn with_part_md5(mut self, v: bool) -> Self {
        self.part_md5 = v;
        self
    }

    pub fn with_auto_abort(mut self, v: bool) -> Self {
        self.auto_abort = v;
        self
    }

    /// Resume a prior upload: reading restarts at
    /// `parts.len() × chunk_size` and numbering continues after the last
    /// recorded part.
    pub fn with_resume<T: Into<String>>(mut self, upload_id: T, parts: PartsMap) -> Self {
        self.resume = Some((upload_id.into(), parts));
        self
    }

    pub fn with_cancellation_token(mut self, v: CancellationToken) -> Self {
        self.cancel = v;
        self
    }
}

/// Bulk transfer operations for a [Storage][crate::client::Storage] client.
#[derive(Clone, Debug)]
pub struct TransferManager {
    inner: Arc<StorageInner>,
}

impl TransferManager {
    pub(crate) fn new(inner: Arc<StorageInner>) -> Self {
        Self { inner }
    }

    /// Uploads many local files in parallel.
    ///
    /// Each file becomes an object named after its path (`/`-joined),
    /// prefixed by `options.prefix` when set. Results are returned in
    /// submission order. By default the first failure rejects the whole
    /// batch; see [UploadManyOptions::with_continue_on_error].
    pub async fn upload_many_files<B>(
        &self,
        bucket: B,
        paths: Vec<PathBuf>,
        options: UploadManyOptions,
    ) -> Result<Vec<Result<crate::model::Object>>>
    where
        B: Into<String>,
    {
        let bucket = bucket.into();
        self.upload_paths(bucket, paths.into_iter().map(|p| (object_path(&p), p)), options)
            .await
    }

    /// Walks `directory` depth-first and uploads every file in it.
    ///
    /// Entries are visited in name order, descending into subdirectories
    /// before later siblings. Object names are the paths relative to
    /// `directory`.
    pub async fn upload_directory<B>(
        &self,
        bucket: B,
        directory: impl AsRef<Path>,
        options: UploadManyOptions,
    ) -> Result<Vec<Result<crate::model::Object>>>
    where
        B: Into<String>,
    {
        let root = directory.as_ref();
        let files = walk_directory(root).await?;
        let named = files
            .into_iter()
            .map(|path| {
                let name = path
                    .strip_prefix(root)
                    .map(object_path)
                    .unwrap_or_else(|_| object_path(&path));
                (name, path)
            })
            .collect::<Vec<_>>();
        self.upload_paths(bucket.into(), named.into_iter(), options)
            .await
    }

    async fn upload_paths(
        &self,
        bucket: String,
        files: impl Iterator<Item = (String, PathBuf)>,
        options: UploadManyOptions,
    ) -> Result<Vec<Result<crate::model::Object>>> {
        let queue = options.max_queue_size.unwrap_or(options.concurrency_limit);
        let scheduler =
            TransferScheduler::new(options.concurrency_limit, queue, options.cancel.clone())?;
        let mut handles = Vec::new();
        for (name, path) in files {
            let name = match &options.prefix {
                Some(prefix) => format!("{prefix}/{name}"),
                None => name,
            };
            let inner = self.inner.clone();
            let bucket = bucket.clone();
            let skip = options.skip_if_exists;
            let handle = scheduler
                .submit(async move {
                    let file = tokio::fs::File::open(&path).await.map_err(Error::io)?;
                    let upload =
                        ResumableUpload::new(inner, bucket, name, UploadPayload::from(file))
                            .with_feature("tm.upload_many");
                    let upload = if skip {
                        upload.with_if_generation_match(0)
                    } else {
                        upload
                    };
                    upload.send().await
                })
                .await?;
            handles.push(handle);
        }
        collect_results(handles, options.continue_on_error, &scheduler).await
    }

    /// Downloads many objects in parallel into `local_dir`.
    ///
    /// Each object lands at `local_dir` joined with its name, after
    /// removing `options.strip_prefix`. Returns the written paths in
    /// submission order.
    pub async fn download_many_files<B>(
        &self,
        bucket: B,
        objects: Vec<String>,
        local_dir: impl AsRef<Path>,
        options: DownloadManyOptions,
    ) -> Result<Vec<Result<PathBuf>>>
    where
        B: Into<String>,
    {
        let bucket = bucket.into();
        let local_dir = local_dir.as_ref().to_path_buf();
        let scheduler = TransferScheduler::new(
            options.concurrency_limit,
            options.concurrency_limit,
            options.cancel.clone(),
        )?;
        let mut handles = Vec::new();
        for name in objects {
            let relative = options
                .strip_prefix
                .as_deref()
                .and_then(|prefix| name.strip_prefix(prefix))
                .unwrap_or(&name)
                .trim_start_matches('/')
                .to_string();
            let destination = local_dir.join(&relative);
            let inner = self.inner.clone();
            let bucket = bucket.clone();
            let handle = scheduler
                .submit(async move {
                    let mut response = ReadObject::new(inner, bucket, name)
                        .with_feature("tm.download_many")
                        .send()
                        .await?;
                    if let Some(parent) = destination.parent() {
                        tokio::fs::create_dir_all(parent).await.map_err(Error::io)?;
                    }
                    let mut file = tokio::fs::File::create(&destination)
                        .await
                        .map_err(Error::io)?;
                    while let Some(chunk) = response.next().await.transpose()? {
                        file.write_all(&chunk).await.map_err(Error::io)?;
                    }
                    file.flush().await.map_err(Error::io)?;
                    Ok(destination)
                })
                .await?;
            handles.push(handle);
        }
        collect_results(handles, options.continue_on_error, &scheduler).await
    }

    /// Lists the objects under `prefix` and downloads them all.
    pub async fn download_prefix<B>(
        &self,
        bucket: B,
        prefix: &str,
        local_dir: impl AsRef<Path>,
        options: DownloadManyOptions,
    ) -> Result<Vec<Result<PathBuf>>>
    where
        B: Into<String>,
    {
        let bucket = bucket.into();
        let objects = self.list_object_names(&bucket, prefix).await?;
        self.download_many_files(bucket, objects, local_dir, options)
            .await
    }

    async fn list_object_names(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("prefix".to_string(), prefix.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken".to_string(), token));
            }
            let mut options = self.inner.request_options();
            options.feature = Some("tm.download_many");
            let page: crate::model::ListObjectsResponse = self
                .inner
                .execute_json(
                    reqwest::Method::GET,
                    self.inner.json_url(&format!("/b/{bucket}/o")),
                    query,
                    None,
                    true,
                    &options,
                )
                .await?;
            names.extend(page.items.into_iter().map(|o| o.name));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(names),
            }
        }
    }

    /// Downloads one object into `destination` using parallel ranged reads.
    ///
    /// Objects smaller than 32 MiB degrade to a single read. The ranged
    /// reads pin the object generation so a concurrent overwrite cannot
    /// interleave two versions.
    pub async fn download_file_in_chunks<B>(
        &self,
        bucket: B,
        object: &str,
        destination: impl AsRef<Path>,
        options: DownloadChunksOptions,
    ) -> Result<()>
    where
        B: Into<String>,
    {
        if options.chunk_size == 0 {
            return Err(Error::validation("chunk size must be positive"));
        }
        let bucket = bucket.into();
        let destination = destination.as_ref().to_path_buf();
        let mut request_options = self.inner.request_options();
        request_options.feature = Some("tm.download_sharded");
        let metadata: crate::model::Object = self
            .inner
            .execute_json(
                reqwest::Method::GET,
                self.inner
                    .json_url(&format!("/b/{bucket}/o/{}", enc(object))),
                vec![],
                None,
                true,
                &request_options,
            )
            .await?;
        let size = metadata.size;

        if size < options.threshold {
            let contents = ReadObject::new(self.inner.clone(), bucket, object)
                .with_feature("tm.download_sharded")
                .with_generation(metadata.generation)
                .send()
                .await?
                .all_bytes()
                .await?;
            tokio::fs::write(&destination, &contents)
                .await
                .map_err(Error::io)?;
        } else {
            let file = tokio::fs::File::create(&destination)
                .await
                .map_err(Error::io)?;
            file.set_len(size).await.map_err(Error::io)?;
            drop(file);

            let scheduler = TransferScheduler::new(
                options.concurrency_limit,
                options.concurrency_limit,
                options.cancel.clone(),
            )?;
            let mut handles = Vec::new();
            let mut start = 0_u64;
            while start < size {
                let count = std::cmp::min(options.chunk_size, size - start);
                let inner = self.inner.clone();
                let bucket = bucket.clone();
                let object = object.to_string();
                let destination = destination.clone();
                let generation = metadata.generation;
                let handle = scheduler
                    .submit(async move {
                        let mut response = ReadObject::new(inner, bucket, object)
                            .with_feature("tm.download_sharded")
                            .with_generation(generation)
                            .with_read_range(ReadRange::segment(start, count))
                            .send()
                            .await?;
                        let mut file = tokio::fs::OpenOptions::new()
                            .write(true)
                            .open(&destination)
                            .await
                            .map_err(Error::io)?;
                        file.seek(std::io::SeekFrom::Start(start))
                            .await
                            .map_err(Error::io)?;
                        while let Some(chunk) = response.next().await.transpose()? {
                            file.write_all(&chunk).await.map_err(Error::io)?;
                        }
                        file.flush().await.map_err(Error::io)?;
                        Ok(())
                    })
                    .await?;
                handles.push(handle);
                start += count;
            }
            let results = collect_results(handles, false, &scheduler).await?;
            debug_assert!(results.iter().all(Result::is_ok));
        }

        if options.crc32c_validation {
            self::validate_file_crc32c(&destination, &metadata).await?;
        }
        Ok(())
    }

    /// Uploads one local file as a multipart upload with parallel parts.
    ///
    /// Returns the ETag of the assembled object. On failure the error
    /// carries the upload id and the parts uploaded so far, see
    /// [MultipartUploadError][crate::error::MultipartUploadError].
    pub async fn upload_file_in_chunks<B>(
        &self,
        bucket: B,
        object: &str,
        path: impl AsRef<Path>,
        options: UploadChunksOptions,
    ) -> Result<String>
    where
        B: Into<String>,
    {
        if options.chunk_size == 0 {
            return Err(Error::validation("chunk size must be positive"));
        }
        let path = path.as_ref();
        let size = tokio::fs::metadata(path).await.map_err(Error::io)?.len();
        if size == 0 {
            return Err(Error::validation(
                "multipart uploads cannot be empty, use a plain upload for empty files",
            ));
        }
        let engine = MultipartUpload::new(self.inner.clone(), bucket, object)
            .with_feature("tm.upload_sharded")
            .with_part_md5(options.part_md5)
            .with_auto_abort(options.auto_abort);

        let (upload_id, mut parts, start, mut next_part) = match options.resume.clone() {
            Some((upload_id, parts)) => {
                let start = parts.len() as u64 * options.chunk_size;
                let next_part = parts.keys().max().copied().unwrap_or(0) + 1;
                (upload_id, parts, start, next_part)
            }
            None => (engine.initiate().await?, PartsMap::new(), 0, 1),
        };

        let mut file = tokio::fs::File::open(path).await.map_err(Error::io)?;
        if start > 0 {
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(Error::io)?;
        }

        let queue = options.max_queue_size.unwrap_or(options.concurrency_limit);
        let scheduler = match TransferScheduler::new(
            options.concurrency_limit,
            queue,
            options.cancel.clone(),
        ) {
            Ok(s) => s,
            Err(e) => return Err(engine.fail(upload_id, parts, e).await),
        };

        let mut handles = Vec::new();
        let mut offset = start;
        while offset < size {
            let count = std::cmp::min(options.chunk_size, size - offset) as usize;
            let mut buffer = vec![0_u8; count];
            // Reading ahead is gated by scheduler admission: at most
            // max_queue_size chunks are resident.
            if let Err(e) = file.read_exact(&mut buffer).await {
                scheduler.cancel();
                return Err(engine.fail(upload_id, parts, Error::io(e)).await);
            }
            let part_number = next_part;
            next_part += 1;
            let engine_for_part = engine.clone();
            let id = upload_id.clone();
            let submitted = scheduler
                .submit(async move {
                    let etag = engine_for_part
                        .upload_part(&id, part_number, bytes::Bytes::from_owner(buffer))
                        .await?;
                    Ok((part_number, etag))
                })
                .await;
            match submitted {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    scheduler.cancel();
                    return Err(engine.fail(upload_id, parts, e).await);
                }
            }
            offset += count as u64;
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await.map_err(Error::other).and_then(|r| r) {
                Ok((part_number, etag)) => {
                    parts.insert(part_number, etag);
                }
                Err(e) => {
                    scheduler.cancel();
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(engine.fail(upload_id, parts, e).await);
        }
        match engine.complete(&upload_id, &parts).await {
            Ok(etag) => Ok(etag),
            Err(e) => Err(engine.fail(upload_id, parts, e).await),
        }
    }
}

/// Recomputes the CRC32C of a file and compares it to the object metadata.
async fn validate_file_crc32c(path: &Path, metadata: &crate::model::Object) -> Result<()> {
    let Some(want) = metadata.crc32c else {
        return Ok(());
    };
    let mut file = tokio::fs::File::open(path).await.map_err(Error::io)?;
    let mut buffer = vec![0_u8; 128 * 1024];
    let mut crc = 0_u32;
    loop {
        let n = file.read(&mut buffer).await.map_err(Error::io)?;
        if n == 0 {
            break;
        }
        crc = crc32c::crc32c_append(crc, &buffer[..n]);
    }
    if crc != want {
        return Err(Error::checksum(ReadError::ChecksumMismatch(
            crate::error::ChecksumMismatch::Crc32c {
                got: crc,
                want,
            },
        )));
    }
    Ok(())
}

/// Awaits all handles in submission order. Without `continue_on_error` the
/// first failure cancels the remaining work and rejects the batch.
async fn collect_results<T: std::fmt::Debug>(
    handles: Vec<tokio::task::JoinHandle<Result<T>>>,
    continue_on_error: bool,
    scheduler: &TransferScheduler,
) -> Result<Vec<Result<T>>> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = handle.await.map_err(Error::other).and_then(|r| r);
        if result.is_err() && !continue_on_error {
            scheduler.cancel();
        }
        results.push(result);
    }
    if !continue_on_error {
        if let Some(position) = results.iter().position(Result::is_err) {
            return Err(results.swap_remove(position).unwrap_err());
        }
    }
    Ok(results)
}

/// Renders a path as an object name with `/` separators.
fn object_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Walks a directory depth-first, descending into subdirectories before
/// later siblings. Entries are visited in name order so the result is
/// deterministic across platforms.
async fn walk_directory(root: &Path) -> Result<Vec<PathBuf>> {
    fn walk(
        dir: PathBuf,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<Vec<PathBuf>>> + Send>> {
        Box::pin(async move {
            let mut entries = Vec::new();
            let mut reader = tokio::fs::read_dir(&dir).await.map_err(Error::io)?;
            while let Some(entry) = reader.next_entry().await.map_err(Error::io)? {
                entries.push(entry.path());
            }
            entries.sort();
            let mut files = Vec::new();
            for path in entries {
                if path.is_dir() {
                    files.extend(walk(path).await?);
                } else {
                    files.push(path);
                }
            }
            Ok(files)
        })
    }
    walk(root.to_path_buf()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::{test_backoff, test_inner};
    use base64::Engine as _;
    use base64::prelude::BASE64_STANDARD;
    use httptest::{Expectation, Server, matchers::*, responders::status_code};
    use std::io::Write as _;

    type Result = anyhow::Result<()>;

    fn manager(server: &Server) -> TransferManager {
        let inner = Arc::new(StorageInner {
            backoff_policy: Arc::new(test_backoff()),
            ..test_inner(format!("http://{}", server.addr()))
        });
        TransferManager::new(inner)
    }

    fn object_json(name: &str, payload: &[u8]) -> String {
        serde_json::json!({
            "name": name,
            "bucket": "test-bucket",
            "generation": "123",
            "size": format!("{}", payload.len()),
            "crc32c": BASE64_STANDARD.encode(crc32c::crc32c(payload).to_be_bytes()),
        })
        .to_string()
    }

    /// Expects one resumable upload whose object name matches
    /// `name_pattern`, issuing a session named `session`.
    fn expect_upload(server: &Server, name_pattern: &str, session: &str, payload: &'static [u8]) {
        let path = format!("/upload/session/{session}");
        let location = format!("http://{}{path}", server.addr());
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/upload/storage/v1/b/test-bucket/o"),
                request::query(url_decoded(contains(("name", matches(name_pattern))))),
                request::headers(contains((
                    "x-goog-api-client",
                    matches("gccl-gcs-cmd/tm\\.upload_many")
                ))),
            ])
            .respond_with(status_code(200).append_header("Location", location)),
        );
        server.expect(
            Expectation::matching(request::method_path("PUT", path)).respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json(session, payload)),
            ),
        );
    }

    #[tokio::test]
    async fn upload_many_files_in_order() -> Result {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a.txt"), b"alpha")?;
        std::fs::write(dir.path().join("b.txt"), b"bravo")?;

        let server = Server::run();
        // Explicit paths upload under their `/`-joined path name; match on
        // the suffix since the temporary directory's name is random.
        expect_upload(&server, "a\\.txt$", "a", b"alpha");
        expect_upload(&server, "b\\.txt$", "b", b"bravo");

        let results = manager(&server)
            .upload_many_files(
                "test-bucket",
                vec![dir.path().join("a.txt"), dir.path().join("b.txt")],
                UploadManyOptions::new(),
            )
            .await?;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
        Ok(())
    }

    #[tokio::test]
    async fn upload_directory_walks_depth_first() -> Result {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("nested"))?;
        std::fs::write(dir.path().join("nested/inner.txt"), b"inner")?;
        std::fs::write(dir.path().join("outer.txt"), b"outer")?;

        let server = Server::run();
        expect_upload(&server, "^nested/inner\\.txt$", "inner", b"inner");
        expect_upload(&server, "^outer\\.txt$", "outer", b"outer");

        let results = manager(&server)
            .upload_directory("test-bucket", dir.path(), UploadManyOptions::new())
            .await?;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
        Ok(())
    }

    #[tokio::test]
    async fn upload_with_prefix_and_skip_if_exists() -> Result {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a.txt"), b"alpha")?;

        let server = Server::run();
        let location = format!("http://{}/upload/session/a", server.addr());
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/upload/storage/v1/b/test-bucket/o"),
                request::query(url_decoded(contains(("name", "backups/a.txt")))),
                request::query(url_decoded(contains(("ifGenerationMatch", "0")))),
            ])
            .respond_with(status_code(200).append_header("Location", location)),
        );
        server.expect(
            Expectation::matching(request::method_path("PUT", "/upload/session/a")).respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json("backups/a.txt", b"alpha")),
            ),
        );

        let results = manager(&server)
            .upload_directory(
                "test-bucket",
                dir.path(),
                UploadManyOptions::new()
                    .with_prefix("backups")
                    .with_skip_if_exists(true),
            )
            .await?;
        assert_eq!(results.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn upload_many_fail_fast_and_continue() -> Result {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("present.txt"), b"here")?;
        let missing = dir.path().join("missing.txt");

        let server = Server::run();
        expect_upload(&server, "present\\.txt$", "present", b"here");

        // With continue_on_error the good file uploads and the bad one
        // reports its own error.
        let results = manager(&server)
            .upload_many_files(
                "test-bucket",
                vec![dir.path().join("present.txt"), missing.clone()],
                UploadManyOptions::new().with_continue_on_error(true),
            )
            .await?;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok(), "{results:?}");
        assert!(results[1].is_err(), "{results:?}");

        // Fail-fast: the missing file rejects the aggregate.
        let err = manager(&server)
            .upload_many_files(
                "test-bucket",
                vec![missing],
                UploadManyOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_io(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn download_many_files_writes_destinations() -> Result {
        let dir = tempfile::tempdir()?;
        let server = Server::run();
        for (name, body) in [("data/a", "AAA"), ("data/b", "BBB")] {
            server.expect(
                Expectation::matching(all_of![
                    request::method_path(
                        "GET",
                        format!("/storage/v1/b/test-bucket/o/{}", name.replace('/', "%2F"))
                    ),
                    request::headers(contains((
                        "x-goog-api-client",
                        matches("gccl-gcs-cmd/tm\\.download_many")
                    ))),
                ])
                .respond_with(status_code(200).body(body)),
            );
        }

        let results = manager(&server)
            .download_many_files(
                "test-bucket",
                vec!["data/a".to_string(), "data/b".to_string()],
                dir.path(),
                DownloadManyOptions::new().with_strip_prefix("data/"),
            )
            .await?;
        assert_eq!(results.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("a"))?, b"AAA");
        assert_eq!(std::fs::read(dir.path().join("b"))?, b"BBB");
        Ok(())
    }

    #[tokio::test]
    async fn download_prefix_lists_then_downloads() -> Result {
        let dir = tempfile::tempdir()?;
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/storage/v1/b/test-bucket/o"),
                request::query(url_decoded(contains(("prefix", "logs/")))),
            ])
            .respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(serde_json::json!({"items": [{"name": "logs/x"}]}).to_string()),
            ),
        );
        server.expect(
            Expectation::matching(request::method_path(
                "GET",
                "/storage/v1/b/test-bucket/o/logs%2Fx",
            ))
            .respond_with(status_code(200).body("log line")),
        );

        let results = manager(&server)
            .download_prefix(
                "test-bucket",
                "logs/",
                dir.path(),
                DownloadManyOptions::new(),
            )
            .await?;
        assert_eq!(results.len(), 1);
        assert_eq!(std::fs::read(dir.path().join("logs/x"))?, b"log line");
        Ok(())
    }

    #[tokio::test]
    async fn download_small_object_single_read() -> Result {
        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("small.bin");
        let payload = b"small object contents";

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/storage/v1/b/test-bucket/o/small"),
                request::query(url_decoded(not(contains(key("alt"))))),
            ])
            .respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json("small", payload)),
            ),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/storage/v1/b/test-bucket/o/small"),
                request::query(url_decoded(contains(("alt", "media")))),
            ])
            .respond_with(status_code(200).body(&payload[..])),
        );

        manager(&server)
            .download_file_in_chunks(
                "test-bucket",
                "small",
                &destination,
                DownloadChunksOptions::new().with_crc32c_validation(true),
            )
            .await?;
        assert_eq!(std::fs::read(&destination)?, payload);
        Ok(())
    }

    #[tokio::test]
    async fn download_large_object_in_chunks() -> Result {
        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("large.bin");
        let payload: Vec<u8> = (0..100u32).flat_map(|i| i.to_be_bytes()).collect();

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/storage/v1/b/test-bucket/o/large"),
                request::query(url_decoded(not(contains(key("alt"))))),
            ])
            .respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json("large", &payload)),
            ),
        );
        // 400 bytes in 100-byte shards: four ranged reads.
        for start in [0_usize, 100, 200, 300] {
            let slice = payload[start..start + 100].to_vec();
            server.expect(
                Expectation::matching(all_of![
                    request::method_path("GET", "/storage/v1/b/test-bucket/o/large"),
                    request::query(url_decoded(contains(("alt", "media")))),
                    request::query(url_decoded(contains(("generation", "123")))),
                    request::headers(contains((
                        "range",
                        format!("bytes={start}-{}", start + 99)
                    ))),
                ])
                .respond_with(status_code(206).body(slice)),
            );
        }

        let mut options = DownloadChunksOptions::new()
            .with_chunk_size(100)
            .with_concurrency_limit(4)
            .with_crc32c_validation(true);
        options.threshold = 1;
        manager(&server)
            .download_file_in_chunks("test-bucket", "large", &destination, options)
            .await?;
        assert_eq!(std::fs::read(&destination)?, payload);
        Ok(())
    }

    #[tokio::test]
    async fn download_chunks_validation_catches_corruption() -> Result {
        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("corrupt.bin");
        let payload = b"expected contents";

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/storage/v1/b/test-bucket/o/corrupt"),
                request::query(url_decoded(not(contains(key("alt")))))
            ])
            .respond_with(
                status_code(200)
                    .append_header("content-type", "application/json")
                    .body(object_json("corrupt", payload)),
            ),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/storage/v1/b/test-bucket/o/corrupt"),
                request::query(url_decoded(contains(("alt", "media")))),
            ])
            // The served bytes do not match the metadata checksum.
            .respond_with(status_code(200).body("tampered contents!")),
        );

        let err = manager(&server)
            .download_file_in_chunks(
                "test-bucket",
                "corrupt",
                &destination,
                DownloadChunksOptions::new().with_crc32c_validation(true),
            )
            .await
            .unwrap_err();
        assert!(err.is_checksum(), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn upload_file_in_chunks_three_parts() -> Result {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&[1_u8; 100])?;
        file.write_all(&[2_u8; 100])?;
        file.write_all(&[3_u8; 50])?;
        file.flush()?;

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/test-bucket/big-object"),
                request::query(url_decoded(contains(key("uploads")))),
                request::headers(contains((
                    "x-goog-api-client",
                    matches("gccl-gcs-cmd/tm\\.upload_sharded")
                ))),
            ])
            .respond_with(status_code(200).body(
                "<InitiateMultipartUploadResult><UploadId>sharded-1</UploadId></InitiateMultipartUploadResult>",
            )),
        );
        for part in 1..=3 {
            server.expect(
                Expectation::matching(all_of![
                    request::method_path("PUT", "/test-bucket/big-object"),
                    request::query(url_decoded(contains(("partNumber", part.to_string())))),
                    request::query(url_decoded(contains(("uploadId", "sharded-1")))),
                ])
                .respond_with(status_code(200).append_header("ETag", format!("\"e{part}\""))),
            );
        }
        let want_body = "<CompleteMultipartUpload>\
            <Part><PartNumber>1</PartNumber><ETag>\"e1\"</ETag></Part>\
            <Part><PartNumber>2</PartNumber><ETag>\"e2\"</ETag></Part>\
            <Part><PartNumber>3</PartNumber><ETag>\"e3\"</ETag></Part>\
            </CompleteMultipartUpload>";
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/test-bucket/big-object"),
                request::query(url_decoded(contains(("uploadId", "sharded-1")))),
                request::body(want_body),
            ])
            .respond_with(status_code(200).body(
                "<CompleteMultipartUploadResult><ETag>\"assembled\"</ETag></CompleteMultipartUploadResult>",
            )),
        );

        let etag = manager(&server)
            .upload_file_in_chunks(
                "test-bucket",
                "big-object",
                file.path(),
                UploadChunksOptions::new().with_chunk_size(100),
            )
            .await?;
        assert_eq!(etag, "\"assembled\"");
        Ok(())
    }

    #[tokio::test]
    async fn upload_file_in_chunks_resumes_from_parts_map() -> Result {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&[1_u8; 100])?;
        file.write_all(&[2_u8; 100])?;
        file.flush()?;

        let server = Server::run();
        // Part 1 is already recorded; only part 2 is uploaded.
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/test-bucket/resumed"),
                request::query(url_decoded(contains(("partNumber", "2")))),
            ])
            .respond_with(status_code(200).append_header("ETag", "\"e2\"")),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/test-bucket/resumed"),
                request::query(url_decoded(contains(("uploadId", "resume-1")))),
            ])
            .respond_with(status_code(200).body(
                "<CompleteMultipartUploadResult><ETag>\"done\"</ETag></CompleteMultipartUploadResult>",
            )),
        );

        let parts = PartsMap::from([(1, "\"e1\"".to_string())]);
        let etag = manager(&server)
            .upload_file_in_chunks(
                "test-bucket",
                "resumed",
                file.path(),
                UploadChunksOptions::new()
                    .with_chunk_size(100)
                    .with_resume("resume-1", parts),
            )
            .await?;
        assert_eq!(etag, "\"done\"");
        Ok(())
    }

    #[tokio::test]
    async fn upload_file_in_chunks_failure_carries_state() -> Result {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&[5_u8; 10])?;
        file.flush()?;

        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/test-bucket/failing"),
                request::query(url_decoded(contains(key("uploads")))),
            ])
            .respond_with(status_code(200).body(
                "<InitiateMultipartUploadResult><UploadId>fail-1</UploadId></InitiateMultipartUploadResult>",
            )),
        );
        server.expect(
            Expectation::matching(all_of![
                request::method_path("PUT", "/test-bucket/failing"),
                request::query(url_decoded(contains(("partNumber", "1")))),
            ])
            .respond_with(status_code(403)),
        );
        // auto_abort is on by default.
        server.expect(
            Expectation::matching(all_of![
                request::method_path("DELETE", "/test-bucket/failing"),
                request::query(url_decoded(contains(("uploadId", "fail-1")))),
            ])
            .respond_with(status_code(204)),
        );

        let err = manager(&server)
            .upload_file_in_chunks(
                "test-bucket",
                "failing",
                file.path(),
                UploadChunksOptions::new().with_chunk_size(100),
            )
            .await
            .unwrap_err();
        let state = err
            .as_inner::<crate::error::MultipartUploadError>()
            .unwrap();
        assert_eq!(state.upload_id, "fail-1");
        assert!(state.parts.is_empty(), "{state:?}");
        Ok(())
    }

    #[test]
    fn object_path_joins_components() {
        assert_eq!(object_path(Path::new("a/b/c.txt")), "a/b/c.txt");
        assert_eq!(object_path(Path::new("./a/b.txt")), "a/b.txt");
        assert_eq!(object_path(Path::new("plain.txt")), "plain.txt");
    }

    #[tokio::test]
    async fn walk_directory_orders_entries() -> Result {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("b-dir"))?;
        std::fs::write(dir.path().join("b-dir/deep.txt"), b"")?;
        std::fs::write(dir.path().join("a.txt"), b"")?;
        std::fs::write(dir.path().join("z.txt"), b"")?;

        let files = walk_directory(dir.path()).await?;
        let names: Vec<String> = files
            .iter()
            .map(|p| object_path(p.strip_prefix(dir.path()).unwrap()))
            .collect();
        // Depth first: the subdirectory's contents come before the later
        // sibling file.
        assert_eq!(names, vec!["a.txt", "b-dir/deep.txt", "z.txt"]);
        Ok(())
    }
}
