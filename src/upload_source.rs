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

//! Data sources for uploads.
//!
//! Upload operations consume any type convertible into [UploadPayload]:
//! buffers, files, or custom implementations of [StreamingSource]. Sources
//! that also implement [Seek] can replay data, which the client uses to
//! resume interrupted uploads from the last server-confirmed offset.

use std::collections::VecDeque;

/// Provides bytes for an upload.
pub trait StreamingSource {
    /// The error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The next buffer of data, or `None` at the end of the stream.
    fn next(&mut self) -> impl Future<Output = Option<Result<bytes::Bytes, Self::Error>>> + Send;

    /// An estimate of the upload size as a `[min, max)` range, where `None`
    /// means the maximum is unknown.
    ///
    /// A known and sufficiently small size lets the client pick a
    /// single-request protocol instead of a chunked one.
    fn size_hint(&self) -> impl Future<Output = Result<(u64, Option<u64>), Self::Error>> + Send {
        std::future::ready(Ok((0_u64, None)))
    }
}

/// Repositions an upload source.
///
/// The client assumes `seek(n)` followed by `next()` always yields the same
/// bytes: resumable uploads rewind to the last committed offset after
/// partial failures, and fast-forward past bytes the server already has.
pub trait Seek {
    /// The error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Resets the stream so the next buffer starts at `offset`.
    fn seek(&mut self, offset: u64) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// The payload for upload operations.
pub struct UploadPayload<T> {
    source: T,
}

impl<T> StreamingSource for UploadPayload<T>
where
    T: StreamingSource + Send + Sync,
{
    type Error = T::Error;

    async fn next(&mut self) -> Option<Result<bytes::Bytes, Self::Error>> {
        self.source.next().await
    }

    async fn size_hint(&self) -> Result<(u64, Option<u64>), Self::Error> {
        self.source.size_hint().await
    }
}

impl<T> Seek for UploadPayload<T>
where
    T: Seek,
{
    type Error = T::Error;

    fn seek(&mut self, offset: u64) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.source.seek(offset)
    }
}

impl From<bytes::Bytes> for UploadPayload<BytesSource> {
    fn from(value: bytes::Bytes) -> Self {
        Self {
            source: BytesSource::new(value),
        }
    }
}

impl From<&'static str> for UploadPayload<BytesSource> {
    fn from(value: &'static str) -> Self {
        UploadPayload::from(bytes::Bytes::from_static(value.as_bytes()))
    }
}

impl From<Vec<u8>> for UploadPayload<BytesSource> {
    fn from(value: Vec<u8>) -> Self {
        UploadPayload::from(bytes::Bytes::from_owner(value))
    }
}

impl From<Vec<bytes::Bytes>> for UploadPayload<IterSource> {
    fn from(value: Vec<bytes::Bytes>) -> Self {
        Self {
            source: IterSource::new(value),
        }
    }
}

impl From<tokio::fs::File> for UploadPayload<FileSource> {
    fn from(value: tokio::fs::File) -> Self {
        Self {
            source: FileSource::new(value),
        }
    }
}

impl<S> From<S> for UploadPayload<S>
where
    S: StreamingSource,
{
    fn from(value: S) -> Self {
        Self { source: value }
    }
}

/// A source over a single contiguous buffer.
pub struct BytesSource {
    contents: bytes::Bytes,
    current: Option<bytes::Bytes>,
}

impl BytesSource {
    pub(crate) fn new(contents: bytes::Bytes) -> Self {
        let current = Some(contents.clone());
        Self { contents, current }
    }
}

impl StreamingSource for BytesSource {
    type Error = crate::Error;

    async fn next(&mut self) -> Option<Result<bytes::Bytes, Self::Error>> {
        self.current.take().filter(|b| !b.is_empty()).map(Ok)
    }

    async fn size_hint(&self) -> Result<(u64, Option<u64>), Self::Error> {
        let size = self.contents.len() as u64;
        Ok((size, Some(size)))
    }
}

impl Seek for BytesSource {
    type Error = crate::Error;

    async fn seek(&mut self, offset: u64) -> Result<(), Self::Error> {
        let position = std::cmp::min(offset as usize, self.contents.len());
        self.current = Some(self.contents.slice(position..));
        Ok(())
    }
}

/// A source over a sequence of buffers.
pub struct IterSource {
    contents: Vec<bytes::Bytes>,
    current: VecDeque<bytes::Bytes>,
}

impl IterSource {
    pub fn new<I>(iterator: I) -> Self
    where
        I: IntoIterator<Item = bytes::Bytes>,
    {
        let contents: Vec<bytes::Bytes> = iterator.into_iter().collect();
        let current: VecDeque<bytes::Bytes> = contents.iter().cloned().collect();
        Self { contents, current }
    }
}

impl StreamingSource for IterSource {
    type Error = std::io::Error;

    async fn next(&mut self) -> Option<Result<bytes::Bytes, Self::Error>> {
        self.current.pop_front().map(Ok)
    }

    async fn size_hint(&self) -> Result<(u64, Option<u64>), Self::Error> {
        let size = self.contents.iter().map(|b| b.len() as u64).sum::<u64>();
        Ok((size, Some(size)))
    }
}

impl Seek for IterSource {
    type Error = std::io::Error;

    async fn seek(&mut self, offset: u64) -> Result<(), Self::Error> {
        let mut skip = offset as usize;
        self.current = self
            .contents
            .iter()
            .filter_map(|b| match (skip, b.len()) {
                (0, _) => Some(b.clone()),
                (s, n) if s >= n => {
                    skip -= n;
                    None
                }
                (s, n) => {
                    skip = 0;
                    Some(b.clone().split_off(n - s))
                }
            })
            .collect();
        Ok(())
    }
}

/// Files are read in slices matching the resumable upload quantum.
const READ_SIZE: usize = 256 * 1024;

/// A source over a file, read in 256 KiB slices.
pub struct FileSource {
    inner: tokio::fs::File,
}

impl FileSource {
    pub fn new(inner: tokio::fs::File) -> Self {
        Self { inner }
    }
}

impl StreamingSource for FileSource {
    type Error = std::io::Error;

    async fn next(&mut self) -> Option<Result<bytes::Bytes, Self::Error>> {
        let mut buffer = vec![0_u8; READ_SIZE];
        match tokio::io::AsyncReadExt::read(&mut self.inner, &mut buffer).await {
            Err(e) => Some(Err(e)),
            Ok(0) => None,
            Ok(n) => {
                buffer.truncate(n);
                Some(Ok(bytes::Bytes::from_owner(buffer)))
            }
        }
    }

    async fn size_hint(&self) -> Result<(u64, Option<u64>), Self::Error> {
        let metadata = self.inner.metadata().await?;
        Ok((metadata.len(), Some(metadata.len())))
    }
}

impl Seek for FileSource {
    type Error = std::io::Error;

    async fn seek(&mut self, offset: u64) -> Result<(), Self::Error> {
        use tokio::io::AsyncSeekExt;
        let _ = self.inner.seek(std::io::SeekFrom::Start(offset)).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    type Result = anyhow::Result<()>;

    const CONTENTS: &[u8] = b"how vexingly quick daft zebras jump";

    pub(crate) async fn collect<S>(source: &mut S) -> anyhow::Result<Vec<u8>>
    where
        S: StreamingSource,
    {
        let mut vec = Vec::new();
        while let Some(bytes) = source.next().await.transpose()? {
            vec.extend_from_slice(&bytes);
        }
        Ok(vec)
    }

    #[tokio::test]
    async fn empty_bytes() -> Result {
        let mut payload = UploadPayload::from(bytes::Bytes::new());
        assert_eq!(payload.size_hint().await?, (0, Some(0)));
        let got = collect(&mut payload).await?;
        assert!(got.is_empty(), "{got:?}");
        Ok(())
    }

    #[tokio::test]
    async fn bytes_round_trip() -> Result {
        let mut payload = UploadPayload::from(bytes::Bytes::from_static(CONTENTS));
        let size = CONTENTS.len() as u64;
        assert_eq!(payload.size_hint().await?, (size, Some(size)));
        let got = collect(&mut payload).await?;
        assert_eq!(got[..], CONTENTS[..]);
        Ok(())
    }

    #[tokio::test]
    async fn bytes_seek() -> Result {
        let mut payload = UploadPayload::from(bytes::Bytes::from_static(CONTENTS));
        payload.seek(8).await?;
        let got = collect(&mut payload).await?;
        assert_eq!(got[..], CONTENTS[8..]);
        // Seeking beyond the end yields an empty stream.
        payload.seek(10_000).await?;
        let got = collect(&mut payload).await?;
        assert!(got.is_empty(), "{got:?}");
        Ok(())
    }

    #[tokio::test]
    async fn str_payload() -> Result {
        const LAZY: &str = "the quick brown fox jumps over the lazy dog";
        let mut payload = UploadPayload::from(LAZY);
        let got = collect(&mut payload).await?;
        assert_eq!(&got, LAZY.as_bytes());
        Ok(())
    }

    #[tokio::test]
    async fn iter_source_round_trip() -> Result {
        let mut payload = UploadPayload::from(
            ["how ", "vexingly ", "quick ", "daft ", "zebras ", "jump"]
                .map(|v| bytes::Bytes::from_static(v.as_bytes()))
                .to_vec(),
        );
        let size = CONTENTS.len() as u64;
        assert_eq!(payload.size_hint().await?, (size, Some(size)));
        let got = collect(&mut payload).await?;
        assert_eq!(got[..], CONTENTS[..]);
        Ok(())
    }

    #[tokio::test]
    async fn iter_source_seek_repeatedly() -> Result {
        const N: usize = 32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&[1_u8; N]);
        buf.extend_from_slice(&[2_u8; N]);
        buf.extend_from_slice(&[3_u8; N]);
        let b = bytes::Bytes::from_owner(buf);
        let mut stream =
            IterSource::new(vec![b.slice(0..N), b.slice(N..(2 * N)), b.slice((2 * N)..)]);

        // seek() must work multiple times over the same stream, in any
        // direction.
        for offset in [0, N / 2, 0, N, 0, 2 * N + N / 2] {
            stream.seek(offset as u64).await?;
            let got = collect(&mut stream).await?;
            assert_eq!(got[..], b[offset..(3 * N)]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn file_source_round_trip() -> Result {
        let mut file = NamedTempFile::new()?;
        assert_eq!(file.write(CONTENTS)?, CONTENTS.len());
        file.flush()?;
        let read = tokio::fs::File::from(file.reopen()?);
        let mut payload = UploadPayload::from(read);
        let size = CONTENTS.len() as u64;
        assert_eq!(payload.size_hint().await?, (size, Some(size)));
        let got = collect(&mut payload).await?;
        assert_eq!(got[..], CONTENTS[..]);
        Ok(())
    }

    #[tokio::test]
    async fn file_source_seek_mid_slice() -> Result {
        let mut file = NamedTempFile::new()?;
        assert_eq!(file.write(&[0_u8; READ_SIZE])?, READ_SIZE);
        assert_eq!(file.write(&[1_u8; READ_SIZE])?, READ_SIZE);
        file.flush()?;
        let read = tokio::fs::File::from(file.reopen()?);
        let mut payload = UploadPayload::from(read);
        payload.seek((READ_SIZE + READ_SIZE / 2) as u64).await?;
        let got = collect(&mut payload).await?;
        assert_eq!(got[..], [1_u8; READ_SIZE / 2][..]);
        Ok(())
    }
}
