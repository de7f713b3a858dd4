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

use crate::error::UploadError;
use crate::upload_source::StreamingSource;
use crate::{Error, Result};
use std::collections::VecDeque;

/// Chunks must be sized to a multiple of 256 KiB, except the last one.
pub(crate) const UPLOAD_QUANTUM: usize = 256 * 1024;

/// Tracks the progress of one chunked resumable upload.
///
/// The buffer holds the bytes of the current `PUT` request. The service may
/// acknowledge only a prefix of them (`308` with a shorter `Range`); the
/// unacknowledged tail moves to `remainder` and is re-sent ahead of fresh
/// upstream bytes. The cached bytes therefore always cover everything past
/// the committed offset.
#[derive(Default)]
pub(crate) struct InProgressUpload {
    /// The target size for each PUT request, a positive multiple of 256 KiB.
    chunk_size: usize,
    /// The expected object size as a [min, max) range.
    hint: (u64, Option<u64>),
    /// Keep `*` as the total size even when the upstream ends.
    partial: bool,
    /// The committed offset for the current PUT request.
    offset: u64,
    /// The data of the current PUT request.
    buffer: VecDeque<bytes::Bytes>,
    buffer_size: usize,
    /// The size the server has confirmed, if known. `None` forces a status
    /// probe before the next PUT.
    persisted: Option<u64>,
    /// Bytes pulled from upstream that did not fit the current PUT, and
    /// unacknowledged tails awaiting re-send.
    remainder: VecDeque<bytes::Bytes>,
    /// The upstream source is exhausted.
    source_done: bool,
    /// At least one chunk was assembled.
    started: bool,
}

struct BufferSummary<'a>(&'a VecDeque<bytes::Bytes>);

impl std::fmt::Debug for BufferSummary<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSummary")
            .field("buffers", &self.0.len())
            .field("bytes", &self.0.iter().map(bytes::Bytes::len).sum::<usize>())
            .finish()
    }
}

// The buffers can be large, a derived Debug would be unreadable.
impl std::fmt::Debug for InProgressUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProgressUpload")
            .field("chunk_size", &self.chunk_size)
            .field("hint", &self.hint)
            .field("partial", &self.partial)
            .field("offset", &self.offset)
            .field("buffer_size", &self.buffer_size)
            .field("persisted", &self.persisted)
            .field("buffer", &BufferSummary(&self.buffer))
            .field("remainder", &BufferSummary(&self.remainder))
            .field("source_done", &self.source_done)
            .finish()
    }
}

impl InProgressUpload {
    pub fn new(chunk_size: usize, hint: (u64, Option<u64>), partial: bool) -> Self {
        Self {
            chunk_size,
            hint,
            partial,
            ..Self::default()
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Marks the session as freshly created: zero bytes persisted.
    pub fn session_created(&mut self) {
        self.persisted = Some(0);
    }

    /// Positions the upload at `offset`, for resuming prior sessions. Only
    /// valid before any chunk is assembled; the caller seeks the upstream
    /// source to match.
    pub fn start_at(&mut self, offset: u64) {
        debug_assert!(!self.started, "start_at() after data was consumed");
        self.offset = offset;
        self.persisted = Some(offset);
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// A status probe is required before the next PUT.
    pub fn needs_probe(&self) -> bool {
        self.persisted != Some(self.offset)
    }

    /// Assembles the next chunk from the remainder queue and the upstream
    /// source.
    pub async fn next_chunk<S>(&mut self, payload: &mut S) -> Result<()>
    where
        S: StreamingSource,
    {
        self.started = true;
        let chunk_size = self.chunk_size;
        let mut buffer = VecDeque::new();
        let mut size = 0_usize;
        // Appends one buffer, splitting off anything beyond the chunk size.
        // Yields `Some` once the chunk is full, with the overflow (if any).
        let mut accept = |mut b: bytes::Bytes| match b.len() {
            n if size + n > chunk_size => {
                let rest = b.split_off(chunk_size - size);
                size = chunk_size;
                buffer.push_back(b);
                Some(Some(rest))
            }
            n if size + n == chunk_size => {
                size = chunk_size;
                buffer.push_back(b);
                Some(None)
            }
            n => {
                size += n;
                buffer.push_back(b);
                None
            }
        };

        while let Some(b) = self.remainder.pop_front() {
            if let Some(rest) = accept(b) {
                rest.into_iter().for_each(|b| self.remainder.push_front(b));
                self.buffer = buffer;
                self.buffer_size = size;
                return Ok(());
            }
        }
        while let Some(b) = payload.next().await.transpose().map_err(Error::io)? {
            if let Some(rest) = accept(b) {
                rest.into_iter().for_each(|b| self.remainder.push_front(b));
                self.buffer = buffer;
                self.buffer_size = size;
                return Ok(());
            }
        }
        // The upstream is exhausted; whatever accumulated is the last of
        // the data.
        self.source_done = true;
        self.buffer = buffer;
        self.buffer_size = size;
        Ok(())
    }

    /// This chunk finalizes the object.
    pub fn finalizes(&self) -> bool {
        if self.partial {
            return false;
        }
        if self.source_done && self.remainder.is_empty() {
            return true;
        }
        // A known exact size finalizes when the chunk reaches it.
        matches!(
            (self.hint.0, self.hint.1),
            (min, Some(max)) if min == max && self.offset + self.buffer_size as u64 == max
        )
    }

    /// The `Content-Range` header for the current chunk.
    pub fn content_range(&self) -> String {
        let n = self.buffer_size as u64;
        let total = match (self.hint.0, self.hint.1) {
            (min, Some(max)) if min == max && !self.partial => Some(min),
            _ if self.finalizes() => Some(self.offset + n),
            _ => None,
        };
        match (n, self.offset, total) {
            (0, _, Some(t)) => format!("bytes */{t}"),
            (0, _, None) => "bytes */*".to_string(),
            (n, o, Some(t)) => format!("bytes {o}-{}/{t}", o + n - 1),
            (n, o, None) => format!("bytes {o}-{}/*", o + n - 1),
        }
    }

    /// The body for the current chunk.
    pub fn put_body(&self) -> reqwest::Body {
        let stream = futures::stream::unfold(self.buffer.clone(), |mut buffer| async move {
            buffer
                .pop_front()
                .map(|next| (Ok::<bytes::Bytes, Error>(next), buffer))
        });
        reqwest::Body::wrap_stream(stream)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Reconciles a `308` acknowledgement covering `persisted` total bytes.
    ///
    /// The acknowledged prefix of the buffer is dropped; the
    /// unacknowledged tail (if any) is queued for re-send. The committed
    /// offset never regresses: a smaller value is a protocol violation.
    pub fn handle_partial(&mut self, persisted: u64) -> Result<()> {
        let consumed = match (self.offset, self.buffer_size as u64, persisted) {
            (o, _, p) if p < o => Err(UploadError::UnexpectedRewind {
                offset: o,
                persisted: p,
            }),
            (o, n, p) if p <= o + n => Ok((p - o) as usize),
            (o, n, p) => Err(UploadError::TooMuchProgress {
                sent: o + n,
                persisted: p,
            }),
        };
        let mut skip = consumed.map_err(Error::data_loss)?;
        self.persisted = Some(persisted);
        self.offset = persisted;
        self.remainder = self
            .buffer
            .drain(..)
            .filter_map(|mut b| match (skip, b.len()) {
                (0, _) => Some(b),
                (s, n) if s >= n => {
                    skip -= n;
                    None
                }
                (s, n) => {
                    skip = 0;
                    Some(b.split_off(n - s))
                }
            })
            .chain(self.remainder.drain(..))
            .collect();
        self.buffer_size = 0;
        Ok(())
    }

    /// Records a failed attempt: the persisted size is unknown until the
    /// next status probe, and the buffered bytes wait for reconciliation.
    pub fn on_error(&mut self) {
        self.persisted = None;
    }
}
