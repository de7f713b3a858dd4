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

//! Incremental checksums for object data.
//!
//! Every data-bearing operation threads its bytes through a [HashingSink]:
//! an incremental CRC32C accumulator and an incremental MD5 accumulator,
//! each independently enabled. Updates are offset-checked so bytes replayed
//! after a partial server acknowledgement are not hashed twice.

use crate::error::ChecksumMismatch;
use crate::model::ObjectChecksums;
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;

/// Incrementally hashes a byte stream with CRC32C and MD5.
#[derive(Clone)]
pub struct HashingSink {
    crc32c: Option<u32>,
    md5: Option<md5::Context>,
    offset: u64,
    /// Some bytes were skipped over, e.g. when a resumed upload
    /// fast-forwards past data another process sent. The accumulated values
    /// then do not describe the whole object.
    tainted: bool,
    finalized: Option<ObjectChecksums>,
}

impl std::fmt::Debug for HashingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashingSink")
            .field("crc32c", &self.crc32c)
            .field("md5", &self.md5.as_ref().map(|_| "[context]"))
            .field("offset", &self.offset)
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl HashingSink {
    /// Creates a sink with the given accumulators enabled.
    pub fn new(crc32c_enabled: bool, md5_enabled: bool) -> Self {
        Self {
            crc32c: crc32c_enabled.then_some(0),
            md5: md5_enabled.then(md5::Context::new),
            offset: 0,
            tainted: false,
            finalized: None,
        }
    }

    /// A sink that hashes nothing, for callers with precomputed values.
    pub fn disabled() -> Self {
        Self::new(false, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.crc32c.is_some() || self.md5.is_some()
    }

    /// Feeds `data`, which starts at byte `offset` of the overall stream.
    ///
    /// Bytes at or beyond the current high-water mark are hashed; any prefix
    /// that was hashed before (a replay after a rewind) is skipped. Data
    /// starting past the mark leaves a hole, which marks the accumulated
    /// values as not describing the whole stream.
    pub fn update(&mut self, offset: u64, data: &bytes::Bytes) {
        let end = offset + data.len() as u64;
        if !(offset..end).contains(&self.offset) {
            if offset > self.offset {
                self.tainted = true;
            }
            return;
        }
        let fresh = data.clone().split_off((self.offset - offset) as usize);
        if let Some(crc) = self.crc32c.as_mut() {
            *crc = crc32c::crc32c_append(*crc, &fresh);
        }
        if let Some(md5) = self.md5.as_mut() {
            md5.consume(&fresh);
        }
        self.offset = end;
    }

    /// Marks the accumulated values as untrustworthy, e.g. after a failed
    /// seek left the stream position unknown.
    pub fn taint(&mut self) {
        self.tainted = true;
    }

    /// The accumulated values describe exactly the first `len` bytes with no
    /// holes: they are the checksums of a `len`-byte object.
    pub fn is_complete_for(&self, len: u64) -> bool {
        !self.tainted && self.offset == len
    }

    /// Returns the accumulated checksums. Idempotent: the first call fixes
    /// the result, later updates do not change it.
    pub fn finalize(&mut self) -> ObjectChecksums {
        if let Some(f) = &self.finalized {
            return f.clone();
        }
        let result = ObjectChecksums {
            crc32c: self.crc32c,
            md5_hash: self
                .md5
                .as_ref()
                .map(|c| BASE64_STANDARD.encode(c.clone().finalize().0)),
        };
        self.finalized = Some(result.clone());
        result
    }

    /// The CRC32C value in wire form, if enabled.
    pub fn crc32c_base64(&mut self) -> Option<String> {
        self.finalize().crc32c_base64()
    }

    /// The MD5 value in wire form, if enabled.
    pub fn md5_base64(&mut self) -> Option<String> {
        self.finalize().md5_hash
    }

    /// Compares the accumulated value of `kind` against `expected_base64`.
    pub fn validate(&mut self, kind: ChecksumKind, expected_base64: &str) -> bool {
        let computed = self.finalize();
        match kind {
            ChecksumKind::Crc32c => computed.crc32c_base64().as_deref() == Some(expected_base64),
            ChecksumKind::Md5 => computed.md5_hash.as_deref() == Some(expected_base64),
        }
    }
}

/// Selects one of the two supported checksums.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChecksumKind {
    Crc32c,
    Md5,
}

/// Compares computed (or expected) checksums against the values reported by
/// the service.
///
/// Fields absent on either side do not participate: the client only enables
/// CRC32C by default, and the service omits MD5 hashes for composite
/// objects.
pub fn validate(
    expected: &ObjectChecksums,
    received: &ObjectChecksums,
) -> Result<(), ChecksumMismatch> {
    let crc32c = match (expected.crc32c, received.crc32c) {
        (Some(want), Some(got)) if want != got => Some((got, want)),
        _ => None,
    };
    let md5 = match (&expected.md5_hash, &received.md5_hash) {
        (Some(want), Some(got)) if want != got => Some((got.clone(), want.clone())),
        _ => None,
    };
    match (crc32c, md5) {
        (None, None) => Ok(()),
        (Some((got, want)), None) => Err(ChecksumMismatch::Crc32c { got, want }),
        (None, Some((got, want))) => Err(ChecksumMismatch::Md5 { got, want }),
        (Some(crc32c), Some(md5)) => Err(ChecksumMismatch::Both { crc32c, md5 }),
    }
}

use crate::upload_source::{Seek, StreamingSource};

/// Wraps a [StreamingSource], hashing every buffer it emits.
pub(crate) struct ChecksummedSource<S> {
    offset: u64,
    sink: HashingSink,
    source: S,
}

impl<S> ChecksummedSource<S> {
    pub fn new(sink: HashingSink, source: S) -> Self {
        Self {
            offset: 0,
            sink,
            source,
        }
    }

    /// The checksums of the whole object, provided this source actually
    /// hashed all `expected_len` bytes of it. Resumed uploads that skipped
    /// a server-held prefix get empty checksums: there is nothing valid to
    /// compare.
    pub fn final_checksums(&mut self, expected_len: u64) -> ObjectChecksums {
        if self.sink.is_complete_for(expected_len) {
            self.sink.finalize()
        } else {
            ObjectChecksums::new()
        }
    }
}

impl<S> StreamingSource for ChecksummedSource<S>
where
    S: StreamingSource + Send + Sync,
{
    type Error = S::Error;

    async fn next(&mut self) -> Option<Result<bytes::Bytes, Self::Error>> {
        match self.source.next().await {
            Some(Ok(b)) => {
                self.sink.update(self.offset, &b);
                self.offset += b.len() as u64;
                Some(Ok(b))
            }
            other => other,
        }
    }

    async fn size_hint(&self) -> Result<(u64, Option<u64>), Self::Error> {
        self.source.size_hint().await
    }
}

impl<S> Seek for ChecksummedSource<S>
where
    S: Seek + Send + Sync,
{
    type Error = S::Error;

    async fn seek(&mut self, offset: u64) -> Result<(), Self::Error> {
        match self.source.seek(offset).await {
            Ok(()) => {
                self.offset = offset;
                Ok(())
            }
            Err(e) => {
                // The source position is unknown; the accumulated values
                // can no longer be trusted.
                self.offset = u64::MAX;
                self.sink.taint();
                Err(e)
            }
        }
    }
}
