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

//! Error types for the Cloud Storage client.
//!
//! All fallible operations return [Error]. The error carries a broad
//! [ErrorKind] and a boxed source; protocol-specific failures (HTTP status
//! errors, checksum mismatches, upload protocol violations) are found with
//! [Error::as_inner].

use bytes::Bytes;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error returned by all operations in this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: BoxError,
}

impl Error {
    /// Creates a new [Error] with the given [ErrorKind] and source.
    pub fn new<T: Into<BoxError>>(kind: ErrorKind, source: T) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    /// The caller input violates a documented contract. Produced before any
    /// I/O takes place.
    pub fn validation<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Validation, source)
    }

    /// A problem obtaining or applying credentials.
    pub fn authentication<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Authentication, source)
    }

    /// A network problem, or a response corrupted in transit.
    pub fn io<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Io, source)
    }

    /// A well-formed response that cannot be interpreted, e.g. a missing
    /// `Location` header.
    pub fn deser<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Deser, source)
    }

    /// The service returned a non-success HTTP status.
    pub fn http(source: HttpError) -> Self {
        Self::new(ErrorKind::Http, source)
    }

    /// The data was transferred but its checksums do not match.
    pub fn checksum<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Checksum, source)
    }

    /// A resumable session cannot continue without risking data loss.
    pub fn data_loss<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::DataLoss, source)
    }

    /// The retry policy classified the error as retryable, but the attempt or
    /// time budget is spent. The source is the last underlying error.
    pub fn exhausted<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Exhausted, source)
    }

    /// The operation was cancelled by the caller.
    pub fn cancelled<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Cancelled, source)
    }

    /// An uncategorized error.
    pub fn other<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Other, source)
    }

    /// Returns the [ErrorKind] associated with this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind.clone()
    }

    pub fn is_validation(&self) -> bool {
        self.kind == ErrorKind::Validation
    }

    pub fn is_authentication(&self) -> bool {
        self.kind == ErrorKind::Authentication
    }

    pub fn is_io(&self) -> bool {
        self.kind == ErrorKind::Io
    }

    pub fn is_deser(&self) -> bool {
        self.kind == ErrorKind::Deser
    }

    pub fn is_checksum(&self) -> bool {
        self.kind == ErrorKind::Checksum
    }

    pub fn is_data_loss(&self) -> bool {
        self.kind == ErrorKind::DataLoss
    }

    pub fn is_exhausted(&self) -> bool {
        self.kind == ErrorKind::Exhausted
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// The HTTP status code, if the service responded with one.
    pub fn http_status_code(&self) -> Option<u16> {
        self.as_inner::<HttpError>().map(HttpError::status_code)
    }

    /// The server rejected a conditional request. Never retried.
    pub fn is_precondition(&self) -> bool {
        self.http_status_code() == Some(412)
    }

    /// The requested resource does not exist.
    pub fn is_not_found(&self) -> bool {
        self.http_status_code() == Some(404)
    }

    /// The resource already exists, typically on `create`.
    pub fn is_already_exists(&self) -> bool {
        self.http_status_code() == Some(409)
    }

    /// Recurses through the source chain and returns a reference to the inner
    /// value if it is of type `T`, or `None` if no such value is found.
    pub fn as_inner<T: std::error::Error + Send + Sync + 'static>(&self) -> Option<&T> {
        let mut error = self.source.as_ref() as &(dyn std::error::Error);
        loop {
            match error.downcast_ref::<T>() {
                Some(e) => return Some(e),
                None => error = error.source()?,
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.source)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// The type of error held by an [Error] instance.
#[derive(Clone, Debug, PartialEq, Default)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Caller input violates a documented contract.
    Validation,
    /// A problem obtaining or applying credentials.
    Authentication,
    /// A network error, or a response corrupted in transit.
    Io,
    /// A response that could not be interpreted.
    Deser,
    /// A non-success HTTP status from the service.
    Http,
    /// Client and server checksums disagree.
    Checksum,
    /// A resumable session cannot continue without risking data loss.
    DataLoss,
    /// Retry attempts or the retry time budget are spent.
    Exhausted,
    /// The operation was cancelled.
    Cancelled,
    /// An uncategorized error.
    #[default]
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "invalid argument"),
            ErrorKind::Authentication => write!(f, "a problem occurred during authentication"),
            ErrorKind::Io => write!(f, "a problem occurred during I/O"),
            ErrorKind::Deser => write!(f, "the response could not be interpreted"),
            ErrorKind::Http => write!(f, "the service returned an error"),
            ErrorKind::Checksum => write!(f, "the checksums do not match"),
            ErrorKind::DataLoss => write!(f, "the session cannot continue without data loss"),
            ErrorKind::Exhausted => write!(f, "the retry budget is exhausted"),
            ErrorKind::Cancelled => write!(f, "the operation was cancelled"),
            ErrorKind::Other => write!(f, "a problem occurred"),
        }
    }
}

/// Describes a non-2xx HTTP response.
#[derive(Clone, Debug, Default)]
pub struct HttpError {
    status_code: u16,
    headers: std::collections::HashMap<String, String>,
    payload: Option<Bytes>,
}

impl HttpError {
    /// Creates a new [HttpError] with the given status code, headers, and payload.
    pub fn new(
        status_code: u16,
        headers: std::collections::HashMap<String, String>,
        payload: Option<Bytes>,
    ) -> Self {
        Self {
            status_code,
            headers,
            payload,
        }
    }

    /// The status code of the error response.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// The headers of the error response.
    pub fn headers(&self) -> &std::collections::HashMap<String, String> {
        &self.headers
    }

    /// The payload of the error response, if any.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// The `reason` field of the first error detail in the JSON payload.
    ///
    /// The service reports throttling via reasons such as
    /// `rateLimitExceeded`, which are retryable even on status codes that are
    /// not.
    pub fn reason(&self) -> Option<String> {
        let payload = self.payload.as_ref()?;
        let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
        value
            .pointer("/error/errors/0/reason")
            .or_else(|| value.pointer("/error/status"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "HTTP error: code={}, headers={:?}",
            self.status_code, self.headers
        )?;
        if let Some(payload) = self.payload() {
            write!(f, ", payload:\n{payload:?}")?;
        }
        Ok(())
    }
}

impl std::error::Error for HttpError {}

/// Indicates that a checksum mismatch was detected while reading or writing an
/// object.
///
/// When reading an object in full, the client library computes the CRC32C
/// checksum (and optionally the MD5 hash) of the received data and compares it
/// against the values reported by the service. Likewise, when writing, the
/// checksums of the sent data are compared against the values reported for the
/// finalized object. A disagreement fails the operation with this type as the
/// error source.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ChecksumMismatch {
    /// The CRC32C checksums disagree.
    Crc32c { got: u32, want: u32 },
    /// The MD5 hashes disagree. Both values are base64 encoded.
    Md5 { got: String, want: String },
    /// Both the CRC32C checksums and the MD5 hashes disagree.
    Both {
        crc32c: (u32, u32),
        md5: (String, String),
    },
}

impl std::fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crc32c { got, want } => write!(
                f,
                "the CRC32C checksums do not match: got=0x{got:08x}, want=0x{want:08x}"
            ),
            Self::Md5 { got, want } => {
                write!(f, "the MD5 hashes do not match: got={got}, want={want}")
            }
            Self::Both { crc32c, md5 } => write!(
                f,
                "both checksums mismatch: got.crc32c=0x{:08x}, want.crc32c=0x{:08x}, got.md5={}, want.md5={}",
                crc32c.0, crc32c.1, md5.0, md5.1
            ),
        }
    }
}

impl std::error::Error for ChecksumMismatch {}

/// An unrecoverable problem in the resumable upload protocol.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum UploadError {
    /// The service reports fewer bytes as persisted than in an earlier
    /// response. The committed offset is monotone, so a regression means the
    /// session state is no longer trustworthy.
    #[error(
        "the service previously persisted {offset} bytes, but now reports only {persisted} as persisted"
    )]
    UnexpectedRewind { offset: u64, persisted: u64 },

    /// The service reports more bytes persisted than the client ever sent.
    /// Usually two writers are sharing one session URI.
    #[error("the service reports {persisted} bytes as persisted, but we only sent {sent} bytes")]
    TooMuchProgress { sent: u64, persisted: u64 },

    /// The finalized object's checksums disagree with the uploaded data.
    #[error("FILE_NO_UPLOAD: {mismatch} while uploading {object} to {bucket}")]
    ChecksumMismatch {
        mismatch: ChecksumMismatch,
        bucket: String,
        object: String,
    },

    /// The upload was cancelled. The session URI and committed offset allow a
    /// later process to resume.
    #[error("upload cancelled; resume with session uri {uri} at offset {committed}")]
    Aborted { uri: String, committed: u64 },
}

impl UploadError {
    /// The stable code reported for upload checksum failures.
    pub const CHECKSUM_CODE: &str = "FILE_NO_UPLOAD";
}

/// A problem detected while reading response data.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ReadError {
    /// The computed checksums do not match the object checksums.
    #[error("CONTENT_DOWNLOAD_MISMATCH: {0}")]
    ChecksumMismatch(ChecksumMismatch),

    /// The read ended before all expected bytes arrived.
    #[error("missing {0} bytes at the end of the stream")]
    ShortRead(u64),

    /// The read received more bytes than expected.
    #[error("too many bytes received: expected {expected}, stopped read at {got}")]
    LongRead { got: u64, expected: u64 },

    /// A required response header is missing.
    #[error("the response is missing '{0}', a required header")]
    MissingHeader(&'static str),

    /// A response header could not be parsed.
    #[error("the format for header '{0}' is incorrect")]
    BadHeaderFormat(&'static str, #[source] BoxError),
}

impl ReadError {
    /// The stable code reported for download checksum failures.
    pub const CHECKSUM_CODE: &str = "CONTENT_DOWNLOAD_MISMATCH";
}

/// An unrecoverable problem in the XML multipart upload protocol.
///
/// The error carries the upload id and the accumulated parts map so a caller
/// can resume the upload in a later process.
#[derive(thiserror::Error, Debug)]
#[error("multipart upload {upload_id} failed with {} parts recorded", parts.len())]
pub struct MultipartUploadError {
    /// The upload id returned by Initiate.
    pub upload_id: String,
    /// The parts confirmed by the service before the failure.
    pub parts: std::collections::BTreeMap<i32, String>,
    #[source]
    pub source: BoxError,
}

/// Represents an error for an invalid read range specification.
#[derive(thiserror::Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum RangeError {
    /// The provided read limit was zero.
    #[error("read limit was zero, expected a positive value")]
    ZeroLimit,
}
