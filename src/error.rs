//! Error hierarchy for the asset cache and download engine.
//!
//! Each subsystem boundary gets its own [`thiserror::Error`] enum; [`AssetError`]
//! composes them for callers that cross module boundaries (the Asset Manager,
//! the CLI).

use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("working directory {0} could not be created")]
    WorkingDirUnavailable(Utf8PathBuf),
    #[error("resource {0} not found in the bank")]
    ResourceMissing(String),
    #[error("asset manager is no longer reachable from storage manager")]
    AssetManagerGone,
    #[error("io error on {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum RequestParseError {
    #[error("field {0} must not be empty")]
    EmptyField(&'static str),
    #[error("filter {0} has no values")]
    EmptyFilterValue(String),
    #[error("missing required field {0}")]
    MissingRequiredField(&'static str),
    #[error("filename contains a path traversal segment")]
    PathTraversal,
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("request is neither a valid service request nor a valid url request")]
    UnrecognizedShape,
}

/// Errors surfaced by a Requester's check/download pipeline.
///
/// These map onto the seven kinds in the error handling design: back-off
/// policy lives outside this type (in the retry loop), this only classifies
/// whether a given failure is retryable and whether it demotes state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RequesterErrorKind {
    #[error("connection failed")]
    ConnectionFailed,
    #[error("check failed")]
    CheckFailed,
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unpack failure")]
    UnpackFailure,
    #[error("insufficient space")]
    InsufficientSpace,
    #[error("catastrophic failure")]
    CatastrophicFailure,
}

impl RequesterErrorKind {
    /// Whether this kind is eligible for the back-off retry loop.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ConnectionFailed | Self::CheckFailed)
    }

    /// Catastrophic kinds move the Requester straight to INVALID with no retry.
    pub fn is_catastrophic(self) -> bool {
        matches!(
            self,
            Self::CatastrophicFailure | Self::Unauthorized | Self::Forbidden | Self::NotFound
        )
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct RequesterError {
    pub kind: RequesterErrorKind,
    pub message: String,
}

impl RequesterError {
    pub fn new(kind: RequesterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Parse(#[from] RequestParseError),
    #[error(transparent)]
    Requester(#[from] RequesterError),
    #[error("no requester registered for summary {0}")]
    UnknownSummary(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
