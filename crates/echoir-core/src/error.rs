//! Error types for Echoir core operations.
//!
//! Errors are grouped by domain (download, remux, tagging, file system,
//! persistence). The top-level [`Error`] wraps each domain error and exposes
//! an [`ErrorKind`] for programmatic handling, plus helpers the dispatcher
//! uses to tell ordinary failures apart from cancellation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while fetching manifests, metadata or audio parts.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The catalog refused or failed to return a playback manifest.
    #[error("Manifest unavailable for track {track_id}: {reason}")]
    ManifestUnavailable {
        /// Remote track identifier.
        track_id: String,
        /// Why the manifest could not be obtained.
        reason: String,
    },

    /// The manifest did not list any content part.
    #[error("Manifest for track {track_id} contains no content parts")]
    EmptyManifest {
        /// Remote track identifier.
        track_id: String,
    },

    /// One part of a multi-part download failed.
    #[error("Part {index} of {total} failed: {reason}")]
    PartFailed {
        /// Zero-based index of the part in the manifest.
        index: usize,
        /// Number of parts in the manifest.
        total: usize,
        /// Underlying failure.
        reason: String,
    },

    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// Transport-level failure (timeout, connection reset, DNS).
    #[error("Network error for {url}: {reason}")]
    Network {
        /// Requested URL.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// The response body could not be understood.
    #[error("Invalid response from {url}: {reason}")]
    InvalidResponse {
        /// Requested URL.
        url: String,
        /// Parse failure.
        reason: String,
    },

    /// The requested quality tier is not offered for this account/region.
    #[error("Quality {quality} is not available")]
    QualityUnavailable {
        /// Quality tier name.
        quality: String,
    },

    /// An album request did not contain any track.
    #[error("Album {album_id} has no tracks to download")]
    EmptyAlbum {
        /// Remote album identifier.
        album_id: String,
    },
}

/// Errors raised by the container remux step.
#[derive(Debug, Error)]
pub enum RemuxError {
    /// The remux tool could not be launched.
    #[error("Remux tool not found: {tool}")]
    ToolNotFound {
        /// Binary that was looked up.
        tool: String,
    },

    /// The remux tool ran but did not produce an output file.
    #[error("Remux of {input} failed: {diagnostics}")]
    Failed {
        /// Input file handed to the tool.
        input: PathBuf,
        /// Diagnostic output captured from the tool.
        diagnostics: String,
    },
}

/// Errors raised while embedding tags and cover art.
#[derive(Debug, Error)]
pub enum TaggingError {
    /// Writing the tag to the file failed.
    #[error("Failed to write tags to {path}: {reason}")]
    WriteFailed {
        /// Tagged file.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// The file's container has no supported tag format.
    #[error("No tag format for {path}")]
    UnsupportedContainer {
        /// File that was to be tagged.
        path: PathBuf,
    },

    /// Cover art could not be fetched.
    #[error("Failed to fetch cover art from {url}: {reason}")]
    CoverFetchFailed {
        /// Cover URL from the track metadata.
        url: String,
        /// Underlying failure.
        reason: String,
    },
}

/// File system related errors.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// Path does not exist.
    #[error("Path not found: {path}")]
    NotFound {
        /// Missing path.
        path: PathBuf,
    },

    /// Reading failed.
    #[error("Failed to read {path}: {reason}")]
    ReadFailed {
        /// Path that was read.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Writing failed.
    #[error("Failed to write {path}: {reason}")]
    WriteFailed {
        /// Path that was written.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Directory creation failed.
    #[error("Failed to create directory {path}: {reason}")]
    CreateDirFailed {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Deleting failed.
    #[error("Failed to delete {path}: {reason}")]
    DeleteFailed {
        /// Path that could not be deleted.
        path: PathBuf,
        /// Underlying failure.
        reason: String,
    },

    /// Moving a file to its destination failed.
    #[error("Failed to move {source_path} to {destination}: {reason}")]
    MoveFailed {
        /// File being moved.
        source_path: PathBuf,
        /// Intended destination.
        destination: PathBuf,
        /// Underlying failure.
        reason: String,
    },
}

/// Persistence errors from the download record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite reported an error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row could not be decoded.
    #[error("Corrupt download record {id}: {reason}")]
    CorruptRow {
        /// Row identifier.
        id: String,
        /// Decoding failure.
        reason: String,
    },

    /// The blocking task running a write did not finish.
    #[error("Store task failed: {0}")]
    TaskFailed(String),
}

/// Errors that can occur in Echoir core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Download stage failure.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Remux stage failure.
    #[error(transparent)]
    Remux(#[from] RemuxError),

    /// Tagging stage failure.
    #[error(transparent)]
    Tagging(#[from] TaggingError),

    /// File system failure.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No download record with this id.
    #[error("Download job not found: {0}")]
    JobNotFound(String),

    /// The requested action is not allowed in the job's current state.
    #[error("Job {job_id} cannot {action} while {status}")]
    InvalidTransition {
        /// Job identifier.
        job_id: String,
        /// Attempted action.
        action: &'static str,
        /// Current status.
        status: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The job was cancelled by its execution environment.
    #[error("Download cancelled")]
    Cancelled,

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

/// Broad error category for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or catalog failure.
    Download,
    /// Remux tool failure.
    Remux,
    /// Tag writing failure.
    Tagging,
    /// Local storage failure.
    FileSystem,
    /// Database failure.
    Store,
    /// Unknown job.
    NotFound,
    /// Action not allowed in the current state.
    InvalidState,
    /// Bad configuration.
    Configuration,
    /// Cancellation by the execution environment.
    Cancelled,
    /// Raw IO failure.
    Io,
    /// JSON failure.
    Serialization,
}

impl Error {
    /// Get the error category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Download(_) => ErrorKind::Download,
            Self::Remux(_) => ErrorKind::Remux,
            Self::Tagging(_) => ErrorKind::Tagging,
            Self::FileSystem(_) => ErrorKind::FileSystem,
            Self::Store(_) => ErrorKind::Store,
            Self::JobNotFound(_) => ErrorKind::NotFound,
            Self::InvalidTransition { .. } => ErrorKind::InvalidState,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Whether this error is the cancellation signal rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether a user-triggered retry has a reasonable chance of succeeding.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Download(e) => match e {
                DownloadError::Network { .. }
                | DownloadError::PartFailed { .. }
                | DownloadError::ManifestUnavailable { .. } => true,
                DownloadError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
                _ => false,
            },
            Self::Tagging(TaggingError::CoverFetchFailed { .. }) | Self::Io(_) => true,
            _ => false,
        }
    }

    /// Suggested delay before retrying, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Download(DownloadError::HttpStatus { status: 429, .. }) => Some(30),
            _ if self.is_retryable() => Some(5),
            _ => None,
        }
    }
}
