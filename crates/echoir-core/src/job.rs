//! Download job records and their lifecycle states.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::quality::QualityProfile;

/// Unique identifier for a download job. Also the task runner dedup key.
pub type JobId = Uuid;

/// Remote catalog identifier of a track.
pub type TrackRef = String;

/// Lifecycle status of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting for a free execution slot.
    Queued,
    /// Fetching audio parts.
    Downloading,
    /// Remuxing fetched parts into one container.
    Merging,
    /// File tagged and placed in final storage.
    Completed,
    /// A stage failed; the job can be retried.
    Failed,
    /// The user removed the file; the record is kept.
    Deleted,
}

impl DownloadStatus {
    /// Statuses listed as "active" downloads.
    pub const ACTIVE: [Self; 3] = [Self::Queued, Self::Downloading, Self::Merging];

    /// Statuses listed in download history.
    pub const HISTORY: [Self; 2] = [Self::Completed, Self::Failed];

    /// Stable name used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Merging => "merging",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    /// Whether a job in this status is queued or executing.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Downloading | Self::Merging)
    }

    /// Whether the pipeline is currently executing a job in this status.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Downloading | Self::Merging)
    }

    /// Whether the pipeline has finished with this job.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Deleted)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::Downloading => write!(f, "Downloading"),
            Self::Merging => write!(f, "Merging"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

impl FromStr for DownloadStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "merging" => Ok(Self::Merging),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            other => Err(Error::Configuration(format!(
                "Unknown download status: {other}"
            ))),
        }
    }
}

/// Track details carried by a download request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Remote track identifier.
    pub id: TrackRef,
    /// Track title.
    pub title: String,
    /// Main artist name.
    pub artist: String,
    /// Position within its album, if known.
    #[serde(default)]
    pub track_number: Option<u32>,
    /// Whether the track is flagged explicit.
    #[serde(default)]
    pub explicit: bool,
}

impl TrackInfo {
    /// Create track info with the required fields.
    pub fn new(id: impl Into<String>, title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            track_number: None,
            explicit: false,
        }
    }

    /// Set the track number.
    #[must_use]
    pub const fn with_track_number(mut self, number: u32) -> Self {
        self.track_number = Some(number);
        self
    }

    /// Set the explicit flag.
    #[must_use]
    pub const fn with_explicit(mut self, explicit: bool) -> Self {
        self.explicit = explicit;
        self
    }
}

/// A persisted download job: one track's download-and-process unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    /// Unique identifier, generated at creation.
    pub id: JobId,
    /// Remote track identifier.
    pub track_ref: TrackRef,
    /// Requested quality tier.
    pub quality: QualityProfile,
    /// Lifecycle status.
    pub status: DownloadStatus,
    /// Percent complete, meaningful while downloading.
    pub progress: u8,
    /// Final location, set only once completed.
    pub file_path: Option<PathBuf>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Album batch this job belongs to.
    pub album_ref: Option<String>,
    /// Directory shared by every track of the album batch.
    pub album_directory: Option<PathBuf>,
    /// Track title, used for naming and display.
    pub title: String,
    /// Track artist, used for naming and display.
    pub artist: String,
    /// Position within the album.
    pub track_number: Option<u32>,
    /// Whether the track is explicit.
    pub explicit: bool,
    /// Last failure message.
    pub error: Option<String>,
}

impl DownloadJob {
    /// Create a queued job for a track.
    #[must_use]
    pub fn new(track: &TrackInfo, quality: QualityProfile) -> Self {
        Self {
            id: Uuid::new_v4(),
            track_ref: track.id.clone(),
            quality,
            status: DownloadStatus::Queued,
            progress: 0,
            file_path: None,
            created_at: Utc::now(),
            album_ref: None,
            album_directory: None,
            title: track.title.clone(),
            artist: track.artist.clone(),
            track_number: track.track_number,
            explicit: track.explicit,
            error: None,
        }
    }

    /// Attach the job to an album batch and its shared directory.
    #[must_use]
    pub fn with_album(mut self, album_ref: impl Into<String>, directory: PathBuf) -> Self {
        self.album_ref = Some(album_ref.into());
        self.album_directory = Some(directory);
        self
    }

    /// Name shown in logs and history.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.artist.is_empty() {
            self.title.clone()
        } else {
            format!("{} - {}", self.artist, self.title)
        }
    }
}

/// A job waiting in the queue manager's pending buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPlan {
    /// The persisted job.
    pub job: DownloadJob,
    /// Quality tier the job was requested with.
    pub quality: QualityProfile,
}

impl QueuedPlan {
    /// Wrap a job with its own quality tier.
    #[must_use]
    pub fn new(job: DownloadJob) -> Self {
        let quality = job.quality;
        Self { job, quality }
    }

    /// Identifier of the wrapped job.
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        self.job.id
    }
}
