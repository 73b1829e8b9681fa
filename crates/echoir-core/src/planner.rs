//! Turns download requests into persisted, queued jobs.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SettingsProvider;
use crate::dispatch::Dispatcher;
use crate::error::{DownloadError, Result};
use crate::job::{DownloadJob, JobId, QueuedPlan, TrackInfo};
use crate::quality::QualityProfile;
use crate::storage::StoragePlacement;
use crate::store::DownloadStore;

/// Download a single track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRequest {
    /// Track to download.
    pub track: TrackInfo,
    /// Requested quality tier.
    pub quality: QualityProfile,
}

/// Download every listed track of an album into one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumRequest {
    /// Remote album identifier, shared by the batch's jobs.
    pub album_id: String,
    /// Album title, used for the directory name.
    pub title: String,
    /// Whether the album itself is flagged explicit.
    #[serde(default)]
    pub explicit: bool,
    /// Tracks in album order.
    pub tracks: Vec<TrackInfo>,
    /// Requested quality tier for every track.
    pub quality: QualityProfile,
}

impl AlbumRequest {
    /// Whether the album directory gets the explicit marker.
    #[must_use]
    pub fn is_explicit(&self) -> bool {
        self.explicit || self.tracks.iter().any(|t| t.explicit)
    }
}

/// A user download request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadRequest {
    /// One track.
    Track(TrackRequest),
    /// A whole album.
    Album(AlbumRequest),
}

impl DownloadRequest {
    /// Quality tier the request asks for.
    #[must_use]
    pub const fn quality(&self) -> QualityProfile {
        match self {
            Self::Track(request) => request.quality,
            Self::Album(request) => request.quality,
        }
    }
}

/// What planning a request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDownload {
    /// Created jobs, in request order.
    pub job_ids: Vec<JobId>,
    /// Shared album directory, for album requests.
    pub album_directory: Option<PathBuf>,
    /// Jobs that started right away; the rest are buffered.
    pub started: Vec<JobId>,
}

/// Validates requests and hands their jobs to the dispatcher.
pub struct RequestPlanner {
    dispatcher: Dispatcher,
    store: Arc<dyn DownloadStore>,
    storage: Arc<dyn StoragePlacement>,
    settings: Arc<dyn SettingsProvider>,
}

impl RequestPlanner {
    /// Create a planner.
    pub fn new(
        dispatcher: Dispatcher,
        store: Arc<dyn DownloadStore>,
        storage: Arc<dyn StoragePlacement>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            dispatcher,
            store,
            storage,
            settings,
        }
    }

    /// Persist and queue the jobs for `request`, then start what capacity allows.
    pub async fn plan(&self, request: DownloadRequest) -> Result<PlannedDownload> {
        let quality = request.quality();
        if !self.settings.is_quality_available(quality) {
            return Err(DownloadError::QualityUnavailable {
                quality: quality.to_string(),
            }
            .into());
        }

        match request {
            DownloadRequest::Track(request) => self.plan_track(request),
            DownloadRequest::Album(request) => self.plan_album(request).await,
        }
    }

    fn plan_track(&self, request: TrackRequest) -> Result<PlannedDownload> {
        let job = DownloadJob::new(&request.track, request.quality);
        let job_id = job.id;
        info!(%job_id, name = %job.display_name(), quality = %request.quality, "Planned track download");

        self.store.insert_or_replace(&job)?;
        self.dispatcher.enqueue(QueuedPlan::new(job));
        Ok(PlannedDownload {
            job_ids: vec![job_id],
            album_directory: None,
            started: self.dispatcher.pump(),
        })
    }

    async fn plan_album(&self, request: AlbumRequest) -> Result<PlannedDownload> {
        if request.tracks.is_empty() {
            return Err(DownloadError::EmptyAlbum {
                album_id: request.album_id,
            }
            .into());
        }

        let parent = self
            .settings
            .output_directory()
            .unwrap_or_else(|| self.storage.default_directory());
        let directory = self
            .storage
            .create_album_directory(&parent, &request.title, request.is_explicit())
            .await?;

        let jobs: Vec<DownloadJob> = request
            .tracks
            .iter()
            .map(|track| {
                DownloadJob::new(track, request.quality)
                    .with_album(request.album_id.clone(), directory.clone())
            })
            .collect();
        for job in &jobs {
            self.store.insert_or_replace(job)?;
        }

        let job_ids: Vec<JobId> = jobs.iter().map(|job| job.id).collect();
        for job in jobs {
            self.dispatcher.enqueue(QueuedPlan::new(job));
        }
        info!(
            album_id = %request.album_id,
            tracks = job_ids.len(),
            directory = %directory.display(),
            "Planned album download"
        );

        Ok(PlannedDownload {
            job_ids,
            album_directory: Some(directory),
            started: self.dispatcher.pump(),
        })
    }
}

impl std::fmt::Debug for RequestPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPlanner")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
