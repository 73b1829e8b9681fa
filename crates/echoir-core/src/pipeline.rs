//! Per-track download pipeline.
//!
//! A job moves `Queued -> Downloading -> Merging -> Completed`; any stage
//! failure records `Failed` with its message. Stages:
//!
//! 1. Fetch the playback manifest and track metadata concurrently.
//! 2. Download the single content part, or every part concurrently followed by
//!    an ordered concatenation.
//! 3. Remux multi-part output into a clean container.
//! 4. Embed tags and cover art in the cache file.
//! 5. Pick a collision-free final name and move the file into place.
//!
//! Cancellation is not a failure: the job's working directory is removed and
//! the record goes back to `Queued` so it can be resumed later. It is honoured
//! until the tagged file is ready; placement and the completion record always
//! run to the end.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::catalog::{CatalogClient, PlaybackManifest};
use crate::config::SettingsProvider;
use crate::error::{DownloadError, Error, FileSystemError, Result, StoreError};
use crate::job::{DownloadJob, DownloadStatus, JobId, QueuedPlan};
use crate::naming::file_name;
use crate::remux::Remuxer;
use crate::storage::StoragePlacement;
use crate::store::DownloadStore;
use crate::tagging::{CoverArt, MetadataEmbedder, TrackTags};

/// Callback receiving `(job, percent)` while a job downloads.
pub type ProgressListener = Arc<dyn Fn(JobId, u8) + Send + Sync>;

/// Result of a successful pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// The completed job.
    pub job_id: JobId,
    /// Where the tagged file was placed.
    pub file_path: PathBuf,
}

/// Runs one queued job to a terminal state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute `plan`, stopping early with [`Error::Cancelled`] once `cancel`
    /// fires.
    async fn execute(&self, plan: &QueuedPlan, cancel: CancellationToken)
    -> Result<PipelineOutcome>;
}

/// The shipped [`JobExecutor`].
pub struct DownloadPipeline {
    catalog: Arc<dyn CatalogClient>,
    remuxer: Arc<dyn Remuxer>,
    embedder: Arc<dyn MetadataEmbedder>,
    storage: Arc<dyn StoragePlacement>,
    store: Arc<dyn DownloadStore>,
    settings: Arc<dyn SettingsProvider>,
    progress: Option<ProgressListener>,
}

impl DownloadPipeline {
    /// Assemble a pipeline from its collaborators.
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        remuxer: Arc<dyn Remuxer>,
        embedder: Arc<dyn MetadataEmbedder>,
        storage: Arc<dyn StoragePlacement>,
        store: Arc<dyn DownloadStore>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            catalog,
            remuxer,
            embedder,
            storage,
            store,
            settings,
            progress: None,
        }
    }

    /// Forward download progress to `listener` as well as the store.
    #[must_use]
    pub fn with_progress_listener(mut self, listener: ProgressListener) -> Self {
        self.progress = Some(listener);
        self
    }

    /// Working directory for a job's in-progress files.
    #[must_use]
    pub fn work_dir(&self, job_id: JobId) -> PathBuf {
        self.settings
            .cache_directory()
            .join("jobs")
            .join(job_id.to_string())
    }

    /// Run a job to completion, failure or cancellation.
    pub async fn run(&self, plan: &QueuedPlan, cancel: CancellationToken) -> Result<PipelineOutcome> {
        let job = &plan.job;
        let span = info_span!("download", job_id = %job.id, track = %job.track_ref);

        async move {
            info!(name = %job.display_name(), quality = %plan.quality, "Starting download");
            let work_dir = self.work_dir(job.id);

            let staged = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(Error::Cancelled),
                result = self.run_stages(plan, &work_dir) => result,
            };
            let result = match staged {
                Ok(staged) => self.finish(job, staged, &work_dir).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => {
                    info!(path = %outcome.file_path.display(), "Download completed");
                    Ok(outcome)
                }
                Err(e) if e.is_cancelled() => {
                    remove_work_dir(&work_dir).await;
                    let id = job.id;
                    if let Err(store_err) =
                        self.persist(move |store| store.reset_to_queued(id)).await
                    {
                        warn!(error = %store_err, "Failed to requeue cancelled job");
                    }
                    info!("Download cancelled");
                    Err(Error::Cancelled)
                }
                Err(e) => {
                    error!(error = %e, "Download failed");
                    let (id, message) = (job.id, e.to_string());
                    if let Err(store_err) =
                        self.persist(move |store| store.mark_failed(id, &message)).await
                    {
                        warn!(error = %store_err, "Failed to record download failure");
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Everything up to a tagged cache file.
    async fn run_stages(&self, plan: &QueuedPlan, work_dir: &Path) -> Result<StagedTrack> {
        let job = &plan.job;

        let (manifest, raw_tags) = tokio::try_join!(
            self.catalog.fetch_manifest(&job.track_ref, plan.quality),
            self.catalog.fetch_track_metadata(&job.track_ref),
        )?;
        if manifest.parts.is_empty() {
            return Err(DownloadError::EmptyManifest {
                track_id: job.track_ref.clone(),
            }
            .into());
        }
        debug!(
            codec = %manifest.codec,
            parts = manifest.parts.len(),
            bit_depth = ?manifest.bit_depth,
            sample_rate = ?manifest.sample_rate,
            "Resolved manifest"
        );

        self.store.update_status(job.id, DownloadStatus::Downloading)?;
        prepare_work_dir(work_dir).await?;

        let extension = manifest.extension(plan.quality);
        let cache_file = work_dir.join(format!("track.{extension}"));
        self.fetch_audio(job.id, &manifest, work_dir, &cache_file)
            .await?;

        if manifest.is_multi_part() {
            self.store.update_status(job.id, DownloadStatus::Merging)?;
            let processed = work_dir.join(format!("processed.{extension}"));
            let remuxed = self.remuxer.remux(&cache_file, &processed).await?;
            replace_file(&remuxed, &cache_file).await?;
        }

        let tags = TrackTags::from_raw(&raw_tags).with_fallback(
            &job.title,
            &job.artist,
            job.track_number,
        );
        let cover = self.fetch_cover(&tags).await;
        self.embedder.embed(&cache_file, &tags, cover).await?;

        Ok(StagedTrack {
            cache_file,
            tags,
            extension,
        })
    }

    /// Place the tagged file and record completion.
    async fn finish(
        &self,
        job: &DownloadJob,
        staged: StagedTrack,
        work_dir: &Path,
    ) -> Result<PipelineOutcome> {
        let final_path = self
            .place(job, &staged.tags, &staged.cache_file, staged.extension)
            .await?;

        let (id, path) = (job.id, final_path.clone());
        if let Err(e) = self.persist(move |store| store.mark_completed(id, &path)).await {
            error!(error = %e, path = %final_path.display(), "Failed to record completed download");
        }
        remove_work_dir(work_dir).await;
        Ok(PipelineOutcome {
            job_id: job.id,
            file_path: final_path,
        })
    }

    /// Download the audio into `cache_file`.
    async fn fetch_audio(
        &self,
        job_id: JobId,
        manifest: &PlaybackManifest,
        work_dir: &Path,
        cache_file: &Path,
    ) -> Result<()> {
        if let [single] = manifest.parts.as_slice() {
            let bytes = self.catalog.download_to_file(single, cache_file).await?;
            debug!(bytes, "Downloaded single-part stream");
            self.report_progress(job_id, 100).await;
            return Ok(());
        }

        let parts = self.download_parts(job_id, &manifest.parts, work_dir).await?;
        concatenate(&parts, cache_file).await?;
        for part in &parts {
            let _ = tokio::fs::remove_file(part).await;
        }
        Ok(())
    }

    /// Fetch every part concurrently. If any part fails, the ones that
    /// succeeded are deleted and the first failure is returned.
    async fn download_parts(
        &self,
        job_id: JobId,
        urls: &[String],
        work_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let total = urls.len();
        let completed = AtomicUsize::new(0);

        let fetches = urls.iter().enumerate().map(|(index, url)| {
            let path = work_dir.join(format!("part-{index:04}.tmp"));
            let completed = &completed;
            async move {
                match self.catalog.download_to_file(url, &path).await {
                    Ok(_) => {
                        let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                        self.report_progress(job_id, percent(done, total)).await;
                        Ok(path)
                    }
                    Err(e) => {
                        warn!(index, total, error = %e, "Part download failed");
                        Err(DownloadError::PartFailed {
                            index,
                            total,
                            reason: e.to_string(),
                        })
                    }
                }
            }
        });

        let mut paths = Vec::with_capacity(total);
        let mut failure = None;
        for result in join_all(fetches).await {
            match result {
                Ok(path) => paths.push(path),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            for path in &paths {
                let _ = tokio::fs::remove_file(path).await;
            }
            return Err(e.into());
        }
        Ok(paths)
    }

    async fn fetch_cover(&self, tags: &TrackTags) -> Option<CoverArt> {
        let url = tags.cover_url.as_deref()?;
        match self.catalog.download_bytes(url).await {
            Ok(bytes) if !bytes.is_empty() => Some(CoverArt::from_bytes(bytes)),
            Ok(_) => {
                warn!(url, "Cover art response was empty");
                None
            }
            Err(e) => {
                warn!(url, error = %e, "Failed to fetch cover art, tagging without it");
                None
            }
        }
    }

    /// Name the tagged file and move it to its final directory.
    async fn place(
        &self,
        job: &DownloadJob,
        tags: &TrackTags,
        cache_file: &Path,
        extension: &str,
    ) -> Result<PathBuf> {
        let title = if job.title.is_empty() {
            tags.title.as_deref().unwrap_or_default()
        } else {
            job.title.as_str()
        };
        let artist = if job.artist.is_empty() {
            tags.artist.as_deref().unwrap_or_default()
        } else {
            job.artist.as_str()
        };
        let base_name = file_name(
            self.settings.naming_format(),
            title,
            artist,
            job.track_number,
            extension,
        );

        let dir = job
            .album_directory
            .clone()
            .or_else(|| self.settings.output_directory())
            .unwrap_or_else(|| self.storage.default_directory());

        self.storage.move_file(cache_file, &dir, &base_name).await
    }

    /// Notify the listener right away, then persist. The store keeps the
    /// highest value, so writes finishing out of order are harmless.
    async fn report_progress(&self, job_id: JobId, percent: u8) {
        if let Some(listener) = &self.progress {
            listener(job_id, percent);
        }
        if let Err(e) = self
            .persist(move |store| store.update_progress(job_id, percent))
            .await
        {
            warn!(error = %e, "Failed to persist progress");
        }
    }

    /// Run a store write on the blocking pool.
    async fn persist<F>(&self, write: F) -> Result<()>
    where
        F: FnOnce(&dyn DownloadStore) -> Result<()> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || write(store.as_ref()))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

#[async_trait]
impl JobExecutor for DownloadPipeline {
    async fn execute(
        &self,
        plan: &QueuedPlan,
        cancel: CancellationToken,
    ) -> Result<PipelineOutcome> {
        self.run(plan, cancel).await
    }
}

/// A tagged file waiting in the work directory.
struct StagedTrack {
    cache_file: PathBuf,
    tags: TrackTags,
    extension: &'static str,
}

impl std::fmt::Debug for DownloadPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadPipeline")
            .field("has_progress_listener", &self.progress.is_some())
            .finish_non_exhaustive()
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

async fn prepare_work_dir(dir: &Path) -> Result<()> {
    remove_work_dir(dir).await;
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        Error::FileSystem(FileSystemError::CreateDirFailed {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        })
    })
}

async fn remove_work_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(path = %dir.display(), "Removed work directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove work directory"),
    }
}

/// Append `parts` to `output` in order.
async fn concatenate(parts: &[PathBuf], output: &Path) -> Result<()> {
    let write_failed = |e: std::io::Error| FileSystemError::WriteFailed {
        path: output.to_path_buf(),
        reason: e.to_string(),
    };

    let mut out = tokio::fs::File::create(output).await.map_err(write_failed)?;
    for part in parts {
        let mut input = tokio::fs::File::open(part)
            .await
            .map_err(|e| FileSystemError::ReadFailed {
                path: part.clone(),
                reason: e.to_string(),
            })?;
        tokio::io::copy(&mut input, &mut out)
            .await
            .map_err(write_failed)?;
    }
    tokio::io::AsyncWriteExt::flush(&mut out)
        .await
        .map_err(write_failed)?;
    debug!(parts = parts.len(), path = %output.display(), "Concatenated parts");
    Ok(())
}

async fn replace_file(source: &Path, target: &Path) -> Result<()> {
    if source == target {
        return Ok(());
    }
    tokio::fs::rename(source, target).await.map_err(|e| {
        Error::FileSystem(FileSystemError::MoveFailed {
            source_path: source.to_path_buf(),
            destination: target.to_path_buf(),
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::catalog::{MockCatalogClient, RawTags};
    use crate::config::AppConfig;
    use crate::error::{RemuxError, TaggingError};
    use crate::job::TrackInfo;
    use crate::quality::QualityProfile;
    use crate::remux::MockRemuxer;
    use crate::storage::LocalStorage;
    use crate::store::SqliteDownloadStore;
    use crate::tagging::MockMetadataEmbedder;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        store: Arc<SqliteDownloadStore>,
        settings: Arc<AppConfig>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let settings = Arc::new(AppConfig {
                output_directory: Some(temp_dir.path().join("Echoir")),
                cache_directory: Some(temp_dir.path().join("cache")),
                ..Default::default()
            });
            Self {
                temp_dir,
                store: Arc::new(SqliteDownloadStore::open_in_memory().unwrap()),
                settings,
            }
        }

        fn output_dir(&self) -> PathBuf {
            self.temp_dir.path().join("Echoir")
        }

        fn pipeline(
            &self,
            catalog: impl CatalogClient + 'static,
            remuxer: MockRemuxer,
            embedder: MockMetadataEmbedder,
        ) -> DownloadPipeline {
            DownloadPipeline::new(
                Arc::new(catalog),
                Arc::new(remuxer),
                Arc::new(embedder),
                Arc::new(LocalStorage::new(self.output_dir())),
                self.store.clone(),
                self.settings.clone(),
            )
        }

        fn plan(&self, title: &str, quality: QualityProfile) -> QueuedPlan {
            let job = DownloadJob::new(&TrackInfo::new("track-1", title, "Tester"), quality);
            self.store.insert_or_replace(&job).unwrap();
            QueuedPlan::new(job)
        }
    }

    fn manifest(codec: &str, parts: &[&str]) -> PlaybackManifest {
        PlaybackManifest {
            codec: codec.to_string(),
            parts: parts.iter().map(|p| (*p).to_string()).collect(),
            bit_depth: None,
            sample_rate: None,
        }
    }

    /// Catalog whose parts are written from their URL's last path segment.
    fn echo_catalog(manifest: PlaybackManifest, failing_part: Option<&'static str>) -> MockCatalogClient {
        let mut catalog = MockCatalogClient::new();
        catalog
            .expect_fetch_manifest()
            .returning(move |_, _| Ok(manifest.clone()));
        catalog
            .expect_fetch_track_metadata()
            .returning(|_| Ok(RawTags::new()));
        catalog.expect_download_to_file().returning(move |url, path| {
            if failing_part.is_some_and(|f| url.ends_with(f)) {
                return Err(DownloadError::HttpStatus {
                    url: url.to_string(),
                    status: 500,
                }
                .into());
            }
            let body = url.rsplit('/').next().unwrap_or_default();
            std::fs::write(path, body).unwrap();
            Ok(body.len() as u64)
        });
        catalog
    }

    fn passthrough_embedder() -> MockMetadataEmbedder {
        let mut embedder = MockMetadataEmbedder::new();
        embedder.expect_embed().returning(|_, _, _| Ok(()));
        embedder
    }

    fn copying_remuxer() -> MockRemuxer {
        let mut remuxer = MockRemuxer::new();
        remuxer.expect_remux().returning(|input, output| {
            std::fs::copy(input, output).unwrap();
            Ok(output.to_path_buf())
        });
        remuxer
    }

    #[tokio::test]
    async fn test_single_part_flac_completes() {
        let fx = Fixture::new();
        let mut remuxer = MockRemuxer::new();
        remuxer.expect_remux().never();
        let pipeline = fx.pipeline(
            echo_catalog(manifest("flac", &["http://cdn/one"]), None),
            remuxer,
            passthrough_embedder(),
        );
        let plan = fx.plan("Test Song", QualityProfile::Lossless);

        let outcome = pipeline.run(&plan, CancellationToken::new()).await.unwrap();

        let expected = fx.output_dir().join("Test Song.flac");
        assert_eq!(outcome.file_path, expected);
        assert_eq!(std::fs::read(&expected).unwrap(), b"one");

        let stored = fx.store.get(plan.job_id()).unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.file_path, Some(expected));
        assert!(!pipeline.work_dir(plan.job_id()).exists());
    }

    #[tokio::test]
    async fn test_multi_part_concatenates_in_order_and_remuxes() {
        let fx = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let pipeline = fx
            .pipeline(
                echo_catalog(
                    manifest("eac3", &["http://cdn/a", "http://cdn/b", "http://cdn/c"]),
                    None,
                ),
                copying_remuxer(),
                passthrough_embedder(),
            )
            .with_progress_listener(Arc::new(move |_, p| sink.lock().push(p)));
        let plan = fx.plan("Atmos Song", QualityProfile::DolbyAtmosAc3);

        let outcome = pipeline.run(&plan, CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.file_path, fx.output_dir().join("Atmos Song.m4a"));
        assert_eq!(std::fs::read(&outcome.file_path).unwrap(), b"abc");

        let progress = seen.lock().clone();
        assert_eq!(progress, vec![33, 66, 100]);
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_failed_part_fails_job_without_output() {
        let fx = Fixture::new();
        let mut remuxer = MockRemuxer::new();
        remuxer.expect_remux().never();
        let pipeline = fx.pipeline(
            echo_catalog(
                manifest("eac3", &["http://cdn/a", "http://cdn/b", "http://cdn/c"]),
                Some("/b"),
            ),
            remuxer,
            passthrough_embedder(),
        );
        let plan = fx.plan("Broken", QualityProfile::DolbyAtmosAc3);

        let err = pipeline
            .run(&plan, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Download(DownloadError::PartFailed { index: 1, total: 3, .. })
        ));

        let stored = fx.store.get(plan.job_id()).unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Failed);
        assert_eq!(stored.progress, 66);
        assert!(stored.file_path.is_none());
        assert!(!fx.output_dir().join("Broken.m4a").exists());

        let leftovers: Vec<_> = std::fs::read_dir(pipeline.work_dir(plan.job_id()))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_empty_manifest_fails() {
        let fx = Fixture::new();
        let pipeline = fx.pipeline(
            echo_catalog(manifest("flac", &[]), None),
            MockRemuxer::new(),
            MockMetadataEmbedder::new(),
        );
        let plan = fx.plan("Nothing", QualityProfile::Lossless);

        let err = pipeline
            .run(&plan, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Download(DownloadError::EmptyManifest { .. })
        ));
        assert_eq!(
            fx.store.get(plan.job_id()).unwrap().unwrap().status,
            DownloadStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_remux_failure_records_diagnostics() {
        let fx = Fixture::new();
        let mut remuxer = MockRemuxer::new();
        remuxer.expect_remux().returning(|input, _| {
            Err(RemuxError::Failed {
                input: input.to_path_buf(),
                diagnostics: "moov atom not found".to_string(),
            }
            .into())
        });
        let pipeline = fx.pipeline(
            echo_catalog(manifest("eac3", &["http://cdn/a", "http://cdn/b"]), None),
            remuxer,
            MockMetadataEmbedder::new(),
        );
        let plan = fx.plan("Bad Mux", QualityProfile::DolbyAtmosAc3);

        let err = pipeline
            .run(&plan, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remux(_)));

        let stored = fx.store.get(plan.job_id()).unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Failed);
        assert!(stored.error.unwrap().contains("moov atom not found"));
    }

    #[tokio::test]
    async fn test_tagging_failure_keeps_file_out_of_storage() {
        let fx = Fixture::new();
        let mut embedder = MockMetadataEmbedder::new();
        embedder.expect_embed().returning(|path, _, _| {
            Err(TaggingError::WriteFailed {
                path: path.to_path_buf(),
                reason: "read-only".to_string(),
            }
            .into())
        });
        let pipeline = fx.pipeline(
            echo_catalog(manifest("flac", &["http://cdn/one"]), None),
            MockRemuxer::new(),
            embedder,
        );
        let plan = fx.plan("Untagged", QualityProfile::Lossless);

        let err = pipeline
            .run(&plan, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Tagging(_)));
        assert!(!fx.output_dir().join("Untagged.flac").exists());
    }

    #[tokio::test]
    async fn test_cover_is_fetched_and_passed_to_embedder() {
        let fx = Fixture::new();
        let mut catalog = MockCatalogClient::new();
        let m = manifest("flac", &["http://cdn/one"]);
        catalog
            .expect_fetch_manifest()
            .returning(move |_, _| Ok(m.clone()));
        catalog.expect_fetch_track_metadata().returning(|_| {
            let mut tags = RawTags::new();
            tags.insert("COVER".to_string(), "http://img/cover".to_string());
            tags.insert("TITLE".to_string(), "Catalog Title".to_string());
            Ok(tags)
        });
        catalog.expect_download_to_file().returning(|_, path| {
            std::fs::write(path, b"x").unwrap();
            Ok(1)
        });
        catalog
            .expect_download_bytes()
            .withf(|url| url.ends_with("/cover"))
            .times(1)
            .returning(|_| Ok(vec![0x89, b'P', b'N', b'G']));

        let mut embedder = MockMetadataEmbedder::new();
        embedder
            .expect_embed()
            .withf(|_, tags, cover| {
                tags.title.as_deref() == Some("Catalog Title")
                    && cover.as_ref().is_some_and(|c| c.mime_type == "image/png")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let pipeline = fx.pipeline(catalog, MockRemuxer::new(), embedder);
        let plan = fx.plan("Request Title", QualityProfile::Lossless);
        let outcome = pipeline.run(&plan, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.file_path, fx.output_dir().join("Request Title.flac"));
    }

    #[tokio::test]
    async fn test_album_job_goes_to_album_directory() {
        let fx = Fixture::new();
        let album_dir = fx.output_dir().join("Album (E)");
        let pipeline = fx.pipeline(
            echo_catalog(manifest("flac", &["http://cdn/one"]), None),
            MockRemuxer::new(),
            passthrough_embedder(),
        );
        let job = DownloadJob::new(
            &TrackInfo::new("t", "Song", "Band").with_track_number(1),
            QualityProfile::Lossless,
        )
        .with_album("alb", album_dir.clone());
        fx.store.insert_or_replace(&job).unwrap();

        let outcome = pipeline
            .run(&QueuedPlan::new(job), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.file_path, album_dir.join("Song.flac"));
    }

    /// Catalog that never finishes a part download.
    struct StallingCatalog;

    #[async_trait]
    impl CatalogClient for StallingCatalog {
        async fn fetch_manifest(
            &self,
            _track_id: &str,
            _quality: QualityProfile,
        ) -> Result<PlaybackManifest> {
            Ok(manifest("flac", &["http://cdn/slow"]))
        }

        async fn fetch_track_metadata(&self, _track_id: &str) -> Result<RawTags> {
            Ok(RawTags::new())
        }

        async fn download_bytes(&self, _url: &str) -> Result<Vec<u8>> {
            std::future::pending().await
        }

        async fn download_to_file(&self, _url: &str, destination: &Path) -> Result<u64> {
            std::fs::write(destination, b"partial").unwrap();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancellation_requeues_and_cleans_up() {
        let fx = Fixture::new();
        let pipeline = Arc::new(fx.pipeline(
            StallingCatalog,
            MockRemuxer::new(),
            MockMetadataEmbedder::new(),
        ));
        let plan = fx.plan("Slow", QualityProfile::Lossless);
        let cancel = CancellationToken::new();

        let task = {
            let pipeline = Arc::clone(&pipeline);
            let plan = plan.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pipeline.run(&plan, cancel).await })
        };

        // Wait until the job is downloading before cancelling.
        let mut changes = fx.store.changes();
        while fx.store.get(plan.job_id()).unwrap().unwrap().status != DownloadStatus::Downloading {
            changes.changed().await.unwrap();
        }
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        let stored = fx.store.get(plan.job_id()).unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Queued);
        assert_eq!(stored.progress, 0);
        assert!(stored.error.is_none());
        assert!(!pipeline.work_dir(plan.job_id()).exists());
    }

    /// Storage that fires a cancellation token right after placing a file.
    struct CancelAfterMove {
        inner: LocalStorage,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl StoragePlacement for CancelAfterMove {
        fn default_directory(&self) -> PathBuf {
            self.inner.default_directory()
        }

        async fn create_album_directory(
            &self,
            parent: &Path,
            album_title: &str,
            explicit: bool,
        ) -> Result<PathBuf> {
            self.inner
                .create_album_directory(parent, album_title, explicit)
                .await
        }

        async fn resolve_collision_free_name(&self, dir: &Path, base_name: &str) -> Result<String> {
            self.inner.resolve_collision_free_name(dir, base_name).await
        }

        async fn move_file(&self, source: &Path, dir: &Path, base_name: &str) -> Result<PathBuf> {
            let placed = self.inner.move_file(source, dir, base_name).await?;
            self.cancel.cancel();
            Ok(placed)
        }

        async fn delete_file(&self, path: &Path) -> Result<()> {
            self.inner.delete_file(path).await
        }
    }

    #[tokio::test]
    async fn test_cancel_after_placement_still_completes() {
        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        let pipeline = DownloadPipeline::new(
            Arc::new(echo_catalog(manifest("flac", &["http://cdn/one"]), None)),
            Arc::new(MockRemuxer::new()),
            Arc::new(passthrough_embedder()),
            Arc::new(CancelAfterMove {
                inner: LocalStorage::new(fx.output_dir()),
                cancel: cancel.clone(),
            }),
            fx.store.clone(),
            fx.settings.clone(),
        );
        let plan = fx.plan("Late Cancel", QualityProfile::Lossless);

        let outcome = pipeline.run(&plan, cancel.clone()).await.unwrap();

        assert!(cancel.is_cancelled());
        let expected = fx.output_dir().join("Late Cancel.flac");
        assert_eq!(outcome.file_path, expected);
        assert!(expected.exists());

        let stored = fx.store.get(plan.job_id()).unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Completed);
        assert_eq!(stored.file_path, Some(expected));
        assert!(!pipeline.work_dir(plan.job_id()).exists());
    }

    #[tokio::test]
    async fn test_same_title_tracks_get_distinct_names() {
        let fx = Fixture::new();
        let album_dir = fx.output_dir().join("Album");
        let pipeline = fx.pipeline(
            echo_catalog(manifest("flac", &["http://cdn/one"]), None),
            MockRemuxer::new(),
            passthrough_embedder(),
        );
        let plans: Vec<QueuedPlan> = (0..2)
            .map(|i| {
                let job = DownloadJob::new(
                    &TrackInfo::new(format!("t{i}"), "Intro", "Band"),
                    QualityProfile::Lossless,
                )
                .with_album("alb", album_dir.clone());
                fx.store.insert_or_replace(&job).unwrap();
                QueuedPlan::new(job)
            })
            .collect();

        let (first, second) = tokio::join!(
            pipeline.run(&plans[0], CancellationToken::new()),
            pipeline.run(&plans[1], CancellationToken::new()),
        );

        let mut placed = vec![first.unwrap().file_path, second.unwrap().file_path];
        placed.sort();
        assert_eq!(
            placed,
            vec![album_dir.join("Intro (1).flac"), album_dir.join("Intro.flac")]
        );
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 3), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(5, 3), 100);
        assert_eq!(percent(0, 0), 100);
    }
}
