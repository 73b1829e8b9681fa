//! End-to-end tests for the download queue, dispatcher and pipeline.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use echoir_core::{
    Admission, AlbumRequest, AppConfig, CatalogClient, CoverArt, Dispatcher, DownloadError,
    DownloadJob, DownloadPipeline, DownloadRequest, DownloadStatus, DownloadStore, Error,
    JobExecutor, JobFilter, JobId, JobWatcher, LocalStorage, ManualTaskRunner, MetadataEmbedder,
    PipelineOutcome, PlaybackManifest, QualityProfile, QueueConfig, QueueManager, QueuedPlan,
    RawTags, Remuxer, RequestPlanner, Result, SqliteDownloadStore, TaskRunner, TokioTaskRunner,
    TrackInfo, TrackRequest, TrackTags,
};

// ============================================================================
// Fakes
// ============================================================================

/// Serves a fixed manifest; each part's body is the last segment of its URL.
struct FakeCatalog {
    codec: String,
    parts: Vec<String>,
    failing_part: Option<usize>,
}

impl FakeCatalog {
    fn single(codec: &str) -> Self {
        Self {
            codec: codec.to_string(),
            parts: vec!["https://cdn.test/audio".to_string()],
            failing_part: None,
        }
    }

    fn multi(parts: usize) -> Self {
        Self {
            codec: "eac3".to_string(),
            parts: (0..parts).map(|i| format!("https://cdn.test/seg{i}")).collect(),
            failing_part: None,
        }
    }

    fn failing_at(mut self, index: usize) -> Self {
        self.failing_part = Some(index);
        self
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn fetch_manifest(
        &self,
        _track_id: &str,
        _quality: QualityProfile,
    ) -> Result<PlaybackManifest> {
        Ok(PlaybackManifest {
            codec: self.codec.clone(),
            parts: self.parts.clone(),
            bit_depth: Some(16),
            sample_rate: Some(44_100),
        })
    }

    async fn fetch_track_metadata(&self, _track_id: &str) -> Result<RawTags> {
        let mut tags = RawTags::new();
        tags.insert("ALBUM".to_string(), "Fixture Album".to_string());
        Ok(tags)
    }

    async fn download_bytes(&self, url: &str) -> Result<Vec<u8>> {
        Err(DownloadError::HttpStatus {
            url: url.to_string(),
            status: 404,
        }
        .into())
    }

    async fn download_to_file(&self, url: &str, destination: &Path) -> Result<u64> {
        let index = self.parts.iter().position(|p| p == url);
        if index.is_some() && index == self.failing_part {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: 503,
            }
            .into());
        }
        let body = url.rsplit('/').next().unwrap_or_default();
        tokio::fs::write(destination, body).await.unwrap();
        Ok(body.len() as u64)
    }
}

/// Stream-copies by copying the file.
struct CopyRemuxer {
    calls: AtomicUsize,
}

#[async_trait]
impl Remuxer for CopyRemuxer {
    async fn remux(&self, input: &Path, output: &Path) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::copy(input, output).await?;
        Ok(output.to_path_buf())
    }
}

/// Records the tags it was asked to write.
#[derive(Default)]
struct RecordingEmbedder {
    tagged: Mutex<Vec<TrackTags>>,
}

#[async_trait]
impl MetadataEmbedder for RecordingEmbedder {
    async fn embed(&self, _path: &Path, tags: &TrackTags, _cover: Option<CoverArt>) -> Result<()> {
        self.tagged.lock().push(tags.clone());
        Ok(())
    }
}

/// Holds each job for a while and records how many run at once.
#[derive(Default)]
struct GatedExecutor {
    running: AtomicUsize,
    peak: AtomicUsize,
    executions: Mutex<Vec<JobId>>,
}

#[async_trait]
impl JobExecutor for GatedExecutor {
    async fn execute(
        &self,
        plan: &QueuedPlan,
        _cancel: CancellationToken,
    ) -> Result<PipelineOutcome> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.executions.lock().push(plan.job_id());
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(PipelineOutcome {
            job_id: plan.job_id(),
            file_path: PathBuf::from(format!("/music/{}.flac", plan.job.title)),
        })
    }
}

// ============================================================================
// Wiring
// ============================================================================

struct Env {
    temp_dir: TempDir,
    store: Arc<SqliteDownloadStore>,
    dispatcher: Dispatcher,
    planner: RequestPlanner,
}

impl Env {
    fn music_dir(&self) -> PathBuf {
        self.temp_dir.path().join("Music").join("Echoir")
    }
}

fn settings(temp_dir: &TempDir) -> Arc<AppConfig> {
    Arc::new(AppConfig {
        cache_directory: Some(temp_dir.path().join("cache")),
        ..Default::default()
    })
}

fn env(limit: usize, runner: Arc<dyn TaskRunner>, executor: Arc<dyn JobExecutor>) -> Env {
    env_with(TempDir::new().unwrap(), limit, runner, |_, _, _| executor)
}

/// Wire an environment whose executor is built from its store, storage and
/// settings.
fn env_with(
    temp_dir: TempDir,
    limit: usize,
    runner: Arc<dyn TaskRunner>,
    executor: impl FnOnce(
        Arc<SqliteDownloadStore>,
        Arc<LocalStorage>,
        Arc<AppConfig>,
    ) -> Arc<dyn JobExecutor>,
) -> Env {
    let store = Arc::new(SqliteDownloadStore::open(temp_dir.path().join("echoir.db")).unwrap());
    let storage = Arc::new(LocalStorage::new(
        temp_dir.path().join("Music").join("Echoir"),
    ));
    let settings = settings(&temp_dir);
    let executor = executor(store.clone(), storage.clone(), settings.clone());

    let dispatcher = Dispatcher::new(
        Arc::new(QueueManager::with_config(QueueConfig {
            max_concurrent_downloads: limit,
        })),
        runner,
        executor,
        store.clone(),
        storage.clone(),
    );
    let planner = RequestPlanner::new(dispatcher.clone(), store.clone(), storage, settings);
    Env {
        temp_dir,
        store,
        dispatcher,
        planner,
    }
}

fn pipeline_env(
    limit: usize,
    runner: Arc<dyn TaskRunner>,
    catalog: FakeCatalog,
) -> (Env, Arc<CopyRemuxer>, Arc<RecordingEmbedder>) {
    let remuxer = Arc::new(CopyRemuxer {
        calls: AtomicUsize::new(0),
    });
    let embedder = Arc::new(RecordingEmbedder::default());
    let (r, e) = (remuxer.clone(), embedder.clone());
    let env = env_with(TempDir::new().unwrap(), limit, runner, move |store, storage, settings| {
        let pipeline: Arc<dyn JobExecutor> = Arc::new(DownloadPipeline::new(
            Arc::new(catalog),
            r,
            e,
            storage,
            store,
            settings,
        ));
        pipeline
    });
    (env, remuxer, embedder)
}

fn track(title: &str) -> DownloadRequest {
    DownloadRequest::Track(TrackRequest {
        track: TrackInfo::new(format!("id-{title}"), title, "Tester"),
        quality: QualityProfile::Lossless,
    })
}

fn persisted(store: &SqliteDownloadStore, title: &str) -> QueuedPlan {
    let job = DownloadJob::new(
        &TrackInfo::new(format!("id-{title}"), title, "Tester"),
        QualityProfile::Lossless,
    );
    store.insert_or_replace(&job).unwrap();
    QueuedPlan::new(job)
}

/// Wait until every listed job reaches a terminal status.
async fn wait_terminal(store: Arc<SqliteDownloadStore>, ids: &[JobId]) -> Vec<DownloadJob> {
    let mut watcher = JobWatcher::new(store, JobFilter::All);
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let jobs = watcher.next().await.unwrap().unwrap();
            let done: Vec<_> = jobs
                .into_iter()
                .filter(|job| ids.contains(&job.id) && job.status.is_terminal())
                .collect();
            if done.len() == ids.len() {
                return done;
            }
        }
    })
    .await
    .expect("jobs did not finish in time")
}

async fn wait_for(predicate: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Capacity and admission
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_never_more_than_limit_running() {
    let executor = Arc::new(GatedExecutor::default());
    let env = env(2, Arc::new(TokioTaskRunner::new().unwrap()), executor.clone());

    for i in 0..8 {
        env.dispatcher.submit(persisted(&env.store, &format!("song{i}")));
        assert!(env.dispatcher.stats().active_count <= 2);
    }

    wait_for(|| executor.executions.lock().len() == 8).await;
    assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
    wait_for(|| env.dispatcher.stats().active_count == 0).await;
    assert_eq!(env.dispatcher.stats().pending_count, 0);
}

#[tokio::test]
async fn test_every_job_terminates_with_more_jobs_than_slots() {
    let runner = Arc::new(ManualTaskRunner::new());
    let executor = Arc::new(GatedExecutor::default());
    let env = env(1, runner.clone(), executor.clone());

    let ids: Vec<JobId> = (0..5)
        .map(|i| {
            let plan = persisted(&env.store, &format!("song{i}"));
            let id = plan.job_id();
            env.dispatcher.submit(plan);
            id
        })
        .collect();

    assert_eq!(runner.run_all().await, 5);
    assert_eq!(*executor.executions.lock(), ids);
    assert_eq!(env.dispatcher.stats().active_count, 0);
}

#[tokio::test]
async fn test_same_job_admitted_once() {
    let runner = Arc::new(ManualTaskRunner::new());
    let executor = Arc::new(GatedExecutor::default());
    let env = env(2, runner.clone(), executor.clone());
    let plan = persisted(&env.store, "song");

    assert_eq!(env.dispatcher.submit(plan.clone()), Admission::Started);
    assert_eq!(env.dispatcher.submit(plan.clone()), Admission::Duplicate);
    // Startup recovery sees the same queued row.
    env.dispatcher.recover().unwrap();

    runner.run_all().await;
    assert_eq!(*executor.executions.lock(), vec![plan.job_id()]);
}

#[test]
fn test_active_count_floors_at_zero() {
    let queue = QueueManager::with_config(QueueConfig {
        max_concurrent_downloads: 1,
    });
    queue.decrement_active();
    queue.decrement_active();
    assert_eq!(queue.active_count(), 0);

    assert!(queue.try_start());
    assert!(!queue.try_start());
    queue.decrement_active();
    assert!(queue.can_start_new());
}

// ============================================================================
// Pipeline behavior
// ============================================================================

#[tokio::test]
async fn test_progress_never_decreases() {
    let runner = Arc::new(ManualTaskRunner::new());
    let (env, remuxer, _) = pipeline_env(1, runner.clone(), FakeCatalog::multi(4));
    let planned = env.planner.plan(track("Segmented")).await.unwrap();
    let job_id = planned.job_ids[0];

    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = {
        let seen = Arc::clone(&seen);
        let mut watcher = JobWatcher::new(env.store.clone(), JobFilter::All);
        tokio::spawn(async move {
            while let Some(Ok(jobs)) = watcher.next().await {
                if let Some(job) = jobs.iter().find(|j| j.id == job_id) {
                    seen.lock().push(job.progress);
                    if job.status.is_terminal() {
                        break;
                    }
                }
            }
        })
    };

    runner.run_all().await;
    tokio::time::timeout(Duration::from_secs(10), observer)
        .await
        .unwrap()
        .unwrap();

    let seen = seen.lock().clone();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
    assert_eq!(seen.last(), Some(&100));
    assert_eq!(remuxer.calls.load(Ordering::SeqCst), 1);

    // A late, lower report is ignored by the store.
    env.store.update_progress(job_id, 10).unwrap();
    assert_eq!(env.store.get(job_id).unwrap().unwrap().progress, 100);
}

#[tokio::test]
async fn test_failed_part_leaves_no_final_file() {
    let runner = Arc::new(ManualTaskRunner::new());
    let (env, remuxer, embedder) =
        pipeline_env(1, runner.clone(), FakeCatalog::multi(3).failing_at(2));
    let planned = env.planner.plan(track("Partial")).await.unwrap();

    runner.run_all().await;

    let job = env.store.get(planned.job_ids[0]).unwrap().unwrap();
    assert_eq!(job.status, DownloadStatus::Failed);
    assert!(job.file_path.is_none());
    assert!(job.error.unwrap().contains("Part 2 of 3"));
    assert_eq!(remuxer.calls.load(Ordering::SeqCst), 0);
    assert!(embedder.tagged.lock().is_empty());

    let placed = std::fs::read_dir(env.music_dir())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(placed, 0);
}

#[tokio::test]
async fn test_same_title_gets_numbered_names() {
    let runner = Arc::new(ManualTaskRunner::new());
    let (env, _, _) = pipeline_env(1, runner.clone(), FakeCatalog::single("flac"));

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.extend(env.planner.plan(track("Track")).await.unwrap().job_ids);
    }
    runner.run_all().await;

    let paths: Vec<PathBuf> = ids
        .iter()
        .map(|id| env.store.get(*id).unwrap().unwrap().file_path.unwrap())
        .collect();
    assert_eq!(
        paths,
        vec![
            env.music_dir().join("Track.flac"),
            env.music_dir().join("Track (1).flac"),
            env.music_dir().join("Track (2).flac"),
        ]
    );
}

#[tokio::test]
async fn test_failed_job_can_be_retried() {
    let runner = Arc::new(ManualTaskRunner::new());
    let (env, _, _) = pipeline_env(1, runner.clone(), FakeCatalog::multi(2).failing_at(0));
    let planned = env.planner.plan(track("Flaky")).await.unwrap();
    let job_id = planned.job_ids[0];
    runner.run_all().await;
    assert_eq!(
        env.store.get(job_id).unwrap().unwrap().status,
        DownloadStatus::Failed
    );

    assert_eq!(env.dispatcher.retry(job_id).unwrap(), Admission::Started);
    assert!(matches!(
        env.dispatcher.retry(job_id),
        Err(Error::InvalidTransition { .. })
    ));
    runner.run_all().await;
    assert_eq!(
        env.store.get(job_id).unwrap().unwrap().status,
        DownloadStatus::Failed
    );
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_track_end_to_end() {
    let (env, remuxer, embedder) = pipeline_env(
        2,
        Arc::new(TokioTaskRunner::new().unwrap()),
        FakeCatalog::single("flac"),
    );

    let planned = env.planner.plan(track("Test Song")).await.unwrap();
    assert_eq!(planned.started, planned.job_ids);

    let done = wait_terminal(env.store.clone(), &planned.job_ids).await;
    let job = &done[0];
    let expected = env.music_dir().join("Test Song.flac");

    assert_eq!(job.status, DownloadStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.file_path.as_deref(), Some(expected.as_path()));
    assert!(expected.ends_with("Echoir/Test Song.flac"));
    assert_eq!(std::fs::read(&expected).unwrap(), b"audio");
    assert_eq!(remuxer.calls.load(Ordering::SeqCst), 0);

    let tagged = embedder.tagged.lock();
    assert_eq!(tagged[0].title.as_deref(), Some("Test Song"));
    assert_eq!(tagged[0].album.as_deref(), Some("Fixture Album"));
    drop(tagged);

    env.dispatcher.delete_file(job.id).await.unwrap();
    assert!(!expected.exists());
    assert_eq!(
        env.store.get(job.id).unwrap().unwrap().status,
        DownloadStatus::Deleted
    );
}

#[tokio::test]
async fn test_explicit_album_end_to_end() {
    let runner = Arc::new(ManualTaskRunner::new());
    let (env, _, _) = pipeline_env(2, runner.clone(), FakeCatalog::single("flac"));

    let request = AlbumRequest {
        album_id: "album-42".to_string(),
        title: "Album".to_string(),
        explicit: false,
        tracks: vec![
            TrackInfo::new("t1", "One", "Band").with_track_number(1),
            TrackInfo::new("t2", "Two", "Band")
                .with_track_number(2)
                .with_explicit(true),
            TrackInfo::new("t3", "Three", "Band").with_track_number(3),
        ],
        quality: QualityProfile::Lossless,
    };
    let planned = env
        .planner
        .plan(DownloadRequest::Album(request))
        .await
        .unwrap();

    let album_dir = env.music_dir().join("Album (E)");
    assert_eq!(planned.album_directory.as_deref(), Some(album_dir.as_path()));
    assert!(album_dir.is_dir());
    assert_eq!(planned.started.len(), 2);
    assert_eq!(env.dispatcher.stats().pending_count, 1);

    let rows = env.store.jobs_for_album("album-42").unwrap();
    assert_eq!(rows.len(), 3);
    assert!(
        rows.iter()
            .all(|job| job.album_directory.as_deref() == Some(album_dir.as_path()))
    );

    assert_eq!(runner.run_all().await, 3);
    let mut placed: Vec<_> = std::fs::read_dir(&album_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .collect();
    placed.sort();
    assert_eq!(placed, vec!["One.flac", "Three.flac", "Two.flac"]);
}

#[tokio::test]
async fn test_interrupted_jobs_resume_after_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("echoir.db");
    let interrupted_id = {
        let store = SqliteDownloadStore::open(&db_path).unwrap();
        let plan = persisted(&store, "Interrupted");
        store
            .update_status(plan.job_id(), DownloadStatus::Downloading)
            .unwrap();
        store.update_progress(plan.job_id(), 40).unwrap();
        plan.job_id()
    };

    let runner = Arc::new(ManualTaskRunner::new());
    let executor = Arc::new(GatedExecutor::default());
    let shared: Arc<dyn JobExecutor> = executor.clone();
    let env = env_with(temp_dir, 2, runner.clone(), |_, _, _| shared);

    assert_eq!(env.dispatcher.recover().unwrap(), 1);
    let job = env.store.get(interrupted_id).unwrap().unwrap();
    assert_eq!(job.status, DownloadStatus::Queued);
    assert_eq!(job.progress, 0);

    runner.run_all().await;
    assert_eq!(*executor.executions.lock(), vec![interrupted_id]);
}
