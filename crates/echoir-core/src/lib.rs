//! Echoir Core Library
//!
//! This crate provides the download orchestration core of Echoir:
//! - Persisted download records with live snapshots (SQLite)
//! - A bounded-concurrency queue with FIFO admission
//! - A per-track pipeline: manifest, parts, merge/remux, tagging, placement
//! - Dispatch glue that releases slots and starts buffered jobs
//! - A request planner for single tracks and whole albums
//!
//! # Wiring
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use echoir_core::*;
//!
//! let config = Arc::new(ConfigManager::new()?);
//! let settings = config.config();
//! let _log_guard = logging::init(&settings.logging)?;
//! let store: Arc<dyn DownloadStore> =
//!     Arc::new(SqliteDownloadStore::open(settings.resolved_database_path())?);
//! let storage = Arc::new(LocalStorage::from_output_directory(settings.output_directory.clone()));
//! let pipeline = DownloadPipeline::new(
//!     Arc::new(HttpCatalogClient::new(settings.catalog.clone())?),
//!     Arc::new(FfmpegRemuxer::new()),
//!     Arc::new(AudioTagEmbedder::new()),
//!     storage.clone(),
//!     store.clone(),
//!     config.clone(),
//! );
//! let dispatcher = Dispatcher::new(
//!     Arc::new(QueueManager::with_config(settings.queue.clone())),
//!     Arc::new(TokioTaskRunner::new()?),
//!     Arc::new(pipeline),
//!     store.clone(),
//!     storage.clone(),
//! );
//! dispatcher.recover()?;
//! let planner = RequestPlanner::new(dispatcher, store, storage, config);
//! ```
//!
//! # Error Handling
//!
//! Errors are typed per domain and wrapped by [`Error`]; see the [`error`]
//! module.

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod logging;
pub mod naming;
pub mod pipeline;
pub mod planner;
pub mod quality;
pub mod queue;
pub mod remux;
pub mod runner;
pub mod storage;
pub mod store;
pub mod tagging;

pub use catalog::{
    CatalogClient, CatalogConfig, DEFAULT_CATALOG_URL, HttpCatalogClient, PlaybackManifest,
    RawTags,
};
pub use config::{
    AppConfig, ConfigManager, SettingsProvider, default_cache_directory, default_database_path,
};
pub use dispatch::{Admission, Dispatcher};
pub use error::{
    DownloadError, Error, ErrorKind, FileSystemError, RemuxError, Result, StoreError,
    TaggingError,
};
pub use job::{DownloadJob, DownloadStatus, JobId, QueuedPlan, TrackInfo, TrackRef};
pub use logging::{LogLevel, LogRotation, LoggingConfig, LoggingError, LoggingGuard};
pub use naming::{FileNamingFormat, sanitize_filename};
pub use pipeline::{DownloadPipeline, JobExecutor, PipelineOutcome, ProgressListener};
pub use planner::{AlbumRequest, DownloadRequest, PlannedDownload, RequestPlanner, TrackRequest};
pub use quality::{QualityProfile, SpatialCodec};
pub use queue::{
    ActiveSlot, DEFAULT_MAX_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS,
    MIN_CONCURRENT_DOWNLOADS, QueueConfig, QueueEvent, QueueManager, QueueStats,
};
pub use remux::{FfmpegRemuxer, Remuxer};
pub use runner::{ManualTaskRunner, SubmitOutcome, TaskRunner, TokioTaskRunner};
pub use storage::{LocalStorage, StoragePlacement, default_music_directory};
pub use store::{DownloadStore, JobFilter, JobWatcher, SqliteDownloadStore};
pub use tagging::{AudioTagEmbedder, CoverArt, MetadataEmbedder, TagFormat, TrackTags};
