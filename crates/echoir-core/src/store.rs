//! Persistent download record store.
//!
//! Download jobs live in a single SQLite table. Every field update is a single
//! `UPDATE` statement so concurrent writers never lose each other's changes,
//! and every write bumps a revision counter that [`JobWatcher`]s follow to
//! stream fresh snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Error, Result, StoreError};
use crate::job::{DownloadJob, DownloadStatus, JobId};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS download_job (
  id TEXT PRIMARY KEY,
  track_ref TEXT NOT NULL,
  quality TEXT NOT NULL,
  status TEXT NOT NULL,
  progress INTEGER NOT NULL DEFAULT 0,
  file_path TEXT,
  created_at_ms INTEGER NOT NULL,
  album_ref TEXT,
  album_directory TEXT,
  title TEXT NOT NULL,
  artist TEXT NOT NULL,
  track_number INTEGER,
  explicit INTEGER NOT NULL DEFAULT 0,
  error TEXT
);

CREATE INDEX IF NOT EXISTS idx_download_job_status_created ON download_job(status, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_download_job_album ON download_job(album_ref);
";

const SELECT_COLUMNS: &str = "SELECT id, track_ref, quality, status, progress, file_path, \
     created_at_ms, album_ref, album_directory, title, artist, track_number, explicit, error \
     FROM download_job";

const ORDER_NEWEST_FIRST: &str = "ORDER BY created_at_ms DESC, rowid DESC";

/// Which rows a query or watcher selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilter {
    /// Queued, downloading or merging jobs.
    Active,
    /// Completed or failed jobs.
    History,
    /// Jobs belonging to one album batch.
    Album(String),
    /// Jobs in exactly one status.
    Status(DownloadStatus),
    /// Every job.
    All,
}

/// Persistence for download jobs.
///
/// Implementations must apply each method as one atomic write, and must
/// notify [`DownloadStore::changes`] subscribers after every write.
pub trait DownloadStore: Send + Sync {
    /// Insert a job, replacing any row with the same id.
    fn insert_or_replace(&self, job: &DownloadJob) -> Result<()>;

    /// Fetch a job by id.
    fn get(&self, id: JobId) -> Result<Option<DownloadJob>>;

    /// Raise the stored progress of a downloading job. Never lowers it.
    fn update_progress(&self, id: JobId, progress: u8) -> Result<()>;

    /// Set the status. Clears `file_path` unless the status is `Completed`.
    fn update_status(&self, id: JobId, status: DownloadStatus) -> Result<()>;

    /// Set `Completed`, the final path and progress 100 in one write.
    fn mark_completed(&self, id: JobId, path: &Path) -> Result<()>;

    /// Set `Failed` with a message.
    fn mark_failed(&self, id: JobId, message: &str) -> Result<()>;

    /// Put a job back to `Queued` with progress 0 and no error or path.
    fn reset_to_queued(&self, id: JobId) -> Result<()>;

    /// Point a completed job at a new file location. Rows in any other state
    /// are left alone; returns whether the row changed.
    fn update_file_path(&self, id: JobId, path: &Path) -> Result<bool>;

    /// Remove a row. Returns whether it existed.
    fn delete(&self, id: JobId) -> Result<bool>;

    /// Jobs matching a filter, newest first.
    fn query(&self, filter: &JobFilter) -> Result<Vec<DownloadJob>>;

    /// Turn rows left `Downloading` or `Merging` by a dead process back into
    /// `Queued`. Returns how many rows changed.
    fn reset_interrupted(&self) -> Result<usize>;

    /// Revision counter bumped after every write.
    fn changes(&self) -> watch::Receiver<u64>;

    /// Queued, downloading or merging jobs, newest first.
    fn active_jobs(&self) -> Result<Vec<DownloadJob>> {
        self.query(&JobFilter::Active)
    }

    /// Completed or failed jobs, newest first.
    fn history_jobs(&self) -> Result<Vec<DownloadJob>> {
        self.query(&JobFilter::History)
    }

    /// Jobs of one album batch, newest first.
    fn jobs_for_album(&self, album_ref: &str) -> Result<Vec<DownloadJob>> {
        self.query(&JobFilter::Album(album_ref.to_string()))
    }
}

/// SQLite-backed [`DownloadStore`].
pub struct SqliteDownloadStore {
    conn: Mutex<Connection>,
    revision: watch::Sender<u64>,
}

impl SqliteDownloadStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::FileSystemError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: e.to_string(),
                }
            })?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        info!(path = %path.display(), "Opened download store");
        Self::with_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let (revision, _) = watch::channel(0);
        Ok(Self {
            conn: Mutex::new(conn),
            revision,
        })
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    /// Run one write statement and notify watchers if it touched a row.
    fn write(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        let changed = self.conn.lock().execute(sql, params)?;
        if changed > 0 {
            self.bump();
        }
        Ok(changed)
    }
}

impl std::fmt::Debug for SqliteDownloadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDownloadStore")
            .field("revision", &*self.revision.borrow())
            .finish_non_exhaustive()
    }
}

impl DownloadStore for SqliteDownloadStore {
    fn insert_or_replace(&self, job: &DownloadJob) -> Result<()> {
        let file_path = if job.status == DownloadStatus::Completed {
            job.file_path.as_deref().map(path_to_text)
        } else {
            None
        };
        self.write(
            "INSERT OR REPLACE INTO download_job (id, track_ref, quality, status, progress, \
             file_path, created_at_ms, album_ref, album_directory, title, artist, track_number, \
             explicit, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id.to_string(),
                job.track_ref,
                job.quality.as_str(),
                job.status.as_str(),
                job.progress.min(100),
                file_path,
                job.created_at.timestamp_millis(),
                job.album_ref,
                job.album_directory.as_deref().map(path_to_text),
                job.title,
                job.artist,
                job.track_number,
                job.explicit,
                job.error,
            ],
        )?;
        debug!(job_id = %job.id, status = %job.status, "Stored download job");
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<DownloadJob>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                RawRow::from_row,
            )
            .optional()?
        };
        raw.map(RawRow::into_job).transpose()
    }

    fn update_progress(&self, id: JobId, progress: u8) -> Result<()> {
        self.write(
            "UPDATE download_job SET progress = MAX(progress, ?2) \
             WHERE id = ?1 AND status = 'downloading'",
            params![id.to_string(), progress.min(100)],
        )?;
        Ok(())
    }

    fn update_status(&self, id: JobId, status: DownloadStatus) -> Result<()> {
        self.write(
            "UPDATE download_job SET status = ?2, \
             file_path = CASE WHEN ?2 = 'completed' THEN file_path ELSE NULL END \
             WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        Ok(())
    }

    fn mark_completed(&self, id: JobId, path: &Path) -> Result<()> {
        self.write(
            "UPDATE download_job SET status = 'completed', file_path = ?2, progress = 100, \
             error = NULL WHERE id = ?1",
            params![id.to_string(), path_to_text(path)],
        )?;
        Ok(())
    }

    fn mark_failed(&self, id: JobId, message: &str) -> Result<()> {
        self.write(
            "UPDATE download_job SET status = 'failed', file_path = NULL, error = ?2 \
             WHERE id = ?1",
            params![id.to_string(), message],
        )?;
        Ok(())
    }

    fn reset_to_queued(&self, id: JobId) -> Result<()> {
        self.write(
            "UPDATE download_job SET status = 'queued', progress = 0, file_path = NULL, \
             error = NULL WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    fn update_file_path(&self, id: JobId, path: &Path) -> Result<bool> {
        let changed = self.write(
            "UPDATE download_job SET file_path = ?2 WHERE id = ?1 AND status = 'completed'",
            params![id.to_string(), path_to_text(path)],
        )?;
        Ok(changed > 0)
    }

    fn delete(&self, id: JobId) -> Result<bool> {
        let removed = self.write(
            "DELETE FROM download_job WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(removed > 0)
    }

    fn query(&self, filter: &JobFilter) -> Result<Vec<DownloadJob>> {
        let raws = {
            let conn = self.conn.lock();
            let (clause, arg): (&str, Option<String>) = match filter {
                JobFilter::Active => (
                    "WHERE status IN ('queued', 'downloading', 'merging')",
                    None,
                ),
                JobFilter::History => ("WHERE status IN ('completed', 'failed')", None),
                JobFilter::Album(album) => ("WHERE album_ref = ?1", Some(album.clone())),
                JobFilter::Status(status) => {
                    ("WHERE status = ?1", Some(status.as_str().to_string()))
                }
                JobFilter::All => ("", None),
            };
            let sql = format!("{SELECT_COLUMNS} {clause} {ORDER_NEWEST_FIRST}");
            let mut stmt = conn.prepare(&sql)?;
            let rows = match arg {
                Some(arg) => stmt.query_map(params![arg], RawRow::from_row)?,
                None => stmt.query_map([], RawRow::from_row)?,
            };
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(RawRow::into_job).collect()
    }

    fn reset_interrupted(&self) -> Result<usize> {
        let changed = self.write(
            "UPDATE download_job SET status = 'queued', progress = 0, file_path = NULL \
             WHERE status IN ('downloading', 'merging')",
            [],
        )?;
        if changed > 0 {
            info!(count = changed, "Requeued interrupted download jobs");
        }
        Ok(changed)
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Column values as stored, before domain decoding.
struct RawRow {
    id: String,
    track_ref: String,
    quality: String,
    status: String,
    progress: i64,
    file_path: Option<String>,
    created_at_ms: i64,
    album_ref: Option<String>,
    album_directory: Option<String>,
    title: String,
    artist: String,
    track_number: Option<u32>,
    explicit: bool,
    error: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            track_ref: row.get(1)?,
            quality: row.get(2)?,
            status: row.get(3)?,
            progress: row.get(4)?,
            file_path: row.get(5)?,
            created_at_ms: row.get(6)?,
            album_ref: row.get(7)?,
            album_directory: row.get(8)?,
            title: row.get(9)?,
            artist: row.get(10)?,
            track_number: row.get(11)?,
            explicit: row.get(12)?,
            error: row.get(13)?,
        })
    }

    fn into_job(self) -> Result<DownloadJob> {
        let corrupt = |reason: String| {
            Error::Store(StoreError::CorruptRow {
                id: self.id.clone(),
                reason,
            })
        };

        let id = self
            .id
            .parse::<JobId>()
            .map_err(|e| corrupt(format!("bad id: {e}")))?;
        let quality = self
            .quality
            .parse()
            .map_err(|e: Error| corrupt(e.to_string()))?;
        let status = self
            .status
            .parse()
            .map_err(|e: Error| corrupt(e.to_string()))?;
        let created_at = DateTime::<Utc>::from_timestamp_millis(self.created_at_ms)
            .ok_or_else(|| corrupt(format!("bad timestamp {}", self.created_at_ms)))?;

        Ok(DownloadJob {
            id,
            track_ref: self.track_ref,
            quality,
            status,
            progress: self.progress.clamp(0, 100) as u8,
            file_path: self.file_path.map(PathBuf::from),
            created_at,
            album_ref: self.album_ref,
            album_directory: self.album_directory.map(PathBuf::from),
            title: self.title,
            artist: self.artist,
            track_number: self.track_number,
            explicit: self.explicit,
            error: self.error,
        })
    }
}

/// Streams snapshots of the jobs matching a filter.
///
/// The first call to [`JobWatcher::next`] yields immediately; later calls wait
/// for the next write to the store.
pub struct JobWatcher {
    store: Arc<dyn DownloadStore>,
    filter: JobFilter,
    revision: watch::Receiver<u64>,
    primed: bool,
}

impl JobWatcher {
    /// Watch the jobs of `store` matching `filter`.
    pub fn new(store: Arc<dyn DownloadStore>, filter: JobFilter) -> Self {
        let revision = store.changes();
        Self {
            store,
            filter,
            revision,
            primed: false,
        }
    }

    /// The first call returns the current snapshot; later calls wait for the
    /// next write. The watcher keeps its store alive, so with
    /// [`SqliteDownloadStore`] this waits indefinitely rather than ending.
    /// `None` only comes from a store whose change channel closes.
    pub async fn next(&mut self) -> Option<Result<Vec<DownloadJob>>> {
        if self.primed {
            self.revision.changed().await.ok()?;
        } else {
            self.primed = true;
        }
        self.revision.borrow_and_update();
        Some(self.store.query(&self.filter))
    }
}

impl std::fmt::Debug for JobWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWatcher")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}
