//! Final placement of downloaded tracks on the local file system.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, FileSystemError, Result};
use crate::naming::{album_directory_name, numbered_candidate};

/// Folder created under the user's music directory.
pub const DEFAULT_FOLDER_NAME: &str = "Echoir";

/// Give up looking for a free name after this many candidates.
const MAX_COLLISION_PROBES: u32 = 10_000;

/// Converts an I/O error for write operations.
fn write_error(path: &Path, e: &io::Error) -> Error {
    Error::FileSystem(FileSystemError::WriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for directory creation.
fn create_dir_error(path: &Path, e: &io::Error) -> Error {
    Error::FileSystem(FileSystemError::CreateDirFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for delete operations.
fn delete_error(path: &Path, e: &io::Error) -> Error {
    Error::FileSystem(FileSystemError::DeleteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for move operations.
fn move_error(source: &Path, destination: &Path, reason: impl ToString) -> Error {
    Error::FileSystem(FileSystemError::MoveFailed {
        source_path: source.to_path_buf(),
        destination: destination.to_path_buf(),
        reason: reason.to_string(),
    })
}

/// The platform music folder joined with [`DEFAULT_FOLDER_NAME`].
#[must_use]
pub fn default_music_directory() -> PathBuf {
    dirs::audio_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Music")))
        .unwrap_or_else(|| PathBuf::from("Music"))
        .join(DEFAULT_FOLDER_NAME)
}

/// Where finished tracks go and how they get there.
#[async_trait]
pub trait StoragePlacement: Send + Sync {
    /// Destination for tracks without an album directory.
    fn default_directory(&self) -> PathBuf;

    /// Create (or reuse) the directory for an album under `parent`.
    async fn create_album_directory(
        &self,
        parent: &Path,
        album_title: &str,
        explicit: bool,
    ) -> Result<PathBuf>;

    /// `base_name` if free in `dir`, otherwise the first free `name (n).ext`.
    ///
    /// Only a snapshot; another writer may take the name before it is used.
    async fn resolve_collision_free_name(&self, dir: &Path, base_name: &str) -> Result<String>;

    /// Move `source` into `dir` under `base_name`, or the first numbered
    /// variant of it that is free, creating `dir` if needed. The name is
    /// claimed atomically, so concurrent moves never share or overwrite a file.
    ///
    /// On failure nothing is left under a visible name in `dir`.
    async fn move_file(&self, source: &Path, dir: &Path, base_name: &str) -> Result<PathBuf>;

    /// Delete a placed file. A file that is already gone is not an error.
    async fn delete_file(&self, path: &Path) -> Result<()>;
}

/// [`StoragePlacement`] over the local file system.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Place tracks under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Place tracks under the configured directory, or the default music folder.
    #[must_use]
    pub fn from_output_directory(output: Option<PathBuf>) -> Self {
        Self::new(output.unwrap_or_else(default_music_directory))
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy `source` to a hidden file inside `dir`, so the final name only
    /// ever appears with complete contents.
    async fn stage_copy(source: &Path, dir: &Path) -> Result<PathBuf> {
        let staging = dir.join(format!(".{}.partial", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::copy(source, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(move_error(source, &staging, e));
        }
        Ok(staging)
    }

    /// Fallback for file systems without hard links. Not atomic.
    async fn rename_into_free_name(
        &self,
        from: &Path,
        dir: &Path,
        base_name: &str,
    ) -> Result<PathBuf> {
        let name = self.resolve_collision_free_name(dir, base_name).await?;
        let destination = dir.join(name);
        tokio::fs::rename(from, &destination)
            .await
            .map_err(|e| move_error(from, &destination, e))?;
        Ok(destination)
    }

    async fn remove_quietly(path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Could not remove moved file");
        }
    }

    async fn claim(from: &Path, dir: &Path, base_name: &str) -> Result<Claim> {
        for n in 0..=MAX_COLLISION_PROBES {
            let name = if n == 0 {
                base_name.to_string()
            } else {
                numbered_candidate(base_name, n)
            };
            let destination = dir.join(&name);
            match tokio::fs::hard_link(from, &destination).await {
                Ok(()) => {
                    if n > 0 {
                        debug!(base_name, candidate = %name, "Resolved filename collision");
                    }
                    return Ok(Claim::Linked(destination));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Ok(Claim::Unlinkable(e)),
            }
        }
        Err(write_error(
            &dir.join(base_name),
            &io::Error::new(io::ErrorKind::AlreadyExists, "no free filename"),
        ))
    }
}

/// Outcome of trying to hard-link a file under a free name.
enum Claim {
    Linked(PathBuf),
    Unlinkable(io::Error),
}

#[async_trait]
impl StoragePlacement for LocalStorage {
    fn default_directory(&self) -> PathBuf {
        self.root.clone()
    }

    async fn create_album_directory(
        &self,
        parent: &Path,
        album_title: &str,
        explicit: bool,
    ) -> Result<PathBuf> {
        let dir = parent.join(album_directory_name(album_title, explicit));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| create_dir_error(&dir, &e))?;
        info!(path = %dir.display(), "Prepared album directory");
        Ok(dir)
    }

    async fn resolve_collision_free_name(&self, dir: &Path, base_name: &str) -> Result<String> {
        let taken = |name: &str| {
            let candidate = dir.join(name);
            async move { tokio::fs::try_exists(&candidate).await.unwrap_or(true) }
        };

        if !taken(base_name).await {
            return Ok(base_name.to_string());
        }
        for n in 1..=MAX_COLLISION_PROBES {
            let candidate = numbered_candidate(base_name, n);
            if !taken(&candidate).await {
                debug!(base_name, %candidate, "Resolved filename collision");
                return Ok(candidate);
            }
        }
        Err(write_error(
            &dir.join(base_name),
            &io::Error::new(io::ErrorKind::AlreadyExists, "no free filename"),
        ))
    }

    async fn move_file(&self, source: &Path, dir: &Path, base_name: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| create_dir_error(dir, &e))?;
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(Error::FileSystem(FileSystemError::NotFound {
                path: source.to_path_buf(),
            }));
        }

        let destination = match Self::claim(source, dir, base_name).await? {
            Claim::Linked(destination) => destination,
            Claim::Unlinkable(e) => {
                // Typically a cross-device move.
                debug!(error = %e, "Hard link failed, staging a copy next to the destination");
                let staging = Self::stage_copy(source, dir).await?;
                let placed = match Self::claim(&staging, dir, base_name).await {
                    Ok(Claim::Linked(destination)) => Ok(destination),
                    Ok(Claim::Unlinkable(e)) => {
                        warn!(error = %e, "File system has no hard links, placing without a claim");
                        self.rename_into_free_name(&staging, dir, base_name).await
                    }
                    Err(e) => Err(e),
                };
                if tokio::fs::try_exists(&staging).await.unwrap_or(false) {
                    Self::remove_quietly(&staging).await;
                }
                placed?
            }
        };

        Self::remove_quietly(source).await;
        info!(path = %destination.display(), "Placed track");
        Ok(destination)
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "Deleted track file");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Track file already gone");
                Ok(())
            }
            Err(e) => Err(delete_error(path, &e)),
        }
    }
}
