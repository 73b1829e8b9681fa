//! Container remuxing for multi-part downloads.
//!
//! Concatenated DASH segments are a valid byte stream but not a well-formed
//! container, so they are stream-copied into a fresh one before tagging.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{RemuxError, Result};

/// Default remux binary, looked up on `PATH`.
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Rewrites a media file into a clean container without re-encoding.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Remuxer: Send + Sync {
    /// Stream-copy `input` into `output`, returning the output path.
    async fn remux(&self, input: &Path, output: &Path) -> Result<PathBuf>;
}

/// [`Remuxer`] backed by an `ffmpeg` executable.
#[derive(Debug, Clone)]
pub struct FfmpegRemuxer {
    binary: PathBuf,
}

impl FfmpegRemuxer {
    /// Use the `ffmpeg` found on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_binary(DEFAULT_FFMPEG)
    }

    /// Use a specific executable.
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// The executable this remuxer runs.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

impl Default for FfmpegRemuxer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Remuxer for FfmpegRemuxer {
    async fn remux(&self, input: &Path, output: &Path) -> Result<PathBuf> {
        debug!(
            input = %input.display(),
            output = %output.display(),
            "Remuxing merged stream"
        );

        let result = Command::new(&self.binary)
            .args(["-y", "-hide_banner", "-loglevel", "error", "-i"])
            .arg(input)
            .args(["-map", "0", "-c", "copy"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let out = match result {
            Ok(out) => out,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(RemuxError::ToolNotFound {
                    tool: self.binary.display().to_string(),
                }
                .into());
            }
            Err(e) => {
                return Err(RemuxError::Failed {
                    input: input.to_path_buf(),
                    diagnostics: format!("failed to launch {}: {e}", self.binary.display()),
                }
                .into());
            }
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            let diagnostics = if stderr.is_empty() {
                format!("exited with {}", out.status)
            } else {
                stderr
            };
            let _ = tokio::fs::remove_file(output).await;
            return Err(RemuxError::Failed {
                input: input.to_path_buf(),
                diagnostics,
            }
            .into());
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(RemuxError::Failed {
                input: input.to_path_buf(),
                diagnostics: "no output file was produced".to_string(),
            }
            .into());
        }

        info!(output = %output.display(), "Remux complete");
        Ok(output.to_path_buf())
    }
}
