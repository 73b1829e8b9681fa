//! File and directory naming for downloaded tracks.

use serde::{Deserialize, Serialize};

/// Maximum length, in characters, of a sanitized name component.
pub const MAX_NAME_CHARS: usize = 200;

/// Placeholder used when a name sanitizes to nothing.
const UNKNOWN_NAME: &str = "Unknown";

/// How final track filenames are composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileNamingFormat {
    /// `Title.ext`
    #[default]
    TitleOnly,
    /// `Artist - Title.ext`
    ArtistTitle,
    /// `Title - Artist.ext`
    TitleArtist,
    /// `01 - Title.ext`, falling back to the title alone without a track number.
    TrackTitle,
}

impl std::fmt::Display for FileNamingFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TitleOnly => write!(f, "Title only"),
            Self::ArtistTitle => write!(f, "Artist - Title"),
            Self::TitleArtist => write!(f, "Title - Artist"),
            Self::TrackTitle => write!(f, "Track - Title"),
        }
    }
}

/// Sanitize a string for use as a file or directory name.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

    let sanitized: String = name
        .chars()
        .map(|c| {
            if invalid_chars.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Trim whitespace and dots from ends
    let trimmed = sanitized.trim().trim_matches('.').trim();

    if trimmed.is_empty() {
        return UNKNOWN_NAME.to_string();
    }

    trimmed.chars().take(MAX_NAME_CHARS).collect()
}

/// Base filename (with extension) for a track under the given format.
#[must_use]
pub fn file_name(
    format: FileNamingFormat,
    title: &str,
    artist: &str,
    track_number: Option<u32>,
    extension: &str,
) -> String {
    let title = sanitize_filename(title);
    let artist = sanitize_filename(artist);

    let stem = match (format, track_number) {
        (FileNamingFormat::TitleOnly, _) => title,
        (FileNamingFormat::ArtistTitle, _) => format!("{artist} - {title}"),
        (FileNamingFormat::TitleArtist, _) => format!("{title} - {artist}"),
        (FileNamingFormat::TrackTitle, Some(n)) => format!("{n:02} - {title}"),
        (FileNamingFormat::TrackTitle, None) => title,
    };

    format!("{stem}.{extension}")
}

/// Directory name for an album batch; explicit albums get an ` (E)` suffix.
#[must_use]
pub fn album_directory_name(album_title: &str, explicit: bool) -> String {
    let name = sanitize_filename(album_title);
    if explicit {
        format!("{name} (E)")
    } else {
        name
    }
}

/// The `n`th collision candidate for a base name: `Track.flac` -> `Track (n).flac`.
#[must_use]
pub fn numbered_candidate(base_name: &str, n: u32) -> String {
    match base_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{base_name} ({n})"),
    }
}
