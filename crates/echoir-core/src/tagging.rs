//! Metadata embedding for downloaded tracks.
//!
//! The catalog returns a loosely typed tag map; [`TrackTags::from_raw`] pulls
//! the known keys out of it so the rest of the pipeline works with typed
//! fields. [`AudioTagEmbedder`] writes them in the container's native format:
//! ID3v2.4 for MP3, Vorbis comments for FLAC and `ilst` atoms for MP4/M4A.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use id3::frame::{ExtendedText, Lyrics, Picture, PictureType};
use id3::{TagLike, Version};
use mp4ameta::{Data, FreeformIdent, Img};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::RawTags;
use crate::error::{FileSystemError, Result, TaggingError};

/// Keys consumed into typed fields; everything else lands in `extra`.
const KNOWN_KEYS: [&str; 13] = [
    "TITLE",
    "ARTIST",
    "ALBUM",
    "ALBUMARTIST",
    "TRACKNUMBER",
    "DISCNUMBER",
    "DATE",
    "YEAR",
    "GENRE",
    "COVER",
    "LYRICS",
    "ISRC",
    "COPYRIGHT",
];

/// Typed track tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTags {
    /// Track title.
    pub title: Option<String>,
    /// Track artist.
    pub artist: Option<String>,
    /// Album title.
    pub album: Option<String>,
    /// Album artist.
    pub album_artist: Option<String>,
    /// Position within the album.
    pub track_number: Option<u32>,
    /// Disc number.
    pub disc_number: Option<u32>,
    /// Release year.
    pub year: Option<i32>,
    /// Genre.
    pub genre: Option<String>,
    /// Cover art URL.
    pub cover_url: Option<String>,
    /// Unsynchronised lyrics.
    pub lyrics: Option<String>,
    /// International Standard Recording Code.
    pub isrc: Option<String>,
    /// Copyright notice.
    pub copyright: Option<String>,
    /// Unrecognised tags, written as user-defined text frames.
    pub extra: BTreeMap<String, String>,
}

impl TrackTags {
    /// Extract typed tags from a raw catalog map. Keys are matched
    /// case-insensitively; blank values are ignored.
    #[must_use]
    pub fn from_raw(raw: &RawTags) -> Self {
        let normalized: BTreeMap<String, String> = raw
            .iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| (k.to_ascii_uppercase(), v.trim().to_string()))
            .collect();
        let text = |key: &str| normalized.get(key).cloned();

        let year = normalized
            .get("DATE")
            .or_else(|| normalized.get("YEAR"))
            .and_then(|d| d.get(..4))
            .and_then(|y| y.parse().ok());

        let extra = normalized
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            title: text("TITLE"),
            artist: text("ARTIST"),
            album: text("ALBUM"),
            album_artist: text("ALBUMARTIST"),
            track_number: normalized.get("TRACKNUMBER").and_then(|v| leading_number(v)),
            disc_number: normalized.get("DISCNUMBER").and_then(|v| leading_number(v)),
            year,
            genre: text("GENRE"),
            cover_url: text("COVER"),
            lyrics: text("LYRICS"),
            isrc: text("ISRC"),
            copyright: text("COPYRIGHT"),
            extra,
        }
    }

    /// Fill missing title, artist and track number from request data.
    #[must_use]
    pub fn with_fallback(mut self, title: &str, artist: &str, track_number: Option<u32>) -> Self {
        if self.title.is_none() && !title.is_empty() {
            self.title = Some(title.to_string());
        }
        if self.artist.is_none() && !artist.is_empty() {
            self.artist = Some(artist.to_string());
        }
        if self.track_number.is_none() {
            self.track_number = track_number;
        }
        self
    }

    fn write_id3(&self, path: &Path, cover: Option<CoverArt>) -> std::result::Result<(), String> {
        let mut tag = id3::Tag::new();
        if let Some(title) = &self.title {
            tag.set_title(title.as_str());
        }
        if let Some(artist) = &self.artist {
            tag.set_artist(artist.as_str());
        }
        if let Some(album) = &self.album {
            tag.set_album(album.as_str());
        }
        if let Some(album_artist) = &self.album_artist {
            tag.set_album_artist(album_artist.as_str());
        }
        if let Some(track) = self.track_number {
            tag.set_track(track);
        }
        if let Some(disc) = self.disc_number {
            tag.set_disc(disc);
        }
        if let Some(year) = self.year {
            tag.set_year(year);
        }
        if let Some(genre) = &self.genre {
            tag.set_genre(genre.as_str());
        }
        if let Some(isrc) = &self.isrc {
            tag.set_text("TSRC", isrc.as_str());
        }
        if let Some(copyright) = &self.copyright {
            tag.set_text("TCOP", copyright.as_str());
        }
        if let Some(lyrics) = &self.lyrics {
            tag.add_frame(Lyrics {
                lang: "eng".to_string(),
                description: String::new(),
                text: lyrics.clone(),
            });
        }
        for (key, value) in &self.extra {
            tag.add_frame(ExtendedText {
                description: key.clone(),
                value: value.clone(),
            });
        }
        if let Some(cover) = cover {
            tag.add_frame(Picture {
                mime_type: cover.mime_type.to_string(),
                picture_type: PictureType::CoverFront,
                description: "Cover".to_string(),
                data: cover.data,
            });
        }
        tag.write_to_path(path, Version::Id3v24)
            .map_err(|e| e.to_string())
    }

    fn write_vorbis(&self, path: &Path, cover: Option<CoverArt>) -> std::result::Result<(), String> {
        let mut tag = metaflac::Tag::read_from_path(path).map_err(|e| e.to_string())?;
        let mut set = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                tag.set_vorbis(key, vec![value]);
            }
        };
        set("TITLE", self.title.clone());
        set("ARTIST", self.artist.clone());
        set("ALBUM", self.album.clone());
        set("ALBUMARTIST", self.album_artist.clone());
        set("TRACKNUMBER", self.track_number.map(|n| n.to_string()));
        set("DISCNUMBER", self.disc_number.map(|n| n.to_string()));
        set("DATE", self.year.map(|y| y.to_string()));
        set("GENRE", self.genre.clone());
        set("LYRICS", self.lyrics.clone());
        set("ISRC", self.isrc.clone());
        set("COPYRIGHT", self.copyright.clone());
        for (key, value) in &self.extra {
            set(key, Some(value.clone()));
        }
        if let Some(cover) = cover {
            tag.remove_picture_type(metaflac::block::PictureType::CoverFront);
            tag.add_picture(
                cover.mime_type,
                metaflac::block::PictureType::CoverFront,
                cover.data,
            );
        }
        tag.save().map_err(|e| e.to_string())
    }

    fn write_mp4(&self, path: &Path, cover: Option<CoverArt>) -> std::result::Result<(), String> {
        let mut tag = mp4ameta::Tag::read_from_path(path).map_err(|e| e.to_string())?;
        if let Some(title) = &self.title {
            tag.set_title(title.as_str());
        }
        if let Some(artist) = &self.artist {
            tag.set_artist(artist.as_str());
        }
        if let Some(album) = &self.album {
            tag.set_album(album.as_str());
        }
        if let Some(album_artist) = &self.album_artist {
            tag.set_album_artist(album_artist.as_str());
        }
        if let Some(track) = self.track_number.and_then(|n| u16::try_from(n).ok()) {
            tag.set_track_number(track);
        }
        if let Some(disc) = self.disc_number.and_then(|n| u16::try_from(n).ok()) {
            tag.set_disc_number(disc);
        }
        if let Some(year) = self.year {
            tag.set_year(year.to_string());
        }
        if let Some(genre) = &self.genre {
            tag.set_genre(genre.as_str());
        }
        if let Some(lyrics) = &self.lyrics {
            tag.set_lyrics(lyrics.as_str());
        }
        if let Some(copyright) = &self.copyright {
            tag.set_copyright(copyright.as_str());
        }
        let freeform = self
            .isrc
            .iter()
            .map(|isrc| ("ISRC", isrc))
            .chain(self.extra.iter().map(|(k, v)| (k.as_str(), v)));
        for (key, value) in freeform {
            tag.set_data(
                FreeformIdent::new("com.apple.iTunes", key),
                Data::Utf8(value.clone()),
            );
        }
        if let Some(cover) = cover {
            let artwork = if cover.mime_type == "image/png" {
                Img::png(cover.data)
            } else {
                Img::jpeg(cover.data)
            };
            tag.set_artwork(artwork);
        }
        tag.write_to_path(path).map_err(|e| e.to_string())
    }
}

/// Tag format native to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFormat {
    /// ID3v2.4, for MP3.
    Id3,
    /// Vorbis comments in FLAC metadata blocks.
    VorbisComment,
    /// iTunes-style `ilst` atoms, for MP4/M4A.
    Mp4,
}

impl TagFormat {
    /// Pick the tag format from the file extension.
    #[must_use]
    pub fn for_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mp3" => Some(Self::Id3),
            "flac" => Some(Self::VorbisComment),
            "m4a" | "mp4" | "m4b" => Some(Self::Mp4),
            _ => None,
        }
    }

    fn write(
        self,
        tags: &TrackTags,
        path: &Path,
        cover: Option<CoverArt>,
    ) -> std::result::Result<(), String> {
        match self {
            Self::Id3 => tags.write_id3(path, cover),
            Self::VorbisComment => tags.write_vorbis(path, cover),
            Self::Mp4 => tags.write_mp4(path, cover),
        }
    }
}

fn leading_number(value: &str) -> Option<u32> {
    value.split('/').next()?.trim().parse().ok()
}

/// Cover image bytes with a sniffed MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverArt {
    /// Image bytes.
    pub data: Vec<u8>,
    /// MIME type detected from the image header.
    pub mime_type: &'static str,
}

impl CoverArt {
    /// Wrap image bytes, detecting PNG and defaulting to JPEG.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mime_type = if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            "image/png"
        } else {
            "image/jpeg"
        };
        Self { data, mime_type }
    }
}

/// Writes tags into an audio file in place.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataEmbedder: Send + Sync {
    /// Embed `tags` (and optional cover art) into the file at `path`.
    ///
    /// On failure the file must be left as it was.
    async fn embed(&self, path: &Path, tags: &TrackTags, cover: Option<CoverArt>) -> Result<()>;
}

/// [`MetadataEmbedder`] choosing the tag format by file extension.
///
/// The tag is written to a sibling staging copy which replaces the original
/// only once the write succeeded.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioTagEmbedder;

impl AudioTagEmbedder {
    /// Create an embedder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn staging_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{name}.tagging"))
    }
}

#[async_trait]
impl MetadataEmbedder for AudioTagEmbedder {
    async fn embed(&self, path: &Path, tags: &TrackTags, cover: Option<CoverArt>) -> Result<()> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(FileSystemError::NotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let format = TagFormat::for_path(path).ok_or_else(|| TaggingError::UnsupportedContainer {
            path: path.to_path_buf(),
        })?;

        let staging = Self::staging_path(path);
        tokio::fs::copy(path, &staging)
            .await
            .map_err(|e| FileSystemError::WriteFailed {
                path: staging.clone(),
                reason: e.to_string(),
            })?;

        let tags = tags.clone();
        let target = staging.clone();
        let written =
            tokio::task::spawn_blocking(move || format.write(&tags, &target, cover)).await;

        let failure = match written {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(e) => Some(format!("tagging task failed: {e}")),
        };
        if let Some(reason) = failure {
            warn!(path = %path.display(), %reason, "Tag write failed");
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(TaggingError::WriteFailed {
                path: path.to_path_buf(),
                reason,
            }
            .into());
        }

        if let Err(e) = tokio::fs::rename(&staging, path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(TaggingError::WriteFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
            .into());
        }

        debug!(path = %path.display(), ?format, "Embedded metadata");
        Ok(())
    }
}
