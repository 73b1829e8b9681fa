//! Quality tiers offered by the catalog.
//!
//! Each tier maps to the selector sent to the catalog API and to the file
//! extension used when the manifest codec is not recognised.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Spatial audio codec family for the Dolby Atmos tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpatialCodec {
    /// Legacy multichannel E-AC-3.
    Eac3,
    /// Newer, more efficient AC-4.
    Ac4,
}

impl SpatialCodec {
    /// Codec name sent to the catalog API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eac3 => "eac3",
            Self::Ac4 => "ac4",
        }
    }
}

/// A named combination of codec, bitrate and channel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QualityProfile {
    /// Up to 24-bit/192 kHz FLAC.
    HiResLossless,
    /// 16-bit/44.1 kHz FLAC.
    #[default]
    Lossless,
    /// AAC 320 kbps.
    High,
    /// AAC 96 kbps.
    Low,
    /// Dolby Atmos delivered as E-AC-3.
    DolbyAtmosAc3,
    /// Dolby Atmos delivered as AC-4.
    DolbyAtmosAc4,
}

impl QualityProfile {
    /// Every tier, best fidelity first.
    pub const ALL: [Self; 6] = [
        Self::HiResLossless,
        Self::Lossless,
        Self::High,
        Self::Low,
        Self::DolbyAtmosAc3,
        Self::DolbyAtmosAc4,
    ];

    /// Selector string understood by the catalog API.
    #[must_use]
    pub const fn api_selector(self) -> &'static str {
        match self {
            Self::HiResLossless => "HI_RES_LOSSLESS",
            Self::Lossless => "LOSSLESS",
            Self::High => "HIGH",
            Self::Low => "LOW",
            Self::DolbyAtmosAc3 | Self::DolbyAtmosAc4 => "DOLBY_ATMOS",
        }
    }

    /// Spatial codec requested alongside the selector, for Atmos tiers.
    #[must_use]
    pub const fn spatial_codec(self) -> Option<SpatialCodec> {
        match self {
            Self::DolbyAtmosAc3 => Some(SpatialCodec::Eac3),
            Self::DolbyAtmosAc4 => Some(SpatialCodec::Ac4),
            _ => None,
        }
    }

    /// Whether the tier delivers lossless audio.
    #[must_use]
    pub const fn is_lossless(self) -> bool {
        matches!(self, Self::HiResLossless | Self::Lossless)
    }

    /// Whether the tier is a spatial (Atmos) variant.
    #[must_use]
    pub const fn is_spatial(self) -> bool {
        self.spatial_codec().is_some()
    }

    /// Extension used when the manifest codec is unknown.
    #[must_use]
    pub const fn fallback_extension(self) -> &'static str {
        if self.is_lossless() { "flac" } else { "m4a" }
    }

    /// Stable name used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HiResLossless => "hi_res_lossless",
            Self::Lossless => "lossless",
            Self::High => "high",
            Self::Low => "low",
            Self::DolbyAtmosAc3 => "dolby_atmos_ac3",
            Self::DolbyAtmosAc4 => "dolby_atmos_ac4",
        }
    }
}

impl fmt::Display for QualityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HiResLossless => write!(f, "Hi-Res Lossless (FLAC 24-bit)"),
            Self::Lossless => write!(f, "Lossless (FLAC 16-bit)"),
            Self::High => write!(f, "High (AAC 320 kbps)"),
            Self::Low => write!(f, "Low (AAC 96 kbps)"),
            Self::DolbyAtmosAc3 => write!(f, "Dolby Atmos (E-AC-3)"),
            Self::DolbyAtmosAc4 => write!(f, "Dolby Atmos (AC-4)"),
        }
    }
}

impl FromStr for QualityProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("Unknown quality profile: {s}")))
    }
}

/// File extension for a manifest codec string.
///
/// Codec strings come from the catalog as either plain names (`flac`, `eac3`)
/// or RFC 6381 tags (`mp4a.40.2`).
#[must_use]
pub fn extension_for_codec(codec: &str, quality: QualityProfile) -> &'static str {
    let codec = codec.trim().to_ascii_lowercase();
    match codec.as_str() {
        "flac" => "flac",
        "mp3" => "mp3",
        "alac" => "m4a",
        c if c.starts_with("mp4a") || c == "aac" => "m4a",
        "eac3" | "ec-3" | "ac3" | "ac-3" | "ac4" | "ac-4" => "m4a",
        _ => quality.fallback_extension(),
    }
}
