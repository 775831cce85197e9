use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Length of the random part of an image id
const ID_SUFFIX_LEN: usize = 8;

/// Format the original upload was encoded in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Jpeg,
    Png,
    Gif,
}

impl SourceFormat {
    /// Parse a declared file extension (case-insensitive, optional leading dot)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }

    /// Canonical extension used in storage keys
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
        }
    }

    /// Transparency or animation would be lost when re-encoding
    pub fn prefers_original(self) -> bool {
        matches!(self, Self::Png | Self::Gif)
    }

    /// Animated formats skip conversion and orientation directories
    pub fn is_animated(self) -> bool {
        matches!(self, Self::Gif)
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
}

impl Orientation {
    /// Square images count as landscape
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        if width >= height {
            Self::Landscape
        } else {
            Self::Portrait
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Landscape => "landscape",
            Self::Portrait => "portrait",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "landscape" => Some(Self::Landscape),
            "portrait" => Some(Self::Portrait),
            _ => None,
        }
    }

    pub const ALL: [Orientation; 2] = [Orientation::Landscape, Orientation::Portrait];
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored encoding of an image: the upload itself or a derived format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rendition {
    Original,
    Webp,
    Avif,
}

impl Rendition {
    /// Formats produced by the conversion pipeline
    pub const DERIVED: [Rendition; 2] = [Rendition::Webp, Rendition::Avif];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Webp => "webp",
            Self::Avif => "avif",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "original" => Some(Self::Original),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            _ => None,
        }
    }

    /// Extension of a derived rendition; originals keep their source extension
    pub fn derived_extension(self) -> Option<&'static str> {
        match self {
            Self::Original => None,
            Self::Webp => Some("webp"),
            Self::Avif => Some("avif"),
        }
    }
}

impl fmt::Display for Rendition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one uploaded image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub original_format: SourceFormat,
    pub orientation: Orientation,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// `None` means the image never expires
    #[serde(default)]
    pub expiry_at: Option<DateTime<Utc>>,
    /// Storage key per rendition
    #[serde(default)]
    pub paths: BTreeMap<Rendition, String>,
    /// Byte size per rendition
    #[serde(default)]
    pub sizes: BTreeMap<Rendition, u64>,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_at.map_or(false, |at| at <= now)
    }

    pub fn path(&self, rendition: Rendition) -> Option<&str> {
        self.paths.get(&rendition).map(String::as_str)
    }

    pub fn has(&self, rendition: Rendition) -> bool {
        self.paths.contains_key(&rendition)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// AND over `required`, none of `excluded`
    pub fn matches_tags(&self, required: &[String], excluded: &[String]) -> bool {
        required.iter().all(|t| self.tags.contains(t))
            && !excluded.iter().any(|t| self.tags.contains(t))
    }

    /// Record a rendition's storage key and size
    pub fn attach(&mut self, rendition: Rendition, path: String, size: u64) {
        self.paths.insert(rendition, path);
        self.sizes.insert(rendition, size);
    }
}

/// A stored rendition produced after the record was created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedArtifact {
    pub rendition: Rendition,
    pub path: String,
    pub size: u64,
}

/// Generate an id of the form `yyyymmddHHMMSS-xxxxxxxx`
pub fn generate_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();

    format!("{}-{}", now.format("%Y%m%d%H%M%S"), suffix)
}

/// Trim, lower-case and deduplicate caller supplied tags
pub fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Normalized tag list for query filters
pub fn normalize_filter(tags: &[String]) -> Vec<String> {
    normalize_tags(tags).into_iter().collect()
}

/// Ids are embedded in storage keys, so only a conservative charset is accepted
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
