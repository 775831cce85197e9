//! Storage key layout shared by every blob backend.
//!
//! ```text
//! original/{landscape,portrait}/<id>.<ext>
//! {landscape,portrait}/webp/<id>.webp
//! {landscape,portrait}/avif/<id>.avif
//! gif/<id>.gif
//! metadata/<id>.json
//! ```

use crate::model::{Orientation, Rendition, SourceFormat};

pub const ORIGINAL_PREFIX: &str = "original";
pub const GIF_PREFIX: &str = "gif";
pub const METADATA_PREFIX: &str = "metadata";

/// Key of an uploaded original
pub fn original_key(id: &str, format: SourceFormat, orientation: Orientation) -> String {
    if format.is_animated() {
        format!("{GIF_PREFIX}/{id}.{}", format.extension())
    } else {
        format!("{ORIGINAL_PREFIX}/{orientation}/{id}.{}", format.extension())
    }
}

/// Key of a derived rendition, `None` for [`Rendition::Original`]
pub fn derived_key(id: &str, rendition: Rendition, orientation: Orientation) -> Option<String> {
    let ext = rendition.derived_extension()?;
    Some(format!("{orientation}/{rendition}/{id}.{ext}"))
}

/// Prefix listing every static original of one orientation
pub fn original_prefix(orientation: Orientation) -> String {
    format!("{ORIGINAL_PREFIX}/{orientation}/")
}

pub fn metadata_key(id: &str) -> String {
    format!("{METADATA_PREFIX}/{id}.json")
}

/// Every key an image with this id could occupy, regardless of recorded paths
pub fn candidate_keys(id: &str) -> Vec<String> {
    let mut keys = Vec::new();
    for orientation in Orientation::ALL {
        for format in [SourceFormat::Jpeg, SourceFormat::Png] {
            keys.push(original_key(id, format, orientation));
        }
        for rendition in Rendition::DERIVED {
            if let Some(key) = derived_key(id, rendition, orientation) {
                keys.push(key);
            }
        }
    }
    keys.push(original_key(id, SourceFormat::Gif, Orientation::Landscape));
    keys
}

/// Extract `<id>` from `<prefix>/<id>.<ext>`
pub fn id_from_key(key: &str) -> Option<&str> {
    let file = key.rsplit('/').next()?;
    let (stem, _ext) = file.rsplit_once('.')?;
    if stem.is_empty() {
        None
    } else {
        Some(stem)
    }
}

/// Content type from a key's extension
pub fn content_type_for(key: &str) -> &'static str {
    let ext = key.rsplit_once('.').map(|(_, e)| e).unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
