//! File naming rules for source videos and their derivatives.
//!
//! A derivative's identity is nothing more than its name: the optimized copy of
//! `clip.mp4` is `clip_optimized.mp4` in the same directory, and its thumbnail
//! is `clip.jpg` under the category's mirror in the thumbnail root.

use std::path::{Path, PathBuf};

/// Marker inserted before the extension of a fast-start remux.
pub const OPTIMIZED_MARKER: &str = "_optimized";
/// The only container the catalog lists.
pub const VIDEO_EXTENSION: &str = ".mp4";
pub const THUMBNAIL_EXTENSION: &str = ".jpg";

/// Splits `name` into `(stem, extension)` when it ends in `.mp4` (any case).
fn split_video_name(name: &str) -> Option<(&str, &str)> {
    let cut = name.len().checked_sub(VIDEO_EXTENSION.len())?;
    let ext = name.get(cut..)?;
    if !ext.eq_ignore_ascii_case(VIDEO_EXTENSION) {
        return None;
    }
    Some((&name[..cut], ext))
}

pub fn is_video_file(name: &str) -> bool {
    split_video_name(name).is_some_and(|(stem, _)| !stem.is_empty())
}

/// True when `name` already carries the optimization marker.
pub fn is_optimized_name(name: &str) -> bool {
    split_video_name(name).is_some_and(|(stem, _)| stem.ends_with(OPTIMIZED_MARKER))
}

/// Display title: extension and marker stripped. Also the dedup key shared by
/// a raw file and its optimized variant.
pub fn title_of(name: &str) -> &str {
    let stem = split_video_name(name).map_or(name, |(stem, _)| stem);
    stem.strip_suffix(OPTIMIZED_MARKER).unwrap_or(stem)
}

/// Name of the optimized variant of `name`. Returns `None` for names that are
/// not videos or are already optimized.
pub fn optimized_name(name: &str) -> Option<String> {
    let (stem, ext) = split_video_name(name)?;
    if stem.is_empty() || stem.ends_with(OPTIMIZED_MARKER) {
        return None;
    }
    Some(format!("{stem}{OPTIMIZED_MARKER}{ext}"))
}

/// Sibling path of `source` holding its optimized variant.
pub fn optimized_path(source: &Path) -> Option<PathBuf> {
    let name = source.file_name()?.to_str()?;
    Some(source.with_file_name(optimized_name(name)?))
}

pub fn thumbnail_name(video_name: &str) -> String {
    format!("{}{THUMBNAIL_EXTENSION}", title_of(video_name))
}

/// A single URL path segment that is safe to join onto a media root.
pub fn is_safe_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
        && !value.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_mp4_regardless_of_case() {
        assert!(is_video_file("trip.mp4"));
        assert!(is_video_file("TRIP.MP4"));
        assert!(!is_video_file("trip.mkv"));
        assert!(!is_video_file(".mp4"));
        assert!(!is_video_file("notes.txt"));
    }

    #[test]
    fn title_strips_extension_and_marker() {
        assert_eq!(title_of("trip.mp4"), "trip");
        assert_eq!(title_of("trip_optimized.mp4"), "trip");
        assert_eq!(title_of("Trip_optimized.MP4"), "Trip");
    }

    #[test]
    fn optimized_name_inserts_marker_before_extension() {
        assert_eq!(optimized_name("trip.mp4").as_deref(), Some("trip_optimized.mp4"));
        assert_eq!(optimized_name("trip.MP4").as_deref(), Some("trip_optimized.MP4"));
        assert_eq!(optimized_name("trip_optimized.mp4"), None);
        assert_eq!(optimized_name("trip.avi"), None);
    }

    #[test]
    fn optimized_path_stays_in_source_directory() {
        let path = optimized_path(Path::new("/videos/Viajes/trip.mp4")).unwrap();
        assert_eq!(path, PathBuf::from("/videos/Viajes/trip_optimized.mp4"));
    }

    #[test]
    fn thumbnail_name_uses_stripped_title() {
        assert_eq!(thumbnail_name("trip_optimized.mp4"), "trip.jpg");
        assert_eq!(thumbnail_name("trip.mp4"), "trip.jpg");
    }

    #[test]
    fn unsafe_segments_are_rejected() {
        assert!(is_safe_segment("Viajes 2024"));
        assert!(!is_safe_segment(""));
        assert!(!is_safe_segment(".."));
        assert!(!is_safe_segment("../etc"));
        assert!(!is_safe_segment("a/b"));
        assert!(!is_safe_segment("a\\b"));
    }
}
