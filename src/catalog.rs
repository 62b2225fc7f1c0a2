//! Directory-backed catalog: categories are the immediate subdirectories of
//! the videos root and videos are the `.mp4` files inside them. Nothing is
//! indexed; every call reads the filesystem fresh.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::naming::{is_optimized_name, is_safe_segment, is_video_file, title_of};

/// One logical video of a category, already resolved to the file that should
/// be played (the optimized variant when it exists).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogVideo {
    pub category: String,
    pub title: String,
    pub file_name: String,
    pub path: PathBuf,
    /// Modification time of the raw source in milliseconds since the epoch.
    pub modified_ms: u64,
}

#[derive(Debug)]
struct FoundFile {
    name: String,
    path: PathBuf,
    modified_ms: u64,
}

#[derive(Debug, Default)]
struct Variants {
    raw: Option<FoundFile>,
    optimized: Option<FoundFile>,
}

/// Immediate subdirectories of `root`, sorted case-insensitively. A missing
/// root is an empty catalog.
pub fn list_categories(root: &Path) -> Vec<String> {
    let mut categories: Vec<String> = immediate_entries(root)
        .filter(|entry| entry.file_type().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_owned))
        .collect();

    categories.sort_by(|a, b| {
        a.to_lowercase()
            .cmp(&b.to_lowercase())
            .then_with(|| a.cmp(b))
    });
    categories
}

/// Videos of `category`, newest first, one entry per logical video.
pub fn list_videos(root: &Path, category: &str) -> Vec<CatalogVideo> {
    if !is_safe_segment(category) {
        debug!(category, "rejecting unsafe category name");
        return Vec::new();
    }
    let dir = root.join(category);
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "category directory not found");
        return Vec::new();
    }

    let mut grouped: HashMap<String, Variants> = HashMap::new();
    for entry in immediate_entries(&dir) {
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !is_video_file(name) {
            continue;
        }
        // Follows symlinks, unlike the walkdir entry's own metadata.
        let metadata = match fs::metadata(entry.path()) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(err) => {
                warn!(path = %entry.path().display(), %err, "skipping unreadable video");
                continue;
            }
        };
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |elapsed| elapsed.as_millis() as u64);

        let found = FoundFile {
            name: name.to_owned(),
            path: entry.path().to_path_buf(),
            modified_ms,
        };
        let slot = grouped.entry(title_of(name).to_owned()).or_default();
        if is_optimized_name(name) {
            slot.optimized = Some(found);
        } else {
            slot.raw = Some(found);
        }
    }

    let mut videos: Vec<CatalogVideo> = grouped
        .into_iter()
        .filter_map(|(title, variants)| {
            let modified_ms = variants
                .raw
                .as_ref()
                .or(variants.optimized.as_ref())?
                .modified_ms;
            let chosen = variants.optimized.or(variants.raw)?;
            Some(CatalogVideo {
                category: category.to_owned(),
                title,
                file_name: chosen.name,
                path: chosen.path,
                modified_ms,
            })
        })
        .collect();

    sort_newest_first(&mut videos);
    videos
}

/// Orders videos by modification time, newest first. Ties fall back to the
/// title so listings are stable between calls.
pub fn sort_newest_first(videos: &mut [CatalogVideo]) {
    videos.sort_by(|a, b| {
        b.modified_ms
            .cmp(&a.modified_ms)
            .then_with(|| a.title.cmp(&b.title))
    });
}

fn immediate_entries(dir: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                debug!(%err, "skipping catalog entry");
                None
            }
        })
}
