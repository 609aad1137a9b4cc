//! Pre-scan module
//!
//! Builds one immutable `SourceFolder` census per top-level source folder
//! from a single non-recursive directory listing. The census feeds the
//! classifier and is never mutated afterwards; the pipeline re-checks the
//! actual filesystem immediately before any destructive action.

use crate::archive::{is_archive_file, is_parity_file};
use crate::classify::{classify, Classification};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use unpackr_config::Config;
use walkdir::WalkDir;

/// File counts and byte totals per extension class for one folder.
///
/// Counts are not mutually exclusive: a `.txt` file counts as both a
/// document and junk when both lists contain the extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderCensus {
    pub videos: usize,
    pub music: usize,
    pub images: usize,
    pub documents: usize,
    pub junk: usize,
    pub archives: usize,
    pub parity: usize,
    pub total_files: usize,
    pub video_bytes: u64,
    pub music_bytes: u64,
    pub image_bytes: u64,
    pub document_bytes: u64,
    pub archive_bytes: u64,
    pub parity_bytes: u64,
    pub has_subdirs: bool,
    pub unreadable: bool,
}

/// A source folder discovered by the pre-scan, consumed once by the
/// pipeline.
#[derive(Debug, Clone)]
pub struct SourceFolder {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub census: FolderCensus,
    pub classification: Classification,
}

/// Census one folder from a single non-recursive listing.
pub fn census_folder(folder: &Path, config: &Config) -> FolderCensus {
    let mut census = FolderCensus::default();

    let entries = match std::fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(_) => {
            census.unreadable = true;
            return census;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Ok(metadata) = std::fs::symlink_metadata(&path) else {
            continue;
        };

        if metadata.is_dir() {
            census.has_subdirs = true;
            continue;
        }
        if !metadata.is_file() {
            // Symlinks and other special entries are not counted; the
            // cleanup eligibility check still sees them.
            continue;
        }

        let bytes = metadata.len();
        census.total_files += 1;

        if is_parity_file(&path) {
            census.parity += 1;
            census.parity_bytes += bytes;
            continue;
        }
        if is_archive_file(&path, config) {
            census.archives += 1;
            census.archive_bytes += bytes;
            continue;
        }

        if config.is_video(&path) {
            census.videos += 1;
            census.video_bytes += bytes;
        }
        if config.is_music(&path) {
            census.music += 1;
            census.music_bytes += bytes;
        }
        if config.is_image(&path) {
            census.images += 1;
            census.image_bytes += bytes;
        }
        if config.is_document(&path) {
            census.documents += 1;
            census.document_bytes += bytes;
        }
        if config.is_removable(&path) {
            census.junk += 1;
        }
    }

    census
}

/// Scan the source root and produce one classified `SourceFolder` per
/// top-level directory. Files directly in the root are left alone.
pub fn scan_source(root: &Path, config: &Config) -> io::Result<Vec<SourceFolder>> {
    let mut folders = Vec::new();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();

        let Ok(metadata) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if metadata.is_symlink() {
            // Pre-existing symlinks in the source tree are not followed.
            folders.push(SourceFolder {
                path,
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                census: FolderCensus {
                    unreadable: true,
                    ..FolderCensus::default()
                },
                classification: Classification::Skip,
            });
            continue;
        }
        if !metadata.is_dir() {
            continue;
        }

        let census = census_folder(&path, config);
        if census.unreadable {
            tracing::warn!(
                folder = %crate::audit::folder_id(&path),
                "folder could not be listed; skipping"
            );
        }
        let classification = classify(&census, config);
        folders.push(SourceFolder {
            path,
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            census,
            classification,
        });
    }

    folders.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(folders)
}

/// Recursively find video files under a folder, in lexicographic order.
pub fn find_videos(folder: &Path, config: &Config) -> Vec<PathBuf> {
    walk_files(folder)
        .into_iter()
        .filter(|p| config.is_video(p))
        .collect()
}

/// Recursively find archive files with sizes, in lexicographic order.
pub fn find_archive_files(folder: &Path, config: &Config) -> Vec<(PathBuf, u64)> {
    walk_files(folder)
        .into_iter()
        .filter(|p| is_archive_file(p, config))
        .map(|p| {
            let bytes = std::fs::metadata(&p).map(|m| m.len()).unwrap_or(0);
            (p, bytes)
        })
        .collect()
}

/// Parity files directly in a folder, with sizes, in lexicographic order.
/// Parity sets are folder-granular.
pub fn find_parity_files(folder: &Path) -> Vec<(PathBuf, u64)> {
    let mut files: Vec<(PathBuf, u64)> = std::fs::read_dir(folder)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_parity_file(p))
                .map(|p| {
                    let bytes = std::fs::metadata(&p).map(|m| m.len()).unwrap_or(0);
                    (p, bytes)
                })
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

/// All regular files under a folder, in lexicographic order. Symlinks are
/// not followed.
pub fn walk_files(folder: &Path) -> Vec<PathBuf> {
    WalkDir::new(folder)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}
