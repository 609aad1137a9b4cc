//! Classifier module for tagging source folders.
//!
//! Decides, per pre-scanned folder, whether it is junk to delete, a
//! content collection to preserve, a release to process, or an unknown mix
//! to leave alone. Rules are evaluated in a fixed order and the first
//! match wins: junk detection must precede preservation so a folder of
//! stray `.nfo` files is not rescued, and preservation must precede
//! release processing so a music release's cover-art folder is not
//! misread as a video release.

use crate::scan::FolderCensus;
use serde::{Deserialize, Serialize};
use unpackr_config::Config;

/// Classification tag for a source folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    /// Empty, or composed entirely of removable files. Deleted.
    Junk,
    /// A content collection (music, images, documents). Never touched.
    PreserveContent,
    /// Archives, parity files, or videos. Runs the full pipeline.
    ProcessRelease,
    /// Unknown mix or unreadable. Left alone.
    Skip,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Classification::Junk => "junk",
            Classification::PreserveContent => "preserve-content",
            Classification::ProcessRelease => "process-release",
            Classification::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// Tag one folder census. Pure and total; a folder that could not be
/// listed is always `Skip`.
pub fn classify(census: &FolderCensus, config: &Config) -> Classification {
    if census.unreadable {
        return Classification::Skip;
    }

    // Rule 1: empty folder
    if census.total_files == 0 && !census.has_subdirs {
        return Classification::Junk;
    }

    // Rule 2: nothing but removable junk
    if census.total_files > 0 && census.junk == census.total_files && !census.has_subdirs {
        return Classification::Junk;
    }

    // Rule 3: preservation thresholds
    let image_collection = census.images >= config.min_image_files
        && census.image_bytes >= config.min_image_folder_bytes;
    if census.music >= config.min_music_files
        || image_collection
        || census.documents >= config.min_documents
    {
        return Classification::PreserveContent;
    }

    // Rule 4: anything that looks like a release
    if census.archives > 0 || census.parity > 0 || census.videos > 0 {
        return Classification::ProcessRelease;
    }

    Classification::Skip
}
