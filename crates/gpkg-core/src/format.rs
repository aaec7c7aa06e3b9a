//! Pre-scan statistics and tar dialect selection.

use std::io;
use std::path::Path;

use gpkg_schema::TarFormat;
use serde::Serialize;
use walkdir::WalkDir;

use crate::error::{GpkgError, Result};
use crate::image::{ContentKind, Contents};

/// UStar stores sizes in 11 octal digits (just under 8 GiB); stay clear of it.
pub const HUGE_ARCHIVE_THRESHOLD: u64 = 8_000_000_000;

/// UStar's split name fields nominally hold 255 bytes, but the split must
/// fall on a `/`, so long paths are only reliable up to here.
pub const USTAR_PATH_MARGIN: usize = 200;

/// What the pre-scan learns about an image tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImageStats {
    /// Longest path, in bytes, relative to the image root.
    pub max_path_length: usize,
    /// Largest single file.
    pub max_file_size: u64,
    /// Sum of all file sizes.
    pub total_size: u64,
}

impl ImageStats {
    fn record_path(&mut self, rel: &Path) {
        self.max_path_length = self.max_path_length.max(rel.as_os_str().len());
    }

    fn record_file(&mut self, size: u64) {
        self.total_size += size;
        self.max_file_size = self.max_file_size.max(size);
    }
}

/// Dialects for the outer container and the inner image sub-archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatChoice {
    /// Outer container dialect.
    pub container: TarFormat,
    /// Image sub-archive dialect.
    pub image: TarFormat,
}

/// Pick dialects from pre-scan statistics.
pub fn select_formats(stats: &ImageStats) -> FormatChoice {
    let container = if stats.total_size < HUGE_ARCHIVE_THRESHOLD {
        TarFormat::Ustar
    } else {
        TarFormat::Gnu
    };

    let image = if stats.max_file_size >= HUGE_ARCHIVE_THRESHOLD
        || stats.max_path_length > USTAR_PATH_MARGIN
    {
        TarFormat::Gnu
    } else {
        TarFormat::Ustar
    };

    FormatChoice { container, image }
}

/// Scan a directory tree.
///
/// Sizes follow symlinks; a dangling symlink contributes only its path, as
/// do directories and symlinks to directories.
///
/// # Errors
///
/// Returns an I/O error if the tree cannot be walked.
pub fn scan_tree(root: &Path) -> Result<ImageStats> {
    let mut stats = ImageStats::default();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| GpkgError::Io(io::Error::other(e)))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| GpkgError::InvalidInput(entry.path().display().to_string()))?;
        stats.record_path(rel);

        if entry.file_type().is_dir() {
            continue;
        }
        match std::fs::metadata(entry.path()) {
            Ok(meta) if meta.is_dir() => {}
            Ok(meta) => stats.record_file(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound && entry.path_is_symlink() => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(stats)
}

/// Scan an explicit contents listing. Paths that no longer exist are skipped.
///
/// # Errors
///
/// Returns [`GpkgError::InvalidInput`] for a path outside `root`.
pub fn scan_contents(root: &Path, contents: &Contents) -> Result<ImageStats> {
    let mut stats = ImageStats::default();

    for (path, kind) in contents {
        let rel = path
            .strip_prefix(root)
            .map_err(|_| GpkgError::InvalidInput(format!("{} is outside {}", path.display(), root.display())))?;
        stats.record_path(rel);

        if *kind != ContentKind::Obj {
            continue;
        }
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => stats.record_file(meta.len()),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(stats)
}
