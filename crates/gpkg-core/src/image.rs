//! Image sub-archive builders.
//!
//! Two sources: a full directory walk, or an explicit contents listing where
//! protected files are replaced by a placeholder and a directory that has
//! since been replaced by a symlink is recorded as the real directory.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use gpkg_schema::TarFormat;
use serde::{Deserialize, Serialize};
use tar::{Builder, EntryType, HeaderMode};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{GpkgError, Result};
use crate::io::container::{new_header, now};

/// Payload stored in place of a protected (configuration) file.
pub const PROTECT_PLACEHOLDER: &[u8] =
    b"# empty file because --include-config=n when `quickpkg` was used\n";

/// Kind of a path in a contents listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// Regular file.
    Obj,
    /// Directory.
    Dir,
    /// Symbolic link.
    Sym,
    /// Named pipe.
    Fif,
    /// Device node.
    Dev,
}

/// Absolute path to kind, iterated in sorted order.
pub type Contents = BTreeMap<PathBuf, ContentKind>;

/// Parse a `CONTENTS`-style listing. Paths are absolute within `root`.
///
/// ```text
/// dir /usr/bin
/// obj /usr/bin/tool 0123abcd 1700000000
/// sym /usr/bin/alias -> tool 1700000000
/// ```
///
/// # Errors
///
/// Returns [`GpkgError::InvalidInput`] for an unknown line type or a
/// malformed line.
pub fn parse_contents(text: &str, root: &Path) -> Result<Contents> {
    let mut contents = Contents::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let bad = || GpkgError::InvalidInput(format!("CONTENTS line {}: {line}", idx + 1));
        let (kind, rest) = line.split_once(' ').ok_or_else(bad)?;

        let (kind, path) = match kind {
            // obj <path> <md5> <mtime>
            "obj" => {
                let mut fields = rest.rsplitn(3, ' ');
                let (_mtime, _md5, path) = (fields.next(), fields.next(), fields.next());
                (ContentKind::Obj, path.ok_or_else(bad)?)
            }
            // sym <path> -> <target> <mtime>
            "sym" => {
                let (path, _) = rest.split_once(" -> ").ok_or_else(bad)?;
                (ContentKind::Sym, path)
            }
            "dir" => (ContentKind::Dir, rest),
            "fif" => (ContentKind::Fif, rest),
            "dev" => (ContentKind::Dev, rest),
            _ => return Err(bad()),
        };

        contents.insert(root.join(path.trim_start_matches('/')), kind);
    }

    Ok(contents)
}

/// Writes image entries, remembering inodes for hard-link detection.
pub(crate) struct ImageWriter<W: Write> {
    builder: Builder<W>,
    format: TarFormat,
    inodes: HashMap<(u64, u64), PathBuf>,
}

impl<W: Write> ImageWriter<W> {
    pub(crate) fn new(inner: W, format: TarFormat) -> Self {
        let mut builder = Builder::new(inner);
        builder.mode(HeaderMode::Complete);
        Self {
            builder,
            format,
            inodes: HashMap::new(),
        }
    }

    /// Write the end-of-archive marker and return the sink.
    pub(crate) fn finish(self) -> Result<W> {
        Ok(self.builder.into_inner()?)
    }

    /// Add an in-memory regular file, as used for metadata values.
    pub(crate) fn append_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let mut header = new_header(self.format);
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(now());
        header.set_size(data.len() as u64);
        self.builder.append_data(&mut header, name, data)?;
        Ok(())
    }

    /// Add every path under `root`, sorted by name.
    pub(crate) fn append_tree(&mut self, root: &Path) -> Result<()> {
        for entry in WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| GpkgError::Io(io::Error::other(e)))?;
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| GpkgError::InvalidInput(entry.path().display().to_string()))?;
            let meta = fs::symlink_metadata(entry.path())?;
            self.append_path(rel, entry.path(), &meta, false)?;
        }
        Ok(())
    }

    /// Add only the listed paths. Paths that no longer exist are skipped.
    pub(crate) fn append_contents(
        &mut self,
        root: &Path,
        contents: &Contents,
        protect: &dyn Fn(&Path) -> bool,
    ) -> Result<()> {
        for (path, kind) in contents {
            let rel = path.strip_prefix(root).map_err(|_| {
                GpkgError::InvalidInput(format!("{} is outside {}", path.display(), root.display()))
            })?;

            let mut meta = match fs::symlink_metadata(path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let mut live = path.clone();
            if *kind == ContentKind::Dir && !meta.is_dir() && path.is_dir() {
                // Recorded as a directory but now a symlink to one on the live
                // filesystem. Archive the real directory so children extract.
                live = fs::canonicalize(path)?;
                meta = fs::symlink_metadata(&live)?;
            }

            let protected = meta.is_file() && protect(path);
            self.append_path(rel, &live, &meta, protected)?;
        }
        Ok(())
    }

    fn append_path(&mut self, rel: &Path, live: &Path, meta: &Metadata, protected: bool) -> Result<()> {
        let mut header = new_header(self.format);
        header.set_metadata_in_mode(meta, HeaderMode::Complete);
        let file_type = meta.file_type();

        if file_type.is_file() {
            let inode = (meta.dev(), meta.ino());
            if meta.nlink() > 1 {
                if let Some(first) = self.inodes.get(&inode) {
                    if first != rel {
                        header.set_entry_type(EntryType::Link);
                        header.set_size(0);
                        let first = first.clone();
                        self.builder.append_link(&mut header, rel, first)?;
                        return Ok(());
                    }
                }
                self.inodes.insert(inode, rel.to_path_buf());
            }

            if protected {
                debug!(path = %rel.display(), "Storing placeholder for protected file");
                header.set_size(PROTECT_PLACEHOLDER.len() as u64);
                self.builder.append_data(&mut header, rel, PROTECT_PLACEHOLDER)?;
            } else {
                let file = File::open(live)?;
                self.builder
                    .append_data(&mut header, rel, file.take(meta.len()))?;
            }
        } else if file_type.is_dir() {
            header.set_size(0);
            self.builder.append_data(&mut header, rel, io::empty())?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(live)?;
            header.set_size(0);
            self.builder.append_link(&mut header, rel, target)?;
        } else {
            warn!(path = %live.display(), "Skipping special file");
        }
        Ok(())
    }
}
