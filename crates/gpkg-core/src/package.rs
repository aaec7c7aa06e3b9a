//! Binary package containers: build, update, extract, and metadata reads.
//!
//! A container is laid out as
//!
//! ```text
//! gpkg-1
//! <base>/metadata.tar[.ext]      (+ .sig)
//! <base>/image.tar[.ext]         (+ .sig)
//! Manifest                       (+ .sig)
//! ```
//!
//! Builds write into a temporary file next to the target and rename it into
//! place once the container is sealed.

use std::collections::BTreeMap;
use std::fs::{self, File, Permissions};
use std::io::{Read, Seek, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use gpkg_schema::{
    Compression, GPKG_VERSION, IMAGE_STEM, InnerEntryName, MANIFEST_NAME, METADATA_STEM,
    Manifest, ManifestRecord, TarFormat, signature_name,
};
use tar::EntryType;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{CodecCommand, GpkgConfig};
use crate::error::{GpkgError, Result};
use crate::format::{FormatChoice, scan_contents, scan_tree, select_formats};
use crate::image::{Contents, ImageWriter};
use crate::io::checksum::ChecksumSigner;
use crate::io::container::{ContainerIndex, ContainerWriter, EntryInfo, entry_reader};
use crate::io::stream_reader::EntryReader;
use crate::io::stream_writer::{EntryWriter, WrittenEntry};
use crate::verify::{ManifestVerifier, VerifyReport};

/// Metadata file name to contents.
pub type Metadata = BTreeMap<String, Vec<u8>>;

/// One container file on disk.
#[derive(Debug, Clone)]
pub struct BinaryPackage {
    path: PathBuf,
    base_name: Option<String>,
    config: GpkgConfig,
}

impl BinaryPackage {
    /// Bind to the container at `path`.
    ///
    /// `base_name` is the directory inner sub-archives live under; when
    /// `None`, reads accept any directory and builds write at the root.
    pub fn new(path: impl Into<PathBuf>, base_name: Option<String>, config: GpkgConfig) -> Self {
        Self {
            path: path.into(),
            base_name,
            config,
        }
    }

    /// Container path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Expected base name, if any.
    pub fn base_name(&self) -> Option<&str> {
        self.base_name.as_deref()
    }

    /// Resolved configuration.
    pub fn config(&self) -> &GpkgConfig {
        &self.config
    }

    /// Build a container from every path under `root`.
    ///
    /// # Errors
    ///
    /// Any codec, signing, or I/O failure aborts the build; nothing is left
    /// at the target path.
    pub fn compress(&self, root: &Path, metadata: &Metadata) -> Result<()> {
        let formats = select_formats(&scan_tree(root)?);
        self.build(formats, metadata, |image| image.append_tree(root))
    }

    /// Build a container from an explicit contents listing.
    ///
    /// Regular files for which `protect` returns true are stored as a
    /// placeholder instead of their live content.
    ///
    /// # Errors
    ///
    /// See [`compress`](Self::compress). A listed path outside `root` is
    /// [`GpkgError::InvalidInput`].
    pub fn compress_contents(
        &self,
        root: &Path,
        contents: &Contents,
        metadata: &Metadata,
        protect: &dyn Fn(&Path) -> bool,
    ) -> Result<()> {
        let formats = select_formats(&scan_contents(root, contents)?);
        self.build(formats, metadata, |image| {
            image.append_contents(root, contents, protect)
        })
    }

    /// Check the container against its Manifest.
    ///
    /// # Errors
    ///
    /// See [`ManifestVerifier::verify`].
    pub fn verify(&self, metadata_only: bool) -> Result<VerifyReport> {
        ManifestVerifier::new(&self.path, &self.config).verify(metadata_only)
    }

    /// Verify the whole container, then extract the image into `dest`.
    ///
    /// # Errors
    ///
    /// Verification errors, [`GpkgError::UnsupportedCodec`] when the
    /// image's decompressor is missing, or extraction failures.
    pub fn decompress(&self, dest: &Path) -> Result<VerifyReport> {
        let report = self.verify(false)?;
        let (entry, compression) = self.inner_entry(&report.index, IMAGE_STEM)?;
        self.unpack_entry(entry, compression, dest)?;
        info!(path = %self.path.display(), dest = %dest.display(), "Image extracted");
        Ok(report)
    }

    /// Read metadata files, optionally only the keys in `want`.
    ///
    /// Keys in `want` that the package does not carry are absent from the result.
    ///
    /// # Errors
    ///
    /// Metadata-only verification errors, or decoding failures.
    pub fn get_metadata(&self, want: Option<&[String]>) -> Result<Metadata> {
        let report = self.verify(true)?;
        let (entry, compression) = self.inner_entry(&report.index, METADATA_STEM)?;
        let codec = self.config.decompressor(compression)?;
        decode_metadata(entry_reader(&self.path, entry)?, codec, want)
    }

    /// Extract the metadata sub-archive into `dest`.
    ///
    /// # Errors
    ///
    /// See [`get_metadata`](Self::get_metadata).
    pub fn unpack_metadata(&self, dest: &Path) -> Result<()> {
        let report = self.verify(true)?;
        let (entry, compression) = self.inner_entry(&report.index, METADATA_STEM)?;
        self.unpack_entry(entry, compression, dest)
    }

    /// Replace the metadata, keeping the image entry and its signature
    /// byte for byte.
    ///
    /// # Errors
    ///
    /// [`GpkgError::NotFound`] if the container does not exist, metadata-only
    /// verification errors, or build failures.
    pub fn update_metadata(&self, metadata: &Metadata) -> Result<()> {
        if !self.path.is_file() {
            return Err(GpkgError::NotFound(self.path.display().to_string()));
        }
        let report = self.verify(true)?;

        let format = match report.index.format() {
            Some(TarFormat::Pax) => TarFormat::Gnu,
            Some(format) => format,
            None => {
                return Err(GpkgError::InvalidFormat(format!(
                    "cannot identify tar format of {}",
                    self.path.display()
                )));
            }
        };

        let (image, _) = self.inner_entry(&report.index, IMAGE_STEM)?;
        let image = image.clone();
        let image_record = report.manifest.get(&image.name).cloned().ok_or_else(|| {
            GpkgError::DigestMismatch(format!("{} is not recorded in {MANIFEST_NAME}", image.name))
        })?;
        let image_sig = report.index.get(&signature_name(&image.name)).cloned();

        let base = match &self.base_name {
            Some(base) => base.clone(),
            None => InnerEntryName::parse(&image.name)
                .map(|n| n.dir)
                .unwrap_or_default(),
        };

        self.write_atomically(format, |container| {
            let mut manifest = Manifest::new();
            container.append_bytes(GPKG_VERSION, b"")?;
            self.write_inner(container, &mut manifest, &base, METADATA_STEM, TarFormat::Ustar, |tar| {
                append_metadata(tar, metadata)
            })?;

            debug!(entry = %image.name, "Copying image entry");
            container.append_reader(&image.name, image.size, entry_reader(&self.path, &image)?)?;
            manifest.push(image_record)?;
            if let Some(sig) = &image_sig {
                container.append_reader(&sig.name, sig.size, entry_reader(&self.path, sig)?)?;
            }

            self.write_manifest(container, &manifest)
        })?;

        info!(path = %self.path.display(), "Metadata updated");
        Ok(())
    }

    fn build<F>(&self, formats: FormatChoice, metadata: &Metadata, fill_image: F) -> Result<()>
    where
        F: FnOnce(&mut ImageWriter<&mut dyn Write>) -> Result<()>,
    {
        debug!(container = %formats.container, image = %formats.image, "Selected tar formats");
        let base = self.base_name.clone().unwrap_or_default();

        self.write_atomically(formats.container, |container| {
            let mut manifest = Manifest::new();
            container.append_bytes(GPKG_VERSION, b"")?;
            self.write_inner(container, &mut manifest, &base, METADATA_STEM, TarFormat::Ustar, |tar| {
                append_metadata(tar, metadata)
            })?;
            self.write_inner(container, &mut manifest, &base, IMAGE_STEM, formats.image, fill_image)?;
            self.write_manifest(container, &manifest)
        })?;

        info!(path = %self.path.display(), signed = self.config.trust.create, "Container sealed");
        Ok(())
    }

    fn write_atomically<F>(&self, format: TarFormat, body: F) -> Result<()>
    where
        F: FnOnce(&mut ContainerWriter<&mut File>) -> Result<()>,
    {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.as_file().set_permissions(Permissions::from_mode(0o644))?;

        let mut container = ContainerWriter::new(tmp.as_file_mut(), format);
        body(&mut container)?;
        container.finish()?;

        tmp.persist(&self.path).map_err(|e| GpkgError::Io(e.error))?;
        Ok(())
    }

    /// Stream one sub-archive through the compressor and checksum sink, then
    /// record it and append its signature.
    fn write_inner<W, F>(
        &self,
        container: &mut ContainerWriter<W>,
        manifest: &mut Manifest,
        base: &str,
        stem: &str,
        format: TarFormat,
        fill: F,
    ) -> Result<()>
    where
        W: Write + Seek,
        F: FnOnce(&mut ImageWriter<&mut dyn Write>) -> Result<()>,
    {
        let name = InnerEntryName::compose(base, stem, self.config.compression);
        let codec = self.config.compressor()?;
        let checksum = ChecksumSigner::new(&self.config.checksums, self.config.sign_mode())?;

        let mut writer = EntryWriter::open(container, &name, codec, Some(checksum))?;
        let filled = {
            let mut tar = ImageWriter::new(&mut writer as &mut dyn Write, format);
            fill(&mut tar).and_then(|()| tar.finish().map(|_| ()))
        };
        if let Err(err) = filled {
            writer.kill();
            return Err(err);
        }
        let written = writer.close()?;
        record_entry(container, manifest, written)
    }

    fn write_manifest<W: Write + Seek>(
        &self,
        container: &mut ContainerWriter<W>,
        manifest: &Manifest,
    ) -> Result<()> {
        let text = manifest.to_text();
        container.append_bytes(MANIFEST_NAME, text.as_bytes())?;

        if self.config.trust.create {
            let mut signer = ChecksumSigner::new(&[], self.config.sign_mode())?;
            signer.update(text.as_bytes())?;
            let signature = signer.finish()?.signature.ok_or_else(|| {
                GpkgError::Signing(format!("no signature produced for {MANIFEST_NAME}"))
            })?;
            container.append_bytes(&signature_name(MANIFEST_NAME), &signature)?;
        }
        Ok(())
    }

    fn inner_entry<'i>(
        &self,
        index: &'i ContainerIndex,
        stem: &str,
    ) -> Result<(&'i EntryInfo, Option<Compression>)> {
        find_inner_entry(
            index,
            self.base_name.as_deref(),
            stem,
            self.config.allow_basename_mismatch,
        )
    }

    fn unpack_entry(
        &self,
        entry: &EntryInfo,
        compression: Option<Compression>,
        dest: &Path,
    ) -> Result<()> {
        fs::create_dir_all(dest)?;
        let codec = self.config.decompressor(compression)?;
        let mut reader = EntryReader::open(entry_reader(&self.path, entry)?, codec)?;

        let unpacked = {
            let mut archive = tar::Archive::new(&mut reader);
            archive.set_preserve_permissions(true);
            archive.set_overwrite(true);
            archive.unpack(dest)
        };
        if let Err(err) = unpacked {
            reader.kill();
            return Err(err.into());
        }
        reader.close()
    }
}

fn record_entry<W: Write + Seek>(
    container: &mut ContainerWriter<W>,
    manifest: &mut Manifest,
    written: WrittenEntry,
) -> Result<()> {
    let WrittenEntry {
        info,
        digests,
        signature,
    } = written;
    manifest.push(ManifestRecord::new(&info.name, info.size, digests))?;
    if let Some(signature) = signature {
        container.append_bytes(&signature_name(&info.name), &signature)?;
    }
    Ok(())
}

fn append_metadata(tar: &mut ImageWriter<&mut dyn Write>, metadata: &Metadata) -> Result<()> {
    for (name, data) in metadata {
        tar.append_file(name, data)?;
    }
    Ok(())
}

/// Locate the `stem` sub-archive.
///
/// An entry under `base_name` wins. With no base name any directory is
/// accepted. An entry under another directory is only accepted when
/// `allow_mismatch` is set, with a warning.
pub(crate) fn find_inner_entry<'i>(
    index: &'i ContainerIndex,
    base_name: Option<&str>,
    stem: &str,
    allow_mismatch: bool,
) -> Result<(&'i EntryInfo, Option<Compression>)> {
    let mut mismatched = None;

    for entry in index.entries() {
        let Some(parsed) = InnerEntryName::parse(&entry.name) else {
            continue;
        };
        if parsed.stem != stem {
            continue;
        }
        match base_name {
            None => return Ok((entry, parsed.compression)),
            Some(base) if parsed.dir == base => return Ok((entry, parsed.compression)),
            Some(_) => {
                mismatched.get_or_insert((entry, parsed.compression));
            }
        }
    }

    match mismatched {
        Some((entry, compression)) if allow_mismatch => {
            warn!(entry = %entry.name, expected = ?base_name, "Package base name mismatched, using fallback entry");
            Ok((entry, compression))
        }
        Some((entry, _)) => Err(GpkgError::InvalidFormat(format!(
            "{} does not match base name {}",
            entry.name,
            base_name.unwrap_or_default()
        ))),
        None => Err(GpkgError::NotFound(format!("{stem} sub-archive"))),
    }
}

/// Decode a stored metadata sub-archive into a map.
pub(crate) fn decode_metadata<R: Read + Send + 'static>(
    source: R,
    codec: CodecCommand,
    want: Option<&[String]>,
) -> Result<Metadata> {
    let mut reader = EntryReader::open(source, codec)?;
    let mut tar_bytes = Vec::new();
    if let Err(err) = reader.read_to_end(&mut tar_bytes) {
        reader.kill();
        return Err(err.into());
    }
    reader.close()?;

    let mut metadata = Metadata::new();
    let mut archive = tar::Archive::new(&tar_bytes[..]);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        if want.is_some_and(|keys| !keys.contains(&name)) {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        metadata.insert(name, data);
    }
    Ok(metadata)
}

/// Collect every regular file under `dir` as metadata, keyed by file name.
///
/// Files whose names are not valid UTF-8 are skipped.
///
/// # Errors
///
/// Returns an I/O error if the tree cannot be walked or a file read.
pub fn metadata_from_dir(dir: &Path) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| GpkgError::Io(std::io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            debug!(path = %entry.path().display(), "Skipping non-UTF-8 metadata file name");
            continue;
        };
        metadata.insert(name.to_string(), fs::read(entry.path())?);
    }
    Ok(metadata)
}
