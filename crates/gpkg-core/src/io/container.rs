//! Outer container framing.
//!
//! [`ContainerWriter`] appends tar entries to any seekable sink. An entry
//! whose size is unknown up front is written as a placeholder header
//! ([`ContainerWriter::reserve_header`]), streamed, then patched in place
//! ([`ContainerWriter::finalize_header`]).
//!
//! [`ContainerIndex`] is the read side: a header-only scan that records
//! where every entry's data lives, so entries can be hashed or streamed
//! without extracting anything.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use gpkg_schema::TarFormat;
use serde::Serialize;
use tar::{EntryType, Header};

use crate::error::{GpkgError, Result};

/// Tar block size.
pub const BLOCK_SIZE: u64 = 512;

const NAME_FIELD_LEN: usize = 100;
const LONG_LINK_NAME: &[u8] = b"././@LongLink";

/// Location of one entry inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    /// Entry name.
    pub name: String,
    /// Offset of the entry's own header block.
    pub header_offset: u64,
    /// Offset of the first data byte.
    pub data_offset: u64,
    /// Stored data size in bytes.
    pub size: u64,
}

impl EntryInfo {
    /// Offset one past the last data byte, saturating for sizes no scan accepts.
    pub fn data_end(&self) -> u64 {
        self.data_offset.saturating_add(self.size)
    }
}

/// A header written with a placeholder size, awaiting
/// [`ContainerWriter::finalize_header`].
#[derive(Debug)]
pub struct ReservedHeader {
    name: String,
    header: Header,
    header_offset: u64,
    data_offset: u64,
}

impl ReservedHeader {
    /// Entry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Offset where the entry's data begins.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }
}

/// Appends tar entries to a seekable sink.
#[derive(Debug)]
pub struct ContainerWriter<W: Write + Seek> {
    inner: W,
    format: TarFormat,
    entries: Vec<EntryInfo>,
    aborted: bool,
}

impl<W: Write + Seek> ContainerWriter<W> {
    /// Start a container at the sink's current position.
    pub fn new(inner: W, format: TarFormat) -> Self {
        Self {
            inner,
            format,
            entries: Vec::new(),
            aborted: false,
        }
    }

    /// Header dialect used for every entry.
    pub fn format(&self) -> TarFormat {
        self.format
    }

    /// Entries written so far, in write order.
    pub fn entries(&self) -> &[EntryInfo] {
        &self.entries
    }

    /// Mark the container abandoned; [`finish`](Self::finish) will refuse to seal it.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Whether the container has been abandoned.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Write a placeholder header for `name`. Data written next belongs to this entry.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::InvalidInput`] if the name cannot be encoded in
    /// the container's dialect, or an I/O error.
    pub fn reserve_header(&mut self, name: &str) -> Result<ReservedHeader> {
        let header = self.entry_header(name, 0)?;
        let header_offset = self.inner.stream_position()?;
        self.inner.write_all(header.as_bytes())?;
        Ok(ReservedHeader {
            name: name.to_string(),
            header,
            header_offset,
            data_offset: header_offset + BLOCK_SIZE,
        })
    }

    /// Pad the entry to the block boundary and rewrite its header with the
    /// true size, measured from the stream position.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the sink.
    pub fn finalize_header(&mut self, reserved: ReservedHeader) -> Result<EntryInfo> {
        let ReservedHeader {
            name,
            mut header,
            header_offset,
            data_offset,
        } = reserved;

        let end = self.inner.stream_position()?;
        let size = end - data_offset;
        let pad = padding(size);
        if pad > 0 {
            self.inner.write_all(&vec![0u8; pad as usize])?;
        }
        let resume = end + pad;

        header.set_size(size);
        header.set_cksum();
        self.inner.seek(SeekFrom::Start(header_offset))?;
        self.inner.write_all(header.as_bytes())?;
        self.inner.seek(SeekFrom::Start(resume))?;

        let info = EntryInfo {
            name,
            header_offset,
            data_offset,
            size,
        };
        self.entries.push(info.clone());
        Ok(info)
    }

    pub(crate) fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data)?;
        Ok(())
    }

    /// Append an entry whose content is already in memory.
    ///
    /// # Errors
    ///
    /// See [`reserve_header`](Self::reserve_header).
    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<EntryInfo> {
        let reserved = self.reserve_header(name)?;
        self.inner.write_all(data)?;
        self.finalize_header(reserved)
    }

    /// Append exactly `size` bytes from `reader` as one entry, byte for byte.
    ///
    /// # Errors
    ///
    /// Returns an `UnexpectedEof` I/O error if the reader runs short.
    pub fn append_reader<R: Read>(&mut self, name: &str, size: u64, reader: R) -> Result<EntryInfo> {
        let reserved = self.reserve_header(name)?;
        let copied = io::copy(&mut reader.take(size), &mut self.inner)?;
        if copied != size {
            self.aborted = true;
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{name}: expected {size} bytes, copied {copied}"),
            )
            .into());
        }
        self.finalize_header(reserved)
    }

    /// Write the end-of-archive marker and hand back the sink.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::InvalidFormat`] if the container was aborted.
    pub fn finish(mut self) -> Result<W> {
        if self.aborted {
            return Err(GpkgError::InvalidFormat(
                "container was aborted before it was sealed".to_string(),
            ));
        }
        self.inner.write_all(&[0u8; 2 * BLOCK_SIZE as usize])?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn entry_header(&mut self, name: &str, size: u64) -> Result<Header> {
        let mut header = new_header(self.format);
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(now());
        header.set_size(size);

        if let Err(err) = header.set_path(name) {
            if self.format == TarFormat::Gnu && name.len() > NAME_FIELD_LEN {
                self.write_long_name(name)?;
                header.as_old_mut().name[..NAME_FIELD_LEN]
                    .copy_from_slice(&name.as_bytes()[..NAME_FIELD_LEN]);
            } else {
                return Err(GpkgError::InvalidInput(format!(
                    "entry name {name} does not fit a {} header: {err}",
                    self.format
                )));
            }
        }
        header.set_cksum();
        Ok(header)
    }

    fn write_long_name(&mut self, name: &str) -> Result<()> {
        let mut data = name.as_bytes().to_vec();
        data.push(0);

        let mut header = Header::new_gnu();
        header.as_old_mut().name[..LONG_LINK_NAME.len()].copy_from_slice(LONG_LINK_NAME);
        header.set_entry_type(EntryType::GNULongName);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_size(data.len() as u64);
        header.set_cksum();

        self.inner.write_all(header.as_bytes())?;
        self.inner.write_all(&data)?;
        let pad = padding(data.len() as u64);
        self.inner.write_all(&vec![0u8; pad as usize])?;
        Ok(())
    }
}

/// Fresh header in the given dialect. PAX is written as plain UStar.
pub(crate) fn new_header(format: TarFormat) -> Header {
    match format {
        TarFormat::Gnu => Header::new_gnu(),
        TarFormat::Ustar | TarFormat::Pax => Header::new_ustar(),
    }
}

/// Current time as a tar mtime.
pub(crate) fn now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

fn padding(size: u64) -> u64 {
    match size % BLOCK_SIZE {
        0 => 0,
        rem => BLOCK_SIZE - rem,
    }
}

/// Header-only listing of a container.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContainerIndex {
    format: Option<TarFormat>,
    entries: Vec<EntryInfo>,
    truncated: bool,
}

impl ContainerIndex {
    /// Scan a complete container.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::InvalidFormat`] if the stream is not a readable
    /// tar archive or an entry extends past the end of the stream.
    pub fn scan<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        Self::scan_inner(reader, false)
    }

    /// Scan the available prefix of a container.
    ///
    /// Scanning stops quietly at the first header or entry that runs past the
    /// prefix; that entry is still listed so its extent is known.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::InvalidFormat`] for a corrupt header inside the prefix.
    pub fn scan_prefix(prefix: &[u8]) -> Result<Self> {
        Self::scan_inner(&mut Cursor::new(prefix), true)
    }

    /// Scan the container at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`GpkgError::NotFound`] if the file does not exist, otherwise
    /// see [`scan`](Self::scan).
    pub fn scan_path(path: &Path) -> Result<Self> {
        let mut file = open_container(path)?;
        Self::scan(&mut file)
    }

    fn scan_inner<R: Read + Seek>(reader: &mut R, partial: bool) -> Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        let mut index = Self::default();

        if len >= BLOCK_SIZE {
            let mut first = [0u8; BLOCK_SIZE as usize];
            reader.seek(SeekFrom::Start(0))?;
            reader.read_exact(&mut first)?;
            index.format = TarFormat::detect(&first);
        }
        reader.seek(SeekFrom::Start(0))?;

        // Offset of the header that would follow the last listed entry.
        let mut next = 0u64;
        let failure = {
            let mut archive = tar::Archive::new(&mut *reader);
            let mut failure = None;
            for entry in archive.entries_with_seek().map_err(unreadable)? {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                };

                let header_offset = entry.raw_header_position();
                let data_offset = entry.raw_file_position();
                let size = entry.size();
                if !partial && size > len {
                    return Err(GpkgError::InvalidFormat(format!(
                        "entry at offset {header_offset} claims {size} bytes in a {len} byte container"
                    )));
                }
                let data_end = data_offset.checked_add(size).ok_or_else(size_overflow)?;
                next = data_end
                    .checked_add(padding(size))
                    .ok_or_else(size_overflow)?;

                if matches!(
                    entry.header().entry_type(),
                    EntryType::XGlobalHeader | EntryType::GNULongLink
                ) {
                    continue;
                }

                index.entries.push(EntryInfo {
                    name: utf8_name(entry.path_bytes().into_owned(), header_offset)?,
                    header_offset,
                    data_offset,
                    size,
                });

                if data_end > len {
                    if partial {
                        index.truncated = true;
                        break;
                    }
                    return Err(GpkgError::InvalidFormat(format!(
                        "entry at offset {header_offset} extends past end of file"
                    )));
                }
            }
            failure
        };

        match failure {
            // A header or extended record cut off by the end of the prefix.
            Some(_) if partial && reader.stream_position()? >= len => index.truncated = true,
            Some(err) => return Err(unreadable(err)),
            None if partial && next.saturating_add(BLOCK_SIZE) > len => index.truncated = true,
            None => {}
        }

        if index.entries.is_empty() && !index.truncated {
            return Err(GpkgError::InvalidFormat("empty archive".to_string()));
        }
        Ok(index)
    }

    /// Dialect detected from the first header, if recognizable.
    pub fn format(&self) -> Option<TarFormat> {
        self.format
    }

    /// Entries in container order.
    pub fn entries(&self) -> &[EntryInfo] {
        &self.entries
    }

    /// First entry named `name`.
    pub fn get(&self, name: &str) -> Option<&EntryInfo> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Whether an entry named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether a prefix scan stopped before the end of the archive.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Open a container file, mapping a missing file to [`GpkgError::NotFound`].
///
/// # Errors
///
/// Returns [`GpkgError::NotFound`] or another I/O error.
pub fn open_container(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            GpkgError::NotFound(path.display().to_string())
        } else {
            GpkgError::Io(e)
        }
    })
}

/// Reader over one entry's stored bytes.
///
/// # Errors
///
/// Returns an I/O error if the container cannot be opened or seeked.
pub fn entry_reader(path: &Path, entry: &EntryInfo) -> Result<io::Take<File>> {
    let mut file = open_container(path)?;
    file.seek(SeekFrom::Start(entry.data_offset))?;
    Ok(file.take(entry.size))
}

/// Read one entry's stored bytes into memory.
///
/// # Errors
///
/// See [`entry_reader`].
pub fn read_entry(path: &Path, entry: &EntryInfo) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    entry_reader(path, entry)?.read_to_end(&mut data)?;
    Ok(data)
}

fn utf8_name(bytes: Vec<u8>, offset: u64) -> Result<String> {
    String::from_utf8(bytes).map_err(|_| {
        GpkgError::InvalidFormat(format!("entry name at offset {offset} is not UTF-8"))
    })
}

fn unreadable(err: io::Error) -> GpkgError {
    GpkgError::InvalidFormat(format!("unreadable container: {err}"))
}

fn size_overflow() -> GpkgError {
    GpkgError::InvalidFormat("entry size overflows".to_string())
}
