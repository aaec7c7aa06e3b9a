//! Tar dialects, compression codecs and inner entry names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tar dialect of the outer container or an inner sub-archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TarFormat {
    /// POSIX UStar: 8 GiB per-file limit, 255-byte split paths.
    Ustar,
    /// GNU tar: base-256 sizes and `././@LongLink` names.
    Gnu,
    /// POSIX pax (UStar with extended headers). Only ever detected, never written.
    Pax,
}

impl TarFormat {
    /// Identify the dialect from the first 512-byte header block.
    ///
    /// Returns `None` when the block carries no recognizable tar magic.
    pub fn detect(header: &[u8]) -> Option<Self> {
        let magic = header.get(0x101..0x109)?;
        let typeflag = *header.get(0x9c)?;

        if magic == b"ustar  \0" {
            Some(Self::Gnu)
        } else if magic == b"ustar\x0000" {
            if typeflag == b'x' || typeflag == b'g' {
                Some(Self::Pax)
            } else {
                Some(Self::Ustar)
            }
        } else {
            None
        }
    }
}

impl fmt::Display for TarFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ustar => "ustar",
            Self::Gnu => "gnu",
            Self::Pax => "pax",
        })
    }
}

/// Compression codecs with a fixed external program and entry-name extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// `gzip`, `.gz`
    Gzip,
    /// `bzip2`, `.bz2`
    Bzip2,
    /// `lz4`, `.lz4`
    Lz4,
    /// `lzip`, `.lz`
    Lzip,
    /// `lzop`, `.lzo`
    Lzop,
    /// `xz`, `.xz`
    Xz,
    /// `zstd`, `.zst`
    Zstd,
}

impl Compression {
    /// Every supported codec.
    pub const ALL: [Self; 7] = [
        Self::Gzip,
        Self::Bzip2,
        Self::Lz4,
        Self::Lzip,
        Self::Lzop,
        Self::Xz,
        Self::Zstd,
    ];

    /// Settings spelling (e.g. `zstd`).
    pub fn name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Lz4 => "lz4",
            Self::Lzip => "lzip",
            Self::Lzop => "lzop",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }

    /// Extension appended after `.tar` in entry names (e.g. `.zst`).
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Lz4 => ".lz4",
            Self::Lzip => ".lz",
            Self::Lzop => ".lzo",
            Self::Xz => ".xz",
            Self::Zstd => ".zst",
        }
    }

    /// Name of the external program implementing the codec.
    pub fn binary(self) -> &'static str {
        self.name()
    }

    /// Level used when none is configured.
    pub fn default_level(self) -> u32 {
        match self {
            Self::Zstd => 3,
            _ => 9,
        }
    }

    /// Arguments (after the binary) for compressing stdin to stdout.
    pub fn compress_args(self, level: u32) -> Vec<String> {
        let mut args = Vec::new();
        if self == Self::Zstd {
            args.push("-q".to_string());
        }
        args.push("-c".to_string());
        args.push(format!("-{level}"));
        args
    }

    /// Arguments (after the binary) for decompressing stdin to stdout.
    pub fn decompress_args(self) -> Vec<String> {
        let mut args = Vec::new();
        if self == Self::Zstd {
            args.push("-q".to_string());
        }
        args.push("-d".to_string());
        args.push("-c".to_string());
        args
    }

    /// Codec whose extension is `ext` (with leading dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.extension() == ext)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned for a codec name outside the fixed table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported compression method: {0}")]
pub struct UnknownCompression(pub String);

impl FromStr for Compression {
    type Err = UnknownCompression;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| UnknownCompression(s.to_string()))
    }
}

/// A parsed `<dir>/<stem>.tar[.<ext>]` inner sub-archive entry name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerEntryName {
    /// Directory part (the package base name), empty at the container root.
    pub dir: String,
    /// Sub-archive kind, e.g. `metadata` or `image`.
    pub stem: String,
    /// Codec implied by the extension, `None` for a plain `.tar`.
    pub compression: Option<Compression>,
}

impl InnerEntryName {
    /// Compose the entry name for a sub-archive.
    pub fn compose(base_name: &str, stem: &str, compression: Option<Compression>) -> String {
        let ext = compression.map_or("", Compression::extension);
        if base_name.is_empty() {
            format!("{stem}.tar{ext}")
        } else {
            format!("{base_name}/{stem}.tar{ext}")
        }
    }

    /// Split an entry name; `None` unless it ends in `.tar` or a known
    /// `.tar.<ext>`.
    pub fn parse(name: &str) -> Option<Self> {
        let (dir, file) = match name.rfind('/') {
            Some(idx) => (&name[..idx], &name[idx + 1..]),
            None => ("", name),
        };

        if let Some(stem) = file.strip_suffix(".tar") {
            return Some(Self {
                dir: dir.to_string(),
                stem: stem.to_string(),
                compression: None,
            });
        }

        let tar_at = file.rfind(".tar.")?;
        let compression = Compression::from_extension(&file[tar_at + 4..])?;
        Some(Self {
            dir: dir.to_string(),
            stem: file[..tar_at].to_string(),
            compression: Some(compression),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_levels() {
        for codec in Compression::ALL {
            let expected = if codec == Compression::Zstd { 3 } else { 9 };
            assert_eq!(codec.default_level(), expected, "{codec}");
        }
    }

    fn block_with(magic: &[u8], typeflag: u8) -> Vec<u8> {
        let mut block = vec![0u8; 512];
        block[0x101..0x101 + magic.len()].copy_from_slice(magic);
        block[0x9c] = typeflag;
        block
    }

    #[test]
    fn detects_tar_dialects() {
        assert_eq!(TarFormat::detect(&block_with(b"ustar  \0", b'0')), Some(TarFormat::Gnu));
        assert_eq!(TarFormat::detect(&block_with(b"ustar\x0000", b'0')), Some(TarFormat::Ustar));
        assert_eq!(TarFormat::detect(&block_with(b"ustar\x0000", b'x')), Some(TarFormat::Pax));
        assert_eq!(TarFormat::detect(&block_with(b"garbage!", b'0')), None);
        assert_eq!(TarFormat::detect(&[0u8; 10]), None);
    }

    #[test]
    fn compression_table_round_trips() {
        for c in Compression::ALL {
            assert_eq!(c.name().parse::<Compression>().unwrap(), c);
            assert_eq!(Compression::from_extension(c.extension()), Some(c));
        }
        assert!("rar".parse::<Compression>().is_err());
    }

    #[test]
    fn zstd_arguments() {
        assert_eq!(Compression::Zstd.compress_args(19), ["-q", "-c", "-19"]);
        assert_eq!(Compression::Zstd.decompress_args(), ["-q", "-d", "-c"]);
        assert_eq!(Compression::Gzip.decompress_args(), ["-d", "-c"]);
    }

    #[test]
    fn inner_names() {
        let name = InnerEntryName::compose("foo-1.0", "image", Some(Compression::Xz));
        assert_eq!(name, "foo-1.0/image.tar.xz");

        let parsed = InnerEntryName::parse(&name).unwrap();
        assert_eq!(parsed.dir, "foo-1.0");
        assert_eq!(parsed.stem, "image");
        assert_eq!(parsed.compression, Some(Compression::Xz));

        let plain = InnerEntryName::parse("metadata.tar").unwrap();
        assert_eq!(plain.dir, "");
        assert_eq!(plain.compression, None);

        assert!(InnerEntryName::parse("foo-1.0/image.tar.xz.sig").is_none());
        assert!(InnerEntryName::parse("Manifest").is_none());
        assert!(InnerEntryName::parse("gpkg-1").is_none());
    }
}
