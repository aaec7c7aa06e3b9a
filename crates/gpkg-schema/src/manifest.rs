//! The Manifest ledger.
//!
//! One line per recorded container entry:
//!
//! ```text
//! MANIFEST <name> <size> <algo> <hex> [<algo> <hex> ...]
//! ```
//!
//! Signature entries, the version marker and the Manifest itself are never
//! recorded.

use crate::hash::DigestAlgorithm;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Leading token of every ledger line.
pub const MANIFEST_PREFIX: &str = "MANIFEST";

/// Errors raised while parsing Manifest text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    /// A line does not start with the ledger prefix.
    #[error("Manifest line {line_no} is not a ledger line: {line:?}")]
    NotLedgerLine {
        /// 1-based line number.
        line_no: usize,
        /// The offending line.
        line: String,
    },

    /// The same entry name is recorded twice.
    #[error("Manifest records {0} more than once")]
    DuplicateRecord(String),

    /// The size field is not a non-negative integer.
    #[error("Manifest size for {name} is not numeric: {value:?}")]
    InvalidSize {
        /// Entry name on that line.
        name: String,
        /// The raw size field.
        value: String,
    },

    /// The line is missing its name, size, or digest pairs.
    #[error("Manifest line {line_no} is incomplete")]
    Incomplete {
        /// 1-based line number.
        line_no: usize,
    },
}

/// One ledger line: entry name, stored size, and its digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// Full container entry name (e.g. `foo-1.0/image.tar.zst`).
    pub name: String,
    /// Stored size of the entry in bytes.
    pub size: u64,
    /// Algorithm name to hex digest, in ledger order. Names are kept verbatim
    /// so that records from newer writers still parse.
    pub digests: Vec<(String, String)>,
}

impl ManifestRecord {
    /// Build a record from freshly computed digests.
    pub fn new(
        name: impl Into<String>,
        size: u64,
        digests: impl IntoIterator<Item = (DigestAlgorithm, String)>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            digests: digests
                .into_iter()
                .map(|(alg, hex)| (alg.name().to_string(), hex))
                .collect(),
        }
    }

    /// Recorded digest for `algorithm`, if present.
    pub fn digest(&self, algorithm: DigestAlgorithm) -> Option<&str> {
        self.digests
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(algorithm.name()))
            .map(|(_, hex)| hex.as_str())
    }

    /// Recorded algorithms this build can recompute.
    pub fn known_algorithms(&self) -> Vec<DigestAlgorithm> {
        self.digests
            .iter()
            .filter_map(|(name, _)| name.parse().ok())
            .collect()
    }
}

impl fmt::Display for ManifestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{MANIFEST_PREFIX} {} {}", self.name, self.size)?;
        for (alg, hex) in &self.digests {
            write!(f, " {alg} {hex}")?;
        }
        Ok(())
    }
}

/// The full ledger, in write order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    records: Vec<ManifestRecord>,
}

impl Manifest {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::DuplicateRecord`] if the name is already recorded.
    pub fn push(&mut self, record: ManifestRecord) -> Result<(), ManifestError> {
        if self.get(&record.name).is_some() {
            return Err(ManifestError::DuplicateRecord(record.name));
        }
        self.records.push(record);
        Ok(())
    }

    /// Records in write order.
    pub fn records(&self) -> &[ManifestRecord] {
        &self.records
    }

    /// Look a record up by entry name.
    pub fn get(&self, name: &str) -> Option<&ManifestRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the ledger has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Parse ledger text. Blank lines are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`ManifestError`] for any line that is not a complete,
    /// well-formed ledger line, or for a duplicated entry name.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut manifest = Self::new();

        for (idx, line) in text.lines().enumerate() {
            let line_no = idx + 1;
            if line.trim().is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace();
            if fields.next() != Some(MANIFEST_PREFIX) {
                return Err(ManifestError::NotLedgerLine {
                    line_no,
                    line: line.to_string(),
                });
            }

            let name = fields.next().ok_or(ManifestError::Incomplete { line_no })?;
            let size_field = fields.next().ok_or(ManifestError::Incomplete { line_no })?;
            let size = size_field
                .parse::<u64>()
                .map_err(|_| ManifestError::InvalidSize {
                    name: name.to_string(),
                    value: size_field.to_string(),
                })?;

            let rest: Vec<&str> = fields.collect();
            if rest.is_empty() || rest.len() % 2 != 0 {
                return Err(ManifestError::Incomplete { line_no });
            }
            let digests = rest
                .chunks_exact(2)
                .map(|pair| (pair[0].to_string(), pair[1].to_ascii_lowercase()))
                .collect();

            manifest.push(ManifestRecord {
                name: name.to_string(),
                size,
                digests,
            })?;
        }

        Ok(manifest)
    }

    /// Serialize to ledger text, one newline-terminated line per record.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&record.to_string());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let mut m = Manifest::new();
        m.push(ManifestRecord::new(
            "foo-1.0/metadata.tar.zst",
            1024,
            [
                (DigestAlgorithm::Sha512, "aa".repeat(64)),
                (DigestAlgorithm::Blake3, "bb".repeat(32)),
            ],
        ))
        .unwrap();
        m.push(ManifestRecord::new(
            "foo-1.0/image.tar.zst",
            4096,
            [(DigestAlgorithm::Sha256, "cc".repeat(32))],
        ))
        .unwrap();
        m
    }

    #[test]
    fn text_round_trip() {
        let m = sample();
        let text = m.to_text();
        assert!(text.starts_with("MANIFEST foo-1.0/metadata.tar.zst 1024 SHA512 "));
        assert_eq!(Manifest::parse(&text).unwrap(), m);
    }

    #[test]
    fn rejects_foreign_lines() {
        let err = Manifest::parse("DATA foo 1 SHA512 00\n").unwrap_err();
        assert!(matches!(err, ManifestError::NotLedgerLine { line_no: 1, .. }));
    }

    #[test]
    fn rejects_duplicate_names() {
        let text = "MANIFEST a 1 SHA256 00\nMANIFEST a 2 SHA256 11\n";
        assert_eq!(
            Manifest::parse(text).unwrap_err(),
            ManifestError::DuplicateRecord("a".to_string())
        );
    }

    #[test]
    fn rejects_non_numeric_size() {
        let err = Manifest::parse("MANIFEST a 12x SHA256 00\n").unwrap_err();
        assert!(matches!(err, ManifestError::InvalidSize { .. }));
    }

    #[test]
    fn rejects_dangling_digest() {
        let err = Manifest::parse("MANIFEST a 12 SHA256\n").unwrap_err();
        assert_eq!(err, ManifestError::Incomplete { line_no: 1 });
        let err = Manifest::parse("MANIFEST a 12\n").unwrap_err();
        assert_eq!(err, ManifestError::Incomplete { line_no: 1 });
    }

    #[test]
    fn keeps_unknown_algorithms() {
        let m = Manifest::parse("MANIFEST a 3 BLAKE2B 00ff SHA256 AB\n").unwrap();
        let rec = m.get("a").unwrap();
        assert_eq!(rec.digests[0].0, "BLAKE2B");
        assert_eq!(rec.digest(DigestAlgorithm::Sha256), Some("ab"));
        assert_eq!(rec.known_algorithms(), vec![DigestAlgorithm::Sha256]);
    }
}
