//! Manifest reconciliation and signature checks.
//!
//! Every stored entry must be recorded in the Manifest with its exact size
//! and at least one matching digest, every record must name a stored entry,
//! and under the active trust policy every recorded entry and the Manifest
//! itself must carry a valid detached signature.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use gpkg_schema::{
    DigestAlgorithm, GPKG_VERSION, IMAGE_STEM, InnerEntryName, MANIFEST_NAME, Manifest,
    ManifestRecord, SIGNATURE_SUFFIX, TarFormat, is_signature_name, signature_name,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{GpkgConfig, SignMode};
use crate::error::{GpkgError, Result};
use crate::io::checksum::ChecksumSigner;
use crate::io::container::{ContainerIndex, EntryInfo, entry_reader, read_entry};

/// Outcome for one recorded entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedEntry {
    /// Entry name.
    pub name: String,
    /// Stored size, equal to the recorded size.
    pub size: u64,
    /// Whether the entry was hashed (false only for a metadata-only skip).
    pub hashed: bool,
    /// Whether the entry's detached signature was checked.
    pub signature_verified: bool,
    /// Recorded algorithms whose digests matched.
    pub matched: Vec<DigestAlgorithm>,
}

/// Result of a successful verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    /// Dialect of the outer container.
    pub format: Option<TarFormat>,
    /// Whether signatures were required by the trust policy for this container.
    pub signatures_checked: bool,
    /// Per-entry results in container order.
    pub entries: Vec<VerifiedEntry>,
    /// The parsed Manifest.
    pub manifest: Manifest,
    /// Header-only listing of the container.
    #[serde(skip)]
    pub index: ContainerIndex,
}

/// Checks a container on disk against its Manifest.
#[derive(Debug)]
pub struct ManifestVerifier<'a> {
    path: &'a Path,
    config: &'a GpkgConfig,
}

impl<'a> ManifestVerifier<'a> {
    /// Verifier for the container at `path`.
    pub fn new(path: &'a Path, config: &'a GpkgConfig) -> Self {
        Self { path, config }
    }

    /// Reconcile the container with its Manifest.
    ///
    /// With `metadata_only`, the image entry is checked for presence and
    /// size but not hashed, and its signature is not verified.
    ///
    /// # Errors
    ///
    /// [`GpkgError::InvalidFormat`] for an unreadable container, a missing
    /// version marker or Manifest, a duplicated entry name, or a malformed
    /// Manifest. [`GpkgError::MissingSignature`] and
    /// [`GpkgError::InvalidSignature`] under the trust policy.
    /// [`GpkgError::DigestMismatch`] for any size, digest, or completeness
    /// failure.
    pub fn verify(&self, metadata_only: bool) -> Result<VerifyReport> {
        let index = ContainerIndex::scan_path(self.path)?;

        if !index.contains(GPKG_VERSION) {
            return Err(GpkgError::InvalidFormat(format!(
                "{} has no {GPKG_VERSION} marker",
                self.path.display()
            )));
        }

        let mut seen = HashSet::new();
        for entry in index.entries() {
            if !seen.insert(entry.name.as_str()) {
                return Err(GpkgError::InvalidFormat(format!(
                    "duplicate entry {} in container",
                    entry.name
                )));
            }
        }

        let signature_observed = index.entries().iter().any(|e| is_signature_name(&e.name));
        let check_signatures = self.config.trust.should_verify(signature_observed);

        let manifest_entry = index.get(MANIFEST_NAME).ok_or_else(|| {
            GpkgError::InvalidFormat(format!("{MANIFEST_NAME} not found in container"))
        })?;
        let manifest_bytes = read_entry(self.path, manifest_entry)?;

        let manifest_sig = signature_name(MANIFEST_NAME);
        if check_signatures {
            let sig_entry = index
                .get(&manifest_sig)
                .ok_or_else(|| GpkgError::MissingSignature(manifest_sig.clone()))?;
            let mode = self.config.verify_mode(read_entry(self.path, sig_entry)?);
            let mut verifier = ChecksumSigner::new(&[], mode)?;
            verifier.update(&manifest_bytes)?;
            verifier.finish()?;
            debug!("Manifest signature verified");
        }

        let text = std::str::from_utf8(&manifest_bytes).map_err(|_| {
            GpkgError::InvalidFormat(format!("{MANIFEST_NAME} is not valid UTF-8"))
        })?;
        let manifest = Manifest::parse(text)?;

        let mut matched: HashSet<&str> = HashSet::new();
        let mut entries = Vec::new();

        for entry in index.entries() {
            let name = entry.name.as_str();
            if name == GPKG_VERSION || name == MANIFEST_NAME || is_signature_name(name) {
                continue;
            }

            let record = manifest.get(name).ok_or_else(|| {
                GpkgError::DigestMismatch(format!(
                    "unknown files exist: {name} is not recorded in {MANIFEST_NAME}"
                ))
            })?;
            if record.size != entry.size {
                return Err(GpkgError::DigestMismatch(format!(
                    "size mismatch for {name}: recorded {}, stored {}",
                    record.size, entry.size
                )));
            }
            matched.insert(name);

            if metadata_only && is_image_entry(name) {
                debug!(entry = name, "Skipping image in metadata-only verification");
                entries.push(VerifiedEntry {
                    name: name.to_string(),
                    size: entry.size,
                    hashed: false,
                    signature_verified: false,
                    matched: Vec::new(),
                });
                continue;
            }

            entries.push(self.check_entry(&index, entry, record, check_signatures)?);
        }

        for entry in index.entries() {
            let Some(base) = entry.name.strip_suffix(SIGNATURE_SUFFIX) else {
                continue;
            };
            if base != MANIFEST_NAME && !matched.contains(base) {
                return Err(GpkgError::DigestMismatch(format!(
                    "unknown files exist: {} signs nothing recorded",
                    entry.name
                )));
            }
        }

        let missing: Vec<&str> = manifest
            .records()
            .iter()
            .map(|r| r.name.as_str())
            .filter(|name| !matched.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(GpkgError::DigestMismatch(format!(
                "missing files: {}",
                missing.join(", ")
            )));
        }

        info!(path = %self.path.display(), entries = entries.len(), "Container verified");
        Ok(VerifyReport {
            format: index.format(),
            signatures_checked: check_signatures,
            entries,
            manifest,
            index,
        })
    }

    fn check_entry(
        &self,
        index: &ContainerIndex,
        entry: &EntryInfo,
        record: &ManifestRecord,
        check_signatures: bool,
    ) -> Result<VerifiedEntry> {
        let mode = if check_signatures {
            let sig_name = signature_name(&entry.name);
            let sig_entry = index
                .get(&sig_name)
                .ok_or(GpkgError::MissingSignature(sig_name))?;
            self.config.verify_mode(read_entry(self.path, sig_entry)?)
        } else {
            SignMode::None
        };

        let mut algorithms = self.config.checksums.clone();
        for alg in record.known_algorithms() {
            if !algorithms.contains(&alg) {
                algorithms.push(alg);
            }
        }

        let mut checksum = ChecksumSigner::new(&algorithms, mode)?;
        io::copy(&mut entry_reader(self.path, entry)?, &mut checksum)?;
        let outcome = checksum.finish()?;
        let matched = compare_digests(record, &outcome.digests)?;

        debug!(entry = %entry.name, ?matched, "Entry verified");
        Ok(VerifiedEntry {
            name: entry.name.clone(),
            size: entry.size,
            hashed: true,
            signature_verified: check_signatures,
            matched,
        })
    }
}

fn is_image_entry(name: &str) -> bool {
    InnerEntryName::parse(name).is_some_and(|n| n.stem == IMAGE_STEM)
}

/// At least one recorded, recognized digest must match and none may differ.
fn compare_digests(
    record: &ManifestRecord,
    computed: &[(DigestAlgorithm, String)],
) -> Result<Vec<DigestAlgorithm>> {
    let mut matched = Vec::new();
    for (alg_name, expected) in &record.digests {
        let Ok(alg) = alg_name.parse::<DigestAlgorithm>() else {
            continue;
        };
        let Some((_, actual)) = computed.iter().find(|(a, _)| *a == alg) else {
            continue;
        };
        if actual != expected {
            return Err(GpkgError::DigestMismatch(format!(
                "{alg} digest of {} does not match {MANIFEST_NAME}",
                record.name
            )));
        }
        matched.push(alg);
    }

    if matched.is_empty() {
        return Err(GpkgError::DigestMismatch(format!(
            "no recognized digest algorithm recorded for {}",
            record.name
        )));
    }
    Ok(matched)
}
