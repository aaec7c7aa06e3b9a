//! Digest algorithms recorded in the Manifest ledger.
//!
//! Every configured algorithm is computed over each stored entry, so a
//! container stays verifiable while individual algorithms are phased in or
//! retired.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// A digest algorithm that may appear in a Manifest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DigestAlgorithm {
    /// SHA-256 (32-byte digest).
    Sha256,
    /// SHA-512 (64-byte digest).
    Sha512,
    /// BLAKE3 (32-byte digest).
    Blake3,
}

impl DigestAlgorithm {
    /// Every algorithm this build knows how to compute.
    pub const ALL: [Self; 3] = [Self::Sha256, Self::Sha512, Self::Blake3];

    /// Ledger spelling of the algorithm (e.g. `SHA512`).
    pub fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
            Self::Blake3 => "BLAKE3",
        }
    }

    /// Length of the hex encoding of a digest.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha256 | Self::Blake3 => 64,
            Self::Sha512 => 128,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a ledger names an algorithm this build does not implement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown digest algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

impl FromStr for DigestAlgorithm {
    type Err = UnknownAlgorithm;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownAlgorithm(s.to_string()))
    }
}

/// Incremental state for a single digest algorithm.
#[derive(Debug, Clone)]
pub enum DigestState {
    /// SHA-256 accumulator.
    Sha256(Sha256),
    /// SHA-512 accumulator.
    Sha512(Sha512),
    /// BLAKE3 accumulator (boxed, the hasher state is large).
    Blake3(Box<blake3::Hasher>),
}

impl DigestState {
    /// Start a fresh accumulator for `algorithm`.
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
            DigestAlgorithm::Blake3 => Self::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// The algorithm this state computes.
    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Self::Sha256(_) => DigestAlgorithm::Sha256,
            Self::Sha512(_) => DigestAlgorithm::Sha512,
            Self::Blake3(_) => DigestAlgorithm::Blake3,
        }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Consume the state and return the lowercase hex digest.
    pub fn finalize(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// A fixed set of digest accumulators updated in lockstep over one stream.
#[derive(Debug, Clone, Default)]
pub struct MultiDigest {
    states: Vec<DigestState>,
}

impl MultiDigest {
    /// Create accumulators for `algorithms`; duplicates are ignored.
    pub fn new(algorithms: &[DigestAlgorithm]) -> Self {
        let mut states: Vec<DigestState> = Vec::with_capacity(algorithms.len());
        for &alg in algorithms {
            if states.iter().all(|s| s.algorithm() != alg) {
                states.push(DigestState::new(alg));
            }
        }
        Self { states }
    }

    /// Algorithms being computed, in configuration order.
    pub fn algorithms(&self) -> Vec<DigestAlgorithm> {
        self.states.iter().map(DigestState::algorithm).collect()
    }

    /// Feed the same bytes to every accumulator.
    pub fn update(&mut self, data: &[u8]) {
        for state in &mut self.states {
            state.update(data);
        }
    }

    /// Finish every accumulator, preserving configuration order.
    pub fn finalize(self) -> Vec<(DigestAlgorithm, String)> {
        self.states
            .into_iter()
            .map(|s| (s.algorithm(), s.finalize()))
            .collect()
    }
}

/// Compute a single digest over an in-memory buffer.
pub fn digest_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> String {
    let mut state = DigestState::new(algorithm);
    state.update(data);
    state.finalize()
}
