//! Metadata reads over HTTP byte ranges.
//!
//! Only the head of the container is fetched: a fixed prefix first, then,
//! if the metadata entry (and room for its signature) runs past it, one more
//! range up to the computed end. The total is capped so a hostile header
//! cannot make us download an arbitrary amount.

use std::io::Cursor;

use gpkg_schema::{GPKG_VERSION, METADATA_STEM, signature_name};
use reqwest::{Client, StatusCode};
use reqwest::header::{RANGE, USER_AGENT};
use tracing::debug;

use crate::config::GpkgConfig;
use crate::error::{GpkgError, Result};
use crate::io::checksum::ChecksumSigner;
use crate::io::container::{BLOCK_SIZE, ContainerIndex, EntryInfo};
use crate::package::{Metadata, decode_metadata, find_inner_entry};

/// Last byte of the first range request.
pub const INITIAL_RANGE_END: u64 = 51_200;

/// Upper bound on how far into the container a metadata read may reach.
pub const MAX_METADATA_EXTENT: u64 = 10_000_000;

/// Slack after the metadata entry for an adjacent signature entry.
const SIGNATURE_ALLOWANCE: u64 = 2048;

/// Fetch and decode the metadata of a remote container.
///
/// # Errors
///
/// [`GpkgError::InvalidFormat`] if the prefix lacks the version marker or
/// the metadata would reach past [`MAX_METADATA_EXTENT`].
/// [`GpkgError::MissingSignature`] / [`GpkgError::InvalidSignature`] under
/// the trust policy. [`GpkgError::Http`] for transport failures.
pub async fn get_metadata_url(
    client: &Client,
    url: &str,
    base_name: Option<&str>,
    config: &GpkgConfig,
    want: Option<&[String]>,
) -> Result<Metadata> {
    let mut prefix = fetch_range(client, url, 0, INITIAL_RANGE_END).await?;

    let index = ContainerIndex::scan_prefix(&prefix)?;
    if !index.contains(GPKG_VERSION) {
        return Err(GpkgError::InvalidFormat(format!(
            "{url} has no {GPKG_VERSION} marker"
        )));
    }
    let (entry, _) = find_inner_entry(&index, base_name, METADATA_STEM, config.allow_basename_mismatch)?;

    let end = metadata_extent(entry)?;
    let have = prefix.len() as u64;
    if end > have {
        debug!(url, have, end, "Extending metadata range");
        let more = fetch_range(client, url, have, end - 1).await?;
        prefix.extend_from_slice(&more);
    }

    let index = ContainerIndex::scan_prefix(&prefix)?;
    let (entry, compression) =
        find_inner_entry(&index, base_name, METADATA_STEM, config.allow_basename_mismatch)?;
    let stored = slice_entry(&prefix, entry)?.to_vec();

    let sig_name = signature_name(&entry.name);
    let sig_entry = index.get(&sig_name);
    let signature = if config.trust.should_verify(sig_entry.is_some()) {
        let sig_entry = sig_entry.ok_or_else(|| GpkgError::MissingSignature(sig_name.clone()))?;
        Some(slice_entry(&prefix, sig_entry)?.to_vec())
    } else {
        None
    };

    let config = config.clone();
    let want = want.map(<[String]>::to_vec);
    tokio::task::spawn_blocking(move || {
        if let Some(signature) = signature {
            let mut verifier = ChecksumSigner::new(&[], config.verify_mode(signature))?;
            verifier.update(&stored)?;
            verifier.finish()?;
            debug!(entry = %sig_name, "Remote metadata signature verified");
        }
        let codec = config.decompressor(compression)?;
        decode_metadata(Cursor::new(stored), codec, want.as_deref())
    })
    .await
    .map_err(|e| GpkgError::Io(std::io::Error::other(e)))?
}

/// Offset one past the last byte needed: the metadata entry, room for a
/// signature entry, rounded up to a block.
fn metadata_extent(entry: &EntryInfo) -> Result<u64> {
    let end = entry
        .data_offset
        .checked_add(entry.size)
        .and_then(|end| end.checked_add(SIGNATURE_ALLOWANCE))
        .ok_or_else(|| GpkgError::InvalidFormat("entry size overflows".to_string()))?;
    let rounded = end.min(MAX_METADATA_EXTENT + 1).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    if rounded > MAX_METADATA_EXTENT {
        return Err(GpkgError::InvalidFormat(format!("metadata too large: {end}")));
    }
    Ok(rounded)
}

fn slice_entry<'p>(prefix: &'p [u8], entry: &EntryInfo) -> Result<&'p [u8]> {
    prefix
        .get(entry.data_offset as usize..entry.data_end() as usize)
        .ok_or_else(|| {
            GpkgError::InvalidFormat(format!("{} is truncated in the fetched range", entry.name))
        })
}

/// Bytes `start..=end` of `url`, read incrementally and never more than asked for.
async fn fetch_range(client: &Client, url: &str, start: u64, end: u64) -> Result<Vec<u8>> {
    let mut response = client
        .get(url)
        .header(USER_AGENT, crate::USER_AGENT)
        .header(RANGE, format!("bytes={start}-{end}"))
        .send()
        .await?
        .error_for_status()?;

    // A server that ignores Range answers 200 with the whole file.
    let mut skip = if response.status() == StatusCode::PARTIAL_CONTENT {
        0
    } else {
        start
    };
    let want = end.saturating_sub(start).saturating_add(1);
    let mut body = Vec::new();

    while let Some(chunk) = response.chunk().await? {
        let mut chunk = &chunk[..];
        if skip > 0 {
            let n = chunk.len().min(usize::try_from(skip).unwrap_or(usize::MAX));
            chunk = &chunk[n..];
            skip -= n as u64;
        }
        let room = want - body.len() as u64;
        let take = chunk.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        body.extend_from_slice(&chunk[..take]);
        if body.len() as u64 >= want {
            break;
        }
    }
    Ok(body)
}
