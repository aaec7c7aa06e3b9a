#![allow(dead_code)]

use std::fs;
use std::io::Read;
use std::path::Path;

use gpkg_core::{GpkgConfig, Metadata, TrustPolicy};

pub const BASE_NAME: &str = "foo-1.0";

/// Detached "signature" is the SHA-256 of the data.
const SIGNER: &str = "sha256sum | cut -d' ' -f1";

const VERIFIER: &str = r#"test "$(sha256sum | cut -d' ' -f1)" = "$(cat "$0")" || exit 1
echo '[GNUPG:] GOODSIG 0123456789ABCDEF test' >&2
echo '[GNUPG:] TRUST_FULL 0 pgp' >&2"#;

const UNTRUSTED_VERIFIER: &str = r#"test "$(sha256sum | cut -d' ' -f1)" = "$(cat "$0")" || exit 1
echo '[GNUPG:] GOODSIG 0123456789ABCDEF test' >&2
echo '[GNUPG:] TRUST_UNDEFINED 0 pgp' >&2"#;

pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn verifier(script: &str) -> Vec<String> {
    let mut argv = sh(script);
    argv.push("[SIGNATURE]".to_string());
    argv
}

/// Uncompressed, unsigned.
pub fn plain_config() -> GpkgConfig {
    GpkgConfig {
        compression: None,
        ..GpkgConfig::default()
    }
}

/// Uncompressed, signs on write, requires signatures on read.
pub fn signing_config() -> GpkgConfig {
    GpkgConfig {
        compression: None,
        signing_command: sh(SIGNER),
        verify_command: verifier(VERIFIER),
        trust: TrustPolicy {
            create: true,
            require: true,
            skip: false,
        },
        ..GpkgConfig::default()
    }
}

/// Like [`signing_config`] but the verifier reports an untrusted key.
pub fn untrusted_config() -> GpkgConfig {
    GpkgConfig {
        verify_command: verifier(UNTRUSTED_VERIFIER),
        ..signing_config()
    }
}

pub fn has_binary(name: &str) -> bool {
    which::which(name).is_ok()
}

pub fn sample_metadata() -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("CATEGORY".to_string(), b"app-misc\n".to_vec());
    metadata.insert("PF".to_string(), b"foo-1.0\n".to_vec());
    metadata.insert("SLOT".to_string(), b"0\n".to_vec());
    metadata
}

/// A small tree with a file, a symlink, and a directory.
pub fn sample_tree(root: &Path) {
    fs::create_dir_all(root.join("usr/bin")).expect("failed to create usr/bin");
    fs::create_dir_all(root.join("etc")).expect("failed to create etc");
    fs::write(root.join("usr/bin/foo"), b"#!/bin/sh\necho foo\n").expect("failed to write foo");
    fs::write(root.join("etc/foo.conf"), b"verbose=1\n").expect("failed to write foo.conf");
    std::os::unix::fs::symlink("foo", root.join("usr/bin/foo-alias"))
        .expect("failed to create symlink");
}

/// Rebuild a container tar, letting `edit` rename, rewrite or drop each
/// entry, then append `extra` entries.
pub fn forge<F>(src: &Path, dst: &Path, mut edit: F, extra: &[(&str, &[u8])])
where
    F: FnMut(&str, Vec<u8>) -> Option<(String, Vec<u8>)>,
{
    let input = fs::File::open(src).expect("failed to open container");
    let mut archive = tar::Archive::new(input);
    let mut builder = tar::Builder::new(fs::File::create(dst).expect("failed to create forgery"));

    for entry in archive.entries().expect("failed to list container") {
        let mut entry = entry.expect("failed to read entry");
        let name = entry
            .path()
            .expect("bad entry path")
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).expect("failed to read entry data");

        if let Some((name, data)) = edit(&name, data) {
            append(&mut builder, &name, &data);
        }
    }
    for (name, data) in extra {
        append(&mut builder, name, data);
    }
    builder.finish().expect("failed to finish forgery");
}

fn append(builder: &mut tar::Builder<fs::File>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_ustar();
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    header.set_entry_type(tar::EntryType::Regular);
    builder
        .append_data(&mut header, name, data)
        .expect("failed to append forged entry");
}
