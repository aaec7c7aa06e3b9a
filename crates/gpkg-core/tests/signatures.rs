mod common;

use std::path::{Path, PathBuf};

use common::{
    BASE_NAME, forge, plain_config, sample_metadata, sample_tree, signing_config, untrusted_config,
};
use gpkg_core::io::container::ContainerIndex;
use gpkg_core::{BinaryPackage, GpkgConfig, GpkgError};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    signed: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let src = dir.path().join("src");
        sample_tree(&src);
        let signed = dir.path().join("signed.gpkg.tar");
        open(&signed, signing_config())
            .compress(&src, &sample_metadata())
            .expect("failed to build signed container");
        Self { dir, signed }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn open(path: &Path, config: GpkgConfig) -> BinaryPackage {
    BinaryPackage::new(path, Some(BASE_NAME.to_string()), config)
}

#[test]
fn test_signed_container_layout() {
    let fx = Fixture::new();
    let index = ContainerIndex::scan_path(&fx.signed).unwrap();
    let names: Vec<_> = index.entries().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "gpkg-1",
            "foo-1.0/metadata.tar",
            "foo-1.0/metadata.tar.sig",
            "foo-1.0/image.tar",
            "foo-1.0/image.tar.sig",
            "Manifest",
            "Manifest.sig",
        ]
    );

    let report = open(&fx.signed, signing_config())
        .decompress(&fx.path("dest"))
        .unwrap();
    assert!(report.signatures_checked);
    assert!(report.entries.iter().all(|e| e.signature_verified));
}

#[test]
fn test_stripped_manifest_signature_is_missing() {
    let fx = Fixture::new();
    let forged = fx.path("stripped.gpkg.tar");
    forge(
        &fx.signed,
        &forged,
        |name, data| (name != "Manifest.sig").then(|| (name.to_string(), data)),
        &[],
    );
    assert!(matches!(
        open(&forged, signing_config()).decompress(&fx.path("dest")),
        Err(GpkgError::MissingSignature(name)) if name == "Manifest.sig"
    ));
}

#[test]
fn test_stripped_image_signature_is_missing() {
    let fx = Fixture::new();
    let forged = fx.path("stripped.gpkg.tar");
    forge(
        &fx.signed,
        &forged,
        |name, data| (name != "foo-1.0/image.tar.sig").then(|| (name.to_string(), data)),
        &[],
    );
    assert!(matches!(
        open(&forged, signing_config()).verify(false),
        Err(GpkgError::MissingSignature(_))
    ));
    // Metadata-only reads do not look at the image signature.
    assert!(open(&forged, signing_config()).get_metadata(None).is_ok());
}

fn corrupt_manifest_signature(fx: &Fixture) -> PathBuf {
    let forged = fx.path("corrupt.gpkg.tar");
    forge(
        &fx.signed,
        &forged,
        |name, data| {
            if name == "Manifest.sig" {
                Some((name.to_string(), b"-----BEGIN PGP SIGNATURE-----\nforged\n".to_vec()))
            } else {
                Some((name.to_string(), data))
            }
        },
        &[],
    );
    forged
}

#[test]
fn test_corrupted_manifest_signature_is_invalid() {
    let fx = Fixture::new();
    let forged = corrupt_manifest_signature(&fx);
    assert!(matches!(
        open(&forged, signing_config()).decompress(&fx.path("dest")),
        Err(GpkgError::InvalidSignature(_))
    ));
}

#[test]
fn test_ignore_signature_overrides() {
    let fx = Fixture::new();
    let forged = corrupt_manifest_signature(&fx);
    let mut config = signing_config();
    config.trust.skip = true;

    let report = open(&forged, config).decompress(&fx.path("dest")).unwrap();
    assert!(!report.signatures_checked);
    assert!(fx.path("dest/usr/bin/foo").exists());
}

#[test]
fn test_untrusted_signer_is_invalid() {
    let fx = Fixture::new();
    assert!(matches!(
        open(&fx.signed, untrusted_config()).decompress(&fx.path("dest")),
        Err(GpkgError::InvalidSignature(msg)) if msg.contains("trusted")
    ));
}

#[test]
fn test_observed_signatures_are_checked_without_require() {
    let fx = Fixture::new();
    let mut config = untrusted_config();
    config.trust.require = false;
    assert!(matches!(
        open(&fx.signed, config).verify(false),
        Err(GpkgError::InvalidSignature(_))
    ));
}

#[test]
fn test_unsigned_container_policy() {
    let fx = Fixture::new();
    let unsigned = fx.path("unsigned.gpkg.tar");
    open(&unsigned, plain_config())
        .compress(&fx.path("src"), &sample_metadata())
        .unwrap();

    assert!(matches!(
        open(&unsigned, signing_config()).verify(false),
        Err(GpkgError::MissingSignature(_))
    ));

    let mut lenient = signing_config();
    lenient.trust.require = false;
    let report = open(&unsigned, lenient).verify(false).unwrap();
    assert!(!report.signatures_checked);
}

#[test]
fn test_tampered_signed_image_is_rejected() {
    let fx = Fixture::new();
    let forged = fx.path("tampered.gpkg.tar");
    forge(
        &fx.signed,
        &forged,
        |name, mut data| {
            if name == "foo-1.0/image.tar" {
                data[700] ^= 0xff;
            }
            Some((name.to_string(), data))
        },
        &[],
    );
    let err = open(&forged, signing_config()).verify(false).unwrap_err();
    assert!(matches!(
        err,
        GpkgError::InvalidSignature(_) | GpkgError::DigestMismatch(_)
    ));
}

#[test]
fn test_update_metadata_resigns() {
    let fx = Fixture::new();
    let package = open(&fx.signed, signing_config());
    let mut metadata = sample_metadata();
    metadata.insert("BUILD_ID".to_string(), b"2\n".to_vec());
    package.update_metadata(&metadata).unwrap();

    let index = ContainerIndex::scan_path(&fx.signed).unwrap();
    assert!(index.contains("foo-1.0/metadata.tar.sig"));
    assert!(index.contains("foo-1.0/image.tar.sig"));
    assert!(index.contains("Manifest.sig"));
    assert_eq!(package.get_metadata(None).unwrap(), metadata);
    package.verify(false).unwrap();
}
