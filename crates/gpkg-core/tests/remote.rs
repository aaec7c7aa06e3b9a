#![cfg(feature = "network")]

mod common;

use std::fs;

use common::{BASE_NAME, plain_config, sample_metadata, sample_tree, signing_config};
use gpkg_core::io::container::{BLOCK_SIZE, ContainerIndex};
use gpkg_core::io::remote::{INITIAL_RANGE_END, get_metadata_url};
use gpkg_core::{BinaryPackage, GpkgConfig, GpkgError, Metadata};
use tempfile::TempDir;

fn build(config: GpkgConfig, metadata: &Metadata) -> (TempDir, Vec<u8>) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let src = dir.path().join("src");
    sample_tree(&src);
    let path = dir.path().join("foo.gpkg.tar");
    BinaryPackage::new(&path, Some(BASE_NAME.to_string()), config)
        .compress(&src, metadata)
        .expect("failed to build container");
    let bytes = fs::read(&path).expect("failed to read container");
    (dir, bytes)
}

fn first_range(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(INITIAL_RANGE_END as usize + 1)]
}

#[tokio::test]
async fn test_small_container_single_request() {
    let (_dir, bytes) = build(plain_config(), &sample_metadata());
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/foo.gpkg.tar")
        .match_header("range", "bytes=0-51200")
        .with_status(206)
        .with_body(first_range(&bytes))
        .expect(1)
        .create_async()
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/foo.gpkg.tar", server.url());
    let metadata = get_metadata_url(&client, &url, Some(BASE_NAME), &plain_config(), None)
        .await
        .unwrap();

    assert_eq!(metadata, sample_metadata());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_large_metadata_extends_range() {
    let mut metadata = sample_metadata();
    // Incompressible-enough and stored uncompressed: pushes the entry past the first range.
    metadata.insert(
        "environment.bz2".to_string(),
        (0..120_000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect(),
    );
    let (_dir, bytes) = build(plain_config(), &metadata);

    let index = ContainerIndex::scan(&mut std::io::Cursor::new(&bytes)).unwrap();
    let entry = index.get("foo-1.0/metadata.tar").unwrap();
    let end = (entry.data_end() + 2048).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    let start = INITIAL_RANGE_END + 1;

    let mut server = mockito::Server::new_async().await;
    let head = server
        .mock("GET", "/foo.gpkg.tar")
        .match_header("range", "bytes=0-51200")
        .with_status(206)
        .with_body(first_range(&bytes))
        .create_async()
        .await;
    let tail = server
        .mock("GET", "/foo.gpkg.tar")
        .match_header("range", format!("bytes={start}-{}", end - 1).as_str())
        .with_status(206)
        .with_body(&bytes[start as usize..(end as usize).min(bytes.len())])
        .create_async()
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/foo.gpkg.tar", server.url());
    let want = vec!["environment.bz2".to_string(), "PF".to_string()];
    let got = get_metadata_url(&client, &url, None, &plain_config(), Some(&want))
        .await
        .unwrap();

    assert_eq!(got.len(), 2);
    assert_eq!(got["environment.bz2"], metadata["environment.bz2"]);
    head.assert_async().await;
    tail.assert_async().await;
}

#[tokio::test]
async fn test_full_body_reply_is_read_only_to_range() {
    let (_dir, mut bytes) = build(plain_config(), &sample_metadata());
    // Far more than any metadata read may pull in.
    bytes.resize(bytes.len() + 20_000_000, 0);

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/foo.gpkg.tar")
        .with_status(200)
        .with_body(&bytes)
        .expect(1)
        .create_async()
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/foo.gpkg.tar", server.url());
    let metadata = get_metadata_url(&client, &url, Some(BASE_NAME), &plain_config(), None)
        .await
        .expect("failed to read metadata from a full-body reply");

    assert_eq!(metadata, sample_metadata());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_ignored_range_is_sliced_locally() {
    let mut metadata = sample_metadata();
    metadata.insert(
        "environment.bz2".to_string(),
        (0..120_000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect(),
    );
    let (_dir, mut bytes) = build(plain_config(), &metadata);
    bytes.resize(bytes.len() + 20_000_000, 0);

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/foo.gpkg.tar")
        .with_status(200)
        .with_body(&bytes)
        .expect(2)
        .create_async()
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/foo.gpkg.tar", server.url());
    let want = vec!["environment.bz2".to_string()];
    let got = get_metadata_url(&client, &url, None, &plain_config(), Some(&want))
        .await
        .expect("failed to read metadata when the range is ignored");

    assert_eq!(got["environment.bz2"], metadata["environment.bz2"]);
    mock.assert_async().await;
}

fn raw_header(name: &str, size: u64) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_path(name).unwrap();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    header
}

#[tokio::test]
async fn test_oversized_metadata_is_refused() {
    let mut body = Vec::new();
    body.extend_from_slice(raw_header("gpkg-1", 0).as_bytes());
    body.extend_from_slice(raw_header("foo-1.0/metadata.tar", 20_000_000).as_bytes());
    body.extend_from_slice(&[0u8; 4096]);

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/huge.gpkg.tar")
        .with_status(206)
        .with_body(&body)
        .create_async()
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/huge.gpkg.tar", server.url());
    let err = get_metadata_url(&client, &url, None, &plain_config(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GpkgError::InvalidFormat(msg) if msg.contains("too large")));
}

#[tokio::test]
async fn test_missing_version_marker_is_refused() {
    let mut body = Vec::new();
    body.extend_from_slice(raw_header("foo-1.0/metadata.tar", 0).as_bytes());
    body.extend_from_slice(&[0u8; 1024]);

    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/bad.gpkg.tar")
        .with_status(206)
        .with_body(&body)
        .create_async()
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/bad.gpkg.tar", server.url());
    let err = get_metadata_url(&client, &url, None, &plain_config(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GpkgError::InvalidFormat(_)));
}

#[tokio::test]
async fn test_signed_metadata_is_verified() {
    let (_dir, bytes) = build(signing_config(), &sample_metadata());
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/foo.gpkg.tar")
        .with_status(206)
        .with_body(first_range(&bytes))
        .create_async()
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/foo.gpkg.tar", server.url());
    let metadata = get_metadata_url(&client, &url, Some(BASE_NAME), &signing_config(), None)
        .await
        .unwrap();
    assert_eq!(metadata, sample_metadata());
}

#[tokio::test]
async fn test_required_signature_missing() {
    let (_dir, bytes) = build(plain_config(), &sample_metadata());
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/foo.gpkg.tar")
        .with_status(206)
        .with_body(first_range(&bytes))
        .create_async()
        .await;

    let client = reqwest::Client::new();
    let url = format!("{}/foo.gpkg.tar", server.url());
    let err = get_metadata_url(&client, &url, Some(BASE_NAME), &signing_config(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GpkgError::MissingSignature(_)));
}
