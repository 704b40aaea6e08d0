mod common;

use std::path::Path;
use std::sync::Arc;

use common::mocks::{FakeConnector, Fault};
use common::test_helpers::{test_config, test_context};
use mzid_mirror::connection::{ConnectionProvider, RemotePath};
use mzid_mirror::downloader::{FetchOutcome, ResilientDownloader, partial_path};
use mzid_mirror::error::{MirrorError, RemoteError};
use tempfile::TempDir;

const COLLECTION_DIR: &str = "pride/data/archive/2024/03/PXD000001";
const CONTENT: &[u8] = b"<MzIdentML>complete document</MzIdentML>";

fn remote_file() -> RemotePath {
    RemotePath::from_segments(["2024", "03", "PXD000001", "search.mzid"])
}

fn downloader(root: &Path, connector: &FakeConnector) -> ResilientDownloader {
    let config = test_config(root);
    let connections = ConnectionProvider::new(Arc::new(connector.clone()), config.connection.policy());
    ResilientDownloader::new(
        test_context(root),
        connections,
        config.download.policy(),
        config.remote.root.clone(),
        root,
    )
}

#[tokio::test]
async fn test_download_mirrors_remote_layout() {
    let dir = TempDir::new().unwrap();
    let connector = FakeConnector::new().with_file(COLLECTION_DIR, "search.mzid", CONTENT);
    let downloader = downloader(dir.path(), &connector);

    let local = downloader.local_path(&remote_file());
    assert_eq!(local, dir.path().join("2024/03/PXD000001/search.mzid"));

    let outcome = downloader.fetch(&remote_file(), &local).await.unwrap();
    assert_eq!(
        outcome,
        FetchOutcome::Downloaded {
            bytes: CONTENT.len() as u64,
            attempts: 1
        }
    );
    assert_eq!(std::fs::read(&local).unwrap(), CONTENT);
    assert!(!partial_path(&local).exists());
    assert_eq!(connector.closes(), 1);
}

#[tokio::test]
async fn test_existing_file_is_never_refetched() {
    let dir = TempDir::new().unwrap();
    let connector = FakeConnector::new().with_file(COLLECTION_DIR, "search.mzid", CONTENT);
    let downloader = downloader(dir.path(), &connector);
    let local = downloader.local_path(&remote_file());

    downloader.fetch(&remote_file(), &local).await.unwrap();
    let second = downloader.fetch(&remote_file(), &local).await.unwrap();

    assert_eq!(second, FetchOutcome::Skipped);
    assert_eq!(connector.opens(), 1);
    assert_eq!(connector.retrievals(), 1);
}

#[tokio::test]
async fn test_transient_drop_is_retried_without_leftovers() {
    let dir = TempDir::new().unwrap();
    let connector = FakeConnector::new()
        .with_file(COLLECTION_DIR, "search.mzid", CONTENT)
        .with_fault(Fault::DropAfter(7));
    let downloader = downloader(dir.path(), &connector);
    let local = downloader.local_path(&remote_file());

    let outcome = downloader.fetch(&remote_file(), &local).await.unwrap();
    assert_eq!(
        outcome,
        FetchOutcome::Downloaded {
            bytes: CONTENT.len() as u64,
            attempts: 2
        }
    );
    assert_eq!(std::fs::read(&local).unwrap(), CONTENT);
    assert!(!partial_path(&local).exists());
    assert_eq!(connector.opens(), 2);
}

#[tokio::test]
async fn test_temporary_server_error_is_retried() {
    let dir = TempDir::new().unwrap();
    let connector = FakeConnector::new()
        .with_file(COLLECTION_DIR, "search.mzid", CONTENT)
        .with_fault(Fault::Reply(421));
    let downloader = downloader(dir.path(), &connector);
    let local = downloader.local_path(&remote_file());

    downloader.fetch(&remote_file(), &local).await.unwrap();
    assert_eq!(connector.retrievals(), 2);
    assert!(local.exists());
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let connector = FakeConnector::new()
        .with_file(COLLECTION_DIR, "search.mzid", CONTENT)
        .with_fault(Fault::Reply(550));
    let downloader = downloader(dir.path(), &connector);
    let local = downloader.local_path(&remote_file());

    let error = downloader.fetch(&remote_file(), &local).await.unwrap_err();
    assert!(matches!(error, MirrorError::Remote(RemoteError::Reply { code: 550, .. })));
    assert_eq!(connector.retrievals(), 1);
    assert!(!local.exists());
    assert!(!partial_path(&local).exists());
}

#[tokio::test]
async fn test_missing_remote_file_leaves_nothing() {
    let dir = TempDir::new().unwrap();
    let connector = FakeConnector::new().with_file(COLLECTION_DIR, "other.mzid", CONTENT);
    let downloader = downloader(dir.path(), &connector);
    let local = downloader.local_path(&remote_file());

    assert!(downloader.fetch(&remote_file(), &local).await.is_err());
    assert!(!local.exists());
    assert!(!partial_path(&local).exists());
}

#[tokio::test]
async fn test_retries_exhausted_after_repeated_drops() {
    let dir = TempDir::new().unwrap();
    let connector = FakeConnector::new()
        .with_file(COLLECTION_DIR, "search.mzid", CONTENT)
        .with_fault(Fault::DropAfter(5))
        .with_fault(Fault::DropAfter(10))
        .with_fault(Fault::DropAfter(15));
    let downloader = downloader(dir.path(), &connector);
    let local = downloader.local_path(&remote_file());

    let error = downloader.fetch(&remote_file(), &local).await.unwrap_err();
    assert!(matches!(error, MirrorError::Remote(RemoteError::Connection { .. })));
    assert_eq!(connector.retrievals(), 3);
    assert!(!local.exists());
    assert!(!partial_path(&local).exists());
}

#[tokio::test]
async fn test_connection_retries_before_transfer() {
    let dir = TempDir::new().unwrap();
    let connector = FakeConnector::new()
        .with_file(COLLECTION_DIR, "search.mzid", CONTENT)
        .with_connect_failures(2);
    let downloader = downloader(dir.path(), &connector);
    let local = downloader.local_path(&remote_file());

    let outcome = downloader.fetch(&remote_file(), &local).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Downloaded { attempts: 1, .. }));
    assert_eq!(connector.opens(), 3);
}

#[tokio::test]
async fn test_connection_exhaustion_is_reported() {
    let dir = TempDir::new().unwrap();
    let connector = FakeConnector::new()
        .with_file(COLLECTION_DIR, "search.mzid", CONTENT)
        .with_connect_failures(10);
    let downloader = downloader(dir.path(), &connector);
    let local = downloader.local_path(&remote_file());

    let error = downloader.fetch(&remote_file(), &local).await.unwrap_err();
    assert!(matches!(error, MirrorError::Connection { attempts: 3, .. }));
    // Exhausted connection retries are not multiplied by download retries
    assert_eq!(connector.opens(), 3);
    assert!(!local.exists());
}
