//! Uploader: watermark, verification, retention, idempotence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tempfile::TempDir;

use common::{JUNE_1, SECOND};
use tapeline::upload::{Uploader, UploaderConfig};

struct Fixture {
    archive: TempDir,
    _remote: TempDir,
    store: Arc<LocalFileSystem>,
}

impl Fixture {
    fn new() -> Self {
        let archive = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let store = Arc::new(LocalFileSystem::new_with_prefix(remote.path()).unwrap());
        Self {
            archive,
            _remote: remote,
            store,
        }
    }

    fn uploader(&self, retention: Duration) -> Uploader {
        Uploader::new(
            Arc::clone(&self.store) as Arc<dyn ObjectStore>,
            UploaderConfig {
                root: self.archive.path().to_path_buf(),
                feed: "sim".into(),
                prefix: "archive".into(),
                multipart_threshold_bytes: 1024 * 1024,
                local_retention: retention,
            },
        )
        .unwrap()
    }

    fn seed_date_dir(&self) -> std::path::PathBuf {
        let date_dir = self.archive.path().join("sim/2024-06-01");
        std::fs::create_dir_all(&date_dir).unwrap();
        date_dir
    }
}

#[tokio::test]
async fn sealed_segments_upload_once_partials_never() {
    let fixture = Fixture::new();
    let date_dir = fixture.seed_date_dir();
    std::fs::write(date_dir.join("trade_120000_0000.jsonl.gz"), b"sealed-bytes").unwrap();
    std::fs::write(
        date_dir.join("trade_120500_0001.jsonl.gz.partial"),
        b"still-open",
    )
    .unwrap();
    std::fs::write(date_dir.join("manifest.json"), br#"{"feed":"sim"}"#).unwrap();

    let mut uploader = fixture.uploader(Duration::from_secs(3600));
    let stats = uploader.sweep(JUNE_1).await.unwrap();
    assert_eq!(stats.segments_uploaded, 1);
    assert_eq!(stats.manifests_uploaded, 1);
    assert_eq!(stats.locals_deleted, 0);

    // The sealed segment landed under the configured prefix.
    let meta = fixture
        .store
        .head(&ObjectPath::from(
            "archive/sim/2024-06-01/trade_120000_0000.jsonl.gz",
        ))
        .await
        .unwrap();
    assert_eq!(meta.size, b"sealed-bytes".len());

    // The partial did not.
    assert!(fixture
        .store
        .head(&ObjectPath::from(
            "archive/sim/2024-06-01/trade_120500_0001.jsonl.gz.partial",
        ))
        .await
        .is_err());

    // A second sweep is a no-op: nothing changed.
    let stats = uploader.sweep(JUNE_1 + SECOND).await.unwrap();
    assert_eq!(stats.segments_uploaded, 0);
    assert_eq!(stats.manifests_uploaded, 0);

    // The watermark survives restarts.
    let mut restarted = fixture.uploader(Duration::from_secs(3600));
    let stats = restarted.sweep(JUNE_1 + 2 * SECOND).await.unwrap();
    assert_eq!(stats.segments_uploaded, 0);
}

#[tokio::test]
async fn manifest_reuploads_on_change_only() {
    let fixture = Fixture::new();
    let date_dir = fixture.seed_date_dir();
    std::fs::write(date_dir.join("manifest.json"), br#"{"rev":1}"#).unwrap();

    let mut uploader = fixture.uploader(Duration::from_secs(3600));
    assert_eq!(uploader.sweep(JUNE_1).await.unwrap().manifests_uploaded, 1);
    assert_eq!(uploader.sweep(JUNE_1).await.unwrap().manifests_uploaded, 0);

    // Rotation rewrote the manifest: the remote object is replaced.
    std::fs::write(date_dir.join("manifest.json"), br#"{"rev":2}"#).unwrap();
    assert_eq!(uploader.sweep(JUNE_1).await.unwrap().manifests_uploaded, 1);

    let bytes = fixture
        .store
        .get(&ObjectPath::from("archive/sim/2024-06-01/manifest.json"))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(&bytes[..], br#"{"rev":2}"#);
}

#[tokio::test]
async fn local_delete_waits_for_retention_and_confirmed_upload() {
    let fixture = Fixture::new();
    let date_dir = fixture.seed_date_dir();
    let local = date_dir.join("trade_120000_0000.jsonl.gz");
    std::fs::write(&local, b"sealed-bytes").unwrap();

    let mut uploader = fixture.uploader(Duration::from_secs(600));
    let stats = uploader.sweep(JUNE_1).await.unwrap();
    assert_eq!(stats.segments_uploaded, 1);
    assert!(local.exists(), "retention delay keeps the local copy");

    // Still inside the retention window.
    let stats = uploader.sweep(JUNE_1 + 599 * SECOND).await.unwrap();
    assert_eq!(stats.locals_deleted, 0);
    assert!(local.exists());

    // Window elapsed: the local copy goes, the remote stays.
    let stats = uploader.sweep(JUNE_1 + 601 * SECOND).await.unwrap();
    assert_eq!(stats.locals_deleted, 1);
    assert!(!local.exists());
    assert!(fixture
        .store
        .head(&ObjectPath::from(
            "archive/sim/2024-06-01/trade_120000_0000.jsonl.gz",
        ))
        .await
        .is_ok());

    // Deleting again is not attempted.
    let stats = uploader.sweep(JUNE_1 + 700 * SECOND).await.unwrap();
    assert_eq!(stats.locals_deleted, 0);
}

#[tokio::test]
async fn multipart_path_used_for_large_segments() {
    let fixture = Fixture::new();
    let date_dir = fixture.seed_date_dir();
    // 3 MiB of compressible noise with a 1 MiB multipart threshold.
    let big: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(date_dir.join("orderbook_090000_0000.jsonl.gz"), &big).unwrap();

    let mut uploader = Uploader::new(
        Arc::clone(&fixture.store) as Arc<dyn ObjectStore>,
        UploaderConfig {
            root: fixture.archive.path().to_path_buf(),
            feed: "sim".into(),
            prefix: String::new(),
            multipart_threshold_bytes: 1024 * 1024,
            local_retention: Duration::from_secs(3600),
        },
    )
    .unwrap();
    let stats = uploader.sweep(JUNE_1).await.unwrap();
    assert_eq!(stats.segments_uploaded, 1);

    // Without a prefix the key is {feed}/{date}/{name}; content intact.
    let bytes = fixture
        .store
        .get(&ObjectPath::from(
            "sim/2024-06-01/orderbook_090000_0000.jsonl.gz",
        ))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(bytes.len(), big.len());
    assert_eq!(&bytes[..64], &big[..64]);
}
