//! Client Integration Tests
//!
//! End-to-end behaviour of `SftpClient` over the in-memory transport: file
//! round-trips, directory mirroring order, fail-fast aborts, progress
//! reporting and retry accounting. No network required.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pooled_sftp::config::ClientConfig;
use pooled_sftp::error::{ErrorKind, SftpError};
use pooled_sftp::ports::TransportErrorKind;
use pooled_sftp::ssh::{MemoryTransport, ProgressCallback, SftpClient, TransferProgress};

fn config() -> ClientConfig {
    let mut config = ClientConfig::with_password("files.example", "deploy", "hunter2");
    config.max_retries = 2;
    config.retry_delay_ms = 5;
    config
}

async fn connect(transport: &MemoryTransport, config: ClientConfig) -> SftpClient {
    SftpClient::with_transport(config, Arc::new(transport.clone()))
        .await
        .expect("client should connect to the memory transport")
}

fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, data) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }
}

fn recorder() -> (ProgressCallback, Arc<Mutex<Vec<TransferProgress>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: ProgressCallback = Arc::new(move |p| sink.lock().unwrap().push(p));
    (callback, events)
}

// ============== Round trips ==============

#[tokio::test]
async fn test_put_then_get_returns_identical_bytes() {
    let transport = MemoryTransport::new();
    let client = connect(&transport, config()).await;
    let dir = tempfile::tempdir().unwrap();

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let src = dir.path().join("payload.bin");
    std::fs::write(&src, &data).unwrap();

    let sent = client.put(&src, "/payload.bin", None).await.unwrap();
    let dst = dir.path().join("copy.bin");
    let received = client.get("/payload.bin", &dst, None).await.unwrap();

    assert_eq!(sent, 100_000);
    assert_eq!(received, 100_000);
    assert_eq!(std::fs::read(&dst).unwrap(), data);
    client.shutdown().await;
}

#[tokio::test]
async fn test_put_overwrites_existing_remote_file() {
    let transport = MemoryTransport::new();
    transport.add_file("/notes.txt", b"old contents that are longer");
    let client = connect(&transport, config()).await;
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("notes.txt");
    std::fs::write(&src, b"new").unwrap();

    client.put(&src, "/notes.txt", None).await.unwrap();
    assert_eq!(transport.read_file("/notes.txt").unwrap(), b"new");
}

#[tokio::test]
async fn test_backslash_remote_paths_are_normalised() {
    let transport = MemoryTransport::new();
    transport.add_dir("/srv/data");
    let client = connect(&transport, config()).await;
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a.txt");
    std::fs::write(&src, b"a").unwrap();

    client.put(&src, "\\srv\\data\\a.txt", None).await.unwrap();
    assert!(transport.exists("/srv/data/a.txt"));
}

// ============== Metadata ==============

#[tokio::test]
async fn test_exists_is_false_for_absent_path() {
    let transport = MemoryTransport::new();
    let client = connect(&transport, config()).await;
    assert!(!client.exists("/no/such/thing").await.unwrap());
    assert!(client.exists("/").await.unwrap());
}

#[tokio::test]
async fn test_exists_propagates_other_errors() {
    let transport = MemoryTransport::new();
    transport.add_dir("/secret");
    transport.deny("/secret");
    let client = connect(&transport, config()).await;
    let err = client.exists("/secret").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
}

#[tokio::test]
async fn test_mkdir_on_existing_directory_is_transfer_error() {
    let transport = MemoryTransport::new();
    transport.add_dir("/releases");
    let client = connect(&transport, config()).await;

    let err = client.mkdir("/releases").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileTransfer);
    // Refused requests are not retried
    assert_eq!(err.attempts(), None);
}

#[tokio::test]
async fn test_mkdir_without_parent_is_not_found() {
    let transport = MemoryTransport::new();
    let client = connect(&transport, config()).await;
    let err = client.mkdir("/a/b/c").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);
}

#[tokio::test]
async fn test_listdir_filters_dot_entries() {
    let transport = MemoryTransport::new();
    transport.add_file("/x/one", b"1");
    transport.add_file("/x/two", b"2");
    let client = connect(&transport, config()).await;

    let names = client.listdir("/x").await.unwrap();
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|n| n != "." && n != ".."));
}

// ============== Directory trees ==============

#[tokio::test]
async fn test_put_dir_creates_directories_before_contents() {
    let transport = MemoryTransport::new();
    let client = connect(&transport, config()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("a");
    write_tree(&local, &[("x.txt", b"xx"), ("b/y.txt", b"yyy")]);

    let summary = client.put_dir(&local, "/a", None).await.unwrap();

    assert_eq!(
        transport.operation_log(),
        vec!["mkdir /a", "write /a/x.txt", "mkdir /a/b", "write /a/b/y.txt"]
    );
    assert_eq!(summary.files_transferred, 2);
    assert_eq!(summary.bytes_transferred, 5);
    assert_eq!(summary.directories_created, 2);
}

#[tokio::test]
async fn test_put_dir_aborts_on_first_failure_without_rollback() {
    let transport = MemoryTransport::new();
    transport.fail_writes_to("/a/x.txt", TransportErrorKind::Failure);
    let client = connect(&transport, config()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("a");
    write_tree(&local, &[("x.txt", b"xx"), ("b/y.txt", b"yyy")]);

    let err = client.put_dir(&local, "/a", None).await.unwrap_err();

    assert!(matches!(err, SftpError::Remote { ref path, .. } if path == "/a/x.txt"));
    // Root stays, nothing after the failed step was attempted
    assert!(transport.is_dir("/a"));
    assert!(!transport.exists("/a/b"));
    assert_eq!(transport.operation_log(), vec!["mkdir /a"]);
}

#[tokio::test]
async fn test_get_dir_mirrors_remote_tree() {
    let transport = MemoryTransport::new();
    transport.add_file("/site/index.html", b"<html>");
    transport.add_file("/site/css/main.css", b"body{}");
    transport.add_dir("/site/empty");
    let client = connect(&transport, config()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("site");

    let summary = client.get_dir("/site", &local, None).await.unwrap();

    assert_eq!(std::fs::read(local.join("index.html")).unwrap(), b"<html>");
    assert_eq!(std::fs::read(local.join("css/main.css")).unwrap(), b"body{}");
    assert!(local.join("empty").is_dir());
    assert_eq!(summary.files_transferred, 2);
    assert_eq!(summary.directories_created, 3);
}

#[tokio::test]
async fn test_get_dir_reuses_existing_local_root() {
    let transport = MemoryTransport::new();
    transport.add_file("/site/a.txt", b"a");
    let client = connect(&transport, config()).await;
    let dir = tempfile::tempdir().unwrap();

    let summary = client.get_dir("/site", dir.path(), None).await.unwrap();
    assert_eq!(summary.directories_created, 0);
    assert!(dir.path().join("a.txt").exists());
}

#[tokio::test]
async fn test_put_dir_requires_directory() {
    let transport = MemoryTransport::new();
    let client = connect(&transport, config()).await;
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f");
    std::fs::write(&file, b"").unwrap();

    let err = client.put_dir(&file, "/f", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let err = client
        .put_dir(dir.path().join("missing"), "/m", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);
}

// ============== Progress ==============

#[tokio::test]
async fn test_progress_is_monotonic_and_ends_at_size() {
    let transport = MemoryTransport::new();
    let mut config = config();
    config.chunk_size = 32_768;
    let client = connect(&transport, config).await;
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("big.bin");
    std::fs::write(&src, vec![7u8; 100_000]).unwrap();

    let (callback, events) = recorder();
    client.put(&src, "/big.bin", Some(callback)).await.unwrap();

    let seen: Vec<u64> = events
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.bytes_transferred)
        .collect();
    // ceil(100000 / 32768) == 4
    assert_eq!(seen, vec![32_768, 65_536, 98_304, 100_000]);
}

#[tokio::test]
async fn test_panicking_callback_does_not_abort_transfer() {
    let transport = MemoryTransport::new();
    let mut config = config();
    config.chunk_size = 10;
    let client = connect(&transport, config).await;
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("f.txt");
    std::fs::write(&src, vec![1u8; 35]).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let callback: ProgressCallback = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        panic!("progress sink exploded");
    });

    assert_eq!(client.put(&src, "/f.txt", Some(callback)).await.unwrap(), 35);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(transport.read_file("/f.txt").unwrap().len(), 35);
}

#[tokio::test]
async fn test_directory_progress_names_each_file() {
    let transport = MemoryTransport::new();
    let client = connect(&transport, config()).await;
    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("one.txt", b"1"), ("two.txt", b"22")]);

    let (callback, events) = recorder();
    client.put_dir(dir.path(), "/d", Some(callback)).await.unwrap();

    let paths: Vec<String> = events.lock().unwrap().iter().map(|p| p.path.clone()).collect();
    assert_eq!(paths, vec!["/d/one.txt", "/d/two.txt"]);
}

// ============== Retry ==============

#[tokio::test]
async fn test_always_retryable_error_makes_retries_plus_one_attempts() {
    let transport = MemoryTransport::new();
    let client = connect(&transport, config()).await;
    let connects_before = transport.connect_count();

    transport.fail_next_connects(100, TransportErrorKind::Connection);
    transport.kill_sessions();
    let err = client.stat("/").await.unwrap_err();

    assert_eq!(err.attempts(), Some(3));
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(transport.connect_count() - connects_before, 3);
}

#[tokio::test]
async fn test_authentication_error_is_attempted_once() {
    let transport = MemoryTransport::new();
    let client = connect(&transport, config()).await;
    let connects_before = transport.connect_count();

    transport.reject_auth(true);
    transport.kill_sessions();
    let err = client.stat("/").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert_eq!(err.attempts(), None);
    assert_eq!(transport.connect_count() - connects_before, 1);
}

#[tokio::test]
async fn test_transient_stream_failure_recovers() {
    let transport = MemoryTransport::new();
    transport.add_file("/data.csv", b"a,b,c\n");
    let client = connect(&transport, config()).await;
    let dir = tempfile::tempdir().unwrap();

    transport.fail_next_ops(1, TransportErrorKind::Io);
    let bytes = client
        .get("/data.csv", dir.path().join("data.csv"), None)
        .await
        .unwrap();
    assert_eq!(bytes, 6);
}

#[tokio::test]
async fn test_scoped_client_closes_sessions() {
    let transport = MemoryTransport::new();
    transport.add_file("/f", b"x");

    let exists = SftpClient::scoped(config(), Arc::new(transport.clone()), |client| async move {
        client.exists("/f").await
    })
    .await
    .unwrap();

    assert!(exists);
    assert_eq!(transport.live_sessions(), 0);
}
