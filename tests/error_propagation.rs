//! Error Propagation Integration Tests
//!
//! Tests that transport failures (missing paths, permission denials, broken
//! connections, rejected logins, stream errors) surface through the client as
//! the right `SftpError` variant, with the right kind, retry accounting and
//! pool health decision.

use std::sync::Arc;

use pooled_sftp::config::ClientConfig;
use pooled_sftp::error::{ErrorKind, SftpError};
use pooled_sftp::ports::TransportErrorKind;
use pooled_sftp::ssh::{MemoryTransport, SftpClient};

// ============== Helper Functions ==============

async fn create_client(transport: &MemoryTransport, max_retries: u32) -> SftpClient {
    let mut config = ClientConfig::with_password("server1", "admin", "secret");
    config.max_retries = max_retries;
    config.retry_delay_ms = 1;
    SftpClient::with_transport(config, Arc::new(transport.clone()))
        .await
        .unwrap()
}

// ============== Translation ==============

#[tokio::test]
async fn test_not_found_carries_remote_path() {
    let transport = MemoryTransport::new();
    let client = create_client(&transport, 2).await;

    let err = client.stat("/var/missing.log").await.unwrap_err();
    match err {
        SftpError::FileNotFound { path } => assert_eq!(path, "/var/missing.log"),
        other => panic!("expected FileNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn test_permission_denied_is_not_retried() {
    let transport = MemoryTransport::new();
    transport.add_dir("/root");
    transport.deny("/root");
    let client = create_client(&transport, 3).await;

    let err = client.listdir("/root").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert_eq!(err.attempts(), None);
    assert!(format!("{err}").contains("/root"));
}

#[tokio::test]
async fn test_connection_error_names_host() {
    let transport = MemoryTransport::new();
    let client = create_client(&transport, 0).await;

    transport.fail_next_ops(1, TransportErrorKind::Connection);
    let err = client.stat("/").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(format!("{err}").contains("server1"));
    assert!(matches!(err.root(), SftpError::Connection { host, .. } if host == "server1"));
}

#[tokio::test]
async fn test_authentication_error_names_user_and_host() {
    let transport = MemoryTransport::new();
    transport.reject_auth(true);

    let err = SftpClient::with_transport(
        ClientConfig::with_password("server1", "admin", "wrong"),
        Arc::new(transport.clone()),
    )
    .await
    .unwrap_err();

    assert_eq!(
        format!("{err}").split(':').next(),
        Some("SSH authentication failed for admin@server1")
    );
    assert!(!format!("{err}").contains("wrong"));
}

#[tokio::test]
async fn test_stream_error_becomes_file_transfer() {
    let transport = MemoryTransport::new();
    transport.add_file("/f", b"data");
    let client = create_client(&transport, 0).await;
    let dir = tempfile::tempdir().unwrap();

    transport.fail_next_ops(1, TransportErrorKind::Io);
    let err = client.get("/f", dir.path().join("f"), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileTransfer);
    assert!(err.root().is_retryable());
}

// ============== Retry accounting ==============

#[tokio::test]
async fn test_mixed_failures_report_transfer_kind() {
    let transport = MemoryTransport::new();
    let client = create_client(&transport, 1).await;

    transport.fail_next_ops(1, TransportErrorKind::Io);
    transport.fail_next_ops(1, TransportErrorKind::Connection);
    let err = client.stat("/").await.unwrap_err();

    assert_eq!(err.attempts(), Some(2));
    assert_eq!(err.kind(), ErrorKind::FileTransfer);
}

#[tokio::test]
async fn test_retry_then_success_hides_failure() {
    let transport = MemoryTransport::new();
    let client = create_client(&transport, 3).await;

    transport.fail_next_ops(2, TransportErrorKind::Connection);
    assert!(client.exists("/").await.unwrap());
}

// ============== Pool health ==============

#[tokio::test]
async fn test_connection_failure_discards_session() {
    let transport = MemoryTransport::new();
    let client = create_client(&transport, 0).await;
    assert_eq!(transport.live_sessions(), 1);

    transport.fail_next_ops(1, TransportErrorKind::Connection);
    let _ = client.stat("/").await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(transport.live_sessions(), 0);
    assert_eq!(client.stats().total_sessions, 0);
}

#[tokio::test]
async fn test_not_found_keeps_session() {
    let transport = MemoryTransport::new();
    let client = create_client(&transport, 0).await;

    let _ = client.stat("/nope").await;
    let _ = client.stat("/nope/again").await;

    assert_eq!(transport.connect_count(), 1);
    assert_eq!(client.stats().idle, 1);
}
