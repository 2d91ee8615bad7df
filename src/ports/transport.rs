//! SFTP Transport Port
//!
//! This module defines the synchronous capability interface the underlying
//! SSH/SFTP library must satisfy. Every method blocks the calling thread, so
//! the pool and client only ever call them from blocking worker threads.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::{AuthConfig, ClientConfig};

/// Transport-neutral failure category.
///
/// Adapters map their native error codes onto these; the executor maps these
/// onto [`SftpError`](crate::error::SftpError).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The path does not exist
    NotFound,
    /// The server (or local filesystem) denied access
    PermissionDenied,
    /// Credentials were rejected
    Authentication,
    /// Socket error, timeout, handshake failure or lost connection
    Connection,
    /// The server refused the request (SFTP generic failure)
    Failure,
    /// A read or write on an open handle broke mid-stream
    Io,
}

/// Error returned by a transport call
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    /// Path the failing call was about, when the adapter knows it
    pub path: Option<String>,
}

impl TransportError {
    #[must_use]
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Wrap a local filesystem error raised while staging a transfer.
    #[must_use]
    pub fn local(path: &Path, err: &std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => TransportErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => TransportErrorKind::PermissionDenied,
            _ => TransportErrorKind::Io,
        };
        Self::new(kind, format!("local {}: {err}", path.display()))
            .with_path(path.display().to_string())
    }
}

/// Connection parameters handed to [`SftpTransport::connect`]
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthConfig,
    pub timeout: Duration,
}

impl ConnectParams {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            hostname: config.hostname.clone(),
            port: config.port,
            username: config.username.clone(),
            auth: config.auth.clone(),
            timeout: config.timeout(),
        }
    }
}

/// Remote file attributes as reported by `stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileAttributes {
    pub size: Option<u64>,
    /// Full mode bits including the file type
    pub permissions: Option<u32>,
    pub mtime: Option<u64>,
    pub atime: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;

impl FileAttributes {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.permissions.is_some_and(|p| p & S_IFMT == S_IFDIR)
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.permissions.is_some_and(|p| p & S_IFMT == S_IFREG)
    }
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, Serialize)]
pub struct RemoteDirEntry {
    pub name: String,
    pub attrs: FileAttributes,
}

/// Open remote file handle
pub trait RemoteFile {
    /// Read up to `buf.len()` bytes; `Ok(0)` means end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write some prefix of `data`, returning how much was accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Flush and release the handle.
    fn close(self: Box<Self>) -> Result<(), TransportError>;

    /// Write all of `data`, looping over short writes.
    fn write_all(&mut self, mut data: &[u8]) -> Result<(), TransportError> {
        while !data.is_empty() {
            let n = self.write(data)?;
            if n == 0 {
                return Err(TransportError::new(
                    TransportErrorKind::Io,
                    "remote handle accepted zero bytes",
                ));
            }
            data = &data[n..];
        }
        Ok(())
    }
}

/// One authenticated SFTP session
pub trait TransportSession: Send {
    /// Open an existing file for reading
    fn open_read(&mut self, path: &str) -> Result<Box<dyn RemoteFile>, TransportError>;

    /// Create or truncate a file for writing
    fn open_write(&mut self, path: &str, mode: i32) -> Result<Box<dyn RemoteFile>, TransportError>;

    /// List a directory in server order, without `.` and `..`
    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>, TransportError>;

    fn mkdir(&mut self, path: &str, mode: i32) -> Result<(), TransportError>;

    fn rmdir(&mut self, path: &str) -> Result<(), TransportError>;

    fn remove(&mut self, path: &str) -> Result<(), TransportError>;

    fn stat(&mut self, path: &str) -> Result<FileAttributes, TransportError>;

    /// Cheap liveness probe used before handing out an idle session
    fn is_alive(&mut self) -> bool;

    /// Tear the session down; further calls fail with `Connection`
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for sessions
///
/// Implementations perform TCP connect, SSH handshake, authentication and
/// SFTP subsystem start-up in `connect`.
pub trait SftpTransport: Send + Sync + 'static {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn TransportSession>, TransportError>;
}
