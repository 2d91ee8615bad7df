//! Concurrent SFTP client with connection pooling
//!
//! [`SftpClient`] exposes async file operations over a blocking SFTP
//! transport. Sessions are pooled per connection key, blocking calls run on a
//! bounded worker pool and failed operations are retried with backoff.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod ports;
pub mod ssh;

pub use config::{AuthConfig, BackoffStrategy, ClientConfig};
pub use error::{ErrorKind, Result, SftpError};
pub use ports::{FileAttributes, RemoteDirEntry, SftpTransport};
pub use ssh::{
    ConnectionPool, MemoryTransport, ProgressCallback, SftpClient, Ssh2Transport,
    TransferProgress, TransferSummary,
};
