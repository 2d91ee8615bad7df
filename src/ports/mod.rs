//! Ports module - Trait definitions for the transport boundary
//!
//! This module contains the traits that separate the pooling and retry
//! logic from the SSH library that actually moves bytes.

mod transport;

pub use transport::{
    ConnectParams, FileAttributes, RemoteDirEntry, RemoteFile, SftpTransport, TransportError,
    TransportErrorKind, TransportSession,
};
