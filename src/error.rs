use thiserror::Error;

/// Coarse classification of an [`SftpError`].
///
/// Callers that only care about "what kind of failure" (retry classifiers,
/// the pool's health decision, CLI exit codes) match on this instead of the
/// full enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    PoolExhausted,
    Authentication,
    FileTransfer,
    FileNotFound,
    Permission,
    InvalidInput,
    Config,
    Io,
}

#[derive(Error, Debug)]
pub enum SftpError {
    // Connection errors
    #[error("SSH connection failed to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("Connection pool for {host} is shut down")]
    PoolClosed { host: String },

    #[error("Connection pool exhausted for {key} after waiting {waited_ms}ms")]
    PoolExhausted { key: String, waited_ms: u64 },

    #[error("SSH authentication failed for {user}@{host}: {reason}")]
    Authentication {
        user: String,
        host: String,
        reason: String,
    },

    // Transfer errors
    #[error("File transfer error: {reason}")]
    FileTransfer { reason: String },

    #[error("SFTP {op} failed for {path}: {reason}")]
    Remote {
        op: String,
        path: String,
        reason: String,
    },

    #[error("No such file: {path}")]
    FileNotFound { path: String },

    #[error("Permission denied for {path}: {reason}")]
    Permission { path: String, reason: String },

    #[error("{source} (gave up after {attempts} attempts)")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<SftpError>,
    },

    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid { field: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

impl SftpError {
    /// Classify this error.
    ///
    /// `RetriesExhausted` reports `Connection` when the wrapped failure was
    /// connection-level and `FileTransfer` otherwise.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::PoolClosed { .. } => ErrorKind::Connection,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::Authentication { .. } => ErrorKind::Authentication,
            Self::FileTransfer { .. } | Self::Remote { .. } => ErrorKind::FileTransfer,
            Self::FileNotFound { .. } => ErrorKind::FileNotFound,
            Self::Permission { .. } => ErrorKind::Permission,
            Self::RetriesExhausted { source, .. } => {
                if source.is_connection_level() {
                    ErrorKind::Connection
                } else {
                    ErrorKind::FileTransfer
                }
            }
            Self::InvalidPath { .. } => ErrorKind::InvalidInput,
            Self::Config(_) | Self::ConfigNotFound { .. } | Self::ConfigInvalid { .. } => {
                ErrorKind::Config
            }
            Self::Io(_) | Self::Yaml(_) => ErrorKind::Io,
        }
    }

    /// Network or handshake level failure.
    ///
    /// A session that produced one of these is not returned to the pool.
    /// `PoolExhausted` counts as connection-level.
    #[must_use]
    pub fn is_connection_level(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::PoolExhausted)
    }

    /// Whether another attempt may succeed.
    ///
    /// Connection-level failures and mid-stream transfer failures are
    /// transient. A closed pool never reopens, so `PoolClosed` is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::PoolExhausted { .. } | Self::FileTransfer { .. } => {
                true
            }
            _ => false,
        }
    }

    /// Attempts made before giving up, if this error came out of a retry loop.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// The innermost error, looking through `RetriesExhausted`.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, SftpError>;
