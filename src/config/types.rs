use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Everything needed to build an [`SftpClient`](crate::ssh::SftpClient).
///
/// Only `hostname`, `username` and `auth` are required; every tuning knob has
/// a default.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub auth: AuthConfig,

    /// TCP connect and SSH handshake timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries after the first attempt (0 = exactly one attempt)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Upper bound for exponential backoff
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Maximum live sessions per connection key
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Bytes per read/write call during put/get
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Idle sessions older than this are closed instead of reused
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Sessions older than this are closed instead of reused
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// How long `acquire` waits for a free slot; `None` waits forever
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: Option<u64>,

    /// Maximum blocking transport calls in flight at once
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl ClientConfig {
    /// Minimal config with password authentication and default tuning.
    #[must_use]
    pub fn with_password(hostname: &str, username: &str, password: &str) -> Self {
        Self::new(
            hostname,
            username,
            AuthConfig::Password {
                password: Zeroizing::new(password.to_string()),
            },
        )
    }

    /// Minimal config with private key authentication and default tuning.
    #[must_use]
    pub fn with_key(hostname: &str, username: &str, key_path: &str) -> Self {
        Self::new(
            hostname,
            username,
            AuthConfig::Key {
                path: key_path.to_string(),
                passphrase: None,
            },
        )
    }

    #[must_use]
    pub fn new(hostname: &str, username: &str, auth: AuthConfig) -> Self {
        Self {
            hostname: hostname.to_string(),
            port: default_port(),
            username: username.to_string(),
            auth,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff: BackoffStrategy::default(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            max_connections: default_max_connections(),
            chunk_size: default_chunk_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_age_secs: default_max_age_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            max_workers: default_max_workers(),
        }
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    #[must_use]
    pub const fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    #[must_use]
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }

    /// `user@host:port`, used in log fields and error messages
    #[must_use]
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// How the transport authenticates.
///
/// Secrets are held in [`Zeroizing`] so they are wiped when the config is
/// dropped.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Password {
        password: Zeroizing<String>,
    },
    Key {
        path: String,
        #[serde(default)]
        passphrase: Option<Zeroizing<String>>,
    },
    Agent,
}

impl AuthConfig {
    /// Short label for logs; never includes secret material.
    #[must_use]
    pub const fn method_name(&self) -> &'static str {
        match self {
            Self::Password { .. } => "password",
            Self::Key { .. } => "key",
            Self::Agent => "agent",
        }
    }
}

/// Delay growth between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Always wait `retry_delay`
    Fixed,
    /// Wait `retry_delay * 2^attempt`, capped at `max_retry_delay`
    #[default]
    Exponential,
}

const fn default_port() -> u16 {
    22
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    1000
}

const fn default_max_retry_delay_ms() -> u64 {
    30_000
}

const fn default_max_connections() -> usize {
    4
}

/// 32 KiB, the largest payload most SFTP servers accept per write
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

const fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

const fn default_idle_timeout_secs() -> u64 {
    300 // 5 minutes
}

const fn default_max_age_secs() -> u64 {
    3600 // 1 hour
}

#[allow(clippy::unnecessary_wraps)]
const fn default_acquire_timeout_secs() -> Option<u64> {
    Some(30)
}

const fn default_max_workers() -> usize {
    8
}
