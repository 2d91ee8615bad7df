mod client;
mod executor;
mod libssh2;
pub mod memory;
mod plan;
mod pool;
mod progress;
mod retry;

pub use client::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, SftpClient};
pub use executor::{BlockingExecutor, OpContext};
pub use libssh2::Ssh2Transport;
pub use memory::MemoryTransport;
pub use plan::{TransferPlan, TransferStep, TransferSummary, join_remote, normalize_remote};
pub use pool::{ConnectionKey, ConnectionPool, PoolConfig, PoolStats, SessionLease, SessionState};
pub use progress::{ProgressCallback, ProgressReporter, TransferProgress};
pub use retry::RetryPolicy;
