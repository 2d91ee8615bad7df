use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

/// Snapshot passed to a progress callback after each chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    /// Cumulative bytes moved so far
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Remote path of the file being transferred
    pub path: String,
}

impl TransferProgress {
    /// Completed share in percent; an empty file counts as complete.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            100.0
        } else {
            self.bytes_transferred as f64 * 100.0 / self.total_bytes as f64
        }
    }
}

/// Progress callback signature
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Invokes an optional callback for one transfer.
///
/// A panicking callback is logged and otherwise ignored so it can never abort
/// the transfer it observes.
#[derive(Clone)]
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
    path: String,
    total_bytes: u64,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(callback: Option<ProgressCallback>, path: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            callback,
            path: path.into(),
            total_bytes,
        }
    }

    /// A reporter with no callback
    #[must_use]
    pub fn silent(path: impl Into<String>, total_bytes: u64) -> Self {
        Self::new(None, path, total_bytes)
    }

    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Report the cumulative byte count.
    pub fn report(&self, bytes_transferred: u64) {
        let Some(callback) = &self.callback else {
            return;
        };

        let progress = TransferProgress {
            bytes_transferred,
            total_bytes: self.total_bytes,
            path: self.path.clone(),
        };

        if catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
            warn!(
                path = %self.path,
                bytes_transferred,
                "Progress callback panicked, continuing transfer"
            );
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("path", &self.path)
            .field("total_bytes", &self.total_bytes)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
