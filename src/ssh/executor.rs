//! Blocking call offload
//!
//! Every transport call blocks its thread, so it runs on tokio's blocking
//! pool behind a semaphore that bounds how many are in flight. Transport
//! errors are translated into [`SftpError`] here and nowhere else.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{Result, SftpError};
use crate::ports::{TransportError, TransportErrorKind, TransportSession};

use super::pool::ConnectionKey;

/// A pooled transport session shared between the pool and worker threads.
///
/// `None` once the session has been closed.
pub(crate) type SessionCell = Arc<Mutex<Option<Box<dyn TransportSession>>>>;

pub(crate) fn new_cell(session: Box<dyn TransportSession>) -> SessionCell {
    Arc::new(Mutex::new(Some(session)))
}

/// Close the session held by `cell`, waiting for any in-flight call first.
pub(crate) fn close_cell_blocking(cell: &SessionCell) {
    let mut guard = cell.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(mut session) = guard.take()
        && let Err(e) = session.close()
    {
        warn!(error = %e, "Failed to close transport session");
    }
}

/// What a blocking call is doing, used to build error messages
#[derive(Debug, Clone)]
pub struct OpContext {
    pub op: &'static str,
    pub path: String,
    pub host: String,
    pub user: String,
}

impl OpContext {
    #[must_use]
    pub fn new(op: &'static str, path: impl Into<String>, key: &ConnectionKey) -> Self {
        Self {
            op,
            path: path.into(),
            host: key.hostname().to_string(),
            user: key.username().to_string(),
        }
    }

    /// Context for work on the local filesystem only
    #[must_use]
    pub fn local(op: &'static str, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            host: "localhost".to_string(),
            user: String::new(),
        }
    }

    /// Map a transport failure onto the domain taxonomy.
    #[must_use]
    pub fn translate(&self, err: TransportError) -> SftpError {
        let path = err.path.unwrap_or_else(|| self.path.clone());
        match err.kind {
            TransportErrorKind::NotFound => SftpError::FileNotFound { path },
            TransportErrorKind::PermissionDenied => SftpError::Permission {
                path,
                reason: err.message,
            },
            TransportErrorKind::Connection => SftpError::Connection {
                host: self.host.clone(),
                reason: err.message,
            },
            TransportErrorKind::Authentication => SftpError::Authentication {
                user: self.user.clone(),
                host: self.host.clone(),
                reason: err.message,
            },
            TransportErrorKind::Failure => SftpError::Remote {
                op: self.op.to_string(),
                path,
                reason: err.message,
            },
            TransportErrorKind::Io => SftpError::FileTransfer {
                reason: format!("{} {path}: {}", self.op, err.message),
            },
        }
    }
}

/// Runs blocking closures on worker threads, at most `max_workers` at once
#[derive(Debug, Clone)]
pub struct BlockingExecutor {
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl BlockingExecutor {
    /// `max_workers` is clamped to at least 1.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    #[must_use]
    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers currently free
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `f` on a worker thread and await its result.
    ///
    /// The permit travels with the closure, so a worker whose caller was
    /// cancelled still counts against the limit until it finishes.
    ///
    /// # Errors
    ///
    /// Returns the translated transport error, or `FileTransfer` if the worker
    /// panicked.
    pub async fn run<T, F>(&self, ctx: &OpContext, f: F) -> Result<T>
    where
        F: FnOnce() -> std::result::Result<T, TransportError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SftpError::Connection {
                host: ctx.host.clone(),
                reason: "blocking executor is closed".to_string(),
            })?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });

        match handle.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ctx.translate(e)),
            Err(join_err) => {
                warn!(op = ctx.op, path = %ctx.path, error = %join_err, "Blocking worker failed");
                Err(SftpError::FileTransfer {
                    reason: format!("{} {}: worker panicked", ctx.op, ctx.path),
                })
            }
        }
    }

    /// Like [`run`](Self::run), with exclusive access to a pooled session.
    ///
    /// # Errors
    ///
    /// Fails with `Connection` if the session was already closed.
    pub async fn run_with_session<T, F>(&self, ctx: &OpContext, cell: &SessionCell, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn TransportSession) -> std::result::Result<T, TransportError>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let cell = Arc::clone(cell);
        self.run(ctx, move || {
            let mut guard = cell.lock().map_err(|_| {
                TransportError::new(TransportErrorKind::Connection, "session poisoned by a panic")
            })?;
            let session = guard.as_mut().ok_or_else(|| {
                TransportError::new(TransportErrorKind::Connection, "session closed")
            })?;
            f(session.as_mut())
        })
        .await
    }
}
