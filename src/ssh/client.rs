//! Async SFTP facade over the pool, executor and retry policy
//!
//! Every operation is `retry(acquire -> blocking call -> release)`. A lease
//! whose call failed at the connection level goes back unhealthy and its
//! session is closed instead of reused.

use std::future::Future;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::{ClientConfig, validate_config};
use crate::error::{Result, SftpError};
use crate::ports::{
    ConnectParams, FileAttributes, RemoteDirEntry, RemoteFile, SftpTransport, TransportError,
    TransportErrorKind, TransportSession,
};

use super::executor::OpContext;
use super::libssh2::Ssh2Transport;
use super::plan::{TransferPlan, TransferSummary, normalize_remote};
use super::pool::{ConnectionKey, ConnectionPool, PoolConfig, PoolStats};
use super::progress::{ProgressCallback, ProgressReporter};
use super::retry::RetryPolicy;

/// Mode for directories created without an explicit one (before umask)
pub const DEFAULT_DIR_MODE: i32 = 0o777;

/// Mode for files created by uploads
pub const DEFAULT_FILE_MODE: i32 = 0o644;

struct ClientInner {
    config: ClientConfig,
    key: ConnectionKey,
    params: ConnectParams,
    pool: ConnectionPool,
    retry: RetryPolicy,
}

impl ClientInner {
    /// One attempt: lease a session, run `f` on a worker, return the lease.
    async fn attempt<T, F>(&self, op: &'static str, path: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn TransportSession) -> std::result::Result<T, TransportError>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let lease = self.pool.acquire(&self.key, &self.params).await?;
        let ctx = OpContext::new(op, path, &self.key);
        let result = self
            .pool
            .executor()
            .run_with_session(&ctx, lease.cell(), f)
            .await;

        let healthy = result.as_ref().err().is_none_or(|e| !e.is_connection_level());
        self.pool.release(lease, healthy);
        result
    }
}

/// Pooled, retrying SFTP client for one remote account
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct SftpClient {
    inner: Arc<ClientInner>,
}

impl SftpClient {
    /// Connect to a real server over SSH.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for a malformed config, or the error of the
    /// priming connection (after retries).
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(Ssh2Transport::new())).await
    }

    /// Build a client over any transport and open one session up front.
    ///
    /// Bad credentials or an unreachable host fail here rather than on the
    /// first operation.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` for a malformed config, or the error of the
    /// priming connection (after retries).
    pub async fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn SftpTransport>,
    ) -> Result<Self> {
        validate_config(&config)?;

        let key = ConnectionKey::from_config(&config);
        let params = ConnectParams::from_config(&config);
        let pool = ConnectionPool::new(PoolConfig::from_config(&config), transport);
        let retry = RetryPolicy::from_config(&config);

        let client = Self {
            inner: Arc::new(ClientInner {
                config,
                key,
                params,
                pool,
                retry,
            }),
        };

        if let Err(e) = client.prime().await {
            client.shutdown().await;
            return Err(e);
        }

        info!(
            key = %client.inner.key,
            max_connections = client.inner.pool.config().max_connections,
            "SFTP client ready"
        );
        Ok(client)
    }

    /// Run `f` with a fresh client and shut it down afterwards, whatever `f`
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the construction error or whatever `f` returned.
    pub async fn scoped<T, F, Fut>(
        config: ClientConfig,
        transport: Arc<dyn SftpTransport>,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let client = Self::with_transport(config, transport).await?;
        let result = f(client.clone()).await;
        client.shutdown().await;
        result
    }

    async fn prime(&self) -> Result<()> {
        let inner = &*self.inner;
        inner
            .retry
            .run("connect", || async move {
                let lease = inner.pool.acquire(&inner.key, &inner.params).await?;
                inner.pool.release(lease, true);
                Ok(())
            })
            .await
    }

    /// Close every pooled session. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.pool.shutdown().await;
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn key(&self) -> &ConnectionKey {
        &self.inner.key
    }

    async fn with_session<T, F>(&self, op: &'static str, path: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn TransportSession) -> std::result::Result<T, TransportError>
            + Clone
            + Send
            + Sync
            + 'static,
        T: Send + 'static,
    {
        let inner = &*self.inner;
        inner
            .retry
            .run(op, || {
                let f = f.clone();
                async move { inner.attempt(op, path, f).await }
            })
            .await
    }

    // ============== Single files ==============

    /// Upload `local` to `remote`, overwriting it. Returns bytes written.
    ///
    /// `progress` sees cumulative byte counts after every chunk. A retried
    /// upload starts again from zero.
    ///
    /// # Errors
    ///
    /// `FileNotFound` if `local` is missing, `InvalidPath` if it is not a
    /// regular file, otherwise the transfer or connection error.
    pub async fn put(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<u64> {
        let local = local.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&local)
            .await
            .map_err(|e| local_error("put", &local, &e))?;
        if !metadata.is_file() {
            return Err(SftpError::InvalidPath {
                path: local.display().to_string(),
                reason: "not a regular file".to_string(),
            });
        }

        let remote = normalize_remote(remote);
        let reporter = ProgressReporter::new(progress, remote.clone(), metadata.len());
        let chunk_size = self.inner.config.chunk_size;
        let started = Instant::now();

        let target = remote.clone();
        let bytes = self
            .with_session("put", &remote, move |session| {
                upload_file(session, &local, &target, chunk_size, &reporter)
            })
            .await?;

        debug!(
            remote = %remote,
            bytes,
            elapsed_ms = elapsed_ms(started),
            "Upload complete"
        );
        Ok(bytes)
    }

    /// Download `remote` to `local`, overwriting it. Returns bytes read.
    ///
    /// # Errors
    ///
    /// `FileNotFound` if `remote` is missing, otherwise the transfer or
    /// connection error.
    pub async fn get(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
        progress: Option<ProgressCallback>,
    ) -> Result<u64> {
        let local = local.as_ref().to_path_buf();
        let remote = normalize_remote(remote);
        let chunk_size = self.inner.config.chunk_size;
        let started = Instant::now();

        let source = remote.clone();
        let bytes = self
            .with_session("get", &remote, move |session| {
                download_file(session, &source, &local, chunk_size, progress)
            })
            .await?;

        debug!(
            remote = %remote,
            bytes,
            elapsed_ms = elapsed_ms(started),
            "Download complete"
        );
        Ok(bytes)
    }

    // ============== Directory and metadata ==============

    /// Entry names of a remote directory, without `.` and `..`.
    ///
    /// # Errors
    ///
    /// `FileNotFound` or `Permission` from the server.
    pub async fn listdir(&self, path: &str) -> Result<Vec<String>> {
        Ok(self
            .read_dir(path)
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    /// Entries of a remote directory with their attributes.
    ///
    /// # Errors
    ///
    /// `FileNotFound` or `Permission` from the server.
    pub async fn read_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>> {
        let path = normalize_remote(path);
        let target = path.clone();
        let entries = self
            .with_session("listdir", &path, move |session| session.read_dir(&target))
            .await?;
        Ok(entries
            .into_iter()
            .filter(|entry| entry.name != "." && entry.name != "..")
            .collect())
    }

    /// Create a directory with [`DEFAULT_DIR_MODE`].
    ///
    /// # Errors
    ///
    /// `Remote` if it already exists, `FileNotFound` if the parent is missing.
    pub async fn mkdir(&self, path: &str) -> Result<()> {
        self.mkdir_with_mode(path, DEFAULT_DIR_MODE).await
    }

    /// # Errors
    ///
    /// See [`mkdir`](Self::mkdir).
    pub async fn mkdir_with_mode(&self, path: &str, mode: i32) -> Result<()> {
        let path = normalize_remote(path);
        let target = path.clone();
        self.with_session("mkdir", &path, move |session| session.mkdir(&target, mode))
            .await
    }

    /// Remove an empty directory.
    ///
    /// # Errors
    ///
    /// `FileNotFound`, or `Remote` if the directory is not empty.
    pub async fn rmdir(&self, path: &str) -> Result<()> {
        let path = normalize_remote(path);
        let target = path.clone();
        self.with_session("rmdir", &path, move |session| session.rmdir(&target))
            .await
    }

    /// Remove a file.
    ///
    /// # Errors
    ///
    /// `FileNotFound` if it does not exist.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let path = normalize_remote(path);
        let target = path.clone();
        self.with_session("remove", &path, move |session| session.remove(&target))
            .await
    }

    /// # Errors
    ///
    /// `FileNotFound` if it does not exist.
    pub async fn stat(&self, path: &str) -> Result<FileAttributes> {
        let path = normalize_remote(path);
        let target = path.clone();
        self.with_session("stat", &path, move |session| session.stat(&target))
            .await
    }

    /// Whether `path` exists. An absent path is `false`, never an error.
    ///
    /// # Errors
    ///
    /// Any failure other than "no such file".
    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(SftpError::FileNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ============== Directory trees ==============

    /// Mirror a local directory tree onto the server.
    ///
    /// The whole tree is walked before anything is written. Directories are
    /// created before their contents; an existing remote directory is
    /// reused. The first failure aborts the transfer and whatever was
    /// already written stays in place.
    ///
    /// # Errors
    ///
    /// `FileNotFound` or `InvalidPath` for a bad `local`, otherwise the first
    /// step's error.
    pub async fn put_dir(
        &self,
        local: impl AsRef<Path>,
        remote: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<TransferSummary> {
        let local = local.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&local)
            .await
            .map_err(|e| local_error("put_dir", &local, &e))?;
        if !metadata.is_dir() {
            return Err(SftpError::InvalidPath {
                path: local.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }

        let remote = normalize_remote(remote);
        let ctx = OpContext::local("put_dir", local.display().to_string());
        let plan = {
            let (local, remote) = (local.clone(), remote.clone());
            self.inner
                .pool
                .executor()
                .run(&ctx, move || TransferPlan::from_local(&local, &remote))
                .await?
        };

        info!(
            local = %local.display(),
            remote = %remote,
            files = plan.file_count(),
            directories = plan.directory_count(),
            bytes = plan.total_bytes(),
            "Uploading directory"
        );

        let started = Instant::now();
        let mut summary = TransferSummary::default();
        for step in plan.steps() {
            if step.is_directory {
                if self.ensure_remote_dir(&step.remote_path).await? {
                    summary.directories_created += 1;
                }
            } else {
                summary.bytes_transferred += self
                    .put(&step.local_path, &step.remote_path, progress.clone())
                    .await?;
                summary.files_transferred += 1;
            }
        }
        summary.duration_ms = elapsed_ms(started);

        info!(
            remote = %remote,
            files = summary.files_transferred,
            bytes = summary.bytes_transferred,
            duration_ms = summary.duration_ms,
            "Directory upload complete"
        );
        Ok(summary)
    }

    /// Mirror a remote directory tree onto the local filesystem.
    ///
    /// Same ordering and failure rules as [`put_dir`](Self::put_dir).
    ///
    /// # Errors
    ///
    /// `FileNotFound` or `InvalidPath` for a bad `remote`, otherwise the first
    /// step's error.
    pub async fn get_dir(
        &self,
        remote: &str,
        local: impl AsRef<Path>,
        progress: Option<ProgressCallback>,
    ) -> Result<TransferSummary> {
        let local = local.as_ref().to_path_buf();
        let remote = normalize_remote(remote);

        if !self.stat(&remote).await?.is_dir() {
            return Err(SftpError::InvalidPath {
                path: remote,
                reason: "not a directory".to_string(),
            });
        }

        let plan = {
            let (root, target) = (remote.clone(), local.clone());
            self.with_session("get_dir", &remote, move |session| {
                TransferPlan::from_remote(session, &root, &target)
            })
            .await?
        };

        info!(
            remote = %remote,
            local = %local.display(),
            files = plan.file_count(),
            directories = plan.directory_count(),
            bytes = plan.total_bytes(),
            "Downloading directory"
        );

        let started = Instant::now();
        let mut summary = TransferSummary::default();
        for step in plan.steps() {
            if step.is_directory {
                if ensure_local_dir(&step.local_path).await? {
                    summary.directories_created += 1;
                }
            } else {
                summary.bytes_transferred += self
                    .get(&step.remote_path, &step.local_path, progress.clone())
                    .await?;
                summary.files_transferred += 1;
            }
        }
        summary.duration_ms = elapsed_ms(started);

        info!(
            local = %local.display(),
            files = summary.files_transferred,
            bytes = summary.bytes_transferred,
            duration_ms = summary.duration_ms,
            "Directory download complete"
        );
        Ok(summary)
    }

    /// Returns `true` if the directory had to be created.
    async fn ensure_remote_dir(&self, path: &str) -> Result<bool> {
        let target = path.to_string();
        self.with_session("mkdir", path, move |session| match session.stat(&target) {
            Ok(attrs) if attrs.is_dir() => Ok(false),
            Ok(_) => Err(TransportError::new(
                TransportErrorKind::Failure,
                "exists and is not a directory",
            )
            .with_path(target.as_str())),
            Err(e) if e.kind == TransportErrorKind::NotFound => {
                session.mkdir(&target, DEFAULT_DIR_MODE).map(|()| true)
            }
            Err(e) => Err(e),
        })
        .await
    }
}

impl std::fmt::Debug for SftpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpClient")
            .field("target", &self.inner.key.to_string())
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

/// Returns `true` if the directory had to be created.
async fn ensure_local_dir(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(false),
        Ok(_) => Err(SftpError::InvalidPath {
            path: path.display().to_string(),
            reason: "exists and is not a directory".to_string(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir(path)
                .await
                .map_err(|e| local_error("mkdir", path, &e))?;
            Ok(true)
        }
        Err(e) => Err(local_error("mkdir", path, &e)),
    }
}

fn local_error(op: &'static str, path: &Path, err: &std::io::Error) -> SftpError {
    OpContext::local(op, path.display().to_string()).translate(TransportError::local(path, err))
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

// ============== Blocking transfer loops ==============

/// Read until `buf` is full or the source is exhausted.
fn fill_local(
    file: &mut std::fs::File,
    path: &Path,
    buf: &mut [u8],
) -> std::result::Result<usize, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::local(path, &e)),
        }
    }
    Ok(filled)
}

fn fill_remote(
    file: &mut dyn RemoteFile,
    buf: &mut [u8],
) -> std::result::Result<usize, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn upload_file(
    session: &mut dyn TransportSession,
    local: &Path,
    remote: &str,
    chunk_size: usize,
    reporter: &ProgressReporter,
) -> std::result::Result<u64, TransportError> {
    let mut source = std::fs::File::open(local).map_err(|e| TransportError::local(local, &e))?;
    let mut target = session.open_write(remote, DEFAULT_FILE_MODE)?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent: u64 = 0;
    loop {
        let n = fill_local(&mut source, local, &mut buf)?;
        if n == 0 {
            break;
        }
        target.write_all(&buf[..n])?;
        sent += n as u64;
        reporter.report(sent);
    }
    target.close()?;

    if sent == 0 {
        reporter.report(0);
    }
    Ok(sent)
}

fn download_file(
    session: &mut dyn TransportSession,
    remote: &str,
    local: &Path,
    chunk_size: usize,
    progress: Option<ProgressCallback>,
) -> std::result::Result<u64, TransportError> {
    let total = session.stat(remote)?.size.unwrap_or(0);
    let reporter = ProgressReporter::new(progress, remote, total);

    let mut source = session.open_read(remote)?;
    let mut target = std::fs::File::create(local).map_err(|e| TransportError::local(local, &e))?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut received: u64 = 0;
    loop {
        let n = fill_remote(source.as_mut(), &mut buf)?;
        if n == 0 {
            break;
        }
        target
            .write_all(&buf[..n])
            .map_err(|e| TransportError::local(local, &e))?;
        received += n as u64;
        reporter.report(received);
    }
    target.flush().map_err(|e| TransportError::local(local, &e))?;
    source.close()?;

    if received == 0 {
        reporter.report(0);
    }
    Ok(received)
}
