//! In-process transport
//!
//! Keeps a virtual filesystem in memory and can inject connect, auth and
//! per-operation faults. Used by the test-suite and the benchmarks.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::ports::{
    ConnectParams, FileAttributes, RemoteDirEntry, RemoteFile, SftpTransport, TransportError,
    TransportErrorKind, TransportSession,
};

use super::plan::normalize_remote;

const DEFAULT_DIR_MODE: u32 = 0o755;
const DEFAULT_FILE_MODE: u32 = 0o644;
const S_IFDIR: u32 = 0o040_000;
const S_IFREG: u32 = 0o100_000;

#[derive(Debug, Clone)]
enum Node {
    Dir { mode: u32, mtime: u64 },
    File { data: Vec<u8>, mode: u32, mtime: u64 },
}

impl Node {
    fn attrs(&self) -> FileAttributes {
        match self {
            Self::Dir { mode, mtime } => FileAttributes {
                size: Some(0),
                permissions: Some(S_IFDIR | mode),
                mtime: Some(*mtime),
                atime: Some(*mtime),
                uid: Some(1000),
                gid: Some(1000),
            },
            Self::File { data, mode, mtime } => FileAttributes {
                size: Some(data.len() as u64),
                permissions: Some(S_IFREG | mode),
                mtime: Some(*mtime),
                atime: Some(*mtime),
                uid: Some(1000),
                gid: Some(1000),
            },
        }
    }
}

#[derive(Default)]
struct Faults {
    connect_failures: VecDeque<TransportErrorKind>,
    reject_auth: bool,
    op_failures: VecDeque<TransportErrorKind>,
    write_failures: HashMap<String, TransportErrorKind>,
    denied: Vec<String>,
    connect_delay: Duration,
    op_delay: Duration,
}

struct State {
    nodes: Mutex<BTreeMap<String, Node>>,
    faults: Mutex<Faults>,
    log: Mutex<Vec<String>>,
    connects: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
    /// Sessions created before this generation report themselves dead
    kill_generation: AtomicU64,
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Resolve a remote path against the virtual root.
fn resolve(path: &str) -> String {
    let normalized = normalize_remote(path);
    let trimmed = normalized
        .strip_prefix("./")
        .unwrap_or(&normalized)
        .trim_start_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn err(kind: TransportErrorKind, message: &str, path: &str) -> TransportError {
    TransportError::new(kind, message).with_path(path)
}

/// Shared in-memory SFTP server
///
/// Clones share the same filesystem, counters and fault plan.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<State>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// An empty server with only `/`.
    #[must_use]
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node::Dir {
                mode: DEFAULT_DIR_MODE,
                mtime: now_secs(),
            },
        );
        Self {
            state: Arc::new(State {
                nodes: Mutex::new(nodes),
                faults: Mutex::new(Faults::default()),
                log: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                kill_generation: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    // ============== Seeding and inspection ==============

    /// Create a file, creating missing parent directories.
    pub fn add_file(&self, path: &str, data: &[u8]) {
        let path = resolve(path);
        let mut nodes = lock(&self.state.nodes);
        Self::create_parents(&mut nodes, &path);
        nodes.insert(
            path,
            Node::File {
                data: data.to_vec(),
                mode: DEFAULT_FILE_MODE,
                mtime: now_secs(),
            },
        );
    }

    /// Create a directory and any missing parents.
    pub fn add_dir(&self, path: &str) {
        let path = resolve(path);
        let mut nodes = lock(&self.state.nodes);
        Self::create_parents(&mut nodes, &path);
        nodes.entry(path).or_insert(Node::Dir {
            mode: DEFAULT_DIR_MODE,
            mtime: now_secs(),
        });
    }

    fn create_parents(nodes: &mut BTreeMap<String, Node>, path: &str) {
        let mut current = String::new();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            current.push('/');
            current.push_str(segment);
            nodes.entry(current.clone()).or_insert(Node::Dir {
                mode: DEFAULT_DIR_MODE,
                mtime: now_secs(),
            });
        }
    }

    #[must_use]
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match lock(&self.state.nodes).get(&resolve(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_dir(&self, path: &str) -> bool {
        matches!(
            lock(&self.state.nodes).get(&resolve(path)),
            Some(Node::Dir { .. })
        )
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        lock(&self.state.nodes).contains_key(&resolve(path))
    }

    /// Mutating calls in the order they were applied, e.g. `mkdir /a`,
    /// `write /a/x.txt`, `rmdir /a`.
    #[must_use]
    pub fn operation_log(&self) -> Vec<String> {
        lock(&self.state.log).clone()
    }

    /// Sessions opened so far
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Sessions currently open
    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Largest number of sessions ever open at once
    #[must_use]
    pub fn peak_sessions(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    // ============== Fault injection ==============

    /// The next `count` connects fail with `kind`.
    pub fn fail_next_connects(&self, count: usize, kind: TransportErrorKind) {
        lock(&self.state.faults)
            .connect_failures
            .extend(std::iter::repeat_n(kind, count));
    }

    /// Reject every login while set.
    pub fn reject_auth(&self, reject: bool) {
        lock(&self.state.faults).reject_auth = reject;
    }

    /// The next `count` session calls fail with `kind`.
    pub fn fail_next_ops(&self, count: usize, kind: TransportErrorKind) {
        lock(&self.state.faults)
            .op_failures
            .extend(std::iter::repeat_n(kind, count));
    }

    /// Opening `path` for writing fails with `kind` until cleared.
    pub fn fail_writes_to(&self, path: &str, kind: TransportErrorKind) {
        lock(&self.state.faults)
            .write_failures
            .insert(resolve(path), kind);
    }

    pub fn clear_write_failures(&self) {
        lock(&self.state.faults).write_failures.clear();
    }

    /// Any access at or below `path` is denied.
    pub fn deny(&self, path: &str) {
        lock(&self.state.faults).denied.push(resolve(path));
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.state.faults).connect_delay = delay;
    }

    /// Every session call sleeps this long, simulating network latency.
    pub fn set_op_delay(&self, delay: Duration) {
        lock(&self.state.faults).op_delay = delay;
    }

    /// Make every session opened so far fail its liveness check.
    pub fn kill_sessions(&self) {
        let current = self.state.generation.load(Ordering::SeqCst);
        self.state
            .kill_generation
            .store(current + 1, Ordering::SeqCst);
    }
}

impl SftpTransport for MemoryTransport {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn TransportSession>, TransportError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let (delay, failure, reject) = {
            let mut faults = lock(&self.state.faults);
            (
                faults.connect_delay,
                faults.connect_failures.pop_front(),
                faults.reject_auth,
            )
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(kind) = failure {
            return Err(TransportError::new(
                kind,
                format!("injected connect failure to {}", params.hostname),
            ));
        }
        if reject {
            return Err(TransportError::new(
                TransportErrorKind::Authentication,
                format!("{} authentication rejected", params.auth.method_name()),
            ));
        }

        let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(live, Ordering::SeqCst);
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            generation,
            closed: false,
        }))
    }
}

struct MemorySession {
    state: Arc<State>,
    generation: u64,
    closed: bool,
}

impl MemorySession {
    /// Shared preamble of every call: closed check, latency, injected faults.
    fn enter(&self, path: &str) -> Result<String, TransportError> {
        if self.closed {
            return Err(err(TransportErrorKind::Connection, "session closed", path));
        }
        let path = resolve(path);
        let (delay, failure, denied) = {
            let mut faults = lock(&self.state.faults);
            let denied = faults
                .denied
                .iter()
                .any(|d| path == *d || path.starts_with(&format!("{}/", d.trim_end_matches('/'))));
            (faults.op_delay, faults.op_failures.pop_front(), denied)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(kind) = failure {
            return Err(err(kind, "injected failure", &path));
        }
        if denied {
            return Err(err(TransportErrorKind::PermissionDenied, "permission denied", &path));
        }
        Ok(path)
    }

    fn record(&self, entry: String) {
        lock(&self.state.log).push(entry);
    }

    fn require_parent_dir(nodes: &BTreeMap<String, Node>, path: &str) -> Result<(), TransportError> {
        match nodes.get(parent_of(path)) {
            Some(Node::Dir { .. }) => Ok(()),
            Some(Node::File { .. }) => Err(err(
                TransportErrorKind::Failure,
                "parent is not a directory",
                path,
            )),
            None => Err(err(TransportErrorKind::NotFound, "no such file", path)),
        }
    }

    fn has_children(nodes: &BTreeMap<String, Node>, path: &str) -> bool {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .any(|(k, _)| k != path)
    }
}

impl TransportSession for MemorySession {
    fn open_read(&mut self, path: &str) -> Result<Box<dyn RemoteFile>, TransportError> {
        let path = self.enter(path)?;
        match lock(&self.state.nodes).get(&path) {
            Some(Node::File { data, .. }) => Ok(Box::new(MemoryFile {
                state: Arc::clone(&self.state),
                path,
                data: data.clone(),
                pos: 0,
                writable: false,
            })),
            Some(Node::Dir { .. }) => Err(err(TransportErrorKind::Failure, "is a directory", &path)),
            None => Err(err(TransportErrorKind::NotFound, "no such file", &path)),
        }
    }

    fn open_write(&mut self, path: &str, mode: i32) -> Result<Box<dyn RemoteFile>, TransportError> {
        let path = self.enter(path)?;
        if let Some(kind) = lock(&self.state.faults).write_failures.get(&path).copied() {
            return Err(err(kind, "injected write failure", &path));
        }

        {
            let mut nodes = lock(&self.state.nodes);
            Self::require_parent_dir(&nodes, &path)?;
            if matches!(nodes.get(&path), Some(Node::Dir { .. })) {
                return Err(err(TransportErrorKind::Failure, "is a directory", &path));
            }
            nodes.insert(
                path.clone(),
                Node::File {
                    data: Vec::new(),
                    mode: u32::try_from(mode).unwrap_or(DEFAULT_FILE_MODE) & 0o7777,
                    mtime: now_secs(),
                },
            );
        }
        self.record(format!("write {path}"));

        Ok(Box::new(MemoryFile {
            state: Arc::clone(&self.state),
            path,
            data: Vec::new(),
            pos: 0,
            writable: true,
        }))
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>, TransportError> {
        let path = self.enter(path)?;
        let nodes = lock(&self.state.nodes);
        match nodes.get(&path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => {
                return Err(err(TransportErrorKind::Failure, "not a directory", &path));
            }
            None => return Err(err(TransportErrorKind::NotFound, "no such file", &path)),
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, node)| {
                let name = &k[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| RemoteDirEntry {
                    name: name.to_string(),
                    attrs: node.attrs(),
                })
            })
            .collect())
    }

    fn mkdir(&mut self, path: &str, mode: i32) -> Result<(), TransportError> {
        let path = self.enter(path)?;
        {
            let mut nodes = lock(&self.state.nodes);
            if nodes.contains_key(&path) {
                return Err(err(TransportErrorKind::Failure, "already exists", &path));
            }
            Self::require_parent_dir(&nodes, &path)?;
            nodes.insert(
                path.clone(),
                Node::Dir {
                    mode: u32::try_from(mode).unwrap_or(DEFAULT_DIR_MODE) & 0o7777,
                    mtime: now_secs(),
                },
            );
        }
        self.record(format!("mkdir {path}"));
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> Result<(), TransportError> {
        let path = self.enter(path)?;
        {
            let mut nodes = lock(&self.state.nodes);
            match nodes.get(&path) {
                Some(Node::Dir { .. }) => {}
                Some(Node::File { .. }) => {
                    return Err(err(TransportErrorKind::Failure, "not a directory", &path));
                }
                None => return Err(err(TransportErrorKind::NotFound, "no such file", &path)),
            }
            if path == "/" || Self::has_children(&nodes, &path) {
                return Err(err(TransportErrorKind::Failure, "directory not empty", &path));
            }
            nodes.remove(&path);
        }
        self.record(format!("rmdir {path}"));
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), TransportError> {
        let path = self.enter(path)?;
        {
            let mut nodes = lock(&self.state.nodes);
            match nodes.get(&path) {
                Some(Node::File { .. }) => {
                    nodes.remove(&path);
                }
                Some(Node::Dir { .. }) => {
                    return Err(err(TransportErrorKind::Failure, "is a directory", &path));
                }
                None => return Err(err(TransportErrorKind::NotFound, "no such file", &path)),
            }
        }
        self.record(format!("remove {path}"));
        Ok(())
    }

    fn stat(&mut self, path: &str) -> Result<FileAttributes, TransportError> {
        let path = self.enter(path)?;
        lock(&self.state.nodes)
            .get(&path)
            .map(Node::attrs)
            .ok_or_else(|| err(TransportErrorKind::NotFound, "no such file", &path))
    }

    fn is_alive(&mut self) -> bool {
        !self.closed && self.generation >= self.state.kill_generation.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.state.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct MemoryFile {
    state: Arc<State>,
    path: String,
    data: Vec<u8>,
    pos: usize,
    writable: bool,
}

impl RemoteFile for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let remaining = &self.data[self.pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.writable {
            return Err(err(TransportErrorKind::Failure, "opened read-only", &self.path));
        }
        let failure = lock(&self.state.faults).op_failures.pop_front();
        if let Some(kind) = failure {
            return Err(err(kind, "injected failure mid-transfer", &self.path));
        }
        match lock(&self.state.nodes).get_mut(&self.path) {
            Some(Node::File { data: stored, .. }) => {
                stored.extend_from_slice(data);
                Ok(data.len())
            }
            _ => Err(err(TransportErrorKind::Io, "file vanished during write", &self.path)),
        }
    }

    fn close(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}
