use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, ClientConfig};
use crate::error::{Result, SftpError};
use crate::ports::{ConnectParams, SftpTransport, TransportSession};

use super::executor::{BlockingExecutor, OpContext, SessionCell, close_cell_blocking, new_cell};

/// Identifies interchangeable sessions
///
/// Two configs produce the same key only if they target the same account with
/// the same credentials. The credential part is a truncated SHA-256 digest, so
/// keys are safe to log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    hostname: String,
    port: u16,
    username: String,
    auth_fingerprint: String,
}

impl ConnectionKey {
    #[must_use]
    pub fn new(hostname: &str, port: u16, username: &str, auth: &AuthConfig) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
            username: username.to_string(),
            auth_fingerprint: auth_fingerprint(auth),
        }
    }

    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(&config.hostname, config.port, &config.username, &config.auth)
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[must_use]
    pub fn auth_fingerprint(&self) -> &str {
        &self.auth_fingerprint
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
    }
}

fn auth_fingerprint(auth: &AuthConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(auth.method_name().as_bytes());
    hasher.update([0u8]);
    match auth {
        AuthConfig::Password { password } => hasher.update(password.as_bytes()),
        AuthConfig::Key { path, passphrase } => {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            if let Some(passphrase) = passphrase {
                hasher.update(passphrase.as_bytes());
            }
        }
        AuthConfig::Agent => {}
    }
    let digest = hasher.finalize();
    const_hex::encode(&digest[..8])
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum live sessions per key
    pub max_connections: usize,
    /// Idle sessions unused for longer are closed instead of reused
    pub idle_timeout: Duration,
    /// Sessions older than this are closed instead of reused
    pub max_age: Duration,
    /// How long `acquire` waits for a free slot; `None` waits forever
    pub acquire_timeout: Option<Duration>,
    /// Maximum blocking transport calls in flight
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            idle_timeout: Duration::from_secs(300), // 5 minutes
            max_age: Duration::from_secs(3600),     // 1 hour
            acquire_timeout: Some(Duration::from_secs(30)),
            max_workers: 8,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            max_age: Duration::from_secs(config.max_age_secs),
            acquire_timeout: config.acquire_timeout(),
            max_workers: config.max_workers,
        }
    }
}

/// Lifecycle state of a pooled session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    InUse,
    /// Being closed; never handed out, still holds its slot until the close finishes
    Broken,
}

struct PooledSession {
    id: u64,
    cell: SessionCell,
    created_at: Instant,
    last_used: Instant,
    state: SessionState,
}

impl PooledSession {
    fn new(id: u64, cell: SessionCell) -> Self {
        let now = Instant::now();
        Self {
            id,
            cell,
            created_at: now,
            last_used: now,
            state: SessionState::InUse,
        }
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn is_expired(&self, config: &PoolConfig) -> bool {
        self.idle_time() > config.idle_timeout || self.age() > config.max_age
    }
}

#[derive(Default)]
struct KeySlots {
    sessions: Vec<PooledSession>,
    /// Slots reserved by connects still in flight
    connecting: usize,
}

impl KeySlots {
    fn live(&self) -> usize {
        self.sessions.len() + self.connecting
    }

    fn count(&self, state: SessionState) -> usize {
        self.sessions.iter().filter(|s| s.state == state).count()
    }

    fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.connecting == 0
    }

    /// Mark expired idle sessions as closing; the caller retires them.
    fn expire(&mut self, key: &ConnectionKey, config: &PoolConfig, expired: &mut Vec<Retiring>) {
        for session in &mut self.sessions {
            if session.state == SessionState::Idle && session.is_expired(config) {
                session.state = SessionState::Broken;
                expired.push((key.clone(), session.id, Arc::clone(&session.cell)));
            }
        }
    }
}

/// A session on its way out of the pool
type Retiring = (ConnectionKey, u64, SessionCell);

enum Checkout {
    Closed,
    Reuse(u64, SessionCell),
    Connect,
    Full,
}

#[derive(Default)]
struct Registry {
    keys: HashMap<ConnectionKey, KeySlots>,
    closed: bool,
    next_id: u64,
}

impl Registry {
    fn checkout(
        &mut self,
        key: &ConnectionKey,
        config: &PoolConfig,
        expired: &mut Vec<Retiring>,
    ) -> Checkout {
        if self.closed {
            return Checkout::Closed;
        }

        let slots = self.keys.entry(key.clone()).or_default();
        slots.expire(key, config, expired);

        // Most recently used first, so surplus sessions age out
        if let Some(session) = slots
            .sessions
            .iter_mut()
            .rev()
            .find(|s| s.state == SessionState::Idle)
        {
            session.state = SessionState::InUse;
            return Checkout::Reuse(session.id, Arc::clone(&session.cell));
        }

        if slots.live() < config.max_connections {
            slots.connecting += 1;
            return Checkout::Connect;
        }

        Checkout::Full
    }

    fn take_all(&mut self) -> Vec<SessionCell> {
        self.keys
            .drain()
            .flat_map(|(_, slots)| slots.sessions.into_iter().map(|s| s.cell))
            .collect()
    }
}

struct PoolInner {
    registry: Mutex<Registry>,
    released: Notify,
    executor: BlockingExecutor,
    transport: Arc<dyn SftpTransport>,
    config: PoolConfig,
}

impl PoolInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand a leased session back.
    fn finish(self: &Arc<Self>, key: &ConnectionKey, id: u64, healthy: bool, touch: bool) {
        let to_close = {
            let mut registry = self.registry();
            let closed = registry.closed;
            registry
                .keys
                .get_mut(key)
                .and_then(|slots| slots.sessions.iter_mut().find(|s| s.id == id))
                .and_then(|session| {
                    if healthy && !closed {
                        session.state = SessionState::Idle;
                        if touch {
                            session.last_used = Instant::now();
                        }
                        None
                    } else {
                        session.state = SessionState::Broken;
                        Some(Arc::clone(&session.cell))
                    }
                })
        };

        match to_close {
            Some(cell) => {
                debug!(key = %key, session = id, "Session will not return to pool, closing");
                self.retire(key.clone(), id, cell);
            }
            None => self.released.notify_waiters(),
        }
    }

    /// Close a session, then free its slot and wake waiters.
    ///
    /// The close waits for any call still running on the session, so the
    /// slot stays taken until the transport session is really gone.
    fn retire(self: &Arc<Self>, key: ConnectionKey, id: u64, cell: SessionCell) {
        let inner = Arc::clone(self);
        let close = move || {
            close_cell_blocking(&cell);
            inner.forget(&key, id);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(close)),
            Err(_) => close(),
        }
    }

    fn forget(&self, key: &ConnectionKey, id: u64) {
        {
            let mut registry = self.registry();
            let empty = registry.keys.get_mut(key).is_some_and(|slots| {
                slots.sessions.retain(|s| s.id != id);
                slots.is_empty()
            });
            if empty {
                registry.keys.remove(key);
            }
        }
        self.released.notify_waiters();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let cells = self.registry().take_all();
        for cell in cells {
            close_detached(cell);
        }
    }
}

/// Close a session without waiting for it.
fn close_detached(cell: SessionCell) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            drop(handle.spawn_blocking(move || close_cell_blocking(&cell)));
        }
        Err(_) => close_cell_blocking(&cell),
    }
}

fn shut_down_error(key: &ConnectionKey) -> SftpError {
    SftpError::PoolClosed {
        host: key.hostname().to_string(),
    }
}

/// Returns a reserved connect slot if the connect never completes.
struct ConnectReservation<'a> {
    inner: &'a PoolInner,
    key: &'a ConnectionKey,
    armed: bool,
}

impl ConnectReservation<'_> {
    fn complete(mut self, session: Box<dyn TransportSession>) -> Option<(u64, SessionCell)> {
        self.armed = false;
        let cell = new_cell(session);

        let mut registry = self.inner.registry();
        let closed = registry.closed;
        let id = registry.next_id;
        registry.next_id += 1;

        if let Some(slots) = registry.keys.get_mut(self.key) {
            slots.connecting = slots.connecting.saturating_sub(1);
            if !closed {
                slots.sessions.push(PooledSession::new(id, Arc::clone(&cell)));
                return Some((id, cell));
            }
        }
        drop(registry);

        close_detached(cell);
        self.inner.released.notify_waiters();
        None
    }
}

impl Drop for ConnectReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(slots) = self.inner.registry().keys.get_mut(self.key) {
                slots.connecting = slots.connecting.saturating_sub(1);
            }
            self.inner.released.notify_waiters();
        }
    }
}

/// Statistics about the connection pool
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Idle plus in-use sessions
    pub total_sessions: usize,
    pub idle: usize,
    pub in_use: usize,
    pub connecting: usize,
    /// Sessions still closing; they count against `max_connections`
    pub closing: usize,
    pub sessions_by_key: HashMap<String, usize>,
}

/// Bounded, keyed pool of transport sessions
///
/// Cloning is cheap and every clone shares the same sessions.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a new connection pool
    ///
    /// If `max_connections` is 0, it is clamped to 1.
    #[must_use]
    pub fn new(mut config: PoolConfig, transport: Arc<dyn SftpTransport>) -> Self {
        config.max_connections = config.max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                registry: Mutex::new(Registry::default()),
                released: Notify::new(),
                executor: BlockingExecutor::new(config.max_workers),
                transport,
                config,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The executor sessions are driven through
    #[must_use]
    pub fn executor(&self) -> &BlockingExecutor {
        &self.inner.executor
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.registry().closed
    }

    /// Lease a session for `key`, creating one if a slot is free.
    ///
    /// # Errors
    ///
    /// - `Connection` / `Authentication` if a new session cannot be opened
    /// - `PoolExhausted` if no slot frees up before the acquire timeout
    /// - `PoolClosed` if the pool has been shut down
    pub async fn acquire(&self, key: &ConnectionKey, params: &ConnectParams) -> Result<SessionLease> {
        let inner = &self.inner;
        let started = Instant::now();
        let deadline = inner.config.acquire_timeout.map(|t| started + t);

        loop {
            // Register interest before inspecting state so a release in
            // between is not missed
            let notified = inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut expired = Vec::new();
            let checkout = inner.registry().checkout(key, &inner.config, &mut expired);
            if !expired.is_empty() {
                debug!(key = %key, closed = expired.len(), "Closing expired idle sessions");
                for (expired_key, id, cell) in expired {
                    inner.retire(expired_key, id, cell);
                }
            }

            match checkout {
                Checkout::Closed => return Err(shut_down_error(key)),
                Checkout::Reuse(id, cell) => {
                    let lease = SessionLease::new(Arc::clone(inner), key.clone(), id, cell);
                    if self.probe(&lease).await {
                        debug!(key = %key, session = id, "Reusing pooled session");
                        return Ok(lease);
                    }
                    warn!(key = %key, session = id, "Pooled session is dead, discarding");
                    self.release(lease, false);
                }
                Checkout::Connect => {
                    let reservation = ConnectReservation {
                        inner,
                        key,
                        armed: true,
                    };
                    info!(key = %key, "Opening new SFTP session");
                    let session = self.open_session(key, params).await?;
                    return match reservation.complete(session) {
                        Some((id, cell)) => {
                            Ok(SessionLease::new(Arc::clone(inner), key.clone(), id, cell))
                        }
                        None => Err(shut_down_error(key)),
                    };
                }
                Checkout::Full => {
                    debug!(key = %key, "Pool full, waiting for a released session");
                    match deadline {
                        Some(deadline) => {
                            if timeout_at(deadline, notified).await.is_err() {
                                let waited_ms =
                                    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                                warn!(key = %key, waited_ms, "Timed out waiting for a pooled session");
                                return Err(SftpError::PoolExhausted {
                                    key: key.to_string(),
                                    waited_ms,
                                });
                            }
                        }
                        None => notified.await,
                    }
                }
            }
        }
    }

    /// Return a leased session.
    ///
    /// A healthy session goes back to the idle set; an unhealthy one is
    /// closed on a worker and keeps counting against the key's budget until
    /// that close has finished.
    pub fn release(&self, mut lease: SessionLease, healthy: bool) {
        lease.released = true;
        self.inner.finish(&lease.key, lease.id, healthy, true);
    }

    async fn open_session(
        &self,
        key: &ConnectionKey,
        params: &ConnectParams,
    ) -> Result<Box<dyn TransportSession>> {
        let transport = Arc::clone(&self.inner.transport);
        let params = params.clone();
        let ctx = OpContext::new("connect", key.to_string(), key);
        self.inner
            .executor
            .run(&ctx, move || transport.connect(&params))
            .await
    }

    async fn probe(&self, lease: &SessionLease) -> bool {
        let ctx = OpContext::new("probe", lease.key.to_string(), &lease.key);
        matches!(
            self.inner
                .executor
                .run_with_session(&ctx, &lease.cell, |session| Ok(session.is_alive()))
                .await,
            Ok(true)
        )
    }

    /// Close expired idle sessions, without any I/O beyond the closes.
    pub fn cleanup(&self) -> usize {
        let mut expired = Vec::new();
        {
            let mut registry = self.inner.registry();
            for (key, slots) in &mut registry.keys {
                slots.expire(key, &self.inner.config, &mut expired);
            }
            registry.keys.retain(|_, slots| !slots.is_empty());
        }

        let removed = expired.len();
        for (key, id, cell) in expired {
            self.inner.retire(key, id, cell);
        }

        if removed > 0 {
            info!(removed, "Cleaned up expired sessions");
        }
        removed
    }

    /// Actively probe every idle session and close the dead ones
    ///
    /// Unlike `cleanup()` this runs a liveness check on each session, so it
    /// catches connections dropped by the network or a server restart.
    pub async fn health_check(&self) -> usize {
        let candidates: Vec<(ConnectionKey, u64, SessionCell)> = {
            let mut registry = self.inner.registry();
            if registry.closed {
                return 0;
            }
            registry
                .keys
                .iter_mut()
                .flat_map(|(key, slots)| {
                    slots
                        .sessions
                        .iter_mut()
                        .filter(|s| s.state == SessionState::Idle)
                        .map(move |s| {
                            s.state = SessionState::InUse;
                            (key.clone(), s.id, Arc::clone(&s.cell))
                        })
                })
                .collect()
        };

        let mut dead = 0;
        for (key, id, cell) in candidates {
            let mut lease = SessionLease::new(Arc::clone(&self.inner), key, id, cell);
            let alive = self.probe(&lease).await;
            if !alive {
                warn!(key = %lease.key, session = id, "Dead session removed during health check");
                dead += 1;
            }
            lease.released = true;
            self.inner.finish(&lease.key, id, alive, false);
        }

        if dead > 0 {
            info!(removed = dead, "Health check completed, removed dead sessions");
        } else {
            debug!("Health check completed, all sessions healthy");
        }
        dead
    }

    /// Get pool statistics
    #[must_use = "pool stats should be used for monitoring or logging"]
    pub fn stats(&self) -> PoolStats {
        let registry = self.inner.registry();
        let mut stats = PoolStats::default();

        for (key, slots) in &registry.keys {
            let idle = slots.count(SessionState::Idle);
            let in_use = slots.count(SessionState::InUse);
            stats.idle += idle;
            stats.in_use += in_use;
            stats.connecting += slots.connecting;
            stats.closing += slots.count(SessionState::Broken);
            if idle + in_use > 0 {
                stats.sessions_by_key.insert(key.to_string(), idle + in_use);
            }
        }
        drop(registry);

        stats.total_sessions = stats.idle + stats.in_use;
        stats
    }

    /// Close every session regardless of state.
    ///
    /// Idempotent. Leases still out are closed when they come back, and
    /// further acquires fail.
    pub async fn shutdown(&self) {
        let cells = {
            let mut registry = self.inner.registry();
            registry.closed = true;
            registry.take_all()
        };
        self.inner.released.notify_waiters();

        let count = cells.len();
        let handles: Vec<_> = cells
            .into_iter()
            .map(|cell| tokio::task::spawn_blocking(move || close_cell_blocking(&cell)))
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Session close task failed");
            }
        }

        if count > 0 {
            info!(closed = count, "Connection pool shut down");
        } else {
            debug!("Connection pool shut down, no sessions open");
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Exclusive use of one pooled session for one operation
///
/// Give it back with [`ConnectionPool::release`]. A lease dropped without
/// being released (cancellation, panic) is treated as unhealthy.
pub struct SessionLease {
    pool: Arc<PoolInner>,
    key: ConnectionKey,
    id: u64,
    cell: SessionCell,
    released: bool,
}

impl SessionLease {
    fn new(pool: Arc<PoolInner>, key: ConnectionKey, id: u64, cell: SessionCell) -> Self {
        Self {
            pool,
            key,
            id,
            cell,
            released: false,
        }
    }

    #[must_use]
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cell(&self) -> &SessionCell {
        &self.cell
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(key = %self.key, session = self.id, "Session lease dropped without release");
            self.pool.finish(&self.key, self.id, false, false);
        }
    }
}
