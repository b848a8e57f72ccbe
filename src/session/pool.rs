use super::*;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

/// Configures the connection pool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PoolConfig {
    /// Maximum concurrent sessions (briefly exceedable only during
    /// concurrent-creation races, never in accounting).
    pub max_sessions: usize,
    /// Idle sessions older than this are reaped; one stays warm.
    pub idle_timeout: Duration,
    /// Maximum wait in `acquire` before failing with pool exhaustion.
    pub acquire_timeout: Duration,
    /// Runs the background idle reaper. Disabled by tests.
    pub run_idle_reaper: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 2,
            idle_timeout: Duration::from_secs(5 * 60),
            acquire_timeout: Duration::from_secs(30),
            run_idle_reaper: true,
        }
    }
}

/// Pool usage statistics. Safe to read concurrently via
/// [`ConnectionPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
pub struct PoolStats {
    /// Sessions successfully created over the pool's lifetime.
    pub total_created: u64,
    /// Successful acquisitions over the pool's lifetime.
    pub total_acquisitions: u64,
    /// Sessions currently checked out.
    pub in_use: usize,
    /// Sessions currently idle in the pool.
    pub available: usize,
    /// Configured session bound.
    pub max_sessions: usize,
    /// Times an acquire had to wait for capacity.
    pub wait_count: u64,
}

/// A session checked out of (or idle inside) the pool.
///
/// While checked out the caller owns it exclusively; handing it back via
/// [`ConnectionPool::release`] or [`ConnectionPool::discard`] is the only
/// way to end a checkout; callers never close a connection directly.
#[derive(Debug)]
pub struct PooledConnection {
    session: InteractiveSession,
    pool_id: String,
    /// Identity of the owning pool; foreign connections are rejected by
    /// release/discard.
    pool_tag: usize,
    last_used: Instant,
    use_count: u64,
    initialized: bool,
    elevation_hash: Option<[u8; 32]>,
}

impl PooledConnection {
    /// Stable identifier assigned at creation.
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Number of times this connection has been acquired.
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    /// Whether the session finished its banner/setup phase.
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// Whether the underlying session holds privileged mode.
    pub fn privileged(&self) -> bool {
        self.session.privileged()
    }

    /// Executes a command on the underlying session.
    pub async fn send(&mut self, command: &str) -> Result<Vec<u8>, SessionError> {
        self.session.send(command).await
    }

    pub(super) async fn elevate(
        &mut self,
        command: &str,
        secret: &str,
    ) -> Result<(), SessionError> {
        self.session.elevate(command, secret).await
    }

    /// Hash of the credential that elevated this connection, if any.
    pub(super) fn elevation_hash(&self) -> Option<[u8; 32]> {
        self.elevation_hash
    }

    pub(super) fn record_elevation(&mut self, hash: [u8; 32]) {
        self.elevation_hash = Some(hash);
    }

    pub(super) async fn close(&mut self) {
        if let Err(err) = self.session.close().await {
            debug!("error closing session {}: {err}", self.pool_id);
        }
    }
}

struct PoolState {
    available: VecDeque<PooledConnection>,
    in_use: HashSet<String>,
    pending_creations: usize,
    next_id: u64,
    total_created: u64,
    total_acquisitions: u64,
    wait_count: u64,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    notify: Notify,
    factory: Arc<dyn SessionFactory>,
    config: PoolConfig,
}

/// Bounded pool of interactive sessions with privilege-aware reuse.
///
/// `Clone` is cheap; all clones share the same pool. Accounting mutations
/// happen under one mutex, while the potentially slow factory call runs
/// outside it, so concurrent creation races may briefly exceed
/// `max_sessions`, self-correcting via later discard/release.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Creates a pool over the given session factory.
    pub fn new(factory: Arc<dyn SessionFactory>, config: PoolConfig) -> Self {
        debug!(
            "connection pool created: max_sessions={} idle_timeout={:?} acquire_timeout={:?}",
            config.max_sessions, config.idle_timeout, config.acquire_timeout
        );
        let run_reaper = config.run_idle_reaper;
        let pool = Self {
            inner: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    available: VecDeque::new(),
                    in_use: HashSet::new(),
                    pending_creations: 0,
                    next_id: 0,
                    total_created: 0,
                    total_acquisitions: 0,
                    wait_count: 0,
                    closed: false,
                }),
                notify: Notify::new(),
                factory,
                config,
            }),
        };
        if run_reaper {
            pool.spawn_idle_reaper();
        }
        pool
    }

    /// Acquires a connection, creating one on miss up to `max_sessions`.
    ///
    /// Blocks until a release, a creation slot, or the acquire timeout,
    /// whichever comes first.
    pub async fn acquire(&self) -> Result<PooledConnection, SessionError> {
        self.acquire_with_cancel(&CancellationToken::new()).await
    }

    /// [`acquire`](Self::acquire) that additionally observes a cancellation
    /// token while waiting.
    pub async fn acquire_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledConnection, SessionError> {
        let deadline = tokio::time::Instant::now() + self.inner.config.acquire_timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(SessionError::Cancelled);
            }

            let permit = {
                let mut state = self.inner.state.lock().await;
                if state.closed {
                    return Err(SessionError::PoolClosed);
                }

                if let Some(mut conn) = state.available.pop_back() {
                    conn.last_used = Instant::now();
                    conn.use_count += 1;
                    state.in_use.insert(conn.pool_id.clone());
                    state.total_acquisitions += 1;
                    debug!(
                        "acquired pooled connection {} (use_count={} privileged={} available={} in_use={})",
                        conn.pool_id,
                        conn.use_count,
                        conn.privileged(),
                        state.available.len(),
                        state.in_use.len()
                    );
                    return Ok(conn);
                }

                // Pending creations count toward the bound so races while
                // the lock is released during dial cannot oversubscribe.
                let live =
                    state.in_use.len() + state.available.len() + state.pending_creations;
                if live < self.inner.config.max_sessions {
                    state.pending_creations += 1;
                    state.next_id += 1;
                    Some(state.next_id)
                } else {
                    state.wait_count += 1;
                    None
                }
            };

            if let Some(id) = permit {
                return self.create_connection(id).await;
            }

            debug!("pool exhausted, waiting for a connection to become available");
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        "timeout waiting for available connection (max_sessions={})",
                        self.inner.config.max_sessions
                    );
                    return Err(SessionError::PoolExhausted);
                }
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            }
        }
    }

    fn tag(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Runs the factory outside the lock and books the result in.
    async fn create_connection(&self, id: u64) -> Result<PooledConnection, SessionError> {
        let created = self.inner.factory.create().await;
        let mut state = self.inner.state.lock().await;
        state.pending_creations -= 1;

        match created {
            Ok(session) => {
                let mut conn = PooledConnection {
                    session,
                    pool_id: format!("ssh-conn-{id}"),
                    pool_tag: self.tag(),
                    last_used: Instant::now(),
                    use_count: 1,
                    initialized: true,
                    elevation_hash: None,
                };
                if state.closed {
                    // Pool closed while we were dialing.
                    drop(state);
                    conn.close().await;
                    return Err(SessionError::PoolClosed);
                }
                state.total_created += 1;
                state.total_acquisitions += 1;
                state.in_use.insert(conn.pool_id.clone());
                debug!(
                    "created pooled connection {} (total_created={})",
                    conn.pool_id, state.total_created
                );
                Ok(conn)
            }
            Err(err) => {
                // Give a waiter the creation slot we just freed.
                self.inner.notify.notify_one();
                Err(err)
            }
        }
    }

    /// Returns a healthy connection to the pool without closing or
    /// resetting it.
    ///
    /// The privilege flag (and the credential hash that earned it) survives,
    /// so a later caller needing privilege skips re-authentication. This is
    /// what keeps redundant session initialization from
    /// overwriting operator-configured device settings on every read.
    pub async fn release(&self, mut conn: PooledConnection) {
        let mut state = self.inner.state.lock().await;
        if conn.pool_tag != self.tag() || !state.in_use.remove(&conn.pool_id) {
            warn!(
                "release of unknown connection {} is a no-op",
                conn.pool_id
            );
            return;
        }

        if state.closed {
            drop(state);
            conn.close().await;
            return;
        }

        conn.last_used = Instant::now();
        debug!(
            "released connection {} (use_count={} privileged={} available={} in_use={})",
            conn.pool_id,
            conn.use_count,
            conn.privileged(),
            state.available.len() + 1,
            state.in_use.len()
        );
        state.available.push_back(conn);
        self.inner.notify.notify_one();
    }

    /// Permanently removes a failed connection from live accounting.
    ///
    /// Never returns the connection to the available queue. Discarding a
    /// connection the pool does not know is a no-op that leaves statistics
    /// unchanged.
    pub async fn discard(&self, mut conn: PooledConnection) {
        {
            let mut state = self.inner.state.lock().await;
            if conn.pool_tag != self.tag() || !state.in_use.remove(&conn.pool_id) {
                warn!(
                    "discard of unknown connection {} is a no-op",
                    conn.pool_id
                );
                return;
            }
            debug!(
                "discarded connection {} (use_count={} available={} in_use={})",
                conn.pool_id,
                conn.use_count,
                state.available.len(),
                state.in_use.len()
            );
        }
        conn.close().await;
        // Capacity was freed; wake a waiter.
        self.inner.notify.notify_one();
    }

    /// Consistent snapshot of pool statistics.
    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        PoolStats {
            total_created: state.total_created,
            total_acquisitions: state.total_acquisitions,
            in_use: state.in_use.len(),
            available: state.available.len(),
            max_sessions: self.inner.config.max_sessions,
            wait_count: state.wait_count,
        }
    }

    /// Closes the pool: further acquires fail fast, idle connections are
    /// closed now, in-use connections are closed as they come back.
    /// Idempotent.
    pub async fn close(&self) {
        let drained = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                debug!("connection pool already closed");
                return;
            }
            state.closed = true;
            debug!(
                "closing connection pool (available={} in_use={} total_created={})",
                state.available.len(),
                state.in_use.len(),
                state.total_created
            );
            std::mem::take(&mut state.available)
        };
        self.inner.notify.notify_waiters();
        for mut conn in drained {
            conn.close().await;
        }
    }

    /// Periodically closes sessions idle past `idle_timeout`, keeping one
    /// warm connection for the next caller.
    fn spawn_idle_reaper(&self) {
        let shared = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let Some(inner) = shared.upgrade() else { break };

                let expired = {
                    let mut state = inner.state.lock().await;
                    if state.closed {
                        debug!("connection pool closed, stopping idle reaper");
                        break;
                    }
                    let now = Instant::now();
                    let mut keep = VecDeque::new();
                    let mut expired = Vec::new();
                    while let Some(conn) = state.available.pop_front() {
                        if keep.is_empty()
                            || now.duration_since(conn.last_used) < inner.config.idle_timeout
                        {
                            keep.push_back(conn);
                        } else {
                            expired.push(conn);
                        }
                    }
                    state.available = keep;
                    expired
                };

                for mut conn in expired {
                    debug!("closing idle connection {}", conn.pool_id);
                    conn.close().await;
                }
            }
        });
    }
}
