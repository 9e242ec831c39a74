//! # Connection Manager
//!
//! Purpose: Per-node pool of connections with pre-warming, idle-expiry
//! sweeping, and a lifecycle state machine.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle connections sit in a bounded FIFO;
//!    borrowed connections are owned by the caller until `put` or `remove`.
//! 2. **Counted Slots**: `connection_count` tracks idle plus in-use
//!    connections and never exceeds `max_connections`.
//! 3. **Background Expiry**: A sweeper thread closes connections that are
//!    unavailable or idle past the configured timeout.
//!
//! ## Structure Overview
//!
//! ```text
//! ConnectionManager (cloneable handle)
//!   └── inner: Arc<ManagerInner>
//!         ├── idle: BoundedQueue<Connection>
//!         ├── count: Mutex<usize>
//!         ├── state: StateCell<ManagerState>
//!         └── sweeper: JoinHandle + stop channel
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use skv_common::{SkvError, SkvResult};

use crate::connection::{Connection, ConnectionOptions};
use crate::queue::{BoundedQueue, Visit};
use crate::state::{LifecycleState, StateCell};

/// Default pre-warmed idle connections.
pub const DEFAULT_MIN_CONNECTIONS: usize = 1;
/// Default hard cap on live connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8096;
/// Default idle eviction threshold.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3);
/// Default sweeper period.
pub const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Connection manager lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManagerState {
    Created,
    Running,
    ShuttingDown,
    Shutdown,
    Error,
}

impl LifecycleState for ManagerState {
    fn label(&self) -> &'static str {
        match self {
            ManagerState::Created => "created",
            ManagerState::Running => "running",
            ManagerState::ShuttingDown => "shuttingDown",
            ManagerState::Shutdown => "shutdown",
            ManagerState::Error => "error",
        }
    }
}

/// Pool configuration.
#[derive(Clone)]
pub struct ConnectionManagerOptions {
    /// Options applied to every connection the pool creates.
    pub conn: ConnectionOptions,
    /// Connections pre-warmed at `start`.
    pub min_connections: usize,
    /// Hard cap on idle plus in-use connections.
    pub max_connections: usize,
    /// Idle eviction threshold.
    pub idle_timeout: Duration,
    /// Sweeper period.
    pub idle_sweep_interval: Duration,
}

impl Default for ConnectionManagerOptions {
    fn default() -> Self {
        ConnectionManagerOptions {
            conn: ConnectionOptions::default(),
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            idle_sweep_interval: DEFAULT_IDLE_SWEEP_INTERVAL,
        }
    }
}

impl ConnectionManagerOptions {
    fn validate(&self) -> SkvResult<()> {
        self.conn.validate()?;
        if self.max_connections == 0 || self.min_connections > self.max_connections {
            return Err(SkvError::OptionsRequired);
        }
        Ok(())
    }
}

struct ManagerInner {
    opts: ConnectionManagerOptions,
    idle: BoundedQueue<Connection>,
    count: Mutex<usize>,
    state: StateCell<ManagerState>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

struct SweeperHandle {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Cloneable pool handle.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Creates a stopped pool from validated options.
    pub fn new(opts: ConnectionManagerOptions) -> SkvResult<Self> {
        opts.validate()?;
        let capacity = opts.max_connections;
        Ok(ConnectionManager {
            inner: Arc::new(ManagerInner {
                opts,
                idle: BoundedQueue::new(capacity),
                count: Mutex::new(0),
                state: StateCell::new("connection manager", ManagerState::Created),
                sweeper: Mutex::new(None),
            }),
        })
    }

    /// Pre-warms `min_connections` and starts the idle sweeper.
    ///
    /// Pre-warm failures are logged, not fatal; the pool still transitions to
    /// running and creates connections on demand.
    pub fn start(&self) -> SkvResult<()> {
        self.inner.state.check(&[ManagerState::Created])?;

        for _ in 0..self.inner.opts.min_connections {
            match self.create() {
                Ok(Some(conn)) => self.put(conn),
                Ok(None) => break,
                Err(err) => {
                    warn!(addr = %self.inner.opts.conn.addr, %err, "pre-warm connect failed");
                    break;
                }
            }
        }

        let (stop_tx, stop_rx) = mpsc::channel();
        let sweeper = {
            let manager = self.clone();
            thread::spawn(move || manager.sweep_loop(stop_rx))
        };
        *self.inner.sweeper.lock() = Some(SweeperHandle {
            stop_tx,
            handle: sweeper,
        });

        self.inner.state.set(ManagerState::Running);
        Ok(())
    }

    /// Borrows an available connection, creating one when the pool is empty.
    ///
    /// Fails with `AllConnectionsInUse` at `max_connections`.
    pub fn get(&self) -> SkvResult<Connection> {
        self.inner.state.check(&[ManagerState::Running])?;

        // Pull the first available idle connection; stale ones are drained
        // out of the FIFO and closed after the lock is released.
        let mut found: Option<Connection> = None;
        let mut stale: Vec<Connection> = Vec::new();
        self.inner.idle.iterate(|conn| {
            if conn.available() {
                found = Some(conn);
                Visit::Stop(None)
            } else {
                stale.push(conn);
                Visit::Continue(None)
            }
        })?;
        for conn in stale {
            self.discard(conn);
        }
        if let Some(conn) = found {
            return Ok(conn);
        }

        match self.create()? {
            Some(conn) => Ok(conn),
            // Stop raced in; report the pool as busy so the caller moves on.
            None => Err(SkvError::AllConnectionsInUse),
        }
    }

    /// Creates and connects a new pooled connection without enqueueing it.
    ///
    /// Returns `Ok(None)` once shutdown has begun.
    pub fn create(&self) -> SkvResult<Option<Connection>> {
        if !self.inner.state.is_less_than(ManagerState::ShuttingDown) {
            return Ok(None);
        }
        {
            let mut count = self.inner.count.lock();
            if *count >= self.inner.opts.max_connections {
                return Err(SkvError::AllConnectionsInUse);
            }
            *count += 1;
        }

        let mut conn = match Connection::new(self.inner.opts.conn.clone()) {
            Ok(conn) => conn,
            Err(err) => {
                self.decrement();
                return Err(err);
            }
        };
        if let Err(err) = conn.connect() {
            self.decrement();
            return Err(err);
        }
        Ok(Some(conn))
    }

    /// Returns a borrowed connection to the idle FIFO.
    ///
    /// Once shutdown has begun the connection is closed instead.
    pub fn put(&self, conn: Connection) {
        if self.inner.state.is_less_than(ManagerState::ShuttingDown) {
            if let Err(rejected) = self.inner.idle.enqueue(conn) {
                self.discard(rejected.into_inner());
            }
        } else {
            self.discard(conn);
        }
    }

    /// Removes a borrowed connection from the pool for good.
    pub fn remove(&self, conn: Connection) {
        if self.inner.state.is_less_than(ManagerState::ShuttingDown) {
            self.discard(conn);
        }
        // During shutdown the drain already accounts for every connection.
    }

    /// Stops the sweeper, closes every connection, and destroys the FIFO.
    pub fn stop(&self) -> SkvResult<()> {
        self.inner.state.check(&[ManagerState::Running])?;
        self.inner.state.set(ManagerState::ShuttingDown);

        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            let _ = sweeper.stop_tx.send(());
            let _ = sweeper.handle.join();
        }

        while let Ok(Some(conn)) = self.inner.idle.dequeue() {
            self.discard(conn);
        }
        for conn in self.inner.idle.destroy() {
            self.discard(conn);
        }

        self.inner.state.set(ManagerState::Shutdown);
        Ok(())
    }

    /// Idle plus in-use connections.
    pub fn connection_count(&self) -> usize {
        *self.inner.count.lock()
    }

    /// Idle connections currently pooled.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.inner.state.current()
    }

    fn discard(&self, mut conn: Connection) {
        conn.close();
        self.decrement();
    }

    fn decrement(&self) {
        let mut count = self.inner.count.lock();
        *count = count.saturating_sub(1);
    }

    fn sweep_loop(&self, stop_rx: mpsc::Receiver<()>) {
        loop {
            match stop_rx.recv_timeout(self.inner.opts.idle_sweep_interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
            if !self.inner.state.is_less_than(ManagerState::ShuttingDown) {
                return;
            }
            self.sweep();
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let idle_timeout = self.inner.opts.idle_timeout;
        let mut expired: Vec<Connection> = Vec::new();
        let result = self.inner.idle.iterate(|conn| {
            if !conn.available() || now.duration_since(conn.last_used()) >= idle_timeout {
                expired.push(conn);
                Visit::Continue(None)
            } else {
                Visit::Continue(Some(conn))
            }
        });
        if result.is_err() {
            // Queue destroyed mid-sweep; shutdown owns the drain.
            return;
        }
        if !expired.is_empty() {
            debug!(
                addr = %self.inner.opts.conn.addr,
                evicted = expired.len(),
                "idle sweep evicted connections"
            );
        }
        for conn in expired {
            self.discard(conn);
        }
    }
}
