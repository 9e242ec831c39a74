//! # Node
//!
//! Purpose: One remote endpoint, its connection pool, and the health-check
//! recovery loop.
//!
//! ## Design Principles
//! 1. **Borrow, Run, Return**: A command executes on a borrowed connection;
//!    the outcome decides whether the connection is returned or removed.
//! 2. **Refuse While Probing**: A node in `healthChecking` reports
//!    `NotExecuted` so the cluster tries another node or queues.
//! 3. **Fresh Probe Commands**: Each recovery attempt builds a new
//!    health-check command from the configured factory.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use skv_common::{Command, PingCommand, SkvError, SkvResult};

use crate::backoff::Backoff;
use crate::connection::{ConnectionOptions, HealthCheckFn};
use crate::manager::{ConnectionManager, ConnectionManagerOptions};
use crate::state::{LifecycleState, StateCell};

/// Node lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Created,
    Running,
    HealthChecking,
    ShuttingDown,
    Shutdown,
    Error,
}

impl LifecycleState for NodeState {
    fn label(&self) -> &'static str {
        match self {
            NodeState::Created => "created",
            NodeState::Running => "running",
            NodeState::HealthChecking => "healthChecking",
            NodeState::ShuttingDown => "shuttingDown",
            NodeState::Shutdown => "shutdown",
            NodeState::Error => "error",
        }
    }
}

/// Result of asking a node to run a command.
#[derive(Debug)]
pub enum ExecuteOutcome {
    /// The command reached a connection; `None` means it succeeded.
    Executed(Option<SkvError>),
    /// The node could not run the command (busy, probing, or stopped).
    NotExecuted,
}

/// Node configuration.
#[derive(Clone)]
pub struct NodeOptions {
    /// Options for this node's connections (address, timeouts, handshake).
    pub conn: ConnectionOptions,
    /// Connections pre-warmed at start.
    pub min_connections: usize,
    /// Hard cap on this node's connections.
    pub max_connections: usize,
    /// Idle eviction threshold.
    pub idle_timeout: Duration,
    /// Sweeper period.
    pub idle_sweep_interval: Duration,
    /// Factory for health-check commands used during recovery.
    pub health_check: HealthCheckFn,
}

impl Default for NodeOptions {
    fn default() -> Self {
        let manager = ConnectionManagerOptions::default();
        NodeOptions {
            conn: manager.conn,
            min_connections: manager.min_connections,
            max_connections: manager.max_connections,
            idle_timeout: manager.idle_timeout,
            idle_sweep_interval: manager.idle_sweep_interval,
            health_check: Arc::new(|| Box::new(PingCommand::new())),
        }
    }
}

impl NodeOptions {
    fn manager_options(&self) -> ConnectionManagerOptions {
        ConnectionManagerOptions {
            conn: self.conn.clone(),
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            idle_timeout: self.idle_timeout,
            idle_sweep_interval: self.idle_sweep_interval,
        }
    }
}

struct NodeInner {
    addr: String,
    manager: ConnectionManager,
    state: StateCell<NodeState>,
    health_check: HealthCheckFn,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

/// A remote endpoint plus its pool and lifecycle.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.inner.addr)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Creates a stopped node from validated options.
    pub fn new(opts: NodeOptions) -> SkvResult<Self> {
        let manager = ConnectionManager::new(opts.manager_options())?;
        Ok(Node {
            inner: Arc::new(NodeInner {
                addr: opts.conn.addr.clone(),
                manager,
                state: StateCell::new("node", NodeState::Created),
                health_check: opts.health_check,
                recovery: Mutex::new(None),
            }),
        })
    }

    /// Starts the connection pool and transitions to running.
    pub fn start(&self) -> SkvResult<()> {
        self.inner.state.check(&[NodeState::Created])?;
        self.inner.manager.start()?;
        self.inner.state.set(NodeState::Running);
        Ok(())
    }

    /// Runs one command on a borrowed connection.
    pub fn execute(&self, cmd: &mut dyn Command) -> ExecuteOutcome {
        if !self.inner.state.is_current(NodeState::Running) {
            return ExecuteOutcome::NotExecuted;
        }

        let mut conn = match self.inner.manager.get() {
            Ok(conn) => conn,
            Err(SkvError::AllConnectionsInUse) => return ExecuteOutcome::NotExecuted,
            Err(err) if is_connect_failure(&err) => {
                warn!(addr = %self.inner.addr, %err, "node cannot open connections");
                self.enter_health_checking();
                return ExecuteOutcome::NotExecuted;
            }
            Err(_) => return ExecuteOutcome::NotExecuted,
        };

        match conn.execute(cmd) {
            Ok(()) => {
                self.inner.manager.put(conn);
                ExecuteOutcome::Executed(None)
            }
            Err(err) => {
                if conn.available() {
                    // Server rejection; the connection is still in sync.
                    self.inner.manager.put(conn);
                } else {
                    self.inner.manager.remove(conn);
                }
                ExecuteOutcome::Executed(Some(err))
            }
        }
    }

    /// Stops the recovery probe (if any) and the pool.
    pub fn stop(&self) -> SkvResult<()> {
        self.inner
            .state
            .check(&[NodeState::Running, NodeState::HealthChecking])?;
        self.inner.state.set(NodeState::ShuttingDown);

        if let Some(handle) = self.inner.recovery.lock().take() {
            let _ = handle.join();
        }
        self.inner.manager.stop()?;
        self.inner.state.set(NodeState::Shutdown);
        Ok(())
    }

    /// Remote endpoint this node dials.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.inner.state.current()
    }

    /// True when the node accepts new work.
    pub fn usable(&self) -> bool {
        self.inner.state.is_current(NodeState::Running)
    }

    /// Connection count of the underlying pool; for diagnostics and tests.
    pub fn connection_count(&self) -> usize {
        self.inner.manager.connection_count()
    }

    fn enter_health_checking(&self) {
        let mut recovery = self.inner.recovery.lock();
        if !self.inner.state.is_current(NodeState::Running) {
            return;
        }
        if let Some(handle) = recovery.take() {
            if !handle.is_finished() {
                *recovery = Some(handle);
                return;
            }
            let _ = handle.join();
        }

        self.inner.state.set(NodeState::HealthChecking);
        let node = self.clone();
        *recovery = Some(thread::spawn(move || node.recovery_loop()));
    }

    // Probes the endpoint with fresh health-check commands until one
    // succeeds, then returns the node to running.
    fn recovery_loop(&self) {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
            true,
        );
        loop {
            // Sleep in slices so shutdown is not stuck behind a long probe delay.
            let mut remaining = backoff.next_duration();
            while !remaining.is_zero() {
                if !self.inner.state.is_current(NodeState::HealthChecking) {
                    return;
                }
                let slice = remaining.min(Duration::from_millis(50));
                thread::sleep(slice);
                remaining = remaining.saturating_sub(slice);
            }
            if !self.inner.state.is_current(NodeState::HealthChecking) {
                return;
            }

            let conn = match self.inner.manager.create() {
                Ok(Some(conn)) => conn,
                Ok(None) => return,
                Err(err) => {
                    debug!(addr = %self.inner.addr, %err, "health check connect failed");
                    continue;
                }
            };

            let mut conn = conn;
            let mut probe = (self.inner.health_check)();
            match conn.execute(probe.as_mut()) {
                Ok(()) => {
                    self.inner.manager.put(conn);
                    if self.inner.state.is_current(NodeState::HealthChecking) {
                        self.inner.state.set(NodeState::Running);
                        info!(addr = %self.inner.addr, "node recovered");
                    }
                    return;
                }
                Err(err) => {
                    debug!(addr = %self.inner.addr, %err, "health check command failed");
                    self.inner.manager.remove(conn);
                }
            }
        }
    }
}

fn is_connect_failure(err: &SkvError) -> bool {
    matches!(
        err,
        SkvError::ConnectTimeout
            | SkvError::ConnectRefused
            | SkvError::AddressResolution(_)
            | SkvError::AuthFailed(_)
            | SkvError::AuthTlsConfigMissing
            | SkvError::AuthTlsUpgradeFailed(_)
            | SkvError::HealthCheckFailed(_)
    )
}
