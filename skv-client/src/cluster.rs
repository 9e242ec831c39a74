//! # Cluster
//!
//! Purpose: Own all nodes, accept sync and async submissions, and run the
//! retry and queue-and-retry loops.
//!
//! ## Design Principles
//! 1. **One Retry Engine**: The sync path is the async path plus a blocking
//!    `recv` on a per-call completion channel.
//! 2. **Queue When Starved**: When no node can run a command the descriptor
//!    is deferred onto a bounded queue with its own backoff clock, never
//!    dropped.
//! 3. **Drain On Shutdown**: Pending descriptors complete with
//!    `ClusterShuttingDown`; in-flight execution threads are waited out.
//!
//! ## Structure Overview
//!
//! ```text
//! Cluster (cloneable handle)
//!   └── inner: Arc<ClusterInner>
//!         ├── nodes: Vec<Arc<Node>>
//!         ├── picker: NodeManager (round-robin cursor)
//!         ├── queue: BoundedQueue<Execution>
//!         ├── state: StateCell<ClusterState>
//!         └── executions: WaitGroup (in-flight threads)
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use skv_common::{SkvError, SkvResult};

use crate::execution::{Completion, Execution, SharedCommand};
use crate::node::Node;
use crate::node_manager::{Dispatch, NodeManager};
use crate::queue::BoundedQueue;
use crate::state::{LifecycleState, StateCell};
use crate::sync::WaitGroup;

/// Default cap on deferred submissions.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// Poll period for the queue worker and interruptible sleeps.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Cluster lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClusterState {
    Created,
    Running,
    /// No node is currently usable; submissions are being deferred.
    Queueing,
    ShuttingDown,
    Shutdown,
    Error,
}

impl LifecycleState for ClusterState {
    fn label(&self) -> &'static str {
        match self {
            ClusterState::Created => "created",
            ClusterState::Running => "running",
            ClusterState::Queueing => "queueing",
            ClusterState::ShuttingDown => "shuttingDown",
            ClusterState::Shutdown => "shutdown",
            ClusterState::Error => "error",
        }
    }
}

/// Cluster construction options.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Cap on deferred submissions before callers see `QueueFull`.
    pub queue_capacity: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

enum RunOutcome {
    Completed,
    Deferred,
}

struct ClusterInner {
    nodes: Vec<Arc<Node>>,
    picker: NodeManager,
    queue: BoundedQueue<Execution>,
    state: StateCell<ClusterState>,
    executions: WaitGroup,
    queue_worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle owning all nodes of one cluster.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Creates a stopped cluster; fails with `OptionsRequired` when no nodes
    /// are supplied.
    pub fn new(nodes: Vec<Node>, opts: ClusterOptions) -> SkvResult<Self> {
        if nodes.is_empty() || opts.queue_capacity == 0 {
            return Err(SkvError::OptionsRequired);
        }
        Ok(Cluster {
            inner: Arc::new(ClusterInner {
                nodes: nodes.into_iter().map(Arc::new).collect(),
                picker: NodeManager::new(),
                queue: BoundedQueue::new(opts.queue_capacity),
                state: StateCell::new("cluster", ClusterState::Created),
                executions: WaitGroup::new(),
                queue_worker: Mutex::new(None),
            }),
        })
    }

    /// Starts all nodes concurrently and the queue worker.
    ///
    /// Individual node failures are logged; start fails only when every node
    /// fails to come up.
    pub fn start(&self) -> SkvResult<()> {
        self.inner.state.check(&[ClusterState::Created])?;

        let results: Vec<SkvResult<()>> = {
            let handles: Vec<_> = self
                .inner
                .nodes
                .iter()
                .map(|node| {
                    let node = Arc::clone(node);
                    thread::spawn(move || node.start())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(Err(SkvError::NoNodesAvailable)))
                .collect()
        };

        let mut last_err = None;
        let mut started = 0usize;
        for (node, result) in self.inner.nodes.iter().zip(results) {
            match result {
                Ok(()) => started += 1,
                Err(err) => {
                    warn!(addr = %node.addr(), %err, "node failed to start");
                    last_err = Some(err);
                }
            }
        }
        if started == 0 {
            self.inner.state.set(ClusterState::Error);
            return Err(last_err.unwrap_or(SkvError::NoNodesAvailable));
        }

        let worker = {
            let cluster = self.clone();
            thread::spawn(move || cluster.queue_loop())
        };
        *self.inner.queue_worker.lock() = Some(worker);

        self.inner.state.set(ClusterState::Running);
        info!(nodes = started, "cluster running");
        Ok(())
    }

    /// Executes a command, blocking the caller until completion.
    ///
    /// Returns the last error observed across retries, or `Ok` once the
    /// command reports success.
    pub fn execute(&self, cmd: SharedCommand) -> SkvResult<()> {
        let (tx, rx) = mpsc::channel::<Completion>();
        let exec = Execution::new(cmd).with_channel(tx);
        self.execute_async(exec)?;
        match rx.recv() {
            Ok((_cmd, None)) => Ok(()),
            Ok((_cmd, Some(err))) => Err(err),
            // The sender is dropped only after `complete`; treat a lost
            // channel as a shutdown race.
            Err(_) => Err(SkvError::ClusterShuttingDown),
        }
    }

    /// Submits a descriptor; completion is signaled through its channel
    /// and/or wait group.
    pub fn execute_async(&self, exec: Execution) -> SkvResult<()> {
        if let Err(state_err) = self
            .inner
            .state
            .check(&[ClusterState::Running, ClusterState::Queueing])
        {
            let err = if self.inner.state.is_less_than(ClusterState::ShuttingDown) {
                state_err
            } else {
                SkvError::ClusterShuttingDown
            };
            exec.complete(Some(err.clone()));
            return Err(err);
        }

        self.inner.executions.add(1);
        let cluster = self.clone();
        thread::spawn(move || {
            let _ = cluster.run_execution(exec);
            cluster.inner.executions.done();
        });
        Ok(())
    }

    /// Stops accepting work, drains the deferred queue, waits out in-flight
    /// executions, and stops every node.
    pub fn stop(&self) -> SkvResult<()> {
        self.inner
            .state
            .check(&[ClusterState::Running, ClusterState::Queueing])?;
        self.inner.state.set(ClusterState::ShuttingDown);

        if let Some(worker) = self.inner.queue_worker.lock().take() {
            let _ = worker.join();
        }
        for exec in self.inner.queue.destroy() {
            exec.complete(Some(SkvError::ClusterShuttingDown));
        }
        self.inner.executions.wait();

        for node in &self.inner.nodes {
            if let Err(err) = node.stop() {
                warn!(addr = %node.addr(), %err, "node stop failed");
            }
        }

        self.inner.state.set(ClusterState::Shutdown);
        info!("cluster shut down");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClusterState {
        self.inner.state.current()
    }

    /// Nodes owned by this cluster.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.inner.nodes
    }

    /// Deferred submissions currently queued; for diagnostics and tests.
    pub fn queued_count(&self) -> usize {
        self.inner.queue.len()
    }

    // The per-command retry loop.
    fn run_execution(&self, mut exec: Execution) -> RunOutcome {
        exec.on_execute();
        loop {
            if !self.inner.state.is_less_than(ClusterState::ShuttingDown) {
                exec.complete(Some(SkvError::ClusterShuttingDown));
                return RunOutcome::Completed;
            }

            let cmd = Arc::clone(exec.command());
            let mut guard = cmd.lock();
            match self
                .inner
                .picker
                .execute_on_node(&self.inner.nodes, &mut *guard, exec.last_node())
            {
                Dispatch::Executed { error: None, .. } => {
                    drop(guard);
                    exec.complete(None);
                    return RunOutcome::Completed;
                }
                Dispatch::Executed {
                    node,
                    error: Some(err),
                } => {
                    let retryable =
                        err.is_retryable() && guard.is_retryable() && guard.remaining_tries() > 0;
                    if !retryable {
                        drop(guard);
                        exec.complete(Some(err));
                        return RunOutcome::Completed;
                    }
                    guard.decrement_tries();
                    let name = guard.name();
                    drop(guard);

                    exec.set_last_node(node);
                    let delay = exec.retry_delay();
                    debug!(command = name, %err, ?delay, "retrying on another node");
                    if !self.sleep_unless_stopping(delay) {
                        exec.complete(Some(SkvError::ClusterShuttingDown));
                        return RunOutcome::Completed;
                    }
                }
                Dispatch::NotExecuted => {
                    drop(guard);
                    return self.defer(exec);
                }
            }
        }
    }

    // Defers a descriptor no node could run.
    fn defer(&self, mut exec: Execution) -> RunOutcome {
        if self.inner.state.is_current(ClusterState::Running) {
            self.inner.state.set(ClusterState::Queueing);
        }
        exec.on_enqueued();
        match self.inner.queue.enqueue(exec) {
            Ok(()) => RunOutcome::Deferred,
            Err(rejected) => {
                let err = match rejected.error() {
                    SkvError::QueueClosed => SkvError::ClusterShuttingDown,
                    err => err,
                };
                rejected.into_inner().complete(Some(err));
                RunOutcome::Completed
            }
        }
    }

    // Serves the deferred queue until shutdown.
    fn queue_loop(&self) {
        loop {
            let exec = match self.inner.queue.dequeue_timeout(POLL_INTERVAL) {
                Err(_) => return,
                Ok(None) => {
                    if !self.inner.state.is_less_than(ClusterState::ShuttingDown) {
                        return;
                    }
                    continue;
                }
                Ok(Some(exec)) => exec,
            };

            if !self.inner.state.is_less_than(ClusterState::ShuttingDown) {
                exec.complete(Some(SkvError::ClusterShuttingDown));
                continue;
            }

            let now = Instant::now();
            if exec.execute_at() > now {
                if !self.sleep_unless_stopping(exec.execute_at() - now) {
                    exec.complete(Some(SkvError::ClusterShuttingDown));
                    continue;
                }
            }

            match self.run_execution(exec) {
                RunOutcome::Completed => {
                    // A node served (or definitively failed) the command, so
                    // the cluster is no longer starved.
                    if self.inner.state.is_current(ClusterState::Queueing) {
                        self.inner.state.set(ClusterState::Running);
                    }
                }
                RunOutcome::Deferred => {}
            }
        }
    }

    // Sleeps in slices; returns false when shutdown began mid-sleep.
    fn sleep_unless_stopping(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if !self.inner.state.is_less_than(ClusterState::ShuttingDown) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(POLL_INTERVAL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::execution::share_command;
    use crate::node::NodeOptions;
    use skv_common::PingCommand;

    fn dead_node() -> Node {
        // Reserve then release a port so connects are refused quickly.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        Node::new(NodeOptions {
            conn: ConnectionOptions {
                addr,
                connect_timeout: Duration::from_millis(200),
                request_timeout: Duration::from_millis(200),
                ..ConnectionOptions::default()
            },
            min_connections: 0,
            max_connections: 1,
            ..NodeOptions::default()
        })
        .expect("node")
    }

    #[test]
    fn cluster_requires_nodes() {
        assert!(matches!(
            Cluster::new(Vec::new(), ClusterOptions::default()),
            Err(SkvError::OptionsRequired)
        ));
    }

    #[test]
    fn execute_before_start_is_illegal() {
        let cluster = Cluster::new(vec![dead_node()], ClusterOptions::default()).expect("cluster");
        let err = cluster
            .execute(share_command(PingCommand::new()))
            .unwrap_err();
        assert!(matches!(err, SkvError::IllegalState { .. }));
    }

    #[test]
    fn submissions_fail_after_stop() {
        let cluster = Cluster::new(vec![dead_node()], ClusterOptions::default()).expect("cluster");
        cluster.start().expect("start");
        cluster.stop().expect("stop");
        assert_eq!(cluster.state(), ClusterState::Shutdown);

        let err = cluster
            .execute(share_command(PingCommand::new()))
            .unwrap_err();
        assert_eq!(err, SkvError::ClusterShuttingDown);
    }
}
