//! # Execution Descriptor
//!
//! Purpose: Carry a command plus caller completion primitives through the
//! cluster's retry and queue loops.
//!
//! ## Design Principles
//! 1. **Completion By Consumption**: `complete` takes the descriptor by
//!    value, so a shutdown racing a retry cannot double-signal the caller.
//! 2. **No Back-References**: The descriptor references its command and its
//!    completion primitives, never the cluster that owns it.
//! 3. **Two Clocks**: A retry backoff paces re-dispatch; a slower-growing
//!    queue backoff computes `execute_at` for deferred attempts.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use skv_common::{Command, SkvError};

use crate::backoff::Backoff;
use crate::node::Node;
use crate::sync::WaitGroup;

/// A command shared between the caller and the dispatch engine.
pub type SharedCommand = Arc<Mutex<dyn Command>>;

/// Payload delivered on a completion channel: the command and the captured
/// error, `None` on success.
pub type Completion = (SharedCommand, Option<SkvError>);

/// Wraps a concrete command for submission.
pub fn share_command<C: Command + 'static>(cmd: C) -> SharedCommand {
    Arc::new(Mutex::new(cmd))
}

/// Descriptor for one submitted command.
pub struct Execution {
    cmd: SharedCommand,
    done_tx: Option<mpsc::Sender<Completion>>,
    wait_group: Option<WaitGroup>,
    retry_backoff: Backoff,
    queue_backoff: Backoff,
    enqueued_at: Option<Instant>,
    execute_at: Instant,
    last_node: Option<Arc<Node>>,
}

impl Execution {
    /// Creates a descriptor without completion primitives.
    pub fn new(cmd: SharedCommand) -> Self {
        Execution {
            cmd,
            done_tx: None,
            wait_group: None,
            retry_backoff: Backoff::for_retries(),
            queue_backoff: Backoff::for_queueing(),
            enqueued_at: None,
            execute_at: Instant::now(),
            last_node: None,
        }
    }

    /// Attaches a completion channel; the command is sent on it exactly once.
    pub fn with_channel(mut self, tx: mpsc::Sender<Completion>) -> Self {
        self.done_tx = Some(tx);
        self
    }

    /// Attaches a wait group, incrementing it now; `complete` decrements it.
    pub fn with_wait_group(mut self, wg: WaitGroup) -> Self {
        wg.add(1);
        self.wait_group = Some(wg);
        self
    }

    /// The shared command this descriptor carries.
    pub fn command(&self) -> &SharedCommand {
        &self.cmd
    }

    /// Called when a retry cycle begins; reinitializes the retry backoff.
    pub fn on_execute(&mut self) {
        self.retry_backoff.reset();
    }

    /// Delay to sleep before the next re-dispatch.
    pub fn retry_delay(&mut self) -> Duration {
        self.retry_backoff.next_duration()
    }

    /// Called on every (re-)enqueue onto the deferred queue.
    ///
    /// The first call pins `enqueued_at`; every call pushes `execute_at`
    /// further out along the queue backoff sequence.
    pub fn on_enqueued(&mut self) {
        let enqueued_at = *self.enqueued_at.get_or_insert_with(Instant::now);
        self.execute_at = enqueued_at + self.queue_backoff.next_duration();
    }

    /// Earliest instant a deferred attempt should run.
    pub fn execute_at(&self) -> Instant {
        self.execute_at
    }

    /// Node that last executed this command, for previous-node avoidance.
    pub fn last_node(&self) -> Option<&Arc<Node>> {
        self.last_node.as_ref()
    }

    /// Records the node that just executed this command.
    pub fn set_last_node(&mut self, node: Arc<Node>) {
        self.last_node = Some(node);
    }

    /// Completes the descriptor, signaling the caller exactly once.
    ///
    /// Consuming `self` is the double-signal guard: a descriptor that has
    /// been completed no longer exists.
    pub fn complete(self, error: Option<SkvError>) {
        if let Some(err) = &error {
            self.cmd.lock().mark_error(err);
        }
        if let Some(tx) = self.done_tx {
            let _ = tx.send((Arc::clone(&self.cmd), error));
        }
        if let Some(wg) = self.wait_group {
            wg.done();
        }
    }
}
