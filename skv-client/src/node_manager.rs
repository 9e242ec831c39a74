//! # Node Manager
//!
//! Purpose: Pick which node runs a given command: round-robin with
//! previous-node avoidance.
//!
//! The cursor advances on every candidate, including failures, so one bad
//! node cannot starve the others. Exactly one pass is made per call and the
//! picker never sleeps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use skv_common::{Command, SkvError};

use crate::node::{ExecuteOutcome, Node};

/// Result of one dispatch pass across the node list.
#[derive(Debug)]
pub enum Dispatch {
    /// Some node ran the command; `error` is `None` on success.
    Executed {
        node: Arc<Node>,
        error: Option<SkvError>,
    },
    /// No node could run the command in this pass.
    NotExecuted,
}

/// Round-robin picker with a persistent cursor.
pub struct NodeManager {
    cursor: AtomicUsize,
}

impl NodeManager {
    /// Creates a picker starting at the first node.
    pub fn new() -> Self {
        NodeManager {
            cursor: AtomicUsize::new(0),
        }
    }

    /// Scans `nodes` once from the cursor, skipping `previous` when another
    /// node exists, and dispatches to the first node that executes.
    pub fn execute_on_node(
        &self,
        nodes: &[Arc<Node>],
        cmd: &mut dyn Command,
        previous: Option<&Arc<Node>>,
    ) -> Dispatch {
        if nodes.is_empty() {
            return Dispatch::NotExecuted;
        }

        for _ in 0..nodes.len() {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % nodes.len();
            let node = &nodes[idx];
            if nodes.len() > 1 && previous.is_some_and(|prev| Arc::ptr_eq(prev, node)) {
                continue;
            }
            match node.execute(cmd) {
                ExecuteOutcome::Executed(error) => {
                    return Dispatch::Executed {
                        node: Arc::clone(node),
                        error,
                    }
                }
                ExecuteOutcome::NotExecuted => {}
            }
        }
        Dispatch::NotExecuted
    }
}

impl Default for NodeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::node::NodeOptions;
    use skv_common::{frame, PingCommand, PING_RESP_CODE};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn spawn_ping_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { return };
                thread::spawn(move || {
                    let mut request = [0u8; 5];
                    while stream.read_exact(&mut request).is_ok() {
                        let resp = frame::encode(PING_RESP_CODE, &[]);
                        if stream.write_all(&resp).is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    fn running_node() -> Arc<Node> {
        let opts = NodeOptions {
            conn: ConnectionOptions {
                addr: spawn_ping_server(),
                connect_timeout: Duration::from_secs(1),
                request_timeout: Duration::from_millis(500),
                ..ConnectionOptions::default()
            },
            min_connections: 1,
            max_connections: 2,
            ..NodeOptions::default()
        };
        let node = Node::new(opts).expect("node");
        node.start().expect("start");
        Arc::new(node)
    }

    #[test]
    fn consecutive_calls_rotate_nodes() {
        let nodes = vec![running_node(), running_node(), running_node()];
        let picker = NodeManager::new();

        let mut first = PingCommand::new();
        let chosen_first = match picker.execute_on_node(&nodes, &mut first, None) {
            Dispatch::Executed { node, error: None } => node,
            other => panic!("expected success, got {other:?}"),
        };

        let mut second = PingCommand::new();
        let chosen_second = match picker.execute_on_node(&nodes, &mut second, None) {
            Dispatch::Executed { node, error: None } => node,
            other => panic!("expected success, got {other:?}"),
        };

        assert!(!Arc::ptr_eq(&chosen_first, &chosen_second));
        for node in &nodes {
            node.stop().expect("stop");
        }
    }

    #[test]
    fn previous_node_is_skipped() {
        let nodes = vec![running_node(), running_node()];
        let picker = NodeManager::new();

        // Whatever the cursor position, the previous node is never chosen.
        for previous in [&nodes[0], &nodes[1]] {
            let mut ping = PingCommand::new();
            match picker.execute_on_node(&nodes, &mut ping, Some(previous)) {
                Dispatch::Executed { node, error: None } => {
                    assert!(!Arc::ptr_eq(&node, previous));
                }
                other => panic!("expected success, got {other:?}"),
            }
        }
        for node in &nodes {
            node.stop().expect("stop");
        }
    }

    #[test]
    fn single_node_is_not_skipped() {
        let nodes = vec![running_node()];
        let picker = NodeManager::new();

        let mut ping = PingCommand::new();
        let previous = Arc::clone(&nodes[0]);
        match picker.execute_on_node(&nodes, &mut ping, Some(&previous)) {
            Dispatch::Executed { error: None, .. } => {}
            other => panic!("expected success, got {other:?}"),
        }
        nodes[0].stop().expect("stop");
    }

    #[test]
    fn empty_node_list_is_not_executed() {
        let picker = NodeManager::new();
        let mut ping = PingCommand::new();
        assert!(matches!(
            picker.execute_on_node(&[], &mut ping, None),
            Dispatch::NotExecuted
        ));
    }
}
