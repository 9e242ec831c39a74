//! # SeriesKV Client
//!
//! Client-driver dispatch engine for a SeriesKV cluster: pooled TCP
//! connections per node, round-robin node selection with previous-node
//! avoidance, cluster-level retries with backoff, and a bounded queue for
//! commands no node can currently serve.
//!
//! Typical use:
//!
//! ```no_run
//! use skv_client::{Cluster, ClusterOptions, ConnectionOptions, Node, NodeOptions};
//! use skv_client::execution::share_command;
//! use skv_common::PingCommand;
//!
//! # fn main() -> skv_common::SkvResult<()> {
//! let node = Node::new(NodeOptions {
//!     conn: ConnectionOptions {
//!         addr: "127.0.0.1:8087".to_string(),
//!         ..ConnectionOptions::default()
//!     },
//!     ..NodeOptions::default()
//! })?;
//!
//! let cluster = Cluster::new(vec![node], ClusterOptions::default())?;
//! cluster.start()?;
//! cluster.execute(share_command(PingCommand::new()))?;
//! cluster.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod cluster;
pub mod connection;
pub mod execution;
pub mod manager;
pub mod node;
pub mod node_manager;
pub mod queue;
pub mod state;
pub mod sync;

pub use cluster::{Cluster, ClusterOptions, ClusterState};
pub use connection::{Connection, ConnectionOptions, Handshake, HealthCheckFn};
pub use execution::{share_command, Completion, Execution, SharedCommand};
pub use manager::{ConnectionManager, ConnectionManagerOptions, ManagerState};
pub use node::{ExecuteOutcome, Node, NodeOptions, NodeState};
pub use node_manager::{Dispatch, NodeManager};
