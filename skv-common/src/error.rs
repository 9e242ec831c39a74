//! # Error Taxonomy
//!
//! Purpose: One cloneable error enum covering configuration, state, resource,
//! network, protocol, server, auth, and lifecycle failures.
//!
//! ## Design Principles
//! 1. **Kinds Over Sources**: I/O errors are flattened to a kind plus message
//!    so the same error can be recorded on a descriptor and handed to a caller.
//! 2. **Retry Classification**: `is_temporary` and `is_retryable` drive the
//!    connection-level and cluster-level retry decisions.
//! 3. **Fail Fast**: Construction-time problems are their own variants.

use std::io;

use thiserror::Error;

/// Result type used across the SeriesKV crates.
pub type SkvResult<T> = Result<T, SkvError>;

/// Errors surfaced by the client runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkvError {
    /// Builder was invoked without required options.
    #[error("client options are required")]
    OptionsRequired,
    /// A remote address is required but was empty.
    #[error("a remote address is required")]
    AddressRequired,

    /// An operation was attempted outside its allowed lifecycle states.
    #[error("{component} is {current}, expected one of [{allowed}]")]
    IllegalState {
        component: &'static str,
        current: &'static str,
        allowed: String,
    },

    /// Bounded queue is at capacity.
    #[error("queue is full")]
    QueueFull,
    /// Bounded queue was destroyed.
    #[error("queue is closed")]
    QueueClosed,
    /// Pool is at `max_connections` with every connection borrowed.
    #[error("all connections are in use")]
    AllConnectionsInUse,
    /// No node could execute the command and retries are exhausted.
    #[error("no nodes available to execute the command")]
    NoNodesAvailable,

    /// The remote address did not resolve to a socket address.
    #[error("address resolution failed for {0}")]
    AddressResolution(String),
    /// TCP dial exceeded the connect timeout.
    #[error("connect timed out")]
    ConnectTimeout,
    /// TCP dial was refused by the remote.
    #[error("connection refused")]
    ConnectRefused,
    /// Socket read failed.
    #[error("read failed: {0}")]
    ReadFailed(String),
    /// Socket write failed.
    #[error("write failed: {0}")]
    WriteFailed(String),
    /// Fewer bytes arrived than the frame header promised.
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },
    /// Fewer bytes were written than the frame contains.
    #[error("short write: wanted {wanted} bytes, wrote {wrote}")]
    ShortWrite { wanted: usize, wrote: usize },
    /// Transient I/O failure worth retrying on the same connection.
    #[error("temporary network error: {0}")]
    Temporary(String),

    /// Response frame carried no message code.
    #[error("zero-length response frame")]
    ZeroLength,
    /// Response code did not match the command's expectation.
    #[error("unexpected response code {got}, expected {expected}")]
    UnexpectedCode { expected: u8, got: u8 },
    /// Response payload could not be parsed.
    #[error("failed to decode response: {0}")]
    DecodeFailed(String),

    /// Well-formed rejection sent by the server.
    #[error("server error {code}: {message}")]
    ServerError { code: u32, message: String },

    /// Auth was requested but no TLS configuration was supplied.
    #[error("TLS configuration is missing")]
    AuthTlsConfigMissing,
    /// The post-connect TLS upgrade failed.
    #[error("TLS upgrade failed: {0}")]
    AuthTlsUpgradeFailed(String),
    /// The post-connect authentication handshake failed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// The health-check command issued on connect did not succeed.
    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    /// Cluster is shutting down and no longer accepts work.
    #[error("cluster is shutting down")]
    ClusterShuttingDown,
}

impl SkvError {
    /// True for transient I/O failures retried on the same connection.
    pub fn is_temporary(&self) -> bool {
        matches!(self, SkvError::Temporary(_))
    }

    /// True when the cluster may re-dispatch the command to another node.
    ///
    /// Server rejections count as executed and are never re-dispatched.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SkvError::ConnectTimeout
                | SkvError::ConnectRefused
                | SkvError::ReadFailed(_)
                | SkvError::WriteFailed(_)
                | SkvError::ShortRead { .. }
                | SkvError::ShortWrite { .. }
                | SkvError::Temporary(_)
                | SkvError::AddressResolution(_)
        )
    }

    /// Classifies an I/O error raised while dialing.
    pub fn from_connect(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SkvError::ConnectTimeout,
            io::ErrorKind::ConnectionRefused => SkvError::ConnectRefused,
            _ => SkvError::ConnectRefused,
        }
    }

    /// Classifies an I/O error raised while reading a response.
    pub fn from_read(err: &io::Error) -> Self {
        if is_temporary_io(err) {
            SkvError::Temporary(err.to_string())
        } else {
            SkvError::ReadFailed(err.to_string())
        }
    }

    /// Classifies an I/O error raised while writing a request.
    pub fn from_write(err: &io::Error) -> Self {
        if is_temporary_io(err) {
            SkvError::Temporary(err.to_string())
        } else {
            SkvError::WriteFailed(err.to_string())
        }
    }
}

// Transient kinds: deadline expiries and interrupts leave the socket usable.
fn is_temporary_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
