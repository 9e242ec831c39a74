//! # Command Interface
//!
//! Purpose: Define the trait the dispatch engine consumes and the `Ping`
//! command used as the default connection health check.
//!
//! ## Design Principles
//! 1. **Opaque Payloads**: The engine moves bytes; only the command knows how
//!    to build a request or interpret a response payload.
//! 2. **Streaming via Pull**: A streaming command's `decode_response` reports
//!    whether more frames are expected, so the connection owns the read loop.
//! 3. **Outcome on the Command**: Success and the retry budget live on the
//!    command so async completion can hand the whole object back.

use bytes::Bytes;

use crate::error::{SkvError, SkvResult};

/// Message code for a ping request.
pub const PING_REQ_CODE: u8 = 0x01;
/// Message code for a ping response.
pub const PING_RESP_CODE: u8 = 0x02;

/// Default number of cluster-level tries a command starts with.
pub const DEFAULT_REMAINING_TRIES: u8 = 3;

/// Result of decoding one response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decode {
    /// The command is complete; no further frames are expected.
    Done,
    /// A streaming command expects more frames with the same code.
    More,
}

/// A user-level request/response unit executed by the dispatch engine.
///
/// Concrete commands (fetch, store, time-series rows, ...) live outside the
/// engine; the engine only encodes requests, correlates responses by message
/// code, and records the outcome through this interface.
pub trait Command: Send {
    /// Stable command name for logging.
    fn name(&self) -> &'static str;

    /// Message code written in the request frame.
    fn request_code(&self) -> u8;

    /// Message code expected on response frames.
    fn expected_response_code(&self) -> u8;

    /// Builds the request payload (without frame header or code byte).
    fn encode_request(&self) -> SkvResult<Bytes>;

    /// Consumes one validated response payload.
    ///
    /// Non-streaming commands are called once and must return [`Decode::Done`].
    /// Streaming commands return [`Decode::More`] until the server sets its
    /// done flag in the payload.
    fn decode_response(&mut self, payload: &[u8]) -> SkvResult<Decode>;

    /// True when the server replies with multiple frames.
    fn is_streaming(&self) -> bool {
        false
    }

    /// True when re-executing the command is idempotent.
    fn is_retryable(&self) -> bool {
        false
    }

    /// Records a completed, successful execution.
    fn mark_success(&mut self);

    /// Records a failed execution.
    fn mark_error(&mut self, err: &SkvError);

    /// True once `mark_success` has been called.
    fn successful(&self) -> bool;

    /// Cluster-level tries left for this command.
    fn remaining_tries(&self) -> u8;

    /// Consumes one try before a re-dispatch.
    fn decrement_tries(&mut self);
}

/// Per-command bookkeeping shared by concrete command types.
///
/// Embed one of these and delegate the outcome/retry methods to it.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    succeeded: bool,
    last_error: Option<SkvError>,
    remaining_tries: u8,
}

impl CommandOutcome {
    /// Creates bookkeeping with the default retry budget.
    pub fn new() -> Self {
        Self::with_tries(DEFAULT_REMAINING_TRIES)
    }

    /// Creates bookkeeping with an explicit retry budget.
    pub fn with_tries(remaining_tries: u8) -> Self {
        CommandOutcome {
            succeeded: false,
            last_error: None,
            remaining_tries,
        }
    }

    /// Records success and clears any captured error.
    pub fn mark_success(&mut self) {
        self.succeeded = true;
        self.last_error = None;
    }

    /// Records a failure, replacing any previously captured error.
    pub fn mark_error(&mut self, err: &SkvError) {
        self.succeeded = false;
        self.last_error = Some(err.clone());
    }

    /// True once the command completed successfully.
    pub fn successful(&self) -> bool {
        self.succeeded
    }

    /// Last error recorded via `mark_error`.
    pub fn last_error(&self) -> Option<&SkvError> {
        self.last_error.as_ref()
    }

    /// Tries left before the cluster gives up re-dispatching.
    pub fn remaining_tries(&self) -> u8 {
        self.remaining_tries
    }

    /// Consumes one try.
    pub fn decrement_tries(&mut self) {
        self.remaining_tries = self.remaining_tries.saturating_sub(1);
    }
}

impl Default for CommandOutcome {
    fn default() -> Self {
        Self::new()
    }
}

/// Liveness probe: empty request, empty response.
///
/// Used as the default health check on connect and during node recovery.
#[derive(Debug, Clone, Default)]
pub struct PingCommand {
    outcome: CommandOutcome,
}

impl PingCommand {
    /// Creates a ping with the default retry budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last error recorded for this ping, if any.
    pub fn last_error(&self) -> Option<&SkvError> {
        self.outcome.last_error()
    }
}

impl Command for PingCommand {
    fn name(&self) -> &'static str {
        "Ping"
    }

    fn request_code(&self) -> u8 {
        PING_REQ_CODE
    }

    fn expected_response_code(&self) -> u8 {
        PING_RESP_CODE
    }

    fn encode_request(&self) -> SkvResult<Bytes> {
        Ok(Bytes::new())
    }

    fn decode_response(&mut self, payload: &[u8]) -> SkvResult<Decode> {
        if !payload.is_empty() {
            return Err(SkvError::DecodeFailed(format!(
                "ping response carried {} unexpected bytes",
                payload.len()
            )));
        }
        Ok(Decode::Done)
    }

    fn is_retryable(&self) -> bool {
        true
    }

    fn mark_success(&mut self) {
        self.outcome.mark_success();
    }

    fn mark_error(&mut self, err: &SkvError) {
        self.outcome.mark_error(err);
    }

    fn successful(&self) -> bool {
        self.outcome.successful()
    }

    fn remaining_tries(&self) -> u8 {
        self.outcome.remaining_tries()
    }

    fn decrement_tries(&mut self) {
        self.outcome.decrement_tries();
    }
}
