//! # Connection
//!
//! Purpose: One TCP conversation with a SeriesKV node, executing one command
//! request/response at a time.
//!
//! ## Design Principles
//! 1. **One Command In Flight**: The borrower holds the connection
//!    exclusively; `in_flight` only documents and asserts that invariant.
//! 2. **Temporary vs Fatal**: Deadline expiries and interrupts are retried on
//!    the same socket up to a per-operation budget; anything else closes the
//!    socket and marks the connection unavailable.
//! 3. **Cache-Friendly Buffers**: The read buffer lives on the connection and
//!    is reused across commands.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, warn};

use skv_common::{frame, Command, Decode, SkvError, SkvResult};

/// Default remote endpoint.
pub const DEFAULT_REMOTE_ADDRESS: &str = "127.0.0.1:8087";
/// Default TCP dial deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default per-operation I/O deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Default retries on transient network errors per operation.
pub const DEFAULT_TEMP_ERROR_RETRIES: u32 = 2;

// Pause between same-connection retries of a transient failure.
const TEMP_RETRY_PAUSE: Duration = Duration::from_millis(25);

// Upper bound on an accepted response frame; larger lengths indicate a
// desynchronized stream.
const MAX_FRAME_LENGTH: u32 = 64 * 1024 * 1024;

/// Pluggable post-connect upgrade (authentication / TLS session setup).
pub trait Handshake: Send + Sync {
    /// Performs the upgrade on the freshly dialed socket.
    fn perform(&self, stream: &mut TcpStream) -> SkvResult<()>;
}

/// Factory producing a fresh health-check command per probe.
pub type HealthCheckFn = Arc<dyn Fn() -> Box<dyn Command> + Send + Sync>;

/// Connection construction options.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Remote endpoint, e.g. "127.0.0.1:8087".
    pub addr: String,
    /// TCP dial deadline.
    pub connect_timeout: Duration,
    /// Per-operation read/write deadline.
    pub request_timeout: Duration,
    /// Same-connection retries for transient network errors.
    pub temp_error_retries: u32,
    /// Optional post-connect auth/TLS upgrade.
    pub handshake: Option<Arc<dyn Handshake>>,
    /// Optional command executed synchronously right after connect.
    pub health_check: Option<HealthCheckFn>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            addr: DEFAULT_REMOTE_ADDRESS.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            temp_error_retries: DEFAULT_TEMP_ERROR_RETRIES,
            handshake: None,
            health_check: None,
        }
    }
}

impl ConnectionOptions {
    /// Fails with `AddressRequired` when no endpoint was supplied.
    pub fn validate(&self) -> SkvResult<()> {
        if self.addr.is_empty() {
            return Err(SkvError::AddressRequired);
        }
        Ok(())
    }
}

/// One TCP socket carrying one command at a time.
pub struct Connection {
    opts: ConnectionOptions,
    resolved: Option<SocketAddr>,
    stream: Option<TcpStream>,
    available: bool,
    in_flight: bool,
    last_used: Instant,
    read_buf: BytesMut,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.opts.addr)
            .field("available", &self.available)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}


impl Connection {
    /// Creates an unconnected connection from validated options.
    pub fn new(opts: ConnectionOptions) -> SkvResult<Self> {
        opts.validate()?;
        Ok(Connection {
            opts,
            resolved: None,
            stream: None,
            available: false,
            in_flight: false,
            last_used: Instant::now(),
            read_buf: BytesMut::with_capacity(8 * 1024),
        })
    }

    /// Resolves, dials, upgrades, and optionally health-checks the socket.
    pub fn connect(&mut self) -> SkvResult<()> {
        let addr = self.resolve()?;
        let mut stream = TcpStream::connect_timeout(&addr, self.opts.connect_timeout)
            .map_err(|err| SkvError::from_connect(&err))?;
        // Small request/response frames; latency matters more than batching.
        let _ = stream.set_nodelay(true);
        stream
            .set_read_timeout(Some(self.opts.request_timeout))
            .map_err(|err| SkvError::from_read(&err))?;
        stream
            .set_write_timeout(Some(self.opts.request_timeout))
            .map_err(|err| SkvError::from_write(&err))?;

        if let Some(handshake) = self.opts.handshake.clone() {
            handshake.perform(&mut stream).map_err(|err| match err {
                err @ (SkvError::AuthTlsConfigMissing | SkvError::AuthTlsUpgradeFailed(_)) => err,
                other => SkvError::AuthFailed(other.to_string()),
            })?;
        }

        self.stream = Some(stream);
        self.available = true;
        self.last_used = Instant::now();

        if let Some(health_check) = self.opts.health_check.clone() {
            let mut cmd = health_check();
            if let Err(err) = self.execute(cmd.as_mut()) {
                self.close();
                return Err(SkvError::HealthCheckFailed(err.to_string()));
            }
        }

        debug!(addr = %self.opts.addr, "connection established");
        Ok(())
    }

    fn resolve(&mut self) -> SkvResult<SocketAddr> {
        if let Some(addr) = self.resolved {
            return Ok(addr);
        }
        let addr = self
            .opts
            .addr
            .to_socket_addrs()
            .map_err(|err| SkvError::AddressResolution(err.to_string()))?
            .next()
            .ok_or_else(|| SkvError::AddressResolution(self.opts.addr.clone()))?;
        self.resolved = Some(addr);
        Ok(addr)
    }

    /// Executes one command: encode, write, read response frame(s).
    ///
    /// On success the command is marked successful and `last_used` advances.
    /// Non-temporary failures close the socket and mark the connection
    /// unavailable; the caller must then remove it from its pool.
    pub fn execute(&mut self, cmd: &mut dyn Command) -> SkvResult<()> {
        debug_assert!(!self.in_flight, "connection shared while in flight");
        self.in_flight = true;
        let result = self.run(cmd);
        self.in_flight = false;

        match &result {
            Ok(()) => {
                self.last_used = Instant::now();
                cmd.mark_success();
            }
            Err(err) => {
                cmd.mark_error(err);
                if !Self::leaves_connection_usable(err) {
                    warn!(addr = %self.opts.addr, command = cmd.name(), %err, "connection failed");
                    self.close();
                    self.available = false;
                }
            }
        }
        result
    }

    // A well-formed server rejection consumed a whole frame; the stream is
    // still in sync and the socket stays pooled.
    fn leaves_connection_usable(err: &SkvError) -> bool {
        matches!(err, SkvError::ServerError { .. })
    }

    fn run(&mut self, cmd: &mut dyn Command) -> SkvResult<()> {
        let payload = cmd.encode_request()?;
        let request = frame::encode(cmd.request_code(), &payload);

        let mut temp_budget = self.opts.temp_error_retries;
        loop {
            match self.attempt(cmd, &request) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_temporary() && temp_budget > 0 => {
                    temp_budget -= 1;
                    debug!(
                        addr = %self.opts.addr,
                        command = cmd.name(),
                        remaining = temp_budget,
                        "temporary network error, retrying"
                    );
                    thread::sleep(TEMP_RETRY_PAUSE);
                }
                Err(err) if err.is_temporary() => {
                    // Budget exhausted; escalate to a fatal read failure.
                    return Err(SkvError::ReadFailed(err.to_string()));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt(&mut self, cmd: &mut dyn Command, request: &[u8]) -> SkvResult<()> {
        self.write_request(request)?;

        let mut frames = 0usize;
        loop {
            let body = match self.read_frame() {
                Ok(body) => body,
                // A timeout after frames were already consumed leaves the
                // stream desynchronized; re-sending is no longer safe.
                Err(err) if err.is_temporary() && frames > 0 => {
                    return Err(SkvError::ReadFailed(err.to_string()));
                }
                Err(err) => return Err(err),
            };
            frames += 1;

            let payload = frame::validate_response(&body, cmd.expected_response_code())?;
            match cmd.decode_response(payload)? {
                Decode::Done => return Ok(()),
                Decode::More if cmd.is_streaming() => continue,
                Decode::More => {
                    return Err(SkvError::DecodeFailed(format!(
                        "non-streaming command {} asked for more frames",
                        cmd.name()
                    )))
                }
            }
        }
    }

    fn write_request(&mut self, request: &[u8]) -> SkvResult<()> {
        let stream = self.stream.as_mut().ok_or(SkvError::ConnectRefused)?;
        stream.write_all(request).map_err(|err| {
            if err.kind() == std::io::ErrorKind::WriteZero {
                SkvError::ShortWrite {
                    wanted: request.len(),
                    wrote: 0,
                }
            } else {
                SkvError::from_write(&err)
            }
        })?;
        stream.flush().map_err(|err| SkvError::from_write(&err))
    }

    // Reads one complete frame body (code byte plus payload).
    fn read_frame(&mut self) -> SkvResult<BytesMut> {
        let stream = self.stream.as_mut().ok_or(SkvError::ConnectRefused)?;

        let mut header = [0u8; frame::LENGTH_PREFIX_SIZE];
        read_exact(stream, &mut header)?;
        let len = frame::decode_length(header);
        if len == 0 {
            return Err(SkvError::ZeroLength);
        }
        if len > MAX_FRAME_LENGTH {
            return Err(SkvError::DecodeFailed(format!(
                "frame length {len} exceeds limit"
            )));
        }

        self.read_buf.resize(len as usize, 0);
        let mut body = self.read_buf.split_to(len as usize);
        read_exact(stream, &mut body)?;
        Ok(body)
    }

    /// Closes the socket; idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.available = false;
    }

    /// True while the socket is open and no fatal error has occurred.
    pub fn available(&self) -> bool {
        self.available && self.stream.is_some()
    }

    /// Instant of the last successful execute (or connect).
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Remote endpoint this connection dials.
    pub fn addr(&self) -> &str {
        &self.opts.addr
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> SkvResult<()> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(SkvError::ShortRead {
                    wanted: buf.len(),
                    got: filled,
                })
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                // A deadline expiry mid-frame means bytes may still arrive;
                // report it as temporary only when nothing was consumed.
                if filled == 0 {
                    return Err(SkvError::from_read(&err));
                }
                return Err(SkvError::ReadFailed(err.to_string()));
            }
        }
    }
    Ok(())
}
