//! Resilient Modbus-TCP transport.
//!
//! The [`Transport`] trait is the only way the rest of the crate talks to the
//! field bus. Its contract is deliberately non-throwing: a read yields `None`
//! and a write yields `false` whenever the connection cannot be established,
//! the device answers with a Modbus exception, or the socket fails mid-request.
//! The classified [`Error`] is logged, never returned from a read or write.
//!
//! [`ModbusTcpTransport`] implements the trait on top of the synchronous
//! `tokio-modbus` TCP client. It connects lazily, retries a bounded number of
//! times with a fixed delay, and drops the connection after a transport error
//! so the next request reconnects transparently.

use crate::config::{ConnectionConfig, Endpoint};
use log::*;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use std::{fmt, io};
use tokio_modbus::client::sync::{tcp, Context};
use tokio_modbus::prelude::{SyncReader, SyncWriter};
use tokio_modbus::Slave;

/// Classified transport failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The endpoint could not be resolved to a socket address.
    #[error("Cannot resolve '{0}'")]
    Resolve(String, #[source] io::Error),
    /// Opening the TCP connection failed.
    #[error("Connection failed: {0}")]
    Connect(#[source] io::Error),
    /// The overall connection timeout elapsed before a connection was made.
    #[error("Connection timeout after {0:?}")]
    ConnectTimeout(Duration),
    /// No connection could be established within the retry budget.
    #[error("Not connected")]
    NotConnected,
    /// The Modbus request failed on the wire.
    #[error("Modbus error: {0}")]
    Modbus(#[from] tokio_modbus::Error),
    /// The device answered with a Modbus exception.
    #[error("Modbus exception: {0}")]
    Exception(#[from] tokio_modbus::ExceptionCode),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Connection state of a transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    /// The last connection attempt failed for the given reason.
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Request/response access to the holding registers of one device.
pub trait Transport: Send {
    /// Establishes the connection if it is not already open.
    ///
    /// Returns `Ok(false)` if every attempt within the retry budget failed
    /// with an ordinary connectivity error. Unexpected errors are returned.
    fn connect(&mut self) -> Result<bool>;

    /// Reads `count` holding registers starting at `start`.
    fn read_holding_registers(&mut self, start: u16, count: u16) -> Option<Vec<u16>>;

    /// Writes one holding register and reports whether the device acknowledged it.
    fn write_single_register(&mut self, address: u16, value: u16) -> bool;

    /// Releases the connection. Safe to call repeatedly.
    fn close(&mut self);

    fn state(&self) -> &ConnectionState;
}

/// Bounds for connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of connection attempts.
    pub attempts: u32,
    /// Pause between two attempts.
    pub delay: Duration,
    /// Budget for all attempts together, measured from the first attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

impl From<&ConnectionConfig> for RetryPolicy {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            attempts: config.retry_count,
            delay: config.retry_delay,
            timeout: config.connection_timeout,
        }
    }
}

/// Returns `true` for I/O errors that a later attempt may not hit again
/// (refused, reset, timed out, unreachable, ...).
pub fn is_connectivity_error(error: &io::Error) -> bool {
    !matches!(
        error.kind(),
        io::ErrorKind::InvalidInput
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::Unsupported
            | io::ErrorKind::OutOfMemory
    )
}

/// Runs `attempt` until it succeeds or the retry budget is exhausted.
///
/// Each attempt receives the remaining share of the overall timeout. Ordinary
/// connectivity errors are logged and retried after `policy.delay`; any other
/// error aborts immediately.
pub fn connect_with_retry<C, F>(policy: &RetryPolicy, mut attempt: F) -> Result<Option<C>>
where
    F: FnMut(Duration) -> io::Result<C>,
{
    let started = Instant::now();
    for number in 1..=policy.attempts {
        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            error!("{}", Error::ConnectTimeout(policy.timeout));
            return Ok(None);
        }
        match attempt(policy.timeout - elapsed) {
            Ok(connection) => return Ok(Some(connection)),
            Err(error) if is_connectivity_error(&error) => {
                error!(
                    "Connection attempt {number}/{} failed: {error}",
                    policy.attempts
                );
            }
            Err(error) => {
                error!("Unexpected connection error: {error}");
                return Err(Error::Connect(error));
            }
        }
        if number < policy.attempts {
            let remaining = policy.timeout.saturating_sub(started.elapsed());
            std::thread::sleep(policy.delay.min(remaining));
        }
    }
    Ok(None)
}

/// Maps the nested `tokio-modbus` result onto our error type.
fn map_tokio_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
    match result {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err.into()), // Modbus exception
        Err(err) => Err(err.into()),     // IO error
    }
}

/// Modbus-TCP transport backed by the synchronous `tokio-modbus` client.
///
/// All calls block the current thread for at most the connection timeout
/// plus the I/O timeout.
pub struct ModbusTcpTransport {
    endpoint: Endpoint,
    policy: RetryPolicy,
    io_timeout: Duration,
    ctx: Option<Context>,
    state: ConnectionState,
}

impl ModbusTcpTransport {
    /// Creates a disconnected transport. No I/O happens until the first request.
    pub fn new(endpoint: Endpoint, connection: &ConnectionConfig) -> Self {
        Self {
            endpoint,
            policy: RetryPolicy::from(connection),
            io_timeout: connection.io_timeout,
            ctx: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn resolve(&self) -> io::Result<SocketAddr> {
        (self.endpoint.host.as_str(), self.endpoint.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", self.endpoint),
                )
            })
    }

    fn open(&self, timeout: Duration) -> io::Result<Context> {
        let socket_addr = self.resolve().map_err(|err| {
            warn!("{}", Error::Resolve(self.endpoint.to_string(), err));
            io::Error::new(io::ErrorKind::NotFound, "address resolution failed")
        })?;
        debug!("Connecting to {socket_addr} (unit {})", self.endpoint.unit_id);
        let mut ctx = tcp::connect_slave_with_timeout(
            socket_addr,
            Slave(self.endpoint.unit_id),
            Some(timeout),
        )?;
        ctx.set_timeout(self.io_timeout);
        Ok(ctx)
    }

    /// Drops the connection after a failed request so the next one reconnects.
    fn handle_request_error(&mut self, operation: &str, error: Error) {
        error!("Error {operation} on {}: {error}", self.endpoint);
        if !matches!(error, Error::Exception(_)) {
            self.ctx = None;
            self.state = ConnectionState::Disconnected;
        }
    }

    fn ensure_connected(&mut self) -> Option<&mut Context> {
        match self.connect() {
            Ok(true) => self.ctx.as_mut(),
            Ok(false) => None,
            Err(error) => {
                error!("Cannot connect to {}: {error}", self.endpoint);
                None
            }
        }
    }
}

impl Transport for ModbusTcpTransport {
    fn connect(&mut self) -> Result<bool> {
        if self.ctx.is_some() {
            return Ok(true);
        }
        let policy = self.policy;
        match connect_with_retry(&policy, |timeout| self.open(timeout)) {
            Ok(Some(ctx)) => {
                info!("Connected to {}", self.endpoint);
                self.ctx = Some(ctx);
                self.state = ConnectionState::Connected;
                Ok(true)
            }
            Ok(None) => {
                self.state = ConnectionState::Failed(Error::NotConnected.to_string());
                Ok(false)
            }
            Err(error) => {
                self.state = ConnectionState::Failed(error.to_string());
                Err(error)
            }
        }
    }

    fn read_holding_registers(&mut self, start: u16, count: u16) -> Option<Vec<u16>> {
        let ctx = self.ensure_connected()?;
        match map_tokio_result(ctx.read_holding_registers(start, count)) {
            Ok(registers) => Some(registers),
            Err(error) => {
                self.handle_request_error("reading registers", error);
                None
            }
        }
    }

    fn write_single_register(&mut self, address: u16, value: u16) -> bool {
        let Some(ctx) = self.ensure_connected() else {
            return false;
        };
        match map_tokio_result(ctx.write_single_register(address, value)) {
            Ok(()) => true,
            Err(error) => {
                self.handle_request_error("writing register", error);
                false
            }
        }
    }

    fn close(&mut self) {
        if self.ctx.take().is_some() {
            debug!("Closed connection to {}", self.endpoint);
        }
        self.state = ConnectionState::Disconnected;
    }

    fn state(&self) -> &ConnectionState {
        &self.state
    }
}

impl Drop for ModbusTcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ModbusTcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusTcpTransport")
            .field("endpoint", &self.endpoint)
            .field("policy", &self.policy)
            .field("state", &self.state)
            .finish()
    }
}
