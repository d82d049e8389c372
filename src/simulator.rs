//! In-process Modbus-TCP server emulating a ventilation unit.
//!
//! The simulated unit holds [`REGISTER_COUNT`] holding registers, all zero at
//! start. It behaves like the real hardware in the ways the controller cares
//! about:
//!
//! - Writing the supply or exhaust speed setting also updates the matching
//!   actual speed register.
//! - Writing `1` to the filter usage register clears the usage counter and
//!   the filter reminder flag.
//! - A write arriving sooner than the configured spacing after the previous
//!   accepted write is acknowledged but not applied.
//!
//! The server runs on its own thread with a dedicated tokio runtime so
//! blocking callers (the sync transport, tests, the CLI) can use it directly.
//!
//! ```no_run
//! use madelon_vent_lib::simulator::{self, SimulatedDevice};
//! use std::sync::Arc;
//!
//! let device = Arc::new(SimulatedDevice::new());
//! let server = simulator::spawn("127.0.0.1:0", device.clone())?;
//! println!("Simulator listening on {}", server.local_addr());
//! # Ok::<(), std::io::Error>(())
//! ```

use crate::config::Endpoint;
use crate::protocol::{Register, FILTER_RESET_COMMAND};
use log::*;
use std::future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::{accept_tcp_connection, Server};

/// Number of holding registers of the simulated unit.
pub const REGISTER_COUNT: usize = 100;

/// Minimum pause between two applied writes.
pub const DEFAULT_WRITE_SPACING: Duration = Duration::from_millis(200);

/// Control registers whose writes are reflected in a read-only register.
const MIRRORED: [(Register, Register); 2] = [
    (Register::SupplySpeed, Register::ActualSupply),
    (Register::ExhaustSpeed, Register::ActualExhaust),
];

#[derive(Debug)]
struct DeviceState {
    registers: Vec<u16>,
    last_write: Option<Instant>,
    exception: Option<ExceptionCode>,
    reads: usize,
    writes: usize,
    dropped_writes: usize,
}

/// Register storage and behavior of the simulated unit.
#[derive(Debug)]
pub struct SimulatedDevice {
    state: Mutex<DeviceState>,
    write_spacing: Duration,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::with_write_spacing(DEFAULT_WRITE_SPACING)
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A unit that drops writes arriving less than `spacing` after the
    /// previous applied write. `Duration::ZERO` applies every write.
    pub fn with_write_spacing(spacing: Duration) -> Self {
        Self {
            state: Mutex::new(DeviceState {
                registers: vec![0; REGISTER_COUNT],
                last_write: None,
                exception: None,
                reads: 0,
                writes: 0,
                dropped_writes: 0,
            }),
            write_spacing: spacing,
        }
    }

    pub fn write_spacing(&self) -> Duration {
        self.write_spacing
    }

    pub fn register(&self, register: Register) -> u16 {
        crate::lock(&self.state).registers[usize::from(register.address())]
    }

    /// Sets a register as the unit itself would, bypassing write spacing and
    /// side effects. Used to seed sensor values.
    pub fn set_register(&self, register: Register, value: u16) {
        crate::lock(&self.state).registers[usize::from(register.address())] = value;
    }

    /// Makes every following request fail with `exception`; `None` restores
    /// normal operation.
    pub fn set_exception(&self, exception: Option<ExceptionCode>) {
        crate::lock(&self.state).exception = exception;
    }

    /// Number of served read requests.
    pub fn reads(&self) -> usize {
        crate::lock(&self.state).reads
    }

    /// Number of applied writes.
    pub fn writes(&self) -> usize {
        crate::lock(&self.state).writes
    }

    /// Number of writes acknowledged but dropped for arriving too fast.
    pub fn dropped_writes(&self) -> usize {
        crate::lock(&self.state).dropped_writes
    }

    fn read(&self, address: u16, count: u16) -> Result<Vec<u16>, ExceptionCode> {
        let mut state = crate::lock(&self.state);
        if let Some(exception) = state.exception {
            return Err(exception);
        }
        let start = usize::from(address);
        let end = start + usize::from(count);
        if end > REGISTER_COUNT {
            debug!("Read of {count} registers at {address} is out of range");
            return Err(ExceptionCode::IllegalDataAddress);
        }
        state.reads += 1;
        Ok(state.registers[start..end].to_vec())
    }

    fn write(&self, address: u16, values: &[u16]) -> Result<(), ExceptionCode> {
        let mut state = crate::lock(&self.state);
        if let Some(exception) = state.exception {
            return Err(exception);
        }
        let start = usize::from(address);
        if start + values.len() > REGISTER_COUNT {
            debug!("Write of {} registers at {address} is out of range", values.len());
            return Err(ExceptionCode::IllegalDataAddress);
        }
        if let Some(last_write) = state.last_write {
            let since = last_write.elapsed();
            if since < self.write_spacing {
                warn!(
                    "Write too fast, {since:?} since the last write, at least {:?} required",
                    self.write_spacing
                );
                state.dropped_writes += 1;
                return Ok(());
            }
        }
        state.last_write = Some(Instant::now());
        state.writes += 1;
        for (address, &value) in (address..).zip(values) {
            Self::apply(&mut state.registers, address, value);
        }
        Ok(())
    }

    fn apply(registers: &mut [u16], address: u16, value: u16) {
        let slot = |register: Register| usize::from(register.address());
        if address == Register::FilterUsageTime.address() && value == FILTER_RESET_COMMAND {
            debug!("Filter usage time reset");
            registers[slot(Register::FilterUsageTime)] = 0;
            registers[slot(Register::FilterReminder)] = 0;
            return;
        }
        registers[usize::from(address)] = value;
        debug!("Written value {value} to register {address}");
        if let Some((_, actual)) = MIRRORED
            .iter()
            .find(|(control, _)| control.address() == address)
        {
            registers[slot(*actual)] = value;
            debug!("Updated {actual} with value {value}");
        }
    }
}

/// Per-connection Modbus service backed by a shared [`SimulatedDevice`].
#[derive(Debug, Clone)]
struct DeviceService {
    device: Arc<SimulatedDevice>,
}

impl tokio_modbus::server::Service for DeviceService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let response = match req {
            Request::ReadHoldingRegisters(address, count) => self
                .device
                .read(address, count)
                .map(Response::ReadHoldingRegisters),
            Request::WriteSingleRegister(address, value) => self
                .device
                .write(address, &[value])
                .map(|()| Response::WriteSingleRegister(address, value)),
            Request::WriteMultipleRegisters(address, values) => self
                .device
                .write(address, &values)
                .map(|()| Response::WriteMultipleRegisters(address, values.len() as u16)),
            other => {
                debug!("Unsupported request {other:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(response)
    }
}

/// A running simulator. Dropping the handle stops the server.
#[derive(Debug)]
pub struct SimulatorHandle {
    local_addr: SocketAddr,
    device: Arc<SimulatedDevice>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatorHandle {
    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn device(&self) -> &Arc<SimulatedDevice> {
        &self.device
    }

    /// Endpoint to reach the simulator with the given unit id.
    pub fn endpoint(&self, unit_id: u8) -> Endpoint {
        Endpoint::new(self.local_addr.ip().to_string(), self.local_addr.port(), unit_id)
    }

    /// Blocks until the server thread terminates.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Simulator thread panicked");
            }
        }
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The server may already have stopped on its own.
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Simulator thread panicked");
            }
        }
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Binds `listen` and serves `device` on a background thread.
///
/// The socket is bound before this returns, so clients may connect right
/// away. Use port `0` to let the OS choose a free port.
pub fn spawn(listen: impl ToSocketAddrs, device: Arc<SimulatedDevice>) -> io::Result<SimulatorHandle> {
    let listener = std::net::TcpListener::bind(listen)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let (shutdown, shutdown_rx) = oneshot::channel();
    let service = DeviceService {
        device: device.clone(),
    };

    let thread = thread::Builder::new()
        .name("simulator".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(error) => {
                        error!("Cannot register simulator socket: {error}");
                        return;
                    }
                };
                info!("Simulator listening on {local_addr}");
                let server = Server::new(listener);
                let on_connected = move |stream, socket_addr| {
                    let service = service.clone();
                    async move {
                        debug!("Simulator accepted connection from {socket_addr}");
                        accept_tcp_connection(stream, socket_addr, move |_socket_addr| {
                            Ok(Some(service.clone()))
                        })
                    }
                };
                let on_process_error = |error| {
                    error!("Simulator connection error: {error}");
                };
                tokio::select! {
                    result = server.serve(&on_connected, on_process_error) => {
                        if let Err(error) = result {
                            error!("Simulator server error: {error}");
                        }
                    }
                    _ = shutdown_rx => debug!("Simulator on {local_addr} shutting down"),
                }
            });
        })?;

    Ok(SimulatorHandle {
        local_addr,
        device,
        shutdown: Some(shutdown),
        thread: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn speed_writes_are_mirrored() {
        let device = SimulatedDevice::with_write_spacing(Duration::ZERO);
        device.write(Register::SupplySpeed.address(), &[3]).unwrap();
        device.write(Register::ExhaustSpeed.address(), &[1]).unwrap();
        assert_eq!(device.register(Register::ActualSupply), 3);
        assert_eq!(device.register(Register::ActualExhaust), 1);
        assert_eq!(device.writes(), 2);
    }

    #[test]
    fn filter_reset_clears_counter_and_reminder() {
        let device = SimulatedDevice::with_write_spacing(Duration::ZERO);
        device.set_register(Register::FilterUsageTime, 1234);
        device.set_register(Register::FilterReminder, 1);
        device
            .write(Register::FilterUsageTime.address(), &[FILTER_RESET_COMMAND])
            .unwrap();
        assert_eq!(device.register(Register::FilterUsageTime), 0);
        assert_eq!(device.register(Register::FilterReminder), 0);
    }

    #[test]
    fn fast_writes_are_acknowledged_but_dropped() {
        let device = SimulatedDevice::with_write_spacing(Duration::from_secs(60));
        device.write(Register::Power.address(), &[1]).unwrap();
        assert_matches!(device.write(Register::Mode.address(), &[2]), Ok(()));
        assert_eq!(device.register(Register::Power), 1);
        assert_eq!(device.register(Register::Mode), 0);
        assert_eq!(device.dropped_writes(), 1);
    }

    #[test]
    fn out_of_range_requests_are_rejected() {
        let device = SimulatedDevice::new();
        assert_eq!(device.read(0, 18).unwrap().len(), 18);
        assert_eq!(device.read(99, 2), Err(ExceptionCode::IllegalDataAddress));
        assert_eq!(device.write(100, &[1]), Err(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn exception_mode() {
        let device = SimulatedDevice::new();
        device.set_exception(Some(ExceptionCode::ServerDeviceBusy));
        assert_eq!(device.read(0, 18), Err(ExceptionCode::ServerDeviceBusy));
        device.set_exception(None);
        assert!(device.read(0, 18).is_ok());
    }
}
