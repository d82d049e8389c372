//! In-memory [`Transport`] double for unit tests.

use crate::protocol::{Register, FILTER_RESET_COMMAND, REGISTER_MAP};
use crate::transport::{self, ConnectionState, Transport};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct DeviceState {
    registers: Vec<u16>,
    online: bool,
    acknowledge_writes: bool,
    response_len: Option<usize>,
    read_delay: Duration,
    reads_started: usize,
    reads: usize,
    writes: Vec<(u16, u16)>,
}

/// Shared handle on the simulated registers and the recorded traffic.
#[derive(Debug, Clone)]
pub(crate) struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                registers: vec![0; usize::from(REGISTER_MAP.count())],
                online: true,
                acknowledge_writes: true,
                response_len: None,
                read_delay: Duration::ZERO,
                reads_started: 0,
                reads: 0,
                writes: Vec::new(),
            })),
        }
    }

    pub(crate) fn transport(&self) -> MockTransport {
        MockTransport {
            device: self.clone(),
            state: ConnectionState::Disconnected,
        }
    }

    pub(crate) fn set(&self, register: Register, value: u16) {
        self.state.lock().unwrap().registers[usize::from(register.address())] = value;
    }

    pub(crate) fn set_block(&self, values: &[u16]) {
        let mut state = self.state.lock().unwrap();
        state.registers[..values.len()].copy_from_slice(values);
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.state.lock().unwrap().online = online;
    }

    pub(crate) fn set_acknowledge_writes(&self, acknowledge: bool) {
        self.state.lock().unwrap().acknowledge_writes = acknowledge;
    }

    pub(crate) fn set_response_len(&self, len: Option<usize>) {
        self.state.lock().unwrap().response_len = len;
    }

    pub(crate) fn set_read_delay(&self, delay: Duration) {
        self.state.lock().unwrap().read_delay = delay;
    }

    pub(crate) fn reads_started(&self) -> usize {
        self.state.lock().unwrap().reads_started
    }

    pub(crate) fn reads(&self) -> usize {
        self.state.lock().unwrap().reads
    }

    pub(crate) fn writes(&self) -> Vec<(u16, u16)> {
        self.state.lock().unwrap().writes.clone()
    }
}

pub(crate) struct MockTransport {
    device: MockDevice,
    state: ConnectionState,
}

impl Transport for MockTransport {
    fn connect(&mut self) -> transport::Result<bool> {
        let online = self.device.state.lock().unwrap().online;
        self.state = if online {
            ConnectionState::Connected
        } else {
            ConnectionState::Failed("offline".to_string())
        };
        Ok(online)
    }

    fn read_holding_registers(&mut self, start: u16, count: u16) -> Option<Vec<u16>> {
        if !self.connect().ok()? {
            return None;
        }
        let delay = {
            let mut state = self.device.state.lock().unwrap();
            state.reads_started += 1;
            state.read_delay
        };
        std::thread::sleep(delay);
        let mut state = self.device.state.lock().unwrap();
        state.reads += 1;
        let start = usize::from(start);
        let len = state.response_len.unwrap_or(usize::from(count));
        Some(state.registers[start..start + len].to_vec())
    }

    fn write_single_register(&mut self, address: u16, value: u16) -> bool {
        if !self.connect().unwrap_or(false) {
            return false;
        }
        let mut state = self.device.state.lock().unwrap();
        state.writes.push((address, value));
        if state.acknowledge_writes {
            if address == Register::FilterUsageTime.address() && value == FILTER_RESET_COMMAND {
                state.registers[usize::from(address)] = 0;
                state.registers[usize::from(Register::FilterReminder.address())] = 0;
            } else {
                state.registers[usize::from(address)] = value;
            }
        }
        state.acknowledge_writes
    }

    fn close(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    fn state(&self) -> &ConnectionState {
        &self.state
    }
}
