//! Typed access to one ventilation unit.
//!
//! [`DeviceController`] is the entry point for every caller. Getters read
//! through the [`StateCache`] and decode the raw register; they return `None`
//! when no block could be read. Setters validate and encode first, write the
//! register directly through the transport and, once the device acknowledged
//! the write, patch the cached block so the next getter reflects the new value
//! without another bus round-trip.
//!
//! ## Example
//!
//! ```no_run
//! use madelon_vent_lib::{config::DeviceConfig, controller::DeviceController, protocol::Speed};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = DeviceController::new(&DeviceConfig::new("192.168.6.137"));
//!
//!     if let Some(temperature) = controller.temperature() {
//!         println!("Temperature: {temperature} °C");
//!     }
//!     controller.set_supply_speed("high")?;
//!     assert_eq!(controller.supply_speed(), Some(Speed::High));
//!     Ok(())
//! }
//! ```

use crate::cache::{RegisterBlock, StateCache};
use crate::config::{DeviceConfig, Endpoint};
use crate::notifier::Observer;
use crate::protocol::{
    self as proto, FilterReminderHours, Mode, OperatingPreset, Register, Speed,
    FILTER_RESET_COMMAND, REGISTER_MAP,
};
use crate::transport::{ConnectionState, ModbusTcpTransport, Transport};
use log::*;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// All fields of the device decoded from one register block.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Snapshot {
    pub power: bool,
    pub mode: Mode,
    pub supply_speed: Option<Speed>,
    pub exhaust_speed: Option<Speed>,
    pub bypass: bool,
    pub actual_supply: u16,
    pub actual_exhaust: u16,
    pub temperature: f32,
    pub humidity: f32,
    pub filter_usage_time: u16,
    pub filter_reminder_setting: u16,
    pub filter_reminder: bool,
}

impl Snapshot {
    pub fn decode(block: &RegisterBlock) -> Self {
        let raw = |register: Register| block.get(register.address());
        Self {
            power: proto::decode_flag(raw(Register::Power)),
            mode: Mode::decode(raw(Register::Mode)),
            supply_speed: Speed::decode(raw(Register::SupplySpeed)),
            exhaust_speed: Speed::decode(raw(Register::ExhaustSpeed)),
            bypass: proto::decode_flag(raw(Register::Bypass)),
            actual_supply: raw(Register::ActualSupply),
            actual_exhaust: raw(Register::ActualExhaust),
            temperature: proto::decode_tenths(raw(Register::Temperature)),
            humidity: proto::decode_tenths(raw(Register::Humidity)),
            filter_usage_time: raw(Register::FilterUsageTime),
            filter_reminder_setting: raw(Register::FilterReminderSetting),
            filter_reminder: proto::decode_flag(raw(Register::FilterReminder)),
        }
    }
}

fn or_unknown<T: fmt::Display>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map_or_else(|| "unknown".to_string(), T::to_string)
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let on_off = |flag: bool| if flag { "on" } else { "off" };
        writeln!(f, "Power: {}", on_off(self.power))?;
        writeln!(f, "Mode: {}", self.mode)?;
        writeln!(f, "Supply speed: {}", or_unknown(&self.supply_speed))?;
        writeln!(f, "Exhaust speed: {}", or_unknown(&self.exhaust_speed))?;
        writeln!(f, "Bypass: {}", on_off(self.bypass))?;
        writeln!(f, "Actual supply speed: {}", self.actual_supply)?;
        writeln!(f, "Actual exhaust speed: {}", self.actual_exhaust)?;
        writeln!(f, "Temperature: {:.1} °C", self.temperature)?;
        writeln!(f, "Humidity: {:.1} %", self.humidity)?;
        writeln!(f, "Filter usage time: {} h", self.filter_usage_time)?;
        writeln!(f, "Filter reminder setting: {} h", self.filter_reminder_setting)?;
        write!(f, "Filter reminder: {}", on_off(self.filter_reminder))
    }
}

/// Controller of one device endpoint.
///
/// Cloning is cheap: clones share the transport and the cache, so field
/// specific facades can each hold their own handle on the same device.
pub struct DeviceController<T = ModbusTcpTransport> {
    endpoint: Endpoint,
    transport: Arc<Mutex<T>>,
    cache: Arc<StateCache<T>>,
}

impl<T> Clone for DeviceController<T> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            transport: self.transport.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl DeviceController<ModbusTcpTransport> {
    /// Creates a controller for the configured endpoint. The connection is
    /// opened by the first read or write.
    pub fn new(config: &DeviceConfig) -> Self {
        let endpoint = config.endpoint();
        let transport = ModbusTcpTransport::new(endpoint.clone(), &config.connection);
        debug!("Initialized controller for {endpoint}");
        Self::with_transport(endpoint, transport, config.cache_ttl)
    }
}

impl<T: Transport> DeviceController<T> {
    pub fn with_transport(endpoint: Endpoint, transport: T, cache_ttl: Duration) -> Self {
        let transport = Arc::new(Mutex::new(transport));
        let cache = Arc::new(StateCache::new(transport.clone(), REGISTER_MAP, cache_ttl));
        Self {
            endpoint,
            transport,
            cache,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stable identifier of the device, `host:port`.
    pub fn unique_id(&self) -> String {
        self.endpoint.unique_id()
    }

    pub fn cache(&self) -> &StateCache<T> {
        &self.cache
    }

    pub fn connection_state(&self) -> ConnectionState {
        crate::lock(&self.transport).state().clone()
    }

    /// Registers an observer notified after every block read from the device.
    pub fn register_observer(&self, observer: Arc<dyn Observer>) {
        self.cache.notifier().register(observer);
    }

    /// Refreshes the register block, see [`StateCache::refresh`].
    pub fn refresh(&self, force: bool) -> bool {
        self.cache.refresh(force)
    }

    /// Releases the connection and drops the cached block; the next request
    /// reconnects and reads the device.
    pub fn close(&self) {
        crate::lock(&self.transport).close();
        self.cache.invalidate();
    }

    /// Decodes every field from a single cache access.
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.cache.snapshot().map(|block| Snapshot::decode(&block))
    }

    fn read(&self, register: Register) -> Option<u16> {
        self.cache.get_raw(register.address())
    }

    fn write_through(&self, register: Register, value: u16) -> bool {
        debug_assert!(register.is_writable(), "{register} is read only");
        debug!("Setting {register} to {value}");
        let mut transport = crate::lock(&self.transport);
        let acknowledged = transport.write_single_register(register.address(), value);
        if acknowledged {
            self.cache.patch_raw(register.address(), value);
        } else {
            warn!("Write of {value} to {register} was not acknowledged");
        }
        acknowledged
    }

    pub fn power(&self) -> Option<bool> {
        self.read(Register::Power).map(proto::decode_flag)
    }

    pub fn set_power(&self, on: bool) -> bool {
        self.write_through(Register::Power, proto::encode_flag(on))
    }

    pub fn mode(&self) -> Option<Mode> {
        self.read(Register::Mode).map(Mode::decode)
    }

    /// Sets the operating mode. Mode names are parsed permissively, see
    /// [`Mode::from_str_lossy`].
    pub fn set_mode(&self, mode: impl Into<Mode>) -> bool {
        self.write_through(Register::Mode, mode.into().encode())
    }

    /// Supply fan speed setting; `None` if unknown or outside `1..=3`.
    pub fn supply_speed(&self) -> Option<Speed> {
        self.read(Register::SupplySpeed).and_then(Speed::decode)
    }

    /// Sets the supply fan speed from a [`Speed`], a tier number `1 - 3` or a
    /// name (`"low"`, `"medium"`, `"high"`). Invalid input is rejected before
    /// anything is written.
    pub fn set_supply_speed<S>(&self, speed: S) -> Result<bool, proto::Error>
    where
        S: TryInto<Speed>,
        proto::Error: From<S::Error>,
    {
        let speed = speed.try_into()?;
        Ok(self.write_through(Register::SupplySpeed, speed.encode()))
    }

    pub fn exhaust_speed(&self) -> Option<Speed> {
        self.read(Register::ExhaustSpeed).and_then(Speed::decode)
    }

    /// Sets the exhaust fan speed, see [`Self::set_supply_speed`].
    pub fn set_exhaust_speed<S>(&self, speed: S) -> Result<bool, proto::Error>
    where
        S: TryInto<Speed>,
        proto::Error: From<S::Error>,
    {
        let speed = speed.try_into()?;
        Ok(self.write_through(Register::ExhaustSpeed, speed.encode()))
    }

    pub fn bypass(&self) -> Option<bool> {
        self.read(Register::Bypass).map(proto::decode_flag)
    }

    pub fn set_bypass(&self, on: bool) -> bool {
        self.write_through(Register::Bypass, proto::encode_flag(on))
    }

    /// Actual supply fan speed as reported by the device.
    ///
    /// On real hardware this mirrors the supply speed setting with a
    /// device-dependent delay; no relationship to recent writes is assumed.
    pub fn actual_supply_speed(&self) -> Option<u16> {
        self.read(Register::ActualSupply)
    }

    /// Actual exhaust fan speed as reported by the device.
    pub fn actual_exhaust_speed(&self) -> Option<u16> {
        self.read(Register::ActualExhaust)
    }

    /// Temperature in °C.
    pub fn temperature(&self) -> Option<f32> {
        self.read(Register::Temperature).map(proto::decode_tenths)
    }

    /// Relative humidity in %.
    pub fn humidity(&self) -> Option<f32> {
        self.read(Register::Humidity).map(proto::decode_tenths)
    }

    /// Hours the filter has been in use since the last reset.
    pub fn filter_usage_time(&self) -> Option<u16> {
        self.read(Register::FilterUsageTime)
    }

    /// Filter usage in hours after which the reminder is raised.
    pub fn filter_reminder_setting(&self) -> Option<u16> {
        self.read(Register::FilterReminderSetting)
    }

    /// Sets the filter reminder threshold, `0 - 6000` hours.
    pub fn set_filter_reminder_setting<H>(&self, hours: H) -> Result<bool, proto::Error>
    where
        H: TryInto<FilterReminderHours>,
        proto::Error: From<H::Error>,
    {
        let hours = hours.try_into()?;
        Ok(self.write_through(Register::FilterReminderSetting, hours.encode()))
    }

    pub fn filter_reminder(&self) -> Option<bool> {
        self.read(Register::FilterReminder).map(proto::decode_flag)
    }

    /// Resets the filter usage counter.
    ///
    /// On acknowledgement the cached counter is set to zero and the whole block
    /// is re-read regardless of its age, so observers see the state the device
    /// actually reports. Returns whether the device acknowledged the reset.
    pub fn reset_filter_usage_time(&self) -> bool {
        debug!("Resetting filter usage time");
        let acknowledged = {
            let mut transport = crate::lock(&self.transport);
            let acknowledged = transport
                .write_single_register(Register::FilterUsageTime.address(), FILTER_RESET_COMMAND);
            if acknowledged {
                self.cache.patch_raw(Register::FilterUsageTime.address(), 0);
            }
            acknowledged
        };
        if acknowledged {
            self.cache.refresh(true);
        } else {
            warn!("Filter reset was not acknowledged");
        }
        acknowledged
    }

    /// Fan level in percent: `0` while off, else the supply speed's percentage.
    pub fn fan_percentage(&self) -> Option<u8> {
        if !self.power()? {
            return Some(0);
        }
        Some(self.supply_speed().map_or(0, |speed| speed.percentage()))
    }

    /// Sets both fans to the tier matching `percentage`; `0` switches the unit off.
    pub fn set_fan_percentage(&self, percentage: u8) -> Result<bool, proto::Error> {
        match Speed::from_percentage(percentage)? {
            None => Ok(self.set_power(false)),
            Some(speed) => Ok(self.turn_on(Some(speed))),
        }
    }

    /// Switches the unit on, optionally setting both fans to `speed`.
    pub fn turn_on(&self, speed: Option<Speed>) -> bool {
        let mut acknowledged = self.set_power(true);
        if let Some(speed) = speed {
            acknowledged &= self.write_through(Register::SupplySpeed, speed.encode());
            acknowledged &= self.write_through(Register::ExhaustSpeed, speed.encode());
        }
        acknowledged
    }

    pub fn turn_off(&self) -> bool {
        self.set_power(false)
    }

    /// Mode and bypass combined.
    pub fn operating_preset(&self) -> Option<OperatingPreset> {
        Some(OperatingPreset::new(self.mode()?, self.bypass()?))
    }

    /// Writes mode, then bypass. The two writes are independent; a reader
    /// may observe one applied and the other not yet.
    pub fn set_operating_preset(&self, preset: OperatingPreset) -> bool {
        let mode = self.set_mode(preset.mode);
        let bypass = self.set_bypass(preset.bypass);
        mode && bypass
    }
}

impl<T> fmt::Debug for DeviceController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceController")
            .field("endpoint", &self.endpoint)
            .field("cache", &self.cache)
            .finish()
    }
}
