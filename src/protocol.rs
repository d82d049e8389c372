//! Register layout and field codecs of the Madelon fresh air ventilation unit.
//!
//! The device exposes all of its state as holding registers in the address
//! range `0..=17`. This module describes that layout ([`Register`],
//! [`RegisterMap`]) and converts between raw 16-bit register values and the
//! typed values used by [`crate::controller::DeviceController`].
//!
//! Decoding is total: every raw `u16` maps to *some* value (or to "unknown"
//! for the speed tiers), so a single odd register never fails a whole block
//! read. Encoding validates its input and returns an [`Error`] before anything
//! is written to the device.

use std::fmt;
use std::str::FromStr;

/// Manufacturer reported for every device handled by this crate.
pub const DEVICE_MANUFACTURER: &str = "Madelon";
/// Model reported for every device handled by this crate.
pub const DEVICE_MODEL: &str = "Jinmaofu";

/// The default Modbus-TCP port of the RS485-to-TCP gateway shipped with the unit.
pub const DEFAULT_PORT: u16 = 8899;
/// The default Modbus unit identifier (slave id).
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Errors raised while validating values before they are encoded for a write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A numeric speed tier outside `1..=3`.
    #[error("Speed {0} is out of range, must be 1 (low), 2 (medium) or 3 (high)")]
    SpeedOutOfRange(i64),
    /// A speed name that is neither `low`, `medium` nor `high`.
    #[error("Unknown speed '{0}', must be 'low', 'medium' or 'high'")]
    UnknownSpeed(String),
    /// A fan percentage above 100.
    #[error("Fan percentage {0} is out of range, must be 0 - 100")]
    PercentageOutOfRange(u16),
    /// A filter reminder threshold outside `0..=6000` hours.
    #[error(
        "Filter reminder setting of {0} hours is out of range, must be {min} - {max} hours",
        min = FilterReminderHours::MIN,
        max = FilterReminderHours::MAX
    )]
    FilterReminderOutOfRange(i64),
    /// An operating preset name that is not one of the six known presets.
    #[error("Unknown operating preset '{0}'")]
    UnknownPreset(String),
    /// A field name that is not part of the register map.
    #[error("Unknown register '{0}'")]
    UnknownRegister(String),
}

impl From<std::convert::Infallible> for Error {
    fn from(value: std::convert::Infallible) -> Self {
        match value {}
    }
}

/// A semantic field of the device and its holding register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Power on/off, `0` or `1`.
    Power,
    /// Filter usage in hours. Writing `1` resets the counter.
    FilterUsageTime,
    /// Filter reminder threshold in hours, `0 - 6000`.
    FilterReminderSetting,
    /// Filter reminder flag (read only), `0` or `1`.
    FilterReminder,
    /// Operating mode, see [`Mode`].
    Mode,
    /// Supply fan speed setting, see [`Speed`].
    SupplySpeed,
    /// Exhaust fan speed setting, see [`Speed`].
    ExhaustSpeed,
    /// Bypass damper, `0` or `1`.
    Bypass,
    /// Actual supply fan speed (read only).
    ActualSupply,
    /// Actual exhaust fan speed (read only).
    ActualExhaust,
    /// Temperature in tenths of °C (read only).
    Temperature,
    /// Relative humidity in tenths of % (read only).
    Humidity,
}

impl Register {
    /// Every register of the map, in address order.
    pub const ALL: [Register; 12] = [
        Register::Power,
        Register::FilterUsageTime,
        Register::FilterReminderSetting,
        Register::FilterReminder,
        Register::Mode,
        Register::SupplySpeed,
        Register::ExhaustSpeed,
        Register::Bypass,
        Register::ActualSupply,
        Register::ActualExhaust,
        Register::Temperature,
        Register::Humidity,
    ];

    /// The holding register address of this field.
    pub const fn address(&self) -> u16 {
        match self {
            Register::Power => 0,
            Register::FilterUsageTime => 1,
            Register::FilterReminderSetting => 2,
            Register::FilterReminder => 3,
            Register::Mode => 4,
            Register::SupplySpeed => 7,
            Register::ExhaustSpeed => 8,
            Register::Bypass => 9,
            Register::ActualSupply => 12,
            Register::ActualExhaust => 13,
            Register::Temperature => 16,
            Register::Humidity => 17,
        }
    }

    /// The field name, as used in configuration and on the command line.
    pub const fn name(&self) -> &'static str {
        match self {
            Register::Power => "power",
            Register::FilterUsageTime => "filter_usage_time",
            Register::FilterReminderSetting => "filter_reminder_setting",
            Register::FilterReminder => "filter_reminder",
            Register::Mode => "mode",
            Register::SupplySpeed => "supply_speed",
            Register::ExhaustSpeed => "exhaust_speed",
            Register::Bypass => "bypass",
            Register::ActualSupply => "actual_supply",
            Register::ActualExhaust => "actual_exhaust",
            Register::Temperature => "temperature",
            Register::Humidity => "humidity",
        }
    }

    /// Whether the device accepts writes to this register.
    pub const fn is_writable(&self) -> bool {
        !matches!(
            self,
            Register::FilterReminder
                | Register::ActualSupply
                | Register::ActualExhaust
                | Register::Temperature
                | Register::Humidity
        )
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Register {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase().replace('-', "_");
        Register::ALL
            .into_iter()
            .find(|register| register.name() == name)
            .ok_or_else(|| Error::UnknownRegister(s.to_string()))
    }
}

/// The contiguous block of holding registers covering every [`Register`].
///
/// The block spans `[start, start + count)`. Addresses in between that are not
/// named by any register (5, 6, 10, 11, 14, 15) are read along with the rest
/// but never decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    start: u16,
    count: u16,
}

/// The register map of the device: addresses `0..=17`, 18 registers.
pub const REGISTER_MAP: RegisterMap = RegisterMap::from_registers(&Register::ALL);

impl RegisterMap {
    /// Derives the block bounds from a non-empty set of registers.
    pub const fn from_registers(registers: &[Register]) -> Self {
        assert!(!registers.is_empty(), "register map must not be empty");
        let mut min = u16::MAX;
        let mut max = 0;
        let mut i = 0;
        while i < registers.len() {
            let address = registers[i].address();
            if address < min {
                min = address;
            }
            if address > max {
                max = address;
            }
            i += 1;
        }
        Self {
            start: min,
            count: max - min + 1,
        }
    }

    /// First address of the block.
    pub const fn start(&self) -> u16 {
        self.start
    }

    /// Number of registers in the block.
    pub const fn count(&self) -> u16 {
        self.count
    }

    /// Returns `true` if `address` lies inside the block.
    pub const fn contains(&self, address: u16) -> bool {
        address >= self.start && address - self.start < self.count
    }

    /// Position of `address` inside a block read, if it lies inside the block.
    pub const fn index_of(&self, address: u16) -> Option<usize> {
        if self.contains(address) {
            Some((address - self.start) as usize)
        } else {
            None
        }
    }
}

/// Decodes a `0`/`1` flag register. Any non-zero value reads as `true`.
pub fn decode_flag(value: u16) -> bool {
    value != 0
}

/// Encodes a flag for a register write.
pub fn encode_flag(value: bool) -> u16 {
    u16::from(value)
}

/// Decodes a register holding tenths of a unit (temperature in °C, humidity in %).
pub fn decode_tenths(value: u16) -> f32 {
    value as f32 / 10.0
}

/// The value written to [`Register::FilterUsageTime`] to reset the filter counter.
pub const FILTER_RESET_COMMAND: u16 = 1;

/// Operating mode of the unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u16)]
pub enum Mode {
    #[default]
    Manual = 0,
    Auto = 1,
    Timer = 2,
}

impl Mode {
    /// Highest raw value the firmware documents for the mode register.
    pub const RAW_MAX: u16 = 5;

    /// Decodes the mode register.
    ///
    /// Values the firmware documents but this crate does not model (`3 - 5`)
    /// and values outside the documented range decode to [`Mode::Manual`].
    pub fn decode(value: u16) -> Self {
        match value {
            0 => Mode::Manual,
            1 => Mode::Auto,
            2 => Mode::Timer,
            value => {
                if value > Self::RAW_MAX {
                    log::warn!("Invalid mode value {value}, defaulting to {}", Mode::Manual);
                }
                Mode::Manual
            }
        }
    }

    pub fn encode(&self) -> u16 {
        *self as u16
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Mode::Manual => "manual",
            Mode::Auto => "auto",
            Mode::Timer => "timer",
        }
    }

    /// Parses a mode name case-insensitively.
    ///
    /// Unlike speeds and filter thresholds, unrecognized names are not
    /// rejected: they fall back to [`Mode::Manual`].
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Mode::Auto,
            "timer" => Mode::Timer,
            "manual" => Mode::Manual,
            other => {
                log::debug!("Unrecognized mode '{other}', using {}", Mode::Manual);
                Mode::Manual
            }
        }
    }
}

impl From<&str> for Mode {
    fn from(value: &str) -> Self {
        Self::from_str_lossy(value)
    }
}

impl From<String> for Mode {
    fn from(value: String) -> Self {
        Self::from_str_lossy(&value)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fan speed tier of the supply or exhaust fan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[repr(u16)]
pub enum Speed {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl Speed {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 3;

    /// Decodes a speed register. Values outside `1..=3` (e.g. `0` while the
    /// unit is off) are unknown.
    pub fn decode(value: u16) -> Option<Self> {
        match value {
            1 => Some(Speed::Low),
            2 => Some(Speed::Medium),
            3 => Some(Speed::High),
            _ => None,
        }
    }

    pub fn encode(&self) -> u16 {
        *self as u16
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Speed::Low => "low",
            Speed::Medium => "medium",
            Speed::High => "high",
        }
    }

    /// The fan percentage representing this tier: 33, 66 or 100.
    pub const fn percentage(&self) -> u8 {
        match self {
            Speed::Low => 33,
            Speed::Medium => 66,
            Speed::High => 100,
        }
    }

    /// Maps a fan percentage onto a tier. `0` means off and yields `None`.
    pub fn from_percentage(percentage: u8) -> Result<Option<Self>, Error> {
        match percentage {
            0 => Ok(None),
            1..=33 => Ok(Some(Speed::Low)),
            34..=66 => Ok(Some(Speed::Medium)),
            67..=100 => Ok(Some(Speed::High)),
            _ => Err(Error::PercentageOutOfRange(percentage.into())),
        }
    }
}

impl TryFrom<i64> for Speed {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u16::try_from(value)
            .ok()
            .and_then(Speed::decode)
            .ok_or(Error::SpeedOutOfRange(value))
    }
}

impl TryFrom<i32> for Speed {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Speed::try_from(i64::from(value))
    }
}

impl TryFrom<u16> for Speed {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Speed::try_from(i64::from(value))
    }
}

impl TryFrom<u8> for Speed {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Speed::try_from(i64::from(value))
    }
}

impl FromStr for Speed {
    type Err = Error;

    /// Accepts `low`, `medium`, `high` in any case, or a tier number `1 - 3`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Speed::Low),
            "medium" => Ok(Speed::Medium),
            "high" => Ok(Speed::High),
            other => match other.parse::<i64>() {
                Ok(number) => Speed::try_from(number),
                Err(_) => Err(Error::UnknownSpeed(s.to_string())),
            },
        }
    }
}

impl TryFrom<&str> for Speed {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl TryFrom<String> for Speed {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated filter reminder threshold in hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterReminderHours(u16);

impl FilterReminderHours {
    pub const MIN: u16 = 0;
    pub const MAX: u16 = 6000;

    pub fn hours(&self) -> u16 {
        self.0
    }

    pub fn encode(&self) -> u16 {
        self.0
    }
}

impl std::ops::Deref for FilterReminderHours {
    type Target = u16;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<i64> for FilterReminderHours {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match u16::try_from(value) {
            Ok(hours) if (Self::MIN..=Self::MAX).contains(&hours) => Ok(Self(hours)),
            _ => Err(Error::FilterReminderOutOfRange(value)),
        }
    }
}

impl TryFrom<i32> for FilterReminderHours {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::try_from(i64::from(value))
    }
}

impl TryFrom<u32> for FilterReminderHours {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::try_from(i64::from(value))
    }
}

impl TryFrom<u16> for FilterReminderHours {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::try_from(i64::from(value))
    }
}

impl fmt::Display for FilterReminderHours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h", self.0)
    }
}

/// Mode and bypass state combined into one of six presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperatingPreset {
    pub mode: Mode,
    pub bypass: bool,
}

impl OperatingPreset {
    /// Every preset, in the order they are offered to users.
    pub const ALL: [OperatingPreset; 6] = [
        OperatingPreset::new(Mode::Manual, false),
        OperatingPreset::new(Mode::Auto, false),
        OperatingPreset::new(Mode::Timer, false),
        OperatingPreset::new(Mode::Manual, true),
        OperatingPreset::new(Mode::Auto, true),
        OperatingPreset::new(Mode::Timer, true),
    ];

    pub const fn new(mode: Mode, bypass: bool) -> Self {
        Self { mode, bypass }
    }
}

impl fmt::Display for OperatingPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bypass {
            write!(f, "{}_bypass", self.mode)
        } else {
            write!(f, "{}", self.mode)
        }
    }
}

impl FromStr for OperatingPreset {
    type Err = Error;

    /// Parses `manual`, `auto`, `timer` optionally suffixed with `_bypass`.
    /// Unlike [`Mode::from_str_lossy`] this is strict.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        OperatingPreset::ALL
            .into_iter()
            .find(|preset| preset.to_string() == name)
            .ok_or_else(|| Error::UnknownPreset(s.to_string()))
    }
}
