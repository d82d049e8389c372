use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use madelon_vent_lib::config::DeviceConfig;
use madelon_vent_lib::protocol::{self as proto, DEFAULT_PORT, DEFAULT_UNIT_ID};
use std::path::PathBuf;
use std::time::Duration;

fn parse_unit_id(s: &str) -> Result<u8, String> {
    clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid unit id format: {e}"))
}

fn parse_register(s: &str) -> Result<proto::Register, String> {
    s.parse::<proto::Register>().map_err(|e| e.to_string())
}

fn parse_speed(s: &str) -> Result<proto::Speed, String> {
    s.parse::<proto::Speed>().map_err(|e| e.to_string())
}

fn parse_filter_reminder(s: &str) -> Result<proto::FilterReminderHours, String> {
    let hours = s
        .parse::<i64>()
        .map_err(|e| format!("Invalid hours format: {e}"))?;
    proto::FilterReminderHours::try_from(hours).map_err(|e| e.to_string())
}

fn parse_percentage(s: &str) -> Result<u8, String> {
    let percentage = clap_num::number_range(s, 0, 100)?;
    Ok(percentage)
}

fn parse_preset(s: &str) -> Result<proto::OperatingPreset, String> {
    s.parse::<proto::OperatingPreset>()
        .map_err(|e| e.to_string())
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn is_on(&self) -> bool {
        *self == Switch::On
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: refresh the device state at a fixed interval
    /// and print every freshly read state to the console.
    #[clap(verbatim_doc_comment)]
    Daemon {
        /// Interval for refreshing the device state (e.g., "10s", "1m").
        /// Defaults to the configured poll interval.
        #[arg(value_parser = humantime::parse_duration, short, long, verbatim_doc_comment)]
        poll_interval: Option<Duration>,
    },

    /// Read and display a single field, e.g. "temperature" or "supply-speed".
    Read {
        #[arg(value_parser = parse_register)]
        register: proto::Register,
    },

    /// Read and display all device values.
    ReadAll,

    /// Switch the unit on or off.
    SetPower {
        #[arg(value_enum)]
        state: Switch,
    },

    /// Set the operating mode: "manual", "auto" or "timer".
    /// Unknown names fall back to manual.
    #[clap(verbatim_doc_comment)]
    SetMode { mode: String },

    /// Set the fan speed: "low", "medium", "high" or 1 to 3.
    /// Without --supply or --exhaust both fans are set.
    #[clap(verbatim_doc_comment)]
    SetSpeed {
        #[arg(value_parser = parse_speed)]
        speed: proto::Speed,
        /// Set only the supply fan.
        #[arg(long, conflicts_with = "exhaust")]
        supply: bool,
        /// Set only the exhaust fan.
        #[arg(long)]
        exhaust: bool,
    },

    /// Open or close the bypass damper.
    SetBypass {
        #[arg(value_enum)]
        state: Switch,
    },

    /// Set the filter reminder threshold in hours (0 to 6000).
    SetFilterReminder {
        #[arg(value_parser = parse_filter_reminder)]
        hours: proto::FilterReminderHours,
    },

    /// Reset the filter usage counter after a filter change.
    ResetFilter {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Set the fan level in percent. 0 switches the unit off,
    /// any other value selects the matching speed for both fans.
    #[clap(verbatim_doc_comment)]
    SetPercentage {
        #[arg(value_parser = parse_percentage)]
        percentage: u8,
    },

    /// Set mode and bypass together, e.g. "auto" or "timer_bypass".
    SetPreset {
        #[arg(value_parser = parse_preset)]
        preset: proto::OperatingPreset,
    },

    /// Run a simulated unit as Modbus-TCP server.
    /// The connection options are ignored.
    #[clap(verbatim_doc_comment)]
    Simulate {
        /// Address to listen on.
        #[arg(short, long, default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
        listen: String,

        /// Minimum delay between two applied writes; faster writes are dropped.
        #[arg(long, default_value = "200ms", value_parser = humantime::parse_duration)]
        write_spacing: Duration,
    },
}

const fn about_text() -> &'static str {
    "Madelon ventilation CLI - Control Madelon fresh air ventilation units via Modbus-TCP."
}

#[derive(Parser, Debug)]
#[command(name="ventctl", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warn.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// YAML configuration file of the device.
    /// Overrides --host, --port and --unit-id.
    #[arg(global = true, short, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    /// Hostname or IP address of the Modbus-TCP gateway.
    #[arg(global = true, long)]
    pub host: Option<String>,

    /// TCP port of the Modbus-TCP gateway.
    #[arg(global = true, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Modbus unit id of the device.
    /// Can be specified in decimal or hexadecimal (e.g., "0x01").
    #[arg(global = true, long, default_value_t = DEFAULT_UNIT_ID, value_parser = parse_unit_id, verbatim_doc_comment)]
    pub unit_id: u8,

    /// Modbus I/O timeout for read/write operations.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    #[command(subcommand)]
    pub command: CliCommands,
}

impl CliArgs {
    /// Builds the device configuration from --config or the connection options.
    pub fn device_config(&self) -> Result<DeviceConfig> {
        let mut config = match (&self.config, &self.host) {
            (Some(path), _) => DeviceConfig::from_yaml_file(path)
                .with_context(|| format!("Cannot load configuration from {path:?}"))?,
            (None, Some(host)) => {
                let mut config = DeviceConfig::new(host.clone());
                config.port = self.port;
                config.unit_id = self.unit_id;
                config
            }
            (None, None) => anyhow::bail!("Either --config or --host is required"),
        };
        if let Some(timeout) = self.timeout {
            config.connection.io_timeout = timeout;
        }
        config.validate().context("Invalid device configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("ventctl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn connection_from_options() {
        let args = parse(&["--host", "10.0.0.5", "--unit-id", "0x02", "read-all"]);
        let config = args.device_config().unwrap();
        assert_eq!(config.endpoint().to_string(), "10.0.0.5:8899:2");
        assert_eq!(args.command, CliCommands::ReadAll);
    }

    #[test]
    fn host_is_required() {
        assert!(parse(&["read-all"]).device_config().is_err());
    }

    #[test]
    fn set_speed_arguments() {
        let args = parse(&["--host", "h", "set-speed", "high", "--supply"]);
        assert_eq!(
            args.command,
            CliCommands::SetSpeed {
                speed: proto::Speed::High,
                supply: true,
                exhaust: false
            }
        );
        assert!(CliArgs::try_parse_from(["ventctl", "set-speed", "4"]).is_err());
        assert!(CliArgs::try_parse_from(["ventctl", "set-speed", "1", "--supply", "--exhaust"]).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(CliArgs::try_parse_from(["ventctl", "set-filter-reminder", "6001"]).is_err());
        assert!(CliArgs::try_parse_from(["ventctl", "set-percentage", "101"]).is_err());
        assert!(CliArgs::try_parse_from(["ventctl", "set-preset", "turbo"]).is_err());
        assert!(CliArgs::try_parse_from(["ventctl", "read", "nonsense"]).is_err());
    }

    #[test]
    fn read_accepts_dashed_names() {
        let args = parse(&["read", "supply-speed"]);
        assert_eq!(
            args.command,
            CliCommands::Read {
                register: proto::Register::SupplySpeed
            }
        );
    }
}
