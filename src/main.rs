//! Madelon ventilation CLI
//!
//! A command-line interface (CLI) application for controlling Madelon fresh
//! air ventilation units through a Modbus-TCP gateway.
//!
//! This tool allows users to:
//! - Read a single value or all values of the unit.
//! - Switch the unit, select mode, fan speeds, bypass and presets.
//! - Configure the filter reminder and reset the filter usage counter.
//! - Run in a continuous daemon mode printing every freshly read state.
//! - Run a simulated unit for testing without hardware.
//!
//! The CLI leverages the `madelon_vent_lib` crate for protocol definitions and device access.

use anyhow::{bail, Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use madelon_vent_lib::{
    controller::DeviceController,
    notifier::ObserverError,
    protocol::{self as proto, Register},
    simulator::{self, SimulatedDevice},
};
use std::sync::{mpsc, Arc};
use std::{panic, time::Duration};

mod commandline;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

/// Reads and formats a single field, `None` if the device is unavailable.
fn read_field(controller: &DeviceController, register: Register) -> Option<String> {
    let value = match register {
        Register::Power => on_off(controller.power()?).to_string(),
        Register::Mode => controller.mode()?.to_string(),
        Register::SupplySpeed => controller
            .supply_speed()
            .map_or_else(|| "unknown".to_string(), |speed| speed.to_string()),
        Register::ExhaustSpeed => controller
            .exhaust_speed()
            .map_or_else(|| "unknown".to_string(), |speed| speed.to_string()),
        Register::Bypass => on_off(controller.bypass()?).to_string(),
        Register::ActualSupply => controller.actual_supply_speed()?.to_string(),
        Register::ActualExhaust => controller.actual_exhaust_speed()?.to_string(),
        Register::Temperature => format!("{:.1} °C", controller.temperature()?),
        Register::Humidity => format!("{:.1} %", controller.humidity()?),
        Register::FilterUsageTime => format!("{} h", controller.filter_usage_time()?),
        Register::FilterReminderSetting => {
            format!("{} h", controller.filter_reminder_setting()?)
        }
        Register::FilterReminder => on_off(controller.filter_reminder()?).to_string(),
    };
    Some(value)
}

/// Turns a write acknowledgement into a result.
fn acknowledged(ack: bool, what: &str) -> Result<()> {
    if !ack {
        bail!("The device did not acknowledge {what}");
    }
    println!("{what} done.");
    Ok(())
}

fn handle_reset_filter(controller: &DeviceController, yes: bool) -> Result<()> {
    info!("Executing: Reset Filter Usage Time");
    if !yes
        && !Confirm::new()
            .with_prompt("Has the filter been replaced? Reset the filter usage counter?")
            .default(false)
            .show_default(true)
            .interact()
            .context("Failed to get user confirmation.")?
    {
        info!("Filter reset aborted by user.");
        return Ok(());
    }
    acknowledged(controller.reset_filter_usage_time(), "Filter reset")?;
    if let Some(hours) = controller.filter_usage_time() {
        println!("Filter usage time: {hours} h");
    }
    Ok(())
}

fn handle_daemon(controller: &DeviceController, poll_interval: Duration) -> Result<()> {
    info!("Starting daemon mode: interval={poll_interval:?}");
    let (changed_tx, changed_rx) = mpsc::channel();
    controller.register_observer(Arc::new(move || -> Result<(), ObserverError> {
        changed_tx.send(())?;
        Ok(())
    }));
    loop {
        if !controller.refresh(false) {
            warn!("Device {} is unavailable", controller.endpoint());
        }
        while changed_rx.try_recv().is_ok() {
            if let Some(snapshot) = controller.snapshot() {
                println!("{snapshot}\n");
            }
        }
        std::thread::sleep(poll_interval);
    }
}

fn handle_simulate(listen: &str, write_spacing: Duration) -> Result<()> {
    let device = Arc::new(SimulatedDevice::with_write_spacing(write_spacing));
    let server = simulator::spawn(listen, device)
        .with_context(|| format!("Cannot start simulator on {listen}"))?;
    println!("Simulator listening on {}", server.local_addr());
    server.join();
    Ok(())
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "ventctl started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. The simulator needs no device connection
    if let commandline::CliCommands::Simulate {
        listen,
        write_spacing,
    } = &args.command
    {
        return handle_simulate(listen, *write_spacing);
    }

    // 3. Setup the controller
    let config = args.device_config()?;
    let controller = DeviceController::new(&config);
    info!(
        "Controlling {} {} at {}",
        proto::DEVICE_MANUFACTURER,
        proto::DEVICE_MODEL,
        controller.endpoint()
    );

    // 4. Execute the command
    match &args.command {
        commandline::CliCommands::Daemon { poll_interval } => {
            handle_daemon(&controller, poll_interval.unwrap_or(config.poll_interval))?;
        }
        commandline::CliCommands::Read { register } => {
            info!("Executing: Read {register}");
            let value = read_field(&controller, *register)
                .with_context(|| format!("Cannot read {register}"))?;
            println!("{register}: {value}");
        }
        commandline::CliCommands::ReadAll => {
            info!("Executing: Read All Device Values");
            let snapshot = controller
                .snapshot()
                .with_context(|| format!("Cannot read device {}", controller.endpoint()))?;
            println!("{snapshot}");
        }
        commandline::CliCommands::SetPower { state } => {
            info!("Executing: Set Power {state:?}");
            acknowledged(controller.set_power(state.is_on()), "Set power")?;
        }
        commandline::CliCommands::SetMode { mode } => {
            let mode = proto::Mode::from_str_lossy(mode);
            info!("Executing: Set Mode to {mode}");
            acknowledged(controller.set_mode(mode), "Set mode")?;
        }
        commandline::CliCommands::SetSpeed {
            speed,
            supply,
            exhaust,
        } => {
            info!("Executing: Set Speed to {speed}");
            if !exhaust {
                acknowledged(controller.set_supply_speed(*speed)?, "Set supply speed")?;
            }
            if !supply {
                acknowledged(controller.set_exhaust_speed(*speed)?, "Set exhaust speed")?;
            }
        }
        commandline::CliCommands::SetBypass { state } => {
            info!("Executing: Set Bypass {state:?}");
            acknowledged(controller.set_bypass(state.is_on()), "Set bypass")?;
        }
        commandline::CliCommands::SetFilterReminder { hours } => {
            info!("Executing: Set Filter Reminder to {hours} h");
            acknowledged(
                controller.set_filter_reminder_setting(*hours)?,
                "Set filter reminder",
            )?;
        }
        commandline::CliCommands::ResetFilter { yes } => {
            handle_reset_filter(&controller, *yes)?;
        }
        commandline::CliCommands::SetPercentage { percentage } => {
            info!("Executing: Set Fan Percentage to {percentage} %");
            acknowledged(
                controller
                    .set_fan_percentage(*percentage)
                    .with_context(|| format!("Failed to set fan percentage to {percentage}"))?,
                "Set fan percentage",
            )?;
        }
        commandline::CliCommands::SetPreset { preset } => {
            info!("Executing: Set Preset {preset}");
            acknowledged(controller.set_operating_preset(*preset), "Set preset")?;
        }
        commandline::CliCommands::Simulate { .. } => {
            unreachable!("Simulate should be handled earlier.")
        }
    }

    controller.close();
    Ok(())
}
