//! A library for controlling Madelon fresh air ventilation units via Modbus-TCP.
//!
//! The unit exposes 18 holding registers (power, mode, fan speeds, bypass,
//! temperature, humidity and the filter maintenance counters) through a
//! Modbus-TCP gateway. This crate is layered as follows:
//!
//! 1.  **[`transport`]**: connection management with bounded retries. Reads
//!     and writes never fail loudly, they report "unavailable".
//! 2.  **[`cache`]**: a time-bounded cache of the whole register block so a
//!     burst of getters costs a single bus round-trip.
//! 3.  **[`controller`]**: the typed device API, validation of user input and
//!     write-through of acknowledged writes into the cache.
//! 4.  **[`notifier`]**: observers informed after every block read.
//!
//! ## Features
//!
//! - **Strongly-Typed API**: `Mode`, `Speed`, `FilterReminderHours` and the
//!   register map live in [`protocol`].
//! - **Thread-Safe**: a [`controller::DeviceController`] can be cloned and
//!   shared between threads; clones share one connection and one cache.
//! - **Simulator**: with the `simulator` feature a Modbus-TCP server emulating
//!   the unit is available for integration tests and demos.
//!
//! ## Quick Start
//!
//! ```no_run
//! use madelon_vent_lib::{config::DeviceConfig, controller::DeviceController};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let controller = DeviceController::new(&DeviceConfig::new("192.168.6.137"));
//!
//!     match controller.snapshot() {
//!         Some(snapshot) => println!("{snapshot}"),
//!         None => println!("Device unavailable"),
//!     }
//!     controller.set_power(true);
//!     controller.set_exhaust_speed(2)?;
//!     Ok(())
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod cache;
pub mod config;
pub mod controller;
pub mod notifier;
pub mod protocol;
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(feature = "simulator")))]
#[cfg(feature = "simulator")]
pub mod simulator;

#[cfg(test)]
mod testing;

/// Locks `mutex`, recovering the data if a previous holder panicked.
///
/// All state guarded in this crate stays consistent across a panic in an
/// observer or caller, so poisoning carries no information.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
