use madelon_vent_lib::config::{ConnectionConfig, DeviceConfig, Endpoint};
use madelon_vent_lib::controller::DeviceController;
use madelon_vent_lib::notifier::ObserverError;
use madelon_vent_lib::protocol::{Mode, Register, Speed};
use madelon_vent_lib::simulator::{self, SimulatedDevice, SimulatorHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_modbus::ExceptionCode;

fn fast_connection() -> ConnectionConfig {
    ConnectionConfig {
        retry_count: 2,
        retry_delay: Duration::from_millis(20),
        connection_timeout: Duration::from_secs(2),
        io_timeout: Duration::from_secs(2),
    }
}

fn controller_for(endpoint: Endpoint) -> DeviceController {
    let config = DeviceConfig {
        connection: fast_connection(),
        ..DeviceConfig::from(endpoint)
    };
    DeviceController::new(&config)
}

fn start(write_spacing: Duration) -> (SimulatorHandle, DeviceController) {
    let device = Arc::new(SimulatedDevice::with_write_spacing(write_spacing));
    let server = simulator::spawn("127.0.0.1:0", device).unwrap();
    let controller = controller_for(server.endpoint(1));
    (server, controller)
}

#[test]
fn reads_sensor_values() {
    let (server, controller) = start(Duration::ZERO);
    server.device().set_register(Register::Temperature, 215);
    server.device().set_register(Register::Humidity, 450);
    server.device().set_register(Register::Mode, 1);

    assert_eq!(controller.temperature(), Some(21.5));
    assert_eq!(controller.humidity(), Some(45.0));
    assert_eq!(controller.mode(), Some(Mode::Auto));
    assert_eq!(controller.power(), Some(false));
    assert!(controller.connection_state().is_connected());
    // All getters above were served by a single block read.
    assert_eq!(server.device().reads(), 1);
}

#[test]
fn writes_reach_the_device() {
    let (server, controller) = start(Duration::ZERO);

    assert!(controller.set_power(true));
    assert!(controller.set_supply_speed("high").unwrap());
    assert!(controller.set_exhaust_speed(1).unwrap());
    assert_eq!(controller.power(), Some(true));
    assert_eq!(controller.supply_speed(), Some(Speed::High));
    assert_eq!(server.device().register(Register::Power), 1);
    assert_eq!(server.device().register(Register::SupplySpeed), 3);

    assert!(controller.refresh(true));
    assert_eq!(controller.actual_supply_speed(), Some(3));
    assert_eq!(controller.actual_exhaust_speed(), Some(1));
}

#[test]
fn invalid_speed_is_not_written() {
    let (server, controller) = start(Duration::ZERO);
    assert!(controller.set_supply_speed(4).is_err());
    assert!(controller.set_supply_speed("turbo").is_err());
    assert_eq!(server.device().writes(), 0);
}

#[test]
fn filter_reset() {
    let (server, controller) = start(Duration::ZERO);
    server.device().set_register(Register::FilterUsageTime, 2900);
    server.device().set_register(Register::FilterReminder, 1);
    assert_eq!(controller.filter_usage_time(), Some(2900));
    assert_eq!(controller.filter_reminder(), Some(true));

    assert!(controller.reset_filter_usage_time());
    assert_eq!(controller.filter_usage_time(), Some(0));
    assert_eq!(controller.filter_reminder(), Some(false));
    assert_eq!(server.device().reads(), 2);
}

#[test]
fn fast_writes_are_dropped_by_the_device() {
    let (server, controller) = start(Duration::from_secs(60));
    // Writes only patch a block that is already cached.
    assert!(controller.refresh(false));
    assert!(controller.set_power(true));
    // Acknowledged, so the cache believes it, but the device dropped it.
    assert!(controller.set_mode("auto"));
    assert_eq!(controller.mode(), Some(Mode::Auto));
    assert_eq!(server.device().dropped_writes(), 1);

    assert!(controller.refresh(true));
    assert_eq!(controller.mode(), Some(Mode::Manual));
    assert_eq!(controller.power(), Some(true));
}

#[test]
fn exceptions_make_the_device_unavailable() {
    let (server, controller) = start(Duration::ZERO);
    server
        .device()
        .set_exception(Some(ExceptionCode::ServerDeviceFailure));

    assert!(!controller.refresh(true));
    assert_eq!(controller.temperature(), None);
    assert!(!controller.set_power(true));

    server.device().set_exception(None);
    assert!(controller.refresh(true));
    assert_eq!(controller.power(), Some(false));
}

#[test]
fn unreachable_device_is_unavailable() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let controller = controller_for(Endpoint::new("127.0.0.1", port, 1));

    assert_eq!(controller.temperature(), None);
    assert_eq!(controller.snapshot(), None);
    assert!(!controller.set_power(true));
    assert!(!controller.connection_state().is_connected());
}

#[test]
fn observers_see_every_device_read() {
    let (server, controller) = start(Duration::ZERO);
    server.device().set_register(Register::Temperature, 190);
    let controller = Arc::new(controller);
    let seen = Arc::new(AtomicUsize::new(0));
    let observer = {
        let controller = Arc::downgrade(&controller);
        let seen = seen.clone();
        Arc::new(move || -> Result<(), ObserverError> {
            let controller = controller.upgrade().ok_or("controller dropped")?;
            let temperature = controller.temperature().ok_or("no temperature")?;
            assert_eq!(temperature, 19.0);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };
    controller.register_observer(observer);

    assert!(controller.refresh(false));
    assert!(controller.refresh(false));
    assert!(controller.refresh(true));
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(server.device().reads(), 2);
}
