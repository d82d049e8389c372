//! Time-bounded cache of the device's register block.
//!
//! Every field of the device lives in one contiguous block of holding
//! registers, so a single bulk read serves all getters until the block is
//! older than the time-to-live. Concurrent refreshes are coalesced by an
//! in-flight flag: a caller that finds a read already running does not issue
//! a second one and reports success against whatever the cache holds.

use crate::notifier::ChangeNotifier;
use crate::protocol::RegisterMap;
use crate::transport::Transport;
use log::*;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A captured register block covering `[start, start + len)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterBlock {
    start: u16,
    values: Vec<u16>,
    captured_at: Instant,
}

impl RegisterBlock {
    pub fn new(start: u16, values: Vec<u16>) -> Self {
        Self {
            start,
            values,
            captured_at: Instant::now(),
        }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn values(&self) -> &[u16] {
        &self.values
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    fn index(&self, address: u16) -> usize {
        let index = address.checked_sub(self.start).map(usize::from);
        match index {
            Some(index) if index < self.values.len() => index,
            _ => panic!(
                "register address {address} is outside the cached block {}..{}",
                self.start,
                usize::from(self.start) + self.values.len()
            ),
        }
    }

    /// Value of `address`.
    ///
    /// # Panics
    ///
    /// If `address` lies outside the block. Callers index with addresses of the
    /// declared register map, so this is a map/implementation bug.
    pub fn get(&self, address: u16) -> u16 {
        self.values[self.index(address)]
    }

    /// Overwrites the value of `address`.
    ///
    /// # Panics
    ///
    /// If `address` lies outside the block.
    pub fn set(&mut self, address: u16, value: u16) {
        let index = self.index(address);
        self.values[index] = value;
    }
}

#[derive(Debug, Default)]
struct CacheState {
    block: Option<RegisterBlock>,
    refreshing: bool,
}

impl CacheState {
    fn is_valid(&self, ttl: Duration) -> bool {
        self.block.as_ref().is_some_and(|block| block.age() < ttl)
    }
}

/// Clears the in-flight flag when the refresh ends, even by unwinding.
struct InFlight<'a>(&'a Mutex<CacheState>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        crate::lock(self.0).refreshing = false;
    }
}

/// Cached register block of one device, refreshed through its transport.
///
/// Block, capture time and in-flight flag form one critical section. The
/// transport read itself happens outside of it, so `get_raw` never waits on
/// the field bus and always sees either the old or the new block.
///
/// A refresh holds the transport from the read until the new block is
/// stored. Writers that patch the block while holding the transport are
/// therefore ordered strictly before or after the read, and an acknowledged
/// value is never overwritten by an older read. Lock order is transport, then
/// cache state.
pub struct StateCache<T> {
    transport: Arc<Mutex<T>>,
    map: RegisterMap,
    ttl: Duration,
    state: Mutex<CacheState>,
    notifier: ChangeNotifier,
}

impl<T: Transport> StateCache<T> {
    /// Creates an empty cache. The first access reads from the device.
    pub fn new(transport: Arc<Mutex<T>>, map: RegisterMap, ttl: Duration) -> Self {
        Self {
            transport,
            map,
            ttl,
            state: Mutex::new(CacheState::default()),
            notifier: ChangeNotifier::new(),
        }
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Observers notified after every refresh that actually read the device.
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// `true` if a block is held and younger than the time-to-live.
    pub fn is_valid(&self) -> bool {
        crate::lock(&self.state).is_valid(self.ttl)
    }

    /// Ensures the cache holds a recent block.
    ///
    /// Returns immediately if the cache is valid and `force` is not set, or if
    /// another refresh is in flight. Otherwise reads the whole block; on
    /// success the block is replaced and observers are notified, on failure the
    /// cache is cleared and `false` is returned.
    pub fn refresh(&self, force: bool) -> bool {
        {
            let mut state = crate::lock(&self.state);
            if !force && state.is_valid(self.ttl) {
                trace!("Register cache hit");
                return true;
            }
            if state.refreshing {
                warn!("Already reading registers, skipping duplicate read");
                return true;
            }
            state.refreshing = true;
        }

        let refreshed = {
            let _in_flight = InFlight(&self.state);
            let (start, count) = (self.map.start(), self.map.count());
            debug!(
                "Reading all registers from {start} to {}",
                u32::from(start) + u32::from(count) - 1
            );
            let mut transport = crate::lock(&self.transport);
            let response = transport.read_holding_registers(start, count);

            let mut state = crate::lock(&self.state);
            match response {
                Some(values) if values.len() == usize::from(count) => {
                    debug!("Registers read: {values:?}");
                    state.block = Some(RegisterBlock::new(start, values));
                    true
                }
                Some(values) => {
                    error!(
                        "Expected {count} registers but the device returned {}",
                        values.len()
                    );
                    state.block = None;
                    false
                }
                None => {
                    state.block = None;
                    false
                }
            }
        };

        if refreshed {
            self.notifier.notify();
        }
        refreshed
    }

    /// Raw value of `address`, refreshing the cache first if it is stale.
    ///
    /// Returns `None` if no block could be obtained or `address` is not part
    /// of the register map.
    pub fn get_raw(&self, address: u16) -> Option<u16> {
        self.refresh(false);
        if !self.map.contains(address) {
            error!("Register address {address} is not part of the register map");
            return None;
        }
        let state = crate::lock(&self.state);
        match &state.block {
            Some(block) => Some(block.get(address)),
            None => {
                warn!("Cannot get register {address}: register cache is empty after refresh");
                None
            }
        }
    }

    /// Updates the cached value of `address` after a successful write.
    /// Does nothing while no block is held.
    ///
    /// Call this while still holding the transport the write went through,
    /// so a concurrent refresh cannot replace the block with an older read.
    pub fn patch_raw(&self, address: u16, value: u16) {
        let mut state = crate::lock(&self.state);
        if let Some(block) = state.block.as_mut() {
            block.set(address, value);
            debug!("Updated cache for register {address}: {value}");
        }
    }

    /// A copy of the current block, refreshing the cache first if it is stale.
    pub fn snapshot(&self) -> Option<RegisterBlock> {
        self.refresh(false);
        crate::lock(&self.state).block.clone()
    }

    /// Drops the cached block so the next access reads from the device.
    pub fn invalidate(&self) {
        crate::lock(&self.state).block = None;
    }
}

impl<T> std::fmt::Debug for StateCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("map", &self.map)
            .field("ttl", &self.ttl)
            .field("state", &self.state)
            .field("notifier", &self.notifier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::ObserverError;
    use crate::protocol::{Register, REGISTER_MAP};
    use crate::testing::{MockDevice, MockTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache(device: &MockDevice, ttl: Duration) -> Arc<StateCache<MockTransport>> {
        Arc::new(StateCache::new(
            Arc::new(Mutex::new(device.transport())),
            REGISTER_MAP,
            ttl,
        ))
    }

    #[test]
    fn refresh_within_ttl_reads_once() {
        let device = MockDevice::new();
        let cache = cache(&device, Duration::from_secs(30));
        assert!(!cache.is_valid());

        assert!(cache.refresh(false));
        assert!(cache.refresh(false));
        assert_eq!(device.reads(), 1);
        assert!(cache.is_valid());
    }

    #[test]
    fn refresh_after_ttl_reads_again() {
        let device = MockDevice::new();
        let cache = cache(&device, Duration::from_millis(20));

        assert!(cache.refresh(false));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!cache.is_valid());
        assert!(cache.refresh(false));
        assert_eq!(device.reads(), 2);
    }

    #[test]
    fn forced_refresh_ignores_ttl() {
        let device = MockDevice::new();
        let cache = cache(&device, Duration::from_secs(30));

        assert!(cache.refresh(false));
        assert!(cache.refresh(true));
        assert_eq!(device.reads(), 2);
    }

    #[test]
    fn failed_refresh_clears_cache() {
        let device = MockDevice::new();
        let cache = cache(&device, Duration::ZERO);
        device.set(Register::Power, 1);
        assert_eq!(cache.get_raw(0), Some(1));

        device.set_online(false);
        assert!(!cache.refresh(false));
        assert!(cache.snapshot().is_none());
        assert_eq!(cache.get_raw(0), None);

        device.set_online(true);
        assert_eq!(cache.get_raw(0), Some(1));
    }

    #[test]
    fn short_response_is_a_failure() {
        let device = MockDevice::new();
        device.set_response_len(Some(5));
        let cache = cache(&device, Duration::from_secs(30));
        assert!(!cache.refresh(false));
        assert_eq!(cache.get_raw(Register::Humidity.address()), None);
    }

    #[test]
    fn patch_then_get_is_consistent() {
        let device = MockDevice::new();
        let cache = cache(&device, Duration::from_secs(30));
        assert!(cache.refresh(false));

        for register in Register::ALL {
            let value = register.address() * 100 + 7;
            cache.patch_raw(register.address(), value);
            assert_eq!(cache.get_raw(register.address()), Some(value));
        }
        assert_eq!(device.reads(), 1);
    }

    #[test]
    fn patch_without_block_is_a_noop() {
        let device = MockDevice::new();
        let cache = cache(&device, Duration::from_secs(30));
        cache.patch_raw(Register::Power.address(), 1);
        assert!(!cache.is_valid());
        assert_eq!(device.reads(), 0);
    }

    #[test]
    #[should_panic(expected = "outside the cached block")]
    fn patch_outside_map_fails_loudly() {
        let device = MockDevice::new();
        let cache = cache(&device, Duration::from_secs(30));
        assert!(cache.refresh(false));
        cache.patch_raw(40, 1);
    }

    #[test]
    fn get_outside_map_is_unavailable() {
        let device = MockDevice::new();
        let cache = cache(&device, Duration::from_secs(30));
        assert_eq!(cache.get_raw(18), None);
    }

    #[test]
    fn invalidate_forces_reread() {
        let device = MockDevice::new();
        let cache = cache(&device, Duration::from_secs(30));
        assert!(cache.refresh(false));

        cache.invalidate();
        assert!(!cache.is_valid());
        assert!(cache.snapshot().is_some());
        assert_eq!(device.reads(), 2);
    }

    #[test]
    fn patch_under_transport_waits_for_running_refresh() {
        let device = MockDevice::new();
        let transport = Arc::new(Mutex::new(device.transport()));
        let cache = Arc::new(StateCache::new(
            transport.clone(),
            REGISTER_MAP,
            Duration::from_secs(30),
        ));
        assert!(cache.refresh(false));
        device.set_read_delay(Duration::from_millis(50));

        let refresh = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.refresh(true))
        };
        while device.reads_started() == 1 {
            std::thread::sleep(Duration::from_millis(1));
        }
        {
            let mut transport = crate::lock(&transport);
            assert!(transport.write_single_register(Register::Mode.address(), 2));
            cache.patch_raw(Register::Mode.address(), 2);
        }
        assert!(refresh.join().unwrap());
        assert_eq!(cache.get_raw(Register::Mode.address()), Some(2));
        assert_eq!(device.reads(), 2);
    }

    #[test]
    fn observers_are_notified_only_on_real_reads() {
        let device = MockDevice::new();
        let cache = cache(&device, Duration::from_secs(30));
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        cache
            .notifier()
            .register(Arc::new(move || -> Result<(), ObserverError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));

        cache.refresh(false);
        cache.refresh(false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        cache.refresh(true);
        assert_eq!(notified.load(Ordering::SeqCst), 2);

        device.set_online(false);
        cache.refresh(true);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn observers_may_read_the_cache() {
        let device = MockDevice::new();
        device.set(Register::Temperature, 215);
        let cache = cache(&device, Duration::from_secs(30));
        let seen = Arc::new(Mutex::new(None));
        let (weak, sink) = (Arc::downgrade(&cache), seen.clone());
        cache
            .notifier()
            .register(Arc::new(move || -> Result<(), ObserverError> {
                let cache = weak.upgrade().ok_or("cache dropped")?;
                *sink.lock().unwrap() = cache.get_raw(Register::Temperature.address());
                Ok(())
            }));

        assert!(cache.refresh(false));
        assert_eq!(*seen.lock().unwrap(), Some(215));
        assert_eq!(device.reads(), 1);
    }

    #[test]
    fn concurrent_refreshes_are_coalesced() {
        let device = MockDevice::new();
        device.set_read_delay(Duration::from_millis(200));
        let cache = cache(&device, Duration::from_secs(30));

        let first = {
            let cache = cache.clone();
            std::thread::spawn(move || cache.refresh(false))
        };
        while device.reads_started() == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        // The second caller neither blocks on the read nor issues its own.
        assert!(cache.refresh(false));
        assert!(!cache.is_valid());

        assert!(first.join().unwrap());
        assert_eq!(device.reads(), 1);
        assert!(cache.is_valid());
    }
}
