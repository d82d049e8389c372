//! Fan-out of "state may have changed" signals after a block refresh.

use log::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Error type observers may return; it is logged and otherwise ignored.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

/// Something that re-reads and re-publishes its derived value when notified.
pub trait Observer: Send + Sync {
    fn state_changed(&self) -> Result<(), ObserverError>;
}

impl<F> Observer for F
where
    F: Fn() -> Result<(), ObserverError> + Send + Sync,
{
    fn state_changed(&self) -> Result<(), ObserverError> {
        self()
    }
}

/// Registration list of observers, notified in registration order.
///
/// A failing observer, whether it returns an error or panics, does not keep
/// the remaining observers from being notified.
#[derive(Default)]
pub struct ChangeNotifier {
    observers: Mutex<Vec<Arc<dyn Observer>>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn Observer>) {
        crate::lock(&self.observers).push(observer);
    }

    pub fn len(&self) -> usize {
        crate::lock(&self.observers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every observer and returns how many of them succeeded.
    ///
    /// The list is copied before the first call so observers may read device
    /// values or register further observers without deadlocking.
    pub fn notify(&self) -> usize {
        let observers = crate::lock(&self.observers).clone();
        let mut succeeded = 0;
        for (index, observer) in observers.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| observer.state_changed())) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(error)) => error!("Observer #{index} failed: {error}"),
                Err(_) => error!("Observer #{index} panicked"),
            }
        }
        trace!("Notified {succeeded}/{} observers", observers.len());
        succeeded
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("observers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Arc<dyn Observer> {
        let log = log.clone();
        Arc::new(move || -> Result<(), ObserverError> {
            log.lock().unwrap().push(name);
            Ok(())
        })
    }

    #[test]
    fn notifies_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let notifier = ChangeNotifier::new();
        assert!(notifier.is_empty());
        notifier.register(recorder(&log, "temperature"));
        notifier.register(recorder(&log, "humidity"));
        notifier.register(recorder(&log, "filter"));

        assert_eq!(notifier.notify(), 3);
        assert_eq!(*log.lock().unwrap(), ["temperature", "humidity", "filter"]);
    }

    #[test]
    fn failing_observers_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let notifier = ChangeNotifier::new();
        notifier.register(Arc::new(|| -> Result<(), ObserverError> {
            Err("sensor gone".into())
        }));
        notifier.register(Arc::new(|| -> Result<(), ObserverError> {
            panic!("observer bug")
        }));
        notifier.register(recorder(&log, "last"));

        assert_eq!(notifier.notify(), 1);
        assert_eq!(*log.lock().unwrap(), ["last"]);
        assert_eq!(notifier.len(), 3);
    }
}
