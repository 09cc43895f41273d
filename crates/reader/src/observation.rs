//! Reader observation: observers, exception handler and notification executor

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tracing::{Level, debug, error, warn};

use crate::{ObservationError, ReaderError, ReaderEvent, lane::panic_message};

/// Receives reader events
pub trait ReaderObserver: Send + Sync {
    /// Handle one event
    fn on_reader_event(&self, event: &ReaderEvent);
}

impl<F> ReaderObserver for F
where
    F: Fn(&ReaderEvent) + Send + Sync,
{
    fn on_reader_event(&self, event: &ReaderEvent) {
        self(event)
    }
}

impl ReaderObserver for Sender<ReaderEvent> {
    fn on_reader_event(&self, event: &ReaderEvent) {
        // A dropped receiver only means nobody listens anymore
        let _ = self.send(event.clone());
    }
}

/// Receives faults raised while the reader is monitored in the background
pub trait ObservationExceptionHandler: Send + Sync {
    /// Handle one fault
    fn on_reader_observation_error(
        &self,
        plugin_name: &str,
        reader_name: &str,
        error: &ObservationError,
    );
}

impl<F> ObservationExceptionHandler for F
where
    F: Fn(&str, &str, &ObservationError) + Send + Sync,
{
    fn on_reader_observation_error(
        &self,
        plugin_name: &str,
        reader_name: &str,
        error: &ObservationError,
    ) {
        self(plugin_name, reader_name, error)
    }
}

/// Runs observer notifications
pub trait NotificationExecutor: Send + Sync + fmt::Debug {
    /// Run `task`, now or later
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Notifies observers on the thread raising the event
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl NotificationExecutor for InlineExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        task()
    }
}

/// Observers of one reader, with the handler their faults are reported to
pub(crate) struct ObservationManager {
    plugin_name: String,
    reader_name: String,
    observers: RwLock<Vec<Arc<dyn ReaderObserver>>>,
    handler: RwLock<Option<Arc<dyn ObservationExceptionHandler>>>,
    executor: RwLock<Arc<dyn NotificationExecutor>>,
}

impl fmt::Debug for ObservationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationManager")
            .field("reader_name", &self.reader_name)
            .field("observers", &self.observers.read().len())
            .field("has_handler", &self.handler.read().is_some())
            .field("executor", &self.executor.read())
            .finish()
    }
}

impl ObservationManager {
    pub(crate) fn new(plugin_name: &str, reader_name: &str) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            reader_name: reader_name.to_string(),
            observers: RwLock::new(Vec::new()),
            handler: RwLock::new(None),
            executor: RwLock::new(Arc::new(InlineExecutor)),
        }
    }

    pub(crate) fn add_observer(&self, observer: Arc<dyn ReaderObserver>) -> Result<(), ReaderError> {
        if self.handler.read().is_none() {
            return Err(ReaderError::NoExceptionHandler);
        }
        self.observers.write().push(observer);
        Ok(())
    }

    pub(crate) fn remove_observer(&self, observer: &Arc<dyn ReaderObserver>) {
        self.observers
            .write()
            .retain(|registered| !Arc::ptr_eq(registered, observer));
    }

    pub(crate) fn clear_observers(&self) {
        self.observers.write().clear();
    }

    pub(crate) fn count_observers(&self) -> usize {
        self.observers.read().len()
    }

    pub(crate) fn set_exception_handler(&self, handler: Arc<dyn ObservationExceptionHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub(crate) fn set_executor(&self, executor: Arc<dyn NotificationExecutor>) {
        *self.executor.write() = executor;
    }

    /// Deliver `event` to every observer through the notification executor
    pub(crate) fn notify(&self, event: ReaderEvent) {
        let observers = self.observers.read().clone();
        debug!(
            reader = %self.reader_name,
            event = %event.kind(),
            observers = observers.len(),
            "Notifying reader event"
        );
        if observers.is_empty() {
            return;
        }

        let handler = self.handler.read().clone();
        let plugin_name = self.plugin_name.clone();
        let reader_name = self.reader_name.clone();
        let executor = self.executor.read().clone();
        executor.execute(Box::new(move || {
            for observer in &observers {
                let delivered =
                    panic::catch_unwind(AssertUnwindSafe(|| observer.on_reader_event(&event)));
                if let Err(payload) = delivered {
                    let fault = ObservationError::ObserverPanicked(panic_message(payload.as_ref()));
                    report(handler.as_deref(), &plugin_name, &reader_name, &fault);
                }
            }
        }));
    }

    /// Log `fault` and hand it to the exception handler
    pub(crate) fn report(&self, fault: &ObservationError) {
        let handler = self.handler.read().clone();
        report(handler.as_deref(), &self.plugin_name, &self.reader_name, fault);
    }
}

fn report(
    handler: Option<&dyn ObservationExceptionHandler>,
    plugin_name: &str,
    reader_name: &str,
    fault: &ObservationError,
) {
    if fault.tracing_level() == Level::WARN {
        warn!(reader = %reader_name, error = %fault, "Reader observation fault");
    } else {
        error!(reader = %reader_name, error = %fault, "Reader observation fault");
    }

    let Some(handler) = handler else {
        return;
    };
    let handled = panic::catch_unwind(AssertUnwindSafe(|| {
        handler.on_reader_observation_error(plugin_name, reader_name, fault)
    }));
    if let Err(payload) = handled {
        error!(
            reader = %reader_name,
            panic = %panic_message(payload.as_ref()),
            "Observation exception handler panicked"
        );
    }
}
