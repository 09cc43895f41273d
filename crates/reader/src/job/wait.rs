//! Passive blocking-wait job

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{JobEvents, MonitoringJob};
use crate::{CardInsertionWaiter, CardRemovalWaiter, DriverError, InternalEvent, ReaderError};

/// Driver primitive a [`PassiveWaitJob`] blocks in
#[derive(Debug, Clone)]
pub enum WaitTarget {
    /// Wait for a card to arrive
    Insertion(Arc<dyn CardInsertionWaiter>),
    /// Wait for the card to leave
    Removal(Arc<dyn CardRemovalWaiter>),
}

impl WaitTarget {
    fn wait(&self) -> Result<(), DriverError> {
        match self {
            Self::Insertion(waiter) => waiter.wait_for_card_insertion(),
            Self::Removal(waiter) => waiter.wait_for_card_removal(),
        }
    }

    fn interrupt(&self) {
        match self {
            Self::Insertion(waiter) => waiter.stop_wait_for_card_insertion(),
            Self::Removal(waiter) => waiter.stop_wait_for_card_removal(),
        }
    }

    const fn transition(&self) -> &'static str {
        match self {
            Self::Insertion(_) => "insertion",
            Self::Removal(_) => "removal",
        }
    }

    const fn event(&self) -> InternalEvent {
        match self {
            Self::Insertion(_) => InternalEvent::CardInserted,
            Self::Removal(_) => InternalEvent::CardRemoved,
        }
    }
}

#[derive(Debug, Default)]
struct WaitFlags {
    running: bool,
    stopped: bool,
}

/// Blocks in the driver until the awaited transition happens
#[derive(Debug)]
pub struct PassiveWaitJob {
    target: WaitTarget,
    flags: Mutex<WaitFlags>,
}

impl PassiveWaitJob {
    /// Create a job blocking in `target`
    pub fn new(target: WaitTarget) -> Self {
        Self {
            target,
            flags: Mutex::new(WaitFlags::default()),
        }
    }

    /// Wait for an insertion
    pub fn insertion(waiter: Arc<dyn CardInsertionWaiter>) -> Self {
        Self::new(WaitTarget::Insertion(waiter))
    }

    /// Wait for a removal
    pub fn removal(waiter: Arc<dyn CardRemovalWaiter>) -> Self {
        Self::new(WaitTarget::Removal(waiter))
    }
}

impl PassiveWaitJob {
    /// One driver wait; the flag tells whether this job was stopped meanwhile
    fn wait_once(&self) -> Option<(Result<(), DriverError>, bool)> {
        {
            let mut flags = self.flags.lock();
            if flags.stopped {
                return None;
            }
            flags.running = true;
        }

        let outcome = self.target.wait();

        let mut flags = self.flags.lock();
        flags.running = false;
        Some((outcome, flags.stopped))
    }
}

impl MonitoringJob for PassiveWaitJob {
    fn run(&self, events: &dyn JobEvents) -> Result<(), ReaderError> {
        let event = self.target.event();
        let mut stale_cancellations = 0;
        let (outcome, stopped) = loop {
            let Some((outcome, stopped)) = self.wait_once() else {
                return Ok(());
            };
            match outcome {
                // A stop that reached the waiter after an earlier wait returned
                Err(DriverError::Cancelled) if !stopped && stale_cancellations == 0 => {
                    trace!(%event, "Stale cancellation, waiting again");
                    stale_cancellations += 1;
                }
                outcome => break (outcome, stopped),
            }
        };

        match outcome {
            Ok(()) if stopped => {
                trace!(%event, "Wait returned after stop, event dropped");
                Ok(())
            }
            Ok(()) => {
                events.emit(event);
                Ok(())
            }
            Err(err) if stopped => {
                trace!(%event, error = %err, "Wait ended after stop");
                Ok(())
            }
            Err(err) => {
                warn!(%event, error = %err, "Blocking wait failed");
                // A reader that cannot tell whether the card is still there has lost it
                if matches!(self.target, WaitTarget::Removal(_)) {
                    events.emit(event);
                }
                Err(ReaderError::communication(
                    err,
                    format!("Blocking wait for card {} failed", self.target.transition()),
                    None,
                ))
            }
        }
    }

    fn stop(&self) {
        let mut flags = self.flags.lock();
        if flags.stopped {
            return;
        }
        flags.stopped = true;
        if flags.running {
            self.target.interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::RecordingEvents;
    use parking_lot::Condvar;
    use std::{thread, time::Duration};

    #[derive(Debug, Default)]
    struct GateState {
        open: bool,
        stop_requested: bool,
        failure: Option<DriverError>,
        stop_calls: usize,
    }

    /// Waiter released either by `open` or by a stop
    #[derive(Debug, Default)]
    struct Gate {
        state: Mutex<GateState>,
        changed: Condvar,
    }

    impl Gate {
        fn open(&self) {
            self.state.lock().open = true;
            self.changed.notify_all();
        }

        fn block(&self) -> Result<(), DriverError> {
            let mut state = self.state.lock();
            loop {
                if let Some(failure) = state.failure.take() {
                    return Err(failure);
                }
                if state.stop_requested {
                    state.stop_requested = false;
                    return Err(DriverError::Cancelled);
                }
                if state.open {
                    return Ok(());
                }
                self.changed.wait(&mut state);
            }
        }

        fn request_stop(&self) {
            let mut state = self.state.lock();
            state.stop_requested = true;
            state.stop_calls += 1;
            self.changed.notify_all();
        }
    }

    impl CardInsertionWaiter for Gate {
        fn wait_for_card_insertion(&self) -> Result<(), DriverError> {
            self.block()
        }

        fn stop_wait_for_card_insertion(&self) {
            self.request_stop();
        }
    }

    impl CardRemovalWaiter for Gate {
        fn wait_for_card_removal(&self) -> Result<(), DriverError> {
            self.block()
        }

        fn stop_wait_for_card_removal(&self) {
            self.request_stop();
        }
    }

    fn spawn_job(job: &Arc<PassiveWaitJob>) -> (Arc<RecordingEvents>, thread::JoinHandle<()>) {
        let events = Arc::new(RecordingEvents::default());
        let runner = Arc::clone(job);
        let sink = Arc::clone(&events);
        let handle = thread::spawn(move || runner.run(sink.as_ref()).unwrap());
        (events, handle)
    }

    #[test]
    fn test_emits_when_wait_returns() {
        let gate = Arc::new(Gate::default());
        let job = Arc::new(PassiveWaitJob::insertion(gate.clone()));
        let (events, handle) = spawn_job(&job);
        thread::sleep(Duration::from_millis(20));
        gate.open();
        handle.join().unwrap();
        assert_eq!(*events.0.lock(), vec![InternalEvent::CardInserted]);
    }

    #[test]
    fn test_stop_unblocks_without_event() {
        let gate = Arc::new(Gate::default());
        let job = Arc::new(PassiveWaitJob::removal(gate.clone()));
        let (events, handle) = spawn_job(&job);
        thread::sleep(Duration::from_millis(20));
        job.stop();
        job.stop();
        handle.join().unwrap();
        assert!(events.0.lock().is_empty());
        assert_eq!(gate.state.lock().stop_calls, 1);
    }

    #[test]
    fn test_stop_before_run() {
        let gate = Arc::new(Gate::default());
        let job = PassiveWaitJob::insertion(gate.clone());
        job.stop();
        let events = RecordingEvents::default();
        job.run(&events).unwrap();
        assert!(events.0.lock().is_empty());
        assert_eq!(gate.state.lock().stop_calls, 0);
    }

    #[test]
    fn test_removal_failure_counts_as_removal_and_is_reported() {
        let gate = Arc::new(Gate::default());
        gate.state.lock().failure = Some(DriverError::ReaderIo("lost".into()));
        let job = PassiveWaitJob::removal(gate);
        let events = RecordingEvents::default();
        assert!(matches!(
            job.run(&events),
            Err(ReaderError::ReaderCommunication { .. })
        ));
        assert_eq!(*events.0.lock(), vec![InternalEvent::CardRemoved]);
    }

    #[test]
    fn test_insertion_failure_is_reported() {
        let gate = Arc::new(Gate::default());
        gate.state.lock().failure = Some(DriverError::CardIo("lost".into()));
        let job = PassiveWaitJob::insertion(gate);
        let events = RecordingEvents::default();
        let err = job.run(&events).unwrap_err();
        assert!(err.is_card_failure());
        assert!(err.to_string().contains("insertion"), "{err}");
        assert!(events.0.lock().is_empty());
    }

    /// Removal waiter stopping its first job right after the wait returned
    #[derive(Debug, Default)]
    struct LateStop {
        gate: Gate,
        job: Mutex<Option<Arc<PassiveWaitJob>>>,
    }

    impl CardRemovalWaiter for LateStop {
        fn wait_for_card_removal(&self) -> Result<(), DriverError> {
            let outcome = self.gate.block();
            if let Some(job) = self.job.lock().take() {
                job.stop();
            }
            outcome
        }

        fn stop_wait_for_card_removal(&self) {
            self.gate.request_stop();
        }
    }

    #[test]
    fn test_late_stop_does_not_cancel_the_next_wait() {
        let waiter = Arc::new(LateStop::default());
        waiter.gate.open();

        let first = Arc::new(PassiveWaitJob::removal(waiter.clone()));
        *waiter.job.lock() = Some(Arc::clone(&first));
        let events = RecordingEvents::default();
        first.run(&events).unwrap();
        assert!(events.0.lock().is_empty());
        assert_eq!(waiter.gate.state.lock().stop_calls, 1);

        let second = PassiveWaitJob::removal(waiter.clone());
        let events = RecordingEvents::default();
        second.run(&events).unwrap();
        assert_eq!(*events.0.lock(), vec![InternalEvent::CardRemoved]);
    }

    #[test]
    fn test_repeated_unrequested_cancellation_is_reported() {
        #[derive(Debug)]
        struct AlwaysCancelled;

        impl CardInsertionWaiter for AlwaysCancelled {
            fn wait_for_card_insertion(&self) -> Result<(), DriverError> {
                Err(DriverError::Cancelled)
            }

            fn stop_wait_for_card_insertion(&self) {}
        }

        let job = PassiveWaitJob::insertion(Arc::new(AlwaysCancelled));
        let events = RecordingEvents::default();
        assert!(job.run(&events).is_err());
        assert!(events.0.lock().is_empty());
    }
}
