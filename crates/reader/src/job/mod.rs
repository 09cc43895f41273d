//! Monitoring jobs
//!
//! A monitoring job watches for one card transition on the reader's executor lane and
//! raises the matching [`InternalEvent`]. Two strategies exist:
//!
//! - [`ActivePollJob`]: probe presence at a fixed interval
//! - [`PassiveWaitJob`]: block in the driver until the transition happens
//!
//! Jobs never let a failure escape: [`MonitoringJob::run`] returns it and the caller routes
//! it to the observation exception handler.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::{InternalEvent, ReaderError};

mod poll;
mod wait;

pub use poll::{ActivePollJob, PollTarget, PresenceProbe};
pub use wait::{PassiveWaitJob, WaitTarget};

/// Background task watching for one card transition
pub trait MonitoringJob: Send + Sync + fmt::Debug {
    /// Watch until the transition happens or the job is stopped
    fn run(&self, events: &dyn JobEvents) -> Result<(), ReaderError>;

    /// Make [`Self::run`] return as soon as possible, without emitting
    ///
    /// Idempotent, never fails.
    fn stop(&self);
}

/// Where a job sends the events it raises
pub trait JobEvents {
    /// Forward an event to the state machine
    fn emit(&self, event: InternalEvent);
}

/// Stop flag with an interruptible sleep
#[derive(Debug)]
pub(crate) struct StopSignal {
    stopped: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            stopped: AtomicBool::new(false),
            wake_tx,
            wake_rx,
        }
    }

    pub(crate) fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            // Capacity 1 and a single sender call: cannot be full
            let _ = self.wake_tx.try_send(());
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`; returns true if the signal was stopped meanwhile
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        match self.wake_rx.recv_timeout(duration) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.is_stopped(),
        }
    }
}
