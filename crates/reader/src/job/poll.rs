//! Active polling job

use std::{fmt, time::Duration};

use derive_more::Display;
use tracing::trace;

use super::{JobEvents, MonitoringJob, StopSignal};
use crate::{InternalEvent, ReaderError};

/// Presence checks used by [`ActivePollJob`]
pub trait PresenceProbe: Send + Sync {
    /// Cheap presence check, no APDU exchanged
    fn is_card_present(&self) -> Result<bool, ReaderError>;

    /// Presence check that exchanges an APDU with a connected card
    ///
    /// A card that stopped answering is reported as absent. Only reader failures are errors.
    fn ping(&self) -> Result<bool, ReaderError>;
}

/// Transition an [`ActivePollJob`] waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PollTarget {
    /// Card arrives, probed with [`PresenceProbe::is_card_present`]
    #[display("insertion")]
    Insertion,
    /// Card leaves, probed with [`PresenceProbe::ping`]
    #[display("removal")]
    Removal,
}

impl PollTarget {
    const fn event(self) -> InternalEvent {
        match self {
            Self::Insertion => InternalEvent::CardInserted,
            Self::Removal => InternalEvent::CardRemoved,
        }
    }
}

/// Probes presence at a fixed interval until the awaited transition shows up
pub struct ActivePollJob {
    target: PollTarget,
    interval: Duration,
    probe: Box<dyn PresenceProbe>,
    signal: StopSignal,
}

impl fmt::Debug for ActivePollJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePollJob")
            .field("target", &self.target)
            .field("interval", &self.interval)
            .field("stopped", &self.signal.is_stopped())
            .finish_non_exhaustive()
    }
}

impl ActivePollJob {
    /// Create a job waiting for `target`
    pub fn new(target: PollTarget, probe: impl PresenceProbe + 'static, interval: Duration) -> Self {
        Self {
            target,
            interval,
            probe: Box::new(probe),
            signal: StopSignal::new(),
        }
    }

    /// Transition this job waits for
    pub const fn target(&self) -> PollTarget {
        self.target
    }

    fn probe(&self) -> Result<bool, ReaderError> {
        match self.target {
            PollTarget::Insertion => self.probe.is_card_present(),
            PollTarget::Removal => self.probe.ping().map(|present| !present),
        }
    }
}

impl MonitoringJob for ActivePollJob {
    fn run(&self, events: &dyn JobEvents) -> Result<(), ReaderError> {
        trace!(target = %self.target, interval = ?self.interval, "Polling started");
        loop {
            if self.signal.is_stopped() {
                break;
            }
            if self.probe()? {
                if !self.signal.is_stopped() {
                    trace!(target = %self.target, "Transition detected");
                    events.emit(self.target.event());
                }
                return Ok(());
            }
            if self.signal.sleep(self.interval) {
                break;
            }
        }
        trace!(target = %self.target, "Polling stopped");
        Ok(())
    }

    fn stop(&self) {
        self.signal.stop();
    }
}
