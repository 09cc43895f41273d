//! Blocking insertion and removal waits over `SCardGetStatusChange`

use std::{
    ffi::CString,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use cardlane_reader::{CardInsertionWaiter, CardRemovalWaiter, DriverError};
use pcsc::{Context, ReaderState, Scope, State};
use tracing::trace;

use crate::{PcscError, reader::is_card_present};

/// Waits for one reader to reach a card state
///
/// Owns its PC/SC context: [`Context::cancel`] aborts every blocking call of a context, so
/// the waiter must not share it with the channel.
pub(crate) struct StatusChangeWaiter {
    reader: CString,
    context: Context,
    slice: Duration,
    stopped: AtomicBool,
}

impl fmt::Debug for StatusChangeWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusChangeWaiter")
            .field("reader", &self.reader)
            .field("slice", &self.slice)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl StatusChangeWaiter {
    pub(crate) fn new(reader: CString, slice: Duration) -> Result<Self, PcscError> {
        Ok(Self {
            reader,
            context: Context::establish(Scope::User)?,
            slice,
            stopped: AtomicBool::new(false),
        })
    }

    fn wait_until(&self, present: bool) -> Result<(), DriverError> {
        let mut states = [ReaderState::new(self.reader.clone(), State::UNAWARE)];
        wait_for_presence(&self.stopped, present, || {
            states[0].sync_current_state();
            self.context
                .get_status_change(Some(self.slice), &mut states)?;
            Ok(states[0].event_state())
        })
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Err(err) = self.context.cancel() {
            trace!(reader = ?self.reader, error = %err, "Status change cancel failed");
        }
    }
}

/// Poll `status` until the card presence equals `present`
///
/// A raised `stopped` flag wins over a reached state and is consumed on return, whatever
/// the outcome. Slice timeouts and context cancellations without the flag keep waiting.
fn wait_for_presence(
    stopped: &AtomicBool,
    present: bool,
    mut status: impl FnMut() -> Result<State, pcsc::Error>,
) -> Result<(), DriverError> {
    let outcome = loop {
        if stopped.load(Ordering::SeqCst) {
            break Err(DriverError::Cancelled);
        }
        match status() {
            Ok(state) if is_card_present(state) == present => break Ok(()),
            Ok(_) | Err(pcsc::Error::Timeout | pcsc::Error::Cancelled) => {}
            Err(err) => break Err(PcscError::from(err).into()),
        }
    };
    stopped.store(false, Ordering::SeqCst);
    outcome
}

impl CardInsertionWaiter for StatusChangeWaiter {
    fn wait_for_card_insertion(&self) -> Result<(), DriverError> {
        self.wait_until(true)
    }

    fn stop_wait_for_card_insertion(&self) {
        self.stop();
    }
}

impl CardRemovalWaiter for StatusChangeWaiter {
    fn wait_for_card_removal(&self) -> Result<(), DriverError> {
        self.wait_until(false)
    }

    fn stop_wait_for_card_removal(&self) {
        self.stop();
    }
}
