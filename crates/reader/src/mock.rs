//! In-memory channel driver for tests and demos
//!
//! [`MockDriver`] simulates one reader with its card. Clones share the same simulated
//! hardware: hand one clone to the reader and keep another to insert or remove the card,
//! script the card answers and inspect what was exchanged.
//!
//! ```
//! use cardlane_reader::{ObservableReader, mock::MockDriver};
//!
//! let driver = MockDriver::new("mock-0");
//! let handle = driver.clone();
//! let reader = ObservableReader::new(driver, "mock", Default::default()).unwrap();
//!
//! assert!(!reader.is_card_present().unwrap());
//! handle.insert_card();
//! assert!(reader.is_card_present().unwrap());
//! ```

use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::{
    AutonomousSelection, CardInsertionWaiter, CardRemovalWaiter, ChannelDriver,
    ConfigurableProtocols, DetectionCapabilities, DetectionSink, DriverError,
    InsertionDetection, RemovalDetection,
};

/// Power-on data of the simulated card unless overridden
const DEFAULT_POWER_ON_DATA: [u8; 20] = [
    0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00, 0x01,
    0x00, 0x00, 0x00, 0x00, 0x6A,
];

/// Answer of the simulated card when nothing is scripted
const SUCCESS: [u8; 2] = [0x90, 0x00];

#[derive(Debug, Clone, Copy)]
enum Transition {
    Insertion,
    Removal,
}

#[derive(Debug)]
struct MockState {
    present: bool,
    presence_script: VecDeque<bool>,
    presence_failure: Option<DriverError>,
    presence_panic: bool,
    wait_failure: Option<DriverError>,
    physical_open: bool,
    power_on_data: Bytes,
    responses: VecDeque<Result<Bytes, DriverError>>,
    transmitted: Vec<Bytes>,
    open_failure: Option<DriverError>,
    close_failure: Option<DriverError>,
    calls: Vec<String>,
    insertion_stop: bool,
    removal_stop: bool,
    sink: Option<DetectionSink>,
    supported_protocols: Vec<String>,
    active_protocols: Vec<String>,
    current_protocol: Option<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            present: false,
            presence_script: VecDeque::new(),
            presence_failure: None,
            presence_panic: false,
            wait_failure: None,
            physical_open: false,
            power_on_data: Bytes::from_static(&DEFAULT_POWER_ON_DATA),
            responses: VecDeque::new(),
            transmitted: Vec::new(),
            open_failure: None,
            close_failure: None,
            calls: Vec::new(),
            insertion_stop: false,
            removal_stop: false,
            sink: None,
            supported_protocols: Vec::new(),
            active_protocols: Vec::new(),
            current_protocol: None,
        }
    }
}

impl MockState {
    const fn stop_flag(&mut self, transition: Transition) -> &mut bool {
        match transition {
            Transition::Insertion => &mut self.insertion_stop,
            Transition::Removal => &mut self.removal_stop,
        }
    }

    const fn reached(&self, transition: Transition) -> bool {
        match transition {
            Transition::Insertion => self.present,
            Transition::Removal => !self.present,
        }
    }

    fn next_response(&mut self) -> Result<Bytes, DriverError> {
        self.responses
            .pop_front()
            .unwrap_or_else(|| Ok(Bytes::from_static(&SUCCESS)))
    }
}

#[derive(Debug, Default)]
struct MockInner {
    state: Mutex<MockState>,
    changed: Condvar,
}

impl MockInner {
    /// Block until `transition` happened or the wait is stopped
    fn wait(&self, transition: Transition) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let outcome = loop {
            if let Some(failure) = state.wait_failure.take() {
                break Err(failure);
            }
            if *state.stop_flag(transition) {
                break Err(DriverError::Cancelled);
            }
            if state.reached(transition) {
                break Ok(());
            }
            self.changed.wait(&mut state);
        };
        // A stop racing with the transition must not cancel the next wait
        *state.stop_flag(transition) = false;
        outcome
    }

    fn stop(&self, transition: Transition) {
        *self.state.lock().stop_flag(transition) = true;
        self.changed.notify_all();
    }
}

/// Blocking waiter over the simulated card
#[derive(Debug)]
struct MockWaiter {
    inner: Arc<MockInner>,
}

impl CardInsertionWaiter for MockWaiter {
    fn wait_for_card_insertion(&self) -> Result<(), DriverError> {
        self.inner.wait(Transition::Insertion)
    }

    fn stop_wait_for_card_insertion(&self) {
        self.inner.stop(Transition::Insertion);
    }
}

impl CardRemovalWaiter for MockWaiter {
    fn wait_for_card_removal(&self) -> Result<(), DriverError> {
        self.inner.wait(Transition::Removal)
    }

    fn stop_wait_for_card_removal(&self) {
        self.inner.stop(Transition::Removal);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MockOptions {
    contactless: bool,
    blocking_detection: bool,
    removal_during_processing: bool,
    autonomous_detection: bool,
    configurable_protocols: bool,
    autonomous_selection: bool,
}

/// Simulated reader and card
///
/// The card answers `90 00` to every APDU unless answers are queued with
/// [`Self::push_response`] or [`Self::push_failure`]. Detection defaults to polling.
#[derive(Debug, Clone)]
pub struct MockDriver {
    name: String,
    options: MockOptions,
    inner: Arc<MockInner>,
}

impl MockDriver {
    /// Create a reader with no card inserted
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: MockOptions::default(),
            inner: Arc::default(),
        }
    }

    /// Use `data` as the card power-on data
    pub fn with_power_on_data(self, data: &[u8]) -> Self {
        self.inner.state.lock().power_on_data = Bytes::copy_from_slice(data);
        self
    }

    /// Report the reader as contactless
    pub const fn contactless(mut self) -> Self {
        self.options.contactless = true;
        self
    }

    /// Detect insertion and removal with blocking waits
    pub const fn with_blocking_detection(mut self) -> Self {
        self.options.blocking_detection = true;
        self
    }

    /// Watch for removal while the card is being processed
    pub const fn with_removal_during_processing(mut self) -> Self {
        self.options.removal_during_processing = true;
        self
    }

    /// Push insertion and removal through the detection sink
    pub const fn with_autonomous_detection(mut self) -> Self {
        self.options.autonomous_detection = true;
        self
    }

    /// Support protocol activation for `protocols`
    pub fn with_configurable_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.configurable_protocols = true;
        self.inner.state.lock().supported_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Select applications on board instead of through SELECT APDUs
    pub const fn with_autonomous_selection(mut self) -> Self {
        self.options.autonomous_selection = true;
        self
    }

    /// Put a card on the reader
    pub fn insert_card(&self) {
        self.set_present(true);
    }

    /// Take the card away
    pub fn remove_card(&self) {
        self.set_present(false);
    }

    fn set_present(&self, present: bool) {
        let sink = {
            let mut state = self.inner.state.lock();
            state.present = present;
            if self.options.autonomous_detection {
                state.sink.clone()
            } else {
                None
            }
        };
        self.inner.changed.notify_all();

        // The reader calls back into this driver, the state lock must be released
        if let Some(sink) = sink {
            if present {
                sink.card_inserted();
            } else {
                sink.card_removed();
            }
        }
    }

    /// Answers of the next presence checks, before falling back to the card state
    pub fn set_presence_sequence(&self, answers: impl IntoIterator<Item = bool>) {
        self.inner.state.lock().presence_script = answers.into_iter().collect();
    }

    /// Make the next presence check fail
    pub fn fail_next_presence_check(&self, failure: DriverError) {
        self.inner.state.lock().presence_failure = Some(failure);
    }

    /// Make the next presence check panic
    pub fn panic_on_next_presence_check(&self) {
        self.inner.state.lock().presence_panic = true;
    }

    /// Make the next blocking wait fail
    pub fn fail_next_wait(&self, failure: DriverError) {
        self.inner.state.lock().wait_failure = Some(failure);
        self.inner.changed.notify_all();
    }

    /// Queue the raw answer (status word included) to the next APDU
    pub fn push_response(&self, response: &[u8]) {
        self.inner
            .state
            .lock()
            .responses
            .push_back(Ok(Bytes::copy_from_slice(response)));
    }

    /// Make the next APDU fail
    pub fn push_failure(&self, failure: DriverError) {
        self.inner.state.lock().responses.push_back(Err(failure));
    }

    /// Make every channel opening fail, or succeed again with `None`
    pub fn set_open_failure(&self, failure: Option<DriverError>) {
        self.inner.state.lock().open_failure = failure;
    }

    /// Make every physical channel close fail, or succeed again with `None`
    pub fn set_close_failure(&self, failure: Option<DriverError>) {
        self.inner.state.lock().close_failure = failure;
    }

    /// Reader protocol the card is using
    pub fn set_current_protocol(&self, protocol: Option<&str>) {
        self.inner.state.lock().current_protocol = protocol.map(str::to_string);
    }

    /// APDUs received so far
    pub fn transmitted(&self) -> Vec<Bytes> {
        self.inner.state.lock().transmitted.clone()
    }

    /// Driver entry points called so far, apart from transmissions and presence checks
    pub fn calls(&self) -> Vec<String> {
        self.inner.state.lock().calls.clone()
    }

    /// Reader protocols currently activated
    pub fn active_protocols(&self) -> Vec<String> {
        self.inner.state.lock().active_protocols.clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.inner.state.lock().calls.push(call.into());
    }
}

impl ChannelDriver for MockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_physical_channel(&mut self) -> Result<(), DriverError> {
        let mut state = self.inner.state.lock();
        state.calls.push("open".to_string());
        if let Some(failure) = state.open_failure.clone() {
            return Err(failure);
        }
        if !state.present {
            return Err(DriverError::CardIo("no card on the reader".to_string()));
        }
        state.physical_open = true;
        Ok(())
    }

    fn close_physical_channel(&mut self) -> Result<(), DriverError> {
        let mut state = self.inner.state.lock();
        state.calls.push("close".to_string());
        state.physical_open = false;
        state.close_failure.clone().map_or(Ok(()), Err)
    }

    fn is_physical_channel_open(&self) -> bool {
        self.inner.state.lock().physical_open
    }

    fn check_card_presence(&mut self) -> Result<bool, DriverError> {
        let mut state = self.inner.state.lock();
        if std::mem::take(&mut state.presence_panic) {
            drop(state);
            panic!("presence check on {} blew up", self.name);
        }
        if let Some(failure) = state.presence_failure.take() {
            return Err(failure);
        }
        let scripted = state.presence_script.pop_front();
        Ok(scripted.unwrap_or(state.present))
    }

    fn power_on_data(&self) -> Bytes {
        let state = self.inner.state.lock();
        if state.present {
            state.power_on_data.clone()
        } else {
            Bytes::new()
        }
    }

    fn transmit_apdu(&mut self, apdu: &[u8]) -> Result<Bytes, DriverError> {
        let mut state = self.inner.state.lock();
        if !state.present {
            return Err(DriverError::CardIo("no card on the reader".to_string()));
        }
        state.transmitted.push(Bytes::copy_from_slice(apdu));
        state.next_response()
    }

    fn is_contactless(&self) -> bool {
        self.options.contactless
    }

    fn on_start_detection(&mut self) {
        self.record("start_detection");
    }

    fn on_stop_detection(&mut self) {
        self.record("stop_detection");
    }

    fn on_unregister(&mut self) {
        self.record("unregister");
    }

    fn detection_capabilities(&self) -> DetectionCapabilities {
        let waiter = Arc::new(MockWaiter {
            inner: Arc::clone(&self.inner),
        });
        let options = self.options;

        let (insertion, removal) = if options.autonomous_detection {
            (InsertionDetection::Autonomous, RemovalDetection::Autonomous)
        } else if options.blocking_detection {
            (
                InsertionDetection::Blocking(waiter.clone()),
                RemovalDetection::Blocking(waiter.clone()),
            )
        } else {
            (InsertionDetection::Polling, RemovalDetection::Polling)
        };

        DetectionCapabilities {
            insertion,
            removal,
            removal_during_processing: options
                .removal_during_processing
                .then(|| waiter as Arc<dyn CardRemovalWaiter>),
        }
    }

    fn connect_detection(&mut self, sink: DetectionSink) {
        self.inner.state.lock().sink = Some(sink);
    }

    fn configurable_protocols(&mut self) -> Option<&mut dyn ConfigurableProtocols> {
        if self.options.configurable_protocols {
            Some(self)
        } else {
            None
        }
    }

    fn autonomous_selection(&mut self) -> Option<&mut dyn AutonomousSelection> {
        if self.options.autonomous_selection {
            Some(self)
        } else {
            None
        }
    }
}

impl ConfigurableProtocols for MockDriver {
    fn is_protocol_supported(&self, reader_protocol: &str) -> bool {
        self.inner
            .state
            .lock()
            .supported_protocols
            .iter()
            .any(|protocol| protocol == reader_protocol)
    }

    fn activate_protocol(&mut self, reader_protocol: &str) -> Result<(), DriverError> {
        let mut state = self.inner.state.lock();
        state.calls.push(format!("activate {reader_protocol}"));
        if !state.active_protocols.iter().any(|p| p == reader_protocol) {
            state.active_protocols.push(reader_protocol.to_string());
        }
        Ok(())
    }

    fn deactivate_protocol(&mut self, reader_protocol: &str) -> Result<(), DriverError> {
        let mut state = self.inner.state.lock();
        state.calls.push(format!("deactivate {reader_protocol}"));
        state.active_protocols.retain(|p| p != reader_protocol);
        Ok(())
    }

    fn is_current_protocol(&self, reader_protocol: &str) -> bool {
        self.inner.state.lock().current_protocol.as_deref() == Some(reader_protocol)
    }
}

impl AutonomousSelection for MockDriver {
    fn open_channel_for_aid(&mut self, aid: &[u8], p2: u8) -> Result<Bytes, DriverError> {
        let mut state = self.inner.state.lock();
        state
            .calls
            .push(format!("open_channel_for_aid {} {p2:02X}", hex::encode_upper(aid)));
        if !state.present {
            return Err(DriverError::CardIo("no card on the reader".to_string()));
        }
        state.next_response()
    }

    fn close_logical_channel(&mut self) {
        self.record("close_logical_channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn test_clones_share_the_card() {
        let mut driver = MockDriver::new("mock");
        let handle = driver.clone();
        assert!(!driver.check_card_presence().unwrap());
        handle.insert_card();
        assert!(driver.check_card_presence().unwrap());
        driver.open_physical_channel().unwrap();
        assert!(handle.is_physical_channel_open());
    }

    #[test]
    fn test_presence_sequence_then_state() {
        let mut driver = MockDriver::new("mock");
        driver.set_presence_sequence([true, false]);
        assert!(driver.check_card_presence().unwrap());
        assert!(!driver.check_card_presence().unwrap());
        assert!(!driver.check_card_presence().unwrap());
    }

    #[test]
    fn test_transmit_without_card_fails() {
        let mut driver = MockDriver::new("mock");
        assert!(matches!(
            driver.transmit_apdu(&[0x00, 0xC0, 0x00, 0x00, 0x00]),
            Err(DriverError::CardIo(_))
        ));
        driver.insert_card();
        assert_eq!(
            driver.transmit_apdu(&[0x00, 0xC0, 0x00, 0x00, 0x00]).unwrap().as_ref(),
            SUCCESS
        );
    }

    #[test]
    fn test_waiter_wakes_on_insertion() {
        let driver = MockDriver::new("mock").with_blocking_detection();
        let InsertionDetection::Blocking(waiter) = driver.detection_capabilities().insertion else {
            panic!("blocking insertion expected");
        };
        let handle = thread::spawn(move || waiter.wait_for_card_insertion());
        thread::sleep(Duration::from_millis(20));
        driver.insert_card();
        assert_eq!(handle.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_waiter_stop_cancels_once() {
        let driver = MockDriver::new("mock").with_blocking_detection();
        let RemovalDetection::Blocking(waiter) = driver.detection_capabilities().removal else {
            panic!("blocking removal expected");
        };
        driver.insert_card();
        waiter.stop_wait_for_card_removal();
        assert_eq!(waiter.wait_for_card_removal(), Err(DriverError::Cancelled));

        driver.remove_card();
        assert_eq!(waiter.wait_for_card_removal(), Ok(()));
    }

    #[test]
    fn test_protocol_capability() {
        let mut driver = MockDriver::new("mock").with_configurable_protocols(["T1"]);
        let protocols = driver.configurable_protocols().unwrap();
        assert!(protocols.is_protocol_supported("T1"));
        assert!(!protocols.is_protocol_supported("T0"));
        protocols.activate_protocol("T1").unwrap();
        assert_eq!(driver.active_protocols(), ["T1"]);
        assert!(MockDriver::new("plain").configurable_protocols().is_none());
    }
}
