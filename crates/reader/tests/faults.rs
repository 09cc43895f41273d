//! Monitoring faults reach the exception handler and leave the reader restartable

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use cardlane_reader::{
    DetectionMode, DriverError, MonitoringState, ObservableReader, ObservationError,
    ReaderConfig, ReaderError, ReaderEvent, ReaderEventKind, mock::MockDriver,
};
use crossbeam_channel::Receiver;

const TIMEOUT: Duration = Duration::from_secs(5);

/// What the handler saw: whether the job panicked, and the message
type Fault = (bool, String);

struct Harness {
    reader: ObservableReader,
    handle: MockDriver,
    events: Receiver<ReaderEvent>,
    faults: Receiver<Fault>,
}

fn harness(driver: MockDriver) -> Harness {
    let handle = driver.clone();
    let config = ReaderConfig::new()
        .with_insertion_poll_interval(Duration::from_millis(10))
        .with_removal_poll_interval(Duration::from_millis(10));
    let reader = ObservableReader::new(driver, "test-plugin", config).unwrap();

    let (fault_tx, faults) = crossbeam_channel::unbounded();
    reader
        .set_observation_exception_handler(Arc::new(
            move |_: &str, _: &str, error: &ObservationError| {
                let panicked = matches!(error, ObservationError::JobPanicked(_));
                fault_tx.send((panicked, error.to_string())).unwrap();
            },
        ))
        .unwrap();
    let (event_tx, events) = crossbeam_channel::unbounded();
    reader.add_observer(Arc::new(event_tx)).unwrap();

    Harness {
        reader,
        handle,
        events,
        faults,
    }
}

fn wait_for_state(reader: &ObservableReader, state: MonitoringState) {
    let deadline = Instant::now() + TIMEOUT;
    while reader.monitoring_state().unwrap() != state {
        assert!(Instant::now() < deadline, "reader never reached {state}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn assert_restarts(h: &Harness) {
    h.reader.start_card_detection(DetectionMode::Repeating).unwrap();
    assert_eq!(
        h.reader.monitoring_state().unwrap(),
        MonitoringState::WaitForCardInsertion
    );
    h.handle.insert_card();
    let event = h.events.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(event.kind(), ReaderEventKind::CardInserted);
    assert!(h.faults.try_recv().is_err());
}

#[test]
fn test_polling_fault_stops_detection_until_restarted() {
    let h = harness(MockDriver::new("flaky-0"));
    h.handle
        .fail_next_presence_check(DriverError::ReaderIo("glitch".into()));

    h.reader.start_card_detection(DetectionMode::Repeating).unwrap();
    let (panicked, message) = h.faults.recv_timeout(TIMEOUT).unwrap();
    assert!(!panicked);
    assert!(message.starts_with("Reader monitoring failed"), "{message}");
    assert!(message.contains("checking the card presence"), "{message}");

    wait_for_state(&h.reader, MonitoringState::WaitForStartDetection);
    let calls = h.handle.calls();
    assert_eq!(calls.last().map(String::as_str), Some("stop_detection"));
    assert!(h.events.try_recv().is_err());

    assert_restarts(&h);
}

#[test]
fn test_job_panic_reaches_handler() {
    let h = harness(MockDriver::new("flaky-1"));
    h.handle.panic_on_next_presence_check();

    h.reader.start_card_detection(DetectionMode::Repeating).unwrap();
    let (panicked, message) = h.faults.recv_timeout(TIMEOUT).unwrap();
    assert!(panicked);
    assert!(message.contains("presence check on flaky-1 blew up"), "{message}");
    wait_for_state(&h.reader, MonitoringState::WaitForStartDetection);

    assert_restarts(&h);
}

#[test]
fn test_blocking_wait_failure_reaches_handler() {
    let h = harness(MockDriver::new("flaky-2").with_blocking_detection());

    h.reader.start_card_detection(DetectionMode::Repeating).unwrap();
    h.handle.fail_next_wait(DriverError::ReaderIo("unplugged".into()));
    let (panicked, message) = h.faults.recv_timeout(TIMEOUT).unwrap();
    assert!(!panicked);
    assert!(message.contains("card insertion failed"), "{message}");
    wait_for_state(&h.reader, MonitoringState::WaitForStartDetection);

    assert_restarts(&h);
}

#[test]
fn test_handler_may_restart_detection() {
    let driver = MockDriver::new("flaky-3");
    let handle = driver.clone();
    let reader = ObservableReader::new(
        driver,
        "test-plugin",
        ReaderConfig::new().with_insertion_poll_interval(Duration::from_millis(10)),
    )
    .unwrap();

    let restarter = reader.clone();
    let (restart_tx, restarts) = crossbeam_channel::unbounded();
    reader
        .set_observation_exception_handler(Arc::new(
            move |_: &str, _: &str, _: &ObservationError| {
                let outcome: Result<(), ReaderError> =
                    restarter.start_card_detection(DetectionMode::Repeating);
                restart_tx.send(outcome.is_ok()).unwrap();
            },
        ))
        .unwrap();
    let (event_tx, events) = crossbeam_channel::unbounded();
    reader.add_observer(Arc::new(event_tx)).unwrap();

    handle.fail_next_presence_check(DriverError::ReaderIo("glitch".into()));
    reader.start_card_detection(DetectionMode::Repeating).unwrap();
    assert!(restarts.recv_timeout(TIMEOUT).unwrap());
    wait_for_state(&reader, MonitoringState::WaitForCardInsertion);

    handle.insert_card();
    assert_eq!(
        events.recv_timeout(TIMEOUT).unwrap().kind(),
        ReaderEventKind::CardInserted
    );
    reader.unregister();
}
