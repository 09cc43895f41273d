//! Card detection through the public reader API

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use cardlane_reader::{
    DetectionMode, MonitoringState, ObservableReader, ObservationError, ReaderConfig,
    ReaderEvent, ReaderEventKind, mock::MockDriver,
};
use crossbeam_channel::Receiver;

const TIMEOUT: Duration = Duration::from_secs(5);

fn observed(driver: MockDriver) -> (ObservableReader, Receiver<ReaderEvent>) {
    let config = ReaderConfig::new()
        .with_insertion_poll_interval(Duration::from_millis(10))
        .with_removal_poll_interval(Duration::from_millis(10));
    let reader = ObservableReader::new(driver, "test-plugin", config).unwrap();
    reader
        .set_observation_exception_handler(Arc::new(
            |_: &str, reader: &str, error: &ObservationError| {
                panic!("unexpected fault on {reader}: {error}");
            },
        ))
        .unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    reader.add_observer(Arc::new(tx)).unwrap();
    (reader, rx)
}

fn next_kind(rx: &Receiver<ReaderEvent>) -> ReaderEventKind {
    rx.recv_timeout(TIMEOUT).unwrap().kind()
}

fn wait_for_state(reader: &ObservableReader, state: MonitoringState) {
    let deadline = Instant::now() + TIMEOUT;
    while reader.monitoring_state().unwrap() != state {
        assert!(Instant::now() < deadline, "reader never reached {state}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_polling_repeating_cycle() {
    let driver = MockDriver::new("poll-0");
    let handle = driver.clone();
    let (reader, rx) = observed(driver);

    reader.start_card_detection(DetectionMode::Repeating).unwrap();
    assert_eq!(
        reader.monitoring_state().unwrap(),
        MonitoringState::WaitForCardInsertion
    );

    for _ in 0..2 {
        handle.insert_card();
        let event = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(event.kind(), ReaderEventKind::CardInserted);
        assert_eq!(event.plugin_name(), "test-plugin");
        assert_eq!(event.reader_name(), "poll-0");
        assert!(event.selection_responses().is_none());

        reader.finalize_card_processing();
        assert_eq!(
            reader.monitoring_state().unwrap(),
            MonitoringState::WaitForCardRemoval
        );

        handle.remove_card();
        assert_eq!(next_kind(&rx), ReaderEventKind::CardRemoved);
        wait_for_state(&reader, MonitoringState::WaitForCardInsertion);
    }

    reader.stop_card_detection();
    assert_eq!(
        reader.monitoring_state().unwrap(),
        MonitoringState::WaitForStartDetection
    );
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_single_shot_stops_after_processing() {
    let driver = MockDriver::new("poll-1");
    let handle = driver.clone();
    let (reader, rx) = observed(driver);

    reader.start_card_detection(DetectionMode::SingleShot).unwrap();
    handle.insert_card();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardInserted);

    reader.finalize_card_processing();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardRemoved);
    assert_eq!(
        reader.monitoring_state().unwrap(),
        MonitoringState::WaitForStartDetection
    );

    let calls = handle.calls();
    assert_eq!(calls.first().map(String::as_str), Some("start_detection"));
    assert_eq!(calls.last().map(String::as_str), Some("stop_detection"));
}

#[test]
fn test_stop_during_processing_reports_removal() {
    let driver = MockDriver::new("poll-2");
    let handle = driver.clone();
    let (reader, rx) = observed(driver);

    reader.start_card_detection(DetectionMode::Repeating).unwrap();
    handle.insert_card();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardInserted);

    reader.stop_card_detection();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardRemoved);
    assert_eq!(
        reader.monitoring_state().unwrap(),
        MonitoringState::WaitForStartDetection
    );

    // Finalizing after the stop is ignored
    reader.finalize_card_processing();
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_blocking_detection() {
    let driver = MockDriver::new("wait-0").with_blocking_detection();
    let handle = driver.clone();
    let (reader, rx) = observed(driver);

    reader.start_card_detection(DetectionMode::Repeating).unwrap();
    handle.insert_card();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardInserted);

    reader.finalize_card_processing();
    handle.remove_card();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardRemoved);
    wait_for_state(&reader, MonitoringState::WaitForCardInsertion);

    // The pending insertion wait is cancelled, not reported
    reader.stop_card_detection();
    thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_removal_watched_during_processing() {
    let driver = MockDriver::new("wait-1").with_removal_during_processing();
    let handle = driver.clone();
    let (reader, rx) = observed(driver);

    reader.start_card_detection(DetectionMode::Repeating).unwrap();
    handle.insert_card();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardInserted);

    // The application never finalizes, the card leaves anyway
    handle.remove_card();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardRemoved);
    wait_for_state(&reader, MonitoringState::WaitForCardInsertion);
}

#[test]
fn test_autonomous_detection_is_synchronous() {
    let driver = MockDriver::new("auto-0").with_autonomous_detection();
    let handle = driver.clone();
    let (reader, rx) = observed(driver);

    // Not started yet: the insertion is ignored
    handle.insert_card();
    assert!(rx.try_recv().is_err());
    handle.remove_card();

    reader.start_card_detection(DetectionMode::Repeating).unwrap();
    handle.insert_card();
    assert_eq!(rx.try_recv().unwrap().kind(), ReaderEventKind::CardInserted);
    assert_eq!(
        reader.monitoring_state().unwrap(),
        MonitoringState::WaitForCardProcessing
    );

    reader.finalize_card_processing();
    handle.remove_card();
    assert_eq!(rx.try_recv().unwrap().kind(), ReaderEventKind::CardRemoved);
    assert_eq!(
        reader.monitoring_state().unwrap(),
        MonitoringState::WaitForCardInsertion
    );
}

#[test]
fn test_observer_may_call_back_into_the_reader() {
    let driver = MockDriver::new("auto-1").with_autonomous_detection();
    let handle = driver.clone();
    let (reader, rx) = observed(driver);

    let callback = reader.clone();
    reader
        .add_observer(Arc::new(move |event: &ReaderEvent| {
            if event.kind() == ReaderEventKind::CardInserted {
                callback.finalize_card_processing();
            }
        }))
        .unwrap();

    reader.start_card_detection(DetectionMode::Repeating).unwrap();
    handle.insert_card();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardInserted);
    assert_eq!(
        reader.monitoring_state().unwrap(),
        MonitoringState::WaitForCardRemoval
    );
    reader.unregister();
}

#[test]
fn test_unregister_notifies_and_tears_down() {
    let driver = MockDriver::new("poll-3");
    let handle = driver.clone();
    let (reader, rx) = observed(driver);

    reader.start_card_detection(DetectionMode::Repeating).unwrap();
    handle.insert_card();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardInserted);

    reader.unregister();
    assert_eq!(next_kind(&rx), ReaderEventKind::CardRemoved);
    assert_eq!(next_kind(&rx), ReaderEventKind::Unregistered);
    assert_eq!(reader.count_observers(), 0);
    assert!(!reader.is_registered());
    assert_eq!(handle.calls().last().map(String::as_str), Some("unregister"));

    assert!(reader.start_card_detection(DetectionMode::Repeating).is_err());
    handle.remove_card();
    thread::sleep(Duration::from_millis(50));
    assert!(rx.try_recv().is_err());
}
