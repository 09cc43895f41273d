use std::{io::BufRead, sync::Arc, thread};

use cardlane_core::CardSelectionRequest;
use cardlane_pcsc::PcscDeviceManager;
use cardlane_reader::{
    CardSelectionScenario, ChannelControl, DetectionMode, MultiSelectionProcessing,
    NotificationMode, ObservationError, ObservableReader, ReaderConfig, ReaderEvent,
    ReaderEventKind,
};
use crossbeam_channel::{Receiver, select};
use tracing::{error, info};

use super::{aid_selector, print_selection_response};

pub(crate) fn watch_command(
    manager: &PcscDeviceManager,
    name: &str,
    aids: &[String],
    matched_only: bool,
    single_shot: bool,
) -> anyhow::Result<()> {
    let reader = manager.open_reader(name, ReaderConfig::default())?;
    reader.set_observation_exception_handler(Arc::new(
        |plugin: &str, reader: &str, err: &ObservationError| {
            error!(plugin, reader, error = %err, "Monitoring failed");
        },
    ))?;

    let (event_tx, event_rx) = crossbeam_channel::unbounded::<ReaderEvent>();
    reader.add_observer(Arc::new(event_tx))?;

    if !aids.is_empty() {
        let requests = aids
            .iter()
            .map(|aid| aid_selector(aid).map(CardSelectionRequest::new))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let scenario = CardSelectionScenario::new(
            requests,
            MultiSelectionProcessing::FirstMatch,
            ChannelControl::KeepOpen,
        )?;
        let notification_mode = if matched_only {
            NotificationMode::MatchedOnly
        } else {
            NotificationMode::Always
        };
        reader.schedule_card_selection_scenario(scenario, notification_mode)?;
    }

    let mode = if single_shot {
        DetectionMode::SingleShot
    } else {
        DetectionMode::Repeating
    };
    reader.start_card_detection(mode)?;
    info!("Watching {name}, press Enter to stop");

    let outcome = watch_loop(&reader, &event_rx, single_shot, stdin_signal());

    reader.stop_card_detection();
    reader.unregister();
    outcome
}

fn watch_loop(
    reader: &ObservableReader,
    events: &Receiver<ReaderEvent>,
    single_shot: bool,
    stop: Receiver<()>,
) -> anyhow::Result<()> {
    loop {
        select! {
            recv(events) -> event => {
                let Ok(event) = event else { return Ok(()) };
                print_event(&event);
                match event.kind() {
                    ReaderEventKind::CardInserted | ReaderEventKind::CardMatched => {
                        reader.finalize_card_processing();
                    }
                    ReaderEventKind::CardRemoved if single_shot => return Ok(()),
                    ReaderEventKind::CardRemoved => {}
                    ReaderEventKind::Unregistered => return Ok(()),
                }
            }
            recv(stop) -> _ => return Ok(()),
        }
    }
}

fn print_event(event: &ReaderEvent) {
    println!("{} on {}", event.kind(), event.reader_name());
    if let Some(responses) = event.selection_responses() {
        for (index, response) in responses.iter().enumerate() {
            print_selection_response(index, response);
        }
    }
}

/// Fires once a line is read from stdin, or stdin closes
fn stdin_signal() -> Receiver<()> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        let _ = stop_tx.send(());
    });
    stop_rx
}
