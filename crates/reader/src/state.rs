//! Card detection state machine
//!
//! The machine owns the current [`MonitoringState`] and the job watching for the next
//! transition. Everything else it needs (processing an inserted card, closing channels,
//! notifying observers, launching jobs) goes through [`MachineContext`], implemented by the
//! reader while it holds its per-reader lock.
//!
//! Each state switch bumps a generation counter. Jobs tag their events with the generation
//! they were started for, so an event raised by a job that was stopped in the meantime is
//! recognised as stale and dropped.

use std::sync::Arc;

use tracing::trace;

use crate::{
    DetectionMode, InternalEvent, MonitoringJob, MonitoringState, ReaderEvent,
};

/// Operations the state machine delegates to its reader
pub(crate) trait MachineContext {
    /// Detection mode requested at the last start
    fn detection_mode(&self) -> DetectionMode;

    /// Run the scheduled scenario; `None` when the card must not be reported
    fn process_card_inserted(&mut self) -> Option<ReaderEvent>;

    /// Close the channels and report the removal
    fn process_card_removed(&mut self);

    /// Close the channels without reporting anything
    fn close_channels(&mut self);

    /// Report an event to the observers
    fn notify(&mut self, event: ReaderEvent);

    /// Driver hook, detection starts
    fn on_start_detection(&mut self);

    /// Driver hook, back to waiting for detection to start
    fn on_stop_detection(&mut self);

    /// Launch the job of `state`, if that state has one
    fn start_job(
        &mut self,
        state: MonitoringState,
        generation: u64,
    ) -> Option<Arc<dyn MonitoringJob>>;
}

#[derive(Debug)]
pub(crate) struct DetectionStateMachine {
    state: MonitoringState,
    job: Option<Arc<dyn MonitoringJob>>,
    generation: u64,
}

impl DetectionStateMachine {
    pub(crate) const fn new() -> Self {
        Self {
            state: MonitoringState::WaitForStartDetection,
            job: None,
            generation: 0,
        }
    }

    pub(crate) const fn state(&self) -> MonitoringState {
        self.state
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn on_event(&mut self, event: InternalEvent, ctx: &mut impl MachineContext) {
        use InternalEvent as Event;
        use MonitoringState::*;

        trace!(state = %self.state, %event, "Internal event received");

        match (self.state, event) {
            (WaitForStartDetection, Event::StartDetect) => {
                ctx.on_start_detection();
                self.switch_state(WaitForCardInsertion, ctx);
            }

            (WaitForCardInsertion, Event::CardInserted) => match ctx.process_card_inserted() {
                Some(reader_event) => {
                    self.switch_state(WaitForCardProcessing, ctx);
                    ctx.notify(reader_event);
                }
                None => {
                    trace!("Inserted card not reported, waiting for its removal");
                    self.switch_state(WaitForCardRemoval, ctx);
                }
            },
            (WaitForCardInsertion, Event::StopDetect) => {
                // A rejected selection may have left a channel open
                ctx.close_channels();
                self.switch_state(WaitForStartDetection, ctx);
            }
            (WaitForCardInsertion, Event::CardRemoved)
                if ctx.detection_mode() == DetectionMode::SingleShot =>
            {
                self.switch_state(WaitForStartDetection, ctx);
            }

            (WaitForCardProcessing, Event::CardProcessed) => {
                if ctx.detection_mode() == DetectionMode::Repeating {
                    self.switch_state(WaitForCardRemoval, ctx);
                } else {
                    ctx.process_card_removed();
                    self.switch_state(WaitForStartDetection, ctx);
                }
            }
            (WaitForCardProcessing | WaitForCardRemoval, Event::CardRemoved) => {
                ctx.process_card_removed();
                let next = match ctx.detection_mode() {
                    DetectionMode::Repeating => WaitForCardInsertion,
                    DetectionMode::SingleShot => WaitForStartDetection,
                };
                self.switch_state(next, ctx);
            }
            (WaitForCardProcessing | WaitForCardRemoval, Event::StopDetect) => {
                ctx.process_card_removed();
                self.switch_state(WaitForStartDetection, ctx);
            }

            (state, event) => trace!(%state, %event, "Event ignored"),
        }
    }

    /// The active job failed; detection stays down until it is started again
    pub(crate) fn on_job_fault(&mut self, ctx: &mut impl MachineContext) {
        use MonitoringState::*;

        trace!(state = %self.state, "Monitoring job failed");
        match self.state {
            WaitForStartDetection => {}
            // The application still owns the card, removal is watched again once processed
            WaitForCardProcessing => self.stop_job(),
            WaitForCardInsertion => {
                ctx.close_channels();
                self.switch_state(WaitForStartDetection, ctx);
            }
            WaitForCardRemoval => {
                ctx.process_card_removed();
                self.switch_state(WaitForStartDetection, ctx);
            }
        }
    }

    fn switch_state(&mut self, next: MonitoringState, ctx: &mut impl MachineContext) {
        trace!(from = %self.state, to = %next, "Switching state");
        self.stop_job();
        self.state = next;
        if next == MonitoringState::WaitForStartDetection {
            ctx.on_stop_detection();
        }
        self.job = ctx.start_job(next, self.generation);
    }

    /// Stop the active job; its pending events become stale
    pub(crate) fn stop_job(&mut self) {
        if let Some(job) = self.job.take() {
            trace!(?job, "Stopping monitoring job");
            job.stop();
        }
        self.generation = self.generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobEvents, ReaderError, ReaderEventKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingJob {
        stops: AtomicUsize,
    }

    impl MonitoringJob for CountingJob {
        fn run(&self, _events: &dyn JobEvents) -> Result<(), ReaderError> {
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Default)]
    struct FakeContext {
        mode: DetectionMode,
        accept_card: bool,
        calls: Vec<String>,
        notified: Vec<ReaderEventKind>,
        jobs: Vec<(MonitoringState, u64, Arc<CountingJob>)>,
    }

    impl FakeContext {
        fn new(mode: DetectionMode) -> Self {
            Self {
                mode,
                accept_card: true,
                ..Self::default()
            }
        }
    }

    impl MachineContext for FakeContext {
        fn detection_mode(&self) -> DetectionMode {
            self.mode
        }

        fn process_card_inserted(&mut self) -> Option<ReaderEvent> {
            self.calls.push("inserted".into());
            self.accept_card
                .then(|| ReaderEvent::new("p", "r", ReaderEventKind::CardInserted, None))
        }

        fn process_card_removed(&mut self) {
            self.calls.push("removed".into());
            self.notified.push(ReaderEventKind::CardRemoved);
        }

        fn close_channels(&mut self) {
            self.calls.push("close".into());
        }

        fn notify(&mut self, event: ReaderEvent) {
            self.notified.push(event.kind());
        }

        fn on_start_detection(&mut self) {
            self.calls.push("start".into());
        }

        fn on_stop_detection(&mut self) {
            self.calls.push("stop".into());
        }

        fn start_job(
            &mut self,
            state: MonitoringState,
            generation: u64,
        ) -> Option<Arc<dyn MonitoringJob>> {
            if state == MonitoringState::WaitForStartDetection {
                return None;
            }
            let job = Arc::new(CountingJob::default());
            self.jobs.push((state, generation, Arc::clone(&job)));
            Some(job)
        }
    }

    use InternalEvent::*;
    use MonitoringState::*;

    #[test]
    fn test_nominal_repeating_cycle() {
        let mut machine = DetectionStateMachine::new();
        let mut ctx = FakeContext::new(DetectionMode::Repeating);
        assert_eq!(machine.state(), WaitForStartDetection);

        machine.on_event(StartDetect, &mut ctx);
        assert_eq!(machine.state(), WaitForCardInsertion);

        machine.on_event(CardInserted, &mut ctx);
        assert_eq!(machine.state(), WaitForCardProcessing);
        assert_eq!(ctx.notified, vec![ReaderEventKind::CardInserted]);

        machine.on_event(CardProcessed, &mut ctx);
        assert_eq!(machine.state(), WaitForCardRemoval);

        machine.on_event(CardRemoved, &mut ctx);
        assert_eq!(machine.state(), WaitForCardInsertion);
        assert_eq!(
            ctx.notified,
            vec![ReaderEventKind::CardInserted, ReaderEventKind::CardRemoved]
        );

        // Every job but the last was stopped exactly once
        let (last, others) = ctx.jobs.split_last().unwrap();
        assert_eq!(last.0, WaitForCardInsertion);
        assert_eq!(last.2.stops.load(Ordering::SeqCst), 0);
        for (_, _, job) in others {
            assert_eq!(job.stops.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_generation_changes_on_every_switch() {
        let mut machine = DetectionStateMachine::new();
        let mut ctx = FakeContext::new(DetectionMode::Repeating);
        machine.on_event(StartDetect, &mut ctx);
        machine.on_event(CardInserted, &mut ctx);
        let generations: Vec<u64> = ctx.jobs.iter().map(|(_, g, _)| *g).collect();
        assert_eq!(generations.len(), 2);
        assert_ne!(generations[0], generations[1]);
        assert_eq!(machine.generation(), generations[1]);
    }

    #[test]
    fn test_rejected_card_waits_for_removal() {
        let mut machine = DetectionStateMachine::new();
        let mut ctx = FakeContext::new(DetectionMode::Repeating);
        ctx.accept_card = false;
        machine.on_event(StartDetect, &mut ctx);
        machine.on_event(CardInserted, &mut ctx);
        assert_eq!(machine.state(), WaitForCardRemoval);
        assert!(ctx.notified.is_empty());
    }

    #[test]
    fn test_single_shot_ends_after_processing() {
        let mut machine = DetectionStateMachine::new();
        let mut ctx = FakeContext::new(DetectionMode::SingleShot);
        machine.on_event(StartDetect, &mut ctx);
        machine.on_event(CardInserted, &mut ctx);
        machine.on_event(CardProcessed, &mut ctx);
        assert_eq!(machine.state(), WaitForStartDetection);
        assert_eq!(
            ctx.calls,
            vec!["start", "inserted", "removed", "stop"]
        );
    }

    #[test]
    fn test_stop_detect_always_lands_in_start_detection() {
        let prefixes: [&[InternalEvent]; 4] = [
            &[],
            &[StartDetect],
            &[StartDetect, CardInserted],
            &[StartDetect, CardInserted, CardProcessed],
        ];
        for mode in [DetectionMode::Repeating, DetectionMode::SingleShot] {
            for prefix in prefixes {
                let mut machine = DetectionStateMachine::new();
                let mut ctx = FakeContext::new(mode);
                for event in prefix {
                    machine.on_event(*event, &mut ctx);
                }
                machine.on_event(StopDetect, &mut ctx);
                assert_eq!(machine.state(), WaitForStartDetection, "{mode} {prefix:?}");
                assert!(machine.job.is_none());
            }
        }
    }

    #[test]
    fn test_stop_in_insertion_closes_channels() {
        let mut machine = DetectionStateMachine::new();
        let mut ctx = FakeContext::new(DetectionMode::Repeating);
        machine.on_event(StartDetect, &mut ctx);
        machine.on_event(StopDetect, &mut ctx);
        assert_eq!(ctx.calls, vec!["start", "close", "stop"]);
        assert!(ctx.notified.is_empty());
    }

    #[test]
    fn test_removed_while_waiting_for_insertion() {
        let mut machine = DetectionStateMachine::new();
        let mut ctx = FakeContext::new(DetectionMode::Repeating);
        machine.on_event(StartDetect, &mut ctx);
        machine.on_event(CardRemoved, &mut ctx);
        assert_eq!(machine.state(), WaitForCardInsertion);
        assert_eq!(ctx.jobs.len(), 1);

        let mut machine = DetectionStateMachine::new();
        let mut ctx = FakeContext::new(DetectionMode::SingleShot);
        machine.on_event(StartDetect, &mut ctx);
        machine.on_event(CardRemoved, &mut ctx);
        assert_eq!(machine.state(), WaitForStartDetection);
    }

    #[test]
    fn test_job_fault_stops_detection_until_restarted() {
        let mut machine = DetectionStateMachine::new();
        let mut ctx = FakeContext::new(DetectionMode::Repeating);
        machine.on_event(StartDetect, &mut ctx);
        let failed = machine.generation();

        machine.on_job_fault(&mut ctx);
        assert_eq!(machine.state(), WaitForStartDetection);
        assert_ne!(machine.generation(), failed);
        assert_eq!(ctx.calls, vec!["start", "close", "stop"]);

        machine.on_event(StartDetect, &mut ctx);
        assert_eq!(machine.state(), WaitForCardInsertion);
        machine.on_event(CardInserted, &mut ctx);
        assert_eq!(machine.state(), WaitForCardProcessing);
    }

    #[test]
    fn test_job_fault_after_insertion() {
        let mut machine = DetectionStateMachine::new();
        let mut ctx = FakeContext::new(DetectionMode::Repeating);
        machine.on_event(StartDetect, &mut ctx);
        machine.on_event(CardInserted, &mut ctx);

        // Processing keeps the card, only the removal watch is dropped
        machine.on_job_fault(&mut ctx);
        assert_eq!(machine.state(), WaitForCardProcessing);
        assert!(machine.job.is_none());

        machine.on_event(CardProcessed, &mut ctx);
        assert_eq!(machine.state(), WaitForCardRemoval);
        machine.on_job_fault(&mut ctx);
        assert_eq!(machine.state(), WaitForStartDetection);
        assert_eq!(
            ctx.notified,
            vec![ReaderEventKind::CardInserted, ReaderEventKind::CardRemoved]
        );
    }

    #[test]
    fn test_any_event_sequence_keeps_a_valid_state() {
        let events = [
            CardInserted,
            CardRemoved,
            CardProcessed,
            StartDetect,
            StopDetect,
            TimeOut,
        ];
        // Deterministic pseudo-random walk over the event alphabet
        let mut seed = 0x2545_F491_u32;
        let mut machine = DetectionStateMachine::new();
        let mut ctx = FakeContext::new(DetectionMode::Repeating);
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let event = events[seed as usize % events.len()];
            let before = machine.state();
            machine.on_event(event, &mut ctx);
            if event == TimeOut {
                assert_eq!(machine.state(), before);
            }
            assert_eq!(
                machine.job.is_some(),
                machine.state() != WaitForStartDetection
            );
        }
    }
}
