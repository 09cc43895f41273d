//! Observable reader
//!
//! [`ObservableReader`] wraps one [`ChannelDriver`] and exposes the synchronous reader API.
//! Everything touching the driver, the channel bookkeeping or the state machine runs under
//! one per-reader lock, whichever thread the call comes from: the application, the monitoring
//! lane or an autonomous driver.
//!
//! The lock is reentrant so that observers notified inline may call back into the reader.
//! Notifications and fault reports collected while the reader state is borrowed are only
//! dispatched once that borrow is released. A detection event pushed by the driver from inside
//! one of its own calls is queued and processed as soon as that call returns.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use cardlane_core::{
    CardRequest, CardResponse, CardSelectionRequest, CardSelectionResponse, Command,
};
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error, info, trace, warn};

use crate::{
    CardSelectionScenario, ChannelControl, ChannelDriver, DetectionCapabilities, DetectionMode,
    DriverError, InsertionDetection, InternalEvent, MonitoringState, MultiSelectionProcessing,
    NotificationExecutor, NotificationMode, ObservationError, ObservationExceptionHandler,
    ReaderConfig, ReaderError, ReaderEvent, ReaderEventKind, ReaderObserver, RemovalDetection,
    engine::{ChannelState, SelectionEngine},
    job::{
        ActivePollJob, JobEvents, MonitoringJob, PassiveWaitJob, PollTarget, PresenceProbe,
    },
    lane::{ExecutorLane, panic_message},
    observation::ObservationManager,
    state::{DetectionStateMachine, MachineContext},
};

/// Smart card reader with card detection and observer notification
///
/// Created once per physical reader. Dropping the last handle stops the monitoring job.
/// [`Self::unregister`] tears the reader down for good.
#[derive(Clone)]
pub struct ObservableReader {
    shared: Arc<ReaderShared>,
}

impl fmt::Debug for ObservableReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableReader")
            .field("name", &self.shared.name)
            .field("plugin_name", &self.shared.plugin_name)
            .field("registered", &self.shared.is_registered())
            .field("config", &self.shared.config)
            .field("capabilities", &self.shared.capabilities)
            .finish_non_exhaustive()
    }
}

impl ObservableReader {
    /// Wrap `driver` into an observable reader
    ///
    /// Spawns the monitoring lane of the reader and, for drivers detecting cards by
    /// themselves, hands them their [`DetectionSink`].
    pub fn new(
        driver: impl ChannelDriver + 'static,
        plugin_name: impl Into<String>,
        config: ReaderConfig,
    ) -> Result<Self, ReaderError> {
        Self::from_boxed(Box::new(driver), plugin_name, config)
    }

    /// Same as [`Self::new`], for a driver already boxed
    pub fn from_boxed(
        mut driver: Box<dyn ChannelDriver>,
        plugin_name: impl Into<String>,
        config: ReaderConfig,
    ) -> Result<Self, ReaderError> {
        let name = driver.name().to_string();
        let plugin_name = plugin_name.into();
        let capabilities = driver.detection_capabilities();
        let contactless = driver.is_contactless();
        let lane = ExecutorLane::spawn(format!("cardlane-monitor-{name}"))?;

        let shared = Arc::new_cyclic(|self_ref: &Weak<ReaderShared>| {
            if capabilities.is_autonomous() {
                driver.connect_detection(DetectionSink {
                    shared: self_ref.clone(),
                });
            }
            ReaderShared {
                observation: ObservationManager::new(&plugin_name, &name),
                core: ReentrantMutex::new(RefCell::new(ReaderCore {
                    machine: DetectionStateMachine::new(),
                    session: Session {
                        driver,
                        channel: ChannelState::default(),
                        scenario: None,
                        notification_mode: NotificationMode::default(),
                        detection_mode: DetectionMode::default(),
                    },
                })),
                name,
                plugin_name,
                config,
                contactless,
                capabilities,
                lane,
                registered: AtomicBool::new(true),
                deferred: Mutex::new(VecDeque::new()),
                self_ref: self_ref.clone(),
            }
        });

        debug!(
            reader = %shared.name,
            plugin = %shared.plugin_name,
            autonomous = shared.capabilities.is_autonomous(),
            "Observable reader created"
        );
        Ok(Self { shared })
    }

    /// Reader name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Name of the plugin owning the reader
    pub fn plugin_name(&self) -> &str {
        &self.shared.plugin_name
    }

    /// Whether the reader talks to contactless cards
    pub fn is_contactless(&self) -> bool {
        self.shared.contactless
    }

    /// Whether [`Self::unregister`] has not been called yet
    pub fn is_registered(&self) -> bool {
        self.shared.is_registered()
    }

    /// Check whether a card is on the reader
    ///
    /// A card found missing while a channel is still open goes through the removal
    /// sequence: channels are closed and `CARD_REMOVED` is notified.
    pub fn is_card_present(&self) -> Result<bool, ReaderError> {
        let shared = &*self.shared;
        shared.check_registered()?;
        shared.run_locked(|core, effects| {
            let session = &mut core.session;
            let present = check_presence(session.driver.as_mut())?;
            if !present
                && (session.channel.is_logical_channel_open()
                    || session.driver.is_physical_channel_open())
            {
                ReaderContext {
                    shared,
                    session,
                    effects,
                }
                .process_card_removed();
            }
            Ok(present)
        })
    }

    /// Start watching for cards
    pub fn start_card_detection(&self, mode: DetectionMode) -> Result<(), ReaderError> {
        self.shared.check_registered()?;
        debug!(reader = %self.shared.name, %mode, "Starting card detection");
        self.shared.run_locked(|core, effects| {
            core.session.detection_mode = mode;
            self.shared
                .on_event(core, effects, InternalEvent::StartDetect);
            Ok(())
        })
    }

    /// Stop watching for cards; an inserted card goes through the removal sequence
    pub fn stop_card_detection(&self) {
        debug!(reader = %self.shared.name, "Stopping card detection");
        self.shared.process_event(InternalEvent::StopDetect, None);
    }

    /// Tell the reader the application is done with the card
    ///
    /// Required after every `CARD_INSERTED` or `CARD_MATCHED` event, including when the
    /// processing failed.
    pub fn finalize_card_processing(&self) {
        debug!(reader = %self.shared.name, "Card processing finalized");
        self.shared
            .process_event(InternalEvent::CardProcessed, None);
    }

    /// Current state of the detection state machine
    pub fn monitoring_state(&self) -> Result<MonitoringState, ReaderError> {
        self.shared
            .run_locked(|core, _| Ok(core.machine.state()))
    }

    /// Run `scenario` on every card insertion and attach its responses to the event
    pub fn schedule_card_selection_scenario(
        &self,
        scenario: CardSelectionScenario,
        notification_mode: NotificationMode,
    ) -> Result<(), ReaderError> {
        self.shared.check_registered()?;
        debug!(
            reader = %self.shared.name,
            requests = scenario.requests().len(),
            processing = %scenario.processing(),
            %notification_mode,
            "Card selection scenario scheduled"
        );
        self.shared.run_locked(|core, _| {
            core.session.scenario = Some(scenario);
            core.session.notification_mode = notification_mode;
            Ok(())
        })
    }

    /// Transmit APDUs on the current channel
    pub fn transmit_card_request(
        &self,
        request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse, ReaderError> {
        let shared = &*self.shared;
        shared.check_registered()?;
        shared.run_locked(|core, effects| {
            core.session.with_engine(shared, effects, |engine| {
                engine.transmit_card_request(request, channel_control)
            })
        })
    }

    /// Run selection requests, opening the physical channel if needed
    pub fn transmit_card_selection_requests(
        &self,
        requests: &[CardSelectionRequest],
        processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
    ) -> Result<Vec<CardSelectionResponse>, ReaderError> {
        let shared = &*self.shared;
        shared.check_registered()?;
        shared.run_locked(|core, effects| {
            core.session.with_engine(shared, effects, |engine| {
                engine.transmit_card_selection_requests(requests, processing, channel_control)
            })
        })
    }

    /// Close the logical and physical channels
    pub fn release_channel(&self) -> Result<(), ReaderError> {
        let shared = &*self.shared;
        shared.check_registered()?;
        shared.run_locked(|core, effects| {
            core.session
                .with_engine(shared, effects, |engine| engine.release_channel())
        })
    }

    /// Enable a reader protocol and associate it with an application protocol
    pub fn activate_protocol(
        &self,
        reader_protocol: &str,
        application_protocol: &str,
    ) -> Result<(), ReaderError> {
        self.shared.check_registered()?;
        if reader_protocol.is_empty() || application_protocol.is_empty() {
            return Err(ReaderError::InvalidArgument(
                "protocol names must not be empty".to_string(),
            ));
        }
        self.shared.run_locked(|core, _| {
            let session = &mut core.session;
            let protocols = session
                .driver
                .configurable_protocols()
                .filter(|protocols| protocols.is_protocol_supported(reader_protocol))
                .ok_or_else(|| ReaderError::ProtocolNotSupported(reader_protocol.to_string()))?;
            protocols.activate_protocol(reader_protocol).map_err(|err| {
                ReaderError::communication(
                    err,
                    format!("Failure while activating protocol {reader_protocol}"),
                    None,
                )
            })?;
            session
                .channel
                .associate_protocol(reader_protocol, application_protocol);
            debug!(
                reader = %self.shared.name,
                reader_protocol,
                application_protocol,
                "Protocol activated"
            );
            Ok(())
        })
    }

    /// Disable a reader protocol and drop its association
    pub fn deactivate_protocol(&self, reader_protocol: &str) -> Result<(), ReaderError> {
        self.shared.check_registered()?;
        if reader_protocol.is_empty() {
            return Err(ReaderError::InvalidArgument(
                "protocol name must not be empty".to_string(),
            ));
        }
        self.shared.run_locked(|core, _| {
            let session = &mut core.session;
            session.channel.dissociate_protocol(reader_protocol);
            let protocols = session
                .driver
                .configurable_protocols()
                .filter(|protocols| protocols.is_protocol_supported(reader_protocol))
                .ok_or_else(|| ReaderError::ProtocolNotSupported(reader_protocol.to_string()))?;
            protocols.deactivate_protocol(reader_protocol).map_err(|err| {
                ReaderError::communication(
                    err,
                    format!("Failure while deactivating protocol {reader_protocol}"),
                    None,
                )
            })
        })
    }

    /// Reader protocol of the connected card, when an association matched it
    pub fn current_physical_protocol(&self) -> Result<Option<String>, ReaderError> {
        self.shared.run_locked(|core, _| {
            Ok(core
                .session
                .channel
                .current_physical_protocol()
                .map(str::to_string))
        })
    }

    /// Register an observer; an exception handler must be set first
    pub fn add_observer(&self, observer: Arc<dyn ReaderObserver>) -> Result<(), ReaderError> {
        self.shared.check_registered()?;
        self.shared.observation.add_observer(observer)
    }

    /// Unregister an observer previously added with the same `Arc`
    pub fn remove_observer(&self, observer: &Arc<dyn ReaderObserver>) {
        self.shared.observation.remove_observer(observer);
    }

    /// Unregister every observer
    pub fn clear_observers(&self) {
        self.shared.observation.clear_observers();
    }

    /// Number of registered observers
    pub fn count_observers(&self) -> usize {
        self.shared.observation.count_observers()
    }

    /// Set the handler receiving background faults
    pub fn set_observation_exception_handler(
        &self,
        handler: Arc<dyn ObservationExceptionHandler>,
    ) -> Result<(), ReaderError> {
        self.shared.check_registered()?;
        self.shared.observation.set_exception_handler(handler);
        Ok(())
    }

    /// Set where observer notifications run; inline by default
    pub fn set_notification_executor(&self, executor: Arc<dyn NotificationExecutor>) {
        self.shared.observation.set_executor(executor);
    }

    /// Tear the reader down
    ///
    /// Stops detection, notifies `UNREGISTERED`, drops the observers and closes the
    /// channel. Later calls to the reader fail with [`ReaderError::Unregistered`].
    pub fn unregister(&self) {
        let shared = &*self.shared;
        let _guard = shared.core.lock();
        if !shared.is_registered() {
            return;
        }

        shared.process_event(InternalEvent::StopDetect, None);
        shared.lane.shutdown();
        shared
            .observation
            .notify(shared.event(ReaderEventKind::Unregistered, None));
        shared.observation.clear_observers();

        let closed = shared.try_run_locked(|core, _| {
            if let Err(err) = core.session.driver.close_physical_channel() {
                error!(reader = %shared.name, error = %err, "Failed to close the physical channel");
            }
            core.session.channel.mark_logical_channel_closed();
            core.session.driver.on_unregister();
            core.machine.stop_job();
        });
        if closed.is_none() {
            warn!(reader = %shared.name, "Reader unregistered from inside a driver call");
        }

        shared.registered.store(false, Ordering::SeqCst);
        info!(reader = %shared.name, plugin = %shared.plugin_name, "Reader unregistered");
    }
}

/// Entry point of a driver that detects cards by itself
///
/// Handed over once through [`ChannelDriver::connect_detection`]. Events pushed after the
/// reader is gone or unregistered are ignored.
#[derive(Debug, Clone)]
pub struct DetectionSink {
    shared: Weak<ReaderShared>,
}

impl DetectionSink {
    /// A card showed up
    pub fn card_inserted(&self) {
        self.push(InternalEvent::CardInserted);
    }

    /// The card left
    pub fn card_removed(&self) {
        self.push(InternalEvent::CardRemoved);
    }

    fn push(&self, event: InternalEvent) {
        let Some(shared) = self.shared.upgrade() else {
            trace!(%event, "Detection event for a dropped reader");
            return;
        };
        if !shared.is_registered() {
            trace!(reader = %shared.name, %event, "Detection event for an unregistered reader");
            return;
        }
        shared.process_event(event, None);
    }
}

/// Notification or fault raised while the reader state is borrowed
enum Effect {
    Notify(ReaderEvent),
    Fault(ObservationError),
}

/// Work postponed until the core can be borrowed again
enum Deferred {
    Event(InternalEvent, Option<u64>),
    JobFault(u64, ObservationError),
}

/// State guarded by the per-reader lock
struct ReaderCore {
    machine: DetectionStateMachine,
    session: Session,
}

/// Driver and channel state, everything the state machine acts upon
struct Session {
    driver: Box<dyn ChannelDriver>,
    channel: ChannelState,
    scenario: Option<CardSelectionScenario>,
    notification_mode: NotificationMode,
    detection_mode: DetectionMode,
}

impl Session {
    /// Run `f` on a selection engine; swallowed close failures become faults
    fn with_engine<R>(
        &mut self,
        shared: &ReaderShared,
        effects: &mut Vec<Effect>,
        f: impl FnOnce(&mut SelectionEngine<'_>) -> R,
    ) -> R {
        let mut engine = SelectionEngine::new(
            &shared.name,
            self.driver.as_mut(),
            &mut self.channel,
            shared.config.max_response_chain(),
        );
        let result = f(&mut engine);
        effects.extend(
            engine
                .take_close_failures()
                .into_iter()
                .map(|failure| Effect::Fault(ObservationError::ChannelClose(failure))),
        );
        result
    }
}

struct ReaderShared {
    name: String,
    plugin_name: String,
    config: ReaderConfig,
    contactless: bool,
    capabilities: DetectionCapabilities,
    core: ReentrantMutex<RefCell<ReaderCore>>,
    observation: ObservationManager,
    lane: ExecutorLane,
    registered: AtomicBool,
    /// Detection events and job faults raised while the core was borrowed
    deferred: Mutex<VecDeque<Deferred>>,
    self_ref: Weak<Self>,
}

impl ReaderShared {
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn check_registered(&self) -> Result<(), ReaderError> {
        if self.is_registered() {
            Ok(())
        } else {
            Err(ReaderError::Unregistered(self.name.clone()))
        }
    }

    fn event(
        &self,
        kind: ReaderEventKind,
        selection_responses: Option<Vec<CardSelectionResponse>>,
    ) -> ReaderEvent {
        ReaderEvent::new(&self.plugin_name, &self.name, kind, selection_responses)
    }

    /// Run `f` under the reader lock; `None` if the core is already borrowed by this thread
    fn try_run_locked<R>(&self, f: impl FnOnce(&mut ReaderCore, &mut Vec<Effect>) -> R) -> Option<R> {
        let guard = self.core.lock();
        let mut effects = Vec::new();
        let result = {
            let mut core = guard.try_borrow_mut().ok()?;
            f(&mut core, &mut effects)
        };
        self.dispatch(effects);
        self.drain_deferred();
        Some(result)
    }

    fn run_locked<R>(
        &self,
        f: impl FnOnce(&mut ReaderCore, &mut Vec<Effect>) -> Result<R, ReaderError>,
    ) -> Result<R, ReaderError> {
        self.try_run_locked(f)
            .unwrap_or_else(|| Err(ReaderError::Reentrant(self.name.clone())))
    }

    /// Feed an event to the state machine; events of a stopped job are dropped
    fn process_event(&self, event: InternalEvent, generation: Option<u64>) {
        let handled = self.try_run_locked(|core, effects| {
            if let Some(generation) = generation
                && generation != core.machine.generation()
            {
                trace!(reader = %self.name, %event, "Event from a stopped job dropped");
                return;
            }
            self.on_event(core, effects, event);
        });
        if handled.is_none() {
            trace!(reader = %self.name, %event, "Reader busy in a driver call, event deferred");
            self.deferred.lock().push_back(Deferred::Event(event, generation));
        }
    }

    /// Report a job fault; detection stops when the job was the current one
    fn job_failed(&self, generation: u64, fault: ObservationError) {
        let mut fault = Some(fault);
        let handled = self.try_run_locked(|core, effects| {
            if generation == core.machine.generation() {
                warn!(reader = %self.name, "Monitoring job failed, detection stopped");
                let ReaderCore { machine, session } = core;
                machine.on_job_fault(&mut ReaderContext {
                    shared: self,
                    session,
                    effects,
                });
            }
            // Dispatched after the switch, so the handler may restart detection
            effects.extend(fault.take().map(Effect::Fault));
        });
        if handled.is_none()
            && let Some(fault) = fault
        {
            self.deferred
                .lock()
                .push_back(Deferred::JobFault(generation, fault));
        }
    }

    fn on_event(&self, core: &mut ReaderCore, effects: &mut Vec<Effect>, event: InternalEvent) {
        let ReaderCore { machine, session } = core;
        machine.on_event(
            event,
            &mut ReaderContext {
                shared: self,
                session,
                effects,
            },
        );
    }

    fn drain_deferred(&self) {
        loop {
            let next = self.deferred.lock().pop_front();
            match next {
                Some(Deferred::Event(event, generation)) => self.process_event(event, generation),
                Some(Deferred::JobFault(generation, fault)) => self.job_failed(generation, fault),
                None => break,
            }
        }
    }

    fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify(event) => self.observation.notify(event),
                Effect::Fault(fault) => self.observation.report(&fault),
            }
        }
    }

    fn probe(&self) -> ReaderProbe {
        ReaderProbe {
            shared: self.self_ref.clone(),
            name: self.name.clone(),
        }
    }
}

impl Drop for ReaderShared {
    fn drop(&mut self) {
        self.core.get_mut().get_mut().machine.stop_job();
        self.lane.shutdown();
    }
}

/// What the state machine sees of the reader while the lock is held
struct ReaderContext<'a> {
    shared: &'a ReaderShared,
    session: &'a mut Session,
    effects: &'a mut Vec<Effect>,
}

impl ReaderContext<'_> {
    fn close_channels_silently(&mut self) {
        self.session.with_engine(self.shared, self.effects, |engine| {
            engine.close_channels_silently();
        });
    }
}

impl MachineContext for ReaderContext<'_> {
    fn detection_mode(&self) -> DetectionMode {
        self.session.detection_mode
    }

    fn process_card_inserted(&mut self) -> Option<ReaderEvent> {
        let Some(scenario) = self.session.scenario.clone() else {
            return Some(self.shared.event(ReaderEventKind::CardInserted, None));
        };
        let shared = self.shared;
        let reader = &shared.name;

        let outcome = self.session.with_engine(self.shared, self.effects, |engine| {
            engine.transmit_card_selection_requests(
                scenario.requests(),
                scenario.processing(),
                scenario.channel_control(),
            )
        });

        match outcome {
            Ok(responses) if responses.iter().any(CardSelectionResponse::has_matched) => {
                trace!(reader = %reader, "A scheduled selection matched");
                return Some(
                    self.shared
                        .event(ReaderEventKind::CardMatched, Some(responses)),
                );
            }
            Ok(responses) if self.session.notification_mode == NotificationMode::Always => {
                trace!(
                    reader = %reader,
                    selections = responses.len(),
                    "No scheduled selection matched"
                );
                return Some(
                    self.shared
                        .event(ReaderEventKind::CardInserted, Some(responses)),
                );
            }
            Ok(_) => {
                trace!(reader = %reader, "No scheduled selection matched, insertion not notified");
            }
            Err(err) if err.is_card_failure() => {
                // The card left or answered garbage: nothing to report
                self.close_channels_silently();
                debug!(reader = %reader, error = %err, "Card failure during the selection scenario");
            }
            Err(err) => self.effects.push(Effect::Fault(err.into())),
        }

        // The channel may have been opened for a card the scenario rejected
        let released = self
            .session
            .with_engine(self.shared, self.effects, |engine| engine.release_channel());
        if let Err(err) = released {
            self.effects.push(Effect::Fault(err.into()));
        }
        None
    }

    fn process_card_removed(&mut self) {
        self.close_channels_silently();
        self.effects.push(Effect::Notify(
            self.shared.event(ReaderEventKind::CardRemoved, None),
        ));
    }

    fn close_channels(&mut self) {
        self.close_channels_silently();
    }

    fn notify(&mut self, event: ReaderEvent) {
        self.effects.push(Effect::Notify(event));
    }

    fn on_start_detection(&mut self) {
        self.session.driver.on_start_detection();
    }

    fn on_stop_detection(&mut self) {
        self.session.driver.on_stop_detection();
    }

    fn start_job(
        &mut self,
        state: MonitoringState,
        generation: u64,
    ) -> Option<Arc<dyn MonitoringJob>> {
        let shared = self.shared;
        let capabilities = &shared.capabilities;
        let config = &shared.config;

        let job: Arc<dyn MonitoringJob> = match state {
            MonitoringState::WaitForStartDetection => return None,
            MonitoringState::WaitForCardInsertion => match &capabilities.insertion {
                InsertionDetection::Autonomous => return None,
                InsertionDetection::Polling => Arc::new(ActivePollJob::new(
                    PollTarget::Insertion,
                    shared.probe(),
                    config.insertion_poll_interval(),
                )),
                InsertionDetection::Blocking(waiter) => {
                    Arc::new(PassiveWaitJob::insertion(Arc::clone(waiter)))
                }
            },
            MonitoringState::WaitForCardProcessing => {
                let waiter = capabilities.removal_during_processing.as_ref()?;
                Arc::new(PassiveWaitJob::removal(Arc::clone(waiter)))
            }
            MonitoringState::WaitForCardRemoval => match &capabilities.removal {
                RemovalDetection::Autonomous => return None,
                RemovalDetection::Polling => Arc::new(ActivePollJob::new(
                    PollTarget::Removal,
                    shared.probe(),
                    config.removal_poll_interval(),
                )),
                RemovalDetection::Blocking(waiter) => {
                    Arc::new(PassiveWaitJob::removal(Arc::clone(waiter)))
                }
            },
        };

        let emitter = JobEmitter {
            shared: shared.self_ref.clone(),
            generation,
        };
        let task = Arc::clone(&job);
        if shared
            .lane
            .submit(move || run_job(task.as_ref(), &emitter))
        {
            trace!(reader = %shared.name, %state, generation, "Monitoring job started");
        } else {
            warn!(reader = %shared.name, %state, "Executor lane is shut down, monitoring job not started");
        }
        Some(job)
    }
}

/// Run a job on the lane; whatever goes wrong ends up with the exception handler
fn run_job(job: &dyn MonitoringJob, emitter: &JobEmitter) {
    let fault = match panic::catch_unwind(AssertUnwindSafe(|| job.run(emitter))) {
        Ok(Ok(())) => return,
        Ok(Err(err)) => ObservationError::Communication(err),
        Err(payload) => ObservationError::JobPanicked(panic_message(payload.as_ref())),
    };
    emitter.fault(fault);
}

/// Routes the events of one job, tagged with the generation it was started for
struct JobEmitter {
    shared: Weak<ReaderShared>,
    generation: u64,
}

impl JobEmitter {
    fn fault(&self, fault: ObservationError) {
        match self.shared.upgrade() {
            Some(shared) => shared.job_failed(self.generation, fault),
            None => trace!(error = %fault, "Job fault for a dropped reader"),
        }
    }
}

impl JobEvents for JobEmitter {
    fn emit(&self, event: InternalEvent) {
        if let Some(shared) = self.shared.upgrade() {
            shared.process_event(event, Some(self.generation));
        }
    }
}

/// Presence checks run by polling jobs, each under the reader lock
struct ReaderProbe {
    shared: Weak<ReaderShared>,
    name: String,
}

impl ReaderProbe {
    fn with_driver<R>(
        &self,
        f: impl FnOnce(&mut dyn ChannelDriver) -> Result<R, ReaderError>,
    ) -> Result<R, ReaderError> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| ReaderError::Unregistered(self.name.clone()))?;
        shared.run_locked(|core, _| f(core.session.driver.as_mut()))
    }
}

impl PresenceProbe for ReaderProbe {
    fn is_card_present(&self) -> Result<bool, ReaderError> {
        self.with_driver(check_presence)
    }

    fn ping(&self) -> Result<bool, ReaderError> {
        self.with_driver(|driver| {
            if !driver.is_physical_channel_open() {
                return check_presence(driver);
            }
            let ping = Command::presence_ping().to_bytes()?;
            match driver.transmit_apdu(&ping) {
                Ok(_) => Ok(true),
                Err(DriverError::CardIo(_)) => Ok(false),
                Err(err) => Err(ReaderError::communication(
                    err,
                    "Failure while pinging the card",
                    None,
                )),
            }
        })
    }
}

/// Driver presence check; a card-level failure means no usable card
fn check_presence(driver: &mut dyn ChannelDriver) -> Result<bool, ReaderError> {
    match driver.check_card_presence() {
        Ok(present) => Ok(present),
        Err(DriverError::CardIo(_)) => Ok(false),
        Err(err) => Err(ReaderError::communication(
            err,
            "Failure while checking the card presence",
            None,
        )),
    }
}
