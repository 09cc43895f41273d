//! Reader events and monitoring states

use cardlane_core::CardSelectionResponse;
use derive_more::Display;

/// Kind of event delivered to reader observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ReaderEventKind {
    /// A card was inserted; selection responses are attached when a scenario ran
    #[display("CARD_INSERTED")]
    CardInserted,
    /// A card was inserted and matched a scheduled selector
    #[display("CARD_MATCHED")]
    CardMatched,
    /// The card was removed, or processing ended
    #[display("CARD_REMOVED")]
    CardRemoved,
    /// The reader is no longer available
    #[display("UNREGISTERED")]
    Unregistered,
}

/// Event delivered to reader observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderEvent {
    plugin_name: String,
    reader_name: String,
    kind: ReaderEventKind,
    selection_responses: Option<Vec<CardSelectionResponse>>,
}

impl ReaderEvent {
    /// Create an event
    pub fn new(
        plugin_name: impl Into<String>,
        reader_name: impl Into<String>,
        kind: ReaderEventKind,
        selection_responses: Option<Vec<CardSelectionResponse>>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            reader_name: reader_name.into(),
            kind,
            selection_responses,
        }
    }

    /// Plugin owning the reader
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Reader that raised the event
    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    /// Event kind
    pub const fn kind(&self) -> ReaderEventKind {
        self.kind
    }

    /// Responses of the scheduled selection scenario, if one ran
    pub fn selection_responses(&self) -> Option<&[CardSelectionResponse]> {
        self.selection_responses.as_deref()
    }
}

/// Event driving the detection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum InternalEvent {
    /// A card showed up
    #[display("CARD_INSERTED")]
    CardInserted,
    /// The card left
    #[display("CARD_REMOVED")]
    CardRemoved,
    /// The application is done with the card
    #[display("CARD_PROCESSED")]
    CardProcessed,
    /// Detection was requested
    #[display("START_DETECT")]
    StartDetect,
    /// Detection was cancelled
    #[display("STOP_DETECT")]
    StopDetect,
    /// A monitoring timeout elapsed
    #[display("TIME_OUT")]
    TimeOut,
}

/// State of the card detection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum MonitoringState {
    /// Idle, detection not started
    #[display("WAIT_FOR_START_DETECTION")]
    WaitForStartDetection,
    /// Watching for a card
    #[display("WAIT_FOR_CARD_INSERTION")]
    WaitForCardInsertion,
    /// A card was reported and the application is using it
    #[display("WAIT_FOR_CARD_PROCESSING")]
    WaitForCardProcessing,
    /// Waiting for the card to leave
    #[display("WAIT_FOR_CARD_REMOVAL")]
    WaitForCardRemoval,
}
