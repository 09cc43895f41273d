//! Reader configuration and detection policies

use std::time::Duration;

use cardlane_core::CardSelectionRequest;
use derive_more::Display;

use crate::ReaderError;

/// Default pause between two presence probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default bound on chained GET RESPONSE / Le replays for one APDU
pub const DEFAULT_MAX_RESPONSE_CHAIN: usize = 10;

/// Tuning knobs of an observable reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    insertion_poll_interval: Duration,
    removal_poll_interval: Duration,
    max_response_chain: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderConfig {
    /// Create a configuration with default values
    pub const fn new() -> Self {
        Self {
            insertion_poll_interval: DEFAULT_POLL_INTERVAL,
            removal_poll_interval: DEFAULT_POLL_INTERVAL,
            max_response_chain: DEFAULT_MAX_RESPONSE_CHAIN,
        }
    }

    /// Set the pause between insertion probes
    pub const fn with_insertion_poll_interval(mut self, interval: Duration) -> Self {
        self.insertion_poll_interval = interval;
        self
    }

    /// Set the pause between removal probes
    pub const fn with_removal_poll_interval(mut self, interval: Duration) -> Self {
        self.removal_poll_interval = interval;
        self
    }

    /// Set how many automatic follow-up commands one APDU may trigger
    pub const fn with_max_response_chain(mut self, max: usize) -> Self {
        self.max_response_chain = max;
        self
    }

    /// Pause between insertion probes
    pub const fn insertion_poll_interval(&self) -> Duration {
        self.insertion_poll_interval
    }

    /// Pause between removal probes
    pub const fn removal_poll_interval(&self) -> Duration {
        self.removal_poll_interval
    }

    /// Bound on automatic follow-up commands
    pub const fn max_response_chain(&self) -> usize {
        self.max_response_chain
    }
}

/// What happens after a card has been processed and removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display)]
pub enum DetectionMode {
    /// Go back to waiting for the next card
    #[default]
    #[display("REPEATING")]
    Repeating,
    /// Stop detection after one card
    #[display("SINGLESHOT")]
    SingleShot,
}

/// Which insertions reach the observers when a selection scenario is scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display)]
pub enum NotificationMode {
    /// Every insertion, matched or not
    #[default]
    #[display("ALWAYS")]
    Always,
    /// Only insertions where a selector matched
    #[display("MATCHED_ONLY")]
    MatchedOnly,
}

/// How a list of selection requests is processed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display)]
pub enum MultiSelectionProcessing {
    /// Stop at the first selector that matches
    #[default]
    #[display("FIRST_MATCH")]
    FirstMatch,
    /// Run every selector, closing the logical channel in between
    #[display("PROCESS_ALL")]
    ProcessAll,
}

/// Whether the physical channel survives an exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display)]
pub enum ChannelControl {
    /// Leave the channel open
    #[default]
    #[display("KEEP_OPEN")]
    KeepOpen,
    /// Release the channel once the exchange is over
    #[display("CLOSE_AFTER")]
    CloseAfter,
}

/// Selection requests run automatically on every card insertion
#[derive(Debug, Clone)]
pub struct CardSelectionScenario {
    requests: Vec<CardSelectionRequest>,
    processing: MultiSelectionProcessing,
    channel_control: ChannelControl,
}

impl CardSelectionScenario {
    /// Create a scenario; at least one request is required
    pub fn new(
        requests: Vec<CardSelectionRequest>,
        processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
    ) -> Result<Self, ReaderError> {
        if requests.is_empty() {
            return Err(ReaderError::InvalidArgument(
                "a card selection scenario needs at least one selection request".to_string(),
            ));
        }
        Ok(Self {
            requests,
            processing,
            channel_control,
        })
    }

    /// Selection requests, in order
    pub fn requests(&self) -> &[CardSelectionRequest] {
        &self.requests
    }

    /// Multi-selection policy
    pub const fn processing(&self) -> MultiSelectionProcessing {
        self.processing
    }

    /// Channel policy
    pub const fn channel_control(&self) -> ChannelControl {
        self.channel_control
    }
}
