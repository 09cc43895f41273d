//! Configuration options for the PC/SC driver

use std::time::Duration;

use pcsc::{Protocols, ShareMode as PcscShareMode};

/// Reader names matching this pattern are reported as contactless
pub const DEFAULT_CONTACTLESS_PATTERN: &str = "(?i)(contactless|ctl|picc)";

/// Default length of one status-change wait before the stop flag is checked again
pub const DEFAULT_STATUS_CHANGE_SLICE: Duration = Duration::from_secs(1);

/// Sharing mode for card connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShareMode {
    /// Exclusive access to the card
    Exclusive,
    /// Shared access to the card (default)
    #[default]
    Shared,
    /// Direct connection to the reader
    Direct,
}

impl From<ShareMode> for PcscShareMode {
    fn from(mode: ShareMode) -> Self {
        match mode {
            ShareMode::Exclusive => Self::Exclusive,
            ShareMode::Shared => Self::Shared,
            ShareMode::Direct => Self::Direct,
        }
    }
}

/// Which reader a [`PcscDeviceManager`](crate::PcscDeviceManager) should pick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectStrategy {
    /// The reader with this exact name
    Reader(String),
    /// The first reader holding a card
    AnyCard,
    /// The first reader listed
    FirstAvailable,
}

/// Configuration options for the PC/SC driver
#[derive(Debug, Clone)]
pub struct PcscConfig {
    /// Sharing mode for card connections
    pub share_mode: ShareMode,

    /// Protocols offered when connecting, until protocols are activated explicitly
    pub protocols: Protocols,

    /// Reconnect once and retry when the card was reset by another application
    pub auto_reconnect: bool,

    /// Use blocking status-change waits for detection instead of polling
    pub blocking_detection: bool,

    /// Length of one blocking status-change call
    pub status_change_slice: Duration,

    /// Regex applied to the reader name to tell contactless readers apart
    pub contactless_pattern: String,
}

impl Default for PcscConfig {
    fn default() -> Self {
        Self {
            share_mode: ShareMode::Shared,
            protocols: Protocols::ANY,
            auto_reconnect: true,
            blocking_detection: true,
            status_change_slice: DEFAULT_STATUS_CHANGE_SLICE,
            contactless_pattern: DEFAULT_CONTACTLESS_PATTERN.to_string(),
        }
    }
}

impl PcscConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sharing mode
    pub const fn with_share_mode(mut self, mode: ShareMode) -> Self {
        self.share_mode = mode;
        self
    }

    /// Set the protocols offered when connecting
    pub const fn with_protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }

    /// Set whether to reconnect after a card reset
    pub const fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Set whether detection blocks in PC/SC or polls
    pub const fn with_blocking_detection(mut self, blocking: bool) -> Self {
        self.blocking_detection = blocking;
        self
    }

    /// Set the length of one blocking status-change call
    pub const fn with_status_change_slice(mut self, slice: Duration) -> Self {
        self.status_change_slice = slice;
        self
    }

    /// Set the contactless reader name pattern
    pub fn with_contactless_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.contactless_pattern = pattern.into();
        self
    }
}
