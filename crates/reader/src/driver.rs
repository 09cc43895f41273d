//! Channel driver interface
//!
//! A [`ChannelDriver`] is the only thing a reader backend has to provide. The observable
//! reader owns it and calls it while holding the per-reader lock, so implementations do not
//! need any internal synchronisation for the channel itself.
//!
//! Optional capabilities are exposed through accessor methods returning `Option`, and the
//! way a driver detects cards is declared once through [`DetectionCapabilities`].

use std::{fmt, sync::Arc};

use bytes::Bytes;

use crate::{DetectionSink, DriverError};

/// Physical and logical channel primitives of one reader
pub trait ChannelDriver: Send + fmt::Debug {
    /// Reader name, unique within its plugin
    fn name(&self) -> &str;

    /// Connect to the card
    fn open_physical_channel(&mut self) -> Result<(), DriverError>;

    /// Disconnect from the card
    fn close_physical_channel(&mut self) -> Result<(), DriverError>;

    /// Whether a card connection is established
    fn is_physical_channel_open(&self) -> bool;

    /// Lightweight presence check, no APDU involved
    fn check_card_presence(&mut self) -> Result<bool, DriverError>;

    /// Power-on data (ATR) of the connected card, empty when unknown
    fn power_on_data(&self) -> Bytes;

    /// Send raw APDU bytes and return the raw answer, status word included
    fn transmit_apdu(&mut self, apdu: &[u8]) -> Result<Bytes, DriverError>;

    /// Whether the reader talks to contactless cards
    fn is_contactless(&self) -> bool;

    /// Called when card detection starts
    fn on_start_detection(&mut self) {}

    /// Called whenever the reader goes back to waiting for detection to start
    fn on_stop_detection(&mut self) {}

    /// Called once, when the reader is unregistered
    fn on_unregister(&mut self) {}

    /// How this driver detects insertion and removal
    ///
    /// Queried once, when the observable reader is built.
    fn detection_capabilities(&self) -> DetectionCapabilities {
        DetectionCapabilities::default()
    }

    /// Hand over the sink an autonomous driver pushes detection events into
    fn connect_detection(&mut self, _sink: DetectionSink) {}

    /// Protocol activation, for drivers that support it
    fn configurable_protocols(&mut self) -> Option<&mut dyn ConfigurableProtocols> {
        None
    }

    /// On-board application selection, for drivers that support it
    fn autonomous_selection(&mut self) -> Option<&mut dyn AutonomousSelection> {
        None
    }
}

/// Reader protocols that can be switched on and off
pub trait ConfigurableProtocols {
    /// Whether the driver knows this reader protocol
    fn is_protocol_supported(&self, reader_protocol: &str) -> bool;

    /// Enable a reader protocol
    fn activate_protocol(&mut self, reader_protocol: &str) -> Result<(), DriverError>;

    /// Disable a reader protocol
    fn deactivate_protocol(&mut self, reader_protocol: &str) -> Result<(), DriverError>;

    /// Whether the connected card uses this reader protocol
    fn is_current_protocol(&self, reader_protocol: &str) -> bool;
}

/// Application selection performed by the reader itself
pub trait AutonomousSelection {
    /// Select the application and open a logical channel, returning the selection answer
    fn open_channel_for_aid(&mut self, aid: &[u8], p2: u8) -> Result<Bytes, DriverError>;

    /// Close the logical channel opened by [`Self::open_channel_for_aid`]
    fn close_logical_channel(&mut self);
}

/// Blocking wait for a card insertion
///
/// The waiter is shared between the monitoring thread, which waits, and the thread holding
/// the reader lock, which may stop the wait at any time.
pub trait CardInsertionWaiter: Send + Sync + fmt::Debug {
    /// Block until a card is inserted
    ///
    /// Returns [`DriverError::Cancelled`] when interrupted by
    /// [`Self::stop_wait_for_card_insertion`]. A stop that arrives once the wait has returned is
    /// kept for the next wait; callers that did not ask for it wait again.
    fn wait_for_card_insertion(&self) -> Result<(), DriverError>;

    /// Interrupt the wait in progress, or the next one if it has not started yet
    fn stop_wait_for_card_insertion(&self);
}

/// Blocking wait for a card removal
pub trait CardRemovalWaiter: Send + Sync + fmt::Debug {
    /// Block until the card is removed
    ///
    /// Returns [`DriverError::Cancelled`] when interrupted by
    /// [`Self::stop_wait_for_card_removal`]. A stop that arrives once the wait has returned is
    /// kept for the next wait; callers that did not ask for it wait again.
    fn wait_for_card_removal(&self) -> Result<(), DriverError>;

    /// Interrupt the wait in progress, or the next one if it has not started yet
    fn stop_wait_for_card_removal(&self);
}

/// How card insertion is detected
#[derive(Debug, Clone, Default)]
pub enum InsertionDetection {
    /// The driver pushes insertions through its [`DetectionSink`]
    Autonomous,
    /// The reader probes presence periodically
    #[default]
    Polling,
    /// The reader blocks in the driver until a card shows up
    Blocking(Arc<dyn CardInsertionWaiter>),
}

/// How card removal is detected once processing is over
#[derive(Debug, Clone, Default)]
pub enum RemovalDetection {
    /// The driver pushes removals through its [`DetectionSink`]
    Autonomous,
    /// The reader pings the card periodically
    #[default]
    Polling,
    /// The reader blocks in the driver until the card leaves
    Blocking(Arc<dyn CardRemovalWaiter>),
}

/// Detection strategies declared by a driver
#[derive(Debug, Clone, Default)]
pub struct DetectionCapabilities {
    /// Insertion strategy
    pub insertion: InsertionDetection,
    /// Removal strategy
    pub removal: RemovalDetection,
    /// Removal watch while the application still uses the card; none when unsupported
    pub removal_during_processing: Option<Arc<dyn CardRemovalWaiter>>,
}

impl DetectionCapabilities {
    /// Whether the driver needs a detection sink
    pub const fn is_autonomous(&self) -> bool {
        matches!(self.insertion, InsertionDetection::Autonomous)
            || matches!(self.removal, RemovalDetection::Autonomous)
    }
}
