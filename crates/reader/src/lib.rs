//! Observable smart card readers
//!
//! This crate turns a [`ChannelDriver`], the handful of channel primitives a reader backend
//! provides, into an [`ObservableReader`]:
//!
//! - a card detection state machine fed by monitoring jobs (polling or blocking waits) or by
//!   drivers detecting cards on their own
//! - a selection engine filtering cards by protocol, power-on data and AID
//! - APDU exchanges with automatic `61XX` / `6CXX` recovery
//! - observer notification with a fault handler for everything happening in the background
//!
//! ```
//! use std::sync::Arc;
//!
//! use cardlane_reader::{
//!     DetectionMode, ObservableReader, ObservationError, ReaderEventKind, mock::MockDriver,
//! };
//!
//! let driver = MockDriver::new("mock-0");
//! let handle = driver.clone();
//! let reader = ObservableReader::new(driver, "mock", Default::default()).unwrap();
//!
//! reader
//!     .set_observation_exception_handler(Arc::new(|_: &str, _: &str, _: &ObservationError| {}))
//!     .unwrap();
//! let (tx, rx) = crossbeam_channel::unbounded();
//! reader.add_observer(Arc::new(tx)).unwrap();
//! reader.start_card_detection(DetectionMode::Repeating).unwrap();
//!
//! handle.insert_card();
//! let event = rx.recv().unwrap();
//! assert_eq!(event.kind(), ReaderEventKind::CardInserted);
//! reader.finalize_card_processing();
//! # reader.stop_card_detection();
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

mod config;
mod driver;
mod engine;
mod error;
mod event;
pub mod job;
mod lane;
pub mod mock;
mod observation;
mod reader;
mod state;

pub use config::{
    CardSelectionScenario, ChannelControl, DEFAULT_MAX_RESPONSE_CHAIN, DEFAULT_POLL_INTERVAL,
    DetectionMode, MultiSelectionProcessing, NotificationMode, ReaderConfig,
};
pub use driver::{
    AutonomousSelection, CardInsertionWaiter, CardRemovalWaiter, ChannelDriver,
    ConfigurableProtocols, DetectionCapabilities, InsertionDetection, RemovalDetection,
};
pub use error::{DriverError, ObservationError, ReaderError};
pub use event::{InternalEvent, MonitoringState, ReaderEvent, ReaderEventKind};
pub use job::{JobEvents, MonitoringJob};
pub use lane::ExecutorLane;
pub use observation::{
    InlineExecutor, NotificationExecutor, ObservationExceptionHandler, ReaderObserver,
};
pub use reader::{DetectionSink, ObservableReader};

/// Prelude module containing commonly used types
pub mod prelude {
    pub use crate::{
        CardSelectionScenario, ChannelControl, ChannelDriver, DetectionMode, DriverError,
        MultiSelectionProcessing, NotificationMode, ObservableReader, ObservationError,
        ReaderConfig, ReaderError, ReaderEvent, ReaderEventKind, ReaderObserver,
    };
    pub use cardlane_core::prelude::*;
}
