//! PC/SC channel driver for observable readers
//!
//! [`PcscDriver`] implements [`ChannelDriver`](cardlane_reader::ChannelDriver) over one PC/SC
//! reader. Card detection blocks in `SCardGetStatusChange` on a context owned by the
//! detection waiters, so stopping detection never disturbs an exchange in progress.
//!
//! # Examples
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use cardlane_core::{ApduRequest, CardRequest, CardSelectionRequest, CardSelector};
//! use cardlane_pcsc::{ConnectStrategy, PcscDeviceManager};
//! use cardlane_reader::{ChannelControl, MultiSelectionProcessing, ReaderConfig};
//!
//! let manager = PcscDeviceManager::new()?;
//! let name = manager.find_reader(&ConnectStrategy::AnyCard)?;
//! let reader = manager.open_reader(&name, ReaderConfig::default())?;
//!
//! let selector = CardSelector::new().filter_by_aid_hex("A000000003000000")?;
//! let request = CardSelectionRequest::new(selector).with_card_request(CardRequest::new(vec![
//!     ApduRequest::new(hex::decode("80CA9F7F00")?),
//! ]));
//! let responses = reader.transmit_card_selection_requests(
//!     &[request],
//!     MultiSelectionProcessing::FirstMatch,
//!     ChannelControl::CloseAfter,
//! )?;
//! println!("matched: {}", responses[0].has_matched());
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod driver;
mod error;
mod manager;
mod reader;
mod wait;

pub use config::{
    ConnectStrategy, DEFAULT_CONTACTLESS_PATTERN, DEFAULT_STATUS_CHANGE_SLICE, PcscConfig,
    ShareMode,
};
pub use driver::PcscDriver;
pub use error::PcscError;
pub use manager::{PLUGIN_NAME, PcscDeviceManager};
pub use reader::PcscReader;

// Re-export some pcsc types for convenience
pub use pcsc::{Protocol, Protocols};
