//! Frame types for smart card readers
//!
//! This crate holds the data model shared by the reader layer and the drivers:
//!
//! - short APDU commands and responses (ISO/IEC 7816-4)
//! - requests grouping several APDUs, with their successful status words
//! - card selectors and selection outcomes
//!
//! Nothing here performs I/O. Validation happens at construction, so a value that
//! exists is well formed.
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub use bytes::Bytes;

pub mod command;
pub mod request;
pub mod response;
pub mod selection;
pub mod selector;
pub mod status;

mod error;
pub use error::{Error, Result};

pub use command::Command;
pub use request::{ApduRequest, CardRequest};
pub use response::{ApduResponse, CardResponse};
pub use selection::{CardSelectionRequest, CardSelectionResponse, SelectionStatus};
pub use selector::{CardSelector, FileControlInformation, FileOccurrence};
pub use status::StatusWord;

/// Prelude module containing commonly used types
pub mod prelude {
    pub use crate::{
        ApduRequest, ApduResponse, Bytes, CardRequest, CardResponse, CardSelectionRequest,
        CardSelectionResponse, CardSelector, Command, Error, FileControlInformation,
        FileOccurrence, Result, SelectionStatus, StatusWord,
    };
}
