//! Error type for frame construction and parsing
//!
//! Every constructor in this crate that validates its input reports failures through
//! [`Error`]. I/O failures never surface here; they belong to the reader layer.

/// Core error type for building and parsing frames
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    //
    // Response related errors
    //
    /// A response must carry at least the two status word bytes
    #[error("Incomplete response: {0} byte(s), a status word needs 2")]
    IncompleteResponse(usize),

    //
    // Command related errors
    //
    /// Invalid command length
    #[error("Invalid command length: {0}")]
    InvalidCommandLength(usize),

    /// Command data does not fit a short APDU
    #[error("Command data too long: {0} bytes")]
    DataTooLong(usize),

    //
    // Selector related errors
    //
    /// AID length outside the ISO/IEC 7816-4 range
    #[error("Invalid AID length: {0} bytes, expected 5 to 16")]
    InvalidAidLength(usize),

    /// Power-on data filter is not a valid regular expression
    #[error("Invalid power-on data regex {pattern:?}: {reason}")]
    InvalidRegex {
        /// Offending pattern
        pattern: String,
        /// Compiler message
        reason: String,
    },

    /// Empty protocol name
    #[error("Protocol name must not be empty")]
    EmptyProtocolName,

    //
    // General errors
    //
    /// Invalid hexadecimal input
    #[error("Invalid hex string: {0}")]
    InvalidHex(String),
}

impl Error {
    /// Create an invalid hex error from a decoding failure
    pub fn invalid_hex(source: hex::FromHexError) -> Self {
        Self::InvalidHex(source.to_string())
    }
}

/// Result type for frame operations
pub type Result<T> = std::result::Result<T, Error>;
