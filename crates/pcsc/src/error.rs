//! Error types for the PC/SC driver

use cardlane_reader::{DriverError, ReaderError};

/// PC/SC-specific errors
#[derive(Debug, thiserror::Error)]
pub enum PcscError {
    /// PC/SC error
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// No readers available
    #[error("No readers available")]
    NoReadersAvailable,

    /// Reader not found
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("No card present in reader: {0}")]
    NoCard(String),

    /// Reader name not representable as a C string
    #[error("Invalid reader name: {0}")]
    InvalidReaderName(String),

    /// Contactless pattern is not a valid regex
    #[error("Invalid contactless pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Building the observable reader failed
    #[error(transparent)]
    Reader(#[from] ReaderError),
}

impl PcscError {
    /// Whether the failure is about the card rather than the reader
    pub const fn is_card_failure(&self) -> bool {
        matches!(
            self,
            Self::NoCard(_)
                | Self::Pcsc(
                    pcsc::Error::NoSmartcard
                        | pcsc::Error::RemovedCard
                        | pcsc::Error::ResetCard
                        | pcsc::Error::UnpoweredCard
                        | pcsc::Error::UnresponsiveCard
                        | pcsc::Error::UnsupportedCard
                )
        )
    }
}

impl From<PcscError> for DriverError {
    fn from(err: PcscError) -> Self {
        if matches!(err, PcscError::Pcsc(pcsc::Error::Cancelled)) {
            Self::Cancelled
        } else if err.is_card_failure() {
            Self::CardIo(err.to_string())
        } else {
            Self::ReaderIo(err.to_string())
        }
    }
}
