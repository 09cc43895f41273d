//! Error types for reader operations
//!
//! Three layers:
//!
//! - [`DriverError`] is what a [`ChannelDriver`](crate::ChannelDriver) reports. It only
//!   distinguishes a broken reader from a card that stopped answering.
//! - [`ReaderError`] is returned by the synchronous reader API. Communication failures carry
//!   the responses collected before the failure.
//! - [`ObservationError`] is handed to the observation exception handler for faults raised
//!   on the monitoring thread, where nobody is there to receive a `Result`.

use cardlane_core::{CardResponse, StatusWord};
use tracing::Level;

/// Failure reported by a channel driver
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The reader or its transport failed
    #[error("Reader I/O error: {0}")]
    ReaderIo(String),

    /// The card stopped responding
    #[error("Card I/O error: {0}")]
    CardIo(String),

    /// A blocking wait was interrupted by its stop call
    #[error("Operation cancelled")]
    Cancelled,
}

/// Errors returned by reader operations
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    //
    // Communication errors
    //
    /// The reader failed during an exchange
    #[error("Reader communication error: {message}")]
    ReaderCommunication {
        /// Context of the failure
        message: String,
        /// Responses collected before the failure
        response: Option<CardResponse>,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// The card stopped responding during an exchange
    #[error("Card communication error: {message}")]
    CardCommunication {
        /// Context of the failure
        message: String,
        /// Responses collected before the failure
        response: Option<CardResponse>,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// A response carried a status word outside the successful set
    #[error("Unexpected status word {status} (all APDUs processed: {all_processed})")]
    UnexpectedStatusWord {
        /// Offending status word
        status: StatusWord,
        /// Responses collected up to and including the offending one
        response: CardResponse,
        /// Whether the offending response answered the last APDU of the request
        all_processed: bool,
    },

    //
    // Protocol errors
    //
    /// Selector and reader protocol configuration disagree
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The driver cannot handle the requested protocol
    #[error("Protocol not supported: {0}")]
    ProtocolNotSupported(String),

    //
    // Usage errors
    //
    /// The reader has been unregistered
    #[error("Reader {0} is no longer registered")]
    Unregistered(String),

    /// The reader was called back from inside one of its own driver calls
    #[error("Reader {0} is busy in a driver call")]
    Reentrant(String),

    /// An observer was added before any exception handler
    #[error("No observation exception handler has been set")]
    NoExceptionHandler,

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The monitoring thread could not be spawned
    #[error("Executor error: {0}")]
    Executor(#[from] std::io::Error),

    /// Frame construction failed
    #[error(transparent)]
    Frame(#[from] cardlane_core::Error),
}

impl ReaderError {
    /// Wrap a driver failure into the matching communication error
    pub fn communication(
        source: DriverError,
        message: impl Into<String>,
        response: Option<CardResponse>,
    ) -> Self {
        let message = message.into();
        match source {
            DriverError::CardIo(_) => Self::CardCommunication {
                message,
                response,
                source,
            },
            DriverError::ReaderIo(_) | DriverError::Cancelled => Self::ReaderCommunication {
                message,
                response,
                source,
            },
        }
    }

    /// Responses collected before the failure, if any
    pub const fn partial_response(&self) -> Option<&CardResponse> {
        match self {
            Self::ReaderCommunication { response, .. } | Self::CardCommunication { response, .. } => {
                response.as_ref()
            }
            Self::UnexpectedStatusWord { response, .. } => Some(response),
            _ => None,
        }
    }

    /// Whether the failure comes from the card rather than from the reader
    pub const fn is_card_failure(&self) -> bool {
        matches!(self, Self::CardCommunication { .. })
    }
}

/// Fault raised while monitoring a reader, reported through the exception handler
#[derive(Debug, thiserror::Error)]
pub enum ObservationError {
    /// Communication failure during background processing
    #[error("Reader monitoring failed: {0}")]
    Communication(#[from] ReaderError),

    /// A monitoring job panicked
    #[error("Monitoring job panicked: {0}")]
    JobPanicked(String),

    /// An observer panicked while handling an event
    #[error("Observer panicked: {0}")]
    ObserverPanicked(String),

    /// Closing a channel failed; the failure did not stop the operation in progress
    #[error("Channel close failed: {0}")]
    ChannelClose(DriverError),
}

impl ObservationError {
    /// Severity to log this fault with
    pub const fn tracing_level(&self) -> Level {
        match self {
            Self::ChannelClose(_) => Level::WARN,
            _ => Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_communication_split() {
        let err = ReaderError::communication(DriverError::CardIo("mute".into()), "transmit", None);
        assert!(err.is_card_failure());
        assert!(matches!(err, ReaderError::CardCommunication { .. }));

        let partial = CardResponse::partial(Vec::new());
        let err = ReaderError::communication(
            DriverError::ReaderIo("unplugged".into()),
            "transmit",
            Some(partial.clone()),
        );
        assert!(!err.is_card_failure());
        assert_eq!(err.partial_response(), Some(&partial));
    }

    #[test]
    fn test_observation_severity() {
        assert_eq!(
            ObservationError::ChannelClose(DriverError::ReaderIo("x".into())).tracing_level(),
            Level::WARN
        );
        assert_eq!(
            ObservationError::JobPanicked("boom".into()).tracing_level(),
            Level::ERROR
        );
    }
}
