//! APDU and card responses

use std::fmt;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{Error, Result, StatusWord};

/// Raw response to one APDU: data-out followed by the two status word bytes
///
/// Construction guarantees at least two bytes, so the status word always exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    apdu: Bytes,
    status: StatusWord,
}

impl ApduResponse {
    /// Parse response from raw bytes (including status word)
    pub fn from_bytes(apdu: impl Into<Bytes>) -> Result<Self> {
        let apdu = apdu.into();
        let len = apdu.len();
        if len < 2 {
            debug!("Response too short: {} bytes", len);
            return Err(Error::IncompleteResponse(len));
        }

        let status = StatusWord::new(apdu[len - 2], apdu[len - 1]);
        trace!(
            sw1 = format_args!("{:#04x}", status.sw1),
            sw2 = format_args!("{:#04x}", status.sw2),
            data_len = len - 2,
            "Parsed APDU response"
        );

        Ok(Self { apdu, status })
    }

    /// Full response bytes, status word included
    pub const fn apdu(&self) -> &Bytes {
        &self.apdu
    }

    /// Response data without the status word
    pub fn data_out(&self) -> &[u8] {
        &self.apdu[..self.apdu.len() - 2]
    }

    /// Status word
    pub const fn status_word(&self) -> StatusWord {
        self.status
    }

    /// Whether the response carries no data-out
    pub fn is_empty(&self) -> bool {
        self.apdu.len() == 2
    }
}

impl TryFrom<&[u8]> for ApduResponse {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Self> {
        Self::from_bytes(Bytes::copy_from_slice(data))
    }
}

impl TryFrom<Bytes> for ApduResponse {
    type Error = Error;

    fn try_from(data: Bytes) -> Result<Self> {
        Self::from_bytes(data)
    }
}

impl From<ApduResponse> for Bytes {
    fn from(response: ApduResponse) -> Self {
        response.apdu
    }
}

impl fmt::Display for ApduResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(&self.apdu))
    }
}

/// Outcome of a card request: one response per transmitted APDU, in request order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardResponse {
    apdu_responses: Vec<ApduResponse>,
    logical_channel_open: bool,
    complete: bool,
}

impl CardResponse {
    /// Response of a fully processed request
    pub const fn new(apdu_responses: Vec<ApduResponse>, logical_channel_open: bool) -> Self {
        Self {
            apdu_responses,
            logical_channel_open,
            complete: true,
        }
    }

    /// Response of an exchange aborted mid-sequence
    pub const fn partial(apdu_responses: Vec<ApduResponse>) -> Self {
        Self {
            apdu_responses,
            logical_channel_open: false,
            complete: false,
        }
    }

    /// Responses collected so far
    pub fn apdu_responses(&self) -> &[ApduResponse] {
        &self.apdu_responses
    }

    /// Consume into the collected responses
    pub fn into_apdu_responses(self) -> Vec<ApduResponse> {
        self.apdu_responses
    }

    /// Whether the logical channel was still open after the exchange
    pub const fn is_logical_channel_open(&self) -> bool {
        self.logical_channel_open
    }

    /// False when the exchange was interrupted before every APDU got an answer
    pub const fn is_complete(&self) -> bool {
        self.complete
    }
}
