//! APDU and card requests

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::{Command, Result, StatusWord, command, status::common};

/// One APDU to transmit, with the status words that count as success for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduRequest {
    apdu: Bytes,
    info: Option<String>,
    successful_status_words: BTreeSet<StatusWord>,
    case4: bool,
}

impl ApduRequest {
    /// Create a request from raw bytes; only `90 00` is successful until more are added
    pub fn new(apdu: impl Into<Bytes>) -> Self {
        let apdu = apdu.into();
        let case4 = command::is_case4(&apdu);
        Self {
            apdu,
            info: None,
            successful_status_words: BTreeSet::from([common::SUCCESS]),
            case4,
        }
    }

    /// Create a request from a command
    pub fn from_command(command: &Command) -> Result<Self> {
        Ok(Self::new(command.to_bytes()?).with_case4(command.is_case4()))
    }

    /// Attach a diagnostic label
    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    /// Accept another status word as success
    pub fn with_successful_status_word(mut self, status: impl Into<StatusWord>) -> Self {
        self.successful_status_words.insert(status.into());
        self
    }

    /// Override the case-4 detection done on the raw bytes
    pub const fn with_case4(mut self, case4: bool) -> Self {
        self.case4 = case4;
        self
    }

    /// Raw APDU bytes
    pub const fn apdu(&self) -> &Bytes {
        &self.apdu
    }

    /// Diagnostic label
    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    /// Status words considered successful
    pub const fn successful_status_words(&self) -> &BTreeSet<StatusWord> {
        &self.successful_status_words
    }

    /// Whether `status` is in the successful set
    pub fn is_successful(&self, status: StatusWord) -> bool {
        self.successful_status_words.contains(&status)
    }

    /// Whether the command expects output data (Lc, data and Le present)
    pub const fn is_case4(&self) -> bool {
        self.case4
    }

    /// Last byte of the command, the Le of a case-2 or case-4 APDU
    pub fn le(&self) -> Option<u8> {
        self.apdu.last().copied()
    }

    /// Copy of this request with the last byte replaced, used to replay after `6C XX`
    pub fn with_le(&self, le: u8) -> Self {
        let mut apdu = self.apdu.to_vec();
        if let Some(last) = apdu.last_mut() {
            *last = le;
        }
        Self {
            apdu: Bytes::from(apdu),
            info: self.info.clone(),
            successful_status_words: self.successful_status_words.clone(),
            case4: self.case4,
        }
    }
}

/// Ordered list of APDUs sent to a card in one exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardRequest {
    apdu_requests: Vec<ApduRequest>,
    stop_on_unsuccessful_status_word: bool,
}

impl CardRequest {
    /// Create a request
    pub const fn new(apdu_requests: Vec<ApduRequest>) -> Self {
        Self {
            apdu_requests,
            stop_on_unsuccessful_status_word: false,
        }
    }

    /// Abort on the first status word outside a request's successful set
    pub const fn stop_on_unsuccessful_status_word(mut self, stop: bool) -> Self {
        self.stop_on_unsuccessful_status_word = stop;
        self
    }

    /// APDUs to transmit
    pub fn apdu_requests(&self) -> &[ApduRequest] {
        &self.apdu_requests
    }

    /// Whether the exchange stops on an unexpected status word
    pub const fn stops_on_unsuccessful_status_word(&self) -> bool {
        self.stop_on_unsuccessful_status_word
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_default_successful_status_words() {
        let request = ApduRequest::new(Bytes::from_static(&hex!("00B2014400")));
        assert!(request.is_successful(common::SUCCESS));
        assert!(!request.is_successful(StatusWord::new(0x62, 0x82)));

        let request = request.with_successful_status_word(0x6282u16);
        assert!(request.is_successful(StatusWord::new(0x62, 0x82)));
    }

    #[test]
    fn test_case4_detection() {
        let request = ApduRequest::new(Bytes::from_static(&hex!("00A4040002315400")));
        assert!(request.is_case4());
        assert_eq!(request.le(), Some(0x00));

        let request = ApduRequest::new(Bytes::from_static(&hex!("00B2014410")));
        assert!(!request.is_case4());
        assert!(request.with_case4(true).is_case4());
    }

    #[test]
    fn test_replay_with_corrected_le() {
        let request = ApduRequest::new(Bytes::from_static(&hex!("00B2014400")))
            .with_info("Read record");
        let replay = request.with_le(0x1D);
        assert_eq!(replay.apdu().as_ref(), hex!("00B201441D"));
        assert_eq!(replay.info(), Some("Read record"));
    }

    #[test]
    fn test_from_command() {
        let request =
            ApduRequest::from_command(&Command::select_application(&hex!("A000000004"), 0x00))
                .unwrap();
        assert!(request.is_case4());
        assert_eq!(request.apdu().as_ref(), hex!("00A4040005A00000000400"));
    }
}
