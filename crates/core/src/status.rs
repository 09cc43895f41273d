//! Status words closing card responses
//!
//! ISO/IEC 7816-4 groups status words by their first byte: `90`/`61` mean the
//! command was processed, `62`/`63` carry a warning, `64`-`66` report an
//! execution error and `67`-`6F` a rejected command. Selection and card
//! requests compare the status word against their own successful set, the
//! helpers below only classify it for retries, logs and messages.

use std::fmt;

use tracing::Level;

/// SW1-SW2 trailer of an APDU response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusWord {
    /// SW1
    pub sw1: u8,
    /// SW2
    pub sw2: u8,
}

impl StatusWord {
    /// Status word from its two bytes
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self { sw1, sw2 }
    }

    /// Split a big-endian `0xSW1SW2` value
    pub const fn from_u16(status: u16) -> Self {
        let [sw1, sw2] = status.to_be_bytes();
        Self { sw1, sw2 }
    }

    /// Join SW1 and SW2 big-endian
    pub const fn to_u16(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// `90 00`, the only status word accepted by default
    pub const fn is_success(&self) -> bool {
        self.sw1 == 0x90 && self.sw2 == 0x00
    }

    /// Length announced by a `61 XX` trailer, fetched with GET RESPONSE
    pub const fn remaining_bytes(&self) -> Option<u8> {
        match self.sw1 {
            0x61 => Some(self.sw2),
            _ => None,
        }
    }

    /// Le the card expects after a `6C XX` trailer
    pub const fn corrected_le(&self) -> Option<u8> {
        match self.sw1 {
            0x6C => Some(self.sw2),
            _ => None,
        }
    }

    /// `62 XX` or `63 XX`
    pub const fn is_warning(&self) -> bool {
        matches!(self.sw1, 0x62 | 0x63)
    }

    /// Level at which exchanges ending with this status word are logged
    pub const fn tracing_level(&self) -> Level {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) | (0x61, _) => Level::DEBUG,
            (0x62 | 0x63, _) => Level::INFO,
            _ => Level::WARN,
        }
    }

    /// Short English meaning, for logs and CLI output
    pub const fn description(&self) -> &'static str {
        match self.sw1 {
            0x90 | 0x61 => self.processed(),
            0x62 | 0x63 => self.warning(),
            0x64..=0x66 => self.execution_error(),
            0x67..=0x6F => self.checking_error(),
            _ => UNKNOWN,
        }
    }

    const fn processed(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x90, 0x00) => "Success",
            (0x61, _) => "More data available",
            _ => UNKNOWN,
        }
    }

    const fn warning(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x62, 0x00) => "No information given",
            (0x62, 0x81) => "Part of returned data may be corrupted",
            (0x62, 0x82) => "End of file/record reached before reading Le bytes",
            (0x62, 0x83) => "Selected file invalidated",
            (0x62, 0x84) => "FCI not formatted according to ISO/IEC 7816-4",
            (0x63, n) if n & 0xF0 == 0xC0 => "Counter value",
            (0x63, _) => "Non-volatile memory changed",
            _ => UNKNOWN,
        }
    }

    const fn execution_error(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x64, 0x00) => "State of non-volatile memory unchanged",
            (0x65, 0x81) => "Memory failure",
            _ => UNKNOWN,
        }
    }

    const fn checking_error(&self) -> &'static str {
        match (self.sw1, self.sw2) {
            (0x67, 0x00) => "Wrong length",
            (0x68, 0x81) => "Logical channel not supported",
            (0x69, 0x82) => "Security status not satisfied",
            (0x69, 0x85) => "Conditions of use not satisfied",
            (0x69, 0x86) => "Command not allowed",
            (0x6A, 0x81) => "Function not supported",
            (0x6A, 0x82) => "File or application not found",
            (0x6A, 0x86) => "Incorrect parameters P1-P2",
            (0x6A, 0x88) => "Referenced data not found",
            (0x6B, 0x00) => "Wrong parameters P1-P2",
            (0x6C, _) => "Wrong Le field",
            (0x6D, 0x00) => "Instruction code not supported or invalid",
            (0x6E, 0x00) => "Class not supported",
            (0x6F, 0x00) => "No precise diagnosis",
            _ => UNKNOWN,
        }
    }
}

const UNKNOWN: &str = "Unknown status word";

impl From<(u8, u8)> for StatusWord {
    fn from((sw1, sw2): (u8, u8)) -> Self {
        Self::new(sw1, sw2)
    }
}

impl From<u16> for StatusWord {
    fn from(status: u16) -> Self {
        Self::from_u16(status)
    }
}

impl From<StatusWord> for u16 {
    fn from(status: StatusWord) -> Self {
        status.to_u16()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.sw1, self.sw2)
    }
}

/// Status words the selection and request defaults refer to
pub mod common {
    use super::StatusWord;

    /// `90 00`
    pub const SUCCESS: StatusWord = StatusWord::new(0x90, 0x00);

    /// Answer of SELECT on an application that is present but blocked
    pub const SELECTED_FILE_INVALIDATED: StatusWord = StatusWord::new(0x62, 0x83);

    /// `67 00`
    pub const WRONG_LENGTH: StatusWord = StatusWord::new(0x67, 0x00);

    /// Answer of SELECT when the AID is not on the card
    pub const FILE_NOT_FOUND: StatusWord = StatusWord::new(0x6A, 0x82);

    /// `6E 00`
    pub const CLASS_NOT_SUPPORTED: StatusWord = StatusWord::new(0x6E, 0x00);
}
