//! Card selectors
//!
//! A [`CardSelector`] describes which card (or which application on a card) a selection
//! targets. The reader evaluates its filters in a fixed order: card protocol first, then
//! the power-on data pattern, then the application identifier. Any filter left unset
//! matches everything.

use std::{collections::BTreeSet, fmt};

use bytes::Bytes;
use derive_more::Display;
use regex::Regex;

use crate::{Command, Error, Result, StatusWord, status::common};

/// Shortest AID accepted by SELECT by name
pub const AID_MIN_LENGTH: usize = 5;
/// Longest AID accepted by SELECT by name
pub const AID_MAX_LENGTH: usize = 16;

/// Which occurrence of a partially matching DF name to select (P2 bits 1-2)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display)]
pub enum FileOccurrence {
    /// First or only occurrence
    #[default]
    #[display("FIRST")]
    First,
    /// Last occurrence
    #[display("LAST")]
    Last,
    /// Next occurrence
    #[display("NEXT")]
    Next,
    /// Previous occurrence
    #[display("PREVIOUS")]
    Previous,
}

impl FileOccurrence {
    /// P2 bits for this occurrence
    pub const fn mask(self) -> u8 {
        match self {
            Self::First => 0x00,
            Self::Last => 0x01,
            Self::Next => 0x02,
            Self::Previous => 0x03,
        }
    }
}

/// Which template the card returns after SELECT (P2 bits 3-4)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display)]
pub enum FileControlInformation {
    /// File control information
    #[default]
    #[display("FCI")]
    Fci,
    /// File control parameters
    #[display("FCP")]
    Fcp,
    /// File management data
    #[display("FMD")]
    Fmd,
    /// No response data
    #[display("NO_RESPONSE")]
    NoResponse,
}

impl FileControlInformation {
    /// P2 bits for this template
    pub const fn mask(self) -> u8 {
        match self {
            Self::Fci => 0x00,
            Self::Fcp => 0x04,
            Self::Fmd => 0x08,
            Self::NoResponse => 0x0C,
        }
    }
}

/// Selection filter applied to a card at insertion time or on demand
#[derive(Debug, Clone)]
pub struct CardSelector {
    logical_protocol: Option<String>,
    power_on_data_regex: Option<Regex>,
    aid: Option<Bytes>,
    file_occurrence: FileOccurrence,
    file_control_information: FileControlInformation,
    successful_selection_status_words: BTreeSet<StatusWord>,
}

impl Default for CardSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl CardSelector {
    /// A selector that matches any card
    pub fn new() -> Self {
        Self {
            logical_protocol: None,
            power_on_data_regex: None,
            aid: None,
            file_occurrence: FileOccurrence::default(),
            file_control_information: FileControlInformation::default(),
            successful_selection_status_words: BTreeSet::from([common::SUCCESS]),
        }
    }

    /// Restrict to cards using the given logical protocol
    pub fn filter_by_card_protocol(mut self, protocol: impl Into<String>) -> Result<Self> {
        let protocol = protocol.into();
        if protocol.is_empty() {
            return Err(Error::EmptyProtocolName);
        }
        self.logical_protocol = Some(protocol);
        Ok(self)
    }

    /// Restrict to cards whose power-on data, as upper-case hex, fully matches `pattern`
    pub fn filter_by_power_on_data(mut self, pattern: &str) -> Result<Self> {
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored).map_err(|e| Error::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.power_on_data_regex = Some(regex);
        Ok(self)
    }

    /// Restrict to cards answering SELECT for this application identifier
    pub fn filter_by_aid(mut self, aid: impl Into<Bytes>) -> Result<Self> {
        let aid = aid.into();
        if !(AID_MIN_LENGTH..=AID_MAX_LENGTH).contains(&aid.len()) {
            return Err(Error::InvalidAidLength(aid.len()));
        }
        self.aid = Some(aid);
        Ok(self)
    }

    /// Same as [`Self::filter_by_aid`], with the AID given as hex
    pub fn filter_by_aid_hex(self, aid: &str) -> Result<Self> {
        let aid = hex::decode(aid).map_err(Error::invalid_hex)?;
        self.filter_by_aid(aid)
    }

    /// Occurrence to request in SELECT
    pub const fn with_file_occurrence(mut self, occurrence: FileOccurrence) -> Self {
        self.file_occurrence = occurrence;
        self
    }

    /// Template to request in SELECT
    pub const fn with_file_control_information(mut self, fci: FileControlInformation) -> Self {
        self.file_control_information = fci;
        self
    }

    /// Accept another SELECT status word as a match
    pub fn add_successful_selection_status_word(mut self, status: impl Into<StatusWord>) -> Self {
        self.successful_selection_status_words.insert(status.into());
        self
    }

    /// Logical protocol filter
    pub fn logical_protocol(&self) -> Option<&str> {
        self.logical_protocol.as_deref()
    }

    /// Power-on data pattern as given by the caller
    pub fn power_on_data_pattern(&self) -> Option<&str> {
        self.power_on_data_regex
            .as_ref()
            .map(|regex| &regex.as_str()[4..regex.as_str().len() - 2])
    }

    /// Application identifier filter
    pub const fn aid(&self) -> Option<&Bytes> {
        self.aid.as_ref()
    }

    /// Requested occurrence
    pub const fn file_occurrence(&self) -> FileOccurrence {
        self.file_occurrence
    }

    /// Requested template
    pub const fn file_control_information(&self) -> FileControlInformation {
        self.file_control_information
    }

    /// Status words that make SELECT count as a match
    pub const fn successful_selection_status_words(&self) -> &BTreeSet<StatusWord> {
        &self.successful_selection_status_words
    }

    /// Whether `status` answers SELECT successfully for this selector
    pub fn is_successful_selection(&self, status: StatusWord) -> bool {
        self.successful_selection_status_words.contains(&status)
    }

    /// Whether upper-case hex power-on data passes the pattern filter
    pub fn matches_power_on_data(&self, power_on_data_hex: &str) -> bool {
        self.power_on_data_regex
            .as_ref()
            .is_none_or(|regex| regex.is_match(power_on_data_hex))
    }

    /// P2 of the SELECT command
    pub const fn select_application_p2(&self) -> u8 {
        self.file_occurrence.mask() | self.file_control_information.mask()
    }

    /// SELECT by name for the AID filter, if one is set
    pub fn select_command(&self) -> Option<Command> {
        self.aid
            .as_ref()
            .map(|aid| Command::select_application(aid, self.select_application_p2()))
    }
}

impl fmt::Display for CardSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CardSelector(protocol={}, power_on={}, aid={}, {}/{})",
            self.logical_protocol().unwrap_or("*"),
            self.power_on_data_pattern().unwrap_or("*"),
            self.aid
                .as_ref()
                .map_or_else(|| "*".to_string(), hex::encode_upper),
            self.file_occurrence,
            self.file_control_information,
        )
    }
}
