//! Card selection requests and their outcomes

use bytes::Bytes;

use crate::{ApduResponse, CardRequest, CardResponse, CardSelector};

/// A selector, optionally followed by APDUs to send once it matches
#[derive(Debug, Clone, Default)]
pub struct CardSelectionRequest {
    selector: CardSelector,
    card_request: Option<CardRequest>,
}

impl CardSelectionRequest {
    /// Request that only runs the selector
    pub const fn new(selector: CardSelector) -> Self {
        Self {
            selector,
            card_request: None,
        }
    }

    /// Run `card_request` right after a successful selection
    pub fn with_card_request(mut self, card_request: CardRequest) -> Self {
        self.card_request = Some(card_request);
        self
    }

    /// Selector
    pub const fn selector(&self) -> &CardSelector {
        &self.selector
    }

    /// Follow-up request
    pub const fn card_request(&self) -> Option<&CardRequest> {
        self.card_request.as_ref()
    }
}

/// What the reader learnt while applying a selector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionStatus {
    power_on_data: Option<Bytes>,
    fci: Option<ApduResponse>,
    has_matched: bool,
}

impl SelectionStatus {
    /// Create a status
    pub const fn new(power_on_data: Option<Bytes>, fci: Option<ApduResponse>, has_matched: bool) -> Self {
        Self {
            power_on_data,
            fci,
            has_matched,
        }
    }

    /// Power-on data read from the card
    pub const fn power_on_data(&self) -> Option<&Bytes> {
        self.power_on_data.as_ref()
    }

    /// Answer to SELECT, when an AID filter was evaluated
    pub const fn fci(&self) -> Option<&ApduResponse> {
        self.fci.as_ref()
    }

    /// Whether every filter of the selector passed
    pub const fn has_matched(&self) -> bool {
        self.has_matched
    }
}

/// Result of one selection request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardSelectionResponse {
    status: SelectionStatus,
    card_response: Option<CardResponse>,
}

impl CardSelectionResponse {
    /// Create a response
    pub const fn new(status: SelectionStatus, card_response: Option<CardResponse>) -> Self {
        Self {
            status,
            card_response,
        }
    }

    /// Selection outcome
    pub const fn selection_status(&self) -> &SelectionStatus {
        &self.status
    }

    /// Shortcut for `selection_status().has_matched()`
    pub const fn has_matched(&self) -> bool {
        self.status.has_matched
    }

    /// Power-on data, if read
    pub const fn power_on_data(&self) -> Option<&Bytes> {
        self.status.power_on_data()
    }

    /// SELECT answer, if any
    pub const fn select_application_response(&self) -> Option<&ApduResponse> {
        self.status.fci()
    }

    /// Responses to the follow-up request, present only after a match
    pub const fn card_response(&self) -> Option<&CardResponse> {
        self.card_response.as_ref()
    }
}
