//! Reader listing entries

use bytes::Bytes;
use pcsc::{ReaderState, State};

/// A PC/SC reader as seen when listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcscReader {
    name: String,
    has_card: bool,
    atr: Option<Bytes>,
}

impl PcscReader {
    /// Create a listing entry
    pub const fn new(name: String, has_card: bool, atr: Option<Bytes>) -> Self {
        Self {
            name,
            has_card,
            atr,
        }
    }

    /// Reader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a card is present in the reader
    pub const fn has_card(&self) -> bool {
        self.has_card
    }

    /// ATR of the card, if present
    pub fn atr(&self) -> Option<&[u8]> {
        self.atr.as_deref()
    }

    pub(crate) fn from_reader_state(reader_state: &ReaderState) -> Self {
        let has_card = is_card_present(reader_state.event_state());
        let atr = has_card.then(|| Bytes::copy_from_slice(reader_state.atr()));

        Self {
            name: reader_state.name().to_string_lossy().into_owned(),
            has_card,
            atr,
        }
    }
}

/// Whether a status-change state reports a card
pub(crate) fn is_card_present(state: State) -> bool {
    state.contains(State::PRESENT) && !state.contains(State::EMPTY)
}
