//! Subcommand implementations

mod list;
mod transmit;
mod watch;

pub(crate) use list::list_command;
pub(crate) use transmit::transmit_command;
pub(crate) use watch::watch_command;

use anyhow::Context;
use cardlane_core::{ApduResponse, Bytes, CardSelectionResponse, CardSelector};

/// Decode a hex argument, tolerating spaces
fn parse_hex(what: &str, value: &str) -> anyhow::Result<Bytes> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&compact).with_context(|| format!("invalid {what} {value:?}"))?;
    Ok(Bytes::from(bytes))
}

/// Selector filtering on an AID given in the same hex form as APDUs
fn aid_selector(aid: &str) -> anyhow::Result<CardSelector> {
    Ok(CardSelector::new().filter_by_aid(parse_hex("AID", aid)?)?)
}

fn print_apdu_response(prefix: &str, response: &ApduResponse) {
    let status = response.status_word();
    println!(
        "{prefix}{} [{status}] {}",
        hex::encode_upper(response.apdu()),
        status.description()
    );
}

fn print_selection_response(index: usize, response: &CardSelectionResponse) {
    println!(
        "  selection #{index}: {}",
        if response.has_matched() { "matched" } else { "not matched" }
    );
    if let Some(power_on_data) = response.power_on_data() {
        println!("    ATR: {}", hex::encode_upper(power_on_data));
    }
    if let Some(fci) = response.select_application_response() {
        print_apdu_response("    FCI: ", fci);
    }
    if let Some(card_response) = response.card_response() {
        for apdu in card_response.apdu_responses() {
            print_apdu_response("    <-- ", apdu);
        }
    }
}
