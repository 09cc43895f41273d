use cardlane_core::{ApduRequest, CardRequest, CardSelectionRequest, CardSelector};
use cardlane_pcsc::PcscDeviceManager;
use cardlane_reader::{ChannelControl, MultiSelectionProcessing, ReaderConfig};
use tracing::debug;

use super::{aid_selector, parse_hex, print_selection_response};

pub(crate) fn transmit_command(
    manager: &PcscDeviceManager,
    name: &str,
    aid: Option<&str>,
    strict: bool,
    apdus: &[String],
) -> anyhow::Result<()> {
    let selector = match aid {
        Some(aid) => aid_selector(aid)?,
        None => CardSelector::new(),
    };
    let apdu_requests = apdus
        .iter()
        .map(|apdu| parse_hex("APDU", apdu).map(ApduRequest::new))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let card_request = CardRequest::new(apdu_requests).stop_on_unsuccessful_status_word(strict);
    let request = CardSelectionRequest::new(selector).with_card_request(card_request);

    let reader = manager.open_reader(name, ReaderConfig::default())?;
    debug!(reader = %name, apdus = apdus.len(), "Transmitting");
    let outcome = reader.transmit_card_selection_requests(
        &[request],
        MultiSelectionProcessing::FirstMatch,
        ChannelControl::CloseAfter,
    );
    reader.unregister();

    for (index, response) in outcome?.iter().enumerate() {
        print_selection_response(index, response);
    }

    Ok(())
}
