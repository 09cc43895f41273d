//! Card selection and APDU transmission
//!
//! [`SelectionEngine`] borrows the driver and the channel bookkeeping of one reader for the
//! duration of an exchange. It never locks anything itself: the reader calls it while holding
//! its per-reader lock.
//!
//! Selection applies up to three filters, in order: card protocol, power-on data, AID. The
//! first filter that rejects the card ends the selection with `has_matched = false`.
//!
//! Transmission follows ISO/IEC 7816-4 for responses without data:
//!
//! | Status  | Follow-up                                          |
//! |---------|----------------------------------------------------|
//! | `61 XX` | GET RESPONSE with Le = `XX`                        |
//! | `6C XX` | same command replayed with Le = `XX`               |
//! | success | GET RESPONSE with the original Le, case-4 commands |
//!
//! Follow-ups chain until the card stops asking for one or the configured bound is reached.

use std::{
    mem,
    time::{Duration, Instant},
};

use bytes::Bytes;
use cardlane_core::{
    ApduRequest, ApduResponse, CardRequest, CardResponse, CardSelectionRequest,
    CardSelectionResponse, CardSelector, Command, FileControlInformation, SelectionStatus,
    command::INS_GET_RESPONSE,
};
use tracing::{debug, trace, warn};

use crate::{
    ChannelControl, ChannelDriver, DriverError, MultiSelectionProcessing, ReaderError,
};

/// Logical channel and protocol bookkeeping of one reader
#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    logical_channel_open: bool,
    /// Reader protocol to application protocol, in activation order
    protocol_associations: Vec<(String, String)>,
    current_logical_protocol: Option<String>,
    current_physical_protocol: Option<String>,
    use_default_protocol: bool,
    last_exchange: Option<Instant>,
}

impl ChannelState {
    pub(crate) const fn is_logical_channel_open(&self) -> bool {
        self.logical_channel_open
    }

    pub(crate) const fn mark_logical_channel_closed(&mut self) {
        self.logical_channel_open = false;
    }

    pub(crate) fn current_physical_protocol(&self) -> Option<&str> {
        self.current_physical_protocol.as_deref()
    }

    /// Associate a reader protocol with an application protocol, replacing any previous one
    pub(crate) fn associate_protocol(&mut self, reader_protocol: &str, application_protocol: &str) {
        match self
            .protocol_associations
            .iter_mut()
            .find(|(reader, _)| reader == reader_protocol)
        {
            Some((_, application)) => *application = application_protocol.to_string(),
            None => self
                .protocol_associations
                .push((reader_protocol.to_string(), application_protocol.to_string())),
        }
    }

    pub(crate) fn dissociate_protocol(&mut self, reader_protocol: &str) {
        self.protocol_associations
            .retain(|(reader, _)| reader != reader_protocol);
    }
}

/// Runs selections and card requests against one reader
pub(crate) struct SelectionEngine<'a> {
    reader_name: &'a str,
    driver: &'a mut dyn ChannelDriver,
    channel: &'a mut ChannelState,
    max_response_chain: usize,
    close_failures: Vec<DriverError>,
}

impl<'a> SelectionEngine<'a> {
    pub(crate) fn new(
        reader_name: &'a str,
        driver: &'a mut dyn ChannelDriver,
        channel: &'a mut ChannelState,
        max_response_chain: usize,
    ) -> Self {
        Self {
            reader_name,
            driver,
            channel,
            max_response_chain,
            close_failures: Vec::new(),
        }
    }

    /// Connect to the card if needed and work out which protocol it speaks
    pub(crate) fn open_physical_channel(&mut self) -> Result<(), DriverError> {
        if !self.driver.is_physical_channel_open() {
            self.driver.open_physical_channel()?;
            trace!(reader = %self.reader_name, "Physical channel opened");
            self.compute_current_protocol();
        }
        Ok(())
    }

    /// Derive the current logical protocol from the protocol associations
    pub(crate) fn compute_current_protocol(&mut self) {
        self.channel.current_logical_protocol = None;
        self.channel.current_physical_protocol = None;

        if self.channel.protocol_associations.is_empty() {
            self.channel.use_default_protocol = true;
            return;
        }
        self.channel.use_default_protocol = false;

        let Some(protocols) = self.driver.configurable_protocols() else {
            return;
        };
        let current = self
            .channel
            .protocol_associations
            .iter()
            .find(|(reader, _)| protocols.is_current_protocol(reader))
            .cloned();
        if let Some((reader, application)) = current {
            trace!(
                reader = %self.reader_name,
                physical = %reader,
                logical = %application,
                "Current protocol"
            );
            self.channel.current_physical_protocol = Some(reader);
            self.channel.current_logical_protocol = Some(application);
        }
    }

    /// Run selection requests in order, following the multi-selection policy
    pub(crate) fn transmit_card_selection_requests(
        &mut self,
        requests: &[CardSelectionRequest],
        processing: MultiSelectionProcessing,
        channel_control: ChannelControl,
    ) -> Result<Vec<CardSelectionResponse>, ReaderError> {
        self.open_physical_channel().map_err(|err| {
            ReaderError::communication(err, "Failure while opening the physical channel", None)
        })?;

        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.process_card_selection_request(request)?);
            match processing {
                MultiSelectionProcessing::ProcessAll => self.close_logical_channel(),
                MultiSelectionProcessing::FirstMatch if self.channel.logical_channel_open => break,
                MultiSelectionProcessing::FirstMatch => {}
            }
        }

        if channel_control == ChannelControl::CloseAfter {
            self.release_channel()?;
        }
        Ok(responses)
    }

    /// Transmit a card request on the current channel
    pub(crate) fn transmit_card_request(
        &mut self,
        request: &CardRequest,
        channel_control: ChannelControl,
    ) -> Result<CardResponse, ReaderError> {
        let response = self.process_card_request(request)?;
        if channel_control == ChannelControl::CloseAfter {
            self.release_channel()?;
        }
        Ok(response)
    }

    /// Close the logical channel then disconnect from the card
    pub(crate) fn release_channel(&mut self) -> Result<(), ReaderError> {
        self.close_logical_channel();
        self.driver.close_physical_channel().map_err(|err| {
            ReaderError::communication(err, "Failure while releasing the physical channel", None)
        })?;
        trace!(reader = %self.reader_name, "Physical channel released");
        Ok(())
    }

    pub(crate) fn close_logical_channel(&mut self) {
        if let Some(selection) = self.driver.autonomous_selection() {
            selection.close_logical_channel();
        }
        if mem::take(&mut self.channel.logical_channel_open) {
            trace!(reader = %self.reader_name, "Logical channel closed");
        }
    }

    /// Close both channels; a failure is logged and kept for [`Self::take_close_failures`]
    pub(crate) fn close_channels_silently(&mut self) {
        self.close_logical_channel();
        self.channel.current_logical_protocol = None;
        self.channel.use_default_protocol = false;
        if let Err(err) = self.driver.close_physical_channel() {
            warn!(reader = %self.reader_name, error = %err, "Failed to close the physical channel");
            self.close_failures.push(err);
        }
    }

    /// Channel close failures swallowed so far
    pub(crate) fn take_close_failures(&mut self) -> Vec<DriverError> {
        mem::take(&mut self.close_failures)
    }

    fn process_card_request(&mut self, request: &CardRequest) -> Result<CardResponse, ReaderError> {
        let apdu_requests = request.apdu_requests();
        let mut responses = Vec::with_capacity(apdu_requests.len());

        for apdu_request in apdu_requests {
            let response = match self.process_apdu_request(apdu_request) {
                Ok(response) => response,
                Err(err) => {
                    self.close_channels_silently();
                    return Err(ReaderError::communication(
                        err,
                        "Failure while transmitting a card request",
                        Some(CardResponse::partial(responses)),
                    ));
                }
            };

            let status = response.status_word();
            responses.push(response);
            if request.stops_on_unsuccessful_status_word() && !apdu_request.is_successful(status) {
                let all_processed = responses.len() == apdu_requests.len();
                return Err(ReaderError::UnexpectedStatusWord {
                    status,
                    response: CardResponse::partial(responses),
                    all_processed,
                });
            }
        }

        Ok(CardResponse::new(
            responses,
            self.channel.logical_channel_open,
        ))
    }

    fn process_card_selection_request(
        &mut self,
        request: &CardSelectionRequest,
    ) -> Result<CardSelectionResponse, ReaderError> {
        self.channel.logical_channel_open = false;

        let status = self.process_selection(request.selector())?;
        if !status.has_matched() {
            return Ok(CardSelectionResponse::new(
                status,
                Some(CardResponse::new(Vec::new(), false)),
            ));
        }

        self.channel.logical_channel_open = true;
        let card_response = request
            .card_request()
            .map(|card_request| self.process_card_request(card_request))
            .transpose()?;
        Ok(CardSelectionResponse::new(status, card_response))
    }

    fn process_selection(&mut self, selector: &CardSelector) -> Result<SelectionStatus, ReaderError> {
        if let Some(protocol) = selector.logical_protocol() {
            if self.channel.use_default_protocol {
                return Err(ReaderError::ProtocolMismatch(format!(
                    "protocol {protocol} is not associated with any reader protocol"
                )));
            }
            if self.channel.current_logical_protocol.as_deref() != Some(protocol) {
                trace!(
                    reader = %self.reader_name,
                    protocol,
                    current = ?self.channel.current_logical_protocol,
                    "Card protocol rejected"
                );
                return Ok(SelectionStatus::new(None, None, false));
            }
        }

        let power_on_data = self.driver.power_on_data();
        if !power_on_data.is_empty() {
            let power_on_hex = hex::encode_upper(&power_on_data);
            if !selector.matches_power_on_data(&power_on_hex) {
                trace!(
                    reader = %self.reader_name,
                    power_on_data = %power_on_hex,
                    pattern = selector.power_on_data_pattern().unwrap_or_default(),
                    "Power-on data rejected"
                );
                return Ok(SelectionStatus::new(Some(power_on_data), None, false));
            }
        }

        let Some(aid) = selector.aid() else {
            return Ok(SelectionStatus::new(Some(power_on_data), None, true));
        };
        let fci = self.select_by_aid(selector, aid).map_err(selection_failure)?;
        let matched = selector.is_successful_selection(fci.status_word());
        Ok(SelectionStatus::new(Some(power_on_data), Some(fci), matched))
    }

    fn select_by_aid(&mut self, selector: &CardSelector, aid: &Bytes) -> Result<ApduResponse, DriverError> {
        let p2 = selector.select_application_p2();

        if let Some(selection) = self.driver.autonomous_selection() {
            debug!(reader = %self.reader_name, aid = %hex::encode_upper(aid), p2, "Reader selects application");
            let answer = selection.open_channel_for_aid(aid, p2)?;
            return ApduResponse::from_bytes(answer).map_err(card_io);
        }

        debug!(reader = %self.reader_name, aid = %hex::encode_upper(aid), p2, "Selecting application");
        let select = Command::select_application(aid, p2)
            .to_bytes()
            .map_err(card_io)?;
        let fci = self.process_apdu_request(
            &ApduRequest::new(select).with_info("Internal Select Application"),
        )?;

        if selector.file_control_information() == FileControlInformation::Fci
            && fci.status_word().is_success()
            && fci.is_empty()
        {
            return self.recover_fci(fci);
        }
        Ok(fci)
    }

    /// Ask for the FCI explicitly after a SELECT that returned none
    fn recover_fci(&mut self, fci: ApduResponse) -> Result<ApduResponse, DriverError> {
        debug!(reader = %self.reader_name, "Empty FCI, requesting it with GET DATA");
        let get_data = Command::get_data_fci().to_bytes().map_err(card_io)?;
        let answer =
            self.process_apdu_request(&ApduRequest::new(get_data).with_info("Internal Get Data"))?;
        if answer.status_word().is_success() && !answer.is_empty() {
            Ok(answer)
        } else {
            Ok(fci)
        }
    }

    fn process_apdu_request(&mut self, request: &ApduRequest) -> Result<ApduResponse, DriverError> {
        self.exchange_with_recovery(request, 0)
    }

    fn exchange_with_recovery(
        &mut self,
        request: &ApduRequest,
        depth: usize,
    ) -> Result<ApduResponse, DriverError> {
        let response = self.exchange(request)?;
        if !response.is_empty() {
            return Ok(response);
        }

        let status = response.status_word();
        let follow_up = status
            .remaining_bytes()
            .map(internal_get_response)
            .or_else(|| status.corrected_le().map(|le| request.with_le(le)))
            .or_else(|| {
                (request.is_case4() && request.is_successful(status))
                    .then(|| internal_get_response(request.le().unwrap_or_default()))
            });

        match follow_up {
            None => Ok(response),
            Some(_) if depth >= self.max_response_chain => {
                warn!(
                    reader = %self.reader_name,
                    %status,
                    depth,
                    "Response chain limit reached, keeping the last response"
                );
                Ok(response)
            }
            Some(follow_up) => self.exchange_with_recovery(&follow_up, depth + 1),
        }
    }

    fn exchange(&mut self, request: &ApduRequest) -> Result<ApduResponse, DriverError> {
        let elapsed = self.mark_exchange();
        debug!(
            reader = %self.reader_name,
            apdu = %hex::encode_upper(request.apdu()),
            info = request.info().unwrap_or_default(),
            ?elapsed,
            "--> APDU request"
        );

        let answer = self.driver.transmit_apdu(request.apdu())?;

        let elapsed = self.mark_exchange();
        debug!(
            reader = %self.reader_name,
            apdu = %hex::encode_upper(&answer),
            ?elapsed,
            "<-- APDU response"
        );

        let response = ApduResponse::from_bytes(answer).map_err(card_io)?;
        let status = response.status_word();
        trace!(
            reader = %self.reader_name,
            %status,
            description = status.description(),
            "Status word"
        );
        Ok(response)
    }

    /// Time since the previous exchange
    fn mark_exchange(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = self
            .channel
            .last_exchange
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        self.channel.last_exchange = Some(now);
        elapsed
    }
}

fn internal_get_response(le: u8) -> ApduRequest {
    ApduRequest::new(Bytes::copy_from_slice(&[0x00, INS_GET_RESPONSE, 0x00, 0x00, le]))
        .with_info("Internal Get Response")
}

/// An answer the frame layer cannot parse comes from a card that misbehaves
fn card_io(err: cardlane_core::Error) -> DriverError {
    DriverError::CardIo(err.to_string())
}

fn selection_failure(err: DriverError) -> ReaderError {
    ReaderError::communication(
        err,
        "Failure while selecting the card",
        Some(CardResponse::partial(Vec::new())),
    )
}
