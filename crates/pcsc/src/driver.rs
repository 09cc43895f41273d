//! PC/SC channel driver

use std::{ffi::CString, fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use cardlane_reader::{
    CardInsertionWaiter, CardRemovalWaiter, ChannelDriver, ConfigurableProtocols,
    DetectionCapabilities, DriverError, InsertionDetection, RemovalDetection,
};
use pcsc::{Card, Context, Disposition, Protocol, Protocols, ReaderState, State};
use regex::Regex;
use tracing::{debug, trace, warn};

use crate::{PcscConfig, PcscError, reader::is_card_present, wait::StatusChangeWaiter};

/// Size of the response buffer: 256 data bytes and the status word
const RESPONSE_BUFFER_SIZE: usize = 258;

/// Reader protocol names understood by [`ConfigurableProtocols`]
const READER_PROTOCOLS: [(&str, Protocols); 3] = [
    ("T0", Protocols::T0),
    ("T1", Protocols::T1),
    ("RAW", Protocols::RAW),
];

/// [`ChannelDriver`] over one PC/SC reader
pub struct PcscDriver {
    name: String,
    reader: CString,
    context: Context,
    config: PcscConfig,
    contactless: bool,
    card: Option<Card>,
    atr: Bytes,
    protocols: ProtocolSelection,
    current_protocol: Option<Protocol>,
    insertion_waiter: Option<Arc<StatusChangeWaiter>>,
    removal_waiter: Option<Arc<StatusChangeWaiter>>,
}

impl fmt::Debug for PcscDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscDriver")
            .field("name", &self.name)
            .field("contactless", &self.contactless)
            .field("connected", &self.card.is_some())
            .field("protocols", &self.protocols)
            .field("current_protocol", &self.current_protocol)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PcscDriver {
    /// Create a driver for the reader `name`
    ///
    /// Nothing is connected until the reader opens the physical channel.
    pub(crate) fn new(context: Context, name: &str, config: PcscConfig) -> Result<Self, PcscError> {
        let reader =
            CString::new(name).map_err(|_| PcscError::InvalidReaderName(name.to_string()))?;
        let contactless = Regex::new(&config.contactless_pattern)?.is_match(name);

        let (insertion_waiter, removal_waiter) = if config.blocking_detection {
            let slice = config.status_change_slice;
            (
                Some(Arc::new(StatusChangeWaiter::new(reader.clone(), slice)?)),
                Some(Arc::new(StatusChangeWaiter::new(reader.clone(), slice)?)),
            )
        } else {
            (None, None)
        };

        debug!(reader = %name, contactless, "PC/SC driver created");
        Ok(Self {
            name: name.to_string(),
            reader,
            context,
            protocols: ProtocolSelection::new(config.protocols),
            config,
            contactless,
            card: None,
            atr: Bytes::new(),
            current_protocol: None,
            insertion_waiter,
            removal_waiter,
        })
    }

    fn connect(&mut self) -> Result<(), PcscError> {
        let protocols = self.protocols.offered();
        let card = match self
            .context
            .connect(&self.reader, self.config.share_mode.into(), protocols)
        {
            Ok(card) => card,
            Err(pcsc::Error::NoSmartcard) => return Err(PcscError::NoCard(self.name.clone())),
            Err(err) => return Err(err.into()),
        };

        let status = card.status2_owned()?;
        self.atr = Bytes::copy_from_slice(status.atr());
        self.current_protocol = status.protocol2();
        self.card = Some(card);
        debug!(
            reader = %self.name,
            atr = %hex::encode_upper(&self.atr),
            protocol = ?self.current_protocol,
            "Card connected"
        );
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), PcscError> {
        self.atr = Bytes::new();
        self.current_protocol = None;
        let Some(card) = self.card.take() else {
            return Ok(());
        };
        card.disconnect(Disposition::LeaveCard)
            .map_err(|(_, err)| PcscError::from(err))?;
        trace!(reader = %self.name, "Card disconnected");
        Ok(())
    }

    fn transmit(&mut self, apdu: &[u8]) -> Result<Bytes, PcscError> {
        let card = self
            .card
            .as_mut()
            .ok_or_else(|| PcscError::NoCard(self.name.clone()))?;
        let mut buffer = [0u8; RESPONSE_BUFFER_SIZE];

        let outcome = card.transmit(apdu, &mut buffer).map(Bytes::copy_from_slice);
        match outcome {
            Ok(answer) => Ok(answer),
            Err(pcsc::Error::ResetCard) if self.config.auto_reconnect => {
                warn!(reader = %self.name, "Card was reset, reconnecting");
                let protocols = self.protocols.offered();
                card.reconnect(self.config.share_mode.into(), protocols, Disposition::LeaveCard)?;
                let answer = card.transmit(apdu, &mut buffer)?;
                Ok(Bytes::copy_from_slice(answer))
            }
            Err(err) => {
                if matches!(err, pcsc::Error::RemovedCard | pcsc::Error::ResetCard) {
                    self.card = None;
                    self.atr = Bytes::new();
                }
                Err(err.into())
            }
        }
    }

    fn stop_waiters(&self) {
        if let Some(waiter) = &self.insertion_waiter {
            waiter.stop_wait_for_card_insertion();
        }
        if let Some(waiter) = &self.removal_waiter {
            waiter.stop_wait_for_card_removal();
        }
    }
}

impl ChannelDriver for PcscDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_physical_channel(&mut self) -> Result<(), DriverError> {
        if self.card.is_some() {
            return Ok(());
        }
        self.connect().map_err(Into::into)
    }

    fn close_physical_channel(&mut self) -> Result<(), DriverError> {
        self.disconnect().map_err(Into::into)
    }

    fn is_physical_channel_open(&self) -> bool {
        self.card.is_some()
    }

    fn check_card_presence(&mut self) -> Result<bool, DriverError> {
        let mut states = [ReaderState::new(self.reader.clone(), State::UNAWARE)];
        match self
            .context
            .get_status_change(Some(Duration::ZERO), &mut states)
        {
            Ok(()) | Err(pcsc::Error::Timeout) => Ok(is_card_present(states[0].event_state())),
            Err(err) => Err(PcscError::from(err).into()),
        }
    }

    fn power_on_data(&self) -> Bytes {
        self.atr.clone()
    }

    fn transmit_apdu(&mut self, apdu: &[u8]) -> Result<Bytes, DriverError> {
        self.transmit(apdu).map_err(Into::into)
    }

    fn is_contactless(&self) -> bool {
        self.contactless
    }

    fn on_unregister(&mut self) {
        self.stop_waiters();
        if let Err(err) = self.disconnect() {
            warn!(reader = %self.name, error = %err, "Disconnect on unregister failed");
        }
    }

    fn detection_capabilities(&self) -> DetectionCapabilities {
        match (&self.insertion_waiter, &self.removal_waiter) {
            (Some(insertion), Some(removal)) => DetectionCapabilities {
                insertion: InsertionDetection::Blocking(insertion.clone()),
                removal: RemovalDetection::Blocking(removal.clone()),
                removal_during_processing: Some(removal.clone()),
            },
            _ => DetectionCapabilities::default(),
        }
    }

    fn configurable_protocols(&mut self) -> Option<&mut dyn ConfigurableProtocols> {
        Some(self)
    }
}

impl ConfigurableProtocols for PcscDriver {
    fn is_protocol_supported(&self, reader_protocol: &str) -> bool {
        protocol_flags(reader_protocol).is_some()
    }

    fn activate_protocol(&mut self, reader_protocol: &str) -> Result<(), DriverError> {
        let flags = protocol_flags(reader_protocol)
            .ok_or_else(|| DriverError::ReaderIo(format!("unknown protocol {reader_protocol}")))?;
        self.protocols.activate(flags);
        trace!(reader = %self.name, protocols = ?self.protocols, "Protocol activated");
        Ok(())
    }

    fn deactivate_protocol(&mut self, reader_protocol: &str) -> Result<(), DriverError> {
        let flags = protocol_flags(reader_protocol)
            .ok_or_else(|| DriverError::ReaderIo(format!("unknown protocol {reader_protocol}")))?;
        self.protocols.deactivate(flags);
        trace!(reader = %self.name, protocols = ?self.protocols, "Protocol deactivated");
        Ok(())
    }

    fn is_current_protocol(&self, reader_protocol: &str) -> bool {
        current_flags(self.current_protocol)
            .is_some_and(|current| protocol_flags(reader_protocol) == Some(current))
    }
}

impl Drop for PcscDriver {
    fn drop(&mut self) {
        self.stop_waiters();
        if let Some(card) = self.card.take() {
            let _ = card.disconnect(Disposition::LeaveCard);
        }
    }
}

/// Protocols offered on the next connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProtocolSelection {
    active: Protocols,
    /// Set by the first activation, which drops the configured set
    explicit: bool,
}

impl ProtocolSelection {
    const fn new(configured: Protocols) -> Self {
        Self {
            active: configured,
            explicit: false,
        }
    }

    fn activate(&mut self, flags: Protocols) {
        if !self.explicit {
            self.active = Protocols::empty();
            self.explicit = true;
        }
        self.active |= flags;
    }

    fn deactivate(&mut self, flags: Protocols) {
        self.active.remove(flags);
    }

    /// None activated means any
    const fn offered(&self) -> Protocols {
        if self.active.is_empty() {
            Protocols::ANY
        } else {
            self.active
        }
    }
}

fn current_flags(protocol: Option<Protocol>) -> Option<Protocols> {
    match protocol? {
        Protocol::T0 => Some(Protocols::T0),
        Protocol::T1 => Some(Protocols::T1),
        Protocol::RAW => Some(Protocols::RAW),
        _ => None,
    }
}

fn protocol_flags(reader_protocol: &str) -> Option<Protocols> {
    READER_PROTOCOLS
        .iter()
        .find(|(name, _)| *name == reader_protocol)
        .map(|(_, flags)| *flags)
}
