//! Device manager for PC/SC operations

use std::fmt;

use cardlane_reader::{ObservableReader, ReaderConfig};
use pcsc::{Context, ReaderState, Scope, State};
use tracing::{debug, trace};

use crate::{ConnectStrategy, PcscConfig, PcscDriver, PcscError, PcscReader};

/// Plugin name carried by the events of PC/SC readers
pub const PLUGIN_NAME: &str = "PcscPlugin";

/// Lists PC/SC readers and builds drivers for them
pub struct PcscDeviceManager {
    context: Context,
    config: PcscConfig,
}

impl fmt::Debug for PcscDeviceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscDeviceManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PcscDeviceManager {
    /// Establish a PC/SC context with the default driver configuration
    pub fn new() -> Result<Self, PcscError> {
        Self::with_config(PcscConfig::default())
    }

    /// Establish a PC/SC context; drivers opened later use `config`
    pub fn with_config(config: PcscConfig) -> Result<Self, PcscError> {
        let context = Context::establish(Scope::User)?;
        Ok(Self { context, config })
    }

    /// List all available card readers
    pub fn list_readers(&self) -> Result<Vec<PcscReader>, PcscError> {
        let names = match self.context.list_readers_owned() {
            Ok(names) => names,
            Err(pcsc::Error::NoReadersAvailable) => return Err(PcscError::NoReadersAvailable),
            Err(err) => return Err(err.into()),
        };
        if names.is_empty() {
            return Err(PcscError::NoReadersAvailable);
        }

        let mut states: Vec<_> = names
            .into_iter()
            .map(|name| ReaderState::new(name, State::UNAWARE))
            .collect();
        self.context.get_status_change(None, &mut states)?;

        let readers: Vec<_> = states.iter().map(PcscReader::from_reader_state).collect();
        trace!(count = readers.len(), "Readers listed");
        Ok(readers)
    }

    /// Pick a reader name following `strategy`
    pub fn find_reader(&self, strategy: &ConnectStrategy) -> Result<String, PcscError> {
        let readers = self.list_readers()?;
        let found = match strategy {
            ConnectStrategy::Reader(name) => {
                readers.iter().find(|reader| reader.name() == name.as_str())
            }
            ConnectStrategy::AnyCard => readers.iter().find(|reader| reader.has_card()),
            ConnectStrategy::FirstAvailable => readers.first(),
        };
        match (found, strategy) {
            (Some(reader), _) => Ok(reader.name().to_string()),
            (None, ConnectStrategy::Reader(name)) => Err(PcscError::ReaderNotFound(name.clone())),
            (None, ConnectStrategy::AnyCard) => {
                Err(PcscError::NoCard("no reader holds a card".to_string()))
            }
            (None, ConnectStrategy::FirstAvailable) => Err(PcscError::NoReadersAvailable),
        }
    }

    /// Build the channel driver of one reader
    pub fn open_driver(&self, reader_name: &str) -> Result<PcscDriver, PcscError> {
        PcscDriver::new(self.context.clone(), reader_name, self.config.clone())
    }

    /// Build an observable reader over one PC/SC reader
    pub fn open_reader(
        &self,
        reader_name: &str,
        config: ReaderConfig,
    ) -> Result<ObservableReader, PcscError> {
        let driver = self.open_driver(reader_name)?;
        let reader = ObservableReader::new(driver, PLUGIN_NAME, config)?;
        debug!(reader = %reader_name, "PC/SC reader opened");
        Ok(reader)
    }
}
