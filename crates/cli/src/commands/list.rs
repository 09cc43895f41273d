use cardlane_pcsc::{PcscDeviceManager, PcscError};

pub(crate) fn list_command(manager: &PcscDeviceManager) -> anyhow::Result<()> {
    let readers = match manager.list_readers() {
        Ok(readers) => readers,
        Err(PcscError::NoReadersAvailable) => {
            println!("No readers available");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    println!("Available readers:");
    for (index, reader) in readers.iter().enumerate() {
        let status = if reader.has_card() { "card present" } else { "empty" };
        println!("{}. {} ({status})", index + 1, reader.name());
        if let Some(atr) = reader.atr() {
            println!("   ATR: {}", hex::encode_upper(atr));
        }
    }

    Ok(())
}
