//! Short APDU commands (ISO/IEC 7816-4)
//!
//! Only the short form is modelled: one byte Lc, at most 255 data bytes, one byte Le.
//! The helpers at the bottom build the few commands the reader layer issues on its own
//! (SELECT by name, GET RESPONSE, GET DATA and the presence ping).

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// Instruction byte of SELECT
pub const INS_SELECT: u8 = 0xA4;
/// Instruction byte of GET RESPONSE
pub const INS_GET_RESPONSE: u8 = 0xC0;
/// Instruction byte of GET DATA
pub const INS_GET_DATA: u8 = 0xCA;

/// Generic APDU command structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command class byte
    pub cla: u8,
    /// Instruction byte
    pub ins: u8,
    /// Parameter 1
    pub p1: u8,
    /// Parameter 2
    pub p2: u8,
    /// Command data (optional)
    pub data: Option<Bytes>,
    /// Expected length (optional, 0x00 means "up to 256")
    pub le: Option<u8>,
}

impl Command {
    /// Create a new command with just the header bytes
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: None,
        }
    }

    /// Create a new command with expected response length (Le)
    pub const fn new_with_le(cla: u8, ins: u8, p1: u8, p2: u8, le: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: None,
            le: Some(le),
        }
    }

    /// Set the data field
    pub fn with_data<T: Into<Bytes>>(mut self, data: T) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Set the expected length field
    pub const fn with_le(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    /// SELECT by DF name (`00 A4 04 P2 Lc AID 00`)
    pub fn select_application(aid: &[u8], p2: u8) -> Self {
        Self::new(0x00, INS_SELECT, 0x04, p2)
            .with_data(Bytes::copy_from_slice(aid))
            .with_le(0x00)
    }

    /// GET RESPONSE (`00 C0 00 00 Le`)
    pub const fn get_response(le: u8) -> Self {
        Self::new_with_le(0x00, INS_GET_RESPONSE, 0x00, 0x00, le)
    }

    /// GET DATA for the FCI template (`00 CA 00 6F 00`)
    pub const fn get_data_fci() -> Self {
        Self::new_with_le(0x00, INS_GET_DATA, 0x00, 0x6F, 0x00)
    }

    /// Command used to probe whether a card still answers
    ///
    /// A GET RESPONSE with nothing pending: any status word proves the card is there,
    /// only an I/O failure means it is gone.
    pub const fn presence_ping() -> Self {
        Self::get_response(0x00)
    }

    /// Whether the command carries both data and Le
    pub const fn is_case4(&self) -> bool {
        self.data.is_some() && self.le.is_some()
    }

    /// Calculate length of serialized command
    pub fn command_length(&self) -> usize {
        4 + self.data.as_ref().map_or(0, |data| 1 + data.len()) + usize::from(self.le.is_some())
    }

    /// Serialize to raw APDU bytes
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(self.command_length());

        buffer.put_u8(self.cla);
        buffer.put_u8(self.ins);
        buffer.put_u8(self.p1);
        buffer.put_u8(self.p2);

        if let Some(data) = &self.data {
            let lc = u8::try_from(data.len()).map_err(|_| Error::DataTooLong(data.len()))?;
            buffer.put_u8(lc);
            buffer.put_slice(data);
        }

        if let Some(le) = self.le {
            buffer.put_u8(le);
        }

        Ok(buffer.freeze())
    }

    /// Parse a command from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::InvalidCommandLength(data.len()));
        }

        let mut command = Self::new(data[0], data[1], data[2], data[3]);

        match data.len() {
            4 => {}
            5 => command.le = Some(data[4]),
            len => {
                let lc = data[4] as usize;
                if len == 5 + lc {
                    command.data = Some(Bytes::copy_from_slice(&data[5..5 + lc]));
                } else if len == 6 + lc {
                    command.data = Some(Bytes::copy_from_slice(&data[5..5 + lc]));
                    command.le = Some(data[5 + lc]);
                } else {
                    return Err(Error::InvalidCommandLength(len));
                }
            }
        }

        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}",
            self.cla, self.ins, self.p1, self.p2
        )?;
        if let Some(data) = &self.data {
            write!(f, "{:02X}{}", data.len(), hex::encode_upper(data))?;
        }
        if let Some(le) = self.le {
            write!(f, "{:02X}", le)?;
        }
        Ok(())
    }
}

/// Whether raw APDU bytes form a case-4 short command (Lc, data and Le all present)
pub fn is_case4(apdu: &[u8]) -> bool {
    apdu.len() > 5 && apdu[4] as usize == apdu.len() - 6
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_select_application_serialization() {
        let cmd = Command::select_application(&hex!("A000000151000000"), 0x00);
        assert_eq!(
            cmd.to_bytes().unwrap().as_ref(),
            hex!("00A4040008A00000015100000000")
        );
        assert!(cmd.is_case4());
    }

    #[test]
    fn test_internal_commands() {
        assert_eq!(
            Command::get_response(0x1C).to_bytes().unwrap().as_ref(),
            hex!("00C000001C")
        );
        assert_eq!(
            Command::get_data_fci().to_bytes().unwrap().as_ref(),
            hex!("00CA006F00")
        );
        assert_eq!(
            Command::presence_ping().to_bytes().unwrap().as_ref(),
            hex!("00C0000000")
        );
    }

    #[test]
    fn test_data_too_long() {
        let cmd = Command::new(0x00, 0xD6, 0x00, 0x00).with_data(vec![0u8; 256]);
        assert_eq!(cmd.to_bytes(), Err(Error::DataTooLong(256)));
    }

    #[test]
    fn test_command_from_bytes() {
        let cmd = Command::from_bytes(&hex!("00A40400")).unwrap();
        assert!(cmd.data.is_none());
        assert!(cmd.le.is_none());

        let cmd = Command::from_bytes(&hex!("00B00000FF")).unwrap();
        assert_eq!(cmd.le, Some(0xFF));

        let cmd = Command::from_bytes(&hex!("00A4040003010203")).unwrap();
        assert_eq!(cmd.data.as_deref(), Some(&hex!("010203")[..]));
        assert!(cmd.le.is_none());

        let cmd = Command::from_bytes(&hex!("00A404000301020300")).unwrap();
        assert_eq!(cmd.le, Some(0x00));
        assert!(cmd.is_case4());

        assert_eq!(
            Command::from_bytes(&hex!("00A40400050102")),
            Err(Error::InvalidCommandLength(7))
        );
    }

    #[test]
    fn test_is_case4_raw() {
        assert!(is_case4(&hex!("00A404000301020300")));
        assert!(!is_case4(&hex!("00A4040003010203")));
        assert!(!is_case4(&hex!("00B0000010")));
        assert!(!is_case4(&hex!("00A40400")));
    }

    #[test]
    fn test_display_is_upper_hex() {
        let cmd = Command::select_application(&hex!("a0000000030000"), 0x0C);
        assert_eq!(cmd.to_string(), "00A4040C07A000000003000000");
    }
}
