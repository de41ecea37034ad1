//! Command packet serialization.
//!
//! A command packet is a 12-byte header followed by the command-specific
//! data (SCD). Two commands exist on the control channel: READMEM and
//! WRITEMEM. Both address the device's register space by 64-bit address.

use crate::error::{ControlError, ControlResult};
use crate::protocol::{CMD_HEADER_SIZE, FLAG_REQUEST_ACK, PACKET_PREFIX};

/// READMEM command id.
pub const COMMAND_READMEM: u16 = 0x0800;

/// WRITEMEM command id.
pub const COMMAND_WRITEMEM: u16 = 0x0802;

/// Command-specific data: id, length and serialization of one command kind.
pub trait CommandScd {
    /// Command id carried in the packet header.
    const COMMAND: u16;

    /// Byte length of the serialized SCD.
    fn scd_len(&self) -> u16;

    /// Append the SCD bytes to `buf`.
    fn serialize_scd(&self, buf: &mut Vec<u8>);
}

/// READMEM — read `read_length` bytes starting at `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadMem {
    pub address: u64,
    pub read_length: u16,
}

impl CommandScd for ReadMem {
    const COMMAND: u16 = COMMAND_READMEM;

    fn scd_len(&self) -> u16 {
        8 + 2
    }

    fn serialize_scd(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.address.to_le_bytes());
        buf.extend_from_slice(&self.read_length.to_le_bytes());
    }
}

/// WRITEMEM — write `data` starting at `address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMem<'a> {
    address: u64,
    data: &'a [u8],
}

impl<'a> WriteMem<'a> {
    /// Fails when `data` does not fit the 16-bit SCD length field.
    pub fn new(address: u64, data: &'a [u8]) -> ControlResult<Self> {
        if data.len() > (u16::MAX as usize) - 8 {
            return Err(ControlError::InvalidPacket(format!(
                "WRITEMEM data of {} bytes overflows the packet length field",
                data.len()
            )));
        }
        Ok(Self { address, data })
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }
}

impl CommandScd for WriteMem<'_> {
    const COMMAND: u16 = COMMAND_WRITEMEM;

    fn scd_len(&self) -> u16 {
        8 + self.data.len() as u16
    }

    fn serialize_scd(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.address.to_le_bytes());
        buf.extend_from_slice(self.data);
    }
}

/// A complete outbound command: header + SCD, tagged with a request id.
///
/// The acknowledge must echo the request id; the transaction loop in
/// [`crate::control`] enforces the match.
#[derive(Debug, Clone, Copy)]
pub struct CommandPacket<S> {
    scd: S,
    request_id: u16,
}

impl<S: CommandScd> CommandPacket<S> {
    pub fn new(scd: S, request_id: u16) -> Self {
        Self { scd, request_id }
    }

    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Total serialized length, header included.
    pub fn cmd_len(&self) -> usize {
        CMD_HEADER_SIZE + self.scd.scd_len() as usize
    }

    /// Serialize the whole packet into `buf`, replacing its contents.
    ///
    /// The request-ack flag is always set: the control channel is strictly
    /// request/response.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.reserve(self.cmd_len());
        buf.extend_from_slice(&PACKET_PREFIX.to_le_bytes());
        buf.extend_from_slice(&FLAG_REQUEST_ACK.to_le_bytes());
        buf.extend_from_slice(&S::COMMAND.to_le_bytes());
        buf.extend_from_slice(&self.scd.scd_len().to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        self.scd.serialize_scd(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_u16(buf: &[u8], offset: usize) -> u16 {
        u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
    }

    #[test]
    fn readmem_layout() {
        let pkt = CommandPacket::new(
            ReadMem {
                address: 0x0000_0000_0001_0144,
                read_length: 64,
            },
            7,
        );
        let mut buf = Vec::new();
        pkt.serialize_into(&mut buf);

        assert_eq!(buf.len(), 12 + 10);
        assert_eq!(&buf[0..4], b"U3VC");
        assert_eq!(field_u16(&buf, 4), FLAG_REQUEST_ACK);
        assert_eq!(field_u16(&buf, 6), COMMAND_READMEM);
        assert_eq!(field_u16(&buf, 8), 10); // scd length
        assert_eq!(field_u16(&buf, 10), 7); // request id
        assert_eq!(
            u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            0x0000_0000_0001_0144
        );
        assert_eq!(field_u16(&buf, 20), 64); // read length
    }

    #[test]
    fn writemem_layout() {
        let data = [0xAA, 0xBB, 0xCC];
        let pkt = CommandPacket::new(WriteMem::new(0x0184, &data).unwrap(), 0xFFFF);
        let mut buf = Vec::new();
        pkt.serialize_into(&mut buf);

        assert_eq!(buf.len(), 12 + 8 + 3);
        assert_eq!(field_u16(&buf, 6), COMMAND_WRITEMEM);
        assert_eq!(field_u16(&buf, 8), 11); // scd length: address + data
        assert_eq!(field_u16(&buf, 10), 0xFFFF);
        assert_eq!(u64::from_le_bytes(buf[12..20].try_into().unwrap()), 0x0184);
        assert_eq!(&buf[20..], &data);
    }

    #[test]
    fn writemem_rejects_oversized_data() {
        let data = vec![0u8; u16::MAX as usize];
        let err = WriteMem::new(0, &data).unwrap_err();
        assert!(matches!(err, ControlError::InvalidPacket(_)));
    }

    #[test]
    fn writemem_accepts_maximum_data() {
        let data = vec![0u8; u16::MAX as usize - 8];
        let scd = WriteMem::new(0, &data).unwrap();
        assert_eq!(scd.scd_len(), u16::MAX);
    }

    #[test]
    fn serialize_into_replaces_previous_contents() {
        let mut buf = vec![0xEE; 100];
        let pkt = CommandPacket::new(
            ReadMem {
                address: 0,
                read_length: 4,
            },
            0,
        );
        pkt.serialize_into(&mut buf);
        assert_eq!(buf.len(), pkt.cmd_len());
        assert_eq!(&buf[0..4], b"U3VC");
    }

    #[test]
    fn request_id_wraps_naturally() {
        // The allocator wraps at 2^16; the packet just carries the value.
        let pkt = CommandPacket::new(
            ReadMem {
                address: 0,
                read_length: 1,
            },
            u16::MAX,
        );
        assert_eq!(pkt.request_id(), u16::MAX);
    }
}
