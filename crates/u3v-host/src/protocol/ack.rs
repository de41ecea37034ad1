//! Acknowledge packet parsing.
//!
//! An acknowledge mirrors the command header: same prefix, a status word
//! instead of flags, an acknowledge code instead of a command code. The
//! status word decides how the transaction proceeds: success hands the
//! payload to the caller, PENDING_ACK asks the host to keep waiting, and
//! everything else is a device-side NAK.

use std::fmt;
use std::time::Duration;

use crate::error::{ControlError, ControlResult};
use crate::protocol::{ACK_HEADER_SIZE, PACKET_PREFIX};

/// Acknowledge code for a successful READMEM.
pub const ACK_READMEM: u16 = 0x0801;

/// Acknowledge code for a successful WRITEMEM.
pub const ACK_WRITEMEM: u16 = 0x0803;

/// Acknowledge code carried by PENDING_ACK packets.
pub const ACK_PENDING: u16 = 0x0805;

/// Status word: transaction completed.
pub const STATUS_SUCCESS: u16 = 0x0000;

/// Status word: device needs more time, retry with the suggested timeout.
pub const STATUS_PENDING_ACK: u16 = 0x8001;

/// Device-side error statuses (anything that is neither success nor
/// pending).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakCode {
    InvalidParameter,
    InvalidAddress,
    WriteProtect,
    BadAlignment,
    AccessDenied,
    Busy,
    NotImplemented,
    MsgTimeout,
    InvalidHeader,
    WrongConfig,
    GenericError,
    Unknown(u16),
}

impl NakCode {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x8002 => NakCode::InvalidParameter,
            0x8003 => NakCode::InvalidAddress,
            0x8004 => NakCode::WriteProtect,
            0x8005 => NakCode::BadAlignment,
            0x8006 => NakCode::AccessDenied,
            0x8007 => NakCode::Busy,
            0x800A => NakCode::NotImplemented,
            0x800B => NakCode::MsgTimeout,
            0x800E => NakCode::InvalidHeader,
            0x800F => NakCode::WrongConfig,
            0x8FFF => NakCode::GenericError,
            other => NakCode::Unknown(other),
        }
    }

    pub fn raw(&self) -> u16 {
        match self {
            NakCode::InvalidParameter => 0x8002,
            NakCode::InvalidAddress => 0x8003,
            NakCode::WriteProtect => 0x8004,
            NakCode::BadAlignment => 0x8005,
            NakCode::AccessDenied => 0x8006,
            NakCode::Busy => 0x8007,
            NakCode::NotImplemented => 0x800A,
            NakCode::MsgTimeout => 0x800B,
            NakCode::InvalidHeader => 0x800E,
            NakCode::WrongConfig => 0x800F,
            NakCode::GenericError => 0x8FFF,
            NakCode::Unknown(raw) => *raw,
        }
    }
}

impl fmt::Display for NakCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NakCode::InvalidParameter => write!(f, "invalid parameter"),
            NakCode::InvalidAddress => write!(f, "invalid address"),
            NakCode::WriteProtect => write!(f, "write protect"),
            NakCode::BadAlignment => write!(f, "bad alignment"),
            NakCode::AccessDenied => write!(f, "access denied"),
            NakCode::Busy => write!(f, "device busy"),
            NakCode::NotImplemented => write!(f, "not implemented"),
            NakCode::MsgTimeout => write!(f, "message timeout"),
            NakCode::InvalidHeader => write!(f, "invalid header"),
            NakCode::WrongConfig => write!(f, "wrong configuration"),
            NakCode::GenericError => write!(f, "generic error"),
            NakCode::Unknown(raw) => write!(f, "unknown status {raw:#06x}"),
        }
    }
}

/// Decoded status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Pending,
    Nak(NakCode),
}

impl Status {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            STATUS_SUCCESS => Status::Success,
            STATUS_PENDING_ACK => Status::Pending,
            other => Status::Nak(NakCode::from_raw(other)),
        }
    }
}

/// A parsed acknowledge, borrowing its payload from the receive buffer.
#[derive(Debug)]
pub struct AckPacket<'a> {
    pub status: Status,
    pub acknowledge: u16,
    pub request_id: u16,
    pub payload: &'a [u8],
}

impl<'a> AckPacket<'a> {
    /// Parse an acknowledge out of `buf`.
    ///
    /// `buf` must contain exactly the bytes of one bulk transfer; trailing
    /// bytes beyond the declared payload length are tolerated (a device may
    /// pad to its transfer granularity) but the payload slice stops at the
    /// declared length.
    pub fn parse(buf: &'a [u8]) -> ControlResult<Self> {
        if buf.len() < ACK_HEADER_SIZE {
            return Err(ControlError::InvalidPacket(format!(
                "acknowledge of {} bytes is shorter than its {ACK_HEADER_SIZE}-byte header",
                buf.len()
            )));
        }

        let prefix = u32::from_le_bytes(buf[0..4].try_into().unwrap_or_default());
        if prefix != PACKET_PREFIX {
            return Err(ControlError::InvalidPacket(format!(
                "acknowledge prefix {prefix:#010x} is not {PACKET_PREFIX:#010x}"
            )));
        }

        let status = Status::from_raw(u16::from_le_bytes(buf[4..6].try_into().unwrap_or_default()));
        let acknowledge = u16::from_le_bytes(buf[6..8].try_into().unwrap_or_default());
        let length = u16::from_le_bytes(buf[8..10].try_into().unwrap_or_default()) as usize;
        let request_id = u16::from_le_bytes(buf[10..12].try_into().unwrap_or_default());

        if buf.len() < ACK_HEADER_SIZE + length {
            return Err(ControlError::InvalidPacket(format!(
                "acknowledge declares {length} payload bytes but only {} arrived",
                buf.len() - ACK_HEADER_SIZE
            )));
        }

        Ok(AckPacket {
            status,
            acknowledge,
            request_id,
            payload: &buf[ACK_HEADER_SIZE..ACK_HEADER_SIZE + length],
        })
    }
}

/// PENDING_ACK payload: a suggested timeout for the follow-up acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub timeout: Duration,
}

impl Pending {
    /// Payload layout: `u16` reserved, then the timeout in milliseconds.
    pub fn parse(payload: &[u8]) -> ControlResult<Self> {
        if payload.len() < 4 {
            return Err(ControlError::InvalidPacket(format!(
                "pending acknowledge payload of {} bytes is too short",
                payload.len()
            )));
        }
        let millis = u16::from_le_bytes(payload[2..4].try_into().unwrap_or_default());
        Ok(Pending {
            timeout: Duration::from_millis(u64::from(millis)),
        })
    }
}

/// WRITEMEM acknowledge payload: `u16` reserved, then the written length.
///
/// Returns `None` when the device omits the payload entirely (legal — the
/// status word already confirms the write).
pub fn written_length(payload: &[u8]) -> Option<u16> {
    if payload.len() < 4 {
        return None;
    }
    Some(u16::from_le_bytes(payload[2..4].try_into().unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(status: u16, acknowledge: u16, request_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ACK_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&PACKET_PREFIX.to_le_bytes());
        buf.extend_from_slice(&status.to_le_bytes());
        buf.extend_from_slice(&acknowledge.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&request_id.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parse_success_ack() {
        let buf = frame(STATUS_SUCCESS, ACK_READMEM, 42, &[1, 2, 3, 4]);
        let ack = AckPacket::parse(&buf).unwrap();
        assert_eq!(ack.status, Status::Success);
        assert_eq!(ack.acknowledge, ACK_READMEM);
        assert_eq!(ack.request_id, 42);
        assert_eq!(ack.payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn parse_tolerates_trailing_padding() {
        let mut buf = frame(STATUS_SUCCESS, ACK_READMEM, 1, &[0xAB; 4]);
        buf.extend_from_slice(&[0u8; 8]); // device pads to transfer granularity
        let ack = AckPacket::parse(&buf).unwrap();
        assert_eq!(ack.payload, &[0xAB; 4]);
    }

    #[test]
    fn parse_rejects_short_buffer() {
        let err = AckPacket::parse(&[0u8; 11]).unwrap_err();
        assert!(matches!(err, ControlError::InvalidPacket(_)));
    }

    #[test]
    fn parse_rejects_bad_prefix() {
        let mut buf = frame(STATUS_SUCCESS, ACK_READMEM, 0, &[]);
        buf[0] = b'X';
        let err = AckPacket::parse(&buf).unwrap_err();
        assert!(matches!(err, ControlError::InvalidPacket(_)));
        assert!(err.to_string().contains("prefix"));
    }

    #[test]
    fn parse_rejects_truncated_payload() {
        let mut buf = frame(STATUS_SUCCESS, ACK_READMEM, 0, &[1, 2, 3, 4]);
        buf.truncate(ACK_HEADER_SIZE + 2);
        let err = AckPacket::parse(&buf).unwrap_err();
        assert!(matches!(err, ControlError::InvalidPacket(_)));
    }

    #[test]
    fn status_decoding() {
        assert_eq!(Status::from_raw(0x0000), Status::Success);
        assert_eq!(Status::from_raw(0x8001), Status::Pending);
        assert_eq!(
            Status::from_raw(0x8004),
            Status::Nak(NakCode::WriteProtect)
        );
        assert_eq!(
            Status::from_raw(0x1234),
            Status::Nak(NakCode::Unknown(0x1234))
        );
    }

    #[test]
    fn nak_code_raw_round_trip() {
        for raw in [
            0x8002u16, 0x8003, 0x8004, 0x8005, 0x8006, 0x8007, 0x800A, 0x800B, 0x800E, 0x800F,
            0x8FFF, 0xBEEF,
        ] {
            assert_eq!(NakCode::from_raw(raw).raw(), raw);
        }
    }

    #[test]
    fn pending_payload_parse() {
        let pending = Pending::parse(&[0, 0, 0x2C, 0x01]).unwrap();
        assert_eq!(pending.timeout, Duration::from_millis(300));
    }

    #[test]
    fn pending_payload_too_short() {
        let err = Pending::parse(&[0, 0]).unwrap_err();
        assert!(matches!(err, ControlError::InvalidPacket(_)));
    }

    #[test]
    fn written_length_present_and_absent() {
        assert_eq!(written_length(&[0, 0, 8, 0]), Some(8));
        assert_eq!(written_length(&[]), None);
        assert_eq!(written_length(&[0, 0]), None);
    }
}
