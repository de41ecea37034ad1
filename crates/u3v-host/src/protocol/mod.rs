//! GenCP command/acknowledge framing.
//!
//! U3V carries its control protocol (GenCP) over the bulk endpoints of the
//! control interface. Every packet starts with the ASCII prefix `"U3VC"`
//! followed by a 12-byte little-endian header; the payload length travels
//! in the header so packets can be framed without peeking at the payload.
//!
//! [`cmd`] serializes outbound commands, [`ack`] parses inbound
//! acknowledges. The transaction loop that ties the two together (request
//! id allocation, PENDING_ACK retries, chunking) lives in
//! [`crate::control`].

pub mod ack;
pub mod cmd;

/// Packet prefix, `"U3VC"` when serialized little-endian.
pub const PACKET_PREFIX: u32 = 0x4356_3355;

/// Command header size: prefix(4) + flags(2) + command(2) + length(2) +
/// request_id(2).
pub const CMD_HEADER_SIZE: usize = 12;

/// Acknowledge header size: prefix(4) + status(2) + acknowledge(2) +
/// length(2) + request_id(2).
pub const ACK_HEADER_SIZE: usize = 12;

/// Flags bit 0 — the host expects an acknowledge for this command.
pub const FLAG_REQUEST_ACK: u16 = 0x0001;
