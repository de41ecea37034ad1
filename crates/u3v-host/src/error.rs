//! Error types for the u3v-host crate.
//!
//! Two families, matching the two halves of the system: [`ControlError`]
//! for everything the control channel can report, and [`StreamError`] for
//! the streaming collaborator. `From` impls allow `?` to propagate across
//! module boundaries seamlessly.
//!
//! String payloads follow the convention **"context: details"** where
//! *context* identifies the operation or step (e.g. `"libusb"`,
//! `"manifest"`) and *details* describes what went wrong. Bare
//! descriptions (no colon) are acceptable when no inner error is being
//! wrapped.

use std::fmt;

use crate::protocol::ack::NakCode;

/// Errors reported by the control channel and the register map built on it.
#[derive(Debug)]
pub enum ControlError {
    /// Transport failure (bulk transfer error, claim failure, ...).
    Io(String),
    /// The device is gone or does not expose a U3V control interface.
    InvalidDevice(String),
    /// A packet violated the wire format: bad prefix, request id mismatch,
    /// length overflow.
    InvalidPacket(String),
    /// The device answered with a non-success status.
    Nak(NakCode),
    /// A bulk transfer did not complete within the configured timeout.
    Timeout,
    /// The device kept answering PENDING_ACK past the configured retry count.
    PendingAckExceeded,
    /// The operation requires an opened handle.
    NotOpened,
    /// A buffer cannot hold the data it is asked to carry.
    BufferTooSmall(String),
    /// Register content violates its declared shape (enum value, encoding,
    /// width).
    ParseError(String),
    /// The device does not support the requested operation (missing SIRM,
    /// capability bit clear, read-only register).
    NotSupported(String),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Io(e) => write!(f, "I/O error: {e}"),
            ControlError::InvalidDevice(e) => write!(f, "invalid device: {e}"),
            ControlError::InvalidPacket(e) => write!(f, "invalid packet: {e}"),
            ControlError::Nak(code) => write!(f, "device returned an error status: {code}"),
            ControlError::Timeout => write!(f, "operation timed out"),
            ControlError::PendingAckExceeded => {
                write!(f, "pending acknowledge retry count exceeded")
            }
            ControlError::NotOpened => write!(f, "device is not opened"),
            ControlError::BufferTooSmall(e) => write!(f, "buffer too small: {e}"),
            ControlError::ParseError(e) => write!(f, "parse error: {e}"),
            ControlError::NotSupported(e) => write!(f, "not supported: {e}"),
        }
    }
}

impl std::error::Error for ControlError {}

/// Result alias for control-channel operations.
pub type ControlResult<T> = std::result::Result<T, ControlError>;

impl From<rusb::Error> for ControlError {
    /// Maps libusb error codes onto the control taxonomy.
    ///
    /// `NotFound` and `NoDevice` mean the device (or its interface) is not
    /// there anymore and become [`ControlError::InvalidDevice`]; `Timeout`
    /// keeps its own kind; every remaining code (`Access`, `Busy`, `Io`,
    /// `Pipe`, `Overflow`, `InvalidParam`, `Interrupted`, `NoMem`,
    /// `NotSupported`, `BadDescriptor`, `Other`) is a transport-level
    /// [`ControlError::Io`].
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => ControlError::Timeout,
            rusb::Error::NotFound | rusb::Error::NoDevice => {
                ControlError::InvalidDevice(format!("libusb: {e}"))
            }
            other => ControlError::Io(format!("libusb: {other}")),
        }
    }
}

/// Errors reported by the streaming collaborator.
///
/// The stream engine maps its underlying transport failures the same way
/// the control channel does, but its surface is much narrower: either the
/// transfer failed or a payload packet was malformed.
#[derive(Debug)]
pub enum StreamError {
    Io(String),
    InvalidPacket(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Io(e) => write!(f, "I/O error: {e}"),
            StreamError::InvalidPacket(e) => write!(f, "invalid packet: {e}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Result alias for streaming operations.
pub type StreamResult<T> = std::result::Result<T, StreamError>;

impl From<ControlError> for StreamError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::InvalidPacket(msg) => StreamError::InvalidPacket(msg),
            other => StreamError::Io(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libusb_not_found_maps_to_invalid_device() {
        let e: ControlError = rusb::Error::NotFound.into();
        assert!(matches!(e, ControlError::InvalidDevice(_)));
    }

    #[test]
    fn libusb_no_device_maps_to_invalid_device() {
        let e: ControlError = rusb::Error::NoDevice.into();
        assert!(matches!(e, ControlError::InvalidDevice(_)));
    }

    #[test]
    fn libusb_timeout_maps_to_timeout() {
        let e: ControlError = rusb::Error::Timeout.into();
        assert!(matches!(e, ControlError::Timeout));
    }

    #[test]
    fn libusb_remainder_maps_to_io() {
        for raw in [
            rusb::Error::Access,
            rusb::Error::Busy,
            rusb::Error::Io,
            rusb::Error::Pipe,
            rusb::Error::Overflow,
            rusb::Error::InvalidParam,
            rusb::Error::Interrupted,
            rusb::Error::NoMem,
            rusb::Error::NotSupported,
            rusb::Error::BadDescriptor,
            rusb::Error::Other,
        ] {
            let e: ControlError = raw.into();
            assert!(matches!(e, ControlError::Io(_)), "{raw} should map to Io");
        }
    }

    #[test]
    fn io_message_keeps_libusb_context() {
        let e: ControlError = rusb::Error::Pipe.into();
        assert!(e.to_string().contains("libusb"));
    }

    #[test]
    fn display_timeout() {
        assert_eq!(ControlError::Timeout.to_string(), "operation timed out");
    }

    #[test]
    fn display_not_opened() {
        assert_eq!(ControlError::NotOpened.to_string(), "device is not opened");
    }

    #[test]
    fn display_nak_includes_code() {
        let e = ControlError::Nak(NakCode::WriteProtect);
        assert!(e.to_string().contains("write protect"));
    }

    #[test]
    fn stream_error_from_control_invalid_packet() {
        let e: StreamError = ControlError::InvalidPacket("bad prefix".into()).into();
        assert!(matches!(e, StreamError::InvalidPacket(_)));
    }

    #[test]
    fn stream_error_from_control_other() {
        let e: StreamError = ControlError::Timeout.into();
        assert!(matches!(e, StreamError::Io(_)));
        assert!(e.to_string().contains("timed out"));
    }

    #[test]
    fn question_mark_propagation_rusb_to_control() {
        fn inner() -> std::result::Result<(), rusb::Error> {
            Err(rusb::Error::Timeout)
        }
        fn outer() -> ControlResult<()> {
            inner()?;
            Ok(())
        }
        assert!(matches!(outer().unwrap_err(), ControlError::Timeout));
    }
}
