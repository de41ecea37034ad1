//! Bootstrap register maps — typed accessors over the device's memory.
//!
//! U3V devices expose their configuration as memory-mapped registers with
//! a bit-exact little-endian layout fixed by the standard: the ABRM at
//! address zero, the SBRM and SIRM behind pointers, and a manifest table
//! listing embedded files (notably the GenICam XML). This module holds the
//! register definitions as static constants, the binary parse/dump
//! machinery, and accessor structs that read and write typed values
//! through any [`DeviceControl`].

use std::time::Duration;

use crate::control::DeviceControl;
use crate::device::BusSpeed;
use crate::error::{ControlError, ControlResult};

// ── Register definitions ──

/// Access privilege of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    RO,
    WO,
    RW,
}

impl Access {
    pub fn is_readable(self) -> bool {
        matches!(self, Access::RO | Access::RW)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Access::WO | Access::RW)
    }
}

/// One field of a register map: address, width and access privilege.
///
/// ABRM registers carry absolute addresses; SBRM/SIRM/manifest registers
/// are relative to their block's base and relocated with [`Register::at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub address: u64,
    pub len: u16,
    pub access: Access,
}

impl Register {
    pub const fn new(address: u64, len: u16, access: Access) -> Self {
        Self {
            address,
            len,
            access,
        }
    }

    /// Relocate a block-relative register onto `base`.
    pub const fn at(self, base: u64) -> Self {
        Self {
            address: base + self.address,
            ..self
        }
    }
}

/// ABRM — Advertised Bootstrap Register Map, at device address zero.
pub mod abrm {
    use super::{Access, Register};

    pub const GENCP_VERSION: Register = Register::new(0x0000, 4, Access::RO);
    pub const MANUFACTURER_NAME: Register = Register::new(0x0004, 64, Access::RO);
    pub const MODEL_NAME: Register = Register::new(0x0044, 64, Access::RO);
    pub const FAMILY_NAME: Register = Register::new(0x0084, 64, Access::RO);
    pub const DEVICE_VERSION: Register = Register::new(0x00C4, 64, Access::RO);
    pub const MANUFACTURER_INFO: Register = Register::new(0x0104, 64, Access::RO);
    pub const SERIAL_NUMBER: Register = Register::new(0x0144, 64, Access::RO);
    pub const USER_DEFINED_NAME: Register = Register::new(0x0184, 64, Access::RW);
    pub const DEVICE_CAPABILITY: Register = Register::new(0x01C4, 8, Access::RO);
    pub const MAXIMUM_DEVICE_RESPONSE_TIME: Register = Register::new(0x01CC, 4, Access::RO);
    pub const MANIFEST_TABLE_ADDRESS: Register = Register::new(0x01D0, 8, Access::RO);
    pub const SBRM_ADDRESS: Register = Register::new(0x01D8, 8, Access::RO);
    pub const DEVICE_CONFIGURATION: Register = Register::new(0x01E0, 4, Access::RW);
    pub const HEARTBEAT_TIMEOUT: Register = Register::new(0x01E4, 4, Access::RW);
    pub const TIMESTAMP: Register = Register::new(0x01E8, 8, Access::RO);
    pub const TIMESTAMP_LATCH: Register = Register::new(0x01F0, 4, Access::WO);
    pub const TIMESTAMP_INCREMENT: Register = Register::new(0x01F4, 8, Access::RO);
}

/// SBRM — Streaming Bootstrap Register Map, relative to the address held
/// in [`abrm::SBRM_ADDRESS`].
pub mod sbrm {
    use super::{Access, Register};

    pub const U3V_VERSION: Register = Register::new(0x0000, 4, Access::RO);
    pub const U3VCP_CAPABILITY: Register = Register::new(0x0004, 8, Access::RO);
    pub const MAXIMUM_CMD_LENGTH: Register = Register::new(0x000C, 4, Access::RO);
    pub const MAXIMUM_ACK_LENGTH: Register = Register::new(0x0010, 4, Access::RO);
    pub const NUMBER_OF_STREAM_CHANNELS: Register = Register::new(0x0014, 4, Access::RO);
    pub const SIRM_ADDRESS: Register = Register::new(0x0018, 8, Access::RO);
    pub const EIRM_ADDRESS: Register = Register::new(0x0020, 8, Access::RO);
    pub const IIDC2_ADDRESS: Register = Register::new(0x0028, 8, Access::RO);
    pub const CURRENT_SPEED: Register = Register::new(0x0030, 4, Access::RO);
}

/// SIRM — Streaming Interface Register Map, relative to the address held
/// in [`sbrm::SIRM_ADDRESS`].
pub mod sirm {
    use super::{Access, Register};

    pub const SI_INFO: Register = Register::new(0x0000, 4, Access::RO);
    pub const SI_CONTROL: Register = Register::new(0x0004, 4, Access::RW);
    pub const REQUIRED_PAYLOAD_SIZE: Register = Register::new(0x0008, 8, Access::RO);
    pub const REQUIRED_LEADER_SIZE: Register = Register::new(0x0010, 4, Access::RO);
    pub const REQUIRED_TRAILER_SIZE: Register = Register::new(0x0014, 4, Access::RO);
    pub const MAXIMUM_LEADER_SIZE: Register = Register::new(0x0018, 4, Access::RO);
    pub const PAYLOAD_TRANSFER_SIZE: Register = Register::new(0x001C, 4, Access::RW);
    pub const PAYLOAD_TRANSFER_COUNT: Register = Register::new(0x0020, 4, Access::RW);
    pub const PAYLOAD_FINAL_TRANSFER1_SIZE: Register = Register::new(0x0024, 4, Access::RW);
    pub const PAYLOAD_FINAL_TRANSFER2_SIZE: Register = Register::new(0x0028, 4, Access::RW);
    pub const MAXIMUM_TRAILER_SIZE: Register = Register::new(0x002C, 4, Access::RO);

    /// SI_CONTROL bit 0 — stream enable.
    pub const CONTROL_STREAM_ENABLE: u32 = 1 << 0;
}

/// Manifest table layout, relative to the address held in
/// [`abrm::MANIFEST_TABLE_ADDRESS`].
pub mod manifest {
    use super::{Access, Register};

    pub const ENTRY_COUNT: Register = Register::new(0x0000, 8, Access::RO);

    /// Offset of the first entry from the table base.
    pub const FIRST_ENTRY_OFFSET: u64 = 8;

    /// Stride of one entry slot.
    pub const ENTRY_SIZE: u64 = 112;

    // Entry-relative registers.
    pub const FILE_VERSION: Register = Register::new(0x0000, 4, Access::RO);
    pub const SCHEMA_VERSION: Register = Register::new(0x0004, 4, Access::RO);
    pub const FILE_NAME: Register = Register::new(0x0008, 64, Access::RO);
    pub const FILE_ADDRESS: Register = Register::new(0x0048, 8, Access::RO);
    pub const FILE_SIZE: Register = Register::new(0x0050, 8, Access::RO);
    pub const SHA1: Register = Register::new(0x0058, 20, Access::RO);
}

// ── Binary parse / dump ──

/// Parse a value out of the exact register width.
pub trait ParseBytes: Sized {
    fn parse_bytes(bytes: &[u8]) -> ControlResult<Self>;
}

/// Dump a value into a register-width buffer.
pub trait DumpBytes {
    fn dump_bytes(&self, buf: &mut [u8]) -> ControlResult<()>;
}

macro_rules! impl_parse_bytes_for_numeric {
    ($($ty:ty),* $(,)?) => {$(
        impl ParseBytes for $ty {
            fn parse_bytes(bytes: &[u8]) -> ControlResult<Self> {
                let arr: [u8; size_of::<$ty>()] = bytes.try_into().map_err(|_| {
                    ControlError::ParseError(format!(
                        "expected {} bytes for {}, got {}",
                        size_of::<$ty>(),
                        stringify!($ty),
                        bytes.len()
                    ))
                })?;
                Ok(<$ty>::from_le_bytes(arr))
            }
        }
    )*};
}

macro_rules! impl_dump_bytes_for_numeric {
    ($($ty:ty),* $(,)?) => {$(
        impl DumpBytes for $ty {
            fn dump_bytes(&self, buf: &mut [u8]) -> ControlResult<()> {
                if buf.len() != size_of::<$ty>() {
                    return Err(ControlError::BufferTooSmall(format!(
                        "{} needs exactly {} bytes, buffer has {}",
                        stringify!($ty),
                        size_of::<$ty>(),
                        buf.len()
                    )));
                }
                buf.copy_from_slice(&self.to_le_bytes());
                Ok(())
            }
        }
    )*};
}

impl_parse_bytes_for_numeric!(u8, u16, u32, u64, i8, i16, i32, i64);
impl_dump_bytes_for_numeric!(u8, u16, u32, u64, i8, i16, i32, i64);

impl DumpBytes for str {
    /// Copy the string into the slot and zero-fill the remainder. Slots
    /// are zero-terminated, so the value must leave at least one byte
    /// for the terminator.
    fn dump_bytes(&self, buf: &mut [u8]) -> ControlResult<()> {
        if self.len() >= buf.len() {
            return Err(ControlError::BufferTooSmall(format!(
                "string of {} bytes does not fit a {}-byte zero-terminated register slot",
                self.len(),
                buf.len()
            )));
        }
        buf[..self.len()].copy_from_slice(self.as_bytes());
        buf[self.len()..].fill(0);
        Ok(())
    }
}

impl ParseBytes for BusSpeed {
    fn parse_bytes(bytes: &[u8]) -> ControlResult<Self> {
        BusSpeed::from_register(u32::parse_bytes(bytes)?)
    }
}

/// Protocol version register packing: major in the high word, minor in
/// the low word. Used for the GenCP, U3V and GenICam file versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl ParseBytes for Version {
    fn parse_bytes(bytes: &[u8]) -> ControlResult<Self> {
        let raw = u32::parse_bytes(bytes)?;
        Ok(Version {
            major: (raw >> 16) as u16,
            minor: raw as u16,
        })
    }
}

// ── Capability and configuration bitfields ──

/// String encoding advertised by the device capability register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringEncoding {
    Ascii,
    Utf8,
}

/// Device capability register (ABRM 0x01C4). Each bit gates a feature;
/// reserved bits stay reachable through [`DeviceCapability::raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapability(u64);

impl DeviceCapability {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    fn bit(self, n: u32) -> bool {
        self.0 & (1u64 << n) != 0
    }

    pub fn is_user_defined_name_supported(self) -> bool {
        self.bit(0)
    }

    pub fn is_access_privilege_supported(self) -> bool {
        self.bit(1)
    }

    pub fn is_message_channel_supported(self) -> bool {
        self.bit(2)
    }

    pub fn is_timestamp_supported(self) -> bool {
        self.bit(3)
    }

    pub fn string_encoding(self) -> StringEncoding {
        if self.bit(4) {
            StringEncoding::Utf8
        } else {
            StringEncoding::Ascii
        }
    }

    pub fn is_family_name_supported(self) -> bool {
        self.bit(8)
    }

    pub fn is_multi_event_supported(self) -> bool {
        self.bit(12)
    }

    pub fn is_stacked_commands_supported(self) -> bool {
        self.bit(13)
    }
}

impl ParseBytes for DeviceCapability {
    fn parse_bytes(bytes: &[u8]) -> ControlResult<Self> {
        Ok(Self(u64::parse_bytes(bytes)?))
    }
}

/// Device configuration register (ABRM 0x01E0). Bits 0 and 1 are defined;
/// everything else is reserved and must round-trip unchanged, so the
/// setters mask exactly one bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfiguration(u32);

impl DeviceConfiguration {
    const HEARTBEAT_DISABLED: u32 = 1 << 0;
    const MULTI_EVENT_ENABLED: u32 = 1 << 1;

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_heartbeat_disabled(self) -> bool {
        self.0 & Self::HEARTBEAT_DISABLED != 0
    }

    pub fn set_heartbeat_disabled(&mut self, disabled: bool) {
        if disabled {
            self.0 |= Self::HEARTBEAT_DISABLED;
        } else {
            self.0 &= !Self::HEARTBEAT_DISABLED;
        }
    }

    pub fn is_multi_event_enabled(self) -> bool {
        self.0 & Self::MULTI_EVENT_ENABLED != 0
    }

    pub fn set_multi_event_enabled(&mut self, enabled: bool) {
        if enabled {
            self.0 |= Self::MULTI_EVENT_ENABLED;
        } else {
            self.0 &= !Self::MULTI_EVENT_ENABLED;
        }
    }
}

impl ParseBytes for DeviceConfiguration {
    fn parse_bytes(bytes: &[u8]) -> ControlResult<Self> {
        Ok(Self(u32::parse_bytes(bytes)?))
    }
}

impl DumpBytes for DeviceConfiguration {
    fn dump_bytes(&self, buf: &mut [u8]) -> ControlResult<()> {
        self.0.dump_bytes(buf)
    }
}

// ── Accessor plumbing ──

fn read_register<T, Ctrl>(ctrl: &mut Ctrl, register: Register) -> ControlResult<T>
where
    T: ParseBytes,
    Ctrl: DeviceControl + ?Sized,
{
    if !register.access.is_readable() {
        return Err(ControlError::NotSupported(format!(
            "register at {:#x} is write only",
            register.address
        )));
    }
    let mut buf = vec![0u8; register.len as usize];
    ctrl.read(register.address, &mut buf)?;
    T::parse_bytes(&buf)
}

fn write_register<T, Ctrl>(ctrl: &mut Ctrl, register: Register, value: &T) -> ControlResult<()>
where
    T: DumpBytes + ?Sized,
    Ctrl: DeviceControl + ?Sized,
{
    if !register.access.is_writable() {
        return Err(ControlError::NotSupported(format!(
            "register at {:#x} is read only",
            register.address
        )));
    }
    let mut buf = vec![0u8; register.len as usize];
    value.dump_bytes(&mut buf)?;
    ctrl.write(register.address, &buf)
}

/// Decode a fixed-width string slot: stop at the first zero byte, then
/// apply the device's advertised encoding.
fn parse_string_slot(bytes: &[u8], encoding: StringEncoding) -> ControlResult<String> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let content = &bytes[..end];
    match encoding {
        StringEncoding::Utf8 => String::from_utf8(content.to_vec()).map_err(|e| {
            ControlError::ParseError(format!("register string is not valid UTF-8: {e}"))
        }),
        StringEncoding::Ascii => Ok(content
            .iter()
            .map(|&b| {
                if b.is_ascii() {
                    b as char
                } else {
                    char::REPLACEMENT_CHARACTER
                }
            })
            .collect()),
    }
}

// ── ABRM ──

/// Typed view of the ABRM.
///
/// Construction reads the device capability register once; it gates the
/// string encoding and the optional registers for the lifetime of the
/// view.
#[derive(Debug, Clone, Copy)]
pub struct Abrm {
    capability: DeviceCapability,
}

impl Abrm {
    pub fn new<Ctrl>(ctrl: &mut Ctrl) -> ControlResult<Self>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let capability = read_register(ctrl, abrm::DEVICE_CAPABILITY)?;
        Ok(Self { capability })
    }

    pub fn device_capability(&self) -> DeviceCapability {
        self.capability
    }

    pub fn gencp_version<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Version>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, abrm::GENCP_VERSION)
    }

    pub fn manufacturer_name<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<String>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        self.string_register(ctrl, abrm::MANUFACTURER_NAME)
    }

    pub fn model_name<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<String>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        self.string_register(ctrl, abrm::MODEL_NAME)
    }

    /// `None` when the family-name capability bit is clear.
    pub fn family_name<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Option<String>>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        if !self.capability.is_family_name_supported() {
            return Ok(None);
        }
        self.string_register(ctrl, abrm::FAMILY_NAME).map(Some)
    }

    pub fn device_version<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<String>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        self.string_register(ctrl, abrm::DEVICE_VERSION)
    }

    pub fn manufacturer_info<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<String>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        self.string_register(ctrl, abrm::MANUFACTURER_INFO)
    }

    pub fn serial_number<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<String>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        self.string_register(ctrl, abrm::SERIAL_NUMBER)
    }

    /// `None` when the user-defined-name capability bit is clear.
    pub fn user_defined_name<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Option<String>>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        if !self.capability.is_user_defined_name_supported() {
            return Ok(None);
        }
        self.string_register(ctrl, abrm::USER_DEFINED_NAME).map(Some)
    }

    /// Rejected with `NotSupported` when the capability bit is clear.
    pub fn set_user_defined_name<Ctrl>(&self, ctrl: &mut Ctrl, name: &str) -> ControlResult<()>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        if !self.capability.is_user_defined_name_supported() {
            return Err(ControlError::NotSupported(
                "device does not support a user-defined name".into(),
            ));
        }
        if self.capability.string_encoding() == StringEncoding::Ascii && !name.is_ascii() {
            return Err(ControlError::ParseError(
                "device only accepts ASCII strings".into(),
            ));
        }
        write_register(ctrl, abrm::USER_DEFINED_NAME, name)
    }

    pub fn maximum_device_response_time<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Duration>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let millis: u32 = read_register(ctrl, abrm::MAXIMUM_DEVICE_RESPONSE_TIME)?;
        Ok(Duration::from_millis(u64::from(millis)))
    }

    pub fn manifest_table_address<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u64>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, abrm::MANIFEST_TABLE_ADDRESS)
    }

    pub fn manifest_table<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<ManifestTable>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let address = self.manifest_table_address(ctrl)?;
        if address == 0 {
            return Err(ControlError::InvalidDevice(
                "manifest table address is zero".into(),
            ));
        }
        Ok(ManifestTable::new(address))
    }

    pub fn sbrm_address<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u64>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, abrm::SBRM_ADDRESS)
    }

    pub fn sbrm<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Sbrm>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let address = self.sbrm_address(ctrl)?;
        if address == 0 {
            return Err(ControlError::InvalidDevice("SBRM address is zero".into()));
        }
        Ok(Sbrm::new(address))
    }

    pub fn device_configuration<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<DeviceConfiguration>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, abrm::DEVICE_CONFIGURATION)
    }

    pub fn write_device_configuration<Ctrl>(
        &self,
        ctrl: &mut Ctrl,
        config: DeviceConfiguration,
    ) -> ControlResult<()>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        write_register(ctrl, abrm::DEVICE_CONFIGURATION, &config)
    }

    pub fn heartbeat_timeout<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Duration>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let millis: u32 = read_register(ctrl, abrm::HEARTBEAT_TIMEOUT)?;
        Ok(Duration::from_millis(u64::from(millis)))
    }

    pub fn set_heartbeat_timeout<Ctrl>(&self, ctrl: &mut Ctrl, timeout: Duration) -> ControlResult<()>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let millis = u32::try_from(timeout.as_millis()).map_err(|_| {
            ControlError::ParseError(format!(
                "heartbeat timeout of {timeout:?} overflows the register"
            ))
        })?;
        write_register(ctrl, abrm::HEARTBEAT_TIMEOUT, &millis)
    }

    /// `None` when the timestamp capability bit is clear.
    pub fn timestamp<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Option<u64>>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        if !self.capability.is_timestamp_supported() {
            return Ok(None);
        }
        read_register(ctrl, abrm::TIMESTAMP).map(Some)
    }

    /// Latch the running timestamp into [`abrm::TIMESTAMP`].
    pub fn latch_timestamp<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<()>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        if !self.capability.is_timestamp_supported() {
            return Err(ControlError::NotSupported(
                "device does not support timestamps".into(),
            ));
        }
        write_register(ctrl, abrm::TIMESTAMP_LATCH, &1u32)
    }

    /// Timestamp tick period in nanoseconds; `None` when unsupported.
    pub fn timestamp_increment<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Option<u64>>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        if !self.capability.is_timestamp_supported() {
            return Ok(None);
        }
        read_register(ctrl, abrm::TIMESTAMP_INCREMENT).map(Some)
    }

    fn string_register<Ctrl>(&self, ctrl: &mut Ctrl, register: Register) -> ControlResult<String>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let mut buf = vec![0u8; register.len as usize];
        ctrl.read(register.address, &mut buf)?;
        parse_string_slot(&buf, self.capability.string_encoding())
    }
}

// ── SBRM ──

/// Typed view of the SBRM at a device-reported base address.
#[derive(Debug, Clone, Copy)]
pub struct Sbrm {
    base: u64,
}

impl Sbrm {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    pub fn address(&self) -> u64 {
        self.base
    }

    pub fn u3v_version<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Version>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sbrm::U3V_VERSION.at(self.base))
    }

    pub fn u3vcp_capability<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u64>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sbrm::U3VCP_CAPABILITY.at(self.base))
    }

    pub fn maximum_command_length<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sbrm::MAXIMUM_CMD_LENGTH.at(self.base))
    }

    pub fn maximum_acknowledge_length<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sbrm::MAXIMUM_ACK_LENGTH.at(self.base))
    }

    pub fn number_of_stream_channels<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sbrm::NUMBER_OF_STREAM_CHANNELS.at(self.base))
    }

    pub fn sirm_address<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u64>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sbrm::SIRM_ADDRESS.at(self.base))
    }

    /// `None` when the device has no streaming interface (address zero).
    pub fn sirm<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Option<Sirm>>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let address = self.sirm_address(ctrl)?;
        Ok((address != 0).then(|| Sirm::new(address)))
    }

    /// `None` when the device has no event interface.
    pub fn eirm_address<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Option<u64>>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let address: u64 = read_register(ctrl, sbrm::EIRM_ADDRESS.at(self.base))?;
        Ok((address != 0).then_some(address))
    }

    /// `None` when the device carries no IIDC2 block.
    pub fn iidc2_address<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Option<u64>>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let address: u64 = read_register(ctrl, sbrm::IIDC2_ADDRESS.at(self.base))?;
        Ok((address != 0).then_some(address))
    }

    pub fn current_speed<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<BusSpeed>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sbrm::CURRENT_SPEED.at(self.base))
    }
}

// ── SIRM ──

/// Typed view of the streaming interface registers.
///
/// The streaming collaborator programs these to size its leader, trailer
/// and payload buffers before the stream-enable bit goes up.
#[derive(Debug, Clone, Copy)]
pub struct Sirm {
    base: u64,
}

impl Sirm {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    pub fn address(&self) -> u64 {
        self.base
    }

    /// Payload alignment in bytes, always a power of two.
    pub fn required_payload_alignment<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u64>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let info: u32 = read_register(ctrl, sirm::SI_INFO.at(self.base))?;
        Ok(1u64 << (info >> 24))
    }

    pub fn is_stream_enabled<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<bool>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let control: u32 = read_register(ctrl, sirm::SI_CONTROL.at(self.base))?;
        Ok(control & sirm::CONTROL_STREAM_ENABLE != 0)
    }

    /// Read-modify-write of the stream-enable bit, leaving reserved
    /// control bits intact.
    pub fn set_stream_enabled<Ctrl>(&self, ctrl: &mut Ctrl, enabled: bool) -> ControlResult<()>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let mut control: u32 = read_register(ctrl, sirm::SI_CONTROL.at(self.base))?;
        if enabled {
            control |= sirm::CONTROL_STREAM_ENABLE;
        } else {
            control &= !sirm::CONTROL_STREAM_ENABLE;
        }
        write_register(ctrl, sirm::SI_CONTROL.at(self.base), &control)
    }

    pub fn required_payload_size<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u64>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sirm::REQUIRED_PAYLOAD_SIZE.at(self.base))
    }

    pub fn required_leader_size<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sirm::REQUIRED_LEADER_SIZE.at(self.base))
    }

    pub fn required_trailer_size<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sirm::REQUIRED_TRAILER_SIZE.at(self.base))
    }

    pub fn maximum_leader_size<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sirm::MAXIMUM_LEADER_SIZE.at(self.base))
    }

    pub fn maximum_trailer_size<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sirm::MAXIMUM_TRAILER_SIZE.at(self.base))
    }

    pub fn payload_transfer_size<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sirm::PAYLOAD_TRANSFER_SIZE.at(self.base))
    }

    pub fn set_payload_transfer_size<Ctrl>(&self, ctrl: &mut Ctrl, size: u32) -> ControlResult<()>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        write_register(ctrl, sirm::PAYLOAD_TRANSFER_SIZE.at(self.base), &size)
    }

    pub fn payload_transfer_count<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sirm::PAYLOAD_TRANSFER_COUNT.at(self.base))
    }

    pub fn set_payload_transfer_count<Ctrl>(&self, ctrl: &mut Ctrl, count: u32) -> ControlResult<()>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        write_register(ctrl, sirm::PAYLOAD_TRANSFER_COUNT.at(self.base), &count)
    }

    pub fn payload_final_transfer1_size<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sirm::PAYLOAD_FINAL_TRANSFER1_SIZE.at(self.base))
    }

    pub fn set_payload_final_transfer1_size<Ctrl>(
        &self,
        ctrl: &mut Ctrl,
        size: u32,
    ) -> ControlResult<()>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        write_register(ctrl, sirm::PAYLOAD_FINAL_TRANSFER1_SIZE.at(self.base), &size)
    }

    pub fn payload_final_transfer2_size<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u32>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, sirm::PAYLOAD_FINAL_TRANSFER2_SIZE.at(self.base))
    }

    pub fn set_payload_final_transfer2_size<Ctrl>(
        &self,
        ctrl: &mut Ctrl,
        size: u32,
    ) -> ControlResult<()>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        write_register(ctrl, sirm::PAYLOAD_FINAL_TRANSFER2_SIZE.at(self.base), &size)
    }
}

// ── Manifest ──

/// Upper bound on manifest entries; corrupt tables must not drive huge
/// read loops.
const MAX_MANIFEST_ENTRIES: u64 = 256;

/// The manifest table: an entry count followed by fixed-size entries.
#[derive(Debug, Clone, Copy)]
pub struct ManifestTable {
    base: u64,
}

impl ManifestTable {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    pub fn address(&self) -> u64 {
        self.base
    }

    pub fn entry_count<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u64>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, manifest::ENTRY_COUNT.at(self.base))
    }

    pub fn entries<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Vec<ManifestEntry>>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let count = self.entry_count(ctrl)?;
        if count > MAX_MANIFEST_ENTRIES {
            return Err(ControlError::ParseError(format!(
                "manifest entry count {count} out of range (max {MAX_MANIFEST_ENTRIES})"
            )));
        }
        Ok((0..count)
            .map(|i| {
                ManifestEntry::new(self.base + manifest::FIRST_ENTRY_OFFSET + i * manifest::ENTRY_SIZE)
            })
            .collect())
    }
}

/// One manifest entry: an embedded file's name, location and digest.
#[derive(Debug, Clone, Copy)]
pub struct ManifestEntry {
    base: u64,
}

impl ManifestEntry {
    pub fn new(base: u64) -> Self {
        Self { base }
    }

    pub fn file_version<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Version>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, manifest::FILE_VERSION.at(self.base))
    }

    pub fn schema_version<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<Version>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, manifest::SCHEMA_VERSION.at(self.base))
    }

    /// File names are ASCII per the GenICam naming rules; stray bytes are
    /// replaced rather than rejected.
    pub fn file_name<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<String>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let register = manifest::FILE_NAME.at(self.base);
        let mut buf = vec![0u8; register.len as usize];
        ctrl.read(register.address, &mut buf)?;
        parse_string_slot(&buf, StringEncoding::Ascii)
    }

    pub fn file_address<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u64>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, manifest::FILE_ADDRESS.at(self.base))
    }

    pub fn file_size<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<u64>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        read_register(ctrl, manifest::FILE_SIZE.at(self.base))
    }

    pub fn sha1<Ctrl>(&self, ctrl: &mut Ctrl) -> ControlResult<[u8; 20]>
    where
        Ctrl: DeviceControl + ?Sized,
    {
        let register = manifest::SHA1.at(self.base);
        let mut buf = vec![0u8; register.len as usize];
        ctrl.read(register.address, &mut buf)?;
        buf.try_into()
            .map_err(|_| ControlError::ParseError("SHA1 register is not 20 bytes".into()))
    }
}
