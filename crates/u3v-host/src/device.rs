//! Device discovery — DeviceInfo records and U3V enumeration.
//!
//! A U3V camera advertises its control interface with the Miscellaneous
//! class triple `(0xEF, 0x02, 0x01)`. Enumeration walks every USB device
//! on the host, keeps the ones exposing that interface, and assembles an
//! identity record per device. Devices that cannot be opened (permissions,
//! already claimed, mid-unplug) are skipped, not surfaced as errors.

use std::time::Duration;

use rusb::{ConfigDescriptor, Context, Device, UsbContext};
use serde::Serialize;

use crate::error::{ControlError, ControlResult};

/// Interface class of the U3V control interface (Miscellaneous).
pub const U3V_INTERFACE_CLASS: u8 = 0xEF;

/// Interface sub-class of the U3V control interface.
pub const U3V_INTERFACE_SUBCLASS: u8 = 0x02;

/// Interface protocol of the U3V control interface.
pub const U3V_INTERFACE_PROTOCOL: u8 = 0x01;

/// Timeout for the string-descriptor reads done during enumeration.
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(200);

/// Identity of a discovered device. Immutable after enumeration and cheap
/// to copy around; the control session proper lives in
/// [`crate::control::ControlHandle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    /// Manufacturer string descriptor (iManufacturer).
    pub vendor_name: String,
    /// Product string descriptor (iProduct).
    pub model_name: String,
    /// Serial number string descriptor (iSerialNumber).
    pub serial_number: String,
    /// Active configuration's description string, empty when the device
    /// has none.
    pub manufacturer_info: String,
    /// Negotiated bus speed, `None` when the USB stack does not report one.
    pub speed: Option<BusSpeed>,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} bus {:03} addr {:03}",
            self.vendor_id, self.product_id, self.bus_number, self.device_address
        )
    }
}

/// USB bus speed, as encoded in the SBRM current-speed register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BusSpeed {
    LowSpeed,
    FullSpeed,
    HighSpeed,
    SuperSpeed,
    SuperSpeedPlus,
}

impl BusSpeed {
    /// Decode the SBRM current-speed register value.
    ///
    /// The register is one-hot; anything else is a protocol violation.
    pub fn from_register(raw: u32) -> ControlResult<Self> {
        match raw {
            0b1 => Ok(BusSpeed::LowSpeed),
            0b10 => Ok(BusSpeed::FullSpeed),
            0b100 => Ok(BusSpeed::HighSpeed),
            0b1000 => Ok(BusSpeed::SuperSpeed),
            0b10000 => Ok(BusSpeed::SuperSpeedPlus),
            other => Err(ControlError::ParseError(format!(
                "invalid bus speed {other:#x}"
            ))),
        }
    }

    /// Register encoding of this speed.
    pub fn to_register(self) -> u32 {
        match self {
            BusSpeed::LowSpeed => 0b1,
            BusSpeed::FullSpeed => 0b10,
            BusSpeed::HighSpeed => 0b100,
            BusSpeed::SuperSpeed => 0b1000,
            BusSpeed::SuperSpeedPlus => 0b10000,
        }
    }

    fn from_usb(speed: rusb::Speed) -> Option<Self> {
        match speed {
            rusb::Speed::Low => Some(BusSpeed::LowSpeed),
            rusb::Speed::Full => Some(BusSpeed::FullSpeed),
            rusb::Speed::High => Some(BusSpeed::HighSpeed),
            rusb::Speed::Super => Some(BusSpeed::SuperSpeed),
            rusb::Speed::SuperPlus => Some(BusSpeed::SuperSpeedPlus),
            _ => None,
        }
    }
}

/// Check whether an interface descriptor triple identifies the U3V control
/// interface.
pub(crate) fn is_u3v_control_interface(class: u8, sub_class: u8, protocol: u8) -> bool {
    class == U3V_INTERFACE_CLASS
        && sub_class == U3V_INTERFACE_SUBCLASS
        && protocol == U3V_INTERFACE_PROTOCOL
}

/// Find the interface number of the U3V control interface in a
/// configuration, if any.
pub(crate) fn find_control_interface(config: &ConfigDescriptor) -> Option<u8> {
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            if is_u3v_control_interface(desc.class_code(), desc.sub_class_code(), desc.protocol_code())
            {
                return Some(desc.interface_number());
            }
        }
    }
    None
}

/// Enumerate all U3V devices connected to the host.
///
/// No devices present is an empty vector, not an error. Per-device
/// failures (unreadable descriptors, open refused) skip that device.
pub fn enumerate_devices() -> ControlResult<Vec<DeviceInfo>> {
    let context = Context::new()?;
    let mut infos = Vec::new();
    for device in context.devices()?.iter() {
        match probe_device(&device) {
            Some(info) => infos.push(info),
            None => continue,
        }
    }
    Ok(infos)
}

/// Build a [`DeviceInfo`] for `device` if it is a U3V device, `None`
/// otherwise (including devices that refuse descriptor access).
fn probe_device(device: &Device<Context>) -> Option<DeviceInfo> {
    let desc = device.device_descriptor().ok()?;
    let config = device.active_config_descriptor().ok()?;
    find_control_interface(&config)?;

    let handle = match device.open() {
        Ok(handle) => handle,
        Err(e) => {
            log::debug!(
                "skipping U3V device {:04x}:{:04x}: {e}",
                desc.vendor_id(),
                desc.product_id()
            );
            return None;
        }
    };

    let language = handle
        .read_languages(DESCRIPTOR_TIMEOUT)
        .ok()
        .and_then(|langs| langs.first().copied());

    let (vendor_name, model_name, serial_number, manufacturer_info) = match language {
        Some(language) => (
            handle
                .read_manufacturer_string(language, &desc, DESCRIPTOR_TIMEOUT)
                .unwrap_or_default(),
            handle
                .read_product_string(language, &desc, DESCRIPTOR_TIMEOUT)
                .unwrap_or_default(),
            handle
                .read_serial_number_string(language, &desc, DESCRIPTOR_TIMEOUT)
                .unwrap_or_default(),
            handle
                .read_configuration_string(language, &config, DESCRIPTOR_TIMEOUT)
                .unwrap_or_default(),
        ),
        None => Default::default(),
    };

    Some(DeviceInfo {
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        bus_number: device.bus_number(),
        device_address: device.address(),
        vendor_name,
        model_name,
        serial_number,
        manufacturer_info,
        speed: BusSpeed::from_usb(device.speed()),
    })
}

/// Resolve a previously enumerated device back to its rusb handle source.
pub(crate) fn find_usb_device(info: &DeviceInfo) -> ControlResult<Device<Context>> {
    let context = Context::new()?;
    for device in context.devices()?.iter() {
        if device.bus_number() != info.bus_number || device.address() != info.device_address {
            continue;
        }
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if desc.vendor_id() == info.vendor_id && desc.product_id() == info.product_id {
            return Ok(device);
        }
    }
    Err(ControlError::InvalidDevice(format!(
        "device {info} is no longer present"
    )))
}
