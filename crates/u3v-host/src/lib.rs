//! Host-side control for USB3 Vision (U3V) cameras.
//!
//! U3V devices expose a GenCP control channel over the bulk endpoints of
//! a vendor-defined USB interface, and describe themselves through
//! memory-mapped bootstrap registers. This crate covers that control
//! plane: enumeration, the framed command/acknowledge protocol, typed
//! register-map access (ABRM / SBRM / SIRM / manifest) and a thread-safe
//! session wrapper. Image payload transfer is left to a streaming engine
//! built on top of [`DeviceControl`].
//!
//! ```no_run
//! use u3v_host::enumerate_cameras;
//!
//! # fn main() -> u3v_host::ControlResult<()> {
//! for mut camera in enumerate_cameras()? {
//!     camera.open()?;
//!     let ctrl = camera.ctrl_mut();
//!     let abrm = ctrl.abrm()?;
//!     println!("{}: {}", abrm.model_name(ctrl)?, abrm.serial_number(ctrl)?);
//!     let _xml = ctrl.genapi()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod channel;
pub mod control;
pub mod device;
pub mod error;
pub mod protocol;
pub mod register_map;

pub use camera::{Camera, enumerate_cameras};
pub use control::{ConnectionConfig, ControlHandle, DeviceControl, SharedControlHandle};
pub use device::{BusSpeed, DeviceInfo, enumerate_devices};
pub use error::{ControlError, ControlResult, StreamError, StreamResult};
