//! Camera surface — the bundle applications start from.
//!
//! A [`Camera`] pairs the identity of a discovered device with its control
//! session. [`enumerate_cameras`] yields one per U3V device on the host;
//! devices whose control interface cannot be resolved are skipped the
//! same way enumeration skips unreadable devices.

use crate::control::ControlHandle;
use crate::device::{self, DeviceInfo};
use crate::error::ControlResult;

/// A discovered camera: identity plus an unopened control session.
pub struct Camera {
    info: DeviceInfo,
    ctrl: ControlHandle,
}

impl Camera {
    pub fn new(info: DeviceInfo, ctrl: ControlHandle) -> Self {
        Self { info, ctrl }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn ctrl(&self) -> &ControlHandle {
        &self.ctrl
    }

    pub fn ctrl_mut(&mut self) -> &mut ControlHandle {
        &mut self.ctrl
    }

    /// Give up the bundle and keep only the control session.
    pub fn into_control(self) -> ControlHandle {
        self.ctrl
    }

    /// Open the control session. See [`ControlHandle::open`].
    pub fn open(&mut self) -> ControlResult<()> {
        self.ctrl.open()
    }

    pub fn close(&mut self) -> ControlResult<()> {
        self.ctrl.close()
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("info", &self.info)
            .field("opened", &self.ctrl.is_opened())
            .finish()
    }
}

/// Enumerate all U3V cameras connected to the host, in bus order.
///
/// A device that enumerates but whose control interface cannot be
/// resolved anymore (racing an unplug, endpoints missing) is skipped.
pub fn enumerate_cameras() -> ControlResult<Vec<Camera>> {
    let mut cameras = Vec::new();
    for info in device::enumerate_devices()? {
        match ControlHandle::new(info.clone()) {
            Ok(ctrl) => cameras.push(Camera::new(info, ctrl)),
            Err(e) => log::warn!("skipping {info}: {e}"),
        }
    }
    Ok(cameras)
}
