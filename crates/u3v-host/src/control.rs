//! Control session — ControlHandle, its configuration and the shared
//! wrapper.
//!
//! A [`ControlHandle`] owns one device's control channel and runs the
//! GenCP transaction loop over it: allocate a request id, send the
//! command, collect the acknowledge, retry on PENDING_ACK, map NAKs to
//! errors. On top of that byte-level `read`/`write` interface it offers
//! the session operations: `open` (which negotiates timeouts and packet
//! limits from the bootstrap registers), `genapi` (the GenICam XML pulled
//! through the manifest) and the stream-enable switch.
//!
//! [`SharedControlHandle`] serializes any number of clones of one handle
//! behind a mutex so a control UI and a stream configurator can share a
//! camera safely.

use std::io::Read as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::channel::{ControlChannel, UsbChannel};
use crate::device::DeviceInfo;
use crate::error::{ControlError, ControlResult};
use crate::protocol::ack::{self, AckPacket, Pending, Status};
use crate::protocol::cmd::{CommandPacket, ReadMem, WriteMem};
use crate::protocol::{ACK_HEADER_SIZE, CMD_HEADER_SIZE};
use crate::register_map::{Abrm, Sbrm, Sirm};

/// Timeout used until the device's maximum response time is read.
pub const INITIAL_TIMEOUT_DURATION: Duration = Duration::from_millis(500);

/// Command-length limit used until the SBRM value is read.
pub const INITIAL_MAXIMUM_CMD_LENGTH: u32 = 128;

/// Acknowledge-length limit used until the SBRM value is read.
pub const INITIAL_MAXIMUM_ACK_LENGTH: u32 = 128;

/// Default size of the acknowledge-assembly buffer.
const INITIAL_BUFFER_CAPACITY: usize = 1024;

/// Upper bound on the GenICam file size accepted from the manifest.
/// Real files are tens to hundreds of kilobytes; this cap protects
/// against corrupt size registers.
const MAX_GENAPI_SIZE: usize = 16 * 1024 * 1024;

/// Mutable session parameters of one control connection.
///
/// The initial values are provisional; `open()` replaces the timeout and
/// the packet-length limits with the device-declared ones.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout of each transaction with the device.
    pub timeout_duration: Duration,
    /// How many PENDING_ACK acknowledges are tolerated per transaction.
    pub retry_count: u16,
    /// Maximum length of a command packet, in bytes.
    pub maximum_cmd_length: u32,
    /// Maximum length of an acknowledge packet, in bytes.
    pub maximum_ack_length: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_duration: INITIAL_TIMEOUT_DURATION,
            retry_count: 3,
            maximum_cmd_length: INITIAL_MAXIMUM_CMD_LENGTH,
            maximum_ack_length: INITIAL_MAXIMUM_ACK_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Opened,
    Closed,
}

/// The capability surface shared by [`ControlHandle`] and
/// [`SharedControlHandle`].
///
/// Register-map accessors and the streaming collaborator are written
/// against this trait, so they work with either a plain or a shared
/// session.
pub trait DeviceControl {
    /// Identity of the device behind this handle.
    fn device_info(&self) -> DeviceInfo;

    fn is_opened(&self) -> bool;

    /// Claim the device and negotiate the session parameters.
    fn open(&mut self) -> ControlResult<()>;

    /// Release the device. Idempotent.
    fn close(&mut self) -> ControlResult<()>;

    /// Fill `buf` from device memory starting at `address`. The read
    /// either fills the whole buffer or fails.
    fn read(&mut self, address: u64, buf: &mut [u8]) -> ControlResult<()>;

    /// Write `data` to device memory starting at `address`.
    fn write(&mut self, address: u64, data: &[u8]) -> ControlResult<()>;

    /// Retrieve the GenICam XML advertised by the manifest.
    fn genapi(&mut self) -> ControlResult<String>;

    fn enable_streaming(&mut self) -> ControlResult<()>;

    fn disable_streaming(&mut self) -> ControlResult<()>;

    fn timeout_duration(&self) -> Duration;

    fn set_timeout_duration(&mut self, duration: Duration);

    fn retry_count(&self) -> u16;

    fn set_retry_count(&mut self, count: u16);

    fn buffer_capacity(&self) -> usize;

    fn resize_buffer(&mut self, size: usize);
}

/// Per-device control session.
///
/// Generic over the transport so the whole session logic runs against the
/// in-memory mock in tests; production code uses the `UsbChannel`
/// default.
pub struct ControlHandle<C = UsbChannel> {
    channel: C,
    info: DeviceInfo,
    config: ConnectionConfig,
    state: State,
    next_request_id: u16,
    /// Serialized outbound command of the transaction in flight.
    cmd_buffer: Vec<u8>,
    /// Receive window for one acknowledge.
    ack_buffer: Vec<u8>,
    /// Bootstrap views resolved during `open()`.
    abrm: Option<Abrm>,
    sbrm: Option<Sbrm>,
}

impl ControlHandle {
    /// Build a handle for an enumerated device. The device is resolved
    /// and its endpoints located, but nothing is claimed until
    /// [`ControlHandle::open`].
    pub fn new(info: DeviceInfo) -> ControlResult<Self> {
        let channel = UsbChannel::from_device_info(&info)?;
        Ok(Self::with_channel(channel, info))
    }
}

impl<C: ControlChannel> ControlHandle<C> {
    /// Build a handle over an arbitrary transport.
    pub fn with_channel(channel: C, info: DeviceInfo) -> Self {
        Self {
            channel,
            info,
            config: ConnectionConfig::default(),
            state: State::Created,
            next_request_id: 0,
            cmd_buffer: Vec::new(),
            ack_buffer: vec![0; INITIAL_BUFFER_CAPACITY],
            abrm: None,
            sbrm: None,
        }
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Access the underlying transport.
    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Mutable access to the underlying transport.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn is_opened(&self) -> bool {
        self.state == State::Opened
    }

    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn timeout_duration(&self) -> Duration {
        self.config.timeout_duration
    }

    pub fn set_timeout_duration(&mut self, duration: Duration) {
        self.config.timeout_duration = duration;
    }

    pub fn retry_count(&self) -> u16 {
        self.config.retry_count
    }

    pub fn set_retry_count(&mut self, count: u16) {
        self.config.retry_count = count;
    }

    pub fn buffer_capacity(&self) -> usize {
        self.ack_buffer.len()
    }

    pub fn resize_buffer(&mut self, size: usize) {
        self.ack_buffer = vec![0; size];
    }

    /// Open the session: claim the channel, then negotiate timeout and
    /// packet limits from the bootstrap registers. A handle that is
    /// already open stays open.
    pub fn open(&mut self) -> ControlResult<()> {
        if self.state == State::Opened {
            return Ok(());
        }
        self.channel.open()?;
        self.state = State::Opened;
        self.config = ConnectionConfig::default();
        if let Err(e) = self.initialize_config() {
            let _ = self.channel.close();
            self.state = State::Closed;
            return Err(e);
        }
        Ok(())
    }

    /// Close the session, releasing the endpoints. Idempotent; the
    /// handle can be reopened afterwards.
    pub fn close(&mut self) -> ControlResult<()> {
        if self.state == State::Opened {
            self.channel.close()?;
        }
        self.state = State::Closed;
        self.abrm = None;
        self.sbrm = None;
        Ok(())
    }

    /// Read with provisional limits, then install the negotiated ones.
    fn initialize_config(&mut self) -> ControlResult<()> {
        let abrm = Abrm::new(self)?;
        let version = abrm.gencp_version(self)?;
        let manufacturer = abrm.manufacturer_name(self)?;
        let model = abrm.model_name(self)?;
        let serial = abrm.serial_number(self)?;
        let user_name = abrm.user_defined_name(self)?;
        log::debug!(
            "opened {manufacturer} {model} serial {serial} \
             (GenCP {version}, user name {user_name:?})"
        );

        let response_time = abrm.maximum_device_response_time(self)?;
        self.config.timeout_duration = response_time.max(Duration::from_millis(1));

        let sbrm = abrm.sbrm(self)?;
        let maximum_cmd_length = sbrm.maximum_command_length(self)?;
        let maximum_ack_length = sbrm.maximum_acknowledge_length(self)?;
        if (maximum_cmd_length as usize) <= CMD_HEADER_SIZE + 8
            || (maximum_ack_length as usize) <= ACK_HEADER_SIZE
        {
            return Err(ControlError::InvalidDevice(format!(
                "device declares unusable packet limits \
                 (cmd {maximum_cmd_length}, ack {maximum_ack_length})"
            )));
        }
        self.config.maximum_cmd_length = maximum_cmd_length;
        self.config.maximum_ack_length = maximum_ack_length;
        self.abrm = Some(abrm);
        self.sbrm = Some(sbrm);
        log::debug!(
            "negotiated cmd {maximum_cmd_length} B, ack {maximum_ack_length} B, timeout {:?}",
            self.config.timeout_duration
        );
        Ok(())
    }

    fn assert_opened(&self) -> ControlResult<()> {
        if self.state == State::Opened {
            Ok(())
        } else {
            Err(ControlError::NotOpened)
        }
    }

    /// Typed view of the ABRM.
    pub fn abrm(&mut self) -> ControlResult<Abrm> {
        self.assert_opened()?;
        match self.abrm {
            Some(abrm) => Ok(abrm),
            None => {
                let abrm = Abrm::new(self)?;
                self.abrm = Some(abrm);
                Ok(abrm)
            }
        }
    }

    /// Typed view of the SBRM.
    pub fn sbrm(&mut self) -> ControlResult<Sbrm> {
        self.assert_opened()?;
        match self.sbrm {
            Some(sbrm) => Ok(sbrm),
            None => {
                let sbrm = self.abrm()?.sbrm(self)?;
                self.sbrm = Some(sbrm);
                Ok(sbrm)
            }
        }
    }

    /// Typed view of the SIRM. `NotSupported` when the device has no
    /// streaming interface.
    pub fn sirm(&mut self) -> ControlResult<Sirm> {
        let sbrm = self.sbrm()?;
        match sbrm.sirm(self)? {
            Some(sirm) => Ok(sirm),
            None => Err(ControlError::NotSupported(
                "device has no streaming interface (SIRM address is zero)".into(),
            )),
        }
    }

    /// Fill `buf` from device memory at `address`.
    ///
    /// Ranges longer than one acknowledge can carry are split into
    /// contiguous sub-reads, each its own transaction.
    pub fn read(&mut self, address: u64, buf: &mut [u8]) -> ControlResult<()> {
        self.assert_opened()?;
        if buf.is_empty() {
            return Ok(());
        }
        let chunk_len = self.read_chunk_len();
        if chunk_len == 0 {
            return Err(ControlError::BufferTooSmall(format!(
                "transaction buffer of {} bytes cannot carry any payload",
                self.buffer_capacity()
            )));
        }
        let mut address = address;
        for chunk in buf.chunks_mut(chunk_len) {
            self.read_chunk(address, chunk)?;
            address += chunk.len() as u64;
        }
        Ok(())
    }

    /// Write `data` to device memory at `address`, chunked to the
    /// negotiated command length.
    pub fn write(&mut self, address: u64, data: &[u8]) -> ControlResult<()> {
        self.assert_opened()?;
        if data.is_empty() {
            return Ok(());
        }
        let chunk_len = (self.config.maximum_cmd_length as usize)
            .saturating_sub(CMD_HEADER_SIZE + 8)
            .min(u16::MAX as usize - 8);
        if chunk_len == 0 {
            return Err(ControlError::InvalidPacket(format!(
                "maximum command length {} leaves no room for data",
                self.config.maximum_cmd_length
            )));
        }
        let mut address = address;
        for chunk in data.chunks(chunk_len) {
            self.write_chunk(address, chunk)?;
            address += chunk.len() as u64;
        }
        Ok(())
    }

    /// Retrieve the GenICam XML: first manifest entry, unzipped when the
    /// file name says so.
    pub fn genapi(&mut self) -> ControlResult<String> {
        self.assert_opened()?;
        let abrm = self.abrm()?;
        let table = abrm.manifest_table(self)?;
        let entries = table.entries(self)?;
        let Some(entry) = entries.first().copied() else {
            return Err(ControlError::InvalidDevice("manifest table is empty".into()));
        };

        let file_name = entry.file_name(self)?;
        let file_address = entry.file_address(self)?;
        let file_size = entry.file_size(self)?;
        let file_size = usize::try_from(file_size)
            .ok()
            .filter(|&size| size != 0 && size <= MAX_GENAPI_SIZE)
            .ok_or_else(|| {
                ControlError::ParseError(format!(
                    "manifest file size {file_size} out of range"
                ))
            })?;

        // A large pull pays per-acknowledge overhead; grow the
        // transaction buffer so every sub-read uses a full-size
        // acknowledge.
        let window = self.config.maximum_ack_length as usize;
        if self.ack_buffer.len() < window {
            self.resize_buffer(window);
        }

        log::debug!("fetching GenICam file {file_name:?} ({file_size} bytes at {file_address:#x})");
        let mut blob = vec![0u8; file_size];
        self.read(file_address, &mut blob)?;

        if file_name.to_ascii_lowercase().ends_with(".zip") {
            unzip_first_file(&blob)
        } else {
            String::from_utf8(blob).map_err(|e| {
                ControlError::ParseError(format!("GenICam file is not valid UTF-8: {e}"))
            })
        }
    }

    pub fn enable_streaming(&mut self) -> ControlResult<()> {
        self.set_streaming(true)
    }

    pub fn disable_streaming(&mut self) -> ControlResult<()> {
        self.set_streaming(false)
    }

    fn set_streaming(&mut self, enabled: bool) -> ControlResult<()> {
        let sirm = self.sirm()?;
        sirm.set_stream_enabled(self, enabled)
    }

    fn allocate_request_id(&mut self) -> u16 {
        let id = self.next_request_id;
        self.next_request_id = id.wrapping_add(1);
        id
    }

    /// Payload bytes one READMEM acknowledge can carry.
    fn read_chunk_len(&self) -> usize {
        self.ack_buffer
            .len()
            .min(self.config.maximum_ack_length as usize)
            .saturating_sub(ACK_HEADER_SIZE)
            .min(u16::MAX as usize)
    }

    fn check_cmd_length(&self, len: usize) -> ControlResult<()> {
        if len > self.config.maximum_cmd_length as usize {
            return Err(ControlError::InvalidPacket(format!(
                "command of {len} bytes exceeds the negotiated maximum of {}",
                self.config.maximum_cmd_length
            )));
        }
        Ok(())
    }

    fn read_chunk(&mut self, address: u64, out: &mut [u8]) -> ControlResult<()> {
        let request_id = self.allocate_request_id();
        let packet = CommandPacket::new(
            ReadMem {
                address,
                read_length: out.len() as u16,
            },
            request_id,
        );
        self.check_cmd_length(packet.cmd_len())?;
        packet.serialize_into(&mut self.cmd_buffer);

        let (start, len) = self.transact(request_id, ack::ACK_READMEM)?;
        if len != out.len() {
            return Err(ControlError::InvalidPacket(format!(
                "READMEM returned {len} bytes, expected {}",
                out.len()
            )));
        }
        out.copy_from_slice(&self.ack_buffer[start..start + len]);
        Ok(())
    }

    fn write_chunk(&mut self, address: u64, data: &[u8]) -> ControlResult<()> {
        let request_id = self.allocate_request_id();
        let packet = CommandPacket::new(WriteMem::new(address, data)?, request_id);
        self.check_cmd_length(packet.cmd_len())?;
        packet.serialize_into(&mut self.cmd_buffer);

        let (start, len) = self.transact(request_id, ack::ACK_WRITEMEM)?;
        if let Some(written) = ack::written_length(&self.ack_buffer[start..start + len])
            && written as usize != data.len()
        {
            return Err(ControlError::InvalidPacket(format!(
                "device wrote {written} of {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    /// One command/acknowledge exchange, including the PENDING_ACK retry
    /// loop. Expects the serialized command in `cmd_buffer`; returns the
    /// payload location within `ack_buffer`.
    fn transact(&mut self, request_id: u16, expected_ack: u16) -> ControlResult<(usize, usize)> {
        let mut timeout = self.config.timeout_duration;
        if let Err(e) = self.channel.send(&self.cmd_buffer, timeout) {
            return Err(self.handle_fatal(e));
        }

        let window = self
            .ack_buffer
            .len()
            .min(self.config.maximum_ack_length as usize);
        let mut retries = 0u16;
        loop {
            let received = match self.channel.recv(&mut self.ack_buffer[..window], timeout) {
                Ok(n) => n,
                Err(e) => return Err(self.handle_fatal(e)),
            };
            let ack = AckPacket::parse(&self.ack_buffer[..received])?;
            if ack.request_id != request_id {
                return Err(ControlError::InvalidPacket(format!(
                    "acknowledge for request {} while request {request_id} is in flight",
                    ack.request_id
                )));
            }
            match ack.status {
                Status::Success => {
                    if ack.acknowledge != expected_ack {
                        return Err(ControlError::InvalidPacket(format!(
                            "unexpected acknowledge code {:#06x} (expected {expected_ack:#06x})",
                            ack.acknowledge
                        )));
                    }
                    return Ok((ACK_HEADER_SIZE, ack.payload.len()));
                }
                Status::Pending => {
                    retries += 1;
                    if retries > self.config.retry_count {
                        log::warn!(
                            "device still pending after {retries} acknowledges, giving up"
                        );
                        return Err(ControlError::PendingAckExceeded);
                    }
                    let pending = Pending::parse(ack.payload)?;
                    log::trace!(
                        "pending acknowledge, waiting up to {:?} (retry {retries}/{})",
                        pending.timeout,
                        self.config.retry_count
                    );
                    timeout = pending.timeout.max(Duration::from_millis(1));
                }
                Status::Nak(code) => return Err(ControlError::Nak(code)),
            }
        }
    }

    /// Device-gone failures leave nothing to keep open; the handle is
    /// forced into the closed state. Everything else leaves the state
    /// untouched.
    fn handle_fatal(&mut self, err: ControlError) -> ControlError {
        if matches!(err, ControlError::InvalidDevice(_)) {
            log::warn!("device lost mid-transaction, closing handle: {err}");
            let _ = self.channel.close();
            self.state = State::Closed;
            self.abrm = None;
            self.sbrm = None;
        }
        err
    }
}

fn unzip_first_file(bytes: &[u8]) -> ControlResult<String> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| ControlError::ParseError(format!("GenICam zip archive: {e}")))?;
    if archive.is_empty() {
        return Err(ControlError::ParseError(
            "GenICam zip archive is empty".into(),
        ));
    }
    let mut file = archive
        .by_index(0)
        .map_err(|e| ControlError::ParseError(format!("GenICam zip archive: {e}")))?;
    let mut xml = String::new();
    file.read_to_string(&mut xml)
        .map_err(|e| ControlError::ParseError(format!("GenICam zip content: {e}")))?;
    Ok(xml)
}

impl<C: ControlChannel> DeviceControl for ControlHandle<C> {
    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn is_opened(&self) -> bool {
        ControlHandle::is_opened(self)
    }

    fn open(&mut self) -> ControlResult<()> {
        ControlHandle::open(self)
    }

    fn close(&mut self) -> ControlResult<()> {
        ControlHandle::close(self)
    }

    fn read(&mut self, address: u64, buf: &mut [u8]) -> ControlResult<()> {
        ControlHandle::read(self, address, buf)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> ControlResult<()> {
        ControlHandle::write(self, address, data)
    }

    fn genapi(&mut self) -> ControlResult<String> {
        ControlHandle::genapi(self)
    }

    fn enable_streaming(&mut self) -> ControlResult<()> {
        ControlHandle::enable_streaming(self)
    }

    fn disable_streaming(&mut self) -> ControlResult<()> {
        ControlHandle::disable_streaming(self)
    }

    fn timeout_duration(&self) -> Duration {
        ControlHandle::timeout_duration(self)
    }

    fn set_timeout_duration(&mut self, duration: Duration) {
        ControlHandle::set_timeout_duration(self, duration);
    }

    fn retry_count(&self) -> u16 {
        ControlHandle::retry_count(self)
    }

    fn set_retry_count(&mut self, count: u16) {
        ControlHandle::set_retry_count(self, count);
    }

    fn buffer_capacity(&self) -> usize {
        ControlHandle::buffer_capacity(self)
    }

    fn resize_buffer(&mut self, size: usize) {
        ControlHandle::resize_buffer(self, size);
    }
}

/// Thread-safe wrapper around one [`ControlHandle`].
///
/// Clones share the same session; every operation holds the lock for the
/// whole transaction, PENDING_ACK retries included, so command/acknowledge
/// pairs from different threads never interleave on the wire.
pub struct SharedControlHandle<C = UsbChannel> {
    inner: Arc<Mutex<ControlHandle<C>>>,
}

impl<C> Clone for SharedControlHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ControlChannel> From<ControlHandle<C>> for SharedControlHandle<C> {
    fn from(handle: ControlHandle<C>) -> Self {
        Self::new(handle)
    }
}

impl<C: ControlChannel> SharedControlHandle<C> {
    pub fn new(handle: ControlHandle<C>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(handle)),
        }
    }

    /// A poisoned lock only means another thread panicked mid-operation;
    /// the handle itself is still coherent, so recover the guard.
    fn lock(&self) -> MutexGuard<'_, ControlHandle<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the inner handle.
    ///
    /// This is the critical-section primitive for multi-register
    /// atomicity: read-modify-write sequences that must not interleave
    /// with other clients go through here.
    pub fn with_handle<T>(&self, f: impl FnOnce(&mut ControlHandle<C>) -> T) -> T {
        let mut guard = self.lock();
        f(&mut guard)
    }
}

impl<C: ControlChannel> DeviceControl for SharedControlHandle<C> {
    fn device_info(&self) -> DeviceInfo {
        self.lock().device_info().clone()
    }

    fn is_opened(&self) -> bool {
        self.lock().is_opened()
    }

    fn open(&mut self) -> ControlResult<()> {
        self.lock().open()
    }

    fn close(&mut self) -> ControlResult<()> {
        self.lock().close()
    }

    fn read(&mut self, address: u64, buf: &mut [u8]) -> ControlResult<()> {
        self.lock().read(address, buf)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> ControlResult<()> {
        self.lock().write(address, data)
    }

    fn genapi(&mut self) -> ControlResult<String> {
        self.lock().genapi()
    }

    fn enable_streaming(&mut self) -> ControlResult<()> {
        self.lock().enable_streaming()
    }

    fn disable_streaming(&mut self) -> ControlResult<()> {
        self.lock().disable_streaming()
    }

    fn timeout_duration(&self) -> Duration {
        self.lock().timeout_duration()
    }

    fn set_timeout_duration(&mut self, duration: Duration) {
        self.lock().set_timeout_duration(duration);
    }

    fn retry_count(&self) -> u16 {
        self.lock().retry_count()
    }

    fn set_retry_count(&mut self, count: u16) {
        self.lock().set_retry_count(count);
    }

    fn buffer_capacity(&self) -> usize {
        self.lock().buffer_capacity()
    }

    fn resize_buffer(&mut self, size: usize) {
        self.lock().resize_buffer(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    use crate::channel::mock::{MockChannel, ack_frame};
    use crate::protocol::ack::{ACK_READMEM, STATUS_SUCCESS};
    use crate::register_map::{abrm, manifest, sbrm as sbrm_reg};

    const SBRM_BASE: u64 = 0x2_0000;
    const SIRM_BASE: u64 = 0x3_0000;
    const MANIFEST_BASE: u64 = 0x4_0000;

    fn test_info() -> DeviceInfo {
        DeviceInfo {
            vendor_id: 0x2676,
            product_id: 0xBA02,
            bus_number: 1,
            device_address: 4,
            vendor_name: "Example Imaging".into(),
            model_name: "EI-2000".into(),
            serial_number: "SN000123".into(),
            manufacturer_info: String::new(),
            speed: None,
        }
    }

    /// Populate a plausible bootstrap register space: ABRM with SBRM and
    /// manifest pointers, SBRM with negotiated limits and a SIRM pointer.
    fn seed_bootstrap(chan: &mut MockChannel) {
        chan.set_memory(abrm::GENCP_VERSION.address, &0x0001_0000u32.to_le_bytes());
        chan.set_memory(abrm::MANUFACTURER_NAME.address, b"Example Imaging\0");
        chan.set_memory(abrm::MODEL_NAME.address, b"EI-2000\0");
        chan.set_memory(abrm::SERIAL_NUMBER.address, b"SN000123\0");
        chan.set_memory(abrm::DEVICE_CAPABILITY.address, &1u64.to_le_bytes());
        chan.set_memory(
            abrm::MAXIMUM_DEVICE_RESPONSE_TIME.address,
            &480u32.to_le_bytes(),
        );
        chan.set_memory(
            abrm::MANIFEST_TABLE_ADDRESS.address,
            &MANIFEST_BASE.to_le_bytes(),
        );
        chan.set_memory(abrm::SBRM_ADDRESS.address, &SBRM_BASE.to_le_bytes());

        chan.set_memory(
            SBRM_BASE + sbrm_reg::MAXIMUM_CMD_LENGTH.address,
            &512u32.to_le_bytes(),
        );
        chan.set_memory(
            SBRM_BASE + sbrm_reg::MAXIMUM_ACK_LENGTH.address,
            &512u32.to_le_bytes(),
        );
        chan.set_memory(
            SBRM_BASE + sbrm_reg::SIRM_ADDRESS.address,
            &SIRM_BASE.to_le_bytes(),
        );
        chan.set_memory(
            SBRM_BASE + sbrm_reg::CURRENT_SPEED.address,
            &0x8u32.to_le_bytes(),
        );
    }

    fn opened_handle() -> ControlHandle<MockChannel> {
        let mut chan = MockChannel::new();
        seed_bootstrap(&mut chan);
        let mut handle = ControlHandle::with_channel(chan, test_info());
        handle.open().unwrap();
        handle
    }

    #[test]
    fn io_requires_open() {
        let chan = MockChannel::new();
        let mut handle = ControlHandle::with_channel(chan, test_info());
        let mut buf = [0u8; 4];
        assert!(matches!(
            handle.read(0, &mut buf).unwrap_err(),
            ControlError::NotOpened
        ));
        assert!(matches!(
            handle.write(0, &[0]).unwrap_err(),
            ControlError::NotOpened
        ));
        assert!(matches!(
            handle.genapi().unwrap_err(),
            ControlError::NotOpened
        ));
    }

    #[test]
    fn open_negotiates_limits_and_timeout() {
        let handle = opened_handle();
        assert!(handle.is_opened());
        assert_eq!(handle.timeout_duration(), Duration::from_millis(480));
        assert_eq!(handle.connection_config().maximum_cmd_length, 512);
        assert_eq!(handle.connection_config().maximum_ack_length, 512);
    }

    #[test]
    fn open_is_idempotent() {
        let mut handle = opened_handle();
        let frames_after_open = handle.channel().sent_count();
        handle.open().unwrap();
        assert_eq!(handle.channel().sent_count(), frames_after_open);
    }

    #[test]
    fn open_failure_leaves_handle_closed_but_reopenable() {
        // No SBRM pointer seeded: open must fail and release the channel.
        let mut chan = MockChannel::new();
        chan.set_memory(abrm::DEVICE_CAPABILITY.address, &0u64.to_le_bytes());
        let mut handle = ControlHandle::with_channel(chan, test_info());
        assert!(handle.open().is_err());
        assert!(!handle.is_opened());
        assert!(!handle.channel().is_opened());

        // Seed properly and reopen.
        seed_bootstrap(handle.channel_mut());
        handle.open().unwrap();
        assert!(handle.is_opened());
    }

    #[test]
    fn close_and_reopen() {
        let mut handle = opened_handle();
        handle.close().unwrap();
        assert!(!handle.is_opened());
        let mut buf = [0u8; 1];
        assert!(matches!(
            handle.read(0, &mut buf).unwrap_err(),
            ControlError::NotOpened
        ));
        handle.open().unwrap();
        assert!(handle.is_opened());
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut handle = opened_handle();
        let data = *b"payload!";
        handle.write(0x8000, &data).unwrap();
        let mut buf = [0u8; 8];
        handle.read(0x8000, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn read_fills_exactly_the_callers_buffer() {
        let mut handle = opened_handle();
        handle.write(0x8000, &[0xAA; 16]).unwrap();
        let mut buf = [0u8; 4];
        handle.read(0x8000, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; 4]);
    }

    #[test]
    fn chunked_read_issues_contiguous_subreads() {
        let mut handle = opened_handle();
        // Shrink the acknowledge limit so 200 bytes need ceil(200/52) = 4
        // sub-reads.
        handle.config.maximum_ack_length = 64;

        let pattern: Vec<u8> = (0..200u8).collect();
        handle.channel_mut().set_memory(0x1_0000, &pattern);

        let before = handle.channel().sent_count();
        let mut buf = vec![0u8; 200];
        handle.read(0x1_0000, &mut buf).unwrap();
        assert_eq!(buf, pattern);
        assert_eq!(handle.channel().sent_count() - before, 4);

        // Each sub-read advanced the address by one full chunk.
        let frames = &handle.channel().sent[before..];
        let addresses: Vec<u64> = frames
            .iter()
            .map(|f| u64::from_le_bytes(f[12..20].try_into().unwrap()))
            .collect();
        assert_eq!(addresses, vec![0x1_0000, 0x1_0034, 0x1_0068, 0x1_009C]);
    }

    #[test]
    fn chunked_write_respects_cmd_length() {
        let mut handle = opened_handle();
        handle.config.maximum_cmd_length = 64;
        // 64 - 12 - 8 = 44 data bytes per chunk; 100 bytes -> 3 chunks.
        let data: Vec<u8> = (0..100u8).collect();

        let before = handle.channel().sent_count();
        handle.write(0x1_0000, &data).unwrap();
        assert_eq!(handle.channel().sent_count() - before, 3);
        assert_eq!(handle.channel().memory(0x1_0000, 100), data);
    }

    #[test]
    fn pending_ack_retries_then_succeeds() {
        let mut handle = opened_handle();
        handle.channel_mut().set_memory(0x5000, &[0x78, 0x56, 0x34, 0x12]);
        handle.channel_mut().set_pending(2, 5);

        let mut buf = [0u8; 4];
        handle.read(0x5000, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x1234_5678);
    }

    #[test]
    fn pending_ack_exceeding_retry_count_fails() {
        let mut handle = opened_handle();
        handle.set_retry_count(3);
        handle.channel_mut().set_pending(4, 5);

        let mut buf = [0u8; 1];
        assert!(matches!(
            handle.read(0, &mut buf).unwrap_err(),
            ControlError::PendingAckExceeded
        ));
        // The handle survives a pending overrun.
        assert!(handle.is_opened());
    }

    #[test]
    fn mismatched_request_id_is_protocol_error() {
        let mut handle = opened_handle();
        let bogus = ack_frame(STATUS_SUCCESS, ACK_READMEM, 0xDEAD, &[0u8; 1]);
        handle.channel_mut().queue_frame(bogus);

        let mut buf = [0u8; 1];
        let err = handle.read(0, &mut buf).unwrap_err();
        assert!(matches!(err, ControlError::InvalidPacket(_)));
        assert!(err.to_string().contains("in flight"));
    }

    #[test]
    fn nak_status_maps_to_nak_error() {
        let mut handle = opened_handle();
        handle.channel_mut().set_force_status(0x8004); // write protect
        let err = handle.write(0x0184, b"name").unwrap_err();
        match err {
            ControlError::Nak(code) => assert_eq!(code.raw(), 0x8004),
            other => panic!("expected Nak, got {other}"),
        }
    }

    #[test]
    fn device_loss_forces_handle_closed() {
        let mut handle = opened_handle();
        handle
            .channel_mut()
            .fail_next_recv(ControlError::InvalidDevice("libusb: no device".into()));

        let mut buf = [0u8; 1];
        let err = handle.read(0, &mut buf).unwrap_err();
        assert!(matches!(err, ControlError::InvalidDevice(_)));
        assert!(!handle.is_opened());
    }

    #[test]
    fn timeout_does_not_close_the_handle() {
        let mut handle = opened_handle();
        handle.channel_mut().fail_next_recv(ControlError::Timeout);

        let mut buf = [0u8; 1];
        assert!(matches!(
            handle.read(0, &mut buf).unwrap_err(),
            ControlError::Timeout
        ));
        assert!(handle.is_opened());
    }

    #[test]
    fn enable_streaming_sets_control_bit() {
        let mut handle = opened_handle();
        handle.enable_streaming().unwrap();
        assert_eq!(
            handle.channel().memory(SIRM_BASE + 0x04, 4),
            1u32.to_le_bytes()
        );
        handle.disable_streaming().unwrap();
        assert_eq!(
            handle.channel().memory(SIRM_BASE + 0x04, 4),
            0u32.to_le_bytes()
        );
    }

    #[test]
    fn enable_streaming_without_sirm_is_not_supported() {
        let mut chan = MockChannel::new();
        seed_bootstrap(&mut chan);
        // Zero out the SIRM pointer.
        chan.set_memory(
            SBRM_BASE + sbrm_reg::SIRM_ADDRESS.address,
            &0u64.to_le_bytes(),
        );
        let mut handle = ControlHandle::with_channel(chan, test_info());
        handle.open().unwrap();

        let err = handle.enable_streaming().unwrap_err();
        assert!(matches!(err, ControlError::NotSupported(_)));
        assert!(handle.is_opened());
    }

    fn seed_manifest(chan: &mut MockChannel, file_name: &[u8], blob: &[u8], address: u64) {
        chan.set_memory(MANIFEST_BASE, &1u64.to_le_bytes());
        let entry = MANIFEST_BASE + manifest::FIRST_ENTRY_OFFSET;
        chan.set_memory(entry + manifest::FILE_NAME.address, file_name);
        chan.set_memory(
            entry + manifest::FILE_ADDRESS.address,
            &address.to_le_bytes(),
        );
        chan.set_memory(
            entry + manifest::FILE_SIZE.address,
            &(blob.len() as u64).to_le_bytes(),
        );
        chan.set_memory(address, blob);
    }

    #[test]
    fn genapi_reads_plain_xml() {
        let mut handle = opened_handle();
        let xml = "<RegisterDescription>ok</RegisterDescription>";
        seed_manifest(
            handle.channel_mut(),
            b"genicam.xml\0",
            xml.as_bytes(),
            0x9_0000,
        );
        assert_eq!(handle.genapi().unwrap(), xml);
    }

    #[test]
    fn genapi_unzips_zip_entries() {
        let mut handle = opened_handle();
        let xml = "<RegisterDescription>zipped</RegisterDescription>";

        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("genicam.xml", options).unwrap();
        writer.write_all(xml.as_bytes()).unwrap();
        let blob = writer.finish().unwrap().into_inner();

        seed_manifest(handle.channel_mut(), b"genicam.zip\0", &blob, 0x9_0000);
        assert_eq!(handle.genapi().unwrap(), xml);
    }

    #[test]
    fn genapi_grows_a_shrunken_buffer() {
        let mut handle = opened_handle();
        let xml = "<RegisterDescription>ok</RegisterDescription>";
        seed_manifest(
            handle.channel_mut(),
            b"genicam.xml\0",
            xml.as_bytes(),
            0x9_0000,
        );

        handle.resize_buffer(64);
        assert_eq!(handle.genapi().unwrap(), xml);
        // The pull restored full-size acknowledges (negotiated 512).
        assert_eq!(handle.buffer_capacity(), 512);
    }

    #[test]
    fn genapi_empty_manifest_is_invalid_device() {
        let mut handle = opened_handle();
        // Count register stays zero.
        let err = handle.genapi().unwrap_err();
        assert!(matches!(err, ControlError::InvalidDevice(_)));
    }

    #[test]
    fn buffer_capacity_resizes() {
        let mut handle = opened_handle();
        assert_eq!(handle.buffer_capacity(), 1024);
        handle.resize_buffer(4096);
        assert_eq!(handle.buffer_capacity(), 4096);

        // A buffer below the header size cannot carry payload.
        handle.resize_buffer(8);
        let mut buf = [0u8; 4];
        assert!(matches!(
            handle.read(0, &mut buf).unwrap_err(),
            ControlError::BufferTooSmall(_)
        ));
    }

    #[test]
    fn request_id_wraps_at_sixteen_bits() {
        let mut handle = opened_handle();
        handle.next_request_id = u16::MAX;
        handle.channel_mut().set_memory(0x8000, &[1, 2]);

        let mut buf = [0u8; 2];
        handle.read(0x8000, &mut buf).unwrap(); // id 0xFFFF
        handle.read(0x8000, &mut buf).unwrap(); // id 0x0000 after the wrap
        let frames = &handle.channel().sent;
        let ids: Vec<u16> = frames[frames.len() - 2..]
            .iter()
            .map(|f| u16::from_le_bytes(f[10..12].try_into().unwrap()))
            .collect();
        assert_eq!(ids, vec![u16::MAX, 0]);
    }

    #[test]
    fn shared_handle_serializes_concurrent_readers() {
        let mut chan = MockChannel::new();
        seed_bootstrap(&mut chan);
        chan.set_memory(0x8000, &[0x42; 64]);
        let mut handle = ControlHandle::with_channel(chan, test_info());
        handle.open().unwrap();
        let frames_after_open = handle.channel().sent_count();

        let shared = SharedControlHandle::new(handle);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let mut shared = shared.clone();
                scope.spawn(move || {
                    for _ in 0..10 {
                        let mut buf = [0u8; 64];
                        shared.read(0x8000, &mut buf).unwrap();
                        assert_eq!(buf, [0x42; 64]);
                    }
                });
            }
        });

        // Every transaction made it through, one frame per read.
        shared.with_handle(|handle| {
            assert_eq!(handle.channel().sent_count() - frames_after_open, 40);
        });
    }

    #[test]
    fn shared_handle_with_handle_gives_scoped_access() {
        let shared = SharedControlHandle::new(opened_handle());
        let serial = shared.with_handle(|handle| {
            let abrm = handle.abrm().unwrap();
            abrm.serial_number(handle).unwrap()
        });
        assert_eq!(serial, "SN000123");
    }

    #[test]
    fn shared_handle_exposes_device_info() {
        let shared = SharedControlHandle::new(opened_handle());
        assert_eq!(shared.device_info().serial_number, "SN000123");
        assert!(shared.is_opened());
    }
}
