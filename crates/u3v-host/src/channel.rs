//! Control-channel transport — bulk I/O over the claimed U3V interface.
//!
//! [`ControlChannel`] is the seam between the session logic and the USB
//! stack: open/close the interface, move opaque byte sequences over the
//! bulk endpoints within a timeout. [`UsbChannel`] is the rusb-backed
//! implementation; [`mock::MockChannel`] answers from an in-memory
//! register space for tests.
//!
//! Retry policy does not live here: a timeout is reported as-is and the
//! transaction loop in [`crate::control`] decides what to do with it.

use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, Direction, TransferType};

use crate::device::{self, DeviceInfo};
use crate::error::{ControlError, ControlResult};

/// Byte transport over one device's control endpoints.
pub trait ControlChannel {
    /// Claim the control interface and prepare the endpoints.
    fn open(&mut self) -> ControlResult<()>;

    /// Release the interface. Idempotent.
    fn close(&mut self) -> ControlResult<()>;

    fn is_opened(&self) -> bool;

    /// Write `data` to the bulk-out endpoint. Short writes are errors.
    fn send(&mut self, data: &[u8], timeout: Duration) -> ControlResult<()>;

    /// Read one transfer from the bulk-in endpoint into `buf`, returning
    /// the number of bytes received.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> ControlResult<usize>;
}

/// rusb-backed control channel.
pub struct UsbChannel {
    device: Device<Context>,
    handle: Option<DeviceHandle<Context>>,
    interface_number: u8,
    ep_in: u8,
    ep_out: u8,
}

impl UsbChannel {
    /// Resolve the control interface and its bulk endpoints of `device`.
    ///
    /// Nothing is claimed yet; that happens in [`ControlChannel::open`].
    pub fn new(device: Device<Context>) -> ControlResult<Self> {
        let config = device
            .active_config_descriptor()
            .map_err(ControlError::from)?;

        let mut resolved = None;
        'interfaces: for interface in config.interfaces() {
            for desc in interface.descriptors() {
                if !device::is_u3v_control_interface(
                    desc.class_code(),
                    desc.sub_class_code(),
                    desc.protocol_code(),
                ) {
                    continue;
                }
                let mut ep_in = None;
                let mut ep_out = None;
                for ep in desc.endpoint_descriptors() {
                    if ep.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match ep.direction() {
                        Direction::In => ep_in = Some(ep.address()),
                        Direction::Out => ep_out = Some(ep.address()),
                    }
                }
                resolved = Some((desc.interface_number(), ep_in, ep_out));
                break 'interfaces;
            }
        }

        let Some((interface_number, ep_in, ep_out)) = resolved else {
            return Err(ControlError::InvalidDevice(
                "device exposes no U3V control interface".into(),
            ));
        };
        let ep_in = ep_in.ok_or_else(|| {
            ControlError::InvalidDevice("control interface has no bulk-in endpoint".into())
        })?;
        let ep_out = ep_out.ok_or_else(|| {
            ControlError::InvalidDevice("control interface has no bulk-out endpoint".into())
        })?;

        Ok(Self {
            device,
            handle: None,
            interface_number,
            ep_in,
            ep_out,
        })
    }

    /// Locate a previously enumerated device and build its channel.
    pub fn from_device_info(info: &DeviceInfo) -> ControlResult<Self> {
        let device = device::find_usb_device(info)?;
        Self::new(device)
    }
}

impl ControlChannel for UsbChannel {
    fn open(&mut self) -> ControlResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = self.device.open()?;
        // Not supported on every platform; claiming still works without it.
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(self.interface_number)?;
        log::debug!(
            "claimed interface {} (bulk in {:#04x}, bulk out {:#04x})",
            self.interface_number,
            self.ep_in,
            self.ep_out
        );
        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) -> ControlResult<()> {
        if let Some(handle) = self.handle.take() {
            handle.release_interface(self.interface_number)?;
        }
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.handle.is_some()
    }

    fn send(&mut self, data: &[u8], timeout: Duration) -> ControlResult<()> {
        let handle = self.handle.as_ref().ok_or(ControlError::NotOpened)?;
        let written = handle.write_bulk(self.ep_out, data, timeout)?;
        if written != data.len() {
            return Err(ControlError::Io(format!(
                "short bulk write: {written} of {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> ControlResult<usize> {
        let handle = self.handle.as_ref().ok_or(ControlError::NotOpened)?;
        Ok(handle.read_bulk(self.ep_in, buf, timeout)?)
    }
}

impl Drop for UsbChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ── Mock channel for testing ──

/// In-memory channel for unit and integration tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use std::collections::{BTreeMap, VecDeque};
    use std::time::Duration;

    use super::ControlChannel;
    use crate::error::{ControlError, ControlResult};
    use crate::protocol::ack::{ACK_PENDING, ACK_READMEM, ACK_WRITEMEM, STATUS_PENDING_ACK};
    use crate::protocol::cmd::{COMMAND_READMEM, COMMAND_WRITEMEM};
    use crate::protocol::{ACK_HEADER_SIZE, CMD_HEADER_SIZE, PACKET_PREFIX};

    /// Build a raw acknowledge frame. Public so tests can script malformed
    /// or mismatched replies via [`MockChannel::queue_frame`].
    pub fn ack_frame(status: u16, acknowledge: u16, request_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ACK_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&PACKET_PREFIX.to_le_bytes());
        buf.extend_from_slice(&status.to_le_bytes());
        buf.extend_from_slice(&acknowledge.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        buf.extend_from_slice(&request_id.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Emulated device behind a [`ControlChannel`].
    ///
    /// Holds a sparse register space (byte map, zeros where unwritten) and
    /// answers READMEM/WRITEMEM like a well-behaved device: echoing the
    /// request id, honoring the declared lengths. Scripted behaviors let
    /// tests inject pending acknowledges, fixed statuses, raw frames and
    /// transport faults.
    pub struct MockChannel {
        memory: BTreeMap<u64, u8>,
        opened: bool,
        last_cmd: Option<Vec<u8>>,
        /// Raw frames returned by `recv` before any synthesized reply.
        queued_frames: VecDeque<Vec<u8>>,
        /// Reply PENDING_ACK this many times before executing the command.
        pending_replies: u16,
        pending_timeout_ms: u16,
        /// Answer every command with this status and an empty payload.
        force_status: Option<u16>,
        /// Error injected into the next `send`.
        send_fault: Option<ControlError>,
        /// Error injected into the next `recv`.
        recv_fault: Option<ControlError>,
        /// Raw command frames observed, in order.
        pub sent: Vec<Vec<u8>>,
    }

    impl Default for MockChannel {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockChannel {
        pub fn new() -> Self {
            Self {
                memory: BTreeMap::new(),
                opened: false,
                last_cmd: None,
                queued_frames: VecDeque::new(),
                pending_replies: 0,
                pending_timeout_ms: 1,
                force_status: None,
                send_fault: None,
                recv_fault: None,
                sent: Vec::new(),
            }
        }

        /// Seed the register space with `bytes` at `address`.
        pub fn set_memory(&mut self, address: u64, bytes: &[u8]) {
            for (i, &b) in bytes.iter().enumerate() {
                self.memory.insert(address + i as u64, b);
            }
        }

        /// Read back `len` bytes at `address` (zeros where unwritten).
        pub fn memory(&self, address: u64, len: usize) -> Vec<u8> {
            (0..len)
                .map(|i| *self.memory.get(&(address + i as u64)).unwrap_or(&0))
                .collect()
        }

        /// Queue a raw frame returned by the next `recv`, ahead of any
        /// synthesized reply.
        pub fn queue_frame(&mut self, frame: Vec<u8>) {
            self.queued_frames.push_back(frame);
        }

        /// Answer the next `count` receives with PENDING_ACK suggesting
        /// `timeout_ms`, then execute the command normally.
        pub fn set_pending(&mut self, count: u16, timeout_ms: u16) {
            self.pending_replies = count;
            self.pending_timeout_ms = timeout_ms;
        }

        /// Answer every command with `status` and an empty payload.
        pub fn set_force_status(&mut self, status: u16) {
            self.force_status = Some(status);
        }

        pub fn clear_force_status(&mut self) {
            self.force_status = None;
        }

        /// Inject an error into the next `send`.
        pub fn fail_next_send(&mut self, err: ControlError) {
            self.send_fault = Some(err);
        }

        /// Inject an error into the next `recv`.
        pub fn fail_next_recv(&mut self, err: ControlError) {
            self.recv_fault = Some(err);
        }

        /// Number of command frames observed so far.
        pub fn sent_count(&self) -> usize {
            self.sent.len()
        }

        /// Synthesize the reply to the last received command.
        fn execute(&mut self) -> ControlResult<Vec<u8>> {
            let cmd = self.last_cmd.as_deref().ok_or_else(|| {
                ControlError::Io("mock: recv without a preceding command".into())
            })?;
            if cmd.len() < CMD_HEADER_SIZE {
                return Err(ControlError::Io("mock: truncated command frame".into()));
            }
            let command = u16::from_le_bytes(cmd[6..8].try_into().unwrap_or_default());
            let request_id = u16::from_le_bytes(cmd[10..12].try_into().unwrap_or_default());
            let scd = &cmd[CMD_HEADER_SIZE..];

            if self.pending_replies > 0 {
                self.pending_replies -= 1;
                let mut payload = Vec::with_capacity(4);
                payload.extend_from_slice(&0u16.to_le_bytes());
                payload.extend_from_slice(&self.pending_timeout_ms.to_le_bytes());
                return Ok(ack_frame(
                    STATUS_PENDING_ACK,
                    ACK_PENDING,
                    request_id,
                    &payload,
                ));
            }

            if let Some(status) = self.force_status {
                return Ok(ack_frame(status, command + 1, request_id, &[]));
            }

            match command {
                COMMAND_READMEM => {
                    if scd.len() < 10 {
                        return Err(ControlError::Io("mock: short READMEM scd".into()));
                    }
                    let address = u64::from_le_bytes(scd[0..8].try_into().unwrap_or_default());
                    let len = u16::from_le_bytes(scd[8..10].try_into().unwrap_or_default());
                    let data = self.memory(address, len as usize);
                    Ok(ack_frame(0, ACK_READMEM, request_id, &data))
                }
                COMMAND_WRITEMEM => {
                    if scd.len() < 8 {
                        return Err(ControlError::Io("mock: short WRITEMEM scd".into()));
                    }
                    let address = u64::from_le_bytes(scd[0..8].try_into().unwrap_or_default());
                    let data = scd[8..].to_vec();
                    self.set_memory(address, &data);
                    let mut payload = Vec::with_capacity(4);
                    payload.extend_from_slice(&0u16.to_le_bytes());
                    payload.extend_from_slice(&(data.len() as u16).to_le_bytes());
                    Ok(ack_frame(0, ACK_WRITEMEM, request_id, &payload))
                }
                other => Ok(ack_frame(0x800E, other + 1, request_id, &[])),
            }
        }
    }

    impl ControlChannel for MockChannel {
        fn open(&mut self) -> ControlResult<()> {
            self.opened = true;
            Ok(())
        }

        fn close(&mut self) -> ControlResult<()> {
            self.opened = false;
            Ok(())
        }

        fn is_opened(&self) -> bool {
            self.opened
        }

        fn send(&mut self, data: &[u8], _timeout: Duration) -> ControlResult<()> {
            if !self.opened {
                return Err(ControlError::NotOpened);
            }
            if let Some(err) = self.send_fault.take() {
                return Err(err);
            }
            self.sent.push(data.to_vec());
            self.last_cmd = Some(data.to_vec());
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> ControlResult<usize> {
            if !self.opened {
                return Err(ControlError::NotOpened);
            }
            if let Some(err) = self.recv_fault.take() {
                return Err(err);
            }
            let frame = match self.queued_frames.pop_front() {
                Some(frame) => frame,
                None => self.execute()?,
            };
            let n = frame.len().min(buf.len());
            buf[..n].copy_from_slice(&frame[..n]);
            Ok(n)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::protocol::cmd::{CommandPacket, ReadMem, WriteMem};

        fn send_cmd(chan: &mut MockChannel, frame: &[u8]) {
            chan.send(frame, Duration::from_millis(100)).unwrap();
        }

        fn recv_frame(chan: &mut MockChannel) -> Vec<u8> {
            let mut buf = vec![0u8; 512];
            let n = chan.recv(&mut buf, Duration::from_millis(100)).unwrap();
            buf.truncate(n);
            buf
        }

        #[test]
        fn memory_reads_zero_when_unwritten() {
            let chan = MockChannel::new();
            assert_eq!(chan.memory(0x1000, 4), vec![0, 0, 0, 0]);
        }

        #[test]
        fn memory_overlapping_writes_last_wins() {
            let mut chan = MockChannel::new();
            chan.set_memory(0x100, &[1, 2, 3, 4]);
            chan.set_memory(0x102, &[9, 9]);
            assert_eq!(chan.memory(0x100, 4), vec![1, 2, 9, 9]);
        }

        #[test]
        fn readmem_echoes_request_id_and_data() {
            let mut chan = MockChannel::new();
            chan.open().unwrap();
            chan.set_memory(0x2000, &[0xDE, 0xAD]);

            let mut frame = Vec::new();
            CommandPacket::new(
                ReadMem {
                    address: 0x2000,
                    read_length: 2,
                },
                0x1234,
            )
            .serialize_into(&mut frame);
            send_cmd(&mut chan, &frame);

            let reply = recv_frame(&mut chan);
            assert_eq!(&reply[0..4], b"U3VC");
            assert_eq!(u16::from_le_bytes(reply[4..6].try_into().unwrap()), 0);
            assert_eq!(
                u16::from_le_bytes(reply[6..8].try_into().unwrap()),
                ACK_READMEM
            );
            assert_eq!(u16::from_le_bytes(reply[10..12].try_into().unwrap()), 0x1234);
            assert_eq!(&reply[12..], &[0xDE, 0xAD]);
        }

        #[test]
        fn writemem_stores_and_reports_length() {
            let mut chan = MockChannel::new();
            chan.open().unwrap();

            let mut frame = Vec::new();
            CommandPacket::new(WriteMem::new(0x3000, &[7, 8, 9]).unwrap(), 5)
                .serialize_into(&mut frame);
            send_cmd(&mut chan, &frame);

            let reply = recv_frame(&mut chan);
            assert_eq!(chan.memory(0x3000, 3), vec![7, 8, 9]);
            // written length in payload bytes 2..4
            assert_eq!(u16::from_le_bytes(reply[14..16].try_into().unwrap()), 3);
        }

        #[test]
        fn pending_counts_down_then_executes() {
            let mut chan = MockChannel::new();
            chan.open().unwrap();
            chan.set_memory(0, &[0x55]);
            chan.set_pending(2, 10);

            let mut frame = Vec::new();
            CommandPacket::new(
                ReadMem {
                    address: 0,
                    read_length: 1,
                },
                1,
            )
            .serialize_into(&mut frame);
            send_cmd(&mut chan, &frame);

            for _ in 0..2 {
                let reply = recv_frame(&mut chan);
                assert_eq!(
                    u16::from_le_bytes(reply[4..6].try_into().unwrap()),
                    STATUS_PENDING_ACK
                );
            }
            let reply = recv_frame(&mut chan);
            assert_eq!(u16::from_le_bytes(reply[4..6].try_into().unwrap()), 0);
            assert_eq!(&reply[12..], &[0x55]);
        }

        #[test]
        fn closed_channel_rejects_io() {
            let mut chan = MockChannel::new();
            let err = chan.send(&[0], Duration::from_millis(1)).unwrap_err();
            assert!(matches!(err, ControlError::NotOpened));
        }

        #[test]
        fn injected_faults_fire_once() {
            let mut chan = MockChannel::new();
            chan.open().unwrap();
            chan.fail_next_send(ControlError::Timeout);
            let err = chan.send(&[0], Duration::from_millis(1)).unwrap_err();
            assert!(matches!(err, ControlError::Timeout));
            // next send succeeds
            chan.send(&[0; 12], Duration::from_millis(1)).unwrap();
        }
    }
}
