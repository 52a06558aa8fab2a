//! ## Transport
//!
//! The USB transport facade: everything the protocol engines need from the
//! USB stack, behind a trait so the full driver can run against scripted
//! hardware in tests. The facade owns no protocol state beyond the claimed
//! interface.

use std::time::Duration;

use rusb::{Context, DeviceHandle};

use crate::types::DeviceMode;

/// Failures reported by the USB stack, reduced to the cases the protocol
/// engines react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transfer timed out")]
    Timeout,
    #[error("endpoint stalled")]
    Stall,
    #[error("device disconnected")]
    Disconnected,
    #[error("transfer overflowed the provided buffer")]
    Overflow,
    #[error("usb stack error: {0}")]
    Usb(rusb::Error),
}

impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Pipe => TransportError::Stall,
            rusb::Error::NoDevice => TransportError::Disconnected,
            rusb::Error::Overflow => TransportError::Overflow,
            other => TransportError::Usb(other),
        }
    }
}

/// Blocking USB operations with a per-call timeout.
///
/// `bulk_out` reports the number of bytes the device accepted so callers can
/// retry the unsent tail of a partial transfer. `interrupt_in` blocks until a
/// notification packet arrives, the timeout elapses, or the endpoint dies.
pub trait UsbTransport: Send + Sync {
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration)
        -> Result<usize, TransportError>;

    fn bulk_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn interrupt_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError>;
}

/// ### RusbTransport
///
/// The libusb-backed transport. Construction expects a handle whose USBTMC
/// interface is already configured and claimed (see `init`); dropping the
/// transport releases the interface and hands the device back to the kernel
/// driver if one was detached.
///
pub struct RusbTransport {
    handle: DeviceHandle<Context>,
    mode: DeviceMode,
}

impl RusbTransport {
    pub fn new(handle: DeviceHandle<Context>, mode: DeviceMode) -> RusbTransport {
        RusbTransport { handle, mode }
    }
}

impl UsbTransport for RusbTransport {
    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
            .map_err(TransportError::from)
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .write_control(request_type, request, value, index, buf, timeout)
            .map_err(TransportError::from)
    }

    fn bulk_out(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(TransportError::from)
    }

    fn bulk_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .read_bulk(endpoint, buf, timeout)
            .map_err(TransportError::from)
    }

    fn interrupt_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .read_interrupt(endpoint, buf, timeout)
            .map_err(TransportError::from)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError> {
        self.handle
            .clear_halt(endpoint)
            .map_err(TransportError::from)
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        // Release the interface
        if let Err(e) = self.handle.release_interface(self.mode.interface_number) {
            log::warn!("failed to release usb interface: {e}");
        }
        // Reattach the kernel driver if it was disconnected
        if self.mode.has_kernel_driver {
            if let Err(e) = self.handle.attach_kernel_driver(self.mode.interface_number) {
                log::warn!("failed to reattach kernel driver: {e}");
            }
        }
    }
}

pub mod mock {
    //! Scripted in-memory transport for tests. Bulk-in and interrupt-in data
    //! is queued ahead of time (or pushed from another thread) and consumed
    //! like a byte stream; control-in replies are queued per bRequest; every
    //! outbound transfer is recorded for inspection.

    use super::*;
    use crate::constants::usbtmc_status::STATUS_SUCCESS;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Condvar, Mutex};
    use std::time::Instant;

    /// One recorded control transfer.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct ControlCall {
        pub request_type: u8,
        pub request: u8,
        pub value: u16,
        pub index: u16,
        pub length: usize,
    }

    /// A blocking in-endpoint: consumers wait until data is pushed, the
    /// timeout elapses or the transport is disconnected.
    struct Stream {
        queue: Mutex<VecDeque<Result<Vec<u8>, TransportError>>>,
        ready: Condvar,
    }

    impl Stream {
        fn new() -> Stream {
            Stream {
                queue: Mutex::new(VecDeque::new()),
                ready: Condvar::new(),
            }
        }

        fn push(&self, item: Result<Vec<u8>, TransportError>) {
            self.queue.lock().unwrap().push_back(item);
            self.ready.notify_all();
        }

        fn push_front(&self, bytes: Vec<u8>) {
            self.queue.lock().unwrap().push_front(Ok(bytes));
            self.ready.notify_all();
        }

        fn pop(
            &self,
            timeout: Duration,
            disconnected: &AtomicBool,
        ) -> Result<Vec<u8>, TransportError> {
            let deadline = Instant::now() + timeout;
            let mut queue = self.queue.lock().unwrap();
            loop {
                if let Some(item) = queue.pop_front() {
                    return item;
                }
                if disconnected.load(Ordering::SeqCst) {
                    return Err(TransportError::Disconnected);
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(TransportError::Timeout);
                }
                let (guard, _) = self.ready.wait_timeout(queue, deadline - now).unwrap();
                queue = guard;
            }
        }

        fn wake(&self) {
            self.ready.notify_all();
        }
    }

    pub struct MockTransport {
        /// Every bulk-out transfer as handed to the wire: (endpoint, bytes).
        pub bulk_out_log: Mutex<Vec<(u8, Vec<u8>)>>,
        /// Scripted bulk-out outcomes; when empty the whole transfer is
        /// accepted. `Ok(n)` models a partial send of `n` bytes.
        bulk_out_script: Mutex<VecDeque<Result<usize, TransportError>>>,
        /// Every control transfer, in call order.
        pub control_log: Mutex<Vec<ControlCall>>,
        control_in_replies: Mutex<HashMap<u8, VecDeque<Result<Vec<u8>, TransportError>>>>,
        bulk_in: Stream,
        interrupt: Stream,
        /// When set, bulk-in returns clones of this packet forever.
        repeat_bulk_in: Mutex<Option<Vec<u8>>>,
        /// Endpoints whose halt condition was cleared, in call order.
        pub cleared_halts: Mutex<Vec<u8>>,
        disconnected: AtomicBool,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockTransport {
        pub fn new() -> MockTransport {
            MockTransport {
                bulk_out_log: Mutex::new(Vec::new()),
                bulk_out_script: Mutex::new(VecDeque::new()),
                control_log: Mutex::new(Vec::new()),
                control_in_replies: Mutex::new(HashMap::new()),
                bulk_in: Stream::new(),
                interrupt: Stream::new(),
                repeat_bulk_in: Mutex::new(None),
                cleared_halts: Mutex::new(Vec::new()),
                disconnected: AtomicBool::new(false),
            }
        }

        /// Queue a control-in reply for the given bRequest. Replies are
        /// consumed in FIFO order per request code; a request with no queued
        /// reply times out.
        pub fn queue_control_in(&self, request: u8, reply: Vec<u8>) {
            self.control_in_replies
                .lock()
                .unwrap()
                .entry(request)
                .or_default()
                .push_back(Ok(reply));
        }

        pub fn queue_control_in_err(&self, request: u8, err: TransportError) {
            self.control_in_replies
                .lock()
                .unwrap()
                .entry(request)
                .or_default()
                .push_back(Err(err));
        }

        /// Queue a successful GET_CAPABILITIES reply with the given
        /// capability bytes.
        pub fn queue_capabilities(&self, iface: u8, device: u8, iface488: u8, device488: u8) {
            let mut reply = vec![0u8; 0x18];
            reply[0] = STATUS_SUCCESS;
            reply[4] = iface;
            reply[5] = device;
            reply[14] = iface488;
            reply[15] = device488;
            self.queue_control_in(crate::constants::control_requests::GET_CAPABILITIES, reply);
        }

        /// Queue device-to-host bulk data. Each entry is an independent
        /// stream chunk; a chunk larger than the host buffer is consumed
        /// across several bulk-in calls, like a real message split over USB
        /// packets.
        pub fn push_bulk_in(&self, bytes: Vec<u8>) {
            self.bulk_in.push(Ok(bytes));
        }

        pub fn push_bulk_in_err(&self, err: TransportError) {
            self.bulk_in.push(Err(err));
        }

        /// Make every bulk-in call return a clone of this packet (used to
        /// exercise drain limits).
        pub fn set_repeat_bulk_in(&self, bytes: Vec<u8>) {
            *self.repeat_bulk_in.lock().unwrap() = Some(bytes);
        }

        pub fn queue_bulk_out_result(&self, result: Result<usize, TransportError>) {
            self.bulk_out_script.lock().unwrap().push_back(result);
        }

        /// Deliver an interrupt-in notification packet.
        pub fn push_interrupt(&self, bytes: Vec<u8>) {
            self.interrupt.push(Ok(bytes));
        }

        pub fn push_interrupt_err(&self, err: TransportError) {
            self.interrupt.push(Err(err));
        }

        /// Simulate the physical device going away: every blocked or future
        /// transfer fails with `Disconnected`.
        pub fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
            self.bulk_in.wake();
            self.interrupt.wake();
        }

        /// Number of control transfers issued so far.
        pub fn control_calls(&self) -> usize {
            self.control_log.lock().unwrap().len()
        }

        /// Number of bulk-out transfers issued so far.
        pub fn bulk_out_calls(&self) -> usize {
            self.bulk_out_log.lock().unwrap().len()
        }
    }

    impl UsbTransport for MockTransport {
        fn control_in(
            &self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, TransportError> {
            self.control_log.lock().unwrap().push(ControlCall {
                request_type,
                request,
                value,
                index,
                length: buf.len(),
            });
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected);
            }
            let reply = self
                .control_in_replies
                .lock()
                .unwrap()
                .get_mut(&request)
                .and_then(|q| q.pop_front());
            match reply {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(TransportError::Timeout),
            }
        }

        fn control_out(
            &self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            buf: &[u8],
            _timeout: Duration,
        ) -> Result<usize, TransportError> {
            self.control_log.lock().unwrap().push(ControlCall {
                request_type,
                request,
                value,
                index,
                length: buf.len(),
            });
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected);
            }
            Ok(buf.len())
        }

        fn bulk_out(
            &self,
            endpoint: u8,
            data: &[u8],
            _timeout: Duration,
        ) -> Result<usize, TransportError> {
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected);
            }
            let scripted = self.bulk_out_script.lock().unwrap().pop_front();
            self.bulk_out_log
                .lock()
                .unwrap()
                .push((endpoint, data.to_vec()));
            match scripted {
                Some(Ok(n)) => Ok(n.min(data.len())),
                Some(Err(e)) => Err(e),
                None => Ok(data.len()),
            }
        }

        fn bulk_in(
            &self,
            _endpoint: u8,
            buf: &mut [u8],
            timeout: Duration,
        ) -> Result<usize, TransportError> {
            if let Some(packet) = self.repeat_bulk_in.lock().unwrap().clone() {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                return Ok(n);
            }
            let chunk = self.bulk_in.pop(timeout, &self.disconnected)?;
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if chunk.len() > n {
                self.bulk_in.push_front(chunk[n..].to_vec());
            }
            Ok(n)
        }

        fn interrupt_in(
            &self,
            _endpoint: u8,
            buf: &mut [u8],
            timeout: Duration,
        ) -> Result<usize, TransportError> {
            let packet = self.interrupt.pop(timeout, &self.disconnected)?;
            if packet.len() > buf.len() {
                return Err(TransportError::Overflow);
            }
            buf[..packet.len()].copy_from_slice(&packet);
            Ok(packet.len())
        }

        fn clear_halt(&self, endpoint: u8) -> Result<(), TransportError> {
            if self.disconnected.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected);
            }
            self.cleared_halts.lock().unwrap().push(endpoint);
            Ok(())
        }
    }

}
