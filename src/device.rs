//! ## Device
//!
//! The shared per-device record, the per-open-handle record and everything
//! tying them together: attach/disconnect lifecycle, zombie semantics, the
//! one-at-a-time I/O exclusion, READ_STB with its interrupt-notification
//! wait, and the SRQ surface (poll, blocking wait, subscription).
//!
//! Ownership mirrors a reference-counted device record: the attached
//! [`UsbtmcDevice`] holds one reference, every open [`UsbtmcHandle`] holds
//! one, and the notification dispatcher holds one while it runs. The device
//! record is destroyed when the last of them goes away; the handle list only
//! ever stores weak links and is touched exclusively under the short device
//! lock shared with the dispatcher.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::communication::{bulk, control};
use crate::config::DriverConfig;
use crate::constants::{control_requests, misc, notify};
use crate::error::Error;
use crate::init::{self, DeviceFilter};
use crate::interrupt;
use crate::transport::{RusbTransport, UsbTransport};
use crate::types::{Capabilities, CtrlRequest, UsbtmcEndpoints};

/// Everything a protocol engine call needs besides the mutable I/O state.
pub(crate) struct IoCtx<'a> {
    pub transport: &'a dyn UsbTransport,
    pub endpoints: &'a UsbtmcEndpoints,
    pub ifnum: u16,
    pub io_buffer_size: usize,
    pub usb488_caps: u8,
}

/// Protocol state guarded by the I/O exclusion lock: the rotating tags and
/// the device-level defaults inherited by newly opened handles.
pub(crate) struct IoState {
    pub b_tag: u8,
    pub b_tag_last_write: u8,
    pub b_tag_last_read: u8,
    pub iin_b_tag: u8,
    pub timeout: Duration,
    pub term_char: u8,
    pub term_char_enabled: bool,
    pub auto_abort: bool,
    pub eom_val: bool,
}

impl IoState {
    pub(crate) fn new(timeout: Duration) -> IoState {
        IoState {
            b_tag: 1,
            b_tag_last_write: 0,
            b_tag_last_read: 0,
            iin_b_tag: notify::IIN_BTAG_FIRST,
            timeout,
            term_char: misc::DEFAULT_TERM_CHAR,
            term_char_enabled: false,
            auto_abort: false,
            eom_val: true,
        }
    }

    /// Store the tag of the transfer just sent (aborts reference it), then
    /// rotate: increment, and increment again past zero.
    pub(crate) fn record_write_and_advance(&mut self) {
        self.b_tag_last_write = self.b_tag;
        self.b_tag = self.b_tag.wrapping_add(1);
        if self.b_tag == 0 {
            self.b_tag = 1;
        }
    }

    /// Rotate the interrupt tag within 2..=127.
    pub(crate) fn advance_iin_tag(&mut self) {
        self.iin_b_tag += 1;
        if self.iin_b_tag > notify::IIN_BTAG_LAST {
            self.iin_b_tag = notify::IIN_BTAG_FIRST;
        }
    }
}

/// Per-handle settings snapshotted from the device defaults at open.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HandleSettings {
    pub term_char: u8,
    pub term_char_enabled: bool,
    pub auto_abort: bool,
}

/// The part of a handle the notification dispatcher writes to.
pub(crate) struct HandleEvents {
    pub srq_byte: AtomicU8,
    pub srq_asserted: AtomicBool,
    pub srq_tx: Mutex<Option<Sender<u8>>>,
}

impl HandleEvents {
    fn new() -> HandleEvents {
        HandleEvents {
            srq_byte: AtomicU8::new(0),
            srq_asserted: AtomicBool::new(false),
            srq_tx: Mutex::new(None),
        }
    }
}

/// State guarded by the short device lock: the open-handle list and the
/// latest interrupt notification pair.
pub(crate) struct SharedState {
    pub handles: Vec<Weak<HandleEvents>>,
    pub b_notify1: u8,
    pub b_notify2: u8,
}

/// The per-device record shared by the attach owner, every open handle and
/// the notification dispatcher.
pub(crate) struct DeviceState {
    pub transport: Arc<dyn UsbTransport>,
    pub endpoints: UsbtmcEndpoints,
    pub ifnum: u16,
    pub capabilities: Capabilities,
    pub usb488_caps: u8,
    pub io_buffer_size: usize,
    /// Only one I/O function runs at a time
    pub io: Mutex<IoState>,
    /// Short lock for the handle list and notification scratch; the
    /// dispatcher takes this one, never `io`
    pub shared: Mutex<SharedState>,
    /// Wait point for STB notifications and SRQ, paired with `shared`
    pub waitq: Condvar,
    pub zombie: AtomicBool,
    pub iin_data_valid: AtomicBool,
    pub iin_stop: AtomicBool,
}

impl DeviceState {
    pub(crate) fn ctx(&self) -> IoCtx<'_> {
        IoCtx {
            transport: self.transport.as_ref(),
            endpoints: &self.endpoints,
            ifnum: self.ifnum,
            io_buffer_size: self.io_buffer_size,
            usb488_caps: self.usb488_caps,
        }
    }

    /// Take the I/O exclusion lock, failing when the device is gone.
    fn lock_io(&self) -> Result<MutexGuard<'_, IoState>, Error> {
        let guard = self.io.lock().unwrap();
        if self.zombie.load(Ordering::SeqCst) {
            return Err(Error::NotPresent);
        }
        Ok(guard)
    }
}

/// ### UsbtmcDevice
///
/// An attached USBTMC interface. Owns the notification dispatcher and hands
/// out I/O handles; dropping it (or calling [`disconnect`](Self::disconnect))
/// marks the device as gone, after which every operation on any remaining
/// handle fails with a not-present error.
///
pub struct UsbtmcDevice {
    state: Arc<DeviceState>,
    iin_thread: Option<JoinHandle<()>>,
}

impl UsbtmcDevice {
    /// ### Open
    ///
    /// Find a USBTMC-compatible USB device matching `filter`, claim its
    /// interface and attach to it.
    ///
    /// #### Arguments
    /// - `filter` -> which device to pick (e.g. `()` for the first one, or a
    ///   `(vid, pid)` pair)
    /// - `config` -> process-wide driver parameters
    ///
    pub fn open(filter: impl DeviceFilter, config: DriverConfig) -> Result<UsbtmcDevice> {
        let mut context = rusb::Context::new()?;
        let (device, mut handle) = init::open_device(&mut context, filter)?;

        let mut mode = init::get_usbtmc_mode(&device)?;
        init::detach_kernel_driver(&mut mode, &mut handle)?;
        let endpoints = init::get_endpoints(&mode, &device)?;

        handle.set_active_configuration(mode.config_number)?;
        handle.claim_interface(mode.interface_number)?;
        handle.set_alternate_setting(mode.interface_number, mode.setting_number)?;

        let ifnum = mode.interface_number as u16;
        let transport = Arc::new(RusbTransport::new(handle, mode));
        UsbtmcDevice::attach(transport, endpoints, ifnum, config)
    }

    /// ### Attach
    ///
    /// Build the device record on top of an already configured transport:
    /// sanitize the driver parameters, read the device capabilities and, if
    /// an interrupt-in endpoint exists, start the notification dispatcher.
    ///
    pub fn attach(
        transport: Arc<dyn UsbTransport>,
        endpoints: UsbtmcEndpoints,
        ifnum: u16,
        config: DriverConfig,
    ) -> Result<UsbtmcDevice> {
        let config = config.sanitized();
        log::info!(
            "usbtmc attach: io_buffer_size = {}, timeout = {} ms",
            config.io_buffer_size,
            config.timeout.as_millis()
        );

        // A device that cannot answer GET_CAPABILITIES is still usable for
        // plain message traffic; the capability-gated operations will fail.
        let capabilities =
            match control::get_capabilities(transport.as_ref(), ifnum, config.timeout) {
                Ok(capabilities) => capabilities,
                Err(e) => {
                    log::error!("can't read capabilities: {e}");
                    Capabilities::default()
                }
            };
        let usb488_caps = capabilities.usb488_caps();

        let state = Arc::new(DeviceState {
            transport,
            endpoints,
            ifnum,
            capabilities,
            usb488_caps,
            io_buffer_size: config.io_buffer_size,
            io: Mutex::new(IoState::new(config.timeout)),
            shared: Mutex::new(SharedState {
                handles: Vec::new(),
                b_notify1: 0,
                b_notify2: 0,
            }),
            waitq: Condvar::new(),
            zombie: AtomicBool::new(false),
            iin_data_valid: AtomicBool::new(false),
            iin_stop: AtomicBool::new(false),
        });

        let iin_thread = state
            .endpoints
            .interrupt_ep
            .is_some()
            .then(|| interrupt::spawn(Arc::clone(&state)));

        Ok(UsbtmcDevice { state, iin_thread })
    }

    /// ### Open Handle
    ///
    /// Open an I/O handle on the device. The handle snapshots the device's
    /// current termination-character and auto-abort defaults and joins the
    /// SRQ fan-out list.
    ///
    pub fn open_handle(&self) -> Result<UsbtmcHandle> {
        let settings = {
            let io = self.state.lock_io()?;
            HandleSettings {
                term_char: io.term_char,
                term_char_enabled: io.term_char_enabled,
                auto_abort: io.auto_abort,
            }
        };

        let events = Arc::new(HandleEvents::new());
        self.state
            .shared
            .lock()
            .unwrap()
            .handles
            .push(Arc::downgrade(&events));

        Ok(UsbtmcHandle {
            device: Arc::clone(&self.state),
            events,
            settings,
        })
    }

    /// The four raw capability bytes read at attach.
    pub fn capabilities(&self) -> Capabilities {
        self.state.capabilities
    }

    /// The coalesced USB488 capability byte.
    pub fn usb488_caps(&self) -> u8 {
        self.state.usb488_caps
    }

    pub fn term_char(&self) -> u8 {
        self.state.io.lock().unwrap().term_char
    }

    pub fn set_term_char(&self, term_char: u8) {
        self.state.io.lock().unwrap().term_char = term_char;
    }

    pub fn term_char_enabled(&self) -> bool {
        self.state.io.lock().unwrap().term_char_enabled
    }

    pub fn set_term_char_enabled(&self, enabled: bool) {
        self.state.io.lock().unwrap().term_char_enabled = enabled;
    }

    pub fn auto_abort(&self) -> bool {
        self.state.io.lock().unwrap().auto_abort
    }

    pub fn set_auto_abort(&self, auto_abort: bool) {
        self.state.io.lock().unwrap().auto_abort = auto_abort;
    }

    /// ### Disconnect
    ///
    /// Mark the device as gone: every blocked waiter wakes up with a
    /// not-present error, the notification dispatcher stops, and all
    /// subsequent I/O on remaining handles fails. Also runs on drop.
    ///
    pub fn disconnect(&mut self) {
        if !self.state.zombie.swap(true, Ordering::SeqCst) {
            log::debug!("usbtmc disconnect");
        }
        self.state.iin_stop.store(true, Ordering::SeqCst);

        // take the device lock so no waiter can slip between the zombie
        // check and its wait
        {
            let _shared = self.state.shared.lock().unwrap();
            self.state.waitq.notify_all();
        }

        if let Some(thread) = self.iin_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UsbtmcDevice {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// ### UsbtmcHandle
///
/// One open handle on a device. Handles on the same device may be used from
/// different threads; the device serializes all transport-visible work, so
/// exactly one read, write, abort, clear, trigger, STB read or configuration
/// call is in flight per device at any time.
///
pub struct UsbtmcHandle {
    device: Arc<DeviceState>,
    events: Arc<HandleEvents>,
    settings: HandleSettings,
}

impl std::fmt::Debug for UsbtmcHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbtmcHandle").finish_non_exhaustive()
    }
}

impl UsbtmcHandle {
    /// ### Read
    ///
    /// Ask the device for up to `buf.len()` message bytes and copy its reply
    /// into `buf`. Returns the number of bytes received.
    ///
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut io = self.device.lock_io()?;
        bulk::read(&self.device.ctx(), &mut io, &self.settings, buf)
    }

    /// ### Write
    ///
    /// Send `data` to the device as one device-dependent message. Returns
    /// the number of bytes written.
    ///
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut io = self.device.lock_io()?;
        bulk::write(&self.device.ctx(), &mut io, &self.settings, data)
    }

    /// Abort the outstanding bulk-in transfer.
    pub fn abort_bulk_in(&self) -> Result<()> {
        let mut io = self.device.lock_io()?;
        control::abort_bulk_in(&self.device.ctx(), &mut io)
    }

    /// Abort the outstanding bulk-out transfer.
    pub fn abort_bulk_out(&self) -> Result<()> {
        let mut io = self.device.lock_io()?;
        control::abort_bulk_out(&self.device.ctx(), &mut io)
    }

    /// Clear the device's input and output buffers.
    pub fn clear(&self) -> Result<()> {
        let mut io = self.device.lock_io()?;
        control::clear(&self.device.ctx(), &mut io)
    }

    /// Clear any halt condition on the bulk-in endpoint.
    pub fn clear_in_halt(&self) -> Result<()> {
        let _io = self.device.lock_io()?;
        control::clear_in_halt(&self.device.ctx())
    }

    /// Clear any halt condition on the bulk-out endpoint.
    pub fn clear_out_halt(&self) -> Result<()> {
        let _io = self.device.lock_io()?;
        control::clear_out_halt(&self.device.ctx())
    }

    /// Flash the activity indicator on the device.
    pub fn indicator_pulse(&self) -> Result<()> {
        let io = self.device.lock_io()?;
        control::indicator_pulse(&self.device.ctx(), &io)
    }

    /// Generic control transfer passthrough. `data` supplies wLength and the
    /// payload; for device-to-host requests the reply lands in `data` and
    /// its length is returned.
    pub fn control_request(&self, request: &CtrlRequest, data: &mut [u8]) -> Result<usize> {
        let io = self.device.lock_io()?;
        control::passthrough(&self.device.ctx(), &io, request, data)
    }

    /// The device timeout applied to every transfer.
    pub fn get_timeout(&self) -> Result<Duration> {
        let io = self.device.lock_io()?;
        Ok(io.timeout)
    }

    /// Set the device timeout. Values below the 500 ms minimum are rejected
    /// and leave the stored value unchanged.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let mut io = self.device.lock_io()?;
        if timeout < misc::MIN_TIMEOUT {
            return Err(Error::InvalidArgument("timeout below the 500 ms minimum").into());
        }
        io.timeout = timeout;
        Ok(())
    }

    /// Enable (1) or disable (0) sending the end-of-message attribute on
    /// writes; any other value is rejected.
    pub fn eom_enable(&self, eom_enable: u8) -> Result<()> {
        let mut io = self.device.lock_io()?;
        if eom_enable > 1 {
            return Err(Error::InvalidArgument("eom enable must be 0 or 1").into());
        }
        io.eom_val = eom_enable != 0;
        Ok(())
    }

    /// Configure the termination character used when requesting data.
    /// Enabling termination requires the device's term-char capability.
    /// Affects handles opened afterwards.
    pub fn config_termchar(&self, term_char: u8, enabled: bool) -> Result<()> {
        let mut io = self.device.lock_io()?;
        if enabled && !self.device.capabilities.supports_term_char() {
            return Err(Error::MissingCapability.into());
        }
        io.term_char = term_char;
        io.term_char_enabled = enabled;
        Ok(())
    }

    /// The coalesced USB488 capability byte.
    pub fn get_caps(&self) -> Result<u8> {
        let _io = self.device.lock_io()?;
        Ok(self.device.usb488_caps)
    }

    /// ### Read STB
    ///
    /// Read the IEEE-488 status byte. A pending SRQ answers immediately with
    /// the byte it carried; otherwise a READ_STATUS_BYTE control request is
    /// issued and, when the device has an interrupt-in endpoint, the reply
    /// arrives asynchronously as a tagged notification the call waits for.
    ///
    pub fn read_stb(&self) -> Result<u8> {
        let mut io = self.device.lock_io()?;

        log::debug!(
            "read_stb, interrupt endpoint present: {}",
            self.device.endpoints.interrupt_ep.is_some()
        );

        // an STB with SRQ is already received
        {
            let _shared = self.device.shared.lock().unwrap();
            if self.events.srq_asserted.swap(false, Ordering::SeqCst) {
                let stb = self.events.srq_byte.load(Ordering::SeqCst);
                log::debug!("stb {stb:#04x} with srq received");
                return Ok(stb);
            }
        }

        self.device.iin_data_valid.store(false, Ordering::SeqCst);

        let result = self.read_stb_inner(&mut io);

        // bump the interrupt bTag, whether successful or not
        io.advance_iin_tag();
        result
    }

    fn read_stb_inner(&self, io: &mut IoState) -> Result<u8> {
        let reply = control::read_status_byte(&self.device.ctx(), io)?;

        if self.device.endpoints.interrupt_ep.is_none() {
            return Ok(reply[2]);
        }

        let deadline = Instant::now() + io.timeout;
        let mut shared = self.device.shared.lock().unwrap();
        loop {
            if self.device.zombie.load(Ordering::SeqCst) {
                return Err(Error::NotPresent.into());
            }
            if self.device.iin_data_valid.load(Ordering::SeqCst) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                log::debug!("stb wait timed out");
                return Err(Error::WaitTimeout.into());
            }
            let (guard, _) = self
                .device
                .waitq
                .wait_timeout(shared, deadline - now)
                .unwrap();
            shared = guard;
        }

        let tag = shared.b_notify1 & notify::STB_TAG_MASK;
        if tag != io.iin_b_tag {
            log::error!("expected bTag {:#04x} got {tag:#04x}", io.iin_b_tag);
        }
        Ok(shared.b_notify2)
    }

    /// Enable or disable the device's remote state.
    pub fn ren_control(&self, enable: bool) -> Result<()> {
        let io = self.device.lock_io()?;
        control::usb488_simple(
            &self.device.ctx(),
            &io,
            control_requests::REN_CONTROL,
            enable as u16,
        )
    }

    /// Return the device to local control.
    pub fn goto_local(&self) -> Result<()> {
        let io = self.device.lock_io()?;
        control::usb488_simple(&self.device.ctx(), &io, control_requests::GOTO_LOCAL, 0)
    }

    /// Lock out the device's front panel.
    pub fn local_lockout(&self) -> Result<()> {
        let io = self.device.lock_io()?;
        control::usb488_simple(&self.device.ctx(), &io, control_requests::LOCAL_LOCKOUT, 0)
    }

    /// Send a TRIGGER message on the bulk-out endpoint.
    pub fn trigger(&self) -> Result<()> {
        let mut io = self.device.lock_io()?;
        bulk::trigger(&self.device.ctx(), &mut io)
    }

    /// Whether an unacknowledged SRQ is pending for this handle (the
    /// high-priority-readable poll bit). Fails with not-present once the
    /// device is gone. Never takes the I/O lock, so it stays responsive
    /// while another handle blocks in a transfer.
    pub fn poll_srq(&self) -> Result<bool> {
        if self.device.zombie.load(Ordering::SeqCst) {
            return Err(Error::NotPresent.into());
        }
        Ok(self.events.srq_asserted.load(Ordering::SeqCst))
    }

    /// Block until an SRQ is pending for this handle, the device goes away
    /// or `timeout` elapses. Does not consume the SRQ; follow up with
    /// [`read_stb`](Self::read_stb).
    pub fn wait_srq(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.device.shared.lock().unwrap();
        loop {
            if self.device.zombie.load(Ordering::SeqCst) {
                return Err(Error::NotPresent.into());
            }
            if self.events.srq_asserted.load(Ordering::SeqCst) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::WaitTimeout.into());
            }
            let (guard, _) = self
                .device
                .waitq
                .wait_timeout(shared, deadline - now)
                .unwrap();
            shared = guard;
        }
    }

    /// Subscribe this handle to SRQ events. Each service request delivers
    /// the status byte it carried on the returned channel, once per SRQ.
    /// Subscribing again replaces the previous channel.
    pub fn subscribe_srq(&self) -> Receiver<u8> {
        let (tx, rx) = mpsc::channel();
        *self.events.srq_tx.lock().unwrap() = Some(tx);
        rx
    }
}

impl Drop for UsbtmcHandle {
    fn drop(&mut self) {
        // leave the fan-out list before the events block goes away
        let mut shared = self.device.shared.lock().unwrap();
        shared.handles.retain(|weak| {
            weak.upgrade()
                .is_some_and(|events| !Arc::ptr_eq(&events, &self.events))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_tag_rotates_skipping_zero() {
        let mut io = IoState::new(misc::DEFAULT_TIMEOUT);
        let mut seen_255 = false;
        for _ in 0..600 {
            let tag = io.b_tag;
            assert!(tag >= 1, "bTag must never be zero");
            io.record_write_and_advance();
            assert_eq!(io.b_tag_last_write, tag);
            seen_255 |= tag == 255;
        }
        assert!(seen_255, "600 rotations must pass through the top of the range");
    }

    #[test]
    fn bulk_tag_wraps_from_255_to_1() {
        let mut io = IoState::new(misc::DEFAULT_TIMEOUT);
        io.b_tag = 255;
        io.record_write_and_advance();
        assert_eq!(io.b_tag, 1);
        assert_eq!(io.b_tag_last_write, 255);
    }

    #[test]
    fn iin_tag_cycles_within_2_to_127() {
        let mut io = IoState::new(misc::DEFAULT_TIMEOUT);
        for _ in 0..300 {
            assert!((2..=127).contains(&io.iin_b_tag));
            io.advance_iin_tag();
        }
    }

    #[test]
    fn iin_tag_wraps_from_127_to_2() {
        let mut io = IoState::new(misc::DEFAULT_TIMEOUT);
        io.iin_b_tag = 127;
        io.advance_iin_tag();
        assert_eq!(io.iin_b_tag, 2);
    }

    #[test]
    fn new_io_state_has_attach_defaults() {
        let io = IoState::new(misc::DEFAULT_TIMEOUT);
        assert_eq!(io.b_tag, 1);
        assert_eq!(io.iin_b_tag, 2);
        assert_eq!(io.term_char, b'\n');
        assert!(!io.term_char_enabled);
        assert!(!io.auto_abort);
        assert!(io.eom_val);
    }
}
