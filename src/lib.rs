//! # usbtmc488
//!
//! Host-side driver for the USB Test & Measurement Class (USBTMC),
//! including the USB488 subclass, in pure Rust.
//!
//! The driver multiplexes stream-oriented SCPI-style message traffic over
//! the bulk endpoints, asynchronous service-request and status-byte
//! notifications over the interrupt endpoint, and the class control
//! requests (abort, clear, read status byte, trigger, indicator pulse,
//! remote/local, generic passthrough).
//!
//! ```no_run
//! use usbtmc488::{DriverConfig, UsbtmcDevice};
//!
//! # fn main() -> anyhow::Result<()> {
//! let device = UsbtmcDevice::open((0x0957, 0x1755), DriverConfig::default())?;
//! let handle = device.open_handle()?;
//!
//! handle.write(b"*IDN?\n")?;
//! let mut reply = [0u8; 256];
//! let n = handle.read(&mut reply)?;
//! println!("{}", String::from_utf8_lossy(&reply[..n]));
//! # Ok(())
//! # }
//! ```
//!
//! Handles on the same device can be used from several threads; the device
//! serializes all transport-visible operations. While a device stays
//! attached, service requests raised by the instrument are visible through
//! [`UsbtmcHandle::poll_srq`], [`UsbtmcHandle::wait_srq`] and
//! [`UsbtmcHandle::subscribe_srq`], and acknowledged by
//! [`UsbtmcHandle::read_stb`].

pub mod constants;
mod config;
mod device;
mod error;
mod init;
mod interrupt;
mod transport;
mod types;
mod communication {
    pub(crate) mod bulk;
    pub(crate) mod control;
}

pub use config::DriverConfig;
pub use device::{UsbtmcDevice, UsbtmcHandle};
pub use error::Error;
pub use init::{list_devices, open_device, DeviceFilter};
pub use transport::{mock, RusbTransport, TransportError, UsbTransport};
pub use types::{
    Capabilities, CtrlRequest, DeviceAddr, DeviceId, DeviceInfo, DeviceMode, Endpoint,
    UsbtmcEndpoints,
};
