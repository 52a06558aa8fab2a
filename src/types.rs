//! ## Types
//!
//! The different types used across the crate
//!

use rusb::{Direction, TransferType};

/// USB device address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAddr {
    /// USB bus number
    pub bus: u8,
    /// USB device number
    pub device: u8,
}

/// USB device identifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceId {
    /// USB Id Vendor
    pub vendor_id: u16,
    /// USB Id Product
    pub product_id: u16,
}

/// USB device info
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub address: DeviceAddr,
}

/// ### Device Mode
///
/// A collection of the configuration, interface and interface number. Also if
/// the interface has a kernel driver attached.
///
#[derive(Debug, Clone, Default)]
pub struct DeviceMode {
    /// The USB configuration number
    pub config_number: u8,
    /// The interface number specific to the configuration
    pub interface_number: u8,
    /// The setting number specific to the interface
    pub setting_number: u8,
    /// If the device has a kernel driver. Important for returning control to the OS (on Linux).
    pub has_kernel_driver: bool,
}

/// ### Endpoint
///
/// Properties of an endpoint.
///
#[derive(Clone, Debug)]
pub struct Endpoint {
    /// Address of the endpoint on the interface
    pub address: u8,
    /// The maximal size a packet can have on this endpoint
    pub max_packet_size: u16,
    /// The transfer type of the endpoint (for USBTMC, Bulk or Interrupt)
    pub transfer_type: TransferType,
    /// The direction of the endpoint (for USBTMC, In or Out)
    pub direction: Direction,
    /// bInterval polling interval; only meaningful for the interrupt endpoint
    pub interval: u8,
}

/// ### USBTMC Endpoints
///
/// Endpoints specific to the USBTMC spec.
///
#[derive(Clone, Debug)]
pub struct UsbtmcEndpoints {
    /// The mandatory BULK OUT endpoint
    pub bulk_out_ep: Endpoint,
    /// The mandatory BULK IN endpoint
    pub bulk_in_ep: Endpoint,
    /// The optional INTERRUPT IN endpoint
    pub interrupt_ep: Option<Endpoint>,
}

/// ### Capabilities
///
/// The four raw capability bytes of a GET_CAPABILITIES reply. See section
/// 4.2.1.8 of the USBTMC specification and section 4.2.2 of the USB488
/// subclass specification for the bit assignments.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub interface_capabilities: u8,
    pub device_capabilities: u8,
    pub usb488_interface_capabilities: u8,
    pub usb488_device_capabilities: u8,
}

impl Capabilities {
    /// The coalesced USB488 capability byte: low three bits from the
    /// interface capabilities, high nibble from the device capabilities.
    pub fn usb488_caps(&self) -> u8 {
        (self.usb488_interface_capabilities & 0x07)
            | ((self.usb488_device_capabilities & 0x0F) << 4)
    }

    /// Can accept a control command for an indicator pulse
    pub fn accepts_indicator_pulse(&self) -> bool {
        self.interface_capabilities & 0x04 != 0
    }

    /// Only sends data to the controller
    pub fn is_talk_only(&self) -> bool {
        self.interface_capabilities & 0x02 != 0
    }

    /// Only accepts data from the controller
    pub fn is_listen_only(&self) -> bool {
        self.interface_capabilities & 0x01 != 0
    }

    /// When returning data, the device can terminate on a term character
    pub fn supports_term_char(&self) -> bool {
        self.device_capabilities & 0x01 != 0
    }
}

/// A generic control transfer for the passthrough operation. The payload
/// buffer (and with it wLength) is supplied alongside; the direction is
/// taken from the direction bit of `request_type`.
#[derive(Clone, Copy, Debug)]
pub struct CtrlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}
