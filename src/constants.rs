//! ## Constants
//!
//! Various constants used throughout the project.
//!

#[allow(unused)]
pub mod usb {
    /// The class code for usbtmc
    pub const USBTMC_CLASS_CODE: u8 = 0xFE;
    /// The subclass code for usbtmc
    pub const USBTMC_SUBCLASS_CODE: u8 = 0x03;
    /// The protocol code for the USB488 spec of usbtmc
    pub const USBTMC_PROTOCOL_CODE: u8 = 0x01;
    /// Direction bit of bmRequestType / bEndpointAddress
    pub const USB_DIR_IN: u8 = 0x80;
}

#[allow(unused)]
pub mod misc {
    use std::time::Duration;

    /// The size in bytes of a USBTMC header in a bulk transfer
    pub const USBTMC_HEADER_SIZE: usize = 12;
    /// Default size of the driver internal IO buffer. Must be a multiple of 4
    /// and at least as large as wMaxPacketSize (usually 512 bytes).
    pub const DEFAULT_IO_BUFFER_SIZE: usize = 2048;
    /// Smallest accepted IO buffer size
    pub const MIN_IO_BUFFER_SIZE: usize = 512;
    /// Minimum USB timeout
    pub const MIN_TIMEOUT: Duration = Duration::from_millis(500);
    /// Default USB timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
    /// Default termination character (using NI-VISA default '\n')
    pub const DEFAULT_TERM_CHAR: u8 = b'\n';
    /// Maximum number of read cycles to empty the bulk in endpoint during
    /// CLEAR and ABORT_BULK_IN requests. Ends the loop if (for whatever
    /// reason) a short packet is never read.
    pub const MAX_READS_TO_CLEAR_BULK_IN: usize = 100;
    /// How long the notification dispatcher blocks on the interrupt endpoint
    /// before re-checking its stop flag.
    pub const INTERRUPT_POLL_SLICE: Duration = Duration::from_millis(100);
}

#[allow(unused)]
pub mod usbtmc_status {
    /// Success
    pub const STATUS_SUCCESS: u8 = 0x01;
    /// The device has received a split transaction CHECK_STATUS request and the request is being processed
    pub const STATUS_PENDING: u8 = 0x02;
    /// Failure for unspecified or undefined reason
    pub const STATUS_FAILED: u8 = 0x80;
    /// The device received an INITIATE_ABORT request, but the request is not in progress
    pub const STATUS_TRANSFER_NOT_IN_PROGRESS: u8 = 0x81;
    /// The device got a CHECK_STATUS request without any INITIATE request being processed
    pub const STATUS_SPLIT_NOT_IN_PROGRESS: u8 = 0x82;
    /// The device got an INITIATE request, but another one is already being processed
    pub const STATUS_SPLIT_IN_PROGRESS: u8 = 0x83;
}

#[allow(unused)]
pub mod control_requests {
    pub const INITIATE_ABORT_BULK_OUT: u8 = 1;
    pub const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
    pub const INITIATE_ABORT_BULK_IN: u8 = 3;
    pub const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
    pub const INITIATE_CLEAR: u8 = 5;
    pub const CHECK_CLEAR_STATUS: u8 = 6;
    pub const GET_CAPABILITIES: u8 = 7;
    pub const INDICATOR_PULSE: u8 = 64;

    // USB488 subclass, Table 9
    pub const READ_STATUS_BYTE: u8 = 128;
    pub const REN_CONTROL: u8 = 160;
    pub const GOTO_LOCAL: u8 = 161;
    pub const LOCAL_LOCKOUT: u8 = 162;
}

#[allow(unused)]
pub mod bulk_msg_id {
    pub const DEVICE_DEPENDENT_MSG_OUT: u8 = 1;
    pub const REQUEST_DEVICE_DEPENDENT_MSG_IN: u8 = 2;
    pub const DEVICE_DEPENDENT_MSG_IN: u8 = 2;
    /// USB488 subclass, Table 2
    pub const TRIGGER: u8 = 128;
}

/// Bits of the coalesced USB488 capability byte: the low three bits come
/// from the USB488 interface capabilities, the high nibble from the USB488
/// device capabilities.
#[allow(unused)]
pub mod usb488_caps {
    pub const TRIGGER: u8 = 0x01;
    /// Device accepts REN_CONTROL, GOTO_LOCAL and LOCAL_LOCKOUT
    pub const SIMPLE: u8 = 0x02;
    pub const IS_488_2: u8 = 0x04;
    pub const DT1: u8 = 0x10;
    pub const RL1: u8 = 0x20;
    pub const SR1: u8 = 0x40;
    pub const FULL_SCPI: u8 = 0x80;
}

#[allow(unused)]
pub mod notify {
    /// First byte of an SRQ notification on the interrupt endpoint
    pub const SRQ: u8 = 0x81;
    /// First bytes above SRQ carry a status byte, with the request tag in the
    /// low seven bits of the first byte.
    pub const STB_TAG_MASK: u8 = 0x7F;
    /// Interrupt bTag values cycle within 2..=127; 1 is reserved for SRQ
    /// (USBTMC-USB488 subclass specification 4.3.1).
    pub const IIN_BTAG_FIRST: u8 = 2;
    pub const IIN_BTAG_LAST: u8 = 127;
}
