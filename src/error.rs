//! ## USBTMC Errors
//!
//! The errors used throughout the crate.
//!

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device not found")]
    DeviceNotFound,
    #[error("device is not compatible with USBTMC")]
    DeviceIncompatible,
    #[error("specified interface not found")]
    InterfaceNotFound,
    #[error("specified interface setting not found")]
    InterfaceSettingNotFound,
    #[error("bulk out endpoint not found")]
    BulkOutEndpointNotFound,
    #[error("bulk in endpoint not found")]
    BulkInEndpointNotFound,
    #[error("device is gone")]
    NotPresent,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("device does not report the required capability")]
    MissingCapability,
    #[error("control request returned status {0:#04x}")]
    UnexpectedStatus(u8),
    #[error("control reply too short: {0} bytes")]
    ShortControlReply(usize),
    #[error("device sent too small first packet: {0} < 12")]
    ShortHeader(usize),
    #[error("device sent reply with wrong MsgID: {got} != {expected}")]
    WrongMsgId { expected: u8, got: u8 },
    #[error("device sent reply with wrong bTag: {got} != {expected}")]
    WrongTag { expected: u8, got: u8 },
    #[error("device wants to return more data than requested: {offered} > {requested}")]
    TooMuchData { requested: usize, offered: u32 },
    #[error("couldn't clear device buffer within {0} cycles")]
    DrainLimit(usize),
    #[error("timed out waiting for a device notification")]
    WaitTimeout,
    #[error("usb transport error: {0}")]
    Transport(TransportError),
}

impl Error {
    /// Map a transport failure to the surfaced error. A disconnected device
    /// is reported as not-present so blocked callers observe the same error
    /// a post-disconnect call would.
    pub(crate) fn from_transport(e: TransportError) -> Error {
        match e {
            TransportError::Disconnected => Error::NotPresent,
            other => Error::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_maps_to_not_present() {
        assert!(matches!(
            Error::from_transport(TransportError::Disconnected),
            Error::NotPresent
        ));
    }

    #[test]
    fn other_transport_errors_pass_through() {
        assert!(matches!(
            Error::from_transport(TransportError::Timeout),
            Error::Transport(TransportError::Timeout)
        ));
    }

    #[test]
    fn display_wrong_tag() {
        let e = Error::WrongTag {
            expected: 3,
            got: 7,
        };
        assert_eq!(e.to_string(), "device sent reply with wrong bTag: 7 != 3");
    }
}
