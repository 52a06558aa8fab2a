//! ## Driver configuration
//!
//! Process-wide parameters applied when a device is attached, matching the
//! sanitization the driver performs on its tunables: the IO buffer must be a
//! multiple of 4 and at least 512 bytes, the timeout at least 500 ms.

use std::time::Duration;

use crate::constants::misc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    /// Size of the bulk IO scratch buffer in bytes
    pub io_buffer_size: usize,
    /// USB transfer timeout
    pub timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            io_buffer_size: misc::DEFAULT_IO_BUFFER_SIZE,
            timeout: misc::DEFAULT_TIMEOUT,
        }
    }
}

impl DriverConfig {
    /// Clamp the parameters into their legal ranges: the buffer size is
    /// raised to 512 and rounded down to a multiple of 4, the timeout is
    /// raised to the 500 ms minimum.
    pub fn sanitized(self) -> Self {
        let mut io_buffer_size = self.io_buffer_size.max(misc::MIN_IO_BUFFER_SIZE);
        io_buffer_size -= io_buffer_size % 4;
        DriverConfig {
            io_buffer_size,
            timeout: self.timeout.max(misc::MIN_TIMEOUT),
        }
    }
}
