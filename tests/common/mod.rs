//! Shared fixtures: a scripted transport wired into a full device, plus
//! builders for the wire messages a USBTMC instrument would send.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rusb::{Direction, TransferType};
use usbtmc488::mock::MockTransport;
use usbtmc488::{DriverConfig, Endpoint, UsbTransport, UsbtmcDevice, UsbtmcEndpoints};

pub const BULK_OUT: u8 = 0x02;
pub const BULK_IN: u8 = 0x81;
pub const INTR_IN: u8 = 0x83;
pub const MAX_PACKET: u16 = 512;

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn endpoints(with_interrupt: bool) -> UsbtmcEndpoints {
    UsbtmcEndpoints {
        bulk_out_ep: Endpoint {
            address: BULK_OUT,
            max_packet_size: MAX_PACKET,
            transfer_type: TransferType::Bulk,
            direction: Direction::Out,
            interval: 0,
        },
        bulk_in_ep: Endpoint {
            address: BULK_IN,
            max_packet_size: MAX_PACKET,
            transfer_type: TransferType::Bulk,
            direction: Direction::In,
            interval: 0,
        },
        interrupt_ep: with_interrupt.then_some(Endpoint {
            address: INTR_IN,
            max_packet_size: 8,
            transfer_type: TransferType::Interrupt,
            direction: Direction::In,
            interval: 1,
        }),
    }
}

pub fn config() -> DriverConfig {
    DriverConfig {
        io_buffer_size: 2048,
        timeout: Duration::from_millis(600),
    }
}

/// Attach a device over the mock with a full set of capabilities: indicator
/// pulse, bulk-in term char, and every USB488 bit.
pub fn attach(mock: &Arc<MockTransport>, with_interrupt: bool) -> UsbtmcDevice {
    init_logs();
    mock.queue_capabilities(0x04, 0x01, 0x07, 0x0F);
    UsbtmcDevice::attach(
        Arc::clone(mock) as Arc<dyn UsbTransport>,
        endpoints(with_interrupt),
        0,
        config(),
    )
    .unwrap()
}

/// Attach a device that reports no capabilities at all.
pub fn attach_bare(mock: &Arc<MockTransport>, with_interrupt: bool) -> UsbtmcDevice {
    init_logs();
    mock.queue_capabilities(0x00, 0x00, 0x00, 0x00);
    UsbtmcDevice::attach(
        Arc::clone(mock) as Arc<dyn UsbTransport>,
        endpoints(with_interrupt),
        0,
        config(),
    )
    .unwrap()
}

/// Build a DEV_DEP_MSG_IN reply as an instrument would put it on the wire:
/// 12-byte header, payload, zero padding to a multiple of 4.
pub fn dev_dep_msg_in(tag: u8, n_characters: u32, eom: bool, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![2u8, tag, !tag, 0];
    msg.extend_from_slice(&n_characters.to_le_bytes());
    msg.push(u8::from(eom));
    msg.extend_from_slice(&[0, 0, 0]);
    msg.extend_from_slice(payload);
    while msg.len() % 4 != 0 {
        msg.push(0);
    }
    msg
}

/// Decode the fields of a logged bulk-out header.
pub struct OutHeader {
    pub msg_id: u8,
    pub tag: u8,
    pub tag_inverse: u8,
    pub transfer_size: u32,
    pub attributes: u8,
    pub term_char: u8,
}

pub fn parse_out_header(packet: &[u8]) -> OutHeader {
    assert!(packet.len() >= 12, "bulk-out packet shorter than a header");
    OutHeader {
        msg_id: packet[0],
        tag: packet[1],
        tag_inverse: packet[2],
        transfer_size: u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]),
        attributes: packet[8],
        term_char: packet[9],
    }
}
