//! ## Interrupt
//!
//! The notification dispatcher: a thread reading the interrupt-in endpoint
//! for as long as the device lives. STB notifications (leading byte above
//! 0x81) land in the device's notification scratch and wake the STB waiter;
//! SRQ notifications (leading byte 0x81) fan out to every open handle under
//! the device lock and wake everyone. The dispatcher never takes the I/O
//! lock, so it stays live while user threads block in transfers.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::constants::{misc, notify};
use crate::device::DeviceState;
use crate::transport::TransportError;

pub(crate) fn spawn(device: Arc<DeviceState>) -> JoinHandle<()> {
    thread::spawn(move || run(device))
}

fn run(device: Arc<DeviceState>) {
    let ep = match &device.endpoints.interrupt_ep {
        Some(ep) => ep.clone(),
        None => return,
    };
    let mut buffer = vec![0u8; ep.max_packet_size as usize];

    while !device.iin_stop.load(Ordering::SeqCst) {
        match device
            .transport
            .interrupt_in(ep.address, &mut buffer, misc::INTERRUPT_POLL_SLICE)
        {
            Ok(len) => dispatch(&device, &buffer[..len]),
            // nothing pending within the poll slice; listen again
            Err(TransportError::Timeout) => {}
            Err(TransportError::Overflow) => {
                log::error!(
                    "interrupt overflow, endpoint max packet is {}",
                    ep.max_packet_size
                );
                return;
            }
            Err(e @ (TransportError::Disconnected | TransportError::Stall)) => {
                // endpoint torn down, stop listening
                log::debug!("interrupt endpoint terminated: {e}");
                return;
            }
            Err(e) => {
                log::error!("unknown interrupt status received: {e}");
            }
        }
    }
}

fn dispatch(device: &DeviceState, packet: &[u8]) {
    log::debug!("interrupt packet, len {}", packet.len());

    if packet.len() < 2 {
        log::warn!("invalid notification: {} byte packet", packet.len());
        return;
    }

    // STB notification with a valid tag in the low bits of the first byte
    if packet[0] > notify::SRQ {
        let mut shared = device.shared.lock().unwrap();
        shared.b_notify1 = packet[0];
        shared.b_notify2 = packet[1];
        device.iin_data_valid.store(true, Ordering::SeqCst);
        device.waitq.notify_all();
        return;
    }

    if packet[0] == notify::SRQ {
        let shared = device.shared.lock().unwrap();
        for events in shared.handles.iter().filter_map(|weak| weak.upgrade()) {
            events.srq_byte.store(packet[1], Ordering::SeqCst);
            events.srq_asserted.store(true, Ordering::SeqCst);
            if let Some(tx) = events.srq_tx.lock().unwrap().as_ref() {
                let _ = tx.send(packet[1]);
            }
        }
        log::debug!(
            "srq received bTag {:#04x} stb {:#04x}",
            packet[0],
            packet[1]
        );
        device.waitq.notify_all();
        return;
    }

    log::warn!("invalid notification: {:#04x}", packet[0]);
}
