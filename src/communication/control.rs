//! ## Control
//!
//! Class control requests: capability retrieval, the split INITIATE/CHECK
//! abort and clear state machines with their bounded bulk-in drain loops,
//! halt clearing, the USB488 one-byte operations and the generic control
//! passthrough.
//!
//! All class requests are issued device-to-host so the status byte of the
//! reply can be examined, including the conceptually host-to-device ones.
//!

use std::time::Duration;

use anyhow::Result;
use rusb::{Direction, Recipient, RequestType};

use crate::constants::usb::USB_DIR_IN;
use crate::constants::{control_requests, misc, usb488_caps, usbtmc_status};
use crate::device::{IoCtx, IoState};
use crate::error::Error;
use crate::transport::UsbTransport;
use crate::types::{Capabilities, CtrlRequest};

fn class_request(recipient: Recipient) -> u8 {
    rusb::request_type(Direction::In, RequestType::Class, recipient)
}

/// Fetch and decode the GET_CAPABILITIES reply. The reply must lead with a
/// success status and carry at least the four capability bytes.
pub(crate) fn get_capabilities(
    transport: &dyn UsbTransport,
    ifnum: u16,
    timeout: Duration,
) -> Result<Capabilities> {
    let mut buffer = [0u8; 0x18];

    let n = transport
        .control_in(
            class_request(Recipient::Interface),
            control_requests::GET_CAPABILITIES,
            0,
            ifnum,
            &mut buffer,
            timeout,
        )
        .map_err(Error::from_transport)?;

    if n < 16 {
        return Err(Error::ShortControlReply(n).into());
    }
    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        log::error!("GET_CAPABILITIES returned {:#04x}", buffer[0]);
        return Err(Error::UnexpectedStatus(buffer[0]).into());
    }

    log::debug!(
        "capabilities: interface {:#04x} device {:#04x} usb488 interface {:#04x} usb488 device {:#04x}",
        buffer[4],
        buffer[5],
        buffer[14],
        buffer[15]
    );

    Ok(Capabilities {
        interface_capabilities: buffer[4],
        device_capabilities: buffer[5],
        usb488_interface_capabilities: buffer[14],
        usb488_device_capabilities: buffer[15],
    })
}

/// Read the bulk-in endpoint until the device's FIFO runs dry. A transfer
/// returning anything other than exactly one max-size packet ends on a short
/// packet and so marks the end of the residual data. `cycles` carries the
/// read count across repeated drains of one abort/clear call; exceeding the
/// cap is a protocol error.
fn drain_bulk_in(ctx: &IoCtx, io: &IoState, cycles: &mut usize) -> Result<()> {
    let max_packet = ctx.endpoints.bulk_in_ep.max_packet_size as usize;
    let mut scratch = vec![0u8; ctx.io_buffer_size];

    loop {
        log::debug!("reading from bulk in EP");
        let actual = ctx
            .transport
            .bulk_in(ctx.endpoints.bulk_in_ep.address, &mut scratch, io.timeout)
            .map_err(Error::from_transport)?;
        *cycles += 1;

        if actual != max_packet {
            return Ok(());
        }
        if *cycles >= misc::MAX_READS_TO_CLEAR_BULK_IN {
            log::error!(
                "couldn't clear device buffer within {} cycles",
                misc::MAX_READS_TO_CLEAR_BULK_IN
            );
            return Err(Error::DrainLimit(misc::MAX_READS_TO_CLEAR_BULK_IN).into());
        }
    }
}

/// ### Abort Bulk In
///
/// Abort the outstanding bulk-in transfer: INITIATE addressed at the bulk-in
/// endpoint with the last read tag, drain the endpoint, then poll the CHECK
/// status until the device reports success. A device answering the INITIATE
/// with `STATUS_FAILED` has no transfer in progress and the abort is a no-op.
///
pub(crate) fn abort_bulk_in(ctx: &IoCtx, io: &mut IoState) -> Result<()> {
    let request_type = class_request(Recipient::Endpoint);
    let endpoint = ctx.endpoints.bulk_in_ep.address;
    let mut buffer = [0u8; 8];

    ctx.transport
        .control_in(
            request_type,
            control_requests::INITIATE_ABORT_BULK_IN,
            io.b_tag_last_read as u16,
            endpoint as u16,
            &mut buffer[..2],
            io.timeout,
        )
        .map_err(Error::from_transport)?;

    log::debug!("INITIATE_ABORT_BULK_IN returned {:#04x}", buffer[0]);

    if buffer[0] == usbtmc_status::STATUS_FAILED {
        // no transfer in progress, nothing to abort
        return Ok(());
    }
    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        log::error!("INITIATE_ABORT_BULK_IN returned {:#04x}", buffer[0]);
        return Err(Error::UnexpectedStatus(buffer[0]).into());
    }

    let mut cycles = 0usize;
    drain_bulk_in(ctx, io, &mut cycles)?;

    loop {
        ctx.transport
            .control_in(
                request_type,
                control_requests::CHECK_ABORT_BULK_IN_STATUS,
                0,
                endpoint as u16,
                &mut buffer,
                io.timeout,
            )
            .map_err(Error::from_transport)?;

        log::debug!("CHECK_ABORT_BULK_IN_STATUS returned {:#04x}", buffer[0]);

        match buffer[0] {
            usbtmc_status::STATUS_SUCCESS => return Ok(()),
            usbtmc_status::STATUS_PENDING => {
                // bit 0 of the second byte flags a refilled bulk-in FIFO
                if buffer[1] == 1 {
                    drain_bulk_in(ctx, io, &mut cycles)?;
                }
            }
            status => {
                log::error!("CHECK_ABORT_BULK_IN_STATUS returned {status:#04x}");
                return Err(Error::UnexpectedStatus(status).into());
            }
        }
    }
}

/// ### Abort Bulk Out
///
/// Abort the outstanding bulk-out transfer: INITIATE addressed at the
/// bulk-out endpoint with the last write tag, poll the CHECK status until
/// success, then clear the bulk-out halt.
///
pub(crate) fn abort_bulk_out(ctx: &IoCtx, io: &mut IoState) -> Result<()> {
    let request_type = class_request(Recipient::Endpoint);
    let endpoint = ctx.endpoints.bulk_out_ep.address;
    let mut buffer = [0u8; 8];

    ctx.transport
        .control_in(
            request_type,
            control_requests::INITIATE_ABORT_BULK_OUT,
            io.b_tag_last_write as u16,
            endpoint as u16,
            &mut buffer[..2],
            io.timeout,
        )
        .map_err(Error::from_transport)?;

    log::debug!("INITIATE_ABORT_BULK_OUT returned {:#04x}", buffer[0]);

    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        log::error!("INITIATE_ABORT_BULK_OUT returned {:#04x}", buffer[0]);
        return Err(Error::UnexpectedStatus(buffer[0]).into());
    }

    let mut n = 0usize;
    loop {
        ctx.transport
            .control_in(
                request_type,
                control_requests::CHECK_ABORT_BULK_OUT_STATUS,
                0,
                endpoint as u16,
                &mut buffer,
                io.timeout,
            )
            .map_err(Error::from_transport)?;
        n += 1;

        log::debug!("CHECK_ABORT_BULK_OUT_STATUS returned {:#04x}", buffer[0]);

        match buffer[0] {
            usbtmc_status::STATUS_SUCCESS => break,
            usbtmc_status::STATUS_PENDING if n < misc::MAX_READS_TO_CLEAR_BULK_IN => {}
            usbtmc_status::STATUS_PENDING => {
                return Err(Error::DrainLimit(misc::MAX_READS_TO_CLEAR_BULK_IN).into())
            }
            status => {
                log::error!("CHECK_ABORT_BULK_OUT_STATUS returned {status:#04x}");
                return Err(Error::UnexpectedStatus(status).into());
            }
        }
    }

    clear_out_halt(ctx)
}

/// ### Clear
///
/// Clear the device's input and output buffers: INITIATE_CLEAR addressed at
/// the interface, poll CHECK_CLEAR_STATUS (draining the bulk-in endpoint
/// whenever the device reports queued data), then clear the bulk-out halt.
///
pub(crate) fn clear(ctx: &IoCtx, io: &mut IoState) -> Result<()> {
    let request_type = class_request(Recipient::Interface);
    let mut buffer = [0u8; 2];

    log::debug!("sending INITIATE_CLEAR request");

    ctx.transport
        .control_in(
            request_type,
            control_requests::INITIATE_CLEAR,
            0,
            ctx.ifnum,
            &mut buffer[..1],
            io.timeout,
        )
        .map_err(Error::from_transport)?;

    log::debug!("INITIATE_CLEAR returned {:#04x}", buffer[0]);

    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        log::error!("INITIATE_CLEAR returned {:#04x}", buffer[0]);
        return Err(Error::UnexpectedStatus(buffer[0]).into());
    }

    let mut cycles = 0usize;
    loop {
        log::debug!("sending CHECK_CLEAR_STATUS request");

        ctx.transport
            .control_in(
                request_type,
                control_requests::CHECK_CLEAR_STATUS,
                0,
                ctx.ifnum,
                &mut buffer,
                io.timeout,
            )
            .map_err(Error::from_transport)?;

        log::debug!("CHECK_CLEAR_STATUS returned {:#04x}", buffer[0]);

        match buffer[0] {
            usbtmc_status::STATUS_SUCCESS => break,
            usbtmc_status::STATUS_PENDING => {
                if buffer[1] == 1 {
                    drain_bulk_in(ctx, io, &mut cycles)?;
                }
            }
            status => {
                log::error!("CHECK_CLEAR_STATUS returned {status:#04x}");
                return Err(Error::UnexpectedStatus(status).into());
            }
        }
    }

    clear_out_halt(ctx)
}

/// Clear any halt condition on the bulk-out endpoint.
pub(crate) fn clear_out_halt(ctx: &IoCtx) -> Result<()> {
    ctx.transport
        .clear_halt(ctx.endpoints.bulk_out_ep.address)
        .map_err(Error::from_transport)?;
    Ok(())
}

/// Clear any halt condition on the bulk-in endpoint.
pub(crate) fn clear_in_halt(ctx: &IoCtx) -> Result<()> {
    ctx.transport
        .clear_halt(ctx.endpoints.bulk_in_ep.address)
        .map_err(Error::from_transport)?;
    Ok(())
}

/// Flash the activity indicator on the device.
pub(crate) fn indicator_pulse(ctx: &IoCtx, io: &IoState) -> Result<()> {
    let mut buffer = [0u8; 1];

    ctx.transport
        .control_in(
            class_request(Recipient::Interface),
            control_requests::INDICATOR_PULSE,
            0,
            ctx.ifnum,
            &mut buffer,
            io.timeout,
        )
        .map_err(Error::from_transport)?;

    log::debug!("INDICATOR_PULSE returned {:#04x}", buffer[0]);

    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        log::error!("INDICATOR_PULSE returned {:#04x}", buffer[0]);
        return Err(Error::UnexpectedStatus(buffer[0]).into());
    }
    Ok(())
}

/// Issue the READ_STATUS_BYTE control request tagged with the current
/// interrupt bTag and return the raw three-byte reply.
pub(crate) fn read_status_byte(ctx: &IoCtx, io: &IoState) -> Result<[u8; 3]> {
    let mut buffer = [0u8; 3];

    let n = ctx
        .transport
        .control_in(
            class_request(Recipient::Interface),
            control_requests::READ_STATUS_BYTE,
            io.iin_b_tag as u16,
            ctx.ifnum,
            &mut buffer,
            io.timeout,
        )
        .map_err(Error::from_transport)?;

    if n < 3 {
        return Err(Error::ShortControlReply(n).into());
    }
    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        log::error!("READ_STATUS_BYTE returned {:#04x}", buffer[0]);
        return Err(Error::UnexpectedStatus(buffer[0]).into());
    }
    Ok(buffer)
}

/// One of the 1-byte-reply USB488 operations: REN_CONTROL, GOTO_LOCAL or
/// LOCAL_LOCKOUT. All three require the SIMPLE capability.
pub(crate) fn usb488_simple(ctx: &IoCtx, io: &IoState, request: u8, value: u16) -> Result<()> {
    if ctx.usb488_caps & usb488_caps::SIMPLE == 0 {
        return Err(Error::MissingCapability.into());
    }

    let mut buffer = [0u8; 1];
    let n = ctx
        .transport
        .control_in(
            class_request(Recipient::Interface),
            request,
            value,
            ctx.ifnum,
            &mut buffer,
            io.timeout,
        )
        .map_err(Error::from_transport)?;

    if n != 1 {
        log::warn!("usb488 request {request} returned {n} bytes");
        return Err(Error::ShortControlReply(n).into());
    }
    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        log::error!("usb488 request {request} returned status {:#04x}", buffer[0]);
        return Err(Error::UnexpectedStatus(buffer[0]).into());
    }
    Ok(())
}

/// Generic control passthrough. The direction comes from the direction bit
/// of the request type; `data` supplies wLength and, for host-to-device
/// transfers, the payload. A zero-length `data` issues a transfer without a
/// data stage.
pub(crate) fn passthrough(
    ctx: &IoCtx,
    io: &IoState,
    request: &CtrlRequest,
    data: &mut [u8],
) -> Result<usize> {
    let result = if request.request_type & USB_DIR_IN != 0 {
        ctx.transport.control_in(
            request.request_type,
            request.request,
            request.value,
            request.index,
            data,
            io.timeout,
        )
    } else {
        ctx.transport.control_out(
            request.request_type,
            request.request,
            request.value,
            request.index,
            data,
            io.timeout,
        )
    };

    let n = result.map_err(|e| {
        log::error!("generic control request failed: {e}");
        Error::from_transport(e)
    })?;
    Ok(n)
}
