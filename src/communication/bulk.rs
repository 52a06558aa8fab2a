//! Bulk
//!
//! The 12-byte USBTMC bulk header codec and the message engine driving the
//! bulk endpoints: chunked writes with end-of-message handling and padding,
//! reads with first-packet header validation, and the TRIGGER message.
//!

use anyhow::Result;

use crate::communication::control;
use crate::constants::{bulk_msg_id, misc::USBTMC_HEADER_SIZE};
use crate::device::{HandleSettings, IoCtx, IoState};
use crate::error::Error;

/// Build a DEV_DEP_MSG_OUT header for `transfer_size` payload bytes.
pub(crate) fn dev_dep_msg_out_header(btag: u8, transfer_size: u32, end_of_message: bool) -> [u8; 12] {
    let mut header = [0u8; 12];

    header[0] = bulk_msg_id::DEVICE_DEPENDENT_MSG_OUT;
    header[1] = btag;
    header[2] = !btag;
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    if end_of_message {
        header[8] = 0x01;
    }

    header
}

/// Build a REQUEST_DEV_DEP_MSG_IN header asking the device for up to
/// `transfer_size` bytes, optionally terminating on `term_char`.
pub(crate) fn request_dev_dep_msg_in_header(
    btag: u8,
    transfer_size: u32,
    term_char: Option<u8>,
) -> [u8; 12] {
    let mut header = [0u8; 12];

    header[0] = bulk_msg_id::REQUEST_DEVICE_DEPENDENT_MSG_IN;
    header[1] = btag;
    header[2] = !btag;
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    if let Some(tc) = term_char {
        header[8] = 0x02;
        header[9] = tc;
    }

    header
}

/// A decoded DEV_DEP_MSG_IN reply header.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BulkInHeader {
    /// How many characters the instrument wants to send
    pub n_characters: u32,
    /// End-of-message bit of the transfer attributes
    pub eom: bool,
}

/// Validate and decode the header of the first bulk-in packet of a reply.
/// The reply must carry MsgID 2 and the bTag of the request it answers.
pub(crate) fn parse_dev_dep_msg_in_header(
    packet: &[u8],
    expected_tag: u8,
) -> Result<BulkInHeader, Error> {
    if packet.len() < USBTMC_HEADER_SIZE {
        return Err(Error::ShortHeader(packet.len()));
    }
    if packet[0] != bulk_msg_id::DEVICE_DEPENDENT_MSG_IN {
        return Err(Error::WrongMsgId {
            expected: bulk_msg_id::DEVICE_DEPENDENT_MSG_IN,
            got: packet[0],
        });
    }
    if packet[1] != expected_tag {
        return Err(Error::WrongTag {
            expected: expected_tag,
            got: packet[1],
        });
    }
    let n_characters = u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]);
    Ok(BulkInHeader {
        n_characters,
        eom: packet[8] & 0x01 != 0,
    })
}

/// Send a REQUEST_DEV_DEP_MSG_IN message on the bulk-out endpoint and rotate
/// the tag. The tag is recorded and advanced even when the transfer fails so
/// a following abort can reference it.
fn send_request_dev_dep_msg_in(
    ctx: &IoCtx,
    io: &mut IoState,
    settings: &HandleSettings,
    transfer_size: u32,
) -> Result<(), Error> {
    let term_char = settings.term_char_enabled.then_some(settings.term_char);
    let header = request_dev_dep_msg_in_header(io.b_tag, transfer_size, term_char);

    let result = ctx
        .transport
        .bulk_out(ctx.endpoints.bulk_out_ep.address, &header, io.timeout);

    io.record_write_and_advance();

    result.map_err(Error::from_transport)?;
    Ok(())
}

/// ### Read
///
/// Request up to `buf.len()` bytes from the device and copy the reply payload
/// into `buf`. Returns the number of bytes read. On a transport or protocol
/// failure the outstanding transfer is aborted first when the handle has
/// auto-abort enabled.
///
pub(crate) fn read(
    ctx: &IoCtx,
    io: &mut IoState,
    settings: &HandleSettings,
    buf: &mut [u8],
) -> Result<usize> {
    let count = buf.len();
    let transfer_size = u32::try_from(count)
        .map_err(|_| Error::InvalidArgument("read request larger than 4 GiB"))?;

    log::debug!("bulk read: count {count}");

    if let Err(e) = send_request_dev_dep_msg_in(ctx, io, settings, transfer_size) {
        // the request itself travels on the bulk-out endpoint
        abort_bulk_out_if_enabled(ctx, io, settings);
        return Err(e.into());
    }

    let mut scratch = vec![0u8; ctx.io_buffer_size];

    // Loop until we have fetched everything we requested
    let mut remaining = count;
    let this_part = remaining;
    let mut done = 0usize;

    while remaining > 0 {
        let result = ctx
            .transport
            .bulk_in(ctx.endpoints.bulk_in_ep.address, &mut scratch, io.timeout);

        io.b_tag_last_read = io.b_tag;

        let mut actual = match result {
            Ok(n) => n,
            Err(e) => {
                log::debug!("unable to read data: {e}");
                abort_bulk_in_if_enabled(ctx, io, settings);
                return Err(Error::from_transport(e).into());
            }
        };

        if done == 0 {
            // Parse header in first packet
            let header = match parse_dev_dep_msg_in_header(&scratch[..actual], io.b_tag_last_write)
            {
                Ok(header) => header,
                Err(e) => {
                    log::error!("{e}");
                    abort_bulk_in_if_enabled(ctx, io, settings);
                    return Err(e.into());
                }
            };
            let n_characters = header.n_characters as usize;
            if n_characters > this_part {
                let e = Error::TooMuchData {
                    requested: count,
                    offered: header.n_characters,
                };
                log::error!("{e}");
                abort_bulk_in_if_enabled(ctx, io, settings);
                return Err(e.into());
            }

            log::debug!(
                "bulk-in header: n_characters {n_characters}, eom {}",
                header.eom
            );

            // Strip the header, clamp to the message and to what was asked for
            actual -= USBTMC_HEADER_SIZE;
            if remaining > n_characters {
                remaining = n_characters;
            }
            if actual > remaining {
                actual = remaining;
            }

            buf[..actual].copy_from_slice(&scratch[USBTMC_HEADER_SIZE..USBTMC_HEADER_SIZE + actual]);
            remaining -= actual;
            done += actual;

            // Terminate if end-of-message bit received from device
            if header.eom && actual >= n_characters {
                remaining = 0;
            }
        } else {
            // Continuation packets carry raw payload only
            if actual > remaining {
                actual = remaining;
            }
            buf[done..done + actual].copy_from_slice(&scratch[..actual]);
            remaining -= actual;
            done += actual;
        }
    }

    Ok(done)
}

/// ### Write
///
/// Send `data` to the device as one device-dependent message, chunked to the
/// IO buffer size, each chunk padded to a multiple of 4 on the wire and the
/// end-of-message attribute set on the final chunk only. Returns the number
/// of bytes written.
///
pub(crate) fn write(
    ctx: &IoCtx,
    io: &mut IoState,
    settings: &HandleSettings,
    data: &[u8],
) -> Result<usize> {
    let count = data.len();
    let max_part = ctx.io_buffer_size - USBTMC_HEADER_SIZE;
    let mut scratch = vec![0u8; ctx.io_buffer_size];

    let mut remaining = count;
    let mut done = 0usize;

    while remaining > 0 {
        let this_part = remaining.min(max_part);
        // only the chunk finishing the message carries EOM
        let end_of_message = remaining <= max_part && io.eom_val;

        let header = dev_dep_msg_out_header(io.b_tag, this_part as u32, end_of_message);
        scratch[..USBTMC_HEADER_SIZE].copy_from_slice(&header);
        scratch[USBTMC_HEADER_SIZE..USBTMC_HEADER_SIZE + this_part]
            .copy_from_slice(&data[done..done + this_part]);

        // pad the wire length to a multiple of 4
        let n_bytes = (USBTMC_HEADER_SIZE + this_part + 3) & !3;
        scratch[USBTMC_HEADER_SIZE + this_part..n_bytes].fill(0);

        // retry the unsent tail of a partial transfer
        let mut sent = 0usize;
        let send_result = loop {
            match ctx.transport.bulk_out(
                ctx.endpoints.bulk_out_ep.address,
                &scratch[sent..n_bytes],
                io.timeout,
            ) {
                Ok(actual) => {
                    sent += actual;
                    if sent >= n_bytes {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };

        io.record_write_and_advance();

        if let Err(e) = send_result {
            log::error!("unable to send data: {e}");
            abort_bulk_out_if_enabled(ctx, io, settings);
            return Err(Error::from_transport(e).into());
        }

        remaining -= this_part;
        done += this_part;
    }

    Ok(count)
}

/// ### Trigger
///
/// Send a TRIGGER bulk-out message (USB488 subclass, Table 2). Also rotates
/// the bulk tag.
///
pub(crate) fn trigger(ctx: &IoCtx, io: &mut IoState) -> Result<()> {
    let mut header = [0u8; 12];
    header[0] = bulk_msg_id::TRIGGER;
    header[1] = io.b_tag;
    header[2] = !io.b_tag;

    let result = ctx
        .transport
        .bulk_out(ctx.endpoints.bulk_out_ep.address, &header, io.timeout);

    io.record_write_and_advance();

    result.map_err(Error::from_transport)?;
    Ok(())
}

fn abort_bulk_in_if_enabled(ctx: &IoCtx, io: &mut IoState, settings: &HandleSettings) {
    if settings.auto_abort {
        if let Err(e) = control::abort_bulk_in(ctx, io) {
            log::debug!("auto abort bulk-in failed: {e}");
        }
    }
}

fn abort_bulk_out_if_enabled(ctx: &IoCtx, io: &mut IoState, settings: &HandleSettings) {
    if settings.auto_abort {
        if let Err(e) = control::abort_bulk_out(ctx, io) {
            log::debug!("auto abort bulk-out failed: {e}");
        }
    }
}
