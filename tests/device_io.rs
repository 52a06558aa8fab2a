//! Integration tests: bulk message traffic, class requests and lifecycle
//! end to end through a scripted transport.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{attach, attach_bare, dev_dep_msg_in, parse_out_header, BULK_OUT};
use usbtmc488::constants::{control_requests, usbtmc_status};
use usbtmc488::mock::MockTransport;
use usbtmc488::{CtrlRequest, Error};

// ── bulk traffic ──

#[test]
fn short_read_with_eom() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    assert_eq!(handle.write(b"*IDN?\n").unwrap(), 6);

    // the write used tag 1, so the read request carries tag 2
    mock.push_bulk_in(dev_dep_msg_in(2, 12, true, b"ACME,SCOPE1\n"));

    let mut buf = [0u8; 64];
    let n = handle.read(&mut buf).unwrap();
    assert_eq!(n, 12);
    assert_eq!(&buf[..12], b"ACME,SCOPE1\n");

    let log = mock.bulk_out_log.lock().unwrap();
    assert_eq!(log.len(), 2);

    // the command went out as one EOM-terminated chunk, padded to 20 bytes
    let write = parse_out_header(&log[0].1);
    assert_eq!(log[0].0, BULK_OUT);
    assert_eq!(write.msg_id, 1);
    assert_eq!(write.tag, 1);
    assert_eq!(write.tag_inverse, !1u8);
    assert_eq!(write.transfer_size, 6);
    assert_eq!(write.attributes, 0x01);
    assert_eq!(log[0].1.len(), 20);

    // the read request asked for the caller's buffer size, no term char
    let request = parse_out_header(&log[1].1);
    assert_eq!(request.msg_id, 2);
    assert_eq!(request.tag, 2);
    assert_eq!(request.transfer_size, 64);
    assert_eq!(request.attributes, 0);
    assert_eq!(log[1].1.len(), 12);
}

#[test]
fn multi_packet_read_without_eom_shortcut() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    mock.push_bulk_in(dev_dep_msg_in(1, 4096, false, &payload));

    // the reply spans three bulk-in transfers of the 2048-byte IO buffer
    let mut buf = vec![0u8; 4096];
    let n = handle.read(&mut buf).unwrap();
    assert_eq!(n, 4096);
    assert_eq!(buf, payload);
}

#[test]
fn read_clamps_reply_to_message_length() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    // instrument answers 5 bytes to a 64-byte request, padding included
    mock.push_bulk_in(dev_dep_msg_in(1, 5, true, b"1.5E0\0\0\0"));

    let mut buf = [0u8; 64];
    let n = handle.read(&mut buf).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&buf[..5], b"1.5E0");
}

#[test]
fn read_rejects_oversized_reply() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    mock.push_bulk_in(dev_dep_msg_in(1, 4096, true, &[0u8; 64]));

    let mut buf = [0u8; 32];
    let err = handle.read(&mut buf).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::TooMuchData {
            requested: 32,
            offered: 4096
        })
    ));
}

#[test]
fn write_chunks_pad_and_rotate_tags() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    // 5001 bytes over a 2048-byte buffer: 2036 + 2036 + 929
    let data: Vec<u8> = (0..5001u32).map(|i| (i % 127) as u8).collect();
    assert_eq!(handle.write(&data).unwrap(), 5001);

    let log = mock.bulk_out_log.lock().unwrap();
    assert_eq!(log.len(), 3);

    let sizes: Vec<u32> = log.iter().map(|(_, p)| parse_out_header(p).transfer_size).collect();
    assert_eq!(sizes, vec![2036, 2036, 929]);

    let tags: Vec<u8> = log.iter().map(|(_, p)| parse_out_header(p).tag).collect();
    assert_eq!(tags, vec![1, 2, 3]);

    for (_, packet) in log.iter() {
        let header = parse_out_header(packet);
        assert_eq!(header.msg_id, 1);
        assert_eq!(header.tag_inverse, !header.tag);
        assert_eq!(packet[3], 0);
        assert_eq!(&packet[10..12], &[0, 0]);
        assert_eq!(packet.len() % 4, 0, "wire length must be a multiple of 4");
    }

    // EOM only on the final chunk
    let eoms: Vec<u8> = log.iter().map(|(_, p)| parse_out_header(p).attributes).collect();
    assert_eq!(eoms, vec![0, 0, 1]);

    // last chunk padded from 941 to 944 bytes with zeroes
    let last = &log[2].1;
    assert_eq!(last.len(), 944);
    assert_eq!(&last[941..], &[0, 0, 0]);
}

#[test]
fn write_retries_partial_sends() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    // device accepts only 10 of the 32 wire bytes on the first attempt
    mock.queue_bulk_out_result(Ok(10));
    assert_eq!(handle.write(&[0xABu8; 20]).unwrap(), 20);

    let log = mock.bulk_out_log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].1.len(), 32);
    assert_eq!(log[1].1.len(), 22, "retry resumes at the unsent tail");
}

#[test]
fn round_trip_split_write_then_echo() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    let data: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
    assert_eq!(handle.write(&data).unwrap(), 5000);
    // three write chunks used tags 1..=3, the read request takes 4
    mock.push_bulk_in(dev_dep_msg_in(4, 5000, true, &data));

    let mut buf = vec![0u8; 5000];
    assert_eq!(handle.read(&mut buf).unwrap(), 5000);
    assert_eq!(buf, data);
}

// ── auto-abort on protocol failure ──

#[test]
fn header_mismatch_triggers_abort_bulk_in() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    device.set_auto_abort(true);
    let handle = device.open_handle().unwrap();

    // reply tagged 99 instead of the request's tag 1
    mock.push_bulk_in(dev_dep_msg_in(99, 4, true, b"abcd"));
    mock.queue_control_in(
        control_requests::INITIATE_ABORT_BULK_IN,
        vec![usbtmc_status::STATUS_SUCCESS, 0],
    );
    mock.push_bulk_in(Vec::new()); // drain ends on the short packet
    mock.queue_control_in(
        control_requests::CHECK_ABORT_BULK_IN_STATUS,
        vec![usbtmc_status::STATUS_SUCCESS, 0, 0, 0, 0, 0, 0, 0],
    );

    let mut buf = [0u8; 16];
    let err = handle.read(&mut buf).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::WrongTag {
            expected: 1,
            got: 99
        })
    ));

    // INITIATE → drain → CHECK ran before the error surfaced
    let log = mock.control_log.lock().unwrap();
    let aborts: Vec<_> = log
        .iter()
        .filter(|c| {
            c.request == control_requests::INITIATE_ABORT_BULK_IN
                || c.request == control_requests::CHECK_ABORT_BULK_IN_STATUS
        })
        .collect();
    assert_eq!(aborts.len(), 2);
    // the INITIATE references the last read tag (the rotating tag after the request)
    assert_eq!(aborts[0].value, 2);
}

#[test]
fn transport_error_during_read_triggers_abort_bulk_in() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    device.set_auto_abort(true);
    let handle = device.open_handle().unwrap();

    mock.push_bulk_in_err(usbtmc488::TransportError::Stall);
    // the device has nothing in flight any more, so the abort is a no-op
    mock.queue_control_in(
        control_requests::INITIATE_ABORT_BULK_IN,
        vec![usbtmc_status::STATUS_FAILED, 0],
    );

    let mut buf = [0u8; 16];
    let err = handle.read(&mut buf).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Transport(usbtmc488::TransportError::Stall))
    ));
    assert!(mock
        .control_log
        .lock()
        .unwrap()
        .iter()
        .any(|c| c.request == control_requests::INITIATE_ABORT_BULK_IN));
}

#[test]
fn transport_error_during_write_triggers_abort_bulk_out() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    device.set_auto_abort(true);
    let handle = device.open_handle().unwrap();

    mock.queue_bulk_out_result(Err(usbtmc488::TransportError::Stall));
    mock.queue_control_in(
        control_requests::INITIATE_ABORT_BULK_OUT,
        vec![usbtmc_status::STATUS_SUCCESS, 0],
    );
    mock.queue_control_in(
        control_requests::CHECK_ABORT_BULK_OUT_STATUS,
        vec![usbtmc_status::STATUS_SUCCESS, 0, 0, 0, 0, 0, 0, 0],
    );

    let err = handle.write(b"*RST\n").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Transport(usbtmc488::TransportError::Stall))
    ));
    // the abort referenced the failed write's tag and cleared the halt
    let log = mock.control_log.lock().unwrap();
    let initiate = log
        .iter()
        .find(|c| c.request == control_requests::INITIATE_ABORT_BULK_OUT)
        .unwrap();
    assert_eq!(initiate.value, 1);
    assert_eq!(*mock.cleared_halts.lock().unwrap(), vec![BULK_OUT]);
}

#[test]
fn read_failure_without_auto_abort_skips_abort() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    mock.push_bulk_in(dev_dep_msg_in(99, 4, true, b"abcd"));

    let mut buf = [0u8; 16];
    let err = handle.read(&mut buf).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::WrongTag { .. })
    ));
    // only the attach-time GET_CAPABILITIES request was issued
    assert_eq!(mock.control_calls(), 1);
}

// ── class requests ──

#[test]
fn clear_drains_and_clears_bulk_out_halt() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    mock.queue_control_in(
        control_requests::INITIATE_CLEAR,
        vec![usbtmc_status::STATUS_SUCCESS],
    );
    mock.queue_control_in(
        control_requests::CHECK_CLEAR_STATUS,
        vec![usbtmc_status::STATUS_PENDING, 1],
    );
    mock.push_bulk_in(vec![0u8; 8]);
    mock.queue_control_in(
        control_requests::CHECK_CLEAR_STATUS,
        vec![usbtmc_status::STATUS_SUCCESS, 0],
    );

    handle.clear().unwrap();
    assert_eq!(*mock.cleared_halts.lock().unwrap(), vec![BULK_OUT]);
}

#[test]
fn abort_bulk_out_explicit() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    handle.write(b"interrupted").unwrap();
    mock.queue_control_in(
        control_requests::INITIATE_ABORT_BULK_OUT,
        vec![usbtmc_status::STATUS_SUCCESS, 0],
    );
    mock.queue_control_in(
        control_requests::CHECK_ABORT_BULK_OUT_STATUS,
        vec![usbtmc_status::STATUS_SUCCESS, 0, 0, 0, 0, 0, 0, 0],
    );

    handle.abort_bulk_out().unwrap();

    let log = mock.control_log.lock().unwrap();
    let initiate = log
        .iter()
        .find(|c| c.request == control_requests::INITIATE_ABORT_BULK_OUT)
        .unwrap();
    // references the tag of the write just sent
    assert_eq!(initiate.value, 1);
    assert_eq!(initiate.index, BULK_OUT as u16);
    assert_eq!(*mock.cleared_halts.lock().unwrap(), vec![BULK_OUT]);
}

#[test]
fn halt_wrappers_hit_the_right_endpoints() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    handle.clear_in_halt().unwrap();
    handle.clear_out_halt().unwrap();
    assert_eq!(*mock.cleared_halts.lock().unwrap(), vec![0x81, BULK_OUT]);
}

#[test]
fn indicator_pulse_checks_status() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    mock.queue_control_in(
        control_requests::INDICATOR_PULSE,
        vec![usbtmc_status::STATUS_SUCCESS],
    );
    handle.indicator_pulse().unwrap();

    mock.queue_control_in(
        control_requests::INDICATOR_PULSE,
        vec![usbtmc_status::STATUS_FAILED],
    );
    let err = handle.indicator_pulse().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::UnexpectedStatus(0x80))
    ));
}

#[test]
fn trigger_emits_488_header_and_rotates_tag() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    handle.trigger().unwrap();
    handle.trigger().unwrap();

    let log = mock.bulk_out_log.lock().unwrap();
    assert_eq!(log.len(), 2);
    for (n, (endpoint, packet)) in log.iter().enumerate() {
        let tag = (n + 1) as u8;
        assert_eq!(*endpoint, BULK_OUT);
        assert_eq!(packet.len(), 12);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[1], tag);
        assert_eq!(packet[2], !tag);
        assert!(packet[3..].iter().all(|&b| b == 0));
    }
}

// ── configuration ──

#[test]
fn timeout_get_set_idempotence() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    assert_eq!(handle.get_timeout().unwrap(), Duration::from_millis(600));

    handle.set_timeout(Duration::from_millis(750)).unwrap();
    assert_eq!(handle.get_timeout().unwrap(), Duration::from_millis(750));
    assert_eq!(handle.get_timeout().unwrap(), Duration::from_millis(750));

    // below the minimum: rejected, stored value untouched
    let err = handle.set_timeout(Duration::from_millis(499)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidArgument(_))
    ));
    assert_eq!(handle.get_timeout().unwrap(), Duration::from_millis(750));
}

#[test]
fn eom_enable_gates_the_write_attribute() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    let err = handle.eom_enable(2).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidArgument(_))
    ));

    handle.eom_enable(0).unwrap();
    handle.write(b"OPC").unwrap();
    {
        let log = mock.bulk_out_log.lock().unwrap();
        assert_eq!(parse_out_header(&log[0].1).attributes, 0);
    }

    handle.eom_enable(1).unwrap();
    handle.write(b"OPC").unwrap();
    let log = mock.bulk_out_log.lock().unwrap();
    assert_eq!(parse_out_header(&log[1].1).attributes, 0x01);
}

#[test]
fn termchar_config_flows_into_read_requests() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let setup = device.open_handle().unwrap();

    setup.config_termchar(b';', true).unwrap();

    // settings are snapshotted at open, so use a handle opened afterwards
    let handle = device.open_handle().unwrap();
    mock.push_bulk_in(dev_dep_msg_in(1, 2, true, b"OK\0\0"));
    let mut buf = [0u8; 16];
    handle.read(&mut buf).unwrap();

    let log = mock.bulk_out_log.lock().unwrap();
    let request = parse_out_header(&log[0].1);
    assert_eq!(request.attributes, 0x02);
    assert_eq!(request.term_char, b';');
}

#[test]
fn termchar_enable_requires_device_capability() {
    let mock = Arc::new(MockTransport::new());
    let device = attach_bare(&mock, false);
    let handle = device.open_handle().unwrap();

    let err = handle.config_termchar(b'\n', true).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::MissingCapability)
    ));

    // disabling never needs the capability
    handle.config_termchar(b'\n', false).unwrap();
}

#[test]
fn get_caps_returns_coalesced_byte() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    assert_eq!(handle.get_caps().unwrap(), 0xF7);
    assert_eq!(device.usb488_caps(), 0xF7);
    assert!(device.capabilities().supports_term_char());
}

#[test]
fn ren_control_requires_simple_capability() {
    let mock = Arc::new(MockTransport::new());
    let device = attach_bare(&mock, false);
    let handle = device.open_handle().unwrap();

    for result in [
        handle.ren_control(true),
        handle.goto_local(),
        handle.local_lockout(),
    ] {
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MissingCapability)
        ));
    }
    // nothing reached the wire beyond the attach-time capability request
    assert_eq!(mock.control_calls(), 1);
}

#[test]
fn ren_control_passes_the_enable_flag() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    mock.queue_control_in(
        control_requests::REN_CONTROL,
        vec![usbtmc_status::STATUS_SUCCESS],
    );
    mock.queue_control_in(
        control_requests::REN_CONTROL,
        vec![usbtmc_status::STATUS_SUCCESS],
    );
    handle.ren_control(true).unwrap();
    handle.ren_control(false).unwrap();

    let log = mock.control_log.lock().unwrap();
    let ren: Vec<_> = log
        .iter()
        .filter(|c| c.request == control_requests::REN_CONTROL)
        .collect();
    assert_eq!(ren[0].value, 1);
    assert_eq!(ren[1].value, 0);
}

#[test]
fn generic_passthrough_both_directions() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let handle = device.open_handle().unwrap();

    // device-to-host: reply lands in the caller's buffer
    mock.queue_control_in(0x42, vec![0xDE, 0xAD]);
    let mut reply = [0u8; 4];
    let n = handle
        .control_request(
            &CtrlRequest {
                request_type: 0xA1,
                request: 0x42,
                value: 7,
                index: 1,
            },
            &mut reply,
        )
        .unwrap();
    assert_eq!(n, 2);
    assert_eq!(&reply[..2], &[0xDE, 0xAD]);

    // host-to-device: payload recorded as sent
    let mut payload = *b"ping";
    let n = handle
        .control_request(
            &CtrlRequest {
                request_type: 0x21,
                request: 0x09,
                value: 0,
                index: 0,
            },
            &mut payload,
        )
        .unwrap();
    assert_eq!(n, 4);

    // wLength == 0 issues a transfer without a data stage
    let n = handle
        .control_request(
            &CtrlRequest {
                request_type: 0x21,
                request: 0x0A,
                value: 0,
                index: 0,
            },
            &mut [],
        )
        .unwrap();
    assert_eq!(n, 0);

    let log = mock.control_log.lock().unwrap();
    let last = log.last().unwrap();
    assert_eq!(last.request, 0x0A);
    assert_eq!(last.length, 0);
}

// ── lifecycle ──

#[test]
fn disconnect_while_reading_wakes_with_not_present() {
    let mock = Arc::new(MockTransport::new());
    let mut device = attach(&mock, false);
    let blocked = device.open_handle().unwrap();
    let other = device.open_handle().unwrap();

    let reader = thread::spawn(move || {
        let mut buf = [0u8; 64];
        blocked.read(&mut buf).map(|_| ())
    });

    // let the reader park in the bulk-in transfer, then pull the plug
    thread::sleep(Duration::from_millis(50));
    mock.disconnect();
    device.disconnect();

    let err = reader.join().unwrap().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::NotPresent)
    ));

    // a handle on the zombie device fails without touching the transport
    let outs = mock.bulk_out_calls();
    let err = other.write(b"*RST\n").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::NotPresent)
    ));
    assert_eq!(mock.bulk_out_calls(), outs);

    // and new handles can no longer be opened
    assert!(matches!(
        device.open_handle().unwrap_err().downcast_ref::<Error>(),
        Some(Error::NotPresent)
    ));
}

#[test]
fn poll_srq_does_not_block_behind_io() {
    let mock = Arc::new(MockTransport::new());
    let device = attach(&mock, false);
    let blocked = device.open_handle().unwrap();
    let poller = device.open_handle().unwrap();

    // park a reader in the bulk-in transfer for the full 600 ms timeout
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let _ = blocked.read(&mut buf);
    });

    thread::sleep(Duration::from_millis(50));
    let started = std::time::Instant::now();
    assert!(!poller.poll_srq().unwrap());
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "poll must answer while a transfer is in flight"
    );
    reader.join().unwrap();
}

#[test]
fn every_operation_fails_on_zombie() {
    let mock = Arc::new(MockTransport::new());
    let mut device = attach(&mock, false);
    let handle = device.open_handle().unwrap();
    device.disconnect();

    let mut buf = [0u8; 4];
    let results = vec![
        handle.read(&mut buf).map(|_| ()),
        handle.write(b"x").map(|_| ()),
        handle.clear(),
        handle.abort_bulk_in(),
        handle.abort_bulk_out(),
        handle.trigger(),
        handle.read_stb().map(|_| ()),
        handle.get_timeout().map(|_| ()),
        handle.set_timeout(Duration::from_secs(1)),
        handle.get_caps().map(|_| ()),
        handle.indicator_pulse(),
        handle.poll_srq().map(|_| ()),
    ];
    for result in results {
        assert!(matches!(
            result.unwrap_err().downcast_ref::<Error>(),
            Some(Error::NotPresent)
        ));
    }
}

#[test]
fn attach_survives_missing_capabilities() {
    let mock = Arc::new(MockTransport::new());
    // no GET_CAPABILITIES reply queued: the request times out
    common::init_logs();
    let device = usbtmc488::UsbtmcDevice::attach(
        Arc::clone(&mock) as Arc<dyn usbtmc488::UsbTransport>,
        common::endpoints(false),
        0,
        common::config(),
    )
    .unwrap();

    assert_eq!(device.usb488_caps(), 0);
    // capability-gated operations fail cleanly
    let handle = device.open_handle().unwrap();
    assert!(handle.ren_control(true).is_err());
}
