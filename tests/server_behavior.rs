//! Wire-level behavior of the UDS server over a simulated transport

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use ecu_uds::{
    SduInfo, TargetAddressType, UdsError, UdsSessionType, UdsTransport,
    server::{EventResult, ServerEvent, UdsServer, UdsServerHandler, UdsServerOptions},
    sim::SimTransport,
    time::ManualClock,
};

#[derive(Default)]
struct EcuState {
    dids: HashMap<u16, Vec<u8>>,
    received: Vec<u8>,
    resets: Vec<u8>,
    session_timeouts: usize,
    pending_remaining: u32,
    power_down_time_ms: u32,
    max_block_length: u16,
    seed: Vec<u8>,
    valid_key: Vec<u8>,
}

struct EcuHandler(Arc<Mutex<EcuState>>);

impl UdsServerHandler for EcuHandler {
    fn handle_event(&mut self, event: ServerEvent<'_>) -> EventResult {
        let mut st = self.0.lock().unwrap();
        match event {
            ServerEvent::DiagSessCtrl { .. } => Ok(()),
            ServerEvent::EcuReset {
                power_down_time_ms, ..
            } => {
                if st.power_down_time_ms != 0 {
                    *power_down_time_ms = st.power_down_time_ms;
                }
                Ok(())
            }
            ServerEvent::ReadDataByIdent {
                data_id,
                mut writer,
            } => {
                if st.pending_remaining > 0 {
                    st.pending_remaining -= 1;
                    return Err(UdsError::RequestCorrectlyReceivedResponsePending);
                }
                match st.dids.get(&data_id) {
                    Some(value) => writer.append(value),
                    None => Err(UdsError::RequestOutOfRange),
                }
            }
            ServerEvent::ReadMemByAddr {
                size, mut writer, ..
            } => writer.append(&vec![0xAB; size]),
            ServerEvent::CommCtrl { .. } => Ok(()),
            ServerEvent::SecAccessRequestSeed { mut seed, .. } => {
                let bytes = st.seed.clone();
                seed.append(&bytes)
            }
            ServerEvent::SecAccessValidateKey { key, .. } => {
                if key == st.valid_key.as_slice() {
                    Ok(())
                } else {
                    Err(UdsError::InvalidKey)
                }
            }
            ServerEvent::WriteDataByIdent { data_id, data } => {
                st.dids.insert(data_id, data.to_vec());
                Ok(())
            }
            ServerEvent::RoutineCtrl { mut status, .. } => status.append(&[0xAA]),
            ServerEvent::RequestDownload {
                max_block_length, ..
            } => {
                if st.max_block_length != 0 {
                    *max_block_length = st.max_block_length;
                }
                Ok(())
            }
            ServerEvent::RequestUpload { .. } => Ok(()),
            ServerEvent::TransferData { data, .. } => {
                st.received.extend_from_slice(data);
                Ok(())
            }
            ServerEvent::RequestTransferExit { .. } => Ok(()),
            ServerEvent::SessionTimeout => {
                st.session_timeouts += 1;
                Ok(())
            }
            ServerEvent::DoScheduledReset { reset_type } => {
                st.resets.push(reset_type);
                Ok(())
            }
        }
    }
}

fn setup() -> (SimTransport, UdsServer, ManualClock, Arc<Mutex<EcuState>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_tp, server_tp) = SimTransport::pair();
    let clock = ManualClock::new();
    let state = Arc::new(Mutex::new(EcuState {
        seed: vec![0xAA, 0xBB, 0xCC, 0xDD],
        valid_key: vec![0x01, 0x02, 0x03, 0x04],
        max_block_length: 256,
        ..Default::default()
    }));
    let server = UdsServer::with_clock(
        Box::new(server_tp),
        Box::new(EcuHandler(state.clone())),
        UdsServerOptions::default(),
        Box::new(clock.clone()),
    );
    (client_tp, server, clock, state)
}

fn request(tp: &mut SimTransport, data: &[u8]) {
    let buf = tp.get_send_buf().unwrap();
    buf[..data.len()].copy_from_slice(data);
    tp.send(data.len(), &SduInfo::default()).unwrap();
}

fn request_functional(tp: &mut SimTransport, data: &[u8]) {
    let buf = tp.get_send_buf().unwrap();
    buf[..data.len()].copy_from_slice(data);
    let info = SduInfo {
        ta_type: TargetAddressType::Functional,
        ..Default::default()
    };
    tp.send(data.len(), &info).unwrap();
}

fn response(tp: &mut SimTransport) -> Option<Vec<u8>> {
    let payload = tp.peek().unwrap().map(|(p, _)| p.to_vec());
    if payload.is_some() {
        tp.ack_recv();
    }
    payload
}

#[test]
fn session_control_reports_server_timings() {
    let (mut tp, mut server, _clock, _state) = setup();
    request(&mut tp, &[0x10, 0x03]);
    server.poll();
    // P2 = 50ms, P2* = 2000ms encoded in 10ms resolution
    assert_eq!(response(&mut tp).unwrap(), vec![0x50, 0x03, 0x00, 0x32, 0x00, 0xC8]);
    assert_eq!(server.session_type(), UdsSessionType::Extended);
}

#[test]
fn ecu_reset_schedules_exactly_one_reset() {
    let (mut tp, mut server, clock, state) = setup();
    state.lock().unwrap().power_down_time_ms = 5000;

    request(&mut tp, &[0x11, 0x04]);
    server.poll();
    // rapid power shutdown reports the power down time in seconds
    assert_eq!(response(&mut tp).unwrap(), vec![0x51, 0x04, 0x05]);
    assert!(state.lock().unwrap().resets.is_empty());

    // while the reset is pending the server stops accepting requests
    request(&mut tp, &[0x3E, 0x00]);
    server.poll();
    assert_eq!(response(&mut tp), None);

    clock.advance(5001);
    server.poll();
    assert_eq!(state.lock().unwrap().resets, vec![0x04]);
    server.poll();
    assert_eq!(state.lock().unwrap().resets, vec![0x04]);
}

#[test]
fn rdbi_returns_stored_record() {
    let (mut tp, mut server, _clock, state) = setup();
    state
        .lock()
        .unwrap()
        .dids
        .insert(0xF190, vec![0x31, 0x32, 0x33, 0x34, 0x35]);

    request(&mut tp, &[0x22, 0xF1, 0x90]);
    server.poll();
    assert_eq!(
        response(&mut tp).unwrap(),
        vec![0x62, 0xF1, 0x90, 0x31, 0x32, 0x33, 0x34, 0x35]
    );
}

#[test]
fn wdbi_then_rdbi_round_trips() {
    let (mut tp, mut server, _clock, _state) = setup();
    request(&mut tp, &[0x2E, 0x01, 0x23, 0xDE, 0xAD, 0xBE, 0xEF]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x6E, 0x01, 0x23]);

    request(&mut tp, &[0x22, 0x01, 0x23]);
    server.poll();
    assert_eq!(
        response(&mut tp).unwrap(),
        vec![0x62, 0x01, 0x23, 0xDE, 0xAD, 0xBE, 0xEF]
    );
}

#[test]
fn read_memory_by_address_length_must_match() {
    let (mut tp, mut server, _clock, _state) = setup();
    // 2 byte address 0x1234, 1 byte size 3
    request(&mut tp, &[0x23, 0x12, 0x12, 0x34, 0x03]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x63, 0xAB, 0xAB, 0xAB]);
}

#[test]
fn security_access_boot_delay_and_unlock() {
    let (mut tp, mut server, clock, _state) = setup();

    // within the boot delay the service is refused
    request(&mut tp, &[0x27, 0x01]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x27, 0x37]);

    clock.advance(1001);
    request(&mut tp, &[0x27, 0x01]);
    server.poll();
    assert_eq!(
        response(&mut tp).unwrap(),
        vec![0x67, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]
    );

    request(&mut tp, &[0x27, 0x02, 0x01, 0x02, 0x03, 0x04]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x67, 0x02]);
    assert_eq!(server.security_level(), 1);

    // a seed request for an unlocked level answers with a zero seed
    request(&mut tp, &[0x27, 0x01]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x67, 0x01, 0x00, 0x00]);
}

#[test]
fn security_access_bad_key_arms_lockout() {
    let (mut tp, mut server, clock, _state) = setup();
    clock.advance(1001);

    request(&mut tp, &[0x27, 0x02, 0x00, 0x00, 0x00, 0x00]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x27, 0x35]);
    assert_eq!(server.security_level(), 0);

    // within the mitigation delay every attempt is refused
    request(&mut tp, &[0x27, 0x01]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x27, 0x36]);

    clock.advance(1001);
    request(&mut tp, &[0x27, 0x01]);
    server.poll();
    assert_eq!(
        response(&mut tp).unwrap(),
        vec![0x67, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]
    );
}

#[test]
fn reserved_security_sub_functions_are_rejected() {
    let (mut tp, mut server, clock, _state) = setup();
    clock.advance(1001);
    for sub in [0x43u8, 0x5E, 0x7F] {
        request(&mut tp, &[0x27, sub]);
        server.poll();
        assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x27, 0x13]);
    }
}

#[test]
fn download_transfer_exit_round_trip() {
    let (mut tp, mut server, _clock, state) = setup();

    // 4 byte address 0, 4 byte size 16
    request(
        &mut tp,
        &[0x34, 0x00, 0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10],
    );
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x74, 0x20, 0x01, 0x00]);
    assert!(server.transfer_active());

    let payload: Vec<u8> = (0..16).collect();
    let mut req = vec![0x36, 0x01];
    req.extend_from_slice(&payload);
    request(&mut tp, &req);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x76, 0x01]);
    assert_eq!(state.lock().unwrap().received, payload);

    request(&mut tp, &[0x37]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x77]);
    assert!(!server.transfer_active());
}

#[test]
fn transfer_block_counter_wraps_through_zero() {
    let (mut tp, mut server, _clock, _state) = setup();

    // 300 byte transfer, one byte per block
    request(
        &mut tp,
        &[0x34, 0x00, 0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x2C],
    );
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x74, 0x20, 0x01, 0x00]);

    for i in 0..260u32 {
        let counter = ((i + 1) % 256) as u8;
        request(&mut tp, &[0x36, counter, 0x55]);
        server.poll();
        assert_eq!(response(&mut tp).unwrap(), vec![0x76, counter], "block {i}");
    }
}

#[test]
fn transfer_sequence_error_terminates_transfer() {
    let (mut tp, mut server, _clock, _state) = setup();
    request(
        &mut tp,
        &[0x34, 0x00, 0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10],
    );
    server.poll();
    response(&mut tp).unwrap();

    request(&mut tp, &[0x36, 0x05, 0x01]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x36, 0x24]);
    assert!(!server.transfer_active());

    request(&mut tp, &[0x36, 0x01, 0x01]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x36, 0x70]);
}

#[test]
fn transfer_data_without_request_download() {
    let (mut tp, mut server, _clock, _state) = setup();
    request(&mut tp, &[0x36, 0x01, 0x00]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x36, 0x70]);
}

#[test]
fn oversized_transfer_is_suspended() {
    let (mut tp, mut server, _clock, _state) = setup();
    // 4 byte transfer
    request(
        &mut tp,
        &[0x34, 0x00, 0x44, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04],
    );
    server.poll();
    response(&mut tp).unwrap();

    request(&mut tp, &[0x36, 0x01, 1, 2, 3, 4, 5]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x36, 0x71]);
    assert!(!server.transfer_active());
}

#[test]
fn response_pending_pins_the_request() {
    let (mut tp, mut server, _clock, state) = setup();
    state.lock().unwrap().dids.insert(0xF190, vec![0x42]);
    state.lock().unwrap().pending_remaining = 2;

    request(&mut tp, &[0x22, 0xF1, 0x90]);
    request(&mut tp, &[0x3E, 0x00]);

    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x22, 0x78]);

    // the handler keeps pending: re-invoked but the 0x78 repeat is paced by P2*
    server.poll();
    assert_eq!(response(&mut tp), None);

    // now the handler answers; the queued request is served afterwards
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x62, 0xF1, 0x90, 0x42]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7E, 0x00]);
}

#[test]
fn s3_timeout_reverts_to_default_session() {
    let (mut tp, mut server, clock, state) = setup();
    request(&mut tp, &[0x10, 0x03]);
    server.poll();
    response(&mut tp).unwrap();
    assert_eq!(server.session_type(), UdsSessionType::Extended);

    clock.advance(3001);
    server.poll();
    assert_eq!(server.session_type(), UdsSessionType::Default);
    assert_eq!(server.security_level(), 0);
    assert_eq!(state.lock().unwrap().session_timeouts, 1);
}

#[test]
fn tester_present_keeps_session_alive() {
    let (mut tp, mut server, clock, state) = setup();
    request(&mut tp, &[0x10, 0x03]);
    server.poll();
    response(&mut tp).unwrap();

    for _ in 0..4 {
        clock.advance(2000);
        request(&mut tp, &[0x3E, 0x00]);
        server.poll();
        assert_eq!(response(&mut tp).unwrap(), vec![0x7E, 0x00]);
    }
    assert_eq!(server.session_type(), UdsSessionType::Extended);
    assert_eq!(state.lock().unwrap().session_timeouts, 0);
}

#[test]
fn suppressed_positive_responses() {
    let (mut tp, mut server, _clock, _state) = setup();

    request(&mut tp, &[0x3E, 0x80]);
    server.poll();
    assert_eq!(response(&mut tp), None);

    request(&mut tp, &[0x10, 0x83]);
    server.poll();
    assert_eq!(response(&mut tp), None);
    assert_eq!(server.session_type(), UdsSessionType::Extended);
}

#[test]
fn tester_present_length_and_sub_function_rules() {
    let (mut tp, mut server, _clock, _state) = setup();

    request(&mut tp, &[0x3E]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x3E, 0x13]);

    request(&mut tp, &[0x3E, 0x01]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x3E, 0x12]);
}

#[test]
fn routine_control_validates_control_type() {
    let (mut tp, mut server, _clock, _state) = setup();

    request(&mut tp, &[0x31, 0x01, 0x02, 0x00]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x71, 0x01, 0x02, 0x00, 0xAA]);

    request(&mut tp, &[0x31, 0x04, 0x02, 0x00]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x31, 0x31]);
}

#[test]
fn communication_control_echoes_control_type() {
    let (mut tp, mut server, _clock, _state) = setup();
    request(&mut tp, &[0x28, 0x01, 0x01]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x68, 0x01]);
}

#[test]
fn control_dtc_setting_echoes_sub_function() {
    let (mut tp, mut server, _clock, _state) = setup();
    request(&mut tp, &[0x85, 0x02]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0xC5, 0x02]);
}

#[test]
fn unsupported_sid_is_rejected_physically_and_silent_functionally() {
    let (mut tp, mut server, _clock, _state) = setup();

    request(&mut tp, &[0x3F]);
    server.poll();
    assert_eq!(response(&mut tp).unwrap(), vec![0x7F, 0x3F, 0x11]);

    request_functional(&mut tp, &[0x3F]);
    server.poll();
    assert_eq!(response(&mut tp), None);
}

#[test]
fn malformed_requests_yield_length_errors() {
    let (mut tp, mut server, _clock, _state) = setup();
    for req in [
        vec![0x10u8],
        vec![0x11],
        vec![0x22, 0xF1],
        vec![0x27],
        vec![0x2E, 0x01, 0x23],
        vec![0x31, 0x01, 0x02],
        vec![0x85],
    ] {
        request(&mut tp, &req);
        server.poll();
        assert_eq!(
            response(&mut tp).unwrap(),
            vec![0x7F, req[0], 0x13],
            "request {req:02X?}"
        );
    }
}
