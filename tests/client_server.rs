//! Client and server endpoints wired together over a simulated transport

use std::{
    collections::HashMap,
    io::Cursor,
    sync::{Arc, Mutex},
};

use ecu_uds::{
    ClientError, ClientPollState, RequestOptions, UdsError, UdsSessionType, UdsTransport,
    client::{UdsClient, UdsClientOptions, sequence::DownloadSequence},
    server::{EventResult, ServerEvent, UdsServer, UdsServerHandler, UdsServerOptions},
    sim::SimTransport,
    time::ManualClock,
};

#[derive(Default)]
struct EcuState {
    dids: HashMap<u16, Vec<u8>>,
    received: Vec<u8>,
    pending_remaining: u32,
    exited: bool,
}

struct EcuHandler(Arc<Mutex<EcuState>>);

impl UdsServerHandler for EcuHandler {
    fn handle_event(&mut self, event: ServerEvent<'_>) -> EventResult {
        let mut st = self.0.lock().unwrap();
        match event {
            ServerEvent::DiagSessCtrl { .. } => Ok(()),
            ServerEvent::EcuReset { .. } => Ok(()),
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
            ServerEvent::WriteDataByIdent { data_id, data } => {
                st.dids.insert(data_id, data.to_vec());
                Ok(())
            }
            ServerEvent::RequestDownload {
                max_block_length, ..
            } => {
                *max_block_length = 256;
                Ok(())
            }
            ServerEvent::TransferData { data, .. } => {
                st.received.extend_from_slice(data);
                Ok(())
            }
            ServerEvent::RequestTransferExit { .. } => {
                st.exited = true;
                Ok(())
            }
            ServerEvent::SessionTimeout | ServerEvent::DoScheduledReset { .. } => Ok(()),
            _ => Err(UdsError::ServiceNotSupported),
        }
    }
}

struct Rig {
    client: UdsClient,
    server: UdsServer,
    clock: ManualClock,
    state: Arc<Mutex<EcuState>>,
}

fn setup() -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_tp, server_tp) = SimTransport::pair();
    let clock = ManualClock::new();
    let state = Arc::new(Mutex::new(EcuState::default()));
    let server = UdsServer::with_clock(
        Box::new(server_tp),
        Box::new(EcuHandler(state.clone())),
        UdsServerOptions::default(),
        Box::new(clock.clone()),
    );
    let client = UdsClient::with_clock(
        Box::new(client_tp),
        UdsClientOptions::default(),
        Box::new(clock.clone()),
    );
    Rig {
        client,
        server,
        clock,
        state,
    }
}

impl Rig {
    /// Interleaves both endpoints until the client request completes
    fn pump(&mut self) {
        for _ in 0..64 {
            self.server.poll();
            if self.client.poll() == ClientPollState::Idle {
                return;
            }
        }
        panic!("request did not complete");
    }
}

#[test]
fn session_control_adopts_server_timings() {
    let mut rig = setup();
    assert_eq!(rig.client.p2_ms(), 150);
    assert_eq!(rig.client.p2_star_ms(), 1500);

    rig.client
        .send_diag_sess_ctrl(UdsSessionType::Extended)
        .unwrap();
    rig.pump();

    assert!(rig.client.error().is_none());
    assert_eq!(
        rig.client.response(),
        &[0x50, 0x03, 0x00, 0x32, 0x00, 0xC8]
    );
    assert_eq!(rig.client.p2_ms(), 50);
    assert_eq!(rig.client.p2_star_ms(), 2000);
}

#[test]
fn session_control_can_ignore_server_timings() {
    let mut rig = setup();
    rig.client.set_options(RequestOptions::IGNORE_SRV_TIMINGS);
    rig.client
        .send_diag_sess_ctrl(UdsSessionType::Extended)
        .unwrap();
    rig.pump();
    assert!(rig.client.error().is_none());
    assert_eq!(rig.client.p2_ms(), 150);
    assert_eq!(rig.client.p2_star_ms(), 1500);
}

#[test]
fn wdbi_rdbi_round_trip_law() {
    let mut rig = setup();
    let value = [0x31, 0x32, 0x33, 0x34, 0x35];

    rig.client.send_wdbi(0xF190, &value).unwrap();
    rig.pump();
    assert!(rig.client.error().is_none());
    assert_eq!(rig.client.response(), &[0x6E, 0xF1, 0x90]);

    rig.client.send_rdbi(&[0xF190]).unwrap();
    rig.pump();
    assert!(rig.client.error().is_none());

    let mut offset = 0;
    let record = rig
        .client
        .unpack_rdbi_response(0xF190, value.len(), &mut offset)
        .unwrap();
    assert_eq!(record, &value);
}

#[test]
fn client_times_out_without_a_server() {
    let mut rig = setup();
    rig.client.send_tester_present().unwrap();
    // drive only the client; nothing ever answers
    assert_eq!(rig.client.poll(), ClientPollState::Running);
    rig.clock.advance(151);
    for _ in 0..4 {
        rig.client.poll();
    }
    assert!(matches!(rig.client.error(), Some(ClientError::Timeout)));
}

#[test]
fn response_pending_extends_the_deadline() {
    let mut rig = setup();
    rig.state.lock().unwrap().dids.insert(0xF190, vec![0x42]);
    rig.state.lock().unwrap().pending_remaining = 1;

    rig.client.send_rdbi(&[0xF190]).unwrap();
    // client reaches AwaitResponse
    rig.client.poll();
    rig.client.poll();
    // server answers 0x78
    rig.server.poll();
    rig.client.poll();
    rig.client.poll();

    // beyond P2 but within P2*: the request must still be alive
    rig.clock.advance(500);
    assert_eq!(rig.client.poll(), ClientPollState::Running);
    assert!(rig.client.error().is_none());

    rig.server.poll();
    rig.pump();
    assert!(rig.client.error().is_none());
    assert_eq!(rig.client.response(), &[0x62, 0xF1, 0x90, 0x42]);
}

#[test]
fn negative_response_as_error() {
    let mut rig = setup();
    rig.client.set_options(RequestOptions::NEG_RESP_IS_ERR);
    rig.client.send_rdbi(&[0x0000]).unwrap();
    rig.pump();
    assert!(matches!(
        rig.client.error(),
        Some(ClientError::NegativeResponse(UdsError::RequestOutOfRange))
    ));
}

#[test]
fn negative_response_is_data_by_default() {
    let mut rig = setup();
    rig.client.send_rdbi(&[0x0000]).unwrap();
    rig.pump();
    assert!(rig.client.error().is_none());
    assert_eq!(rig.client.response(), &[0x7F, 0x22, 0x31]);
}

#[test]
fn functional_tester_present_expects_no_response() {
    let mut rig = setup();
    rig.client
        .set_options(RequestOptions::FUNCTIONAL | RequestOptions::SUPPRESS_POS_RESP);
    rig.client.send_tester_present().unwrap();
    for _ in 0..4 {
        rig.client.poll();
    }
    assert!(rig.client.error().is_none());

    // the server saw the request and suppressed its positive response
    rig.server.poll();
    assert_eq!(rig.client.transport_mut().poll(), Default::default());
}

#[test]
fn client_rejects_concurrent_requests() {
    let mut rig = setup();
    rig.client.send_tester_present().unwrap();
    assert!(matches!(
        rig.client.send_tester_present(),
        Err(ClientError::Busy)
    ));
}

#[test]
fn mismatched_response_sid_is_an_error() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_tp, mut server_tp) = SimTransport::pair();
    let clock = ManualClock::new();
    let mut client = UdsClient::with_clock(
        Box::new(client_tp),
        UdsClientOptions::default(),
        Box::new(clock.clone()),
    );

    client.send_tester_present().unwrap();
    client.poll();
    client.poll();

    // consume the request and answer with the wrong service
    server_tp.peek().unwrap().unwrap();
    server_tp.ack_recv();
    let buf = server_tp.get_send_buf().unwrap();
    buf[..2].copy_from_slice(&[0x51, 0x00]);
    server_tp.send(2, &Default::default()).unwrap();

    client.poll();
    client.poll();
    assert!(matches!(client.error(), Some(ClientError::SidMismatch)));
}

#[test]
fn mismatched_sub_function_echo_is_an_error() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_tp, mut server_tp) = SimTransport::pair();
    let clock = ManualClock::new();
    let mut client = UdsClient::with_clock(
        Box::new(client_tp),
        UdsClientOptions::default(),
        Box::new(clock.clone()),
    );

    client.send_ecu_reset(ecu_uds::UdsResetType::HardReset).unwrap();
    client.poll();
    client.poll();

    server_tp.peek().unwrap().unwrap();
    server_tp.ack_recv();
    let buf = server_tp.get_send_buf().unwrap();
    buf[..2].copy_from_slice(&[0x51, 0x03]);
    server_tp.send(2, &Default::default()).unwrap();

    client.poll();
    client.poll();
    assert!(matches!(
        client.error(),
        Some(ClientError::SubFunctionMismatch)
    ));
}

#[test]
fn download_sequence_transfers_a_payload() {
    let mut rig = setup();
    let payload: Vec<u8> = (0u16..700).map(|v| v as u8).collect();
    let mut runner = DownloadSequence::new(
        0x00,
        0x44,
        0x0800_0000,
        payload.len(),
        Box::new(Cursor::new(payload.clone())),
    );

    for _ in 0..256 {
        rig.server.poll();
        if runner.poll(&mut rig.client) == ClientPollState::Idle {
            break;
        }
    }

    assert!(rig.client.error().is_none(), "{:?}", rig.client.error());
    let st = rig.state.lock().unwrap();
    assert_eq!(st.received, payload);
    assert!(st.exited);
    assert!(!rig.server.transfer_active());
}

#[test]
fn security_access_builder_rejects_reserved_levels() {
    let mut rig = setup();
    assert!(matches!(
        rig.client.send_security_access(0x00, &[]),
        Err(ClientError::InvalidArgument)
    ));
    assert!(matches!(
        rig.client.send_security_access(0x43, &[]),
        Err(ClientError::InvalidArgument)
    ));
}

#[test]
fn ctrl_dtc_setting_builder_rejects_reserved_types() {
    let mut rig = setup();
    for reserved in [0x00u8, 0x03, 0x3F, 0x7F] {
        assert!(matches!(
            rig.client.send_ctrl_dtc_setting(reserved, &[]),
            Err(ClientError::InvalidArgument)
        ));
    }
}
