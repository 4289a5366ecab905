//! ISO-TP transports talking across an in-memory CAN bus

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use ecu_uds::{
    SduInfo, TargetAddressType, TpStatus, UdsTransport,
    channel::{ChannelError, ChannelResult},
    isotp::{CanBus, IsoTpAddressing, IsoTpSettings, IsoTpTransport},
    time::ManualClock,
};

#[derive(Default)]
struct BusInner {
    queue: VecDeque<(u32, Vec<u8>)>,
    log: Vec<(u32, Vec<u8>)>,
}

#[derive(Clone, Default)]
struct SharedBus(Arc<Mutex<BusInner>>);

impl CanBus for SharedBus {
    fn send_frame(&mut self, arbitration_id: u32, data: &[u8]) -> ChannelResult<()> {
        let mut inner = self.0.lock().unwrap();
        inner.queue.push_back((arbitration_id, data.to_vec()));
        inner.log.push((arbitration_id, data.to_vec()));
        Ok(())
    }
}

impl SharedBus {
    fn deliver(&self, a: &mut IsoTpTransport, b: &mut IsoTpTransport) {
        loop {
            let frame = self.0.lock().unwrap().queue.pop_front();
            let Some((id, data)) = frame else { break };
            a.on_can_frame(id, &data);
            b.on_can_frame(id, &data);
        }
    }

    fn log(&self) -> Vec<(u32, Vec<u8>)> {
        self.0.lock().unwrap().log.clone()
    }
}

struct Wire {
    bus: SharedBus,
    client: IsoTpTransport,
    server: IsoTpTransport,
    clock: ManualClock,
}

fn setup(settings: IsoTpSettings) -> Wire {
    let _ = env_logger::builder().is_test(true).try_init();
    let bus = SharedBus::default();
    let clock = ManualClock::new();
    let client = IsoTpTransport::with_clock(
        Box::new(bus.clone()),
        IsoTpAddressing::example_client(),
        settings,
        Box::new(clock.clone()),
    );
    let server = IsoTpTransport::with_clock(
        Box::new(bus.clone()),
        IsoTpAddressing::example_server(),
        settings,
        Box::new(clock.clone()),
    );
    Wire {
        bus,
        client,
        server,
        clock,
    }
}

fn send(tp: &mut IsoTpTransport, payload: &[u8], ta_type: TargetAddressType) -> ChannelResult<()> {
    let buf = tp.get_send_buf()?;
    buf[..payload.len()].copy_from_slice(payload);
    let info = SduInfo {
        ta_type,
        ..Default::default()
    };
    tp.send(payload.len(), &info).map(|_| ())
}

impl Wire {
    /// Steps the pair until the server has a complete SDU, returning it
    fn run_until_received(&mut self) -> Vec<u8> {
        for _ in 0..2000 {
            self.clock.advance(1);
            self.client.poll();
            self.bus.deliver(&mut self.client, &mut self.server);
            let status = self.server.poll();
            self.bus.deliver(&mut self.client, &mut self.server);
            if status.contains(TpStatus::RECV_COMPLETE) {
                let (payload, _info) = self.server.peek().unwrap().unwrap();
                let payload = payload.to_vec();
                self.server.ack_recv();
                return payload;
            }
        }
        panic!("payload never arrived");
    }
}

#[test]
fn segmentation_round_trip_law() {
    for size in [0usize, 1, 6, 7, 8, 13, 62, 300, 4095] {
        let mut wire = setup(IsoTpSettings::default());
        let payload: Vec<u8> = (0..size).map(|v| v as u8).collect();
        send(&mut wire.client, &payload, TargetAddressType::Physical).unwrap();
        let received = wire.run_until_received();
        assert_eq!(received, payload, "size {size}");
    }
}

#[test]
fn seven_bytes_is_a_single_frame_eight_is_not() {
    let mut wire = setup(IsoTpSettings::default());
    send(&mut wire.client, &[0x11; 7], TargetAddressType::Physical).unwrap();
    wire.run_until_received();
    let log = wire.bus.log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].1[0], 0x07);

    let mut wire = setup(IsoTpSettings::default());
    send(&mut wire.client, &[0x11; 8], TargetAddressType::Physical).unwrap();
    wire.run_until_received();
    let log = wire.bus.log();
    // FF from the sender, FC from the receiver, one CF
    assert_eq!(log.len(), 3);
    assert_eq!(&log[0].1[..2], &[0x10, 0x08]);
    assert_eq!(log[1].1[0] & 0xF0, 0x30);
    assert_eq!(log[2].1[0], 0x21);
}

#[test]
fn all_frames_are_padded_to_eight_bytes() {
    let mut wire = setup(IsoTpSettings::default());
    send(&mut wire.client, &[0x22; 10], TargetAddressType::Physical).unwrap();
    wire.run_until_received();
    for (_, frame) in wire.bus.log() {
        assert_eq!(frame.len(), 8);
    }
}

#[test]
fn consecutive_frame_sequence_numbers_wrap() {
    let mut wire = setup(IsoTpSettings::default());
    // 6 + 17 * 7 = 125 bytes: SNs run 1..15, 0, 1
    let payload = vec![0x33u8; 125];
    send(&mut wire.client, &payload, TargetAddressType::Physical).unwrap();
    wire.run_until_received();

    let sns: Vec<u8> = wire
        .bus
        .log()
        .iter()
        .filter(|(id, frame)| *id == 0x701 && frame[0] & 0xF0 == 0x20)
        .map(|(_, frame)| frame[0] & 0x0F)
        .collect();
    let expected: Vec<u8> = (1..=17).map(|k| (k % 16) as u8).collect();
    assert_eq!(sns, expected);
}

#[test]
fn block_size_paces_flow_control() {
    let settings = IsoTpSettings {
        block_size: 4,
        ..Default::default()
    };
    let mut wire = setup(settings);
    // 6 + 10 * 7 = 76 bytes: 10 CFs, so FCs after the FF and after blocks 4 and 8
    let payload = vec![0x44u8; 76];
    send(&mut wire.client, &payload, TargetAddressType::Physical).unwrap();
    wire.run_until_received();

    let fc_count = wire
        .bus
        .log()
        .iter()
        .filter(|(id, frame)| *id == 0x700 && frame[0] & 0xF0 == 0x30)
        .count();
    assert_eq!(fc_count, 3);
}

#[test]
fn st_min_is_honored_between_consecutive_frames() {
    let settings = IsoTpSettings {
        st_min: 5,
        ..Default::default()
    };
    let mut wire = setup(settings);
    send(&mut wire.client, &[0x55; 20], TargetAddressType::Physical).unwrap();

    // FF out, FC back
    wire.client.poll();
    wire.bus.deliver(&mut wire.client, &mut wire.server);
    wire.server.poll();
    wire.bus.deliver(&mut wire.client, &mut wire.server);

    let cf_count = |wire: &Wire| {
        wire.bus
            .log()
            .iter()
            .filter(|(id, frame)| *id == 0x701 && frame[0] & 0xF0 == 0x20)
            .count()
    };

    // STmin has not elapsed: no consecutive frame may be sent yet
    wire.clock.advance(1);
    wire.client.poll();
    let after_first = cf_count(&wire);
    assert_eq!(after_first, 1);
    wire.client.poll();
    assert_eq!(cf_count(&wire), 1);

    wire.clock.advance(6);
    wire.client.poll();
    assert_eq!(cf_count(&wire), 2);
}

#[test]
fn functional_requests_are_single_frame_only() {
    let mut wire = setup(IsoTpSettings::default());
    assert!(matches!(
        send(&mut wire.client, &[0x66; 8], TargetAddressType::Functional),
        Err(ChannelError::FunctionalPayloadTooLarge)
    ));

    send(&mut wire.client, &[0x3E, 0x80], TargetAddressType::Functional).unwrap();
    wire.bus.deliver(&mut wire.client, &mut wire.server);
    wire.server.poll();
    let (payload, info) = wire.server.peek().unwrap().unwrap();
    assert_eq!(payload, &[0x3E, 0x80]);
    assert_eq!(info.ta_type, TargetAddressType::Functional);
}

#[test]
fn send_reports_in_progress_until_complete() {
    let mut wire = setup(IsoTpSettings::default());
    send(&mut wire.client, &[0x77; 30], TargetAddressType::Physical).unwrap();
    assert!(wire.client.poll().contains(TpStatus::SEND_IN_PROGRESS));
    wire.run_until_received();
    assert!(!wire.client.poll().contains(TpStatus::SEND_IN_PROGRESS));
}

#[test]
fn second_send_while_in_progress_is_refused() {
    let mut wire = setup(IsoTpSettings::default());
    send(&mut wire.client, &[0x88; 30], TargetAddressType::Physical).unwrap();
    assert!(matches!(
        send(&mut wire.client, &[0x88; 30], TargetAddressType::Physical),
        Err(ChannelError::SendInProgress)
    ));
}

#[test]
fn oversized_payload_is_rejected() {
    let mut wire = setup(IsoTpSettings::default());
    let buf_len = wire.client.get_send_buf().unwrap().len();
    assert!(matches!(
        wire.client.send(buf_len + 1, &SduInfo::default()),
        Err(ChannelError::PayloadTooLarge(_))
    ));
}
