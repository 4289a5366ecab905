//! ISO-TP (ISO15765-2) link engine
//!
//! One [IsoTpLink] frames outbound payloads of up to 4095 bytes into CAN
//! frames and reassembles inbound frames, enforcing block-size/STmin flow
//! control and the Bs/Cr protocol timers. The link owns its buffers; callers
//! copy reassembled payloads out with [IsoTpLink::take_received].

use log::{debug, warn};

use crate::{
    isotp::{CanBus, IsoTpError, IsoTpSettings},
    time::time_after,
};

// PCI frame types (high nibble of byte 0)
const PCI_SINGLE_FRAME: u8 = 0x00;
const PCI_FIRST_FRAME: u8 = 0x10;
const PCI_CONSECUTIVE_FRAME: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

// Flow status values carried in the low nibble of a flow control frame
const FLOW_STATUS_CONTINUE: u8 = 0x00;
const FLOW_STATUS_WAIT: u8 = 0x01;
const FLOW_STATUS_OVERFLOW: u8 = 0x02;

/// Byte used to pad frames up to 8 bytes when padding is enabled
pub const ISO_TP_PADDING_BYTE: u8 = 0xCC;

// Sentinel block size meaning "no further flow control expected"
const INVALID_BS: u16 = 0xFFFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// State of the link's transmitter
pub enum IsoTpSendStatus {
    /// No send active
    Idle,
    /// A multi-frame send is being transmitted
    InProgress,
    /// The last send failed. Cleared by the next send
    Error,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// State of the link's receiver
pub enum IsoTpRecvStatus {
    /// Nothing being received
    Idle,
    /// A multi-frame reception is in progress
    InProgress,
    /// A complete payload is buffered and can be taken
    Full,
}

/// Converts a received STmin byte to the millisecond gap the sender must honor
fn st_min_to_ms(st_min: u8) -> u32 {
    if (0xF1..=0xF9).contains(&st_min) {
        // 100..900us range, round up to the millisecond clock resolution
        1
    } else if st_min <= 0x7F {
        st_min as u32
    } else {
        // reserved values are treated as the maximum
        0x7F
    }
}

#[derive(Debug)]
/// A single direction-pair ISO-TP link bound to one outgoing arbitration ID
pub struct IsoTpLink {
    tx_id: u32,
    settings: IsoTpSettings,

    // transmitter
    send_buf: Vec<u8>,
    send_size: usize,
    send_offset: usize,
    send_sn: u8,
    send_bs_remain: u16,
    send_st_min_ms: u32,
    send_wtf_count: u8,
    send_timer_st: u32,
    send_timer_bs: u32,
    send_status: IsoTpSendStatus,
    send_error: Option<IsoTpError>,

    // receiver
    recv_buf: Vec<u8>,
    recv_size: usize,
    recv_offset: usize,
    recv_sn: u8,
    recv_bs_count: u8,
    recv_timer_cr: u32,
    recv_status: IsoTpRecvStatus,
    recv_error: Option<IsoTpError>,
}

impl IsoTpLink {
    /// Creates a new link. `tx_id` is the arbitration ID used for every frame
    /// this link emits (data frames when sending, flow control when receiving).
    pub fn new(tx_id: u32, settings: IsoTpSettings) -> Self {
        Self {
            tx_id,
            settings,
            send_buf: vec![0; settings.mtu as usize],
            send_size: 0,
            send_offset: 0,
            send_sn: 0,
            send_bs_remain: 0,
            send_st_min_ms: 0,
            send_wtf_count: 0,
            send_timer_st: 0,
            send_timer_bs: 0,
            send_status: IsoTpSendStatus::Idle,
            send_error: None,
            recv_buf: vec![0; settings.mtu as usize],
            recv_size: 0,
            recv_offset: 0,
            recv_sn: 0,
            recv_bs_count: 0,
            recv_timer_cr: 0,
            recv_status: IsoTpRecvStatus::Idle,
            recv_error: None,
        }
    }

    /// Current transmitter status
    pub fn send_status(&self) -> IsoTpSendStatus {
        self.send_status
    }

    /// Protocol result of the last failed send
    pub fn send_error(&self) -> Option<IsoTpError> {
        self.send_error
    }

    /// Protocol result of the last failed reception
    pub fn recv_error(&self) -> Option<IsoTpError> {
        self.recv_error
    }

    /// Returns true if a complete payload is waiting to be taken
    pub fn recv_full(&self) -> bool {
        self.recv_status == IsoTpRecvStatus::Full
    }

    /// Takes the reassembled payload out of the link, freeing the receiver
    pub fn take_received(&mut self) -> Option<Vec<u8>> {
        if self.recv_status != IsoTpRecvStatus::Full {
            return None;
        }
        let payload = self.recv_buf[..self.recv_size].to_vec();
        self.recv_status = IsoTpRecvStatus::Idle;
        self.recv_size = 0;
        self.recv_offset = 0;
        Some(payload)
    }

    /// Queues a payload for transmission.
    ///
    /// Payloads of up to 7 bytes go out as a single frame before this call
    /// returns. Longer payloads start a multi-frame transfer that is advanced
    /// by [IsoTpLink::poll]; completion is signalled by [IsoTpLink::send_status]
    /// returning to [IsoTpSendStatus::Idle].
    pub fn send(
        &mut self,
        payload: &[u8],
        now: u32,
        bus: &mut dyn CanBus,
    ) -> Result<(), IsoTpError> {
        if payload.len() > self.send_buf.len() {
            return Err(IsoTpError::Overflow);
        }
        if self.send_status == IsoTpSendStatus::InProgress {
            return Err(IsoTpError::InProgress);
        }
        self.send_error = None;
        self.send_buf[..payload.len()].copy_from_slice(payload);
        self.send_size = payload.len();
        self.send_offset = 0;

        if payload.len() <= 7 {
            self.send_single_frame(bus)?;
            self.send_status = IsoTpSendStatus::Idle;
            return Ok(());
        }

        self.send_first_frame(bus)?;
        self.send_sn = 1;
        self.send_offset = 6;
        self.send_bs_remain = 0;
        self.send_st_min_ms = 0;
        self.send_wtf_count = 0;
        self.send_timer_st = now;
        self.send_timer_bs = now.wrapping_add(self.settings.bs_timeout_ms);
        self.send_status = IsoTpSendStatus::InProgress;
        Ok(())
    }

    /// Advances the transmitter: emits at most one consecutive frame per call
    /// (honoring STmin) and checks the Bs and Cr timers.
    pub fn poll(&mut self, now: u32, bus: &mut dyn CanBus) {
        if self.send_status == IsoTpSendStatus::InProgress {
            let bs_available = self.send_bs_remain == INVALID_BS || self.send_bs_remain > 0;
            let st_elapsed = self.send_st_min_ms == 0 || time_after(now, self.send_timer_st);
            if bs_available && st_elapsed {
                if let Err(e) = self.send_consecutive_frame(bus) {
                    self.fail_send(e);
                } else {
                    if self.send_bs_remain != INVALID_BS {
                        self.send_bs_remain -= 1;
                    }
                    self.send_timer_st = now.wrapping_add(self.send_st_min_ms);
                    self.send_timer_bs = now.wrapping_add(self.settings.bs_timeout_ms);
                    if self.send_offset >= self.send_size {
                        debug!("ISO-TP send of {} bytes complete", self.send_size);
                        self.send_status = IsoTpSendStatus::Idle;
                    }
                }
            } else if self.send_bs_remain == 0 && time_after(now, self.send_timer_bs) {
                // no flow control arrived within N_Bs
                self.fail_send(IsoTpError::TimeoutBs);
            }
        }

        if self.recv_status == IsoTpRecvStatus::InProgress && time_after(now, self.recv_timer_cr) {
            warn!("ISO-TP reception timed out waiting for consecutive frame");
            self.recv_error = Some(IsoTpError::TimeoutCr);
            self.recv_status = IsoTpRecvStatus::Idle;
        }
    }

    /// Feeds one received CAN frame into the link
    pub fn on_can_frame(&mut self, data: &[u8], now: u32, bus: &mut dyn CanBus) {
        let Some(&pci) = data.first() else {
            warn!("ISO-TP frame with empty payload ignored");
            return;
        };
        match pci & 0xF0 {
            PCI_SINGLE_FRAME => self.on_single_frame(data),
            PCI_FIRST_FRAME => self.on_first_frame(data, now, bus),
            PCI_CONSECUTIVE_FRAME => self.on_consecutive_frame(data, now, bus),
            PCI_FLOW_CONTROL => self.on_flow_control(data, now),
            _ => warn!("invalid ISO-TP PCI type 0x{:02X}", pci >> 4),
        }
    }

    fn fail_send(&mut self, e: IsoTpError) {
        warn!("ISO-TP send failed: {e}");
        self.send_error = Some(e);
        self.send_status = IsoTpSendStatus::Error;
    }

    fn write_frame(&self, bus: &mut dyn CanBus, frame: &mut Vec<u8>) -> Result<(), IsoTpError> {
        if self.settings.pad_frame {
            frame.resize(8, ISO_TP_PADDING_BYTE);
        }
        bus.send_frame(self.tx_id, frame)
            .map_err(|_| IsoTpError::BusWrite)
    }

    fn send_single_frame(&mut self, bus: &mut dyn CanBus) -> Result<(), IsoTpError> {
        let mut frame = Vec::with_capacity(8);
        frame.push(PCI_SINGLE_FRAME | self.send_size as u8);
        frame.extend_from_slice(&self.send_buf[..self.send_size]);
        self.write_frame(bus, &mut frame)
    }

    fn send_first_frame(&mut self, bus: &mut dyn CanBus) -> Result<(), IsoTpError> {
        let mut frame = Vec::with_capacity(8);
        frame.push(PCI_FIRST_FRAME | ((self.send_size >> 8) & 0x0F) as u8);
        frame.push(self.send_size as u8);
        frame.extend_from_slice(&self.send_buf[..6]);
        self.write_frame(bus, &mut frame)
    }

    fn send_consecutive_frame(&mut self, bus: &mut dyn CanBus) -> Result<(), IsoTpError> {
        let chunk = (self.send_size - self.send_offset).min(7);
        let mut frame = Vec::with_capacity(8);
        frame.push(PCI_CONSECUTIVE_FRAME | self.send_sn);
        frame.extend_from_slice(&self.send_buf[self.send_offset..self.send_offset + chunk]);
        self.write_frame(bus, &mut frame)?;
        self.send_sn = (self.send_sn + 1) % 16;
        self.send_offset += chunk;
        Ok(())
    }

    fn send_flow_control(
        &mut self,
        flow_status: u8,
        block_size: u8,
        st_min: u8,
        bus: &mut dyn CanBus,
    ) -> Result<(), IsoTpError> {
        let mut frame = vec![PCI_FLOW_CONTROL | flow_status, block_size, st_min];
        self.write_frame(bus, &mut frame)
    }

    fn on_single_frame(&mut self, data: &[u8]) {
        if self.recv_status == IsoTpRecvStatus::InProgress {
            warn!("single frame interrupts multi-frame reception");
            self.recv_error = Some(IsoTpError::UnexpectedPdu);
        }
        let len = (data[0] & 0x0F) as usize;
        if len + 1 > data.len() || len > 7 {
            warn!("malformed ISO-TP single frame: {data:02X?}");
            return;
        }
        self.recv_buf[..len].copy_from_slice(&data[1..1 + len]);
        self.recv_size = len;
        self.recv_offset = len;
        self.recv_error = None;
        self.recv_status = IsoTpRecvStatus::Full;
        debug!("ISO-TP received single frame of {len} bytes");
    }

    fn on_first_frame(&mut self, data: &[u8], now: u32, bus: &mut dyn CanBus) {
        if data.len() < 8 {
            warn!("malformed ISO-TP first frame: {data:02X?}");
            return;
        }
        let len = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
        if len <= 7 {
            // a payload this small must use a single frame
            warn!("first frame with single-frame length {len} ignored");
            return;
        }
        if len > self.recv_buf.len() {
            let _ = self.send_flow_control(FLOW_STATUS_OVERFLOW, 0, 0, bus);
            self.recv_error = Some(IsoTpError::BufferOverflow);
            self.recv_status = IsoTpRecvStatus::Idle;
            return;
        }
        self.recv_buf[..6].copy_from_slice(&data[2..8]);
        self.recv_size = len;
        self.recv_offset = 6;
        self.recv_sn = 1;
        self.recv_error = None;
        self.recv_bs_count = self.settings.block_size;
        self.recv_status = IsoTpRecvStatus::InProgress;
        self.recv_timer_cr = now.wrapping_add(self.settings.cr_timeout_ms);
        let (bs, st) = (self.settings.block_size, self.settings.st_min);
        if self.send_flow_control(FLOW_STATUS_CONTINUE, bs, st, bus).is_err() {
            warn!("failed to answer first frame with flow control");
            self.recv_status = IsoTpRecvStatus::Idle;
        }
    }

    fn on_consecutive_frame(&mut self, data: &[u8], now: u32, bus: &mut dyn CanBus) {
        if self.recv_status != IsoTpRecvStatus::InProgress {
            self.recv_error = Some(IsoTpError::UnexpectedPdu);
            return;
        }
        self.recv_timer_cr = now.wrapping_add(self.settings.cr_timeout_ms);

        let sn = data[0] & 0x0F;
        if sn != self.recv_sn {
            warn!("ISO-TP sequence error: expected SN {}, got {sn}", self.recv_sn);
            self.recv_error = Some(IsoTpError::WrongSn);
            self.recv_status = IsoTpRecvStatus::Idle;
            return;
        }

        let remaining = self.recv_size - self.recv_offset;
        let chunk = remaining.min(7);
        if data.len() < 1 + chunk {
            warn!("ISO-TP consecutive frame too short: {data:02X?}");
            self.recv_error = Some(IsoTpError::UnexpectedPdu);
            self.recv_status = IsoTpRecvStatus::Idle;
            return;
        }
        self.recv_buf[self.recv_offset..self.recv_offset + chunk]
            .copy_from_slice(&data[1..1 + chunk]);
        self.recv_offset += chunk;
        self.recv_sn = (self.recv_sn + 1) % 16;

        if self.recv_offset >= self.recv_size {
            debug!("ISO-TP reassembled {} bytes", self.recv_size);
            self.recv_status = IsoTpRecvStatus::Full;
        } else if self.settings.block_size != 0 {
            self.recv_bs_count -= 1;
            if self.recv_bs_count == 0 {
                self.recv_bs_count = self.settings.block_size;
                let (bs, st) = (self.settings.block_size, self.settings.st_min);
                if self.send_flow_control(FLOW_STATUS_CONTINUE, bs, st, bus).is_err() {
                    warn!("failed to send block flow control");
                    self.recv_status = IsoTpRecvStatus::Idle;
                }
            }
        }
    }

    fn on_flow_control(&mut self, data: &[u8], now: u32) {
        if self.send_status != IsoTpSendStatus::InProgress {
            return;
        }
        if data.len() < 3 {
            self.fail_send(IsoTpError::UnexpectedPdu);
            return;
        }
        self.send_timer_bs = now.wrapping_add(self.settings.bs_timeout_ms);
        match data[0] & 0x0F {
            FLOW_STATUS_CONTINUE => {
                let bs = data[1];
                self.send_bs_remain = if bs == 0 { INVALID_BS } else { bs as u16 };
                self.send_st_min_ms = st_min_to_ms(data[2]);
                self.send_wtf_count = 0;
            }
            FLOW_STATUS_WAIT => {
                self.send_wtf_count += 1;
                if self.send_wtf_count > self.settings.max_wait_frames {
                    self.fail_send(IsoTpError::WaitFrameOverrun);
                }
            }
            FLOW_STATUS_OVERFLOW => self.fail_send(IsoTpError::BufferOverflow),
            _ => self.fail_send(IsoTpError::InvalidFlowStatus),
        }
    }
}

/// Helper for implementing [CanBus] over a closure in unit tests
#[cfg(test)]
pub(crate) struct FnBus<F: FnMut(u32, &[u8])>(pub F);

#[cfg(test)]
impl<F: FnMut(u32, &[u8])> CanBus for FnBus<F> {
    fn send_frame(&mut self, arbitration_id: u32, data: &[u8]) -> crate::channel::ChannelResult<()> {
        (self.0)(arbitration_id, data);
        Ok(())
    }
}
