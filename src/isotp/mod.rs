//! ISO-TP (ISO15765-2) transport layer
//!
//! [IsoTpTransport] implements the [UdsTransport] contract over any CAN-like
//! bus that can carry 8 byte frames. The bus itself is abstracted behind the
//! single-method [CanBus] trait; received frames are handed to the transport
//! with [IsoTpTransport::on_can_frame].

use crate::{
    channel::{
        ChannelError, ChannelResult, SduInfo, TargetAddressType, TpStatus, UDS_TP_MTU,
        UdsTransport,
    },
    time::{Clock, StdClock},
};

mod link;

pub use link::{ISO_TP_PADDING_BYTE, IsoTpLink, IsoTpRecvStatus, IsoTpSendStatus};

/// Arbitration ID value for an unused address slot
pub const ISO_TP_NOOP_ADDR: u32 = 0xFFFF_FFFF;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
/// ISO-TP network layer protocol results
pub enum IsoTpError {
    /// Payload does not fit in the link buffer
    #[error("payload exceeds the link buffer")]
    Overflow,
    /// A multi-frame send is already running
    #[error("a transmission is already in progress")]
    InProgress,
    /// No flow control frame arrived within N_Bs
    #[error("timed out waiting for flow control (N_Bs)")]
    TimeoutBs,
    /// No consecutive frame arrived within N_Cr
    #[error("timed out waiting for consecutive frame (N_Cr)")]
    TimeoutCr,
    /// A consecutive frame carried an unexpected sequence number
    #[error("wrong consecutive frame sequence number")]
    WrongSn,
    /// A flow control frame carried a reserved flow status
    #[error("invalid flow status")]
    InvalidFlowStatus,
    /// A frame arrived that is not valid in the current link state
    #[error("unexpected PDU")]
    UnexpectedPdu,
    /// The receiver sent more wait frames than allowed
    #[error("flow control wait frame limit exceeded")]
    WaitFrameOverrun,
    /// The peer cannot buffer a payload of the announced size
    #[error("peer receive buffer overflow")]
    BufferOverflow,
    /// Writing a frame to the CAN bus failed
    #[error("CAN bus write failed")]
    BusWrite,
}

/// A frame-oriented network that can carry ISO-TP
///
/// Implementations write a single CAN frame (up to 8 data bytes) to the wire.
/// The write is expected to complete synchronously or be queued by the
/// controller; N_As/N_Ar supervision is left to the bus driver.
pub trait CanBus {
    /// Writes one frame with the given arbitration ID
    fn send_frame(&mut self, arbitration_id: u32, data: &[u8]) -> ChannelResult<()>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// ISO-TP configuration options
pub struct IsoTpSettings {
    /// Block size advertised in flow control frames (0 = no further FC)
    pub block_size: u8,
    /// Minimum separation time advertised in flow control frames
    pub st_min: u8,
    /// Maximum number of FC wait frames tolerated per block
    pub max_wait_frames: u8,
    /// N_Bs timeout (ms): maximum wait for a flow control frame
    pub bs_timeout_ms: u32,
    /// N_Cr timeout (ms): maximum wait for a consecutive frame
    pub cr_timeout_ms: u32,
    /// Pad frames up to 8 bytes with [ISO_TP_PADDING_BYTE]
    pub pad_frame: bool,
    /// Largest payload the link buffers (bytes)
    pub mtu: u16,
}

impl Default for IsoTpSettings {
    fn default() -> Self {
        Self {
            block_size: 8,
            st_min: 0,
            max_wait_frames: 1,
            bs_timeout_ms: 100,
            cr_timeout_ms: 100,
            pad_frame: true,
            mtu: UDS_TP_MTU as u16,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Arbitration IDs used by one endpoint of an ISO-TP connection
pub struct IsoTpAddressing {
    /// ID this endpoint transmits physical frames with
    pub tx_id: u32,
    /// ID this endpoint receives physical frames on
    pub rx_id: u32,
    /// ID this endpoint transmits functional (broadcast) frames with, or
    /// [ISO_TP_NOOP_ADDR]
    pub func_tx_id: u32,
    /// ID this endpoint receives functional frames on, or [ISO_TP_NOOP_ADDR]
    pub func_rx_id: u32,
}

impl IsoTpAddressing {
    /// Example server profile: replies at 0x700, listens physically at 0x701
    /// and functionally at 0x702
    pub fn example_server() -> Self {
        Self {
            tx_id: 0x700,
            rx_id: 0x701,
            func_tx_id: ISO_TP_NOOP_ADDR,
            func_rx_id: 0x702,
        }
    }

    /// Example client profile, mirroring [IsoTpAddressing::example_server]
    pub fn example_client() -> Self {
        Self {
            tx_id: 0x701,
            rx_id: 0x700,
            func_tx_id: 0x702,
            func_rx_id: ISO_TP_NOOP_ADDR,
        }
    }
}

/// [UdsTransport] implementation carrying SDUs over ISO-TP on a CAN bus
///
/// One transport owns a physical link and a functional link sharing the same
/// bus. The owner is responsible for feeding received frames in via
/// [IsoTpTransport::on_can_frame] and for polling the endpoint often enough
/// to honor STmin and the N_Bs/N_Cr timers.
pub struct IsoTpTransport {
    phys: IsoTpLink,
    func: IsoTpLink,
    bus: Box<dyn CanBus>,
    clock: Box<dyn Clock>,
    addressing: IsoTpAddressing,
    send_buf: Vec<u8>,
    peeked: Option<(Vec<u8>, SduInfo)>,
}

impl std::fmt::Debug for IsoTpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoTpTransport")
            .field("addressing", &self.addressing)
            .field("phys", &self.phys)
            .field("func", &self.func)
            .finish_non_exhaustive()
    }
}

impl IsoTpTransport {
    /// Creates a new transport over `bus` using the system clock
    pub fn new(bus: Box<dyn CanBus>, addressing: IsoTpAddressing, settings: IsoTpSettings) -> Self {
        Self::with_clock(bus, addressing, settings, Box::new(StdClock::new()))
    }

    /// Creates a new transport with a caller supplied clock
    pub fn with_clock(
        bus: Box<dyn CanBus>,
        addressing: IsoTpAddressing,
        settings: IsoTpSettings,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            phys: IsoTpLink::new(addressing.tx_id, settings),
            func: IsoTpLink::new(addressing.func_tx_id, settings),
            bus,
            clock,
            addressing,
            send_buf: vec![0; settings.mtu as usize],
            peeked: None,
        }
    }

    /// Feeds one received CAN frame into the transport.
    ///
    /// Frames whose arbitration ID matches neither the physical nor the
    /// functional receive address are ignored.
    pub fn on_can_frame(&mut self, arbitration_id: u32, data: &[u8]) {
        let now = self.clock.now_ms();
        if arbitration_id == self.addressing.rx_id {
            self.phys.on_can_frame(data, now, self.bus.as_mut());
        } else if arbitration_id == self.addressing.func_rx_id {
            self.func.on_can_frame(data, now, self.bus.as_mut());
        }
    }
}

impl UdsTransport for IsoTpTransport {
    fn get_send_buf(&mut self) -> ChannelResult<&mut [u8]> {
        Ok(&mut self.send_buf)
    }

    fn send(&mut self, len: usize, info: &SduInfo) -> ChannelResult<usize> {
        if len > self.send_buf.len() {
            return Err(ChannelError::PayloadTooLarge(len));
        }
        let now = self.clock.now_ms();
        let Self {
            phys,
            func,
            bus,
            send_buf,
            ..
        } = self;
        match info.ta_type {
            TargetAddressType::Functional => {
                // "The functional addressing is applied only to single frame
                // transmission" - ISO15765-2
                if len > 7 {
                    return Err(ChannelError::FunctionalPayloadTooLarge);
                }
                func.send(&send_buf[..len], now, bus.as_mut())?;
            }
            TargetAddressType::Physical => match phys.send(&send_buf[..len], now, bus.as_mut()) {
                Ok(()) => {}
                Err(IsoTpError::InProgress) => return Err(ChannelError::SendInProgress),
                Err(e) => return Err(ChannelError::Protocol(e)),
            },
        }
        Ok(len)
    }

    fn poll(&mut self) -> TpStatus {
        let now = self.clock.now_ms();
        let Self {
            phys, func, bus, ..
        } = self;
        phys.poll(now, bus.as_mut());
        func.poll(now, bus.as_mut());

        let mut status = TpStatus::empty();
        if self.phys.send_status() == IsoTpSendStatus::InProgress {
            status |= TpStatus::SEND_IN_PROGRESS;
        }
        if self.peeked.is_some() || self.phys.recv_full() || self.func.recv_full() {
            status |= TpStatus::RECV_COMPLETE;
        }
        status
    }

    fn peek(&mut self) -> ChannelResult<Option<(&[u8], SduInfo)>> {
        if self.peeked.is_none() {
            if let Some(payload) = self.phys.take_received() {
                let info = SduInfo {
                    source_addr: self.addressing.rx_id as u16,
                    target_addr: self.addressing.tx_id as u16,
                    ta_type: TargetAddressType::Physical,
                    ..Default::default()
                };
                self.peeked = Some((payload, info));
            } else if let Some(payload) = self.func.take_received() {
                let info = SduInfo {
                    source_addr: self.addressing.func_rx_id as u16,
                    target_addr: self.addressing.tx_id as u16,
                    ta_type: TargetAddressType::Functional,
                    ..Default::default()
                };
                self.peeked = Some((payload, info));
            }
        }
        Ok(self
            .peeked
            .as_ref()
            .map(|(payload, info)| (payload.as_slice(), *info)))
    }

    fn ack_recv(&mut self) {
        self.peeked = None;
    }
}
