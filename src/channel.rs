
//! Module for the transport layer boundary between a UDS endpoint and the network
//!
//! A [UdsTransport] hands complete service data units (SDUs) of up to
//! [UDS_TP_MTU] bytes between an endpoint state machine and whatever carries
//! them on the wire. Two implementations ship with this crate:
//! * [crate::isotp::IsoTpTransport] - ISO15765-2 segmentation over a CAN bus
//! * [crate::sim::SimTransport] - in-memory transport for testing

use crate::isotp::IsoTpError;

/// ISO-TP maximum transmissible unit (ISO15765-2:2004 section 5.3.3)
pub const UDS_TP_MTU: usize = 4095;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// The payload does not fit in the channel's send buffer
    #[error("payload of {0} bytes exceeds the transport MTU")]
    PayloadTooLarge(usize),
    /// Functionally addressed messages must fit in a single frame
    #[error("functional addressing is restricted to single frame payloads")]
    FunctionalPayloadTooLarge,
    /// A previous send has not yet completed
    #[error("a send is already in progress")]
    SendInProgress,
    /// ISO-TP protocol fault on the underlying link
    #[error("ISO-TP protocol fault: {0}")]
    Protocol(#[from] IsoTpError),
    /// Underlying IO error with the channel
    #[error("IO error: {0}")]
    IOError(#[from] std::sync::Arc<std::io::Error>),
    /// The interface is not open
    #[error("channel's interface is not open")]
    InterfaceNotOpen,
}

bitflags::bitflags! {
    /// Non-blocking transport status reported by [UdsTransport::poll]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TpStatus: u32 {
        /// A multi-frame send is still being transmitted
        const SEND_IN_PROGRESS = 0x01;
        /// A complete SDU has been reassembled and can be peeked
        const RECV_COMPLETE = 0x02;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
/// Application layer message type of an SDU
pub enum UdsMessageType {
    /// Plain diagnostics
    #[default]
    Diag,
    /// Remote diagnostics
    RemoteDiag,
    /// Secured diagnostics
    SecureDiag,
    /// Secured remote diagnostics
    SecureRemoteDiag,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
/// Target addressing scheme of an SDU
pub enum TargetAddressType {
    /// Unicast (1:1)
    #[default]
    Physical,
    /// Multicast (1:N). Only valid for single frame payloads
    Functional,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
/// Addressing envelope exchanged with the transport alongside each payload
pub struct SduInfo {
    /// Message type
    pub mtype: UdsMessageType,
    /// Application source address
    pub source_addr: u16,
    /// Application target address
    pub target_addr: u16,
    /// Target address type (physical or functional)
    pub ta_type: TargetAddressType,
    /// Application layer remote address
    pub remote_addr: u16,
}

/// Interface to the transport layer (OSI layer 4)
///
/// The transport owns its buffers. A caller fills the send buffer obtained
/// from [UdsTransport::get_send_buf], then commits it with
/// [UdsTransport::send]; the slice returned by [UdsTransport::peek] stays
/// valid and unchanged until [UdsTransport::ack_recv] releases it.
pub trait UdsTransport {
    /// Returns the transport's writable send buffer.
    ///
    /// The caller writes the outgoing SDU at offset 0, then commits it with
    /// [UdsTransport::send]. The buffer length is the largest payload this
    /// transport can carry.
    fn get_send_buf(&mut self) -> ChannelResult<&mut [u8]>;

    /// Sends the first `len` bytes of the send buffer as one SDU.
    ///
    /// ## Returns
    /// * `Ok(len)` - the payload was accepted. Single frame payloads may
    ///   complete synchronously; multi-frame sends complete asynchronously and
    ///   require [UdsTransport::poll] to be called until
    ///   [TpStatus::SEND_IN_PROGRESS] clears.
    /// * `Ok(0)` - the payload was enqueued but is not yet on the wire.
    /// * `Err(_)` - transport error, terminal for this SDU.
    fn send(&mut self, len: usize, info: &SduInfo) -> ChannelResult<usize>;

    /// Polls the transport. Non-blocking; must be called periodically so the
    /// transport can run its own timers.
    fn poll(&mut self) -> TpStatus;

    /// Peeks at the oldest completely received SDU, if any.
    ///
    /// Repeated calls return the same SDU until [UdsTransport::ack_recv] is
    /// called.
    fn peek(&mut self) -> ChannelResult<Option<(&[u8], SduInfo)>>;

    /// Acknowledges the peeked SDU so the next one can be received.
    fn ack_recv(&mut self);
}
