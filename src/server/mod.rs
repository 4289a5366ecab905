//! UDS (ISO14229) server endpoint
//!
//! [UdsServer] is the ECU side of a diagnostic connection. It is driven
//! entirely by [UdsServer::poll]: each call advances the session, reset and
//! security timers, then processes at most one complete request from the
//! transport, dispatching it to the per-service handlers in this module and
//! emitting [ServerEvent]s to the application.

use log::{debug, warn};

use crate::{
    channel::{SduInfo, TargetAddressType, TpStatus, UdsTransport},
    time::{Clock, StdClock, time_after},
    uds::{NEGATIVE_RESPONSE_SID, UdsError, UdsSessionType, XFER_MAX_BLOCK_LENGTH},
};

mod events;
mod services;

pub use events::{
    EventResult, ResponseWriter, ServerEvent, UdsServerHandler, UdsVoidHandler,
};

/// A positive handler outcome, as carried on the wire (0x00)
pub(crate) const POSITIVE_RESPONSE: u8 = 0x00;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// UDS server timing and policy options
pub struct UdsServerOptions {
    /// P2 timing advertised in session control responses (ms)
    pub p2_ms: u16,
    /// Enhanced (NRC 0x78) P2* timing; also paces repeated 0x78 responses (ms)
    pub p2_star_ms: u32,
    /// S3 session timeout (ms)
    pub s3_ms: u32,
    /// Default power down time for scheduled ECU resets (ms)
    pub power_down_time_ms: u32,
    /// Time after boot before SecurityAccess requests are accepted (ms)
    pub sec_access_boot_delay_ms: u32,
    /// Lockout after a rejected SecurityAccess key (ms)
    pub sec_access_auth_fail_delay_ms: u32,
    /// Default maxNumberOfBlockLength advertised in RequestDownload and
    /// RequestUpload responses
    pub xfer_max_block_length: u16,
}

impl Default for UdsServerOptions {
    fn default() -> Self {
        Self {
            p2_ms: 50,
            p2_star_ms: 2000,
            s3_ms: 3000,
            power_down_time_ms: 10,
            sec_access_boot_delay_ms: 1000,
            sec_access_auth_fail_delay_ms: 1000,
            xfer_max_block_length: XFER_MAX_BLOCK_LENGTH,
        }
    }
}

#[derive(Debug, Default)]
/// Context of the request currently being processed
pub(crate) struct UdsRequest {
    pub recv_buf: Vec<u8>,
    pub send_buf: Vec<u8>,
    pub send_buf_size: usize,
    pub info: SduInfo,
}

impl UdsRequest {
    /// Frames a negative response and returns its NRC byte
    pub fn negative_response(&mut self, code: UdsError) -> u8 {
        let nrc = u8::from(code);
        self.send_buf.clear();
        self.send_buf.push(NEGATIVE_RESPONSE_SID);
        self.send_buf.push(self.recv_buf[0]);
        self.send_buf.push(nrc);
        nrc
    }

    /// Discards any framed response, suppressing transmission
    pub fn no_response(&mut self) {
        self.send_buf.clear();
    }
}

/// The server half of a UDS endpoint pair
pub struct UdsServer {
    tp: Box<dyn UdsTransport>,
    handler: Box<dyn UdsServerHandler>,
    clock: Box<dyn Clock>,
    options: UdsServerOptions,

    session_type: UdsSessionType,
    security_level: u8,
    s3_timer: u32,
    p2_timer: u32,
    sec_access_boot_delay_timer: u32,
    sec_access_auth_fail_timer: u32,
    ecu_reset_scheduled: Option<u8>,
    ecu_reset_timer: u32,

    xfer_is_active: bool,
    xfer_block_sequence_counter: u8,
    xfer_total_bytes: usize,
    xfer_byte_counter: usize,
    xfer_block_length: u16,

    rcrrp: bool,
    request_in_progress: bool,
    not_ready_to_receive: bool,

    req: UdsRequest,
}

impl std::fmt::Debug for UdsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsServer")
            .field("session_type", &self.session_type)
            .field("security_level", &self.security_level)
            .field("xfer_is_active", &self.xfer_is_active)
            .finish_non_exhaustive()
    }
}

impl UdsServer {
    /// Creates a new server over the given transport, using the system clock
    pub fn new(
        tp: Box<dyn UdsTransport>,
        handler: Box<dyn UdsServerHandler>,
        options: UdsServerOptions,
    ) -> Self {
        Self::with_clock(tp, handler, options, Box::new(StdClock::new()))
    }

    /// Creates a new server with a caller supplied clock
    pub fn with_clock(
        tp: Box<dyn UdsTransport>,
        handler: Box<dyn UdsServerHandler>,
        options: UdsServerOptions,
        clock: Box<dyn Clock>,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            tp,
            handler,
            clock,
            options,
            session_type: UdsSessionType::Default,
            security_level: 0,
            s3_timer: now.wrapping_add(options.s3_ms),
            p2_timer: now,
            sec_access_boot_delay_timer: now.wrapping_add(options.sec_access_boot_delay_ms),
            sec_access_auth_fail_timer: now.wrapping_sub(1),
            ecu_reset_scheduled: None,
            ecu_reset_timer: now,
            xfer_is_active: false,
            xfer_block_sequence_counter: 1,
            xfer_total_bytes: 0,
            xfer_byte_counter: 0,
            xfer_block_length: 0,
            rcrrp: false,
            request_in_progress: false,
            not_ready_to_receive: false,
            req: UdsRequest::default(),
        }
    }

    /// Re-initializes the protocol state, as after a scheduled reset has been
    /// performed. The transport, handler and options are kept.
    pub fn reinit(&mut self) {
        let now = self.clock.now_ms();
        self.session_type = UdsSessionType::Default;
        self.security_level = 0;
        self.s3_timer = now.wrapping_add(self.options.s3_ms);
        self.sec_access_boot_delay_timer = now.wrapping_add(self.options.sec_access_boot_delay_ms);
        self.sec_access_auth_fail_timer = now.wrapping_sub(1);
        self.ecu_reset_scheduled = None;
        self.rcrrp = false;
        self.request_in_progress = false;
        self.not_ready_to_receive = false;
        self.reset_transfer();
    }

    /// Currently active diagnostic session
    pub fn session_type(&self) -> UdsSessionType {
        self.session_type
    }

    /// Currently unlocked security level (0 = locked)
    pub fn security_level(&self) -> u8 {
        self.security_level
    }

    /// Returns true while a download or upload transfer is open
    pub fn transfer_active(&self) -> bool {
        self.xfer_is_active
    }

    /// Access to the underlying transport (e.g. to feed CAN frames into an
    /// ISO-TP transport)
    pub fn transport_mut(&mut self) -> &mut dyn UdsTransport {
        self.tp.as_mut()
    }

    /// Drives the server. Call periodically; see the crate documentation for
    /// poll rate requirements.
    pub fn poll(&mut self) {
        let now = self.clock.now_ms();

        if self.session_type != UdsSessionType::Default && time_after(now, self.s3_timer) {
            debug!("S3 timeout: reverting to default session");
            self.session_type = UdsSessionType::Default;
            self.security_level = 0;
            self.reset_transfer();
            let _ = self.handler.handle_event(ServerEvent::SessionTimeout);
        }

        if let Some(reset_type) = self.ecu_reset_scheduled {
            if time_after(now, self.ecu_reset_timer) {
                self.ecu_reset_scheduled = None;
                let _ = self
                    .handler
                    .handle_event(ServerEvent::DoScheduledReset { reset_type });
            }
        }

        let status = self.tp.poll();
        if !status.contains(TpStatus::RECV_COMPLETE) || self.not_ready_to_receive {
            return;
        }

        if !self.request_in_progress {
            let capacity = match self.tp.get_send_buf() {
                Ok(buf) => buf.len(),
                Err(e) => {
                    warn!("transport send buffer unavailable: {e}");
                    return;
                }
            };
            match self.tp.peek() {
                Ok(Some((payload, info))) if !payload.is_empty() => {
                    self.req.recv_buf.clear();
                    self.req.recv_buf.extend_from_slice(payload);
                    self.req.send_buf.clear();
                    self.req.send_buf_size = capacity;
                    self.req.info = info;
                    self.request_in_progress = true;
                }
                Ok(Some(_)) => {
                    self.tp.ack_recv();
                    return;
                }
                Ok(None) => return,
                Err(e) => {
                    warn!("transport peek failed: {e}");
                    return;
                }
            }
        }

        let mut req = std::mem::take(&mut self.req);
        let response_code = self.evaluate_service_response(&mut req);
        let now = self.clock.now_ms();

        if response_code == u8::from(UdsError::RequestCorrectlyReceivedResponsePending) {
            // the inbound SDU stays pinned and the handler will be re-entered
            // on the next poll; 0x78 re-sends are paced by the P2* timer
            let first = !self.rcrrp;
            self.rcrrp = true;
            if first || time_after(now, self.p2_timer) {
                self.send_response(&req);
                self.p2_timer = now.wrapping_add(self.options.p2_star_ms);
            }
        } else {
            self.rcrrp = false;
            self.request_in_progress = false;
            if !req.send_buf.is_empty() {
                self.send_response(&req);
            }
            self.tp.ack_recv();
            if self.session_type != UdsSessionType::Default {
                self.s3_timer = now.wrapping_add(self.options.s3_ms);
            }
        }
        self.req = req;
    }

    fn send_response(&mut self, req: &UdsRequest) {
        let info = SduInfo {
            mtype: req.info.mtype,
            source_addr: req.info.target_addr,
            target_addr: req.info.source_addr,
            ta_type: TargetAddressType::Physical,
            remote_addr: req.info.remote_addr,
        };
        match self.tp.get_send_buf() {
            Ok(buf) if req.send_buf.len() <= buf.len() => {
                buf[..req.send_buf.len()].copy_from_slice(&req.send_buf);
                if let Err(e) = self.tp.send(req.send_buf.len(), &info) {
                    warn!("failed to send response: {e}");
                }
            }
            Ok(_) => warn!("response does not fit in the transport send buffer"),
            Err(e) => warn!("transport send buffer unavailable: {e}"),
        }
    }

    pub(crate) fn emit(&mut self, event: ServerEvent<'_>) -> u8 {
        match self.handler.handle_event(event) {
            Ok(()) => POSITIVE_RESPONSE,
            Err(e) => e.into(),
        }
    }

    pub(crate) fn reset_transfer(&mut self) {
        self.xfer_block_sequence_counter = 1;
        self.xfer_byte_counter = 0;
        self.xfer_total_bytes = 0;
        self.xfer_block_length = 0;
        self.xfer_is_active = false;
    }
}
