//! UDS (ISO14229) client endpoint
//!
//! [UdsClient] is the tester side of a diagnostic connection. A request is
//! started with one of the `send_*` builders and then driven to completion by
//! calling [UdsClient::poll] until it reports [ClientPollState::Idle]; the
//! outcome is read from [UdsClient::error] and [UdsClient::response].

use std::{io::Read, sync::Arc};

use log::{debug, warn};

use crate::{
    channel::{SduInfo, TargetAddressType, TpStatus, UdsTransport},
    time::{Clock, StdClock, time_after},
    uds::{
        self, NEGATIVE_RESPONSE_SID, UdsCommand, UdsError, UdsResetType, UdsSessionType,
        CommunicationControlType, CommunicationType, RoutineControlType,
    },
};

pub mod sequence;

/// UDS client request result
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a client request
pub enum ClientError {
    /// Request failed without a more specific cause
    #[error("request failed")]
    General,
    /// No response arrived within P2 (or P2* after a pending response)
    #[error("request timed out")]
    Timeout,
    /// The server answered with a negative response and
    /// [RequestOptions::NEG_RESP_IS_ERR] was set
    #[error("server responded with NRC {0:?}")]
    NegativeResponse(UdsError),
    /// A response record did not carry the expected data identifier
    #[error("response DID does not match the request")]
    DidMismatch,
    /// The response SID did not match the request
    #[error("response SID does not match the request")]
    SidMismatch,
    /// The echoed sub-function did not match the request
    #[error("response sub-function does not match the request")]
    SubFunctionMismatch,
    /// Transport failure, terminal for the current request
    #[error("transport error: {0}")]
    Transport(#[from] crate::channel::ChannelError),
    /// Reading from a transfer data stream failed
    #[error("stream IO error: {0}")]
    FileIo(#[source] Arc<std::io::Error>),
    /// The response was shorter than the service's minimum
    #[error("response too short")]
    ResponseTooShort,
    /// The request does not fit in the transport send buffer
    #[error("request exceeds the send buffer")]
    BufferTooSmall,
    /// A request argument was invalid; nothing was sent
    #[error("invalid request argument")]
    InvalidArgument,
    /// A request is already in flight; nothing was sent
    #[error("client is busy with a previous request")]
    Busy,
}

bitflags::bitflags! {
    /// Per-request client behavior options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestOptions: u8 {
        /// Ask the server to suppress its positive response
        const SUPPRESS_POS_RESP = 0x01;
        /// Send with functional (broadcast) addressing; no response is awaited
        const FUNCTIONAL = 0x02;
        /// Treat a negative response as a request error
        const NEG_RESP_IS_ERR = 0x04;
        /// Keep the locally configured P2/P2* instead of adopting the timings
        /// from a session control response
        const IGNORE_SRV_TIMINGS = 0x08;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// UDS client timing options
pub struct UdsClientOptions {
    /// P2: response timeout (ms)
    pub p2_ms: u16,
    /// P2*: response timeout after an 0x78 pending response (ms)
    pub p2_star_ms: u32,
}

impl Default for UdsClientOptions {
    fn default() -> Self {
        Self {
            p2_ms: 150,
            p2_star_ms: 1500,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// Aggregate state reported by [UdsClient::poll]
pub enum ClientPollState {
    /// No request (or sequence step) is in flight
    Idle,
    /// A request or sequence is still being processed
    Running,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RequestState {
    Idle,
    Sending,
    AwaitSendComplete,
    AwaitResponse,
    ProcessResponse,
}

/// The tester half of a UDS endpoint pair
pub struct UdsClient {
    tp: Box<dyn UdsTransport>,
    clock: Box<dyn Clock>,

    p2_ms: u16,
    p2_star_ms: u32,
    p2_timer: u32,

    send_buf: Vec<u8>,
    send_buf_cap: usize,
    recv_buf: Vec<u8>,

    state: RequestState,
    err: Option<ClientError>,

    options: RequestOptions,
    default_options: RequestOptions,
    options_copy: RequestOptions,
}

impl std::fmt::Debug for UdsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsClient")
            .field("state", &self.state)
            .field("p2_ms", &self.p2_ms)
            .field("p2_star_ms", &self.p2_star_ms)
            .field("err", &self.err)
            .finish_non_exhaustive()
    }
}

impl UdsClient {
    /// Creates a new client over the given transport, using the system clock
    pub fn new(tp: Box<dyn UdsTransport>, options: UdsClientOptions) -> Self {
        Self::with_clock(tp, options, Box::new(StdClock::new()))
    }

    /// Creates a new client with a caller supplied clock
    pub fn with_clock(
        tp: Box<dyn UdsTransport>,
        options: UdsClientOptions,
        clock: Box<dyn Clock>,
    ) -> Self {
        let p2_star_ms = options.p2_star_ms.max(options.p2_ms as u32);
        Self {
            tp,
            clock,
            p2_ms: options.p2_ms,
            p2_star_ms,
            p2_timer: 0,
            send_buf: Vec::new(),
            send_buf_cap: 0,
            recv_buf: Vec::new(),
            state: RequestState::Idle,
            err: None,
            options: RequestOptions::empty(),
            default_options: RequestOptions::empty(),
            options_copy: RequestOptions::empty(),
        }
    }

    /// Options applied to requests that don't set their own
    pub fn set_default_options(&mut self, options: RequestOptions) {
        self.default_options = options;
    }

    /// Options for the next request only
    pub fn set_options(&mut self, options: RequestOptions) {
        self.options = options;
    }

    /// Error of the last completed request, if any
    pub fn error(&self) -> Option<&ClientError> {
        self.err.as_ref()
    }

    /// The last received response payload (starting at the response SID)
    pub fn response(&self) -> &[u8] {
        &self.recv_buf
    }

    /// Currently configured P2 timeout (ms)
    pub fn p2_ms(&self) -> u16 {
        self.p2_ms
    }

    /// Currently configured P2* timeout (ms)
    pub fn p2_star_ms(&self) -> u32 {
        self.p2_star_ms
    }

    /// Access to the underlying transport
    pub fn transport_mut(&mut self) -> &mut dyn UdsTransport {
        self.tp.as_mut()
    }

    /// Drives the request state machine. Returns
    /// [ClientPollState::Running] while a request is in flight.
    pub fn poll(&mut self) -> ClientPollState {
        self.poll_low_level();
        if self.err.is_some() || self.state == RequestState::Idle {
            ClientPollState::Idle
        } else {
            ClientPollState::Running
        }
    }

    fn change_state(&mut self, state: RequestState) {
        if state != self.state {
            debug!("client state: {:?} -> {:?}", self.state, state);
        }
        self.state = state;
    }

    fn fail(&mut self, err: ClientError) {
        warn!("client request failed: {err}");
        self.err = Some(err);
        self.change_state(RequestState::Idle);
    }

    fn poll_low_level(&mut self) {
        let tp_status = self.tp.poll();
        match self.state {
            RequestState::Idle => {
                self.options = self.default_options;
            }
            RequestState::Sending => {
                let ta_type = if self.options_copy.contains(RequestOptions::FUNCTIONAL) {
                    TargetAddressType::Functional
                } else {
                    TargetAddressType::Physical
                };
                let info = SduInfo {
                    ta_type,
                    ..Default::default()
                };
                let len = self.send_buf.len();
                let accepted = match self.tp.get_send_buf() {
                    Ok(buf) => {
                        buf[..len].copy_from_slice(&self.send_buf);
                        self.tp.send(len, &info)
                    }
                    Err(e) => Err(e),
                };
                match accepted {
                    Err(e) => self.fail(ClientError::Transport(e)),
                    Ok(0) => {} // enqueued, wait for the transport
                    Ok(n) if n == len => self.change_state(RequestState::AwaitSendComplete),
                    Ok(_) => self.fail(ClientError::BufferTooSmall),
                }
            }
            RequestState::AwaitSendComplete => {
                if self.options_copy.contains(RequestOptions::FUNCTIONAL) {
                    // functional requests are single frame and expect no response
                    self.change_state(RequestState::Idle);
                } else if !tp_status.contains(TpStatus::SEND_IN_PROGRESS) {
                    if self.options_copy.contains(RequestOptions::SUPPRESS_POS_RESP) {
                        self.change_state(RequestState::Idle);
                    } else {
                        self.change_state(RequestState::AwaitResponse);
                        self.p2_timer = self.clock.now_ms().wrapping_add(self.p2_ms as u32);
                    }
                }
            }
            RequestState::AwaitResponse => match self.tp.peek() {
                Err(e) => {
                    self.fail(ClientError::Transport(e));
                }
                Ok(None) => {
                    if time_after(self.clock.now_ms(), self.p2_timer) {
                        self.fail(ClientError::Timeout);
                    }
                }
                Ok(Some((payload, info))) => {
                    if info.ta_type == TargetAddressType::Functional {
                        // inbound functional traffic is not a response to us
                        self.tp.ack_recv();
                    } else {
                        self.recv_buf.clear();
                        self.recv_buf.extend_from_slice(payload);
                        self.tp.ack_recv();
                        self.change_state(RequestState::ProcessResponse);
                    }
                }
            },
            RequestState::ProcessResponse => match self.validate_response() {
                Ok(()) => self.handle_response(),
                Err(e) => self.fail(e),
            },
        }
    }

    /// Checks that the received payload is a plausible response to the request
    fn validate_response(&self) -> ClientResult<()> {
        if self.recv_buf.is_empty() {
            return Err(ClientError::ResponseTooShort);
        }

        if self.recv_buf[0] == NEGATIVE_RESPONSE_SID {
            if self.recv_buf.len() < uds::NEG_RESP_LEN {
                return Err(ClientError::ResponseTooShort);
            }
            if self.recv_buf[1] != self.send_buf[0] {
                return Err(ClientError::SidMismatch);
            }
            if self.recv_buf[2] == u8::from(UdsError::RequestCorrectlyReceivedResponsePending) {
                return Ok(());
            }
            if self.options_copy.contains(RequestOptions::NEG_RESP_IS_ERR) {
                return Err(ClientError::NegativeResponse(self.recv_buf[2].into()));
            }
            return Ok(());
        }

        let sent_sid = self.send_buf[0];
        if self.recv_buf[0] != uds::response_sid_of(sent_sid) {
            return Err(ClientError::SidMismatch);
        }
        if uds::is_sub_function_service(sent_sid) {
            // sub-function services echo the request sub-function (without the
            // suppress bit) in the first response parameter byte
            if self.recv_buf.len() < 2 || self.send_buf.len() < 2 {
                return Err(ClientError::ResponseTooShort);
            }
            if self.recv_buf[1] != self.send_buf[1] & 0x7F {
                return Err(ClientError::SubFunctionMismatch);
            }
        }
        Ok(())
    }

    /// Acts on a validated response
    fn handle_response(&mut self) {
        if self.recv_buf[0] == NEGATIVE_RESPONSE_SID {
            if self.recv_buf[2] == u8::from(UdsError::RequestCorrectlyReceivedResponsePending) {
                debug!("got RCRRP, extending response deadline by P2*");
                self.p2_timer = self.clock.now_ms().wrapping_add(self.p2_star_ms);
                self.recv_buf.clear();
                self.change_state(RequestState::AwaitResponse);
                return;
            }
            self.change_state(RequestState::Idle);
            return;
        }

        if uds::request_sid_of(self.recv_buf[0]) == UdsCommand::DiagnosticSessionControl as u8 {
            if self.recv_buf.len() < uds::X10_RESP_LEN {
                self.fail(ClientError::ResponseTooShort);
                return;
            }
            if !self.options_copy.contains(RequestOptions::IGNORE_SRV_TIMINGS) {
                let p2 = u16::from_be_bytes([self.recv_buf[2], self.recv_buf[3]]);
                let p2_star =
                    u16::from_be_bytes([self.recv_buf[4], self.recv_buf[5]]) as u32 * 10;
                debug!("adopting server timings: p2 {p2} ms, p2* {p2_star} ms");
                self.p2_ms = p2;
                self.p2_star_ms = p2_star;
            }
        }
        self.change_state(RequestState::Idle);
    }

    fn pre_request_check(&mut self) -> ClientResult<()> {
        if self.state != RequestState::Idle {
            return Err(ClientError::Busy);
        }
        self.err = None;
        self.recv_buf.clear();
        self.send_buf.clear();
        self.send_buf_cap = self
            .tp
            .get_send_buf()
            .map(|buf| buf.len())
            .map_err(ClientError::Transport)?;
        Ok(())
    }

    fn send_request(&mut self) -> ClientResult<()> {
        self.options_copy = self.options;
        if self.options_copy.contains(RequestOptions::SUPPRESS_POS_RESP) && self.send_buf.len() > 1
        {
            // UDS-1:2013 8.2.2 Table 11
            self.send_buf[1] |= 0x80;
        }
        self.change_state(RequestState::Sending);
        self.poll_low_level(); // begin sending immediately
        Ok(())
    }

    /// Sends a raw request payload
    pub fn send_bytes(&mut self, data: &[u8]) -> ClientResult<()> {
        if data.is_empty() {
            return Err(ClientError::InvalidArgument);
        }
        self.pre_request_check()?;
        if data.len() > self.send_buf_cap {
            return Err(ClientError::BufferTooSmall);
        }
        self.send_buf.extend_from_slice(data);
        self.send_request()
    }

    /// ECUReset (0x11)
    pub fn send_ecu_reset(&mut self, reset_type: UdsResetType) -> ClientResult<()> {
        self.pre_request_check()?;
        self.send_buf
            .extend_from_slice(&[UdsCommand::ECUReset as u8, reset_type.into()]);
        self.send_request()
    }

    /// DiagnosticSessionControl (0x10)
    pub fn send_diag_sess_ctrl(&mut self, mode: UdsSessionType) -> ClientResult<()> {
        self.pre_request_check()?;
        self.send_buf
            .extend_from_slice(&[UdsCommand::DiagnosticSessionControl as u8, mode.into()]);
        self.send_request()
    }

    /// CommunicationControl (0x28)
    pub fn send_comm_ctrl(
        &mut self,
        ctrl: CommunicationControlType,
        comm: CommunicationType,
    ) -> ClientResult<()> {
        self.pre_request_check()?;
        self.send_buf.extend_from_slice(&[
            UdsCommand::CommunicationControl as u8,
            ctrl as u8,
            comm as u8,
        ]);
        self.send_request()
    }

    /// TesterPresent (0x3E)
    pub fn send_tester_present(&mut self) -> ClientResult<()> {
        self.pre_request_check()?;
        self.send_buf
            .extend_from_slice(&[UdsCommand::TesterPresent as u8, 0x00]);
        self.send_request()
    }

    /// SecurityAccess (0x27) for the given level: odd levels request a seed,
    /// even levels send a key
    pub fn send_security_access(&mut self, level: u8, data: &[u8]) -> ClientResult<()> {
        if uds::security_access_level_is_reserved(level) {
            return Err(ClientError::InvalidArgument);
        }
        self.pre_request_check()?;
        if data.len() > self.send_buf_cap.saturating_sub(uds::X27_REQ_BASE_LEN) {
            return Err(ClientError::BufferTooSmall);
        }
        self.send_buf
            .extend_from_slice(&[UdsCommand::SecurityAccess as u8, level]);
        self.send_buf.extend_from_slice(data);
        self.send_request()
    }

    /// ReadDataByIdentifier (0x22) for one or more identifiers
    pub fn send_rdbi(&mut self, did_list: &[u16]) -> ClientResult<()> {
        if did_list.is_empty() {
            return Err(ClientError::InvalidArgument);
        }
        self.pre_request_check()?;
        if 1 + did_list.len() * 2 > self.send_buf_cap {
            return Err(ClientError::InvalidArgument);
        }
        self.send_buf.push(UdsCommand::ReadDataByIdentifier as u8);
        for did in did_list {
            self.send_buf.extend_from_slice(&did.to_be_bytes());
        }
        self.send_request()
    }

    /// WriteDataByIdentifier (0x2E)
    pub fn send_wdbi(&mut self, data_identifier: u16, data: &[u8]) -> ClientResult<()> {
        if data.is_empty() {
            return Err(ClientError::InvalidArgument);
        }
        self.pre_request_check()?;
        if data.len() > self.send_buf_cap.saturating_sub(uds::X2E_REQ_BASE_LEN) {
            return Err(ClientError::BufferTooSmall);
        }
        self.send_buf.push(UdsCommand::WriteDataByIdentifier as u8);
        self.send_buf
            .extend_from_slice(&data_identifier.to_be_bytes());
        self.send_buf.extend_from_slice(data);
        self.send_request()
    }

    /// RoutineControl (0x31)
    pub fn send_routine_ctrl(
        &mut self,
        ctrl: RoutineControlType,
        routine_identifier: u16,
        data: &[u8],
    ) -> ClientResult<()> {
        self.pre_request_check()?;
        if data.len() > self.send_buf_cap.saturating_sub(uds::X31_REQ_MIN_LEN) {
            return Err(ClientError::BufferTooSmall);
        }
        self.send_buf
            .extend_from_slice(&[UdsCommand::RoutineControl as u8, ctrl as u8]);
        self.send_buf
            .extend_from_slice(&routine_identifier.to_be_bytes());
        self.send_buf.extend_from_slice(data);
        self.send_request()
    }

    /// RequestDownload (0x34)
    pub fn send_request_download(
        &mut self,
        data_format_identifier: u8,
        address_and_length_format_identifier: u8,
        memory_address: usize,
        memory_size: usize,
    ) -> ClientResult<()> {
        self.pre_request_check()?;
        self.send_buf.extend_from_slice(&[
            UdsCommand::RequestDownload as u8,
            data_format_identifier,
            address_and_length_format_identifier,
        ]);
        uds::encode_address_and_length(
            address_and_length_format_identifier,
            memory_address,
            memory_size,
            &mut self.send_buf,
        );
        self.send_request()
    }

    /// RequestUpload (0x35)
    pub fn send_request_upload(
        &mut self,
        data_format_identifier: u8,
        address_and_length_format_identifier: u8,
        memory_address: usize,
        memory_size: usize,
    ) -> ClientResult<()> {
        self.pre_request_check()?;
        self.send_buf.extend_from_slice(&[
            UdsCommand::RequestUpload as u8,
            data_format_identifier,
            address_and_length_format_identifier,
        ]);
        uds::encode_address_and_length(
            address_and_length_format_identifier,
            memory_address,
            memory_size,
            &mut self.send_buf,
        );
        self.send_request()
    }

    /// TransferData (0x36) with an in-memory block
    pub fn send_transfer_data(
        &mut self,
        block_sequence_counter: u8,
        block_length: u16,
        data: &[u8],
    ) -> ClientResult<()> {
        // blockLength covers the SID and counter bytes too
        if block_length <= 2 || data.len() + 2 > block_length as usize {
            return Err(ClientError::InvalidArgument);
        }
        self.pre_request_check()?;
        self.send_buf
            .extend_from_slice(&[UdsCommand::TransferData as u8, block_sequence_counter]);
        self.send_buf.extend_from_slice(data);
        self.send_request()
    }

    /// TransferData (0x36) reading the block payload from a stream.
    ///
    /// Returns the number of bytes read; a return of `Ok(0)` means the stream
    /// is exhausted and nothing was sent.
    pub fn send_transfer_data_stream(
        &mut self,
        block_sequence_counter: u8,
        block_length: u16,
        source: &mut dyn Read,
    ) -> ClientResult<usize> {
        if block_length <= 2 {
            return Err(ClientError::InvalidArgument);
        }
        self.pre_request_check()?;
        if block_length as usize > self.send_buf_cap {
            return Err(ClientError::BufferTooSmall);
        }
        self.send_buf
            .extend_from_slice(&[UdsCommand::TransferData as u8, block_sequence_counter]);

        let mut chunk = vec![0u8; block_length as usize - uds::X36_REQ_BASE_LEN];
        let mut read = 0;
        loop {
            match source.read(&mut chunk[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ClientError::FileIo(Arc::new(e))),
            }
            if read == chunk.len() {
                break;
            }
        }
        if read == 0 {
            self.send_buf.clear();
            return Ok(0);
        }
        self.send_buf.extend_from_slice(&chunk[..read]);
        self.send_request()?;
        Ok(read)
    }

    /// RequestTransferExit (0x37)
    pub fn send_request_transfer_exit(&mut self) -> ClientResult<()> {
        self.pre_request_check()?;
        self.send_buf.push(UdsCommand::RequestTransferExit as u8);
        self.send_request()
    }

    /// ControlDTCSetting (0x85)
    pub fn send_ctrl_dtc_setting(
        &mut self,
        dtc_setting_type: u8,
        option_record: &[u8],
    ) -> ClientResult<()> {
        // 0x00, 0x7F and 0x03..=0x3F are reserved by ISO14229-1:2013 Table 128
        if dtc_setting_type == 0x00
            || dtc_setting_type == 0x7F
            || (0x03..=0x3F).contains(&dtc_setting_type)
        {
            return Err(ClientError::InvalidArgument);
        }
        self.pre_request_check()?;
        if option_record.len() > self.send_buf_cap.saturating_sub(uds::X85_REQ_BASE_LEN) {
            return Err(ClientError::BufferTooSmall);
        }
        self.send_buf
            .extend_from_slice(&[UdsCommand::ControlDTCSettings as u8, dtc_setting_type]);
        self.send_buf.extend_from_slice(option_record);
        self.send_request()
    }

    /// Extracts the record value for `did` from a ReadDataByIdentifier
    /// response.
    ///
    /// `offset` is a cursor into the response and should start at 0; it is
    /// advanced past the extracted record so repeated calls walk a
    /// multi-record response.
    pub fn unpack_rdbi_response<'a>(
        &'a self,
        did: u16,
        data_size: usize,
        offset: &mut usize,
    ) -> ClientResult<&'a [u8]> {
        if *offset == 0 {
            *offset = uds::X22_RESP_BASE_LEN;
        }
        if *offset + 2 > self.recv_buf.len() {
            return Err(ClientError::ResponseTooShort);
        }
        let their_did = u16::from_be_bytes([self.recv_buf[*offset], self.recv_buf[*offset + 1]]);
        if their_did != did {
            return Err(ClientError::DidMismatch);
        }
        if *offset + 2 + data_size > self.recv_buf.len() {
            return Err(ClientError::ResponseTooShort);
        }
        let data = &self.recv_buf[*offset + 2..*offset + 2 + data_size];
        *offset += 2 + data_size;
        Ok(data)
    }

    /// Parses a SecurityAccess (0x27) positive response
    pub fn unpack_security_access_response(&self) -> ClientResult<SecurityAccessResponse<'_>> {
        if self.recv_buf.first() != Some(&UdsCommand::SecurityAccess.response_sid()) {
            return Err(ClientError::SidMismatch);
        }
        if self.recv_buf.len() < uds::X27_RESP_BASE_LEN {
            return Err(ClientError::ResponseTooShort);
        }
        Ok(SecurityAccessResponse {
            security_access_type: self.recv_buf[1],
            seed: &self.recv_buf[uds::X27_RESP_BASE_LEN..],
        })
    }

    /// Parses a RoutineControl (0x31) positive response
    pub fn unpack_routine_control_response(&self) -> ClientResult<RoutineControlResponse<'_>> {
        if self.recv_buf.first() != Some(&UdsCommand::RoutineControl.response_sid()) {
            return Err(ClientError::SidMismatch);
        }
        if self.recv_buf.len() < uds::X31_RESP_MIN_LEN {
            return Err(ClientError::ResponseTooShort);
        }
        Ok(RoutineControlResponse {
            routine_control_type: self.recv_buf[1],
            routine_identifier: u16::from_be_bytes([self.recv_buf[2], self.recv_buf[3]]),
            status_record: &self.recv_buf[uds::X31_RESP_MIN_LEN..],
        })
    }

    /// Parses a RequestDownload (0x34) positive response
    pub fn unpack_request_download_response(&self) -> ClientResult<RequestDownloadResponse> {
        if self.recv_buf.first() != Some(&UdsCommand::RequestDownload.response_sid()) {
            return Err(ClientError::SidMismatch);
        }
        if self.recv_buf.len() < uds::X34_RESP_BASE_LEN {
            return Err(ClientError::ResponseTooShort);
        }
        let length_size = (self.recv_buf[1] >> 4) as usize;
        if length_size > size_of::<usize>() {
            return Err(ClientError::General);
        }
        if self.recv_buf.len() < uds::X34_RESP_BASE_LEN + length_size {
            return Err(ClientError::ResponseTooShort);
        }
        let mut max_number_of_block_length = 0usize;
        for &byte in &self.recv_buf[uds::X34_RESP_BASE_LEN..uds::X34_RESP_BASE_LEN + length_size] {
            max_number_of_block_length = (max_number_of_block_length << 8) | byte as usize;
        }
        Ok(RequestDownloadResponse {
            max_number_of_block_length,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Decoded SecurityAccess (0x27) positive response
pub struct SecurityAccessResponse<'a> {
    /// Echoed sub-function
    pub security_access_type: u8,
    /// Seed bytes; an all-zero seed signals that the level is already unlocked
    pub seed: &'a [u8],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Decoded RoutineControl (0x31) positive response
pub struct RoutineControlResponse<'a> {
    /// Echoed routine control type
    pub routine_control_type: u8,
    /// Echoed routine identifier
    pub routine_identifier: u16,
    /// Routine status record, may be empty
    pub status_record: &'a [u8],
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Decoded RequestDownload (0x34) positive response
pub struct RequestDownloadResponse {
    /// Largest TransferData request (including SID and counter bytes) the
    /// server accepts
    pub max_number_of_block_length: usize,
}
