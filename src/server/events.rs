//! Application event contract between [crate::server::UdsServer] and user code
//!
//! Each incoming request is translated into one [ServerEvent] carrying typed
//! arguments. The handler returns `Ok(())` to accept,
//! `Err(UdsError::RequestCorrectlyReceivedResponsePending)` to ask the server
//! to answer 0x78 and retry on the next poll, or any other [UdsError] to have
//! that code sent as the negative response.

use crate::uds::UdsError;

/// Outcome of handling a server event
pub type EventResult = Result<(), UdsError>;

/// Borrowed, capacity-checked handle for appending bytes to the pending
/// response.
///
/// Events that let the application contribute response data (RDBI record
/// values, seeds, routine status records, transfer responses) carry one of
/// these. The writer enforces the transport's send buffer capacity: an append
/// that would overflow fails with [UdsError::ResponseTooLong] and leaves the
/// response unchanged.
#[derive(Debug)]
pub struct ResponseWriter<'a> {
    buf: &'a mut Vec<u8>,
    capacity: usize,
}

impl<'a> ResponseWriter<'a> {
    pub(crate) fn new(buf: &'a mut Vec<u8>, capacity: usize) -> Self {
        Self { buf, capacity }
    }

    /// Appends `src` to the response
    pub fn append(&mut self, src: &[u8]) -> EventResult {
        if self.buf.len() + src.len() <= self.capacity {
            self.buf.extend_from_slice(src);
            Ok(())
        } else {
            Err(UdsError::ResponseTooLong)
        }
    }

    /// Bytes appended to the response so far, including the header the server
    /// has already framed
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Remaining capacity in bytes
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }
}

#[derive(Debug)]
/// Events emitted by the server, tagged with their argument records
///
/// Fields holding mutable references are outputs: the handler writes its
/// answer through them before returning.
pub enum ServerEvent<'a> {
    /// DiagnosticSessionControl (0x10) request. `p2_ms`/`p2_star_ms` are
    /// preloaded with the server defaults and may be overridden
    DiagSessCtrl {
        /// Requested session type
        session_type: u8,
        /// P2 timing to advertise in the response (ms)
        p2_ms: &'a mut u16,
        /// P2* timing to advertise in the response (ms)
        p2_star_ms: &'a mut u32,
    },
    /// ECUReset (0x11) request. On acceptance the server schedules
    /// [ServerEvent::DoScheduledReset] after `power_down_time_ms`
    EcuReset {
        /// Requested reset type
        reset_type: u8,
        /// Delay before the reset fires (ms)
        power_down_time_ms: &'a mut u32,
    },
    /// ReadDataByIdentifier (0x22): one event per requested identifier
    ReadDataByIdent {
        /// Requested data identifier
        data_id: u16,
        /// Appends the record value to the response
        writer: ResponseWriter<'a>,
    },
    /// ReadMemoryByAddress (0x23). The handler must append exactly `size`
    /// bytes; anything less fails the request with GeneralProgrammingFailure
    ReadMemByAddr {
        /// Requested memory address
        address: usize,
        /// Requested read length in bytes
        size: usize,
        /// Appends the memory contents to the response
        writer: ResponseWriter<'a>,
    },
    /// CommunicationControl (0x28)
    CommCtrl {
        /// Control type (see [crate::uds::CommunicationControlType])
        control_type: u8,
        /// Affected communication group (see [crate::uds::CommunicationType])
        communication_type: u8,
    },
    /// SecurityAccess (0x27) seed request for a locked level
    SecAccessRequestSeed {
        /// Requested security level (odd sub-function)
        level: u8,
        /// Manufacturer specific request data
        data_record: &'a [u8],
        /// Appends the seed to the response
        seed: ResponseWriter<'a>,
    },
    /// SecurityAccess (0x27) key validation. Returning `Ok(())` unlocks the
    /// level; any error arms the brute-force delay timer
    SecAccessValidateKey {
        /// Security level being unlocked (sub-function minus one)
        level: u8,
        /// Key bytes sent by the client
        key: &'a [u8],
    },
    /// WriteDataByIdentifier (0x2E)
    WriteDataByIdent {
        /// Data identifier being written
        data_id: u16,
        /// New record value
        data: &'a [u8],
    },
    /// RoutineControl (0x31)
    RoutineCtrl {
        /// Start / stop / request results (see [crate::uds::RoutineControlType])
        control_type: u8,
        /// Routine identifier
        routine_id: u16,
        /// Routine option record from the request
        option_record: &'a [u8],
        /// Appends the routine status record to the response
        status: ResponseWriter<'a>,
    },
    /// RequestDownload (0x34). `max_block_length` is preloaded with the server
    /// default and may be reduced (minimum 3)
    RequestDownload {
        /// Requested memory address
        address: usize,
        /// Total transfer size in bytes
        size: usize,
        /// dataFormatIdentifier from the request
        data_format: u8,
        /// Largest TransferData request (including SID and counter) the
        /// application will accept
        max_block_length: &'a mut u16,
    },
    /// RequestUpload (0x35), arguments as for [ServerEvent::RequestDownload]
    RequestUpload {
        /// Requested memory address
        address: usize,
        /// Total transfer size in bytes
        size: usize,
        /// dataFormatIdentifier from the request
        data_format: u8,
        /// Largest TransferData response the application will produce
        max_block_length: &'a mut u16,
    },
    /// TransferData (0x36) block
    TransferData {
        /// Block payload (empty for upload polls)
        data: &'a [u8],
        /// Upper bound for bytes appended through `response`
        max_resp_len: usize,
        /// Appends transfer response parameters (upload data)
        response: ResponseWriter<'a>,
    },
    /// RequestTransferExit (0x37)
    RequestTransferExit {
        /// Request parameter record
        data: &'a [u8],
        /// Appends transfer exit response parameters
        response: ResponseWriter<'a>,
    },
    /// The S3 session timer expired: the server has already reverted to the
    /// default session and locked security
    SessionTimeout,
    /// A reset scheduled by an accepted ECUReset request is now due. The
    /// application performs the actual reset
    DoScheduledReset {
        /// Reset type accepted earlier
        reset_type: u8,
    },
}

/// Application side of a [crate::server::UdsServer]
///
/// The handler is invoked synchronously from [crate::server::UdsServer::poll]
/// and must not block.
pub trait UdsServerHandler {
    /// Handles one server event
    fn handle_event(&mut self, event: ServerEvent<'_>) -> EventResult;
}

#[derive(Debug, Copy, Clone, Default)]
/// Handler that rejects every request with [UdsError::GeneralReject].
/// Stand-in for endpoints that only exercise the transport layer
pub struct UdsVoidHandler;

impl UdsServerHandler for UdsVoidHandler {
    fn handle_event(&mut self, _event: ServerEvent<'_>) -> EventResult {
        Err(UdsError::GeneralReject)
    }
}
