//! Shared UDS (ISO14229) protocol definitions
//!
//! Service identifiers, negative response codes, sub-function enumerations and
//! the wire-level packing rules that both the [crate::server] and
//! [crate::client] state machines rely on.

use strum_macros::FromRepr;

use crate::channel::UDS_TP_MTU;

#[derive(FromRepr, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
/// UDS Service IDs (ISO14229-1:2013 Table 2)
pub enum UdsCommand {
    /// Diagnostic session control
    DiagnosticSessionControl = 0x10,
    /// ECU Reset
    ECUReset = 0x11,
    /// Clears stored DTCs on the ECU
    ClearDiagnosticInformation = 0x14,
    /// Reads stored DTCs from the ECU
    ReadDTCInformation = 0x19,
    /// Reads data from the ECU by data identifier
    ReadDataByIdentifier = 0x22,
    /// Reads a region of ECU memory
    ReadMemoryByAddress = 0x23,
    /// Reads scaling data by data identifier
    ReadScalingDataByIdentifier = 0x24,
    /// Security access (seed/key)
    SecurityAccess = 0x27,
    /// Controls communication functionality of the ECU
    CommunicationControl = 0x28,
    /// Reads data by periodic identifier
    ReadDataByPeriodicIdentifier = 0x2A,
    /// Dynamically defines data identifiers
    DynamicallyDefineDataIdentifier = 0x2C,
    /// Writes data to the ECU by data identifier
    WriteDataByIdentifier = 0x2E,
    /// Input output control by identifier
    InputOutputControlByIdentifier = 0x2F,
    /// Starts, stops or queries routines on the ECU
    RoutineControl = 0x31,
    /// Requests a download (client to ECU) transfer
    RequestDownload = 0x34,
    /// Requests an upload (ECU to client) transfer
    RequestUpload = 0x35,
    /// Transfers one block of a download or upload
    TransferData = 0x36,
    /// Closes an active download or upload
    RequestTransferExit = 0x37,
    /// Requests a file transfer
    RequestFileTransfer = 0x38,
    /// Writes a region of ECU memory
    WriteMemoryByAddress = 0x3D,
    /// Tester present command
    TesterPresent = 0x3E,
    /// Accesses timing parameters
    AccessTimingParameters = 0x83,
    /// Secured data transmission
    SecuredDataTransmission = 0x84,
    /// Enables or disables DTC setting
    ControlDTCSettings = 0x85,
    /// Response on event
    ResponseOnEvent = 0x86,
    /// Link control
    LinkControl = 0x87,
}

impl UdsCommand {
    /// Returns the positive response SID for this service
    pub fn response_sid(&self) -> u8 {
        *self as u8 + 0x40
    }
}

/// Computes the positive response SID of a request SID
pub const fn response_sid_of(request_sid: u8) -> u8 {
    request_sid.wrapping_add(0x40)
}

/// Computes the request SID of a positive response SID
pub const fn request_sid_of(response_sid: u8) -> u8 {
    response_sid.wrapping_sub(0x40)
}

/// SID of a negative response message
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// UDS negative response codes
pub enum UdsError {
    /// ECU rejected the request (No specific error)
    GeneralReject,
    /// Service is not supported by the ECU
    ServiceNotSupported,
    /// Sub function is not supported by the ECU
    SubFunctionNotSupported,
    /// Request message was an invalid length, or the format of the
    /// request was incorrect
    IncorrectMessageLengthOrInvalidFormat,
    /// The response message is too long for the transport protocol
    ResponseTooLong,
    /// The ECU is too busy to perform this request, so the request
    /// should be sent again
    BusyRepeatRequest,
    /// The requested action could not be performed due to the prerequisite
    /// conditions not being correct
    ConditionsNotCorrect,
    /// The request has been sent in the incorrect order
    RequestSequenceError,
    /// The ECU timed out communicating with another component in the vehicle
    NoResponseFromSubnetComponent,
    /// A failure of another component is preventing execution of the request
    FailurePreventsExecutionOfRequestedAction,
    /// The request message contains data outside of a valid range
    RequestOutOfRange,
    /// The request could not be completed due to security access being denied
    SecurityAccessDenied,
    /// The key sent during security access was invalid
    InvalidKey,
    /// Security access has been attempted too many times with incorrect keys
    ExceedNumberOfAttempts,
    /// Security access was requested before the ECU's time delay has expired
    RequiredTimeDelayNotExpired,
    /// The ECU cannot accept the requested upload/download request
    UploadDownloadNotAccepted,
    /// The ECU has halted data transfer due to a fault condition
    TransferDataSuspended,
    /// The ECU has encountered an error during reprogramming
    GeneralProgrammingFailure,
    /// The blockSequenceCounter of a TransferData request was incorrect
    WrongBlockSequenceCounter,
    /// The ECU has accepted the request, but cannot reply right now.
    /// The server keeps the request pending and repeats this code until the
    /// real response is ready
    RequestCorrectlyReceivedResponsePending,
    /// The sub function is not supported in the current diagnostic session mode
    SubFunctionNotSupportedInActiveSession,
    /// The service is not supported in the current diagnostic session mode
    ServiceNotSupportedInActiveSession,
    /// Engine RPM is too high
    RpmTooHigh,
    /// Engine RPM is too low
    RpmTooLow,
    /// Engine is running
    EngineIsRunning,
    /// Engine is not running
    EngineIsNotRunning,
    /// Engine has not been running for long enough
    EngineRunTimeTooLow,
    /// Engine temperature (coolant) is too high
    TemperatureTooHigh,
    /// Engine temperature (coolant) is too low
    TemperatureTooLow,
    /// Vehicle speed is too high
    VehicleSpeedTooHigh,
    /// Vehicle speed is too low
    VehicleSpeedTooLow,
    /// Throttle or pedal value is too high
    ThrottleTooHigh,
    /// Throttle or pedal value is too low
    ThrottleTooLow,
    /// Transmission is not in neutral
    TransmissionRangeNotInNeutral,
    /// Transmission is not in gear
    TransmissionRangeNotInGear,
    /// Brake is not applied
    BrakeSwitchNotClosed,
    /// Shifter lever is not in park
    ShifterLeverNotInPark,
    /// Automatic/CVT transmission torque converter is locked
    TorqueConverterClutchLocked,
    /// Voltage is too high
    VoltageTooHigh,
    /// Voltage is too low
    VoltageTooLow,
    /// Reserved or vehicle manufacturer specific code
    IsoSAEReserved(u8),
}

impl From<u8> for UdsError {
    fn from(p: u8) -> Self {
        match p {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrInvalidFormat,
            0x14 => Self::ResponseTooLong,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x25 => Self::NoResponseFromSubnetComponent,
            0x26 => Self::FailurePreventsExecutionOfRequestedAction,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceedNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x70 => Self::UploadDownloadNotAccepted,
            0x71 => Self::TransferDataSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::RequestCorrectlyReceivedResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            0x81 => Self::RpmTooHigh,
            0x82 => Self::RpmTooLow,
            0x83 => Self::EngineIsRunning,
            0x84 => Self::EngineIsNotRunning,
            0x85 => Self::EngineRunTimeTooLow,
            0x86 => Self::TemperatureTooHigh,
            0x87 => Self::TemperatureTooLow,
            0x88 => Self::VehicleSpeedTooHigh,
            0x89 => Self::VehicleSpeedTooLow,
            0x8A => Self::ThrottleTooHigh,
            0x8B => Self::ThrottleTooLow,
            0x8C => Self::TransmissionRangeNotInNeutral,
            0x8D => Self::TransmissionRangeNotInGear,
            0x8F => Self::BrakeSwitchNotClosed,
            0x90 => Self::ShifterLeverNotInPark,
            0x91 => Self::TorqueConverterClutchLocked,
            0x92 => Self::VoltageTooHigh,
            0x93 => Self::VoltageTooLow,
            x => Self::IsoSAEReserved(x),
        }
    }
}

impl From<UdsError> for u8 {
    fn from(e: UdsError) -> u8 {
        match e {
            UdsError::GeneralReject => 0x10,
            UdsError::ServiceNotSupported => 0x11,
            UdsError::SubFunctionNotSupported => 0x12,
            UdsError::IncorrectMessageLengthOrInvalidFormat => 0x13,
            UdsError::ResponseTooLong => 0x14,
            UdsError::BusyRepeatRequest => 0x21,
            UdsError::ConditionsNotCorrect => 0x22,
            UdsError::RequestSequenceError => 0x24,
            UdsError::NoResponseFromSubnetComponent => 0x25,
            UdsError::FailurePreventsExecutionOfRequestedAction => 0x26,
            UdsError::RequestOutOfRange => 0x31,
            UdsError::SecurityAccessDenied => 0x33,
            UdsError::InvalidKey => 0x35,
            UdsError::ExceedNumberOfAttempts => 0x36,
            UdsError::RequiredTimeDelayNotExpired => 0x37,
            UdsError::UploadDownloadNotAccepted => 0x70,
            UdsError::TransferDataSuspended => 0x71,
            UdsError::GeneralProgrammingFailure => 0x72,
            UdsError::WrongBlockSequenceCounter => 0x73,
            UdsError::RequestCorrectlyReceivedResponsePending => 0x78,
            UdsError::SubFunctionNotSupportedInActiveSession => 0x7E,
            UdsError::ServiceNotSupportedInActiveSession => 0x7F,
            UdsError::RpmTooHigh => 0x81,
            UdsError::RpmTooLow => 0x82,
            UdsError::EngineIsRunning => 0x83,
            UdsError::EngineIsNotRunning => 0x84,
            UdsError::EngineRunTimeTooLow => 0x85,
            UdsError::TemperatureTooHigh => 0x86,
            UdsError::TemperatureTooLow => 0x87,
            UdsError::VehicleSpeedTooHigh => 0x88,
            UdsError::VehicleSpeedTooLow => 0x89,
            UdsError::ThrottleTooHigh => 0x8A,
            UdsError::ThrottleTooLow => 0x8B,
            UdsError::TransmissionRangeNotInNeutral => 0x8C,
            UdsError::TransmissionRangeNotInGear => 0x8D,
            UdsError::BrakeSwitchNotClosed => 0x8F,
            UdsError::ShifterLeverNotInPark => 0x90,
            UdsError::TorqueConverterClutchLocked => 0x91,
            UdsError::VoltageTooHigh => 0x92,
            UdsError::VoltageTooLow => 0x93,
            UdsError::IsoSAEReserved(x) => x,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// UDS diagnostic session modes. Handled by SID 0x10
pub enum UdsSessionType {
    /// Default diagnostic session mode (ECU is normally in this mode on startup)
    Default,
    /// This diagnostic session mode enables all diagnostic services related to
    /// flashing or programming the ECU
    Programming,
    /// This diagnostic session mode enables all diagnostic services and allows
    /// adjusting ECU values
    Extended,
    /// This diagnostic session enables all diagnostic services required to
    /// support safety system-related functions
    SafetySystem,
    /// Custom session type. This covers both vehicleManufacturerSpecific modes
    /// (0x40-0x5F) and systemSupplierSpecific modes (0x60-0x7E)
    Other(u8),
}

impl From<UdsSessionType> for u8 {
    fn from(from: UdsSessionType) -> u8 {
        match from {
            UdsSessionType::Default => 0x01,
            UdsSessionType::Programming => 0x02,
            UdsSessionType::Extended => 0x03,
            UdsSessionType::SafetySystem => 0x04,
            UdsSessionType::Other(x) => x,
        }
    }
}

impl From<u8> for UdsSessionType {
    fn from(from: u8) -> Self {
        match from {
            0x01 => Self::Default,
            0x02 => Self::Programming,
            0x03 => Self::Extended,
            0x04 => Self::SafetySystem,
            x => Self::Other(x),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// ECU reset types. Handled by SID 0x11
pub enum UdsResetType {
    /// Hard reset (as if power to the ECU was removed)
    HardReset,
    /// Simulates an ignition key off/on cycle
    KeyOffOnReset,
    /// Soft reset (restart application without dropping power)
    SoftReset,
    /// Enables rapid power shutdown. The positive response carries the power
    /// down time in seconds
    EnableRapidPowerShutDown,
    /// Disables rapid power shutdown
    DisableRapidPowerShutDown,
    /// Vehicle manufacturer or system supplier specific reset type
    Other(u8),
}

impl From<UdsResetType> for u8 {
    fn from(from: UdsResetType) -> u8 {
        match from {
            UdsResetType::HardReset => 0x01,
            UdsResetType::KeyOffOnReset => 0x02,
            UdsResetType::SoftReset => 0x03,
            UdsResetType::EnableRapidPowerShutDown => 0x04,
            UdsResetType::DisableRapidPowerShutDown => 0x05,
            UdsResetType::Other(x) => x,
        }
    }
}

impl From<u8> for UdsResetType {
    fn from(from: u8) -> Self {
        match from {
            0x01 => Self::HardReset,
            0x02 => Self::KeyOffOnReset,
            0x03 => Self::SoftReset,
            0x04 => Self::EnableRapidPowerShutDown,
            0x05 => Self::DisableRapidPowerShutDown,
            x => Self::Other(x),
        }
    }
}

#[derive(FromRepr, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
/// Communication control types. Handled by SID 0x28
pub enum CommunicationControlType {
    /// Enable both Rx and Tx
    EnableRxAndTx = 0x00,
    /// Enable Rx, disable Tx
    EnableRxAndDisableTx = 0x01,
    /// Disable Rx, enable Tx
    DisableRxAndEnableTx = 0x02,
    /// Disable both Rx and Tx
    DisableRxAndTx = 0x03,
}

#[derive(FromRepr, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
/// Communication message groups affected by SID 0x28
pub enum CommunicationType {
    /// Application layer communication
    NormalCommunicationMessages = 0x01,
    /// Network management communication
    NetworkManagementCommunicationMessages = 0x02,
    /// Both application and network management communication
    NetworkManagementAndNormalCommunicationMessages = 0x03,
}

#[derive(FromRepr, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
/// Routine control operations. Handled by SID 0x31
pub enum RoutineControlType {
    /// Starts a routine
    StartRoutine = 0x01,
    /// Stops a routine
    StopRoutine = 0x02,
    /// Requests the results of a routine
    RequestRoutineResults = 0x03,
}

#[derive(FromRepr, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
/// DTC setting types. Handled by SID 0x85
pub enum DtcSettingType {
    /// Enable DTC setting
    On = 0x01,
    /// Disable DTC setting
    Off = 0x02,
}

// Per-service request/response lengths (ISO14229-1:2013), including the SID byte
pub(crate) const NEG_RESP_LEN: usize = 3;
pub(crate) const X10_REQ_LEN: usize = 2;
pub(crate) const X10_RESP_LEN: usize = 6;
pub(crate) const X11_REQ_MIN_LEN: usize = 2;
pub(crate) const X23_REQ_MIN_LEN: usize = 4;
pub(crate) const X23_RESP_BASE_LEN: usize = 1;
pub(crate) const X22_RESP_BASE_LEN: usize = 1;
pub(crate) const X27_REQ_BASE_LEN: usize = 2;
pub(crate) const X27_RESP_BASE_LEN: usize = 2;
pub(crate) const X28_REQ_BASE_LEN: usize = 3;
pub(crate) const X2E_REQ_BASE_LEN: usize = 3;
pub(crate) const X2E_REQ_MIN_LEN: usize = 4;
pub(crate) const X31_REQ_MIN_LEN: usize = 4;
pub(crate) const X31_RESP_MIN_LEN: usize = 4;
pub(crate) const X34_REQ_BASE_LEN: usize = 3;
pub(crate) const X34_RESP_BASE_LEN: usize = 2;
pub(crate) const X36_REQ_BASE_LEN: usize = 2;
pub(crate) const X36_RESP_BASE_LEN: usize = 2;
pub(crate) const X37_REQ_BASE_LEN: usize = 1;
pub(crate) const X3E_REQ_LEN: usize = 2;
pub(crate) const X85_REQ_BASE_LEN: usize = 2;

/// Returns true if the SID carries a sub-function byte whose top bit requests
/// suppression of the positive response (ISO14229-1:2013 8.2.2 Table 11)
pub fn is_sub_function_service(sid: u8) -> bool {
    matches!(sid, 0x10 | 0x11 | 0x27 | 0x28 | 0x31 | 0x3E | 0x85)
}

/// Returns true if a negative response with this code must be suppressed when
/// the request was functionally addressed (ISO14229-1:2013 7.5.5 Table 5)
pub fn suppress_neg_response_on_functional(nrc: u8) -> bool {
    matches!(nrc, 0x11 | 0x12 | 0x7E | 0x7F | 0x31)
}

/// Returns true if the given security access level (SID 0x27 sub-function) is
/// reserved by ISO14229-1:2013 Table 42
pub fn security_access_level_is_reserved(level: u8) -> bool {
    matches!(level, 0x00 | 0x43..=0x5E | 0x7F)
}

/// Decodes an addressAndLengthFormatIdentifier prefixed field as found in
/// ReadMemoryByAddress (0x23), RequestDownload (0x34) and RequestUpload (0x35).
///
/// `buf` must start at the ALFID byte. Returns (memoryAddress, memorySize).
pub fn decode_address_and_length(buf: &[u8]) -> Result<(usize, usize), UdsError> {
    let alfid = *buf
        .first()
        .ok_or(UdsError::IncorrectMessageLengthOrInvalidFormat)?;
    let memory_size_length = (alfid >> 4) as usize;
    let memory_address_length = (alfid & 0x0F) as usize;

    if memory_size_length == 0 || memory_size_length > size_of::<usize>() {
        return Err(UdsError::RequestOutOfRange);
    }
    if memory_address_length == 0 || memory_address_length > size_of::<usize>() {
        return Err(UdsError::RequestOutOfRange);
    }
    if buf.len() < 1 + memory_address_length + memory_size_length {
        return Err(UdsError::IncorrectMessageLengthOrInvalidFormat);
    }

    let mut memory_address = 0usize;
    for &byte in &buf[1..1 + memory_address_length] {
        memory_address = (memory_address << 8) | byte as usize;
    }
    let mut memory_size = 0usize;
    for &byte in &buf[1 + memory_address_length..1 + memory_address_length + memory_size_length] {
        memory_size = (memory_size << 8) | byte as usize;
    }
    Ok((memory_address, memory_size))
}

/// Appends the big-endian address and size fields described by an
/// addressAndLengthFormatIdentifier to a request under construction
pub fn encode_address_and_length(alfid: u8, address: usize, size: usize, out: &mut Vec<u8>) {
    let memory_size_length = (alfid >> 4) as usize;
    let memory_address_length = (alfid & 0x0F) as usize;
    for i in (0..memory_address_length).rev() {
        out.push((address >> (8 * i)) as u8);
    }
    for i in (0..memory_size_length).rev() {
        out.push((size >> (8 * i)) as u8);
    }
}

/// Largest block length a server may advertise in a RequestDownload or
/// RequestUpload positive response
pub const XFER_MAX_BLOCK_LENGTH: u16 = UDS_TP_MTU as u16;
