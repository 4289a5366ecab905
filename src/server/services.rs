//! Per-service request handlers and the response dispatcher
//!
//! Follows the server response behavior pseudo code of ISO14229-1:2013 7.5.5:
//! sub-function services honor the suppressPosRspMsgIndicationBit, and a
//! fixed set of negative responses is suppressed under functional addressing.

use log::{debug, warn};

use crate::{
    channel::{TargetAddressType, UDS_TP_MTU},
    server::{POSITIVE_RESPONSE, ResponseWriter, ServerEvent, UdsRequest, UdsServer},
    time::time_after,
    uds::{self, UdsCommand, UdsError, UdsResetType, UdsSessionType},
};

impl UdsServer {
    /// Dispatches the buffered request and applies the response suppression
    /// rules. Returns the response code (0x00 = positive).
    pub(crate) fn evaluate_service_response(&mut self, r: &mut UdsRequest) -> u8 {
        let sid = r.recv_buf[0];
        let response = self.dispatch(sid, r);

        let mut suppress = false;
        if uds::is_sub_function_service(sid)
            && response == POSITIVE_RESPONSE
            && r.recv_buf.get(1).is_some_and(|b| b & 0x80 != 0)
        {
            // suppressPosRspMsgIndicationBit
            suppress = true;
        }

        if r.info.ta_type == TargetAddressType::Functional
            && uds::suppress_neg_response_on_functional(response)
        {
            suppress = true;
        }

        if suppress {
            r.no_response();
        }
        response
    }

    fn dispatch(&mut self, sid: u8, r: &mut UdsRequest) -> u8 {
        use UdsCommand::*;
        match UdsCommand::from_repr(sid) {
            Some(DiagnosticSessionControl) => self.handle_diag_sess_ctrl(r),
            Some(ECUReset) => self.handle_ecu_reset(r),
            Some(ReadDataByIdentifier) => self.handle_rdbi(r),
            Some(ReadMemoryByAddress) => self.handle_read_mem_by_addr(r),
            Some(SecurityAccess) => self.handle_security_access(r),
            Some(CommunicationControl) => self.handle_comm_ctrl(r),
            Some(WriteDataByIdentifier) => self.handle_wdbi(r),
            Some(RoutineControl) => self.handle_routine_ctrl(r),
            Some(RequestDownload) => self.handle_request_download(r),
            Some(RequestUpload) => self.handle_request_upload(r),
            Some(TransferData) => self.handle_transfer_data(r),
            Some(RequestTransferExit) => self.handle_request_transfer_exit(r),
            Some(TesterPresent) => self.handle_tester_present(r),
            Some(ControlDTCSettings) => self.handle_control_dtc_setting(r),
            _ => {
                debug!("no handler for SID 0x{sid:02X}");
                r.negative_response(UdsError::ServiceNotSupported)
            }
        }
    }

    fn handle_diag_sess_ctrl(&mut self, r: &mut UdsRequest) -> u8 {
        if r.recv_buf.len() < uds::X10_REQ_LEN {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let session_type = r.recv_buf[1] & 0x4F;

        let mut p2_ms = self.options.p2_ms;
        let mut p2_star_ms = self.options.p2_star_ms;
        let code = self.emit(ServerEvent::DiagSessCtrl {
            session_type,
            p2_ms: &mut p2_ms,
            p2_star_ms: &mut p2_star_ms,
        });
        if code != POSITIVE_RESPONSE {
            return r.negative_response(code.into());
        }

        let new_session = UdsSessionType::from(session_type);
        if new_session != self.session_type {
            // a session change ends any open transfer
            self.reset_transfer();
        }
        self.session_type = new_session;
        if self.session_type != UdsSessionType::Default {
            let now = self.clock.now_ms();
            self.s3_timer = now.wrapping_add(self.options.s3_ms);
        }

        let p2_star_10ms = p2_star_ms / 10;
        r.send_buf.clear();
        r.send_buf.extend_from_slice(&[
            UdsCommand::DiagnosticSessionControl.response_sid(),
            session_type,
            (p2_ms >> 8) as u8,
            p2_ms as u8,
            (p2_star_10ms >> 8) as u8,
            p2_star_10ms as u8,
        ]);
        POSITIVE_RESPONSE
    }

    fn handle_ecu_reset(&mut self, r: &mut UdsRequest) -> u8 {
        if r.recv_buf.len() < uds::X11_REQ_MIN_LEN {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let reset_type = r.recv_buf[1] & 0x3F;

        let mut power_down_time_ms = self.options.power_down_time_ms;
        let code = self.emit(ServerEvent::EcuReset {
            reset_type,
            power_down_time_ms: &mut power_down_time_ms,
        });
        if code != POSITIVE_RESPONSE {
            return r.negative_response(code.into());
        }

        self.not_ready_to_receive = true;
        self.ecu_reset_scheduled = Some(reset_type);
        self.ecu_reset_timer = self.clock.now_ms().wrapping_add(power_down_time_ms);

        r.send_buf.clear();
        r.send_buf
            .extend_from_slice(&[UdsCommand::ECUReset.response_sid(), reset_type]);
        if UdsResetType::from(reset_type) == UdsResetType::EnableRapidPowerShutDown {
            let power_down_time_s = (power_down_time_ms / 1000).min(255);
            r.send_buf.push(power_down_time_s as u8);
        }
        POSITIVE_RESPONSE
    }

    fn handle_rdbi(&mut self, r: &mut UdsRequest) -> u8 {
        r.send_buf.clear();
        r.send_buf
            .push(UdsCommand::ReadDataByIdentifier.response_sid());

        if (r.recv_buf.len() - 1) % 2 != 0 {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let num_dids = (r.recv_buf.len() - 1) / 2;
        if num_dids == 0 {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }

        for did in 0..num_dids {
            let idx = 1 + did * 2;
            let data_id = u16::from_be_bytes([r.recv_buf[idx], r.recv_buf[idx + 1]]);

            if r.send_buf.len() + 3 > r.send_buf_size {
                return r.negative_response(UdsError::ResponseTooLong);
            }
            r.send_buf.extend_from_slice(&data_id.to_be_bytes());

            let writer = ResponseWriter::new(&mut r.send_buf, r.send_buf_size);
            let code = self.emit(ServerEvent::ReadDataByIdent { data_id, writer });
            if code != POSITIVE_RESPONSE {
                return r.negative_response(code.into());
            }
        }
        POSITIVE_RESPONSE
    }

    fn handle_read_mem_by_addr(&mut self, r: &mut UdsRequest) -> u8 {
        if r.recv_buf.len() < uds::X23_REQ_MIN_LEN {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let (address, size) = match uds::decode_address_and_length(&r.recv_buf[1..]) {
            Ok(decoded) => decoded,
            Err(e) => return r.negative_response(e),
        };

        r.send_buf.clear();
        r.send_buf
            .push(UdsCommand::ReadMemoryByAddress.response_sid());

        let writer = ResponseWriter::new(&mut r.send_buf, r.send_buf_size);
        let code = self.emit(ServerEvent::ReadMemByAddr {
            address,
            size,
            writer,
        });
        if code != POSITIVE_RESPONSE {
            return r.negative_response(code.into());
        }
        if r.send_buf.len() != uds::X23_RESP_BASE_LEN + size {
            warn!("ReadMemByAddr handler copied a wrong byte count");
            return r.negative_response(UdsError::GeneralProgrammingFailure);
        }
        POSITIVE_RESPONSE
    }

    fn handle_security_access(&mut self, r: &mut UdsRequest) -> u8 {
        if r.recv_buf.len() < uds::X27_REQ_BASE_LEN {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        // the top bit of the sub-function byte only carries response suppression
        let sub_function = r.recv_buf[1] & 0x7F;

        if uds::security_access_level_is_reserved(sub_function) {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }

        let now = self.clock.now_ms();
        if !time_after(now, self.sec_access_boot_delay_timer) {
            return r.negative_response(UdsError::RequiredTimeDelayNotExpired);
        }
        if !time_after(now, self.sec_access_auth_fail_timer) {
            return r.negative_response(UdsError::ExceedNumberOfAttempts);
        }

        r.send_buf.clear();
        r.send_buf
            .extend_from_slice(&[UdsCommand::SecurityAccess.response_sid(), sub_function]);

        if sub_function % 2 == 0 {
            // even: sendKey for the level identified by the preceding requestSeed
            let requested_level = sub_function - 1;
            let code = self.emit(ServerEvent::SecAccessValidateKey {
                level: requested_level,
                key: &r.recv_buf[uds::X27_REQ_BASE_LEN..],
            });
            if code != POSITIVE_RESPONSE {
                let now = self.clock.now_ms();
                self.sec_access_auth_fail_timer =
                    now.wrapping_add(self.options.sec_access_auth_fail_delay_ms);
                return r.negative_response(code.into());
            }
            self.security_level = requested_level;
            POSITIVE_RESPONSE
        } else {
            // odd: requestSeed
            if sub_function == self.security_level {
                // level already unlocked: answer with an all-zero seed
                // (ISO14229-1:2013 Table 52 uses a two byte seed)
                let mut writer = ResponseWriter::new(&mut r.send_buf, r.send_buf_size);
                match writer.append(&[0x00, 0x00]) {
                    Ok(()) => POSITIVE_RESPONSE,
                    Err(e) => r.negative_response(e),
                }
            } else {
                let (recv_buf, send_buf) = (&r.recv_buf, &mut r.send_buf);
                let seed = ResponseWriter::new(send_buf, r.send_buf_size);
                let code = self.emit(ServerEvent::SecAccessRequestSeed {
                    level: sub_function,
                    data_record: &recv_buf[uds::X27_REQ_BASE_LEN..],
                    seed,
                });
                if code != POSITIVE_RESPONSE {
                    return r.negative_response(code.into());
                }
                if r.send_buf.len() <= uds::X27_RESP_BASE_LEN {
                    // the handler accepted but copied no seed
                    return r.negative_response(UdsError::GeneralProgrammingFailure);
                }
                POSITIVE_RESPONSE
            }
        }
    }

    fn handle_comm_ctrl(&mut self, r: &mut UdsRequest) -> u8 {
        if r.recv_buf.len() < uds::X28_REQ_BASE_LEN {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let control_type = r.recv_buf[1] & 0x7F;
        let communication_type = r.recv_buf[2];

        let code = self.emit(ServerEvent::CommCtrl {
            control_type,
            communication_type,
        });
        if code != POSITIVE_RESPONSE {
            return r.negative_response(code.into());
        }

        r.send_buf.clear();
        r.send_buf
            .extend_from_slice(&[UdsCommand::CommunicationControl.response_sid(), control_type]);
        POSITIVE_RESPONSE
    }

    fn handle_wdbi(&mut self, r: &mut UdsRequest) -> u8 {
        if r.recv_buf.len() < uds::X2E_REQ_MIN_LEN {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let data_id = u16::from_be_bytes([r.recv_buf[1], r.recv_buf[2]]);

        let code = self.emit(ServerEvent::WriteDataByIdent {
            data_id,
            data: &r.recv_buf[uds::X2E_REQ_BASE_LEN..],
        });
        if code != POSITIVE_RESPONSE {
            return r.negative_response(code.into());
        }

        r.send_buf.clear();
        r.send_buf
            .push(UdsCommand::WriteDataByIdentifier.response_sid());
        r.send_buf.extend_from_slice(&data_id.to_be_bytes());
        POSITIVE_RESPONSE
    }

    fn handle_routine_ctrl(&mut self, r: &mut UdsRequest) -> u8 {
        if r.recv_buf.len() < uds::X31_REQ_MIN_LEN {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let control_type = r.recv_buf[1] & 0x7F;
        let routine_id = u16::from_be_bytes([r.recv_buf[2], r.recv_buf[3]]);

        r.send_buf.clear();
        r.send_buf.extend_from_slice(&[
            UdsCommand::RoutineControl.response_sid(),
            control_type,
            (routine_id >> 8) as u8,
            routine_id as u8,
        ]);

        // kStartRoutine / kStopRoutine / kRequestRoutineResults
        if !(1..=3).contains(&control_type) {
            return r.negative_response(UdsError::RequestOutOfRange);
        }

        let (recv_buf, send_buf) = (&r.recv_buf, &mut r.send_buf);
        let status = ResponseWriter::new(send_buf, r.send_buf_size);
        let code = self.emit(ServerEvent::RoutineCtrl {
            control_type,
            routine_id,
            option_record: &recv_buf[uds::X31_REQ_MIN_LEN..],
            status,
        });
        if code != POSITIVE_RESPONSE {
            return r.negative_response(code.into());
        }
        POSITIVE_RESPONSE
    }

    fn handle_request_download(&mut self, r: &mut UdsRequest) -> u8 {
        self.handle_transfer_request(r, false)
    }

    fn handle_request_upload(&mut self, r: &mut UdsRequest) -> u8 {
        self.handle_transfer_request(r, true)
    }

    // 0x34 and 0x35 share their request layout and transfer bookkeeping
    fn handle_transfer_request(&mut self, r: &mut UdsRequest, upload: bool) -> u8 {
        if self.xfer_is_active {
            return r.negative_response(UdsError::ConditionsNotCorrect);
        }
        if r.recv_buf.len() < uds::X34_REQ_BASE_LEN {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let data_format = r.recv_buf[1];
        let (address, size) = match uds::decode_address_and_length(&r.recv_buf[2..]) {
            Ok(decoded) => decoded,
            Err(e) => return r.negative_response(e),
        };

        let mut max_block_length = self.options.xfer_max_block_length;
        let event = if upload {
            ServerEvent::RequestUpload {
                address,
                size,
                data_format,
                max_block_length: &mut max_block_length,
            }
        } else {
            ServerEvent::RequestDownload {
                address,
                size,
                data_format,
                max_block_length: &mut max_block_length,
            }
        };
        let code = self.emit(event);

        if max_block_length < 3 {
            warn!("handler advertised a maxNumberOfBlockLength below 3");
            return r.negative_response(UdsError::GeneralProgrammingFailure);
        }
        if code != POSITIVE_RESPONSE {
            return r.negative_response(code.into());
        }
        if max_block_length as usize > UDS_TP_MTU {
            max_block_length = UDS_TP_MTU as u16;
        }

        self.reset_transfer();
        self.xfer_is_active = true;
        self.xfer_total_bytes = size;
        self.xfer_block_length = max_block_length;

        let response_sid = if upload {
            UdsCommand::RequestUpload.response_sid()
        } else {
            UdsCommand::RequestDownload.response_sid()
        };
        // ISO14229-1:2013 Table 401: lengthFormatIdentifier high nibble holds
        // the byte width of maxNumberOfBlockLength
        let length_format_identifier = (size_of::<u16>() as u8) << 4;
        r.send_buf.clear();
        r.send_buf.push(response_sid);
        r.send_buf.push(length_format_identifier);
        r.send_buf.extend_from_slice(&max_block_length.to_be_bytes());
        POSITIVE_RESPONSE
    }

    fn handle_transfer_data(&mut self, r: &mut UdsRequest) -> u8 {
        if !self.xfer_is_active {
            return r.negative_response(UdsError::UploadDownloadNotAccepted);
        }
        if r.recv_buf.len() < uds::X36_REQ_BASE_LEN {
            self.reset_transfer();
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let block_sequence_counter = r.recv_buf[1];
        let request_data_len = r.recv_buf.len() - uds::X36_REQ_BASE_LEN;

        // a handler that answered 0x78 is being retried; the counter was
        // already validated on first entry
        if !self.rcrrp && block_sequence_counter != self.xfer_block_sequence_counter {
            self.reset_transfer();
            return r.negative_response(UdsError::RequestSequenceError);
        }

        if self.xfer_byte_counter + request_data_len > self.xfer_total_bytes {
            self.reset_transfer();
            return r.negative_response(UdsError::TransferDataSuspended);
        }

        r.send_buf.clear();
        r.send_buf.extend_from_slice(&[
            UdsCommand::TransferData.response_sid(),
            block_sequence_counter,
        ]);

        let max_resp_len = (self.xfer_block_length as usize).saturating_sub(uds::X36_RESP_BASE_LEN);
        let (recv_buf, send_buf) = (&r.recv_buf, &mut r.send_buf);
        let response = ResponseWriter::new(send_buf, r.send_buf_size);
        let code = self.emit(ServerEvent::TransferData {
            data: &recv_buf[uds::X36_REQ_BASE_LEN..],
            max_resp_len,
            response,
        });

        match code {
            POSITIVE_RESPONSE => {
                self.xfer_byte_counter += request_data_len;
                self.xfer_block_sequence_counter = self.xfer_block_sequence_counter.wrapping_add(1);
                POSITIVE_RESPONSE
            }
            code if code == u8::from(UdsError::RequestCorrectlyReceivedResponsePending) => {
                r.negative_response(UdsError::RequestCorrectlyReceivedResponsePending)
            }
            code => {
                self.reset_transfer();
                r.negative_response(code.into())
            }
        }
    }

    fn handle_request_transfer_exit(&mut self, r: &mut UdsRequest) -> u8 {
        if !self.xfer_is_active {
            return r.negative_response(UdsError::UploadDownloadNotAccepted);
        }

        r.send_buf.clear();
        r.send_buf
            .push(UdsCommand::RequestTransferExit.response_sid());

        let (recv_buf, send_buf) = (&r.recv_buf, &mut r.send_buf);
        let response = ResponseWriter::new(send_buf, r.send_buf_size);
        let code = self.emit(ServerEvent::RequestTransferExit {
            data: &recv_buf[uds::X37_REQ_BASE_LEN..],
            response,
        });

        match code {
            POSITIVE_RESPONSE => {
                self.reset_transfer();
                POSITIVE_RESPONSE
            }
            code if code == u8::from(UdsError::RequestCorrectlyReceivedResponsePending) => {
                r.negative_response(UdsError::RequestCorrectlyReceivedResponsePending)
            }
            code => {
                self.reset_transfer();
                r.negative_response(code.into())
            }
        }
    }

    fn handle_tester_present(&mut self, r: &mut UdsRequest) -> u8 {
        if r.recv_buf.len() != uds::X3E_REQ_LEN {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        match r.recv_buf[1] {
            0x00 | 0x80 => {
                let now = self.clock.now_ms();
                self.s3_timer = now.wrapping_add(self.options.s3_ms);
                r.send_buf.clear();
                r.send_buf
                    .extend_from_slice(&[UdsCommand::TesterPresent.response_sid(), 0x00]);
                POSITIVE_RESPONSE
            }
            _ => r.negative_response(UdsError::SubFunctionNotSupported),
        }
    }

    fn handle_control_dtc_setting(&mut self, r: &mut UdsRequest) -> u8 {
        if r.recv_buf.len() < uds::X85_REQ_BASE_LEN {
            return r.negative_response(UdsError::IncorrectMessageLengthOrInvalidFormat);
        }
        let dtc_setting_type = r.recv_buf[1] & 0x3F;
        r.send_buf.clear();
        r.send_buf.extend_from_slice(&[
            UdsCommand::ControlDTCSettings.response_sid(),
            dtc_setting_type,
        ]);
        POSITIVE_RESPONSE
    }
}
