//! Step sequence runner for composite client flows
//!
//! A [SequenceRunner] drives an ordered list of steps through repeated polls:
//! each step runs only while the low-level request machine is idle and
//! error-free, and decides whether the flow is finished, still working, or
//! ready for the next step. [DownloadSequence] composes the built-in flow
//! `RequestDownload -> TransferData* -> RequestTransferExit` on top of it.

use std::io::Read;

use log::debug;

use crate::client::{ClientError, ClientPollState, UdsClient};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Outcome of one sequence step invocation
pub enum SeqState {
    /// The whole sequence is finished
    Done,
    /// The step has more work to do and wants to be invoked again
    Running,
    /// The step is complete; advance to the next one
    GotoNext,
}

/// One step of a client sequence
pub type SequenceFn<T> = fn(&mut UdsClient, &mut T) -> SeqState;

/// Drives an ordered list of steps over a [UdsClient]
pub struct SequenceRunner<T: 'static> {
    steps: &'static [SequenceFn<T>],
    idx: usize,
    data: T,
}

impl<T: std::fmt::Debug> std::fmt::Debug for SequenceRunner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceRunner")
            .field("idx", &self.idx)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

impl<T> SequenceRunner<T> {
    /// Creates a runner over `steps` with the shared step data `data`
    pub fn new(steps: &'static [SequenceFn<T>], data: T) -> Self {
        Self {
            steps,
            idx: 0,
            data,
        }
    }

    /// Shared data of the steps
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Consumes the runner, returning the step data
    pub fn into_data(self) -> T {
        self.data
    }

    /// Polls the client and, when it is idle without error, advances the
    /// sequence by at most one step.
    ///
    /// Returns [ClientPollState::Idle] once the sequence has finished or the
    /// client recorded an error (check [UdsClient::error]).
    pub fn poll(&mut self, client: &mut UdsClient) -> ClientPollState {
        if client.poll() == ClientPollState::Running {
            return ClientPollState::Running;
        }
        if client.error().is_some() {
            return ClientPollState::Idle;
        }
        let Some(step) = self.steps.get(self.idx) else {
            return ClientPollState::Idle;
        };
        match step(client, &mut self.data) {
            SeqState::Done => ClientPollState::Idle,
            SeqState::Running => ClientPollState::Running,
            SeqState::GotoNext => {
                self.idx += 1;
                ClientPollState::Running
            }
        }
    }
}

/// Step that waits for the low-level machine to come back to idle.
///
/// Ends the sequence if the preceding request failed.
pub fn await_idle<T>(client: &mut UdsClient, _data: &mut T) -> SeqState {
    if client.error().is_some() {
        SeqState::Done
    } else {
        // steps only run while the request machine is idle
        SeqState::GotoNext
    }
}

/// Step data of the built-in download flow
pub struct DownloadSequence {
    data_format_identifier: u8,
    address_and_length_format_identifier: u8,
    memory_address: usize,
    memory_size: usize,
    source: Box<dyn Read>,
    block_sequence_counter: u8,
    block_length: u16,
    done_reading: bool,
}

impl std::fmt::Debug for DownloadSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadSequence")
            .field("memory_address", &self.memory_address)
            .field("memory_size", &self.memory_size)
            .field("block_sequence_counter", &self.block_sequence_counter)
            .field("block_length", &self.block_length)
            .finish_non_exhaustive()
    }
}

const DOWNLOAD_STEPS: &[SequenceFn<DownloadSequence>] = &[
    request_download,
    await_idle::<DownloadSequence>,
    check_request_download_response,
    prepare_to_transfer,
    transfer_data,
    request_transfer_exit,
    await_idle::<DownloadSequence>,
];

impl DownloadSequence {
    /// Configures a download of `memory_size` bytes read from `source` to
    /// `memory_address` on the server. Drive the returned runner with
    /// [SequenceRunner::poll] until it reports idle.
    pub fn new(
        data_format_identifier: u8,
        address_and_length_format_identifier: u8,
        memory_address: usize,
        memory_size: usize,
        source: Box<dyn Read>,
    ) -> SequenceRunner<DownloadSequence> {
        SequenceRunner::new(
            DOWNLOAD_STEPS,
            DownloadSequence {
                data_format_identifier,
                address_and_length_format_identifier,
                memory_address,
                memory_size,
                source,
                block_sequence_counter: 1,
                block_length: 0,
                done_reading: false,
            },
        )
    }
}

fn request_download(client: &mut UdsClient, seq: &mut DownloadSequence) -> SeqState {
    match client.send_request_download(
        seq.data_format_identifier,
        seq.address_and_length_format_identifier,
        seq.memory_address,
        seq.memory_size,
    ) {
        Ok(()) => SeqState::GotoNext,
        Err(e) => {
            client.err = Some(e);
            SeqState::Done
        }
    }
}

fn check_request_download_response(
    client: &mut UdsClient,
    seq: &mut DownloadSequence,
) -> SeqState {
    match client.unpack_request_download_response() {
        Ok(resp) => {
            if resp.max_number_of_block_length == 0 {
                client.err = Some(ClientError::General);
                return SeqState::Done;
            }
            seq.block_length = resp.max_number_of_block_length.min(u16::MAX as usize) as u16;
            debug!("server accepts blocks of {} bytes", seq.block_length);
            SeqState::GotoNext
        }
        Err(e) => {
            client.err = Some(e);
            SeqState::Done
        }
    }
}

fn prepare_to_transfer(_client: &mut UdsClient, seq: &mut DownloadSequence) -> SeqState {
    // UDS-1-2013 14.4.2.3: the blockSequenceCounter starts at 0x01
    seq.block_sequence_counter = 1;
    SeqState::GotoNext
}

fn transfer_data(client: &mut UdsClient, seq: &mut DownloadSequence) -> SeqState {
    if seq.done_reading {
        return SeqState::GotoNext;
    }
    match client.send_transfer_data_stream(
        seq.block_sequence_counter,
        seq.block_length,
        seq.source.as_mut(),
    ) {
        Ok(0) => {
            seq.done_reading = true;
            SeqState::GotoNext
        }
        Ok(_) => {
            seq.block_sequence_counter = seq.block_sequence_counter.wrapping_add(1);
            SeqState::Running
        }
        Err(e) => {
            client.err = Some(e);
            SeqState::Done
        }
    }
}

fn request_transfer_exit(client: &mut UdsClient, _seq: &mut DownloadSequence) -> SeqState {
    match client.send_request_transfer_exit() {
        Ok(()) => SeqState::GotoNext,
        Err(e) => {
            client.err = Some(e);
            SeqState::Done
        }
    }
}
