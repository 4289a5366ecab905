#![deny(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! A crate which provides both halves of a UDS (Unified Diagnostic Services,
//! ISO14229-1) endpoint pair, layered above an ISO-TP (ISO15765-2)
//! segmentation transport as typically carried on CAN
//!
//! ## UDS server
//! The [server::UdsServer] plays the role of the ECU under diagnosis: it
//! receives requests, dispatches them to per-service handlers and surfaces
//! typed events ([server::ServerEvent]) to an application supplied
//! [server::UdsServerHandler]. Session, security, transfer and reset state
//! are managed inside the server, driven by the P2/P2*/S3 and brute-force
//! mitigation timers.
//!
//! ## UDS client
//! The [client::UdsClient] plays the role of the tester: request builders for
//! the common services, a small request state machine handling response
//! pending (NRC 0x78) and response validation, and a
//! [client::sequence::SequenceRunner] for composite flows such as the
//! firmware download sequence `RequestDownload -> TransferData* ->
//! RequestTransferExit`.
//!
//! ## Transports
//! Both endpoints talk to the network through the [channel::UdsTransport]
//! trait. [isotp::IsoTpTransport] implements it with a full ISO-TP
//! segmentation engine (single/first/consecutive/flow-control frames, block
//! size and STmin flow control, N_Bs/N_Cr timers) over any CAN bus that can
//! be driven through the one-method [isotp::CanBus] trait.
//! [sim::SimTransport] is an in-memory implementation for tests.
//!
//! ## Scheduling model
//! Everything is single-threaded and cooperative: both endpoints are driven
//! exclusively by their `poll` methods and never block. Poll often enough
//! that P2 outlasts the poll interval and the ISO-TP STmin/N-timers can be
//! honored; at most 1 ms between polls for tight timings, 10 ms otherwise.

pub mod channel;
pub mod client;
pub mod isotp;
pub mod server;
pub mod sim;
pub mod time;
pub mod uds;

pub use channel::{SduInfo, TargetAddressType, TpStatus, UDS_TP_MTU, UdsTransport};
pub use client::{ClientError, ClientPollState, ClientResult, RequestOptions, UdsClient};
pub use server::{ServerEvent, UdsServer, UdsServerHandler, UdsVoidHandler};
pub use uds::{UdsCommand, UdsError, UdsResetType, UdsSessionType};
