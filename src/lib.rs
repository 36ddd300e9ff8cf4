#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! An in-vehicle diagnostics gateway speaking the VW TP2.0 transport protocol
//! over classical CAN, with KWP2000 request/response semantics layered on top.
//!
//! The gateway maintains one TP2.0 channel per electronic control unit (ECU),
//! polls subscribed KWP "measuring blocks" round-robin, decodes the vendor
//! (type, A, B) triplet encoding into engineering values, and republishes the
//! decoded samples as JSON records on a local ZeroMQ fabric. A small JSON
//! request/reply surface lets other processes subscribe and unsubscribe to
//! specific ECU/group combinations at runtime.
//!
//! ## Layering
//!
//! * [channel] - raw classical CAN frame I/O (11-bit ids, 0..8 data bytes)
//! * [tp20] - the TP2.0 channel engine: dynamic channel setup, sequenced
//!   block transfer with ACK handling, keep-alive and teardown
//! * [kwp2000] - KWP2000 services on top of a connected TP2.0 channel
//! * [measure] - decoding of measuring-block triplets
//! * [session] / [scheduler] - per-ECU polling state and the loop driving it
//! * [control] / [bus] - the command surface and the outbound publication
//!
//! ## Hardware support
//!
//! CAN access goes through the [channel::CanInterface] seam. A SocketCAN
//! backend is provided for Linux (feature `socketcan`, on by default), plus a
//! scripted simulation backend used by the test suite.

use crate::bus::BusError;
use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::tp20::ProtocolError;

pub mod bus;
pub mod channel;
pub mod config;
pub mod control;
pub mod dtc;
pub mod hardware;
pub mod kwp2000;
pub mod measure;
pub mod scheduler;
pub mod session;
pub mod tp20;

/// Result type used throughout the diagnostic stack
pub type DiagResult<T> = Result<T, DiagError>;

/// Errors surfaced by the diagnostic stack
#[derive(Debug, thiserror::Error)]
pub enum DiagError {
    /// Error in the underlying CAN channel (send failure, receive timeout,
    /// malformed frame)
    #[error("transport error: {0}")]
    Transport(#[from] ChannelError),
    /// TP2.0 protocol violation
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The ECU answered with a KWP negative response
    #[error("ECU rejected service 0x{service:02X} with NRC 0x{nrc:02X} ({def})")]
    EcuError {
        /// Service id of the rejected request
        service: u8,
        /// Raw negative response code
        nrc: u8,
        /// NRC definition according to the KWP2000 specification
        def: String,
    },
    /// The ECU declared a zero-length response
    #[error("ECU provided an empty response")]
    EmptyResponse,
    /// The ECU responded to a different service than the one requested
    #[error("ECU response message did not match request")]
    WrongMessage,
    /// Configuration problem
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Error on the local message fabric
    #[error("fabric error: {0}")]
    Bus(#[from] BusError),
    /// A control-surface operation did not complete in time
    #[error("control endpoint busy")]
    BusBusy,
}
