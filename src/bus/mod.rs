//! Local message fabric seam
//!
//! The gateway talks to the rest of the head unit over a pub/sub fabric:
//! decoded samples go out on the `HUDIY_DIAG` topic, commands arrive on a
//! request/reply endpoint, and ignition state comes in as `POWER_STATUS`
//! events. The fabric itself is an external collaborator; these traits keep
//! the core independent of it, with a ZeroMQ backend provided behind the
//! `zeromq` feature.

use std::time::Duration;

use serde::Serialize;

use crate::DiagResult;
use crate::measure::Measurement;

#[cfg(feature = "zeromq")]
pub mod zeromq;

/// Topic for outbound sample records
pub const DIAG_TOPIC: &str = "HUDIY_DIAG";
/// Topic carrying `{kl15: bool}` ignition events
pub const POWER_TOPIC: &str = "POWER_STATUS";

/// Fabric endpoint error
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The endpoint could not be set up or used
    #[error("endpoint error: {0}")]
    Endpoint(String),
}

/// One decoded measuring-block read, as published
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Source module address
    pub module: u8,
    /// Measuring-block group
    pub group: u8,
    /// Decoded triplets, in wire order
    pub data: Vec<Measurement>,
}

/// Outbound sample stream. Publishing is fire-and-forget; errors are logged
/// by the caller and never interrupt polling.
pub trait SamplePublisher: Send {
    /// Publishes one sample under [DIAG_TOPIC]
    fn publish(&mut self, sample: &Sample) -> Result<(), BusError>;
}

/// The command request/reply endpoint
pub trait ControlEndpoint: Send {
    /// Waits up to `timeout` for the next request. `None` means no request
    /// arrived.
    fn recv_request(&mut self, timeout: Duration) -> DiagResult<Option<String>>;

    /// Sends the reply to the request last received
    fn send_reply(&mut self, reply: &str) -> DiagResult<()>;
}

/// Source of system events (ignition state)
pub trait SystemEvents: Send {
    /// Non-blocking: returns the next pending kl15 level, if any
    fn poll_ignition(&mut self) -> Option<bool>;
}
