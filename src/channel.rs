//! Classical CAN frame I/O
//!
//! The diagnostic bus in these vehicles is a 100 kbit/s classical CAN segment
//! using only 11-bit identifiers. This module defines the frame type and the
//! two traits every hardware backend implements:
//! * [FrameIo] - send/receive on one open handle
//! * [CanInterface] - opens a fresh [FrameIo] handle per TP2.0 channel

use std::time::Duration;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Error produced by a CAN channel
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Underlying IO error with the channel
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Timeout reading from the channel
    #[error("timeout reading from channel")]
    ReadTimeout,
    /// The interface is not open
    #[error("channel interface is not open")]
    InterfaceNotOpen,
    /// Underlying API error with the hardware
    #[error("hardware API error: {0}")]
    Api(String),
}

/// A classical CAN frame: 11-bit identifier, 0..=8 data bytes.
///
/// The DLC always equals the data length; frames are never padded by this
/// layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u16,
    len: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Builds a frame from an identifier and up to 8 data bytes. Anything
    /// past 8 bytes is dropped.
    pub fn new(id: u16, data: &[u8]) -> Self {
        let len = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&data[..len]);
        Self {
            id,
            len: len as u8,
            data: buf,
        }
    }

    /// 11-bit arbitration id
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Data bytes (length equals the DLC)
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

/// Frame-level access to one open handle on the diagnostic bus.
///
/// A handle is only ever driven by a single thread; the polling worker owns
/// all I/O.
pub trait FrameIo: Send {
    /// Transmits one frame
    fn send(&mut self, id: u16, data: &[u8]) -> ChannelResult<()>;

    /// Waits up to `timeout` for the next frame. `None` means the timeout
    /// elapsed without traffic.
    fn recv(&mut self, timeout: Duration) -> ChannelResult<Option<CanFrame>>;

    /// Empties any pending receive queue without blocking
    fn drain(&mut self) -> ChannelResult<()>;
}

/// Opens per-channel handles on the (single) physical CAN bus
pub trait CanInterface: Send {
    /// Opens a fresh handle. Each TP2.0 channel exclusively owns the handle
    /// it was created with.
    fn open_channel(&mut self) -> ChannelResult<Box<dyn FrameIo>>;
}
