//! SocketCAN backend
//!
//! Opens one raw CAN socket per TP2.0 channel on a named network interface
//! (typically `can0`). The interface bitrate is configured outside this
//! process (`ip link set can0 type can bitrate 100000`); the diagnostic bus
//! runs at 100 kbit/s.

use std::time::{Duration, Instant};

use socketcan::{CanSocket, EmbeddedFrame, Frame, Socket, StandardId};

use crate::channel::{CanFrame, CanInterface, ChannelError, ChannelResult, FrameIo};

/// Factory for [SocketCanIo] handles on one named CAN interface
#[derive(Debug, Clone)]
pub struct SocketCanInterface {
    if_name: String,
}

impl SocketCanInterface {
    /// Creates a factory for the given interface name (EG: `can0`)
    pub fn new(if_name: impl Into<String>) -> Self {
        Self {
            if_name: if_name.into(),
        }
    }
}

impl CanInterface for SocketCanInterface {
    fn open_channel(&mut self) -> ChannelResult<Box<dyn FrameIo>> {
        let socket = CanSocket::open(&self.if_name)
            .map_err(|e| ChannelError::Api(format!("open {}: {e}", self.if_name)))?;
        socket.set_nonblocking(true)?;
        log::debug!("socketCAN: opened handle on {}", self.if_name);
        Ok(Box::new(SocketCanIo { socket }))
    }
}

/// One open raw CAN socket
pub struct SocketCanIo {
    socket: CanSocket,
}

impl std::fmt::Debug for SocketCanIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanIo").finish()
    }
}

impl FrameIo for SocketCanIo {
    fn send(&mut self, id: u16, data: &[u8]) -> ChannelResult<()> {
        let sid = StandardId::new(id)
            .ok_or_else(|| ChannelError::Api(format!("invalid 11-bit id 0x{id:X}")))?;
        let frame = socketcan::CanFrame::new(sid, data)
            .ok_or_else(|| ChannelError::Api(format!("invalid frame payload ({} bytes)", data.len())))?;
        self.socket.write_frame(&frame)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> ChannelResult<Option<CanFrame>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.socket.read_frame() {
                Ok(frame) => {
                    if frame.is_extended() {
                        // 29-bit traffic is not part of the diagnostic dialogue
                        continue;
                    }
                    return Ok(Some(CanFrame::new(frame.raw_id() as u16, frame.data())));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }

    fn drain(&mut self) -> ChannelResult<()> {
        loop {
            match self.socket.read_frame() {
                Ok(_) => continue,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }
}
