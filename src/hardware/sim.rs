//! Scripted simulation backend for exercising the stack without a vehicle

use std::collections::VecDeque;
use std::time::Duration;

use crate::channel::{CanFrame, CanInterface, ChannelResult, FrameIo};

type Handler = Box<dyn FnMut(u16, &[u8], &mut VecDeque<CanFrame>) + Send>;

/// A scripted CAN channel.
///
/// Every transmitted frame is handed to the callback together with the
/// channel's receive queue, so a test can play the ECU side of the dialogue
/// by pushing reply frames. `recv` pops the queue immediately and ignores
/// the timeout, which keeps the test suite fast.
pub struct SimulationChannel {
    handler: Handler,
    queue: VecDeque<CanFrame>,
}

impl SimulationChannel {
    /// Creates a channel around an ECU-side callback
    pub fn new(handler: impl FnMut(u16, &[u8], &mut VecDeque<CanFrame>) + Send + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            queue: VecDeque::new(),
        }
    }
}

impl std::fmt::Debug for SimulationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationChannel")
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl FrameIo for SimulationChannel {
    fn send(&mut self, id: u16, data: &[u8]) -> ChannelResult<()> {
        (self.handler)(id, data, &mut self.queue);
        Ok(())
    }

    fn recv(&mut self, _timeout: Duration) -> ChannelResult<Option<CanFrame>> {
        Ok(self.queue.pop_front())
    }

    fn drain(&mut self) -> ChannelResult<()> {
        self.queue.clear();
        Ok(())
    }
}

/// Hands out [SimulationChannel]s, one per opened TP2.0 channel
pub struct SimulationInterface {
    factory: Box<dyn FnMut() -> SimulationChannel + Send>,
}

impl SimulationInterface {
    /// Creates an interface from a channel factory
    pub fn new(factory: impl FnMut() -> SimulationChannel + Send + 'static) -> Self {
        Self {
            factory: Box::new(factory),
        }
    }
}

impl std::fmt::Debug for SimulationInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationInterface").finish()
    }
}

impl CanInterface for SimulationInterface {
    fn open_channel(&mut self) -> ChannelResult<Box<dyn FrameIo>> {
        Ok(Box::new((self.factory)()))
    }
}
