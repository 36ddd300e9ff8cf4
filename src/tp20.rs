//! VW TP2.0 transport channel
//!
//! TP2.0 is a block-oriented session layer over classical CAN with dynamic
//! endpoint assignment. A channel is set up by broadcasting on 0x200; the ECU
//! answers on 0x201 with the CAN id it wants to be addressed on, and the
//! tester listens on its own id (0x300 by default, incremented per concurrent
//! channel). After timing parameter negotiation, KWP payloads travel in
//! sequenced blocks that the receiver acknowledges, and a periodic
//! keep-alive exchange stops the ECU from tearing the channel down.
//!
//! Frame header taxonomy (byte 0 of every TP2.0 frame):
//!
//! | Header | Meaning |
//! |--|--|
//! | `0x0N` / `0x1N` | last frame of a block, must be ACKed |
//! | `0x2N` | intermediate frame of a block, not ACKed |
//! | `0x9N` | wait indication: peer busy, restart the response timer |
//! | `0xA0`/`0xA1` | parameter set / ack |
//! | `0xA3` | keep-alive request |
//! | `0xA8` | disconnect |
//! | `0xBN` | ACK carrying the next expected sequence number |

use std::time::{Duration, Instant};

use crate::channel::{CanFrame, ChannelError, FrameIo};
use crate::{DiagError, DiagResult};

/// Channel setup requests are broadcast on this id
pub const BROADCAST_REQ: u16 = 0x200;
/// Channel setup responses arrive on this id
pub const BROADCAST_RESP: u16 = 0x201;
/// Default tester receive id; incremented by one per additional channel
pub const DEFAULT_TESTER_ID: u16 = 0x300;

/// T1 response timeout. The wire negotiation advertises a nominal 138 ms but
/// the instrument cluster regularly needs more than a second, so the local
/// timer is held at 2.5 s.
pub const T1_TIMEOUT: Duration = Duration::from_millis(2500);
/// T3 minimum inter-frame gap
pub const T3_GAP: Duration = Duration::from_millis(12);

const SETUP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Timing parameter frame: block size 15, T1 0x8A (138 ms nominal),
/// T3 0x32 (50 x 100 us)
const PARAMS_FRAME: [u8; 6] = [0xA0, 0x0F, 0x8A, 0xFF, 0x32, 0xFF];

const OP_KEEPALIVE: u8 = 0xA3;
const OP_ALIVE_ACK: u8 = 0xA1;
const OP_DISCONNECT: u8 = 0xA8;
/// Wait variant some ECUs send instead of 0xA1; treated as "alive"
const OP_ALIVE_WAIT: u8 = 0x93;

/// TP2.0 protocol violations
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer acknowledged a different sequence number than expected
    #[error("unexpected sequence number: expected 0x{expected:X}, got 0x{got:X}")]
    UnexpectedSequence {
        /// Sequence nibble we expected to be acknowledged
        expected: u8,
        /// Sequence nibble the peer sent
        got: u8,
    },
    /// No (valid) answer to the channel setup broadcast
    #[error("channel setup request was not answered")]
    SetupRefused,
    /// Timing parameter negotiation failed
    #[error("timing parameter negotiation refused")]
    ParamsRefused,
    /// The peer sent 0xA8 and closed the channel
    #[error("peer closed the channel")]
    PeerDisconnect,
    /// Operation requires a connected channel
    #[error("channel is not connected")]
    NotConnected,
}

/// Rolling 4-bit TP2.0 sequence number.
///
/// All wrap-around arithmetic lives here; the rest of the engine treats
/// sequence counters as opaque values.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SeqNr(u8);

impl SeqNr {
    /// Wraps a nibble into a sequence number
    pub fn new(n: u8) -> Self {
        Self(n & 0x0F)
    }

    /// Current 4-bit value
    pub fn value(self) -> u8 {
        self.0
    }

    /// The following sequence number, wrapping 15 -> 0
    #[must_use]
    pub fn next(self) -> Self {
        Self((self.0 + 1) & 0x0F)
    }

    /// Advances the counter, returning the value before the increment
    pub fn bump(&mut self) -> u8 {
        let cur = self.0;
        *self = self.next();
        cur
    }
}

/// TP2.0 channel lifecycle
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum ChannelState {
    /// No channel established
    Closed,
    /// Setup broadcast sent, waiting for the 0xD0 reply
    SetupPending,
    /// Timing parameters sent, waiting for the 0xA1 ack
    ParamsPending,
    /// Channel fully negotiated
    Connected,
    /// Channel torn down (locally or by the peer)
    Disconnected,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FrameKind {
    /// 0x0N/0x1N - last frame of a block, expects an ACK
    BlockEnd(u8),
    /// 0x2N - intermediate frame
    Data(u8),
    /// 0x9N - wait indication
    Wait,
    /// 0xA0..0xAF control opcodes
    Control(u8),
    /// 0xBN - receiver ACK
    Ack(u8),
    /// Anything else
    Unknown(u8),
}

fn classify(op: u8) -> FrameKind {
    match op & 0xF0 {
        0x00 | 0x10 => FrameKind::BlockEnd(op & 0x0F),
        0x20 => FrameKind::Data(op & 0x0F),
        0x90 => FrameKind::Wait,
        0xA0 => FrameKind::Control(op),
        0xB0 => FrameKind::Ack(op & 0x0F),
        _ => FrameKind::Unknown(op),
    }
}

/// One TP2.0 connection to one ECU.
///
/// The channel exclusively owns its CAN handle. It never reconnects on its
/// own; every timeout and protocol violation is reported to the caller.
pub struct Tp20Channel {
    io: Box<dyn FrameIo>,
    module: u8,
    tester_id: u16,
    tx_id: u16,
    state: ChannelState,
    tx_seq: SeqNr,
    rx_seq: SeqNr,
    t1: Duration,
    t3: Duration,
    t1_strikes: u8,
}

impl std::fmt::Debug for Tp20Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tp20Channel")
            .field("module", &self.module)
            .field("tester_id", &self.tester_id)
            .field("tx_id", &self.tx_id)
            .field("state", &self.state)
            .finish()
    }
}

impl Tp20Channel {
    /// Creates a closed channel towards `module` (EG: 0x01 engine, 0x17
    /// instruments), listening on `tester_id`
    pub fn new(io: Box<dyn FrameIo>, module: u8, tester_id: u16) -> Self {
        Self {
            io,
            module,
            tester_id,
            tx_id: 0,
            state: ChannelState::Closed,
            tx_seq: SeqNr::default(),
            rx_seq: SeqNr::default(),
            t1: T1_TIMEOUT,
            t3: T3_GAP,
            t1_strikes: 0,
        }
    }

    /// Target module address
    pub fn module(&self) -> u8 {
        self.module
    }

    /// The CAN id this channel listens on
    pub fn tester_id(&self) -> u16 {
        self.tester_id
    }

    /// The ECU-assigned CAN id this channel transmits on (0 before setup)
    pub fn tx_id(&self) -> u16 {
        self.tx_id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// True once parameter negotiation completed and no teardown happened
    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    /// Performs the dynamic channel setup.
    ///
    /// Broadcasts the setup request, resolves the ECU-assigned transmit id
    /// from the 0xD0 reply, then negotiates timing parameters. Sequence
    /// counters restart at zero. Any step failing within 1 s aborts the
    /// setup and leaves the channel Closed.
    pub fn connect(&mut self) -> DiagResult<()> {
        let res = self.try_connect();
        if res.is_err() {
            self.state = ChannelState::Closed;
        }
        res
    }

    fn try_connect(&mut self) -> DiagResult<()> {
        self.state = ChannelState::Closed;
        self.tx_seq = SeqNr::default();
        self.rx_seq = SeqNr::default();
        self.t1_strikes = 0;
        self.io.drain()?;

        log::debug!("TP2: connecting to module 0x{:02X}", self.module);
        let setup = [self.module, 0xC0, 0x00, 0x10, 0x00, 0x03, 0x01];
        self.send_frame(BROADCAST_REQ, &setup)?;
        self.state = ChannelState::SetupPending;

        let resp = match self.recv_on(BROADCAST_RESP, SETUP_TIMEOUT)? {
            Some(frame) => frame,
            None => {
                self.state = ChannelState::Closed;
                log::warn!("TP2: module 0x{:02X} did not answer setup", self.module);
                return Err(ProtocolError::SetupRefused.into());
            }
        };
        let data = resp.data();
        if data.len() < 6 || data[1] != 0xD0 {
            self.state = ChannelState::Closed;
            log::warn!("TP2: invalid setup response {:02X?}", data);
            return Err(ProtocolError::SetupRefused.into());
        }
        self.tx_id = u16::from(data[5]) << 8 | u16::from(data[4]);
        self.state = ChannelState::ParamsPending;
        log::debug!(
            "TP2: module 0x{:02X} assigned tx id 0x{:03X}, rx on 0x{:03X}",
            self.module,
            self.tx_id,
            self.tester_id
        );

        self.send_frame(self.tx_id, &PARAMS_FRAME)?;
        match self.recv_on(self.tester_id, SETUP_TIMEOUT)? {
            Some(frame) if frame.data().first() == Some(&OP_ALIVE_ACK) => {
                self.state = ChannelState::Connected;
                log::info!("TP2: module 0x{:02X} connected", self.module);
                Ok(())
            }
            other => {
                self.state = ChannelState::Closed;
                log::warn!(
                    "TP2: parameter negotiation with 0x{:02X} failed: {:02X?}",
                    self.module,
                    other.as_ref().map(CanFrame::data)
                );
                Err(ProtocolError::ParamsRefused.into())
            }
        }
    }

    /// Sends one KWP payload and returns the reassembled KWP response.
    ///
    /// The receive queue is drained of stale frames first. Payloads of up to
    /// five bytes go out as a single `0x1N` frame; longer payloads are split
    /// into `0x2N` continuations with a final `0x1N`, staying within one
    /// negotiated block (15 frames covers every KWP request this gateway
    /// issues).
    pub fn send_request(&mut self, payload: &[u8]) -> DiagResult<Vec<u8>> {
        if self.state != ChannelState::Connected {
            return Err(ProtocolError::NotConnected.into());
        }
        self.io.drain()?;
        self.transmit_block(payload)?;
        self.await_ack()?;
        self.read_response()
    }

    /// Sends the keep-alive ping and waits for the acknowledgement.
    ///
    /// Both 0xA1 and the 0x93 wait variant count as alive. 0xA8 or silence
    /// within T1 marks the channel disconnected.
    pub fn keep_alive(&mut self) -> DiagResult<()> {
        if self.state != ChannelState::Connected {
            return Err(ProtocolError::NotConnected.into());
        }
        self.send_frame(self.tx_id, &[OP_KEEPALIVE])?;
        match self.recv_on(self.tester_id, self.t1)? {
            Some(frame) => match frame.data().first() {
                Some(&OP_ALIVE_ACK) | Some(&OP_ALIVE_WAIT) => {
                    self.t1_strikes = 0;
                    Ok(())
                }
                Some(&OP_DISCONNECT) => {
                    log::info!("TP2: module 0x{:02X} disconnected during keep-alive", self.module);
                    self.state = ChannelState::Disconnected;
                    Err(ProtocolError::PeerDisconnect.into())
                }
                other => {
                    log::warn!("TP2: unexpected keep-alive reply {other:02X?}");
                    Err(DiagError::WrongMessage)
                }
            },
            None => {
                log::warn!("TP2: keep-alive to 0x{:02X} timed out", self.module);
                self.state = ChannelState::Disconnected;
                Err(ChannelError::ReadTimeout.into())
            }
        }
    }

    /// Best-effort disconnect: sends 0xA8 and clears the connected flag
    pub fn disconnect(&mut self) {
        if self.tx_id != 0 && self.state == ChannelState::Connected {
            if let Err(e) = self.io.send(self.tx_id, &[OP_DISCONNECT]) {
                log::debug!("TP2: disconnect frame not sent: {e}");
            }
        }
        self.state = ChannelState::Disconnected;
        log::debug!("TP2: module 0x{:02X} channel now {}", self.module, self.state);
    }

    fn send_frame(&mut self, id: u16, data: &[u8]) -> DiagResult<()> {
        log::trace!("TX id=0x{id:03X} data={data:02X?}");
        self.io.send(id, data)?;
        std::thread::sleep(self.t3);
        Ok(())
    }

    /// Waits for the next frame on `id`, discarding traffic for other ids
    fn recv_on(&mut self, id: u16, timeout: Duration) -> DiagResult<Option<CanFrame>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.io.recv(remaining)? {
                Some(frame) if frame.id() == id => {
                    log::trace!("RX id=0x{:03X} data={:02X?}", frame.id(), frame.data());
                    return Ok(Some(frame));
                }
                Some(frame) => {
                    log::trace!("RX (ignored) id=0x{:03X} data={:02X?}", frame.id(), frame.data());
                }
                None => return Ok(None),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn transmit_block(&mut self, payload: &[u8]) -> DiagResult<()> {
        let len = payload.len();
        if len <= 5 {
            let mut frame = Vec::with_capacity(3 + len);
            frame.push(0x10 | self.tx_seq.bump());
            frame.push((len >> 8) as u8);
            frame.push(len as u8);
            frame.extend_from_slice(payload);
            self.send_frame(self.tx_id, &frame)?;
            return Ok(());
        }
        // First frame carries the 16-bit length and five payload bytes
        let mut frame = Vec::with_capacity(8);
        frame.push(0x20 | self.tx_seq.bump());
        frame.push((len >> 8) as u8);
        frame.push(len as u8);
        frame.extend_from_slice(&payload[..5]);
        self.send_frame(self.tx_id, &frame)?;

        let mut sent = 5;
        while sent < len {
            let end = (sent + 7).min(len);
            let op = if end == len { 0x10 } else { 0x20 };
            let mut frame = Vec::with_capacity(1 + end - sent);
            frame.push(op | self.tx_seq.bump());
            frame.extend_from_slice(&payload[sent..end]);
            self.send_frame(self.tx_id, &frame)?;
            sent = end;
        }
        Ok(())
    }

    /// Waits for the block ACK after a transmitted request. The ACK's low
    /// nibble must equal the sequence number following the last transmitted
    /// frame.
    fn await_ack(&mut self) -> DiagResult<()> {
        let expected = self.tx_seq.value();
        let mut deadline = Instant::now() + self.t1;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.t1_strike();
                return Err(ChannelError::ReadTimeout.into());
            }
            let frame = match self.recv_on(self.tester_id, remaining)? {
                Some(frame) => frame,
                None => {
                    self.t1_strike();
                    return Err(ChannelError::ReadTimeout.into());
                }
            };
            let Some(&op) = frame.data().first() else {
                continue;
            };
            match classify(op) {
                FrameKind::Ack(seq) if seq == expected => {
                    self.t1_strikes = 0;
                    return Ok(());
                }
                FrameKind::Ack(seq) => {
                    return Err(ProtocolError::UnexpectedSequence {
                        expected,
                        got: seq,
                    }
                    .into());
                }
                FrameKind::Control(OP_KEEPALIVE) => {
                    self.send_frame(self.tx_id, &[OP_ALIVE_ACK])?;
                }
                FrameKind::Control(OP_DISCONNECT) => {
                    self.state = ChannelState::Disconnected;
                    return Err(ProtocolError::PeerDisconnect.into());
                }
                FrameKind::Wait => {
                    deadline = Instant::now() + self.t1;
                }
                other => {
                    log::warn!("TP2: unexpected frame while awaiting ACK: {other:?}");
                }
            }
        }
    }

    /// Reassembles one KWP response.
    ///
    /// The first data frame declares the 16-bit response length; exactly that
    /// many bytes are returned, truncating any trailing padding. Every block
    /// end frame is acknowledged.
    fn read_response(&mut self) -> DiagResult<Vec<u8>> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut expected_len: Option<usize> = None;
        let mut deadline = Instant::now() + self.t1;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.t1_strike();
                return Err(ChannelError::ReadTimeout.into());
            }
            let frame = match self.recv_on(self.tester_id, remaining)? {
                Some(frame) => frame,
                None => {
                    self.t1_strike();
                    return Err(ChannelError::ReadTimeout.into());
                }
            };
            let data = frame.data();
            let Some(&op) = data.first() else {
                continue;
            };
            match classify(op) {
                // Stray ACK, likely from an earlier keep-alive
                FrameKind::Ack(_) => continue,
                FrameKind::Control(OP_KEEPALIVE) => {
                    self.send_frame(self.tx_id, &[OP_ALIVE_ACK])?;
                }
                FrameKind::Control(OP_DISCONNECT) => {
                    log::info!("TP2: module 0x{:02X} disconnected mid-response", self.module);
                    self.state = ChannelState::Disconnected;
                    return Err(ProtocolError::PeerDisconnect.into());
                }
                FrameKind::Wait => {
                    log::debug!("TP2: wait indication 0x{op:02X}, re-arming T1");
                    deadline = Instant::now() + self.t1;
                }
                FrameKind::BlockEnd(seq) | FrameKind::Data(seq) => {
                    let payload = match expected_len {
                        None => {
                            if data.len() < 3 {
                                log::warn!("TP2: malformed first response frame {data:02X?}");
                                continue;
                            }
                            let declared = usize::from(data[1]) << 8 | usize::from(data[2]);
                            expected_len = Some(declared);
                            self.rx_seq = SeqNr::new(seq);
                            &data[3..]
                        }
                        Some(_) => {
                            if seq != self.rx_seq.next().value() {
                                log::warn!(
                                    "TP2: response sequence jumped from 0x{:X} to 0x{seq:X}",
                                    self.rx_seq.value()
                                );
                            }
                            self.rx_seq = SeqNr::new(seq);
                            &data[1..]
                        }
                    };
                    let declared = expected_len.unwrap_or(0);
                    let need = declared.saturating_sub(buffer.len());
                    buffer.extend_from_slice(&payload[..payload.len().min(need)]);
                    if matches!(classify(op), FrameKind::BlockEnd(_)) {
                        let ack = [0xB0 | SeqNr::new(seq).next().value()];
                        self.send_frame(self.tx_id, &ack)?;
                    }
                    if buffer.len() >= declared {
                        self.t1_strikes = 0;
                        if declared == 0 {
                            return Err(DiagError::EmptyResponse);
                        }
                        return Ok(buffer);
                    }
                }
                FrameKind::Control(other) => {
                    log::warn!("TP2: unexpected control frame 0x{other:02X}");
                }
                FrameKind::Unknown(other) => {
                    log::warn!("TP2: unknown frame type 0x{other:02X}");
                }
            }
        }
    }

    /// Two T1 exhaustions in a row tear the channel down
    fn t1_strike(&mut self) {
        self.t1_strikes += 1;
        if self.t1_strikes >= 2 {
            log::warn!(
                "TP2: module 0x{:02X} timed out twice in a row, marking disconnected",
                self.module
            );
            self.state = ChannelState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_nr_wraps_modulo_16() {
        let mut seq = SeqNr::default();
        for expect in 0..=15u8 {
            assert_eq!(seq.bump(), expect);
        }
        assert_eq!(seq.value(), 0);
        assert_eq!(SeqNr::new(15).next().value(), 0);
    }

    #[test]
    fn ack_nibble_follows_transmitted_sequence() {
        // The receiver ACKs with (seq + 1) mod 16
        for seq in 0..=15u8 {
            let ack = 0xB0 | SeqNr::new(seq).next().value();
            assert_eq!(ack & 0x0F, (seq + 1) % 16);
            assert_eq!(ack & 0xF0, 0xB0);
        }
    }

    #[test]
    fn header_classification() {
        assert_eq!(classify(0x1A), FrameKind::BlockEnd(0x0A));
        assert_eq!(classify(0x05), FrameKind::BlockEnd(0x05));
        assert_eq!(classify(0x23), FrameKind::Data(0x03));
        assert_eq!(classify(0x93), FrameKind::Wait);
        assert_eq!(classify(0xA3), FrameKind::Control(0xA3));
        assert_eq!(classify(0xB1), FrameKind::Ack(0x01));
        assert_eq!(classify(0x71), FrameKind::Unknown(0x71));
    }
}
