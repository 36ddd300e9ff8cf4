//! KWP2000 request/response layer
//!
//! Wraps a connected [Tp20Channel] and exposes the handful of KWP services
//! these ECUs actually answer. Positive responses carry the request service
//! id + 0x40; a negative response is `0x7F, service, NRC`.
//!
//! | Request | Positive response |
//! |--|--|
//! | `0x10, session` start diagnostic session | `0x50` |
//! | `0x21, group` read measuring block | `0x61, group, ...` |
//! | `0x18, group, statusHi, statusLo` read DTCs by status | `0x58, count, ...` |
//! | `0x1A, id` read ECU identification | `0x5A` |
//! | `0x3E, 0x00` tester present | `0x7E` |

use automotive_diag::ByteWrapper;
use automotive_diag::kwp2000::{KwpCommand, KwpErrorByte};

use crate::dtc::{self, Dtc};
use crate::tp20::Tp20Channel;
use crate::{DiagError, DiagResult};

/// Diagnostic session type used when bringing a module up for measuring
/// block reads.
///
/// 0x89 (Adjustment) is the only session the observed ECUs reliably accept;
/// 0x81/0xC0/0x01/0x03 are answered inconsistently across modules.
pub const DEFAULT_SESSION: u8 = 0x89;

/// KWP2000 client on top of one TP2.0 channel.
///
/// The client owns the channel; channel-level liveness operations stay
/// reachable through [KwpClient::channel_mut].
pub struct KwpClient {
    channel: Tp20Channel,
}

impl std::fmt::Debug for KwpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KwpClient")
            .field("channel", &self.channel)
            .finish()
    }
}

impl KwpClient {
    /// Wraps a channel (connected or not)
    pub fn new(channel: Tp20Channel) -> Self {
        Self { channel }
    }

    /// The underlying TP2.0 channel
    pub fn channel(&self) -> &Tp20Channel {
        &self.channel
    }

    /// Mutable access for channel lifecycle operations (connect, keep-alive,
    /// disconnect)
    pub fn channel_mut(&mut self) -> &mut Tp20Channel {
        &mut self.channel
    }

    /// Sends a raw KWP message and returns the reassembled reply.
    ///
    /// A `0x7F` negative response is returned verbatim - the transport
    /// succeeded; interpreting the reply is up to the caller.
    pub fn request(&mut self, payload: &[u8]) -> DiagResult<Vec<u8>> {
        let resp = self.channel.send_request(payload)?;
        if resp.is_empty() {
            return Err(DiagError::EmptyResponse);
        }
        Ok(resp)
    }

    /// Executes one service and validates the positive-response bias,
    /// converting negative responses into [DiagError::EcuError]
    pub fn execute(&mut self, cmd: KwpCommand, args: &[u8]) -> DiagResult<Vec<u8>> {
        let sid: u8 = cmd.into();
        let mut payload = Vec::with_capacity(1 + args.len());
        payload.push(sid);
        payload.extend_from_slice(args);
        let resp = self.request(&payload)?;
        check_positive(sid, resp)
    }

    /// StartDiagnosticSession (0x10). [DEFAULT_SESSION] is the session type
    /// that works for measuring-block reads on these ECUs.
    pub fn start_diagnostic_session(&mut self, session_type: u8) -> DiagResult<()> {
        self.execute(KwpCommand::StartDiagnosticSession, &[session_type])
            .map(|_| ())
    }

    /// ReadDataByLocalIdentifier (0x21): reads one measuring block and
    /// returns the triplet body with the echoed group byte stripped
    pub fn read_measuring_block(&mut self, group: u8) -> DiagResult<Vec<u8>> {
        let resp = self.execute(KwpCommand::ReadDataByLocalIdentifier, &[group])?;
        if resp.get(1) != Some(&group) {
            log::error!(
                "KWP: measuring block echo mismatch (wanted group {group}, got {:?})",
                resp.get(1)
            );
            return Err(DiagError::WrongMessage);
        }
        Ok(resp[2..].to_vec())
    }

    /// ReadDiagnosticTroubleCodesByStatus (0x18)
    pub fn read_dtcs_by_status(&mut self, group: u8, status: u16) -> DiagResult<Vec<Dtc>> {
        let args = [group, (status >> 8) as u8, status as u8];
        let resp = self.execute(KwpCommand::ReadDiagnosticTroubleCodesByStatus, &args)?;
        dtc::parse_dtcs(&resp[1..]).ok_or(DiagError::WrongMessage)
    }

    /// ReadECUIdentification (0x1A). Some ECUs drop the channel on specific
    /// identification ids - callers may skip this during bring-up.
    pub fn read_ecu_identification(&mut self, id: u8) -> DiagResult<Vec<u8>> {
        let resp = self.execute(KwpCommand::ReadECUIdentification, &[id])?;
        Ok(resp[1..].to_vec())
    }

    /// TesterPresent (0x3E 0x00), the application-layer keep-alive
    pub fn tester_present(&mut self) -> DiagResult<()> {
        self.execute(KwpCommand::TesterPresent, &[0x00]).map(|_| ())
    }
}

/// Checks the +0x40 positive-response bias, mapping `0x7F` replies to
/// [DiagError::EcuError]
fn check_positive(service: u8, resp: Vec<u8>) -> DiagResult<Vec<u8>> {
    if resp[0] == 0x7F {
        let nrc = resp.get(2).copied().unwrap_or(0);
        return Err(DiagError::EcuError {
            service,
            nrc,
            def: nrc_description(nrc),
        });
    }
    if resp[0] != service.wrapping_add(0x40) {
        log::error!(
            "KWP: SID mismatch: request 0x{service:02X}, response 0x{:02X}",
            resp[0]
        );
        return Err(DiagError::WrongMessage);
    }
    Ok(resp)
}

/// NRC definition according to the KWP2000 specification
pub fn nrc_description(nrc: u8) -> String {
    match KwpErrorByte::from(nrc) {
        ByteWrapper::Standard(e) => format!("{e:?}"),
        ByteWrapper::Extended(b) => format!("manufacturer specific (0x{b:02X})"),
    }
}
