//! Diagnostic trouble code data
//!
//! KWP ReadDiagnosticTroubleCodesByStatus (0x18) reports DTCs as
//! `(high, low, status)` triples. The raw two-byte code is the VAG 5-digit
//! fault number in decimal.

use bitflags::bitflags;

bitflags! {
    /// KWP2000 DTC status byte
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DtcStatus: u8 {
        /// The DTC illuminates the malfunction indicator lamp
        const MIL_ON = 0b1000_0000;
        /// Readiness test for this DTC completed
        const READINESS = 0b0001_0000;
    }
}

/// One diagnostic trouble code as reported by the ECU
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Dtc {
    /// Raw two-byte code (the VAG fault number)
    pub raw: u16,
    /// Status byte, unknown bits retained
    pub status: DtcStatus,
}

impl Dtc {
    /// Human readable description for the well-known VAG fault numbers
    pub fn describe(&self) -> Option<&'static str> {
        lookup(self.raw)
    }

    /// True if this DTC turns on the check-engine lamp
    pub fn mil_on(&self) -> bool {
        self.status.contains(DtcStatus::MIL_ON)
    }
}

impl std::fmt::Display for Dtc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.describe() {
            Some(desc) => write!(f, "{} (0x{:04X}) - {}", self.raw, self.raw, desc),
            None => write!(f, "{} (0x{:04X})", self.raw, self.raw),
        }
    }
}

/// Parses a 0x58 response body (`count, (hi, lo, status) x count`) into DTCs.
///
/// `None` is returned when the body does not hold as many triples as its
/// count byte declares.
pub fn parse_dtcs(body: &[u8]) -> Option<Vec<Dtc>> {
    let (&count, rest) = body.split_first()?;
    let count = usize::from(count);
    if rest.len() < count * 3 {
        return None;
    }
    Some(
        rest.chunks_exact(3)
            .take(count)
            .map(|t| Dtc {
                raw: u16::from(t[0]) << 8 | u16::from(t[1]),
                status: DtcStatus::from_bits_retain(t[2]),
            })
            .collect(),
    )
}

/// Common VAG fault codes (small subset)
fn lookup(code: u16) -> Option<&'static str> {
    Some(match code {
        16485 => "Mass Air Flow Sensor (G70): Implausible Signal",
        16955 => "Brake Switch (F): Implausible Signal",
        17055 => "Cylinder 1 Glow Plug Circuit (Q10): Electrical Fault",
        17056 => "Cylinder 2 Glow Plug Circuit (Q11): Electrical Fault",
        17057 => "Cylinder 3 Glow Plug Circuit (Q12): Electrical Fault",
        17058 => "Cylinder 4 Glow Plug Circuit (Q13): Electrical Fault",
        17552 => "Mass Air Flow Sensor (G70): Open or Short to Ground",
        17964 => "Charge Pressure Control: Negative Deviation (Underboost)",
        17965 => "Charge Pressure Control: Positive Deviation (Overboost)",
        18010 => "Power Supply Terminal 30: Voltage too Low",
        19586 => "EGR System: Regulation Range Exceeded",
        65535 => "Internal Control Module Memory Error",
        _ => return None,
    })
}
