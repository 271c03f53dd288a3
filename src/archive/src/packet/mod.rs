pub mod hrd;
pub mod pd;
pub mod tm;
pub mod vmu;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use hrdp_common::error::DecodeError;
use serde::{Deserialize, Serialize};

pub use hrd::HrdPacket;
pub use pd::PdPacket;
pub use tm::TmPacket;
pub use vmu::{VmuChannel, VmuPacket};

pub const HRDL_LEN: usize = 18;
pub const VMU_LEN: usize = 24;
pub const PTH_LEN: usize = 10;
pub const CCSDS_LEN: usize = 6;
pub const ESA_LEN: usize = 10;
pub const UMI_LEN: usize = 25;

/// Packet is one decoded RT record. Records share their bytes with the
/// frame they were decoded from; cloning a packet is cheap.
#[derive(Debug, Clone)]
pub enum Packet {
    Tm(TmPacket),
    Pd(PdPacket),
    Vmu(VmuPacket),
    Hrd(HrdPacket),
}

impl Packet {
    /// id returns the two-component identity of the packet: (apid, source)
    /// for TM, (48-bit code, code[0]) for PD, (channel, origin) for VMU and
    /// (origin, data type) for the high-rate data units.
    pub fn id(&self) -> (u64, u64) {
        match self {
            Packet::Tm(p) => p.id(),
            Packet::Pd(p) => p.id(),
            Packet::Vmu(p) => p.id(),
            Packet::Hrd(p) => p.id(),
        }
    }

    pub fn sequence(&self) -> u32 {
        match self {
            Packet::Tm(p) => p.sequence(),
            Packet::Pd(_) => 0,
            Packet::Vmu(p) => p.sequence(),
            Packet::Hrd(p) => p.sequence(),
        }
    }

    /// timestamp is the family-specific acquisition time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Packet::Tm(p) => p.timestamp(),
            Packet::Pd(p) => p.timestamp(),
            Packet::Vmu(p) => p.timestamp(),
            Packet::Hrd(p) => p.timestamp(),
        }
    }

    /// reception is the ground reception time; PD reuses its acquisition.
    pub fn reception(&self) -> DateTime<Utc> {
        match self {
            Packet::Tm(p) => p.reception(),
            Packet::Pd(p) => p.reception(),
            Packet::Vmu(p) => p.reception(),
            Packet::Hrd(p) => p.reception(),
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            Packet::Tm(_) => false,
            Packet::Pd(p) => p.is_error(),
            Packet::Vmu(p) => p.is_error(),
            Packet::Hrd(p) => p.is_error(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// bytes returns the raw frame the packet was decoded from, 4-byte
    /// length prefix included. The high-rate sub-kinds carry only the
    /// inner data unit.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Packet::Tm(p) => p.bytes(),
            Packet::Pd(p) => p.bytes(),
            Packet::Vmu(p) => p.bytes(),
            Packet::Hrd(p) => p.bytes(),
        }
    }

    /// diff compares two packets of the same family and identity and
    /// returns the sequence gap between them, if any. Cross-family
    /// comparisons always return None.
    pub fn diff(&self, other: &Packet) -> Option<Gap> {
        match (self, other) {
            (Packet::Tm(a), Packet::Tm(b)) => a.diff(b),
            (Packet::Pd(a), Packet::Pd(b)) => a.diff(b),
            (Packet::Vmu(a), Packet::Vmu(b)) => a.diff(b),
            (Packet::Hrd(a), Packet::Hrd(b)) => a.diff(b),
            _ => None,
        }
    }

    /// less is the natural order within a family, used to break timestamp
    /// ties when merging.
    pub fn less(&self, other: &Packet) -> bool {
        match (self, other) {
            (Packet::Tm(a), Packet::Tm(b)) => a.sequence() < b.sequence(),
            (Packet::Pd(a), Packet::Pd(b)) => a.less(b),
            (Packet::Vmu(a), Packet::Vmu(b)) => a.less(b),
            (Packet::Hrd(a), Packet::Hrd(b)) => a.timestamp() < b.timestamp(),
            _ => false,
        }
    }

    pub fn info(&self) -> Info {
        match self {
            Packet::Tm(p) => p.info(),
            Packet::Pd(p) => p.info(),
            Packet::Vmu(p) => p.info(),
            Packet::Hrd(p) => p.info(),
        }
    }
}

/// Info is the portable per-packet summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub id: u64,
    pub sequence: u32,
    #[serde(rename = "length")]
    pub size: usize,
    #[serde(rename = "dtstamp")]
    pub acq_time: DateTime<Utc>,
    #[serde(rename = "checksum")]
    pub sum: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(rename = "data", default, skip_serializing_if = "String::is_empty")]
    pub typ: String,
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.typ.as_str() {
            "tm" => write!(f, "{}", self.id),
            "pp" => write!(f, "{:x}", self.id),
            "vmu" => write!(f, "{}", VmuChannel(self.id as u8)),
            "hrd" => write!(f, "{}-{:x}", self.context, self.id),
            _ => write!(f, "invalid"),
        }
    }
}

/// Gap is a detected discontinuity between two packets of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub id: u64,
    #[serde(rename = "dtstart")]
    pub starts: DateTime<Utc>,
    #[serde(rename = "dtend")]
    pub ends: DateTime<Utc>,
    pub last: u32,
    pub first: u32,
}

impl Gap {
    /// missing returns how many sequence counts fell inside the gap.
    pub fn missing(&self) -> u64 {
        (self.first as i64 - self.last as i64)
            .unsigned_abs()
            .saturating_sub(1)
    }

    pub fn duration(&self) -> Duration {
        self.ends - self.starts
    }
}

/// Coze accumulates per-identity packet counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coze {
    pub id: u64,
    #[serde(rename = "bytes")]
    pub size: u64,
    pub count: u64,
    pub missing: u64,
    pub error: u64,
}

impl Coze {
    pub fn update(&mut self, o: &Coze) {
        self.size += o.size;
        self.count += o.count;
        self.missing += o.missing;
        self.error += o.error;
    }

    // Ratio not defined by operations yet, kept for report compatibility.
    pub fn corrupted(&self) -> f64 {
        0.0
    }

    pub fn fill(&self) -> f64 {
        0.0
    }
}

/// Decoder selects the family decoder applied to each frame. ById wraps
/// another decoder and skips packets whose first identity component does
/// not match.
#[derive(Debug, Clone)]
pub enum Decoder {
    Tm,
    Pd,
    Vmu,
    Hrd,
    ById(u64, Box<Decoder>),
}

impl Decoder {
    pub fn by_id(id: u64, inner: Decoder) -> Decoder {
        Decoder::ById(id, Box::new(inner))
    }

    /// decode turns one full frame (4-byte prefix included) into a packet.
    pub fn decode(&self, frame: Bytes) -> Result<Packet, DecodeError> {
        match self {
            Decoder::Tm => tm::decode_tm(frame).map(Packet::Tm),
            Decoder::Pd => pd::decode_pd(frame).map(Packet::Pd),
            Decoder::Vmu => vmu::decode_vmu(frame).map(Packet::Vmu),
            Decoder::Hrd => {
                let v = vmu::decode_vmu(frame)?;
                v.data().map(Packet::Hrd)
            }
            Decoder::ById(id, inner) => {
                let p = inner.decode(frame)?;
                if *id > 0 && p.id().0 != *id {
                    return Err(DecodeError::Skip);
                }
                Ok(p)
            }
        }
    }
}

impl FromStr for Decoder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tm" | "pth" | "pt" => Ok(Decoder::Tm),
            "pd" | "pp" | "pdh" => Ok(Decoder::Pd),
            "vmu" => Ok(Decoder::Vmu),
            "hrd" => Ok(Decoder::Hrd),
            "" => Err(anyhow!("no packet type provided")),
            other => Err(anyhow!("unrecognized packet type {:?}", other)),
        }
    }
}

pub(crate) fn adler(bs: &[u8]) -> u32 {
    adler32::RollingAdler32::from_buffer(bs).hash()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_gap_missing() {
        let g = Gap {
            id: 0x1A2,
            starts: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ends: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 2).unwrap(),
            last: 7,
            first: 10,
        };
        assert_eq!(g.missing(), 2);
        assert_eq!(g.duration(), Duration::seconds(2));

        let none_missing = Gap { last: 0, first: 0, ..g };
        assert_eq!(none_missing.missing(), 0);
    }

    #[test]
    fn test_coze_update() {
        let mut z = Coze::default();
        z.update(&Coze { id: 1, size: 100, count: 2, missing: 1, error: 1 });
        z.update(&Coze { id: 2, size: 50, count: 1, missing: 0, error: 0 });
        assert_eq!(z.size, 150);
        assert_eq!(z.count, 3);
        assert_eq!(z.missing, 1);
        assert_eq!(z.error, 1);
        assert_eq!(z.corrupted(), 0.0);
    }

    #[test]
    fn test_decoder_from_str() {
        assert!(matches!("tm".parse::<Decoder>().unwrap(), Decoder::Tm));
        assert!(matches!("PDH".parse::<Decoder>().unwrap(), Decoder::Pd));
        assert!(matches!("vmu".parse::<Decoder>().unwrap(), Decoder::Vmu));
        assert!(matches!("hrd".parse::<Decoder>().unwrap(), Decoder::Hrd));
        assert!("".parse::<Decoder>().is_err());
        assert!("csv".parse::<Decoder>().is_err());
    }
}
