use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hrdp_common::error::DecodeError;
use hrdp_common::time::join5;

use super::{adler, Gap, Info, CCSDS_LEN, ESA_LEN, PTH_LEN};

/// PTH is the transport header prepended by the ground chain; its size
/// field doubles as the record length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PthHeader {
    pub size: u32,
    pub typ: u8,
    pub reception: DateTime<Utc>,
}

impl PthHeader {
    pub fn decode(bs: &[u8]) -> Result<PthHeader, DecodeError> {
        if bs.len() < PTH_LEN {
            return Err(DecodeError::ShortBuffer);
        }
        let size = u32::from_le_bytes(bs[0..4].try_into().unwrap());
        let typ = bs[4];
        let coarse = u32::from_be_bytes(bs[5..9].try_into().unwrap());
        let fine = bs[9];
        Ok(PthHeader { size, typ, reception: join5(coarse, fine) })
    }
}

/// CCSDS primary header: 11-bit apid and 14-bit sequence counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcsdsHeader {
    pub version: u16,
    pub fragment: u16,
    pub length: u16,
}

impl CcsdsHeader {
    pub fn decode(bs: &[u8]) -> Result<CcsdsHeader, DecodeError> {
        if bs.len() < CCSDS_LEN {
            return Err(DecodeError::ShortBuffer);
        }
        Ok(CcsdsHeader {
            version: u16::from_be_bytes(bs[0..2].try_into().unwrap()),
            fragment: u16::from_be_bytes(bs[2..4].try_into().unwrap()),
            length: u16::from_be_bytes(bs[4..6].try_into().unwrap()),
        })
    }

    pub fn apid(&self) -> u16 {
        self.version & 0x07FF
    }

    pub fn sequence(&self) -> u16 {
        self.fragment & 0x3FFF
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EsaHeader {
    pub acquisition: DateTime<Utc>,
    pub info: u8,
    pub source: u32,
}

impl EsaHeader {
    pub fn decode(bs: &[u8]) -> Result<EsaHeader, DecodeError> {
        if bs.len() < ESA_LEN {
            return Err(DecodeError::ShortBuffer);
        }
        let coarse = u32::from_be_bytes(bs[0..4].try_into().unwrap());
        let fine = bs[4];
        Ok(EsaHeader {
            acquisition: join5(coarse, fine),
            info: bs[5],
            source: u32::from_be_bytes(bs[6..10].try_into().unwrap()),
        })
    }

    /// packet_type extracts the discrete kind from the low nibble of the
    /// info byte.
    pub fn packet_type(&self) -> EsaPacketType {
        EsaPacketType(self.info & 0x0F)
    }
}

/// EsaPacketType is the low nibble of ESA.info; the top two bits of the
/// nibble select the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EsaPacketType(pub u8);

impl EsaPacketType {
    pub const DATA_DUMP: EsaPacketType = EsaPacketType(1);
    pub const DATA_SEGMENT: EsaPacketType = EsaPacketType(2);
    pub const ESSENTIAL_HK: EsaPacketType = EsaPacketType(3);
    pub const SYSTEM_HK: EsaPacketType = EsaPacketType(4);
    pub const PAYLOAD_HK: EsaPacketType = EsaPacketType(5);
    pub const SCIENCE_DATA: EsaPacketType = EsaPacketType(6);
    pub const ANCILLARY_DATA: EsaPacketType = EsaPacketType(7);
    pub const ESSENTIAL_CMD: EsaPacketType = EsaPacketType(8);
    pub const SYSTEM_CMD: EsaPacketType = EsaPacketType(9);
    pub const PAYLOAD_CMD: EsaPacketType = EsaPacketType(10);
    pub const DATA_LOAD: EsaPacketType = EsaPacketType(11);
    pub const RESPONSE: EsaPacketType = EsaPacketType(12);
    pub const REPORT: EsaPacketType = EsaPacketType(13);
    pub const EXCEPTION: EsaPacketType = EsaPacketType(14);
    pub const ACKNOWLEDGE: EsaPacketType = EsaPacketType(15);

    /// category returns the coarse class of the kind: data, command or
    /// event.
    pub fn category(&self) -> &'static str {
        match self.0 >> 2 {
            0 | 1 => "dat",
            2 => "cmd",
            3 => "evt",
            _ => "***",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            EsaPacketType::DATA_DUMP => "data dump",
            EsaPacketType::DATA_SEGMENT => "data segment",
            EsaPacketType::ESSENTIAL_HK => "essential hk",
            EsaPacketType::SYSTEM_HK => "system hk",
            EsaPacketType::PAYLOAD_HK => "payload hk",
            EsaPacketType::SCIENCE_DATA => "science data",
            EsaPacketType::ANCILLARY_DATA => "ancillary data",
            EsaPacketType::ESSENTIAL_CMD => "essential cmd",
            EsaPacketType::SYSTEM_CMD => "system cmd",
            EsaPacketType::PAYLOAD_CMD => "payload cmd",
            EsaPacketType::DATA_LOAD => "data load",
            EsaPacketType::RESPONSE => "response",
            EsaPacketType::REPORT => "report",
            EsaPacketType::EXCEPTION => "exception",
            EsaPacketType::ACKNOWLEDGE => "acknowledge",
            _ => "***",
        }
    }
}

impl fmt::Display for EsaPacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TmPacket is one telemetry record: PTH + CCSDS + ESA headers and the
/// full frame as payload.
#[derive(Debug, Clone)]
pub struct TmPacket {
    pub pth: PthHeader,
    pub ccsds: CcsdsHeader,
    pub esa: EsaHeader,
    payload: Bytes,
}

pub fn decode_tm(frame: Bytes) -> Result<TmPacket, DecodeError> {
    if frame.len() < PTH_LEN + CCSDS_LEN + ESA_LEN {
        return Err(DecodeError::ShortBuffer);
    }
    let pth = PthHeader::decode(&frame)?;
    let ccsds = CcsdsHeader::decode(&frame[PTH_LEN..])?;
    let esa = EsaHeader::decode(&frame[PTH_LEN + CCSDS_LEN..])?;
    Ok(TmPacket { pth, ccsds, esa, payload: frame })
}

impl TmPacket {
    pub fn id(&self) -> (u64, u64) {
        (self.ccsds.apid() as u64, self.esa.source as u64)
    }

    pub fn sequence(&self) -> u32 {
        self.ccsds.sequence() as u32
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.esa.acquisition
    }

    pub fn reception(&self) -> DateTime<Utc> {
        self.pth.reception
    }

    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn info(&self) -> Info {
        Info {
            id: self.ccsds.apid() as u64,
            sequence: self.sequence(),
            size: self.payload.len() - PTH_LEN,
            acq_time: self.timestamp(),
            sum: adler(&self.payload[PTH_LEN..]),
            context: self.esa.packet_type().to_string(),
            typ: "tm".to_string(),
        }
    }

    /// diff reports the gap between two TM packets of the same apid,
    /// taking the 14-bit sequence wrap into account. The chronologically
    /// earlier packet supplies `last`, the later one `first`.
    pub fn diff(&self, other: &TmPacket) -> Option<Gap> {
        if self.ccsds.apid() != other.ccsds.apid() {
            return None;
        }
        if other.timestamp() > self.timestamp() {
            return other.diff(self);
        }
        let delta = self.sequence().wrapping_sub(other.sequence()) & 0x3FFF;
        if delta <= 1 {
            return None;
        }
        Some(Gap {
            id: self.ccsds.apid() as u64,
            starts: other.timestamp(),
            ends: self.timestamp(),
            last: other.sequence(),
            first: self.sequence(),
        })
    }
}
