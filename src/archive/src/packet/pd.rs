use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use hrdp_common::error::DecodeError;
use hrdp_common::time::join5;

use super::{adler, Gap, Info, UMI_LEN};

pub const UMI_CODE_LEN: usize = 6;

/// UmiState is the parameter acquisition state carried by the UMI header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UmiState(pub u8);

impl UmiState {
    pub const NO_VALUE: UmiState = UmiState(0);
    pub const SAME_VALUE: UmiState = UmiState(1);
    pub const NEW_VALUE: UmiState = UmiState(2);
    pub const LATEST_VALUE: UmiState = UmiState(3);
    pub const ERROR_VALUE: UmiState = UmiState(4);

    pub fn as_str(&self) -> &'static str {
        match *self {
            UmiState::NO_VALUE => "none",
            UmiState::SAME_VALUE => "same",
            UmiState::NEW_VALUE => "new",
            UmiState::LATEST_VALUE => "latest",
            UmiState::ERROR_VALUE => "unavailable",
            _ => "***",
        }
    }
}

impl fmt::Display for UmiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UmiValueType maps the raw parameter type to the coarse value class
/// used by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UmiValueType(pub u8);

impl UmiValueType {
    pub const INT32: UmiValueType = UmiValueType(1);
    pub const FLOAT64: UmiValueType = UmiValueType(2);
    pub const BINARY8: UmiValueType = UmiValueType(3);
    pub const REFERENCE: UmiValueType = UmiValueType(4);
    pub const STRING8: UmiValueType = UmiValueType(5);
    pub const LONG: UmiValueType = UmiValueType(6);
    pub const DECIMAL: UmiValueType = UmiValueType(7);
    pub const REAL: UmiValueType = UmiValueType(8);
    pub const EXPONENT: UmiValueType = UmiValueType(9);
    pub const TIME: UmiValueType = UmiValueType(10);
    pub const DATETIME: UmiValueType = UmiValueType(11);
    pub const STRING_N: UmiValueType = UmiValueType(12);
    pub const BINARY_N: UmiValueType = UmiValueType(13);
    pub const BIT: UmiValueType = UmiValueType(14);

    pub fn as_str(&self) -> &'static str {
        match *self {
            UmiValueType::INT32 | UmiValueType::LONG => "long",
            UmiValueType::FLOAT64
            | UmiValueType::REAL
            | UmiValueType::EXPONENT
            | UmiValueType::DECIMAL => "double",
            UmiValueType::BINARY8 | UmiValueType::BINARY_N => "binary",
            UmiValueType::REFERENCE => "reference",
            UmiValueType::STRING8 | UmiValueType::STRING_N => "string",
            UmiValueType::DATETIME | UmiValueType::TIME => "time",
            UmiValueType::BIT => "bit",
            _ => "***",
        }
    }
}

impl fmt::Display for UmiValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UmiHeader {
    pub size: u32,
    pub state: UmiState,
    pub orbit: u32,
    pub code: [u8; UMI_CODE_LEN],
    pub typ: UmiValueType,
    pub unit: u16,
    pub acquisition: DateTime<Utc>,
    pub len: u16,
}

impl UmiHeader {
    pub fn decode(bs: &[u8]) -> Result<UmiHeader, DecodeError> {
        if bs.len() < UMI_LEN {
            return Err(DecodeError::ShortBuffer);
        }
        let size = u32::from_le_bytes(bs[0..4].try_into().unwrap());
        let state = UmiState(bs[4]);
        let orbit = u32::from_be_bytes(bs[5..9].try_into().unwrap());
        let code: [u8; UMI_CODE_LEN] = bs[9..15].try_into().unwrap();
        let typ = UmiValueType(bs[15]);
        let unit = u16::from_be_bytes(bs[16..18].try_into().unwrap());
        let coarse = u32::from_be_bytes(bs[18..22].try_into().unwrap());
        let fine = bs[22];
        let len = u16::from_be_bytes(bs[23..25].try_into().unwrap());
        Ok(UmiHeader {
            size,
            state,
            orbit,
            code,
            typ,
            unit,
            acquisition: join5(coarse, fine),
            len,
        })
    }

    /// code_value packs the 48-bit UMI code into one integer.
    pub fn code_value(&self) -> u64 {
        let high = u16::from_be_bytes(self.code[0..2].try_into().unwrap()) as u64;
        let low = u32::from_be_bytes(self.code[2..6].try_into().unwrap()) as u64;
        (high << 32) | low
    }
}

/// PdPacket is one parameter-data record. It has no sequence counter;
/// continuity is judged on acquisition time alone.
#[derive(Debug, Clone)]
pub struct PdPacket {
    pub umi: UmiHeader,
    payload: Bytes,
}

pub fn decode_pd(frame: Bytes) -> Result<PdPacket, DecodeError> {
    if frame.len() < UMI_LEN {
        return Err(DecodeError::ShortBuffer);
    }
    let umi = UmiHeader::decode(&frame)?;
    Ok(PdPacket { umi, payload: frame })
}

impl PdPacket {
    pub fn id(&self) -> (u64, u64) {
        (self.umi.code_value(), self.umi.code[0] as u64)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.umi.acquisition
    }

    pub fn reception(&self) -> DateTime<Utc> {
        self.umi.acquisition
    }

    /// is_error reports the semantic error flag: a nonzero orbit marks
    /// the parameter as unusable.
    pub fn is_error(&self) -> bool {
        self.umi.orbit != 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn info(&self) -> Info {
        Info {
            id: self.umi.code_value(),
            sequence: 0,
            size: self.payload.len() - UMI_LEN,
            acq_time: self.timestamp(),
            sum: adler(&self.payload[UMI_LEN..]),
            context: String::new(),
            typ: "pp".to_string(),
        }
    }

    pub fn less(&self, other: &PdPacket) -> bool {
        if self.timestamp() != other.timestamp() {
            return self.timestamp() < other.timestamp();
        }
        self.umi.code_value() < other.umi.code_value()
    }

    /// diff declares a gap when two records of the same code are more
    /// than one second apart; PD has no sequence to compare.
    pub fn diff(&self, other: &PdPacket) -> Option<Gap> {
        if self.umi.code != other.umi.code {
            return None;
        }
        if other.timestamp() > self.timestamp() {
            return other.diff(self);
        }
        if self.timestamp() - other.timestamp() <= Duration::seconds(1) {
            return None;
        }
        Some(Gap {
            id: self.umi.code_value(),
            starts: other.timestamp(),
            ends: self.timestamp(),
            last: 0,
            first: 0,
        })
    }
}
