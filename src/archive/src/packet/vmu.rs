use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hrdp_common::error::DecodeError;
use hrdp_common::time::{join5, join6};

use super::hrd::{decode_image, decode_table, HrdPacket};
use super::{adler, Gap, Info, HRDL_LEN, VMU_LEN};

/// HRDL is the high-rate downlink header; its size field doubles as the
/// record length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HrdlHeader {
    pub size: u32,
    pub error: u16,
    pub payload: u8,
    pub channel: u8,
    pub acquisition: DateTime<Utc>,
    pub reception: DateTime<Utc>,
}

impl HrdlHeader {
    pub fn decode(bs: &[u8]) -> Result<HrdlHeader, DecodeError> {
        if bs.len() < HRDL_LEN {
            return Err(DecodeError::ShortBuffer);
        }
        let size = u32::from_le_bytes(bs[0..4].try_into().unwrap());
        let error = u16::from_be_bytes(bs[4..6].try_into().unwrap());
        let payload = bs[6];
        let channel = bs[7];
        let acq_coarse = u32::from_be_bytes(bs[8..12].try_into().unwrap());
        let acq_fine = bs[12];
        let rec_coarse = u32::from_be_bytes(bs[13..17].try_into().unwrap());
        let rec_fine = bs[17];
        Ok(HrdlHeader {
            size,
            error,
            payload,
            channel,
            acquisition: join5(acq_coarse, acq_fine),
            reception: join5(rec_coarse, rec_fine),
        })
    }
}

/// VmuChannel selects the downlink source: two video channels and the
/// science table channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmuChannel(pub u8);

impl VmuChannel {
    pub const VIC1: VmuChannel = VmuChannel(1);
    pub const VIC2: VmuChannel = VmuChannel(2);
    pub const LRSD: VmuChannel = VmuChannel(3);

    pub fn is_image(&self) -> bool {
        matches!(*self, VmuChannel::VIC1 | VmuChannel::VIC2)
    }

    pub fn is_table(&self) -> bool {
        *self == VmuChannel::LRSD
    }
}

impl fmt::Display for VmuChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            VmuChannel::VIC1 | VmuChannel::VIC2 => write!(f, "vic{}", self.0),
            VmuChannel::LRSD => f.write_str("lrsd"),
            _ => f.write_str("***"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmuHeader {
    pub word: u32,
    pub size: u32,
    pub channel: VmuChannel,
    pub origin: u8,
    pub sequence: u32,
    pub acquisition: DateTime<Utc>,
}

impl VmuHeader {
    pub fn decode(bs: &[u8]) -> Result<VmuHeader, DecodeError> {
        if bs.len() < VMU_LEN {
            return Err(DecodeError::ShortBuffer);
        }
        let word = u32::from_le_bytes(bs[0..4].try_into().unwrap());
        let size = u32::from_le_bytes(bs[4..8].try_into().unwrap());
        let channel = VmuChannel(bs[8]);
        let origin = bs[9];
        // bs[10..12] spare
        let sequence = u32::from_le_bytes(bs[12..16].try_into().unwrap());
        let coarse = u32::from_le_bytes(bs[16..20].try_into().unwrap());
        let fine = u16::from_le_bytes(bs[20..22].try_into().unwrap());
        // bs[22..24] spare
        Ok(VmuHeader {
            word,
            size,
            channel,
            origin,
            sequence,
            acquisition: join6(coarse, fine),
        })
    }
}

/// VmuPacket is one high-rate record: HRDL + VMU headers, the full frame
/// and the two sides of the payload checksum, computed once at decode.
#[derive(Debug, Clone)]
pub struct VmuPacket {
    pub hrh: HrdlHeader,
    pub vmu: VmuHeader,
    payload: Bytes,
    pub sum: u32,
    pub control: u32,
}

pub fn decode_vmu(frame: Bytes) -> Result<VmuPacket, DecodeError> {
    if frame.len() < HRDL_LEN + VMU_LEN {
        return Err(DecodeError::ShortBuffer);
    }
    let hrh = HrdlHeader::decode(&frame)?;
    let vmu = VmuHeader::decode(&frame[HRDL_LEN..])?;
    let sum = u32::from_le_bytes(frame[frame.len() - 4..].try_into().unwrap());
    let control = byte_sum(&frame[HRDL_LEN + 8..frame.len() - 4]);
    Ok(VmuPacket { hrh, vmu, payload: frame, sum, control })
}

/// byte_sum is the plain byte accumulation mod 2^32 used by the VMU
/// control word. The sum is order-independent, so wide strides are fair
/// game; one pass is fast enough here.
fn byte_sum(bs: &[u8]) -> u32 {
    bs.iter().fold(0u32, |s, &b| s.wrapping_add(b as u32))
}

impl VmuPacket {
    pub fn id(&self) -> (u64, u64) {
        (self.vmu.channel.0 as u64, self.vmu.origin as u64)
    }

    pub fn sequence(&self) -> u32 {
        self.vmu.sequence
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.vmu.acquisition
    }

    pub fn reception(&self) -> DateTime<Utc> {
        self.hrh.acquisition
    }

    /// is_error combines the downlink error word with the payload
    /// checksum; either one marks the record.
    pub fn is_error(&self) -> bool {
        self.hrh.error != 0 || self.sum != self.control
    }

    /// valid reports whether the trailing word matches the computed
    /// control sum.
    pub fn valid(&self) -> bool {
        self.sum == self.control
    }

    /// validate turns a checksum mismatch into a typed error for callers
    /// that refuse invalid records outright.
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.valid() {
            return Ok(());
        }
        Err(DecodeError::Invalid { expected: self.sum, computed: self.control })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    /// data decodes the inner data unit according to the channel: an
    /// image for the video channels, a science table for LRSD. Unknown
    /// channels are a decode failure left to the caller.
    pub fn data(&self) -> Result<HrdPacket, DecodeError> {
        let inner = self.payload.slice(HRDL_LEN + VMU_LEN..);
        match self.vmu.channel {
            VmuChannel::VIC1 | VmuChannel::VIC2 => decode_image(inner, self.valid()),
            VmuChannel::LRSD => decode_table(inner, self.valid()),
            VmuChannel(other) => Err(DecodeError::UnsupportedKind(other)),
        }
    }

    pub fn info(&self) -> Info {
        Info {
            id: self.vmu.channel.0 as u64,
            sequence: self.vmu.sequence,
            size: self.payload.len() - HRDL_LEN,
            acq_time: self.vmu.acquisition,
            sum: adler(&self.payload[HRDL_LEN..]),
            context: String::new(),
            typ: "vmu".to_string(),
        }
    }

    /// less orders by channel, then sequence; across channels the VMU
    /// size word is the tie-breaker.
    pub fn less(&self, other: &VmuPacket) -> bool {
        if self.vmu.channel == other.vmu.channel {
            return self.vmu.sequence < other.vmu.sequence;
        }
        self.vmu.size < other.vmu.size
    }

    /// diff reports the gap between two records of the same channel. The
    /// 32-bit counter is not expected to wrap inside an archive window.
    pub fn diff(&self, other: &VmuPacket) -> Option<Gap> {
        if other.vmu.acquisition > self.vmu.acquisition {
            return other.diff(self);
        }
        if other.vmu.channel != self.vmu.channel
            || other.vmu.sequence == self.vmu.sequence
            || other.vmu.sequence.wrapping_add(1) == self.vmu.sequence
        {
            return None;
        }
        Some(Gap {
            id: other.vmu.channel.0 as u64,
            starts: other.vmu.acquisition,
            ends: self.vmu.acquisition,
            last: other.vmu.sequence,
            first: self.vmu.sequence,
        })
    }
}
