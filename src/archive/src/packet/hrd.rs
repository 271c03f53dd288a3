use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use hrdp_common::error::DecodeError;
use hrdp_common::time::GPS;

use super::{Gap, Info};

/// Fixed prefix of the common data-unit header, before the UPI (science)
/// or the image sub-header (video).
pub const VMU_COMMON_LEN: usize = 24;
pub const VMU_IMAGE_LEN: usize = 20;
pub const UPI_LEN: usize = 32;

/// VmuCommonHeader is shared by both data-unit kinds. Times are
/// nanosecond offsets from the GPS epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmuCommonHeader {
    pub property: u8,
    pub stream: u16,
    pub counter: u32,
    pub acq_time: i64,
    pub aux_time: i64,
    pub origin: u8,
    pub upi: [u8; UPI_LEN],
    pub valid: bool,
}

impl VmuCommonHeader {
    pub fn acquisition(&self) -> DateTime<Utc> {
        *GPS + Duration::nanoseconds(self.acq_time)
    }

    pub fn auxiliary(&self) -> DateTime<Utc> {
        *GPS + Duration::nanoseconds(self.aux_time)
    }

    /// data_type names the unit kind encoded in the property high nibble.
    pub fn data_type(&self) -> &'static str {
        match self.property >> 4 {
            1 => "SCC",
            2 => "IMG",
            _ => "UNKNOWN",
        }
    }

    /// upi_string sanitizes the user packet identifier for use in paths
    /// and report keys; an empty tag falls back to the unit kind.
    pub fn upi_string(&self) -> String {
        let bs: &[u8] = {
            let mut s = &self.upi[..];
            while let [0, rest @ ..] = s {
                s = rest;
            }
            while let [rest @ .., 0] = s {
                s = rest;
            }
            s
        };
        if bs.is_empty() {
            return self.data_type().to_string();
        }
        bs.iter()
            .map(|&b| {
                let c = b as char;
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '*'
                }
            })
            .collect()
    }
}

fn decode_common(bs: &[u8], upi_offset: usize, valid: bool) -> Result<VmuCommonHeader, DecodeError> {
    if bs.len() < upi_offset + UPI_LEN {
        return Err(DecodeError::ShortBuffer);
    }
    Ok(VmuCommonHeader {
        property: bs[0],
        stream: u16::from_le_bytes(bs[1..3].try_into().unwrap()),
        counter: u32::from_le_bytes(bs[3..7].try_into().unwrap()),
        acq_time: i64::from_le_bytes(bs[7..15].try_into().unwrap()),
        aux_time: i64::from_le_bytes(bs[15..23].try_into().unwrap()),
        origin: bs[23],
        upi: bs[upi_offset..upi_offset + UPI_LEN].try_into().unwrap(),
        valid,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmuImageHeader {
    pub format: u8,
    pub pixels: u32,
    pub region: u64,
    pub drop: u16,
    pub scaling: u32,
    pub force: u8,
}

impl VmuImageHeader {
    fn decode(bs: &[u8]) -> Result<VmuImageHeader, DecodeError> {
        if bs.len() < VMU_IMAGE_LEN {
            return Err(DecodeError::ShortBuffer);
        }
        Ok(VmuImageHeader {
            format: bs[0],
            pixels: u32::from_le_bytes(bs[1..5].try_into().unwrap()),
            region: u64::from_le_bytes(bs[5..13].try_into().unwrap()),
            drop: u16::from_le_bytes(bs[13..15].try_into().unwrap()),
            scaling: u32::from_le_bytes(bs[15..19].try_into().unwrap()),
            force: bs[19],
        })
    }
}

/// HrdPacket is the inner data unit of a high-rate record: an image when
/// the sub-header is present, a science table otherwise. Its payload is
/// the unit itself, not the carrying frame.
#[derive(Debug, Clone)]
pub struct HrdPacket {
    pub common: VmuCommonHeader,
    pub image: Option<VmuImageHeader>,
    payload: Bytes,
}

/// decode_image parses a video data unit: common prefix, image
/// sub-header, then the UPI.
pub fn decode_image(bs: Bytes, valid: bool) -> Result<HrdPacket, DecodeError> {
    let common = decode_common(&bs, VMU_COMMON_LEN + VMU_IMAGE_LEN, valid)?;
    let image = VmuImageHeader::decode(&bs[VMU_COMMON_LEN..])?;
    Ok(HrdPacket { common, image: Some(image), payload: bs })
}

/// decode_table parses a science data unit: common prefix with the UPI
/// directly behind it.
pub fn decode_table(bs: Bytes, valid: bool) -> Result<HrdPacket, DecodeError> {
    let common = decode_common(&bs, VMU_COMMON_LEN, valid)?;
    Ok(HrdPacket { common, image: None, payload: bs })
}

impl HrdPacket {
    pub fn id(&self) -> (u64, u64) {
        (self.common.origin as u64, (self.common.property >> 4) as u64)
    }

    pub fn sequence(&self) -> u32 {
        self.common.counter
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.common.acquisition()
    }

    pub fn reception(&self) -> DateTime<Utc> {
        self.common.acquisition()
    }

    pub fn acquisition(&self) -> DateTime<Utc> {
        self.common.acquisition()
    }

    pub fn auxiliary(&self) -> DateTime<Utc> {
        self.common.auxiliary()
    }

    pub fn is_error(&self) -> bool {
        !self.common.valid
    }

    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn info(&self) -> Info {
        Info {
            id: self.common.origin as u64,
            sequence: self.common.counter,
            size: self.payload.len(),
            acq_time: self.common.acquisition(),
            sum: 0,
            context: self.common.upi_string(),
            typ: "hrd".to_string(),
        }
    }

    /// diff reports the gap between two units of the same origin and
    /// kind, on the common counter.
    pub fn diff(&self, other: &HrdPacket) -> Option<Gap> {
        if other.common.origin != self.common.origin
            || other.common.property >> 4 != self.common.property >> 4
        {
            return None;
        }
        if other.timestamp() > self.timestamp() {
            return other.diff(self);
        }
        if other.common.counter == self.common.counter
            || other.common.counter.wrapping_add(1) == self.common.counter
        {
            return None;
        }
        Some(Gap {
            id: self.common.origin as u64,
            starts: other.timestamp(),
            ends: self.timestamp(),
            last: other.common.counter,
            first: self.common.counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::vmu::tests::{image_unit, table_unit};

    #[test]
    fn test_decode_image_unit() {
        let p = decode_image(Bytes::from(image_unit(0x21, 44, b"CAM-LEFT")), true).unwrap();
        assert_eq!(p.common.property >> 4, 2);
        assert_eq!(p.common.stream, 1);
        assert_eq!(p.common.counter, 44);
        assert_eq!(p.common.origin, 0x21);
        assert_eq!(p.id(), (0x21, 2));
        assert_eq!(p.common.data_type(), "IMG");
        let img = p.image.unwrap();
        assert_eq!(img.format, 3);
        assert_eq!(img.pixels, 640 * 480);
        assert_eq!(p.common.upi_string(), "CAM-LEFT");
        assert!(!p.is_error());
        assert_eq!(p.acquisition(), *GPS + Duration::nanoseconds(1_000_000_000));
        assert_eq!(p.auxiliary(), *GPS + Duration::nanoseconds(2_000_000_000));
    }

    #[test]
    fn test_decode_table_unit() {
        let p = decode_table(Bytes::from(table_unit(0x11, 9, b"TBL")), false).unwrap();
        assert_eq!(p.common.data_type(), "SCC");
        assert_eq!(p.id(), (0x11, 1));
        assert!(p.image.is_none());
        assert!(p.is_error());
        let i = p.info();
        assert_eq!(i.typ, "hrd");
        assert_eq!(i.context, "TBL");
        assert_eq!(i.to_string(), "TBL-11");
    }

    #[test]
    fn test_upi_sanitize() {
        let p = decode_table(Bytes::from(table_unit(0x11, 9, b"a b/c")), true).unwrap();
        assert_eq!(p.common.upi_string(), "a*b*c");

        let empty = decode_table(Bytes::from(table_unit(0x11, 9, b"")), true).unwrap();
        assert_eq!(empty.common.upi_string(), "SCC");
    }

    #[test]
    fn test_short_unit() {
        let err = decode_table(Bytes::from(vec![0u8; VMU_COMMON_LEN + UPI_LEN - 1]), true)
            .unwrap_err();
        assert!(matches!(err, DecodeError::ShortBuffer));

        let err = decode_image(Bytes::from(table_unit(0x11, 9, b"X")), true).unwrap_err();
        assert!(matches!(err, DecodeError::ShortBuffer));
    }

    #[test]
    fn test_counter_gap() {
        let a = decode_table(Bytes::from(table_unit(0x11, 9, b"T")), true).unwrap();
        let mut unit = table_unit(0x11, 12, b"T");
        // push acquisition forward so chronology is unambiguous
        unit[7..15].copy_from_slice(&5_000_000_000i64.to_le_bytes());
        let b = decode_table(Bytes::from(unit), true).unwrap();

        let g = b.diff(&a).unwrap();
        assert_eq!(g.last, 9);
        assert_eq!(g.first, 12);
        assert_eq!(g.missing(), 2);
    }
}
