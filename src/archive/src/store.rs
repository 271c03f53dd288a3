use chrono::{DateTime, Utc};
use hrdp_common::time::split5;

use crate::packet::{HRDL_LEN, PTH_LEN};

/// store_pth frames a raw CCSDS+ESA packet as an RT record, stamping the
/// PTH reception time. The ingestion daemon uses these helpers; the
/// listeners themselves live outside this crate.
pub fn store_pth(bs: &[u8], now: DateTime<Utc>) -> Vec<u8> {
    let mut vs = Vec::with_capacity(bs.len() + PTH_LEN);
    vs.extend_from_slice(&(bs.len() as u32 + (PTH_LEN as u32 - 4)).to_le_bytes());
    vs.push(0x09);
    let (coarse, fine) = split5(now);
    vs.extend_from_slice(&coarse.to_be_bytes());
    vs.push(fine);
    vs.extend_from_slice(bs);
    vs
}

/// store_pdh frames a raw UMI packet: the parameter chain carries its
/// own header, only the length prefix is added.
pub fn store_pdh(bs: &[u8]) -> Vec<u8> {
    let mut vs = Vec::with_capacity(bs.len() + 4);
    vs.extend_from_slice(&(bs.len() as u32).to_le_bytes());
    vs.extend_from_slice(bs);
    vs
}

/// store_vmu frames a raw VMU packet with an HRDL header: channel and
/// acquisition seconds are lifted from the inner header, reception is
/// stamped now. The checksum region is unchanged by the rewrap.
pub fn store_vmu(bs: &[u8], now: DateTime<Utc>) -> Vec<u8> {
    let mut vs = Vec::with_capacity(bs.len() + HRDL_LEN);
    vs.extend_from_slice(&(bs.len() as u32 + (HRDL_LEN as u32 - 4)).to_le_bytes());
    vs.extend_from_slice(&0u16.to_be_bytes());
    vs.push(0);
    vs.push(if bs.len() > 8 { bs[8] } else { 0 });

    let (coarse, fine) = if bs.len() >= 22 {
        let coarse = u32::from_le_bytes(bs[16..20].try_into().unwrap());
        let fine = u16::from_le_bytes(bs[20..22].try_into().unwrap());
        (coarse, (fine >> 8) as u8)
    } else {
        (0, 0)
    };
    vs.extend_from_slice(&coarse.to_be_bytes());
    vs.push(fine);

    let (rc, rf) = split5(now);
    vs.extend_from_slice(&rc.to_be_bytes());
    vs.push(rf);

    vs.extend_from_slice(bs);
    vs
}
