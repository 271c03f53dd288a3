use chrono::{DateTime, Duration, TimeZone, Utc};

/// Archive-facing timestamp rendering, millisecond resolution.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

lazy_static! {
    /// UNIX is the epoch the composite time fields count from.
    pub static ref UNIX: DateTime<Utc> = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
    /// GPS is the mission epoch used by the high-rate chain.
    pub static ref GPS: DateTime<Utc> = Utc.with_ymd_and_hms(1980, 1, 6, 0, 0, 0).unwrap();
    /// FIVE is the archive bucket span.
    pub static ref FIVE: Duration = Duration::minutes(5);
    /// DAY is the aggregation bucket span.
    pub static ref DAY: Duration = Duration::hours(24);
}

/// gps_delta returns GPS minus UNIX; consumers add it to render an
/// UNIX-held instant on the GPS scale (or the other way around).
pub fn gps_delta() -> Duration {
    *GPS - *UNIX
}

/// join5 decodes the coarse/fine pair used by the ground headers:
/// seconds since the UNIX epoch plus fine/256 seconds, kept at
/// millisecond resolution.
pub fn join5(coarse: u32, fine: u8) -> DateTime<Utc> {
    let ms = (fine as i64 * 1000) / 256;
    DateTime::from_timestamp(coarse as i64, 0).unwrap() + Duration::milliseconds(ms)
}

/// join6 decodes the coarse/fine pair used by the VMU header, with a
/// 16-bit fine part (fine/65536 seconds).
pub fn join6(coarse: u32, fine: u16) -> DateTime<Utc> {
    let ms = (fine as i64 * 1000) / 65536;
    DateTime::from_timestamp(coarse as i64, 0).unwrap() + Duration::milliseconds(ms)
}

/// split5 is the encode-side inverse of join5.
pub fn split5(t: DateTime<Utc>) -> (u32, u8) {
    let coarse = t.timestamp() as u32;
    let fine = (t.timestamp_subsec_millis() as u32 * 256 / 1000) as u8;
    (coarse, fine)
}

/// truncate rounds t down to a multiple of span counted from the UNIX
/// epoch.
pub fn truncate(t: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    let span_ms = span.num_milliseconds();
    let ms = t.timestamp_millis();
    DateTime::from_timestamp_millis(ms - ms.rem_euclid(span_ms)).unwrap()
}

/// time_format renders t with the archive convention.
pub fn time_format(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join5() {
        let t = join5(3600, 128);
        assert_eq!(t.timestamp(), 3600);
        assert_eq!(t.timestamp_subsec_millis(), 500);

        let t = join5(0, 255);
        assert_eq!(t.timestamp_subsec_millis(), 996);
    }

    #[test]
    fn test_join6() {
        let t = join6(10, 32768);
        assert_eq!(t.timestamp(), 10);
        assert_eq!(t.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_split5_roundtrip() {
        let t = join5(86400, 64);
        let (coarse, fine) = split5(t);
        assert_eq!(coarse, 86400);
        assert_eq!(fine, 64);
    }

    #[test]
    fn test_truncate() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 30).unwrap();
        let b = truncate(t, *FIVE);
        assert_eq!(b, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
        assert_eq!(truncate(b, *FIVE), b);
    }

    #[test]
    fn test_gps_delta() {
        // 1980-01-06 is 3657 days past the UNIX epoch.
        assert_eq!(gps_delta(), Duration::days(3657));
    }

    #[test]
    fn test_time_format() {
        let t = join5(0, 128);
        assert_eq!(time_format(t), "1970-01-01 00:00:00.500");
    }
}
