//! Decoding of the packed 32-bit exFAT timestamps.
//!
//! The packed value is `(date_word << 16) | time_word`: year since 1980
//! (7 bits), month (4), day (5), hour (5), minute (6) and seconds/2 (5).
//! A separate byte adds 10ms increments, and an optional UTC-offset byte
//! holds a quarter-hour offset in two's complement with bit 7 as the
//! validity flag.

/// One decoded point in time, as stored on disk. A missing or all-zero
/// packed field is represented as "unset" (`None` at the [`Timestamps`]
/// level), never as the epoch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timestamp {
    pub unix_seconds: i64,
    pub nanos: u32,
    /// Offset from UTC in quarter hours, when the on-disk validity bit was
    /// set. `None` means the offset was not recorded.
    pub utc_offset_quarter_hours: Option<i8>,
}

/// Created/modified/accessed triple of a file entry. Deleted entries keep
/// whatever the slot contained; nothing is repaired.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Timestamps {
    pub created: Option<Timestamp>,
    pub modified: Option<Timestamp>,
    pub accessed: Option<Timestamp>,
}

impl Timestamps {
    /// True when all three fields are unset. Used by the strict deep-validity
    /// heuristic for recovered entries.
    pub fn all_unset(&self) -> bool {
        self.created.is_none() && self.modified.is_none() && self.accessed.is_none()
    }
}

/// Days between 1970-01-01 and the given civil date (proleptic Gregorian).
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Decodes one packed timestamp. Returns `None` for an unset (all-zero)
/// field or one whose date bits are structurally impossible.
pub fn decode(packed: u32, increment_10ms: u8, utc_offset: u8) -> Option<Timestamp> {
    if packed == 0 {
        return None;
    }

    let date = packed >> 16;
    let time = packed & 0xFFFF;

    let year = 1980 + ((date >> 9) & 0x7F) as i64;
    let month = (date >> 5) & 0x0F;
    let day = date & 0x1F;
    let hour = (time >> 11) & 0x1F;
    let minute = (time >> 5) & 0x3F;
    let two_seconds = time & 0x1F;

    if month == 0 || month > 12 || day == 0 || day > 31 || hour > 23 || minute > 59 {
        return None;
    }

    let mut unix_seconds = days_from_civil(year, month, day) * 86_400
        + hour as i64 * 3_600
        + minute as i64 * 60
        + two_seconds as i64 * 2;

    // the 10ms byte holds 0..=199 extra centiseconds
    unix_seconds += (increment_10ms / 100) as i64;
    let nanos = (increment_10ms % 100) as u32 * 10_000_000;

    // bit 7 of the offset byte flags validity; the low 7 bits are a
    // two's-complement count of quarter hours
    let utc_offset_quarter_hours = if utc_offset & 0x80 != 0 {
        let raw = utc_offset & 0x7F;
        let quarters = if raw & 0x40 != 0 {
            (raw | 0x80) as i8 // sign-extend 7 -> 8 bits
        } else {
            raw as i8
        };
        Some(quarters)
    } else {
        None
    };

    Some(Timestamp {
        unix_seconds,
        nanos,
        utc_offset_quarter_hours,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(year: u32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> u32 {
        let date = ((year - 1980) << 9) | (month << 5) | day;
        let time = (hour << 11) | (min << 5) | (sec / 2);
        (date << 16) | time
    }

    #[test]
    fn test_decode_epoch_examples() {
        // 1980-01-01 00:00:00 = 315532800
        let ts = decode(pack(1980, 1, 1, 0, 0, 0), 0, 0).unwrap();
        assert_eq!(ts.unix_seconds, 315_532_800);
        assert_eq!(ts.nanos, 0);
        assert_eq!(ts.utc_offset_quarter_hours, None);

        // 2024-02-29 12:30:30 = 1709209830 (leap day)
        let ts = decode(pack(2024, 2, 29, 12, 30, 30), 0, 0).unwrap();
        assert_eq!(ts.unix_seconds, 1_709_209_830);
    }

    #[test]
    fn test_decode_10ms_increment() {
        // 150 centiseconds = +1s plus 500ms
        let ts = decode(pack(2020, 6, 1, 0, 0, 0), 150, 0).unwrap();
        let base = decode(pack(2020, 6, 1, 0, 0, 0), 0, 0).unwrap();
        assert_eq!(ts.unix_seconds, base.unix_seconds + 1);
        assert_eq!(ts.nanos, 500_000_000);
    }

    #[test]
    fn test_decode_utc_offset() {
        // UTC+1 = 4 quarter hours, validity bit set
        let ts = decode(pack(2020, 1, 1, 0, 0, 0), 0, 0x80 | 4).unwrap();
        assert_eq!(ts.utc_offset_quarter_hours, Some(4));

        // UTC-5 = -20 quarter hours, two's complement in 7 bits
        let ts = decode(pack(2020, 1, 1, 0, 0, 0), 0, 0x80 | (0x7F & (-20i8 as u8))).unwrap();
        assert_eq!(ts.utc_offset_quarter_hours, Some(-20));

        // validity bit clear: offset not recorded
        let ts = decode(pack(2020, 1, 1, 0, 0, 0), 0, 4).unwrap();
        assert_eq!(ts.utc_offset_quarter_hours, None);
    }

    #[test]
    fn test_decode_unset_and_garbage() {
        assert_eq!(decode(0, 0, 0), None);
        // month 0
        assert_eq!(decode(0x0001_0000, 0, 0), None);
        // month 15
        let date = (5u32 << 9) | (15 << 5) | 1;
        assert_eq!(decode(date << 16, 0, 0), None);
    }
}
