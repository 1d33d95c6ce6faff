//! ISO-8601 conversions used by the `Datetime` datatype.
//!
//! DADB stores absolute instants as ISO-8601 strings with an explicit
//! timezone offset. `from_iso8601` accepts the compact "basic" form with no
//! punctuation between date and time components (`20220116T012345+00:00`),
//! which is what forensic tooling upstream of DADB tends to emit.

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::ValueError;

const BASIC_FORMAT: &str = "%Y%m%dT%H%M%S%:z";

/// Parses a basic-format ISO-8601 instant (`YYYYMMDDTHHMMSS±HH:MM`) into a UTC instant.
pub fn from_iso8601(s: &str) -> Result<DateTime<Utc>, ValueError> {
    DateTime::parse_from_str(s, BASIC_FORMAT)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ValueError::InvalidIso8601(s.to_string(), e.to_string()))
}

/// Formats a naive (timezone-less) datetime as `YYYY-MM-DDTHH:MM:SS`.
///
/// This is a plain textual formatter, independent of the `Datetime`
/// datatype's requirement that stored values carry a timezone.
pub fn isoformat(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    #[test]
    fn from_iso8601_parses_basic_format_with_offset() {
        let got = from_iso8601("20220116T012345+00:00").unwrap();
        let want = NaiveDate::from_ymd_opt(2022, 1, 16)
            .unwrap()
            .and_hms_opt(1, 23, 45)
            .unwrap()
            .and_utc();
        assert_eq!(got, want);
    }

    #[test]
    fn isoformat_formats_naive_datetime_without_offset() {
        let dt = NaiveDate::from_ymd_opt(2016, 4, 16)
            .unwrap()
            .and_hms_opt(14, 23, 45)
            .unwrap();
        assert_eq!(isoformat(&dt), "2016-04-16T14:23:45");
    }

    #[test]
    fn from_iso8601_rejects_garbage() {
        assert!(from_iso8601("not-a-date").is_err());
    }
}
