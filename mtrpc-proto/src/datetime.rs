//! ISO-8601 date/time encoding (spec.md §6).
//!
//! Wire format: `YYYYMMDDThh:mm:ss[.ffffff]` — a microsecond-precision form
//! and a seconds-only form, matching `mtrpc/common/encoding.py`'s
//! `ISO8601_FORMAT_V26` / `ISO8601_FORMAT_V25`. Encoding always emits the
//! microsecond-precision form; decoding accepts either.

use chrono::NaiveDateTime;

const FORMAT_MICROS: &str = "%Y%m%dT%H:%M:%S%.6f";
const FORMAT_SECS: &str = "%Y%m%dT%H:%M:%S";

/// Render `dt` as the wire's canonical (microsecond-precision) string form.
pub fn format_iso8601(dt: &NaiveDateTime) -> String {
    dt.format(FORMAT_MICROS).to_string()
}

/// Parse `s` as either precision form; `None` if it matches neither, in
/// which case the caller should treat it as a plain string (spec.md §6).
pub fn parse_iso8601(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, FORMAT_MICROS)
        .or_else(|_| NaiveDateTime::parse_from_str(s, FORMAT_SECS))
        .ok()
}

/// `#[serde(with = "mtrpc_proto::datetime::iso8601")]` helper for procedures
/// that declare a typed request/response struct with a timestamp field.
pub mod iso8601 {
    use super::{format_iso8601, parse_iso8601};
    use chrono::NaiveDateTime;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(dt: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_iso8601(dt))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_iso8601(&s).ok_or_else(|| D::Error::custom(format!("not an ISO-8601 timestamp: {s}")))
    }

    /// Same as above but for `Option<NaiveDateTime>` fields.
    pub mod option {
        use super::{format_iso8601, parse_iso8601};
        use chrono::NaiveDateTime;
        use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(dt: &Option<NaiveDateTime>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match dt {
                Some(dt) => serializer.serialize_str(&format_iso8601(dt)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDateTime>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt = Option::<String>::deserialize(deserializer)?;
            opt.map(|s| {
                parse_iso8601(&s)
                    .ok_or_else(|| D::Error::custom(format!("not an ISO-8601 timestamp: {s}")))
            })
            .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2011, 1, 2)
            .unwrap()
            .and_hms_micro_opt(15, 30, 15, 30101)
            .unwrap()
    }

    #[test]
    fn formats_with_microsecond_precision() {
        assert_eq!(format_iso8601(&sample()), "20110102T15:30:15.030101");
    }

    #[test]
    fn parses_microsecond_precision_form() {
        let parsed = parse_iso8601("20110102T15:30:15.030101").unwrap();
        assert_eq!(parsed, sample());
    }

    #[test]
    fn parses_second_precision_form() {
        let parsed = parse_iso8601("20110102T15:30:15").unwrap();
        assert_eq!(parsed.and_utc().timestamp(), sample().and_utc().timestamp());
    }

    #[test]
    fn non_matching_strings_are_not_datetimes() {
        assert!(parse_iso8601("2011").is_none());
        assert!(parse_iso8601("hello world").is_none());
    }

    #[test]
    fn roundtrips_through_format_and_parse() {
        let dt = sample();
        let s = format_iso8601(&dt);
        assert_eq!(parse_iso8601(&s).unwrap(), dt);
    }
}
