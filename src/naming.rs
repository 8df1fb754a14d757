//! Backup filename grammar: `<name>-<timestamp>[-<bucket>][-<uid>].tgz`.
//!
//! The timestamp is `YYYYMMDDTHHMMSS` in the configured time zone, the
//! optional bucket is a retention class label, and the optional uid is a
//! 24-bit random base36 token used to break filename collisions. This
//! grammar is the cross-version compatibility surface: names are both
//! produced and parsed here, and nowhere else.

use std::sync::OnceLock;

use chrono::NaiveDateTime;
use rand::Rng;
use regex::Regex;

use crate::retention::TimeBucket;

/// File extension shared by every backup archive.
pub const BACKUP_EXTENSION: &str = "tgz";

/// Timestamp layout embedded in backup filenames.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

const UID_BITS: u32 = 24;
const UID_LEN: usize = 5;

/// The name group is greedy, which anchors the timestamp to the rightmost
/// candidate, so an operator-supplied name containing a timestamp-like
/// substring cannot shadow the later fields.
fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<name>.+)-(?P<timestamp>\d{8}T\d{6})(?:-(?P<bucket>yearly|monthly|weekly|daily|hourly|minutely))?(?:-(?P<uid>[0-9a-z]{5}))?\.tgz$",
        )
        .expect("backup name regex is valid")
    })
}

/// The fields encoded in a backup filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub name: String,
    pub timestamp: NaiveDateTime,
    pub bucket: Option<TimeBucket>,
    pub uid: Option<String>,
}

/// Parse a backup filename into its fields.
///
/// Parsing is total: a filename that does not match the grammar (or carries
/// an impossible calendar date) yields `None` and is skipped by listings.
pub fn parse(filename: &str) -> Option<ParsedName> {
    let caps = name_regex().captures(filename)?;
    let timestamp = NaiveDateTime::parse_from_str(&caps["timestamp"], TIMESTAMP_FORMAT).ok()?;

    Some(ParsedName {
        name: caps["name"].to_string(),
        timestamp,
        bucket: caps.name("bucket").and_then(|m| TimeBucket::from_label(m.as_str())),
        uid: caps.name("uid").map(|m| m.as_str().to_string()),
    })
}

/// Compose a backup filename from its fields.
pub fn generate(
    name: &str,
    timestamp: &NaiveDateTime,
    bucket: Option<TimeBucket>,
    uid: Option<&str>,
) -> String {
    let mut filename = format!("{}-{}", name, timestamp.format(TIMESTAMP_FORMAT));
    if let Some(bucket) = bucket {
        filename.push('-');
        filename.push_str(bucket.label());
    }
    if let Some(uid) = uid {
        filename.push('-');
        filename.push_str(uid);
    }
    filename.push('.');
    filename.push_str(BACKUP_EXTENSION);
    filename
}

/// Generate a random 24-bit base36 token for disambiguating filenames.
pub fn new_uid() -> String {
    let mut value = rand::thread_rng().gen_range(0..(1u32 << UID_BITS));
    let mut digits = ['0'; UID_LEN];
    for slot in digits.iter_mut().rev() {
        if let Some(digit) = char::from_digit(value % 36, 36) {
            *slot = digit;
        }
        value /= 36;
    }
    digits.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_generate_plain_name() {
        let name = generate("foo", &ts(2024, 1, 2, 3, 4, 5), None, None);
        assert_eq!(name, "foo-20240102T030405.tgz");
    }

    #[test]
    fn test_generate_with_bucket_and_uid() {
        let name = generate("foo", &ts(2024, 1, 2, 3, 4, 5), Some(TimeBucket::Daily), Some("ab12z"));
        assert_eq!(name, "foo-20240102T030405-daily-ab12z.tgz");
    }

    #[test]
    fn test_parse_full_name() {
        let parsed = parse("foo-20240102T030405-weekly-0k3xy.tgz").unwrap();
        assert_eq!(parsed.name, "foo");
        assert_eq!(parsed.timestamp, ts(2024, 1, 2, 3, 4, 5));
        assert_eq!(parsed.bucket, Some(TimeBucket::Weekly));
        assert_eq!(parsed.uid.as_deref(), Some("0k3xy"));
    }

    #[test]
    fn test_parse_without_optional_fields() {
        let parsed = parse("foo-20240102T030405.tgz").unwrap();
        assert_eq!(parsed.bucket, None);
        assert_eq!(parsed.uid, None);
    }

    #[test]
    fn test_round_trip() {
        let cases = [
            ("foo", None, None),
            ("foo", Some(TimeBucket::Yearly), None),
            ("foo", None, Some("a1b2c")),
            ("my-app-data", Some(TimeBucket::Minutely), Some("zzzzz")),
        ];
        for (name, bucket, uid) in cases {
            let filename = generate(name, &ts(2023, 12, 31, 23, 59, 59), bucket, uid);
            let parsed = parse(&filename).unwrap();
            let rebuilt = generate(
                &parsed.name,
                &parsed.timestamp,
                parsed.bucket,
                parsed.uid.as_deref(),
            );
            assert_eq!(rebuilt, filename);
        }
    }

    #[test]
    fn test_timestamp_anchors_rightmost() {
        // A name containing a timestamp-like substring must not shadow the
        // real timestamp.
        let parsed = parse("foo-20230101T000000-20240102T030405.tgz").unwrap();
        assert_eq!(parsed.name, "foo-20230101T000000");
        assert_eq!(parsed.timestamp, ts(2024, 1, 2, 3, 4, 5));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("notabackup.txt").is_none());
        assert!(parse("foo.tgz").is_none());
        assert!(parse("foo-2024T05.tgz").is_none());
        assert!(parse("-20240102T030405.tgz").is_none());
    }

    #[test]
    fn test_parse_rejects_impossible_date() {
        assert!(parse("foo-20241399T030405.tgz").is_none());
    }

    #[test]
    fn test_new_uid_shape() {
        for _ in 0..100 {
            let uid = new_uid();
            assert_eq!(uid.len(), UID_LEN);
            assert!(uid.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn test_name_with_hyphen_keeps_fields() {
        let parsed = parse("my-app-20240102T030405-daily.tgz").unwrap();
        assert_eq!(parsed.name, "my-app");
        assert_eq!(parsed.bucket, Some(TimeBucket::Daily));
    }
}
