//! Utility functions for the callrelay engine

use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;

/// Metadata derived from a directory-watch filename
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirwatchMeta {
    /// Talkgroup id
    pub talkgroup: i64,

    /// Transmission start time
    pub start: DateTime<Utc>,

    /// Transmitting unit id
    pub unit: i64,

    /// Audio codec tag derived from the extension
    pub format: String,
}

/// Extract metadata from a directory-watch filename
///
/// Convention: `<talkgroup>-<unixtime>_<unit>.<ext>`
///
/// # Errors
///
/// Returns a validation error if the filename does not match the convention.
pub fn parse_dirwatch_filename(filename: &str) -> Result<DirwatchMeta> {
    let path = Path::new(filename);

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::validation("filename", "not valid UTF-8"))?;

    let format = path
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| Error::validation("filename", "missing extension"))?;

    let (talkgroup_part, rest) = stem
        .split_once('-')
        .ok_or_else(|| Error::validation("filename", "missing '-' separator"))?;
    let (time_part, unit_part) = rest
        .split_once('_')
        .ok_or_else(|| Error::validation("filename", "missing '_' separator"))?;

    let talkgroup: i64 = talkgroup_part
        .parse()
        .map_err(|_| Error::validation("filename", "talkgroup is not a number"))?;
    let unixtime: i64 = time_part
        .parse()
        .map_err(|_| Error::validation("filename", "timestamp is not a number"))?;
    let unit: i64 = unit_part
        .parse()
        .map_err(|_| Error::validation("filename", "unit is not a number"))?;

    let start = Utc
        .timestamp_opt(unixtime, 0)
        .single()
        .ok_or_else(|| Error::validation("filename", "timestamp out of range"))?;

    Ok(DirwatchMeta {
        talkgroup,
        start,
        unit,
        format,
    })
}

/// Generate a unique, date-partitioned storage reference for an audio payload
#[must_use]
pub fn audio_storage_ref(start: &DateTime<Utc>, format: &str) -> String {
    format!(
        "{}/{}.{}",
        start.format("%Y/%m/%d"),
        uuid::Uuid::new_v4(),
        format
    )
}

/// Validate an audio codec tag against the allowed list
#[must_use]
pub fn format_allowed(format: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|a| a.eq_ignore_ascii_case(format))
}

/// Sanitize a filename for safe storage
#[must_use]
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            c if c.is_alphanumeric() || c == '.' || c == '_' || c == '-' => c,
            _ => '_',
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

#[cfg(test)]
#[allow(clippy::missing_panics_doc, clippy::uninlined_format_args)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_parse_dirwatch_filename() {
        let meta = parse_dirwatch_filename("52197-1700000000_1234567.mp3").unwrap();

        assert_eq!(meta.talkgroup, 52197);
        assert_eq!(meta.start.timestamp(), 1_700_000_000);
        assert_eq!(meta.unit, 1_234_567);
        assert_eq!(meta.format, "mp3");
    }

    #[test]
    fn test_parse_dirwatch_filename_uppercase_extension() {
        let meta = parse_dirwatch_filename("10-1600000000_20.WAV").unwrap();
        assert_eq!(meta.format, "wav");
    }

    #[test]
    fn test_parse_dirwatch_filename_errors() {
        let invalid = [
            "no_separators.mp3",
            "123-456.mp3",          // missing unit
            "abc-1700000000_1.mp3", // talkgroup not numeric
            "123-xyz_1.mp3",        // timestamp not numeric
            "123-1700000000_x.mp3", // unit not numeric
            "123-1700000000_1",     // no extension
        ];

        for name in invalid {
            assert!(
                parse_dirwatch_filename(name).is_err(),
                "expected {} to fail",
                name
            );
        }
    }

    #[test]
    fn test_audio_storage_ref_partitioning() {
        let start = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let reference = audio_storage_ref(&start, "mp3");

        assert!(reference.starts_with("2023/11/14/"));
        assert!(reference.ends_with(".mp3"));
    }

    #[test]
    fn test_audio_storage_refs_are_unique() {
        let start = chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_ne!(
            audio_storage_ref(&start, "mp3"),
            audio_storage_ref(&start, "mp3")
        );
    }

    #[test]
    fn test_format_allowed() {
        let allowed = vec!["mp3".to_string(), "wav".to_string()];
        assert!(format_allowed("mp3", &allowed));
        assert!(format_allowed("MP3", &allowed));
        assert!(!format_allowed("ogg", &allowed));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a b/c.mp3"), "a_b_c.mp3");
        assert_eq!(sanitize_filename("__x__"), "x");
        assert_eq!(sanitize_filename("ok-name_1.wav"), "ok-name_1.wav");
    }

    proptest! {
        #[test]
        fn test_parse_roundtrip(tg in 1i64..1_000_000, ts in 0i64..4_000_000_000, unit in 1i64..10_000_000) {
            let name = format!("{tg}-{ts}_{unit}.mp3");
            let meta = parse_dirwatch_filename(&name).unwrap();
            prop_assert_eq!(meta.talkgroup, tg);
            prop_assert_eq!(meta.start.timestamp(), ts);
            prop_assert_eq!(meta.unit, unit);
        }
    }
}
