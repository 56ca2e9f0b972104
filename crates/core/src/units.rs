// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Human-readable unit parsing for configuration values.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};

use crate::error::{RecError, Result};

/// Parses a byte size with an optional K/M/G/T suffix (powers of 1024).
///
/// Returns `None` for empty, zero or unparseable input; a disabled quota is
/// not an error.
pub fn parse_byte_size(input: &str) -> Option<u64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let (digits, multiplier) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'K' => (&s[..s.len() - 1], 1u64 << 10),
        b'M' => (&s[..s.len() - 1], 1u64 << 20),
        b'G' => (&s[..s.len() - 1], 1u64 << 30),
        b'T' => (&s[..s.len() - 1], 1u64 << 40),
        _ => (s, 1u64),
    };
    let value: u64 = digits.trim().parse().ok()?;
    let bytes = value.checked_mul(multiplier)?;
    if bytes == 0 {
        None
    } else {
        Some(bytes)
    }
}

/// Parses a duration string such as `"30s"` or `"5m"`.
///
/// # Errors
///
/// Returns [`RecError::Config`] when the value is not a valid duration.
pub fn parse_duration(input: &str) -> Result<Duration> {
    humantime::parse_duration(input.trim())
        .map_err(|e| RecError::Config(format!("invalid duration {input:?}: {e}")))
}

/// Truncates an instant to whole seconds, the resolution stored in the index
/// and encoded in segment file names.
pub fn truncate_to_second(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant.trunc_subsecs(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_byte_size_suffixes() {
        assert_eq!(parse_byte_size("7M"), Some(7 * 1024 * 1024));
        assert_eq!(parse_byte_size("1k"), Some(1024));
        assert_eq!(parse_byte_size("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_byte_size("512"), Some(512));
        assert_eq!(parse_byte_size(" 3 T "), Some(3 * (1u64 << 40)));
        assert_eq!(parse_byte_size("10T"), Some(10 * (1u64 << 40)));
    }

    #[test]
    fn test_parse_byte_size_disabled_values() {
        assert_eq!(parse_byte_size(""), None);
        assert_eq!(parse_byte_size("0"), None);
        assert_eq!(parse_byte_size("0M"), None);
        assert_eq!(parse_byte_size("garbage"), None);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_truncate_to_second() {
        let t = truncate_to_second(Utc::now());
        assert_eq!(t.timestamp_subsec_nanos(), 0);
    }
}
