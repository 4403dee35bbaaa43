//! Line tokenizer and value normalization
//!
//! A line looks like `tag1:value1,tag2:value2,...`. Segments that do not split
//! into exactly two non-empty parts are noise and are skipped without a report.

use crate::error::BridgeError;

pub const PAIR_DELIMITER: char = ',';
pub const FIELD_DELIMITER: char = ':';

/// One tag/value pair taken from a line segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading<'a> {
    /// Trimmed and lowercased
    pub tag: String,
    /// Trimmed, still carrying units or noise
    pub raw_value: &'a str,
}

impl<'a> Reading<'a> {
    /// `None` unless the segment is exactly `tag:value` with both parts non-empty
    pub fn from_segment(segment: &'a str) -> Option<Self> {
        let mut parts = segment.split(FIELD_DELIMITER);
        let (tag, value) = match (parts.next(), parts.next(), parts.next()) {
            (Some(tag), Some(value), None) => (tag.trim(), value.trim()),
            _ => return None,
        };
        if tag.is_empty() || value.is_empty() {
            return None;
        }
        Some(Self {
            tag: tag.to_lowercase(),
            raw_value: value,
        })
    }

    /// Parses the value and renders it back as the publish payload
    pub fn payload(&self) -> Result<String, BridgeError> {
        let normalized = normalize_value(self.raw_value);
        normalized
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
            .map(|value| value.to_string())
            .ok_or_else(|| {
                BridgeError::Validation(format!(
                    "invalid value for tag {}: {}",
                    self.tag, self.raw_value
                ))
            })
    }
}

/// Splits a line into its readings, in line order
pub fn readings(line: &str) -> impl Iterator<Item = Reading<'_>> {
    line.split(PAIR_DELIMITER).filter_map(Reading::from_segment)
}

/// Keeps only digits, `.` and `-` (`"85%"` -> `"85"`, `"12V"` -> `"12"`)
pub fn normalize_value(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect()
}
