//! Dotted version strings of the region provider
//!
//! Compared level by level: `1.3.10 > 1.3.1`, `1.3 < 1.3.2`, `1.3.1 == 1.3.1.0`.
//! Non-major levels with a leading zero compare as decimal fractions (`1.3.01 < 1.3.1`).

use std::cmp::Ordering;
use std::fmt;

use super::RegionError;

/// Parsed `\d+(\.\d+)*` version
#[derive(Debug, Clone)]
pub struct Version {
    levels: Vec<String>,
}

impl Version {
    /// Parse a strict dotted version
    pub fn parse(input: &str) -> Result<Self, RegionError> {
        let levels: Vec<String> = input.split('.').map(str::to_string).collect();
        let valid = levels
            .iter()
            .all(|level| !level.is_empty() && level.chars().all(|c| c.is_ascii_digit()));
        if !valid {
            return Err(RegionError::InvalidVersion(input.to_string()));
        }
        Ok(Self { levels })
    }

    /// Find the first dotted version inside a free-form string, e.g. `"7.0.9-beta1;abc"`
    pub fn detect(input: &str) -> Result<Self, RegionError> {
        let start = input
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| RegionError::InvalidVersion(input.to_string()))?;
        let rest = &input[start..];
        let mut end = 0;
        let bytes = rest.as_bytes();
        while end < bytes.len() {
            let c = bytes[end];
            let dot_followed_by_digit =
                c == b'.' && bytes.get(end + 1).is_some_and(u8::is_ascii_digit);
            if c.is_ascii_digit() || dot_followed_by_digit {
                end += 1;
            } else {
                break;
            }
        }
        Self::parse(&rest[..end])
    }
}

fn level_value(level: &str) -> u64 {
    level.parse().unwrap_or(u64::MAX)
}

fn fraction_value(level: &str) -> f64 {
    format!("0.{level}").parse().unwrap_or(0.0)
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let max_len = self.levels.len().max(other.levels.len());
        for i in 0..max_len {
            match (self.levels.get(i), other.levels.get(i)) {
                (Some(a), Some(b)) => {
                    let ordering = if i > 0 && (a.starts_with('0') || b.starts_with('0')) {
                        fraction_value(a)
                            .partial_cmp(&fraction_value(b))
                            .unwrap_or(Ordering::Equal)
                    } else {
                        level_value(a).cmp(&level_value(b))
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                (None, Some(b)) if level_value(b) != 0 => return Ordering::Less,
                (Some(a), None) if level_value(a) != 0 => return Ordering::Greater,
                _ => {}
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.levels.join("."))
    }
}
