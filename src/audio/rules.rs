//! Audio and delay rules attached to regions
//!
//! Rules are written by operators as flag strings, e.g. `forest:track=ambient:time=night`
//! for audio and `time=5-10:track=ambient` for delays.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum length of an audio or track identifier
pub const MAX_IDENTIFIER_LEN: usize = 32;

/// Length of a full world day in ticks
pub const TICKS_PER_DAY: u64 = 24_000;

/// Errors produced while parsing rule flag strings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleParseError {
    #[error("invalid identifier '{0}': {1}")]
    InvalidIdentifier(String, &'static str),
    #[error("properties must be in the format <key>=<value>, got '{0}'")]
    MalformedProperty(String),
    #[error("duplicate or unknown property '{0}'")]
    UnknownProperty(String),
    #[error("missing required '{0}' property")]
    MissingProperty(&'static str),
    #[error("time must be one of day, night, morning, afternoon; got '{0}'")]
    InvalidDayTime(String),
    #[error("invalid delay range '{0}'")]
    InvalidRange(String),
}

/// Check that an identifier is non-empty, short and limited to `[A-Za-z0-9_-]`
pub fn validate_identifier(id: &str) -> Result<(), RuleParseError> {
    if id.is_empty() {
        return Err(RuleParseError::InvalidIdentifier(id.to_string(), "must not be empty"));
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(RuleParseError::InvalidIdentifier(
            id.to_string(),
            "must be at most 32 characters",
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(RuleParseError::InvalidIdentifier(
            id.to_string(),
            "may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// Time-of-day window an audio rule is restricted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayTime {
    Day,
    Night,
    Morning,
    Afternoon,
}

impl DayTime {
    pub const ALL: [DayTime; 4] = [DayTime::Day, DayTime::Night, DayTime::Morning, DayTime::Afternoon];

    /// Tick window `[min, max)` within a day
    pub fn window(self) -> (u64, u64) {
        match self {
            DayTime::Day => (0, 13_000),
            DayTime::Night => (13_000, 24_000),
            DayTime::Morning => (0, 6_000),
            DayTime::Afternoon => (6_000, 13_000),
        }
    }

    /// Whether the given world time (in ticks) falls in this window
    pub fn matches(self, world_time: u64) -> bool {
        let (min, max) = self.window();
        let time = world_time % TICKS_PER_DAY;
        time >= min && time < max
    }

    pub fn by_name(name: &str) -> Option<DayTime> {
        Self::ALL
            .into_iter()
            .find(|dt| dt.name().eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        match self {
            DayTime::Day => "day",
            DayTime::Night => "night",
            DayTime::Morning => "morning",
            DayTime::Afternoon => "afternoon",
        }
    }
}

/// Range of seconds the remote player waits between two audio sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: u32,
    pub max: u32,
}

impl DelayRange {
    pub fn new(min: u32, max: u32) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    /// Parse `"<min>-<max>"` or a single `"<secs>"`
    pub fn parse(input: &str) -> Result<Self, RuleParseError> {
        let invalid = || RuleParseError::InvalidRange(input.to_string());
        let (min, max) = match input.split_once('-') {
            Some((min, max)) => (min.trim(), max.trim()),
            None => (input.trim(), input.trim()),
        };
        let min: u32 = min.parse().map_err(|_| invalid())?;
        let max: u32 = max.parse().map_err(|_| invalid())?;
        Self::new(min, max).ok_or_else(invalid)
    }
}

impl fmt::Display for DelayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// Audio directive attached to a region
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudioRule {
    pub audio_id: String,
    /// Logical track, `None` for the configured default track
    pub track_id: Option<String>,
    pub day_time: Option<DayTime>,
}

impl AudioRule {
    pub fn new(audio_id: impl Into<String>) -> Self {
        Self {
            audio_id: audio_id.into(),
            track_id: None,
            day_time: None,
        }
    }

    pub fn on_track(mut self, track_id: impl Into<String>) -> Self {
        self.track_id = Some(track_id.into());
        self
    }

    pub fn during(mut self, day_time: DayTime) -> Self {
        self.day_time = Some(day_time);
        self
    }

    /// Whether the rule applies at the given world time
    pub fn active_at(&self, world_time: u64) -> bool {
        self.day_time.map_or(true, |dt| dt.matches(world_time))
    }

    /// Parse `<audio-id>[:track=<id>][:time=<day-time>]`
    ///
    /// The leading `id=` key is optional.
    pub fn parse(input: &str) -> Result<Self, RuleParseError> {
        let mut audio_id = None;
        let mut track_id = None;
        let mut day_time = None;

        for (i, property) in input.split(':').enumerate() {
            let property = if i == 0 && !property.starts_with("id=") {
                format!("id={property}")
            } else {
                property.to_string()
            };
            let (key, value) = split_property(&property)?;
            match key {
                "id" if audio_id.is_none() => {
                    validate_identifier(value)?;
                    audio_id = Some(value.to_string());
                }
                "track" if track_id.is_none() => {
                    validate_identifier(value)?;
                    track_id = Some(value.to_string());
                }
                "time" if day_time.is_none() => {
                    day_time = Some(
                        DayTime::by_name(value)
                            .ok_or_else(|| RuleParseError::InvalidDayTime(value.to_string()))?,
                    );
                }
                _ => return Err(RuleParseError::UnknownProperty(key.to_string())),
            }
        }

        Ok(Self {
            audio_id: audio_id.ok_or(RuleParseError::MissingProperty("id"))?,
            track_id,
            day_time,
        })
    }
}

impl fmt::Display for AudioRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.audio_id)?;
        if let Some(track) = &self.track_id {
            write!(f, ":track={track}")?;
        }
        if let Some(dt) = self.day_time {
            write!(f, ":time={}", dt.name())?;
        }
        Ok(())
    }
}

/// Delay directive attached to a region
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DelayRule {
    pub range: DelayRange,
    /// Logical track, `None` for the configured default track
    pub track_id: Option<String>,
}

impl DelayRule {
    pub fn new(range: DelayRange) -> Self {
        Self { range, track_id: None }
    }

    pub fn on_track(mut self, track_id: impl Into<String>) -> Self {
        self.track_id = Some(track_id.into());
        self
    }

    /// Parse `time=<range>[:track=<id>]`; a lone value is taken as the range
    pub fn parse(input: &str) -> Result<Self, RuleParseError> {
        let properties: Vec<&str> = input.split(':').collect();
        let mut range = None;
        let mut track_id = None;

        for property in &properties {
            let property = if properties.len() == 1 && !property.starts_with("time=") {
                format!("time={property}")
            } else {
                property.to_string()
            };
            let (key, value) = split_property(&property)?;
            match key {
                "time" if range.is_none() => range = Some(DelayRange::parse(value)?),
                "track" if track_id.is_none() => {
                    validate_identifier(value)?;
                    track_id = Some(value.to_string());
                }
                _ => return Err(RuleParseError::UnknownProperty(key.to_string())),
            }
        }

        Ok(Self {
            range: range.ok_or(RuleParseError::MissingProperty("time"))?,
            track_id,
        })
    }
}

fn split_property(property: &str) -> Result<(&str, &str), RuleParseError> {
    let mut parts = property.split('=');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(value), None) if !value.is_empty() => Ok((key, value)),
        _ => Err(RuleParseError::MalformedProperty(property.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("forest_01").is_ok());
        assert!(validate_identifier("cave-deep").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("has space").is_err());
        assert!(validate_identifier(&"x".repeat(33)).is_err());
    }

    #[test]
    fn test_day_time_windows() {
        assert!(DayTime::Day.matches(0));
        assert!(DayTime::Day.matches(12_999));
        assert!(!DayTime::Day.matches(13_000));
        assert!(DayTime::Night.matches(13_000));
        assert!(DayTime::Morning.matches(5_999));
        assert!(DayTime::Afternoon.matches(6_000));
        // Time wraps every day
        assert!(DayTime::Night.matches(24_000 + 20_000));
    }

    #[test]
    fn test_day_time_by_name() {
        assert_eq!(DayTime::by_name("NIGHT"), Some(DayTime::Night));
        assert_eq!(DayTime::by_name("dusk"), None);
    }

    #[test]
    fn test_delay_range_parse() {
        assert_eq!(DelayRange::parse("5-10").unwrap(), DelayRange { min: 5, max: 10 });
        assert_eq!(DelayRange::parse("7").unwrap(), DelayRange { min: 7, max: 7 });
        assert!(DelayRange::parse("10-5").is_err());
        assert!(DelayRange::parse("a-b").is_err());
        assert_eq!(DelayRange::parse("5-10").unwrap().to_string(), "5-10");
    }

    #[test]
    fn test_audio_rule_parse() {
        let rule = AudioRule::parse("forest").unwrap();
        assert_eq!(rule, AudioRule::new("forest"));

        let rule = AudioRule::parse("forest:track=ambient:time=night").unwrap();
        assert_eq!(rule.audio_id, "forest");
        assert_eq!(rule.track_id.as_deref(), Some("ambient"));
        assert_eq!(rule.day_time, Some(DayTime::Night));
        assert_eq!(rule.to_string(), "forest:track=ambient:time=night");
    }

    #[test]
    fn test_audio_rule_parse_errors() {
        assert!(matches!(
            AudioRule::parse("forest:track=a:track=b"),
            Err(RuleParseError::UnknownProperty(_))
        ));
        assert!(matches!(
            AudioRule::parse("forest:time=dusk"),
            Err(RuleParseError::InvalidDayTime(_))
        ));
        assert!(matches!(
            AudioRule::parse("forest:volume"),
            Err(RuleParseError::MalformedProperty(_))
        ));
    }

    #[test]
    fn test_delay_rule_parse() {
        let rule = DelayRule::parse("5-10").unwrap();
        assert_eq!(rule.range, DelayRange { min: 5, max: 10 });
        assert!(rule.track_id.is_none());

        let rule = DelayRule::parse("time=3:track=music").unwrap();
        assert_eq!(rule.range, DelayRange { min: 3, max: 3 });
        assert_eq!(rule.track_id.as_deref(), Some("music"));

        assert!(matches!(
            DelayRule::parse("track=music:other=1"),
            Err(RuleParseError::UnknownProperty(_))
        ));
        // A lone property is always read as the range
        assert!(matches!(
            DelayRule::parse("track=music"),
            Err(RuleParseError::MalformedProperty(_))
        ));
    }

    #[test]
    fn test_rule_active_at() {
        let rule = AudioRule::new("owls").during(DayTime::Night);
        assert!(!rule.active_at(1_000));
        assert!(rule.active_at(15_000));
        assert!(AudioRule::new("wind").active_at(1_000));
    }
}
