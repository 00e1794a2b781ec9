use std::{
    fmt,
    ops::{Index, IndexMut},
    str::FromStr,
};

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Weekday, Sunday first so that indices match the wire format (0 = Sunday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DayOfWeek {
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        Self::Sunday,
        Self::Monday,
        Self::Tuesday,
        Self::Wednesday,
        Self::Thursday,
        Self::Friday,
        Self::Saturday,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Sunday => 0,
            Self::Monday => 1,
            Self::Tuesday => 2,
            Self::Wednesday => 3,
            Self::Thursday => 4,
            Self::Friday => 5,
            Self::Saturday => 6,
        }
    }

    /// Strict counterpart of [`DayOfWeek::index`]; remote input outside 0..=6 is rejected.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        match weekday {
            Weekday::Sun => Self::Sunday,
            Weekday::Mon => Self::Monday,
            Weekday::Tue => Self::Tuesday,
            Weekday::Wed => Self::Wednesday,
            Weekday::Thu => Self::Thursday,
            Weekday::Fri => Self::Friday,
            Weekday::Sat => Self::Saturday,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sunday => "Sunday",
            Self::Monday => "Monday",
            Self::Tuesday => "Tuesday",
            Self::Wednesday => "Wednesday",
            Self::Thursday => "Thursday",
            Self::Friday => "Friday",
            Self::Saturday => "Saturday",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|day| day.name().eq_ignore_ascii_case(name))
    }
}

/// Offset from local midnight, always below 24h.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u32);

impl TimeOfDay {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(hour * 3600 + minute * 60))
        } else {
            None
        }
    }

    pub fn seconds(self) -> u32 {
        self.0
    }

    pub fn hour(self) -> u32 {
        self.0 / 3600
    }

    pub fn minute(self) -> u32 {
        self.0 / 60 % 60
    }

    pub fn as_duration(self) -> Duration {
        Duration::seconds(i64::from(self.0))
    }
}

impl Default for TimeOfDay {
    fn default() -> Self {
        Self(7 * 3600)
    }
}

impl FromStr for TimeOfDay {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = || Error::InvalidTimeFormat(value.to_string());
        let trimmed = value.trim();
        let (hour, minute) = trimmed.split_once(':').ok_or_else(invalid)?;

        let is_field = |field: &str| {
            (1..=2).contains(&field.len()) && field.bytes().all(|b| b.is_ascii_digit())
        };
        if !is_field(hour) || minute.len() != 2 || !is_field(minute) {
            return Err(invalid());
        }

        let hour = hour.parse::<u32>().map_err(|_| invalid())?;
        let minute = minute.parse::<u32>().map_err(|_| invalid())?;
        Self::from_hm(hour, minute).ok_or_else(invalid)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmSlot {
    pub enabled: bool,
    #[serde(rename = "time")]
    pub time_of_day: TimeOfDay,
}

/// One alarm slot per weekday. Indexed by [`DayOfWeek`] so every day is always present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeeklySchedule {
    days: [AlarmSlot; 7],
}

impl WeeklySchedule {
    pub fn iter(&self) -> impl Iterator<Item = (DayOfWeek, &AlarmSlot)> {
        DayOfWeek::ALL.into_iter().zip(self.days.iter())
    }

    /// Absolute trigger instant for the calendar day containing `now`, if that day is enabled.
    pub fn trigger_for(&self, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let slot = self[DayOfWeek::from_chrono(now.weekday())];
        if !slot.enabled {
            return None;
        }
        Some(start_of_day(now) + slot.time_of_day.as_duration())
    }
}

impl Index<DayOfWeek> for WeeklySchedule {
    type Output = AlarmSlot;

    fn index(&self, day: DayOfWeek) -> &AlarmSlot {
        &self.days[day.index()]
    }
}

impl IndexMut<DayOfWeek> for WeeklySchedule {
    fn index_mut(&mut self, day: DayOfWeek) -> &mut AlarmSlot {
        &mut self.days[day.index()]
    }
}

pub fn start_of_day(now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let midnight = now.date_naive().and_time(NaiveTime::MIN);
    // Fixed offsets never produce gaps or folds, so the mapping is always unique.
    now.offset()
        .from_local_datetime(&midnight)
        .single()
        .unwrap_or(now)
}

/// Parses a wake-up length such as `"30m"`, `"1h30m"`, `"90s"` or `"1.5h"`.
/// A bare integer is read as minutes.
pub fn parse_wake_up_length(value: &str) -> Result<Duration> {
    let invalid = || Error::InvalidDuration(value.to_string());
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid());
    }

    if let Ok(minutes) = trimmed.parse::<i64>() {
        return Duration::try_minutes(minutes)
            .and_then(positive)
            .ok_or_else(invalid);
    }

    let mut total_ms: f64 = 0.0;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let number = rest[..number_len].parse::<f64>().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_ms = match &rest[..unit_len] {
            "h" => 3_600_000.0,
            "m" => 60_000.0,
            "s" => 1_000.0,
            "ms" => 1.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total_ms += number * unit_ms;
    }

    if !total_ms.is_finite() || total_ms > i64::MAX as f64 {
        return Err(invalid());
    }
    Duration::try_milliseconds(total_ms.round() as i64)
        .and_then(positive)
        .ok_or_else(invalid)
}

fn positive(duration: Duration) -> Option<Duration> {
    (duration > Duration::zero()).then_some(duration)
}
