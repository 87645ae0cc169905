//! Trading session classification from a UTC timestamp
//!
//! Sessions (UTC):
//! - Asia: 00:00 - 08:00
//! - London: 08:00 - 13:30
//! - Overlap: 13:30 - 16:00 (London and New York both open)
//! - New York: 16:00 - 20:00 (minutes counted from the 13:30 open)
//! - Off hours: 20:00 - 24:00

use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

const ASIA_OPEN: u32 = 0;
const LONDON_OPEN: u32 = 8 * 60;
const NY_OPEN: u32 = 13 * 60 + 30;
const LONDON_CLOSE: u32 = 16 * 60;
const NY_CLOSE: u32 = 20 * 60;
const LUNCH_START: u32 = 16 * 60 + 30;
const LUNCH_END: u32 = 18 * 60;

/// Minutes after a session open during which the opening range is forming
pub const OPENING_WINDOW_MINUTES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionName {
    Asia,
    London,
    NewYork,
    Overlap,
    OffHours,
}

impl SessionName {
    /// Base quality used by the session gate
    pub fn quality(self) -> f64 {
        match self {
            SessionName::Overlap => 1.0,
            SessionName::NewYork => 0.9,
            SessionName::London => 0.8,
            SessionName::Asia => 0.5,
            SessionName::OffHours => 0.3,
        }
    }

    /// UTC (hour, minute) of the open that anchors the opening range box.
    /// Asia and off hours have no opening range.
    pub fn orb_open(self) -> Option<(u32, u32)> {
        match self {
            SessionName::NewYork | SessionName::Overlap => Some((13, 30)),
            SessionName::London => Some((8, 0)),
            SessionName::Asia | SessionName::OffHours => None,
        }
    }
}

impl std::fmt::Display for SessionName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionName::Asia => "asia",
            SessionName::London => "london",
            SessionName::NewYork => "new_york",
            SessionName::Overlap => "overlap",
            SessionName::OffHours => "off_hours",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub name: SessionName,
    pub is_open: bool,
    pub minutes_since_open: u32,
    pub is_orb_window: bool,
    pub is_lunch_dead: bool,
}

impl SessionInfo {
    /// Derive the session purely from the UTC wall clock of `time_ms`
    pub fn from_timestamp_ms(time_ms: i64) -> Self {
        let minute_of_day = utc_datetime(time_ms)
            .map(|dt| dt.hour() * 60 + dt.minute())
            .unwrap_or(0);
        Self::from_minute_of_day(minute_of_day)
    }

    pub fn from_minute_of_day(minutes: u32) -> Self {
        let (name, opened_at) = if (NY_OPEN..LONDON_CLOSE).contains(&minutes) {
            (SessionName::Overlap, Some(NY_OPEN))
        } else if (LONDON_OPEN..NY_OPEN).contains(&minutes) {
            (SessionName::London, Some(LONDON_OPEN))
        } else if (NY_OPEN..NY_CLOSE).contains(&minutes) {
            (SessionName::NewYork, Some(NY_OPEN))
        } else if (ASIA_OPEN..LONDON_OPEN).contains(&minutes) {
            (SessionName::Asia, Some(ASIA_OPEN))
        } else {
            (SessionName::OffHours, None)
        };

        let is_open = opened_at.is_some();
        let minutes_since_open = opened_at.map(|open| minutes - open).unwrap_or(0);

        Self {
            name,
            is_open,
            minutes_since_open,
            is_orb_window: is_open && minutes_since_open <= OPENING_WINDOW_MINUTES,
            is_lunch_dead: (LUNCH_START..LUNCH_END).contains(&minutes),
        }
    }
}

pub fn utc_datetime(time_ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(time_ms).single()
}

/// Epoch-ms of UTC midnight for the day containing `time_ms`
pub fn utc_day_start_ms(time_ms: i64) -> Option<i64> {
    utc_time_on_day_ms(time_ms, 0, 0)
}

/// Epoch-ms of `hour:minute` UTC on the day containing `time_ms`
pub fn utc_time_on_day_ms(time_ms: i64, hour: u32, minute: u32) -> Option<i64> {
    let dt = utc_datetime(time_ms)?;
    let at = NaiveTime::from_hms_opt(hour, minute, 0)?;
    Some(dt.date_naive().and_time(at).and_utc().timestamp_millis())
}
