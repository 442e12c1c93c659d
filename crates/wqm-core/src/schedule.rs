//! Time-of-day schedules and the due-window rule used by the trigger loop.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ScheduleEntry;

pub const MAX_SCHEDULES_PER_PROJECT: usize = 7;
pub const DEFAULT_DUE_WINDOW_MINUTES: u16 = 2;
pub const BRASILIA_OFFSET_MINUTES: i32 = -180;

pub const DEFAULT_SCHEDULE_TIMES: [ScheduleTime; 3] = [
    ScheduleTime::from_hm(6, 0),
    ScheduleTime::from_hm(12, 0),
    ScheduleTime::from_hm(18, 0),
];

const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid schedule time `{0}`, expected HH:mm")]
    InvalidTime(String),
    #[error("project {project_id} already has the maximum of {max} schedules")]
    CapExceeded { project_id: Uuid, max: usize },
    #[error("utc offset of {0} minutes is out of range")]
    InvalidOffset(i32),
}

/// Wall-clock `HH:mm`, stored as minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScheduleTime {
    minutes: u16,
}

impl ScheduleTime {
    pub const fn from_hm(hour: u8, minute: u8) -> Self {
        Self {
            minutes: hour as u16 * 60 + minute as u16,
        }
    }

    pub fn new(hour: u8, minute: u8) -> Result<Self, ScheduleError> {
        if hour > 23 || minute > 59 {
            return Err(ScheduleError::InvalidTime(format!("{hour}:{minute}")));
        }
        Ok(Self::from_hm(hour, minute))
    }

    pub fn minutes_of_day(self) -> u16 {
        self.minutes
    }

    pub fn hour(self) -> u8 {
        (self.minutes / 60) as u8
    }

    pub fn minute(self) -> u8 {
        (self.minutes % 60) as u8
    }

    pub fn to_naive_time(self) -> NaiveTime {
        NaiveTime::from_num_seconds_from_midnight_opt(u32::from(self.minutes) * 60, 0)
            .unwrap_or(NaiveTime::MIN)
    }

    pub fn from_naive_time(time: NaiveTime) -> Self {
        Self::from_hm(time.hour() as u8, time.minute() as u8)
    }
}

impl fmt::Display for ScheduleTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for ScheduleTime {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidTime(s.to_string());
        let trimmed = s.trim();
        // Postgres TIME renders as HH:mm:ss; seconds are ignored.
        let mut parts = trimmed.split(':');
        let hour = parts.next().ok_or_else(invalid)?;
        let minute = parts.next().ok_or_else(invalid)?;
        if let Some(seconds) = parts.next() {
            if seconds.parse::<u8>().is_err() || parts.next().is_some() {
                return Err(invalid());
            }
        }
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(invalid());
        }
        let hour: u8 = hour.parse().map_err(|_| invalid())?;
        let minute: u8 = minute.parse().map_err(|_| invalid())?;
        Self::new(hour, minute).map_err(|_| invalid())
    }
}

impl TryFrom<String> for ScheduleTime {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScheduleTime> for String {
    fn from(value: ScheduleTime) -> Self {
        value.to_string()
    }
}

/// Converts instants into the wall clock schedules are written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalClock {
    offset: FixedOffset,
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::brasilia()
    }
}

impl LocalClock {
    /// UTC-3; Brazil has not observed daylight saving since 2019.
    pub fn brasilia() -> Self {
        Self::from_offset_minutes(BRASILIA_OFFSET_MINUTES).unwrap_or(Self { offset: Utc.fix() })
    }

    pub fn from_offset_minutes(minutes: i32) -> Result<Self, ScheduleError> {
        let offset = minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(ScheduleError::InvalidOffset(minutes))?;
        Ok(Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn minutes_of_day(&self, at: DateTime<Utc>) -> u16 {
        let local = at.with_timezone(&self.offset);
        (local.hour() * 60 + local.minute()) as u16
    }

    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn same_day(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.local_date(a) == self.local_date(b)
    }
}

/// Tolerance band around a scheduled minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueWindow {
    half_width_minutes: u16,
}

impl Default for DueWindow {
    fn default() -> Self {
        Self::new(DEFAULT_DUE_WINDOW_MINUTES)
    }
}

impl DueWindow {
    pub fn new(half_width_minutes: u16) -> Self {
        Self {
            half_width_minutes: half_width_minutes.min(MINUTES_PER_DAY / 2),
        }
    }

    pub fn half_width_minutes(&self) -> u16 {
        self.half_width_minutes
    }

    /// Distance is measured around the clock, so 23:59 is one minute from 00:00.
    pub fn contains(&self, scheduled: ScheduleTime, current_minute_of_day: u16) -> bool {
        let a = scheduled.minutes_of_day();
        let b = current_minute_of_day % MINUTES_PER_DAY;
        let diff = a.abs_diff(b);
        diff.min(MINUTES_PER_DAY - diff) <= self.half_width_minutes
    }

    /// Width of the whole band, in which a slot must not fire twice.
    pub fn span(&self) -> Duration {
        Duration::minutes(i64::from(self.half_width_minutes) * 2 + 1)
    }

    pub fn recently_fired(&self, last_fired_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        last_fired_at
            .map(|fired| now.signed_duration_since(fired).abs() < self.span())
            .unwrap_or(false)
    }
}

/// Outcome of filtering all schedules against the current instant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueSelection {
    /// Schedules inside the due window, fired or not.
    pub matched: Vec<Uuid>,
    /// Subset of `matched` that will fire on this invocation.
    pub to_fire: Vec<Uuid>,
    /// Distinct projects with at least one schedule firing.
    pub project_ids: BTreeSet<Uuid>,
}

pub fn select_due(
    schedules: &[ScheduleEntry],
    now: DateTime<Utc>,
    clock: &LocalClock,
    window: &DueWindow,
) -> DueSelection {
    let minute = clock.minutes_of_day(now);
    let mut selection = DueSelection::default();
    for schedule in schedules {
        if !window.contains(schedule.time, minute) {
            continue;
        }
        selection.matched.push(schedule.id);
        if window.recently_fired(schedule.last_fired_at, now) {
            continue;
        }
        selection.to_fire.push(schedule.id);
        selection.project_ids.insert(schedule.project_id);
    }
    selection
}

pub fn ensure_capacity(project_id: Uuid, existing: usize) -> Result<(), ScheduleError> {
    if existing >= MAX_SCHEDULES_PER_PROJECT {
        return Err(ScheduleError::CapExceeded {
            project_id,
            max: MAX_SCHEDULES_PER_PROJECT,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc_for_brasilia(hour: u32, minute: u32) -> DateTime<Utc> {
        // Brasília wall clock is UTC-3.
        Utc.with_ymd_and_hms(2026, 3, 10, (hour + 3) % 24, minute, 0)
            .single()
            .unwrap()
    }

    fn schedule(project_id: Uuid, time: &str) -> ScheduleEntry {
        ScheduleEntry {
            id: Uuid::new_v4(),
            project_id,
            time: time.parse().unwrap(),
            position: 0,
            last_fired_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn parses_and_formats_hh_mm() {
        let t: ScheduleTime = "06:05".parse().unwrap();
        assert_eq!(t.minutes_of_day(), 365);
        assert_eq!(t.to_string(), "06:05");
        assert_eq!("18:30:00".parse::<ScheduleTime>().unwrap().to_string(), "18:30");
        assert_eq!("7:15".parse::<ScheduleTime>().unwrap().to_string(), "07:15");
        for bad in ["24:00", "12:60", "noon", "12", "12:5", "", "1:2:3:4"] {
            assert!(bad.parse::<ScheduleTime>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn due_window_is_inclusive_two_minutes() {
        let window = DueWindow::default();
        let noon: ScheduleTime = "12:00".parse().unwrap();
        for (m, due) in [
            ("11:57", false),
            ("11:58", true),
            ("11:59", true),
            ("12:00", true),
            ("12:01", true),
            ("12:02", true),
            ("12:03", false),
        ] {
            let at: ScheduleTime = m.parse().unwrap();
            assert_eq!(window.contains(noon, at.minutes_of_day()), due, "at {m}");
        }
    }

    #[test]
    fn due_window_wraps_midnight() {
        let window = DueWindow::default();
        let midnight: ScheduleTime = "00:00".parse().unwrap();
        assert!(window.contains(midnight, 23 * 60 + 59));
        assert!(window.contains(midnight, 23 * 60 + 58));
        assert!(!window.contains(midnight, 23 * 60 + 57));
    }

    #[test]
    fn clock_uses_brasilia_wall_time() {
        let clock = LocalClock::brasilia();
        let at = Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).single().unwrap();
        assert_eq!(clock.minutes_of_day(at), 12 * 60);

        // 01:30 UTC is still the previous day in Brasília.
        let late = Utc.with_ymd_and_hms(2026, 3, 11, 1, 30, 0).single().unwrap();
        let evening = Utc.with_ymd_and_hms(2026, 3, 10, 20, 0, 0).single().unwrap();
        assert!(clock.same_day(late, evening));
    }

    #[test]
    fn overlapping_schedules_yield_one_project() {
        let project = Uuid::new_v4();
        let schedules = vec![schedule(project, "06:00"), schedule(project, "06:01")];
        let selection = select_due(
            &schedules,
            utc_for_brasilia(6, 0),
            &LocalClock::brasilia(),
            &DueWindow::default(),
        );
        assert_eq!(selection.matched.len(), 2);
        assert_eq!(selection.to_fire.len(), 2);
        assert_eq!(selection.project_ids.len(), 1);
    }

    #[test]
    fn fired_slot_is_not_fired_again_within_window() {
        let project = Uuid::new_v4();
        let mut s = schedule(project, "12:00");
        s.last_fired_at = Some(utc_for_brasilia(11, 58));
        let selection = select_due(
            &[s.clone()],
            utc_for_brasilia(12, 1),
            &LocalClock::brasilia(),
            &DueWindow::default(),
        );
        assert_eq!(selection.matched, vec![s.id]);
        assert!(selection.to_fire.is_empty());
        assert!(selection.project_ids.is_empty());
    }

    #[test]
    fn cap_rejects_eighth_schedule() {
        let project = Uuid::new_v4();
        assert!(ensure_capacity(project, 6).is_ok());
        assert_eq!(
            ensure_capacity(project, 7),
            Err(ScheduleError::CapExceeded { project_id: project, max: 7 })
        );
    }
}
