//! Core domain model for the WABA quality monitor.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod history;
pub mod quality;
pub mod schedule;

pub use history::{group_by_day, DayGroup};
pub use quality::{map_limit_tier, map_quality, MappingError};
pub use schedule::{
    select_due, DueSelection, DueWindow, LocalClock, ScheduleError, ScheduleTime,
    DEFAULT_SCHEDULE_TIMES, MAX_SCHEDULES_PER_PROJECT,
};

pub const CRATE_NAME: &str = "wqm-core";

/// Internal three-level quality vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QualityRating {
    High,
    Medium,
    Low,
}

impl QualityRating {
    /// Ordinal used for trend direction: HIGH=3 > MEDIUM=2 > LOW=1.
    pub fn rank(self) -> u8 {
        match self {
            QualityRating::High => 3,
            QualityRating::Medium => 2,
            QualityRating::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QualityRating::High => "HIGH",
            QualityRating::Medium => "MEDIUM",
            QualityRating::Low => "LOW",
        }
    }
}

impl fmt::Display for QualityRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stored quality rating `{0}`")]
pub struct ParseQualityError(pub String);

impl FromStr for QualityRating {
    type Err = ParseQualityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HIGH" => Ok(QualityRating::High),
            "MEDIUM" => Ok(QualityRating::Medium),
            "LOW" => Ok(QualityRating::Low),
            other => Err(ParseQualityError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// `None` when the two ratings share a rank.
    pub fn between(previous: QualityRating, current: QualityRating) -> Option<Self> {
        match current.rank().cmp(&previous.rank()) {
            std::cmp::Ordering::Greater => Some(Direction::Up),
            std::cmp::Ordering::Less => Some(Direction::Down),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl FromStr for Direction {
    type Err = ParseQualityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(ParseQualityError(other.to_string())),
        }
    }
}

/// One external phone-number resource under monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedNumber {
    pub id: Uuid,
    pub project_id: Uuid,
    pub phone_number_id: String,
    pub business_manager_id: Option<Uuid>,
    pub display_number: Option<String>,
    pub verified_name: Option<String>,
    pub quality_rating: QualityRating,
    pub messaging_limit_tier: String,
    pub previous_quality: Option<QualityRating>,
    pub last_status_change: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// UI-only flag; polling ignores it.
    pub visible: bool,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a number's state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub tracked_number_id: Uuid,
    pub quality_rating: QualityRating,
    pub messaging_limit_tier: String,
    /// Set only on rows that record a change.
    pub previous_quality: Option<QualityRating>,
    pub recorded_at: DateTime<Utc>,
    pub observation: Option<String>,
    pub is_error: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub id: Uuid,
    pub tracked_number_id: Uuid,
    pub project_id: Uuid,
    pub previous_quality: QualityRating,
    pub new_quality: QualityRating,
    pub direction: Direction,
    pub created_at: DateTime<Utc>,
}

/// Project-scoped wall-clock time at which polling fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub project_id: Uuid,
    pub time: ScheduleTime,
    pub position: i32,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Summary of one trigger loop run. Observability only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    pub id: Uuid,
    pub executed_at: DateTime<Utc>,
    pub schedules_matched: i64,
    pub projects_checked: i64,
    pub numbers_updated: i64,
    pub errors: i64,
}

/// Business Manager / WABA pair holding the bearer credential for its numbers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessManager {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub waba_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
}

impl fmt::Debug for BusinessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusinessManager")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("name", &self.name)
            .field("waba_id", &self.waba_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

impl BusinessManager {
    /// A blank token is a configuration gap, not a credential.
    pub fn has_usable_token(&self) -> bool {
        !self.access_token.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_follows_rank() {
        use QualityRating::*;
        assert_eq!(Direction::between(High, Medium), Some(Direction::Down));
        assert_eq!(Direction::between(Low, High), Some(Direction::Up));
        assert_eq!(Direction::between(Medium, Low), Some(Direction::Down));
        assert_eq!(Direction::between(Medium, Medium), None);
    }

    #[test]
    fn quality_round_trips_through_storage_text() {
        for q in [QualityRating::High, QualityRating::Medium, QualityRating::Low] {
            assert_eq!(q.as_str().parse::<QualityRating>(), Ok(q));
        }
        assert!("GREEN".parse::<QualityRating>().is_err());
    }

    #[test]
    fn business_manager_debug_hides_token() {
        let bm = BusinessManager {
            id: Uuid::nil(),
            project_id: Uuid::nil(),
            name: "Main BM".into(),
            waba_id: "1234".into(),
            access_token: "EAAG-secret".into(),
        };
        let rendered = format!("{bm:?}");
        assert!(!rendered.contains("EAAG-secret"));
        let json = serde_json::to_string(&bm).unwrap();
        assert!(!json.contains("EAAG-secret"));
    }
}
