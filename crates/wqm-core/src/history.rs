//! Read-side grouping of history entries by local calendar day.

use chrono::NaiveDate;
use serde::Serialize;

use crate::schedule::LocalClock;
use crate::{HistoryEntry, QualityRating};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayGroup {
    pub date: NaiveDate,
    /// Earliest non-error quality of the day.
    pub first_quality: Option<QualityRating>,
    /// Latest non-error quality of the day.
    pub last_quality: Option<QualityRating>,
    pub changed_within_day: bool,
    /// Final quality of the closest earlier day that has one.
    pub previous_day_quality: Option<QualityRating>,
    pub has_errors: bool,
    /// Most recent first, as listed.
    pub entries: Vec<HistoryEntry>,
}

/// Groups a most-recent-first listing into most-recent-first day groups.
pub fn group_by_day(entries: &[HistoryEntry], clock: &LocalClock) -> Vec<DayGroup> {
    let mut groups: Vec<DayGroup> = Vec::new();
    for entry in entries {
        let date = clock.local_date(entry.recorded_at);
        match groups.last_mut() {
            Some(group) if group.date == date => group.entries.push(entry.clone()),
            _ => groups.push(DayGroup {
                date,
                first_quality: None,
                last_quality: None,
                changed_within_day: false,
                previous_day_quality: None,
                has_errors: false,
                entries: vec![entry.clone()],
            }),
        }
    }

    for group in &mut groups {
        let healthy: Vec<&HistoryEntry> = group.entries.iter().filter(|e| !e.is_error).collect();
        group.last_quality = healthy.first().map(|e| e.quality_rating);
        group.first_quality = healthy.last().map(|e| e.quality_rating);
        group.has_errors = group.entries.iter().any(|e| e.is_error);
        group.changed_within_day = healthy
            .windows(2)
            .any(|pair| pair[0].quality_rating != pair[1].quality_rating);
    }

    // Groups are newest first, so the previous day is the next group with data.
    for idx in 0..groups.len() {
        let previous = groups[idx + 1..].iter().find_map(|g| g.last_quality);
        groups[idx].previous_day_quality = previous;
    }

    groups
}
