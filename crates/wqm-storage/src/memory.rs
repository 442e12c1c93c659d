//! In-process backend. Each instance owns its state; nothing is shared
//! between instances.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;
use wqm_core::schedule::ensure_capacity;
use wqm_core::{
    BusinessManager, ChangeNotification, ExecutionLog, HistoryEntry, LocalClock, ScheduleEntry,
    ScheduleTime, TrackedNumber, DEFAULT_SCHEDULE_TIMES,
};

use crate::{
    plan_history_write, ChangeFeed, CredentialRepository, ExecutionLogRepository, HistoryStore,
    HistoryWrite, NewHistoryEntry, NotificationRepository, NumberRepository, ScheduleRegistry,
    StatusChange, StorageError, StorageResult, Store, StoreEvent,
};

#[derive(Debug, Default)]
struct MemoryState {
    numbers: HashMap<Uuid, TrackedNumber>,
    business_managers: HashMap<Uuid, BusinessManager>,
    /// Insertion order doubles as the tie-breaker for equal timestamps.
    history: Vec<HistoryEntry>,
    notifications: Vec<ChangeNotification>,
    schedules: Vec<ScheduleEntry>,
    executions: Vec<ExecutionLog>,
}

#[derive(Debug)]
pub struct MemoryStore {
    clock: LocalClock,
    state: Mutex<MemoryState>,
    feed: ChangeFeed,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(LocalClock::brasilia())
    }
}

impl MemoryStore {
    pub fn new(clock: LocalClock) -> Self {
        Self {
            clock,
            state: Mutex::new(MemoryState::default()),
            feed: ChangeFeed::default(),
        }
    }
}

fn latest_index(history: &[HistoryEntry], number_id: Uuid) -> Option<usize> {
    history
        .iter()
        .enumerate()
        .filter(|(_, e)| e.tracked_number_id == number_id)
        .max_by_key(|(idx, e)| (e.recorded_at, *idx))
        .map(|(idx, _)| idx)
}

fn sort_schedules(schedules: &mut [ScheduleEntry]) {
    schedules.sort_by_key(|s| (s.position, s.time));
}

#[async_trait]
impl NumberRepository for MemoryStore {
    async fn insert_number(&self, number: &TrackedNumber) -> StorageResult<()> {
        self.state
            .lock()
            .await
            .numbers
            .insert(number.id, number.clone());
        self.feed.publish(StoreEvent::NumberUpdated {
            number_id: number.id,
            project_id: number.project_id,
        });
        Ok(())
    }

    async fn number(&self, id: Uuid) -> StorageResult<Option<TrackedNumber>> {
        Ok(self.state.lock().await.numbers.get(&id).cloned())
    }

    async fn numbers_for_projects(&self, project_ids: &[Uuid]) -> StorageResult<Vec<TrackedNumber>> {
        let state = self.state.lock().await;
        let mut out = state
            .numbers
            .values()
            .filter(|n| project_ids.contains(&n.project_id))
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|n| (n.created_at, n.id));
        Ok(out)
    }

    async fn touch_checked(&self, id: Uuid, checked_at: DateTime<Utc>) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let number = state.numbers.get_mut(&id).ok_or(StorageError::NotFound {
            entity: "tracked number",
            id,
        })?;
        number.last_checked_at = Some(checked_at);
        let project_id = number.project_id;
        drop(state);
        self.feed.publish(StoreEvent::NumberUpdated {
            number_id: id,
            project_id,
        });
        Ok(())
    }

    async fn record_change(&self, change: &StatusChange) -> StorageResult<HistoryEntry> {
        let mut state = self.state.lock().await;
        let number = state
            .numbers
            .get_mut(&change.number_id)
            .ok_or(StorageError::NotFound {
                entity: "tracked number",
                id: change.number_id,
            })?;
        let update = &change.update;
        number.quality_rating = update.quality_rating;
        number.messaging_limit_tier = update.messaging_limit_tier.clone();
        number.previous_quality = Some(update.previous_quality);
        if update.verified_name.is_some() {
            number.verified_name = update.verified_name.clone();
        }
        if update.display_number.is_some() {
            number.display_number = update.display_number.clone();
        }
        number.last_status_change = Some(update.changed_at);
        number.last_checked_at = Some(update.changed_at);
        let project_id = number.project_id;

        let row = change
            .history
            .clone()
            .into_entry(Uuid::new_v4(), update.changed_at);
        state.history.push(row.clone());
        if let Some(notification) = &change.notification {
            state.notifications.push(notification.clone());
        }
        drop(state);

        self.feed.publish(StoreEvent::NumberUpdated {
            number_id: change.number_id,
            project_id,
        });
        self.feed.publish(StoreEvent::HistoryWritten {
            number_id: change.number_id,
            entry_id: row.id,
        });
        if let Some(notification) = &change.notification {
            self.feed.publish(StoreEvent::NotificationCreated {
                notification_id: notification.id,
                project_id: notification.project_id,
            });
        }
        Ok(row)
    }

    async fn delete_number(&self, id: Uuid) -> StorageResult<()> {
        let removed = self.state.lock().await.numbers.remove(&id);
        let number = removed.ok_or(StorageError::NotFound {
            entity: "tracked number",
            id,
        })?;
        self.feed.publish(StoreEvent::NumberDeleted {
            number_id: id,
            project_id: number.project_id,
        });
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for MemoryStore {
    async fn upsert_business_manager(&self, bm: &BusinessManager) -> StorageResult<()> {
        self.state
            .lock()
            .await
            .business_managers
            .insert(bm.id, bm.clone());
        Ok(())
    }

    async fn business_manager(&self, id: Uuid) -> StorageResult<Option<BusinessManager>> {
        Ok(self.state.lock().await.business_managers.get(&id).cloned())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append_or_compact(
        &self,
        entry: NewHistoryEntry,
        now: DateTime<Utc>,
    ) -> StorageResult<HistoryEntry> {
        let mut state = self.state.lock().await;
        let latest_idx = latest_index(&state.history, entry.tracked_number_id);
        let latest = latest_idx.map(|idx| &state.history[idx]);
        let written = match plan_history_write(latest, &entry, now, &self.clock) {
            HistoryWrite::Touch { .. } => {
                let idx = latest_idx.ok_or(StorageError::NotFound {
                    entity: "history entry",
                    id: entry.tracked_number_id,
                })?;
                state.history[idx].recorded_at = now;
                state.history[idx].clone()
            }
            HistoryWrite::Insert => {
                let row = entry.into_entry(Uuid::new_v4(), now);
                state.history.push(row.clone());
                row
            }
        };
        drop(state);
        self.feed.publish(StoreEvent::HistoryWritten {
            number_id: written.tracked_number_id,
            entry_id: written.id,
        });
        Ok(written)
    }

    async fn latest_for(&self, number_id: Uuid) -> StorageResult<Option<HistoryEntry>> {
        let state = self.state.lock().await;
        Ok(latest_index(&state.history, number_id).map(|idx| state.history[idx].clone()))
    }

    async fn list_since(
        &self,
        number_id: Uuid,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<HistoryEntry>> {
        let state = self.state.lock().await;
        let mut rows = state
            .history
            .iter()
            .enumerate()
            .filter(|(_, e)| e.tracked_number_id == number_id && e.recorded_at >= since)
            .collect::<Vec<_>>();
        rows.sort_by(|(ia, a), (ib, b)| (b.recorded_at, ib).cmp(&(a.recorded_at, ia)));
        Ok(rows.into_iter().map(|(_, e)| e.clone()).collect())
    }
}

#[async_trait]
impl NotificationRepository for MemoryStore {
    async fn notifications_for_project(
        &self,
        project_id: Uuid,
        limit: i64,
    ) -> StorageResult<Vec<ChangeNotification>> {
        let state = self.state.lock().await;
        let mut rows = state
            .notifications
            .iter()
            .filter(|n| n.project_id == project_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(rows)
    }

    async fn clear_notifications_for_number(&self, number_id: Uuid) -> StorageResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.notifications.len();
        state
            .notifications
            .retain(|n| n.tracked_number_id != number_id);
        let removed = (before - state.notifications.len()) as u64;
        drop(state);
        self.feed
            .publish(StoreEvent::NotificationsCleared { number_id });
        Ok(removed)
    }
}

#[async_trait]
impl ScheduleRegistry for MemoryStore {
    async fn list_schedules(&self, project_id: Uuid) -> StorageResult<Vec<ScheduleEntry>> {
        let state = self.state.lock().await;
        let mut rows = state
            .schedules
            .iter()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect::<Vec<_>>();
        sort_schedules(&mut rows);
        Ok(rows)
    }

    async fn all_schedules(&self) -> StorageResult<Vec<ScheduleEntry>> {
        let mut rows = self.state.lock().await.schedules.clone();
        rows.sort_by_key(|s| (s.project_id, s.position, s.time));
        Ok(rows)
    }

    async fn create_schedule(
        &self,
        project_id: Uuid,
        time: ScheduleTime,
    ) -> StorageResult<ScheduleEntry> {
        let mut state = self.state.lock().await;
        let existing = state
            .schedules
            .iter()
            .filter(|s| s.project_id == project_id)
            .collect::<Vec<_>>();
        ensure_capacity(project_id, existing.len())?;
        let position = existing.iter().map(|s| s.position + 1).max().unwrap_or(0);
        let entry = ScheduleEntry {
            id: Uuid::new_v4(),
            project_id,
            time,
            position,
            last_fired_at: None,
            created_at: Utc::now(),
        };
        state.schedules.push(entry.clone());
        drop(state);
        self.feed
            .publish(StoreEvent::SchedulesChanged { project_id });
        Ok(entry)
    }

    async fn update_schedule(&self, id: Uuid, time: ScheduleTime) -> StorageResult<ScheduleEntry> {
        let mut state = self.state.lock().await;
        let entry = state
            .schedules
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StorageError::NotFound {
                entity: "schedule",
                id,
            })?;
        entry.time = time;
        // A moved slot may fire again today.
        entry.last_fired_at = None;
        let updated = entry.clone();
        drop(state);
        self.feed.publish(StoreEvent::SchedulesChanged {
            project_id: updated.project_id,
        });
        Ok(updated)
    }

    async fn delete_schedule(&self, id: Uuid) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let idx = state
            .schedules
            .iter()
            .position(|s| s.id == id)
            .ok_or(StorageError::NotFound {
                entity: "schedule",
                id,
            })?;
        let removed = state.schedules.remove(idx);
        drop(state);
        self.feed.publish(StoreEvent::SchedulesChanged {
            project_id: removed.project_id,
        });
        Ok(())
    }

    async fn seed_default_schedules(&self, project_id: Uuid) -> StorageResult<Vec<ScheduleEntry>> {
        if !self.list_schedules(project_id).await?.is_empty() {
            return self.list_schedules(project_id).await;
        }
        for time in DEFAULT_SCHEDULE_TIMES {
            self.create_schedule(project_id, time).await?;
        }
        self.list_schedules(project_id).await
    }

    async fn mark_fired(&self, ids: &[Uuid], fired_at: DateTime<Utc>) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        for schedule in state.schedules.iter_mut().filter(|s| ids.contains(&s.id)) {
            schedule.last_fired_at = Some(fired_at);
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionLogRepository for MemoryStore {
    async fn record_execution(&self, log: &ExecutionLog) -> StorageResult<()> {
        self.state.lock().await.executions.push(log.clone());
        Ok(())
    }

    async fn recent_executions(&self, limit: i64) -> StorageResult<Vec<ExecutionLog>> {
        let mut rows = self.state.lock().await.executions.clone();
        rows.sort_by(|a, b| b.executed_at.cmp(&a.executed_at));
        rows.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(rows)
    }
}

impl Store for MemoryStore {
    fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}
