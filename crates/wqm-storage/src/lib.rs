//! Persistence seams for the polling engine: repository traits, the daily
//! history compaction rule, and a change feed for live readers.
//!
//! Two backends implement [`Store`]: [`MemoryStore`] for tests and local
//! runs, [`PgStore`] for production.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;
use wqm_core::{
    BusinessManager, ChangeNotification, ExecutionLog, HistoryEntry, LocalClock, QualityRating,
    ScheduleEntry, ScheduleError, ScheduleTime, TrackedNumber,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "wqm-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// History row as produced by the engine, before an id and timestamp are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub tracked_number_id: Uuid,
    pub quality_rating: QualityRating,
    pub messaging_limit_tier: String,
    pub previous_quality: Option<QualityRating>,
    pub observation: Option<String>,
    pub is_error: bool,
    pub error_message: Option<String>,
}

impl NewHistoryEntry {
    pub fn steady(number: &TrackedNumber) -> Self {
        Self {
            tracked_number_id: number.id,
            quality_rating: number.quality_rating,
            messaging_limit_tier: number.messaging_limit_tier.clone(),
            previous_quality: None,
            observation: None,
            is_error: false,
            error_message: None,
        }
    }

    pub fn change(
        number: &TrackedNumber,
        quality: QualityRating,
        limit_tier: impl Into<String>,
    ) -> Self {
        Self {
            tracked_number_id: number.id,
            quality_rating: quality,
            messaging_limit_tier: limit_tier.into(),
            previous_quality: Some(number.quality_rating),
            observation: None,
            is_error: false,
            error_message: None,
        }
    }

    /// Audit row that repeats the stored state alongside the failure.
    pub fn error(number: &TrackedNumber, message: impl Into<String>) -> Self {
        Self {
            tracked_number_id: number.id,
            quality_rating: number.quality_rating,
            messaging_limit_tier: number.messaging_limit_tier.clone(),
            previous_quality: None,
            observation: None,
            is_error: true,
            error_message: Some(message.into()),
        }
    }

    pub fn with_observation(mut self, observation: impl Into<String>) -> Self {
        self.observation = Some(observation.into());
        self
    }

    fn into_entry(self, id: Uuid, recorded_at: DateTime<Utc>) -> HistoryEntry {
        HistoryEntry {
            id,
            tracked_number_id: self.tracked_number_id,
            quality_rating: self.quality_rating,
            messaging_limit_tier: self.messaging_limit_tier,
            previous_quality: self.previous_quality,
            recorded_at,
            observation: self.observation,
            is_error: self.is_error,
            error_message: self.error_message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWrite {
    Insert,
    /// Advance the timestamp of an existing row in place.
    Touch { entry_id: Uuid },
}

/// Daily compaction rule shared by every backend.
///
/// Change rows and error rows always insert. A steady observation touches
/// the latest row only when that row is a healthy snapshot of the same
/// state recorded on the same local day.
pub fn plan_history_write(
    latest: Option<&HistoryEntry>,
    incoming: &NewHistoryEntry,
    now: DateTime<Utc>,
    clock: &LocalClock,
) -> HistoryWrite {
    if incoming.is_error || incoming.previous_quality.is_some() {
        return HistoryWrite::Insert;
    }
    match latest {
        Some(latest)
            if !latest.is_error
                && latest.quality_rating == incoming.quality_rating
                && latest.messaging_limit_tier == incoming.messaging_limit_tier
                && clock.same_day(latest.recorded_at, now) =>
        {
            HistoryWrite::Touch {
                entry_id: latest.id,
            }
        }
        _ => HistoryWrite::Insert,
    }
}

/// Fields written when a poll observes a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub quality_rating: QualityRating,
    pub messaging_limit_tier: String,
    pub previous_quality: QualityRating,
    pub verified_name: Option<String>,
    pub display_number: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Everything a poll that observed a change writes. Backends commit the
/// status, the history row and the notification together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub number_id: Uuid,
    pub update: StatusUpdate,
    pub history: NewHistoryEntry,
    pub notification: Option<ChangeNotification>,
}

/// Committed write, observable by live readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreEvent {
    #[serde(rename_all = "camelCase")]
    NumberUpdated { number_id: Uuid, project_id: Uuid },
    #[serde(rename_all = "camelCase")]
    NumberDeleted { number_id: Uuid, project_id: Uuid },
    #[serde(rename_all = "camelCase")]
    HistoryWritten { number_id: Uuid, entry_id: Uuid },
    #[serde(rename_all = "camelCase")]
    NotificationCreated { notification_id: Uuid, project_id: Uuid },
    #[serde(rename_all = "camelCase")]
    NotificationsCleared { number_id: Uuid },
    #[serde(rename_all = "camelCase")]
    SchedulesChanged { project_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<StoreEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StoreEvent) {
        // No subscribers is the common case for batch runs.
        let _ = self.tx.send(event);
    }
}

#[async_trait]
pub trait NumberRepository: Send + Sync {
    async fn insert_number(&self, number: &TrackedNumber) -> StorageResult<()>;
    async fn number(&self, id: Uuid) -> StorageResult<Option<TrackedNumber>>;
    async fn numbers_for_projects(&self, project_ids: &[Uuid]) -> StorageResult<Vec<TrackedNumber>>;
    /// Updates `last_checked_at` only.
    async fn touch_checked(&self, id: Uuid, checked_at: DateTime<Utc>) -> StorageResult<()>;
    /// Writes a changed status, its history row and optional notification
    /// in one unit, setting `last_checked_at` to `changed_at`. Fails with
    /// `NotFound` and writes nothing when the number is gone.
    async fn record_change(&self, change: &StatusChange) -> StorageResult<HistoryEntry>;
    /// History and notifications for the number are left in place.
    async fn delete_number(&self, id: Uuid) -> StorageResult<()>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn upsert_business_manager(&self, bm: &BusinessManager) -> StorageResult<()>;
    async fn business_manager(&self, id: Uuid) -> StorageResult<Option<BusinessManager>>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read-latest then insert-or-touch. Not atomic across concurrent
    /// writers of the same number; a race leaves two rows for one day and
    /// the next compaction works against whichever is latest.
    async fn append_or_compact(
        &self,
        entry: NewHistoryEntry,
        now: DateTime<Utc>,
    ) -> StorageResult<HistoryEntry>;
    async fn latest_for(&self, number_id: Uuid) -> StorageResult<Option<HistoryEntry>>;
    /// Entries with `recorded_at >= since`, most recent first.
    async fn list_since(
        &self,
        number_id: Uuid,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<HistoryEntry>>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn notifications_for_project(
        &self,
        project_id: Uuid,
        limit: i64,
    ) -> StorageResult<Vec<ChangeNotification>>;
    async fn clear_notifications_for_number(&self, number_id: Uuid) -> StorageResult<u64>;
}

#[async_trait]
pub trait ScheduleRegistry: Send + Sync {
    /// Ordered by position, then time.
    async fn list_schedules(&self, project_id: Uuid) -> StorageResult<Vec<ScheduleEntry>>;
    async fn all_schedules(&self) -> StorageResult<Vec<ScheduleEntry>>;
    /// Rejects the eighth schedule of a project.
    async fn create_schedule(&self, project_id: Uuid, time: ScheduleTime)
        -> StorageResult<ScheduleEntry>;
    async fn update_schedule(&self, id: Uuid, time: ScheduleTime) -> StorageResult<ScheduleEntry>;
    async fn delete_schedule(&self, id: Uuid) -> StorageResult<()>;
    /// Inserts the 06:00/12:00/18:00 set when the project has none.
    async fn seed_default_schedules(&self, project_id: Uuid) -> StorageResult<Vec<ScheduleEntry>>;
    async fn mark_fired(&self, ids: &[Uuid], fired_at: DateTime<Utc>) -> StorageResult<()>;
}

#[async_trait]
pub trait ExecutionLogRepository: Send + Sync {
    async fn record_execution(&self, log: &ExecutionLog) -> StorageResult<()>;
    async fn recent_executions(&self, limit: i64) -> StorageResult<Vec<ExecutionLog>>;
}

/// Everything the engine and the HTTP surface need from persistence.
pub trait Store:
    NumberRepository
    + CredentialRepository
    + HistoryStore
    + NotificationRepository
    + ScheduleRegistry
    + ExecutionLogRepository
{
    fn feed(&self) -> &ChangeFeed;
}
