//! Postgres backend over `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::postgres::{PgExecutor, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;
use wqm_core::schedule::ensure_capacity;
use wqm_core::{
    BusinessManager, ChangeNotification, Direction, ExecutionLog, HistoryEntry, LocalClock,
    QualityRating, ScheduleEntry, ScheduleTime, TrackedNumber, DEFAULT_SCHEDULE_TIMES,
};

use crate::{
    plan_history_write, ChangeFeed, CredentialRepository, ExecutionLogRepository, HistoryStore,
    HistoryWrite, NewHistoryEntry, NotificationRepository, NumberRepository, ScheduleRegistry,
    StatusChange, StorageError, StorageResult, Store, StoreEvent,
};

const NUMBER_COLUMNS: &str = "id, project_id, phone_number_id, business_manager_id, \
    display_number, verified_name, quality_rating, messaging_limit_tier, previous_quality, \
    last_status_change, last_checked_at, visible, created_at";

const HISTORY_COLUMNS: &str = "id, tracked_number_id, quality_rating, messaging_limit_tier, \
    previous_quality, recorded_at, observation, is_error, error_message";

const NOTIFICATION_COLUMNS: &str =
    "id, tracked_number_id, project_id, previous_quality, new_quality, direction, created_at";

const SCHEDULE_COLUMNS: &str = "id, project_id, run_at, position, last_fired_at, created_at";

const EXECUTION_COLUMNS: &str =
    "id, executed_at, schedules_matched, projects_checked, numbers_updated, errors";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    clock: LocalClock,
    feed: ChangeFeed,
}

impl PgStore {
    pub fn new(pool: PgPool, clock: LocalClock) -> Self {
        Self {
            pool,
            clock,
            feed: ChangeFeed::default(),
        }
    }

    pub async fn connect(database_url: &str, clock: LocalClock) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, clock))
    }

    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn quality(table: &'static str, raw: &str) -> StorageResult<QualityRating> {
    raw.parse().map_err(|e: wqm_core::ParseQualityError| StorageError::Corrupt {
        table,
        detail: e.to_string(),
    })
}

fn optional_quality(table: &'static str, raw: Option<String>) -> StorageResult<Option<QualityRating>> {
    raw.as_deref().map(|r| quality(table, r)).transpose()
}

fn number_from_row(row: &PgRow) -> StorageResult<TrackedNumber> {
    let quality_rating: String = row.try_get("quality_rating")?;
    Ok(TrackedNumber {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        phone_number_id: row.try_get("phone_number_id")?,
        business_manager_id: row.try_get("business_manager_id")?,
        display_number: row.try_get("display_number")?,
        verified_name: row.try_get("verified_name")?,
        quality_rating: quality("tracked_numbers", &quality_rating)?,
        messaging_limit_tier: row.try_get("messaging_limit_tier")?,
        previous_quality: optional_quality("tracked_numbers", row.try_get("previous_quality")?)?,
        last_status_change: row.try_get("last_status_change")?,
        last_checked_at: row.try_get("last_checked_at")?,
        visible: row.try_get("visible")?,
        created_at: row.try_get("created_at")?,
    })
}

fn history_from_row(row: &PgRow) -> StorageResult<HistoryEntry> {
    let quality_rating: String = row.try_get("quality_rating")?;
    Ok(HistoryEntry {
        id: row.try_get("id")?,
        tracked_number_id: row.try_get("tracked_number_id")?,
        quality_rating: quality("history_entries", &quality_rating)?,
        messaging_limit_tier: row.try_get("messaging_limit_tier")?,
        previous_quality: optional_quality("history_entries", row.try_get("previous_quality")?)?,
        recorded_at: row.try_get("recorded_at")?,
        observation: row.try_get("observation")?,
        is_error: row.try_get("is_error")?,
        error_message: row.try_get("error_message")?,
    })
}

fn notification_from_row(row: &PgRow) -> StorageResult<ChangeNotification> {
    let previous: String = row.try_get("previous_quality")?;
    let new: String = row.try_get("new_quality")?;
    let direction: String = row.try_get("direction")?;
    Ok(ChangeNotification {
        id: row.try_get("id")?,
        tracked_number_id: row.try_get("tracked_number_id")?,
        project_id: row.try_get("project_id")?,
        previous_quality: quality("change_notifications", &previous)?,
        new_quality: quality("change_notifications", &new)?,
        direction: direction
            .parse::<Direction>()
            .map_err(|e| StorageError::Corrupt {
                table: "change_notifications",
                detail: e.to_string(),
            })?,
        created_at: row.try_get("created_at")?,
    })
}

fn schedule_from_row(row: &PgRow) -> StorageResult<ScheduleEntry> {
    let run_at: NaiveTime = row.try_get("run_at")?;
    Ok(ScheduleEntry {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        time: ScheduleTime::from_naive_time(run_at),
        position: row.try_get("position")?,
        last_fired_at: row.try_get("last_fired_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn execution_from_row(row: &PgRow) -> StorageResult<ExecutionLog> {
    Ok(ExecutionLog {
        id: row.try_get("id")?,
        executed_at: row.try_get("executed_at")?,
        schedules_matched: row.try_get("schedules_matched")?,
        projects_checked: row.try_get("projects_checked")?,
        numbers_updated: row.try_get("numbers_updated")?,
        errors: row.try_get("errors")?,
    })
}

#[async_trait]
impl NumberRepository for PgStore {
    async fn insert_number(&self, number: &TrackedNumber) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tracked_numbers
                (id, project_id, phone_number_id, business_manager_id, display_number,
                 verified_name, quality_rating, messaging_limit_tier, previous_quality,
                 last_status_change, last_checked_at, visible, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(number.id)
        .bind(number.project_id)
        .bind(&number.phone_number_id)
        .bind(number.business_manager_id)
        .bind(&number.display_number)
        .bind(&number.verified_name)
        .bind(number.quality_rating.as_str())
        .bind(&number.messaging_limit_tier)
        .bind(number.previous_quality.map(QualityRating::as_str))
        .bind(number.last_status_change)
        .bind(number.last_checked_at)
        .bind(number.visible)
        .bind(number.created_at)
        .execute(&self.pool)
        .await?;
        self.feed.publish(StoreEvent::NumberUpdated {
            number_id: number.id,
            project_id: number.project_id,
        });
        Ok(())
    }

    async fn number(&self, id: Uuid) -> StorageResult<Option<TrackedNumber>> {
        let query = format!("SELECT {NUMBER_COLUMNS} FROM tracked_numbers WHERE id = $1");
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(number_from_row).transpose()
    }

    async fn numbers_for_projects(&self, project_ids: &[Uuid]) -> StorageResult<Vec<TrackedNumber>> {
        if project_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT {NUMBER_COLUMNS} FROM tracked_numbers
             WHERE project_id = ANY($1)
             ORDER BY created_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(project_ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(number_from_row).collect()
    }

    async fn touch_checked(&self, id: Uuid, checked_at: DateTime<Utc>) -> StorageResult<()> {
        let row = sqlx::query(
            r#"
            UPDATE tracked_numbers
               SET last_checked_at = $2
             WHERE id = $1
            RETURNING project_id
            "#,
        )
        .bind(id)
        .bind(checked_at)
        .fetch_optional(&self.pool)
        .await?;
        let row = row.ok_or(StorageError::NotFound {
            entity: "tracked number",
            id,
        })?;
        self.feed.publish(StoreEvent::NumberUpdated {
            number_id: id,
            project_id: row.try_get("project_id")?,
        });
        Ok(())
    }

    async fn record_change(&self, change: &StatusChange) -> StorageResult<HistoryEntry> {
        let update = &change.update;
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE tracked_numbers
               SET quality_rating = $2,
                   messaging_limit_tier = $3,
                   previous_quality = $4,
                   verified_name = COALESCE($5, verified_name),
                   display_number = COALESCE($6, display_number),
                   last_status_change = $7,
                   last_checked_at = $7
             WHERE id = $1
            RETURNING project_id
            "#,
        )
        .bind(change.number_id)
        .bind(update.quality_rating.as_str())
        .bind(&update.messaging_limit_tier)
        .bind(update.previous_quality.as_str())
        .bind(&update.verified_name)
        .bind(&update.display_number)
        .bind(update.changed_at)
        .fetch_optional(&mut *tx)
        .await?;
        // Dropping the transaction rolls it back.
        let row = row.ok_or(StorageError::NotFound {
            entity: "tracked number",
            id: change.number_id,
        })?;
        let project_id: Uuid = row.try_get("project_id")?;

        let entry = change
            .history
            .clone()
            .into_entry(Uuid::new_v4(), update.changed_at);
        insert_history_row(&mut *tx, &entry).await?;
        if let Some(notification) = &change.notification {
            insert_notification_row(&mut *tx, notification).await?;
        }
        tx.commit().await?;

        self.feed.publish(StoreEvent::NumberUpdated {
            number_id: change.number_id,
            project_id,
        });
        self.feed.publish(StoreEvent::HistoryWritten {
            number_id: change.number_id,
            entry_id: entry.id,
        });
        if let Some(notification) = &change.notification {
            self.feed.publish(StoreEvent::NotificationCreated {
                notification_id: notification.id,
                project_id: notification.project_id,
            });
        }
        Ok(entry)
    }

    async fn delete_number(&self, id: Uuid) -> StorageResult<()> {
        let row = sqlx::query("DELETE FROM tracked_numbers WHERE id = $1 RETURNING project_id")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or(StorageError::NotFound {
            entity: "tracked number",
            id,
        })?;
        self.feed.publish(StoreEvent::NumberDeleted {
            number_id: id,
            project_id: row.try_get("project_id")?,
        });
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for PgStore {
    async fn upsert_business_manager(&self, bm: &BusinessManager) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO business_managers (id, project_id, name, waba_id, access_token, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (id) DO UPDATE
               SET project_id = EXCLUDED.project_id,
                   name = EXCLUDED.name,
                   waba_id = EXCLUDED.waba_id,
                   access_token = EXCLUDED.access_token,
                   updated_at = NOW()
            "#,
        )
        .bind(bm.id)
        .bind(bm.project_id)
        .bind(&bm.name)
        .bind(&bm.waba_id)
        .bind(&bm.access_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn business_manager(&self, id: Uuid) -> StorageResult<Option<BusinessManager>> {
        let row = sqlx::query(
            "SELECT id, project_id, name, waba_id, access_token FROM business_managers WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(BusinessManager {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            waba_id: row.try_get("waba_id")?,
            access_token: row.try_get("access_token")?,
        }))
    }
}

#[async_trait]
impl HistoryStore for PgStore {
    async fn append_or_compact(
        &self,
        entry: NewHistoryEntry,
        now: DateTime<Utc>,
    ) -> StorageResult<HistoryEntry> {
        let latest = self.latest_for(entry.tracked_number_id).await?;
        let written = match plan_history_write(latest.as_ref(), &entry, now, &self.clock) {
            HistoryWrite::Touch { entry_id } => {
                debug!(number_id = %entry.tracked_number_id, %entry_id, "compacting history row");
                let query = format!(
                    "UPDATE history_entries SET recorded_at = $2 WHERE id = $1 RETURNING {HISTORY_COLUMNS}"
                );
                let row = sqlx::query(&query)
                    .bind(entry_id)
                    .bind(now)
                    .fetch_optional(&self.pool)
                    .await?;
                match row {
                    Some(row) => history_from_row(&row)?,
                    // Row vanished between read and write; fall back to a fresh one.
                    None => self.insert_history(entry, now).await?,
                }
            }
            HistoryWrite::Insert => self.insert_history(entry, now).await?,
        };
        self.feed.publish(StoreEvent::HistoryWritten {
            number_id: written.tracked_number_id,
            entry_id: written.id,
        });
        Ok(written)
    }

    async fn latest_for(&self, number_id: Uuid) -> StorageResult<Option<HistoryEntry>> {
        let query = format!(
            "SELECT {HISTORY_COLUMNS} FROM history_entries
             WHERE tracked_number_id = $1
             ORDER BY recorded_at DESC, seq DESC
             LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(number_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(history_from_row).transpose()
    }

    async fn list_since(
        &self,
        number_id: Uuid,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<HistoryEntry>> {
        let query = format!(
            "SELECT {HISTORY_COLUMNS} FROM history_entries
             WHERE tracked_number_id = $1 AND recorded_at >= $2
             ORDER BY recorded_at DESC, seq DESC"
        );
        let rows = sqlx::query(&query)
            .bind(number_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(history_from_row).collect()
    }
}

impl PgStore {
    async fn insert_history(
        &self,
        entry: NewHistoryEntry,
        now: DateTime<Utc>,
    ) -> StorageResult<HistoryEntry> {
        let row = entry.into_entry(Uuid::new_v4(), now);
        insert_history_row(&self.pool, &row).await?;
        Ok(row)
    }
}

async fn insert_history_row<'e, E>(executor: E, row: &HistoryEntry) -> StorageResult<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO history_entries
            (id, tracked_number_id, quality_rating, messaging_limit_tier, previous_quality,
             recorded_at, observation, is_error, error_message)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(row.id)
    .bind(row.tracked_number_id)
    .bind(row.quality_rating.as_str())
    .bind(&row.messaging_limit_tier)
    .bind(row.previous_quality.map(QualityRating::as_str))
    .bind(row.recorded_at)
    .bind(&row.observation)
    .bind(row.is_error)
    .bind(&row.error_message)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_notification_row<'e, E>(
    executor: E,
    notification: &ChangeNotification,
) -> StorageResult<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO change_notifications
            (id, tracked_number_id, project_id, previous_quality, new_quality, direction, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(notification.id)
    .bind(notification.tracked_number_id)
    .bind(notification.project_id)
    .bind(notification.previous_quality.as_str())
    .bind(notification.new_quality.as_str())
    .bind(notification.direction.as_str())
    .bind(notification.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl NotificationRepository for PgStore {
    async fn notifications_for_project(
        &self,
        project_id: Uuid,
        limit: i64,
    ) -> StorageResult<Vec<ChangeNotification>> {
        let query = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM change_notifications
             WHERE project_id = $1
             ORDER BY created_at DESC
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(project_id)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn clear_notifications_for_number(&self, number_id: Uuid) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM change_notifications WHERE tracked_number_id = $1")
            .bind(number_id)
            .execute(&self.pool)
            .await?;
        self.feed
            .publish(StoreEvent::NotificationsCleared { number_id });
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ScheduleRegistry for PgStore {
    async fn list_schedules(&self, project_id: Uuid) -> StorageResult<Vec<ScheduleEntry>> {
        let query = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedule_entries
             WHERE project_id = $1
             ORDER BY position, run_at"
        );
        let rows = sqlx::query(&query)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn all_schedules(&self) -> StorageResult<Vec<ScheduleEntry>> {
        let query = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedule_entries ORDER BY project_id, position, run_at"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn create_schedule(
        &self,
        project_id: Uuid,
        time: ScheduleTime,
    ) -> StorageResult<ScheduleEntry> {
        let mut tx = self.pool.begin().await?;
        // Serializes concurrent creates for one project so the cap holds.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(project_id.to_string())
            .execute(&mut *tx)
            .await?;
        let row = sqlx::query(
            "SELECT COUNT(*) AS n, COALESCE(MAX(position) + 1, 0) AS next_position
               FROM schedule_entries WHERE project_id = $1",
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;
        let existing: i64 = row.try_get("n")?;
        let next_position: i32 = row.try_get("next_position")?;
        ensure_capacity(project_id, usize::try_from(existing).unwrap_or(usize::MAX))?;

        let query = format!(
            "INSERT INTO schedule_entries (id, project_id, run_at, position, created_at)
             VALUES ($1, $2, $3, $4, NOW())
             RETURNING {SCHEDULE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(project_id)
            .bind(time.to_naive_time())
            .bind(next_position)
            .fetch_one(&mut *tx)
            .await?;
        let entry = schedule_from_row(&row)?;
        tx.commit().await?;
        self.feed
            .publish(StoreEvent::SchedulesChanged { project_id });
        Ok(entry)
    }

    async fn update_schedule(&self, id: Uuid, time: ScheduleTime) -> StorageResult<ScheduleEntry> {
        let query = format!(
            "UPDATE schedule_entries SET run_at = $2, last_fired_at = NULL
             WHERE id = $1
             RETURNING {SCHEDULE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(time.to_naive_time())
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or(StorageError::NotFound {
            entity: "schedule",
            id,
        })?;
        let entry = schedule_from_row(&row)?;
        self.feed.publish(StoreEvent::SchedulesChanged {
            project_id: entry.project_id,
        });
        Ok(entry)
    }

    async fn delete_schedule(&self, id: Uuid) -> StorageResult<()> {
        let row = sqlx::query("DELETE FROM schedule_entries WHERE id = $1 RETURNING project_id")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or(StorageError::NotFound {
            entity: "schedule",
            id,
        })?;
        self.feed.publish(StoreEvent::SchedulesChanged {
            project_id: row.try_get("project_id")?,
        });
        Ok(())
    }

    async fn seed_default_schedules(&self, project_id: Uuid) -> StorageResult<Vec<ScheduleEntry>> {
        let existing = self.list_schedules(project_id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        for time in DEFAULT_SCHEDULE_TIMES {
            self.create_schedule(project_id, time).await?;
        }
        self.list_schedules(project_id).await
    }

    async fn mark_fired(&self, ids: &[Uuid], fired_at: DateTime<Utc>) -> StorageResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE schedule_entries SET last_fired_at = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(fired_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionLogRepository for PgStore {
    async fn record_execution(&self, log: &ExecutionLog) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_logs
                (id, executed_at, schedules_matched, projects_checked, numbers_updated, errors)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(log.id)
        .bind(log.executed_at)
        .bind(log.schedules_matched)
        .bind(log.projects_checked)
        .bind(log.numbers_updated)
        .bind(log.errors)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_executions(&self, limit: i64) -> StorageResult<Vec<ExecutionLog>> {
        let query = format!(
            "SELECT {EXECUTION_COLUMNS} FROM execution_logs ORDER BY executed_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&query)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(execution_from_row).collect()
    }
}

impl Store for PgStore {
    fn feed(&self) -> &ChangeFeed {
        &self.feed
    }
}
