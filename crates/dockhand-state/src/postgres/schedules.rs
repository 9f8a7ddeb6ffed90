use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, Row};
use tracing::warn;
use uuid::Uuid;

use super::PgHandle;
use crate::error::StorageError;
use crate::model::{EnqueueRequest, NewSchedule, RunSchedule, ScheduleUpdate};
use crate::storage_traits::{ScheduleStore, StorageResult};

const ENTITY: &str = "schedule";

const COLUMNS: &str =
    "id, name, cron, enabled, target, next_run_at, last_run_at, created_at, updated_at";

/// Schedules in the `dockhand_schedules` table.
pub struct PgScheduleStore {
    handle: PgHandle,
}

impl PgScheduleStore {
    pub fn new(handle: PgHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl ScheduleStore for PgScheduleStore {
    async fn create(&self, new: NewSchedule) -> StorageResult<RunSchedule> {
        let schedule = RunSchedule::from_new(new, Utc::now())?;
        let pool = self.handle.ready().await?;
        sqlx::query(&format!(
            "INSERT INTO dockhand_schedules ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(schedule.id)
        .bind(&schedule.name)
        .bind(&schedule.cron)
        .bind(schedule.enabled)
        .bind(Json(&schedule.target))
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(pool)
        .await?;
        Ok(schedule)
    }

    async fn update(&self, id: Uuid, update: ScheduleUpdate) -> StorageResult<RunSchedule> {
        let pool = self.handle.ready().await?;
        let mut tx = pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_schedules WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StorageError::not_found(ENTITY, id))?;

        let mut schedule = schedule_from_row(&row)?;
        schedule.apply_update(update, Utc::now())?;
        write_schedule(&mut *tx, &schedule).await?;
        tx.commit().await?;
        Ok(schedule)
    }

    async fn get(&self, id: Uuid) -> StorageResult<RunSchedule> {
        let pool = self.handle.ready().await?;
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_schedules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| StorageError::not_found(ENTITY, id))?;
        schedule_from_row(&row)
    }

    async fn list(&self) -> StorageResult<Vec<RunSchedule>> {
        let pool = self.handle.ready().await?;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_schedules ORDER BY created_at, id"
        ))
        .fetch_all(pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn delete(&self, id: Uuid) -> StorageResult<()> {
        let pool = self.handle.ready().await?;
        let result = sqlx::query("DELETE FROM dockhand_schedules WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found(ENTITY, id));
        }
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> StorageResult<Vec<RunSchedule>> {
        let pool = self.handle.ready().await?;
        let mut tx = pool.begin().await?;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM dockhand_schedules \
             WHERE enabled AND next_run_at <= $1 \
             ORDER BY next_run_at, id \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut schedule = schedule_from_row(row)?;
            if let Err(err) = schedule.fire(now) {
                warn!(schedule_id = %schedule.id, error = %err, "skipping schedule");
                continue;
            }
            write_schedule(&mut *tx, &schedule).await?;
            claimed.push(schedule);
        }
        tx.commit().await?;
        Ok(claimed)
    }
}

async fn write_schedule(conn: &mut PgConnection, schedule: &RunSchedule) -> StorageResult<()> {
    sqlx::query(
        "UPDATE dockhand_schedules SET \
            name = $2, cron = $3, enabled = $4, target = $5, next_run_at = $6, \
            last_run_at = $7, updated_at = $8 \
         WHERE id = $1",
    )
    .bind(schedule.id)
    .bind(&schedule.name)
    .bind(&schedule.cron)
    .bind(schedule.enabled)
    .bind(Json(&schedule.target))
    .bind(schedule.next_run_at)
    .bind(schedule.last_run_at)
    .bind(schedule.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn schedule_from_row(row: &PgRow) -> StorageResult<RunSchedule> {
    let target: Json<EnqueueRequest> = row.try_get("target")?;
    Ok(RunSchedule {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cron: row.try_get("cron")?,
        enabled: row.try_get("enabled")?,
        target: target.0,
        next_run_at: row.try_get("next_run_at")?,
        last_run_at: row.try_get("last_run_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
