use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use super::document::JsonDocument;
use super::SCHEDULES_FILE;
use crate::error::StorageError;
use crate::model::{NewSchedule, RunSchedule, ScheduleUpdate};
use crate::storage_traits::{ScheduleStore, StorageResult};

const ENTITY: &str = "schedule";

/// Schedules stored as `<state_dir>/schedules.json`.
pub struct FileScheduleStore {
    doc: JsonDocument<RunSchedule>,
}

impl FileScheduleStore {
    pub fn new(state_dir: impl AsRef<Path>) -> StorageResult<Self> {
        std::fs::create_dir_all(state_dir.as_ref())?;
        Ok(Self {
            doc: JsonDocument::new(state_dir.as_ref().join(SCHEDULES_FILE)),
        })
    }
}

#[async_trait]
impl ScheduleStore for FileScheduleStore {
    async fn create(&self, new: NewSchedule) -> StorageResult<RunSchedule> {
        let schedule = RunSchedule::from_new(new, Utc::now())?;
        let stored = schedule.clone();
        self.doc
            .update(move |schedules| {
                schedules.push(stored);
                Ok(())
            })
            .await?;
        Ok(schedule)
    }

    async fn update(&self, id: Uuid, update: ScheduleUpdate) -> StorageResult<RunSchedule> {
        let now = Utc::now();
        self.doc
            .update(|schedules| {
                let schedule = schedules
                    .iter_mut()
                    .find(|s| s.id == id)
                    .ok_or_else(|| StorageError::not_found(ENTITY, id))?;
                schedule.apply_update(update, now)?;
                Ok(schedule.clone())
            })
            .await
    }

    async fn get(&self, id: Uuid) -> StorageResult<RunSchedule> {
        self.doc
            .read()
            .await?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| StorageError::not_found(ENTITY, id))
    }

    async fn list(&self) -> StorageResult<Vec<RunSchedule>> {
        let mut schedules = self.doc.read().await?;
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn delete(&self, id: Uuid) -> StorageResult<()> {
        self.doc
            .update(|schedules| {
                let before = schedules.len();
                schedules.retain(|s| s.id != id);
                if schedules.len() == before {
                    return Err(StorageError::not_found(ENTITY, id));
                }
                Ok(())
            })
            .await
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> StorageResult<Vec<RunSchedule>> {
        self.doc
            .update(|schedules| {
                let mut claimed = Vec::new();
                for schedule in schedules.iter_mut().filter(|s| s.is_due(now)) {
                    if let Err(err) = schedule.fire(now) {
                        warn!(schedule_id = %schedule.id, error = %err, "skipping schedule");
                        continue;
                    }
                    claimed.push(schedule.clone());
                }
                claimed.sort_by_key(|s| s.created_at);
                Ok(claimed)
            })
            .await
    }
}
