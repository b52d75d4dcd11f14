use crate::errors::{AppError, AppResult};
use crate::models::{ExecutionStatus, MetricRow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Externally observable progress of the processing loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    pub active_row: Option<String>,
    pub updated_data: Vec<MetricRow>,
    pub error: Option<String>,
    pub total_rows: usize,
    pub processed_rows: usize,
    pub failed_rows: usize,
    pub cycle: u32,
    pub run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Idle,
            active_row: None,
            updated_data: Vec::new(),
            error: None,
            total_rows: 0,
            processed_rows: 0,
            failed_rows: 0,
            cycle: 0,
            run_id: None,
            started_at: None,
            updated_at: None,
        }
    }
}

impl ExecutionState {
    /// Replace the row with the same id, or append it.
    pub fn upsert_row(&mut self, row: MetricRow) {
        match self.updated_data.iter_mut().find(|existing| existing.id == row.id) {
            Some(existing) => *existing = row,
            None => self.updated_data.push(row),
        }
    }

    pub fn row(&self, id: &str) -> Option<&MetricRow> {
        self.updated_data.iter().find(|row| row.id == id)
    }
}

/// Shared handle to one [`ExecutionState`]. The processing service is the
/// only writer; everyone else reads snapshots.
#[derive(Debug, Clone, Default)]
pub struct StateHandle {
    inner: Arc<RwLock<ExecutionState>>,
}

impl StateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AppResult<ExecutionState> {
        let reader = self
            .inner
            .read()
            .map_err(|_| AppError::Internal("execution state lock poisoned".to_string()))?;
        Ok(reader.clone())
    }

    pub fn status(&self) -> AppResult<ExecutionStatus> {
        let reader = self
            .inner
            .read()
            .map_err(|_| AppError::Internal("execution state lock poisoned".to_string()))?;
        Ok(reader.status)
    }

    pub(crate) fn update<T>(&self, apply: impl FnOnce(&mut ExecutionState) -> T) -> AppResult<T> {
        let mut writer = self
            .inner
            .write()
            .map_err(|_| AppError::Internal("execution state lock poisoned".to_string()))?;
        let result = apply(&mut writer);
        writer.updated_at = Some(Utc::now());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutionState, StateHandle};
    use crate::models::{ExecutionStatus, MetricRow};

    #[test]
    fn starts_idle_and_empty() {
        let state = StateHandle::new().snapshot().expect("snapshot");
        assert_eq!(state.status, ExecutionStatus::Idle);
        assert!(state.active_row.is_none());
        assert!(state.updated_data.is_empty());
    }

    #[test]
    fn upsert_replaces_by_id_and_appends_new_rows() {
        let mut state = ExecutionState::default();
        state.upsert_row(MetricRow::new("1", "P21", "SELECT 1"));
        state.upsert_row(MetricRow::new("2", "P21", "SELECT 2"));

        let mut replacement = MetricRow::new("1", "P21", "SELECT 1");
        replacement.value = "99".to_string();
        state.upsert_row(replacement);

        assert_eq!(state.updated_data.len(), 2);
        assert_eq!(state.row("1").map(|row| row.value.as_str()), Some("99"));
    }

    #[test]
    fn snapshots_are_detached_from_later_writes() {
        let handle = StateHandle::new();
        let before = handle.snapshot().expect("snapshot");
        handle
            .update(|state| state.status = ExecutionStatus::Running)
            .expect("update");

        assert_eq!(before.status, ExecutionStatus::Idle);
        assert_eq!(handle.status().expect("status"), ExecutionStatus::Running);
        assert!(handle.snapshot().expect("snapshot").updated_at.is_some());
    }
}
