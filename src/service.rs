use crate::db::RowStore;
use crate::errors::{AppError, AppResult};
use crate::extract::{classify_error, format_number, outcome_from_rows, QueryOutcome};
use crate::models::{sort_rows_by_id, ExecutionStatus, MetricRow, PipelineSettings, ServerConfig};
use crate::resolver::ConnectionResolver;
use crate::state::StateHandle;
use chrono::Utc;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another run was active; nothing was started.
    AlreadyRunning,
    /// The loop ran and exited with this status.
    Finished(ExecutionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    CircuitOpen,
    CyclesExhausted,
}

/// Releases the single-flight slot however the loop exits.
struct ActiveRunGuard<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }
}

/// Sequentially evaluates metric rows against their backends, forever or
/// for a fixed number of cycles, one run at a time.
pub struct DataProcessingService {
    resolver: Arc<dyn ConnectionResolver>,
    store: Arc<dyn RowStore>,
    state: StateHandle,
    settings: PipelineSettings,
    server_configs: RwLock<Vec<ServerConfig>>,
    active: Mutex<Option<CancellationToken>>,
}

impl DataProcessingService {
    pub fn new(
        resolver: Arc<dyn ConnectionResolver>,
        store: Arc<dyn RowStore>,
        state: StateHandle,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            resolver,
            store,
            state,
            settings,
            server_configs: RwLock::new(Vec::new()),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn set_server_configs(&self, configs: Vec<ServerConfig>) {
        let mut writer = self
            .server_configs
            .write()
            .expect("server config write lock");
        *writer = configs;
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .map(|active| active.is_some())
            .unwrap_or(false)
    }

    /// Runs the loop on a tokio task.
    pub fn spawn(self: &Arc<Self>, rows: Vec<MetricRow>) -> JoinHandle<AppResult<RunOutcome>> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.run(rows).await })
    }

    /// Drives the processing loop until it is stopped, the error budget is
    /// spent, or the configured number of cycles is done. Returns
    /// immediately if a run is already active.
    pub async fn run(&self, rows: Vec<MetricRow>) -> AppResult<RunOutcome> {
        let token = {
            let mut active = self
                .active
                .lock()
                .map_err(|_| AppError::Internal("active run mutex poisoned".to_string()))?;
            if active.is_some() {
                tracing::info!("processing already running; ignoring run request");
                return Ok(RunOutcome::AlreadyRunning);
            }
            let token = CancellationToken::new();
            *active = Some(token.clone());
            token
        };
        let _guard = ActiveRunGuard { slot: &self.active };

        let run_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("pipeline_run", run_id = %run_id);
        async {
            self.state.update(|state| {
                state.status = ExecutionStatus::Running;
                state.error = None;
                state.active_row = None;
                state.total_rows = rows.len();
                state.processed_rows = 0;
                state.failed_rows = 0;
                state.cycle = 0;
                state.updated_data = rows.clone();
                state.run_id = Some(run_id.clone());
                state.started_at = Some(Utc::now());
            })?;
            tracing::info!(total_rows = rows.len(), "processing started");

            match self.process_rows(rows, &token).await {
                Ok(LoopExit::CyclesExhausted) => {
                    self.state.update(|state| {
                        if !token.is_cancelled() && state.status != ExecutionStatus::Error {
                            state.status = ExecutionStatus::Complete;
                        }
                    })?;
                }
                Ok(LoopExit::Cancelled) | Ok(LoopExit::CircuitOpen) => {}
                Err(error) => {
                    tracing::error!(error = %error, "processing loop failed");
                    self.state.update(|state| {
                        state.status = ExecutionStatus::Error;
                        state.error = Some(error.message().to_string());
                    })?;
                }
            }

            let status = self.state.update(|state| {
                state.active_row = None;
                state.status
            })?;
            tracing::info!(status = status.as_str(), "processing finished");
            Ok::<_, AppError>(RunOutcome::Finished(status))
        }
        .instrument(span)
        .await
    }

    /// Requests cancellation of the active run. Status flips to idle at once;
    /// the loop itself exits at its next checkpoint. Returns whether a run
    /// was active.
    pub fn stop(&self) -> AppResult<bool> {
        let active = self
            .active
            .lock()
            .map_err(|_| AppError::Internal("active run mutex poisoned".to_string()))?;
        let Some(token) = active.as_ref() else {
            return Ok(false);
        };
        token.cancel();
        self.state.update(|state| {
            state.status = ExecutionStatus::Idle;
            state.active_row = None;
        })?;
        tracing::info!("processing stop requested");
        Ok(true)
    }

    /// Evaluates one row and reflects the result into the shared state.
    /// Failures come back as error fields on the returned row.
    pub async fn process_row(&self, row: MetricRow) -> MetricRow {
        let updated = self.evaluate_row(row, &CancellationToken::new()).await;
        self.publish_row(&updated);
        updated
    }

    async fn evaluate_row(&self, row: MetricRow, cancel: &CancellationToken) -> MetricRow {
        let outcome = self.execute_query(&row, cancel).await;
        let now = Utc::now();
        let mut updated = row;
        updated.last_updated = Some(now);

        match outcome {
            QueryOutcome::Value { number, raw } => {
                tracing::debug!(row_id = %updated.id, raw = %raw, "row value extracted");
                updated.value = format_number(number);
                updated.error = None;
                updated.error_type = None;
                updated.last_error = None;
            }
            QueryOutcome::Unusable { message, error_type, raw } => {
                tracing::warn!(
                    row_id = %updated.id,
                    raw = raw.as_deref().unwrap_or(""),
                    error = %message,
                    "row query returned no usable value"
                );
                updated.value = "0".to_string();
                updated.error = Some(message);
                updated.error_type = Some(error_type);
                updated.last_error = Some(now);
            }
            QueryOutcome::Failed { message, error_type } => {
                tracing::warn!(
                    row_id = %updated.id,
                    server = %updated.server_name,
                    error_type = error_type.as_str(),
                    error = %message,
                    "row query failed"
                );
                if updated.value.trim().is_empty() {
                    updated.value = "0".to_string();
                }
                updated.error = Some(message);
                updated.error_type = Some(error_type);
                updated.last_error = Some(now);
            }
        }

        updated
    }

    fn publish_row(&self, row: &MetricRow) {
        if let Err(error) = self.state.update(|state| state.upsert_row(row.clone())) {
            tracing::warn!(row_id = %row.id, error = %error, "failed to publish row result");
        }
    }

    /// Store writes are synchronous, so they go to the blocking pool.
    async fn save_row(&self, row: &MetricRow) -> AppResult<()> {
        let store = Arc::clone(&self.store);
        let row = row.clone();
        tokio::task::spawn_blocking(move || store.save_row(&row))
            .await
            .map_err(|error| AppError::Internal(error.to_string()))?
    }

    async fn execute_query(&self, row: &MetricRow, cancel: &CancellationToken) -> QueryOutcome {
        let sql = row.sql_expression.trim();
        if sql.is_empty() {
            return QueryOutcome::no_sql();
        }

        let config = match self.server_config(&row.server_name) {
            Ok(config) => config,
            Err(error) => return QueryOutcome::failed(error.message()),
        };

        match self
            .resolver
            .execute_query(&row.server_name, &config, sql, cancel)
            .await
        {
            Ok(records) => outcome_from_rows(&records),
            Err(error) => QueryOutcome::failed(error.message()),
        }
    }

    fn server_config(&self, server_name: &str) -> AppResult<ServerConfig> {
        let configs = self
            .server_configs
            .read()
            .map_err(|_| AppError::Internal("server config lock poisoned".to_string()))?;
        configs
            .iter()
            .find(|config| config.name == server_name)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Server configuration not found for {}", server_name)))
    }

    async fn process_rows(&self, mut rows: Vec<MetricRow>, token: &CancellationToken) -> AppResult<LoopExit> {
        // Spans the whole run: only a row success resets it, not a new cycle.
        let mut consecutive_errors = 0u32;
        let mut cycle = 0u32;

        loop {
            cycle += 1;
            sort_rows_by_id(&mut rows);
            self.state.update(|state| state.cycle = cycle)?;
            tracing::debug!(cycle, rows = rows.len(), "processing cycle started");

            for row in rows.iter_mut() {
                let proceed = self.state.update(|state| {
                    if token.is_cancelled() {
                        return false;
                    }
                    state.active_row = Some(row.id.clone());
                    true
                })?;
                if !proceed {
                    return Ok(LoopExit::Cancelled);
                }

                if !row.has_sql() {
                    tracing::debug!(row_id = %row.id, "skipping row without SQL");
                    continue;
                }

                let mut processed = self.evaluate_row(row.clone(), token).await;
                if token.is_cancelled() && processed.has_error() {
                    // Not recorded: after a stop the row keeps its previous state.
                    tracing::debug!(row_id = %processed.id, "discarding result of cancelled query");
                    return Ok(LoopExit::Cancelled);
                }
                self.publish_row(&processed);

                let failure = match (processed.error.clone(), self.save_row(&processed).await) {
                    (Some(message), saved) => {
                        if let Err(error) = saved {
                            tracing::warn!(row_id = %processed.id, error = %error, "failed to save failed row");
                        }
                        Some(message)
                    }
                    (None, Err(error)) => {
                        let message = error.message().to_string();
                        let now = Utc::now();
                        processed.error = Some(message.clone());
                        processed.error_type = Some(classify_error(&message));
                        processed.last_error = Some(now);
                        self.state.update(|state| state.upsert_row(processed.clone()))?;
                        Some(message)
                    }
                    (None, Ok(())) => None,
                };
                let row_id = processed.id.clone();
                *row = processed;

                match failure {
                    None => {
                        consecutive_errors = 0;
                        self.state.update(|state| state.processed_rows += 1)?;
                    }
                    Some(message) => {
                        consecutive_errors += 1;
                        self.state.update(|state| state.failed_rows += 1)?;
                        tracing::warn!(
                            row_id = %row_id,
                            consecutive_errors,
                            error = %message,
                            "row processing failed"
                        );

                        if consecutive_errors >= self.settings.max_consecutive_errors {
                            let summary = format!(
                                "Stopped after {} consecutive errors; last error on row {}: {}",
                                consecutive_errors, row_id, message
                            );
                            tracing::error!(error = %summary, "error budget exhausted");
                            self.state.update(|state| {
                                if !token.is_cancelled() {
                                    state.status = ExecutionStatus::Error;
                                    state.error = Some(summary);
                                }
                            })?;
                            return Ok(LoopExit::CircuitOpen);
                        }
                    }
                }

                if self.pause(self.settings.row_delay_ms, token).await {
                    return Ok(LoopExit::Cancelled);
                }
            }

            if let Some(max_cycles) = self.settings.max_cycles {
                if cycle >= max_cycles {
                    return Ok(LoopExit::CyclesExhausted);
                }
            }
            if self.pause(self.settings.cycle_delay_ms, token).await {
                return Ok(LoopExit::Cancelled);
            }
        }
    }

    /// Sleeps unless cancelled first. Returns true when cancelled.
    async fn pause(&self, millis: u64, token: &CancellationToken) -> bool {
        if millis == 0 {
            tokio::task::yield_now().await;
            return token.is_cancelled();
        }
        tokio::select! {
            _ = token.cancelled() => true,
            _ = tokio::time::sleep(Duration::from_millis(millis)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DataProcessingService, RunOutcome};
    use crate::db::RowStore;
    use crate::errors::{AppError, AppResult};
    use crate::models::{ErrorType, ExecutionStatus, MetricRow, PipelineSettings, ServerConfig};
    use crate::resolver::{ConnectionResolver, ResultRow};
    use crate::state::StateHandle;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    struct FixedResolver {
        result: Result<serde_json::Value, String>,
    }

    #[async_trait]
    impl ConnectionResolver for FixedResolver {
        async fn execute_query(
            &self,
            _server_name: &str,
            _config: &ServerConfig,
            _sql: &str,
            _cancel: &CancellationToken,
        ) -> AppResult<Vec<ResultRow>> {
            match &self.result {
                Ok(serde_json::Value::Object(map)) => Ok(vec![map.clone()]),
                Ok(_) => Ok(Vec::new()),
                Err(message) => Err(AppError::Query(message.clone())),
            }
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<MetricRow>>,
    }

    impl RowStore for MemoryStore {
        fn save_row(&self, row: &MetricRow) -> AppResult<()> {
            self.saved.lock().expect("store lock").push(row.clone());
            Ok(())
        }
    }

    fn service(result: Result<serde_json::Value, String>) -> DataProcessingService {
        let service = DataProcessingService::new(
            Arc::new(FixedResolver { result }),
            Arc::new(MemoryStore::default()),
            StateHandle::new(),
            PipelineSettings {
                row_delay_ms: 0,
                cycle_delay_ms: 0,
                max_consecutive_errors: 3,
                max_cycles: Some(1),
            },
        );
        service.set_server_configs(vec![ServerConfig::external("P21")]);
        service
    }

    #[tokio::test]
    async fn numeric_result_clears_previous_error() {
        let service = service(Ok(json!({ "value": 5 })));
        let mut row = MetricRow::new("1", "P21", "SELECT 5 AS value");
        row.error = Some("old".to_string());
        row.error_type = Some(ErrorType::Execution);

        let processed = service.process_row(row).await;
        assert_eq!(processed.value, "5");
        assert!(processed.error.is_none());
        assert!(processed.error_type.is_none());
        assert!(processed.last_error.is_none());
        assert!(processed.last_updated.is_some());
    }

    #[tokio::test]
    async fn blank_sql_reports_syntax_error() {
        let service = service(Ok(json!({ "value": 5 })));
        let processed = service.process_row(MetricRow::new("1", "P21", "   ")).await;
        assert_eq!(processed.value, "0");
        assert_eq!(processed.error.as_deref(), Some("No SQL expression defined"));
        assert_eq!(processed.error_type, Some(ErrorType::Syntax));
    }

    #[tokio::test]
    async fn unknown_server_is_an_execution_error() {
        let service = service(Ok(json!({ "value": 5 })));
        let mut row = MetricRow::new("1", "POR", "SELECT 1");
        row.value = "8".to_string();

        let processed = service.process_row(row).await;
        assert_eq!(processed.value, "8");
        assert_eq!(processed.error.as_deref(), Some("Server configuration not found for POR"));
        assert_eq!(processed.error_type, Some(ErrorType::Execution));
    }

    #[tokio::test]
    async fn failed_row_without_prior_value_defaults_to_zero() {
        let service = service(Err("network timeout".to_string()));
        let processed = service.process_row(MetricRow::new("1", "P21", "SELECT 1")).await;
        assert_eq!(processed.value, "0");
        assert_eq!(processed.error_type, Some(ErrorType::Connection));
        assert!(processed.last_error.is_some());
    }

    #[tokio::test]
    async fn process_row_publishes_into_state() {
        let service = service(Ok(json!({ "value": "3.5" })));
        service.process_row(MetricRow::new("11", "P21", "SELECT 1")).await;

        let state = service.state().snapshot().expect("snapshot");
        assert_eq!(state.row("11").map(|row| row.value.as_str()), Some("3.5"));
        assert_eq!(state.status, ExecutionStatus::Idle);
    }

    #[tokio::test]
    async fn finite_run_completes() {
        let service = service(Ok(json!({ "value": 1 })));
        let outcome = service
            .run(vec![MetricRow::new("1", "P21", "SELECT 1"), MetricRow::new("2", "P21", "SELECT 1")])
            .await
            .expect("run");

        assert_eq!(outcome, RunOutcome::Finished(ExecutionStatus::Complete));
        let state = service.state().snapshot().expect("snapshot");
        assert_eq!(state.processed_rows, 2);
        assert_eq!(state.total_rows, 2);
        assert!(state.active_row.is_none());
        assert!(state.run_id.is_some());
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn stop_without_active_run_is_a_no_op() {
        let service = service(Ok(json!({ "value": 1 })));
        assert!(!service.stop().expect("stop"));
        assert_eq!(service.state().status().expect("status"), ExecutionStatus::Idle);
    }
}
