pub mod config;
pub mod db;
pub mod errors;
pub mod extract;
pub mod models;
pub mod resolver;
pub mod service;
pub mod state;
pub mod telemetry;
pub mod transform;

use crate::config::AppConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::resolver::sqlite::SqliteResolver;
use crate::resolver::ConnectionResolver;
use crate::service::{DataProcessingService, RunOutcome};
use crate::state::StateHandle;
use std::sync::Arc;
use std::time::Duration;

/// The process-level wiring: one store, one state, one service.
pub struct Pipeline {
    db: Arc<Database>,
    service: Arc<DataProcessingService>,
    status_interval: Duration,
}

impl Pipeline {
    pub fn open(config: &AppConfig) -> AppResult<Self> {
        Self::with_resolver(config, Arc::new(SqliteResolver::new()))
    }

    pub fn with_resolver(config: &AppConfig, resolver: Arc<dyn ConnectionResolver>) -> AppResult<Self> {
        let db = Arc::new(Database::new(&config.database_path)?);
        let service = Arc::new(DataProcessingService::new(
            resolver,
            db.clone(),
            StateHandle::new(),
            config.pipeline.clone(),
        ));
        service.set_server_configs(config.servers.clone());

        Ok(Self {
            db,
            service,
            status_interval: Duration::from_secs(config.status_interval_secs.max(1)),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn service(&self) -> &Arc<DataProcessingService> {
        &self.service
    }

    /// Runs the service over every stored row until the run ends on its own
    /// or Ctrl-C arrives, logging a status snapshot on a fixed interval.
    pub async fn run_until_shutdown(&self) -> AppResult<RunOutcome> {
        let rows = self.db.list_rows()?;
        if rows.is_empty() {
            tracing::warn!(database = %self.db.path().display(), "no metric rows to process");
        }

        let reporter = tokio::spawn({
            let state = self.service.state().clone();
            let period = self.status_interval;
            async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    interval.tick().await;
                    match state.snapshot() {
                        Ok(snapshot) => tracing::info!(
                            status = snapshot.status.as_str(),
                            active_row = snapshot.active_row.as_deref().unwrap_or("-"),
                            cycle = snapshot.cycle,
                            processed_rows = snapshot.processed_rows,
                            failed_rows = snapshot.failed_rows,
                            total_rows = snapshot.total_rows,
                            "pipeline status"
                        ),
                        Err(error) => tracing::warn!(error = %error, "status snapshot failed"),
                    }
                }
            }
        });

        let mut handle = self.service.spawn(rows);
        let joined = tokio::select! {
            joined = &mut handle => joined,
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => {
                        tracing::info!("shutdown signal received");
                        self.service.stop()?;
                    }
                    Err(error) => tracing::warn!(error = %error, "failed to listen for shutdown signal"),
                }
                handle.await
            }
        };
        reporter.abort();

        joined.map_err(|error| AppError::Internal(error.to_string()))?
    }
}
