use super::{ConnectionResolver, ResultRow};
use crate::errors::{AppError, AppResult};
use crate::models::{ServerConfig, ServerKind};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_ROWS: usize = 1_000;

/// Runs row queries against local SQLite files (`kind: sqlite` servers).
///
/// Per-server options: `busyTimeoutMs`, `maxRows`.
#[derive(Debug, Clone, Default)]
pub struct SqliteResolver;

impl SqliteResolver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionResolver for SqliteResolver {
    async fn execute_query(
        &self,
        server_name: &str,
        config: &ServerConfig,
        sql: &str,
        cancel: &CancellationToken,
    ) -> AppResult<Vec<ResultRow>> {
        if config.kind != ServerKind::Sqlite {
            return Err(AppError::Query(format!(
                "No connection driver available for {} server {}",
                config.kind.as_str(),
                server_name
            )));
        }
        let path = config.path.clone().ok_or_else(|| {
            AppError::Config(format!("Server {} has no database path configured", server_name))
        })?;
        let busy_timeout = Duration::from_millis(option_or(config, "busyTimeoutMs", DEFAULT_BUSY_TIMEOUT_MS));
        let max_rows = option_or(config, "maxRows", DEFAULT_MAX_ROWS);

        if cancel.is_cancelled() {
            return Err(cancelled(server_name));
        }

        let conn = {
            let server = server_name.to_string();
            tokio::task::spawn_blocking(move || open_source(&server, &path, busy_timeout))
                .await
                .map_err(|error| AppError::Internal(error.to_string()))??
        };
        let interrupt = conn.get_interrupt_handle();

        let sql = sql.to_string();
        let mut task = tokio::task::spawn_blocking(move || run_query(&conn, &sql, max_rows));

        tokio::select! {
            joined = &mut task => joined.map_err(|error| AppError::Internal(error.to_string()))?,
            _ = cancel.cancelled() => {
                interrupt.interrupt();
                // The statement unwinds at its next VM step; wait so the file is closed on return.
                match task.await {
                    Ok(Ok(rows)) => Ok(rows),
                    _ => Err(cancelled(server_name)),
                }
            }
        }
    }
}

fn cancelled(server_name: &str) -> AppError {
    AppError::Query(format!("Query on {} cancelled", server_name))
}

fn option_or<T: std::str::FromStr>(config: &ServerConfig, key: &str, fallback: T) -> T {
    config
        .options
        .get(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(fallback)
}

fn open_source(server_name: &str, path: &Path, busy_timeout: Duration) -> AppResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|error| AppError::Query(format!("connection to {} failed: {}", server_name, error)))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|error| AppError::Query(format!("connection to {} failed: {}", server_name, error)))?;
    Ok(conn)
}

fn run_query(conn: &Connection, sql: &str, max_rows: usize) -> AppResult<Vec<ResultRow>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|error| AppError::Query(error.to_string()))?;
    let columns = stmt
        .column_names()
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let mut rows = stmt.query([]).map_err(|error| AppError::Query(error.to_string()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|error| AppError::Query(error.to_string()))? {
        let mut record = ResultRow::new();
        for (index, column) in columns.iter().enumerate() {
            let value = row
                .get_ref(index)
                .map_err(|error| AppError::Query(error.to_string()))?;
            record.insert(column.clone(), json_value(value));
        }
        out.push(record);
        if out.len() >= max_rows {
            break;
        }
    }
    Ok(out)
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
