use crate::errors::{AppError, AppResult};
use crate::models::{sort_rows_by_id, ErrorType, MetricRow};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const ROW_COLUMNS: &str = "id, chart_group, variable_name, server_name, sql_expression, value,
     error, error_type, last_error, last_updated";

/// Durable home for processed metric rows.
///
/// Saves must be idempotent: the processing loop writes the same row id
/// again on every cycle.
pub trait RowStore: Send + Sync {
    fn save_row(&self, row: &MetricRow) -> AppResult<()>;
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn upsert_row(&self, row: &MetricRow) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        upsert_row_with(&conn, row)
    }

    /// Bulk upsert of row definitions, all or nothing.
    pub fn import_rows(&self, rows: &[MetricRow]) -> AppResult<usize> {
        let mut conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let tx = conn.transaction()?;
        for row in rows {
            if row.id.trim().is_empty() {
                return Err(AppError::Store("row id cannot be empty".to_string()));
            }
            upsert_row_with(&tx, row)?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn get_row(&self, id: &str) -> AppResult<Option<MetricRow>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let row = conn
            .query_row(
                &format!("SELECT {ROW_COLUMNS} FROM chart_data WHERE id = ?1"),
                [id],
                parse_metric_row,
            )
            .optional()?;
        Ok(row)
    }

    /// All rows, ordered the way the processing loop visits them.
    pub fn list_rows(&self) -> AppResult<Vec<MetricRow>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut stmt = conn.prepare(&format!("SELECT {ROW_COLUMNS} FROM chart_data"))?;
        let rows = stmt.query_map([], parse_metric_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        sort_rows_by_id(&mut out);
        Ok(out)
    }

    pub fn delete_row(&self, id: &str) -> AppResult<bool> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute("DELETE FROM chart_data WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }
}

impl RowStore for Database {
    fn save_row(&self, row: &MetricRow) -> AppResult<()> {
        self.upsert_row(row)
    }
}

fn upsert_row_with(conn: &Connection, row: &MetricRow) -> AppResult<()> {
    conn.execute(
        "INSERT INTO chart_data (
           id, chart_group, variable_name, server_name, sql_expression, value,
           error, error_type, last_error, last_updated
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
           chart_group = excluded.chart_group,
           variable_name = excluded.variable_name,
           server_name = excluded.server_name,
           sql_expression = excluded.sql_expression,
           value = excluded.value,
           error = excluded.error,
           error_type = excluded.error_type,
           last_error = excluded.last_error,
           last_updated = excluded.last_updated",
        params![
            row.id,
            row.chart_group,
            row.variable_name,
            row.server_name,
            row.sql_expression,
            row.value,
            row.error,
            row.error_type.map(ErrorType::as_str),
            row.last_error.map(|at| at.to_rfc3339()),
            row.last_updated.map(|at| at.to_rfc3339()),
        ],
    )?;
    Ok(())
}

fn parse_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricRow> {
    let error_type = row
        .get::<_, Option<String>>(7)?
        .and_then(|raw| ErrorType::parse(&raw));
    let last_error = row
        .get::<_, Option<String>>(8)?
        .map(|raw| parse_time(&raw))
        .transpose()?;
    let last_updated = row
        .get::<_, Option<String>>(9)?
        .map(|raw| parse_time(&raw))
        .transpose()?;

    Ok(MetricRow {
        id: row.get(0)?,
        chart_group: row.get(1)?,
        variable_name: row.get(2)?,
        server_name: row.get(3)?,
        sql_expression: row.get(4)?,
        value: row.get(5)?,
        error: row.get(6)?,
        error_type,
        last_error,
        last_updated,
    })
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
