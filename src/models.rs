use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorType {
    Syntax,
    Connection,
    Execution,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Connection => "connection",
            Self::Execution => "execution",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "syntax" => Some(Self::Syntax),
            "connection" => Some(Self::Connection),
            "execution" => Some(Self::Execution),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    Idle,
    Running,
    Complete,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// One configured metric: a chart slot plus the SQL that computes its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRow {
    pub id: String,
    #[serde(default)]
    pub chart_group: String,
    #[serde(default)]
    pub variable_name: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub sql_expression: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_type: Option<ErrorType>,
    #[serde(default)]
    pub last_error: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl MetricRow {
    pub fn new(id: impl Into<String>, server_name: impl Into<String>, sql_expression: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chart_group: String::new(),
            variable_name: String::new(),
            server_name: server_name.into(),
            sql_expression: sql_expression.into(),
            value: String::new(),
            error: None,
            error_type: None,
            last_error: None,
            last_updated: None,
        }
    }

    pub fn has_sql(&self) -> bool {
        !self.sql_expression.trim().is_empty()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Numeric ids first in numeric order, then everything else lexically.
pub fn compare_row_ids(left: &str, right: &str) -> Ordering {
    match (left.trim().parse::<f64>(), right.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal).then_with(|| left.cmp(right)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => left.cmp(right),
    }
}

pub fn sort_rows_by_id(rows: &mut [MetricRow]) {
    rows.sort_by(|left, right| compare_row_ids(&left.id, &right.id));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerKind {
    Sqlite,
    External,
}

impl ServerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::External => "external",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    pub kind: ServerKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ServerConfig {
    pub fn sqlite(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: ServerKind::Sqlite,
            path: Some(path.into()),
            options: BTreeMap::new(),
        }
    }

    pub fn external(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServerKind::External,
            path: None,
            options: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub row_delay_ms: u64,
    pub cycle_delay_ms: u64,
    pub max_consecutive_errors: u32,
    pub max_cycles: Option<u32>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            row_delay_ms: 2_000,
            cycle_delay_ms: 5_000,
            max_consecutive_errors: 3,
            max_cycles: None,
        }
    }
}
