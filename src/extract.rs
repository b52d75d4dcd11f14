//! Turning a backend result set into a single metric value.

use crate::models::ErrorType;
use crate::resolver::ResultRow;
use once_cell::sync::Lazy;
use serde_json::Value;

static LEADING_NUMBER_RE: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"^[+-]?(?:Infinity|(?:\d+\.?\d*|\.\d+)(?:[eE][+-]?\d+)?)")
        .expect("valid leading number regex")
});

pub const NO_SQL_MESSAGE: &str = "No SQL expression defined";
pub const NO_VALUE_MESSAGE: &str = "No value returned from query";
pub const NON_NUMERIC_MESSAGE: &str = "Non-numeric value returned";

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Value { number: f64, raw: String },
    /// Nothing usable came back; the stored value resets to 0.
    Unusable {
        message: String,
        error_type: ErrorType,
        raw: Option<String>,
    },
    /// Lookup or backend failure; the row keeps its last known value.
    Failed { message: String, error_type: ErrorType },
}

impl QueryOutcome {
    pub fn no_sql() -> Self {
        Self::Unusable {
            message: NO_SQL_MESSAGE.to_string(),
            error_type: ErrorType::Syntax,
            raw: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        let error_type = classify_error(&message);
        Self::Failed { message, error_type }
    }
}

/// Keyword classification of backend failure messages, case-insensitive.
/// Connectivity wins over syntax when both appear.
pub fn classify_error(message: &str) -> ErrorType {
    let lowered = message.to_lowercase();
    if lowered.contains("connection") || lowered.contains("network") {
        ErrorType::Connection
    } else if lowered.contains("syntax") || lowered.contains("invalid") {
        ErrorType::Syntax
    } else {
        ErrorType::Execution
    }
}

/// Column `value` if present, then any column named `value` in another
/// case, then the first column.
pub fn select_value_field(row: &ResultRow) -> Option<(&str, &Value)> {
    if let Some(value) = row.get("value") {
        return Some(("value", value));
    }
    row.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("value"))
        .or_else(|| row.iter().next())
        .map(|(key, value)| (key.as_str(), value))
}

/// Longest leading decimal number in `text`, ignoring leading whitespace
/// and anything after the number.
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim_start();
    let matched = LEADING_NUMBER_RE.find(trimmed)?.as_str();
    match matched.trim_start_matches(['+', '-']) {
        "Infinity" if matched.starts_with('-') => Some(f64::NEG_INFINITY),
        "Infinity" => Some(f64::INFINITY),
        _ => matched.parse::<f64>().ok(),
    }
}

pub fn coerce_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => parse_number(text),
        _ => None,
    }
}

pub fn raw_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Text form used for stored values, the way dashboard scripts print
/// numbers: `5` not `5.0`, no negative zero, exponent form below 1e-6 and
/// from 1e21 up (`1e+21`, `1.5e-7`).
pub fn format_number(number: f64) -> String {
    if number == 0.0 {
        return "0".to_string();
    }
    if number.is_infinite() {
        return if number > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let magnitude = number.abs();
    if magnitude < 1e-6 || magnitude >= 1e21 {
        let exponential = format!("{:e}", number);
        return match exponential.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{}e+{}", mantissa, exponent)
            }
            _ => exponential,
        };
    }
    number.to_string()
}

pub fn outcome_from_rows(rows: &[ResultRow]) -> QueryOutcome {
    let Some((_, value)) = rows.first().and_then(select_value_field) else {
        return QueryOutcome::Unusable {
            message: NO_VALUE_MESSAGE.to_string(),
            error_type: ErrorType::Execution,
            raw: None,
        };
    };

    let raw = raw_text(value);
    match coerce_value(value) {
        Some(number) => QueryOutcome::Value { number, raw },
        None => QueryOutcome::Unusable {
            message: NON_NUMERIC_MESSAGE.to_string(),
            error_type: ErrorType::Execution,
            raw: Some(raw),
        },
    }
}
