//! Reshapes processed rows into the grouped form chart widgets consume.

use crate::extract::parse_number;
use crate::models::{compare_row_ids, MetricRow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetric {
    pub id: String,
    pub variable_name: String,
    pub value: f64,
    /// The last refresh failed; `value` is the last known good one.
    pub stale: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartGroup {
    pub chart_group: String,
    pub metrics: Vec<ChartMetric>,
}

pub fn group_by_chart(rows: &[MetricRow]) -> Vec<ChartGroup> {
    let mut grouped: BTreeMap<&str, Vec<&MetricRow>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.chart_group.as_str()).or_default().push(row);
    }

    grouped
        .into_iter()
        .map(|(chart_group, mut members)| {
            members.sort_by(|left, right| compare_row_ids(&left.id, &right.id));
            ChartGroup {
                chart_group: chart_group.to_string(),
                metrics: members.into_iter().map(chart_metric).collect(),
            }
        })
        .collect()
}

pub fn group_totals(groups: &[ChartGroup]) -> BTreeMap<String, f64> {
    groups
        .iter()
        .map(|group| {
            let total = group.metrics.iter().map(|metric| metric.value).sum::<f64>();
            (group.chart_group.clone(), total)
        })
        .collect()
}

fn chart_metric(row: &MetricRow) -> ChartMetric {
    ChartMetric {
        id: row.id.clone(),
        variable_name: row.variable_name.clone(),
        value: parse_number(&row.value)
            .filter(|number| number.is_finite())
            .unwrap_or(0.0),
        stale: row.has_error(),
        error: row.error.clone(),
    }
}
