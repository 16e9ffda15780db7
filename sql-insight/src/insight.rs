//! Insight narrative and data summaries
//!
//! Every number in a narrative is an aggregate of the result set it
//! describes: a count, sum, mean, minimum, maximum or first-to-last change.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::result::{ResultSet, SemanticType};

/// Narrative used when there is nothing to describe
pub const NO_ROWS_INSIGHT: &str = "No rows were returned, so no insights are available.";

/// Narrative used when the generator could not run
pub const UNAVAILABLE_INSIGHT: &str = "Insights are unavailable for this result.";

/// Aggregates of one numeric column, over its non-null cells
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnStatistics {
    pub count: usize,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl ColumnStatistics {
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().sum();
        Some(Self {
            count: values.len(),
            sum,
            mean: sum / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

/// Shape and per-column aggregates of a result set
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSummary {
    pub row_count: usize,
    pub columns: Vec<String>,
    pub numeric_columns: Vec<String>,
    pub statistics: BTreeMap<String, ColumnStatistics>,
}

pub fn summarize(result: &ResultSet) -> DataSummary {
    let numeric = result.columns_of(SemanticType::Numeric);
    let statistics = numeric
        .iter()
        .filter_map(|&index| {
            ColumnStatistics::of(&result.numeric_values(index))
                .map(|statistics| (result.columns()[index].name.clone(), statistics))
        })
        .collect();

    DataSummary {
        row_count: result.row_count(),
        columns: result.column_names(),
        numeric_columns: numeric
            .iter()
            .map(|&index| result.columns()[index].name.clone())
            .collect(),
        statistics,
    }
}

/// Describe a result set in a few sentences
pub fn generate(result: &ResultSet, question: Option<&str>) -> String {
    if result.is_empty() {
        return NO_ROWS_INSIGHT.to_string();
    }

    let mut sentences = Vec::new();
    let rows = plural(result.row_count(), "row");
    let columns = plural(result.columns().len(), "column");
    match question.map(str::trim).filter(|question| !question.is_empty()) {
        Some(question) => sentences.push(format!("For \"{}\", the query returned {} across {}.", question, rows, columns)),
        None => sentences.push(format!("The query returned {} across {}.", rows, columns)),
    }

    let numeric = result.columns_of(SemanticType::Numeric);
    let label = result
        .columns_of(SemanticType::Categorical)
        .first()
        .copied();
    let axis = result.columns_of(SemanticType::Temporal).first().copied();

    for &index in &numeric {
        let name = &result.columns()[index].name;
        let Some(statistics) = ColumnStatistics::of(&result.numeric_values(index)) else {
            continue;
        };

        if statistics.count == 1 {
            sentences.push(format!("{} is {}.", name, format_number(statistics.sum)));
            continue;
        }

        sentences.push(format!(
            "{} ranges from {} to {} with an average of {} and a total of {}.",
            name,
            format_number(statistics.min),
            format_number(statistics.max),
            format_number(statistics.mean),
            format_number(statistics.sum),
        ));

        if let Some(label) = label {
            if let Some(sentence) = extremes(result, label, index) {
                sentences.push(sentence);
            }
        }
        if let Some(axis) = axis {
            if let Some(sentence) = change_over(result, axis, index) {
                sentences.push(sentence);
            }
        }
    }

    sentences.join(" ")
}

/// Which labels hold the largest and smallest values of a column
fn extremes(result: &ResultSet, label: usize, measure: usize) -> Option<String> {
    let mut highest: Option<(f64, String)> = None;
    let mut lowest: Option<(f64, String)> = None;

    for row in result.rows() {
        let (Some(value), false) = (row[measure].as_f64(), row[label].is_null()) else {
            continue;
        };
        if highest.as_ref().map_or(true, |(best, _)| value > *best) {
            highest = Some((value, row[label].display()));
        }
        if lowest.as_ref().map_or(true, |(best, _)| value < *best) {
            lowest = Some((value, row[label].display()));
        }
    }

    let ((high, high_label), (low, low_label)) = (highest?, lowest?);
    if high_label == low_label {
        return None;
    }
    let measure = &result.columns()[measure].name;
    Some(format!(
        "The highest {} is {} ({}) and the lowest is {} ({}).",
        measure,
        format_number(high),
        high_label,
        format_number(low),
        low_label
    ))
}

/// First-to-last change of a column along the temporal axis, in row order
fn change_over(result: &ResultSet, axis: usize, measure: usize) -> Option<String> {
    let points: Vec<(String, f64)> = result
        .rows()
        .iter()
        .filter_map(|row| {
            let value = row[measure].as_f64()?;
            row[axis].as_temporal()?;
            Some((row[axis].display(), value))
        })
        .collect();

    let ((first_at, first), (last_at, last)) = (points.first()?, points.last()?);
    if points.len() < 2 {
        return None;
    }

    let measure = &result.columns()[measure].name;
    let change = if *first != 0.0 {
        let percentage = (last - first) / first.abs() * 100.0;
        let sign = if percentage > 0.0 { "+" } else { "" };
        format!(" ({}{}%)", sign, format_number(percentage))
    } else {
        String::new()
    };
    Some(format!(
        "From {} to {}, {} went from {} to {}{}.",
        first_at,
        last_at,
        measure,
        format_number(*first),
        format_number(*last),
        change
    ))
}

fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {}", noun)
    } else {
        format!("{} {}s", count, noun)
    }
}

/// Round to two decimals and drop trailing zeros
pub(crate) fn format_number(value: f64) -> String {
    let rounded = (value * 100.0).round() / 100.0;
    let text = format!("{:.2}", rounded);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}
