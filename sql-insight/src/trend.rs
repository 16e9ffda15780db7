//! Trend analysis over an ordered result set
//!
//! The axis is the first temporal column, or failing that the first numeric
//! or identifier column whose values are strictly monotonic in either
//! direction. Rows are ordered by the axis ascending and every other numeric
//! column gets a direction and a first-to-last change percentage.
//!
//! Direction: a strictly monotonic series is increasing or decreasing.
//! Otherwise the least-squares slope over the row index is normalized to
//! `slope * (n - 1) / mean(|y|)`, the fitted change across the whole series
//! relative to its typical magnitude, and compared against the noise
//! threshold.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::insight::format_number;
use crate::result::{ResultSet, ScalarValue, SemanticType};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Flat,
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Flat => "flat",
        })
    }
}

/// Trend of one numeric column
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnTrend {
    pub direction: TrendDirection,

    /// `(last - first) / |first| * 100`, rounded to two decimals; `None` when `first` is zero
    pub change_percentage: Option<f64>,

    /// Least-squares change per row
    #[serde(skip)]
    pub slope: f64,

    /// Linear projection one step past the last row
    #[serde(skip)]
    pub projected_next: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendReport {
    /// Column the rows were ordered by
    pub axis: Option<String>,
    pub trends: BTreeMap<String, ColumnTrend>,
    pub narrative: String,
}

/// Analyze every numeric column of the result along its ordering axis
///
/// Fails with [`Error::InsufficientData`] when fewer than two rows can be
/// ordered. Columns with fewer than two numeric values are left out.
pub fn analyze(result: &ResultSet, noise_threshold: f64) -> Result<TrendReport, Error> {
    if result.row_count() < 2 {
        return Err(Error::InsufficientData(format!(
            "trend analysis needs at least two rows, the query returned {}",
            result.row_count()
        )));
    }

    let Some(axis) = find_axis(result) else {
        return Ok(TrendReport {
            axis: None,
            trends: BTreeMap::new(),
            narrative: "The result has no date or ordered column to measure trends along.".to_string(),
        });
    };

    let order = ordered_rows(result, axis);
    if order.len() < 2 {
        return Err(Error::InsufficientData(format!(
            "only {} row(s) have a value in '{}'",
            order.len(),
            result.columns()[axis].name
        )));
    }

    let mut trends = BTreeMap::new();
    for index in result.columns_of(SemanticType::Numeric) {
        if index == axis {
            continue;
        }
        let series: Vec<f64> = order
            .iter()
            .filter_map(|&row| result.rows()[row][index].as_f64())
            .collect();
        if let Some(trend) = column_trend(&series, noise_threshold) {
            trends.insert(result.columns()[index].name.clone(), trend);
        }
    }

    let axis_name = result.columns()[axis].name.clone();
    let first_at = result.rows()[order[0]][axis].display();
    let last_at = result.rows()[order[order.len() - 1]][axis].display();
    let narrative = narrate(&trends, &axis_name, &first_at, &last_at);

    debug!(axis = %axis_name, columns = trends.len(), "trends computed");
    Ok(TrendReport {
        axis: Some(axis_name),
        trends,
        narrative,
    })
}

fn find_axis(result: &ResultSet) -> Option<usize> {
    if let Some(&temporal) = result.columns_of(SemanticType::Temporal).first() {
        return Some(temporal);
    }

    result
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, column)| {
            matches!(column.semantic_type, SemanticType::Numeric | SemanticType::Identifier)
        })
        .map(|(index, _)| index)
        .find(|&index| {
            let values: Vec<f64> = result.values(index).filter_map(ScalarValue::as_f64).collect();
            let ascending = values.windows(2).all(|pair| pair[0] < pair[1]);
            let descending = values.windows(2).all(|pair| pair[0] > pair[1]);
            values.len() == result.row_count() && (ascending || descending)
        })
}

/// Row indices with a usable axis value, sorted by it
fn ordered_rows(result: &ResultSet, axis: usize) -> Vec<usize> {
    let temporal = result.columns()[axis].semantic_type == SemanticType::Temporal;
    let mut keyed: Vec<(usize, f64)> = result
        .rows()
        .iter()
        .enumerate()
        .filter_map(|(index, row)| {
            let key = if temporal {
                row[axis].as_temporal().map(|at| at.and_utc().timestamp() as f64)
            } else {
                row[axis].as_f64()
            };
            key.map(|key| (index, key))
        })
        .collect();

    keyed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
    keyed.into_iter().map(|(index, _)| index).collect()
}

fn column_trend(series: &[f64], noise_threshold: f64) -> Option<ColumnTrend> {
    if series.len() < 2 {
        return None;
    }
    let n = series.len() as f64;
    let first = series[0];
    let last = series[series.len() - 1];

    let mean_x = (n - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f64>() / n;
    let (covariance, variance) = series
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(covariance, variance), (index, value)| {
            let dx = index as f64 - mean_x;
            (covariance + dx * (value - mean_y), variance + dx * dx)
        });
    let slope = covariance / variance;
    let intercept = mean_y - slope * mean_x;

    let direction = if series.windows(2).all(|pair| pair[0] < pair[1]) {
        TrendDirection::Increasing
    } else if series.windows(2).all(|pair| pair[0] > pair[1]) {
        TrendDirection::Decreasing
    } else {
        let magnitude = series.iter().map(|value| value.abs()).sum::<f64>() / n;
        let normalized = if magnitude == 0.0 {
            0.0
        } else {
            slope * (n - 1.0) / magnitude
        };
        if normalized > noise_threshold {
            TrendDirection::Increasing
        } else if normalized < -noise_threshold {
            TrendDirection::Decreasing
        } else {
            TrendDirection::Flat
        }
    };

    let change_percentage = (first != 0.0).then(|| round2((last - first) / first.abs() * 100.0));

    Some(ColumnTrend {
        direction,
        change_percentage,
        slope,
        projected_next: intercept + slope * n,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn narrate(trends: &BTreeMap<String, ColumnTrend>, axis: &str, first_at: &str, last_at: &str) -> String {
    if trends.is_empty() {
        return format!("No numeric columns vary along {} to project.", axis);
    }

    let mut sentences = vec![format!("Across {} from {} to {}:", axis, first_at, last_at)];
    for (column, trend) in trends {
        let change = match trend.change_percentage {
            Some(percentage) if percentage > 0.0 => format!(" (+{}%)", format_number(percentage)),
            Some(percentage) => format!(" ({}%)", format_number(percentage)),
            None => String::new(),
        };
        let outlook = match trend.direction {
            TrendDirection::Flat => "and is expected to hold near current levels".to_string(),
            _ => format!(
                "and would reach about {} at the next {} if the trend continues",
                format_number(trend.projected_next),
                axis
            ),
        };
        sentences.push(format!("{} is {}{} {}.", column, trend.direction, change, outlook));
    }

    let directions: Vec<TrendDirection> = trends.values().map(|trend| trend.direction).collect();
    if directions.len() > 1 {
        if directions.iter().all(|direction| *direction == directions[0]) {
            sentences.push(format!("All {} measures are {}.", directions.len(), directions[0]));
        } else {
            let rising = directions.iter().filter(|d| **d == TrendDirection::Increasing).count();
            let falling = directions.iter().filter(|d| **d == TrendDirection::Decreasing).count();
            sentences.push(format!(
                "The measures diverge: {} rising, {} falling, {} flat.",
                rising,
                falling,
                directions.len() - rising - falling
            ));
        }
    }

    sentences.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monthly(values: &[Option<i64>]) -> ResultSet {
        ResultSet::new(
            vec![
                ("month".to_string(), Some("TEXT".to_string())),
                ("revenue".to_string(), Some("INTEGER".to_string())),
            ],
            values
                .iter()
                .enumerate()
                .map(|(index, value)| {
                    vec![
                        ScalarValue::Text(format!("2024-{:02}", index + 1)),
                        value.map_or(ScalarValue::Null, ScalarValue::Integer),
                    ]
                })
                .collect(),
        )
    }

    #[test]
    fn test_increasing_monthly_revenue() {
        let result = monthly(&[Some(100), Some(120), Some(140), Some(160), Some(180), Some(200)]);
        let report = analyze(&result, 0.01).unwrap();

        assert_eq!(report.axis.as_deref(), Some("month"));
        let revenue = &report.trends["revenue"];
        assert_eq!(revenue.direction, TrendDirection::Increasing);
        assert_eq!(revenue.change_percentage, Some(100.0));
        assert!((revenue.projected_next - 220.0).abs() < 1e-9);
        assert!(report.narrative.contains("revenue is increasing (+100%)"));
    }

    #[test]
    fn test_rows_are_ordered_by_axis() {
        let result = ResultSet::new(
            vec![
                ("day".to_string(), Some("DATE".to_string())),
                ("visits".to_string(), Some("INTEGER".to_string())),
            ],
            vec![
                vec![ScalarValue::Text("2024-03-03".into()), ScalarValue::Integer(10)],
                vec![ScalarValue::Text("2024-03-01".into()), ScalarValue::Integer(30)],
                vec![ScalarValue::Text("2024-03-02".into()), ScalarValue::Integer(20)],
            ],
        );
        let report = analyze(&result, 0.01).unwrap();
        let visits = &report.trends["visits"];
        assert_eq!(visits.direction, TrendDirection::Decreasing);
        assert_eq!(visits.change_percentage, Some(-66.67));
    }

    #[test]
    fn test_noisy_series_within_threshold_is_flat() {
        let result = monthly(&[Some(1000), Some(1002), Some(998), Some(1001), Some(999), Some(1000)]);
        let report = analyze(&result, 0.01).unwrap();
        assert_eq!(report.trends["revenue"].direction, TrendDirection::Flat);
        assert_eq!(report.trends["revenue"].change_percentage, Some(0.0));
    }

    #[test]
    fn test_zero_first_value_has_undefined_change() {
        let result = monthly(&[Some(0), Some(5), Some(10)]);
        let report = analyze(&result, 0.01).unwrap();
        let revenue = &report.trends["revenue"];
        assert_eq!(revenue.direction, TrendDirection::Increasing);
        assert_eq!(revenue.change_percentage, None);

        let json = serde_json::to_value(&report.trends).unwrap();
        assert!(json["revenue"]["changePercentage"].is_null());
        assert_eq!(json["revenue"]["direction"], "increasing");
    }

    #[test]
    fn test_sparse_columns_are_omitted() {
        let result = monthly(&[Some(10), None, None]);
        let report = analyze(&result, 0.01).unwrap();
        assert!(report.trends.is_empty());
    }

    #[test]
    fn test_fewer_than_two_rows_is_insufficient() {
        let error = analyze(&monthly(&[Some(10)]), 0.01).unwrap_err();
        assert!(matches!(error, Error::InsufficientData(_)));
    }

    #[test]
    fn test_monotonic_ordinal_axis() {
        let result = ResultSet::new(
            vec![
                ("year".to_string(), Some("INTEGER".to_string())),
                ("units".to_string(), Some("INTEGER".to_string())),
            ],
            vec![
                vec![ScalarValue::Integer(2021), ScalarValue::Integer(50)],
                vec![ScalarValue::Integer(2022), ScalarValue::Integer(40)],
                vec![ScalarValue::Integer(2023), ScalarValue::Integer(45)],
            ],
        );
        let report = analyze(&result, 0.01).unwrap();
        assert_eq!(report.axis.as_deref(), Some("year"));
        assert!(!report.trends.contains_key("year"));
        assert_eq!(report.trends["units"].change_percentage, Some(-10.0));
    }

    #[test]
    fn test_descending_ordinal_axis_is_reordered() {
        let result = ResultSet::new(
            vec![
                ("year".to_string(), Some("INTEGER".to_string())),
                ("units".to_string(), Some("INTEGER".to_string())),
            ],
            vec![
                vec![ScalarValue::Integer(2023), ScalarValue::Integer(60)],
                vec![ScalarValue::Integer(2022), ScalarValue::Integer(50)],
                vec![ScalarValue::Integer(2021), ScalarValue::Integer(40)],
            ],
        );
        let report = analyze(&result, 0.01).unwrap();
        assert_eq!(report.axis.as_deref(), Some("year"));
        let units = &report.trends["units"];
        assert_eq!(units.direction, TrendDirection::Increasing);
        assert_eq!(units.change_percentage, Some(50.0));
        assert!(report.narrative.contains("from 2021 to 2023"));
    }

    #[test]
    fn test_no_axis_gives_empty_report() {
        let result = ResultSet::new(
            vec![
                ("region".to_string(), Some("TEXT".to_string())),
                ("sales".to_string(), Some("INTEGER".to_string())),
            ],
            vec![
                vec![ScalarValue::Text("north".into()), ScalarValue::Integer(5)],
                vec![ScalarValue::Text("south".into()), ScalarValue::Integer(3)],
            ],
        );
        let report = analyze(&result, 0.01).unwrap();
        assert!(report.axis.is_none());
        assert!(report.trends.is_empty());
    }
}
