//! Visualization selection
//!
//! [`select`] maps a result set and a chart hint onto a declarative
//! [`ChartSpec`]: the chart kind, the axis columns and a renderer-neutral plot
//! description shaped like Plotly's `{data, layout}`. Selection never fails;
//! when no encoding fits, the chart has kind `none` and an error reason.
//!
//! Automatic selection works on the semantic types of the result columns, in
//! this order:
//!
//! | Columns present                                  | Chart     |
//! |--------------------------------------------------|-----------|
//! | temporal + numeric                               | line      |
//! | categorical (low cardinality) + numeric          | bar       |
//! | two or more numeric, no categorical or temporal  | scatter   |
//! | exactly one numeric, nothing else                | histogram |
//! | categorical (many values) + numeric              | box       |
//! | anything else                                    | none      |
//!
//! Identifier columns never become axes. Within a semantic type the first
//! column in result order wins.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::result::{ResultSet, ScalarValue, SemanticType};

/// Chart kind requested by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartHint {
    #[default]
    Auto,
    None,
    Bar,
    Line,
    Scatter,
    Pie,
    Histogram,
    Box,
}

impl ChartHint {
    /// The concrete kind this hint asks for, if any
    pub fn kind(&self) -> Option<ChartKind> {
        match self {
            ChartHint::Auto | ChartHint::None => None,
            ChartHint::Bar => Some(ChartKind::Bar),
            ChartHint::Line => Some(ChartKind::Line),
            ChartHint::Scatter => Some(ChartKind::Scatter),
            ChartHint::Pie => Some(ChartKind::Pie),
            ChartHint::Histogram => Some(ChartKind::Histogram),
            ChartHint::Box => Some(ChartKind::Box),
        }
    }
}

/// Chart kind that was actually chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Line,
    Scatter,
    Pie,
    Histogram,
    Box,
    None,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Bar => "bar",
            ChartKind::Line => "line",
            ChartKind::Scatter => "scatter",
            ChartKind::Pie => "pie",
            ChartKind::Histogram => "histogram",
            ChartKind::Box => "box",
            ChartKind::None => "none",
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative chart description
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub x_column: Option<String>,
    pub y_columns: Vec<String>,
    pub plot: Option<PlotDescription>,

    /// Why no chart could be built
    pub error: Option<String>,
}

impl ChartSpec {
    /// No chart, and nothing wrong with that
    pub fn none() -> Self {
        Self {
            kind: ChartKind::None,
            x_column: None,
            y_columns: Vec::new(),
            plot: None,
            error: None,
        }
    }

    fn unsuitable(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::none()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotDescription {
    pub traces: Vec<Trace>,
    pub layout: Layout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    #[serde(rename = "type")]
    pub trace_type: &'static str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<Vec<Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<Vec<Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

impl Trace {
    fn new(trace_type: &'static str) -> Self {
        Self {
            trace_type,
            mode: None,
            name: None,
            x: None,
            y: None,
            labels: None,
            values: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layout {
    pub title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub xaxis: Option<Axis>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaxis: Option<Axis>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Axis {
    pub title: String,
}

impl Axis {
    fn titled(title: &str) -> Option<Self> {
        Some(Self {
            title: title.to_string(),
        })
    }
}

/// Column indices grouped by semantic type, identifiers left out
struct Shape {
    numeric: Vec<usize>,
    categorical: Vec<usize>,
    temporal: Vec<usize>,
}

impl Shape {
    fn of(result: &ResultSet) -> Self {
        Self {
            numeric: result.columns_of(SemanticType::Numeric),
            categorical: result.columns_of(SemanticType::Categorical),
            temporal: result.columns_of(SemanticType::Temporal),
        }
    }
}

/// Choose a chart for the result
///
/// `low_cardinality_threshold` is the largest number of distinct values a
/// categorical column may hold to be drawn as bars.
pub fn select(result: &ResultSet, hint: ChartHint, low_cardinality_threshold: usize) -> ChartSpec {
    if hint == ChartHint::None {
        return ChartSpec::none();
    }
    if result.is_empty() {
        return ChartSpec::unsuitable("the query returned no rows to chart");
    }

    let shape = Shape::of(result);
    match hint.kind() {
        Some(kind) => build(result, &shape, kind),
        None => auto(result, &shape, low_cardinality_threshold),
    }
}

fn auto(result: &ResultSet, shape: &Shape, low_cardinality_threshold: usize) -> ChartSpec {
    let has_numeric = !shape.numeric.is_empty();

    let kind = if has_numeric && !shape.temporal.is_empty() {
        ChartKind::Line
    } else if has_numeric
        && shape
            .categorical
            .first()
            .is_some_and(|&index| result.distinct_count(index) <= low_cardinality_threshold)
    {
        ChartKind::Bar
    } else if shape.numeric.len() >= 2 && shape.categorical.is_empty() && shape.temporal.is_empty() {
        ChartKind::Scatter
    } else if shape.numeric.len() == 1 && shape.categorical.is_empty() && shape.temporal.is_empty() {
        ChartKind::Histogram
    } else if has_numeric && !shape.categorical.is_empty() {
        ChartKind::Box
    } else {
        return ChartSpec::unsuitable("no chart fits the result columns");
    };

    build(result, shape, kind)
}

fn build(result: &ResultSet, shape: &Shape, kind: ChartKind) -> ChartSpec {
    let name = |index: usize| result.columns()[index].name.as_str();

    match kind {
        ChartKind::Line => {
            let Some(x) = shape.temporal.first().or(shape.categorical.first()).copied() else {
                return ChartSpec::unsuitable("a line chart needs a temporal or categorical column for the x axis");
            };
            if shape.numeric.is_empty() {
                return ChartSpec::unsuitable("a line chart needs a numeric column");
            }
            let title = format!("{} over {}", name(shape.numeric[0]), name(x));
            let traces = shape
                .numeric
                .iter()
                .map(|&y| Trace {
                    mode: Some("lines"),
                    name: Some(name(y).to_string()),
                    x: Some(column(result, x)),
                    y: Some(column(result, y)),
                    ..Trace::new("scatter")
                })
                .collect();
            axes_spec(result, kind, x, &shape.numeric, traces, title)
        }
        ChartKind::Bar => {
            let Some(x) = shape.categorical.first().or(shape.temporal.first()).copied() else {
                return ChartSpec::unsuitable("a bar chart needs a categorical column");
            };
            if shape.numeric.is_empty() {
                return ChartSpec::unsuitable("a bar chart needs a numeric column");
            }
            let title = format!("{} by {}", name(shape.numeric[0]), name(x));
            let traces = shape
                .numeric
                .iter()
                .map(|&y| Trace {
                    name: Some(name(y).to_string()),
                    x: Some(column(result, x)),
                    y: Some(column(result, y)),
                    ..Trace::new("bar")
                })
                .collect();
            axes_spec(result, kind, x, &shape.numeric, traces, title)
        }
        ChartKind::Scatter => {
            let [x, y, ..] = shape.numeric[..] else {
                return ChartSpec::unsuitable("a scatter chart needs two numeric columns");
            };
            let trace = Trace {
                mode: Some("markers"),
                x: Some(column(result, x)),
                y: Some(column(result, y)),
                ..Trace::new("scatter")
            };
            let title = format!("{} vs {}", name(y), name(x));
            axes_spec(result, kind, x, &[y], vec![trace], title)
        }
        ChartKind::Pie => {
            let (Some(&labels), Some(&values)) = (shape.categorical.first(), shape.numeric.first()) else {
                return ChartSpec::unsuitable("a pie chart needs a categorical column and a numeric column");
            };
            let trace = Trace {
                labels: Some(column(result, labels)),
                values: Some(column(result, values)),
                ..Trace::new("pie")
            };
            ChartSpec {
                kind,
                x_column: Some(name(labels).to_string()),
                y_columns: vec![name(values).to_string()],
                plot: Some(PlotDescription {
                    traces: vec![trace],
                    layout: Layout {
                        title: format!("Distribution of {}", name(values)),
                        xaxis: None,
                        yaxis: None,
                    },
                }),
                error: None,
            }
        }
        ChartKind::Histogram => {
            let Some(&y) = shape.numeric.first() else {
                return ChartSpec::unsuitable("a histogram needs a numeric column");
            };
            let trace = Trace {
                x: Some(column(result, y)),
                ..Trace::new("histogram")
            };
            ChartSpec {
                kind,
                x_column: None,
                y_columns: vec![name(y).to_string()],
                plot: Some(PlotDescription {
                    traces: vec![trace],
                    layout: Layout {
                        title: format!("Distribution of {}", name(y)),
                        xaxis: Axis::titled(name(y)),
                        yaxis: Axis::titled("count"),
                    },
                }),
                error: None,
            }
        }
        ChartKind::Box => {
            let Some(&y) = shape.numeric.first() else {
                return ChartSpec::unsuitable("a box plot needs a numeric column");
            };
            let x = shape.categorical.first().copied();
            let trace = Trace {
                x: x.map(|x| column(result, x)),
                y: Some(column(result, y)),
                ..Trace::new("box")
            };
            ChartSpec {
                kind,
                x_column: x.map(|x| name(x).to_string()),
                y_columns: vec![name(y).to_string()],
                plot: Some(PlotDescription {
                    traces: vec![trace],
                    layout: Layout {
                        title: format!("Box plot of {}", name(y)),
                        xaxis: x.and_then(|x| Axis::titled(name(x))),
                        yaxis: Axis::titled(name(y)),
                    },
                }),
                error: None,
            }
        }
        ChartKind::None => ChartSpec::none(),
    }
}

fn axes_spec(
    result: &ResultSet,
    kind: ChartKind,
    x: usize,
    ys: &[usize],
    traces: Vec<Trace>,
    title: String,
) -> ChartSpec {
    let name = |index: usize| result.columns()[index].name.clone();
    let y_columns: Vec<String> = ys.iter().map(|&y| name(y)).collect();
    let y_title = if y_columns.len() == 1 {
        y_columns[0].clone()
    } else {
        "value".to_string()
    };

    ChartSpec {
        kind,
        x_column: Some(name(x)),
        plot: Some(PlotDescription {
            traces,
            layout: Layout {
                title,
                xaxis: Axis::titled(&name(x)),
                yaxis: Axis::titled(&y_title),
            },
        }),
        y_columns,
        error: None,
    }
}

fn column(result: &ResultSet, index: usize) -> Vec<Value> {
    result.values(index).map(ScalarValue::to_json).collect()
}
