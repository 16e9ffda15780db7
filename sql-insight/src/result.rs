//! Typed query results
//!
//! A [`ResultSet`] holds rows positionally and serializes them as a list of
//! `{column: value}` records. Each column carries the semantic type inferred
//! from its declared type, its name and the values it actually holds.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::ser::{SerializeMap, SerializeSeq, SerializeStruct};
use serde::{Serialize, Serializer};
use std::collections::HashSet;

use crate::schema::{is_identifier_name, is_numeric_type, is_temporal_type};

/// One typed cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Temporal(NaiveDateTime),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Integer(value) => Some(*value as f64),
            ScalarValue::Float(value) if value.is_finite() => Some(*value),
            _ => None,
        }
    }

    /// Temporal cells, and text cells that parse as a date or timestamp
    pub fn as_temporal(&self) -> Option<NaiveDateTime> {
        match self {
            ScalarValue::Temporal(value) => Some(*value),
            ScalarValue::Text(text) => parse_temporal(text),
            _ => None,
        }
    }

    /// Value rendered for narratives and grouping keys
    pub fn display(&self) -> String {
        match self {
            ScalarValue::Null => "NULL".to_string(),
            ScalarValue::Boolean(value) => value.to_string(),
            ScalarValue::Integer(value) => value.to_string(),
            ScalarValue::Float(value) => value.to_string(),
            ScalarValue::Text(value) => value.clone(),
            ScalarValue::Temporal(value) => {
                if value.time() == chrono::NaiveTime::MIN {
                    value.date().to_string()
                } else {
                    value.to_string()
                }
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Placeholder for a binary cell of `length` bytes
    pub(crate) fn binary(length: usize) -> Self {
        ScalarValue::Text(format!("[BLOB: {} bytes]", length))
    }

    /// Rough in-memory footprint used to enforce result size limits
    pub(crate) fn estimated_bytes(&self) -> usize {
        match self {
            ScalarValue::Null | ScalarValue::Boolean(_) => 1,
            ScalarValue::Integer(_) | ScalarValue::Float(_) | ScalarValue::Temporal(_) => 8,
            ScalarValue::Text(text) => text.len(),
        }
    }
}

/// Parse the textual date/time formats engines commonly hand back
pub fn parse_temporal(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.len() < 7 || !text.as_bytes()[0].is_ascii_digit() {
        return None;
    }
    if let Ok(value) = DateTime::parse_from_rfc3339(text) {
        return Some(value.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(value) = NaiveDateTime::parse_from_str(text, format) {
            return Some(value);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    // Month buckets such as "2024-03"
    if text.len() == 7 {
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{}-01", text), "%Y-%m-%d") {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// What a column means for charting and analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SemanticType {
    Categorical,
    Numeric,
    Temporal,
    Identifier,
}

/// Column metadata of a result set
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultColumn {
    pub name: String,

    /// Type name reported by the engine, if any
    pub data_type: Option<String>,

    pub semantic_type: SemanticType,
}

/// Rows returned by one executed query
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    columns: Vec<ResultColumn>,
    rows: Vec<Vec<ScalarValue>>,
}

impl ResultSet {
    /// Build a result set, inferring each column's semantic type
    ///
    /// Rows shorter than the column list are padded with nulls.
    pub fn new(columns: Vec<(String, Option<String>)>, mut rows: Vec<Vec<ScalarValue>>) -> Self {
        for row in &mut rows {
            row.resize(columns.len(), ScalarValue::Null);
        }

        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(index, (name, data_type))| {
                let semantic_type = infer_semantic_type(
                    &name,
                    data_type.as_deref(),
                    rows.iter().map(|row| &row[index]),
                );
                ResultColumn {
                    name,
                    data_type,
                    semantic_type,
                }
            })
            .collect();

        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.name.clone()).collect()
    }

    pub fn rows(&self) -> &[Vec<ScalarValue>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    /// Indices of the columns with the given semantic type, in column order
    pub fn columns_of(&self, semantic_type: SemanticType) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, column)| column.semantic_type == semantic_type)
            .map(|(index, _)| index)
            .collect()
    }

    /// Cells of one column, in row order
    pub fn values(&self, index: usize) -> impl Iterator<Item = &ScalarValue> + '_ {
        self.rows.iter().map(move |row| &row[index])
    }

    /// Non-null numeric cells of one column, in row order
    pub fn numeric_values(&self, index: usize) -> Vec<f64> {
        self.values(index).filter_map(ScalarValue::as_f64).collect()
    }

    /// Number of distinct non-null values in one column
    pub fn distinct_count(&self, index: usize) -> usize {
        self.values(index)
            .filter(|value| !value.is_null())
            .map(ScalarValue::display)
            .collect::<HashSet<_>>()
            .len()
    }
}

impl Serialize for ResultSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ResultSet", 2)?;
        state.serialize_field("columns", &self.columns)?;
        state.serialize_field("rows", &Records(self))?;
        state.end()
    }
}

struct Records<'a>(&'a ResultSet);

impl Serialize for Records<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut sequence = serializer.serialize_seq(Some(self.0.rows.len()))?;
        for row in &self.0.rows {
            sequence.serialize_element(&Record {
                columns: &self.0.columns,
                row,
            })?;
        }
        sequence.end()
    }
}

struct Record<'a> {
    columns: &'a [ResultColumn],
    row: &'a [ScalarValue],
}

impl Serialize for Record<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, value) in self.columns.iter().zip(self.row) {
            map.serialize_entry(&column.name, value)?;
        }
        map.end()
    }
}

/// Infer a semantic type from the column name, declared type and values
///
/// Identifier columns are named `id` or `*_id` and hold integers or text.
/// Numeric columns hold only integers/floats. Temporal columns hold only
/// temporal values or text that parses as a date. Everything else is
/// categorical. Columns with no non-null values fall back on the declared type.
pub fn infer_semantic_type<'a>(
    name: &str,
    declared_type: Option<&str>,
    values: impl Iterator<Item = &'a ScalarValue>,
) -> SemanticType {
    let mut seen = 0usize;
    let mut numeric = 0usize;
    let mut floats = 0usize;
    let mut temporal = 0usize;
    let mut integer_or_text = 0usize;

    for value in values.filter(|value| !value.is_null()) {
        seen += 1;
        match value {
            ScalarValue::Integer(_) => {
                numeric += 1;
                integer_or_text += 1;
            }
            ScalarValue::Float(_) => {
                numeric += 1;
                floats += 1;
            }
            ScalarValue::Temporal(_) => temporal += 1,
            ScalarValue::Text(text) => {
                integer_or_text += 1;
                if parse_temporal(text).is_some() {
                    temporal += 1;
                }
            }
            ScalarValue::Boolean(_) | ScalarValue::Null => {}
        }
    }

    if seen == 0 {
        return match declared_type {
            _ if is_identifier_name(name) => SemanticType::Identifier,
            Some(declared) if is_numeric_type(declared) => SemanticType::Numeric,
            Some(declared) if is_temporal_type(declared) => SemanticType::Temporal,
            _ => SemanticType::Categorical,
        };
    }

    if is_identifier_name(name) && integer_or_text == seen && floats == 0 {
        SemanticType::Identifier
    } else if numeric == seen {
        SemanticType::Numeric
    } else if temporal == seen {
        SemanticType::Temporal
    } else {
        SemanticType::Categorical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(value: &str) -> ScalarValue {
        ScalarValue::Text(value.to_string())
    }

    fn sample() -> ResultSet {
        ResultSet::new(
            vec![
                ("customer_id".to_string(), Some("INTEGER".to_string())),
                ("name".to_string(), Some("TEXT".to_string())),
                ("revenue".to_string(), Some("REAL".to_string())),
                ("signed_up".to_string(), Some("TEXT".to_string())),
            ],
            vec![
                vec![ScalarValue::Integer(1), text("Acme"), ScalarValue::Float(120.5), text("2024-01-03")],
                vec![ScalarValue::Integer(2), text("Globex"), ScalarValue::Integer(80), text("2024-02-11")],
                vec![ScalarValue::Integer(3), text("Acme"), ScalarValue::Null, text("2024-03-09")],
            ],
        )
    }

    #[test]
    fn test_semantic_inference() {
        let result = sample();
        let kinds: Vec<SemanticType> = result.columns().iter().map(|c| c.semantic_type).collect();
        assert_eq!(
            kinds,
            vec![
                SemanticType::Identifier,
                SemanticType::Categorical,
                SemanticType::Numeric,
                SemanticType::Temporal
            ]
        );
    }

    #[test]
    fn test_inference_falls_back_on_declared_type_for_empty_columns() {
        let result = ResultSet::new(
            vec![
                ("total".to_string(), Some("NUMERIC".to_string())),
                ("day".to_string(), Some("DATE".to_string())),
                ("label".to_string(), None),
            ],
            Vec::new(),
        );
        assert_eq!(result.columns()[0].semantic_type, SemanticType::Numeric);
        assert_eq!(result.columns()[1].semantic_type, SemanticType::Temporal);
        assert_eq!(result.columns()[2].semantic_type, SemanticType::Categorical);
    }

    #[test]
    fn test_numeric_values_and_distinct_count() {
        let result = sample();
        assert_eq!(result.numeric_values(2), vec![120.5, 80.0]);
        assert_eq!(result.distinct_count(1), 2);
        assert_eq!(result.columns_of(SemanticType::Numeric), vec![2]);
    }

    #[test]
    fn test_parse_temporal_formats() {
        assert!(parse_temporal("2024-03-01").is_some());
        assert!(parse_temporal("2024-03").is_some());
        assert!(parse_temporal("2024-03-01 10:15:00").is_some());
        assert!(parse_temporal("2024-03-01T10:15:00Z").is_some());
        assert!(parse_temporal("Acme").is_none());
        assert!(parse_temporal("12345").is_none());
    }

    #[test]
    fn test_serializes_rows_as_records() {
        let result = ResultSet::new(
            vec![("name".to_string(), None), ("revenue".to_string(), None)],
            vec![vec![text("Acme"), ScalarValue::Integer(10)]],
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["rows"][0]["name"], "Acme");
        assert_eq!(json["rows"][0]["revenue"], 10);
        assert_eq!(json["columns"][1]["semanticType"], "numeric");
    }

    #[test]
    fn test_short_rows_are_padded() {
        let result = ResultSet::new(
            vec![("a".to_string(), None), ("b".to_string(), None)],
            vec![vec![ScalarValue::Integer(1)]],
        );
        assert!(result.rows()[0][1].is_null());
    }
}
