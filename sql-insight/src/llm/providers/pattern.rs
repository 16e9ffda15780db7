//! Deterministic question-to-SQL translation
//!
//! Matches table and column names from the snapshot against the words of the
//! question and assembles one of a few query shapes: ranking ("top 10
//! customers by revenue"), aggregation ("average revenue by region"), time
//! series ("monthly revenue") or a plain projection. Never names anything
//! outside the snapshot.

use async_trait::async_trait;
use tracing::debug;

use crate::connection::EngineKind;
use crate::llm::{LlmError, SqlGenerator};
use crate::schema::{ColumnInfo, SchemaSnapshot, TableSchema};

const RANK_DESCENDING: &[&str] = &["top", "first", "highest", "most", "largest", "best", "biggest"];
const RANK_ASCENDING: &[&str] = &["bottom", "lowest", "least", "smallest", "worst", "fewest"];
const GROUPING: &[&str] = &["by", "per", "each", "across"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Average,
    Sum,
    Count,
    Max,
    Min,
}

impl Aggregate {
    fn detect(words: &[String], question: &str) -> Option<Self> {
        let has = |candidates: &[&str]| words.iter().any(|word| candidates.contains(&word.as_str()));

        if has(&["average", "avg", "mean"]) {
            Some(Aggregate::Average)
        } else if has(&["total", "sum"]) {
            Some(Aggregate::Sum)
        } else if has(&["count"]) || question.contains("how many") || question.contains("number of") {
            Some(Aggregate::Count)
        } else if has(&["maximum", "max"]) {
            Some(Aggregate::Max)
        } else if has(&["minimum", "min"]) {
            Some(Aggregate::Min)
        } else {
            None
        }
    }

    fn function(&self) -> &'static str {
        match self {
            Aggregate::Average => "AVG",
            Aggregate::Sum => "SUM",
            Aggregate::Count => "COUNT",
            Aggregate::Max => "MAX",
            Aggregate::Min => "MIN",
        }
    }

    fn alias_prefix(&self) -> &'static str {
        match self {
            Aggregate::Average => "avg",
            Aggregate::Sum => "total",
            Aggregate::Count => "count",
            Aggregate::Max => "max",
            Aggregate::Min => "min",
        }
    }
}

/// Pattern-based SQL generator, the default backend
#[derive(Debug, Default, Clone)]
pub struct PatternSqlGenerator;

impl PatternSqlGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Translate a question into SQL over the snapshot
    pub fn translate(&self, question: &str, schema: &SchemaSnapshot) -> Result<String, LlmError> {
        let lowered = question.to_lowercase();
        let words = split_words(&lowered);

        let table = find_table(&words, &lowered, schema).ok_or_else(|| {
            LlmError::Ungrounded(format!(
                "no table in the schema matches the question '{}'",
                question
            ))
        })?;

        let query = Translation {
            engine: schema.engine,
            table,
            words: &words,
            question: &lowered,
        }
        .build()?;

        debug!(table = %table.name, sql = %query, "pattern translation");
        Ok(query)
    }
}

#[async_trait]
impl SqlGenerator for PatternSqlGenerator {
    async fn generate_sql(&self, question: &str, schema: &SchemaSnapshot) -> Result<String, LlmError> {
        self.translate(question, schema)
    }
}

struct Translation<'a> {
    engine: EngineKind,
    table: &'a TableSchema,
    words: &'a [String],
    question: &'a str,
}

impl Translation<'_> {
    fn build(&self) -> Result<String, LlmError> {
        let limit = self.limit();
        let grouping = self.grouping_column();
        let mentioned = self.mentioned_columns();

        if let Some(aggregate) = Aggregate::detect(self.words, self.question) {
            return self.aggregate(aggregate, grouping, &mentioned, limit);
        }

        if let Some(descending) = self.ranking_direction() {
            if let Some(measure) = grouping.filter(|column| is_measure(column)) {
                return Ok(self.ranking(measure, &mentioned, descending, limit));
            }
            if let Some(measure) = mentioned.iter().copied().find(|column| is_measure(column)) {
                return Ok(self.ranking(measure, &mentioned, descending, limit));
            }
        }

        if let Some(group) = grouping.filter(|column| !is_measure(column)) {
            let measures: Vec<&ColumnInfo> = mentioned
                .iter()
                .copied()
                .filter(|column| is_measure(column) && column.name != group.name)
                .collect();
            if !measures.is_empty() {
                return Ok(self.grouped(Aggregate::Sum, group, &measures, limit));
            }
        }

        Ok(self.projection(&mentioned, limit))
    }

    fn aggregate(
        &self,
        aggregate: Aggregate,
        grouping: Option<&ColumnInfo>,
        mentioned: &[&ColumnInfo],
        limit: Option<u64>,
    ) -> Result<String, LlmError> {
        let group = grouping.filter(|column| !is_measure(column));
        let measures: Vec<&ColumnInfo> = mentioned
            .iter()
            .copied()
            .filter(|column| is_measure(column) && group.map_or(true, |group| group.name != column.name))
            .collect();

        if aggregate != Aggregate::Count && measures.is_empty() {
            return Err(LlmError::Ungrounded(format!(
                "the question asks for {} but names no numeric column of '{}'",
                aggregate.function(),
                self.table.name
            )));
        }

        match group {
            Some(group) => Ok(self.grouped(aggregate, group, &measures, limit)),
            None => {
                let select = self.aggregate_items(aggregate, &measures).join(", ");
                Ok(format!("SELECT {} FROM {}", select, self.quote(&self.table.name)))
            }
        }
    }

    fn grouped(&self, aggregate: Aggregate, group: &ColumnInfo, measures: &[&ColumnInfo], limit: Option<u64>) -> String {
        let group_name = self.quote(&group.name);
        let mut items = vec![group_name.clone()];
        let aggregates = self.aggregate_items(aggregate, measures);
        items.extend(aggregates);

        // Time buckets read chronologically, categories by their first measure
        let order = if group.is_temporal() {
            group_name.clone()
        } else {
            format!("{} DESC", self.aggregate_alias(aggregate, measures.first().copied()))
        };

        let group_by = format!("GROUP BY {}", group_name);
        self.finish(&items, Some(group_by.as_str()), Some(order.as_str()), limit)
    }

    fn ranking(&self, measure: &ColumnInfo, mentioned: &[&ColumnInfo], descending: bool, limit: Option<u64>) -> String {
        let mut columns: Vec<&ColumnInfo> = Vec::new();
        if let Some(label) = self.label_column(measure) {
            columns.push(label);
        }
        for column in mentioned {
            if !columns.iter().any(|existing| existing.name == column.name) && column.name != measure.name {
                columns.push(*column);
            }
        }
        columns.push(measure);

        let items: Vec<String> = columns.iter().map(|column| self.quote(&column.name)).collect();
        let order = format!(
            "{} {}",
            self.quote(&measure.name),
            if descending { "DESC" } else { "ASC" }
        );
        self.finish(&items, None, Some(order.as_str()), Some(limit.unwrap_or(10)))
    }

    fn projection(&self, mentioned: &[&ColumnInfo], limit: Option<u64>) -> String {
        let temporal = self.table.columns.iter().find(|column| column.is_temporal());

        let mut columns: Vec<&ColumnInfo> = if mentioned.is_empty() {
            self.table.columns.iter().collect()
        } else {
            mentioned.to_vec()
        };

        // A measure asked for on a table with a time axis reads as a series
        let series_axis = temporal.filter(|_| columns.iter().any(|column| is_measure(column)));
        if let Some(axis) = series_axis {
            if !columns.iter().any(|column| column.name == axis.name) {
                columns.insert(0, axis);
            }
        }

        let items: Vec<String> = columns.iter().map(|column| self.quote(&column.name)).collect();
        let order = series_axis.map(|axis| self.quote(&axis.name));
        self.finish(&items, None, order.as_deref(), limit)
    }

    fn finish(&self, items: &[String], group_by: Option<&str>, order_by: Option<&str>, limit: Option<u64>) -> String {
        let mut sql = String::from("SELECT ");
        if let (Some(limit), true) = (limit, self.engine.uses_top_clause()) {
            sql.push_str(&format!("TOP {} ", limit));
        }
        sql.push_str(&items.join(", "));
        sql.push_str(" FROM ");
        sql.push_str(&self.quote(&self.table.name));
        if let Some(group_by) = group_by {
            sql.push(' ');
            sql.push_str(group_by);
        }
        if let Some(order_by) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order_by);
        }
        if let (Some(limit), false) = (limit, self.engine.uses_top_clause()) {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        sql
    }

    fn aggregate_items(&self, aggregate: Aggregate, measures: &[&ColumnInfo]) -> Vec<String> {
        if aggregate == Aggregate::Count || measures.is_empty() {
            return vec![format!("COUNT(*) AS {}", self.aggregate_alias(Aggregate::Count, None))];
        }
        measures
            .iter()
            .map(|measure| {
                format!(
                    "{}({}) AS {}",
                    aggregate.function(),
                    self.quote(&measure.name),
                    self.aggregate_alias(aggregate, Some(measure))
                )
            })
            .collect()
    }

    fn aggregate_alias(&self, aggregate: Aggregate, measure: Option<&ColumnInfo>) -> String {
        match (aggregate, measure) {
            (Aggregate::Count, _) | (_, None) => self.quote("count"),
            (aggregate, Some(measure)) => {
                self.quote(&format!("{}_{}", aggregate.alias_prefix(), measure.name))
            }
        }
    }

    fn quote(&self, identifier: &str) -> String {
        self.engine.quote_identifier(identifier)
    }

    /// Columns of the table the question names, in question order
    fn mentioned_columns(&self) -> Vec<&ColumnInfo> {
        let mut found: Vec<(usize, &ColumnInfo)> = self
            .table
            .columns
            .iter()
            .filter_map(|column| mention_position(self.words, self.question, &column.name).map(|position| (position, column)))
            .collect();
        found.sort_by_key(|(position, _)| *position);
        found.into_iter().map(|(_, column)| column).collect()
    }

    /// The column named right after "by", "per", "each" or "across"
    fn grouping_column(&self) -> Option<&ColumnInfo> {
        let keyword = self
            .words
            .iter()
            .position(|word| GROUPING.contains(&word.as_str()))?;
        let tail = &self.words[keyword + 1..];

        tail.iter().find_map(|word| {
            self.table.columns.iter().find(|column| names_match(word, &column.name))
        })
        .or_else(|| {
            // "revenue by month" on a table whose time column is named differently
            let wants_time = tail.iter().any(|word| {
                ["day", "week", "month", "quarter", "year", "date", "time"].contains(&word.as_str())
            });
            wants_time
                .then(|| self.table.columns.iter().find(|column| column.is_temporal()))
                .flatten()
        })
    }

    fn ranking_direction(&self) -> Option<bool> {
        for word in self.words {
            if RANK_DESCENDING.contains(&word.as_str()) {
                return Some(true);
            }
            if RANK_ASCENDING.contains(&word.as_str()) {
                return Some(false);
            }
        }
        None
    }

    /// Number following a ranking or limiting word ("top 10", "first 5", "limit 20")
    fn limit(&self) -> Option<u64> {
        self.words.windows(2).find_map(|pair| {
            let is_keyword = RANK_DESCENDING.contains(&pair[0].as_str())
                || RANK_ASCENDING.contains(&pair[0].as_str())
                || ["limit", "last"].contains(&pair[0].as_str());
            if is_keyword {
                pair[1].parse::<u64>().ok().filter(|value| *value > 0)
            } else {
                None
            }
        })
    }

    /// First text column that is not an identifier, used to label ranked rows
    fn label_column(&self, measure: &ColumnInfo) -> Option<&ColumnInfo> {
        self.table
            .columns
            .iter()
            .find(|column| column.is_textual() && !column.is_identifier() && column.name != measure.name)
    }
}

fn is_measure(column: &ColumnInfo) -> bool {
    column.is_numeric() && !column.is_identifier()
}

fn split_words(question: &str) -> Vec<String> {
    question
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

fn singular(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        format!("{}y", stem)
    } else if word.ends_with("sses") || word.ends_with("xes") || word.ends_with("ches") || word.ends_with("shes") {
        word[..word.len() - 2].to_string()
    } else if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

fn names_match(word: &str, name: &str) -> bool {
    let name = name.to_lowercase();
    word == name || singular(word) == singular(&name)
}

/// Word index where the question mentions `name`, as a word or as a spaced phrase
fn mention_position(words: &[String], question: &str, name: &str) -> Option<usize> {
    if let Some(position) = words.iter().position(|word| names_match(word, name)) {
        return Some(position);
    }

    let lowered = name.to_lowercase();
    if !lowered.contains('_') {
        return None;
    }
    let phrase = lowered.replace('_', " ");
    let singular_phrase = singular(&phrase);
    let offset = question.find(&phrase).or_else(|| question.find(&singular_phrase))?;
    Some(question[..offset].split_whitespace().count())
}

/// Table the question is about: the earliest mentioned, longest name on ties
fn find_table<'a>(words: &[String], question: &str, schema: &'a SchemaSnapshot) -> Option<&'a TableSchema> {
    schema
        .tables
        .values()
        .filter_map(|table| mention_position(words, question, &table.name).map(|position| (position, table)))
        .min_by(|(left_position, left), (right_position, right)| {
            left_position
                .cmp(right_position)
                .then_with(|| right.name.len().cmp(&left.name.len()))
        })
        .map(|(_, table)| table)
}
