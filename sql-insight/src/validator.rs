//! Query validation and sanitization
//!
//! [`validate`] is a pure function over a candidate query and a schema
//! snapshot. It parses the candidate with the target engine's dialect and
//! applies the safety rules in a fixed order, stopping at the first failure:
//!
//! 1. exactly one statement
//! 2. the statement is a read-only query
//! 3. every table and column it names exists in the snapshot
//! 4. only known built-in functions, and no table functions
//! 5. a row bound no larger than the request's limit
//!
//! The SQL handed to the executor is re-rendered from the checked syntax tree,
//! with the row bound in place.

use serde::Serialize;
use sqlparser::ast::{
    Expr, Query, SelectItem, SetExpr, Statement, TableAlias, TableFactor, Top, TopQuantity, Value, Visit, Visitor,
};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use tracing::debug;

use crate::connection::EngineKind;
use crate::schema::{SchemaSnapshot, TableSchema};
use crate::synthesizer::CandidateQuery;
use crate::Error;

/// Safety rule a candidate query violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsafeRule {
    MultipleStatements,
    NotReadOnly,
    UnknownTable,
    UnknownColumn,
    ForbiddenConstruct,
    Malformed,
    Unbounded,
}

impl UnsafeRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnsafeRule::MultipleStatements => "multiple_statements",
            UnsafeRule::NotReadOnly => "not_read_only",
            UnsafeRule::UnknownTable => "unknown_table",
            UnsafeRule::UnknownColumn => "unknown_column",
            UnsafeRule::ForbiddenConstruct => "forbidden_construct",
            UnsafeRule::Malformed => "malformed",
            UnsafeRule::Unbounded => "unbounded",
        }
    }
}

impl fmt::Display for UnsafeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of statement that pass validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StatementKind {
    Select,
}

/// A candidate that passed every rule, ready to execute
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    pub candidate: CandidateQuery,

    /// SQL to execute, with the row bound applied
    pub sql: String,

    pub statement_kind: StatementKind,

    /// Snapshot table names the query reads, sorted
    pub referenced_tables: Vec<String>,

    /// Maximum number of rows the query can return
    pub row_bound: u64,
}

/// Built-in functions a query may call
///
/// Anything else is rejected, including user-defined functions and the
/// file, OS, sleep and remote-server built-ins. The read-only session the
/// executor opens stays in place underneath this check.
const ALLOWED_FUNCTIONS: &[&str] = &[
    // Aggregates
    "count", "sum", "avg", "min", "max", "stddev", "stddev_pop", "stddev_samp", "variance", "var_pop",
    "var_samp", "string_agg", "group_concat", "array_agg", "bool_and", "bool_or", "every",
    "percentile_cont", "percentile_disc", "mode", "total",
    // Window functions
    "row_number", "rank", "dense_rank", "percent_rank", "cume_dist", "ntile", "lag", "lead", "first_value",
    "last_value", "nth_value",
    // Numeric
    "abs", "round", "ceil", "ceiling", "floor", "trunc", "truncate", "sign", "sqrt", "power", "pow", "exp",
    "ln", "log", "log10", "log2", "mod", "greatest", "least", "random", "div",
    // Conditional
    "coalesce", "nullif", "ifnull", "iif", "if",
    // Text
    "lower", "upper", "length", "char_length", "character_length", "octet_length", "concat", "concat_ws",
    "substr", "substring", "replace", "trim", "ltrim", "rtrim", "btrim", "lpad", "rpad", "left", "right",
    "reverse", "repeat", "strpos", "instr", "locate", "split_part", "initcap", "format", "printf", "hex",
    "typeof",
    // Date and time
    "now", "current_date", "current_time", "current_timestamp", "localtime", "localtimestamp", "date",
    "time", "datetime", "julianday", "strftime", "unixepoch", "date_trunc", "date_part", "age", "to_char",
    "to_date", "to_timestamp", "to_number", "make_date", "date_format", "str_to_date", "year", "month",
    "day", "dayofweek", "dayofmonth", "dayofyear", "week", "weekofyear", "quarter", "hour", "minute",
    "second", "datediff", "date_add", "date_sub", "timestampdiff", "last_day", "from_unixtime",
    "unix_timestamp",
    // JSON
    "json_extract", "json_array_length", "jsonb_array_length",
];

/// Validate a candidate query against the snapshot and bound it to `row_limit` rows
pub fn validate(candidate: &CandidateQuery, snapshot: &SchemaSnapshot, row_limit: u64) -> Result<ValidatedQuery, Error> {
    let engine = snapshot.engine;
    let dialect = engine.dialect();

    // Rule 1: statement count, decided on tokens so unparseable tails still count
    let tokens = Tokenizer::new(dialect.as_ref(), &candidate.sql)
        .tokenize()
        .map_err(|error| Error::unsafe_query(UnsafeRule::Malformed, error.to_string()))?;
    let segments = count_statements(&tokens);
    if segments > 1 {
        return Err(Error::unsafe_query(
            UnsafeRule::MultipleStatements,
            format!("{} statements found, only one is allowed", segments),
        ));
    }

    let mut statements = Parser::parse_sql(dialect.as_ref(), &candidate.sql)
        .map_err(|error| Error::unsafe_query(UnsafeRule::Malformed, error.to_string()))?;
    let mut statement = match statements.len() {
        1 => statements.remove(0),
        0 => return Err(Error::unsafe_query(UnsafeRule::Malformed, "no statement found")),
        count => {
            return Err(Error::unsafe_query(
                UnsafeRule::MultipleStatements,
                format!("{} statements found, only one is allowed", count),
            ))
        }
    };

    // Rule 2: read-only statement kind
    let Statement::Query(_) = &statement else {
        return Err(Error::unsafe_query(
            UnsafeRule::NotReadOnly,
            format!("{} statements are not allowed, only SELECT", statement_keyword(&statement)),
        ));
    };

    let mut references = References::default();
    let _ = statement.visit(&mut references);

    if let Some(detail) = &references.write {
        return Err(Error::unsafe_query(UnsafeRule::NotReadOnly, detail.clone()));
    }

    // Rule 3: grounding in the snapshot
    let scope = references.resolve(snapshot)?;
    references.check_columns(&scope)?;

    // Rule 4: forbidden constructs
    if let Some(name) = references.table_functions.first() {
        return Err(Error::unsafe_query(
            UnsafeRule::ForbiddenConstruct,
            format!("table function '{}' is not allowed", name),
        ));
    }
    if let Some(name) = references
        .functions
        .iter()
        .find(|name| !ALLOWED_FUNCTIONS.contains(&name.as_str()))
    {
        let detail = if name.contains('.') {
            format!("schema-qualified function '{}' is not allowed", name)
        } else {
            format!("function '{}' is not allowed", name)
        };
        return Err(Error::unsafe_query(UnsafeRule::ForbiddenConstruct, detail));
    }

    // Rule 5: row bound
    let Statement::Query(query) = &mut statement else {
        return Err(Error::unsafe_query(UnsafeRule::NotReadOnly, "statement is not a query"));
    };
    let row_bound = apply_row_bound(query, engine, row_limit)?;

    let sql = statement.to_string();
    debug!(%sql, row_bound, "query validated");

    Ok(ValidatedQuery {
        candidate: candidate.clone(),
        sql,
        statement_kind: StatementKind::Select,
        referenced_tables: scope.referenced_tables(),
        row_bound,
    })
}

/// Detail of the first unknown table or column a parseable query names
///
/// Returns `None` when the query is grounded or does not parse; parse
/// failures are left to [`validate`].
pub(crate) fn grounding_violation(sql: &str, snapshot: &SchemaSnapshot) -> Option<String> {
    let dialect = snapshot.engine.dialect();
    let statements = Parser::parse_sql(dialect.as_ref(), sql).ok()?;

    for statement in &statements {
        let mut references = References::default();
        let _ = statement.visit(&mut references);
        let outcome = references
            .resolve(snapshot)
            .and_then(|scope| references.check_columns(&scope));
        if let Err(Error::UnsafeQuery { detail, .. }) = outcome {
            return Some(detail);
        }
    }
    None
}

/// Number of non-empty statements separated by `;`
pub(crate) fn count_statements(tokens: &[Token]) -> usize {
    let mut count = 0;
    let mut current_has_content = false;

    for token in tokens {
        match token {
            Token::SemiColon => {
                if current_has_content {
                    count += 1;
                }
                current_has_content = false;
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => current_has_content = true,
        }
    }

    if current_has_content {
        count += 1;
    }
    count
}

fn statement_keyword(statement: &Statement) -> String {
    statement
        .to_string()
        .split_whitespace()
        .next()
        .unwrap_or("unknown")
        .to_ascii_uppercase()
}

/// Tighten or inject the row bound of the outermost query
fn apply_row_bound(query: &mut Query, engine: EngineKind, row_limit: u64) -> Result<u64, Error> {
    if let Some(fetch) = query.fetch.as_mut() {
        let current = fetch.quantity.as_ref().and_then(literal_u64);
        let bound = match current {
            Some(value) if !fetch.percent => value.min(row_limit),
            _ => row_limit,
        };
        fetch.quantity = Some(number(bound));
        fetch.percent = false;
        fetch.with_ties = false;
        return Ok(bound);
    }

    if engine.uses_top_clause() {
        let SetExpr::Select(select) = query.body.as_mut() else {
            return Err(Error::unsafe_query(
                UnsafeRule::Unbounded,
                "compound queries cannot be bounded with TOP, wrap them in a subquery",
            ));
        };
        let current = select.top.as_ref().and_then(|top| match (&top.quantity, top.percent) {
            (Some(TopQuantity::Constant(value)), false) => Some(*value),
            (Some(TopQuantity::Expr(expr)), false) => literal_u64(expr),
            _ => None,
        });
        let bound = current.map_or(row_limit, |value| value.min(row_limit));
        select.top = Some(Top {
            with_ties: false,
            percent: false,
            quantity: Some(TopQuantity::Constant(bound)),
        });
        return Ok(bound);
    }

    let current = query.limit.as_ref().and_then(literal_u64);
    let bound = current.map_or(row_limit, |value| value.min(row_limit));
    query.limit = Some(number(bound));
    Ok(bound)
}

fn literal_u64(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(Value::Number(text, _)) => text.parse().ok(),
        Expr::Nested(inner) => literal_u64(inner),
        _ => None,
    }
}

fn number(value: u64) -> Expr {
    Expr::Value(Value::Number(value.to_string(), false))
}

/// A table named in a FROM clause
#[derive(Debug)]
struct TableReference {
    parts: Vec<String>,
    alias: Option<String>,
}

impl TableReference {
    fn name(&self) -> String {
        self.parts.join(".")
    }

    fn unqualified(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or("")
    }
}

/// Everything the grounding and safety rules need, collected in one walk
#[derive(Debug, Default)]
struct References {
    tables: Vec<TableReference>,

    /// Names introduced by WITH clauses, lowercase
    cte_names: HashSet<String>,

    /// Columns exposed by CTEs and aliased derived tables, keyed by lowercase name
    derived: HashMap<String, DerivedColumns>,

    /// Projection aliases and CTE column aliases, lowercase
    output_names: HashSet<String>,

    /// Column references, split into their dotted parts
    columns: Vec<Vec<String>>,

    /// Scalar function names, lowercase, with schema qualifiers joined by dots
    functions: Vec<String>,

    table_functions: Vec<String>,

    /// First write or locking construct found
    write: Option<String>,
}

/// Real tables in scope, keyed by every name the query can use for them
struct Scope<'a> {
    by_name: HashMap<String, &'a TableSchema>,
    tables: Vec<&'a TableSchema>,
}

impl Scope<'_> {
    fn has_column(&self, column: &str) -> bool {
        self.tables.iter().any(|table| table.column(column).is_some())
    }

    fn referenced_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .map(|table| table.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl References {
    fn resolve<'a>(&self, snapshot: &'a SchemaSnapshot) -> Result<Scope<'a>, Error> {
        let mut scope = Scope {
            by_name: HashMap::new(),
            tables: Vec::new(),
        };

        for reference in &self.tables {
            if reference.parts.len() == 1 && self.cte_names.contains(&reference.unqualified().to_lowercase()) {
                continue;
            }

            let table = snapshot.table(&reference.name()).ok_or_else(|| {
                Error::unsafe_query(
                    UnsafeRule::UnknownTable,
                    format!("table '{}' does not exist", reference.name()),
                )
            })?;

            scope.by_name.insert(reference.unqualified().to_lowercase(), table);
            if let Some(alias) = &reference.alias {
                scope.by_name.insert(alias.to_lowercase(), table);
            }
            scope.tables.push(table);
        }

        Ok(scope)
    }

    fn check_columns(&self, scope: &Scope<'_>) -> Result<(), Error> {
        for parts in &self.columns {
            let Some((column, qualifiers)) = parts.split_last() else {
                continue;
            };
            let lower = column.to_lowercase();

            match qualifiers.last() {
                None => {
                    let known = self.output_names.contains(&lower)
                        || scope.has_column(column)
                        || self.derived.values().any(|derived| derived.names.contains(&lower));
                    if !known {
                        return Err(unknown_column(column));
                    }
                }
                Some(qualifier) => {
                    let qualifier = qualifier.to_lowercase();
                    if let Some(table) = scope.by_name.get(&qualifier) {
                        if table.column(column).is_none() {
                            return Err(unknown_column(&parts.join(".")));
                        }
                    } else if let Some(derived) = self.derived_relation(&qualifier) {
                        // A wildcard re-exposes columns of the tables it reads from
                        let known = derived.names.contains(&lower) || (derived.wildcard && scope.has_column(column));
                        if !known {
                            return Err(unknown_column(&parts.join(".")));
                        }
                    } else {
                        return Err(Error::unsafe_query(
                            UnsafeRule::UnknownTable,
                            format!("'{}' does not name a table in the query", qualifier),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Derived relation a qualifier names, directly or through an alias of a CTE
    fn derived_relation(&self, qualifier: &str) -> Option<&DerivedColumns> {
        if let Some(derived) = self.derived.get(qualifier) {
            return Some(derived);
        }
        self.tables
            .iter()
            .filter(|reference| reference.parts.len() == 1)
            .find(|reference| {
                reference
                    .alias
                    .as_ref()
                    .is_some_and(|alias| alias.to_lowercase() == qualifier)
            })
            .and_then(|reference| self.derived.get(&reference.unqualified().to_lowercase()))
    }

    fn collect_output_names(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.output_names.insert(alias.value.to_lowercase());
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_output_names(left);
                self.collect_output_names(right);
            }
            _ => {}
        }
    }

    fn check_read_only(&mut self, body: &SetExpr) {
        if self.write.is_some() {
            return;
        }
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    self.write = Some("SELECT ... INTO writes a table".to_string());
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.check_read_only(left);
                self.check_read_only(right);
            }
            SetExpr::Query(_) | SetExpr::Values(_) | SetExpr::Table(_) => {}
            other => {
                self.write = Some(format!("data-modifying statement inside a query: {}", other));
            }
        }
    }
}

/// Output columns of a CTE or derived table
#[derive(Debug, Default)]
struct DerivedColumns {
    /// Lowercase names a projection item or the alias column list gives
    names: HashSet<String>,

    /// The projection selects `*` or a shape whose names are not known here
    wildcard: bool,
}

impl DerivedColumns {
    fn of(alias: &TableAlias, query: &Query) -> Self {
        if !alias.columns.is_empty() {
            return Self {
                names: alias
                    .columns
                    .iter()
                    .map(|column| column.name.value.to_lowercase())
                    .collect(),
                wildcard: false,
            };
        }
        let mut columns = Self::default();
        columns.collect(&query.body);
        columns
    }

    fn collect(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for item in &select.projection {
                    match item {
                        SelectItem::ExprWithAlias { alias, .. } => {
                            self.names.insert(alias.value.to_lowercase());
                        }
                        SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                            self.names.insert(ident.value.to_lowercase());
                        }
                        SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents)) => {
                            if let Some(ident) = idents.last() {
                                self.names.insert(ident.value.to_lowercase());
                            }
                        }
                        SelectItem::UnnamedExpr(_) => {}
                        SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => self.wildcard = true,
                    }
                }
            }
            // Compound queries take their column names from the first branch
            SetExpr::SetOperation { left, .. } => self.collect(left),
            SetExpr::Query(query) => self.collect(&query.body),
            _ => self.wildcard = true,
        }
    }
}

fn unknown_column(name: &str) -> Error {
    Error::unsafe_query(
        UnsafeRule::UnknownColumn,
        format!("column '{}' does not exist in the referenced tables", name),
    )
}

impl Visitor for References {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = cte.alias.name.value.to_lowercase();
                self.cte_names.insert(name.clone());
                self.derived.insert(name, DerivedColumns::of(&cte.alias, &cte.query));
                self.collect_output_names(&cte.query.body);
            }
        }

        if !query.locks.is_empty() && self.write.is_none() {
            self.write = Some("locking clauses are not allowed".to_string());
        }

        self.check_read_only(&query.body);
        self.collect_output_names(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table { name, alias, args, .. } => {
                let parts: Vec<String> = name.0.iter().map(|ident| ident.value.clone()).collect();
                if args.is_some() {
                    self.table_functions.push(parts.join("."));
                } else {
                    self.tables.push(TableReference {
                        parts,
                        alias: alias.as_ref().map(|alias| alias.name.value.clone()),
                    });
                }
            }
            TableFactor::Derived { alias, subquery, .. } => {
                if let Some(alias) = alias {
                    self.derived
                        .insert(alias.name.value.to_lowercase(), DerivedColumns::of(alias, subquery));
                }
            }
            TableFactor::TableFunction { expr, .. } => {
                self.table_functions.push(expr.to_string());
            }
            TableFactor::Function { name, .. } => {
                self.table_functions.push(name.to_string());
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push(vec![ident.value.clone()]),
            Expr::CompoundIdentifier(idents) => {
                self.columns
                    .push(idents.iter().map(|ident| ident.value.clone()).collect());
            }
            Expr::Function(function) => {
                let parts: Vec<String> = function.name.0.iter().map(|ident| ident.value.to_lowercase()).collect();
                self.functions.push(parts.join("."));
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnInfo, KeyRole};
    use crate::synthesizer::Provenance;

    fn snapshot(engine: EngineKind) -> SchemaSnapshot {
        SchemaSnapshot::new(
            engine,
            vec![
                TableSchema::new(
                    "customers",
                    vec![
                        ColumnInfo::new("id", "INTEGER", false, KeyRole::Primary),
                        ColumnInfo::new("name", "TEXT", false, KeyRole::None),
                        ColumnInfo::new("revenue", "REAL", true, KeyRole::None),
                    ],
                ),
                TableSchema::new(
                    "orders",
                    vec![
                        ColumnInfo::new("id", "INTEGER", false, KeyRole::Primary),
                        ColumnInfo::new("customer_id", "INTEGER", false, KeyRole::Foreign),
                        ColumnInfo::new("total", "REAL", false, KeyRole::None),
                    ],
                ),
            ],
        )
    }

    fn candidate(sql: &str) -> CandidateQuery {
        CandidateQuery::new(sql, Provenance::UserProvided)
    }

    fn rule_of(result: Result<ValidatedQuery, Error>) -> UnsafeRule {
        match result {
            Err(Error::UnsafeQuery { rule, .. }) => rule,
            other => panic!("expected unsafe query, got {:?}", other),
        }
    }

    #[test]
    fn test_injects_default_bound() {
        let validated = validate(
            &candidate("SELECT name, revenue FROM customers"),
            &snapshot(EngineKind::Postgres),
            1000,
        )
        .unwrap();
        assert_eq!(validated.row_bound, 1000);
        assert!(validated.sql.ends_with("LIMIT 1000"));
        assert_eq!(validated.referenced_tables, vec!["customers"]);
        assert_eq!(validated.statement_kind, StatementKind::Select);
    }

    #[test]
    fn test_tightens_existing_limit() {
        let snapshot = snapshot(EngineKind::Sqlite);
        let tightened = validate(&candidate("SELECT name FROM customers LIMIT 5000"), &snapshot, 10).unwrap();
        assert_eq!(tightened.row_bound, 10);
        assert!(tightened.sql.contains("LIMIT 10"));

        let kept = validate(&candidate("SELECT name FROM customers LIMIT 3"), &snapshot, 10).unwrap();
        assert_eq!(kept.row_bound, 3);
    }

    #[test]
    fn test_sql_server_uses_top() {
        let validated = validate(
            &candidate("SELECT TOP 50 name FROM customers"),
            &snapshot(EngineKind::SqlServer),
            10,
        )
        .unwrap();
        assert_eq!(validated.row_bound, 10);
        assert!(validated.sql.contains("TOP 10"));
    }

    #[test]
    fn test_rejects_stacked_statements() {
        let snapshot = snapshot(EngineKind::Postgres);
        assert_eq!(
            rule_of(validate(&candidate("DROP TABLE customers; SELECT 1"), &snapshot, 10)),
            UnsafeRule::MultipleStatements
        );
        assert_eq!(
            rule_of(validate(&candidate("SELECT 1; SELECT 2"), &snapshot, 10)),
            UnsafeRule::MultipleStatements
        );
        // A trailing separator alone is still one statement
        assert!(validate(&candidate("SELECT name FROM customers;"), &snapshot, 10).is_ok());
    }

    #[test]
    fn test_rejects_writes() {
        let snapshot = snapshot(EngineKind::Postgres);
        for sql in [
            "DROP TABLE customers",
            "DELETE FROM customers",
            "UPDATE customers SET revenue = 0",
            "INSERT INTO customers (name) VALUES ('x')",
            "SELECT name INTO backup FROM customers",
            "SELECT name FROM customers FOR UPDATE",
        ] {
            assert_eq!(rule_of(validate(&candidate(sql), &snapshot, 10)), UnsafeRule::NotReadOnly, "{}", sql);
        }
    }

    #[test]
    fn test_rejects_unknown_tables_and_columns() {
        let snapshot = snapshot(EngineKind::Postgres);
        assert_eq!(
            rule_of(validate(&candidate("SELECT * FROM employees"), &snapshot, 10)),
            UnsafeRule::UnknownTable
        );
        assert_eq!(
            rule_of(validate(&candidate("SELECT salary FROM customers"), &snapshot, 10)),
            UnsafeRule::UnknownColumn
        );
        assert_eq!(
            rule_of(validate(&candidate("SELECT c.total FROM customers c"), &snapshot, 10)),
            UnsafeRule::UnknownColumn
        );
    }

    #[test]
    fn test_accepts_joins_aliases_and_ctes() {
        let snapshot = snapshot(EngineKind::Postgres);
        let joined = validate(
            &candidate(
                "SELECT c.name, SUM(o.total) AS spent FROM customers c JOIN orders o ON o.customer_id = c.id GROUP BY c.name ORDER BY spent DESC",
            ),
            &snapshot,
            10,
        )
        .unwrap();
        assert_eq!(joined.referenced_tables, vec!["customers", "orders"]);

        let with_cte = validate(
            &candidate("WITH big AS (SELECT name, revenue FROM customers WHERE revenue > 100) SELECT name FROM big"),
            &snapshot,
            10,
        )
        .unwrap();
        assert_eq!(with_cte.referenced_tables, vec!["customers"]);
    }

    #[test]
    fn test_ctes_and_derived_tables_do_not_hide_unknown_columns() {
        let snapshot = snapshot(EngineKind::Postgres);
        for sql in [
            "WITH x AS (SELECT name FROM customers) SELECT password_hash FROM customers",
            "SELECT password_hash FROM customers, (SELECT 1) AS d",
            "SELECT d.password_hash FROM (SELECT name FROM customers) AS d",
            "WITH big (label) AS (SELECT name FROM customers) SELECT b.name FROM big b",
        ] {
            assert_eq!(rule_of(validate(&candidate(sql), &snapshot, 10)), UnsafeRule::UnknownColumn, "{}", sql);
        }
    }

    #[test]
    fn test_accepts_columns_exposed_by_derived_relations() {
        let snapshot = snapshot(EngineKind::Postgres);
        for sql in [
            "SELECT d.spent, d.name FROM (SELECT name, revenue * 2 AS spent FROM customers) AS d",
            "SELECT label FROM (SELECT name FROM customers) AS d (label)",
            "WITH big AS (SELECT * FROM customers) SELECT b.revenue FROM big b ORDER BY b.revenue",
            "WITH totals AS (SELECT customer_id, SUM(total) AS spent FROM orders GROUP BY customer_id) \
             SELECT c.name, t.spent FROM customers c JOIN totals t ON t.customer_id = c.id",
        ] {
            assert!(validate(&candidate(sql), &snapshot, 10).is_ok(), "{}", sql);
        }
    }

    #[test]
    fn test_generated_sql_grounding() {
        let snapshot = snapshot(EngineKind::Postgres);
        assert!(grounding_violation(
            "WITH x AS (SELECT name FROM customers) SELECT password_hash FROM customers",
            &snapshot
        )
        .is_some());
        assert!(grounding_violation("SELECT name FROM customers", &snapshot).is_none());
    }

    #[test]
    fn test_rejects_forbidden_functions() {
        let snapshot = snapshot(EngineKind::Postgres);
        assert_eq!(
            rule_of(validate(&candidate("SELECT pg_read_file('/etc/passwd')"), &snapshot, 10)),
            UnsafeRule::ForbiddenConstruct
        );
        assert_eq!(
            rule_of(validate(&candidate("SELECT pg_sleep(10)"), &snapshot, 10)),
            UnsafeRule::ForbiddenConstruct
        );
    }

    #[test]
    fn test_only_builtin_functions_are_callable() {
        let snapshot = snapshot(EngineKind::Postgres);
        for sql in [
            "SELECT public.purge_customers()",
            "SELECT pg_catalog.pg_sleep(10)",
            "SELECT name FROM customers WHERE audit_access(id)",
            "SELECT refresh_cache() AS done",
        ] {
            assert_eq!(
                rule_of(validate(&candidate(sql), &snapshot, 10)),
                UnsafeRule::ForbiddenConstruct,
                "{}",
                sql
            );
        }

        for sql in [
            "SELECT name, ROUND(SUM(revenue), 2) FROM customers GROUP BY name",
            "SELECT COALESCE(LOWER(name), 'n/a') FROM customers",
            "SELECT name, RANK() OVER (ORDER BY revenue DESC) FROM customers",
        ] {
            assert!(validate(&candidate(sql), &snapshot, 10).is_ok(), "{}", sql);
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert_eq!(
            rule_of(validate(&candidate("please show me revenue"), &snapshot(EngineKind::Postgres), 10)),
            UnsafeRule::Malformed
        );
    }

    #[test]
    fn test_count_statements_ignores_empty_segments() {
        let dialect = EngineKind::Postgres.dialect();
        let tokens = Tokenizer::new(dialect.as_ref(), "SELECT 1;; -- trailing\n").tokenize().unwrap();
        assert_eq!(count_statements(&tokens), 1);
    }
}
