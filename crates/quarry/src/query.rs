//! Relational query model.
//!
//! A [`Query`] selects physical columns from one table, narrowed by
//! conjunctive [`Condition`]s and an optional row window. It renders as
//! SQL-like text and can also be evaluated against in-memory values.

use crate::job::SourceColumn;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A predicate over a single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    IsNull,
    IsNotNull,
    /// Matches exact value.
    Eq(Value),
    /// Matches non-null values that differ.
    Ne(Value),
    /// Value is one of these.
    OneOf(Vec<Value>),
}

impl Predicate {
    /// Check if a value matches this predicate.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Predicate::IsNull => value.is_null(),
            Predicate::IsNotNull => !value.is_null(),
            Predicate::Eq(expected) => value.loosely_equals(expected),
            Predicate::Ne(expected) => !value.is_null() && !value.loosely_equals(expected),
            Predicate::OneOf(values) => values.iter().any(|v| value.loosely_equals(v)),
        }
    }
}

/// A predicate bound to a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: SourceColumn,
    pub predicate: Predicate,
}

impl Condition {
    pub fn new(column: SourceColumn, predicate: Predicate) -> Self {
        Self { column, predicate }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let column = QuotedColumn(&self.column);
        match &self.predicate {
            Predicate::IsNull => write!(f, "{} IS NULL", column),
            Predicate::IsNotNull => write!(f, "{} IS NOT NULL", column),
            Predicate::Eq(v) => write!(f, "{} = {}", column, SqlLiteral(v)),
            Predicate::Ne(v) => write!(f, "{} <> {}", column, SqlLiteral(v)),
            Predicate::OneOf(values) => {
                f.write_str("(")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" OR ")?;
                    }
                    write!(f, "{} = {}", column, SqlLiteral(v))?;
                }
                f.write_str(")")
            }
        }
    }
}

struct QuotedColumn<'a>(&'a SourceColumn);

impl fmt::Display for QuotedColumn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.0.table, self.0.name)
    }
}

struct SqlLiteral<'a>(&'a Value);

impl fmt::Display for SqlLiteral<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::Null => f.write_str("NULL"),
            Value::Bool(true) => f.write_str("TRUE"),
            Value::Bool(false) => f.write_str("FALSE"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            other => write!(f, "'{}'", other.to_string().replace('\'', "''")),
        }
    }
}

/// A single-table select query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    table: String,
    select: Vec<SourceColumn>,
    conditions: Vec<Condition>,
    /// 1-based index of the first row to return.
    first_row: Option<u64>,
    max_rows: Option<u64>,
}

impl Query {
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            select: Vec::new(),
            conditions: Vec::new(),
            first_row: None,
            max_rows: None,
        }
    }

    pub fn select(mut self, column: SourceColumn) -> Self {
        if !self.select.contains(&column) {
            self.select.push(column);
        }
        self
    }

    pub fn select_all(self, columns: impl IntoIterator<Item = SourceColumn>) -> Self {
        columns.into_iter().fold(self, Query::select)
    }

    /// Add a condition; conditions combine with AND in insertion order.
    pub fn and_where(mut self, column: SourceColumn, predicate: Predicate) -> Self {
        self.conditions.push(Condition::new(column, predicate));
        self
    }

    /// Cap the number of returned rows; repeated limits keep the minimum.
    pub fn limit(mut self, max_rows: u64) -> Self {
        self.max_rows = Some(self.max_rows.map_or(max_rows, |m| m.min(max_rows)));
        self
    }

    /// Narrow to `max_rows` rows starting at the 1-based `first_row` of the
    /// current result. Composes with an existing window.
    pub fn window(mut self, first_row: u64, max_rows: u64) -> Self {
        let skip = first_row.saturating_sub(1);
        if skip > 0 {
            let current = self.first_row.unwrap_or(1);
            self.first_row = Some(current + skip);
            self.max_rows = self.max_rows.map(|m| m.saturating_sub(skip));
        }
        self.limit(max_rows)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn select_items(&self) -> &[SourceColumn] {
        &self.select
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn first_row(&self) -> Option<u64> {
        self.first_row
    }

    pub fn max_rows(&self) -> Option<u64> {
        self.max_rows
    }

    /// Rows skipped before the first returned row.
    pub fn offset(&self) -> u64 {
        self.first_row.map_or(0, |f| f.saturating_sub(1))
    }

    /// Evaluate the conditions against a row, looking values up by column.
    pub fn matches<'a>(&self, lookup: impl Fn(&SourceColumn) -> Option<&'a Value>) -> bool {
        self.conditions.iter().all(|condition| {
            let value = lookup(&condition.column).unwrap_or(&Value::Null);
            condition.predicate.matches(value)
        })
    }

    pub fn to_sql(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SELECT ")?;
        if self.select.is_empty() {
            f.write_str("*")?;
        }
        for (i, column) in self.select.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", QuotedColumn(column))?;
        }
        write!(f, " FROM \"{}\"", self.table)?;
        for (i, condition) in self.conditions.iter().enumerate() {
            f.write_str(if i == 0 { " WHERE " } else { " AND " })?;
            write!(f, "{}", condition)?;
        }
        if let Some(max_rows) = self.max_rows {
            write!(f, " LIMIT {}", max_rows)?;
        }
        if self.offset() > 0 {
            write!(f, " OFFSET {}", self.offset())?;
        }
        Ok(())
    }
}
