//! Input rows as seen by consumers.

use crate::job::ColumnRef;
use crate::value::{NULL, Value};
use indexmap::IndexMap;
use std::fmt;

/// One row of a source table plus the virtual columns produced for it so far.
///
/// The id is the 1-based position of the row in the table's result set
/// (shifted by the query's first row when one is set).
#[derive(Debug, Clone, PartialEq)]
pub struct InputRow {
    id: u64,
    values: IndexMap<ColumnRef, Value>,
}

impl InputRow {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            values: IndexMap::new(),
        }
    }

    /// Builder form of [`InputRow::insert`].
    pub fn with(mut self, column: ColumnRef, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    /// 1-based position in the executed query's result, offset by its first
    /// row. Pushed-down conditions renumber the rows that match them.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Value of a column; columns the row does not carry read as null.
    pub fn get(&self, column: &ColumnRef) -> &Value {
        self.values.get(column).unwrap_or(&NULL)
    }

    pub fn insert(&mut self, column: ColumnRef, value: impl Into<Value>) {
        self.values.insert(column, value.into());
    }

    pub fn contains(&self, column: &ColumnRef) -> bool {
        self.values.contains_key(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnRef> {
        self.values.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ColumnRef, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for InputRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {} {{", self.id)?;
        for (i, (column, value)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, " {}={}", column, value)?;
        }
        f.write_str(" }")
    }
}
