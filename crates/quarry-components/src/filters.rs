//! Built-in filters.

use crate::{bool_property, string_list_property, u64_property};
use rhi_quarry::{
    Component, ComponentDescriptor, ComponentError, Dictionary, Filter, InputRow, Predicate,
    PropertyDescriptor, PropertyKind, Provided, Query, QueryOptimization, QueryOptimizedFilter,
    RunContext, SourceColumn, Value,
};
use std::sync::Arc;

pub const VALID: &str = "VALID";
pub const INVALID: &str = "INVALID";
pub const NOT_NULL: &str = "NOT_NULL";
pub const NULL: &str = "NULL";

// ============================================================================
// Max rows
// ============================================================================

/// Passes a window of rows: `max_rows` rows starting at `first_row`
/// (1-based) of the rows it sees.
#[derive(Debug, Clone)]
pub struct MaxRowsFilter {
    first_row: u64,
    max_rows: u64,
    seen: u64,
}

impl MaxRowsFilter {
    pub const ID: &'static str = "filter.max-rows";

    pub fn new() -> Self {
        Self {
            first_row: 1,
            max_rows: 1000,
            seen: 0,
        }
    }

    pub fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::filter(Self::ID, [VALID, INVALID])
            .description("Limit processing to a window of rows")
            .property(PropertyDescriptor::new("max_rows", PropertyKind::Int).default_value(1000i64))
            .property(PropertyDescriptor::new("first_row", PropertyKind::Int).default_value(1i64))
            .query_optimization(QueryOptimization::Always)
    }
}

impl Default for MaxRowsFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Component for MaxRowsFilter {
    fn configure(&mut self, name: &str, value: &Value) -> Result<(), ComponentError> {
        match name {
            "max_rows" => self.max_rows = u64_property(name, value)?,
            "first_row" => {
                self.first_row = u64_property(name, value)?;
                if self.first_row == 0 {
                    return Err(ComponentError::invalid_property(name, "rows are numbered from 1"));
                }
            }
            other => return Err(ComponentError::UnknownProperty(other.to_string())),
        }
        Ok(())
    }

    fn initialize(&mut self, _ctx: &RunContext) -> Result<(), ComponentError> {
        self.seen = 0;
        Ok(())
    }
}

impl Filter for MaxRowsFilter {
    fn categorize(&mut self, _row: &InputRow, _values: &[Value]) -> Result<String, ComponentError> {
        self.seen += 1;
        let in_window = self.seen >= self.first_row && self.seen - self.first_row < self.max_rows;
        Ok(if in_window { VALID } else { INVALID }.to_string())
    }

    fn query_optimized(&self) -> Option<&dyn QueryOptimizedFilter> {
        Some(self)
    }
}

impl QueryOptimizedFilter for MaxRowsFilter {
    fn is_optimizable(&self, category: &str) -> bool {
        category == VALID
    }

    fn optimize_query(&self, query: Query, _inputs: &[SourceColumn], _category: &str) -> Query {
        query.window(self.first_row, self.max_rows)
    }
}

// ============================================================================
// Equals
// ============================================================================

/// `VALID` when the input equals one of the configured values.
#[derive(Debug, Clone, Default)]
pub struct EqualsFilter {
    values: Vec<Value>,
}

impl EqualsFilter {
    pub const ID: &'static str = "filter.equals";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::filter(Self::ID, [VALID, INVALID])
            .description("Compare a column against a list of values")
            .property(PropertyDescriptor::new("values", PropertyKind::StringList).required())
            .query_optimization(QueryOptimization::Supported)
    }
}

impl Component for EqualsFilter {
    fn configure(&mut self, name: &str, value: &Value) -> Result<(), ComponentError> {
        match name {
            "values" => {
                self.values = string_list_property(name, value)?
                    .into_iter()
                    .map(Value::from)
                    .collect();
                if self.values.is_empty() {
                    return Err(ComponentError::invalid_property(name, "at least one value is required"));
                }
                Ok(())
            }
            other => Err(ComponentError::UnknownProperty(other.to_string())),
        }
    }
}

impl Filter for EqualsFilter {
    fn categorize(&mut self, _row: &InputRow, values: &[Value]) -> Result<String, ComponentError> {
        let value = values.first().unwrap_or(&Value::Null);
        let matched = self.values.iter().any(|v| value.loosely_equals(v));
        Ok(if matched { VALID } else { INVALID }.to_string())
    }

    fn query_optimized(&self) -> Option<&dyn QueryOptimizedFilter> {
        Some(self)
    }
}

impl QueryOptimizedFilter for EqualsFilter {
    fn is_optimizable(&self, category: &str) -> bool {
        category == VALID
    }

    fn optimize_query(&self, query: Query, inputs: &[SourceColumn], _category: &str) -> Query {
        let Some(column) = inputs.first() else {
            return query;
        };
        let predicate = match self.values.as_slice() {
            [single] => Predicate::Eq(single.clone()),
            values => Predicate::OneOf(values.to_vec()),
        };
        query.and_where(column.clone(), predicate)
    }
}

// ============================================================================
// Null check
// ============================================================================

/// `NOT_NULL` when every input has a value.
#[derive(Debug, Clone, Default)]
pub struct NullCheckFilter {
    empty_is_null: bool,
}

impl NullCheckFilter {
    pub const ID: &'static str = "filter.null-check";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::filter(Self::ID, [NOT_NULL, NULL])
            .description("Separate rows with missing values")
            .property(
                PropertyDescriptor::new("consider_empty_string_as_null", PropertyKind::Bool)
                    .default_value(false),
            )
            .query_optimization(QueryOptimization::Supported)
    }

    fn is_null(&self, value: &Value) -> bool {
        value.is_null() || (self.empty_is_null && value.as_str() == Some(""))
    }
}

impl Component for NullCheckFilter {
    fn configure(&mut self, name: &str, value: &Value) -> Result<(), ComponentError> {
        match name {
            "consider_empty_string_as_null" => {
                self.empty_is_null = bool_property(name, value)?;
                Ok(())
            }
            other => Err(ComponentError::UnknownProperty(other.to_string())),
        }
    }
}

impl Filter for NullCheckFilter {
    fn categorize(&mut self, _row: &InputRow, values: &[Value]) -> Result<String, ComponentError> {
        let any_null = values.iter().any(|v| self.is_null(v));
        Ok(if any_null { NULL } else { NOT_NULL }.to_string())
    }

    fn query_optimized(&self) -> Option<&dyn QueryOptimizedFilter> {
        Some(self)
    }
}

impl QueryOptimizedFilter for NullCheckFilter {
    fn is_optimizable(&self, category: &str) -> bool {
        category == NOT_NULL
    }

    fn optimize_query(&self, query: Query, inputs: &[SourceColumn], _category: &str) -> Query {
        inputs.iter().fold(query, |query, column| {
            let query = query.and_where(column.clone(), Predicate::IsNotNull);
            if self.empty_is_null {
                query.and_where(column.clone(), Predicate::Ne(Value::from("")))
            } else {
                query
            }
        })
    }
}

// ============================================================================
// Dictionary
// ============================================================================

/// `VALID` when the input's text is in a reference dictionary.
#[derive(Default)]
pub struct DictionaryFilter {
    dictionary: Option<Arc<dyn Dictionary>>,
}

impl DictionaryFilter {
    pub const ID: &'static str = "filter.dictionary";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::filter(Self::ID, [VALID, INVALID])
            .description("Check values against a reference dictionary")
            .property(PropertyDescriptor::new("dictionary", PropertyKind::Dictionary).required())
    }
}

impl Component for DictionaryFilter {
    fn provide(&mut self, name: &str, resource: Provided) -> Result<(), ComponentError> {
        match (name, resource) {
            ("dictionary", Provided::Dictionary(dictionary)) => {
                self.dictionary = Some(dictionary);
                Ok(())
            }
            (other, _) => Err(ComponentError::UnknownProperty(other.to_string())),
        }
    }

    fn initialize(&mut self, _ctx: &RunContext) -> Result<(), ComponentError> {
        if self.dictionary.is_none() {
            return Err(ComponentError::MissingResource("dictionary".into()));
        }
        Ok(())
    }

    fn close(&mut self, _success: bool) -> Result<(), ComponentError> {
        self.dictionary = None;
        Ok(())
    }
}

impl Filter for DictionaryFilter {
    fn categorize(&mut self, _row: &InputRow, values: &[Value]) -> Result<String, ComponentError> {
        let dictionary = self
            .dictionary
            .as_ref()
            .ok_or_else(|| ComponentError::MissingResource("dictionary".into()))?;
        let found = match values.first() {
            Some(value) if !value.is_null() => dictionary.contains(&value.to_string()),
            _ => false,
        };
        Ok(if found { VALID } else { INVALID }.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhi_quarry::{PropertiesExt, SimpleDictionary};

    fn row() -> InputRow {
        InputRow::new(1)
    }

    fn email() -> SourceColumn {
        SourceColumn::new("EMPLOYEES", "EMAIL")
    }

    #[test]
    fn test_max_rows_window() {
        let mut filter = MaxRowsFilter::new();
        filter.configure("first_row", &Value::from(3i64)).unwrap();
        filter.configure("max_rows", &Value::from(2i64)).unwrap();

        let categories: Vec<String> = (0..6).map(|_| filter.categorize(&row(), &[]).unwrap()).collect();
        assert_eq!(categories, vec![INVALID, INVALID, VALID, VALID, INVALID, INVALID]);

        let query = filter.optimize_query(Query::from("EMPLOYEES"), &[], VALID);
        assert_eq!(query.first_row(), Some(3));
        assert_eq!(query.max_rows(), Some(2));
        assert!(!filter.is_optimizable(INVALID));
    }

    #[test]
    fn test_max_rows_rejects_zero_first_row() {
        let mut filter = MaxRowsFilter::new();
        assert!(matches!(
            filter.configure("first_row", &Value::from(0i64)),
            Err(ComponentError::InvalidProperty { .. })
        ));
    }

    #[test]
    fn test_equals_filter() {
        let mut filter = EqualsFilter::new();
        let props = rhi_quarry::Properties::new().with("values", vec!["a", "b"]);
        filter.configure("values", &props["values"]).unwrap();

        assert_eq!(filter.categorize(&row(), &[Value::from("b")]).unwrap(), VALID);
        assert_eq!(filter.categorize(&row(), &[Value::from("c")]).unwrap(), INVALID);
        assert_eq!(filter.categorize(&row(), &[Value::Null]).unwrap(), INVALID);

        let query = filter.optimize_query(Query::from("EMPLOYEES"), &[email()], VALID);
        assert_eq!(
            query.to_sql(),
            r#"SELECT * FROM "EMPLOYEES" WHERE ("EMPLOYEES"."EMAIL" = 'a' OR "EMPLOYEES"."EMAIL" = 'b')"#
        );
    }

    #[test]
    fn test_equals_single_value_uses_eq() {
        let mut filter = EqualsFilter::new();
        filter.configure("values", &Value::from(vec!["x"])).unwrap();

        let query = filter.optimize_query(Query::from("EMPLOYEES"), &[email()], VALID);
        assert_eq!(query.conditions()[0].predicate, Predicate::Eq(Value::from("x")));
    }

    #[test]
    fn test_null_check() {
        let mut filter = NullCheckFilter::new();
        assert_eq!(filter.categorize(&row(), &[Value::from(""), Value::from(1i64)]).unwrap(), NOT_NULL);
        assert_eq!(filter.categorize(&row(), &[Value::from("x"), Value::Null]).unwrap(), NULL);

        filter.configure("consider_empty_string_as_null", &Value::from(true)).unwrap();
        assert_eq!(filter.categorize(&row(), &[Value::from("")]).unwrap(), NULL);

        let query = filter.optimize_query(Query::from("EMPLOYEES"), &[email()], NOT_NULL);
        assert_eq!(
            query.to_sql(),
            r#"SELECT * FROM "EMPLOYEES" WHERE "EMPLOYEES"."EMAIL" IS NOT NULL AND "EMPLOYEES"."EMAIL" <> ''"#
        );
    }

    #[test]
    fn test_dictionary_filter() {
        let mut filter = DictionaryFilter::new();
        let dictionary: Arc<dyn Dictionary> = Arc::new(SimpleDictionary::new("countries", ["DK", "NL"]));
        filter.provide("dictionary", Provided::Dictionary(dictionary)).unwrap();

        assert_eq!(filter.categorize(&row(), &[Value::from("DK")]).unwrap(), VALID);
        assert_eq!(filter.categorize(&row(), &[Value::from("US")]).unwrap(), INVALID);
        assert!(filter.query_optimized().is_none());

        filter.close(true).unwrap();
        assert!(filter.categorize(&row(), &[Value::from("DK")]).is_err());
    }
}
