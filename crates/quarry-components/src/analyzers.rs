//! Built-in analyzers.

use indexmap::IndexMap;
use rhi_quarry::{
    AnalyzerResult, Analyzer, AnnotatedRows, Component, ComponentDescriptor, ComponentError,
    InputRow, Provided, ProvidedKind, RowAnnotation, RowAnnotationFactory, RunContext, Value,
};
use std::sync::Arc;

fn take_annotation_factory(
    name: &str,
    resource: Provided,
    slot: &mut Option<Arc<dyn RowAnnotationFactory>>,
) -> Result<(), ComponentError> {
    match (name, resource) {
        ("annotations", Provided::AnnotationFactory(factory)) => {
            *slot = Some(factory);
            Ok(())
        }
        (other, _) => Err(ComponentError::UnknownProperty(other.to_string())),
    }
}

fn require_factory(
    slot: &Option<Arc<dyn RowAnnotationFactory>>,
) -> Result<&Arc<dyn RowAnnotationFactory>, ComponentError> {
    slot.as_ref()
        .ok_or_else(|| ComponentError::MissingResource("annotations".into()))
}

// ============================================================================
// String profile
// ============================================================================

struct StringAnnotations {
    null: RowAnnotation,
    blank: RowAnnotation,
}

/// Length and emptiness profile over every input value.
#[derive(Default)]
pub struct StringAnalyzer {
    factory: Option<Arc<dyn RowAnnotationFactory>>,
    annotations: Option<StringAnnotations>,
    row_count: u64,
    value_count: u64,
    null_count: u64,
    blank_count: u64,
    char_count: u64,
    min_length: Option<u64>,
    max_length: Option<u64>,
}

impl StringAnalyzer {
    pub const ID: &'static str = "analyzer.string";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::analyzer(Self::ID)
            .description("Profile text values: nulls, blanks and lengths")
            .provided("annotations", ProvidedKind::AnnotationFactory)
    }
}

impl Component for StringAnalyzer {
    fn provide(&mut self, name: &str, resource: Provided) -> Result<(), ComponentError> {
        take_annotation_factory(name, resource, &mut self.factory)
    }

    fn initialize(&mut self, _ctx: &RunContext) -> Result<(), ComponentError> {
        let factory = require_factory(&self.factory)?;
        self.annotations = Some(StringAnnotations {
            null: factory.create_annotation(),
            blank: factory.create_annotation(),
        });
        Ok(())
    }
}

impl Analyzer for StringAnalyzer {
    fn run(&mut self, row: &InputRow, values: &[Value], distinct_count: u64) -> Result<(), ComponentError> {
        let factory = Arc::clone(require_factory(&self.factory)?);
        let annotations = self
            .annotations
            .as_ref()
            .ok_or_else(|| ComponentError::failed("string analyzer not initialized"))?;

        self.row_count += distinct_count;
        for value in values {
            self.value_count += distinct_count;
            if value.is_null() {
                self.null_count += distinct_count;
                factory.annotate_distinct(row, distinct_count, &annotations.null);
                continue;
            }
            let text = value.to_string();
            if text.trim().is_empty() {
                self.blank_count += distinct_count;
                factory.annotate_distinct(row, distinct_count, &annotations.blank);
            }
            let length = text.chars().count() as u64;
            self.char_count += length * distinct_count;
            self.min_length = Some(self.min_length.map_or(length, |m| m.min(length)));
            self.max_length = Some(self.max_length.map_or(length, |m| m.max(length)));
        }
        Ok(())
    }

    fn result(&mut self) -> AnalyzerResult {
        let non_null = self.value_count - self.null_count;
        let avg_length = if non_null == 0 {
            Value::Null
        } else {
            Value::from(self.char_count as f64 / non_null as f64)
        };
        let mut result = AnalyzerResult::new()
            .metric("row_count", self.row_count)
            .metric("null_count", self.null_count)
            .metric("blank_count", self.blank_count)
            .metric("char_count", self.char_count)
            .metric("min_length", self.min_length)
            .metric("max_length", self.max_length)
            .metric("avg_length", avg_length);
        if let (Some(factory), Some(annotations)) = (&self.factory, &self.annotations) {
            result = result
                .annotated("null", AnnotatedRows::from_annotation(factory.as_ref(), &annotations.null))
                .annotated("blank", AnnotatedRows::from_annotation(factory.as_ref(), &annotations.blank));
        }
        result
    }
}

// ============================================================================
// Value distribution
// ============================================================================

struct ValueCount {
    count: u64,
    annotation: RowAnnotation,
}

/// Frequency of each value of the first input.
///
/// Values seen exactly once are merged into a single `unique` group when
/// the result is taken.
#[derive(Default)]
pub struct ValueDistributionAnalyzer {
    factory: Option<Arc<dyn RowAnnotationFactory>>,
    values: IndexMap<String, ValueCount>,
    nulls: Option<ValueCount>,
    unique: Option<RowAnnotation>,
}

impl ValueDistributionAnalyzer {
    pub const ID: &'static str = "analyzer.value-distribution";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::analyzer(Self::ID)
            .description("Count occurrences of each distinct value")
            .provided("annotations", ProvidedKind::AnnotationFactory)
    }

    /// Merge every value seen exactly once into the `unique` annotation.
    fn collapse_unique(&mut self, factory: &dyn RowAnnotationFactory) -> RowAnnotation {
        if let Some(unique) = &self.unique {
            return unique.clone();
        }
        let unique = factory.create_annotation();
        for entry in self.values.values().filter(|v| v.count == 1) {
            factory.transfer_annotations(&entry.annotation, &unique);
        }
        self.unique = Some(unique.clone());
        unique
    }
}

impl Component for ValueDistributionAnalyzer {
    fn provide(&mut self, name: &str, resource: Provided) -> Result<(), ComponentError> {
        take_annotation_factory(name, resource, &mut self.factory)
    }

    fn initialize(&mut self, _ctx: &RunContext) -> Result<(), ComponentError> {
        require_factory(&self.factory)?;
        self.values.clear();
        self.nulls = None;
        self.unique = None;
        Ok(())
    }
}

impl Analyzer for ValueDistributionAnalyzer {
    fn run(&mut self, row: &InputRow, values: &[Value], distinct_count: u64) -> Result<(), ComponentError> {
        let factory = Arc::clone(require_factory(&self.factory)?);
        let value = values.first().unwrap_or(&Value::Null);

        let entry = if value.is_null() {
            self.nulls.get_or_insert_with(|| ValueCount {
                count: 0,
                annotation: factory.create_annotation(),
            })
        } else {
            self.values
                .entry(value.to_string())
                .or_insert_with(|| ValueCount {
                    count: 0,
                    annotation: factory.create_annotation(),
                })
        };
        entry.count += distinct_count;
        factory.annotate_distinct(row, distinct_count, &entry.annotation);
        Ok(())
    }

    fn result(&mut self) -> AnalyzerResult {
        let Some(factory) = self.factory.clone() else {
            return AnalyzerResult::new();
        };
        let unique = self.collapse_unique(factory.as_ref());

        let mut repeated: Vec<(&String, u64)> = self
            .values
            .iter()
            .filter(|(_, v)| v.count > 1)
            .map(|(k, v)| (k, v.count))
            .collect();
        repeated.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let counts: Vec<Value> = repeated
            .iter()
            .map(|(k, count)| Value::Array(vec![Value::from(k.as_str()), Value::from(*count)]))
            .collect();
        let unique_count = self.values.values().filter(|v| v.count == 1).count();
        let null_count = self.nulls.as_ref().map_or(0, |n| n.count);

        let mut result = AnalyzerResult::new()
            .metric("distinct_count", self.values.len())
            .metric("unique_count", unique_count)
            .metric("null_count", null_count)
            .metric("counts", counts)
            .annotated("unique", AnnotatedRows::from_annotation(factory.as_ref(), &unique));
        if let Some(nulls) = &self.nulls {
            result = result.annotated("null", AnnotatedRows::from_annotation(factory.as_ref(), &nulls.annotation));
        }
        for (key, _) in &repeated {
            let annotation = &self.values[key.as_str()].annotation;
            result = result.annotated(key.as_str(), AnnotatedRows::from_annotation(factory.as_ref(), annotation));
        }
        result
    }
}

// ============================================================================
// Row collector
// ============================================================================

/// Records the id and input values of every row it receives.
#[derive(Debug, Clone, Default)]
pub struct RowCollectorAnalyzer {
    row_count: u64,
    ids: Vec<Value>,
    rows: Vec<Value>,
}

impl RowCollectorAnalyzer {
    pub const ID: &'static str = "analyzer.row-collector";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor() -> ComponentDescriptor {
        ComponentDescriptor::analyzer(Self::ID).description("Collect the rows reaching this point")
    }
}

impl Component for RowCollectorAnalyzer {
    fn initialize(&mut self, _ctx: &RunContext) -> Result<(), ComponentError> {
        *self = Self::default();
        Ok(())
    }
}

impl Analyzer for RowCollectorAnalyzer {
    fn run(&mut self, row: &InputRow, values: &[Value], distinct_count: u64) -> Result<(), ComponentError> {
        self.row_count += distinct_count;
        self.ids.push(Value::from(row.id()));
        self.rows.push(Value::Array(values.to_vec()));
        Ok(())
    }

    fn result(&mut self) -> AnalyzerResult {
        AnalyzerResult::new()
            .metric("row_count", self.row_count)
            .metric("row_ids", self.ids.clone())
            .metric("values", self.rows.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhi_quarry::{ColumnRef, InMemoryRowAnnotationFactory, ReferenceDataCatalog};

    fn setup<A: Analyzer>(analyzer: &mut A) -> Arc<InMemoryRowAnnotationFactory> {
        let factory = Arc::new(InMemoryRowAnnotationFactory::new(100, 10));
        let ctx = RunContext::new(factory.clone(), Arc::new(ReferenceDataCatalog::new()));
        analyzer
            .provide("annotations", Provided::AnnotationFactory(factory.clone()))
            .unwrap();
        analyzer.initialize(&ctx).unwrap();
        factory
    }

    fn row(id: u64, value: impl Into<Value>) -> (InputRow, Vec<Value>) {
        let value = value.into();
        let row = InputRow::new(id).with(ColumnRef::source("T", "A"), value.clone());
        (row, vec![value])
    }

    #[test]
    fn test_string_profile() {
        let mut analyzer = StringAnalyzer::new();
        setup(&mut analyzer);

        for (id, value) in [(1, Value::from("abc")), (2, Value::Null), (3, Value::from("  ")), (4, Value::from("a"))] {
            let (row, values) = row(id, value);
            analyzer.run(&row, &values, 1).unwrap();
        }

        let result = analyzer.result();
        assert_eq!(result.get("row_count"), Some(&Value::from(4u64)));
        assert_eq!(result.get("null_count"), Some(&Value::from(1u64)));
        assert_eq!(result.get("blank_count"), Some(&Value::from(1u64)));
        assert_eq!(result.get("min_length"), Some(&Value::from(1u64)));
        assert_eq!(result.get("max_length"), Some(&Value::from(3u64)));
        assert_eq!(result.annotated["null"].row_count, 1);
        assert_eq!(result.annotated["null"].samples[0].id(), 2);
        assert_eq!(result.annotated["blank"].samples[0].id(), 3);
    }

    #[test]
    fn test_string_requires_factory() {
        let mut analyzer = StringAnalyzer::new();
        let ctx = RunContext::new(
            Arc::new(InMemoryRowAnnotationFactory::default()),
            Arc::new(ReferenceDataCatalog::new()),
        );
        assert_eq!(
            analyzer.initialize(&ctx),
            Err(ComponentError::MissingResource("annotations".into()))
        );
    }

    #[test]
    fn test_value_distribution_collapses_unique() {
        let mut analyzer = ValueDistributionAnalyzer::new();
        setup(&mut analyzer);

        let data = ["DK", "NL", "DK", "US", "DK", "NL"];
        for (i, value) in data.iter().enumerate() {
            let (row, values) = row(i as u64 + 1, *value);
            analyzer.run(&row, &values, 1).unwrap();
        }
        let (row7, values) = row(7, Value::Null);
        analyzer.run(&row7, &values, 1).unwrap();

        let result = analyzer.result();
        assert_eq!(result.get("distinct_count"), Some(&Value::from(3usize)));
        assert_eq!(result.get("unique_count"), Some(&Value::from(1usize)));
        assert_eq!(result.get("null_count"), Some(&Value::from(1u64)));
        assert_eq!(
            result.get("counts"),
            Some(&Value::from(vec![
                Value::from(vec![Value::from("DK"), Value::from(3u64)]),
                Value::from(vec![Value::from("NL"), Value::from(2u64)]),
            ]))
        );

        let unique = &result.annotated["unique"];
        assert_eq!(unique.row_count, 1);
        assert_eq!(unique.samples[0].id(), 4);
        assert_eq!(result.annotated["DK"].row_count, 3);
        assert_eq!(result.annotated["null"].samples[0].id(), 7);

        // Taking the result again does not move annotations twice
        assert_eq!(analyzer.result().annotated["unique"].row_count, 1);
    }

    #[test]
    fn test_row_collector() {
        let mut analyzer = RowCollectorAnalyzer::new();
        let (r1, v1) = row(1, "x");
        let (r2, v2) = row(5, 2i64);
        analyzer.run(&r1, &v1, 1).unwrap();
        analyzer.run(&r2, &v2, 1).unwrap();

        let result = analyzer.result();
        assert_eq!(result.get("row_count"), Some(&Value::from(2u64)));
        assert_eq!(result.get("row_ids"), Some(&Value::from(vec![1u64, 5])));
    }
}
