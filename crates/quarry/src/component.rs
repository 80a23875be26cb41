//! Component descriptors and traits.
//!
//! A descriptor is the structured metadata the engine needs about a component
//! type: its kind, the outcomes a filter can produce, its configured and
//! provided properties, and whether it can be pushed into the source query.
//! The traits are the hooks the engine calls while a job runs.

use crate::annotation::{RowAnnotation, RowAnnotationFactory};
use crate::job::SourceColumn;
use crate::lifecycle::RunContext;
use crate::query::Query;
use crate::reference::Dictionary;
use crate::row::InputRow;
use crate::value::{Properties, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Role of a component in the row-processing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Filter,
    Transformer,
    Analyzer,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComponentKind::Filter => "filter",
            ComponentKind::Transformer => "transformer",
            ComponentKind::Analyzer => "analyzer",
        })
    }
}

/// Kind of a configured property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Bool,
    Int,
    Float,
    String,
    StringList,
    /// Name of a dictionary in the run's reference-data catalog.
    Dictionary,
}

impl PropertyKind {
    /// Check if a value is acceptable for this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            PropertyKind::Bool => value.as_bool().is_some(),
            PropertyKind::Int => value.as_i64().is_some(),
            PropertyKind::Float => value.as_f64().is_some(),
            PropertyKind::String | PropertyKind::Dictionary => value.as_str().is_some(),
            PropertyKind::StringList => value.as_string_list().is_some(),
        }
    }
}

/// Declaration of a configured property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: String,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            description: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }
}

/// Collaborators the engine injects from the run context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvidedKind {
    AnnotationFactory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidedDescriptor {
    pub name: String,
    pub kind: ProvidedKind,
}

/// How far a filter may be pushed into the source query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOptimization {
    /// Always evaluated row by row.
    #[default]
    None,
    /// Pushed down when the datastore prefers query optimization.
    Supported,
    /// Pushed down even when the datastore does not prefer it (row limits).
    Always,
}

/// Structured metadata about a component type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Unique identifier, e.g. `filter.max-rows`.
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub kind: ComponentKind,
    /// Outcome categories; only filters declare any.
    #[serde(default)]
    pub outcomes: Vec<String>,
    #[serde(default)]
    pub configured: IndexMap<String, PropertyDescriptor>,
    #[serde(default)]
    pub provided: Vec<ProvidedDescriptor>,
    #[serde(default)]
    pub query_optimization: QueryOptimization,
}

impl ComponentDescriptor {
    fn new(id: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            kind,
            outcomes: Vec::new(),
            configured: IndexMap::new(),
            provided: Vec::new(),
            query_optimization: QueryOptimization::None,
        }
    }

    pub fn filter<S: Into<String>>(id: impl Into<String>, outcomes: impl IntoIterator<Item = S>) -> Self {
        let mut desc = Self::new(id, ComponentKind::Filter);
        desc.outcomes = outcomes.into_iter().map(Into::into).collect();
        desc
    }

    pub fn transformer(id: impl Into<String>) -> Self {
        Self::new(id, ComponentKind::Transformer)
    }

    pub fn analyzer(id: impl Into<String>) -> Self {
        Self::new(id, ComponentKind::Analyzer)
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn property(mut self, property: PropertyDescriptor) -> Self {
        self.configured.insert(property.name.clone(), property);
        self
    }

    pub fn provided(mut self, name: impl Into<String>, kind: ProvidedKind) -> Self {
        self.provided.push(ProvidedDescriptor {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn query_optimization(mut self, level: QueryOptimization) -> Self {
        self.query_optimization = level;
        self
    }

    pub fn has_outcome(&self, category: &str) -> bool {
        self.outcomes.iter().any(|o| o == category)
    }

    pub fn is_query_optimizable(&self) -> bool {
        self.query_optimization != QueryOptimization::None
    }

    pub fn is_always_optimizable(&self) -> bool {
        self.query_optimization == QueryOptimization::Always
    }
}

/// Errors raised by component hooks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComponentError {
    #[error("invalid value for property {name}: {reason}")]
    InvalidProperty { name: String, reason: String },

    #[error("unknown property: {0}")]
    UnknownProperty(String),

    #[error("missing provided resource: {0}")]
    MissingResource(String),

    #[error("unknown reference data: {0}")]
    UnknownReference(String),

    #[error("outcome {0} is not declared by the filter")]
    UndeclaredOutcome(String),

    #[error("{0}")]
    Failed(String),
}

impl ComponentError {
    pub fn failed(msg: impl Into<String>) -> Self {
        ComponentError::Failed(msg.into())
    }

    pub fn invalid_property(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ComponentError::InvalidProperty {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// A collaborator handed to a component before initialization.
#[derive(Clone)]
pub enum Provided {
    AnnotationFactory(Arc<dyn RowAnnotationFactory>),
    Dictionary(Arc<dyn Dictionary>),
}

impl fmt::Debug for Provided {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provided::AnnotationFactory(_) => f.write_str("AnnotationFactory"),
            Provided::Dictionary(d) => write!(f, "Dictionary({})", d.name()),
        }
    }
}

/// Lifecycle hooks shared by every component.
///
/// The engine calls `configure`/`provide` for each binding, `initialize`
/// once before the first row and `close` exactly once after the last.
pub trait Component: Send {
    fn configure(&mut self, name: &str, _value: &Value) -> Result<(), ComponentError> {
        Err(ComponentError::UnknownProperty(name.to_string()))
    }

    fn provide(&mut self, name: &str, _resource: Provided) -> Result<(), ComponentError> {
        Err(ComponentError::UnknownProperty(name.to_string()))
    }

    fn initialize(&mut self, _ctx: &RunContext) -> Result<(), ComponentError> {
        Ok(())
    }

    /// `success` is false when the table (or the run) failed.
    fn close(&mut self, _success: bool) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// Partitions rows into the outcome categories its descriptor declares.
pub trait Filter: Component {
    fn categorize(&mut self, row: &InputRow, values: &[Value]) -> Result<String, ComponentError>;

    /// Capability for pushing this filter into the source query.
    fn query_optimized(&self) -> Option<&dyn QueryOptimizedFilter> {
        None
    }
}

/// Filter logic expressible as a query rewrite.
pub trait QueryOptimizedFilter {
    /// Whether rows in `category` can be selected by rewriting the query.
    fn is_optimizable(&self, category: &str) -> bool;

    /// Rewrite `query` so that it only yields rows in `category`.
    ///
    /// `inputs` are the filter's physical input columns.
    fn optimize_query(&self, query: Query, inputs: &[SourceColumn], category: &str) -> Query;
}

/// Derives new (virtual) columns.
pub trait Transformer: Component {
    /// One value per declared output column; missing trailing values are null.
    fn transform(&mut self, row: &InputRow, values: &[Value]) -> Result<Vec<Value>, ComponentError>;
}

/// Accumulates over every row it receives.
pub trait Analyzer: Component {
    fn run(&mut self, row: &InputRow, values: &[Value], distinct_count: u64) -> Result<(), ComponentError>;

    fn result(&mut self) -> AnalyzerResult;
}

/// Sampled rows behind an analyzer figure.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnnotatedRows {
    /// Exact number of rows, possibly larger than `samples`.
    pub row_count: u64,
    pub samples: Vec<InputRow>,
}

impl AnnotatedRows {
    /// Snapshot an annotation through its factory.
    pub fn from_annotation(factory: &dyn RowAnnotationFactory, annotation: &RowAnnotation) -> Self {
        Self {
            row_count: annotation.row_count(),
            samples: factory.sample_rows(annotation),
        }
    }
}

/// Output of one analyzer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnalyzerResult {
    pub metrics: Properties,
    pub annotated: IndexMap<String, AnnotatedRows>,
}

impl AnalyzerResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    pub fn annotated(mut self, name: impl Into<String>, rows: AnnotatedRows) -> Self {
        self.annotated.insert(name.into(), rows);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.metrics.get(name)
    }
}

/// A live component instance, tagged by kind.
pub enum ComponentInstance {
    Filter(Box<dyn Filter>),
    Transformer(Box<dyn Transformer>),
    Analyzer(Box<dyn Analyzer>),
}

macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            ComponentInstance::Filter($c) => $body,
            ComponentInstance::Transformer($c) => $body,
            ComponentInstance::Analyzer($c) => $body,
        }
    };
}

impl ComponentInstance {
    pub fn filter(filter: impl Filter + 'static) -> Self {
        ComponentInstance::Filter(Box::new(filter))
    }

    pub fn transformer(transformer: impl Transformer + 'static) -> Self {
        ComponentInstance::Transformer(Box::new(transformer))
    }

    pub fn analyzer(analyzer: impl Analyzer + 'static) -> Self {
        ComponentInstance::Analyzer(Box::new(analyzer))
    }

    pub fn kind(&self) -> ComponentKind {
        match self {
            ComponentInstance::Filter(_) => ComponentKind::Filter,
            ComponentInstance::Transformer(_) => ComponentKind::Transformer,
            ComponentInstance::Analyzer(_) => ComponentKind::Analyzer,
        }
    }

    pub fn configure(&mut self, name: &str, value: &Value) -> Result<(), ComponentError> {
        dispatch!(self, c => c.configure(name, value))
    }

    pub fn provide(&mut self, name: &str, resource: Provided) -> Result<(), ComponentError> {
        dispatch!(self, c => c.provide(name, resource))
    }

    pub fn initialize(&mut self, ctx: &RunContext) -> Result<(), ComponentError> {
        dispatch!(self, c => c.initialize(ctx))
    }

    pub fn close(&mut self, success: bool) -> Result<(), ComponentError> {
        dispatch!(self, c => c.close(success))
    }
}

impl fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentInstance({})", self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_kinds() {
        assert!(PropertyKind::Float.accepts(&Value::Int(3)));
        assert!(!PropertyKind::Int.accepts(&Value::Float(3.0)));
        assert!(PropertyKind::StringList.accepts(&Value::from(vec!["a"])));
        assert!(PropertyKind::Dictionary.accepts(&Value::from("countries")));
        assert!(!PropertyKind::Bool.accepts(&Value::Null));
    }

    #[test]
    fn test_descriptor_builder() {
        let desc = ComponentDescriptor::filter("filter.max-rows", ["VALID", "INVALID"])
            .description("Limit the number of rows")
            .property(PropertyDescriptor::new("max_rows", PropertyKind::Int).default_value(1000i64))
            .query_optimization(QueryOptimization::Always);

        assert_eq!(desc.kind, ComponentKind::Filter);
        assert!(desc.has_outcome("VALID"));
        assert!(!desc.has_outcome("NULL"));
        assert!(desc.is_query_optimizable());
        assert!(desc.is_always_optimizable());
        assert_eq!(desc.configured["max_rows"].default, Some(Value::Int(1000)));
    }

    #[test]
    fn test_descriptor_from_json() {
        let json = r#"{
            "id": "analyzer.row-count",
            "kind": "analyzer",
            "provided": [{ "name": "annotations", "kind": "annotation_factory" }]
        }"#;
        let desc: ComponentDescriptor = serde_json::from_str(json).unwrap();

        assert_eq!(desc.kind, ComponentKind::Analyzer);
        assert_eq!(desc.provided[0].kind, ProvidedKind::AnnotationFactory);
        assert_eq!(desc.query_optimization, QueryOptimization::None);
    }

    #[test]
    fn test_default_hooks_reject_unknown_properties() {
        struct Bare;
        impl Component for Bare {}
        impl Analyzer for Bare {
            fn run(&mut self, _: &InputRow, _: &[Value], _: u64) -> Result<(), ComponentError> {
                Ok(())
            }
            fn result(&mut self) -> AnalyzerResult {
                AnalyzerResult::new()
            }
        }

        let mut instance = ComponentInstance::analyzer(Bare);
        assert_eq!(instance.kind(), ComponentKind::Analyzer);
        assert_eq!(
            instance.configure("nope", &Value::Null),
            Err(ComponentError::UnknownProperty("nope".into()))
        );
        assert!(instance.close(true).is_ok());
    }
}
