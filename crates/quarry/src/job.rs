//! Job model: source columns, component nodes and the requirement edges
//! between them.
//!
//! A [`JobBuilder`] collects [`NodeSpec`]s and validates them eagerly against a
//! [`Registry`]. The resulting [`Job`] is immutable. [`Lineage`] traces every
//! node back to the physical columns and tables it depends on.

use crate::component::{ComponentDescriptor, ComponentKind, PropertyKind};
use crate::registry::Registry;
use crate::value::{Properties, Value};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Index of a node within its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A physical column of a source table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceColumn {
    pub table: String,
    pub name: String,
}

impl SourceColumn {
    pub fn new(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SourceColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.name)
    }
}

/// Reference to a column a node consumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnRef {
    /// Physical column of a source table.
    Source(SourceColumn),
    /// Virtual column: output `index` of a transformer node.
    Output { node: NodeId, index: usize },
}

impl ColumnRef {
    pub fn source(table: impl Into<String>, name: impl Into<String>) -> Self {
        ColumnRef::Source(SourceColumn::new(table, name))
    }

    pub fn output(node: NodeId, index: usize) -> Self {
        ColumnRef::Output { node, index }
    }

    pub fn is_physical(&self) -> bool {
        matches!(self, ColumnRef::Source(_))
    }

    pub fn as_source(&self) -> Option<&SourceColumn> {
        match self {
            ColumnRef::Source(col) => Some(col),
            ColumnRef::Output { .. } => None,
        }
    }

    /// The node producing this column, if virtual.
    pub fn producer(&self) -> Option<NodeId> {
        match self {
            ColumnRef::Source(_) => None,
            ColumnRef::Output { node, .. } => Some(*node),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Source(col) => write!(f, "{}", col),
            ColumnRef::Output { node, index } => write!(f, "{}[{}]", node, index),
        }
    }
}

/// A category produced by a specific filter node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Outcome {
    pub filter: NodeId,
    pub category: String,
}

impl Outcome {
    pub fn new(filter: NodeId, category: impl Into<String>) -> Self {
        Self {
            filter,
            category: category.into(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.filter, self.category)
    }
}

/// Gate on which rows a node is evaluated for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Requirement {
    /// Only rows on which the filter produced this outcome.
    Outcome(Outcome),
    /// Every row, regardless of its sources' requirements.
    Any,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Outcome(o) => write!(f, "{}", o),
            Requirement::Any => f.write_str("*"),
        }
    }
}

/// Builder-side description of a node.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    kind: ComponentKind,
    descriptor: String,
    name: Option<String>,
    inputs: Vec<ColumnRef>,
    requirement: Option<Requirement>,
    properties: Properties,
    outputs: Vec<String>,
}

impl NodeSpec {
    fn new(kind: ComponentKind, descriptor: impl Into<String>) -> Self {
        Self {
            kind,
            descriptor: descriptor.into(),
            name: None,
            inputs: Vec::new(),
            requirement: None,
            properties: Properties::new(),
            outputs: Vec::new(),
        }
    }

    pub fn filter(descriptor: impl Into<String>) -> Self {
        Self::new(ComponentKind::Filter, descriptor)
    }

    pub fn transformer(descriptor: impl Into<String>) -> Self {
        Self::new(ComponentKind::Transformer, descriptor)
    }

    pub fn analyzer(descriptor: impl Into<String>) -> Self {
        Self::new(ComponentKind::Analyzer, descriptor)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn input(mut self, column: ColumnRef) -> Self {
        self.inputs.push(column);
        self
    }

    pub fn inputs(mut self, columns: impl IntoIterator<Item = ColumnRef>) -> Self {
        self.inputs.extend(columns);
        self
    }

    pub fn requires(mut self, filter: NodeId, category: impl Into<String>) -> Self {
        self.requirement = Some(Requirement::Outcome(Outcome::new(filter, category)));
        self
    }

    pub fn requires_any(mut self) -> Self {
        self.requirement = Some(Requirement::Any);
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }
}

/// A configured property resolved against its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyBinding {
    pub name: String,
    pub kind: PropertyKind,
    pub value: Value,
}

/// A validated node of a built job.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    name: String,
    descriptor: Arc<ComponentDescriptor>,
    inputs: Vec<ColumnRef>,
    requirement: Option<Requirement>,
    bindings: Vec<PropertyBinding>,
    outputs: Vec<String>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ComponentKind {
        self.descriptor.kind
    }

    pub fn descriptor(&self) -> &Arc<ComponentDescriptor> {
        &self.descriptor
    }

    pub fn inputs(&self) -> &[ColumnRef] {
        &self.inputs
    }

    pub fn requirement(&self) -> Option<&Requirement> {
        self.requirement.as_ref()
    }

    pub fn bindings(&self) -> &[PropertyBinding] {
        &self.bindings
    }

    /// Names of the virtual columns a transformer produces.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn output_columns(&self) -> Vec<ColumnRef> {
        (0..self.outputs.len())
            .map(|index| ColumnRef::output(self.id, index))
            .collect()
    }

    /// Every outcome this node can produce (empty unless a filter).
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.descriptor
            .outcomes
            .iter()
            .map(|category| Outcome::new(self.id, category.clone()))
            .collect()
    }

    /// Direct producers of this node's virtual inputs, deduplicated.
    pub fn producers(&self) -> Vec<NodeId> {
        let set: IndexSet<NodeId> = self.inputs.iter().filter_map(ColumnRef::producer).collect();
        set.into_iter().collect()
    }

    /// Nodes this node directly depends on: input producers and the
    /// filter its requirement references.
    fn dependencies(&self) -> impl Iterator<Item = NodeId> + '_ {
        let filter = match &self.requirement {
            Some(Requirement::Outcome(o)) => Some(o.filter),
            _ => None,
        };
        self.inputs.iter().filter_map(ColumnRef::producer).chain(filter)
    }
}

/// Errors detected while building a job or wiring its consumers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{node}: unknown component {descriptor}")]
    UnknownComponent { node: String, descriptor: String },

    #[error("{node}: component {descriptor} is a {actual}, not a {expected}")]
    KindMismatch {
        node: String,
        descriptor: String,
        expected: ComponentKind,
        actual: ComponentKind,
    },

    #[error("{node}: unknown input column {column}")]
    UnknownColumn { node: String, column: String },

    #[error("{node}: no input columns")]
    NoInputs { node: String },

    #[error("{node}: transformer declares no output columns")]
    NoOutputs { node: String },

    #[error("{node}: only transformers can declare output columns")]
    UnexpectedOutputs { node: String },

    #[error("{node}: requirement references unknown node {filter}")]
    UnknownRequirementNode { node: String, filter: NodeId },

    #[error("{node}: requirement references {filter}, which is not a filter")]
    RequirementNotFilter { node: String, filter: String },

    #[error("{node}: filter {filter} has no outcome {outcome}")]
    UnknownOutcome {
        node: String,
        filter: String,
        outcome: String,
    },

    #[error("{node}: unknown property {property}")]
    UnknownProperty { node: String, property: String },

    #[error("{node}: missing required property {property}")]
    MissingProperty { node: String, property: String },

    #[error("{node}: property {property} expects {expected:?}, got {value}")]
    InvalidProperty {
        node: String,
        property: String,
        expected: PropertyKind,
        value: Value,
    },

    #[error("{node}: dependency cycle")]
    Cycle { node: String },

    #[error("{node}: consumes columns from several tables: {tables:?}")]
    MultipleTables { node: String, tables: Vec<String> },

    #[error("no factory registered for component {0}")]
    NoFactory(String),

    #[error("cannot order consumers of table {table}: {remaining:?}")]
    UnorderableConsumers { table: String, remaining: Vec<String> },
}

/// Collects nodes and validates them into a [`Job`].
#[derive(Debug, Clone, Default)]
pub struct JobBuilder {
    nodes: Vec<NodeSpec>,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for [`ColumnRef::source`].
    pub fn source_column(&self, table: impl Into<String>, name: impl Into<String>) -> ColumnRef {
        ColumnRef::source(table, name)
    }

    /// Add a node; the returned id is valid for requirements and outputs.
    pub fn add(&mut self, spec: NodeSpec) -> NodeId {
        self.nodes.push(spec);
        NodeId(self.nodes.len() - 1)
    }

    /// Virtual column `index` of a transformer added earlier.
    pub fn output_column(&self, node: NodeId, index: usize) -> ColumnRef {
        ColumnRef::output(node, index)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Validate every node against the registry and freeze the job.
    pub fn build(self, registry: &Registry) -> Result<Job, ConfigurationError> {
        let names: Vec<String> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, spec)| display_name(i, spec))
            .collect();

        // Descriptors and bindings first; wiring checks need every descriptor.
        let mut descriptors = Vec::with_capacity(self.nodes.len());
        for (i, spec) in self.nodes.iter().enumerate() {
            let descriptor = registry.get_decl(&spec.descriptor).ok_or_else(|| {
                ConfigurationError::UnknownComponent {
                    node: names[i].clone(),
                    descriptor: spec.descriptor.clone(),
                }
            })?;
            if descriptor.kind != spec.kind {
                return Err(ConfigurationError::KindMismatch {
                    node: names[i].clone(),
                    descriptor: spec.descriptor.clone(),
                    expected: spec.kind,
                    actual: descriptor.kind,
                });
            }
            descriptors.push(descriptor.clone());
        }

        let output_counts: Vec<usize> = self.nodes.iter().map(|spec| spec.outputs.len()).collect();

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (i, spec) in self.nodes.into_iter().enumerate() {
            let name = &names[i];
            validate_wiring(i, &spec, name, &names, &descriptors, &output_counts)?;
            let bindings = resolve_bindings(name, &descriptors[i], &spec.properties)?;
            nodes.push(Node {
                id: NodeId(i),
                name: name.clone(),
                descriptor: descriptors[i].clone(),
                inputs: spec.inputs,
                requirement: spec.requirement,
                bindings,
                outputs: spec.outputs,
            });
        }

        let order = topological_order(&nodes)?;
        let lineage = Lineage::compute(&nodes, &order);

        let mut tables: IndexSet<String> = IndexSet::new();
        for node in &nodes {
            let node_tables = lineage.tables(node.id);
            if node_tables.len() > 1 {
                return Err(ConfigurationError::MultipleTables {
                    node: node.name.clone(),
                    tables: node_tables.to_vec(),
                });
            }
            tables.extend(node_tables.iter().cloned());
        }

        tracing::debug!(nodes = nodes.len(), tables = tables.len(), "built job");

        Ok(Job {
            nodes,
            lineage,
            tables: tables.into_iter().collect(),
        })
    }
}

fn display_name(index: usize, spec: &NodeSpec) -> String {
    spec.name
        .clone()
        .unwrap_or_else(|| format!("{} {}", spec.descriptor, NodeId(index)))
}

fn validate_wiring(
    index: usize,
    spec: &NodeSpec,
    name: &str,
    names: &[String],
    descriptors: &[Arc<ComponentDescriptor>],
    output_counts: &[usize],
) -> Result<(), ConfigurationError> {
    if spec.inputs.is_empty() {
        return Err(ConfigurationError::NoInputs {
            node: name.to_string(),
        });
    }

    match spec.kind {
        ComponentKind::Transformer if spec.outputs.is_empty() => {
            return Err(ConfigurationError::NoOutputs {
                node: name.to_string(),
            });
        }
        ComponentKind::Filter | ComponentKind::Analyzer if !spec.outputs.is_empty() => {
            return Err(ConfigurationError::UnexpectedOutputs {
                node: name.to_string(),
            });
        }
        _ => {}
    }

    for column in &spec.inputs {
        let ColumnRef::Output { node, index: output } = column else {
            continue;
        };
        let valid = node.0 != index
            && descriptors
                .get(node.0)
                .is_some_and(|d| d.kind == ComponentKind::Transformer)
            && output_counts.get(node.0).is_some_and(|count| output < count);
        if !valid {
            return Err(ConfigurationError::UnknownColumn {
                node: name.to_string(),
                column: column.to_string(),
            });
        }
    }

    if let Some(Requirement::Outcome(outcome)) = &spec.requirement {
        let filter = outcome.filter.0;
        let Some(descriptor) = descriptors.get(filter) else {
            return Err(ConfigurationError::UnknownRequirementNode {
                node: name.to_string(),
                filter: outcome.filter,
            });
        };
        if descriptor.kind != ComponentKind::Filter {
            return Err(ConfigurationError::RequirementNotFilter {
                node: name.to_string(),
                filter: names[filter].clone(),
            });
        }
        if !descriptor.has_outcome(&outcome.category) {
            return Err(ConfigurationError::UnknownOutcome {
                node: name.to_string(),
                filter: names[filter].clone(),
                outcome: outcome.category.clone(),
            });
        }
    }

    Ok(())
}

fn resolve_bindings(
    node: &str,
    descriptor: &ComponentDescriptor,
    properties: &Properties,
) -> Result<Vec<PropertyBinding>, ConfigurationError> {
    if let Some(unknown) = properties
        .keys()
        .find(|key| !descriptor.configured.contains_key(key.as_str()))
    {
        return Err(ConfigurationError::UnknownProperty {
            node: node.to_string(),
            property: unknown.clone(),
        });
    }

    let mut bindings = Vec::new();
    for property in descriptor.configured.values() {
        let value = match properties.get(&property.name).or(property.default.as_ref()) {
            Some(value) => value.clone(),
            None if property.required => {
                return Err(ConfigurationError::MissingProperty {
                    node: node.to_string(),
                    property: property.name.clone(),
                });
            }
            None => continue,
        };
        if !property.kind.accepts(&value) {
            return Err(ConfigurationError::InvalidProperty {
                node: node.to_string(),
                property: property.name.clone(),
                expected: property.kind,
                value,
            });
        }
        bindings.push(PropertyBinding {
            name: property.name.clone(),
            kind: property.kind,
            value,
        });
    }
    Ok(bindings)
}

/// Kahn's algorithm, lowest index first; fails on the first node in a cycle.
fn topological_order(nodes: &[Node]) -> Result<Vec<NodeId>, ConfigurationError> {
    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for node in nodes {
        let deps: IndexSet<NodeId> = node.dependencies().collect();
        for dep in deps {
            indegree[node.id.0] += 1;
            dependents[dep.0].push(node.id.0);
        }
    }

    let mut ready: std::collections::BTreeSet<usize> =
        (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_first() {
        order.push(NodeId(i));
        for &dependent in &dependents[i] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if let Some(stuck) = (0..nodes.len()).find(|&i| indegree[i] > 0) {
        return Err(ConfigurationError::Cycle {
            node: nodes[stuck].name.clone(),
        });
    }
    Ok(order)
}

/// Transitive dependencies of every node ("source-column finder").
#[derive(Debug, Clone, Default)]
pub struct Lineage {
    sources: Vec<Vec<NodeId>>,
    physical: Vec<Vec<SourceColumn>>,
    tables: Vec<Vec<String>>,
}

impl Lineage {
    fn compute(nodes: &[Node], order: &[NodeId]) -> Self {
        let mut sources: Vec<IndexSet<NodeId>> = vec![IndexSet::new(); nodes.len()];
        let mut physical: Vec<IndexSet<SourceColumn>> = vec![IndexSet::new(); nodes.len()];

        for &id in order {
            let node = &nodes[id.0];
            let mut node_sources = IndexSet::new();
            let mut node_physical = IndexSet::new();
            for dep in node.dependencies() {
                node_sources.insert(dep);
                node_sources.extend(sources[dep.0].iter().copied());
                node_physical.extend(physical[dep.0].iter().cloned());
            }
            node_physical.extend(node.inputs.iter().filter_map(ColumnRef::as_source).cloned());
            sources[id.0] = node_sources;
            physical[id.0] = node_physical;
        }

        let tables = physical
            .iter()
            .map(|cols| {
                let set: IndexSet<&str> = cols.iter().map(|c| c.table.as_str()).collect();
                set.into_iter().map(String::from).collect()
            })
            .collect();

        Self {
            sources: sources
                .into_iter()
                .map(|s| {
                    let mut v: Vec<_> = s.into_iter().collect();
                    v.sort();
                    v
                })
                .collect(),
            physical: physical.into_iter().map(|p| p.into_iter().collect()).collect(),
            tables,
        }
    }

    /// Every node `node` transitively depends on, in id order.
    pub fn source_nodes(&self, node: NodeId) -> &[NodeId] {
        self.sources.get(node.0).map_or(&[], Vec::as_slice)
    }

    /// Physical columns `node` transitively reads.
    pub fn physical_columns(&self, node: NodeId) -> &[SourceColumn] {
        self.physical.get(node.0).map_or(&[], Vec::as_slice)
    }

    pub fn tables(&self, node: NodeId) -> &[String] {
        self.tables.get(node.0).map_or(&[], Vec::as_slice)
    }

    /// Whether `node` depends on `other`, directly or transitively.
    pub fn depends_on(&self, node: NodeId, other: NodeId) -> bool {
        self.source_nodes(node).binary_search(&other).is_ok()
    }
}

/// An immutable, validated job.
#[derive(Debug, Clone)]
pub struct Job {
    nodes: Vec<Node>,
    lineage: Lineage,
    tables: Vec<String>,
}

impl Job {
    pub fn builder() -> JobBuilder {
        JobBuilder::new()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn lineage(&self) -> &Lineage {
        &self.lineage
    }

    /// Source tables, in order of first use.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Nodes consuming `table` directly or transitively, in declaration order.
    pub fn nodes_for_table(&self, table: &str) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|node| self.lineage.tables(node.id).iter().any(|t| t == table))
            .collect()
    }

    /// Physical columns of `table` read by any node, in order of first use.
    pub fn source_columns_for_table(&self, table: &str) -> Vec<SourceColumn> {
        let mut columns: IndexSet<SourceColumn> = IndexSet::new();
        for node in &self.nodes {
            columns.extend(
                node.inputs
                    .iter()
                    .filter_map(ColumnRef::as_source)
                    .filter(|c| c.table == table)
                    .cloned(),
            );
        }
        columns.into_iter().collect()
    }

    /// Nodes feeding `node` that carry a requirement of their own.
    pub fn requirement_sources(&self, node: NodeId) -> Vec<NodeId> {
        self.lineage
            .source_nodes(node)
            .iter()
            .copied()
            .filter(|id| self.node(*id).is_some_and(|n| n.requirement().is_some()))
            .collect()
    }

    /// Group node ids by table.
    pub fn nodes_by_table(&self) -> IndexMap<String, Vec<NodeId>> {
        self.tables
            .iter()
            .map(|t| (t.clone(), self.nodes_for_table(t).iter().map(|n| n.id).collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::PropertyDescriptor;

    fn make_test_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_decl(
            ComponentDescriptor::filter("filter.max-rows", ["VALID", "INVALID"])
                .property(PropertyDescriptor::new("max_rows", PropertyKind::Int).default_value(1000i64)),
        );
        registry.register_decl(
            ComponentDescriptor::filter("filter.equals", ["VALID", "INVALID"])
                .property(PropertyDescriptor::new("values", PropertyKind::StringList).required()),
        );
        registry.register_decl(ComponentDescriptor::transformer("transformer.trim"));
        registry.register_decl(ComponentDescriptor::analyzer("analyzer.string"));
        registry
    }

    #[test]
    fn test_build_resolves_defaults() {
        let registry = make_test_registry();
        let mut builder = JobBuilder::new();
        let name = builder.source_column("PERSONS", "NAME");
        let max_rows = builder.add(NodeSpec::filter("filter.max-rows").input(name.clone()));
        builder.add(
            NodeSpec::analyzer("analyzer.string")
                .input(name)
                .requires(max_rows, "VALID"),
        );

        let job = builder.build(&registry).unwrap();
        let filter = job.node(max_rows).unwrap();

        assert_eq!(filter.bindings().len(), 1);
        assert_eq!(filter.bindings()[0].value, Value::Int(1000));
        assert_eq!(job.tables(), &["PERSONS".to_string()]);
        assert_eq!(filter.outcomes().len(), 2);
    }

    #[test]
    fn test_unknown_outcome_fails_fast() {
        let registry = make_test_registry();
        let mut builder = JobBuilder::new();
        let name = builder.source_column("PERSONS", "NAME");
        let max_rows = builder.add(NodeSpec::filter("filter.max-rows").input(name.clone()));
        builder.add(
            NodeSpec::analyzer("analyzer.string")
                .input(name)
                .requires(max_rows, "MAYBE"),
        );

        let err = builder.build(&registry).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownOutcome { ref outcome, .. } if outcome == "MAYBE"));
    }

    #[test]
    fn test_requirement_on_non_filter() {
        let registry = make_test_registry();
        let mut builder = JobBuilder::new();
        let name = builder.source_column("PERSONS", "NAME");
        let trim = builder.add(NodeSpec::transformer("transformer.trim").input(name.clone()).output("trimmed"));
        builder.add(NodeSpec::analyzer("analyzer.string").input(name).requires(trim, "VALID"));

        assert!(matches!(
            builder.build(&registry),
            Err(ConfigurationError::RequirementNotFilter { .. })
        ));
    }

    #[test]
    fn test_property_errors() {
        let registry = make_test_registry();

        let mut missing = JobBuilder::new();
        let col = missing.source_column("T", "A");
        missing.add(NodeSpec::filter("filter.equals").input(col.clone()));
        assert!(matches!(
            missing.build(&registry),
            Err(ConfigurationError::MissingProperty { ref property, .. }) if property == "values"
        ));

        let mut wrong = JobBuilder::new();
        wrong.add(NodeSpec::filter("filter.max-rows").input(col.clone()).property("max_rows", "ten"));
        assert!(matches!(wrong.build(&registry), Err(ConfigurationError::InvalidProperty { .. })));

        let mut unknown = JobBuilder::new();
        unknown.add(NodeSpec::filter("filter.max-rows").input(col).property("limit", 10i64));
        assert!(matches!(unknown.build(&registry), Err(ConfigurationError::UnknownProperty { .. })));
    }

    #[test]
    fn test_unknown_output_column() {
        let registry = make_test_registry();
        let mut builder = JobBuilder::new();
        let col = builder.source_column("T", "A");
        let trim = builder.add(NodeSpec::transformer("transformer.trim").input(col).output("trimmed"));
        builder.add(NodeSpec::analyzer("analyzer.string").input(builder.output_column(trim, 1)));

        assert!(matches!(builder.build(&registry), Err(ConfigurationError::UnknownColumn { .. })));
    }

    #[test]
    fn test_cycle_detected() {
        let registry = make_test_registry();
        let mut builder = JobBuilder::new();
        // Each transformer reads the other's output
        builder.add(
            NodeSpec::transformer("transformer.trim")
                .input(ColumnRef::output(NodeId(1), 0))
                .output("a"),
        );
        builder.add(
            NodeSpec::transformer("transformer.trim")
                .input(ColumnRef::output(NodeId(0), 0))
                .output("b"),
        );

        assert!(matches!(builder.build(&registry), Err(ConfigurationError::Cycle { .. })));
    }

    #[test]
    fn test_multiple_tables_rejected() {
        let registry = make_test_registry();
        let mut builder = JobBuilder::new();
        builder.add(
            NodeSpec::analyzer("analyzer.string")
                .input(ColumnRef::source("A", "X"))
                .input(ColumnRef::source("B", "Y")),
        );

        assert!(matches!(builder.build(&registry), Err(ConfigurationError::MultipleTables { .. })));
    }

    #[test]
    fn test_lineage_and_table_partition() {
        let registry = make_test_registry();
        let mut builder = JobBuilder::new();
        let name = builder.source_column("PERSONS", "NAME");
        let city = builder.source_column("ADDRESSES", "CITY");
        let max_rows = builder.add(NodeSpec::filter("filter.max-rows").input(name.clone()));
        let trim = builder.add(
            NodeSpec::transformer("transformer.trim")
                .input(name)
                .requires(max_rows, "VALID")
                .output("trimmed"),
        );
        let analyzer = builder.add(NodeSpec::analyzer("analyzer.string").input(builder.output_column(trim, 0)));
        builder.add(NodeSpec::analyzer("analyzer.string").input(city));

        let job = builder.build(&registry).unwrap();
        let lineage = job.lineage();

        assert_eq!(lineage.source_nodes(analyzer), &[max_rows, trim]);
        assert!(lineage.depends_on(analyzer, max_rows));
        assert_eq!(job.requirement_sources(analyzer), vec![trim]);
        assert_eq!(lineage.physical_columns(analyzer), &[SourceColumn::new("PERSONS", "NAME")]);
        assert_eq!(job.tables(), &["PERSONS".to_string(), "ADDRESSES".to_string()]);
        assert_eq!(job.nodes_for_table("PERSONS").len(), 3);
        assert_eq!(job.nodes_for_table("ADDRESSES").len(), 1);
        assert_eq!(
            job.source_columns_for_table("ADDRESSES"),
            vec![SourceColumn::new("ADDRESSES", "CITY")]
        );
    }
}
