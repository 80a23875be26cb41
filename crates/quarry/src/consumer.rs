//! Row-processing consumers and per-row evaluation.
//!
//! Each node of a table becomes a [`RowProcessingConsumer`]. Consumers are
//! ordered so that every consumer comes after the producers of its inputs and
//! the filter its requirement references; [`ConsumeRowHandler`] then pushes
//! each row through them in that order.

use crate::component::{AnalyzerResult, ComponentError, ComponentInstance, ComponentKind};
use crate::job::{ColumnRef, ConfigurationError, Node, NodeId, Outcome, Requirement};
use crate::lifecycle::{DictionaryLease, LifecycleError, LifecycleManager};
use crate::row::InputRow;
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A component instance bound to its node for one run.
pub struct RowProcessingConsumer {
    node: Node,
    component: Mutex<ComponentInstance>,
    producers: Vec<NodeId>,
    leases: Mutex<Vec<DictionaryLease>>,
    initialized: AtomicBool,
}

impl RowProcessingConsumer {
    pub fn new(node: Node, component: ComponentInstance) -> Self {
        let producers = node.producers();
        Self {
            node,
            component: Mutex::new(component),
            producers,
            leases: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn kind(&self) -> ComponentKind {
        self.node.kind()
    }

    pub fn inputs(&self) -> &[ColumnRef] {
        self.node.inputs()
    }

    pub fn requirement(&self) -> Option<&Requirement> {
        self.node.requirement()
    }

    /// Nodes producing this consumer's virtual inputs.
    pub fn producers(&self) -> &[NodeId] {
        &self.producers
    }

    pub fn has_physical_inputs_only(&self) -> bool {
        self.inputs().iter().all(ColumnRef::is_physical)
    }

    /// Run `f` with exclusive access to the component.
    pub fn with_component<T>(&self, f: impl FnOnce(&mut ComponentInstance) -> T) -> T {
        f(&mut self.component.lock())
    }

    /// Assign properties, inject collaborators and initialize.
    pub fn initialize(&self, lifecycle: &LifecycleManager) -> Result<(), LifecycleError> {
        let mut component = self.component.lock();
        let leases = lifecycle.assign_configured(&self.node, &mut component)?;
        // Held from here on, so a failure below still releases them on close.
        self.leases.lock().extend(leases);
        lifecycle.assign_provided(&self.node, &mut component)?;
        lifecycle.initialize(&self.node, &mut component)?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Close the component if it was initialized, then release its
    /// reference-data leases. Idempotent.
    pub fn close(&self, lifecycle: &LifecycleManager, success: bool) {
        if self.initialized.swap(false, Ordering::AcqRel) {
            lifecycle.close(&self.node, &mut self.component.lock(), success);
        }
        self.leases.lock().clear();
    }

    /// Result of an analyzer; `None` for filters and transformers.
    pub fn result(&self) -> Option<AnalyzerResult> {
        match &mut *self.component.lock() {
            ComponentInstance::Analyzer(analyzer) => Some(analyzer.result()),
            _ => None,
        }
    }
}

impl fmt::Debug for RowProcessingConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowProcessingConsumer")
            .field("node", &self.node.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Order consumers so that dependencies come first.
///
/// Repeatedly takes the first consumer, in the given order, whose virtual
/// inputs and required outcome are already available.
pub fn sort_consumers(
    table: &str,
    consumers: Vec<Arc<RowProcessingConsumer>>,
) -> Result<Vec<Arc<RowProcessingConsumer>>, ConfigurationError> {
    let mut remaining = consumers;
    let mut placed: HashSet<NodeId> = HashSet::new();
    let mut sorted = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|consumer| {
            let inputs_ready = consumer.producers().iter().all(|p| placed.contains(p));
            let requirement_ready = match consumer.requirement() {
                Some(Requirement::Outcome(o)) => placed.contains(&o.filter),
                _ => true,
            };
            inputs_ready && requirement_ready
        });
        let Some(index) = ready else {
            return Err(ConfigurationError::UnorderableConsumers {
                table: table.to_string(),
                remaining: remaining.iter().map(|c| c.name().to_string()).collect(),
            });
        };
        let consumer = remaining.remove(index);
        placed.insert(consumer.id());
        sorted.push(consumer);
    }

    tracing::debug!(
        table = %table,
        order = ?sorted.iter().map(|c| c.name()).collect::<Vec<_>>(),
        "sorted consumers"
    );
    Ok(sorted)
}

/// A component failure while processing a row.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{name} failed on {row}: {source}")]
pub struct ConsumeRowError {
    pub node: NodeId,
    pub name: String,
    pub row: InputRow,
    #[source]
    pub source: ComponentError,
}

/// Outcome of pushing one row through the consumers.
#[derive(Debug, Clone)]
pub struct ConsumeRowResult {
    /// The row, including every transformer output produced for it.
    pub row: InputRow,
    /// Filter outcomes recorded for the row, always-satisfied ones included.
    pub outcomes: HashSet<Outcome>,
    /// Consumers evaluated for the row, in order.
    pub evaluated: Vec<NodeId>,
}

/// Evaluates rows against an ordered consumer list.
///
/// Can be used on its own to embed the engine's row semantics, e.g. to apply
/// a job's transformations to individual records.
pub struct ConsumeRowHandler {
    consumers: Vec<Arc<RowProcessingConsumer>>,
    always_satisfied: Vec<Outcome>,
    positions: HashMap<NodeId, usize>,
}

impl ConsumeRowHandler {
    /// `consumers` must already be sorted. `always_satisfied` seeds every
    /// row's outcomes (the outcomes guaranteed by the optimized query).
    pub fn new(consumers: Vec<Arc<RowProcessingConsumer>>, always_satisfied: Vec<Outcome>) -> Self {
        let positions = consumers
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id(), i))
            .collect();
        Self {
            consumers,
            always_satisfied,
            positions,
        }
    }

    pub fn consumers(&self) -> &[Arc<RowProcessingConsumer>] {
        &self.consumers
    }

    pub fn consume_row(&self, row: InputRow) -> Result<ConsumeRowResult, ConsumeRowError> {
        let mut row = row;
        let mut outcomes: HashSet<Outcome> = self.always_satisfied.iter().cloned().collect();
        let mut evaluated: Vec<NodeId> = Vec::new();
        let mut active: HashSet<NodeId> = HashSet::new();

        for (index, consumer) in self.consumers.iter().enumerate() {
            if !is_satisfied(consumer, &outcomes, &active) {
                if !self.any_may_run(index + 1, &outcomes, &active) {
                    break;
                }
                continue;
            }

            let values: Vec<Value> = consumer.inputs().iter().map(|c| row.get(c).clone()).collect();
            let fail = |source| ConsumeRowError {
                node: consumer.id(),
                name: consumer.name().to_string(),
                row: row.clone(),
                source,
            };

            let produced = consumer.with_component(|component| -> Result<Option<Vec<Value>>, ComponentError> {
                match component {
                    ComponentInstance::Filter(filter) => {
                        let category = filter.categorize(&row, &values)?;
                        if !consumer.node().descriptor().has_outcome(&category) {
                            return Err(ComponentError::UndeclaredOutcome(category));
                        }
                        outcomes.insert(Outcome::new(consumer.id(), category));
                        Ok(None)
                    }
                    ComponentInstance::Transformer(transformer) => {
                        transformer.transform(&row, &values).map(Some)
                    }
                    ComponentInstance::Analyzer(analyzer) => {
                        analyzer.run(&row, &values, 1)?;
                        Ok(None)
                    }
                }
            });
            let produced = produced.map_err(fail)?;

            if let Some(outputs) = produced {
                let columns = consumer.node().output_columns();
                for (column, value) in columns.into_iter().zip(outputs) {
                    row.insert(column, value);
                }
            }
            active.insert(consumer.id());
            evaluated.push(consumer.id());
        }

        Ok(ConsumeRowResult {
            row,
            outcomes,
            evaluated,
        })
    }

    /// Whether any consumer from `start` on could still be evaluated.
    fn any_may_run(&self, start: usize, outcomes: &HashSet<Outcome>, active: &HashSet<NodeId>) -> bool {
        let undecided = |node: &NodeId| self.positions.get(node).is_some_and(|&p| p >= start);
        self.consumers.iter().skip(start).any(|consumer| match consumer.requirement() {
            Some(Requirement::Any) => true,
            Some(Requirement::Outcome(o)) => undecided(&o.filter) || outcomes.contains(o),
            None => {
                consumer.producers().is_empty()
                    || consumer
                        .producers()
                        .iter()
                        .any(|p| undecided(p) || active.contains(p))
            }
        })
    }
}

impl fmt::Debug for ConsumeRowHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeRowHandler")
            .field("consumers", &self.consumers)
            .field("always_satisfied", &self.always_satisfied)
            .finish()
    }
}

/// Requirement check for one consumer on the current row.
///
/// Without an explicit requirement, a consumer of virtual columns runs only
/// if at least one of their producers ran for the row.
fn is_satisfied(
    consumer: &RowProcessingConsumer,
    outcomes: &HashSet<Outcome>,
    active: &HashSet<NodeId>,
) -> bool {
    match consumer.requirement() {
        Some(Requirement::Any) => true,
        Some(Requirement::Outcome(o)) => outcomes.contains(o),
        None => {
            consumer.producers().is_empty() || consumer.producers().iter().any(|p| active.contains(p))
        }
    }
}
