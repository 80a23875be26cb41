//! Pushing filters down into the source query.
//!
//! A leading filter whose outcome every later consumer depends on does not
//! need to be evaluated row by row: the datastore can apply it instead. The
//! optimizer walks the sorted consumers, accepts such filters one by one and
//! stops at the first that cannot be pushed down.

use crate::component::{ComponentInstance, ComponentKind};
use crate::consumer::RowProcessingConsumer;
use crate::datastore::PerformanceCharacteristics;
use crate::job::{ColumnRef, Outcome, Requirement, SourceColumn};
use crate::query::Query;
use std::collections::HashSet;
use std::sync::Arc;

/// A filter accepted for push-down with the outcome it guarantees.
#[derive(Debug, Clone)]
struct OptimizedFilter {
    consumer: Arc<RowProcessingConsumer>,
    category: String,
}

/// Result of optimizing one table's consumers against its base query.
///
/// Computed once at construction; every accessor is pure.
#[derive(Debug)]
pub struct QueryOptimizer {
    base_query: Query,
    consumers: Vec<Arc<RowProcessingConsumer>>,
    optimized: Vec<OptimizedFilter>,
}

impl QueryOptimizer {
    /// `consumers` must be in processing order.
    pub fn new(
        characteristics: &PerformanceCharacteristics,
        consumers: &[Arc<RowProcessingConsumer>],
        base_query: Query,
    ) -> Self {
        let mut optimized: Vec<OptimizedFilter> = Vec::new();

        for (index, consumer) in consumers.iter().enumerate() {
            if consumer.kind() != ComponentKind::Filter {
                continue;
            }
            let Some(category) = optimizable_outcome(characteristics, consumers, index, &optimized) else {
                tracing::debug!(filter = %consumer.name(), "filter not optimizable, stopping");
                break;
            };
            tracing::debug!(filter = %consumer.name(), category = %category, "pushing filter into query");
            optimized.push(OptimizedFilter {
                consumer: Arc::clone(consumer),
                category,
            });
        }

        let optimizer = Self {
            base_query,
            consumers: consumers.to_vec(),
            optimized,
        };
        if optimizer.is_optimizable() {
            tracing::debug!(
                base = %optimizer.base_query,
                optimized = %optimizer.optimized_query(),
                "optimized query"
            );
        }
        optimizer
    }

    pub fn is_optimizable(&self) -> bool {
        !self.optimized.is_empty()
    }

    pub fn base_query(&self) -> &Query {
        &self.base_query
    }

    /// The base query with every accepted filter's rewrite applied in order.
    pub fn optimized_query(&self) -> Query {
        self.optimized.iter().fold(self.base_query.clone(), |query, filter| {
            filter.consumer.with_component(|component| match component {
                ComponentInstance::Filter(f) => match f.query_optimized() {
                    Some(capability) => {
                        capability.optimize_query(query, &physical_inputs(&filter.consumer), &filter.category)
                    }
                    None => query,
                },
                _ => query,
            })
        })
    }

    /// Consumers still to be evaluated row by row.
    pub fn optimized_consumers(&self) -> Vec<Arc<RowProcessingConsumer>> {
        let eliminated: HashSet<_> = self.optimized.iter().map(|f| f.consumer.id()).collect();
        self.consumers
            .iter()
            .filter(|c| !eliminated.contains(&c.id()))
            .cloned()
            .collect()
    }

    /// Filters replaced by the query.
    pub fn eliminated_consumers(&self) -> Vec<Arc<RowProcessingConsumer>> {
        self.optimized.iter().map(|f| Arc::clone(&f.consumer)).collect()
    }

    /// Outcomes every row of the optimized query satisfies.
    pub fn optimized_available_outcomes(&self) -> Vec<Outcome> {
        self.optimized
            .iter()
            .map(|f| Outcome::new(f.consumer.id(), f.category.clone()))
            .collect()
    }
}

fn physical_inputs(consumer: &RowProcessingConsumer) -> Vec<SourceColumn> {
    consumer
        .inputs()
        .iter()
        .filter_map(ColumnRef::as_source)
        .cloned()
        .collect()
}

/// The single outcome of the filter at `index` that can be pushed down.
fn optimizable_outcome(
    characteristics: &PerformanceCharacteristics,
    consumers: &[Arc<RowProcessingConsumer>],
    index: usize,
    optimized: &[OptimizedFilter],
) -> Option<String> {
    let consumer = &consumers[index];
    let descriptor = consumer.node().descriptor();

    if !descriptor.is_query_optimizable() || !consumer.has_physical_inputs_only() {
        return None;
    }
    if !characteristics.query_optimization_preferred && !descriptor.is_always_optimizable() {
        return None;
    }

    let guaranteed: Vec<Outcome> = optimized
        .iter()
        .map(|f| Outcome::new(f.consumer.id(), f.category.clone()))
        .collect();
    match consumer.requirement() {
        None if guaranteed.is_empty() => {}
        Some(Requirement::Outcome(o)) if guaranteed.contains(o) => {}
        _ => return None,
    }

    // Rows removed by the query would never reach an earlier analyzer.
    if consumers[..index].iter().any(|c| c.kind() == ComponentKind::Analyzer) {
        return None;
    }

    let candidates: Vec<String> = consumer.with_component(|component| {
        let ComponentInstance::Filter(filter) = component else {
            return Vec::new();
        };
        let Some(capability) = filter.query_optimized() else {
            return Vec::new();
        };
        descriptor
            .outcomes
            .iter()
            .filter(|category| capability.is_optimizable(category))
            .cloned()
            .collect()
    });

    let mut optimizable = candidates
        .into_iter()
        .filter(|category| all_later_depend_on(consumers, index, category));
    let category = optimizable.next()?;
    if optimizable.next().is_some() {
        return None;
    }
    Some(category)
}

/// Whether every consumer after `index` only runs for rows having `category`.
///
/// A later consumer qualifies by requiring the candidate outcome (or an
/// outcome of a filter that itself qualified) or by reading virtual columns
/// produced after the candidate. Outcomes of filters accepted earlier do not
/// count.
fn all_later_depend_on(consumers: &[Arc<RowProcessingConsumer>], index: usize, category: &str) -> bool {
    let filter = &consumers[index];
    let mut outcomes: HashSet<Outcome> = HashSet::new();
    outcomes.insert(Outcome::new(filter.id(), category));
    let mut columns: HashSet<ColumnRef> = HashSet::new();

    for consumer in &consumers[index + 1..] {
        let virtual_inputs: Vec<&ColumnRef> = consumer.inputs().iter().filter(|c| !c.is_physical()).collect();
        if !virtual_inputs.iter().all(|c| columns.contains(*c)) {
            return false;
        }
        match consumer.requirement() {
            Some(Requirement::Any) => return false,
            Some(Requirement::Outcome(o)) => {
                if !outcomes.contains(o) {
                    return false;
                }
            }
            None => {
                if virtual_inputs.is_empty() {
                    return false;
                }
            }
        }
        outcomes.extend(consumer.node().outcomes());
        columns.extend(consumer.node().output_columns());
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{
        Analyzer, AnalyzerResult, Component, ComponentDescriptor, ComponentError, Filter,
        QueryOptimization, QueryOptimizedFilter, Transformer,
    };
    use crate::consumer::sort_consumers;
    use crate::job::{JobBuilder, NodeId, NodeSpec};
    use crate::query::Predicate;
    use crate::registry::Registry;
    use crate::row::InputRow;
    use crate::value::Value;

    struct Limit(u64);
    impl Component for Limit {}
    impl Filter for Limit {
        fn categorize(&mut self, _: &InputRow, _: &[Value]) -> Result<String, ComponentError> {
            Ok("VALID".into())
        }
        fn query_optimized(&self) -> Option<&dyn QueryOptimizedFilter> {
            Some(self)
        }
    }
    impl QueryOptimizedFilter for Limit {
        fn is_optimizable(&self, category: &str) -> bool {
            category == "VALID"
        }
        fn optimize_query(&self, query: Query, _: &[SourceColumn], _: &str) -> Query {
            query.limit(self.0)
        }
    }

    struct NotNull;
    impl Component for NotNull {}
    impl Filter for NotNull {
        fn categorize(&mut self, _: &InputRow, values: &[Value]) -> Result<String, ComponentError> {
            Ok(if values.iter().any(Value::is_null) { "NULL" } else { "NOT_NULL" }.into())
        }
        fn query_optimized(&self) -> Option<&dyn QueryOptimizedFilter> {
            Some(self)
        }
    }
    impl QueryOptimizedFilter for NotNull {
        fn is_optimizable(&self, category: &str) -> bool {
            category == "NOT_NULL"
        }
        fn optimize_query(&self, query: Query, inputs: &[SourceColumn], _: &str) -> Query {
            inputs
                .iter()
                .fold(query, |q, c| q.and_where(c.clone(), Predicate::IsNotNull))
        }
    }

    struct Noop;
    impl Component for Noop {}
    impl Analyzer for Noop {
        fn run(&mut self, _: &InputRow, _: &[Value], _: u64) -> Result<(), ComponentError> {
            Ok(())
        }
        fn result(&mut self) -> AnalyzerResult {
            AnalyzerResult::new()
        }
    }
    impl Transformer for Noop {
        fn transform(&mut self, _: &InputRow, values: &[Value]) -> Result<Vec<Value>, ComponentError> {
            Ok(values.to_vec())
        }
    }

    fn make_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_filter(
            ComponentDescriptor::filter("filter.limit", ["VALID", "INVALID"])
                .query_optimization(QueryOptimization::Always),
            || Limit(1000),
        );
        registry.register_filter(
            ComponentDescriptor::filter("filter.not-null", ["NOT_NULL", "NULL"])
                .query_optimization(QueryOptimization::Supported),
            || NotNull,
        );
        registry.register_analyzer(ComponentDescriptor::analyzer("analyzer.noop"), || Noop);
        registry.register_transformer(ComponentDescriptor::transformer("transformer.noop"), || Noop);
        registry
    }

    fn col(name: &str) -> ColumnRef {
        ColumnRef::source("EMPLOYEES", name)
    }

    fn base_query() -> Query {
        Query::from("EMPLOYEES").select_all([
            SourceColumn::new("EMPLOYEES", "EMAIL"),
            SourceColumn::new("EMPLOYEES", "EMPLOYEENUMBER"),
        ])
    }

    fn optimize(builder: JobBuilder, characteristics: PerformanceCharacteristics) -> QueryOptimizer {
        let registry = make_registry();
        let job = builder.build(&registry).unwrap();
        let consumers = job
            .nodes()
            .iter()
            .map(|n| Arc::new(RowProcessingConsumer::new(n.clone(), registry.create(&n.descriptor().id).unwrap())))
            .collect();
        let sorted = sort_consumers("EMPLOYEES", consumers).unwrap();
        QueryOptimizer::new(&characteristics, &sorted, base_query())
    }

    fn limit_then(builder: &mut JobBuilder) -> NodeId {
        builder.add(NodeSpec::filter("filter.limit").input(col("EMAIL")))
    }

    #[test]
    fn test_limit_with_dependent_analyzer() {
        let mut builder = JobBuilder::new();
        let limit = limit_then(&mut builder);
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")).requires(limit, "VALID"));

        let optimizer = optimize(builder, PerformanceCharacteristics::default());
        assert!(optimizer.is_optimizable());
        assert_eq!(optimizer.optimized_query().max_rows(), Some(1000));
        assert_eq!(optimizer.optimized_consumers().len(), 1);
        assert_eq!(optimizer.eliminated_consumers()[0].id(), limit);
        assert_eq!(optimizer.optimized_available_outcomes(), vec![Outcome::new(limit, "VALID")]);
    }

    #[test]
    fn test_independent_analyzer_blocks() {
        let mut builder = JobBuilder::new();
        let limit = limit_then(&mut builder);
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")).requires(limit, "VALID"));
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")));

        let optimizer = optimize(builder, PerformanceCharacteristics::default());
        assert!(!optimizer.is_optimizable());
        assert_eq!(optimizer.optimized_query(), base_query());
        assert_eq!(optimizer.optimized_consumers().len(), 3);
    }

    #[test]
    fn test_chained_transformer() {
        let mut builder = JobBuilder::new();
        let limit = limit_then(&mut builder);
        let trans = builder.add(NodeSpec::transformer("transformer.noop").input(col("EMAIL")).output("out"));
        builder.add(
            NodeSpec::analyzer("analyzer.noop")
                .input(ColumnRef::output(trans, 0))
                .requires(limit, "VALID"),
        );
        assert!(!optimize(builder, PerformanceCharacteristics::default()).is_optimizable());

        let mut builder = JobBuilder::new();
        let limit = limit_then(&mut builder);
        let trans = builder.add(
            NodeSpec::transformer("transformer.noop")
                .input(col("EMAIL"))
                .requires(limit, "VALID")
                .output("out"),
        );
        builder.add(NodeSpec::analyzer("analyzer.noop").input(ColumnRef::output(trans, 0)));
        assert!(optimize(builder, PerformanceCharacteristics::default()).is_optimizable());
    }

    #[test]
    fn test_chained_filters() {
        let mut builder = JobBuilder::new();
        let limit = limit_then(&mut builder);
        let not_null = builder.add(
            NodeSpec::filter("filter.not-null")
                .input(col("EMAIL"))
                .input(col("EMPLOYEENUMBER"))
                .requires(limit, "VALID"),
        );
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")).requires(not_null, "NOT_NULL"));

        let optimizer = optimize(builder, PerformanceCharacteristics::default());
        assert_eq!(
            optimizer.optimized_query().to_sql(),
            "SELECT \"EMPLOYEES\".\"EMAIL\", \"EMPLOYEES\".\"EMPLOYEENUMBER\" FROM \"EMPLOYEES\" \
             WHERE \"EMPLOYEES\".\"EMAIL\" IS NOT NULL AND \"EMPLOYEES\".\"EMPLOYEENUMBER\" IS NOT NULL \
             LIMIT 1000"
        );
        assert_eq!(optimizer.optimized_consumers().len(), 1);
        assert_eq!(
            optimizer.optimized_available_outcomes(),
            vec![Outcome::new(limit, "VALID"), Outcome::new(not_null, "NOT_NULL")]
        );
    }

    #[test]
    fn test_earlier_outcome_does_not_carry_later_filter() {
        let mut builder = JobBuilder::new();
        let limit = limit_then(&mut builder);
        builder.add(
            NodeSpec::filter("filter.not-null")
                .input(col("EMAIL"))
                .requires(limit, "VALID"),
        );
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")).requires(limit, "VALID"));

        let optimizer = optimize(builder, PerformanceCharacteristics::default());
        assert_eq!(optimizer.optimized_available_outcomes(), vec![Outcome::new(limit, "VALID")]);
        assert!(optimizer.optimized_query().conditions().is_empty());
        assert_eq!(optimizer.optimized_consumers().len(), 2);
    }

    #[test]
    fn test_virtual_input_from_before_filter_blocks() {
        let mut builder = JobBuilder::new();
        let trans = builder.add(NodeSpec::transformer("transformer.noop").input(col("EMAIL")).output("out"));
        let limit = limit_then(&mut builder);
        builder.add(
            NodeSpec::analyzer("analyzer.noop")
                .input(ColumnRef::output(trans, 0))
                .requires(limit, "VALID"),
        );

        assert!(!optimize(builder, PerformanceCharacteristics::default()).is_optimizable());
    }

    #[test]
    fn test_reject_outcome_not_optimizable() {
        let mut builder = JobBuilder::new();
        let not_null = builder.add(NodeSpec::filter("filter.not-null").input(col("EMAIL")));
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")).requires(not_null, "NULL"));

        assert!(!optimize(builder, PerformanceCharacteristics::default()).is_optimizable());
    }

    #[test]
    fn test_non_preferred_datastore() {
        let not_preferred = PerformanceCharacteristics {
            query_optimization_preferred: false,
        };

        let mut builder = JobBuilder::new();
        let not_null = builder.add(NodeSpec::filter("filter.not-null").input(col("EMAIL")));
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")).requires(not_null, "NOT_NULL"));
        assert!(!optimize(builder, not_preferred).is_optimizable());

        let mut builder = JobBuilder::new();
        let limit = limit_then(&mut builder);
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")).requires(limit, "VALID"));
        assert!(optimize(builder, not_preferred).is_optimizable());
    }

    #[test]
    fn test_analyzer_before_filter_blocks() {
        let mut builder = JobBuilder::new();
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")));
        let limit = limit_then(&mut builder);
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")).requires(limit, "VALID"));

        assert!(!optimize(builder, PerformanceCharacteristics::default()).is_optimizable());
    }

    #[test]
    fn test_optimized_query_idempotent() {
        let mut builder = JobBuilder::new();
        let limit = limit_then(&mut builder);
        builder.add(NodeSpec::analyzer("analyzer.noop").input(col("EMAIL")).requires(limit, "VALID"));

        let optimizer = optimize(builder, PerformanceCharacteristics::default());
        assert_eq!(optimizer.optimized_query(), optimizer.optimized_query());
        assert_eq!(optimizer.base_query(), &base_query());
    }
}
