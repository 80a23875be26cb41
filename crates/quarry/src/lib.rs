//! Quarry: row-processing engine for data profiling and cleansing
//!
//! A [`Job`] wires filters, transformers and analyzers to the columns of a
//! datastore. Running it streams every source table once through its
//! components, pushing leading filters into the source query where that
//! preserves what each analyzer sees.

mod annotation;
mod component;
mod config;
mod consumer;
mod datastore;
mod job;
mod lease;
mod lifecycle;
mod listener;
mod optimizer;
mod publisher;
mod query;
mod reference;
mod registry;
mod row;
mod runner;
mod task;
mod value;

pub use annotation::{InMemoryRowAnnotationFactory, RowAnnotation, RowAnnotationFactory};
pub use component::{
    AnalyzerResult, Analyzer, AnnotatedRows, Component, ComponentDescriptor, ComponentError,
    ComponentInstance, ComponentKind, Filter, PropertyDescriptor, PropertyKind, Provided,
    ProvidedDescriptor, ProvidedKind, QueryOptimization, QueryOptimizedFilter, Transformer,
};
pub use config::{AnnotationConfig, ConfigError, EngineConfig, OptimizerConfig, RunnerConfig};
pub use consumer::{
    ConsumeRowError, ConsumeRowHandler, ConsumeRowResult, RowProcessingConsumer, sort_consumers,
};
pub use datastore::{
    Datastore, DatastoreConnection, DatastoreError, LeasedDatastore, MemoryDatastore, MemoryTable,
    PerformanceCharacteristics, RowStream,
};
pub use job::{
    ColumnRef, ConfigurationError, Job, JobBuilder, Lineage, Node, NodeId, NodeSpec, Outcome,
    PropertyBinding, Requirement, SourceColumn,
};
pub use lease::{ConnectionLease, Lease};
pub use lifecycle::{DictionaryLease, LifecycleError, LifecycleManager, RunContext};
pub use listener::{
    AnalysisListener, CompositeAnalysisListener, NoopAnalysisListener, TracingAnalysisListener,
};
pub use optimizer::QueryOptimizer;
pub use publisher::{
    ComponentResult, JobError, PublishContext, PublisherState, RowProcessingPublisher,
    RowProcessingPublishers,
};
pub use query::{Condition, Predicate, Query};
pub use reference::{Dictionary, ReferenceDataActivationManager, ReferenceDataCatalog, SimpleDictionary};
pub use registry::{ComponentFactory, Registry};
pub use row::InputRow;
pub use runner::{AnalysisResultFuture, AnalysisRunner, RunError};
#[cfg(feature = "parallel")]
pub use task::MultiThreadedTaskRunner;
pub use task::{JoinTaskListener, SingleThreadedTaskRunner, Task, TaskListener, TaskRunner, run_task};
pub use value::{Properties, PropertiesExt, Value};
