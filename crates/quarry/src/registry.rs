//! Registry for component types.

use crate::component::{
    Analyzer, ComponentDescriptor, ComponentInstance, ComponentKind, Filter, Transformer,
};
use indexmap::IndexMap;
use std::sync::Arc;

/// Creates a fresh component instance for one run.
pub type ComponentFactory = Arc<dyn Fn() -> ComponentInstance + Send + Sync>;

/// Registry of available component types.
///
/// Holds descriptors indexed by id, and the factories that instantiate them.
/// Jobs are validated against the descriptors; runs create one instance per
/// node through the factories.
#[derive(Clone)]
pub struct Registry {
    /// Component descriptors indexed by ID.
    descriptors: IndexMap<String, Arc<ComponentDescriptor>>,
    /// Component factories indexed by ID.
    factories: IndexMap<String, ComponentFactory>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            descriptors: IndexMap::new(),
            factories: IndexMap::new(),
        }
    }

    /// Register a descriptor without a factory.
    ///
    /// Enough for building and validating jobs; running them needs a factory.
    pub fn register_decl(&mut self, descriptor: ComponentDescriptor) {
        self.descriptors
            .insert(descriptor.id.clone(), Arc::new(descriptor));
    }

    /// Register a component type with its factory.
    pub fn register(
        &mut self,
        descriptor: ComponentDescriptor,
        factory: impl Fn() -> ComponentInstance + Send + Sync + 'static,
    ) {
        let id = descriptor.id.clone();
        self.descriptors.insert(id.clone(), Arc::new(descriptor));
        self.factories.insert(id, Arc::new(factory));
    }

    pub fn register_filter<F: Filter + 'static>(
        &mut self,
        descriptor: ComponentDescriptor,
        factory: impl Fn() -> F + Send + Sync + 'static,
    ) {
        self.register(descriptor, move || ComponentInstance::filter(factory()));
    }

    pub fn register_transformer<T: Transformer + 'static>(
        &mut self,
        descriptor: ComponentDescriptor,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) {
        self.register(descriptor, move || ComponentInstance::transformer(factory()));
    }

    pub fn register_analyzer<A: Analyzer + 'static>(
        &mut self,
        descriptor: ComponentDescriptor,
        factory: impl Fn() -> A + Send + Sync + 'static,
    ) {
        self.register(descriptor, move || ComponentInstance::analyzer(factory()));
    }

    /// Get a component descriptor by ID.
    pub fn get_decl(&self, id: &str) -> Option<&Arc<ComponentDescriptor>> {
        self.descriptors.get(id)
    }

    /// Instantiate a component by ID.
    pub fn create(&self, id: &str) -> Option<ComponentInstance> {
        self.factories.get(id).map(|factory| factory())
    }

    /// Iterate over all descriptors.
    pub fn descriptors(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.descriptors.values().map(|d| d.as_ref())
    }

    /// Descriptors of one kind, in registration order.
    pub fn descriptors_of(&self, kind: ComponentKind) -> impl Iterator<Item = &ComponentDescriptor> {
        self.descriptors().filter(move |d| d.kind == kind)
    }

    /// Number of registered component types.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
