//! Component lifecycle: property assignment, initialize and close.

use crate::annotation::RowAnnotationFactory;
use crate::component::{ComponentError, ComponentInstance, PropertyKind, Provided, ProvidedKind};
use crate::job::Node;
use crate::lease::Lease;
use crate::reference::{Dictionary, ReferenceDataActivationManager, ReferenceDataCatalog};
use std::fmt;
use std::sync::Arc;

/// Lease on a dictionary held by one node until it closes.
pub type DictionaryLease = Lease<Arc<dyn Dictionary>>;

/// Shared state of one run, handed to every component.
pub struct RunContext {
    annotation_factory: Arc<dyn RowAnnotationFactory>,
    reference_data: ReferenceDataActivationManager,
}

impl RunContext {
    pub fn new(
        annotation_factory: Arc<dyn RowAnnotationFactory>,
        reference_data: Arc<ReferenceDataCatalog>,
    ) -> Self {
        Self {
            annotation_factory,
            reference_data: ReferenceDataActivationManager::new(reference_data),
        }
    }

    pub fn annotation_factory(&self) -> &Arc<dyn RowAnnotationFactory> {
        &self.annotation_factory
    }

    pub fn reference_data(&self) -> &ReferenceDataActivationManager {
        &self.reference_data
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("reference_data", &self.reference_data)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("{node}: cannot assign property {property}: {source}")]
    Assign {
        node: String,
        property: String,
        #[source]
        source: ComponentError,
    },

    #[error("{node}: initialization failed: {source}")]
    Initialize {
        node: String,
        #[source]
        source: ComponentError,
    },
}

/// Drives the hooks of one run's components.
#[derive(Debug, Clone)]
pub struct LifecycleManager {
    ctx: Arc<RunContext>,
}

impl LifecycleManager {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Assign every configured property of `node`.
    ///
    /// Dictionary-valued properties are activated through the run's reference
    /// data; the returned leases must be held until the component closes.
    pub fn assign_configured(
        &self,
        node: &Node,
        component: &mut ComponentInstance,
    ) -> Result<Vec<DictionaryLease>, LifecycleError> {
        let assign_err = |property: &str, source| LifecycleError::Assign {
            node: node.name().to_string(),
            property: property.to_string(),
            source,
        };

        let mut leases = Vec::new();
        for binding in node.bindings() {
            match binding.kind {
                PropertyKind::Dictionary => {
                    let name = binding.value.as_str().unwrap_or_default();
                    let lease = self
                        .ctx
                        .reference_data()
                        .activate(name)
                        .map_err(|e| assign_err(&binding.name, e))?;
                    component
                        .provide(&binding.name, Provided::Dictionary(Arc::clone(lease.resource())))
                        .map_err(|e| assign_err(&binding.name, e))?;
                    leases.push(lease);
                }
                _ => component
                    .configure(&binding.name, &binding.value)
                    .map_err(|e| assign_err(&binding.name, e))?,
            }
        }
        Ok(leases)
    }

    /// Inject the collaborators the node's descriptor asks for.
    pub fn assign_provided(&self, node: &Node, component: &mut ComponentInstance) -> Result<(), LifecycleError> {
        for provided in &node.descriptor().provided {
            let resource = match provided.kind {
                ProvidedKind::AnnotationFactory => {
                    Provided::AnnotationFactory(Arc::clone(self.ctx.annotation_factory()))
                }
            };
            component
                .provide(&provided.name, resource)
                .map_err(|source| LifecycleError::Assign {
                    node: node.name().to_string(),
                    property: provided.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn initialize(&self, node: &Node, component: &mut ComponentInstance) -> Result<(), LifecycleError> {
        tracing::debug!(node = %node.name(), "initializing component");
        component
            .initialize(&self.ctx)
            .map_err(|source| LifecycleError::Initialize {
                node: node.name().to_string(),
                source,
            })
    }

    /// Close a component. Failures are logged, never propagated.
    pub fn close(&self, node: &Node, component: &mut ComponentInstance, success: bool) {
        tracing::debug!(node = %node.name(), success, "closing component");
        if let Err(e) = component.close(success) {
            tracing::warn!(node = %node.name(), error = %e, "failed to close component");
        }
    }
}
