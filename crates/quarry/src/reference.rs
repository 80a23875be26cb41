//! Reference data shared between components of a run.

use crate::component::ComponentError;
use crate::lease::{ConnectionLease, Lease};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A named set of reference values.
///
/// `initialize` and `close` bracket each activation within a run; the
/// activation manager guarantees they are called once per run, however many
/// nodes reference the dictionary.
pub trait Dictionary: Send + Sync {
    fn name(&self) -> &str;

    fn contains(&self, value: &str) -> bool;

    fn initialize(&self) -> Result<(), ComponentError> {
        Ok(())
    }

    fn close(&self) -> Result<(), ComponentError> {
        Ok(())
    }
}

/// In-memory dictionary that counts its activations.
#[derive(Debug)]
pub struct SimpleDictionary {
    name: String,
    values: HashSet<String>,
    case_sensitive: bool,
    initialized: AtomicUsize,
    closed: AtomicUsize,
}

impl SimpleDictionary {
    pub fn new<S: Into<String>>(name: impl Into<String>, values: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
            case_sensitive: true,
            initialized: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self.values = self.values.iter().map(|v| v.to_lowercase()).collect();
        self
    }

    pub fn initialize_count(&self) -> usize {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }
}

impl Dictionary for SimpleDictionary {
    fn name(&self) -> &str {
        &self.name
    }

    fn contains(&self, value: &str) -> bool {
        if self.case_sensitive {
            self.values.contains(value)
        } else {
            self.values.contains(&value.to_lowercase())
        }
    }

    fn initialize(&self) -> Result<(), ComponentError> {
        self.initialized.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn close(&self) -> Result<(), ComponentError> {
        self.closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Dictionaries available to jobs, by name.
#[derive(Clone, Default)]
pub struct ReferenceDataCatalog {
    dictionaries: IndexMap<String, Arc<dyn Dictionary>>,
}

impl ReferenceDataCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dictionary(mut self, dictionary: Arc<dyn Dictionary>) -> Self {
        self.add(dictionary);
        self
    }

    pub fn add(&mut self, dictionary: Arc<dyn Dictionary>) {
        self.dictionaries
            .insert(dictionary.name().to_string(), dictionary);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Dictionary>> {
        self.dictionaries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.dictionaries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dictionaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dictionaries.is_empty()
    }
}

impl fmt::Debug for ReferenceDataCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.dictionaries.keys()).finish()
    }
}

type DictionaryLease = ConnectionLease<Arc<dyn Dictionary>>;

/// Run-scoped activation of reference data.
///
/// Every node referencing a dictionary takes a lease; the dictionary is
/// initialized on the first lease and closed when the last one is dropped.
pub struct ReferenceDataActivationManager {
    catalog: Arc<ReferenceDataCatalog>,
    leases: Mutex<HashMap<String, Arc<DictionaryLease>>>,
}

impl ReferenceDataActivationManager {
    pub fn new(catalog: Arc<ReferenceDataCatalog>) -> Self {
        Self {
            catalog,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &ReferenceDataCatalog {
        &self.catalog
    }

    /// Lease a dictionary by name, initializing it if this is the first lease.
    pub fn activate(&self, name: &str) -> Result<Lease<Arc<dyn Dictionary>>, ComponentError> {
        let dictionary = self
            .catalog
            .get(name)
            .cloned()
            .ok_or_else(|| ComponentError::UnknownReference(name.to_string()))?;

        let lease = Arc::clone(
            self.leases
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ConnectionLease::new(close_dictionary))),
        );

        lease.acquire(|| {
            tracing::debug!(dictionary = %name, "initializing reference data");
            dictionary.initialize()?;
            Ok(dictionary)
        })
    }

    /// Number of nodes currently holding a lease on `name`.
    pub fn active_count(&self, name: &str) -> usize {
        self.leases.lock().get(name).map_or(0, |lease| lease.count())
    }
}

impl fmt::Debug for ReferenceDataActivationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceDataActivationManager")
            .field("catalog", &self.catalog)
            .finish()
    }
}

fn close_dictionary(dictionary: Arc<dyn Dictionary>) {
    tracing::debug!(dictionary = %dictionary.name(), "closing reference data");
    if let Err(e) = dictionary.close() {
        tracing::warn!(dictionary = %dictionary.name(), error = %e, "failed to close reference data");
    }
}
