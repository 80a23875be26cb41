//! Datastore interface and an in-memory implementation.

use crate::lease::{ConnectionLease, Lease};
use crate::query::Query;
use crate::value::Value;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Errors from opening connections or executing queries.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DatastoreError {
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// Hints the optimizer takes from the datastore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformanceCharacteristics {
    /// Whether pushing filters into the query beats filtering row by row.
    pub query_optimization_preferred: bool,
}

impl Default for PerformanceCharacteristics {
    fn default() -> Self {
        Self {
            query_optimization_preferred: true,
        }
    }
}

/// Rows of a query result, values in select order.
pub type RowStream = Box<dyn Iterator<Item = Result<Vec<Value>, DatastoreError>> + Send>;

pub trait Datastore: Send + Sync {
    fn name(&self) -> &str;

    /// Physically open a connection.
    fn connect(&self) -> Result<Arc<dyn DatastoreConnection>, DatastoreError>;

    fn performance_characteristics(&self) -> PerformanceCharacteristics {
        PerformanceCharacteristics::default()
    }
}

pub trait DatastoreConnection: Send + Sync {
    fn execute_query(&self, query: &Query) -> Result<RowStream, DatastoreError>;

    fn close(&self) -> Result<(), DatastoreError> {
        Ok(())
    }
}

/// A datastore whose connection is shared through a [`ConnectionLease`].
///
/// Publishers of several tables open their connections through the same
/// lease: one physical connection serves them all and is closed when the
/// last publisher finishes.
pub struct LeasedDatastore {
    datastore: Arc<dyn Datastore>,
    lease: Arc<ConnectionLease<Arc<dyn DatastoreConnection>>>,
}

impl LeasedDatastore {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        let name = datastore.name().to_string();
        let lease = ConnectionLease::new(move |connection: Arc<dyn DatastoreConnection>| {
            tracing::debug!(datastore = %name, "closing connection");
            if let Err(e) = connection.close() {
                tracing::warn!(datastore = %name, error = %e, "failed to close connection");
            }
        });
        Self {
            datastore,
            lease: Arc::new(lease),
        }
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.datastore
    }

    pub fn open_connection(&self) -> Result<Lease<Arc<dyn DatastoreConnection>>, DatastoreError> {
        self.lease.acquire(|| {
            tracing::debug!(datastore = %self.datastore.name(), "opening connection");
            self.datastore.connect()
        })
    }

    pub fn performance_characteristics(&self) -> PerformanceCharacteristics {
        self.datastore.performance_characteristics()
    }

    pub fn lease(&self) -> &ConnectionLease<Arc<dyn DatastoreConnection>> {
        &self.lease
    }
}

impl fmt::Debug for LeasedDatastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeasedDatastore")
            .field("datastore", &self.datastore.name())
            .field("lease", &self.lease)
            .finish()
    }
}

/// An in-memory table.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl MemoryTable {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row; missing trailing values are null.
    pub fn row<V: Into<Value>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        let mut row: Vec<Value> = values.into_iter().map(Into::into).collect();
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

#[derive(Default)]
struct Activity {
    connects: AtomicUsize,
    closes: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

/// Datastore over in-memory tables, honouring conditions, window and
/// projection of every query it executes.
#[derive(Clone)]
pub struct MemoryDatastore {
    name: String,
    tables: Arc<IndexMap<String, MemoryTable>>,
    characteristics: PerformanceCharacteristics,
    activity: Arc<Activity>,
}

impl MemoryDatastore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Arc::new(IndexMap::new()),
            characteristics: PerformanceCharacteristics::default(),
            activity: Arc::new(Activity::default()),
        }
    }

    pub fn table(mut self, name: impl Into<String>, table: MemoryTable) -> Self {
        Arc::make_mut(&mut self.tables).insert(name.into(), table);
        self
    }

    pub fn query_optimization_preferred(mut self, preferred: bool) -> Self {
        self.characteristics.query_optimization_preferred = preferred;
        self
    }

    /// Text of every query executed so far, in order.
    pub fn executed_queries(&self) -> Vec<String> {
        self.activity.queries.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.activity.connects.load(Ordering::Acquire)
    }

    pub fn close_count(&self) -> usize {
        self.activity.closes.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MemoryDatastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDatastore")
            .field("name", &self.name)
            .field("tables", &self.tables.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Datastore for MemoryDatastore {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<Arc<dyn DatastoreConnection>, DatastoreError> {
        self.activity.connects.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemoryConnection {
            tables: Arc::clone(&self.tables),
            activity: Arc::clone(&self.activity),
        }))
    }

    fn performance_characteristics(&self) -> PerformanceCharacteristics {
        self.characteristics
    }
}

struct MemoryConnection {
    tables: Arc<IndexMap<String, MemoryTable>>,
    activity: Arc<Activity>,
}

impl DatastoreConnection for MemoryConnection {
    fn execute_query(&self, query: &Query) -> Result<RowStream, DatastoreError> {
        let table = self
            .tables
            .get(query.table())
            .ok_or_else(|| DatastoreError::UnknownTable(query.table().to_string()))?;

        let index_of = |name: &str| {
            table
                .column_index(name)
                .ok_or_else(|| DatastoreError::UnknownColumn {
                    table: query.table().to_string(),
                    column: name.to_string(),
                })
        };
        let projection = query
            .select_items()
            .iter()
            .map(|c| index_of(&c.name))
            .collect::<Result<Vec<_>, _>>()?;
        for condition in query.conditions() {
            index_of(&condition.column.name)?;
        }

        self.activity.queries.lock().push(query.to_sql());

        let rows: Vec<Vec<Value>> = table
            .rows
            .iter()
            .filter(|row| {
                query.matches(|column| {
                    table.column_index(&column.name).and_then(|i| row.get(i))
                })
            })
            .skip(usize::try_from(query.offset()).unwrap_or(usize::MAX))
            .take(query.max_rows().map_or(usize::MAX, |m| usize::try_from(m).unwrap_or(usize::MAX)))
            .map(|row| projection.iter().map(|&i| row[i].clone()).collect())
            .collect();

        Ok(Box::new(rows.into_iter().map(Ok::<_, DatastoreError>)))
    }

    fn close(&self) -> Result<(), DatastoreError> {
        self.activity.closes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
