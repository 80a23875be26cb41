//! Row annotations: exact counts plus bounded samples of "interesting" rows.
//!
//! Components create a [`RowAnnotation`] per category they track and annotate
//! rows under it. The count on the handle is always exact; the factory keeps
//! only a bounded sample of the rows themselves:
//!
//! - at most `max_sample_records` rows per annotation;
//! - at most `max_sample_sets` annotations with samples at all. Annotations
//!   created beyond that still count rows but never retain any.

use crate::row::InputRow;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ANNOTATION_ID: AtomicU64 = AtomicU64::new(1);

struct AnnotationInner {
    id: u64,
    row_count: AtomicU64,
}

/// Handle to a set of annotated rows. Compared by identity.
#[derive(Clone)]
pub struct RowAnnotation {
    inner: Arc<AnnotationInner>,
}

impl RowAnnotation {
    fn new() -> Self {
        Self {
            inner: Arc::new(AnnotationInner {
                id: NEXT_ANNOTATION_ID.fetch_add(1, Ordering::Relaxed),
                row_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Exact number of rows annotated, regardless of retained samples.
    pub fn row_count(&self) -> u64 {
        self.inner.row_count.load(Ordering::Acquire)
    }

    fn add(&self, count: u64) {
        self.inner.row_count.fetch_add(count, Ordering::AcqRel);
    }

    fn take(&self) -> u64 {
        self.inner.row_count.swap(0, Ordering::AcqRel)
    }
}

impl PartialEq for RowAnnotation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RowAnnotation {}

impl Hash for RowAnnotation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for RowAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowAnnotation")
            .field("id", &self.id())
            .field("row_count", &self.row_count())
            .finish()
    }
}

/// Creates annotations and stores their sampled rows.
///
/// All methods may be called concurrently, also for the same annotation.
pub trait RowAnnotationFactory: Send + Sync {
    fn create_annotation(&self) -> RowAnnotation;

    fn annotate(&self, row: &InputRow, annotation: &RowAnnotation) {
        self.annotate_distinct(row, 1, annotation);
    }

    /// Annotate a row standing for `distinct_count` logical records.
    fn annotate_distinct(&self, row: &InputRow, distinct_count: u64, annotation: &RowAnnotation);

    fn annotate_rows(&self, rows: &[InputRow], annotation: &RowAnnotation) {
        for row in rows {
            self.annotate(row, annotation);
        }
    }

    /// Retained sample, possibly smaller than the annotation's count.
    fn sample_rows(&self, annotation: &RowAnnotation) -> Vec<InputRow>;

    fn has_sample_rows(&self, annotation: &RowAnnotation) -> bool {
        !self.sample_rows(annotation).is_empty()
    }

    /// Move count and samples from `from` into `to`, leaving `from` empty.
    fn transfer_annotations(&self, from: &RowAnnotation, to: &RowAnnotation);

    /// Clear count and samples.
    fn reset(&self, annotation: &RowAnnotation);
}

#[derive(Default)]
struct SampleSet {
    rows: Vec<InputRow>,
    ids: HashSet<u64>,
}

impl SampleSet {
    fn push(&mut self, row: &InputRow, cap: usize) {
        if self.rows.len() < cap && self.ids.insert(row.id()) {
            self.rows.push(row.clone());
        }
    }
}

/// In-memory annotation store with both sample bounds.
pub struct InMemoryRowAnnotationFactory {
    max_sample_sets: usize,
    max_sample_records: usize,
    sets: RwLock<HashMap<u64, Arc<Mutex<SampleSet>>>>,
}

impl InMemoryRowAnnotationFactory {
    pub const DEFAULT_MAX_SAMPLE_SETS: usize = 1000;
    pub const DEFAULT_MAX_SAMPLE_RECORDS: usize = 100;

    pub fn new(max_sample_sets: usize, max_sample_records: usize) -> Self {
        Self {
            max_sample_sets,
            max_sample_records,
            sets: RwLock::new(HashMap::new()),
        }
    }

    pub fn max_sample_sets(&self) -> usize {
        self.max_sample_sets
    }

    pub fn max_sample_records(&self) -> usize {
        self.max_sample_records
    }

    /// Number of annotations currently retaining samples.
    pub fn tracked_sets(&self) -> usize {
        self.sets.read().len()
    }

    fn existing_set(&self, annotation: &RowAnnotation) -> Option<Arc<Mutex<SampleSet>>> {
        self.sets.read().get(&annotation.id()).cloned()
    }

    /// Sample set for an annotation, created while under the set bound.
    fn sample_set(
        &self,
        sets: &mut HashMap<u64, Arc<Mutex<SampleSet>>>,
        annotation: &RowAnnotation,
    ) -> Option<Arc<Mutex<SampleSet>>> {
        if let Some(set) = sets.get(&annotation.id()) {
            return Some(Arc::clone(set));
        }
        if self.max_sample_records == 0 || sets.len() >= self.max_sample_sets {
            return None;
        }
        let set = Arc::new(Mutex::new(SampleSet::default()));
        sets.insert(annotation.id(), Arc::clone(&set));
        Some(set)
    }
}

impl Default for InMemoryRowAnnotationFactory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_SAMPLE_SETS, Self::DEFAULT_MAX_SAMPLE_RECORDS)
    }
}

impl fmt::Debug for InMemoryRowAnnotationFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRowAnnotationFactory")
            .field("max_sample_sets", &self.max_sample_sets)
            .field("max_sample_records", &self.max_sample_records)
            .field("tracked_sets", &self.tracked_sets())
            .finish()
    }
}

impl RowAnnotationFactory for InMemoryRowAnnotationFactory {
    fn create_annotation(&self) -> RowAnnotation {
        RowAnnotation::new()
    }

    // Counts and samples change under the set map's lock, so a transfer or
    // reset never interleaves with an annotate of the same annotation.
    fn annotate_distinct(&self, row: &InputRow, distinct_count: u64, annotation: &RowAnnotation) {
        {
            let sets = self.sets.read();
            if let Some(set) = sets.get(&annotation.id()) {
                annotation.add(distinct_count);
                set.lock().push(row, self.max_sample_records);
                return;
            }
        }
        let mut sets = self.sets.write();
        annotation.add(distinct_count);
        if let Some(set) = self.sample_set(&mut sets, annotation) {
            set.lock().push(row, self.max_sample_records);
        }
    }

    fn sample_rows(&self, annotation: &RowAnnotation) -> Vec<InputRow> {
        self.existing_set(annotation)
            .map(|set| set.lock().rows.clone())
            .unwrap_or_default()
    }

    fn transfer_annotations(&self, from: &RowAnnotation, to: &RowAnnotation) {
        if from == to {
            return;
        }
        let mut sets = self.sets.write();
        to.add(from.take());

        let Some(moved) = sets.remove(&from.id()) else {
            return;
        };
        let rows = std::mem::take(&mut moved.lock().rows);
        if let Some(target) = self.sample_set(&mut sets, to) {
            let mut target = target.lock();
            for row in &rows {
                target.push(row, self.max_sample_records);
            }
        }
    }

    fn reset(&self, annotation: &RowAnnotation) {
        let mut sets = self.sets.write();
        annotation.take();
        sets.remove(&annotation.id());
    }
}
