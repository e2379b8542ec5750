use crate::error::{WeError, WeResult};
use crate::iteration::IterationSummary;
use crate::segment::{Segment, SegmentRef, SegmentStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// A flat, shape-tagged numeric array for the auxiliary dataset namespace
/// (spec.md §4.5 `put_auxiliary`/`get_auxiliary`), used by the
/// `ReweightingDriver` to stash rate/population estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuxArray {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl AuxArray {
    pub fn vector(data: Vec<f64>) -> Self {
        let len = data.len();
        AuxArray { shape: vec![len], data }
    }

    pub fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        assert_eq!(data.len(), rows * cols);
        AuxArray { shape: vec![rows, cols], data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFilter {
    All,
    Status(SegmentStatus),
    Incomplete,
}

impl SegmentFilter {
    fn matches(self, seg: &Segment) -> bool {
        match self {
            SegmentFilter::All => true,
            SegmentFilter::Status(s) => seg.status == s,
            SegmentFilter::Incomplete => !matches!(seg.status, SegmentStatus::Complete),
        }
    }
}

/// Per-iteration write serialization and cross-iteration persistence
/// (spec.md §4.5). The real backend (a key/value + hierarchical dataset
/// service) is out of scope; this is the façade contract plus a reference
/// in-memory implementation used for tests and restart scenarios (S6).
///
/// `lock`/`flushing_lock` are modeled as scoped closures rather than RAII
/// guards so the trait stays object-safe without generic associated types
/// — the caller's critical section is the closure body, released
/// unconditionally (even on early return) when the closure returns.
pub trait DataStore {
    fn get_current_iteration(&self) -> WeResult<u64>;
    fn set_current_iteration(&self, n_iter: u64) -> WeResult<()>;

    fn begin(&self) -> WeResult<()>;
    fn commit(&self) -> WeResult<()>;
    fn rollback(&self) -> WeResult<()>;

    fn insert_segments(&self, n_iter: u64, segments: Vec<Segment>) -> WeResult<()>;
    fn update_segments(&self, n_iter: u64, segments: Vec<Segment>) -> WeResult<()>;
    fn query_segments(&self, n_iter: u64, filter: SegmentFilter) -> WeResult<Vec<Segment>>;

    fn insert_iteration_summary(&self, summary: IterationSummary) -> WeResult<()>;
    fn update_iteration_summary(&self, summary: IterationSummary) -> WeResult<()>;
    fn get_iteration_summary(&self, n_iter: u64) -> WeResult<Option<IterationSummary>>;

    fn put_auxiliary(&self, n_iter: u64, group: &str, name: &str, array: AuxArray) -> WeResult<()>;
    fn get_auxiliary(&self, n_iter: u64, group: &str, name: &str) -> WeResult<Option<AuxArray>>;

    fn lock(&self, f: &mut dyn FnMut() -> WeResult<()>) -> WeResult<()>;
    fn flushing_lock(&self, f: &mut dyn FnMut() -> WeResult<()>) -> WeResult<()>;
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    current_iteration: u64,
    segments: BTreeMap<SegmentRef, Segment>,
    summaries: BTreeMap<u64, IterationSummary>,
    aux: BTreeMap<(u64, String, String), AuxArray>,
}

/// Reference `DataStore` backed by an in-process `Mutex<StoreState>`.
/// Writes autocommit by default (mirroring the Python original's
/// `sessionmaker(autocommit=True)` in `we_sim.py`); an explicit
/// `begin()`/`commit()`/`rollback()` wraps a multi-step critical section
/// (the commit step of `IterationDriver`, matching `run_we`'s
/// `self.dbsession.begin() ... commit()` bracket around the segment/summary
/// writes).
pub struct MemoryDataStore {
    committed: Mutex<StoreState>,
    pending: Mutex<Option<StoreState>>,
    advisory: Mutex<()>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        MemoryDataStore {
            committed: Mutex::new(StoreState::default()),
            pending: Mutex::new(None),
            advisory: Mutex::new(()),
        }
    }

    fn with_write<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut pending = self.pending.lock().unwrap();
        if let Some(state) = pending.as_mut() {
            f(state)
        } else {
            drop(pending);
            let mut committed = self.committed.lock().unwrap();
            f(&mut committed)
        }
    }
}

impl Default for MemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore for MemoryDataStore {
    fn get_current_iteration(&self) -> WeResult<u64> {
        Ok(self.committed.lock().unwrap().current_iteration)
    }

    fn set_current_iteration(&self, n_iter: u64) -> WeResult<()> {
        self.with_write(|s| s.current_iteration = n_iter);
        Ok(())
    }

    fn begin(&self) -> WeResult<()> {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_some() {
            return Err(WeError::StoreTransactionFailure(
                "a transaction is already active".to_string(),
            ));
        }
        *pending = Some(self.committed.lock().unwrap().clone());
        Ok(())
    }

    fn commit(&self) -> WeResult<()> {
        let mut pending = self.pending.lock().unwrap();
        let state = pending.take().ok_or_else(|| {
            WeError::StoreTransactionFailure("commit() with no active transaction".to_string())
        })?;
        *self.committed.lock().unwrap() = state;
        debug!("transaction committed");
        Ok(())
    }

    fn rollback(&self) -> WeResult<()> {
        let mut pending = self.pending.lock().unwrap();
        if pending.take().is_none() {
            return Err(WeError::StoreTransactionFailure(
                "rollback() with no active transaction".to_string(),
            ));
        }
        info!("transaction rolled back");
        Ok(())
    }

    fn insert_segments(&self, n_iter: u64, segments: Vec<Segment>) -> WeResult<()> {
        self.with_write(|s| {
            for seg in segments {
                debug_assert_eq!(seg.n_iter, n_iter);
                s.segments.insert(seg.reference(), seg);
            }
        });
        Ok(())
    }

    fn update_segments(&self, n_iter: u64, segments: Vec<Segment>) -> WeResult<()> {
        self.with_write(|s| {
            for seg in segments {
                debug_assert_eq!(seg.n_iter, n_iter);
                s.segments.insert(seg.reference(), seg);
            }
        });
        Ok(())
    }

    fn query_segments(&self, n_iter: u64, filter: SegmentFilter) -> WeResult<Vec<Segment>> {
        let committed = self.committed.lock().unwrap();
        let mut out: Vec<Segment> = committed
            .segments
            .values()
            .filter(|s| s.n_iter == n_iter && filter.matches(s))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.seg_id);
        Ok(out)
    }

    fn insert_iteration_summary(&self, summary: IterationSummary) -> WeResult<()> {
        self.with_write(|s| {
            s.summaries.insert(summary.n_iter, summary);
        });
        Ok(())
    }

    fn update_iteration_summary(&self, summary: IterationSummary) -> WeResult<()> {
        self.with_write(|s| {
            s.summaries.insert(summary.n_iter, summary);
        });
        Ok(())
    }

    fn get_iteration_summary(&self, n_iter: u64) -> WeResult<Option<IterationSummary>> {
        Ok(self.committed.lock().unwrap().summaries.get(&n_iter).cloned())
    }

    fn put_auxiliary(&self, n_iter: u64, group: &str, name: &str, array: AuxArray) -> WeResult<()> {
        self.with_write(|s| {
            s.aux.insert((n_iter, group.to_string(), name.to_string()), array);
        });
        Ok(())
    }

    fn get_auxiliary(&self, n_iter: u64, group: &str, name: &str) -> WeResult<Option<AuxArray>> {
        let committed = self.committed.lock().unwrap();
        Ok(committed
            .aux
            .get(&(n_iter, group.to_string(), name.to_string()))
            .cloned())
    }

    fn lock(&self, f: &mut dyn FnMut() -> WeResult<()>) -> WeResult<()> {
        let _guard = self.advisory.lock().unwrap();
        f()
    }

    fn flushing_lock(&self, f: &mut dyn FnMut() -> WeResult<()>) -> WeResult<()> {
        let _guard = self.advisory.lock().unwrap();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;

    #[test]
    fn autocommit_write_is_immediately_visible() {
        let store = MemoryDataStore::new();
        store
            .insert_segments(0, vec![Segment::new_prepared(1, 0, 1.0, vec![0.0])])
            .unwrap();
        let segs = store.query_segments(0, SegmentFilter::All).unwrap();
        assert_eq!(segs.len(), 1);
    }

    #[test]
    fn rollback_discards_pending_writes() {
        let store = MemoryDataStore::new();
        store.begin().unwrap();
        store
            .insert_segments(0, vec![Segment::new_prepared(1, 0, 1.0, vec![0.0])])
            .unwrap();
        store.rollback().unwrap();
        let segs = store.query_segments(0, SegmentFilter::All).unwrap();
        assert!(segs.is_empty());
    }

    #[test]
    fn commit_makes_pending_writes_visible_together() {
        let store = MemoryDataStore::new();
        store.begin().unwrap();
        store
            .insert_segments(1, vec![Segment::new_prepared(1, 1, 0.5, vec![0.0])])
            .unwrap();
        store.set_current_iteration(1).unwrap();
        assert_eq!(store.get_current_iteration().unwrap(), 0);
        store.commit().unwrap();
        assert_eq!(store.get_current_iteration().unwrap(), 1);
        assert_eq!(store.query_segments(1, SegmentFilter::All).unwrap().len(), 1);
    }

    #[test]
    fn double_begin_fails() {
        let store = MemoryDataStore::new();
        store.begin().unwrap();
        assert!(store.begin().is_err());
    }
}
