use crate::error::WeResult;
use crate::segment::{Segment, SegmentStatus};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// External collaborator: advances one segment's pcoord in physical time
/// (spec.md §6). Invoked by a `WorkManager`, never directly by the core.
pub trait Propagator: Send + Sync {
    /// `segment` arrives `Prepared`; on success it must leave `Complete`
    /// with a pcoord of at least two samples and `cputime`/`walltime` set.
    /// On failure it should be left/marked `Failed` rather than returning
    /// `Err` for ordinary propagation failures — `Err` is reserved for
    /// conditions the work manager itself cannot route around.
    fn propagate(&self, segment: &mut Segment) -> WeResult<()>;
}

/// Scheduling/dispatch contract the core treats as a batch
/// dispatch-and-wait primitive (spec.md §5, §6). The real implementation —
/// parallel MD scheduling across a cluster — is out of scope; this module
/// only defines the trait plus a trivial in-process reference
/// implementation for tests.
pub trait WorkManager {
    fn is_master(&self) -> bool;

    /// Blocks until every segment has reached `Complete` or `Failed`,
    /// or until `deadline` elapses, whichever comes first. Segments still
    /// `Running` at the deadline are returned as-is.
    fn propagate(&self, segments: Vec<Segment>, deadline: Option<Duration>) -> WeResult<Vec<Segment>>;

    fn cancel(&self);
}

/// A work manager that runs a `Propagator` across segments on a local
/// rayon thread pool. This is the one place in the crate where
/// parallelism is legitimate (spec.md §5: "Parallelism exists only in the
/// WorkManager"); the core coordinator itself stays single-threaded.
pub struct InProcessWorkManager<P: Propagator> {
    propagator: P,
    cancelled: AtomicBool,
}

impl<P: Propagator> InProcessWorkManager<P> {
    pub fn new(propagator: P) -> Self {
        InProcessWorkManager {
            propagator,
            cancelled: AtomicBool::new(false),
        }
    }
}

impl<P: Propagator> WorkManager for InProcessWorkManager<P> {
    fn is_master(&self) -> bool {
        true
    }

    fn propagate(&self, mut segments: Vec<Segment>, _deadline: Option<Duration>) -> WeResult<Vec<Segment>> {
        self.cancelled.store(false, Ordering::SeqCst);
        segments.par_iter_mut().for_each(|seg| {
            if self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            if let Err(err) = self.propagator.propagate(seg) {
                warn!(seg_id = seg.seg_id, %err, "propagation failed");
                seg.status = SegmentStatus::Failed;
            }
        });
        Ok(segments)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
