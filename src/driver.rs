use crate::bin_topology::BinTopology;
use crate::datastore::{AuxArray, DataStore, SegmentFilter};
use crate::error::{WeError, WeResult};
use crate::iteration::IterationSummary;
use crate::particle::{Particle, ParticleId};
use crate::resampler::Resampler;
use crate::reweighting::ReweightingDriver;
use crate::segment::{EndpointType, Segment, SegmentStatus};
use crate::work_manager::WorkManager;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, instrument};

/// States and transitions of one WE iteration (spec.md §4.3). Entry into
/// each state is persisted via `DataStore::put_auxiliary` so a restart can
/// resume exactly where it left off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationState {
    Prepared,
    Running,
    Propagated,
    Failed,
    Resampled,
    Committed,
}

impl IterationState {
    fn code(self) -> f64 {
        match self {
            IterationState::Prepared => 0.0,
            IterationState::Running => 1.0,
            IterationState::Propagated => 2.0,
            IterationState::Failed => 3.0,
            IterationState::Resampled => 4.0,
            IterationState::Committed => 5.0,
        }
    }

    fn from_code(code: f64) -> Self {
        match code as i64 {
            0 => IterationState::Prepared,
            1 => IterationState::Running,
            2 => IterationState::Propagated,
            3 => IterationState::Failed,
            4 => IterationState::Resampled,
            _ => IterationState::Committed,
        }
    }
}

/// Orchestrates one WE iteration end-to-end: dispatch to the work
/// manager, collect completed endpoints, run the resampler (and optional
/// reweighting), and commit the next generation (spec.md §4.3).
pub struct IterationDriver {
    n_iter: u64,
    state: IterationState,
    topology: BinTopology,
    resampler: Resampler,
}

impl IterationDriver {
    pub fn new(n_iter: u64, topology: BinTopology, resampler: Resampler) -> Self {
        IterationDriver {
            n_iter,
            state: IterationState::Prepared,
            topology,
            resampler,
        }
    }

    pub fn current_iteration(&self) -> u64 {
        self.n_iter
    }

    pub fn state(&self) -> IterationState {
        self.state
    }

    pub fn topology(&self) -> &BinTopology {
        &self.topology
    }

    pub fn resampler_mut(&mut self) -> &mut Resampler {
        &mut self.resampler
    }

    fn persist_state(&self, store: &impl DataStore, state: IterationState) -> WeResult<()> {
        store.put_auxiliary(
            self.n_iter,
            "driver",
            "state",
            AuxArray::vector(vec![self.n_iter as f64, state.code()]),
        )
    }

    /// Reconstruct the recorded state for `n_iter` from the store, if any
    /// was persisted (spec.md §4.3 "on restart the driver resumes at the
    /// recorded state").
    pub fn recorded_state(store: &impl DataStore, n_iter: u64) -> WeResult<Option<IterationState>> {
        Ok(store
            .get_auxiliary(n_iter, "driver", "state")
            .ok()
            .flatten()
            .map(|arr| IterationState::from_code(arr.data[1])))
    }

    /// `dispatch` + `wait`: hand every segment with `status != Complete` to
    /// the work manager as a single batch and block until the manager
    /// reports every segment `Complete` or `Failed` (spec.md §4.3, §5).
    #[instrument(skip(self, store, work_manager), fields(n_iter = self.n_iter))]
    pub fn dispatch<DS: DataStore, WM: WorkManager>(
        &mut self,
        store: &DS,
        work_manager: &WM,
        deadline: Option<Duration>,
    ) -> WeResult<()> {
        self.persist_state(store, IterationState::Prepared)?;
        let incomplete = store.query_segments(self.n_iter, SegmentFilter::Incomplete)?;
        if incomplete.is_empty() {
            self.state = IterationState::Propagated;
            self.persist_state(store, self.state)?;
            return Ok(());
        }

        self.state = IterationState::Running;
        self.persist_state(store, self.state)?;
        info!(n_segments = incomplete.len(), "dispatching segments for propagation");

        let results = work_manager.propagate(incomplete, deadline)?;
        store.update_segments(self.n_iter, results.clone())?;

        let n_running = results
            .iter()
            .filter(|s| matches!(s.status, SegmentStatus::Running | SegmentStatus::Prepared))
            .count();
        if n_running > 0 {
            return Err(WeError::Timeout {
                elapsed_secs: deadline.map(|d| d.as_secs()).unwrap_or(0),
                n_running,
            });
        }

        let any_failed = results.iter().any(|s| matches!(s.status, SegmentStatus::Failed));
        if any_failed {
            self.state = IterationState::Failed;
            self.persist_state(store, self.state)?;
            return Err(WeError::PropagationIncomplete {
                n_incomplete: results.iter().filter(|s| !s.is_complete()).count(),
            });
        }

        self.state = IterationState::Propagated;
        self.persist_state(store, self.state)?;
        Ok(())
    }

    /// Resample step: read completed segments of `n_iter`, run the
    /// resampler, optionally reweight, allocate iter N+1 segments, and
    /// commit the transaction atomically (spec.md §4.3 "Commit").
    #[instrument(skip(self, store, reweighting), fields(n_iter = self.n_iter))]
    pub fn resample_and_commit<DS: DataStore>(
        &mut self,
        store: &DS,
        prev_had_particles: &[bool],
        mut reweighting: Option<&mut ReweightingDriver>,
    ) -> WeResult<IterationSummary> {
        if self.state != IterationState::Propagated {
            return Err(WeError::PropagationIncomplete {
                n_incomplete: store.query_segments(self.n_iter, SegmentFilter::Incomplete)?.len(),
            });
        }

        let completed = store.query_segments(self.n_iter, SegmentFilter::Status(SegmentStatus::Complete))?;
        let cputime_sum: f64 = completed.iter().map(|s| s.cputime).sum();
        let walltime_sum: f64 = completed.iter().map(|s| s.walltime).sum();

        let mut by_id: BTreeMap<ParticleId, Segment> = BTreeMap::new();
        let mut particles = Vec::with_capacity(completed.len());
        for seg in completed {
            let mut p = Particle::new(seg.seg_id, seg.weight, seg.endpoint().to_vec());
            if let Some(region) = crate::segment::initial_region_of(&seg.data) {
                p.initial_region = Some(region.to_string());
            }
            particles.push(p);
            by_id.insert(seg.seg_id, seg);
        }
        let n_particles_in = particles.len();
        let norm_in: f64 = particles.iter().map(|p| p.weight).sum();
        info!(n_particles_in, norm = norm_in, "running WE resampling");

        let mut outcome = self.resampler.resample(&self.topology, particles, prev_had_particles)?;

        if let Some(rw) = reweighting.as_deref_mut() {
            rw.maybe_reweight(store, self.n_iter, &self.topology, &mut outcome)?;
        }

        // Mark old segments merged/recycled (spec.md I3/I4).
        let mut updated_old: Vec<Segment> = Vec::new();
        for id in &outcome.recycled_ids {
            if let Some(seg) = by_id.get_mut(id) {
                seg.endpoint_type = EndpointType::Recycled;
                updated_old.push(seg.clone());
            }
        }
        for id in &outcome.merged_ids {
            if let Some(seg) = by_id.get_mut(id) {
                seg.endpoint_type = EndpointType::Merged;
                updated_old.push(seg.clone());
            }
        }

        let new_n_iter = self.n_iter + 1;
        let mut new_segments = Vec::with_capacity(outcome.particles.len());
        for p in &outcome.particles {
            let mut seg = Segment::new_prepared(p.id, new_n_iter, p.weight, p.pcoord.clone());
            if let Some(parent_id) = p.primary_parent {
                seg.primary_parent_ref = Some(crate::segment::SegmentRef::new(self.n_iter, parent_id));
            }
            seg.merge_parents_ref = p
                .merge_parents
                .iter()
                .map(|id| crate::segment::SegmentRef::new(self.n_iter, *id))
                .collect();
            if let Some(region) = &p.initial_region {
                crate::segment::set_initial_region(&mut seg.data, region.clone());
            }
            if seg.primary_parent_ref.is_none() && crate::segment::initial_region_of(&seg.data).is_none() {
                return Err(WeError::InvariantViolation {
                    detail: format!(
                        "segment {} of iter {} has neither a primary parent nor an initial region",
                        seg.seg_id, new_n_iter
                    ),
                });
            }
            new_segments.push(seg);
        }

        let norm_out: f64 = new_segments.iter().map(|s| s.weight).sum();
        let closing = IterationSummary {
            n_iter: self.n_iter,
            n_particles: n_particles_in as u32,
            norm: norm_in,
            cputime_sum,
            walltime_sum,
            starttime: None,
            endtime: None,
            bin_populations: outcome.bin_populations.clone(),
            bin_nparticles: outcome.bin_nparticles.clone(),
            bin_flux: if self.n_iter > 0 { Some(outcome.bin_flux.clone()) } else { None },
            recycled_population: outcome.recycled_population,
        };
        let opening = IterationSummary::opening(
            new_n_iter,
            new_segments.len() as u32,
            norm_out,
            outcome.bin_populations,
            outcome.bin_nparticles,
        );

        self.state = IterationState::Resampled;
        self.persist_state(store, self.state)?;

        store.begin()?;
        let commit_result = (|| -> WeResult<()> {
            store.update_segments(self.n_iter, updated_old)?;
            store.insert_segments(new_n_iter, new_segments)?;
            store.update_iteration_summary(closing.clone())?;
            store.insert_iteration_summary(opening)?;
            store.set_current_iteration(new_n_iter)?;
            Ok(())
        })();

        match commit_result {
            Ok(()) => {
                store.commit()?;
                self.state = IterationState::Committed;
                self.n_iter = new_n_iter;
                self.persist_state(store, IterationState::Prepared)?;
                Ok(closing)
            }
            Err(e) => {
                let _ = store.rollback();
                Err(WeError::StoreTransactionFailure(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin_topology::RectilinearBinMapper;
    use crate::datastore::MemoryDataStore;
    use crate::resampler::Resampler;
    use crate::segment::Segment;
    use crate::work_manager::{InProcessWorkManager, Propagator};
    use std::collections::BTreeSet;

    struct Identity;
    impl Propagator for Identity {
        fn propagate(&self, segment: &mut Segment) -> WeResult<()> {
            let endpoint = segment.endpoint().to_vec();
            segment.pcoord.push(endpoint);
            segment.status = SegmentStatus::Complete;
            segment.cputime = 0.1;
            segment.walltime = 0.1;
            Ok(())
        }
    }

    fn topology() -> BinTopology {
        let mapper = RectilinearBinMapper::new(vec![0.0, 10.0]);
        BinTopology::new(1, Box::new(mapper), vec![10], Vec::new(), BTreeSet::new())
    }

    #[test]
    fn s1_one_iteration_with_identity_propagator_keeps_population() {
        let store = MemoryDataStore::new();
        let initial: Vec<Segment> = (0..10)
            .map(|i| {
                let mut s = Segment::new_prepared(i, 0, 0.1, vec![1.0]);
                s.status = SegmentStatus::Complete;
                s.pcoord.push(vec![1.0]);
                s
            })
            .collect();
        store.insert_segments(0, initial).unwrap();

        let resampler = Resampler::new(1, 10, 1e-12);
        let mut driver = IterationDriver::new(0, topology(), resampler);
        let wm = InProcessWorkManager::new(Identity);

        driver.dispatch(&store, &wm, None).unwrap();
        assert_eq!(driver.state(), IterationState::Propagated);

        let summary = driver.resample_and_commit(&store, &[false], None).unwrap();
        assert_eq!(summary.n_iter, 0);
        assert!((summary.norm - 1.0).abs() < 1e-9);
        assert_eq!(driver.current_iteration(), 1);
        assert_eq!(store.get_current_iteration().unwrap(), 1);

        let next_gen = store.query_segments(1, SegmentFilter::All).unwrap();
        assert_eq!(next_gen.len(), 10);
        for s in &next_gen {
            assert!((s.weight - 0.1).abs() < 1e-9);
        }
    }
}
