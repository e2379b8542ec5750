use crate::bin_topology::BinTopology;
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::datastore::{DataStore, SegmentFilter};
use crate::driver::IterationDriver;
use crate::error::{WeError, WeResult};
use crate::resampler::Resampler;
use crate::reweighting::ReweightingDriver;
use crate::segment::{set_initial_region, Segment};
use crate::work_manager::WorkManager;
use std::time::{Duration, Instant};
use tracing::info;

/// Why `SimLoop::run` stopped (spec.md §4.6 "report whether max_iterations
/// or max_wallclock terminated the loop").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    MaxIterations,
    MaxWallclock,
}

/// Seed the initial generation of segments (iteration 0 -> 1's parents),
/// grounded on `default.py`'s `sim_init`: either a single uniform-weight
/// `wemd.initial_pcoord`, or multiple named `bins.source_pcoords` whose
/// particle counts are apportioned by `init_weight` (falling back to
/// `weight`), with the last source absorbing any rounding remainder so
/// the total always equals `n_init` exactly.
pub fn seed_initial_segments(config: &Config) -> WeResult<Vec<Segment>> {
    let n_init = config
        .wemd
        .as_ref()
        .and_then(|w| w.initial_particles)
        .ok_or_else(|| WeError::ConfigError("wemd.initial_particles is required to seed".to_string()))?;

    if config.bins.source_pcoords.is_empty() {
        let pcoord = config
            .wemd
            .as_ref()
            .and_then(|w| w.initial_pcoord.clone())
            .ok_or_else(|| WeError::ConfigError("wemd.initial_pcoord is required when no source_pcoords are configured".to_string()))?;
        let weight = 1.0 / n_init as f64;
        return Ok((0..n_init)
            .map(|i| Segment::new_prepared(i as u64, 0, weight, pcoord.clone()))
            .collect());
    }

    let mut segments = Vec::with_capacity(n_init as usize);
    let sources: Vec<_> = config.bins.source_pcoords.iter().collect();
    let n_sources = sources.len();
    let mut next_id = 0u64;
    for (idx, (name, source)) in sources.iter().enumerate() {
        let nsegs = if idx < n_sources - 1 {
            (source.effective_init_weight() * n_init as f64) as u64
        } else {
            n_init as u64 - segments.len() as u64
        };
        for _ in 0..nsegs {
            let mut seg = Segment::new_prepared(next_id, 0, 1.0 / n_init as f64, source.pcoord.clone());
            set_initial_region(&mut seg.data, (*name).clone());
            segments.push(seg);
            next_id += 1;
        }
    }
    if segments.len() as u32 != n_init {
        return Err(WeError::InvariantViolation {
            detail: format!(
                "seeded {} segments but wemd.initial_particles is {n_init}",
                segments.len()
            ),
        });
    }
    Ok(segments)
}

/// Top-level loop (spec.md §4.6) binding `IterationDriver`, an optional
/// `ReweightingDriver`, and a `WorkManager` to the `limits.*` termination
/// conditions, persisting a `Checkpoint` after every committed iteration.
pub struct SimLoop<DS: DataStore, WM: WorkManager> {
    store: DS,
    work_manager: WM,
    max_iterations: u64,
    max_wallclock: Duration,
    driver: IterationDriver,
    reweighting: Option<ReweightingDriver>,
    checkpoint_path: std::path::PathBuf,
}

impl<DS: DataStore, WM: WorkManager> SimLoop<DS, WM> {
    pub fn new(
        config: &Config,
        store: DS,
        work_manager: WM,
        topology: BinTopology,
        resampler: Resampler,
        n_iter: u64,
    ) -> Self {
        let reweighting = config.weed.as_ref().map(|w| {
            let window = crate::reweighting::WindowSize::parse(&w.window_size)
                .unwrap_or(crate::reweighting::WindowSize::Fixed(w.max_window_size));
            ReweightingDriver::new(
                w.do_equilibrium_reweighting,
                window,
                Some(w.max_window_size),
                w.reweight_period,
                w.priority,
            )
        });
        SimLoop {
            store,
            work_manager,
            max_iterations: config.limits.max_iterations,
            max_wallclock: config.limits.max_wallclock.0,
            driver: IterationDriver::new(n_iter, topology, resampler),
            reweighting,
            checkpoint_path: std::path::PathBuf::from(&config.data.state),
        }
    }

    fn persist_checkpoint(&mut self) -> WeResult<()> {
        let current_iteration = self.driver.current_iteration();
        let topology_version = self.driver.topology().version();
        let resampler = self.driver.resampler_mut();
        let checkpoint = Checkpoint {
            current_iteration,
            topology_version,
            next_particle_id: resampler.next_particle_id(),
            rng: resampler.rng_state().clone(),
        };
        let bytes = checkpoint.encode()?;
        std::fs::write(&self.checkpoint_path, bytes)
            .map_err(|e| WeError::ConfigError(format!("writing checkpoint: {e}")))
    }

    /// `current_iteration <= max_iterations` and wallclock budget not
    /// exceeded (spec.md §4.6): open, propagate if needed, resample and
    /// commit, checkpoint, advance.
    pub fn run(&mut self) -> WeResult<TerminationReason> {
        let start = Instant::now();
        loop {
            if self.driver.current_iteration() > self.max_iterations {
                return Ok(TerminationReason::MaxIterations);
            }
            if start.elapsed() >= self.max_wallclock {
                return Ok(TerminationReason::MaxWallclock);
            }

            let n_iter = self.driver.current_iteration();
            info!(n_iter, "opening iteration");

            self.driver.dispatch(&self.store, &self.work_manager, Some(self.max_wallclock.saturating_sub(start.elapsed())))?;

            let n_bins = self.driver.topology().n_bins();
            let prev = self.store.query_segments(n_iter, SegmentFilter::All)?;
            let mut prev_had_particles = vec![false; n_bins];
            for seg in &prev {
                if let Ok(b) = self.driver.topology().map(seg.endpoint()) {
                    prev_had_particles[b] = true;
                }
            }

            self.driver
                .resample_and_commit(&self.store, &prev_had_particles, self.reweighting.as_mut())?;

            self.persist_checkpoint()?;
        }
    }
}
