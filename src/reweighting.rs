use crate::bin_topology::BinTopology;
use crate::datastore::{AuxArray, DataStore};
use crate::error::WeResult;
use crate::resampler::ResampleOutcome;
use ndarray::Array2;
use tracing::{debug, info, warn};

/// Parsed form of `weed.window_size` (spec.md §6): a string containing
/// `.` is a fraction of `n_iter`, otherwise a fixed iteration count —
/// mirrors `weed_driver.py:36-46` exactly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowSize {
    Fraction(f64),
    Fixed(usize),
}

impl WindowSize {
    pub fn parse(raw: &str) -> Result<Self, crate::error::WeError> {
        if raw.contains('.') {
            let frac: f64 = raw
                .parse()
                .map_err(|_| crate::error::WeError::ConfigError(format!("invalid window_size {raw}")))?;
            if frac <= 0.0 || frac > 1.0 {
                return Err(crate::error::WeError::ConfigError(
                    "fractional window size must be in (0,1]".to_string(),
                ));
            }
            Ok(WindowSize::Fraction(frac))
        } else {
            let n: usize = raw
                .parse()
                .map_err(|_| crate::error::WeError::ConfigError(format!("invalid window_size {raw}")))?;
            Ok(WindowSize::Fixed(n))
        }
    }

    fn effective(self, n_iter: u64, max_window: Option<usize>) -> usize {
        let raw = match self {
            WindowSize::Fraction(f) => (n_iter as f64 * f) as usize,
            WindowSize::Fixed(n) => n.min(n_iter as usize),
        };
        match max_window {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }
}

/// External collaborator (spec.md §4.4, glossary "probAdjustEquil"):
/// given current bin weights and a rate-matrix estimate, produce a
/// non-negative new bin-weight vector summing to 1. The concrete
/// numerical method is unspecified beyond this contract; `PowerIteration`
/// below is a reference implementation computing the rate matrix's
/// dominant left eigenvector via power iteration (a standard
/// Perron-eigenvector approximation), not a faithful port of any
/// particular production solver.
pub trait ProbAdjustEquil {
    fn adjust(&self, weights: &[f64], avg_rate: &Array2<f64>, _stderr_rate: &Array2<f64>) -> Vec<f64>;
}

pub struct PowerIterationEquil {
    pub iterations: usize,
}

impl Default for PowerIterationEquil {
    fn default() -> Self {
        PowerIterationEquil { iterations: 200 }
    }
}

impl ProbAdjustEquil for PowerIterationEquil {
    fn adjust(&self, weights: &[f64], avg_rate: &Array2<f64>, _stderr_rate: &Array2<f64>) -> Vec<f64> {
        let n = weights.len();
        if n == 0 {
            return Vec::new();
        }
        let mut p = weights.to_vec();
        let row_sum: f64 = p.iter().sum();
        if row_sum <= 0.0 {
            return weights.to_vec();
        }
        for v in &mut p {
            *v /= row_sum;
        }
        for _ in 0..self.iterations {
            let mut next = vec![0.0_f64; n];
            for i in 0..n {
                for j in 0..n {
                    next[j] += p[i] * avg_rate[[i, j]];
                }
            }
            let total: f64 = next.iter().sum();
            if total <= 0.0 {
                return p;
            }
            for v in &mut next {
                *v /= total;
            }
            p = next;
        }
        p
    }
}

/// Post-propagation, pre-commit bin-weight adjustment from windowed rate
/// estimates (spec.md §4.4). Incompatible with recycling (sink bins);
/// a no-op until `n_iter` exceeds `last_reweighting` by `reweight_period`.
pub struct ReweightingDriver {
    pub do_reweight: bool,
    pub window: WindowSize,
    pub max_window: Option<usize>,
    pub reweight_period: u64,
    pub priority: i32,
    solver: Box<dyn ProbAdjustEquil + Send + Sync>,
}

const EPS: f64 = f64::EPSILON;

impl ReweightingDriver {
    pub fn new(do_reweight: bool, window: WindowSize, max_window: Option<usize>, reweight_period: u64, priority: i32) -> Self {
        ReweightingDriver {
            do_reweight,
            window,
            max_window,
            reweight_period,
            priority,
            solver: Box::new(PowerIterationEquil::default()),
        }
    }

    pub fn with_solver(mut self, solver: impl ProbAdjustEquil + Send + Sync + 'static) -> Self {
        self.solver = Box::new(solver);
        self
    }

    fn last_reweighting<DS: DataStore>(&self, store: &DS) -> WeResult<u64> {
        Ok(store
            .get_auxiliary(0, "weed", "last_reweighting")?
            .map(|a| a.data[0] as u64)
            .unwrap_or(0))
    }

    fn set_last_reweighting<DS: DataStore>(&self, store: &DS, n_iter: u64) -> WeResult<()> {
        store.put_auxiliary(0, "weed", "last_reweighting", AuxArray::vector(vec![n_iter as f64]))
    }

    /// Gather average/stderr rate and population estimates over
    /// `[max(1, n_iter - window), n_iter]` from committed iteration
    /// summaries. Uses each summary's `bin_flux` as the raw rate sample;
    /// summary `n_iter == 0` has no flux and is skipped.
    fn estimate_rates<DS: DataStore>(
        &self,
        store: &DS,
        n_iter: u64,
        n_bins: usize,
    ) -> WeResult<(Array2<f64>, Array2<f64>, Vec<f64>, Vec<f64>)> {
        let eff_window = self.window.effective(n_iter, self.max_window);
        let start = 1.max(n_iter.saturating_sub(eff_window as u64));

        let mut flux_samples: Vec<Array2<f64>> = Vec::new();
        let mut pop_samples: Vec<Vec<f64>> = Vec::new();
        for i in start..=n_iter {
            if let Some(summary) = store.get_iteration_summary(i)? {
                if let Some(flux) = summary.bin_flux {
                    flux_samples.push(flux);
                }
                pop_samples.push(summary.bin_populations);
            }
        }

        let avg_rate = mean_matrix(&flux_samples, n_bins);
        let stderr_rate = stderr_matrix(&flux_samples, &avg_rate, n_bins);
        let avg_pop = mean_vector(&pop_samples, n_bins);
        let stderr_pop = stderr_vector(&pop_samples, &avg_pop, n_bins);
        Ok((avg_rate, stderr_rate, avg_pop, stderr_pop))
    }

    /// Entry point called by the `IterationDriver` after resampling,
    /// before commit. Mutates `outcome`'s particle weights in place when
    /// an adjustment is accepted; otherwise leaves them untouched.
    pub fn maybe_reweight<DS: DataStore>(
        &mut self,
        store: &DS,
        n_iter: u64,
        topology: &BinTopology,
        outcome: &mut ResampleOutcome,
    ) -> WeResult<()> {
        if !topology.sinks().is_empty() && self.do_reweight {
            warn!("equilibrium reweighting requested but sink bins present; reweighting disabled");
            return Ok(());
        }
        if !self.do_reweight {
            debug!("equilibrium reweighting not enabled");
            return Ok(());
        }

        let last = self.last_reweighting(store)?;
        if n_iter.saturating_sub(last) < self.reweight_period {
            debug!("not reweighting this iteration");
            return Ok(());
        }

        let n_bins = topology.n_bins();
        let (avg_rate, stderr_rate, avg_pop, stderr_pop) = self.estimate_rates(store, n_iter, n_bins)?;

        // The average/stderr writes and the subsequent last_reweighting read
        // form one read-modify-write sequence over the "weed" auxiliary
        // group, so they run under the advisory lock.
        store.flushing_lock(&mut || {
            store.put_auxiliary(n_iter, "weed", "avg_populations", AuxArray::vector(avg_pop.clone()))?;
            store.put_auxiliary(n_iter, "weed", "stderr_populations", AuxArray::vector(stderr_pop.clone()))?;
            store.put_auxiliary(
                n_iter,
                "weed",
                "avg_rates",
                AuxArray::matrix(n_bins, n_bins, avg_rate.iter().copied().collect()),
            )?;
            store.put_auxiliary(
                n_iter,
                "weed",
                "stderr_rates",
                AuxArray::matrix(n_bins, n_bins, stderr_rate.iter().copied().collect()),
            )
        })?;

        let orig_weights = outcome.bin_populations.clone();
        let proposed = self.solver.adjust(&orig_weights, &avg_rate, &stderr_rate);

        // G1: no originally-populated bin assigned zero.
        let g1 = orig_weights
            .iter()
            .zip(&proposed)
            .all(|(&o, &n)| !(o > 0.0 && n == 0.0));
        // G2: no originally-empty bin assigned nonzero.
        let g2 = orig_weights
            .iter()
            .zip(&proposed)
            .all(|(&o, &n)| !(o == 0.0 && n > 0.0));
        let sum: f64 = proposed.iter().sum();
        let g3 = (sum - 1.0).abs() <= EPS * n_bins as f64;

        if !(g1 && g2 && g3) {
            warn!(g1, g2, g3, "reweighting rejected, retaining original bin weights");
            return Ok(());
        }

        for (bin, &new_weight) in proposed.iter().enumerate() {
            let old_weight = orig_weights[bin];
            if old_weight <= 0.0 {
                continue;
            }
            let scale = new_weight / old_weight;
            for (p, &pb) in outcome.particles.iter_mut().zip(&outcome.particle_bin) {
                if pb == bin {
                    p.weight *= scale;
                }
            }
            outcome.bin_populations[bin] = new_weight;
        }

        self.set_last_reweighting(store, n_iter)?;
        info!("equilibrium reweighting applied");
        Ok(())
    }
}

fn mean_matrix(samples: &[Array2<f64>], n_bins: usize) -> Array2<f64> {
    if samples.is_empty() {
        return Array2::zeros((n_bins, n_bins));
    }
    let mut sum = Array2::zeros((n_bins, n_bins));
    for s in samples {
        sum = sum + s;
    }
    sum / samples.len() as f64
}

fn stderr_matrix(samples: &[Array2<f64>], mean: &Array2<f64>, n_bins: usize) -> Array2<f64> {
    let n = samples.len();
    if n < 2 {
        return Array2::zeros((n_bins, n_bins));
    }
    let mut var = Array2::zeros((n_bins, n_bins));
    for s in samples {
        let d = s - mean;
        var = var + &d * &d;
    }
    var = var / (n as f64 * (n as f64 - 1.0));
    var.mapv(f64::sqrt)
}

fn mean_vector(samples: &[Vec<f64>], n_bins: usize) -> Vec<f64> {
    if samples.is_empty() {
        return vec![0.0; n_bins];
    }
    let mut sum = vec![0.0; n_bins];
    for s in samples {
        for (i, v) in s.iter().enumerate() {
            sum[i] += v;
        }
    }
    sum.iter().map(|v| v / samples.len() as f64).collect()
}

fn stderr_vector(samples: &[Vec<f64>], mean: &[f64], n_bins: usize) -> Vec<f64> {
    let n = samples.len();
    if n < 2 {
        return vec![0.0; n_bins];
    }
    let mut var = vec![0.0; n_bins];
    for s in samples {
        for i in 0..n_bins {
            let d = s[i] - mean[i];
            var[i] += d * d;
        }
    }
    var.iter()
        .map(|v| (v / (n as f64 * (n as f64 - 1.0))).sqrt())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin_topology::RectilinearBinMapper;
    use crate::datastore::MemoryDataStore;
    use crate::particle::Particle;
    use std::collections::BTreeSet;

    fn topology(sinks: BTreeSet<usize>) -> BinTopology {
        let mapper = RectilinearBinMapper::new(vec![0.0, 1.0, 2.0]);
        BinTopology::new(1, Box::new(mapper), vec![1, 1], Vec::new(), sinks)
    }

    struct RejectEquil;
    impl ProbAdjustEquil for RejectEquil {
        fn adjust(&self, weights: &[f64], _avg_rate: &Array2<f64>, _stderr_rate: &Array2<f64>) -> Vec<f64> {
            let mut out = weights.to_vec();
            out[0] = 0.0;
            let rest: f64 = out[1..].iter().sum();
            if rest > 0.0 {
                let scale = 1.0 / rest;
                for v in &mut out[1..] {
                    *v *= scale;
                }
            }
            out
        }
    }

    fn sample_outcome() -> ResampleOutcome {
        ResampleOutcome {
            particles: vec![Particle::new(1, 0.5, vec![0.5]), Particle::new(2, 0.5, vec![1.5])],
            particle_bin: vec![0, 1],
            recycled_ids: BTreeSet::new(),
            merged_ids: BTreeSet::new(),
            bin_populations: vec![0.5, 0.5],
            bin_nparticles: vec![1, 1],
            bin_flux: Array2::zeros((2, 2)),
            recycled_population: 0.0,
        }
    }

    #[test]
    fn s5_reweighting_rejected_when_gate_fails() {
        let store = MemoryDataStore::new();
        let mut driver = ReweightingDriver::new(true, WindowSize::Fixed(1), None, 0, 0)
            .with_solver(RejectEquil);
        let topo = topology(BTreeSet::new());
        let mut outcome = sample_outcome();
        let before = outcome.bin_populations.clone();
        driver.maybe_reweight(&store, 1, &topo, &mut outcome).unwrap();
        assert_eq!(outcome.bin_populations, before);
        assert_eq!(driver.last_reweighting(&store).unwrap(), 0);
    }

    #[test]
    fn reweighting_disabled_when_sinks_present() {
        let store = MemoryDataStore::new();
        let mut driver = ReweightingDriver::new(true, WindowSize::Fixed(1), None, 0, 0);
        let topo = topology(BTreeSet::from([1]));
        let mut outcome = sample_outcome();
        let before = outcome.bin_populations.clone();
        driver.maybe_reweight(&store, 1, &topo, &mut outcome).unwrap();
        assert_eq!(outcome.bin_populations, before);
    }

    #[test]
    fn window_size_parses_fraction_and_fixed() {
        assert_eq!(WindowSize::parse("0.5").unwrap(), WindowSize::Fraction(0.5));
        assert_eq!(WindowSize::parse("20").unwrap(), WindowSize::Fixed(20));
        assert!(WindowSize::parse("1.5").is_err());
    }
}
