use crate::bin_topology::BinTopology;
use crate::error::WeError;
use crate::particle::{Particle, ParticleId};
use ndarray::Array2;
use ordered_float::OrderedFloat;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// What happened to every input particle during one resample pass, plus the
/// new generation and summary statistics the `IterationDriver` needs to
/// build segments and an `IterationSummary`.
pub struct ResampleOutcome {
    pub particles: Vec<Particle>,
    /// `particle_bin[i]` is the bin index `particles[i]` was assigned to
    /// after resampling — the grouping the `ReweightingDriver` needs to
    /// rescale particle weights per bin without recomputing `map()`.
    pub particle_bin: Vec<usize>,
    /// Input particle ids whose segment should be marked `Recycled`.
    pub recycled_ids: BTreeSet<ParticleId>,
    /// Input particle ids whose segment should be marked `Merged` (both
    /// sides of a merge — their weight was folded into a new particle
    /// either way, even the side whose pcoord survived).
    pub merged_ids: BTreeSet<ParticleId>,
    pub bin_populations: Vec<f64>,
    pub bin_nparticles: Vec<u32>,
    pub bin_flux: Array2<f64>,
    pub recycled_population: f64,
}

/// Split/merge/recycle engine (spec.md §4.2). Owns a single named RNG
/// stream used for every random choice it makes — the recycling source
/// draw and the merge pcoord tie-break draw both pull from this one
/// stream, resolving the spec's open question about RNG stream ownership.
pub struct Resampler {
    rng: StdRng,
    next_particle_id: ParticleId,
    min_weight: f64,
}

impl Resampler {
    pub fn new(seed: u64, start_particle_id: ParticleId, min_weight: f64) -> Self {
        Resampler {
            rng: StdRng::seed_from_u64(seed),
            next_particle_id: start_particle_id,
            min_weight,
        }
    }

    /// Restore a resampler from a checkpointed RNG state and particle-id
    /// counter (spec.md §6 "Checkpoint blob").
    pub fn from_state(rng: StdRng, next_particle_id: ParticleId, min_weight: f64) -> Self {
        Resampler {
            rng,
            next_particle_id,
            min_weight,
        }
    }

    pub fn rng_state(&self) -> &StdRng {
        &self.rng
    }

    pub fn next_particle_id(&self) -> ParticleId {
        self.next_particle_id
    }

    fn fresh_id(&mut self) -> ParticleId {
        let id = self.next_particle_id;
        self.next_particle_id += 1;
        id
    }

    /// Run one full resample pass. `prev_had_particles[b]` tells the
    /// resampler whether bin `b` held any particles immediately before
    /// this call — it is the basis for distinguishing a legitimately
    /// always-empty bin (I5's exception) from one that unexpectedly
    /// emptied out (`EmptyBinWithTarget`).
    pub fn resample(
        &mut self,
        topology: &BinTopology,
        input: Vec<Particle>,
        prev_had_particles: &[bool],
    ) -> Result<ResampleOutcome, WeError> {
        let n_bins = topology.n_bins();
        assert_eq!(prev_had_particles.len(), n_bins);

        let total_weight_in: f64 = input.iter().map(|p| p.weight).sum();
        let n_particles_in = input.len();

        let mut bins: Vec<Vec<Particle>> = (0..n_bins).map(|_| Vec::new()).collect();
        // origin_bin[id] = the bin a particle was assigned to before any
        // recycling reassignment; used to compute bin_flux.
        let mut origin_bin: BTreeMap<ParticleId, usize> = BTreeMap::new();

        for p in input {
            let b = topology.map(&p.pcoord)?;
            origin_bin.insert(p.id, b);
            bins[b].push(p);
        }

        let mut recycled_ids: BTreeSet<ParticleId> = BTreeSet::new();
        let mut merged_ids: BTreeSet<ParticleId> = BTreeSet::new();
        let mut recycled_population = 0.0_f64;
        let mut flux = Array2::<f64>::zeros((n_bins, n_bins));

        // --- Recycling (applied first) ---
        for &sink in topology.sinks() {
            let escapees = std::mem::take(&mut bins[sink]);
            for p in escapees {
                recycled_ids.insert(p.id);
                recycled_population += p.weight;
                let source = draw_source(topology, &mut self.rng)?;
                let mut child = Particle::new(self.fresh_id(), p.weight, source.pcoord_template.clone());
                child.primary_parent = Some(p.id);
                child.initial_region = Some(source.name.clone());
                flux[[sink, source.bin_id]] += child.weight;
                origin_bin.insert(child.id, source.bin_id);
                bins[source.bin_id].push(child);
            }
        }

        for b in 0..n_bins {
            let before: f64 = bins[b].iter().map(|p| p.weight).sum();
            let target = topology.target_count(b) as usize;

            if bins[b].is_empty() {
                if target > 0 && prev_had_particles[b] && !topology.is_sink(b) {
                    return Err(WeError::EmptyBinWithTarget {
                        bin: b,
                        target: target as u32,
                    });
                }
                continue;
            }

            self.split_bin(&mut bins[b], target)?;
            self.merge_bin(&mut bins[b], target, &mut merged_ids);

            let after: f64 = bins[b].iter().map(|p| p.weight).sum();
            let n = bins[b].len().max(1) as f64;
            if (after - before).abs() > f64::EPSILON * n * 4.0 {
                return Err(WeError::InvariantViolation {
                    detail: format!(
                        "bin {b} weight drifted from {before} to {after} during split/merge"
                    ),
                });
            }
        }

        // Record intra-bin flux (split/merge never moves a particle across
        // bins, so origin == destination for everything not recycled).
        let mut bin_populations = vec![0.0_f64; n_bins];
        let mut bin_nparticles = vec![0_u32; n_bins];
        let mut out: Vec<Particle> = Vec::with_capacity(n_particles_in);
        let mut out_bins: Vec<usize> = Vec::with_capacity(n_particles_in);
        for (b, particles) in bins.into_iter().enumerate() {
            for p in &particles {
                let origin = origin_bin.get(&p.id).copied().unwrap_or(b);
                if origin == b {
                    flux[[b, b]] += p.weight;
                }
                if p.weight <= 0.0 {
                    return Err(WeError::InvariantViolation {
                        detail: format!("particle {} has non-positive weight {}", p.id, p.weight),
                    });
                }
                bin_populations[b] += p.weight;
                bin_nparticles[b] += 1;
                out_bins.push(b);
            }
            out.extend(particles);
        }

        let total_weight_out: f64 = out.iter().map(|p| p.weight).sum();
        let n_particles_out = out.len().max(n_particles_in).max(1) as f64;
        if (total_weight_out - total_weight_in).abs() > f64::EPSILON * n_particles_out {
            return Err(WeError::InvariantViolation {
                detail: format!(
                    "total weight drifted from {total_weight_in} to {total_weight_out}"
                ),
            });
        }
        if recycled_population > 0.0 {
            debug!(recycled_population, "probability recycled this iteration");
        }

        Ok(ResampleOutcome {
            particles: out,
            particle_bin: out_bins,
            recycled_ids,
            merged_ids,
            bin_populations,
            bin_nparticles,
            bin_flux: flux,
            recycled_population,
        })
    }

    /// While `bin.len() < target`, split the heaviest particle into two
    /// half-weight copies (ties broken by ascending id). Both copies
    /// inherit `h`'s *root* ancestor, not `h.id` itself — `h` may already be
    /// a split product of an earlier step in this same pass, and only the
    /// original input particle's id corresponds to a real segment in iter N.
    fn split_bin(&mut self, bin: &mut Vec<Particle>, target: usize) -> Result<(), WeError> {
        while bin.len() < target {
            let idx = heaviest_index(bin);
            let h = bin.remove(idx);
            let half = h.weight / 2.0;
            if half < self.min_weight {
                return Err(WeError::WeightUnderflow {
                    parent: h.id,
                    weight: half,
                    minimum: self.min_weight,
                });
            }
            let root = h.primary_parent.unwrap_or(h.id);
            let mut c1 = Particle::new(self.fresh_id(), half, h.pcoord.clone());
            c1.primary_parent = Some(root);
            let mut c2 = Particle::new(self.fresh_id(), half, h.pcoord.clone());
            c2.primary_parent = Some(root);
            bin.push(c1);
            bin.push(c2);
        }
        Ok(())
    }

    /// While `bin.len() > target`, merge the two lightest particles
    /// (ties broken by ascending id) into one, with the surviving pcoord
    /// drawn in proportion to their weights. `merge_parents` is threaded
    /// through as the set of *real* iter-N ancestor ids — when one side is
    /// itself already a merge product from an earlier step in this pass,
    /// its `merge_parents` (not its own synthetic id) is what's real.
    fn merge_bin(&mut self, bin: &mut Vec<Particle>, target: usize, merged_ids: &mut BTreeSet<ParticleId>) {
        while bin.len() > target && bin.len() >= 2 {
            let (i, j) = two_lightest_indices(bin);
            // remove the larger index first so the smaller stays valid
            let (hi, lo) = if i > j { (i, j) } else { (j, i) };
            let a = bin.remove(hi);
            let b = bin.remove(lo);

            let weights = [a.weight, b.weight];
            let dist = WeightedIndex::new(weights).expect("positive weights");
            let chosen_is_a = dist.sample(&mut self.rng) == 0;
            let chosen = if chosen_is_a { &a } else { &b };

            let mut m = Particle::new(self.fresh_id(), a.weight + b.weight, chosen.pcoord.clone());
            m.primary_parent = Some(real_ancestor(chosen));
            let ancestors: BTreeSet<ParticleId> = real_ancestors(&a).union(&real_ancestors(&b)).copied().collect();
            for &id in &ancestors {
                merged_ids.insert(id);
            }
            m.merge_parents = ancestors;
            bin.push(m);
        }
        if bin.len() > target && target == 0 {
            warn!(remaining = bin.len(), "bin has target 0 but could not merge to empty");
        }
    }
}

/// The real (iter-N segment) id a particle ultimately descends from, for a
/// particle that has not itself been merged in this pass — a direct input,
/// a split child, or a recycled child all carry this in `primary_parent`
/// (falling back to `id` only for an untouched direct input, whose id
/// already is the real segment id).
fn real_ancestor(p: &Particle) -> ParticleId {
    p.primary_parent.unwrap_or(p.id)
}

/// All real ancestor ids a particle represents: its own `merge_parents` if
/// it is already a merge product (those are real ids by construction), or
/// its single `real_ancestor` otherwise.
fn real_ancestors(p: &Particle) -> BTreeSet<ParticleId> {
    if p.merge_parents.is_empty() {
        BTreeSet::from([real_ancestor(p)])
    } else {
        p.merge_parents.clone()
    }
}

fn heaviest_index(bin: &[Particle]) -> usize {
    let mut best = 0;
    for i in 1..bin.len() {
        let better = OrderedFloat(bin[i].weight) > OrderedFloat(bin[best].weight)
            || (bin[i].weight == bin[best].weight && bin[i].id < bin[best].id);
        if better {
            best = i;
        }
    }
    best
}

fn two_lightest_indices(bin: &[Particle]) -> (usize, usize) {
    let mut order: Vec<usize> = (0..bin.len()).collect();
    order.sort_by(|&a, &b| {
        OrderedFloat(bin[a].weight)
            .cmp(&OrderedFloat(bin[b].weight))
            .then(bin[a].id.cmp(&bin[b].id))
    });
    (order[0], order[1])
}

fn draw_source<'a>(
    topology: &'a BinTopology,
    rng: &mut StdRng,
) -> Result<&'a crate::bin_topology::SourceSpec, WeError> {
    let sources = topology.sources();
    if sources.is_empty() {
        return Err(WeError::ConfigError(
            "particle reached a sink but no sources are configured".to_string(),
        ));
    }
    let weights: Vec<f64> = sources.iter().map(|s| s.weight).collect();
    let dist = WeightedIndex::new(&weights).map_err(|e| WeError::ConfigError(e.to_string()))?;
    Ok(&sources[dist.sample(rng)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin_topology::{BinTopology, RectilinearBinMapper, SourceSpec};
    use std::collections::BTreeSet as Set;

    fn single_bin_topology(target: u32) -> BinTopology {
        let mapper = RectilinearBinMapper::new(vec![0.0, 10.0]);
        BinTopology::new(1, Box::new(mapper), vec![target], Vec::new(), Set::new())
    }

    #[test]
    fn s1_uniform_initial_is_unchanged_at_target() {
        let topo = single_bin_topology(10);
        let input: Vec<Particle> = (0..10).map(|i| Particle::new(i, 0.1, vec![1.0])).collect();
        let mut resampler = Resampler::new(42, 10, 1e-12);
        let outcome = resampler.resample(&topo, input, &[false]).unwrap();
        assert_eq!(outcome.particles.len(), 10);
        for p in &outcome.particles {
            assert!((p.weight - 0.1).abs() < 1e-12);
        }
        let norm: f64 = outcome.particles.iter().map(|p| p.weight).sum();
        assert!((norm - 1.0).abs() < 1e-9);
        assert!(outcome.merged_ids.is_empty());
        assert!(outcome.recycled_ids.is_empty());
    }

    #[test]
    fn s2_single_particle_splits_to_target() {
        let topo = single_bin_topology(4);
        let input = vec![Particle::new(1, 1.0, vec![1.0])];
        let mut resampler = Resampler::new(1, 2, 1e-12);
        let outcome = resampler.resample(&topo, input, &[false]).unwrap();
        assert_eq!(outcome.particles.len(), 4);
        for p in &outcome.particles {
            assert!((p.weight - 0.25).abs() < 1e-12);
            assert_eq!(p.primary_parent, Some(1));
        }
        let norm: f64 = outcome.particles.iter().map(|p| p.weight).sum();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn s3_merging_reduces_to_target_and_conserves_weight() {
        let topo = single_bin_topology(2);
        let input = vec![
            Particle::new(1, 0.1, vec![1.0]),
            Particle::new(2, 0.2, vec![1.0]),
            Particle::new(3, 0.3, vec![1.0]),
            Particle::new(4, 0.4, vec![1.0]),
        ];
        let mut resampler = Resampler::new(7, 5, 1e-12);
        let outcome = resampler.resample(&topo, input, &[false]).unwrap();
        assert_eq!(outcome.particles.len(), 2);
        let norm: f64 = outcome.particles.iter().map(|p| p.weight).sum();
        assert!((norm - 1.0).abs() < 1e-9);
        // Lightest-pair tie-break is (weight, then id): {1,2} (0.1,0.2) merge
        // first into a 0.3 product, which then ties with id3's 0.3 and loses
        // the id tie-break, so {id3, merge(1,2)} merge next. id4 (0.4) is
        // never the lightest pair and survives untouched.
        assert_eq!(outcome.merged_ids, Set::from([1, 2, 3]));
        assert!(outcome.particles.iter().any(|p| p.id == 4));
    }

    #[test]
    fn s4_recycling_reassigns_to_source_with_template() {
        let mapper = RectilinearBinMapper::new(vec![0.0, 1.0, 2.0]);
        let sources = vec![SourceSpec {
            bin_id: 0,
            name: "source_0".to_string(),
            weight: 1.0,
            pcoord_template: vec![0.1],
        }];
        let topo = BinTopology::new(1, Box::new(mapper), vec![1, 1], sources, Set::from([1]));
        let input = vec![Particle::new(1, 1.0, vec![1.5])];
        let mut resampler = Resampler::new(3, 2, 1e-12);
        let outcome = resampler.resample(&topo, input, &[false, false]).unwrap();
        assert_eq!(outcome.particles.len(), 1);
        let child = &outcome.particles[0];
        assert_eq!(child.pcoord, vec![0.1]);
        assert_eq!(child.initial_region.as_deref(), Some("source_0"));
        assert_eq!(child.primary_parent, Some(1));
        assert!(outcome.recycled_ids.contains(&1));
        assert_eq!(outcome.recycled_population, 1.0);
    }

    #[test]
    fn determinism_same_seed_same_outcome() {
        let topo = single_bin_topology(2);
        let input = || {
            vec![
                Particle::new(1, 0.1, vec![1.0]),
                Particle::new(2, 0.2, vec![1.0]),
                Particle::new(3, 0.3, vec![1.0]),
                Particle::new(4, 0.4, vec![1.0]),
            ]
        };
        let mut r1 = Resampler::new(99, 5, 1e-12);
        let o1 = r1.resample(&topo, input(), &[false]).unwrap();
        let mut r2 = Resampler::new(99, 5, 1e-12);
        let o2 = r2.resample(&topo, input(), &[false]).unwrap();
        let w1: Vec<f64> = o1.particles.iter().map(|p| p.weight).collect();
        let w2: Vec<f64> = o2.particles.iter().map(|p| p.weight).collect();
        assert_eq!(w1, w2);
    }

    #[test]
    fn empty_bin_with_target_and_prior_population_errors() {
        let topo = single_bin_topology(2);
        let mut resampler = Resampler::new(1, 1, 1e-12);
        let err = resampler.resample(&topo, Vec::new(), &[true]).unwrap_err();
        assert!(matches!(err, WeError::EmptyBinWithTarget { .. }));
    }

    #[test]
    fn empty_bin_with_no_prior_population_is_not_an_error() {
        let topo = single_bin_topology(2);
        let mut resampler = Resampler::new(1, 1, 1e-12);
        let outcome = resampler.resample(&topo, Vec::new(), &[false]).unwrap();
        assert!(outcome.particles.is_empty());
    }
}
