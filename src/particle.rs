use std::collections::BTreeSet;

/// Transient particle identity: the `seg_id` of the iter-N segment it was
/// built from, preserved across the resampler (spec.md §4.3: "build
/// Particle objects (preserving seg_id as particle_id)").
pub type ParticleId = u64;

/// A weighted point in phase space, used only inside the `Resampler`.
/// Lineage here is by id, not by owned back-reference — the same
/// arena-of-ids pattern used for `Segment::primary_parent_ref`, since a
/// particle that owns its own parent recursively can't be represented
/// without unbounded nesting.
#[derive(Debug, Clone)]
pub struct Particle {
    pub id: ParticleId,
    pub weight: f64,
    pub pcoord: Vec<f64>,
    pub primary_parent: Option<ParticleId>,
    pub merge_parents: BTreeSet<ParticleId>,
    pub initial_region: Option<String>,
}

impl Particle {
    pub fn new(id: ParticleId, weight: f64, pcoord: Vec<f64>) -> Self {
        Particle {
            id,
            weight,
            pcoord,
            primary_parent: None,
            merge_parents: BTreeSet::new(),
            initial_region: None,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_particle_has_no_lineage() {
        let p = Particle::new(1, 1.0, vec![0.5, 0.5]);
        assert_eq!(p.primary_parent, None);
        assert!(p.merge_parents.is_empty());
    }
}
