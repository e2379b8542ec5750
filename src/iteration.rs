use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Per-iteration summary statistics persisted by the `DataStore`
/// (spec.md §3). `bin_flux` is only populated for `n_iter > 0`, mirroring
/// `default.py:222-223` (`if we_iter.we_iter > 0: we_data['bins_flux'] = ...`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationSummary {
    pub n_iter: u64,
    pub n_particles: u32,
    pub norm: f64,
    pub cputime_sum: f64,
    pub walltime_sum: f64,
    pub starttime: Option<f64>,
    pub endtime: Option<f64>,
    pub bin_populations: Vec<f64>,
    pub bin_nparticles: Vec<u32>,
    #[serde(with = "flux_serde")]
    pub bin_flux: Option<Array2<f64>>,
    pub recycled_population: f64,
}

impl IterationSummary {
    pub fn opening(n_iter: u64, n_particles: u32, norm: f64, bin_populations: Vec<f64>, bin_nparticles: Vec<u32>) -> Self {
        IterationSummary {
            n_iter,
            n_particles,
            norm,
            cputime_sum: 0.0,
            walltime_sum: 0.0,
            starttime: None,
            endtime: None,
            bin_populations,
            bin_nparticles,
            bin_flux: None,
            recycled_population: 0.0,
        }
    }
}

/// `ndarray::Array2` doesn't implement `Serialize`/`Deserialize` for an
/// `Option` wrapper directly in a field-friendly way here (the `serde`
/// feature serializes the array itself, not the `Option`), so this module
/// bridges it through a `(rows, cols, data)` tuple representation.
mod flux_serde {
    use ndarray::Array2;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Array2<f64>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            None => s.serialize_none(),
            Some(arr) => {
                let (rows, cols) = arr.dim();
                let data: Vec<f64> = arr.iter().copied().collect();
                (rows, cols, data).serialize(s)
            }
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Array2<f64>>, D::Error> {
        let raw: Option<(usize, usize, Vec<f64>)> = Option::deserialize(d)?;
        Ok(match raw {
            None => None,
            Some((rows, cols, data)) => {
                Some(Array2::from_shape_vec((rows, cols), data).map_err(serde::de::Error::custom)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_summary_has_no_flux_and_zero_timing() {
        let s = IterationSummary::opening(1, 10, 1.0, vec![1.0], vec![10]);
        assert!(s.bin_flux.is_none());
        assert_eq!(s.cputime_sum, 0.0);
    }

    #[test]
    fn flux_matrix_round_trips_through_json() {
        let mut s = IterationSummary::opening(2, 4, 1.0, vec![0.5, 0.5], vec![2, 2]);
        s.bin_flux = Some(Array2::from_shape_vec((2, 2), vec![0.1, 0.2, 0.3, 0.4]).unwrap());
        let json = serde_json::to_string(&s).unwrap();
        let back: IterationSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bin_flux.unwrap(), s.bin_flux.unwrap());
    }
}
