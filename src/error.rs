use thiserror::Error;

/// Every failure kind named in the error-handling design (spec.md §7).
///
/// `InvariantViolation` and `WeightUnderflow` are fatal to the whole
/// simulation; `PropagationIncomplete`, `StoreTransactionFailure`, and
/// `Timeout` are recoverable at the `SimLoop` level; `ReweightingRejected`
/// is swallowed locally by the `ReweightingDriver`.
#[derive(Error, Debug)]
pub enum WeError {
    #[error("iteration advance attempted with {n_incomplete} incomplete segment(s)")]
    PropagationIncomplete { n_incomplete: usize },

    #[error("invariant violation: {detail}")]
    InvariantViolation { detail: String },

    #[error("pcoord {pcoord:?} has no bin")]
    OutOfDomain { pcoord: Vec<f64> },

    #[error("split of particle {parent} produced weight {weight} below minimum {minimum}")]
    WeightUnderflow {
        parent: u64,
        weight: f64,
        minimum: f64,
    },

    #[error("bin {bin} has target occupancy {target} but is empty with no source")]
    EmptyBinWithTarget { bin: usize, target: u32 },

    #[error("reweighting rejected: {reason}")]
    ReweightingRejected { reason: String },

    #[error("store transaction failed: {0}")]
    StoreTransactionFailure(String),

    #[error("propagation timed out after {elapsed_secs}s waiting for {n_running} segment(s)")]
    Timeout {
        elapsed_secs: u64,
        n_running: usize,
    },

    #[error("configuration error: {0}")]
    ConfigError(String),
}

pub type WeResult<T> = Result<T, WeError>;
