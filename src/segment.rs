use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Stable reference to a segment: `(n_iter, seg_id)`. Used for parent and
/// merge-parent links instead of an in-memory back-reference, per the
/// "dynamic object graphs with back-references" design note — parents
/// always belong to a strictly earlier iteration, so no cycle is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentRef {
    pub n_iter: u64,
    pub seg_id: u64,
}

impl SegmentRef {
    pub fn new(n_iter: u64, seg_id: u64) -> Self {
        SegmentRef { n_iter, seg_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Prepared,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointType {
    Continuation,
    Merged,
    Recycled,
}

/// A value in a segment's opaque `data` map. Known keys get typed variants;
/// anything else round-trips as `Other` so forward-incompatible keys from a
/// newer writer are preserved rather than dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    InitialRegion(String),
    OldSegId(u64),
    Other(serde_json::Value),
}

pub type SegmentData = BTreeMap<String, DataValue>;

pub fn initial_region_of(data: &SegmentData) -> Option<&str> {
    match data.get("initial_region") {
        Some(DataValue::InitialRegion(name)) => Some(name.as_str()),
        _ => None,
    }
}

pub fn set_initial_region(data: &mut SegmentData, name: impl Into<String>) {
    data.insert("initial_region".to_string(), DataValue::InitialRegion(name.into()));
}

/// One propagation unit from generation `n_iter - 1` to `n_iter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub seg_id: u64,
    pub n_iter: u64,
    pub weight: f64,
    /// Progress-coordinate trajectory; `pcoord[0]` is the starting point,
    /// `pcoord.last()` is the endpoint consumed by resampling.
    pub pcoord: Vec<Vec<f64>>,
    pub status: SegmentStatus,
    pub endpoint_type: EndpointType,
    pub primary_parent_ref: Option<SegmentRef>,
    pub merge_parents_ref: Vec<SegmentRef>,
    pub cputime: f64,
    pub walltime: f64,
    pub data: SegmentData,
}

impl Segment {
    pub fn new_prepared(seg_id: u64, n_iter: u64, weight: f64, start_pcoord: Vec<f64>) -> Self {
        Segment {
            seg_id,
            n_iter,
            weight,
            pcoord: vec![start_pcoord],
            status: SegmentStatus::Prepared,
            endpoint_type: EndpointType::Continuation,
            primary_parent_ref: None,
            merge_parents_ref: Vec::new(),
            cputime: 0.0,
            walltime: 0.0,
            data: SegmentData::new(),
        }
    }

    pub fn reference(&self) -> SegmentRef {
        SegmentRef::new(self.n_iter, self.seg_id)
    }

    pub fn endpoint(&self) -> &[f64] {
        self.pcoord.last().expect("segment pcoord is never empty")
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.status, SegmentStatus::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_prepared_seeds_pcoord_with_start_point() {
        let seg = Segment::new_prepared(3, 1, 0.25, vec![1.0, 2.0]);
        assert_eq!(seg.pcoord.len(), 1);
        assert_eq!(seg.endpoint(), &[1.0, 2.0]);
        assert_eq!(seg.status, SegmentStatus::Prepared);
        assert!(seg.primary_parent_ref.is_none());
    }

    #[test]
    fn reference_round_trips_iter_and_id() {
        let seg = Segment::new_prepared(7, 4, 0.1, vec![0.0]);
        assert_eq!(seg.reference(), SegmentRef::new(4, 7));
    }

    #[test]
    fn data_map_preserves_known_and_unknown_keys() {
        let mut data = SegmentData::new();
        set_initial_region(&mut data, "source_0");
        data.insert("old_seg_id".to_string(), DataValue::OldSegId(42));
        data.insert(
            "future_key".to_string(),
            DataValue::Other(serde_json::json!({"x": 1})),
        );
        assert_eq!(initial_region_of(&data), Some("source_0"));
        assert_eq!(data.len(), 3);
    }
}
