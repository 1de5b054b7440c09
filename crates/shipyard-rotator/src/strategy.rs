//! Rotation batches: which worker nodes go out of service together.

use serde::{Deserialize, Serialize};

/// The nodes of one cluster grouped into rotation batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPlan {
    pub batches: Vec<Vec<String>>,
}

impl RotationPlan {
    /// Split `nodes` into consecutive batches of at most `max_scaling`.
    pub fn new(nodes: &[String], max_scaling: u32) -> Self {
        let size = max_scaling.max(1) as usize;
        let batches = nodes.chunks(size).map(<[String]>::to_vec).collect();
        Self { batches }
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.iter().map(Vec::len).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Number of batches needed for `total_nodes` at `batch_size` per batch.
pub fn batch_count(total_nodes: u32, batch_size: u32) -> u32 {
    total_nodes.div_ceil(batch_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("node-{i}")).collect()
    }

    #[test]
    fn five_nodes_two_at_a_time() {
        let plan = RotationPlan::new(&nodes(5), 2);
        assert_eq!(plan.batch_sizes(), [2, 2, 1]);
        assert_eq!(plan.batches[2], ["node-4"]);
        assert_eq!(plan.batch_count() as u32, batch_count(5, 2));
    }

    #[test]
    fn batch_larger_than_cluster() {
        let plan = RotationPlan::new(&nodes(3), 10);
        assert_eq!(plan.batch_sizes(), [3]);
    }

    #[test]
    fn zero_max_scaling_rotates_one_at_a_time() {
        let plan = RotationPlan::new(&nodes(3), 0);
        assert_eq!(plan.batch_sizes(), [1, 1, 1]);
    }

    #[test]
    fn empty_cluster() {
        assert!(RotationPlan::new(&[], 2).is_empty());
        assert_eq!(batch_count(0, 2), 0);
    }
}
