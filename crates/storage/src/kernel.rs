//! Exact-scan search kernel
//!
//! The reference [`SearchKernel`]: a brute-force scan over one decoded
//! segment with blacklist masking and per-query top-k selection. ANN
//! kernels plug in behind the same trait; the engine's fan-out and merge
//! logic never sees the difference.

use crate::distance::{inner_product, l2_squared};
use magnetite_core::{Error, MetricType, Result, SearchHits, SearchKernel, SegmentData};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashSet;

/// A candidate in the per-query selection heap.
///
/// The heap keeps the *worst* candidate on top so it can be displaced in
/// O(log k); `worse_than` encodes the metric's direction.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: i64,
    score: f32,
    larger_is_closer: bool,
}

impl Candidate {
    fn worse_than(&self, other: &Candidate) -> bool {
        if self.larger_is_closer {
            self.score < other.score
        } else {
            self.score > other.score
        }
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.id == other.id
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.worse_than(other) {
            Ordering::Greater
        } else if other.worse_than(self) {
            Ordering::Less
        } else {
            // deterministic tie-break: larger id is "worse"
            self.id.cmp(&other.id)
        }
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Brute-force exact search over float vectors.
#[derive(Debug, Default)]
pub struct BruteForceKernel;

impl SearchKernel for BruteForceKernel {
    fn search(
        &self,
        data: &SegmentData,
        queries: &[f32],
        dim: usize,
        k: usize,
        _nprobe: usize,
        metric: MetricType,
        blacklist: &HashSet<i64>,
    ) -> Result<SearchHits> {
        if metric.is_binary() {
            return Err(Error::invalid_argument(format!(
                "metric {} needs a binary search kernel",
                metric
            )));
        }
        if dim == 0 || queries.len() % dim != 0 {
            return Err(Error::invalid_argument("query shape mismatch"));
        }
        if data.dim != dim {
            return Err(Error::dimension_mismatch(data.dim, dim));
        }
        if k == 0 {
            return Err(Error::invalid_argument("k must be positive"));
        }

        let nq = queries.len() / dim;
        let larger_is_closer = metric.larger_is_closer();
        let pad_score = if larger_is_closer { f32::MIN } else { f32::MAX };

        let mut ids = Vec::with_capacity(nq * k);
        let mut distances = Vec::with_capacity(nq * k);

        for q in 0..nq {
            let query = &queries[q * dim..(q + 1) * dim];
            // max-heap of the worst kept candidate
            let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(k + 1);

            for row in 0..data.row_count() {
                let id = data.ids[row];
                if blacklist.contains(&id) {
                    continue;
                }
                let score = match metric {
                    MetricType::L2 => l2_squared(query, data.row(row)),
                    MetricType::Ip => inner_product(query, data.row(row)),
                    _ => unreachable!("binary metrics rejected above"),
                };
                let candidate = Candidate {
                    id,
                    score,
                    larger_is_closer,
                };
                if heap.len() < k {
                    heap.push(candidate);
                } else if let Some(worst) = heap.peek() {
                    if worst.worse_than(&candidate) {
                        heap.pop();
                        heap.push(candidate);
                    }
                }
            }

            let mut kept = heap.into_sorted_vec(); // best first
            kept.truncate(k);
            for candidate in &kept {
                ids.push(candidate.id);
                distances.push(candidate.score);
            }
            for _ in kept.len()..k {
                ids.push(-1);
                distances.push(pad_score);
            }
        }

        Ok(SearchHits { ids, distances, k })
    }
}
