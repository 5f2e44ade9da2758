pub mod data;
pub mod dist;
pub mod heap_structs;
pub mod rng;
pub mod traits;

use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::collections::BinaryHeap;

use crate::utils::data::*;
use crate::utils::heap_structs::*;
use crate::utils::traits::KnnFloat;

/////////////////
// Exhaustive  //
/////////////////

/// Exhaustive search for ground truth
///
/// ### Params
///
/// * `dataset` - The trained points
/// * `query` - The query point
/// * `k` - Number of neighbours to return
/// * `exclude` - Optional trained index to skip (the query itself)
///
/// ### Returns
///
/// Tuple of `(indices, dist)` sorted ascending, with true (corrected)
/// distances
pub fn exhaustive_query<T: KnnFloat>(
    dataset: &Dataset<T>,
    query: &QueryPoint<T>,
    k: usize,
    exclude: Option<usize>,
) -> (Vec<usize>, Vec<T>) {
    let k = k.min(dataset.n());
    let mut heap: BinaryHeap<(OrderedFloat<T>, usize)> = BinaryHeap::with_capacity(k + 1);

    for idx in 0..dataset.n() {
        if Some(idx) == exclude {
            continue;
        }
        let dist = dataset.distance_to_query(idx, query);
        if heap.len() < k {
            heap.push((OrderedFloat(dist), idx));
        } else if let Some(&(OrderedFloat(worst), _)) = heap.peek() {
            if dist < worst {
                heap.pop();
                heap.push((OrderedFloat(dist), idx));
            }
        }
    }

    let metric = dataset.metric();
    heap.into_sorted_vec()
        .into_iter()
        .map(|(OrderedFloat(dist), idx)| (idx, metric.correct(dist)))
        .unzip()
}

/// Exact kNN graph of the trained points (self excluded)
///
/// Quadratic; meant for tests and recall checks on moderate data sizes.
///
/// ### Params
///
/// * `dataset` - The trained points
/// * `k` - Number of neighbours per point
///
/// ### Returns
///
/// Tuple of `(indices, distances)`, one row per point
pub fn exhaustive_knn<T: KnnFloat>(
    dataset: &Dataset<T>,
    k: usize,
) -> (Vec<Vec<usize>>, Vec<Vec<T>>) {
    (0..dataset.n())
        .into_par_iter()
        .map(|i| exhaustive_query(dataset, &dataset.as_query(i), k, Some(i)))
        .unzip()
}

/// Average recall of approximate neighbour lists against ground truth
///
/// ### Params
///
/// * `approx` - Approximate neighbour indices per point
/// * `truth` - True neighbour indices per point
///
/// ### Returns
///
/// Mean over points of `|approx[i] ∩ truth[i]| / |truth[i]|`
pub fn recall(approx: &[Vec<usize>], truth: &[Vec<usize>]) -> f64 {
    if truth.is_empty() {
        return 1.0;
    }

    let total: f64 = approx
        .iter()
        .zip(truth)
        .map(|(a, t)| {
            if t.is_empty() {
                return 1.0;
            }
            let approx_set: FxHashSet<_> = a.iter().copied().collect();
            let matches = t.iter().filter(|idx| approx_set.contains(idx)).count();
            matches as f64 / t.len() as f64
        })
        .sum();

    total / truth.len() as f64
}

///////////
// Tests //
///////////
