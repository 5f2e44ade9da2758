#![allow(clippy::needless_range_loop)] // I want these loops!

pub mod error;
pub mod nndescent;
pub mod progress;
pub mod query;
pub mod rp_forest;
pub mod synthetic;
pub mod utils;

pub use crate::error::{NNDescentError, Result};
pub use crate::nndescent::{DescentState, NNDescent, NNDescentParams, NeighbourGraph};
pub use crate::progress::{ProgressEvent, ProgressObserver, StdoutObserver};
pub use crate::utils::data::{CsrRef, DataInput};
pub use crate::utils::dist::{parse_metric, Metric};

use crate::utils::traits::KnnFloat;

////////////////
// NN-Descent //
////////////////

/// Build an NN-Descent index
///
/// ### Params
///
/// * `data` - The data. Dense with rows = samples and columns = features, or
///   sparse CSR.
/// * `metric` - Name of the distance metric, e.g. `"euclidean"`, `"cosine"`
///   or `"minkowski"`
/// * `metric_kwds` - Keyword arguments of the metric, e.g. `[("p", 3.0)]`
/// * `n_neighbors` - Number of neighbours for the kNN graph
/// * `n_trees` - Optional number of RP trees
/// * `n_iters` - Optional maximum number of descent rounds
/// * `max_candidates` - Optional number of sampled candidates per round
/// * `delta` - Early stop criterium for the algorithm
/// * `leaf_size` - Optional maximum RP tree leaf size
/// * `seed` - Random seed for reproducibility
/// * `verbose` - Print progress to stdout
///
/// ### Returns
///
/// The built `NNDescent` index
#[allow(clippy::too_many_arguments)]
pub fn build_nndescent_index<T: KnnFloat>(
    data: DataInput<T>,
    metric: &str,
    metric_kwds: &[(&str, f64)],
    n_neighbors: usize,
    n_trees: Option<usize>,
    n_iters: Option<usize>,
    max_candidates: Option<usize>,
    delta: f64,
    leaf_size: Option<usize>,
    seed: u64,
    verbose: bool,
) -> Result<NNDescent<T>> {
    let params = NNDescentParams {
        metric: metric.to_string(),
        metric_kwds: metric_kwds
            .iter()
            .map(|&(key, value)| (key.to_string(), value))
            .collect(),
        n_neighbors,
        n_trees,
        n_iters,
        max_candidates,
        delta,
        leaf_size,
        seed,
        verbose,
        max_build_time: None,
    };
    NNDescent::new(data, &params)
}

/// Helper function to query a given NN-Descent index
///
/// ### Params
///
/// * `query` - The query points, dense or sparse
/// * `index` - The NN-Descent index
/// * `k` - Number of neighbours to return
/// * `search_budget` - Optional graph expansions per neighbour (default 5.0)
/// * `return_dist` - Shall the distances be returned
///
/// ### Returns
///
/// A tuple of `(knn_indices, optional distances)`
pub fn query_nndescent_index<T: KnnFloat>(
    query: DataInput<T>,
    index: &NNDescent<T>,
    k: usize,
    search_budget: Option<f64>,
    return_dist: bool,
) -> Result<(Vec<Vec<usize>>, Option<Vec<Vec<T>>>)> {
    let (indices, distances) = index.query(query, k, search_budget)?;
    Ok((indices, return_dist.then_some(distances)))
}

/// Get the kNN graph of the data via NN-Descent
///
/// Builds an index with default parameters and returns its graph.
///
/// ### Params
///
/// * `data` - The data, dense or sparse
/// * `dist_metric` - Name of the distance metric
/// * `no_neighbours` - Number of neighbours for the KNN graph
/// * `seed` - Seed for the NN Descent algorithm
/// * `verbose` - Controls verbosity of the algorithm
/// * `return_distances` - Shall the distances be returned
///
/// ### Returns
///
/// The k-nearest neighbours of every point (the point itself excluded)
pub fn generate_knn_nndescent_with_dist<T: KnnFloat>(
    data: DataInput<T>,
    dist_metric: &str,
    no_neighbours: usize,
    seed: u64,
    verbose: bool,
    return_distances: bool,
) -> Result<(Vec<Vec<usize>>, Option<Vec<Vec<T>>>)> {
    let params = NNDescentParams {
        metric: dist_metric.to_string(),
        n_neighbors: no_neighbours,
        seed,
        verbose,
        ..Default::default()
    };
    let index = NNDescent::new(data, &params)?;
    let (indices, distances) = index.neighbour_graph().to_nested();

    Ok((indices, return_distances.then_some(distances)))
}

///////////
// Tests //
///////////
