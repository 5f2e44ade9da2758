use rand::Rng;
use rayon::prelude::*;
use std::time::{Duration, Instant};
use thousands::*;
use tracing::{debug, trace};

use crate::error::{NNDescentError, Result};
use crate::progress::*;
use crate::query::SearchGraph;
use crate::rp_forest::*;
use crate::utils::data::*;
use crate::utils::dist::*;
use crate::utils::heap_structs::*;
use crate::utils::rng::*;
use crate::utils::traits::KnnFloat;

/// Points per local join block. Updates of a block are applied before the
/// next block is joined, which bounds the buffered update memory.
const JOIN_BLOCK_SIZE: usize = 16_384;

////////////
// Params //
////////////

/// Construction parameters of an NN-Descent index
///
/// ### Fields
///
/// * `metric` - Metric name, see `parse_metric`
/// * `metric_kwds` - Metric keyword arguments, e.g. `("p", 3.0)` for
///   Minkowski
/// * `n_neighbors` - Neighbours per point in the graph
/// * `n_trees` - Trees in the RP forest. Defaults to
///   `min(32, 5 + round(n^0.25))`.
/// * `n_iters` - Maximum descent rounds. Defaults to `max(5, round(log2 n))`.
/// * `max_candidates` - Sampled candidates per point and round. Defaults to
///   `min(60, n_neighbors)`.
/// * `delta` - Convergence fraction. The loop stops once a round makes at
///   most `delta * n * n_neighbors` heap insertions.
/// * `leaf_size` - Maximum RP tree leaf size. Defaults to
///   `max(10, n_neighbors)`.
/// * `seed` - Seed of the master random state
/// * `verbose` - Report progress to the observer
/// * `max_build_time` - Optional time budget, checked between rounds
#[derive(Clone, Debug)]
pub struct NNDescentParams {
    pub metric: String,
    pub metric_kwds: Vec<(String, f64)>,
    pub n_neighbors: usize,
    pub n_trees: Option<usize>,
    pub n_iters: Option<usize>,
    pub max_candidates: Option<usize>,
    pub delta: f64,
    pub leaf_size: Option<usize>,
    pub seed: u64,
    pub verbose: bool,
    pub max_build_time: Option<Duration>,
}

impl Default for NNDescentParams {
    fn default() -> Self {
        Self {
            metric: "euclidean".to_string(),
            metric_kwds: Vec::new(),
            n_neighbors: 15,
            n_trees: None,
            n_iters: None,
            max_candidates: None,
            delta: 0.001,
            leaf_size: None,
            seed: 42,
            verbose: false,
            max_build_time: None,
        }
    }
}

impl NNDescentParams {
    fn resolve_n_trees(&self, n: usize) -> usize {
        self.n_trees
            .unwrap_or_else(|| (5 + (n as f64).powf(0.25).round() as usize).min(32))
            .max(1)
    }

    fn resolve_n_iters(&self, n: usize) -> usize {
        self.n_iters
            .unwrap_or_else(|| ((n as f64).log2().round() as usize).max(5))
    }

    fn resolve_max_candidates(&self) -> usize {
        self.max_candidates
            .unwrap_or(self.n_neighbors.min(60))
            .max(1)
    }

    fn resolve_leaf_size(&self) -> usize {
        self.leaf_size.unwrap_or(self.n_neighbors.max(10)).max(1)
    }
}

///////////
// Graph //
///////////

/// Final kNN graph as two parallel `n x k` row-major arrays
///
/// Rows are sorted ascending by distance; distances are true metric values.
#[derive(Clone, Debug, PartialEq)]
pub struct NeighbourGraph<T> {
    indices: Vec<usize>,
    distances: Vec<T>,
    n: usize,
    k: usize,
}

impl<T: Copy> NeighbourGraph<T> {
    /// Neighbours of point `i`
    ///
    /// ### Returns
    ///
    /// Tuple of `(indices, distances)`
    #[inline]
    pub fn row(&self, i: usize) -> (&[usize], &[T]) {
        let range = i * self.k..(i + 1) * self.k;
        (&self.indices[range.clone()], &self.distances[range])
    }

    /// Flat neighbour indices
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Flat neighbour distances
    pub fn distances(&self) -> &[T] {
        &self.distances
    }

    /// Number of points
    pub fn n(&self) -> usize {
        self.n
    }

    /// Neighbours per point
    pub fn k(&self) -> usize {
        self.k
    }

    /// Copy into one vector per point
    pub fn to_nested(&self) -> (Vec<Vec<usize>>, Vec<Vec<T>>) {
        (0..self.n)
            .map(|i| {
                let (indices, distances) = self.row(i);
                (indices.to_vec(), distances.to_vec())
            })
            .unzip()
    }
}

/////////////
// Descent //
/////////////

/// Lifecycle of the graph construction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescentState {
    Uninitialized,
    Seeded,
    Refining,
    Converged,
}

/// Bounded candidate lists, one max-heap on random priority per point
struct CandidateLists {
    width: usize,
    indices: Vec<u32>,
    priorities: Vec<f64>,
}

impl CandidateLists {
    fn new(n: usize, width: usize) -> Self {
        Self {
            width,
            indices: vec![EMPTY; n * width],
            priorities: vec![f64::INFINITY; n * width],
        }
    }

    #[inline]
    fn row(&self, i: usize) -> &[u32] {
        &self.indices[i * self.width..(i + 1) * self.width]
    }

    fn par_rows_mut(&mut self) -> impl IndexedParallelIterator<Item = (&mut [u32], &mut [f64])> {
        self.indices
            .par_chunks_mut(self.width)
            .zip(self.priorities.par_chunks_mut(self.width))
    }
}

/// Transient working state of the refinement loop
///
/// ### Fields
///
/// * `dataset` - The training data
/// * `heap` - One bounded heap per point
/// * `max_candidates` - Sampled candidates per point and round
/// * `state` - Where in the lifecycle the construction is
struct Descent<'a, T> {
    dataset: &'a Dataset<T>,
    heap: NeighbourHeap<T>,
    max_candidates: usize,
    state: DescentState,
}

impl<'a, T: KnnFloat> Descent<'a, T> {
    fn new(dataset: &'a Dataset<T>, k: usize, max_candidates: usize) -> Self {
        Self {
            dataset,
            heap: NeighbourHeap::new(dataset.n(), k),
            max_candidates,
            state: DescentState::Uninitialized,
        }
    }

    /// Initialise every heap from the forest leaves
    ///
    /// Each point is offered its leaf-mates from all trees. A heap that is
    /// still not full afterwards is topped up with random points, and finally
    /// by a scan in index order, so every row holds `k` distinct neighbours.
    ///
    /// ### Params
    ///
    /// * `forest` - The built RP forest
    /// * `fill_seed` - Seed for the random top-up
    fn seed(&mut self, forest: &RpForest<T>, fill_seed: u64) {
        debug_assert_eq!(self.state, DescentState::Uninitialized);
        let dataset = self.dataset;
        let n = dataset.n();
        let k = self.heap.k();

        let n_filled: usize = self
            .heap
            .par_rows_mut()
            .map(|mut row| {
                let i = row.point;
                for tree in forest.trees() {
                    for &j in tree.leaf_of_point(i) {
                        if j != i && !row.indices.contains(&(j as u32)) {
                            row.push(j, dataset.distance(i, j));
                        }
                    }
                }

                if row.is_full() {
                    return 0;
                }

                let mut rng = derive_rng(fill_seed, Stream::Fill, i);
                let mut attempts = 0;
                while !row.is_full() && attempts < 4 * k + 32 {
                    let j = rng.random_range(0..n);
                    if j != i && !row.indices.contains(&(j as u32)) {
                        row.push(j, dataset.distance(i, j));
                    }
                    attempts += 1;
                }
                for j in 0..n {
                    if row.is_full() {
                        break;
                    }
                    if j != i && !row.indices.contains(&(j as u32)) {
                        row.push(j, dataset.distance(i, j));
                    }
                }
                1
            })
            .sum();

        debug!(n_filled, "seeded heaps from forest leaves");
        self.state = DescentState::Seeded;
    }

    /// Build the sampled new and old candidate lists of one round
    ///
    /// Every heap entry `(i, j)` gets a random priority and is offered to the
    /// lists of both `i` and `j`, so reverse neighbours take part in the join.
    /// Entries end up in the new or old lists according to their flag; the
    /// `max_candidates` lowest priorities per point are kept.
    fn build_candidates(&self, round_seed: u64) -> (CandidateLists, CandidateLists) {
        let n = self.heap.n();
        let k = self.heap.k();

        let mut priorities = vec![0.0f64; n * k];
        priorities
            .par_chunks_mut(k)
            .enumerate()
            .for_each(|(i, chunk)| {
                let mut rng = derive_rng(round_seed, Stream::Sampling, i);
                for p in chunk.iter_mut() {
                    *p = rng.random::<f64>();
                }
            });

        let mut per_node: Vec<Vec<(u32, f64, bool)>> = vec![Vec::with_capacity(2 * k); n];
        for i in 0..n {
            let (indices, _, flags) = self.heap.row(i);
            for s in 0..k {
                let j = indices[s];
                if j == EMPTY {
                    continue;
                }
                let priority = priorities[i * k + s];
                per_node[i].push((j, priority, flags[s]));
                per_node[j as usize].push((i as u32, priority, flags[s]));
            }
        }

        let mut new_cands = CandidateLists::new(n, self.max_candidates);
        let mut old_cands = CandidateLists::new(n, self.max_candidates);

        new_cands
            .par_rows_mut()
            .zip(old_cands.par_rows_mut())
            .zip(per_node.par_iter())
            .for_each(|(((new_idx, new_pri), (old_idx, old_pri)), offers)| {
                for &(j, priority, is_new) in offers {
                    if is_new {
                        checked_heap_push(new_idx, new_pri, None, j, priority, false);
                    } else {
                        checked_heap_push(old_idx, old_pri, None, j, priority, false);
                    }
                }
            });

        (new_cands, old_cands)
    }

    /// Clear the new flag of every entry that was sampled into the new list
    fn mark_as_old(&mut self, new_cands: &CandidateLists) {
        self.heap.par_rows_mut().for_each(|mut row| {
            let sampled = new_cands.row(row.point);
            for (idx, flag) in row.indices.iter().zip(row.flags.iter_mut()) {
                if *flag && sampled.contains(idx) {
                    *flag = false;
                }
            }
        });
    }

    /// Local join over a block of points
    ///
    /// Pairs new x new and new x old candidates of every point in the block
    /// and keeps those that would improve at least one of the two heaps
    /// according to the current thresholds.
    fn generate_updates(
        &self,
        block: std::ops::Range<usize>,
        new_cands: &CandidateLists,
        old_cands: &CandidateLists,
    ) -> Vec<Vec<(u32, u32, T)>> {
        let dataset = self.dataset;
        let heap = &self.heap;

        block
            .into_par_iter()
            .map(|i| {
                let new: Vec<u32> = new_cands
                    .row(i)
                    .iter()
                    .copied()
                    .filter(|&j| j != EMPTY)
                    .collect();
                let old: Vec<u32> = old_cands
                    .row(i)
                    .iter()
                    .copied()
                    .filter(|&j| j != EMPTY)
                    .collect();

                let mut updates = Vec::new();
                for (a, &p) in new.iter().enumerate() {
                    let (pu, p_thr) = (p as usize, heap.threshold(p as usize));

                    for &q in new[a + 1..].iter().chain(old.iter()) {
                        if q == p {
                            continue;
                        }
                        let qu = q as usize;
                        let d = dataset.distance(pu, qu);
                        if d < p_thr || d < heap.threshold(qu) {
                            updates.push((p, q, d));
                        }
                    }
                }
                updates
            })
            .collect()
    }

    /// Apply buffered updates, each heap by exactly one worker
    ///
    /// ### Returns
    ///
    /// Number of successful insertions
    fn apply_updates(&mut self, updates: Vec<Vec<(u32, u32, T)>>) -> usize {
        let n = self.heap.n();
        let mut per_node: Vec<Vec<(usize, T)>> = vec![Vec::new(); n];
        for (p, q, d) in updates.into_iter().flatten() {
            per_node[p as usize].push((q as usize, d));
            per_node[q as usize].push((p as usize, d));
        }

        self.heap
            .par_rows_mut()
            .zip(per_node.par_iter())
            .map(|(mut row, offers)| {
                offers
                    .iter()
                    .filter(|&&(j, d)| row.push(j, d))
                    .count()
            })
            .sum()
    }

    /// One refinement round
    ///
    /// ### Params
    ///
    /// * `round_seed` - Seed of this round's candidate sampling
    ///
    /// ### Returns
    ///
    /// Number of successful heap insertions in the round
    fn round(&mut self, round_seed: u64) -> usize {
        debug_assert!(matches!(
            self.state,
            DescentState::Seeded | DescentState::Refining
        ));
        self.state = DescentState::Refining;

        let start = Instant::now();
        let (new_cands, old_cands) = self.build_candidates(round_seed);
        self.mark_as_old(&new_cands);
        trace!(elapsed = ?start.elapsed(), "built candidate lists");

        let n = self.heap.n();
        let mut n_updates = 0;
        for block_start in (0..n).step_by(JOIN_BLOCK_SIZE) {
            let block = block_start..(block_start + JOIN_BLOCK_SIZE).min(n);
            let updates = self.generate_updates(block, &new_cands, &old_cands);
            n_updates += self.apply_updates(updates);
        }

        debug!(n_updates, elapsed = ?start.elapsed(), "finished descent round");
        n_updates
    }

    /// Flatten the heaps into the final sorted graph with true distances
    ///
    /// Slots that no finite distance could fill get the lowest unused
    /// indices at infinite distance.
    fn finish(mut self) -> NeighbourGraph<T> {
        let n = self.heap.n();
        let k = self.heap.k();
        let metric = self.dataset.metric();

        self.heap.deheap_sort();
        let n_padded: usize = self
            .heap
            .par_rows_mut()
            .map(|row| fill_empty_sorted(row.indices, row.dists, Some(row.point), n))
            .sum();
        if n_padded > 0 {
            debug!(n_padded, "padded rows without finite candidates");
        }
        self.state = DescentState::Converged;
        let (indices, dists) = self.heap.into_parts();

        NeighbourGraph {
            indices: indices.into_iter().map(|j| j as usize).collect(),
            distances: dists.into_iter().map(|d| metric.correct(d)).collect(),
            n,
            k,
        }
    }
}

///////////
// Index //
///////////

/// Neighbour indices are stored as `u32` with `u32::MAX` reserved for empty
/// slots
fn check_index_range(n: usize) -> Result<()> {
    let max = EMPTY as usize;
    if n > max {
        return Err(NNDescentError::TooManyPoints { n, max });
    }
    Ok(())
}

/// NN-Descent index for approximate nearest neighbour search
///
/// Builds an approximate kNN graph by neighbour descent seeded from a random
/// projection forest. Forest and graph are kept for querying.
///
/// ### Fields
///
/// * `dataset` - The training data with its metric
/// * `forest` - RP forest used for seeding and query entry points
/// * `graph` - Final kNN graph
/// * `state` - Final lifecycle state
/// * `converged` - Whether the convergence criterion was met
/// * `n_iters_run` - Number of rounds actually run
/// * `search_graph` - Undirected neighbour lists the query expands over
/// * `search_seed` - Seed of the query-time random entry points
pub struct NNDescent<T> {
    dataset: Dataset<T>,
    forest: RpForest<T>,
    graph: NeighbourGraph<T>,
    state: DescentState,
    converged: bool,
    n_iters_run: usize,
    search_graph: SearchGraph,
    search_seed: u64,
}

impl<T: KnnFloat> NNDescent<T> {
    /// Build a new NN-Descent index, printing progress to stdout if verbose
    ///
    /// ### Params
    ///
    /// * `data` - Training data, dense (samples x features) or sparse CSR
    /// * `params` - Construction parameters
    ///
    /// ### Returns
    ///
    /// The built index
    pub fn new(data: DataInput<T>, params: &NNDescentParams) -> Result<Self> {
        Self::with_observer(data, params, &StdoutObserver)
    }

    /// Build a new NN-Descent index reporting to a custom observer
    ///
    /// ### Params
    ///
    /// * `data` - Training data, dense (samples x features) or sparse CSR
    /// * `params` - Construction parameters
    /// * `observer` - Receives progress events if `params.verbose` is set
    ///
    /// ### Returns
    ///
    /// The built index, or an error if the metric is unknown, the dataset is
    /// empty, `n_neighbors` is not in `1..n` or the sparse input is malformed
    pub fn with_observer(
        data: DataInput<T>,
        params: &NNDescentParams,
        observer: &dyn ProgressObserver,
    ) -> Result<Self> {
        let metric = parse_metric(&params.metric, &params.metric_kwds)?;

        let n = data.nrows();
        if n == 0 {
            return Err(NNDescentError::EmptyDataset);
        }
        check_index_range(n)?;
        let k = params.n_neighbors;
        if k == 0 {
            return Err(NNDescentError::InvalidK {
                k,
                n,
                reason: "n_neighbors must be positive",
            });
        }
        if k >= n {
            return Err(NNDescentError::InvalidK {
                k,
                n,
                reason: "n_neighbors must be smaller than the number of points",
            });
        }

        let dataset = Dataset::new(&data, metric)?;
        let reporter = Reporter::new(params.verbose, observer);

        let n_trees = params.resolve_n_trees(n);
        let n_iters = params.resolve_n_iters(n);
        let max_candidates = params.resolve_max_candidates();
        let leaf_size = params.resolve_leaf_size();

        let start = Instant::now();
        let mut rng = KnnRng::new(params.seed);

        let forest = RpForest::build(&dataset, n_trees, leaf_size, &mut rng);
        reporter.emit(ProgressEvent::ForestBuilt {
            n_trees,
            elapsed: start.elapsed(),
        });

        let mut descent = Descent::new(&dataset, k, max_candidates);
        descent.seed(&forest, rng.next_seed());

        reporter.emit(ProgressEvent::DescentStarted {
            n_iters,
            n,
            max_candidates,
        });

        let threshold = params.delta * n as f64 * k as f64;
        let mut converged = false;
        let mut n_iters_run = 0;

        for iter in 0..n_iters {
            let updates = descent.round(rng.next_seed());
            n_iters_run = iter + 1;

            reporter.emit(ProgressEvent::RoundFinished {
                iter: iter + 1,
                n_iters,
                updates,
            });

            if updates as f64 <= threshold {
                converged = true;
                reporter.emit(ProgressEvent::Converged { iter: iter + 1 });
                break;
            }

            if let Some(budget) = params.max_build_time {
                if iter + 1 < n_iters && start.elapsed() >= budget {
                    reporter.emit(ProgressEvent::TimeBudgetExhausted { iter: iter + 1 });
                    break;
                }
            }
        }

        let graph = descent.finish();
        let search_graph = SearchGraph::from_knn(&graph);
        let search_seed = rng.next_seed();

        reporter.emit(ProgressEvent::DescentFinished {
            converged,
            elapsed: start.elapsed(),
        });
        debug!(
            n = %n.separate_with_underscores(),
            k,
            n_iters_run,
            converged,
            "built nndescent index"
        );

        Ok(NNDescent {
            dataset,
            forest,
            graph,
            search_graph,
            state: DescentState::Converged,
            converged,
            n_iters_run,
            search_seed,
        })
    }

    /// The final kNN graph
    pub fn neighbour_graph(&self) -> &NeighbourGraph<T> {
        &self.graph
    }

    /// Number of training points
    pub fn n_samples(&self) -> usize {
        self.dataset.n()
    }

    /// Number of features
    pub fn dim(&self) -> usize {
        self.dataset.dim()
    }

    /// The distance metric
    pub fn metric(&self) -> Metric {
        self.dataset.metric()
    }

    /// Check if algorithm converged during construction
    ///
    /// ### Returns
    ///
    /// True if the convergence criterion was met, false if the loop stopped
    /// on the iteration or time budget
    pub fn index_converged(&self) -> bool {
        self.converged
    }

    /// Number of descent rounds that were run
    pub fn n_iters_run(&self) -> usize {
        self.n_iters_run
    }

    /// Lifecycle state of the graph
    pub fn state(&self) -> DescentState {
        self.state
    }

    /// The RP forest
    pub fn forest(&self) -> &RpForest<T> {
        &self.forest
    }

    pub(crate) fn dataset(&self) -> &Dataset<T> {
        &self.dataset
    }

    pub(crate) fn search_graph(&self) -> &SearchGraph {
        &self.search_graph
    }

    pub(crate) fn search_seed(&self) -> u64 {
        self.search_seed
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::*;
    use crate::utils::{exhaustive_knn, recall};
    use faer::Mat;

    fn create_simple_matrix() -> Mat<f32> {
        let data = [
            1.0, 0.0, 0.0, // Point 0
            0.0, 1.0, 0.0, // Point 1
            0.0, 0.0, 1.0, // Point 2
            1.0, 1.0, 0.0, // Point 3
            1.0, 0.0, 1.0, // Point 4
        ];
        Mat::from_fn(5, 3, |i, j| data[i * 3 + j])
    }

    fn params(metric: &str, n_neighbors: usize) -> NNDescentParams {
        NNDescentParams {
            metric: metric.to_string(),
            n_neighbors,
            ..Default::default()
        }
    }

    fn assert_graph_invariants<T: KnnFloat>(graph: &NeighbourGraph<T>) {
        for i in 0..graph.n() {
            let (indices, distances) = graph.row(i);
            assert!(!indices.contains(&i), "self neighbour in row {i}");
            let mut sorted = indices.to_vec();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), indices.len(), "duplicate in row {i}");
            assert!(indices.iter().all(|&j| j < graph.n()));
            assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_nndescent_build_euclidean() {
        let mat = create_simple_matrix();
        let index = NNDescent::<f32>::new(DataInput::Dense(mat.as_ref()), &params("euclidean", 3))
            .unwrap();

        assert_eq!(index.neighbour_graph().n(), 5);
        assert_eq!(index.neighbour_graph().k(), 3);
        assert_eq!(index.state(), DescentState::Converged);
        assert_graph_invariants(index.neighbour_graph());

        // point 0 = (1, 0, 0) is at distance 1 from points 3 and 4
        let (indices, distances) = index.neighbour_graph().row(0);
        assert_eq!(&indices[..2], &[3, 4]);
        assert!((distances[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nndescent_build_cosine() {
        let mat = create_simple_matrix();
        let index =
            NNDescent::<f32>::new(DataInput::Dense(mat.as_ref()), &params("cosine", 3)).unwrap();

        assert_eq!(index.metric(), Metric::Cosine);
        assert_graph_invariants(index.neighbour_graph());
        let (_, distances) = index.neighbour_graph().row(0);
        assert!(distances.iter().all(|&d| (0.0..=1.0 + 1e-6).contains(&d)));
    }

    #[test]
    fn test_nndescent_validation() {
        let mat = create_simple_matrix();
        let input = DataInput::Dense(mat.as_ref());

        assert!(matches!(
            NNDescent::<f32>::new(input, &params("euclidean", 0)),
            Err(NNDescentError::InvalidK { k: 0, .. })
        ));
        assert!(matches!(
            NNDescent::<f32>::new(input, &params("euclidean", 5)),
            Err(NNDescentError::InvalidK { k: 5, n: 5, .. })
        ));
        assert!(matches!(
            NNDescent::<f32>::new(input, &params("braycurtis", 3)),
            Err(NNDescentError::UnsupportedMetric { .. })
        ));

        let empty = Mat::<f32>::zeros(0, 3);
        assert_eq!(
            NNDescent::<f32>::new(DataInput::Dense(empty.as_ref()), &params("euclidean", 3)).err(),
            Some(NNDescentError::EmptyDataset)
        );
    }

    #[test]
    fn test_nndescent_candidate_lists_are_capped() {
        let mat = generate_uniform_data::<f64>(200, 5, 4);
        let dataset = Dataset::new(&DataInput::Dense(mat.as_ref()), Metric::Euclidean).unwrap();
        let mut rng = KnnRng::new(42);
        let forest = RpForest::build(&dataset, 4, 10, &mut rng);
        let mut descent = Descent::new(&dataset, 10, 3);
        descent.seed(&forest, rng.next_seed());

        let filled = |lists: &CandidateLists, i: usize| -> Vec<u32> {
            lists.row(i).iter().copied().filter(|&j| j != EMPTY).collect()
        };

        // freshly seeded entries are all new
        let (new_cands, old_cands) = descent.build_candidates(rng.next_seed());
        for i in 0..200 {
            assert_eq!(filled(&new_cands, i).len(), 3);
            assert!(filled(&old_cands, i).is_empty());
        }

        descent.mark_as_old(&new_cands);
        let (new_cands, old_cands) = descent.build_candidates(rng.next_seed());

        let has_edge = |i: usize, j: usize, is_new: bool| {
            let in_row = |a: usize, b: usize| {
                let (indices, _, flags) = descent.heap.row(a);
                indices
                    .iter()
                    .zip(flags)
                    .any(|(&x, &f)| x as usize == b && f == is_new)
            };
            in_row(i, j) || in_row(j, i)
        };

        let mut n_old = 0;
        for i in 0..200 {
            let new = filled(&new_cands, i);
            let old = filled(&old_cands, i);
            assert!(new.len() <= 3);
            assert!(old.len() <= 3);
            for &j in &new {
                assert!(has_edge(i, j as usize, true), "new candidate {j} of {i}");
            }
            for &j in &old {
                assert!(has_edge(i, j as usize, false), "old candidate {j} of {i}");
            }
            n_old += old.len();
        }
        assert!(n_old > 0);
    }

    #[test]
    fn test_nndescent_rows_without_finite_candidates_are_padded() {
        let uniform = generate_uniform_data::<f32>(50, 3, 6);
        let mat = Mat::from_fn(50, 3, |i, j| if i == 5 { 3.0e38 } else { uniform[(i, j)] });
        let index =
            NNDescent::<f32>::new(DataInput::Dense(mat.as_ref()), &params("euclidean", 5)).unwrap();

        let graph = index.neighbour_graph();
        assert_graph_invariants(graph);
        let (indices, distances) = graph.row(5);
        assert!(indices.iter().all(|&j| j < 50));
        assert!(distances.iter().all(|d| d.is_infinite()));

        let (indices, _) = index.query(DataInput::Dense(mat.as_ref()), 5, None).unwrap();
        for row in &indices {
            assert_eq!(row.len(), 5);
            assert!(row.iter().all(|&j| j < 50));
        }
    }

    #[test]
    fn test_nndescent_index_range() {
        assert!(check_index_range(1_000).is_ok());
        assert!(check_index_range(u32::MAX as usize).is_ok());
        assert_eq!(
            check_index_range(u32::MAX as usize + 1),
            Err(NNDescentError::TooManyPoints {
                n: u32::MAX as usize + 1,
                max: u32::MAX as usize
            })
        );
    }

    #[test]
    fn test_nndescent_small_data_is_exact() {
        let mat = generate_uniform_data::<f64>(9, 4, 3);
        let index =
            NNDescent::<f64>::new(DataInput::Dense(mat.as_ref()), &params("euclidean", 8)).unwrap();
        let dataset = Dataset::new(&DataInput::Dense(mat.as_ref()), Metric::Euclidean).unwrap();
        let (truth, true_dists) = exhaustive_knn(&dataset, 8);
        let (indices, distances) = index.neighbour_graph().to_nested();

        assert_eq!(indices, truth);
        for (row, true_row) in distances.iter().zip(&true_dists) {
            for (d, t) in row.iter().zip(true_row) {
                assert!((d - t).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_nndescent_convergence() {
        let mat = generate_clustered_data::<f32>(300, 8, 5, 0.3, 1);
        let p = NNDescentParams {
            n_iters: Some(30),
            delta: 0.01,
            ..params("euclidean", 10)
        };
        let index = NNDescent::<f32>::new(DataInput::Dense(mat.as_ref()), &p).unwrap();

        assert!(index.index_converged());
        assert!(index.n_iters_run() < 30);
    }

    #[test]
    fn test_nndescent_time_budget() {
        let mat = generate_uniform_data::<f32>(400, 6, 8);
        let p = NNDescentParams {
            n_iters: Some(20),
            max_build_time: Some(Duration::ZERO),
            ..params("euclidean", 10)
        };
        let index = NNDescent::<f32>::new(DataInput::Dense(mat.as_ref()), &p).unwrap();

        assert_eq!(index.n_iters_run(), 1);
        assert!(!index.index_converged());
        assert_graph_invariants(index.neighbour_graph());
    }

    #[test]
    fn test_nndescent_reproducibility() {
        let mat = generate_uniform_data::<f32>(500, 5, 17);
        let p = params("euclidean", 10);
        let a = NNDescent::<f32>::new(DataInput::Dense(mat.as_ref()), &p).unwrap();
        let b = NNDescent::<f32>::new(DataInput::Dense(mat.as_ref()), &p).unwrap();

        assert_eq!(a.neighbour_graph(), b.neighbour_graph());
        assert_eq!(a.n_iters_run(), b.n_iters_run());
    }

    #[test]
    fn test_nndescent_quality() {
        let mat = generate_clustered_data::<f64>(1000, 6, 10, 0.5, 42);
        let index =
            NNDescent::<f64>::new(DataInput::Dense(mat.as_ref()), &params("euclidean", 10)).unwrap();
        let dataset = Dataset::new(&DataInput::Dense(mat.as_ref()), Metric::Euclidean).unwrap();
        let (truth, _) = exhaustive_knn(&dataset, 10);
        let (approx, _) = index.neighbour_graph().to_nested();

        assert_graph_invariants(index.neighbour_graph());
        let r = recall(&approx, &truth);
        assert!(r >= 0.95, "recall too low: {r}");
    }

    #[test]
    fn test_nndescent_sparse_manhattan() {
        let (indptr, indices, data) = generate_sparse_data::<f64>(300, 40, 0.3, 4);
        let csr = CsrRef::new(&indptr, &indices, &data, 40);
        let index =
            NNDescent::<f64>::new(DataInput::Sparse(csr), &params("manhattan", 15)).unwrap();

        assert_graph_invariants(index.neighbour_graph());
        let dataset = Dataset::new(&DataInput::Sparse(csr), Metric::Manhattan).unwrap();
        let (truth, _) = exhaustive_knn(&dataset, 15);
        let (approx, _) = index.neighbour_graph().to_nested();
        assert!(recall(&approx, &truth) >= 0.85);
    }

    #[test]
    fn test_nndescent_minkowski_distances_are_corrected() {
        let mat = generate_uniform_data::<f64>(60, 3, 21);
        let p = NNDescentParams {
            metric_kwds: vec![("p".to_string(), 3.0)],
            ..params("minkowski", 5)
        };
        let index = NNDescent::<f64>::new(DataInput::Dense(mat.as_ref()), &p).unwrap();
        let (indices, distances) = index.neighbour_graph().row(0);
        for (&j, &d) in indices.iter().zip(distances) {
            let expected = (0..3)
                .map(|c| (mat[(0, c)] - mat[(j, c)]).abs().powi(3))
                .sum::<f64>()
                .cbrt();
            assert!((d - expected).abs() < 1e-10);
        }
    }
}
