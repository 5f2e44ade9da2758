use fixedbitset::FixedBitSet;
use rand::Rng;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::debug;

use crate::error::{NNDescentError, Result};
use crate::nndescent::{NNDescent, NeighbourGraph};
use crate::utils::data::*;
use crate::utils::dist::Metric;
use crate::utils::heap_structs::*;
use crate::utils::rng::*;
use crate::utils::traits::KnnFloat;

/// Default number of expansions per requested neighbour
pub const DEFAULT_SEARCH_BUDGET: f64 = 5.0;

/// Frontier slack per unit of search budget. Candidates farther than
/// `(1 + slack * budget) x` the current worst true result distance are not
/// explored.
const FRONTIER_SLACK: f64 = 0.1;

//////////////////
// Search graph //
//////////////////

/// Undirected adjacency the query frontier expands over
///
/// Union of the forward kNN edges and their reverses in CSR form, built once
/// after construction. Neighbour lists are sorted and duplicate-free.
#[derive(Clone, Debug)]
pub struct SearchGraph {
    indptr: Vec<usize>,
    indices: Vec<u32>,
}

impl SearchGraph {
    /// Symmetrise a kNN graph
    ///
    /// ### Params
    ///
    /// * `graph` - The final kNN graph
    ///
    /// ### Returns
    ///
    /// The search graph, without self loops
    pub fn from_knn<T: Copy + Send + Sync>(graph: &NeighbourGraph<T>) -> Self {
        let n = graph.n();
        let mut adjacency: Vec<Vec<u32>> = vec![Vec::with_capacity(2 * graph.k()); n];
        for i in 0..n {
            let (neighbours, _) = graph.row(i);
            for &j in neighbours {
                if j >= n || j == i {
                    continue;
                }
                adjacency[i].push(j as u32);
                adjacency[j].push(i as u32);
            }
        }

        adjacency.par_iter_mut().for_each(|nbrs| {
            nbrs.sort_unstable();
            nbrs.dedup();
        });

        let mut indptr = Vec::with_capacity(n + 1);
        let mut indices = Vec::with_capacity(adjacency.iter().map(Vec::len).sum());
        indptr.push(0);
        for nbrs in adjacency {
            indices.extend(nbrs);
            indptr.push(indices.len());
        }

        SearchGraph { indptr, indices }
    }

    /// Neighbours of point `i` in either direction
    #[inline]
    pub fn neighbours(&self, i: usize) -> &[u32] {
        &self.indices[self.indptr[i]..self.indptr[i + 1]]
    }

    /// Number of points
    pub fn n(&self) -> usize {
        self.indptr.len() - 1
    }

    /// Number of stored (directed) edges
    pub fn n_edges(&self) -> usize {
        self.indices.len()
    }
}

////////////
// Search //
////////////

/// Working buffers of a single query
///
/// ### Fields
///
/// * `visited` - Training points whose distance has been computed
/// * `frontier` - Min-heap of points still to expand
/// * `result_idx` - Result max-heap indices (capacity `k`)
/// * `result_keys` - Result max-heap surrogate distances
struct SearchState<T> {
    visited: FixedBitSet,
    frontier: BinaryHeap<Reverse<(OrderedFloat<T>, usize)>>,
    result_idx: Vec<u32>,
    result_keys: Vec<T>,
}

impl<T: KnnFloat> SearchState<T> {
    fn new(n: usize, k: usize) -> Self {
        Self {
            visited: FixedBitSet::with_capacity(n),
            frontier: BinaryHeap::new(),
            result_idx: vec![EMPTY; k],
            result_keys: vec![T::infinity(); k],
        }
    }

    #[inline]
    fn n_results(&self) -> usize {
        self.result_idx.iter().filter(|&&j| j != EMPTY).count()
    }

    /// Current pruning bound as a true distance: infinite until the result
    /// heap is full
    #[inline]
    fn bound(&self, metric: &Metric, scale: T) -> T {
        metric.correct(self.result_keys[0]) * scale
    }

    /// Record a newly visited point in the results and the frontier
    #[inline]
    fn offer(&mut self, idx: usize, dist: T) {
        checked_heap_push(
            &mut self.result_idx,
            &mut self.result_keys,
            None,
            idx as u32,
            dist,
            false,
        );
        self.frontier.push(Reverse((OrderedFloat(dist), idx)));
    }
}

impl<T: KnnFloat> NNDescent<T> {
    /// Query the index for the `k` nearest training points of new points
    ///
    /// ### Params
    ///
    /// * `queries` - Query points, dense or sparse; converted to the trained
    ///   representation if they differ
    /// * `k` - Number of neighbours per query, `1..=n_samples`
    /// * `search_budget` - Graph expansions per requested neighbour. Defaults
    ///   to `DEFAULT_SEARCH_BUDGET`.
    ///
    /// ### Returns
    ///
    /// Tuple of `(indices, distances)`, one row of exactly `k` entries per
    /// query sorted ascending by distance
    pub fn query(
        &self,
        queries: DataInput<T>,
        k: usize,
        search_budget: Option<f64>,
    ) -> Result<(Vec<Vec<usize>>, Vec<Vec<T>>)> {
        let n = self.n_samples();
        if k == 0 {
            return Err(NNDescentError::InvalidK {
                k,
                n,
                reason: "k must be positive",
            });
        }
        if k > n {
            return Err(NNDescentError::InvalidK {
                k,
                n,
                reason: "k exceeds the number of trained points",
            });
        }
        self.dataset().check_query_input(&queries)?;

        let budget = search_budget.unwrap_or(DEFAULT_SEARCH_BUDGET).max(0.0);
        let max_expansions = ((budget * k as f64).ceil() as usize).max(1);
        let scale = T::from_f64(1.0 + FRONTIER_SLACK * budget).unwrap_or(T::infinity());
        let n_queries = queries.nrows();

        debug!(n_queries, k, max_expansions, budget, "querying nndescent index");

        let results: Vec<(Vec<usize>, Vec<T>)> = (0..n_queries)
            .into_par_iter()
            .map(|row| {
                let query = self.dataset().query_point(&queries, row);
                self.search(&query, row, k, max_expansions, scale)
            })
            .collect();

        Ok(results.into_iter().unzip())
    }

    /// Forest-seeded bounded search for one query
    ///
    /// ### Params
    ///
    /// * `query` - The query point in the trained representation
    /// * `row` - Row of the query in its batch; keys the random stream
    /// * `k` - Number of neighbours to return
    /// * `max_expansions` - Maximum number of frontier pops
    /// * `scale` - Multiplier on the worst true result distance beyond which
    ///   candidates are pruned
    ///
    /// ### Returns
    ///
    /// Tuple of `(indices, distances)` with corrected distances
    fn search(
        &self,
        query: &QueryPoint<T>,
        row: usize,
        k: usize,
        max_expansions: usize,
        scale: T,
    ) -> (Vec<usize>, Vec<T>) {
        let dataset = self.dataset();
        let graph = self.search_graph();
        let metric = dataset.metric();
        let n = dataset.n();

        let mut state = SearchState::new(n, k);

        for j in self.forest().candidate_leaf(query.view()) {
            state.visited.insert(j);
            state.offer(j, dataset.distance_to_query(j, query));
        }

        if state.n_results() < k {
            let mut rng = derive_rng(self.search_seed(), Stream::Search, row);
            let mut attempts = 0;
            while state.n_results() < k && attempts < 4 * k + 32 {
                let j = rng.random_range(0..n);
                if !state.visited.put(j) {
                    state.offer(j, dataset.distance_to_query(j, query));
                }
                attempts += 1;
            }
            for j in 0..n {
                if state.n_results() >= k {
                    break;
                }
                if !state.visited.put(j) {
                    state.offer(j, dataset.distance_to_query(j, query));
                }
            }
        }

        let mut expansions = 0;
        while let Some(Reverse((OrderedFloat(dist), node))) = state.frontier.pop() {
            if expansions >= max_expansions {
                break;
            }
            if metric.correct(dist) > state.bound(&metric, scale) {
                break;
            }
            expansions += 1;

            for &nbr in graph.neighbours(node) {
                let nbr = nbr as usize;
                if state.visited.put(nbr) {
                    continue;
                }
                let d = dataset.distance_to_query(nbr, query);
                if metric.correct(d) < state.bound(&metric, scale) {
                    state.offer(nbr, d);
                }
            }
        }

        let SearchState {
            mut result_idx,
            mut result_keys,
            ..
        } = state;
        deheap_sort(&mut result_idx, &mut result_keys, None);
        fill_empty_sorted(&mut result_idx, &mut result_keys, None, n);

        result_idx
            .into_iter()
            .zip(result_keys)
            .filter(|&(j, _)| j != EMPTY)
            .map(|(j, d)| (j as usize, metric.correct(d)))
            .unzip()
    }
}

///////////
// Tests //
///////////
