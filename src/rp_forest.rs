use rand::rngs::SmallRng;
use rand::Rng;
use rayon::prelude::*;
use std::time::Instant;
use tracing::{debug, trace};

use crate::utils::data::*;
use crate::utils::dist::*;
use crate::utils::rng::*;
use crate::utils::traits::KnnFloat;

/// Hard ceiling on tree depth. Nodes at or below it are always halved.
pub const MAX_DEPTH: usize = 200;

/// Margins within this band count as lying on the hyperplane
const PLANE_EPS: f64 = 1e-8;

////////////////
// Hyperplane //
////////////////

/// Separating hyperplane of a split node
///
/// Points with a positive margin `<normal, x> + offset` go left.
#[derive(Clone, Debug)]
pub enum Hyperplane<T> {
    Dense {
        normal: Vec<T>,
        offset: T,
    },
    Sparse {
        indices: Vec<usize>,
        values: Vec<T>,
        offset: T,
    },
}

impl<T: KnnFloat> Hyperplane<T> {
    /// Signed margin of a point
    #[inline]
    pub fn margin(&self, point: PointRef<'_, T>) -> T {
        match (self, point) {
            (Hyperplane::Dense { normal, offset }, PointRef::Dense(x)) => {
                dense_dot(normal, x) + *offset
            }
            (Hyperplane::Dense { normal, offset }, PointRef::Sparse { indices, values }) => {
                indices
                    .iter()
                    .zip(values)
                    .fold(*offset, |acc, (&c, &v)| acc + normal[c] * v)
            }
            (
                Hyperplane::Sparse {
                    indices,
                    values,
                    offset,
                },
                PointRef::Dense(x),
            ) => indices
                .iter()
                .zip(values)
                .fold(*offset, |acc, (&c, &v)| acc + x[c] * v),
            (
                Hyperplane::Sparse {
                    indices: ip,
                    values: vp,
                    offset,
                },
                PointRef::Sparse { indices, values },
            ) => sparse_dot(ip, vp, indices, values) + *offset,
        }
    }

    /// Hyperplane separating two points
    ///
    /// Euclidean trees use the perpendicular bisector of `l` and `r`.
    /// Angular trees use the bisector of the two normalised points through the
    /// origin; zero vectors are left unscaled.
    ///
    /// ### Returns
    ///
    /// `None` if the two points coincide (after normalisation for angular
    /// trees), as no plane separates them
    fn between(l: PointRef<'_, T>, r: PointRef<'_, T>, angular: bool) -> Option<Self> {
        let half = T::from_f64(0.5).unwrap_or(T::zero());
        let scale = |norm: T| {
            if angular && norm > T::zero() {
                T::one() / norm
            } else {
                T::one()
            }
        };

        match (l, r) {
            (PointRef::Dense(l), PointRef::Dense(r)) => {
                let (wl, wr) = (scale(l2_norm(l)), scale(l2_norm(r)));
                let normal: Vec<T> = l.iter().zip(r).map(|(&a, &b)| a * wl - b * wr).collect();
                if normal.iter().all(|&v| v == T::zero()) {
                    return None;
                }
                let offset = if angular {
                    T::zero()
                } else {
                    -normal
                        .iter()
                        .zip(l.iter().zip(r))
                        .fold(T::zero(), |acc, (&n, (&a, &b))| acc + n * (a + b) * half)
                };
                Some(Hyperplane::Dense { normal, offset })
            }
            (
                PointRef::Sparse {
                    indices: il,
                    values: vl,
                },
                PointRef::Sparse {
                    indices: ir,
                    values: vr,
                },
            ) => {
                let (wl, wr) = (scale(l2_norm(vl)), scale(l2_norm(vr)));
                let (indices, values) = sparse_combine(il, vl, wl, ir, vr, -wr);
                if indices.is_empty() {
                    return None;
                }
                let offset = if angular {
                    T::zero()
                } else {
                    let (im, vm) = sparse_combine(il, vl, half, ir, vr, half);
                    -sparse_dot(&indices, &values, &im, &vm)
                };
                Some(Hyperplane::Sparse {
                    indices,
                    values,
                    offset,
                })
            }
            // the dataset never mixes representations
            _ => None,
        }
    }
}

#[inline]
fn l2_norm<T: KnnFloat>(values: &[T]) -> T {
    values.iter().map(|&v| v * v).sum::<T>().sqrt()
}

//////////
// Tree //
//////////

/// Tree node in a flat node vector (index 0 = root)
#[derive(Clone, Debug)]
pub enum RpNode<T> {
    /// Random hyperplane split
    Split {
        plane: Hyperplane<T>,
        left: usize,
        right: usize,
    },
    /// Deterministic fallback: the stable index list cut in half
    Halve { left: usize, right: usize },
    /// Terminal bucket, `leaf` indexes into the tree's leaf table
    Leaf { leaf: usize },
}

/// One random projection tree
///
/// ### Fields
///
/// * `nodes` - Flat node storage, root at 0
/// * `leaf_items` - Concatenated point indices of all leaves
/// * `leaf_bounds` - `(start, len)` of each leaf in `leaf_items`
/// * `point_leaf` - Leaf number of every training point
/// * `n_fallbacks` - Number of nodes split by the fallback rule
#[derive(Clone, Debug)]
pub struct RpTree<T> {
    nodes: Vec<RpNode<T>>,
    leaf_items: Vec<usize>,
    leaf_bounds: Vec<(usize, usize)>,
    point_leaf: Vec<usize>,
    n_fallbacks: usize,
}

impl<T: KnnFloat> RpTree<T> {
    /// Build a tree over all points of the dataset
    ///
    /// Uses an explicit work stack. A node whose random split is degenerate
    /// (coinciding pivots or an empty side), or which lies at `MAX_DEPTH`, is
    /// halved instead, so every internal node strictly shrinks its input and
    /// the build terminates on any data.
    ///
    /// ### Params
    ///
    /// * `dataset` - The training data
    /// * `leaf_size` - Maximum number of points per leaf
    /// * `rng` - Generator of this tree
    ///
    /// ### Returns
    ///
    /// The built tree
    pub fn build(dataset: &Dataset<T>, leaf_size: usize, rng: &mut SmallRng) -> Self {
        let n = dataset.n();
        let leaf_size = leaf_size.max(1);
        let angular = dataset.metric().is_angular();

        let mut tree = RpTree {
            nodes: Vec::with_capacity(2 * n / leaf_size + 1),
            leaf_items: Vec::with_capacity(n),
            leaf_bounds: Vec::new(),
            point_leaf: vec![0; n],
            n_fallbacks: 0,
        };

        tree.nodes.push(RpNode::Leaf { leaf: 0 });
        let mut stack: Vec<(usize, Vec<usize>, usize)> = vec![(0, (0..n).collect(), 0)];

        while let Some((node_idx, items, depth)) = stack.pop() {
            if items.len() <= leaf_size {
                let leaf = tree.leaf_bounds.len();
                tree.leaf_bounds.push((tree.leaf_items.len(), items.len()));
                for &i in &items {
                    tree.point_leaf[i] = leaf;
                }
                tree.leaf_items.extend_from_slice(&items);
                tree.nodes[node_idx] = RpNode::Leaf { leaf };
                continue;
            }

            let split = if depth < MAX_DEPTH {
                Self::random_split(dataset, &items, angular, rng)
            } else {
                None
            };

            let left = tree.nodes.len();
            let right = left + 1;
            tree.nodes.push(RpNode::Leaf { leaf: 0 });
            tree.nodes.push(RpNode::Leaf { leaf: 0 });

            let (left_items, right_items) = match split {
                Some((plane, left_items, right_items)) => {
                    tree.nodes[node_idx] = RpNode::Split { plane, left, right };
                    (left_items, right_items)
                }
                None => {
                    trace!(depth, size = items.len(), "fallback split");
                    tree.n_fallbacks += 1;
                    tree.nodes[node_idx] = RpNode::Halve { left, right };
                    let mut left_items = items;
                    let right_items = left_items.split_off(left_items.len() / 2);
                    (left_items, right_items)
                }
            };

            stack.push((right, right_items, depth + 1));
            stack.push((left, left_items, depth + 1));
        }

        tree
    }

    /// Try one random hyperplane split of `items`
    ///
    /// Two distinct pivots are drawn; points within `PLANE_EPS` of the plane
    /// go to a random side. Both sides preserve the order of `items`.
    fn random_split(
        dataset: &Dataset<T>,
        items: &[usize],
        angular: bool,
        rng: &mut SmallRng,
    ) -> Option<(Hyperplane<T>, Vec<usize>, Vec<usize>)> {
        let len = items.len();
        let a = rng.random_range(0..len);
        let mut b = rng.random_range(0..len - 1);
        if b >= a {
            b += 1;
        }

        let plane = Hyperplane::between(dataset.point(items[a]), dataset.point(items[b]), angular)?;
        let eps = T::from_f64(PLANE_EPS).unwrap_or(T::epsilon());

        let mut left_items = Vec::with_capacity(len / 2 + 1);
        let mut right_items = Vec::with_capacity(len / 2 + 1);
        for &i in items {
            let margin = plane.margin(dataset.point(i));
            let go_left = if margin > eps {
                true
            } else if margin < -eps {
                false
            } else {
                rng.random::<bool>()
            };
            if go_left {
                left_items.push(i);
            } else {
                right_items.push(i);
            }
        }

        if left_items.is_empty() || right_items.is_empty() {
            return None;
        }
        Some((plane, left_items, right_items))
    }

    /// Points sharing a leaf with training point `point` (itself included)
    #[inline]
    pub fn leaf_of_point(&self, point: usize) -> &[usize] {
        self.leaf(self.point_leaf[point])
    }

    /// Points of leaf number `leaf`
    #[inline]
    pub fn leaf(&self, leaf: usize) -> &[usize] {
        let (start, len) = self.leaf_bounds[leaf];
        &self.leaf_items[start..start + len]
    }

    /// Descend to the leaf a (possibly novel) point falls into
    ///
    /// Non-negative margins go left, fallback nodes always go left. The build
    /// sends points within `PLANE_EPS` of a plane to a random side and cuts
    /// fallback nodes by position, so a training point on such a path may be
    /// routed to a leaf other than its own. Use `leaf_of_point` for the leaf a
    /// training point was assigned to.
    pub fn search_leaf(&self, point: PointRef<'_, T>) -> &[usize] {
        let mut node = 0;
        loop {
            match &self.nodes[node] {
                RpNode::Split { plane, left, right } => {
                    node = if plane.margin(point) >= T::zero() {
                        *left
                    } else {
                        *right
                    };
                }
                RpNode::Halve { left, .. } => node = *left,
                RpNode::Leaf { leaf } => return self.leaf(*leaf),
            }
        }
    }

    /// Number of leaves
    pub fn n_leaves(&self) -> usize {
        self.leaf_bounds.len()
    }

    /// Number of nodes split by the fallback rule
    pub fn n_fallbacks(&self) -> usize {
        self.n_fallbacks
    }

    /// Maximum depth of any leaf
    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(0usize, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            match &self.nodes[node] {
                RpNode::Split { left, right, .. } | RpNode::Halve { left, right } => {
                    stack.push((*left, depth + 1));
                    stack.push((*right, depth + 1));
                }
                RpNode::Leaf { .. } => max_depth = max_depth.max(depth),
            }
        }
        max_depth
    }
}

////////////
// Forest //
////////////

/// Random projection forest
///
/// Ordered sequence of independently built trees over the same points.
/// Used to seed the descent and to find entry points for queries.
#[derive(Clone, Debug)]
pub struct RpForest<T> {
    trees: Vec<RpTree<T>>,
    leaf_size: usize,
}

impl<T: KnnFloat> RpForest<T> {
    /// Build the forest
    ///
    /// Tree seeds are drawn from `rng` in order before the trees are built in
    /// parallel, so the forest does not depend on the thread count.
    ///
    /// ### Params
    ///
    /// * `dataset` - The training data
    /// * `n_trees` - Number of trees
    /// * `leaf_size` - Maximum points per leaf
    /// * `rng` - Master random state of the index
    ///
    /// ### Returns
    ///
    /// The built forest
    pub fn build(dataset: &Dataset<T>, n_trees: usize, leaf_size: usize, rng: &mut KnnRng) -> Self {
        let start = Instant::now();
        let seeds = rng.seeds(n_trees);

        let trees: Vec<RpTree<T>> = seeds
            .into_par_iter()
            .enumerate()
            .map(|(t, tree_seed)| {
                let mut tree_rng = derive_rng(tree_seed, Stream::Tree, t);
                RpTree::build(dataset, leaf_size, &mut tree_rng)
            })
            .collect();

        debug!(
            n_trees,
            leaf_size,
            fallbacks = trees.iter().map(|t| t.n_fallbacks()).sum::<usize>(),
            elapsed = ?start.elapsed(),
            "built rp forest"
        );

        RpForest { trees, leaf_size }
    }

    /// Number of trees
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Leaf size the forest was built with
    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    /// The trees
    pub fn trees(&self) -> &[RpTree<T>] {
        &self.trees
    }

    /// Union of the leaves a point falls into across all trees
    ///
    /// ### Params
    ///
    /// * `point` - The point, in the representation of the training data
    ///
    /// ### Returns
    ///
    /// Sorted, duplicate-free training indices
    pub fn candidate_leaf(&self, point: PointRef<'_, T>) -> Vec<usize> {
        let mut candidates: Vec<usize> = Vec::with_capacity(self.trees.len() * self.leaf_size);
        for tree in &self.trees {
            candidates.extend_from_slice(tree.search_leaf(point));
        }
        candidates.sort_unstable();
        candidates.dedup();
        candidates
    }
}

///////////
// Tests //
///////////
