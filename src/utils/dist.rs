use crate::error::{NNDescentError, Result};
use crate::utils::traits::KnnFloat;

////////////
// Metric //
////////////

/// Enum for the distance metric to use
///
/// Resolved once from a name plus keyword parameters and held immutably by
/// the index afterwards.
#[derive(Clone, Debug, Copy, PartialEq, Default)]
pub enum Metric {
    /// Euclidean distance
    #[default]
    Euclidean,
    /// Squared Euclidean distance
    SqEuclidean,
    /// Manhattan (L1) distance
    Manhattan,
    /// Chebyshev (L-infinity) distance
    Chebyshev,
    /// Minkowski distance with exponent `p`
    Minkowski { p: f64 },
    /// Cosine distance
    Cosine,
    /// Correlation distance (cosine on mean-centred vectors)
    Correlation,
    /// Proportion of coordinates that differ
    Hamming,
    /// Jaccard distance on the sets of non-zero coordinates
    Jaccard,
}

/// Parse the metric from its name and keyword parameters
///
/// ### Params
///
/// * `name` - Name of the metric, case-insensitive. Common aliases such as
///   `"l2"` or `"cityblock"` are recognised.
/// * `kwds` - Keyword parameters. Only `p` (Minkowski exponent) is read;
///   everything else is ignored.
///
/// ### Returns
///
/// The resolved `Metric` or `UnsupportedMetric`.
pub fn parse_metric<S: AsRef<str>>(name: &str, kwds: &[(S, f64)]) -> Result<Metric> {
    let kwd = |key: &str| {
        kwds.iter()
            .find(|(k, _)| AsRef::<str>::as_ref(k) == key)
            .map(|(_, v)| *v)
    };

    let metric = match name.to_lowercase().as_str() {
        "euclidean" | "l2" => Metric::Euclidean,
        "sqeuclidean" => Metric::SqEuclidean,
        "manhattan" | "l1" | "taxicab" | "cityblock" => Metric::Manhattan,
        "chebyshev" | "linfinity" | "linf" | "linfty" => Metric::Chebyshev,
        "minkowski" => {
            let p = kwd("p").unwrap_or(2.0);
            if !p.is_finite() || p <= 0.0 {
                return Err(NNDescentError::UnsupportedMetric {
                    name: format!("minkowski(p={p})"),
                });
            }
            Metric::Minkowski { p }
        }
        "cosine" => Metric::Cosine,
        "correlation" => Metric::Correlation,
        "hamming" => Metric::Hamming,
        "jaccard" => Metric::Jaccard,
        _ => {
            return Err(NNDescentError::UnsupportedMetric {
                name: name.to_string(),
            })
        }
    };

    Ok(metric)
}

impl Metric {
    /// Does this metric compare directions rather than positions
    ///
    /// Angular metrics get angular random projection trees and need the
    /// per-point norms.
    pub fn is_angular(&self) -> bool {
        matches!(self, Metric::Cosine | Metric::Correlation)
    }

    /// Convert a surrogate distance into the true metric value
    ///
    /// Construction and search rank candidates by a cheaper monotone
    /// surrogate. This is applied exactly once on every distance handed out.
    ///
    /// ### Params
    ///
    /// * `surrogate` - The surrogate distance
    ///
    /// ### Returns
    ///
    /// The true distance
    #[inline]
    pub fn correct<T: KnnFloat>(&self, surrogate: T) -> T {
        match self {
            Metric::Euclidean => surrogate.max(T::zero()).sqrt(),
            Metric::Minkowski { p } => {
                surrogate.max(T::zero()).powf(T::from_f64(1.0 / p).unwrap_or(T::one()))
            }
            _ => surrogate,
        }
    }
}

/////////////////
// Point stats //
/////////////////

/// Per-point constants some metrics need
///
/// ### Fields
///
/// * `norm` - L2 norm for Cosine, norm of the mean-centred vector for
///   Correlation, unused otherwise
/// * `mean` - Mean over all coordinates (Correlation only)
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PointStats<T> {
    pub norm: T,
    pub mean: T,
}

/// Compute the point constants from the non-zero values of one point
///
/// Zeros do not contribute to either sum, so dense rows and the stored
/// values of a sparse row give the same result.
///
/// ### Params
///
/// * `metric` - The metric the constants are for
/// * `values` - The point's values (all of them, or only the non-zeros)
/// * `dim` - Full dimensionality of the point
///
/// ### Returns
///
/// The `PointStats` for that point
pub fn point_stats<T: KnnFloat>(metric: &Metric, values: &[T], dim: usize) -> PointStats<T> {
    match metric {
        Metric::Cosine => PointStats {
            norm: values.iter().map(|&v| v * v).sum::<T>().sqrt(),
            mean: T::zero(),
        },
        Metric::Correlation => {
            let d = T::from_usize(dim.max(1)).unwrap_or(T::one());
            let sum: T = values.iter().copied().sum();
            let sum_sq: T = values.iter().map(|&v| v * v).sum();
            let mean = sum / d;
            let centred = (sum_sq - d * mean * mean).max(T::zero());
            PointStats {
                norm: centred.sqrt(),
                mean,
            }
        }
        _ => PointStats::default(),
    }
}

/////////////
// Kernels //
/////////////

/// Surrogate distance between two dense points
///
/// ### Params
///
/// * `metric` - Distance metric
/// * `a` - First point
/// * `b` - Second point, same length as `a`
/// * `sa` - Point constants of `a`
/// * `sb` - Point constants of `b`
///
/// ### Returns
///
/// The surrogate distance (see `Metric::correct`)
#[inline]
pub fn dense_distance<T: KnnFloat>(
    metric: &Metric,
    a: &[T],
    b: &[T],
    sa: PointStats<T>,
    sb: PointStats<T>,
) -> T {
    debug_assert_eq!(a.len(), b.len());
    let pairs = a.iter().copied().zip(b.iter().copied());
    surrogate_over_pairs(metric, pairs, a.len(), sa, sb)
}

/// Surrogate distance between two sparse points
///
/// Column indices of both points must be sorted ascending and unique.
///
/// ### Params
///
/// * `metric` - Distance metric
/// * `ia`, `va` - Column indices and values of the first point
/// * `ib`, `vb` - Column indices and values of the second point
/// * `dim` - Full dimensionality
/// * `sa` - Point constants of `a`
/// * `sb` - Point constants of `b`
///
/// ### Returns
///
/// The surrogate distance, numerically consistent with `dense_distance` on
/// the densified points
#[allow(clippy::too_many_arguments)]
#[inline]
pub fn sparse_distance<T: KnnFloat>(
    metric: &Metric,
    ia: &[usize],
    va: &[T],
    ib: &[usize],
    vb: &[T],
    dim: usize,
    sa: PointStats<T>,
    sb: PointStats<T>,
) -> T {
    let pairs = SparseUnion::new(ia, va, ib, vb);
    surrogate_over_pairs(metric, pairs, dim, sa, sb)
}

/// Iterate over the union of two sparse supports
///
/// Yields `(x, y)` for every column that is stored in at least one of the two
/// points, filling the missing side with zero. Columns stored in neither are
/// skipped; every metric here treats a `(0, 0)` pair as contributing nothing
/// beyond its share of `dim`.
struct SparseUnion<'a, T> {
    ia: &'a [usize],
    va: &'a [T],
    ib: &'a [usize],
    vb: &'a [T],
    pa: usize,
    pb: usize,
}

impl<'a, T> SparseUnion<'a, T> {
    fn new(ia: &'a [usize], va: &'a [T], ib: &'a [usize], vb: &'a [T]) -> Self {
        Self {
            ia,
            va,
            ib,
            vb,
            pa: 0,
            pb: 0,
        }
    }
}

impl<T: KnnFloat> Iterator for SparseUnion<'_, T> {
    type Item = (T, T);

    #[inline]
    fn next(&mut self) -> Option<(T, T)> {
        match (self.ia.get(self.pa), self.ib.get(self.pb)) {
            (Some(&ca), Some(&cb)) => {
                if ca == cb {
                    let item = (self.va[self.pa], self.vb[self.pb]);
                    self.pa += 1;
                    self.pb += 1;
                    Some(item)
                } else if ca < cb {
                    let item = (self.va[self.pa], T::zero());
                    self.pa += 1;
                    Some(item)
                } else {
                    let item = (T::zero(), self.vb[self.pb]);
                    self.pb += 1;
                    Some(item)
                }
            }
            (Some(_), None) => {
                let item = (self.va[self.pa], T::zero());
                self.pa += 1;
                Some(item)
            }
            (None, Some(_)) => {
                let item = (T::zero(), self.vb[self.pb]);
                self.pb += 1;
                Some(item)
            }
            (None, None) => None,
        }
    }
}

/// Shared accumulation for the dense and sparse kernels
fn surrogate_over_pairs<T, I>(
    metric: &Metric,
    pairs: I,
    dim: usize,
    sa: PointStats<T>,
    sb: PointStats<T>,
) -> T
where
    T: KnnFloat,
    I: Iterator<Item = (T, T)>,
{
    match metric {
        Metric::Euclidean | Metric::SqEuclidean => pairs
            .map(|(x, y)| {
                let diff = x - y;
                diff * diff
            })
            .fold(T::zero(), |acc, x| acc + x),
        Metric::Manhattan => pairs
            .map(|(x, y)| (x - y).abs())
            .fold(T::zero(), |acc, x| acc + x),
        Metric::Chebyshev => pairs
            .map(|(x, y)| (x - y).abs())
            .fold(T::zero(), |acc, x| acc.max(x)),
        Metric::Minkowski { p } => {
            let p = T::from_f64(*p).unwrap_or(T::one() + T::one());
            pairs
                .map(|(x, y)| (x - y).abs().powf(p))
                .fold(T::zero(), |acc, x| acc + x)
        }
        Metric::Cosine => {
            let dot = pairs.map(|(x, y)| x * y).fold(T::zero(), |acc, x| acc + x);
            angular_from_dot(dot, sa.norm, sb.norm)
        }
        Metric::Correlation => {
            let d = T::from_usize(dim).unwrap_or(T::one());
            let dot = pairs.map(|(x, y)| x * y).fold(T::zero(), |acc, x| acc + x);
            angular_from_dot(dot - d * sa.mean * sb.mean, sa.norm, sb.norm)
        }
        Metric::Hamming => {
            if dim == 0 {
                return T::zero();
            }
            let differing = pairs.filter(|(x, y)| x != y).count();
            T::from_usize(differing).unwrap_or(T::zero())
                / T::from_usize(dim).unwrap_or(T::one())
        }
        Metric::Jaccard => {
            let (union, inter) = pairs.fold((0usize, 0usize), |(u, i), (x, y)| {
                let nx = x != T::zero();
                let ny = y != T::zero();
                (u + (nx || ny) as usize, i + (nx && ny) as usize)
            });
            if union == 0 {
                T::zero()
            } else {
                T::from_usize(union - inter).unwrap_or(T::zero())
                    / T::from_usize(union).unwrap_or(T::one())
            }
        }
    }
}

/// One minus the cosine of the angle, with the zero-vector convention
///
/// Two zero vectors are identical (0), a zero vector against anything else is
/// maximally dissimilar on the non-negative side (1).
#[inline]
fn angular_from_dot<T: KnnFloat>(dot: T, norm_a: T, norm_b: T) -> T {
    let zero_a = norm_a <= T::zero();
    let zero_b = norm_b <= T::zero();
    match (zero_a, zero_b) {
        (true, true) => T::zero(),
        (true, false) | (false, true) => T::one(),
        (false, false) => (T::one() - dot / (norm_a * norm_b)).max(T::zero()),
    }
}

////////////////////
// Sparse helpers //
////////////////////

/// Dot product of two sparse vectors with sorted column indices
#[inline]
pub fn sparse_dot<T: KnnFloat>(ia: &[usize], va: &[T], ib: &[usize], vb: &[T]) -> T {
    let mut pa = 0;
    let mut pb = 0;
    let mut acc = T::zero();
    while pa < ia.len() && pb < ib.len() {
        if ia[pa] == ib[pb] {
            acc = acc + va[pa] * vb[pb];
            pa += 1;
            pb += 1;
        } else if ia[pa] < ib[pb] {
            pa += 1;
        } else {
            pb += 1;
        }
    }
    acc
}

/// Linear combination `wa * a + wb * b` of two sparse vectors
///
/// Explicit zeros in the result are dropped.
///
/// ### Returns
///
/// Tuple of `(column indices, values)`, column indices sorted
pub fn sparse_combine<T: KnnFloat>(
    ia: &[usize],
    va: &[T],
    wa: T,
    ib: &[usize],
    vb: &[T],
    wb: T,
) -> (Vec<usize>, Vec<T>) {
    let mut indices = Vec::with_capacity(ia.len() + ib.len());
    let mut values = Vec::with_capacity(ia.len() + ib.len());
    let mut pa = 0;
    let mut pb = 0;

    let mut push = |col: usize, val: T| {
        if val != T::zero() {
            indices.push(col);
            values.push(val);
        }
    };

    while pa < ia.len() || pb < ib.len() {
        let ca = ia.get(pa).copied().unwrap_or(usize::MAX);
        let cb = ib.get(pb).copied().unwrap_or(usize::MAX);
        if ca == cb {
            push(ca, wa * va[pa] + wb * vb[pb]);
            pa += 1;
            pb += 1;
        } else if ca < cb {
            push(ca, wa * va[pa]);
            pa += 1;
        } else {
            push(cb, wb * vb[pb]);
            pb += 1;
        }
    }

    (indices, values)
}

/// Dense dot product
#[inline(always)]
pub fn dense_dot<T: KnnFloat>(a: &[T], b: &[T]) -> T {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| x * y)
        .fold(T::zero(), |acc, x| acc + x)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    const NO_KWDS: &[(&str, f64)] = &[];

    fn dense_with_stats(metric: &Metric, a: &[f64], b: &[f64]) -> f64 {
        let sa = point_stats(metric, a, a.len());
        let sb = point_stats(metric, b, b.len());
        metric.correct(dense_distance(metric, a, b, sa, sb))
    }

    fn to_sparse(v: &[f64]) -> (Vec<usize>, Vec<f64>) {
        v.iter()
            .enumerate()
            .filter(|(_, x)| **x != 0.0)
            .map(|(i, x)| (i, *x))
            .unzip()
    }

    #[test]
    fn test_parse_metric_names_and_aliases() {
        assert_eq!(parse_metric("euclidean", NO_KWDS), Ok(Metric::Euclidean));
        assert_eq!(parse_metric("L2", NO_KWDS), Ok(Metric::Euclidean));
        assert_eq!(parse_metric("cityblock", NO_KWDS), Ok(Metric::Manhattan));
        assert_eq!(parse_metric("linf", NO_KWDS), Ok(Metric::Chebyshev));
        assert_eq!(parse_metric("Cosine", NO_KWDS), Ok(Metric::Cosine));
        assert_eq!(
            parse_metric("minkowski", &[("p", 3.0)]),
            Ok(Metric::Minkowski { p: 3.0 })
        );
        assert_eq!(
            parse_metric("minkowski", NO_KWDS),
            Ok(Metric::Minkowski { p: 2.0 })
        );
    }

    #[test]
    fn test_parse_metric_rejects_unknown() {
        assert!(matches!(
            parse_metric("braycurtis", NO_KWDS),
            Err(NNDescentError::UnsupportedMetric { .. })
        ));
        assert!(parse_metric(" euclidean", NO_KWDS).is_err());
        assert!(parse_metric("minkowski", &[("p", -1.0)]).is_err());
        assert!(parse_metric("minkowski", &[("p", f64::NAN)]).is_err());
    }

    #[test]
    fn test_euclidean_and_squared() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert_relative_eq!(
            dense_with_stats(&Metric::Euclidean, &a, &b),
            2.0_f64.sqrt(),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            dense_with_stats(&Metric::SqEuclidean, &a, &b),
            2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_manhattan_chebyshev_minkowski() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [5.0, 4.0, 3.0, 2.0, 1.0];
        assert_relative_eq!(dense_with_stats(&Metric::Manhattan, &a, &b), 12.0);
        assert_relative_eq!(dense_with_stats(&Metric::Chebyshev, &a, &b), 4.0);
        // (4^3 + 2^3 + 0 + 2^3 + 4^3)^(1/3) = 144^(1/3)
        assert_relative_eq!(
            dense_with_stats(&Metric::Minkowski { p: 3.0 }, &a, &b),
            144.0_f64.powf(1.0 / 3.0),
            epsilon = 1e-10
        );
        // p = 2 agrees with Euclidean
        assert_relative_eq!(
            dense_with_stats(&Metric::Minkowski { p: 2.0 }, &a, &b),
            dense_with_stats(&Metric::Euclidean, &a, &b),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_cosine_basic() {
        let x = [1.0, 0.0, 0.0];
        let y = [0.0, 1.0, 0.0];
        let xy = [1.0, 1.0, 0.0];
        assert_relative_eq!(dense_with_stats(&Metric::Cosine, &x, &y), 1.0);
        assert_relative_eq!(
            dense_with_stats(&Metric::Cosine, &x, &xy),
            1.0 - 1.0 / 2.0_f64.sqrt(),
            epsilon = 1e-12
        );
        assert_relative_eq!(dense_with_stats(&Metric::Cosine, &x, &x), 0.0);
        let neg = [-1.0, 0.0, 0.0];
        assert_relative_eq!(dense_with_stats(&Metric::Cosine, &x, &neg), 2.0);
    }

    #[test]
    fn test_angular_zero_vectors() {
        let zero = [0.0, 0.0, 0.0];
        let x = [1.0, 2.0, 3.0];
        for metric in [Metric::Cosine, Metric::Correlation] {
            assert_eq!(dense_with_stats(&metric, &zero, &zero), 0.0);
            assert_eq!(dense_with_stats(&metric, &zero, &x), 1.0);
            assert_eq!(dense_with_stats(&metric, &x, &zero), 1.0);
        }
    }

    #[test]
    fn test_correlation_shift_invariant() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [11.0, 12.0, 13.0, 14.0];
        let c = [4.0, 3.0, 2.0, 1.0];
        assert_relative_eq!(
            dense_with_stats(&Metric::Correlation, &a, &b),
            0.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            dense_with_stats(&Metric::Correlation, &a, &c),
            2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_hamming_and_jaccard() {
        let a = [1.0, 0.0, 1.0, 0.0];
        let b = [1.0, 1.0, 0.0, 0.0];
        assert_relative_eq!(dense_with_stats(&Metric::Hamming, &a, &b), 0.5);
        // union {0, 1, 2}, intersection {0}
        assert_relative_eq!(
            dense_with_stats(&Metric::Jaccard, &a, &b),
            2.0 / 3.0,
            epsilon = 1e-12
        );
        let zero = [0.0; 4];
        assert_eq!(dense_with_stats(&Metric::Jaccard, &zero, &zero), 0.0);
    }

    #[test]
    fn test_sparse_helpers() {
        let (ia, va) = (vec![0, 2, 5], vec![1.0, 2.0, 3.0]);
        let (ib, vb) = (vec![2, 3, 5], vec![4.0, 1.0, -1.0]);
        assert_relative_eq!(sparse_dot(&ia, &va, &ib, &vb), 8.0 - 3.0);

        let (ic, vc) = sparse_combine(&ia, &va, 1.0, &ib, &vb, -1.0);
        assert_eq!(ic, vec![0, 2, 3, 5]);
        assert_eq!(vc, vec![1.0, -2.0, -1.0, 4.0]);

        // cancellation drops the column
        let (ic, _) = sparse_combine(&ia, &va, 1.0, &ia, &va, -1.0);
        assert!(ic.is_empty());
    }

    fn all_metrics() -> Vec<Metric> {
        vec![
            Metric::Euclidean,
            Metric::SqEuclidean,
            Metric::Manhattan,
            Metric::Chebyshev,
            Metric::Minkowski { p: 1.5 },
            Metric::Cosine,
            Metric::Correlation,
            Metric::Hamming,
            Metric::Jaccard,
        ]
    }

    fn sparse_vector(dim: usize) -> impl Strategy<Value = Vec<f64>> {
        prop::collection::vec(
            prop_oneof![3 => Just(0.0), 2 => -5.0f64..5.0],
            dim,
        )
    }

    proptest! {
        #[test]
        fn prop_sparse_matches_dense(a in sparse_vector(12), b in sparse_vector(12)) {
            let (ia, va) = to_sparse(&a);
            let (ib, vb) = to_sparse(&b);
            for metric in all_metrics() {
                let dense = dense_with_stats(&metric, &a, &b);
                let sa = point_stats(&metric, &va, 12);
                let sb = point_stats(&metric, &vb, 12);
                let sparse = metric.correct(
                    sparse_distance(&metric, &ia, &va, &ib, &vb, 12, sa, sb)
                );
                prop_assert!(
                    (dense - sparse).abs() <= 1e-9 * (1.0 + dense.abs()),
                    "{:?}: dense {} vs sparse {}", metric, dense, sparse
                );
            }
        }

        #[test]
        fn prop_distances_non_negative_and_symmetric(
            a in sparse_vector(8),
            b in sparse_vector(8),
        ) {
            for metric in all_metrics() {
                let ab = dense_with_stats(&metric, &a, &b);
                let ba = dense_with_stats(&metric, &b, &a);
                prop_assert!(ab >= 0.0);
                prop_assert!((ab - ba).abs() <= 1e-9 * (1.0 + ab));
            }
        }
    }
}
