use faer::MatRef;

use crate::error::{NNDescentError, Result};
use crate::utils::dist::*;
use crate::utils::traits::KnnFloat;

///////////
// Input //
///////////

/// Borrowed row-compressed sparse matrix
///
/// Columns within a row do not need to be sorted; duplicates are summed and
/// explicit zeros dropped when the data is ingested.
///
/// ### Fields
///
/// * `indptr` - Row pointers, length `nrows + 1`
/// * `indices` - Column index of every stored value
/// * `data` - The stored values
/// * `ncols` - Number of columns (features)
#[derive(Clone, Copy, Debug)]
pub struct CsrRef<'a, T> {
    pub indptr: &'a [usize],
    pub indices: &'a [usize],
    pub data: &'a [T],
    pub ncols: usize,
}

impl<'a, T> CsrRef<'a, T> {
    /// Wrap CSR arrays
    pub fn new(indptr: &'a [usize], indices: &'a [usize], data: &'a [T], ncols: usize) -> Self {
        Self {
            indptr,
            indices,
            data,
            ncols,
        }
    }

    /// Number of rows
    pub fn nrows(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    /// Check the structural consistency of the arrays
    fn validate(&self) -> Result<()> {
        if self.indptr.is_empty() {
            return Err(NNDescentError::MalformedSparse(
                "row pointer array is empty".to_string(),
            ));
        }
        if self.indices.len() != self.data.len() {
            return Err(NNDescentError::MalformedSparse(format!(
                "{} column indices but {} values",
                self.indices.len(),
                self.data.len()
            )));
        }
        if self.indptr.windows(2).any(|w| w[0] > w[1]) {
            return Err(NNDescentError::MalformedSparse(
                "row pointers are not monotone".to_string(),
            ));
        }
        let last = self.indptr[self.indptr.len() - 1];
        if last > self.indices.len() {
            return Err(NNDescentError::MalformedSparse(format!(
                "row pointers reach {last} but only {} values are stored",
                self.indices.len()
            )));
        }
        if let Some(&col) = self.indices.iter().find(|&&c| c >= self.ncols) {
            return Err(NNDescentError::MalformedSparse(format!(
                "column index {col} out of range for {} columns",
                self.ncols
            )));
        }
        Ok(())
    }

    /// Raw (unsorted) slices of one row
    fn raw_row(&self, i: usize) -> (&'a [usize], &'a [T]) {
        let (start, end) = (self.indptr[i], self.indptr[i + 1]);
        (&self.indices[start..end], &self.data[start..end])
    }
}

/// Input data for construction or querying
#[derive(Clone, Copy, Debug)]
pub enum DataInput<'a, T> {
    /// Dense matrix, rows = samples, columns = features
    Dense(MatRef<'a, T>),
    /// Sparse row-compressed matrix
    Sparse(CsrRef<'a, T>),
}

impl<T: KnnFloat> DataInput<'_, T> {
    /// First row holding a NaN or infinite value, if any. CSR arrays must
    /// have been validated.
    fn first_non_finite_row(&self) -> Option<usize> {
        match self {
            DataInput::Dense(mat) => {
                (0..mat.nrows()).find(|&i| mat.row(i).iter().any(|v| !v.is_finite()))
            }
            DataInput::Sparse(csr) => (0..csr.nrows()).find(|&i| {
                let (_, vals) = csr.raw_row(i);
                vals.iter().any(|v| !v.is_finite())
            }),
        }
    }
}

impl<T> DataInput<'_, T> {
    /// Number of samples
    pub fn nrows(&self) -> usize {
        match self {
            DataInput::Dense(mat) => mat.nrows(),
            DataInput::Sparse(csr) => csr.nrows(),
        }
    }

    /// Number of features
    pub fn ncols(&self) -> usize {
        match self {
            DataInput::Dense(mat) => mat.ncols(),
            DataInput::Sparse(csr) => csr.ncols,
        }
    }
}

/// Sort a sparse row by column, sum duplicate columns, drop zeros
fn normalise_sparse_row<T: KnnFloat>(cols: &[usize], vals: &[T]) -> (Vec<usize>, Vec<T>) {
    let mut pairs: Vec<(usize, T)> = cols.iter().copied().zip(vals.iter().copied()).collect();
    pairs.sort_by_key(|&(c, _)| c);

    let mut out_cols: Vec<usize> = Vec::with_capacity(pairs.len());
    let mut out_vals: Vec<T> = Vec::with_capacity(pairs.len());
    for (c, v) in pairs {
        if out_cols.last() == Some(&c) {
            let last = out_vals.len() - 1;
            out_vals[last] = out_vals[last] + v;
        } else {
            out_cols.push(c);
            out_vals.push(v);
        }
    }

    let (cols, vals): (Vec<usize>, Vec<T>) = out_cols
        .into_iter()
        .zip(out_vals)
        .filter(|(_, v)| *v != T::zero())
        .unzip();
    (cols, vals)
}

////////////
// Points //
////////////

/// Borrowed view on one point
#[derive(Clone, Copy, Debug)]
pub enum PointRef<'a, T> {
    Dense(&'a [T]),
    Sparse {
        indices: &'a [usize],
        values: &'a [T],
    },
}

/// An owned query point already in the representation of the trained data
///
/// ### Fields
///
/// * `repr` - Dense values or sorted sparse `(indices, values)`
/// * `stats` - Metric constants of the point
#[derive(Clone, Debug)]
pub struct QueryPoint<T> {
    repr: OwnedPoint<T>,
    pub stats: PointStats<T>,
}

#[derive(Clone, Debug)]
enum OwnedPoint<T> {
    Dense(Vec<T>),
    Sparse(Vec<usize>, Vec<T>),
}

impl<T> QueryPoint<T> {
    /// Borrow the point
    pub fn view(&self) -> PointRef<'_, T> {
        match &self.repr {
            OwnedPoint::Dense(values) => PointRef::Dense(values),
            OwnedPoint::Sparse(indices, values) => PointRef::Sparse { indices, values },
        }
    }
}

/////////////
// Dataset //
/////////////

/// Internal storage of the trained points
#[derive(Clone, Debug)]
enum Storage<T> {
    /// Row-major, `n * dim` values
    Dense { vectors_flat: Vec<T> },
    /// CSR with sorted, unique columns and no explicit zeros
    Sparse {
        indptr: Vec<usize>,
        indices: Vec<usize>,
        values: Vec<T>,
    },
}

/// The trained dataset together with its metric
///
/// Read-only after construction. Holds the per-point metric constants
/// (norms, means) computed once at ingestion and shared by the forest, the
/// descent and the query engine.
///
/// ### Fields
///
/// * `storage` - Dense or sparse point storage
/// * `n` - Number of points
/// * `dim` - Number of features
/// * `metric` - The distance metric
/// * `stats` - Per-point metric constants. Empty for metrics without any.
#[derive(Clone, Debug)]
pub struct Dataset<T> {
    storage: Storage<T>,
    n: usize,
    dim: usize,
    metric: Metric,
    stats: Vec<PointStats<T>>,
}

impl<T: KnnFloat> Dataset<T> {
    /// Ingest the input data
    ///
    /// ### Params
    ///
    /// * `input` - Dense or sparse data
    /// * `metric` - The metric distances will be computed with
    ///
    /// ### Returns
    ///
    /// The owned dataset, `MalformedSparse` if the CSR arrays are
    /// inconsistent or `NonFiniteValue` if a value is NaN or infinite
    pub fn new(input: &DataInput<T>, metric: Metric) -> Result<Self> {
        let n = input.nrows();
        let dim = input.ncols();

        if let DataInput::Sparse(csr) = input {
            csr.validate()?;
        }
        if let Some(row) = input.first_non_finite_row() {
            return Err(NNDescentError::NonFiniteValue { row });
        }

        let storage = match input {
            DataInput::Dense(mat) => {
                let mut vectors_flat = Vec::with_capacity(n * dim);
                for i in 0..n {
                    vectors_flat.extend(mat.row(i).iter().copied());
                }
                Storage::Dense { vectors_flat }
            }
            DataInput::Sparse(csr) => {
                let mut indptr = Vec::with_capacity(n + 1);
                let mut indices = Vec::new();
                let mut values = Vec::new();
                indptr.push(0);
                for i in 0..n {
                    let (cols, vals) = csr.raw_row(i);
                    let (cols, vals) = normalise_sparse_row(cols, vals);
                    indices.extend(cols);
                    values.extend(vals);
                    indptr.push(indices.len());
                }
                Storage::Sparse {
                    indptr,
                    indices,
                    values,
                }
            }
        };

        let mut dataset = Self {
            storage,
            n,
            dim,
            metric,
            stats: Vec::new(),
        };

        if metric.is_angular() {
            dataset.stats = (0..n)
                .map(|i| match dataset.point(i) {
                    PointRef::Dense(values) => point_stats(&metric, values, dim),
                    PointRef::Sparse { values, .. } => point_stats(&metric, values, dim),
                })
                .collect();
        }

        Ok(dataset)
    }

    /// Number of points
    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of features
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The distance metric
    #[inline]
    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Is the data stored sparse
    pub fn is_sparse(&self) -> bool {
        matches!(self.storage, Storage::Sparse { .. })
    }

    /// Borrow point `i`
    #[inline]
    pub fn point(&self, i: usize) -> PointRef<'_, T> {
        match &self.storage {
            Storage::Dense { vectors_flat } => {
                PointRef::Dense(&vectors_flat[i * self.dim..(i + 1) * self.dim])
            }
            Storage::Sparse {
                indptr,
                indices,
                values,
            } => {
                let (start, end) = (indptr[i], indptr[i + 1]);
                PointRef::Sparse {
                    indices: &indices[start..end],
                    values: &values[start..end],
                }
            }
        }
    }

    /// Metric constants of point `i`
    #[inline]
    pub fn stats(&self, i: usize) -> PointStats<T> {
        self.stats.get(i).copied().unwrap_or_default()
    }

    /// Surrogate distance between two trained points
    #[inline]
    pub fn distance(&self, i: usize, j: usize) -> T {
        self.distance_between(self.point(i), self.stats(i), self.point(j), self.stats(j))
    }

    /// Surrogate distance between trained point `i` and a query point
    #[inline]
    pub fn distance_to_query(&self, i: usize, query: &QueryPoint<T>) -> T {
        self.distance_between(self.point(i), self.stats(i), query.view(), query.stats)
    }

    /// Surrogate distance between two points in any representation
    pub fn distance_between(
        &self,
        a: PointRef<'_, T>,
        sa: PointStats<T>,
        b: PointRef<'_, T>,
        sb: PointStats<T>,
    ) -> T {
        match (a, b) {
            (PointRef::Dense(a), PointRef::Dense(b)) => dense_distance(&self.metric, a, b, sa, sb),
            (
                PointRef::Sparse {
                    indices: ia,
                    values: va,
                },
                PointRef::Sparse {
                    indices: ib,
                    values: vb,
                },
            ) => sparse_distance(&self.metric, ia, va, ib, vb, self.dim, sa, sb),
            (PointRef::Dense(a), PointRef::Sparse { indices, values }) => {
                let (ia, va) = sparsify(a);
                sparse_distance(&self.metric, &ia, &va, indices, values, self.dim, sa, sb)
            }
            (PointRef::Sparse { indices, values }, PointRef::Dense(b)) => {
                let (ib, vb) = sparsify(b);
                sparse_distance(&self.metric, indices, values, &ib, &vb, self.dim, sa, sb)
            }
        }
    }

    /// Check that query input is compatible with the trained data
    ///
    /// ### Returns
    ///
    /// `DimensionMismatch` if the feature counts differ, `MalformedSparse`
    /// for inconsistent CSR arrays, `NonFiniteValue` for NaN or infinite
    /// values
    pub fn check_query_input(&self, input: &DataInput<T>) -> Result<()> {
        if input.ncols() != self.dim {
            return Err(NNDescentError::DimensionMismatch {
                expected: self.dim,
                got: input.ncols(),
            });
        }
        if let DataInput::Sparse(csr) = input {
            csr.validate()?;
        }
        if let Some(row) = input.first_non_finite_row() {
            return Err(NNDescentError::NonFiniteValue { row });
        }
        Ok(())
    }

    /// Convert row `row` of a (validated) query input into a `QueryPoint`
    ///
    /// The point is converted into the representation of the trained data, so
    /// a dense query against a sparse index is sparsified and vice versa.
    pub fn query_point(&self, input: &DataInput<T>, row: usize) -> QueryPoint<T> {
        let repr = match (input, self.is_sparse()) {
            (DataInput::Dense(mat), false) => {
                OwnedPoint::Dense(mat.row(row).iter().copied().collect())
            }
            (DataInput::Dense(mat), true) => {
                let dense: Vec<T> = mat.row(row).iter().copied().collect();
                let (indices, values) = sparsify(&dense);
                OwnedPoint::Sparse(indices, values)
            }
            (DataInput::Sparse(csr), true) => {
                let (cols, vals) = csr.raw_row(row);
                let (indices, values) = normalise_sparse_row(cols, vals);
                OwnedPoint::Sparse(indices, values)
            }
            (DataInput::Sparse(csr), false) => {
                let (cols, vals) = csr.raw_row(row);
                let mut dense = vec![T::zero(); self.dim];
                for (&c, &v) in cols.iter().zip(vals) {
                    dense[c] = dense[c] + v;
                }
                OwnedPoint::Dense(dense)
            }
        };

        let stats = if self.metric.is_angular() {
            match &repr {
                OwnedPoint::Dense(values) => point_stats(&self.metric, values, self.dim),
                OwnedPoint::Sparse(_, values) => point_stats(&self.metric, values, self.dim),
            }
        } else {
            PointStats::default()
        };

        QueryPoint { repr, stats }
    }

    /// Represent trained point `i` as a query point
    pub fn as_query(&self, i: usize) -> QueryPoint<T> {
        let repr = match self.point(i) {
            PointRef::Dense(values) => OwnedPoint::Dense(values.to_vec()),
            PointRef::Sparse { indices, values } => {
                OwnedPoint::Sparse(indices.to_vec(), values.to_vec())
            }
        };
        QueryPoint {
            repr,
            stats: self.stats(i),
        }
    }
}

/// Keep the non-zero entries of a dense slice
fn sparsify<T: KnnFloat>(dense: &[T]) -> (Vec<usize>, Vec<T>) {
    dense
        .iter()
        .enumerate()
        .filter(|(_, v)| **v != T::zero())
        .map(|(i, v)| (i, *v))
        .unzip()
}

///////////
// Tests //
///////////
