use faer_traits::ComplexField;
use faer::Mat;
use num_traits::{Float, FromPrimitive};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generate uniformly distributed data in the unit cube
///
/// ### Params
///
/// * `n_samples` - Number of samples
/// * `dim` - Dimensionality
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// Matrix of shape (n_samples, dim)
pub fn generate_uniform_data<T>(n_samples: usize, dim: usize, seed: u64) -> Mat<T>
where
    T: Float + FromPrimitive + ComplexField,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Mat::<T>::zeros(n_samples, dim);
    for i in 0..n_samples {
        for j in 0..dim {
            data[(i, j)] = T::from_f64(rng.random::<f64>()).unwrap();
        }
    }
    data
}

/// Generate synthetic data with cluster structure
///
/// Creates data with multiple clusters of uniform noise around random
/// centres.
///
/// ### Params
///
/// * `n_samples` - Number of samples
/// * `dim` - Dimensionality
/// * `n_clusters` - Number of distinct clusters
/// * `cluster_std` - Half-width of the noise within clusters
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// Matrix of shape (n_samples, dim)
pub fn generate_clustered_data<T>(
    n_samples: usize,
    dim: usize,
    n_clusters: usize,
    cluster_std: f64,
    seed: u64,
) -> Mat<T>
where
    T: Float + FromPrimitive + ComplexField,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Mat::<T>::zeros(n_samples, dim);

    let centres: Vec<Vec<f64>> = (0..n_clusters)
        .map(|_| (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect();

    for i in 0..n_samples {
        let centre = &centres[i % n_clusters];
        for j in 0..dim {
            let noise: f64 = rng.random_range(-cluster_std..cluster_std);
            data[(i, j)] = T::from_f64(centre[j] + noise).unwrap();
        }
    }

    data
}

/// Generate degenerate data: exact duplicates and all-zero rows
///
/// A third of the rows are zero, the rest are copies of a handful of
/// distinct random rows.
///
/// ### Params
///
/// * `n_samples` - Number of samples
/// * `dim` - Dimensionality
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// Matrix of shape (n_samples, dim)
pub fn generate_duplicate_heavy_data<T>(n_samples: usize, dim: usize, seed: u64) -> Mat<T>
where
    T: Float + FromPrimitive + ComplexField,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let n_distinct = 5;
    let prototypes: Vec<Vec<f64>> = (0..n_distinct)
        .map(|_| (0..dim).map(|_| rng.random_range(-1.0..1.0)).collect())
        .collect();

    let mut data = Mat::<T>::zeros(n_samples, dim);
    for i in 0..n_samples {
        if i % 3 == 0 {
            continue;
        }
        let proto = &prototypes[rng.random_range(0..n_distinct)];
        for j in 0..dim {
            data[(i, j)] = T::from_f64(proto[j]).unwrap();
        }
    }
    data
}

/// Generate a random sparse matrix in CSR form
///
/// Every entry is stored with probability `density`, values uniform in
/// `[0, 1)`. Rows may end up empty.
///
/// ### Params
///
/// * `n_samples` - Number of rows
/// * `n_features` - Number of columns
/// * `density` - Probability of an entry being stored
/// * `seed` - Random seed for reproducibility
///
/// ### Returns
///
/// Tuple of `(indptr, indices, data)` with sorted columns per row
pub fn generate_sparse_data<T>(
    n_samples: usize,
    n_features: usize,
    density: f64,
    seed: u64,
) -> (Vec<usize>, Vec<usize>, Vec<T>)
where
    T: Float + FromPrimitive,
{
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indptr = Vec::with_capacity(n_samples + 1);
    let mut indices = Vec::new();
    let mut data = Vec::new();

    indptr.push(0);
    for _ in 0..n_samples {
        for j in 0..n_features {
            if rng.random::<f64>() < density {
                indices.push(j);
                // keep values away from zero so no stored entry vanishes
                data.push(T::from_f64(rng.random_range(0.01..1.0)).unwrap());
            }
        }
        indptr.push(indices.len());
    }

    (indptr, indices, data)
}

/// Densify CSR arrays into a matrix
pub fn sparse_to_dense<T>(
    indptr: &[usize],
    indices: &[usize],
    data: &[T],
    n_features: usize,
) -> Mat<T>
where
    T: Float + FromPrimitive + ComplexField,
{
    let n_samples = indptr.len().saturating_sub(1);
    let mut mat = Mat::<T>::zeros(n_samples, n_features);
    for i in 0..n_samples {
        for p in indptr[i]..indptr[i + 1] {
            mat[(i, indices[p])] = mat[(i, indices[p])] + data[p];
        }
    }
    mat
}
