use num_traits::Float;
use rayon::prelude::*;

///////////////////
// Float on heap //
///////////////////

/// Wrapper for floats that implements Ord for use in BinaryHeap
///
/// NaN compares equal to everything; distances here are never NaN.
#[derive(Clone, Copy, Debug)]
pub struct OrderedFloat<T>(pub T);

impl<T: Float> PartialEq for OrderedFloat<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: Float> Eq for OrderedFloat<T> {}

impl<T: Float> PartialOrd for OrderedFloat<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Float> Ord for OrderedFloat<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .partial_cmp(&other.0)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

//////////////////////
// Row-level heaps  //
//////////////////////

/// Marker for an unfilled heap slot
pub const EMPTY: u32 = u32::MAX;

/// Does `(ka, ia)` sit above `(kb, ib)` in a max-heap
///
/// Ties on the key are broken by the index, so the order is total for
/// distinct indices.
#[inline(always)]
fn ranks_above<K: Float>(ka: K, ia: u32, kb: K, ib: u32) -> bool {
    ka > kb || (ka == kb && ia > ib)
}

/// Restore the max-heap property below `pos`, considering slots `< limit`
#[inline]
fn sift_down<K: Float>(
    indices: &mut [u32],
    keys: &mut [K],
    mut flags: Option<&mut [bool]>,
    mut pos: usize,
    limit: usize,
) {
    loop {
        let left = 2 * pos + 1;
        if left >= limit {
            break;
        }
        let right = left + 1;

        let mut largest = pos;
        if ranks_above(keys[left], indices[left], keys[largest], indices[largest]) {
            largest = left;
        }
        if right < limit && ranks_above(keys[right], indices[right], keys[largest], indices[largest])
        {
            largest = right;
        }
        if largest == pos {
            break;
        }

        indices.swap(pos, largest);
        keys.swap(pos, largest);
        if let Some(f) = flags.as_deref_mut() {
            f.swap(pos, largest);
        }
        pos = largest;
    }
}

/// Checked push into one fixed-capacity max-heap row
///
/// The row starts filled with `EMPTY` slots keyed at `+inf`, so the root is
/// always the current admission threshold and the heap never holds more
/// than `indices.len()` entries.
///
/// ### Params
///
/// * `indices` - Neighbour indices of the row
/// * `keys` - Keys (distances or priorities) of the row
/// * `flags` - Optional per-slot flags moved in lockstep with the entries
/// * `cand` - Candidate index
/// * `key` - Candidate key
/// * `flag` - Flag stored with the candidate
///
/// ### Returns
///
/// `true` if the candidate was admitted. Rejects keys that are not strictly
/// below the root (this includes NaN) and indices already in the row.
#[inline]
pub fn checked_heap_push<K: Float>(
    indices: &mut [u32],
    keys: &mut [K],
    mut flags: Option<&mut [bool]>,
    cand: u32,
    key: K,
    flag: bool,
) -> bool {
    if indices.is_empty() || !(key < keys[0]) {
        return false;
    }
    if indices.contains(&cand) {
        return false;
    }

    indices[0] = cand;
    keys[0] = key;
    if let Some(f) = flags.as_deref_mut() {
        f[0] = flag;
    }
    let limit = indices.len();
    sift_down(indices, keys, flags, 0, limit);

    true
}

/// Sort a heap row ascending by `(key, index)` in place
///
/// `EMPTY` slots (key `+inf`) end up at the back.
pub fn deheap_sort<K: Float>(indices: &mut [u32], keys: &mut [K], mut flags: Option<&mut [bool]>) {
    for end in (1..indices.len()).rev() {
        indices.swap(0, end);
        keys.swap(0, end);
        if let Some(f) = flags.as_deref_mut() {
            f.swap(0, end);
        }
        sift_down(indices, keys, flags.as_deref_mut(), 0, end);
    }
}

/// Replace the trailing `EMPTY` slots of a sorted row
///
/// Slots are filled with the lowest indices in `0..n` that are neither in the
/// row nor `exclude`, keyed at `+inf`, so the row stays sorted and holds no
/// `EMPTY` marker if enough indices exist.
///
/// ### Params
///
/// * `indices` - Row indices, sorted ascending by key (`EMPTY` at the back)
/// * `keys` - Row keys
/// * `exclude` - Index that must not appear in the row (the row's owner)
/// * `n` - Size of the index space
///
/// ### Returns
///
/// Number of slots that were filled
pub fn fill_empty_sorted<K: Float>(
    indices: &mut [u32],
    keys: &mut [K],
    exclude: Option<usize>,
    n: usize,
) -> usize {
    let Some(first_empty) = indices.iter().position(|&j| j == EMPTY) else {
        return 0;
    };

    let mut filled = 0;
    let mut next = 0;
    for slot in first_empty..indices.len() {
        while next < n
            && (Some(next) == exclude || indices[..first_empty + filled].contains(&(next as u32)))
        {
            next += 1;
        }
        if next >= n {
            break;
        }
        indices[slot] = next as u32;
        keys[slot] = K::infinity();
        filled += 1;
        next += 1;
    }
    filled
}

////////////////////
// NeighbourHeap  //
////////////////////

/// Flat candidate heap arena over all points
///
/// Row `i` occupies slots `i * k .. (i + 1) * k` of the three parallel
/// arrays and is a max-heap on distance. Rows are mutated only through
/// `try_insert` (sequential) or through exclusive `HeapRowMut` views
/// (parallel, one worker per row).
///
/// ### Fields
///
/// * `n` - Number of rows (points)
/// * `k` - Capacity per row
/// * `indices` - Neighbour indices, `EMPTY` for unfilled slots
/// * `dists` - Surrogate distances, `+inf` for unfilled slots
/// * `flags` - `true` if the entry has not been used in a local join yet
#[derive(Clone, Debug)]
pub struct NeighbourHeap<T> {
    n: usize,
    k: usize,
    indices: Vec<u32>,
    dists: Vec<T>,
    flags: Vec<bool>,
}

/// Exclusive view on one heap row
pub struct HeapRowMut<'a, T> {
    pub point: usize,
    pub indices: &'a mut [u32],
    pub dists: &'a mut [T],
    pub flags: &'a mut [bool],
}

impl<T: Float> HeapRowMut<'_, T> {
    /// Checked insertion, see `NeighbourHeap::try_insert`
    #[inline]
    pub fn push(&mut self, neighbour: usize, dist: T) -> bool {
        if neighbour == self.point {
            return false;
        }
        checked_heap_push(
            self.indices,
            self.dists,
            Some(&mut *self.flags),
            neighbour as u32,
            dist,
            true,
        )
    }

    /// Are all slots filled
    pub fn is_full(&self) -> bool {
        !self.indices.contains(&EMPTY)
    }
}

impl<T: Float + Send + Sync> NeighbourHeap<T> {
    /// Generate an empty arena
    ///
    /// ### Params
    ///
    /// * `n` - Number of points
    /// * `k` - Capacity per point
    pub fn new(n: usize, k: usize) -> Self {
        Self {
            n,
            k,
            indices: vec![EMPTY; n * k],
            dists: vec![T::infinity(); n * k],
            flags: vec![false; n * k],
        }
    }

    /// Number of points
    pub fn n(&self) -> usize {
        self.n
    }

    /// Capacity per point
    pub fn k(&self) -> usize {
        self.k
    }

    /// Borrow the row of `point`
    #[inline]
    pub fn row(&self, point: usize) -> (&[u32], &[T], &[bool]) {
        let range = point * self.k..(point + 1) * self.k;
        (
            &self.indices[range.clone()],
            &self.dists[range.clone()],
            &self.flags[range],
        )
    }

    /// Current admission threshold (worst kept distance) of `point`
    #[inline]
    pub fn threshold(&self, point: usize) -> T {
        self.dists[point * self.k]
    }

    /// Insert `neighbour` into the heap of `point`
    ///
    /// ### Params
    ///
    /// * `point` - Owner of the heap
    /// * `neighbour` - Candidate neighbour
    /// * `dist` - Surrogate distance between the two
    ///
    /// ### Returns
    ///
    /// `true` if the heap changed. Self-neighbours, duplicates and candidates
    /// not strictly better than the current worst (when full) are rejected;
    /// admitted entries are flagged new.
    pub fn try_insert(&mut self, point: usize, neighbour: usize, dist: T) -> bool {
        if point == neighbour || point >= self.n || neighbour >= self.n {
            return false;
        }
        let range = point * self.k..(point + 1) * self.k;
        checked_heap_push(
            &mut self.indices[range.clone()],
            &mut self.dists[range.clone()],
            Some(&mut self.flags[range]),
            neighbour as u32,
            dist,
            true,
        )
    }

    /// Parallel iterator over exclusive row views
    pub fn par_rows_mut(&mut self) -> impl IndexedParallelIterator<Item = HeapRowMut<'_, T>> {
        let k = self.k;
        self.indices
            .par_chunks_mut(k)
            .zip(self.dists.par_chunks_mut(k))
            .zip(self.flags.par_chunks_mut(k))
            .enumerate()
            .map(|(point, ((indices, dists), flags))| HeapRowMut {
                point,
                indices,
                dists,
                flags,
            })
    }

    /// Sort every row ascending by distance in place
    ///
    /// After this the rows are no longer heaps.
    pub fn deheap_sort(&mut self) {
        self.par_rows_mut().for_each(|row| {
            deheap_sort(row.indices, row.dists, Some(row.flags));
        });
    }

    /// Take the flat arrays out of the arena
    pub fn into_parts(self) -> (Vec<u32>, Vec<T>) {
        (self.indices, self.dists)
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ordered_float_ordering() {
        let mut vals = [OrderedFloat(3.0), OrderedFloat(-1.0), OrderedFloat(2.5)];
        vals.sort();
        assert_eq!(vals[0].0, -1.0);
        assert_eq!(vals[2].0, 3.0);
    }

    #[test]
    fn test_try_insert_rejections() {
        let mut heap = NeighbourHeap::<f32>::new(3, 2);

        assert!(!heap.try_insert(0, 0, 0.5));
        assert!(heap.try_insert(0, 1, 2.0));
        assert!(!heap.try_insert(0, 1, 1.0));
        assert!(heap.try_insert(0, 2, 3.0));

        // full: root is the worst kept distance
        assert_eq!(heap.threshold(0), 3.0);
        assert!(!heap.try_insert(0, 2, 3.0));
        assert!(!heap.try_insert(0, 2, 4.0));
        assert!(!heap.try_insert(0, 5, 0.1));
    }

    #[test]
    fn test_eviction_keeps_best() {
        let mut heap = NeighbourHeap::<f64>::new(10, 3);
        for (j, d) in [(1, 5.0), (2, 4.0), (3, 3.0), (4, 2.0), (5, 1.0)] {
            heap.try_insert(0, j, d);
        }
        heap.deheap_sort();
        let (indices, dists, flags) = heap.row(0);
        assert_eq!(indices, &[5, 4, 3]);
        assert_eq!(dists, &[1.0, 2.0, 3.0]);
        assert!(flags.iter().all(|&f| f));
    }

    #[test]
    fn test_equal_distance_is_rejected_when_full() {
        let mut heap = NeighbourHeap::<f32>::new(4, 2);
        assert!(heap.try_insert(0, 1, 1.0));
        assert!(heap.try_insert(0, 2, 1.0));
        assert!(!heap.try_insert(0, 3, 1.0));
        heap.deheap_sort();
        assert_eq!(heap.row(0).0, &[1, 2]);
    }

    #[test]
    fn test_nan_is_rejected() {
        let mut heap = NeighbourHeap::<f32>::new(2, 1);
        assert!(!heap.try_insert(0, 1, f32::NAN));
        assert_eq!(heap.row(0).0[0], EMPTY);
    }

    #[test]
    fn test_partial_rows_sort_empty_last() {
        let mut heap = NeighbourHeap::<f32>::new(4, 4);
        heap.try_insert(1, 3, 0.7);
        heap.try_insert(1, 0, 0.2);
        heap.deheap_sort();
        let (indices, dists, _) = heap.row(1);
        assert_eq!(&indices[..2], &[0, 3]);
        assert_eq!(&indices[2..], &[EMPTY, EMPTY]);
        assert!(dists[2].is_infinite());
    }

    #[test]
    fn test_par_rows_are_independent() {
        let mut heap = NeighbourHeap::<f64>::new(50, 5);
        heap.par_rows_mut().for_each(|mut row| {
            for j in 0..50 {
                row.push(j, ((j as f64) - (row.point as f64)).abs());
            }
        });
        for i in 0..50 {
            let (indices, _, _) = heap.row(i);
            assert!(!indices.contains(&(i as u32)));
            assert!(!indices.contains(&EMPTY));
        }
    }

    #[test]
    fn test_fill_empty_sorted() {
        let mut indices = [2, 0, EMPTY, EMPTY, EMPTY];
        let mut keys = [0.1f32, 0.3, f32::INFINITY, f32::INFINITY, f32::INFINITY];
        let filled = fill_empty_sorted(&mut indices, &mut keys, Some(1), 10);

        assert_eq!(filled, 3);
        assert_eq!(indices, [2, 0, 3, 4, 5]);
        assert!(keys[2..].iter().all(|k| k.is_infinite()));

        // not enough indices left
        let mut indices = [1, EMPTY, EMPTY];
        let mut keys = [0.5f64, f64::INFINITY, f64::INFINITY];
        assert_eq!(fill_empty_sorted(&mut indices, &mut keys, Some(0), 3), 1);
        assert_eq!(indices, [1, 2, EMPTY]);

        let mut full = [3, 1];
        let mut keys = [0.0f64, 1.0];
        assert_eq!(fill_empty_sorted(&mut full, &mut keys, None, 5), 0);
    }

    proptest! {
        #[test]
        fn prop_heap_rows_stay_valid(
            inserts in prop::collection::vec((0usize..20, 0.0f64..10.0), 0..200),
            k in 1usize..8,
        ) {
            let mut heap = NeighbourHeap::<f64>::new(20, k);
            for &(j, d) in &inserts {
                heap.try_insert(7, j, d);
            }
            heap.deheap_sort();
            let (indices, dists, _) = heap.row(7);

            let filled: Vec<u32> = indices.iter().copied().filter(|&j| j != EMPTY).collect();
            let mut unique = filled.clone();
            unique.sort_unstable();
            unique.dedup();
            prop_assert_eq!(unique.len(), filled.len());
            prop_assert!(!filled.contains(&7));
            prop_assert!(filled.len() <= k);
            prop_assert!(dists.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
