use rand::rngs::{SmallRng, StdRng};
use rand::{Rng, SeedableRng};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

/// Independent consumers of randomness
///
/// Each gets its own family of sub-streams so that, for example, the number
/// of trees cannot shift the sampling of a descent round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Tie breaks and split selection inside one RP tree
    Tree,
    /// Random fill of under-seeded heaps
    Fill,
    /// Candidate priorities inside one descent round
    Sampling,
    /// Random entry points of one query
    Search,
}

/// Derive an independent generator from a seed
///
/// ### Params
///
/// * `seed` - Parent seed, usually drawn from the master `KnnRng`
/// * `stream` - Which consumer the generator is for
/// * `index` - Point, query or tree index within that consumer
///
/// ### Returns
///
/// A `SmallRng` that depends only on the three inputs, never on scheduling
#[inline]
pub fn derive_rng(seed: u64, stream: Stream, index: usize) -> SmallRng {
    let mut hasher = FxHasher::default();
    seed.hash(&mut hasher);
    stream.hash(&mut hasher);
    (index as u64).hash(&mut hasher);
    SmallRng::seed_from_u64(hasher.finish())
}

/// Master random state of an index
///
/// The only stateful generator in the crate. Work that runs in parallel
/// receives seeds drawn from it in a fixed sequential order and then derives
/// its own sub-streams via `derive_rng`, so results do not depend on the
/// number of worker threads.
#[derive(Clone, Debug)]
pub struct KnnRng {
    master: StdRng,
}

impl KnnRng {
    /// Generate the master state from a user seed
    pub fn new(seed: u64) -> Self {
        Self {
            master: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw the next sub-seed
    #[inline]
    pub fn next_seed(&mut self) -> u64 {
        self.master.random()
    }

    /// Draw `count` sub-seeds in order
    pub fn seeds(&mut self, count: usize) -> Vec<u64> {
        (0..count).map(|_| self.next_seed()).collect()
    }
}

///////////
// Tests //
///////////
