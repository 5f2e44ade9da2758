use num_traits::{Float, FromPrimitive, ToPrimitive};
use std::fmt::Debug;
use std::iter::Sum;

/// Trait for the floating-point types the index can be built over. Bundles
/// the numeric traits every distance kernel and heap needs together with the
/// thread-safety bounds required by the rayon-parallel build.
pub trait KnnFloat:
    Float + FromPrimitive + ToPrimitive + Send + Sync + Sum + Debug + Default + 'static
{
}

impl<T> KnnFloat for T where
    T: Float + FromPrimitive + ToPrimitive + Send + Sync + Sum + Debug + Default + 'static
{
}
