//! Synthetic regression pairs and host <-> burn conversion.
//!
//! The task is a fixed linear map: `z0 ~ U[-1, 1]^d`, `zN = scale * z0`. With `scale = -1`
//! (the default) this is the reflection a plain 1-D Neural ODE cannot represent, which is what
//! makes augmentation visible.
//!
//! Data lives in `ndarray` on the host (generation, persistence, reporting) and is moved into
//! burn tensors only for the solve.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{s, Array2, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::{Error, Result};

/// One immutable batch of `(z0, zN)` pairs.
#[derive(Debug, Clone)]
pub struct SamplePairs {
    /// Augmented initial states, `[n, data_dim + extra_dim]`.
    pub z0: Array2<f32>,
    /// Targets, `[n, data_dim]`.
    pub zn: Array2<f32>,
    pub data_dim: usize,
    pub extra_dim: usize,
}

impl SamplePairs {
    pub fn len(&self) -> usize {
        self.z0.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.z0.nrows() == 0
    }

    /// `data_dim + extra_dim`.
    pub fn total_dim(&self) -> usize {
        self.data_dim + self.extra_dim
    }
}

/// Append `extra_dim` zero columns.
pub fn augment(z: &ArrayView2<f32>, extra_dim: usize) -> Array2<f32> {
    let (n, d) = z.dim();
    let mut out = Array2::<f32>::zeros((n, d + extra_dim));
    out.slice_mut(s![.., ..d]).assign(z);
    out
}

/// Draw `n` pairs `z0 ~ U[-1, 1]^data_dim`, `zN = scale * z0`, then zero-augment `z0`.
///
/// Consumes `n * data_dim` draws from `rng`, row-major, so consecutive calls on the same
/// stream give independent batches.
pub fn generate_pairs(
    rng: &mut impl Rng,
    n: usize,
    data_dim: usize,
    extra_dim: usize,
    scale: f32,
) -> Result<SamplePairs> {
    if n == 0 {
        return Err(Error::Domain("sample count must be >= 1"));
    }
    if data_dim == 0 {
        return Err(Error::Shape("data_dim must be >= 1"));
    }
    if !scale.is_finite() {
        return Err(Error::Domain("scale_factor must be finite"));
    }

    let unit = Uniform::new(-1.0f32, 1.0).map_err(|_| Error::Domain("empty sampling interval"))?;
    let z0 = Array2::from_shape_fn((n, data_dim), |_| unit.sample(rng));
    let zn = z0.mapv(|x| x * scale);

    Ok(SamplePairs {
        z0: augment(&z0.view(), extra_dim),
        zn,
        data_dim,
        extra_dim,
    })
}

pub fn ndarray_to_burn_2<B: Backend>(device: &B::Device, x: &Array2<f32>) -> Tensor<B, 2> {
    let (n, d) = x.dim();
    // `iter()` is logical (row-major) order even for non-standard layouts.
    let data = TensorData::new(x.iter().copied().collect::<Vec<f32>>(), [n, d]);
    Tensor::from_data(data, device)
}

pub fn burn_to_ndarray_2<B: Backend>(x: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [n, d] = x.dims();
    let flat = x
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|_| Error::Domain("tensor data is not f32"))?;
    Array2::from_shape_vec((n, d), flat).map_err(|_| Error::Shape("tensor data length != n*d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn pairs_follow_the_linear_map_and_are_zero_padded() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let p = generate_pairs(&mut rng, 50, 2, 3, -1.0).unwrap();

        assert_eq!(p.z0.dim(), (50, 5));
        assert_eq!(p.zn.dim(), (50, 2));
        assert_eq!(p.total_dim(), 5);
        for i in 0..50 {
            for k in 0..2 {
                let x = p.z0[[i, k]];
                assert!((-1.0..1.0).contains(&x));
                assert_eq!(p.zn[[i, k]], -x);
            }
            for k in 2..5 {
                assert_eq!(p.z0[[i, k]], 0.0);
            }
        }
    }

    #[test]
    fn consecutive_draws_are_independent_and_seeded() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let train = generate_pairs(&mut rng, 10, 1, 0, 2.0).unwrap();
        let test = generate_pairs(&mut rng, 10, 1, 0, 2.0).unwrap();
        assert_ne!(train.z0, test.z0);

        let mut rng2 = ChaCha8Rng::seed_from_u64(9);
        let again = generate_pairs(&mut rng2, 10, 1, 0, 2.0).unwrap();
        assert_eq!(train.z0, again.z0);
        assert_eq!(train.zn, again.zn);
    }

    #[test]
    fn degenerate_requests_are_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(generate_pairs(&mut rng, 0, 1, 0, -1.0).is_err());
        assert!(generate_pairs(&mut rng, 4, 0, 1, -1.0).is_err());
        assert!(generate_pairs(&mut rng, 4, 1, 1, f32::NAN).is_err());
    }

    #[test]
    fn burn_conversion_preserves_layout() {
        let device = Default::default();
        let x = Array2::from_shape_vec((2, 3), vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let t = ndarray_to_burn_2::<NdArray<f32>>(&device, &x);
        assert_eq!(t.dims(), [2, 3]);
        assert_eq!(burn_to_ndarray_2(t).unwrap(), x);

        // Transposed (non-standard layout) input keeps logical order.
        let xt = x.t().to_owned();
        let tt = ndarray_to_burn_2::<NdArray<f32>>(&device, &x.t().to_owned());
        assert_eq!(burn_to_ndarray_2(tt).unwrap(), xt);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_augment_width_is_data_plus_extra(
            n in 1usize..16,
            d in 1usize..6,
            extra in 0usize..6,
            seed in any::<u64>(),
        ) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let p = generate_pairs(&mut rng, n, d, extra, -1.0).unwrap();
            prop_assert_eq!(p.z0.ncols(), d + extra);
            prop_assert_eq!(p.zn.ncols(), d);
            if extra == 0 {
                prop_assert_eq!(p.z0.mapv(|x| -x), p.zn.clone());
            }
        }
    }
}
