//! The learned vector field \(f_\theta(t, z)\) and its evaluation counter.
//!
//! The field is a small MLP, `dim -> hidden -> hidden -> dim`, with ELU between the affine maps
//! (smooth, so adaptive solvers do not fight kinks). It is autonomous: the time argument is part
//! of the solver calling convention and is ignored.

use burn_core as burn;

use burn::module::{Module, Param};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use burn_nn::{Linear, LinearConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Number of function evaluations (NFE) of a vector field.
///
/// Passed by `&mut` into every evaluation instead of living inside the field, so the count
/// belongs to whoever drives the solver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NfeCounter(usize);

impl NfeCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn get(&self) -> usize {
        self.0
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    /// Count one evaluation.
    #[inline]
    pub fn bump(&mut self) {
        self.0 += 1;
    }
}

/// Shape of a [`VectorField`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorFieldConfig {
    /// State width `D_total = D_data + D_extra`.
    pub dim: usize,
    /// Hidden width of both hidden layers.
    pub hidden: usize,
}

impl VectorFieldConfig {
    pub fn new(dim: usize, hidden: usize) -> Self {
        Self { dim, hidden }
    }

    /// Build a field with parameters drawn from a seeded stream.
    ///
    /// Weights and biases are `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, drawn layer by layer from
    /// `ChaCha8Rng::seed_from_u64(seed)`, so initialization does not depend on backend RNG state.
    pub fn init<B: Backend>(&self, device: &B::Device, seed: u64) -> VectorField<B> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let fc1 = seeded_linear(device, self.dim, self.hidden, &mut rng);
        let fc2 = seeded_linear(device, self.hidden, self.hidden, &mut rng);
        let fc3 = seeded_linear(device, self.hidden, self.dim, &mut rng);
        VectorField {
            fc1,
            fc2,
            fc3,
            dim: self.dim,
            hidden: self.hidden,
        }
    }
}

fn seeded_linear<B: Backend>(
    device: &B::Device,
    d_in: usize,
    d_out: usize,
    rng: &mut ChaCha8Rng,
) -> Linear<B> {
    let mut linear = LinearConfig::new(d_in, d_out).with_bias(true).init(device);
    let bound = 1.0 / (d_in as f32).sqrt();

    // Burn Linear weight is [d_input, d_output].
    let w: Vec<f32> = (0..d_in * d_out)
        .map(|_| rng.random_range(-bound..bound))
        .collect();
    let b: Vec<f32> = (0..d_out).map(|_| rng.random_range(-bound..bound)).collect();

    linear.weight = Param::from_tensor(Tensor::from_data(
        TensorData::new(w, [d_in, d_out]),
        device,
    ));
    linear.bias = Some(Param::from_tensor(Tensor::from_data(
        TensorData::new(b, [d_out]),
        device,
    )));
    linear
}

/// ELU with `alpha = 1`: `x` for `x > 0`, `exp(x) - 1` otherwise.
pub fn elu<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    x.clone().clamp_min(0.0) + x.clamp_max(0.0).exp().sub_scalar(1.0)
}

/// MLP vector field `dz/dt = f_θ(t, z)` over states of width `dim`.
#[derive(Module, Debug)]
pub struct VectorField<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    fc3: Linear<B>,
    dim: usize,
    hidden: usize,
}

impl<B: Backend> VectorField<B> {
    /// State width this field accepts and returns.
    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn config(&self) -> VectorFieldConfig {
        VectorFieldConfig::new(self.dim, self.hidden)
    }

    /// Evaluate the field on a batch.
    ///
    /// Shapes: `z` is `[batch, dim]`, the result is `[batch, dim]`. `_t` is ignored.
    pub fn forward(&self, _t: f64, z: Tensor<B, 2>, nfe: &mut NfeCounter) -> Tensor<B, 2> {
        nfe.bump();
        let h = elu(self.fc1.forward(z));
        let h = elu(self.fc2.forward(h));
        self.fc3.forward(h)
    }
}

impl<B: AutodiffBackend> VectorField<B> {
    /// Parameter gradients flattened in layer order (weight, then bias, per layer).
    ///
    /// A parameter without a gradient contributes zeros, so the length is always
    /// `num_params()`.
    pub fn flat_grads(&self, grads: &B::Gradients) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.num_params());
        for layer in [&self.fc1, &self.fc2, &self.fc3] {
            let w = &layer.weight;
            push_grad(&mut out, w.grad(grads), w.shape().num_elements());
            if let Some(b) = &layer.bias {
                push_grad(&mut out, b.grad(grads), b.shape().num_elements());
            }
        }
        out
    }
}

fn push_grad<B: Backend, const D: usize>(
    out: &mut Vec<f32>,
    g: Option<Tensor<B, D>>,
    numel: usize,
) {
    match g.and_then(|g| g.into_data().convert::<f32>().to_vec::<f32>().ok()) {
        Some(v) => out.extend(v),
        None => out.extend(std::iter::repeat(0.0).take(numel)),
    }
}

/// Euclidean norm of a flattened gradient.
pub fn grad_norm(g: &[f32]) -> f64 {
    g.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use proptest::prelude::*;

    type B = NdArray<f32>;

    fn batch(rows: usize, dim: usize) -> Tensor<B, 2> {
        let vals: Vec<f32> = (0..rows * dim)
            .map(|i| ((i * 37 % 17) as f32 / 17.0) * 2.0 - 1.0)
            .collect();
        Tensor::from_data(TensorData::new(vals, [rows, dim]), &Default::default())
    }

    fn to_vec(t: Tensor<B, 2>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn forward_preserves_shape_and_counts_evaluations() {
        let device = Default::default();
        let field = VectorFieldConfig::new(3, 20).init::<B>(&device, 7);
        let mut nfe = NfeCounter::new();

        let out = field.forward(0.0, batch(5, 3), &mut nfe);
        assert_eq!(out.dims(), [5, 3]);
        assert_eq!(nfe.get(), 1);

        let _ = field.forward(0.5, batch(5, 3), &mut nfe);
        assert_eq!(nfe.get(), 2);

        nfe.reset();
        assert_eq!(nfe.get(), 0);
    }

    #[test]
    fn field_ignores_time() {
        let device = Default::default();
        let field = VectorFieldConfig::new(2, 8).init::<B>(&device, 1);
        let mut nfe = NfeCounter::new();
        let a = to_vec(field.forward(0.0, batch(4, 2), &mut nfe));
        let b = to_vec(field.forward(0.9, batch(4, 2), &mut nfe));
        assert_eq!(a, b);
    }

    #[test]
    fn seeded_init_is_reproducible() {
        let device = Default::default();
        let cfg = VectorFieldConfig::new(2, 20);
        let mut nfe = NfeCounter::new();

        let a = to_vec(cfg.init::<B>(&device, 42).forward(0.0, batch(6, 2), &mut nfe));
        let b = to_vec(cfg.init::<B>(&device, 42).forward(0.0, batch(6, 2), &mut nfe));
        let c = to_vec(cfg.init::<B>(&device, 43).forward(0.0, batch(6, 2), &mut nfe));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parameter_count_matches_layer_sizes() {
        let device = Default::default();
        let (d, h) = (3usize, 20usize);
        let field = VectorFieldConfig::new(d, h).init::<B>(&device, 0);
        let expected = (d * h + h) + (h * h + h) + (h * d + d);
        assert_eq!(field.num_params(), expected);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_elu_matches_definition(xs in prop::collection::vec(-6.0f32..6.0f32, 1..32)) {
            let n = xs.len();
            let t = Tensor::<B, 2>::from_data(
                TensorData::new(xs.clone(), [1, n]),
                &Default::default(),
            );
            let got = to_vec(elu(t));
            for (x, y) in xs.iter().zip(got.iter()) {
                let want = if *x > 0.0 { *x } else { x.exp() - 1.0 };
                prop_assert!((want - y).abs() <= 1e-5, "elu({x}) = {y}, want {want}");
            }
        }
    }
}
