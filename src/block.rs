//! Integrator adapter: solve the field from `t0` to `tN`, then project onto data coordinates.
//!
//! `OdeBlock` owns the vector field together with everything a solve needs (time span, solver
//! options, endpoint selector). It is generic over the backend: on the autodiff backend a solve
//! records the full discretization, on the inner backend it is a gradient-free forward pass.

use burn_core as burn;

use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::field::{NfeCounter, VectorField};
use crate::ode::{self, SolverOptions};
use crate::{Error, Result};

/// Integration interval. Defaults to `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub t0: f64,
    pub t1: f64,
}

impl Default for TimeSpan {
    fn default() -> Self {
        Self { t0: 0.0, t1: 1.0 }
    }
}

/// Picks the data coordinates `0..data_dim` out of an augmented endpoint.
///
/// Every row uses the same indices; the gather itself is row-wise, so per-row selectors would
/// only need a different index tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selector {
    data_dim: usize,
}

impl Selector {
    pub fn new(data_dim: usize) -> Self {
        Self { data_dim }
    }

    pub fn data_dim(&self) -> usize {
        self.data_dim
    }

    /// Index tensor `[rows, data_dim]`, each row `0, 1, ..., data_dim - 1`.
    pub fn indices<B: Backend>(&self, rows: usize, device: &B::Device) -> Tensor<B, 2, Int> {
        Tensor::<B, 1, Int>::arange(0..self.data_dim as i64, device)
            .reshape([1, self.data_dim])
            .repeat_dim(0, rows)
    }

    /// Gather the selected columns of `z` (`[rows, total]` -> `[rows, data_dim]`).
    pub fn project<B: Backend>(&self, z: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let [rows, total] = z.dims();
        if self.data_dim > total {
            return Err(Error::Shape("selector is wider than the state"));
        }
        let ids = self.indices::<B>(rows, &z.device());
        Ok(z.gather(1, ids))
    }
}

/// The vector field plus its integration settings.
#[derive(Debug, Clone)]
pub struct OdeBlock<B: Backend> {
    field: VectorField<B>,
    span: TimeSpan,
    options: SolverOptions,
    selector: Selector,
}

impl<B: Backend> OdeBlock<B> {
    /// Fails with `Error::Shape` if the selector does not fit inside the field's state.
    pub fn new(
        field: VectorField<B>,
        span: TimeSpan,
        options: SolverOptions,
        selector: Selector,
    ) -> Result<Self> {
        if selector.data_dim() == 0 {
            return Err(Error::Shape("selector must pick at least one coordinate"));
        }
        if selector.data_dim() > field.dim() {
            return Err(Error::Shape("data_dim exceeds the field's state width"));
        }
        options.validate()?;
        Ok(Self {
            field,
            span,
            options,
            selector,
        })
    }

    pub fn field(&self) -> &VectorField<B> {
        &self.field
    }

    /// Replace the field (the optimizer hands back an updated module).
    pub fn set_field(&mut self, field: VectorField<B>) {
        self.field = field;
    }

    pub fn into_field(self) -> VectorField<B> {
        self.field
    }

    pub fn span(&self) -> TimeSpan {
        self.span
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn selector(&self) -> Selector {
        self.selector
    }

    /// Augmented state width the field expects.
    pub fn state_dim(&self) -> usize {
        self.field.dim()
    }

    pub(crate) fn check_input(&self, z0: &Tensor<B, 2>) -> Result<()> {
        let [rows, width] = z0.dims();
        if rows == 0 {
            return Err(Error::Shape("empty batch"));
        }
        if width != self.field.dim() {
            return Err(Error::Shape("z0 width must equal data_dim + extra_dim"));
        }
        Ok(())
    }

    /// Full-width state at `t1` (`[batch, state_dim]`).
    pub fn solve(&self, z0: Tensor<B, 2>, nfe: &mut NfeCounter) -> Result<Tensor<B, 2>> {
        self.check_input(&z0)?;
        let field = &self.field;
        let (z1, stats) = ode::integrate(
            |t, z| Ok(field.forward(t, z, nfe)),
            z0,
            self.span.t0,
            self.span.t1,
            &self.options,
        )?;
        debug!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            "forward solve"
        );
        Ok(z1)
    }

    pub fn project(&self, z1: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        self.selector.project(z1)
    }

    /// Solve and project: `[batch, state_dim]` -> `[batch, data_dim]`.
    pub fn forward(&self, z0: Tensor<B, 2>, nfe: &mut NfeCounter) -> Result<Tensor<B, 2>> {
        let z1 = self.solve(z0, nfe)?;
        self.project(z1)
    }
}

impl<B: AutodiffBackend> OdeBlock<B> {
    /// Same block on the inner backend: no graph, no gradients.
    pub fn valid(&self) -> OdeBlock<B::InnerBackend> {
        OdeBlock {
            field: self.field.valid(),
            span: self.span,
            options: self.options,
            selector: self.selector,
        }
    }
}
