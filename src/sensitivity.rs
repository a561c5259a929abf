//! Gradient strategies for a loss on the ODE endpoint.
//!
//! Both strategies implement [`Sensitivity`]: `solve` returns a gradient-capable endpoint,
//! `backward` turns a scalar loss on that endpoint into parameter gradients.
//!
//! - [`Direct`] (discretize-then-optimize): the solve runs on the autodiff backend and every
//!   Runge–Kutta stage is part of the graph. Memory grows with the number of steps.
//! - [`Adjoint`] (optimize-then-discretize): the forward solve is gradient-free; gradients come
//!   from the reverse-time system
//!   \[
//!   \dot z = f(z), \qquad \dot a = -a^\top \partial_z f, \qquad
//!   \frac{dL}{d\theta} = \int_{t_0}^{t_1} a^\top \partial_\theta f \, dt,
//!   \]
//!   integrated from `t1` back to `t0`, with `a(t1) = dL/dz(t1)`.
//!
//! The two are different estimators of the same gradient; they agree up to solver tolerance.

use burn_core as burn;

use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::OdeBlock;
use crate::field::{NfeCounter, VectorField};
use crate::ode::{self, DOPRI5_B};
use crate::{Error, Result};

/// Which gradient strategy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientMode {
    /// Backpropagate through the solver steps.
    #[default]
    Direct,
    /// Reverse-time adjoint ODE.
    Adjoint,
}

impl GradientMode {
    pub fn from_adjoint_flag(adjoint: bool) -> Self {
        if adjoint {
            Self::Adjoint
        } else {
            Self::Direct
        }
    }

    pub fn strategy<B: AutodiffBackend>(self) -> Box<dyn Sensitivity<B>> {
        match self {
            GradientMode::Direct => Box::new(Direct),
            GradientMode::Adjoint => Box::new(Adjoint),
        }
    }
}

impl std::fmt::Display for GradientMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GradientMode::Direct => f.write_str("direct"),
            GradientMode::Adjoint => f.write_str("adjoint"),
        }
    }
}

/// Integrate-and-differentiate contract shared by the gradient strategies.
pub trait Sensitivity<B: AutodiffBackend> {
    /// Full-width endpoint `z(t1)`, `[batch, state_dim]`, usable as the input of a loss.
    fn solve(
        &self,
        block: &OdeBlock<B>,
        z0: Tensor<B, 2>,
        nfe: &mut NfeCounter,
    ) -> Result<Tensor<B, 2>>;

    /// Parameter gradients of `loss`, which must have been computed from `endpoint`
    /// (the value returned by [`Sensitivity::solve`]).
    fn backward(
        &self,
        block: &OdeBlock<B>,
        endpoint: &Tensor<B, 2>,
        loss: Tensor<B, 1>,
        nfe: &mut NfeCounter,
    ) -> Result<B::Gradients>;
}

/// Discretize-then-optimize.
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl<B: AutodiffBackend> Sensitivity<B> for Direct {
    fn solve(
        &self,
        block: &OdeBlock<B>,
        z0: Tensor<B, 2>,
        nfe: &mut NfeCounter,
    ) -> Result<Tensor<B, 2>> {
        block.solve(z0, nfe)
    }

    fn backward(
        &self,
        _block: &OdeBlock<B>,
        _endpoint: &Tensor<B, 2>,
        loss: Tensor<B, 1>,
        _nfe: &mut NfeCounter,
    ) -> Result<B::Gradients> {
        Ok(loss.backward())
    }
}

/// Optimize-then-discretize (adjoint sensitivity method).
#[derive(Debug, Clone, Copy, Default)]
pub struct Adjoint;

/// A weighted Runge–Kutta stage of the reverse solve.
struct Stage<B: AutodiffBackend> {
    t: f64,
    z: Tensor<B::InnerBackend, 2>,
    a: Tensor<B::InnerBackend, 2>,
    weight: f64,
}

/// Right-hand side of the reverse system on `s = [z, a]` (`[batch, 2 * dim]`).
fn adjoint_dynamics<B: AutodiffBackend>(
    field: &VectorField<B>,
    t: f64,
    s: Tensor<B::InnerBackend, 2>,
    dim: usize,
    nfe: &mut NfeCounter,
) -> Result<Tensor<B::InnerBackend, 2>> {
    let z = Tensor::<B, 2>::from_inner(s.clone().narrow(1, 0, dim)).require_grad();
    let a = Tensor::<B, 2>::from_inner(s.narrow(1, dim, dim));

    let fz = field.forward(t, z.clone(), nfe);
    let grads = (fz.clone() * a).sum().backward();
    // a^T df/dz, one row per sample.
    let vjp = z
        .grad(&grads)
        .ok_or(Error::Domain("vector field output does not depend on the state"))?;

    Ok(Tensor::cat(vec![fz.inner(), vjp.neg()], 1))
}

impl<B: AutodiffBackend> Sensitivity<B> for Adjoint {
    fn solve(
        &self,
        block: &OdeBlock<B>,
        z0: Tensor<B, 2>,
        nfe: &mut NfeCounter,
    ) -> Result<Tensor<B, 2>> {
        block.check_input(&z0)?;
        let z1 = block.valid().solve(z0.inner(), nfe)?;
        Ok(Tensor::from_inner(z1).require_grad())
    }

    fn backward(
        &self,
        block: &OdeBlock<B>,
        endpoint: &Tensor<B, 2>,
        loss: Tensor<B, 1>,
        nfe: &mut NfeCounter,
    ) -> Result<B::Gradients> {
        let grads = loss.backward();
        let a1 = endpoint
            .grad(&grads)
            .ok_or(Error::Domain("loss does not depend on the ODE endpoint"))?;

        let dim = block.state_dim();
        let field = block.field();
        let span = block.span();
        let s1 = Tensor::cat(vec![endpoint.clone().inner(), a1], 1);

        // The parameter adjoint never feeds back into [z, a], so its Runge–Kutta update is
        // exactly sum over accepted steps and stages of (-h * b_i) * a_i^T df/dθ(z_i).
        let mut stages: Vec<Stage<B>> = Vec::new();
        let (_, stats) = ode::dopri5(
            |t, s| adjoint_dynamics(field, t, s, dim, nfe),
            s1,
            span.t1,
            span.t0,
            block.options(),
            |step| {
                for (i, (ti, yi)) in step.stages.iter().enumerate() {
                    let b = DOPRI5_B[i];
                    if b == 0.0 {
                        continue;
                    }
                    stages.push(Stage {
                        t: *ti,
                        z: yi.clone().narrow(1, 0, dim),
                        a: yi.clone().narrow(1, dim, dim),
                        weight: -step.h * b,
                    });
                }
            },
        )?;
        debug!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            "adjoint solve"
        );

        let mut surrogate: Option<Tensor<B, 1>> = None;
        for stage in stages {
            let fz = field.forward(stage.t, Tensor::from_inner(stage.z), nfe);
            let term = (fz * Tensor::from_inner(stage.a))
                .sum()
                .mul_scalar(stage.weight);
            surrogate = Some(match surrogate {
                Some(acc) => acc + term,
                None => term,
            });
        }
        let surrogate = surrogate.ok_or(Error::Solver {
            t: span.t1,
            reason: "adjoint solve took no steps",
        })?;

        Ok(surrogate.backward())
    }
}
