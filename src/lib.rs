//! # anode
//!
//! Neural ODEs and Augmented Neural ODEs as a single, explicit training experiment.
//!
//! A vector field \(f_\theta(t, z)\) is integrated over \([t_0, t_N] = [0, 1]\) with an adaptive
//! Dormand–Prince solver; the endpoint, projected back onto the data coordinates, is regressed
//! onto a target with mean-squared error. Gradients come from one of two strategies:
//!
//! - **direct**: differentiate through every solver step (discretize-then-optimize),
//! - **adjoint**: solve the reverse-time adjoint ODE (optimize-then-discretize).
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: data generation and parameter initialization take a
//!   `seed`; two runs with the same configuration produce the same loss and NFE sequences.
//! - **The NFE counter is a value, not hidden state**: every field evaluation increments an
//!   [`field::NfeCounter`] passed in by the caller.
//! - **Augmentation is invisible at the boundary**: the integrator always returns
//!   `[batch, data_dim]`, whatever `extra_dim` is.
//!
//! ## References (conceptual anchors)
//!
//! - Chen et al., *Neural Ordinary Differential Equations* (NeurIPS 2018): the model and the
//!   adjoint sensitivity method.
//! - Dupont, Doucet & Teh, *Augmented Neural ODEs* (NeurIPS 2019): zero-padding the state so the
//!   flow is no longer forced to be a homeomorphism of the data space.
//! - Dormand & Prince, *A family of embedded Runge–Kutta formulae* (1980).
//!
//! ## Module map
//!
//! - `field`: the MLP vector field and the NFE counter
//! - `ode`: adaptive Dormand–Prince 5(4) over burn tensors
//! - `block`: integrator adapter (solve + endpoint projection)
//! - `sensitivity`: direct vs adjoint gradient strategies
//! - `data`: synthetic pairs, augmentation, ndarray <-> burn conversion
//! - `train`: fixed-batch Adam loop and per-iteration metrics
//! - `results`: the shared 4-D results table
//! - `artifacts`: artifact directories, metric arrays, model persistence
//! - `experiment`: the end-to-end driver (train, persist, evaluate)

use std::path::PathBuf;

use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

pub mod artifacts;
pub mod block;
pub mod data;
pub mod experiment;
pub mod field;
pub mod ode;
pub mod results;
pub mod sensitivity;
pub mod train;

/// Default burn backend for training: ndarray + autodiff.
pub type BurnBackend = Autodiff<NdArray<f32>>;

/// anode error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("ode solver failed at t={t}: {reason}")]
    Solver { t: f64, reason: &'static str },
    #[error("results table not found at {0} (initialize it with `anode init-results`)")]
    MissingResults(PathBuf),
    #[error("results table already exists at {0}")]
    ResultsExist(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ReadNpy(#[from] ndarray_npy::ReadNpyError),
    #[error(transparent)]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("model record: {0}")]
    Record(String),
}

pub type Result<T> = std::result::Result<T, Error>;
