//! Fixed-batch training loop.
//!
//! One batch, every iteration, no shuffling, no early stopping:
//! reset NFE, solve, MSE, gradients (direct or adjoint), one Adam step, record metrics.
//! A non-finite loss is not special-cased; it lands in the metrics as is.

use std::time::{Duration, Instant};

use burn_core as burn;

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use burn_optim::{AdamConfig, GradientsParams, LearningRate, Optimizer};
use ndarray::{Array1, Array2};
use tracing::{debug, info, Level};

use crate::block::OdeBlock;
use crate::data::burn_to_ndarray_2;
use crate::field::{grad_norm, NfeCounter, VectorField};
use crate::sensitivity::{GradientMode, Sensitivity};
use crate::{Error, Result};

/// Training configuration.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Number of iterations (each is one full-batch step).
    pub niters: usize,
    /// Adam learning rate.
    pub lr: LearningRate,
    /// Log an `info` line every this many iterations (0 disables progress lines).
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            niters: 1_000,
            lr: 1e-2,
            log_every: 100,
        }
    }
}

/// Mean squared error over all entries.
pub fn mse<B: Backend>(pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    (pred - target).powf_scalar(2.0).mean()
}

/// Adam with `epsilon = 1e-8`.
pub fn adam<B: AutodiffBackend>() -> impl Optimizer<VectorField<B>, B> {
    AdamConfig::new()
        .with_epsilon(1e-8)
        .init::<B, VectorField<B>>()
}

/// Per-iteration metrics, one entry per iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metrics {
    /// 1-based iteration index.
    pub itr: Vec<f64>,
    pub loss: Vec<f64>,
    pub nfe: Vec<f64>,
    /// Wall-clock seconds of the solve/loss/backward/update part of the iteration.
    pub time: Vec<f64>,
}

impl Metrics {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            itr: Vec::with_capacity(n),
            loss: Vec::with_capacity(n),
            nfe: Vec::with_capacity(n),
            time: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.itr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.itr.is_empty()
    }

    fn push(&mut self, itr: usize, rec: &StepRecord<impl Backend>) {
        self.itr.push(itr as f64);
        self.loss.push(rec.loss as f64);
        self.nfe.push(rec.nfe as f64);
        self.time.push(rec.seconds);
    }

    /// The four series as arrays, in `(itr, loss, nfe, time)` order.
    pub fn to_arrays(&self) -> [Array1<f64>; 4] {
        [
            Array1::from_vec(self.itr.clone()),
            Array1::from_vec(self.loss.clone()),
            Array1::from_vec(self.nfe.clone()),
            Array1::from_vec(self.time.clone()),
        ]
    }
}

/// What one iteration produced.
#[derive(Debug, Clone)]
pub struct StepRecord<B: Backend> {
    pub loss: f32,
    /// Field evaluations of this iteration only.
    pub nfe: usize,
    pub seconds: f64,
    /// Projected prediction `[batch, data_dim]`, detached.
    pub prediction: Tensor<B, 2>,
}

/// Result of [`Trainer::fit`].
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub metrics: Metrics,
    /// Loss of the last iteration (not recomputed).
    pub final_loss: f32,
    /// Prediction of the last iteration (not recomputed).
    pub final_prediction: Array2<f32>,
    /// NFE of the last iteration.
    pub final_nfe: usize,
    pub elapsed: Duration,
}

/// Owns the integrator and the gradient strategy for one training run.
pub struct Trainer<B: AutodiffBackend> {
    block: OdeBlock<B>,
    sensitivity: Box<dyn Sensitivity<B>>,
    mode: GradientMode,
    config: TrainConfig,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(block: OdeBlock<B>, mode: GradientMode, config: TrainConfig) -> Result<Self> {
        if config.niters == 0 {
            return Err(Error::Domain("niters must be >= 1"));
        }
        if !config.lr.is_finite() || config.lr <= 0.0 {
            return Err(Error::Domain("lr must be positive and finite"));
        }
        Ok(Self {
            block,
            sensitivity: mode.strategy::<B>(),
            mode,
            config,
        })
    }

    pub fn block(&self) -> &OdeBlock<B> {
        &self.block
    }

    pub fn into_block(self) -> OdeBlock<B> {
        self.block
    }

    pub fn mode(&self) -> GradientMode {
        self.mode
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// One iteration. `nfe` is reset first, so the recorded count covers this iteration only.
    pub fn step<O: Optimizer<VectorField<B>, B>>(
        &mut self,
        optim: &mut O,
        z0: &Tensor<B, 2>,
        zn: &Tensor<B, 2>,
        nfe: &mut NfeCounter,
    ) -> Result<StepRecord<B>> {
        nfe.reset();
        debug_assert_eq!(nfe.get(), 0);

        let start = Instant::now();
        let endpoint = self.sensitivity.solve(&self.block, z0.clone(), nfe)?;
        let pred = self.block.project(endpoint.clone())?;
        let loss = mse(pred.clone(), zn.clone());
        let loss_value = loss.clone().into_scalar().elem::<f32>();

        let grads = self
            .sensitivity
            .backward(&self.block, &endpoint, loss, nfe)?;
        if tracing::enabled!(Level::DEBUG) {
            let gn = grad_norm(&self.block.field().flat_grads(&grads));
            debug!(grad_norm = gn, "gradients");
        }
        let grads = GradientsParams::from_grads(grads, self.block.field());
        let field = optim.step(self.config.lr, self.block.field().clone(), grads);
        self.block.set_field(field);
        let seconds = start.elapsed().as_secs_f64();

        Ok(StepRecord {
            loss: loss_value,
            nfe: nfe.get(),
            seconds,
            prediction: pred.detach(),
        })
    }

    /// Run exactly `niters` iterations on the fixed batch `(z0, zn)`.
    pub fn fit(&mut self, z0: Tensor<B, 2>, zn: Tensor<B, 2>) -> Result<TrainOutcome> {
        let [rows, _] = z0.dims();
        let [target_rows, target_cols] = zn.dims();
        if rows != target_rows || target_cols != self.block.selector().data_dim() {
            return Err(Error::Shape("zN must be [batch, data_dim] matching z0"));
        }

        let niters = self.config.niters;
        let mut optim = adam::<B>();
        let mut nfe = NfeCounter::new();
        let mut metrics = Metrics::with_capacity(niters);
        let mut last: Option<StepRecord<B>> = None;

        info!(
            niters,
            lr = self.config.lr,
            mode = %self.mode,
            state_dim = self.block.state_dim(),
            "training"
        );
        let start = Instant::now();
        for itr in 1..=niters {
            let rec = self.step(&mut optim, &z0, &zn, &mut nfe)?;
            metrics.push(itr, &rec);
            debug!(itr, loss = rec.loss, nfe = rec.nfe, "iteration");
            if self.config.log_every > 0 && itr % self.config.log_every == 0 {
                info!(itr, loss = rec.loss, nfe = rec.nfe, "running MSE");
            }
            last = Some(rec);
        }
        let elapsed = start.elapsed();

        let last = last.ok_or(Error::Domain("niters must be >= 1"))?;
        info!(
            itr = niters,
            loss = last.loss,
            nfe = last.nfe,
            seconds = elapsed.as_secs_f64(),
            "training complete"
        );

        Ok(TrainOutcome {
            metrics,
            final_loss: last.loss,
            final_prediction: burn_to_ndarray_2(last.prediction)?,
            final_nfe: last.nfe,
            elapsed,
        })
    }
}
