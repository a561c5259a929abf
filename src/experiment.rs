//! One experiment end to end: data, model, training, artifacts, evaluation, results table.
//!
//! The order of side effects is fixed:
//! 1. load the shared results table (must exist, must have a slot for this run),
//! 2. create the artifact directory,
//! 3. train on `ntrain` pairs and record the last iteration's loss as the train loss,
//! 4. write metric arrays and the model,
//! 5. evaluate a gradient-free forward pass on `ntest` fresh pairs,
//! 6. write both losses into the table and save it.
//!
//! Any error aborts the run; nothing is retried.

use std::path::PathBuf;
use std::time::Duration;

use burn_core as burn;

use burn::module::{AutodiffModule, Module};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::ElementConversion;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use crate::artifacts::{self, ModelCard};
use crate::block::{OdeBlock, Selector, TimeSpan};
use crate::data::{generate_pairs, ndarray_to_burn_2};
use crate::field::{NfeCounter, VectorFieldConfig};
use crate::ode::SolverOptions;
use crate::results::{ResultsTable, Split, Variant};
use crate::sensitivity::GradientMode;
use crate::train::{mse, Metrics, TrainConfig, Trainer};
use crate::{BurnBackend, Error, Result};

/// Everything a run is parameterized by.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// Solver `rtol` and `atol`.
    pub tol: f64,
    pub gradient_mode: GradientMode,
    pub niters: usize,
    pub lr: f64,
    /// Accelerator index; only the CPU backend is compiled in, so this is advisory.
    pub gpu: usize,
    /// `D_extra`; 0 selects the plain Neural ODE.
    pub extra_dim: usize,
    /// `D_data`.
    pub data_dimension: usize,
    /// Ground truth is `zN = scale_factor * z0`.
    pub scale_factor: f32,
    pub ntrain: usize,
    pub ntest: usize,
    /// 1-based slot in the results table.
    pub experiment_no: usize,
    pub hidden: usize,
    /// Master seed for data and parameter initialization.
    pub seed: u64,
    /// Root for `node/` and `anode/`.
    pub out_dir: PathBuf,
    pub results_path: PathBuf,
    pub log_every: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            tol: 1e-3,
            gradient_mode: GradientMode::Direct,
            niters: 1_000,
            lr: 0.01,
            gpu: 0,
            extra_dim: 1,
            data_dimension: 1,
            scale_factor: -1.0,
            ntrain: 50,
            ntest: 10,
            experiment_no: 1,
            hidden: 20,
            seed: 123,
            out_dir: PathBuf::from("."),
            results_path: PathBuf::from("results.npy"),
            log_every: 100,
        }
    }
}

impl ExperimentConfig {
    pub fn variant(&self) -> Variant {
        Variant::from_extra_dim(self.extra_dim)
    }

    /// `data_dimension + extra_dim`.
    pub fn state_dim(&self) -> usize {
        self.data_dimension + self.extra_dim
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dimension == 0 {
            return Err(Error::Shape("data_dimension must be >= 1"));
        }
        if self.hidden == 0 {
            return Err(Error::Shape("hidden width must be >= 1"));
        }
        if self.ntrain == 0 || self.ntest == 0 {
            return Err(Error::Domain("ntrain and ntest must be >= 1"));
        }
        if self.niters == 0 {
            return Err(Error::Domain("niters must be >= 1"));
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(Error::Domain("lr must be positive and finite"));
        }
        if self.experiment_no == 0 {
            return Err(Error::Domain("experiment_no is 1-based"));
        }
        if !self.tol.is_finite() || self.tol <= 0.0 {
            return Err(Error::Domain("tol must be positive and finite"));
        }
        if !self.scale_factor.is_finite() {
            return Err(Error::Domain("scale_factor must be finite"));
        }
        Ok(())
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub variant: Variant,
    pub artifact_dir: PathBuf,
    /// Last training iteration's loss.
    pub train_loss: f32,
    pub test_loss: f32,
    /// NFE of the last training iteration.
    pub final_nfe: usize,
    pub parameters: usize,
    pub training_time: Duration,
    pub metrics: Metrics,
}

/// CPU device for the default backend. `gpu` is only reported: no accelerator backend is
/// compiled in, so every index falls back to the CPU.
pub fn select_device(gpu: usize) -> <BurnBackend as Backend>::Device {
    if gpu != 0 {
        warn!(gpu, "no accelerator backend compiled in; using the CPU ndarray backend");
    }
    <BurnBackend as Backend>::Device::default()
}

/// Run on the default backend.
pub fn run(cfg: &ExperimentConfig) -> Result<RunReport> {
    let device = select_device(cfg.gpu);
    run_on::<BurnBackend>(cfg, &device)
}

pub fn run_on<B: AutodiffBackend>(
    cfg: &ExperimentConfig,
    device: &B::Device,
) -> Result<RunReport> {
    cfg.validate()?;
    let variant = cfg.variant();
    let d = cfg.data_dimension;

    let mut results = ResultsTable::load(&cfg.results_path)?;
    results.check_slot(d, cfg.experiment_no)?;
    let dir = artifacts::prepare_dir(&cfg.out_dir, variant)?;
    info!(
        variant = variant.dir_name(),
        data_dimension = d,
        extra_dim = cfg.extra_dim,
        experiment_no = cfg.experiment_no,
        dir = %dir.display(),
        "starting experiment"
    );

    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let field_seed: u64 = rng.random();
    let train = generate_pairs(&mut rng, cfg.ntrain, d, cfg.extra_dim, cfg.scale_factor)?;

    let field_cfg = VectorFieldConfig::new(cfg.state_dim(), cfg.hidden);
    let span = TimeSpan::default();
    let block = OdeBlock::new(
        field_cfg.init::<B>(device, field_seed),
        span,
        SolverOptions::with_tol(cfg.tol),
        Selector::new(d),
    )?;
    let mut trainer = Trainer::new(
        block,
        cfg.gradient_mode,
        TrainConfig {
            niters: cfg.niters,
            lr: cfg.lr,
            log_every: cfg.log_every,
        },
    )?;

    let outcome = trainer.fit(
        ndarray_to_burn_2(device, &train.z0),
        ndarray_to_burn_2(device, &train.zn),
    )?;
    let block = trainer.into_block();
    let parameters = block.field().num_params();
    results.record(variant, Split::Train, d, cfg.experiment_no, outcome.final_loss as f64)?;
    info!(
        train_mse = outcome.final_loss,
        nfe = outcome.final_nfe,
        parameters,
        "training finished"
    );

    artifacts::write_metrics(&dir, &outcome.metrics)?;
    let card = ModelCard {
        field: field_cfg,
        data_dim: d,
        extra_dim: cfg.extra_dim,
        span,
        tol: cfg.tol,
        gradient_mode: cfg.gradient_mode,
        parameters,
        seed: field_seed,
    };
    artifacts::save_model(&dir, &block.field().valid(), &card)?;

    // Evaluation: fresh draw from the same stream, no graph.
    let test = generate_pairs(&mut rng, cfg.ntest, d, cfg.extra_dim, cfg.scale_factor)?;
    let eval = block.valid();
    let mut nfe = NfeCounter::new();
    let pred = eval.forward(ndarray_to_burn_2(device, &test.z0), &mut nfe)?;
    let test_loss = mse(pred, ndarray_to_burn_2(device, &test.zn))
        .into_scalar()
        .elem::<f32>();
    results.record(variant, Split::Test, d, cfg.experiment_no, test_loss as f64)?;
    results.save(&cfg.results_path)?;
    info!(test_mse = test_loss, nfe = nfe.get(), "evaluation finished");

    Ok(RunReport {
        variant,
        artifact_dir: dir,
        train_loss: outcome.final_loss,
        test_loss,
        final_nfe: outcome.final_nfe,
        parameters,
        training_time: outcome.elapsed,
        metrics: outcome.metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_cli_defaults() {
        let c = ExperimentConfig::default();
        assert_eq!(c.tol, 1e-3);
        assert_eq!(c.gradient_mode, GradientMode::Direct);
        assert_eq!(c.niters, 1000);
        assert_eq!(c.lr, 0.01);
        assert_eq!(c.extra_dim, 1);
        assert_eq!(c.data_dimension, 1);
        assert_eq!(c.scale_factor, -1.0);
        assert_eq!((c.ntrain, c.ntest), (50, 10));
        assert_eq!(c.experiment_no, 1);
        assert_eq!(c.state_dim(), 2);
        assert_eq!(c.variant(), Variant::Augmented);
    }

    #[test]
    fn invalid_configurations_fail_before_any_io() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = ExperimentConfig {
            out_dir: dir.path().to_path_buf(),
            results_path: dir.path().join("results.npy"),
            ..ExperimentConfig::default()
        };
        // The table exists, so only the configuration itself can stop these runs.
        ResultsTable::create(&base.results_path, 1, 1, false).unwrap();
        for bad in [
            ExperimentConfig {
                data_dimension: 0,
                ..base.clone()
            },
            ExperimentConfig {
                ntrain: 0,
                ..base.clone()
            },
            ExperimentConfig {
                experiment_no: 0,
                ..base.clone()
            },
            ExperimentConfig {
                tol: -1.0,
                ..base.clone()
            },
            ExperimentConfig {
                niters: 0,
                ..base.clone()
            },
            ExperimentConfig {
                lr: 0.0,
                ..base.clone()
            },
            ExperimentConfig {
                lr: f64::NAN,
                ..base.clone()
            },
        ] {
            assert!(matches!(run(&bad), Err(Error::Shape(_) | Error::Domain(_))));
        }
        assert!(!dir.path().join("anode").exists());
        assert!(!dir.path().join("node").exists());
    }

    #[test]
    fn missing_results_table_aborts_the_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = ExperimentConfig {
            niters: 1,
            out_dir: dir.path().to_path_buf(),
            results_path: dir.path().join("results.npy"),
            ..ExperimentConfig::default()
        };
        assert!(matches!(run(&cfg), Err(Error::MissingResults(_))));
    }
}
