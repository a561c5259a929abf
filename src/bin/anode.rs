//! Neural ODE / Augmented Neural ODE experiment CLI.
//!
//! Train on `zN = scale * z0`, evaluate on fresh data, and write artifacts plus the two
//! final losses into a shared results table.
//!
//! # Usage
//!
//! ```bash
//! # once, before any run
//! cargo run --release --bin anode -- init-results --max-data-dimension 4 --max-experiments 10
//!
//! # plain Neural ODE (artifacts under ./node)
//! cargo run --release --bin anode -- run --extra-dim 0 --data-dimension 1 --experiment-no 1
//!
//! # augmented, adjoint gradients (artifacts under ./anode)
//! cargo run --release --bin anode -- run --extra-dim 1 --adjoint
//! ```
//!
//! Logging goes through `tracing`; set `RUST_LOG=anode=debug` for per-iteration lines.

use std::path::PathBuf;

use anyhow::{Context, Result};
use anode::experiment::{self, ExperimentConfig};
use anode::results::ResultsTable;
use anode::sensitivity::GradientMode;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "anode",
    about = "Train a (augmented) Neural ODE on a linear map and record train/test MSE"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train, persist artifacts, evaluate, and write into the results table.
    Run(RunArgs),
    /// Create the shared results table (zero-filled).
    InitResults(InitArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Solver absolute and relative tolerance
    #[arg(long, default_value_t = 1e-3)]
    tol: f64,

    /// Use the adjoint method for gradients (`--adjoint`, `--adjoint true`, `--adjoint False`)
    #[arg(
        long,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    adjoint: bool,

    /// Number of training iterations
    #[arg(long, default_value_t = 1000)]
    niters: usize,

    /// Adam learning rate
    #[arg(long, default_value_t = 0.01)]
    lr: f64,

    /// Accelerator index (falls back to CPU)
    #[arg(long, default_value_t = 0)]
    gpu: usize,

    /// Extra zero dimensions (0 = plain Neural ODE)
    #[arg(long, alias = "extra_dim", default_value_t = 1)]
    extra_dim: usize,

    /// Data dimensionality
    #[arg(long, alias = "data_dimension", default_value_t = 1)]
    data_dimension: usize,

    /// Ground-truth map coefficient
    #[arg(long, alias = "scale_factor", default_value_t = -1.0, allow_hyphen_values = true)]
    scale_factor: f32,

    /// Training samples
    #[arg(long, default_value_t = 50)]
    ntrain: usize,

    /// Test samples
    #[arg(long, default_value_t = 10)]
    ntest: usize,

    /// 1-based slot in the results table
    #[arg(long, alias = "experiment_no", default_value_t = 1)]
    experiment_no: usize,

    /// Hidden width of the vector field
    #[arg(long, default_value_t = 20)]
    hidden: usize,

    /// Seed for data and parameter initialization
    #[arg(long, default_value_t = 123)]
    seed: u64,

    /// Root directory for node/ and anode/ artifacts
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Shared results table (.npy)
    #[arg(long, default_value = "results.npy")]
    results: PathBuf,

    /// Progress line every N iterations (0 = only the summary)
    #[arg(long, default_value_t = 100)]
    log_every: usize,
}

#[derive(Args, Debug)]
struct InitArgs {
    /// Largest data dimensionality that will be recorded
    #[arg(long)]
    max_data_dimension: usize,

    /// Largest experiment number that will be recorded
    #[arg(long)]
    max_experiments: usize,

    /// Shared results table (.npy)
    #[arg(long, default_value = "results.npy")]
    results: PathBuf,

    /// Overwrite an existing table
    #[arg(long, default_value_t = false)]
    force: bool,
}

impl From<RunArgs> for ExperimentConfig {
    fn from(a: RunArgs) -> Self {
        Self {
            tol: a.tol,
            gradient_mode: GradientMode::from_adjoint_flag(a.adjoint),
            niters: a.niters,
            lr: a.lr,
            gpu: a.gpu,
            extra_dim: a.extra_dim,
            data_dimension: a.data_dimension,
            scale_factor: a.scale_factor,
            ntrain: a.ntrain,
            ntest: a.ntest,
            experiment_no: a.experiment_no,
            hidden: a.hidden,
            seed: a.seed,
            out_dir: a.out_dir,
            results_path: a.results,
            log_every: a.log_every,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    match Cli::parse().command {
        Command::Run(args) => {
            let cfg = ExperimentConfig::from(args);
            let report = experiment::run(&cfg).with_context(|| {
                format!(
                    "experiment {} (data_dimension={}, extra_dim={}) failed",
                    cfg.experiment_no, cfg.data_dimension, cfg.extra_dim
                )
            })?;

            println!();
            println!("Training complete after {} iters.", report.metrics.len());
            println!("Time = {:.3}s", report.training_time.as_secs_f64());
            println!("Train MSE = {}", report.train_loss);
            println!("NFE = {}", report.final_nfe);
            println!("Parameters = {}", report.parameters);
            println!("Test MSE = {}", report.test_loss);
            println!("Artifacts = {}", report.artifact_dir.display());
        }
        Command::InitResults(args) => {
            let table = ResultsTable::create(
                &args.results,
                args.max_data_dimension,
                args.max_experiments,
                args.force,
            )
            .with_context(|| format!("creating {}", args.results.display()))?;
            println!(
                "Created {} with shape {:?}",
                args.results.display(),
                table.values().shape()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["anode", "run"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Command::Run(args) => args,
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn adjoint_accepts_a_bare_flag_or_a_value() {
        assert!(!run_args(&[]).adjoint);
        assert!(run_args(&["--adjoint"]).adjoint);
        assert!(run_args(&["--adjoint", "True"]).adjoint);
        assert!(run_args(&["--adjoint=true"]).adjoint);
        assert!(!run_args(&["--adjoint", "False"]).adjoint);
        assert!(!run_args(&["--adjoint", "false", "--niters", "3"]).adjoint);
        assert_eq!(run_args(&["--adjoint", "--niters", "3"]).niters, 3);
    }

    #[test]
    fn snake_case_aliases_and_negative_scale_parse() {
        let args = run_args(&[
            "--extra_dim",
            "0",
            "--data_dimension",
            "3",
            "--scale_factor",
            "-2.5",
            "--experiment_no",
            "4",
        ]);
        let cfg = ExperimentConfig::from(args);
        assert_eq!(cfg.extra_dim, 0);
        assert_eq!(cfg.data_dimension, 3);
        assert_eq!(cfg.scale_factor, -2.5);
        assert_eq!(cfg.experiment_no, 4);
        assert_eq!(cfg.gradient_mode, GradientMode::Direct);
    }

    #[test]
    fn run_defaults_match_the_library_defaults() {
        let cfg = ExperimentConfig::from(run_args(&[]));
        let lib = ExperimentConfig::default();
        assert_eq!(cfg.tol, lib.tol);
        assert_eq!(cfg.niters, lib.niters);
        assert_eq!(cfg.lr, lib.lr);
        assert_eq!(cfg.extra_dim, lib.extra_dim);
        assert_eq!((cfg.ntrain, cfg.ntest), (lib.ntrain, lib.ntest));
        assert_eq!(cfg.seed, lib.seed);
        assert_eq!(cfg.results_path, lib.results_path);
    }
}
