//! Per-run artifacts: where they go and how they are written.
//!
//! Layout under the output root:
//!
//! ```text
//! <out_dir>/node/    plain runs (extra_dim = 0)
//! <out_dir>/anode/   augmented runs
//!     itr_arr.npy  loss_arr.npy  nfe_arr.npy  time_arr.npy   (f64, one entry per iteration)
//!     model.mpk                                              (field weights, burn record)
//!     model.json                                             (ModelCard)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use burn_core as burn;

use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::Backend;
use ndarray::Array1;
use ndarray_npy::{read_npy, write_npy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::TimeSpan;
use crate::field::{VectorField, VectorFieldConfig};
use crate::results::Variant;
use crate::sensitivity::GradientMode;
use crate::train::Metrics;
use crate::{Error, Result};

pub const ITR_FILE: &str = "itr_arr.npy";
pub const LOSS_FILE: &str = "loss_arr.npy";
pub const NFE_FILE: &str = "nfe_arr.npy";
pub const TIME_FILE: &str = "time_arr.npy";
/// Weights file stem; the recorder appends `.mpk`.
pub const MODEL_STEM: &str = "model";
pub const MODEL_CARD_FILE: &str = "model.json";

/// Create (if needed) and return the artifact directory of `variant` under `root`.
///
/// Idempotent: an existing directory and its contents are left alone.
pub fn prepare_dir(root: &Path, variant: Variant) -> Result<PathBuf> {
    let dir = root.join(variant.dir_name());
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Write the four metric series.
pub fn write_metrics(dir: &Path, metrics: &Metrics) -> Result<()> {
    let [itr, loss, nfe, time] = metrics.to_arrays();
    write_npy(dir.join(ITR_FILE), &itr)?;
    write_npy(dir.join(NFE_FILE), &nfe)?;
    write_npy(dir.join(LOSS_FILE), &loss)?;
    write_npy(dir.join(TIME_FILE), &time)?;
    debug!(dir = %dir.display(), len = metrics.len(), "wrote metrics");
    Ok(())
}

pub fn read_metric(dir: &Path, file: &str) -> Result<Array1<f64>> {
    Ok(read_npy(dir.join(file))?)
}

/// Everything needed to rebuild and interpret a saved field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub field: VectorFieldConfig,
    pub data_dim: usize,
    pub extra_dim: usize,
    pub span: TimeSpan,
    pub tol: f64,
    pub gradient_mode: GradientMode,
    pub parameters: usize,
    pub seed: u64,
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Save the field weights and the model card into `dir`. Returns the weights path.
pub fn save_model<B: Backend>(
    dir: &Path,
    field: &VectorField<B>,
    card: &ModelCard,
) -> Result<PathBuf> {
    let stem = dir.join(MODEL_STEM);
    field
        .clone()
        .save_file(stem.clone(), &recorder())
        .map_err(|e| Error::Record(format!("{e:?}")))?;
    fs::write(
        dir.join(MODEL_CARD_FILE),
        serde_json::to_string_pretty(card)?,
    )?;
    Ok(stem.with_extension("mpk"))
}

pub fn load_card(dir: &Path) -> Result<ModelCard> {
    let text = fs::read_to_string(dir.join(MODEL_CARD_FILE))?;
    Ok(serde_json::from_str(&text)?)
}

/// Rebuild a saved field from `dir` (card + weights).
pub fn load_model<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> Result<(VectorField<B>, ModelCard)> {
    let card = load_card(dir)?;
    let field = card
        .field
        .init::<B>(device, card.seed)
        .load_file(dir.join(MODEL_STEM), &recorder(), device)
        .map_err(|e| Error::Record(format!("{e:?}")))?;
    Ok((field, card))
}
