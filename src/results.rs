//! The shared results table: final train/test losses of many runs in one `.npy` file.
//!
//! Shape `[2, 2, max_data_dimension, max_experiments]`, `f64`, indexed as
//! `[variant][split][data_dimension - 1][experiment_no - 1]`:
//! - `variant`: 0 = plain Neural ODE (`extra_dim = 0`), 1 = augmented,
//! - `split`: 0 = train, 1 = test.
//!
//! A run never creates or resizes the table; it loads it, writes its two cells and saves it.
//! Creating it is a separate, explicit step ([`ResultsTable::create`]). Concurrent runs writing
//! the same file are not guarded against.

use std::path::Path;

use ndarray::Array4;
use ndarray_npy::{read_npy, write_npy};
use tracing::debug;

use crate::{Error, Result};

/// Plain vs augmented Neural ODE. Picks both the artifact directory and the results slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Plain,
    Augmented,
}

impl Variant {
    pub fn from_extra_dim(extra_dim: usize) -> Self {
        if extra_dim == 0 {
            Self::Plain
        } else {
            Self::Augmented
        }
    }

    /// First index into the results table.
    pub fn slot(self) -> usize {
        match self {
            Variant::Plain => 0,
            Variant::Augmented => 1,
        }
    }

    /// Artifact directory name.
    pub fn dir_name(self) -> &'static str {
        match self {
            Variant::Plain => "node",
            Variant::Augmented => "anode",
        }
    }
}

/// Second index into the results table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn slot(self) -> usize {
        match self {
            Split::Train => 0,
            Split::Test => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultsTable {
    values: Array4<f64>,
}

impl ResultsTable {
    /// Zero-filled table for `data_dimension` in `1..=max_data_dimension` and
    /// `experiment_no` in `1..=max_experiments`.
    pub fn zeros(max_data_dimension: usize, max_experiments: usize) -> Result<Self> {
        if max_data_dimension == 0 || max_experiments == 0 {
            return Err(Error::Shape("results table dimensions must be >= 1"));
        }
        Ok(Self {
            values: Array4::zeros((2, 2, max_data_dimension, max_experiments)),
        })
    }

    /// Write a fresh zero table to `path`. Refuses to replace an existing file unless `force`.
    pub fn create(
        path: &Path,
        max_data_dimension: usize,
        max_experiments: usize,
        force: bool,
    ) -> Result<Self> {
        if path.exists() && !force {
            return Err(Error::ResultsExist(path.to_path_buf()));
        }
        let table = Self::zeros(max_data_dimension, max_experiments)?;
        table.save(path)?;
        Ok(table)
    }

    /// Load an existing table. A missing file is `Error::MissingResults`.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::MissingResults(path.to_path_buf()));
        }
        let values: Array4<f64> = read_npy(path)?;
        let shape = values.shape();
        if shape[0] != 2 || shape[1] != 2 {
            return Err(Error::Shape("results table must be [2, 2, dims, experiments]"));
        }
        debug!(shape = ?shape, path = %path.display(), "loaded results table");
        Ok(Self { values })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_npy(path, &self.values)?;
        Ok(())
    }

    pub fn values(&self) -> &Array4<f64> {
        &self.values
    }

    fn index(
        &self,
        variant: Variant,
        split: Split,
        data_dimension: usize,
        experiment_no: usize,
    ) -> Result<[usize; 4]> {
        let shape = self.values.shape();
        if data_dimension == 0 || data_dimension > shape[2] {
            return Err(Error::Shape("data_dimension has no slot in the results table"));
        }
        if experiment_no == 0 || experiment_no > shape[3] {
            return Err(Error::Shape("experiment_no has no slot in the results table"));
        }
        Ok([
            variant.slot(),
            split.slot(),
            data_dimension - 1,
            experiment_no - 1,
        ])
    }

    /// Check that a run with these coordinates has a slot, without writing anything.
    pub fn check_slot(&self, data_dimension: usize, experiment_no: usize) -> Result<()> {
        self.index(Variant::Plain, Split::Train, data_dimension, experiment_no)
            .map(|_| ())
    }

    /// `data_dimension` and `experiment_no` are 1-based.
    pub fn get(
        &self,
        variant: Variant,
        split: Split,
        data_dimension: usize,
        experiment_no: usize,
    ) -> Result<f64> {
        let ix = self.index(variant, split, data_dimension, experiment_no)?;
        Ok(self.values[ix])
    }

    /// `data_dimension` and `experiment_no` are 1-based.
    pub fn record(
        &mut self,
        variant: Variant,
        split: Split,
        data_dimension: usize,
        experiment_no: usize,
        loss: f64,
    ) -> Result<()> {
        let ix = self.index(variant, split, data_dimension, experiment_no)?;
        self.values[ix] = loss;
        Ok(())
    }
}
