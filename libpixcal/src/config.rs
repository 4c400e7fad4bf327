use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::common_mode::{BankLayout, CommonModeRequest};
use super::error::ConfigError;
use super::family::{DetectorFamily, FamilyKind};
use super::mask::MaskOptions;
use super::pipeline::{CalibrationPipeline, ExecutionStrategy};
use super::process::RunOptions;

/// Structure representing the application configuration. Contains pathing, detector and run information
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub family: FamilyKind,
    /// None uses the family's native bank size
    pub bank_layout: Option<BankLayout>,
    pub strategy: ExecutionStrategy,
    pub common_mode: CommonModeRequest,
    pub mask: MaskOptions,
    pub first_run_number: i32,
    pub last_run_number: i32,
    pub n_threads: i32,
}

impl Default for Config {
    /// Generate a new Config object. All paths will be empty/invalid
    fn default() -> Self {
        Self {
            input_path: PathBuf::from("None"),
            output_path: PathBuf::from("None"),
            family: FamilyKind::Jungfrau,
            bank_layout: None,
            strategy: ExecutionStrategy::WholeArray,
            common_mode: CommonModeRequest::Stored,
            mask: MaskOptions::default(),
            first_run_number: 0,
            last_run_number: 0,
            n_threads: 1,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Check if a specific run exists by evaluating the existance of its raw data file
    pub fn does_run_exist(&self, run_number: i32) -> bool {
        self.input_path
            .join(self.get_run_str(run_number))
            .exists()
    }

    /// Get the path to the raw data file of a run
    pub fn get_run_file(&self, run_number: i32) -> Result<PathBuf, ConfigError> {
        let run_file = self.input_path.join(self.get_run_str(run_number));
        if run_file.exists() {
            Ok(run_file)
        } else {
            Err(ConfigError::BadFilePath(run_file))
        }
    }

    /// Get the path to the output hdf5 file
    pub fn get_output_file(&self, run_number: i32) -> Result<PathBuf, ConfigError> {
        if self.output_path.exists() {
            Ok(self.output_path.join(self.get_run_str(run_number)))
        } else {
            Err(ConfigError::BadFilePath(self.output_path.clone()))
        }
    }

    /// Construct the run file name
    fn get_run_str(&self, run_number: i32) -> String {
        format!("run_{run_number:0>4}.h5")
    }

    pub fn is_n_threads_valid(&self) -> bool {
        self.n_threads >= 1
    }

    /// A fresh pipeline (with its own cache) for one worker
    pub fn build_pipeline(&self) -> CalibrationPipeline {
        let pipeline = CalibrationPipeline::new(DetectorFamily::from_kind(self.family), self.strategy);
        match self.bank_layout {
            Some(layout) => pipeline.with_bank_layout(layout),
            None => pipeline,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            common_mode: self.common_mode,
            mask: self.mask.clone(),
        }
    }
}
