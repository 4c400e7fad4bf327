use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::WorkerStatus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibError {
    #[error("Shape mismatch for {name}: found {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: &'static str,
        found: Vec<usize>,
        expected: Vec<usize>,
    },
    #[error("Unrecognized common mode bits {0:#b}; only bank (1), row (2) and column (4) are defined")]
    UnrecognizedModeBits(u32),
    #[error("Stored common mode parameters need at least 3 entries, found {0}")]
    BadStoredCommonMode(usize),
    #[error("Bank layout {bank_rows}x{bank_cols} does not tile a {rows}x{cols} segment")]
    BadBankLayout {
        bank_rows: usize,
        bank_cols: usize,
        rows: usize,
        cols: usize,
    },
    #[error("Raw frame has no pixels")]
    EmptyFrame,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[cfg(feature = "hdf5")]
#[derive(Debug, Error)]
pub enum HDF5SourceError {
    #[error("HDF5Source failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("HDF5Source found dataset {name} with {found} dimensions; expected {expected}")]
    BadRank {
        name: String,
        found: usize,
        expected: usize,
    },
    #[error("HDF5Source requested event {0} but the run only has {1} events")]
    EventOutOfRange(usize, usize),
    #[error("HDF5Source could not build an array: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error("HDF5Source found bad calibration data: {0}")]
    CalibError(#[from] CalibError),
}

#[cfg(feature = "hdf5")]
#[derive(Debug, Error)]
pub enum HDF5WriterError {
    #[error("HDF5Writer failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("HDF5Writer failed due to string error: {0}")]
    StringError(#[from] hdf5::types::StringError),
    #[error("HDF5Writer was given a frame which is not contiguous in memory")]
    NonContiguousFrame,
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to calibration error: {0}")]
    CalibError(#[from] CalibError),
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[cfg(feature = "hdf5")]
    #[error("Processor failed due to HDF5Source error: {0}")]
    SourceError(#[from] HDF5SourceError),
    #[cfg(feature = "hdf5")]
    #[error("Processor failed due to HDF5Writer error: {0}")]
    HDFError(#[from] HDF5WriterError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<std::convert::Infallible> for ProcessorError {
    fn from(value: std::convert::Infallible) -> Self {
        match value {}
    }
}
