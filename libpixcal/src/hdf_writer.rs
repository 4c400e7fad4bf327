use hdf5::types::VarLenUnicode;
use hdf5::File;
use ndarray::ArrayView3;
use std::path::Path;
use std::str::FromStr;

use super::error::{HDF5WriterError, ProcessorError};
use super::process::{FrameSink, RunSummary};

const CALIBRATED_NAME: &str = "calibrated";

/// This is the version of the output format
const FORMAT_VERSION: &str = "1.0";

/// A simple struct which wraps around the hdf5-rust library.
///
/// Opens an HDF5 file for writing calibrated frames.
#[derive(Debug)]
pub struct HDFWriter {
    file_handle: File,
    calibrated_group: hdf5::Group,
    first_event: Option<u64>,
    last_event: u64,
}
// Structure
// calibrated - identity, min_event, max_event, n_events, n_calibrated, n_missing_raw, n_missing_constants,
//              cm_applied, cm_skipped, version
// |---- event_#(dset f32 [segment][row][col])

impl HDFWriter {
    /// Create the writer, opening a file at path and creating the data group
    pub fn new(path: &Path, identity: &str) -> Result<Self, HDF5WriterError> {
        let file_handle = File::create(path)?;
        let version = format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION);

        let calibrated_group = file_handle.create_group(CALIBRATED_NAME)?;
        for name in ["min_event", "max_event"] {
            calibrated_group.new_attr::<u64>().create(name)?;
        }
        for name in [
            "n_events",
            "n_calibrated",
            "n_missing_raw",
            "n_missing_constants",
            "cm_applied",
            "cm_skipped",
        ] {
            calibrated_group.new_attr::<u64>().create(name)?;
        }
        calibrated_group
            .new_attr::<VarLenUnicode>()
            .create("identity")?
            .write_scalar(&VarLenUnicode::from_str(identity)?)?;
        calibrated_group
            .new_attr::<VarLenUnicode>()
            .create("version")?
            .write_scalar(&VarLenUnicode::from_str(&version)?)?;

        Ok(Self {
            file_handle,
            calibrated_group,
            first_event: None,
            last_event: 0,
        })
    }

    /// Write one calibrated frame as `event_#`
    pub fn write_calibrated_frame(
        &mut self,
        event: u64,
        frame: ArrayView3<f32>,
    ) -> Result<(), HDF5WriterError> {
        let data = frame.as_slice().ok_or(HDF5WriterError::NonContiguousFrame)?;
        let dataset = self
            .calibrated_group
            .new_dataset::<f32>()
            .shape(frame.dim())
            .create(format!("event_{event}").as_str())?;
        dataset.write_raw(data)?;

        self.first_event.get_or_insert(event);
        self.last_event = self.last_event.max(event);
        Ok(())
    }

    /// Write the run summary and close the file
    pub fn close(self, summary: &RunSummary) -> Result<(), HDF5WriterError> {
        let attrs = [
            ("min_event", self.first_event.unwrap_or(0)),
            ("max_event", self.last_event),
            ("n_events", summary.events as u64),
            ("n_calibrated", summary.calibrated as u64),
            ("n_missing_raw", summary.missing_raw as u64),
            ("n_missing_constants", summary.missing_constants as u64),
            ("cm_applied", summary.common_mode.applied as u64),
            ("cm_skipped", summary.common_mode.skipped() as u64),
        ];
        for (name, value) in attrs {
            self.calibrated_group.attr(name)?.write_scalar(&value)?;
        }
        if summary.calibrated == 0 {
            spdlog::warn!("Run {} produced no calibrated frames!", summary.run_number);
        }
        spdlog::info!(
            "{} calibrated frames written to {}.",
            summary.calibrated,
            self.file_handle.filename()
        );
        Ok(())
    }
}

impl FrameSink for HDFWriter {
    fn write_frame(&mut self, event: usize, frame: ArrayView3<f32>) -> Result<(), ProcessorError> {
        Ok(self.write_calibrated_frame(event as u64, frame)?)
    }
}
