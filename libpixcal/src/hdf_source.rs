use hdf5::types::VarLenUnicode;
use hdf5::{Dataset, File, Group, H5Type};
use ndarray::{s, Array3, Array4, Ix3};
use std::path::Path;

use super::calib_constants::CalibConstants;
use super::common_mode::CommonModeParams;
use super::error::HDF5SourceError;
use super::source::{CalibStore, DataSource};

const RAW_NAME: &str = "raw";
const PRESENT_NAME: &str = "present";
const IDENTITY_NAME: &str = "identity";
const CALIB_NAME: &str = "calib";
const PEDESTALS_NAME: &str = "pedestals";
const GAINS_NAME: &str = "gains";
const OFFSETS_NAME: &str = "offsets";
const STATUS_NAME: &str = "status";
const COMMON_MODE_NAME: &str = "common_mode";
const CONFIG_NAME: &str = "config";
const CONTROL_BITS_NAME: &str = "control_bits";
const DEFAULT_IDENTITY: &str = "detector";

/// Reads one run of one detector from an HDF5 file.
///
/// The file carries its own calibration, so the identity and run passed to the
/// [`CalibStore`] methods are only used for logging.
#[derive(Debug)]
pub struct HDF5Source {
    file_handle: File,
    raw: Dataset,
    identity: String,
    n_events: usize,
    frame_shape: (usize, usize, usize),
    present: Option<Vec<u8>>,
}
// Structure
// run_0001.h5
// raw(dset u16 [event][segment][row][col]) - identity
// present(dset u8 [event], optional)
// calib
// |---- pedestals(dset f32 [range][segment][row][col])
// |---- gains(dset f32 [range][segment][row][col])
// |---- offsets(dset f32 [range][segment][row][col], optional)
// |---- status(dset u16 [range][segment][row][col], optional)
// |---- common_mode(dset f64 [algorithm, mode, max_correction, min_pixel_count?], optional)
// config
// |---- control_bits(dset u8 [segment][row][col], optional)

fn read_attr_opt_string(dataset: &Dataset, name: &str) -> Result<Option<String>, HDF5SourceError> {
    match dataset.attr(name) {
        Ok(attr) => {
            let value: VarLenUnicode = attr.read_scalar()?;
            Ok(Some(value.to_string()))
        }
        Err(_) => Ok(None),
    }
}

fn check_rank(dataset: &Dataset, name: &str, expected: usize) -> Result<Vec<usize>, HDF5SourceError> {
    let shape = dataset.shape();
    if shape.len() != expected {
        return Err(HDF5SourceError::BadRank {
            name: name.to_string(),
            found: shape.len(),
            expected,
        });
    }
    Ok(shape)
}

fn read_array3_opt<T: H5Type>(group: &Group, name: &str) -> Result<Option<Array3<T>>, HDF5SourceError> {
    let dataset = match group.dataset(name) {
        Ok(dataset) => dataset,
        Err(_) => return Ok(None),
    };
    let shape = check_rank(&dataset, name, 3)?;
    let data = dataset.read_raw::<T>()?;
    Ok(Some(Array3::from_shape_vec((shape[0], shape[1], shape[2]), data)?))
}

fn read_array4_opt<T: H5Type>(group: &Group, name: &str) -> Result<Option<Array4<T>>, HDF5SourceError> {
    let dataset = match group.dataset(name) {
        Ok(dataset) => dataset,
        Err(_) => return Ok(None),
    };
    let shape = check_rank(&dataset, name, 4)?;
    let data = dataset.read_raw::<T>()?;
    Ok(Some(Array4::from_shape_vec(
        (shape[0], shape[1], shape[2], shape[3]),
        data,
    )?))
}

impl HDF5Source {
    /// Open a run file and inspect its raw dataset
    pub fn open(path: &Path) -> Result<Self, HDF5SourceError> {
        let file_handle = File::open(path)?;
        let raw = file_handle.dataset(RAW_NAME)?;
        let shape = check_rank(&raw, RAW_NAME, 4)?;
        let identity = read_attr_opt_string(&raw, IDENTITY_NAME)?
            .unwrap_or_else(|| String::from(DEFAULT_IDENTITY));
        let present = match file_handle.dataset(PRESENT_NAME) {
            Ok(dataset) => Some(dataset.read_raw::<u8>()?),
            Err(_) => None,
        };
        spdlog::info!(
            "Opened {} for {} ({} events)",
            path.to_string_lossy(),
            identity,
            shape[0]
        );
        Ok(Self {
            file_handle,
            raw,
            identity,
            n_events: shape[0],
            frame_shape: (shape[1], shape[2], shape[3]),
            present,
        })
    }

    pub fn frame_shape(&self) -> (usize, usize, usize) {
        self.frame_shape
    }

    fn calib_group(&self) -> Option<Group> {
        self.file_handle.group(CALIB_NAME).ok()
    }
}

impl DataSource for HDF5Source {
    type Error = HDF5SourceError;

    fn identity(&self) -> &str {
        &self.identity
    }

    fn n_events(&self) -> usize {
        self.n_events
    }

    fn raw_frame(&self, event: usize) -> Result<Option<Array3<u16>>, Self::Error> {
        if event >= self.n_events {
            return Err(HDF5SourceError::EventOutOfRange(event, self.n_events));
        }
        if let Some(present) = &self.present {
            if present.get(event).copied().unwrap_or(0) == 0 {
                return Ok(None);
            }
        }
        let frame = self
            .raw
            .read_slice::<u16, _, Ix3>(s![event, .., .., ..])?;
        Ok(Some(frame))
    }
}

impl CalibStore for HDF5Source {
    type Error = HDF5SourceError;

    fn constants(&self, identity: &str, run: i32) -> Result<Option<CalibConstants>, Self::Error> {
        let group = match self.calib_group() {
            Some(group) => group,
            None => {
                spdlog::warn!("No {} group for {} in run {}", CALIB_NAME, identity, run);
                return Ok(None);
            }
        };
        let pedestals = read_array4_opt::<f32>(&group, PEDESTALS_NAME)?;
        let gains = read_array4_opt::<f32>(&group, GAINS_NAME)?;
        let (pedestals, gains) = match (pedestals, gains) {
            (Some(p), Some(g)) => (p, g),
            _ => return Ok(None),
        };
        let mut constants = CalibConstants::new(pedestals, gains);
        if let Some(offsets) = read_array4_opt::<f32>(&group, OFFSETS_NAME)? {
            constants = constants.with_offsets(offsets);
        }
        if let Ok(dataset) = group.dataset(COMMON_MODE_NAME) {
            let values = dataset.read_raw::<f64>()?;
            constants = constants.with_common_mode(CommonModeParams::from_stored(&values)?);
        }
        Ok(Some(constants))
    }

    fn pixel_status(&self, _identity: &str, _run: i32) -> Result<Option<Array4<u16>>, Self::Error> {
        match self.calib_group() {
            Some(group) => read_array4_opt::<u16>(&group, STATUS_NAME),
            None => Ok(None),
        }
    }

    fn control_bits(&self, _identity: &str, _run: i32) -> Result<Option<Array3<u8>>, Self::Error> {
        match self.file_handle.group(CONFIG_NAME) {
            Ok(group) => read_array3_opt::<u8>(&group, CONTROL_BITS_NAME),
            Err(_) => Ok(None),
        }
    }
}
