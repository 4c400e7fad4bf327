use fxhash::FxHashMap;
use ndarray::{Array3, Array4};
use std::convert::Infallible;

use super::calib_constants::CalibConstants;

/// Provides the raw frames of one detector for one run
pub trait DataSource {
    type Error;

    /// Name of the detector, used as the cache key
    fn identity(&self) -> &str;

    fn n_events(&self) -> usize;

    /// Raw frame `[segment][row][col]` of an event, None if the detector has no data for it
    fn raw_frame(&self, event: usize) -> Result<Option<Array3<u16>>, Self::Error>;
}

/// Provides the calibration data of a detector for a run.
///
/// Stored common mode parameters travel with the constants
/// (see [`CalibConstants::common_mode`]).
pub trait CalibStore {
    type Error;

    fn constants(&self, identity: &str, run: i32) -> Result<Option<CalibConstants>, Self::Error>;

    /// Pixel status `[range][segment][row][col]`
    fn pixel_status(&self, identity: &str, run: i32) -> Result<Option<Array4<u16>>, Self::Error>;

    /// Per-pixel control bits; only meaningful for Epix10ka
    fn control_bits(&self, identity: &str, run: i32) -> Result<Option<Array3<u8>>, Self::Error>;
}

/// Frames held in memory. Events without data are None.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub identity: String,
    pub frames: Vec<Option<Array3<u16>>>,
}

impl MemorySource {
    pub fn new(identity: &str, frames: Vec<Option<Array3<u16>>>) -> Self {
        Self {
            identity: identity.to_string(),
            frames,
        }
    }
}

impl DataSource for MemorySource {
    type Error = Infallible;

    fn identity(&self) -> &str {
        &self.identity
    }

    fn n_events(&self) -> usize {
        self.frames.len()
    }

    fn raw_frame(&self, event: usize) -> Result<Option<Array3<u16>>, Self::Error> {
        Ok(self.frames.get(event).cloned().flatten())
    }
}

/// Calibration data held in memory, keyed by identity and run
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    constants: FxHashMap<(String, i32), CalibConstants>,
    status: FxHashMap<(String, i32), Array4<u16>>,
    control_bits: FxHashMap<(String, i32), Array3<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_constants(&mut self, identity: &str, run: i32, constants: CalibConstants) {
        self.constants.insert((identity.to_string(), run), constants);
    }

    pub fn insert_status(&mut self, identity: &str, run: i32, status: Array4<u16>) {
        self.status.insert((identity.to_string(), run), status);
    }

    pub fn insert_control_bits(&mut self, identity: &str, run: i32, bits: Array3<u8>) {
        self.control_bits.insert((identity.to_string(), run), bits);
    }
}

impl CalibStore for MemoryStore {
    type Error = Infallible;

    fn constants(&self, identity: &str, run: i32) -> Result<Option<CalibConstants>, Self::Error> {
        Ok(self.constants.get(&(identity.to_string(), run)).cloned())
    }

    fn pixel_status(&self, identity: &str, run: i32) -> Result<Option<Array4<u16>>, Self::Error> {
        Ok(self.status.get(&(identity.to_string(), run)).cloned())
    }

    fn control_bits(&self, identity: &str, run: i32) -> Result<Option<Array3<u8>>, Self::Error> {
        Ok(self.control_bits.get(&(identity.to_string(), run)).cloned())
    }
}
