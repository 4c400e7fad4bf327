use ndarray::{Array4, Zip};

use super::common_mode::CommonModeParams;
use super::error::CalibError;

/// Divide, substituting `zero_sub` where the denominator is zero
#[inline]
pub fn divide_protected(num: f32, den: f32, zero_sub: f32) -> f32 {
    if den != 0.0 {
        num / den
    } else {
        zero_sub
    }
}

/// Calibration constants of one detector for one run.
///
/// Every array is shaped `[gain range][segment][row][col]`. Offsets are only meaningful
/// for families whose gain ranges are calibrated relative to each other (Jungfrau).
#[derive(Debug, Clone)]
pub struct CalibConstants {
    pub pedestals: Array4<f32>,
    pub gains: Array4<f32>,
    pub offsets: Option<Array4<f32>>,
    pub common_mode: Option<CommonModeParams>,
}

impl CalibConstants {
    pub fn new(pedestals: Array4<f32>, gains: Array4<f32>) -> Self {
        Self {
            pedestals,
            gains,
            offsets: None,
            common_mode: None,
        }
    }

    pub fn with_offsets(mut self, offsets: Array4<f32>) -> Self {
        self.offsets = Some(offsets);
        self
    }

    pub fn with_common_mode(mut self, params: CommonModeParams) -> Self {
        self.common_mode = Some(params);
        self
    }

    pub fn n_ranges(&self) -> usize {
        self.pedestals.shape()[0]
    }

    /// All arrays must be `[n_ranges] + frame_shape`; nothing is reshaped
    pub fn validate(&self, n_ranges: usize, frame_shape: &[usize]) -> Result<(), CalibError> {
        let mut expected = vec![n_ranges];
        expected.extend_from_slice(frame_shape);
        let arrays = [
            ("pedestals", Some(&self.pedestals)),
            ("gains", Some(&self.gains)),
            ("offsets", self.offsets.as_ref()),
        ];
        for (name, array) in arrays {
            if let Some(array) = array {
                if array.shape() != expected.as_slice() {
                    return Err(CalibError::ShapeMismatch {
                        name,
                        found: array.shape().to_vec(),
                        expected,
                    });
                }
            }
        }
        Ok(())
    }

    /// 1/gain per range and pixel, 0 where the gain is 0
    pub fn inverse_gains(&self) -> Array4<f32> {
        self.gains.mapv(|g| divide_protected(1.0, g, 0.0))
    }

    /// Pedestals with the per-range offsets folded in when the family uses them
    pub fn pedestal_offsets(&self, apply_offsets: bool) -> Array4<f32> {
        let mut combined = self.pedestals.clone();
        if let (true, Some(offsets)) = (apply_offsets, self.offsets.as_ref()) {
            Zip::from(&mut combined)
                .and(offsets)
                .for_each(|p, &o| *p += o);
        }
        combined
    }
}
