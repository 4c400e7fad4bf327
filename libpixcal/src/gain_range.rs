use ndarray::{Array3, ArrayView3, ArrayViewMut3, Zip};

use super::common_mode::BankLayout;
use super::constants::UNCLASSIFIED;
use super::error::CalibError;

/// GainRangeClassifier decodes raw pixel codes into gain range ids.
///
/// Each detector family has a fixed set of named gain ranges. Every pixel is assigned
/// the id of the single range it belongs to, or [`UNCLASSIFIED`] when the code matches
/// none of them. The ranges are mutually exclusive by construction: a pixel carries
/// exactly one id.
pub trait GainRangeClassifier {
    /// Number of named gain ranges (and the leading dimension of the constants)
    fn n_ranges(&self) -> usize;

    /// Names of the gain ranges in calibration-constant order
    fn range_names(&self) -> &'static [&'static str];

    /// Mask selecting the ADC value bits of a raw code
    fn data_mask(&self) -> u16;

    /// Write the range id of every pixel of `raw` into `ids`.
    ///
    /// `first_segment` is the detector index of the first segment in `raw`, so that
    /// per-segment classifier state lines up when the caller works panel by panel.
    fn classify_into(&self, raw: ArrayView3<u16>, first_segment: usize, ids: ArrayViewMut3<u8>);

    /// Whether pixels in this range participate in the common mode statistic
    fn is_common_mode_eligible(&self, range: u8) -> bool;

    /// Whether the family's per-range offsets are subtracted along with the pedestal
    fn applies_offsets(&self) -> bool;

    /// Readout bank tiling used for common mode partitions
    fn default_bank_layout(&self) -> BankLayout;

    /// Shape of a single ASIC, used to find the central rows and columns of a segment
    fn asic_shape(&self) -> (usize, usize);

    /// Check that this classifier can decode a frame of the given `[segment][row][col]` shape
    fn validate_shape(&self, _shape: &[usize]) -> Result<(), CalibError> {
        Ok(())
    }

    /// Allocate and fill a range id array for a full frame
    fn classify(&self, raw: ArrayView3<u16>) -> Array3<u8> {
        let mut ids = Array3::<u8>::from_elem(raw.raw_dim(), UNCLASSIFIED);
        self.classify_into(raw, 0, ids.view_mut());
        ids
    }
}

/// Boolean membership masks, one per gain range, all shaped like the raw frame.
///
/// The pipeline works with integer range ids directly; the masks are the
/// select-style view of the same information.
#[derive(Debug, Clone)]
pub struct GainRangeMasks {
    masks: Vec<Array3<bool>>,
}

impl GainRangeMasks {
    pub fn new(masks: Vec<Array3<bool>>) -> Self {
        Self { masks }
    }

    /// Expand a range id array into `n_ranges` boolean masks
    pub fn from_range_ids(ids: ArrayView3<u8>, n_ranges: usize) -> Self {
        let masks = (0..n_ranges)
            .map(|range| ids.mapv(|id| id as usize == range))
            .collect();
        Self { masks }
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn get(&self, range: usize) -> Option<ArrayView3<bool>> {
        self.masks.get(range).map(|m| m.view())
    }

    pub fn views(&self) -> Vec<ArrayView3<bool>> {
        self.masks.iter().map(|m| m.view()).collect()
    }

    /// Collapse the masks back into range ids.
    ///
    /// If more than one mask is set for a pixel the first one wins.
    pub fn to_range_ids(&self) -> Option<Array3<u8>> {
        let first = self.masks.first()?;
        let mut ids = Array3::<u8>::from_elem(first.raw_dim(), UNCLASSIFIED);
        for (range, mask) in self.masks.iter().enumerate().rev() {
            Zip::from(&mut ids).and(mask).for_each(|id, &m| {
                if m {
                    *id = range as u8;
                }
            });
        }
        Some(ids)
    }
}

/// Per-range pixel counts for one frame
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GainRangeStatistics {
    pub counts: Vec<usize>,
    pub unclassified: usize,
    pub total: usize,
}

impl GainRangeStatistics {
    pub fn from_range_ids(ids: ArrayView3<u8>, n_ranges: usize) -> Self {
        let mut stats = Self {
            counts: vec![0; n_ranges],
            unclassified: 0,
            total: ids.len(),
        };
        for &id in ids.iter() {
            match stats.counts.get_mut(id as usize) {
                Some(count) => *count += 1,
                None => stats.unclassified += 1,
            }
        }
        stats
    }

    pub fn fractions(&self) -> Vec<f64> {
        if self.total == 0 {
            return vec![0.0; self.counts.len()];
        }
        let norm = 1.0 / self.total as f64;
        self.counts.iter().map(|&c| c as f64 * norm).collect()
    }

    /// Index of the range holding more than half of all pixels, if any
    pub fn dominant_range(&self) -> Option<usize> {
        self.fractions().iter().position(|&f| f > 0.5)
    }

    /// One-line summary such as `G0: 524000, G1: 288, G2: 0, none: 0`
    pub fn describe(&self, names: &[&str]) -> String {
        let mut parts: Vec<String> = self
            .counts
            .iter()
            .enumerate()
            .map(|(idx, count)| {
                let name = names.get(idx).copied().unwrap_or("?");
                format!("{name}: {count}")
            })
            .collect();
        parts.push(format!("none: {}", self.unclassified));
        parts.join(", ")
    }
}

/// Map of range indices with -1 in place of unclassified pixels
pub fn range_index_map(ids: ArrayView3<u8>) -> Array3<i16> {
    ids.mapv(|id| if id == UNCLASSIFIED { -1 } else { id as i16 })
}
