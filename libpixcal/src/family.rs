use ndarray::{s, Array3, ArrayView3, ArrayViewMut3, Zip};
use serde::{Deserialize, Serialize};

use super::common_mode::BankLayout;
use super::constants::*;
use super::error::CalibError;
use super::gain_range::{GainRangeClassifier, GainRangeStatistics};

/// The detector families the pipeline knows how to decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FamilyKind {
    Jungfrau,
    Epix10ka,
}

/// Jungfrau gain ranges are encoded directly in the two high bits of the raw word.
#[derive(Debug, Clone, Copy, Default)]
pub struct Jungfrau;

#[inline]
fn jungfrau_range(code: u16) -> u8 {
    if code < JUNGFRAU_BW1 {
        0
    } else if code < JUNGFRAU_BW2 {
        1
    } else if code >= JUNGFRAU_BW3 {
        2
    } else {
        UNCLASSIFIED
    }
}

impl GainRangeClassifier for Jungfrau {
    fn n_ranges(&self) -> usize {
        JUNGFRAU_GAIN_RANGES.len()
    }

    fn range_names(&self) -> &'static [&'static str] {
        &JUNGFRAU_GAIN_RANGES
    }

    fn data_mask(&self) -> u16 {
        JUNGFRAU_DATA_MASK
    }

    fn classify_into(&self, raw: ArrayView3<u16>, _first_segment: usize, ids: ArrayViewMut3<u8>) {
        Zip::from(ids)
            .and(raw)
            .for_each(|id, &code| *id = jungfrau_range(code));
    }

    fn is_common_mode_eligible(&self, range: u8) -> bool {
        range == 0
    }

    fn applies_offsets(&self) -> bool {
        true
    }

    fn default_bank_layout(&self) -> BankLayout {
        BankLayout::new(JUNGFRAU_BANK_ROWS, JUNGFRAU_BANK_COLS)
    }

    fn asic_shape(&self) -> (usize, usize) {
        (JUNGFRAU_ASIC_ROWS, JUNGFRAU_ASIC_COLS)
    }
}

/// Epix10ka panels (and the quad and 2M detectors built from them).
///
/// The gain range of a pixel depends on its configured control bits as well as on
/// data bit 14 of the raw word, so the classifier carries the per-pixel control bits
/// `[segment][row][col]` taken from the detector configuration for the run.
#[derive(Debug, Clone)]
pub struct Epix10ka {
    control_bits: Array3<u8>,
}

#[inline]
fn epix10ka_range(control_bits: u8, code: u16) -> u8 {
    let cbits = control_bits | ((code & EPIX10KA_DATA_BIT) >> EPIX10KA_DATA_BIT_SHIFT) as u8;
    let m28 = cbits & 28;
    let m12 = cbits & 12;
    let m60 = cbits & 60;
    if m28 == 28 {
        0 // FH
    } else if m28 == 12 {
        1 // FM
    } else if m12 == 8 {
        2 // FL
    } else if m60 == 16 {
        3 // AHL-H
    } else if m60 == 0 {
        4 // AML-M
    } else if m60 == 48 {
        5 // AHL-L
    } else if m60 == 32 {
        6 // AML-L
    } else {
        UNCLASSIFIED
    }
}

impl Epix10ka {
    /// Create the classifier from per-pixel control bits.
    ///
    /// Only the gain bits (2, 3) and the trbit (4) are kept; the test and mask bits are
    /// irrelevant to the gain range.
    pub fn new(control_bits: Array3<u8>) -> Self {
        Self {
            control_bits: control_bits.mapv(|b| b & EPIX10KA_CONFIG_BITS),
        }
    }

    /// Every pixel of every segment configured with the same control bits
    pub fn uniform(n_segments: usize, rows: usize, cols: usize, control_bits: u8) -> Self {
        Self::new(Array3::from_elem((n_segments, rows, cols), control_bits))
    }

    pub fn control_bits(&self) -> ArrayView3<u8> {
        self.control_bits.view()
    }
}

impl GainRangeClassifier for Epix10ka {
    fn n_ranges(&self) -> usize {
        EPIX10KA_GAIN_RANGES.len()
    }

    fn range_names(&self) -> &'static [&'static str] {
        &EPIX10KA_GAIN_RANGES
    }

    fn data_mask(&self) -> u16 {
        EPIX10KA_DATA_MASK
    }

    fn classify_into(&self, raw: ArrayView3<u16>, first_segment: usize, ids: ArrayViewMut3<u8>) {
        let n_segments = raw.shape()[0];
        let cbits = self
            .control_bits
            .slice(s![first_segment..first_segment + n_segments, .., ..]);
        Zip::from(ids)
            .and(raw)
            .and(cbits)
            .for_each(|id, &code, &cb| *id = epix10ka_range(cb, code));
    }

    fn is_common_mode_eligible(&self, range: u8) -> bool {
        // High and medium ranges, fixed or auto-switching
        matches!(range, 0 | 1 | 3 | 4)
    }

    fn applies_offsets(&self) -> bool {
        false
    }

    fn default_bank_layout(&self) -> BankLayout {
        BankLayout::new(EPIX10KA_BANK_ROWS, EPIX10KA_BANK_COLS)
    }

    fn asic_shape(&self) -> (usize, usize) {
        (EPIX10KA_ASIC_ROWS, EPIX10KA_ASIC_COLS)
    }

    fn validate_shape(&self, shape: &[usize]) -> Result<(), CalibError> {
        if self.control_bits.shape() != shape {
            return Err(CalibError::ShapeMismatch {
                name: "control bits",
                found: self.control_bits.shape().to_vec(),
                expected: shape.to_vec(),
            });
        }
        Ok(())
    }
}

/// A detector family strategy, selected once when the pipeline is built
#[derive(Debug, Clone)]
pub enum DetectorFamily {
    Jungfrau(Jungfrau),
    Epix10ka(Epix10ka),
}

impl DetectorFamily {
    pub fn kind(&self) -> FamilyKind {
        match self {
            Self::Jungfrau(_) => FamilyKind::Jungfrau,
            Self::Epix10ka(_) => FamilyKind::Epix10ka,
        }
    }

    /// Family of the given kind. Epix10ka starts without control bits; they are
    /// supplied per run by the calibration store.
    pub fn from_kind(kind: FamilyKind) -> Self {
        match kind {
            FamilyKind::Jungfrau => Self::Jungfrau(Jungfrau),
            FamilyKind::Epix10ka => Self::Epix10ka(Epix10ka::new(Array3::zeros((0, 0, 0)))),
        }
    }

    fn classifier(&self) -> &dyn GainRangeClassifier {
        match self {
            Self::Jungfrau(j) => j,
            Self::Epix10ka(e) => e,
        }
    }

    /// Name of the gain mode used by more than half of the pixels, if any
    pub fn find_gain_mode(&self, raw: ArrayView3<u16>) -> Option<&'static str> {
        let ids = self.classify(raw);
        GainRangeStatistics::from_range_ids(ids.view(), self.n_ranges())
            .dominant_range()
            .and_then(|idx| self.range_names().get(idx).copied())
    }
}

impl From<Jungfrau> for DetectorFamily {
    fn from(value: Jungfrau) -> Self {
        Self::Jungfrau(value)
    }
}

impl From<Epix10ka> for DetectorFamily {
    fn from(value: Epix10ka) -> Self {
        Self::Epix10ka(value)
    }
}

impl GainRangeClassifier for DetectorFamily {
    fn n_ranges(&self) -> usize {
        self.classifier().n_ranges()
    }

    fn range_names(&self) -> &'static [&'static str] {
        self.classifier().range_names()
    }

    fn data_mask(&self) -> u16 {
        self.classifier().data_mask()
    }

    fn classify_into(&self, raw: ArrayView3<u16>, first_segment: usize, ids: ArrayViewMut3<u8>) {
        self.classifier().classify_into(raw, first_segment, ids)
    }

    fn is_common_mode_eligible(&self, range: u8) -> bool {
        self.classifier().is_common_mode_eligible(range)
    }

    fn applies_offsets(&self) -> bool {
        self.classifier().applies_offsets()
    }

    fn default_bank_layout(&self) -> BankLayout {
        self.classifier().default_bank_layout()
    }

    fn asic_shape(&self) -> (usize, usize) {
        self.classifier().asic_shape()
    }

    fn validate_shape(&self, shape: &[usize]) -> Result<(), CalibError> {
        self.classifier().validate_shape(shape)
    }
}
