use ndarray::{s, ArrayView2, ArrayViewMut2, Zip};
use serde::{Deserialize, Serialize};

use super::constants::DEFAULT_MIN_PIXEL_COUNT;
use super::error::CalibError;

/// Bit-word selecting which common mode passes run.
///
/// Passes always run bank first, then rows, then columns, each on the residual left by
/// the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ModeBits(u8);

impl ModeBits {
    pub const NONE: Self = Self(0);
    pub const BANK: Self = Self(1);
    pub const ROW: Self = Self(2);
    pub const COLUMN: Self = Self(4);
    pub const ALL: Self = Self(7);

    pub fn from_bits(bits: u32) -> Result<Self, CalibError> {
        if bits & !(Self::ALL.0 as u32) != 0 {
            return Err(CalibError::UnrecognizedModeBits(bits));
        }
        Ok(Self(bits as u8))
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ModeBits {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl TryFrom<u32> for ModeBits {
    type Error = CalibError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_bits(value)
    }
}

impl From<ModeBits> for u32 {
    fn from(value: ModeBits) -> Self {
        value.0 as u32
    }
}

/// Common mode correction parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommonModeParams {
    pub algorithm: u8,
    pub mode: ModeBits,
    pub max_correction: f32,
    pub min_pixel_count: usize,
}

impl CommonModeParams {
    pub fn new(mode: ModeBits, max_correction: f32, min_pixel_count: usize) -> Self {
        Self {
            algorithm: 7,
            mode,
            max_correction,
            min_pixel_count,
        }
    }

    /// Parse the array form kept by the calibration store:
    /// `[algorithm, mode, max_correction, min_pixel_count?]`
    pub fn from_stored(values: &[f64]) -> Result<Self, CalibError> {
        if values.len() < 3 {
            return Err(CalibError::BadStoredCommonMode(values.len()));
        }
        let min_pixel_count = values
            .get(3)
            .map(|&v| v as usize)
            .unwrap_or(DEFAULT_MIN_PIXEL_COUNT);
        Ok(Self {
            algorithm: values[0] as u8,
            mode: ModeBits::from_bits(values[1] as u32)?,
            max_correction: values[2] as f32,
            min_pixel_count,
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.mode.is_empty()
    }
}

/// How a calibration call chooses its common mode parameters
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommonModeRequest {
    /// Use the parameters stored with the calibration constants
    #[default]
    Stored,
    /// Skip common mode correction entirely
    Disabled,
    Override(CommonModeParams),
}

impl CommonModeRequest {
    /// Resolve against the stored parameters; None means no correction
    pub fn resolve(&self, stored: Option<&CommonModeParams>) -> Option<CommonModeParams> {
        let params = match self {
            Self::Stored => stored.copied(),
            Self::Disabled => None,
            Self::Override(p) => Some(*p),
        };
        params.filter(|p| p.is_enabled())
    }
}

/// Size of one readout bank in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankLayout {
    pub bank_rows: usize,
    pub bank_cols: usize,
}

impl BankLayout {
    pub fn new(bank_rows: usize, bank_cols: usize) -> Self {
        Self {
            bank_rows,
            bank_cols,
        }
    }

    /// Banks must tile the segment exactly
    pub fn validate(&self, rows: usize, cols: usize) -> Result<(), CalibError> {
        if self.bank_rows == 0
            || self.bank_cols == 0
            || rows % self.bank_rows != 0
            || cols % self.bank_cols != 0
        {
            return Err(CalibError::BadBankLayout {
                bank_rows: self.bank_rows,
                bank_cols: self.bank_cols,
                rows,
                cols,
            });
        }
        Ok(())
    }
}

/// Rectangular pixel region `[row0, row1) x [col0, col1)` of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub row0: usize,
    pub row1: usize,
    pub col0: usize,
    pub col1: usize,
}

/// Partitions of one segment for each pass.
///
/// Depends only on geometry, so it is built once per detector and reused every event.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionTable {
    pub rows: usize,
    pub cols: usize,
    pub banks: Vec<Rect>,
    pub row_strips: Vec<Rect>,
    pub col_strips: Vec<Rect>,
}

impl PartitionTable {
    pub fn new(rows: usize, cols: usize, layout: BankLayout) -> Result<Self, CalibError> {
        layout.validate(rows, cols)?;
        let BankLayout {
            bank_rows,
            bank_cols,
        } = layout;

        let mut banks = Vec::new();
        for row0 in (0..rows).step_by(bank_rows) {
            for col0 in (0..cols).step_by(bank_cols) {
                banks.push(Rect {
                    row0,
                    row1: row0 + bank_rows,
                    col0,
                    col1: col0 + bank_cols,
                });
            }
        }

        let mut row_strips = Vec::with_capacity(rows * cols / bank_cols);
        for col0 in (0..cols).step_by(bank_cols) {
            for row in 0..rows {
                row_strips.push(Rect {
                    row0: row,
                    row1: row + 1,
                    col0,
                    col1: col0 + bank_cols,
                });
            }
        }

        let mut col_strips = Vec::with_capacity(rows * cols / bank_rows);
        for row0 in (0..rows).step_by(bank_rows) {
            for col in 0..cols {
                col_strips.push(Rect {
                    row0,
                    row1: row0 + bank_rows,
                    col0: col,
                    col1: col + 1,
                });
            }
        }

        Ok(Self {
            rows,
            cols,
            banks,
            row_strips,
            col_strips,
        })
    }
}

/// Median by partial selection. Even counts give the mean of the two middle values.
pub fn median_in_place(values: &mut [f32]) -> Option<f32> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, f32::total_cmp);
    let upper = *upper;
    if n % 2 == 1 {
        return Some(upper);
    }
    let lower_max = lower.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    Some(0.5 * (lower_max + upper))
}

/// What happened to a single partition
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartitionOutcome {
    Applied(f32),
    TooFewPixels(usize),
    ExceedsLimit(f32),
}

/// Tally of partition outcomes, for diagnostics only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommonModeReport {
    pub applied: usize,
    pub too_few_pixels: usize,
    pub exceeds_limit: usize,
}

impl CommonModeReport {
    fn record(&mut self, outcome: PartitionOutcome) {
        match outcome {
            PartitionOutcome::Applied(_) => self.applied += 1,
            PartitionOutcome::TooFewPixels(_) => self.too_few_pixels += 1,
            PartitionOutcome::ExceedsLimit(_) => self.exceeds_limit += 1,
        }
    }

    pub fn merge(&mut self, other: &CommonModeReport) {
        self.applied += other.applied;
        self.too_few_pixels += other.too_few_pixels;
        self.exceeds_limit += other.exceeds_limit;
    }

    pub fn skipped(&self) -> usize {
        self.too_few_pixels + self.exceeds_limit
    }
}

/// Estimate and subtract the median offset of one partition.
///
/// Only `eligible` pixels enter the median, but every pixel of the partition receives
/// the correction. Too few eligible pixels or a median beyond the limit leave the
/// partition untouched.
pub fn correct_partition(
    mut frame: ArrayViewMut2<f32>,
    eligible: ArrayView2<bool>,
    rect: &Rect,
    params: &CommonModeParams,
    values: &mut Vec<f32>,
) -> PartitionOutcome {
    let (rows, cols) = (rect.row0..rect.row1, rect.col0..rect.col1);
    values.clear();
    Zip::from(frame.slice(s![rows.clone(), cols.clone()]))
        .and(eligible.slice(s![rows.clone(), cols.clone()]))
        .for_each(|&v, &ok| {
            if ok {
                values.push(v);
            }
        });

    let count = values.len();
    if count < params.min_pixel_count {
        return PartitionOutcome::TooFewPixels(count);
    }
    // An empty partition has no median even when min_pixel_count is 0
    let Some(median) = median_in_place(values) else {
        return PartitionOutcome::TooFewPixels(count);
    };
    if median.abs() > params.max_correction {
        return PartitionOutcome::ExceedsLimit(median);
    }
    frame.slice_mut(s![rows, cols]).mapv_inplace(|v| v - median);
    PartitionOutcome::Applied(median)
}

/// CommonModeCorrector removes per-partition median offsets from pedestal-subtracted
/// segments.
///
/// One corrector serves every segment of a detector: the partition table and the
/// median scratch buffer are reused across segments and events.
#[derive(Debug, Clone)]
pub struct CommonModeCorrector {
    table: PartitionTable,
    values: Vec<f32>,
}

impl CommonModeCorrector {
    pub fn new(rows: usize, cols: usize, layout: BankLayout) -> Result<Self, CalibError> {
        let table = PartitionTable::new(rows, cols, layout)?;
        let largest = layout.bank_rows * layout.bank_cols;
        Ok(Self {
            table,
            values: Vec::with_capacity(largest),
        })
    }

    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    /// Run the passes selected by `params.mode` on one `[row][col]` segment
    pub fn correct_segment(
        &mut self,
        mut frame: ArrayViewMut2<f32>,
        eligible: ArrayView2<bool>,
        params: &CommonModeParams,
    ) -> CommonModeReport {
        let mut report = CommonModeReport::default();
        let passes = [
            (ModeBits::BANK, &self.table.banks),
            (ModeBits::ROW, &self.table.row_strips),
            (ModeBits::COLUMN, &self.table.col_strips),
        ];
        for (bit, partitions) in passes {
            if !params.mode.contains(bit) {
                continue;
            }
            for rect in partitions.iter() {
                let outcome = correct_partition(
                    frame.view_mut(),
                    eligible,
                    rect,
                    params,
                    &mut self.values,
                );
                report.record(outcome);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn params(mode: ModeBits, max_correction: f32, min_pixel_count: usize) -> CommonModeParams {
        CommonModeParams::new(mode, max_correction, min_pixel_count)
    }

    #[test]
    fn test_median() {
        assert_eq!(median_in_place(&mut []), None);
        assert_eq!(median_in_place(&mut [3.0]), Some(3.0));
        assert_eq!(median_in_place(&mut [5.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(median_in_place(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median_in_place(&mut [-1.0, 7.0, -1.0, 7.0]), Some(3.0));
    }

    #[test]
    fn test_mode_bits() {
        assert_eq!(ModeBits::from_bits(5).unwrap(), ModeBits::BANK | ModeBits::COLUMN);
        assert!(ModeBits::ALL.contains(ModeBits::ROW));
        assert!(!ModeBits::BANK.contains(ModeBits::ROW));
        assert!(!ModeBits::NONE.contains(ModeBits::NONE));
        assert_eq!(
            ModeBits::from_bits(8),
            Err(CalibError::UnrecognizedModeBits(8))
        );
    }

    #[test]
    fn test_stored_params() {
        let p = CommonModeParams::from_stored(&[7.0, 3.0, 200.0]).unwrap();
        assert_eq!(p.mode, ModeBits::BANK | ModeBits::ROW);
        assert_eq!(p.max_correction, 200.0);
        assert_eq!(p.min_pixel_count, DEFAULT_MIN_PIXEL_COUNT);
        let p = CommonModeParams::from_stored(&[7.0, 1.0, 100.0, 4.0]).unwrap();
        assert_eq!(p.min_pixel_count, 4);
        assert!(CommonModeParams::from_stored(&[7.0, 1.0]).is_err());
        assert!(CommonModeParams::from_stored(&[7.0, 9.0, 100.0]).is_err());
    }

    #[test]
    fn test_request_resolution() {
        let stored = params(ModeBits::BANK, 10.0, 4);
        let other = params(ModeBits::ROW, 5.0, 2);
        assert_eq!(CommonModeRequest::Stored.resolve(Some(&stored)), Some(stored));
        assert_eq!(CommonModeRequest::Stored.resolve(None), None);
        assert_eq!(CommonModeRequest::Disabled.resolve(Some(&stored)), None);
        assert_eq!(
            CommonModeRequest::Override(other).resolve(Some(&stored)),
            Some(other)
        );
        let off = params(ModeBits::NONE, 5.0, 2);
        assert_eq!(CommonModeRequest::Override(off).resolve(None), None);
    }

    #[test]
    fn test_partition_table() {
        let table = PartitionTable::new(4, 6, BankLayout::new(2, 3)).unwrap();
        assert_eq!(table.banks.len(), 4);
        assert_eq!(table.row_strips.len(), 8);
        assert_eq!(table.col_strips.len(), 12);
        assert_eq!(
            table.banks[1],
            Rect {
                row0: 0,
                row1: 2,
                col0: 3,
                col1: 6
            }
        );
        assert!(PartitionTable::new(4, 6, BankLayout::new(3, 3)).is_err());
        assert!(PartitionTable::new(4, 6, BankLayout::new(0, 3)).is_err());
    }

    #[test]
    fn test_uniform_low_gain_frame_scenario() {
        let mut frame: Array2<f32> = array![
            [100.0, 102.0, 98.0, 101.0],
            [99.0, 250.0, 100.0, 103.0],
            [101.0, 97.0, 100.0, 102.0],
            [103.0, 100.0, 99.0, 101.0]
        ];
        let eligible = Array2::from_elem((4, 4), true);
        let mut corrector = CommonModeCorrector::new(4, 4, BankLayout::new(4, 4)).unwrap();
        let report =
            corrector.correct_segment(frame.view_mut(), eligible.view(), &params(ModeBits::BANK, 1000.0, 4));
        assert_eq!(report.applied, 1);
        assert!((frame[[1, 1]] - 149.5).abs() < 1e-4);
        for ((r, c), v) in frame.indexed_iter() {
            if (r, c) != (1, 1) {
                assert!(v.abs() <= 3.5, "pixel ({r}, {c}) = {v}");
            }
        }
    }

    #[test]
    fn test_zero_median_is_idempotent() {
        let original: Array2<f32> = array![[-2.0, 0.0, 0.0, 5.0], [-1.0, 0.0, 0.0, 3.0]];
        let mut frame = original.clone();
        let eligible = Array2::from_elem((2, 4), true);
        let mut corrector = CommonModeCorrector::new(2, 4, BankLayout::new(1, 4)).unwrap();
        corrector.correct_segment(frame.view_mut(), eligible.view(), &params(ModeBits::BANK, 100.0, 1));
        assert_eq!(frame, original);
    }

    #[test]
    fn test_min_pixel_count_boundary() {
        let frame: Array2<f32> = Array2::from_elem((1, 6), 4.0);
        let rect = Rect {
            row0: 0,
            row1: 1,
            col0: 0,
            col1: 6,
        };
        let mut values = Vec::new();
        for (n_eligible, applied) in [(3, false), (4, true), (5, true)] {
            let mut f = frame.clone();
            let eligible = Array2::from_shape_fn((1, 6), |(_, c)| c < n_eligible);
            let outcome = correct_partition(
                f.view_mut(),
                eligible.view(),
                &rect,
                &params(ModeBits::BANK, 100.0, 4),
                &mut values,
            );
            if applied {
                assert_eq!(outcome, PartitionOutcome::Applied(4.0));
                assert!(f.iter().all(|&v| v == 0.0));
            } else {
                assert_eq!(outcome, PartitionOutcome::TooFewPixels(3));
                assert_eq!(f, frame);
            }
        }
    }

    #[test]
    fn test_empty_partition_without_minimum() {
        let frame: Array2<f32> = Array2::from_elem((2, 2), 3.0);
        let rect = Rect {
            row0: 0,
            row1: 2,
            col0: 0,
            col1: 2,
        };
        let mut f = frame.clone();
        let outcome = correct_partition(
            f.view_mut(),
            Array2::from_elem((2, 2), false).view(),
            &rect,
            &params(ModeBits::BANK, 100.0, 0),
            &mut Vec::new(),
        );
        assert_eq!(outcome, PartitionOutcome::TooFewPixels(0));
        assert_eq!(f, frame);
    }

    #[test]
    fn test_max_correction_boundary() {
        let eligible = Array2::from_elem((1, 3), true);
        let rect = Rect {
            row0: 0,
            row1: 1,
            col0: 0,
            col1: 3,
        };
        let mut values = Vec::new();

        let mut at_limit: Array2<f32> = Array2::from_elem((1, 3), -20.0);
        let outcome = correct_partition(
            at_limit.view_mut(),
            eligible.view(),
            &rect,
            &params(ModeBits::BANK, 20.0, 1),
            &mut values,
        );
        assert_eq!(outcome, PartitionOutcome::Applied(-20.0));
        assert!(at_limit.iter().all(|&v| v == 0.0));

        let mut beyond: Array2<f32> = Array2::from_elem((1, 3), 20.5);
        let outcome = correct_partition(
            beyond.view_mut(),
            eligible.view(),
            &rect,
            &params(ModeBits::BANK, 20.0, 1),
            &mut values,
        );
        assert_eq!(outcome, PartitionOutcome::ExceedsLimit(20.5));
        assert!(beyond.iter().all(|&v| v == 20.5));
    }

    #[test]
    fn test_ineligible_pixels_are_corrected_but_not_counted() {
        let mut frame: Array2<f32> = array![[10.0, 10.0, 10.0, 500.0]];
        let eligible = array![[true, true, true, false]];
        let mut corrector = CommonModeCorrector::new(1, 4, BankLayout::new(1, 4)).unwrap();
        corrector.correct_segment(frame.view_mut(), eligible.view(), &params(ModeBits::BANK, 100.0, 3));
        assert_eq!(frame, array![[0.0, 0.0, 0.0, 490.0]]);
    }

    #[test]
    fn test_only_limited_partitions_are_skipped() {
        // Two banks side by side; the right one has an anomalous offset
        let mut frame: Array2<f32> = array![[3.0, 3.0, 90.0, 90.0], [3.0, 3.0, 90.0, 90.0]];
        let eligible = Array2::from_elem((2, 4), true);
        let mut corrector = CommonModeCorrector::new(2, 4, BankLayout::new(2, 2)).unwrap();
        let report =
            corrector.correct_segment(frame.view_mut(), eligible.view(), &params(ModeBits::BANK, 50.0, 1));
        assert_eq!(report.applied, 1);
        assert_eq!(report.exceeds_limit, 1);
        assert_eq!(frame, array![[0.0, 0.0, 90.0, 90.0], [0.0, 0.0, 90.0, 90.0]]);
    }

    #[test]
    fn test_passes_run_bank_then_column() {
        // Running columns before the bank would leave [[-6, 4], [-4, 4]]
        let mut frame: Array2<f32> = array![[1.0, 9.0], [3.0, 9.0]];
        let eligible = Array2::from_elem((2, 2), true);
        let mut corrector = CommonModeCorrector::new(2, 2, BankLayout::new(2, 2)).unwrap();
        let report = corrector.correct_segment(
            frame.view_mut(),
            eligible.view(),
            &params(ModeBits::BANK | ModeBits::COLUMN, 6.0, 1),
        );
        assert_eq!(report.applied, 3);
        assert_eq!(frame, array![[-1.0, 0.0], [1.0, 0.0]]);
    }

    #[test]
    fn test_row_strips_stay_inside_bank_columns() {
        let mut frame: Array2<f32> = array![[1.0, 1.0, 5.0, 5.0], [2.0, 2.0, 7.0, 7.0]];
        let eligible = Array2::from_elem((2, 4), true);
        let mut corrector = CommonModeCorrector::new(2, 4, BankLayout::new(2, 2)).unwrap();
        let report =
            corrector.correct_segment(frame.view_mut(), eligible.view(), &params(ModeBits::ROW, 10.0, 1));
        assert_eq!(report.applied, 4);
        assert!(frame.iter().all(|&v| v == 0.0));
    }
}
