use fxhash::FxHashMap;
use ndarray::{s, ArrayView3, ArrayView4, ArrayViewMut3, Zip};
use serde::{Deserialize, Serialize};

use super::cache::{CacheEntry, ConstantsCache, WorkBuffers};
use super::calib_constants::CalibConstants;
use super::common_mode::{
    BankLayout, CommonModeCorrector, CommonModeParams, CommonModeReport, CommonModeRequest,
};
use super::constants::{DEFAULT_INVERSE_GAIN, DEFAULT_PEDESTAL, DIAGNOSTIC_PERIOD};
use super::error::CalibError;
use super::family::DetectorFamily;
use super::gain_range::{GainRangeClassifier, GainRangeStatistics};
use super::select::select_by_range_id_into;

/// How a multi-panel frame is walked.
///
/// Both strategies produce bit-identical frames. PerPanel keeps the working buffers
/// at the size of a single panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    #[default]
    WholeArray,
    PerPanel,
}

/// Outcome of one calibration call
#[derive(Debug, Clone, PartialEq)]
pub enum Calibration<'a> {
    /// The calibrated frame, borrowed from the cache's output buffer
    Frame(ArrayView3<'a, f32>),
    /// No raw data for this event
    MissingRaw,
    /// No pedestals or gains for this run
    MissingConstants,
}

impl<'a> Calibration<'a> {
    pub fn frame(&self) -> Option<ArrayView3<'a, f32>> {
        match self {
            Self::Frame(frame) => Some(frame.clone()),
            _ => None,
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, Self::Frame(_))
    }
}

/// The slice of raw data and constants one kernel pass operates on
struct Block<'a> {
    raw: ArrayView3<'a, u16>,
    first_segment: usize,
    pedestal_offset: ArrayView4<'a, f32>,
    inverse_gain: ArrayView4<'a, f32>,
    quality_mask: ArrayView3<'a, u8>,
}

/// classify -> select constants -> subtract pedestal -> common mode -> gain -> mask
fn calibrate_block(
    family: &DetectorFamily,
    cm_eligible: &[bool; 256],
    block: Block,
    work: &mut WorkBuffers,
    mut output: ArrayViewMut3<f32>,
    corrector: &mut CommonModeCorrector,
    params: Option<&CommonModeParams>,
) -> CommonModeReport {
    family.classify_into(block.raw, block.first_segment, work.range_ids.view_mut());
    select_by_range_id_into(
        work.range_ids.view(),
        block.pedestal_offset,
        DEFAULT_PEDESTAL,
        work.pedestal.view_mut(),
    );
    select_by_range_id_into(
        work.range_ids.view(),
        block.inverse_gain,
        DEFAULT_INVERSE_GAIN,
        work.factor.view_mut(),
    );

    let data_mask = family.data_mask();
    Zip::from(&mut output)
        .and(block.raw)
        .and(&work.pedestal)
        .for_each(|o, &code, &ped| *o = (code & data_mask) as f32 - ped);

    let mut report = CommonModeReport::default();
    if let Some(params) = params {
        Zip::from(&mut work.eligible)
            .and(&work.range_ids)
            .and(block.quality_mask)
            .for_each(|e, &id, &m| *e = m != 0 && cm_eligible[id as usize]);
        for (segment, eligible) in output.outer_iter_mut().zip(work.eligible.outer_iter()) {
            report.merge(&corrector.correct_segment(segment, eligible, params));
        }
    }

    Zip::from(&mut output)
        .and(&work.factor)
        .and(block.quality_mask)
        .for_each(|o, &f, &m| *o *= f * m as f32);
    report
}

/// CalibrationPipeline turns raw frames into calibrated frames for one detector family.
///
/// The pipeline owns the constants cache, so each worker should own its own pipeline.
/// Derived constants and the quality mask are taken from the first call for an identity
/// and reused until [`CalibrationPipeline::invalidate_cache`] (or a run change reported
/// through [`CalibrationPipeline::set_run`]) drops them.
#[derive(Debug)]
pub struct CalibrationPipeline {
    family: DetectorFamily,
    layout: BankLayout,
    strategy: ExecutionStrategy,
    cache: ConstantsCache,
    runs: FxHashMap<String, i32>,
    cm_eligible: [bool; 256],
    last_report: CommonModeReport,
}

fn eligibility_table(family: &DetectorFamily) -> [bool; 256] {
    std::array::from_fn(|id| family.is_common_mode_eligible(id as u8))
}

impl CalibrationPipeline {
    pub fn new(family: DetectorFamily, strategy: ExecutionStrategy) -> Self {
        Self {
            layout: family.default_bank_layout(),
            cm_eligible: eligibility_table(&family),
            family,
            strategy,
            cache: ConstantsCache::new(),
            runs: FxHashMap::default(),
            last_report: CommonModeReport::default(),
        }
    }

    /// Override the family's bank size, e.g. for reduced test geometries
    pub fn with_bank_layout(mut self, layout: BankLayout) -> Self {
        self.layout = layout;
        self.cache.clear();
        self
    }

    pub fn family(&self) -> &DetectorFamily {
        &self.family
    }

    /// Swap the family (e.g. new Epix10ka control bits for a run). Clears every cache entry.
    pub fn set_family(&mut self, family: DetectorFamily) {
        self.cm_eligible = eligibility_table(&family);
        self.family = family;
        self.cache.clear();
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    pub fn bank_layout(&self) -> BankLayout {
        self.layout
    }

    pub fn cache(&self) -> &ConstantsCache {
        &self.cache
    }

    /// Common mode tally of the most recent calibrated frame
    pub fn last_common_mode_report(&self) -> CommonModeReport {
        self.last_report
    }

    /// Drop the derived constants for `identity`
    pub fn invalidate_cache(&mut self, identity: &str) -> bool {
        self.cache.invalidate(identity)
    }

    /// Record the run an identity is taking data in. A change of run invalidates its cache.
    pub fn set_run(&mut self, identity: &str, run: i32) -> bool {
        match self.runs.insert(identity.to_string(), run) {
            Some(previous) if previous != run => {
                spdlog::info!(
                    "Run changed from {} to {} for {}, dropping cached constants",
                    previous,
                    run,
                    identity
                );
                self.cache.invalidate(identity)
            }
            _ => false,
        }
    }

    /// Calibrate one raw frame `[segment][row][col]`.
    ///
    /// Absent raw data or constants are reported through [`Calibration`]. Shape errors and
    /// bad geometry are returned as `Err`. `quality_mask` is only read when the cache entry
    /// for `identity` is built; None means every pixel is usable.
    pub fn calibrate(
        &mut self,
        identity: &str,
        raw: Option<ArrayView3<u16>>,
        constants: Option<&CalibConstants>,
        quality_mask: Option<ArrayView3<u8>>,
        common_mode: CommonModeRequest,
    ) -> Result<Calibration<'_>, CalibError> {
        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(Calibration::MissingRaw),
        };
        let constants = match constants {
            Some(constants) => constants,
            None => return Ok(Calibration::MissingConstants),
        };
        if raw.is_empty() {
            return Err(CalibError::EmptyFrame);
        }

        let frame_shape = raw.dim();
        let (n_segments, rows, cols) = frame_shape;
        self.family.validate_shape(raw.shape())?;
        constants.validate(self.family.n_ranges(), raw.shape())?;

        let work_shape = match self.strategy {
            ExecutionStrategy::WholeArray => frame_shape,
            ExecutionStrategy::PerPanel => (1, rows, cols),
        };
        let params = common_mode.resolve(constants.common_mode.as_ref());

        let family = &self.family;
        let layout = self.layout;
        let entry = self.cache.get_or_insert_with(identity, || {
            CacheEntry::new(family, constants, quality_mask, frame_shape, work_shape, layout)
        })?;
        if entry.output.dim() != frame_shape {
            return Err(CalibError::ShapeMismatch {
                name: "raw frame (cached)",
                found: raw.shape().to_vec(),
                expected: entry.output.shape().to_vec(),
            });
        }

        let CacheEntry {
            inverse_gain,
            pedestal_offset,
            quality_mask,
            corrector,
            output,
            work,
            events,
        } = entry;

        let mut report = CommonModeReport::default();
        match self.strategy {
            ExecutionStrategy::WholeArray => {
                let block = Block {
                    raw: raw.view(),
                    first_segment: 0,
                    pedestal_offset: pedestal_offset.view(),
                    inverse_gain: inverse_gain.view(),
                    quality_mask: quality_mask.view(),
                };
                report = calibrate_block(
                    family,
                    &self.cm_eligible,
                    block,
                    work,
                    output.view_mut(),
                    corrector,
                    params.as_ref(),
                );
            }
            ExecutionStrategy::PerPanel => {
                for seg in 0..n_segments {
                    let block = Block {
                        raw: raw.slice(s![seg..seg + 1, .., ..]),
                        first_segment: seg,
                        pedestal_offset: pedestal_offset.slice(s![.., seg..seg + 1, .., ..]),
                        inverse_gain: inverse_gain.slice(s![.., seg..seg + 1, .., ..]),
                        quality_mask: quality_mask.slice(s![seg..seg + 1, .., ..]),
                    };
                    let panel_report = calibrate_block(
                        family,
                        &self.cm_eligible,
                        block,
                        work,
                        output.slice_mut(s![seg..seg + 1, .., ..]),
                        corrector,
                        params.as_ref(),
                    );
                    report.merge(&panel_report);
                }
            }
        }

        *events += 1;
        if *events % DIAGNOSTIC_PERIOD == 0 {
            let ids = family.classify(raw);
            let stats = GainRangeStatistics::from_range_ids(ids.view(), family.n_ranges());
            spdlog::debug!(
                "{} after {} events, gain ranges: {}",
                identity,
                events,
                stats.describe(family.range_names())
            );
            if params.is_some() {
                spdlog::debug!(
                    "{} common mode: {} partitions corrected, {} skipped ({} too few pixels, {} over limit)",
                    identity,
                    report.applied,
                    report.skipped(),
                    report.too_few_pixels,
                    report.exceeds_limit
                );
            }
        }
        self.last_report = report;

        Ok(Calibration::Frame(output.view()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common_mode::ModeBits;
    use crate::constants::JUNGFRAU_BW1;
    use crate::family::Jungfrau;
    use ndarray::{Array3, Array4};

    fn pipeline(strategy: ExecutionStrategy) -> CalibrationPipeline {
        CalibrationPipeline::new(DetectorFamily::from(Jungfrau), strategy)
            .with_bank_layout(BankLayout::new(2, 2))
    }

    fn constants(shape: (usize, usize, usize)) -> CalibConstants {
        let (n, r, c) = shape;
        let peds = Array4::from_shape_fn((3, n, r, c), |(g, s, i, j)| {
            (100 * (g + 1) + 10 * s + i + j) as f32
        });
        CalibConstants::new(peds, Array4::from_elem((3, n, r, c), 2.0))
    }

    #[test]
    fn test_missing_raw_checked_first() {
        let mut p = pipeline(ExecutionStrategy::WholeArray);
        let result = p
            .calibrate("jf", None, None, None, CommonModeRequest::Disabled)
            .unwrap();
        assert_eq!(result, Calibration::MissingRaw);
        assert!(p.cache().is_empty());
    }

    #[test]
    fn test_missing_constants() {
        let mut p = pipeline(ExecutionStrategy::WholeArray);
        let raw = Array3::<u16>::zeros((1, 2, 2));
        let result = p
            .calibrate("jf", Some(raw.view()), None, None, CommonModeRequest::Stored)
            .unwrap();
        assert_eq!(result, Calibration::MissingConstants);
    }

    #[test]
    fn test_empty_frame_is_error() {
        let mut p = pipeline(ExecutionStrategy::WholeArray);
        let raw = Array3::<u16>::zeros((0, 2, 2));
        let c = constants((0, 2, 2));
        let result = p.calibrate("jf", Some(raw.view()), Some(&c), None, CommonModeRequest::Stored);
        assert_eq!(result, Err(CalibError::EmptyFrame));
    }

    #[test]
    fn test_gain_and_pedestal_applied() {
        let mut p = pipeline(ExecutionStrategy::WholeArray);
        let c = constants((1, 2, 2));
        // G0 at 150 over pedestal 100, G1 at 250 over 201, unclassified, G2 at 400 over 302
        let raw = ndarray::array![[[150u16, JUNGFRAU_BW1 | 250], [0x8005, 0xc000 | 400]]];
        let out = p
            .calibrate("jf", Some(raw.view()), Some(&c), None, CommonModeRequest::Disabled)
            .unwrap()
            .frame()
            .unwrap()
            .to_owned();
        assert_eq!(out, ndarray::array![[[25.0, 24.5], [5.0, 49.0]]]);
    }

    #[test]
    fn test_frame_outlives_raw_buffer() {
        let c = constants((2, 2, 2));
        for strategy in [ExecutionStrategy::WholeArray, ExecutionStrategy::PerPanel] {
            let mut p = pipeline(strategy);
            let frame = {
                let raw = Array3::<u16>::from_elem((2, 2, 2), 300);
                p.calibrate("jf", Some(raw.view()), Some(&c), None, CommonModeRequest::Disabled)
                    .unwrap()
                    .frame()
                    .unwrap()
            };
            assert_eq!(frame[[0, 0, 0]], 100.0);
            assert_eq!(frame[[1, 1, 1]], 94.0);
        }
    }

    #[test]
    fn test_quality_mask_zeroes_pixels() {
        let mut p = pipeline(ExecutionStrategy::WholeArray);
        let c = constants((1, 2, 2));
        let raw = Array3::<u16>::from_elem((1, 2, 2), 500);
        let mask = ndarray::array![[[1u8, 0], [1, 1]]];
        let out = p
            .calibrate("jf", Some(raw.view()), Some(&c), Some(mask.view()), CommonModeRequest::Disabled)
            .unwrap()
            .frame()
            .unwrap()
            .to_owned();
        assert_eq!(out[[0, 0, 1]], 0.0);
        assert_eq!(out[[0, 0, 0]], 200.0);
    }

    #[test]
    fn test_stored_common_mode_used_by_default() {
        let shape = (1, 2, 2);
        let c = constants(shape).with_common_mode(CommonModeParams::new(ModeBits::BANK, 100.0, 1));
        // residuals 3, 5, 7, 9 above pedestal -> median 6
        let raw = Array3::from_shape_fn(shape, |(_, i, j)| (100 + i + j + 3 + 2 * (2 * i + j)) as u16);

        let mut stored = pipeline(ExecutionStrategy::WholeArray);
        let with_cm = stored
            .calibrate("jf", Some(raw.view()), Some(&c), None, CommonModeRequest::Stored)
            .unwrap()
            .frame()
            .unwrap()
            .to_owned();
        assert_eq!(stored.last_common_mode_report().applied, 1);

        let mut disabled = pipeline(ExecutionStrategy::WholeArray);
        let without_cm = disabled
            .calibrate("jf", Some(raw.view()), Some(&c), None, CommonModeRequest::Disabled)
            .unwrap()
            .frame()
            .unwrap()
            .to_owned();
        assert_eq!(disabled.last_common_mode_report(), CommonModeReport::default());

        Zip::from(&with_cm)
            .and(&without_cm)
            .for_each(|&a, &b| assert_eq!(a, b - 3.0));
    }

    #[test]
    fn test_set_run_invalidates_on_change() {
        let mut p = pipeline(ExecutionStrategy::WholeArray);
        let c = constants((1, 2, 2));
        let raw = Array3::<u16>::zeros((1, 2, 2));
        assert!(!p.set_run("jf", 1));
        p.calibrate("jf", Some(raw.view()), Some(&c), None, CommonModeRequest::Disabled)
            .unwrap();
        assert!(!p.set_run("jf", 1));
        assert!(p.cache().contains("jf"));
        assert!(p.set_run("jf", 2));
        assert!(!p.cache().contains("jf"));
    }

    #[test]
    fn test_cached_shape_must_match() {
        let mut p = pipeline(ExecutionStrategy::WholeArray);
        let small = constants((1, 2, 2));
        let raw = Array3::<u16>::zeros((1, 2, 2));
        p.calibrate("jf", Some(raw.view()), Some(&small), None, CommonModeRequest::Disabled)
            .unwrap();

        let big = constants((2, 2, 2));
        let raw = Array3::<u16>::zeros((2, 2, 2));
        let result = p.calibrate("jf", Some(raw.view()), Some(&big), None, CommonModeRequest::Disabled);
        assert!(matches!(result, Err(CalibError::ShapeMismatch { .. })));
    }
}
