use ndarray::{Array3, ArrayView3};

use super::common_mode::{CommonModeReport, CommonModeRequest};
use super::config::Config;
use super::error::ProcessorError;
use super::family::{DetectorFamily, Epix10ka, FamilyKind};
use super::gain_range::GainRangeClassifier;
use super::mask::{build_quality_mask, MaskOptions};
use super::pipeline::{Calibration, CalibrationPipeline};
use super::source::{CalibStore, DataSource};

#[cfg(feature = "hdf5")]
use std::sync::mpsc::Sender;

#[cfg(feature = "hdf5")]
use super::hdf_source::HDF5Source;
#[cfg(feature = "hdf5")]
use super::hdf_writer::HDFWriter;
#[cfg(feature = "hdf5")]
use super::worker_status::{BarColor, WorkerStatus};

/// Per-run calibration settings
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub common_mode: CommonModeRequest,
    pub mask: MaskOptions,
}

/// Where calibrated frames go
pub trait FrameSink {
    fn write_frame(&mut self, event: usize, frame: ArrayView3<f32>) -> Result<(), ProcessorError>;
}

impl FrameSink for Vec<(usize, Array3<f32>)> {
    fn write_frame(&mut self, event: usize, frame: ArrayView3<f32>) -> Result<(), ProcessorError> {
        self.push((event, frame.to_owned()));
        Ok(())
    }
}

/// Event tallies of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub run_number: i32,
    pub events: usize,
    pub calibrated: usize,
    pub missing_raw: usize,
    pub missing_constants: usize,
    pub common_mode: CommonModeReport,
}

impl RunSummary {
    pub fn skipped(&self) -> usize {
        self.missing_raw + self.missing_constants
    }
}

/// Calibrate every event of one run, handing calibrated frames to `sink`.
///
/// Events without raw data or without constants are counted and skipped. Any other
/// failure aborts the run. `progress` receives the completed fraction roughly every 1%.
pub fn calibrate_run<D, C, W, P>(
    pipeline: &mut CalibrationPipeline,
    source: &D,
    store: &C,
    run_number: i32,
    options: &RunOptions,
    sink: &mut W,
    mut progress: P,
) -> Result<RunSummary, ProcessorError>
where
    D: DataSource,
    C: CalibStore,
    W: FrameSink,
    P: FnMut(f32) -> Result<(), ProcessorError>,
    ProcessorError: From<D::Error> + From<C::Error>,
{
    let identity = source.identity().to_string();
    pipeline.set_run(&identity, run_number);

    let mut constants = store.constants(&identity, run_number)?;
    if pipeline.family().kind() == FamilyKind::Epix10ka {
        match store.control_bits(&identity, run_number)? {
            Some(bits) => pipeline.set_family(DetectorFamily::from(Epix10ka::new(bits))),
            None => {
                spdlog::warn!(
                    "No pixel control bits for {} in run {}, gain ranges cannot be decoded",
                    identity,
                    run_number
                );
                constants = None;
            }
        }
    }

    let quality_mask = match &constants {
        Some(c) => {
            let shape = c.pedestals.shape();
            let frame_shape = (shape[1], shape[2], shape[3]);
            let status = store.pixel_status(&identity, run_number)?;
            let mask = build_quality_mask(
                frame_shape,
                pipeline.family().asic_shape(),
                status.as_ref().map(|s| s.view()),
                None,
                &options.mask,
            )?;
            let bad = mask.iter().filter(|&&m| m == 0).count();
            spdlog::info!(
                "Quality mask for {} excludes {} of {} pixels",
                identity,
                bad,
                mask.len()
            );
            Some(mask)
        }
        None => {
            spdlog::warn!(
                "No calibration constants for {} in run {}, every event will be skipped",
                identity,
                run_number
            );
            None
        }
    };

    let n_events = source.n_events();
    let mut summary = RunSummary {
        run_number,
        events: n_events,
        ..Default::default()
    };
    let flush_val = (n_events / 100).max(1);
    for event in 0..n_events {
        let raw = source.raw_frame(event)?;
        let result = pipeline.calibrate(
            &identity,
            raw.as_ref().map(|r| r.view()),
            constants.as_ref(),
            quality_mask.as_ref().map(|m| m.view()),
            options.common_mode,
        )?;
        match result {
            Calibration::Frame(frame) => {
                sink.write_frame(event, frame)?;
                summary.calibrated += 1;
                summary.common_mode.merge(&pipeline.last_common_mode_report());
            }
            Calibration::MissingRaw => summary.missing_raw += 1,
            Calibration::MissingConstants => summary.missing_constants += 1,
        }
        if (event + 1) % flush_val == 0 {
            progress((event + 1) as f32 / n_events as f32)?;
        }
    }

    spdlog::info!(
        "Run {}: calibrated {} of {} events ({} without raw data, {} without constants)",
        run_number,
        summary.calibrated,
        summary.events,
        summary.missing_raw,
        summary.missing_constants
    );
    Ok(summary)
}

/// Calibrate one run file and write the calibrated frames.
///
/// This is the main loop of a worker; the pipeline (and its cache) is owned by the worker
/// and carried from run to run.
#[cfg(feature = "hdf5")]
pub fn process_run(
    config: &Config,
    pipeline: &mut CalibrationPipeline,
    run_number: i32,
    tx: &Sender<WorkerStatus>,
    worker_id: &usize,
) -> Result<RunSummary, ProcessorError> {
    let source = HDF5Source::open(&config.get_run_file(run_number)?)?;
    let output_path = config.get_output_file(run_number)?;
    let mut writer = HDFWriter::new(&output_path, source.identity())?;
    spdlog::info!(
        "Run {} has {} events of shape {:?}",
        run_number,
        source.n_events(),
        source.frame_shape()
    );

    tx.send(WorkerStatus::new(
        0.0,
        run_number,
        *worker_id,
        BarColor::CYAN,
    ))?;
    let summary = calibrate_run(
        pipeline,
        &source,
        &source,
        run_number,
        &config.run_options(),
        &mut writer,
        |progress| {
            tx.send(WorkerStatus::new(
                progress,
                run_number,
                *worker_id,
                BarColor::CYAN,
            ))?;
            Ok(())
        },
    )?;
    writer.close(&summary)?;

    let color = if summary.skipped() == 0 {
        BarColor::GREEN
    } else {
        BarColor::MAGENTA
    };
    tx.send(WorkerStatus::new(1.0, run_number, *worker_id, color))?;
    Ok(summary)
}

/// The function to be called by a separate thread.
/// Processes the whole run range of the config with a single pipeline
#[cfg(feature = "hdf5")]
pub fn process(
    config: Config,
    tx: Sender<WorkerStatus>,
    worker_id: usize,
) -> Result<(), ProcessorError> {
    let subset = (config.first_run_number..(config.last_run_number + 1)).collect();
    process_subset(config, tx, worker_id, subset)
}

/// Process a subset of runs
#[cfg(feature = "hdf5")]
pub fn process_subset(
    config: Config,
    tx: Sender<WorkerStatus>,
    worker_id: usize,
    subset: Vec<i32>,
) -> Result<(), ProcessorError> {
    let mut pipeline = config.build_pipeline();
    for run in subset {
        if config.does_run_exist(run) {
            spdlog::info!("Processing run {}...", run);
            process_run(&config, &mut pipeline, run, &tx, &worker_id)?;
            spdlog::info!("Finished processing run {}.", run);
        } else {
            spdlog::info!("Run {} does not exist, skipping...", run);
        }
    }
    Ok(())
}

/// Divide a run range in to a set of subranges (per thread/worker)
pub fn create_subsets(config: &Config) -> Vec<Vec<i32>> {
    let mut subsets: Vec<Vec<i32>> = vec![Vec::new(); config.n_threads.max(1) as usize];
    let n_subsets = subsets.len();

    for (idx, run) in (config.first_run_number..(config.last_run_number + 1)).enumerate() {
        subsets[idx % n_subsets].push(run)
    }

    subsets.retain(|s| !s.is_empty());
    subsets
}
