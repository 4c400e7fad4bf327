//! # pixcal
//!
//! pixcal is a calibration pipeline for adaptive-gain pixel detectors (the Jungfrau and
//! Epix10ka families), written in Rust. Every pixel of these detectors switches between
//! several gain ranges from event to event. pixcal decodes the gain range of each pixel
//! from its raw reading, subtracts the matching pedestal, removes the common-mode noise
//! shared by a readout bank, scales by the matching gain and applies a pixel quality mask.
//!
//! ## Installation
//!
//! The only method of install is from source.
//!
//! ### HDF5
//!
//! The `hdf5` feature of libpixcal (always enabled by `pixcal_cli`) reads raw data and
//! calibration constants from HDF5 files and writes the calibrated frames back out. HDF5
//! must be installed for this feature. If the Rust libraries can not find the install,
//! write the following snippet into the file `.cargo/config.toml` in the repository:
//!
//! ```toml
//! [env]
//! HDF5_DIR="/path/to/my/hdf5/install/"
//!
//! [build]
//! rustflags="-C link-args=-Wl,-rpath,/path/to/my/hdf5/install/lib"
//! ```
//!
//! The core pipeline does not depend on HDF5.
//!
//! ### Building & Install
//!
//! To build and install the CLI use `cargo install --path ./pixcal_cli` from the top level
//! of the repository.
//!
//! ## Using the library
//!
//! ```
//! use libpixcal::calib_constants::CalibConstants;
//! use libpixcal::common_mode::{BankLayout, CommonModeRequest};
//! use libpixcal::family::{DetectorFamily, Jungfrau};
//! use libpixcal::pipeline::{Calibration, CalibrationPipeline, ExecutionStrategy};
//! use ndarray::{Array3, Array4};
//!
//! let mut pipeline = CalibrationPipeline::new(
//!     DetectorFamily::from(Jungfrau),
//!     ExecutionStrategy::WholeArray,
//! )
//! .with_bank_layout(BankLayout::new(4, 4));
//! let constants = CalibConstants::new(
//!     Array4::from_elem((3, 1, 4, 4), 100.0),
//!     Array4::from_elem((3, 1, 4, 4), 2.0),
//! );
//! let raw = Array3::<u16>::from_elem((1, 4, 4), 120);
//! let result = pipeline
//!     .calibrate("jungfrau-1", Some(raw.view()), Some(&constants), None, CommonModeRequest::Stored)
//!     .unwrap();
//! if let Calibration::Frame(frame) = result {
//!     assert!(frame.iter().all(|&v| v == 10.0));
//! }
//! ```
//!
//! ## Configuration
//!
//! The CLI is driven by a YAML configuration file:
//!
//! ```yml
//! input_path: None
//! output_path: None
//! family: jungfrau
//! bank_layout: null
//! strategy: whole_array
//! common_mode: stored
//! mask:
//!   status: true
//!   status_bits: 255
//!   status_ranges: null
//!   edge_rows: 0
//!   edge_cols: 0
//!   central_width: 0
//!   neighbor_radius: 0
//! first_run_number: 0
//! last_run_number: 0
//! n_threads: 1
//! ```
//!
//! - `family`: `jungfrau` or `epix10ka`
//! - `bank_layout`: `{bank_rows, bank_cols}` of the common-mode banks; `null` uses the
//! family's native bank (256 x 64 for Jungfrau, 176 x 48 for Epix10ka)
//! - `strategy`: `whole_array` or `per_panel`. Both give identical results; `per_panel`
//! keeps the working buffers at the size of a single panel.
//! - `common_mode`: `stored` uses the parameters stored with the constants, `disabled`
//! skips the correction, `!override` gives explicit parameters
//! (`algorithm`, `mode`, `max_correction`, `min_pixel_count`). `mode` bits: 1 = banks,
//! 2 = rows within a bank, 4 = columns within a bank.
//! - `n_threads`: number of workers the run range is divided amongst. Each worker owns
//! its own pipeline and constants cache.
//!
//! ## HDF5 Data Format
//!
//! Input, one file per run:
//!
//! ```text
//! run_0001.h5
//! raw(dset u16 [event][segment][row][col]) - identity
//! present(dset u8 [event], optional)
//! calib
//! |---- pedestals(dset f32 [range][segment][row][col])
//! |---- gains(dset f32 [range][segment][row][col])
//! |---- offsets(dset f32, optional)
//! |---- status(dset u16, optional)
//! |---- common_mode(dset f64 [algorithm, mode, max_correction, min_pixel_count?], optional)
//! config
//! |---- control_bits(dset u8 [segment][row][col], Epix10ka only)
//! ```
//!
//! Output:
//!
//! ```text
//! run_0001.h5
//! calibrated - identity, min_event, max_event, n_events, n_calibrated, n_missing_raw,
//!              n_missing_constants, cm_applied, cm_skipped, version
//! |---- event_#(dset f32 [segment][row][col])
//! ```
pub mod cache;
pub mod calib_constants;
pub mod common_mode;
pub mod config;
pub mod constants;
pub mod error;
pub mod family;
pub mod gain_range;
#[cfg(feature = "hdf5")]
pub mod hdf_source;
#[cfg(feature = "hdf5")]
pub mod hdf_writer;
pub mod mask;
pub mod pipeline;
pub mod process;
pub mod select;
pub mod source;
pub mod worker_status;
