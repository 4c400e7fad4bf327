use fxhash::FxHashMap;
use std::collections::hash_map::Entry;
use ndarray::{Array3, Array4, ArrayView3};

use super::calib_constants::CalibConstants;
use super::common_mode::{BankLayout, CommonModeCorrector};
use super::constants::UNCLASSIFIED;
use super::error::CalibError;
use super::family::DetectorFamily;
use super::gain_range::GainRangeClassifier;

/// Per-event working arrays, sized either to the full frame or to a single panel
#[derive(Debug, Clone)]
pub struct WorkBuffers {
    pub range_ids: Array3<u8>,
    pub pedestal: Array3<f32>,
    pub factor: Array3<f32>,
    pub eligible: Array3<bool>,
}

impl WorkBuffers {
    pub fn new(shape: (usize, usize, usize)) -> Self {
        Self {
            range_ids: Array3::from_elem(shape, UNCLASSIFIED),
            pedestal: Array3::zeros(shape),
            factor: Array3::zeros(shape),
            eligible: Array3::from_elem(shape, false),
        }
    }

    fn size_bytes(&self) -> usize {
        self.range_ids.len() * (1 + 4 + 4 + 1)
    }
}

/// Derived constants and scratch space for one detector identity.
///
/// Built on the first event of a run and reused for every following event until the
/// cache entry is invalidated.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub inverse_gain: Array4<f32>,
    pub pedestal_offset: Array4<f32>,
    pub quality_mask: Array3<u8>,
    pub corrector: CommonModeCorrector,
    pub output: Array3<f32>,
    pub work: WorkBuffers,
    /// Events calibrated with this entry; drives periodic diagnostics only
    pub events: u64,
}

impl CacheEntry {
    /// Derive everything the per-event path needs from the run's constants.
    ///
    /// `work_shape` is the shape of the working buffers: the full frame, or a single
    /// panel when calibrating panel by panel.
    pub fn new(
        family: &DetectorFamily,
        constants: &CalibConstants,
        quality_mask: Option<ArrayView3<u8>>,
        frame_shape: (usize, usize, usize),
        work_shape: (usize, usize, usize),
        layout: BankLayout,
    ) -> Result<Self, CalibError> {
        let (_, rows, cols) = frame_shape;
        let quality_mask = match quality_mask {
            Some(mask) => {
                if mask.dim() != frame_shape {
                    return Err(CalibError::ShapeMismatch {
                        name: "quality mask",
                        found: mask.shape().to_vec(),
                        expected: vec![frame_shape.0, rows, cols],
                    });
                }
                mask.to_owned()
            }
            None => Array3::ones(frame_shape),
        };
        let corrector = CommonModeCorrector::new(rows, cols, layout)?;
        Ok(Self {
            inverse_gain: constants.inverse_gains(),
            pedestal_offset: constants.pedestal_offsets(family.applies_offsets()),
            quality_mask,
            corrector,
            output: Array3::zeros(frame_shape),
            work: WorkBuffers::new(work_shape),
            events: 0,
        })
    }

    /// Approximate heap footprint of the entry
    pub fn size_bytes(&self) -> usize {
        (self.inverse_gain.len() + self.pedestal_offset.len() + self.output.len()) * 4
            + self.quality_mask.len()
            + self.work.size_bytes()
    }
}

/// ConstantsCache holds derived calibration arrays per detector identity.
///
/// The cache is owned by whoever runs the events (typically one pipeline per worker).
/// It is not synchronized; a cache shared between threads must be wrapped in a mutex.
/// Entries are never refreshed automatically, the owner calls [`ConstantsCache::invalidate`]
/// when the constants of an identity change.
#[derive(Debug, Default)]
pub struct ConstantsCache {
    entries: FxHashMap<String, CacheEntry>,
    builds: u64,
}

impl ConstantsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `identity`, building it with `build` on first use
    pub fn get_or_insert_with<F, E>(&mut self, identity: &str, build: F) -> Result<&mut CacheEntry, E>
    where
        F: FnOnce() -> Result<CacheEntry, E>,
    {
        let entry = match self.entries.entry(identity.to_string()) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let entry = build()?;
                self.builds += 1;
                spdlog::debug!(
                    "Created constants cache entry for {} ({})",
                    identity,
                    human_bytes::human_bytes(entry.size_bytes() as f64)
                );
                vacant.insert(entry)
            }
        };
        Ok(entry)
    }

    pub fn get(&self, identity: &str) -> Option<&CacheEntry> {
        self.entries.get(identity)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    /// Drop the entry so the next access rebuilds it. Returns whether anything was dropped.
    pub fn invalidate(&mut self, identity: &str) -> bool {
        let dropped = self.entries.remove(identity).is_some();
        if dropped {
            spdlog::debug!("Invalidated constants cache entry for {}", identity);
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries built over the cache's lifetime
    pub fn builds(&self) -> u64 {
        self.builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::Jungfrau;

    fn entry() -> Result<CacheEntry, CalibError> {
        let constants = CalibConstants::new(
            Array4::from_elem((3, 1, 2, 2), 10.0),
            Array4::from_elem((3, 1, 2, 2), 4.0),
        );
        CacheEntry::new(
            &DetectorFamily::from(Jungfrau),
            &constants,
            None,
            (1, 2, 2),
            (1, 2, 2),
            BankLayout::new(2, 2),
        )
    }

    #[test]
    fn test_builds_once_per_identity() {
        let mut cache = ConstantsCache::new();
        let mut calls = 0;
        for _ in 0..3 {
            let e = cache
                .get_or_insert_with("jungfrau-a", || {
                    calls += 1;
                    entry()
                })
                .unwrap();
            assert!(e.inverse_gain.iter().all(|&v| v == 0.25));
        }
        assert_eq!(calls, 1);
        assert_eq!(cache.builds(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_forces_rebuild() {
        let mut cache = ConstantsCache::new();
        cache.get_or_insert_with("jungfrau-a", entry).unwrap();
        cache.get_or_insert_with("jungfrau-b", entry).unwrap();
        assert!(cache.invalidate("jungfrau-a"));
        assert!(!cache.invalidate("jungfrau-a"));
        assert!(!cache.contains("jungfrau-a"));
        assert!(cache.contains("jungfrau-b"));
        cache.get_or_insert_with("jungfrau-a", entry).unwrap();
        assert_eq!(cache.builds(), 3);
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let mut cache = ConstantsCache::new();
        let result = cache.get_or_insert_with("bad", || Err::<CacheEntry, _>(CalibError::EmptyFrame));
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.builds(), 0);
    }

    #[test]
    fn test_mask_shape_checked() {
        let constants = CalibConstants::new(Array4::zeros((3, 1, 2, 2)), Array4::ones((3, 1, 2, 2)));
        let mask = Array3::<u8>::ones((1, 2, 3));
        let result = CacheEntry::new(
            &DetectorFamily::from(Jungfrau),
            &constants,
            Some(mask.view()),
            (1, 2, 2),
            (1, 2, 2),
            BankLayout::new(2, 2),
        );
        assert!(matches!(result, Err(CalibError::ShapeMismatch { .. })));
    }
}
