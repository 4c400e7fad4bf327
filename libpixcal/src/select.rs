use ndarray::{Array3, ArrayView3, ArrayView4, ArrayViewMut3, Axis, Zip};

use super::error::CalibError;
use super::gain_range::GainRangeMasks;

fn check_constants_shape(
    constants: &ArrayView4<f32>,
    n_ranges: usize,
    frame_shape: &[usize],
) -> Result<(), CalibError> {
    let mut expected = vec![n_ranges];
    expected.extend_from_slice(frame_shape);
    if constants.shape() != expected.as_slice() {
        return Err(CalibError::ShapeMismatch {
            name: "per-range constants",
            found: constants.shape().to_vec(),
            expected,
        });
    }
    Ok(())
}

/// Per-pixel multiplexer driven by range ids.
///
/// `constants` is `[range][segment][row][col]`; pixels whose id is not a valid range get
/// `default`. Each range is one branch-free select pass over the whole frame.
pub fn select_by_range_id_into(
    ids: ArrayView3<u8>,
    constants: ArrayView4<f32>,
    default: f32,
    mut out: ArrayViewMut3<f32>,
) {
    out.fill(default);
    for (range, plane) in constants.axis_iter(Axis(0)).enumerate() {
        let range = range as u8;
        Zip::from(&mut out)
            .and(ids)
            .and(plane)
            .for_each(|o, &id, &c| *o = if id == range { c } else { *o });
    }
}

/// Allocating form of [`select_by_range_id_into`] with shape validation
pub fn select_by_range_id(
    ids: ArrayView3<u8>,
    constants: ArrayView4<f32>,
    default: f32,
) -> Result<Array3<f32>, CalibError> {
    check_constants_shape(&constants, constants.shape()[0], ids.shape())?;
    let mut out = Array3::<f32>::zeros(ids.raw_dim());
    select_by_range_id_into(ids, constants, default, out.view_mut());
    Ok(out)
}

/// Per-pixel multiplexer driven by boolean range masks.
///
/// Equivalent to a numpy-style `select(masks, constants, default)`: when more than one
/// mask is set for a pixel the first one wins, and pixels in no mask get `default`.
pub fn select_constants(
    masks: &GainRangeMasks,
    constants: ArrayView4<f32>,
    default: f32,
) -> Result<Array3<f32>, CalibError> {
    let first = match masks.get(0) {
        Some(m) => m,
        None => {
            return Err(CalibError::ShapeMismatch {
                name: "gain range masks",
                found: vec![0],
                expected: vec![constants.shape()[0]],
            })
        }
    };
    check_constants_shape(&constants, masks.len(), first.shape())?;

    let mut out = Array3::<f32>::from_elem(first.raw_dim(), default);
    // Reverse so that earlier ranges overwrite later ones
    for (range, mask) in masks.views().into_iter().enumerate().rev() {
        if mask.shape() != first.shape() {
            return Err(CalibError::ShapeMismatch {
                name: "gain range mask",
                found: mask.shape().to_vec(),
                expected: first.shape().to_vec(),
            });
        }
        Zip::from(&mut out)
            .and(&mask)
            .and(constants.index_axis(Axis(0), range))
            .for_each(|o, &m, &c| *o = if m { c } else { *o });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::UNCLASSIFIED;
    use ndarray::{array, Array4};

    fn constants() -> Array4<f32> {
        // 3 ranges over a 1x2x2 frame, value = 10 * range + pixel
        Array4::from_shape_fn((3, 1, 2, 2), |(g, _, r, c)| (10 * g + 2 * r + c) as f32)
    }

    #[test]
    fn test_select_by_range_id() {
        let ids = array![[[0u8, 1], [2, UNCLASSIFIED]]];
        let out = select_by_range_id(ids.view(), constants().view(), -1.0).unwrap();
        assert_eq!(out, array![[[0.0, 11.0], [22.0, -1.0]]]);
    }

    #[test]
    fn test_select_by_range_id_shape_mismatch() {
        let ids = Array3::<u8>::zeros((1, 2, 3));
        let result = select_by_range_id(ids.view(), constants().view(), 0.0);
        assert!(matches!(result, Err(CalibError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_masks_and_ids_agree() {
        let ids = array![[[2u8, UNCLASSIFIED], [0, 1]]];
        let masks = GainRangeMasks::from_range_ids(ids.view(), 3);
        let by_mask = select_constants(&masks, constants().view(), 1.0).unwrap();
        let by_id = select_by_range_id(ids.view(), constants().view(), 1.0).unwrap();
        assert_eq!(by_mask, by_id);
    }

    #[test]
    fn test_overlapping_masks_first_match_wins() {
        let all = Array3::from_elem((1, 2, 2), true);
        let none = Array3::from_elem((1, 2, 2), false);
        let masks = GainRangeMasks::new(vec![none, all.clone(), all]);
        let out = select_constants(&masks, constants().view(), 0.0).unwrap();
        assert_eq!(out, array![[[10.0, 11.0], [12.0, 13.0]]]);
    }

    #[test]
    fn test_mask_count_must_match_ranges() {
        let masks = GainRangeMasks::new(vec![Array3::from_elem((1, 2, 2), true)]);
        let result = select_constants(&masks, constants().view(), 0.0);
        assert!(matches!(result, Err(CalibError::ShapeMismatch { .. })));
    }
}
