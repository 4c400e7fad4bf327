use ndarray::{s, Array3, ArrayView3, ArrayView4, Axis, Zip};
use serde::{Deserialize, Serialize};

use super::error::CalibError;

/// Controls how the per-run quality mask is assembled. 1 = usable pixel, 0 = excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskOptions {
    /// Exclude pixels with a bad status
    pub status: bool,
    /// Status bits that mark a pixel as bad
    pub status_bits: u16,
    /// Gain ranges whose status is merged; None merges all of them
    pub status_ranges: Option<Vec<usize>>,
    pub edge_rows: usize,
    pub edge_cols: usize,
    /// Rows and columns excluded on each side of the internal ASIC boundaries
    pub central_width: usize,
    /// Rhombus radius excluded around every bad pixel
    pub neighbor_radius: usize,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            status: true,
            status_bits: 0o377,
            status_ranges: None,
            edge_rows: 0,
            edge_cols: 0,
            central_width: 0,
            neighbor_radius: 0,
        }
    }
}

/// Good/bad mask from pixel status `[range][segment][row][col]`.
///
/// A pixel is bad when any merged gain range reports one of `status_bits`.
pub fn status_as_mask(
    status: ArrayView4<u16>,
    status_bits: u16,
    ranges: Option<&[usize]>,
) -> Array3<u8> {
    let shape = status.raw_dim();
    let mut mask = Array3::<u8>::ones((shape[1], shape[2], shape[3]));
    for (range, plane) in status.axis_iter(Axis(0)).enumerate() {
        if let Some(selected) = ranges {
            if !selected.contains(&range) {
                continue;
            }
        }
        Zip::from(&mut mask).and(plane).for_each(|m, &st| {
            if st & status_bits != 0 {
                *m = 0;
            }
        });
    }
    mask
}

/// Mask `rows` and `cols` pixels along every edge of each segment
pub fn mask_edges(shape: (usize, usize, usize), rows: usize, cols: usize) -> Array3<u8> {
    let (_, n_rows, n_cols) = shape;
    let mut mask = Array3::<u8>::ones(shape);
    let rows = rows.min(n_rows);
    let cols = cols.min(n_cols);
    if rows > 0 {
        mask.slice_mut(s![.., ..rows, ..]).fill(0);
        mask.slice_mut(s![.., n_rows - rows.., ..]).fill(0);
    }
    if cols > 0 {
        mask.slice_mut(s![.., .., ..cols]).fill(0);
        mask.slice_mut(s![.., .., n_cols - cols..]).fill(0);
    }
    mask
}

/// Mask `width` rows and columns on each side of the internal ASIC boundaries
pub fn mask_central(
    shape: (usize, usize, usize),
    asic_shape: (usize, usize),
    width: usize,
) -> Array3<u8> {
    let (_, n_rows, n_cols) = shape;
    let (asic_rows, asic_cols) = asic_shape;
    let mut mask = Array3::<u8>::ones(shape);
    if width == 0 {
        return mask;
    }
    if asic_rows > 0 {
        for edge in (asic_rows..n_rows).step_by(asic_rows) {
            let lo = edge.saturating_sub(width);
            let hi = (edge + width).min(n_rows);
            mask.slice_mut(s![.., lo..hi, ..]).fill(0);
        }
    }
    if asic_cols > 0 {
        for edge in (asic_cols..n_cols).step_by(asic_cols) {
            let lo = edge.saturating_sub(width);
            let hi = (edge + width).min(n_cols);
            mask.slice_mut(s![.., .., lo..hi]).fill(0);
        }
    }
    mask
}

/// Grow every bad pixel into a rhombus of the given radius, within its own segment
pub fn mask_neighbors(mask: ArrayView3<u8>, radius: usize) -> Array3<u8> {
    let mut out = mask.to_owned();
    if radius == 0 {
        return out;
    }
    let (_, n_rows, n_cols) = mask.dim();
    let r = radius as isize;
    for ((seg, row, col), &m) in mask.indexed_iter() {
        if m != 0 {
            continue;
        }
        for dr in -r..=r {
            let rr = row as isize + dr;
            if rr < 0 || rr >= n_rows as isize {
                continue;
            }
            let reach = r - dr.abs();
            let c_lo = (col as isize - reach).max(0) as usize;
            let c_hi = (col as isize + reach).min(n_cols as isize - 1) as usize;
            out.slice_mut(s![seg, rr as usize, c_lo..=c_hi]).fill(0);
        }
    }
    out
}

/// Pixel-wise AND of two masks
pub fn merge_masks(a: ArrayView3<u8>, b: ArrayView3<u8>) -> Result<Array3<u8>, CalibError> {
    if a.shape() != b.shape() {
        return Err(CalibError::ShapeMismatch {
            name: "mask",
            found: b.shape().to_vec(),
            expected: a.shape().to_vec(),
        });
    }
    let mut out = a.to_owned();
    Zip::from(&mut out)
        .and(b)
        .for_each(|o, &v| *o = u8::from(*o != 0 && v != 0));
    Ok(out)
}

/// Assemble the quality mask for one run from status, geometry and an optional user mask
pub fn build_quality_mask(
    shape: (usize, usize, usize),
    asic_shape: (usize, usize),
    status: Option<ArrayView4<u16>>,
    user_mask: Option<ArrayView3<u8>>,
    options: &MaskOptions,
) -> Result<Array3<u8>, CalibError> {
    let mut mask = Array3::<u8>::ones(shape);

    if let (true, Some(status)) = (options.status, status) {
        let frame_shape = &status.shape()[1..];
        if frame_shape != [shape.0, shape.1, shape.2] {
            return Err(CalibError::ShapeMismatch {
                name: "pixel status",
                found: status.shape().to_vec(),
                expected: vec![status.shape()[0], shape.0, shape.1, shape.2],
            });
        }
        let ranges = options.status_ranges.as_deref();
        mask = status_as_mask(status, options.status_bits, ranges);
    }

    if options.neighbor_radius > 0 {
        mask = mask_neighbors(mask.view(), options.neighbor_radius);
    }

    if options.edge_rows > 0 || options.edge_cols > 0 {
        let edges = mask_edges(shape, options.edge_rows, options.edge_cols);
        mask = merge_masks(mask.view(), edges.view())?;
    }

    if options.central_width > 0 {
        let central = mask_central(shape, asic_shape, options.central_width);
        mask = merge_masks(mask.view(), central.view())?;
    }

    if let Some(user) = user_mask {
        mask = merge_masks(mask.view(), user)?;
    }

    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array4};

    #[test]
    fn test_status_merges_selected_ranges() {
        let mut status = Array4::<u16>::zeros((3, 1, 2, 2));
        status[[0, 0, 0, 0]] = 1;
        status[[2, 0, 1, 1]] = 4;
        status[[1, 0, 0, 1]] = 0o400; // outside the status bits
        let all = status_as_mask(status.view(), 0o377, None);
        assert_eq!(all, array![[[0u8, 1], [1, 0]]]);
        let first_two = status_as_mask(status.view(), 0o377, Some(&[0, 1]));
        assert_eq!(first_two, array![[[0u8, 1], [1, 1]]]);
    }

    #[test]
    fn test_edges() {
        let mask = mask_edges((2, 4, 5), 1, 2);
        assert_eq!(mask.sum(), 2 * 2);
        assert_eq!(mask[[1, 1, 2]], 1);
        assert_eq!(mask[[1, 1, 1]], 0);
    }

    #[test]
    fn test_central() {
        let mask = mask_central((1, 4, 8), (2, 4), 1);
        let expected_rows = [1, 0, 0, 1];
        for (row, &good) in expected_rows.iter().enumerate() {
            assert_eq!(mask[[0, row, 0]], good);
        }
        assert_eq!(mask[[0, 0, 3]], 0);
        assert_eq!(mask[[0, 0, 4]], 0);
        assert_eq!(mask[[0, 0, 5]], 1);
    }

    #[test]
    fn test_neighbors_rhombus() {
        let mut mask = Array3::<u8>::ones((2, 5, 5));
        mask[[0, 2, 2]] = 0;
        let grown = mask_neighbors(mask.view(), 1);
        assert_eq!(grown.index_axis(Axis(0), 0).iter().filter(|&&v| v == 0).count(), 5);
        assert_eq!(grown[[0, 1, 1]], 1);
        assert_eq!(grown.index_axis(Axis(0), 1).sum(), 25);
    }

    #[test]
    fn test_build_quality_mask() {
        let mut status = Array4::<u16>::zeros((1, 1, 4, 4));
        status[[0, 0, 2, 2]] = 2;
        let mut user = Array3::<u8>::ones((1, 4, 4));
        user[[0, 1, 2]] = 0;
        let options = MaskOptions {
            edge_rows: 1,
            ..Default::default()
        };
        let mask = build_quality_mask((1, 4, 4), (2, 2), Some(status.view()), Some(user.view()), &options)
            .unwrap();
        assert_eq!(
            mask,
            array![[[0u8, 0, 0, 0], [1, 1, 0, 1], [1, 1, 0, 1], [0, 0, 0, 0]]]
        );
    }

    #[test]
    fn test_merge_shape_mismatch() {
        let a = Array3::<u8>::ones((1, 2, 2));
        let b = Array3::<u8>::ones((1, 2, 3));
        assert!(merge_masks(a.view(), b.view()).is_err());
    }
}
