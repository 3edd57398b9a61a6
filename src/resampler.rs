use nalgebra::{Matrix3, Vector3};
use ndarray::{Array3, Zip};
use tracing::debug;

use crate::enums::PixelKind;
use crate::error::Result;
use crate::interpolator::{BSplineInterpolator, Interpolator};
use crate::volume::Volume;

/// Value given to output voxels that map outside the source volume.
pub const DEFAULT_PIXEL_VALUE: f64 = 0.0;

/// Resamples `source` onto an isotropic grid expressed in `reference`'s frame.
///
/// The output takes the reference's origin and direction, an isotropic
/// spacing equal to the reference's finest spacing, and a size covering the
/// reference's extent (first two axes truncated, third rounded). Each output
/// voxel is mapped to its physical point and sampled from `source` with a
/// quintic B-spline; no transform is applied beyond the change of grid.
///
/// Samples are stored as 16-bit unsigned values: interpolated values are
/// truncated toward zero and clamped to `[0, 65535]`.
pub fn resample(source: &Volume, reference: &Volume) -> Result<Volume> {
    let (isotropic, size) =
        Interpolator::get_isotropic_dimensions(reference.spacing(), reference.size())?;
    let physical_to_source = source.physical_to_index_matrix()?;

    // output index -> physical point -> source continuous index, as one affine map
    let output_to_physical = reference.direction() * Matrix3::from_diagonal_element(isotropic);
    let linear = physical_to_source * output_to_physical;
    let offset =
        physical_to_source * (Vector3::from(reference.origin()) - Vector3::from(source.origin()));

    debug!(
        source_size = ?source.size(),
        output_size = ?size,
        spacing = isotropic,
        "resampling onto isotropic grid"
    );

    let spline = BSplineInterpolator::new(source.data());
    let mut data = Array3::<f32>::zeros((size[2], size[1], size[0]));
    Zip::indexed(&mut data).par_for_each(|(z, y, x), sample| {
        let index = linear * Vector3::new(x as f64, y as f64, z as f64) + offset;
        let value = spline
            .evaluate([index.x, index.y, index.z])
            .unwrap_or(DEFAULT_PIXEL_VALUE);
        *sample = f32::from(value as u16);
    });

    Volume::new(
        data,
        [isotropic; 3],
        reference.origin(),
        *reference.direction(),
        PixelKind::U16,
    )
}
