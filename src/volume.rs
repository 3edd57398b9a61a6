use nalgebra::{Matrix3, Vector3};
use ndarray::Array3;

use crate::enums::{CastPolicy, PixelKind};
use crate::error::{Error, Result};

const GEOMETRY_TOLERANCE: f64 = 1e-6;

/// A sampled scalar field together with its physical geometry.
///
/// Samples are stored `(depth, height, width)`, i.e. indexed `[z, y, x]`, so
/// the through-plane axis varies slowest. Sizes, spacings and indices passed
/// to and returned from this type are ordered `(x, y, z)`.
///
/// Every sample is held as `f32`; `pixel_kind` records which scalar type
/// the values are representable in.
#[derive(Clone, Debug)]
pub struct Volume {
    data: Array3<f32>,
    spacing: [f64; 3],
    origin: [f64; 3],
    direction: Matrix3<f64>,
    pixel_kind: PixelKind,
}

impl Volume {
    pub fn new(
        data: Array3<f32>,
        spacing: [f64; 3],
        origin: [f64; 3],
        direction: Matrix3<f64>,
        pixel_kind: PixelKind,
    ) -> Result<Self> {
        let (depth, height, width) = data.dim();
        if depth == 0 || height == 0 || width == 0 {
            return Err(Error::Geometry(format!(
                "empty sample grid ({width}, {height}, {depth})"
            )));
        }
        validate_spacing(&spacing)?;
        if origin.iter().any(|o| !o.is_finite()) {
            return Err(Error::Geometry(format!("non-finite origin {origin:?}")));
        }
        if direction.iter().any(|d| !d.is_finite()) || direction.determinant().abs() < 1e-12 {
            return Err(Error::Geometry(format!(
                "direction matrix is not invertible: {:?}",
                direction.as_slice()
            )));
        }

        Ok(Self {
            data,
            spacing,
            origin,
            direction,
            pixel_kind,
        })
    }

    /// Volume of `size` (x, y, z) where every sample equals `value`.
    pub fn filled(
        size: [usize; 3],
        value: f32,
        spacing: [f64; 3],
        origin: [f64; 3],
        direction: Matrix3<f64>,
        pixel_kind: PixelKind,
    ) -> Result<Self> {
        let data = Array3::from_elem((size[2], size[1], size[0]), value);
        Self::new(data, spacing, origin, direction, pixel_kind)
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Voxel counts ordered (x, y, z).
    pub fn size(&self) -> [usize; 3] {
        let (depth, height, width) = self.data.dim();
        [width, height, depth]
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    /// Columns are the physical directions of the x, y and z index axes.
    pub fn direction(&self) -> &Matrix3<f64> {
        &self.direction
    }

    pub fn pixel_kind(&self) -> PixelKind {
        self.pixel_kind
    }

    /// Sample at index (x, y, z).
    pub fn get(&self, index: [usize; 3]) -> Option<f32> {
        self.data.get([index[2], index[1], index[0]]).copied()
    }

    /// `direction · diag(spacing)`, mapping index offsets to physical offsets.
    pub(crate) fn index_to_physical_matrix(&self) -> Matrix3<f64> {
        self.direction * Matrix3::from_diagonal(&Vector3::from(self.spacing))
    }

    /// Inverse of [`Self::index_to_physical_matrix`].
    pub(crate) fn physical_to_index_matrix(&self) -> Result<Matrix3<f64>> {
        self.index_to_physical_matrix().try_inverse().ok_or_else(|| {
            Error::Geometry(format!(
                "index-to-physical matrix is singular for spacing {:?}",
                self.spacing
            ))
        })
    }

    /// `origin + direction · (spacing ⊙ index)` for a (possibly continuous) index.
    pub fn index_to_physical(&self, index: [f64; 3]) -> [f64; 3] {
        let point = Vector3::from(self.origin)
            + self.index_to_physical_matrix() * Vector3::from(index);
        [point.x, point.y, point.z]
    }

    /// Continuous index of a physical point.
    pub fn physical_to_index(&self, point: [f64; 3]) -> Result<[f64; 3]> {
        let index = self.physical_to_index_matrix()?
            * (Vector3::from(point) - Vector3::from(self.origin));
        Ok([index.x, index.y, index.z])
    }

    /// Describes the first geometric difference to `other`, if any.
    pub fn geometry_mismatch(&self, other: &Volume) -> Option<String> {
        if self.size() != other.size() {
            return Some(format!("size {:?} != {:?}", self.size(), other.size()));
        }
        let close = |a: &[f64], b: &[f64]| {
            a.iter()
                .zip(b)
                .all(|(x, y)| (x - y).abs() <= GEOMETRY_TOLERANCE)
        };
        if !close(&self.spacing, &other.spacing) {
            return Some(format!("spacing {:?} != {:?}", self.spacing, other.spacing));
        }
        if !close(&self.origin, &other.origin) {
            return Some(format!("origin {:?} != {:?}", self.origin, other.origin));
        }
        if !close(self.direction.as_slice(), other.direction.as_slice()) {
            return Some(format!(
                "direction {:?} != {:?}",
                self.direction.as_slice(),
                other.direction.as_slice()
            ));
        }
        None
    }

    /// Converts samples to `kind`: truncation toward zero, then `policy` for
    /// values outside the kind's range. Geometry is untouched.
    pub fn cast(&self, kind: PixelKind, policy: CastPolicy) -> Volume {
        let data = if kind == self.pixel_kind {
            self.data.clone()
        } else {
            self.data.mapv(|v| cast_sample(v, kind, policy))
        };
        Volume {
            data,
            spacing: self.spacing,
            origin: self.origin,
            direction: self.direction,
            pixel_kind: kind,
        }
    }
}

/// Spacing must be finite and strictly positive on every axis.
pub(crate) fn validate_spacing(spacing: &[f64; 3]) -> Result<()> {
    if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(Error::Geometry(format!("degenerate spacing {spacing:?}")));
    }
    Ok(())
}

/// NaN becomes 0 under either policy.
pub fn cast_sample(value: f32, kind: PixelKind, policy: CastPolicy) -> f32 {
    match (kind, policy) {
        (PixelKind::F32, _) => value,
        (PixelKind::U16, CastPolicy::Saturate) => value as u16 as f32,
        (PixelKind::I16, CastPolicy::Saturate) => value as i16 as f32,
        (PixelKind::U16, CastPolicy::Wrap) => value as i64 as u16 as f32,
        (PixelKind::I16, CastPolicy::Wrap) => value as i64 as i16 as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oblique() -> Matrix3<f64> {
        let (s, c) = (0.5_f64.sin(), 0.5_f64.cos());
        Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0)
    }

    #[test]
    fn index_to_physical_applies_direction_and_spacing() {
        let volume = Volume::filled(
            [4, 3, 2],
            0.0,
            [0.5, 2.0, 3.0],
            [10.0, -5.0, 1.0],
            Matrix3::identity(),
            PixelKind::U16,
        )
        .unwrap();
        assert_eq!(volume.index_to_physical([2.0, 1.0, 1.0]), [11.0, -3.0, 4.0]);
        assert_eq!(volume.size(), [4, 3, 2]);
        assert_eq!(volume.dim(), (2, 3, 4));
    }

    #[test]
    fn physical_to_index_inverts_index_to_physical() {
        let volume = Volume::filled(
            [5, 5, 5],
            0.0,
            [0.7, 0.9, 2.5],
            [-3.0, 4.0, 12.0],
            oblique(),
            PixelKind::F32,
        )
        .unwrap();
        let index = [1.25, 3.5, 2.0];
        let back = volume
            .physical_to_index(volume.index_to_physical(index))
            .unwrap();
        for (a, b) in index.iter().zip(back) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn rejects_degenerate_geometry() {
        let zero_spacing = Volume::filled(
            [2, 2, 2],
            0.0,
            [1.0, 0.0, 1.0],
            [0.0; 3],
            Matrix3::identity(),
            PixelKind::U16,
        );
        assert!(matches!(zero_spacing, Err(Error::Geometry(_))));

        let singular = Volume::filled(
            [2, 2, 2],
            0.0,
            [1.0; 3],
            [0.0; 3],
            Matrix3::new(1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0),
            PixelKind::U16,
        );
        assert!(matches!(singular, Err(Error::Geometry(_))));

        let empty = Volume::filled(
            [0, 2, 2],
            0.0,
            [1.0; 3],
            [0.0; 3],
            Matrix3::identity(),
            PixelKind::U16,
        );
        assert!(matches!(empty, Err(Error::Geometry(_))));
    }

    #[test]
    fn cast_truncates_then_applies_policy() {
        assert_eq!(cast_sample(12.9, PixelKind::I16, CastPolicy::Saturate), 12.0);
        assert_eq!(cast_sample(-12.9, PixelKind::I16, CastPolicy::Saturate), -12.0);
        assert_eq!(cast_sample(40000.0, PixelKind::I16, CastPolicy::Saturate), 32767.0);
        assert_eq!(cast_sample(40000.0, PixelKind::I16, CastPolicy::Wrap), -25536.0);
        assert_eq!(cast_sample(-1.5, PixelKind::U16, CastPolicy::Saturate), 0.0);
        assert_eq!(cast_sample(-1.5, PixelKind::U16, CastPolicy::Wrap), 65535.0);
        assert_eq!(cast_sample(f32::NAN, PixelKind::U16, CastPolicy::Wrap), 0.0);
    }

    #[test]
    fn cast_keeps_geometry() {
        let volume = Volume::filled(
            [3, 3, 3],
            20.5,
            [0.5, 0.5, 1.5],
            [1.0, 2.0, 3.0],
            oblique(),
            PixelKind::F32,
        )
        .unwrap();
        let cast = volume.cast(PixelKind::I16, CastPolicy::Saturate);
        assert_eq!(cast.pixel_kind(), PixelKind::I16);
        assert!(cast.geometry_mismatch(&volume).is_none());
        assert!(cast.data().iter().all(|&v| v == 20.0));
    }
}
