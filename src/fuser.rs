use ndarray::Zip;
use tracing::debug;

use crate::enums::{PixelKind, Statistic};
use crate::error::{Error, Result};
use crate::volume::Volume;

/// Combines three co-registered views voxel by voxel.
///
/// `views[0]` is the common reference (the resampled sagittal stack); its
/// spacing, origin and direction are stamped onto the result. Every view must
/// share that grid, otherwise this fails with [`Error::ShapeMismatch`]
/// before any sample is touched.
///
/// The result is floating point. Casting it to an integer kind is a separate
/// step, see [`Volume::cast`].
pub fn fuse(views: &[Volume; 3], statistic: Statistic) -> Result<Volume> {
    let [reference, second, third] = views;
    for (position, view) in [(1, second), (2, third)] {
        if let Some(mismatch) = view.geometry_mismatch(reference) {
            return Err(Error::ShapeMismatch(format!("view {position}: {mismatch}")));
        }
    }

    debug!(%statistic, size = ?reference.size(), "fusing views");

    let data = Zip::from(reference.data())
        .and(second.data())
        .and(third.data())
        .par_map_collect(|&a, &b, &c| combine(statistic, a, b, c));

    // the reduction carries no geometry; stamp the reference's back on
    Volume::new(
        data,
        reference.spacing(),
        reference.origin(),
        *reference.direction(),
        PixelKind::F32,
    )
}

/// Statistic of three samples, independent of their order.
fn combine(statistic: Statistic, a: f32, b: f32, c: f32) -> f32 {
    let mut values = [f64::from(a), f64::from(b), f64::from(c)];
    values.sort_by(f64::total_cmp);
    let [low, middle, high] = values;
    let value = match statistic {
        Statistic::Mean => (low + middle + high) / 3.0,
        Statistic::Median => middle,
        Statistic::Max => high,
        Statistic::Min => low,
    };
    value as f32
}

#[cfg(test)]
mod tests {
    use nalgebra::Matrix3;
    use ndarray::Array3;

    use super::*;

    fn constant(value: f32) -> Volume {
        Volume::filled(
            [4, 4, 4],
            value,
            [1.0; 3],
            [0.0; 3],
            Matrix3::identity(),
            PixelKind::U16,
        )
        .unwrap()
    }

    fn patterned(seed: usize) -> Volume {
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| {
            ((x * 13 + y * 7 + z * 3 + seed * 31) % 23) as f32
        });
        Volume::new(
            data,
            [0.5; 3],
            [12.0, -40.0, 3.5],
            Matrix3::new(0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, -1.0, 0.0),
            PixelKind::U16,
        )
        .unwrap()
    }

    #[test]
    fn constant_views_fuse_to_expected_statistic() {
        let views = [constant(10.0), constant(20.0), constant(30.0)];
        for (statistic, expected) in [
            (Statistic::Mean, 20.0),
            (Statistic::Median, 20.0),
            (Statistic::Max, 30.0),
            (Statistic::Min, 10.0),
        ] {
            let fused = fuse(&views, statistic).unwrap();
            assert!(
                fused.data().iter().all(|&v| v == expected),
                "{statistic} did not yield {expected}"
            );
            assert_eq!(fused.pixel_kind(), PixelKind::F32);
        }
    }

    #[test]
    fn fusion_is_invariant_under_view_permutation() {
        let [a, b, c] = [patterned(0), patterned(1), patterned(2)];
        let permutations = [
            [a.clone(), b.clone(), c.clone()],
            [a.clone(), c.clone(), b.clone()],
            [b.clone(), a.clone(), c.clone()],
            [b.clone(), c.clone(), a.clone()],
            [c.clone(), a.clone(), b.clone()],
            [c, b, a],
        ];
        for statistic in [
            Statistic::Mean,
            Statistic::Median,
            Statistic::Max,
            Statistic::Min,
        ] {
            let expected = fuse(&permutations[0], statistic).unwrap();
            for views in &permutations[1..] {
                assert_eq!(fuse(views, statistic).unwrap().data(), expected.data());
            }
        }
    }

    #[test]
    fn fusion_preserves_common_geometry() {
        let views = [patterned(0), patterned(1), patterned(2)];
        for statistic in [
            Statistic::Mean,
            Statistic::Median,
            Statistic::Max,
            Statistic::Min,
        ] {
            let fused = fuse(&views, statistic).unwrap();
            assert!(fused.geometry_mismatch(&views[0]).is_none());
            assert_eq!(fused.spacing(), views[0].spacing());
            assert_eq!(fused.origin(), views[0].origin());
            assert_eq!(fused.direction(), views[0].direction());
        }
    }

    #[test]
    fn median_picks_middle_value() {
        assert_eq!(combine(Statistic::Median, 9.0, 1.0, 4.0), 4.0);
        assert_eq!(combine(Statistic::Mean, 1.0, 2.0, 4.0), 7.0 / 3.0);
    }

    #[test]
    fn mismatched_sizes_fail_fast() {
        let other = Volume::filled(
            [4, 4, 5],
            0.0,
            [1.0; 3],
            [0.0; 3],
            Matrix3::identity(),
            PixelKind::U16,
        )
        .unwrap();
        let views = [constant(1.0), constant(2.0), other];
        assert!(matches!(
            fuse(&views, Statistic::Mean),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn mismatched_origins_fail_fast() {
        let shifted = Volume::filled(
            [4, 4, 4],
            0.0,
            [1.0; 3],
            [0.0, 0.0, 1.0],
            Matrix3::identity(),
            PixelKind::U16,
        )
        .unwrap();
        let views = [constant(1.0), shifted, constant(2.0)];
        assert!(matches!(
            fuse(&views, Statistic::Max),
            Err(Error::ShapeMismatch(_))
        ));
    }
}
