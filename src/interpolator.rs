use ndarray::{Array3, Axis, Zip};

use crate::error::{Error, Result};
use crate::volume::validate_spacing;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Isotropic spacing and output size for resampling onto a grid that
    /// covers the same extent as `size`/`spacing`.
    ///
    /// The spacing is the finest input spacing. Axes 0 and 1 truncate toward
    /// zero while axis 2 rounds to nearest (ties to even).
    pub(crate) fn get_isotropic_dimensions(
        spacing: [f64; 3],
        size: [usize; 3],
    ) -> Result<(f64, [usize; 3])> {
        validate_spacing(&spacing)?;
        let min_spacing = spacing[0].min(spacing[1]).min(spacing[2]);
        let extent = |axis: usize| size[axis] as f64 * spacing[axis] / min_spacing;

        let new_size = [
            extent(0) as usize,
            extent(1) as usize,
            extent(2).round_ties_even() as usize,
        ];
        if new_size.contains(&0) {
            return Err(Error::Geometry(format!(
                "isotropic grid for size {size:?} at spacing {min_spacing} is empty"
            )));
        }
        Ok((min_spacing, new_size))
    }
}

/// Quintic B-spline reconstruction of a sampled volume.
///
/// Construction runs the recursive prefilter that turns samples into spline
/// coefficients (mirror boundary conditions); evaluation then sums the
/// 6×6×6 coefficients around the requested continuous index.
pub(crate) struct BSplineInterpolator {
    coefficients: Array3<f64>,
}

const POLES: [f64; 2] = [-0.430_575_347_099_973_8, -0.043_096_288_203_264_65];
const TOLERANCE: f64 = 1e-10;
const SUPPORT: usize = 6;

impl BSplineInterpolator {
    pub(crate) fn new(samples: &Array3<f32>) -> Self {
        let mut coefficients = samples.mapv(f64::from);
        for axis in 0..3 {
            Zip::from(coefficients.lanes_mut(Axis(axis))).par_for_each(|mut lane| {
                let mut line = lane.to_vec();
                decompose_line(&mut line);
                lane.iter_mut().zip(line).for_each(|(c, v)| *c = v);
            });
        }
        Self { coefficients }
    }

    /// Value at continuous index `(x, y, z)`, or `None` when the index lies
    /// outside `[-0.5, n - 0.5)` on any axis.
    pub(crate) fn evaluate(&self, index: [f64; 3]) -> Option<f64> {
        let (depth, height, width) = self.coefficients.dim();
        let dims = [width, height, depth];
        if index
            .iter()
            .zip(dims)
            .any(|(&i, n)| !(i >= -0.5 && i < n as f64 - 0.5))
        {
            return None;
        }

        let [(xs, x_weights), (ys, y_weights), (zs, z_weights)] =
            [0, 1, 2].map(|axis| support(index[axis], dims[axis]));

        let mut value = 0.0;
        for (&z, &wz) in zs.iter().zip(&z_weights) {
            for (&y, &wy) in ys.iter().zip(&y_weights) {
                let row: f64 = xs
                    .iter()
                    .zip(&x_weights)
                    .map(|(&x, &wx)| self.coefficients[[z, y, x]] * wx)
                    .sum();
                value += row * wy * wz;
            }
        }
        Some(value)
    }
}

/// Mirrored sample indices and spline weights along one axis.
fn support(x: f64, n: usize) -> ([usize; SUPPORT], [f64; SUPPORT]) {
    let first = x.floor() as isize - (SUPPORT as isize / 2 - 1);
    let mut indices = [0; SUPPORT];
    let mut weights = [0.0; SUPPORT];
    for k in 0..SUPPORT {
        let i = first + k as isize;
        indices[k] = mirror(i, n);
        weights[k] = quintic_bspline(x - i as f64);
    }
    (indices, weights)
}

fn mirror(i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * n - 2;
    let i = i.unsigned_abs() % period;
    if i >= n { period - i } else { i }
}

/// Centered quintic B-spline basis.
pub(crate) fn quintic_bspline(x: f64) -> f64 {
    let x = x.abs();
    let term = |offset: f64| (offset - x).max(0.0).powi(5);
    if x >= 3.0 {
        0.0
    } else {
        (term(3.0) - 6.0 * term(2.0) + 15.0 * term(1.0)) / 120.0
    }
}

/// In-place conversion of one line of samples to spline coefficients.
fn decompose_line(c: &mut [f64]) {
    let n = c.len();
    if n < 2 {
        return;
    }

    let gain: f64 = POLES.iter().map(|z| (1.0 - z) * (1.0 - 1.0 / z)).product();
    c.iter_mut().for_each(|v| *v *= gain);

    for z in POLES {
        c[0] = initial_causal_coefficient(c, z);
        for i in 1..n {
            c[i] += z * c[i - 1];
        }
        c[n - 1] = (z / (z * z - 1.0)) * (z * c[n - 2] + c[n - 1]);
        for i in (0..n - 1).rev() {
            c[i] = z * (c[i + 1] - c[i]);
        }
    }
}

fn initial_causal_coefficient(c: &[f64], z: f64) -> f64 {
    let n = c.len();
    let horizon = (TOLERANCE.ln() / z.abs().ln()).ceil() as usize;

    if horizon < n {
        let mut zn = z;
        let mut sum = c[0];
        for v in &c[1..horizon] {
            sum += zn * v;
            zn *= z;
        }
        sum
    } else {
        let iz = 1.0 / z;
        let mut zn = z;
        let mut z2n = z.powi(n as i32 - 1);
        let mut sum = c[0] + z2n * c[n - 1];
        z2n *= z2n * iz;
        for v in &c[1..n - 1] {
            sum += (zn + z2n) * v;
            zn *= z;
            z2n *= iz;
        }
        sum / (1.0 - zn * zn)
    }
}
