//! Separable B-spline resampling of 3-D volumes.
//!
//! Order 0 is nearest neighbour, 1 is linear, 2 to 5 interpolate through
//! prefiltered spline coefficients. Output voxel `o` along an axis of `n_in` input
//! voxels and `n_out` output voxels samples the input at `o * (n_in - 1) / (n_out - 1)`,
//! so the corner voxels of input and output coincide. Samples past the edge are
//! mirrored.

use ndarray::{Array1, Array3, ArrayView1, ArrayView3, ArrayViewMut1, Axis, Zip};

use crate::error::{BatchError, Result};
use crate::geometry::Shape3;

pub const MAX_ORDER: usize = 5;

/// Tolerance of the truncated causal initialisation of the prefilter.
const PREFILTER_TOLERANCE: f64 = 1e-10;

/// Weights and taps for every output sample along one axis.
struct AxisPlan {
    order: usize,
    taps: Vec<(i64, Vec<f64>)>,
    input_len: usize,
}

impl AxisPlan {
    fn new(input_len: usize, output_len: usize, order: usize) -> Self {
        let step = if output_len > 1 {
            (input_len as f64 - 1.0) / (output_len as f64 - 1.0)
        } else {
            0.0
        };
        let taps = (0..output_len)
            .map(|o| {
                let x = o as f64 * step;
                let first = first_tap(x, order);
                let weights = (0..=order as i64)
                    .map(|k| bspline(order, x - (first + k) as f64))
                    .collect();
                (first, weights)
            })
            .collect();
        Self {
            order,
            taps,
            input_len,
        }
    }

    fn apply(&self, source: ArrayView1<'_, f32>, mut target: ArrayViewMut1<'_, f32>) {
        if self.input_len == 1 {
            target.fill(source[0]);
            return;
        }
        let coefficients = prefilter(source, self.order);
        for (value, (first, weights)) in target.iter_mut().zip(&self.taps) {
            let sum: f64 = weights
                .iter()
                .enumerate()
                .map(|(k, w)| w * coefficients[mirror(first + k as i64, self.input_len)])
                .sum();
            *value = sum as f32;
        }
    }
}

/// Resamples `volume` onto `shape` with a spline of the given order.
pub fn zoom(volume: ArrayView3<'_, f32>, shape: Shape3, order: usize) -> Result<Array3<f32>> {
    validate(shape, order)?;
    let (d, h, w) = volume.dim();
    if d == 0 || h == 0 || w == 0 {
        return Err(BatchError::invalid(format!(
            "cannot resample an empty volume of shape {:?}",
            volume.dim()
        )));
    }

    let mut current = volume.to_owned();
    for axis in 0..3 {
        if current.len_of(Axis(axis)) == shape[axis] {
            // Splines interpolate their own samples.
            continue;
        }
        current = resample_axis(current.view(), Axis(axis), shape[axis], order);
    }
    Ok(current)
}

pub(crate) fn validate(shape: Shape3, order: usize) -> Result<()> {
    if order > MAX_ORDER {
        return Err(BatchError::invalid(format!(
            "interpolation order must be at most {MAX_ORDER}, got {order}"
        )));
    }
    if shape.contains(&0) {
        return Err(BatchError::invalid(format!(
            "target shape must be positive, got {shape:?}"
        )));
    }
    Ok(())
}

fn resample_axis(
    source: ArrayView3<'_, f32>,
    axis: Axis,
    output_len: usize,
    order: usize,
) -> Array3<f32> {
    let mut dim = source.raw_dim();
    dim[axis.index()] = output_len;
    let mut target = Array3::<f32>::zeros(dim);
    let plan = AxisPlan::new(source.len_of(axis), output_len, order);
    Zip::from(source.lanes(axis))
        .and(target.lanes_mut(axis))
        .for_each(|src, dst| plan.apply(src, dst));
    target
}

fn first_tap(x: f64, order: usize) -> i64 {
    if order % 2 == 1 {
        x.floor() as i64 - (order as i64 - 1) / 2
    } else {
        (x + 0.5).floor() as i64 - order as i64 / 2
    }
}

/// Centred cardinal B-spline of degree `order`.
fn bspline(order: usize, t: f64) -> f64 {
    if order == 0 {
        return if (-0.5..0.5).contains(&t) { 1.0 } else { 0.0 };
    }
    let n = order as i32;
    let half = (n + 1) as f64 / 2.0;
    let mut sum = 0.0;
    let mut binomial = 1.0;
    for k in 0..=n + 1 {
        let shifted = t + half - k as f64;
        if shifted > 0.0 {
            let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
            sum += sign * binomial * shifted.powi(n);
        }
        binomial = binomial * (n + 1 - k) as f64 / (k + 1) as f64;
    }
    sum / factorial(order)
}

fn factorial(n: usize) -> f64 {
    (1..=n).map(|k| k as f64).product()
}

/// Reflects an index into `[0, len)` without repeating the edge sample.
fn mirror(index: i64, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as i64 - 1);
    let folded = index.rem_euclid(period);
    (if folded >= len as i64 { period - folded } else { folded }) as usize
}

fn poles(order: usize) -> Vec<f64> {
    match order {
        2 => vec![8f64.sqrt() - 3.0],
        3 => vec![3f64.sqrt() - 2.0],
        4 => vec![
            (664.0 - 438976f64.sqrt()).sqrt() + 304f64.sqrt() - 19.0,
            (664.0 + 438976f64.sqrt()).sqrt() - 304f64.sqrt() - 19.0,
        ],
        5 => vec![
            (135.0 / 2.0 - (17745.0f64 / 4.0).sqrt()).sqrt() + (105.0f64 / 4.0).sqrt() - 6.5,
            (135.0 / 2.0 + (17745.0f64 / 4.0).sqrt()).sqrt() - (105.0f64 / 4.0).sqrt() - 6.5,
        ],
        _ => Vec::new(),
    }
}

/// Interpolating spline coefficients of one line (mirror boundary).
fn prefilter(line: ArrayView1<'_, f32>, order: usize) -> Array1<f64> {
    let mut c = line.mapv(f64::from);
    let n = c.len();
    let poles = poles(order);
    if poles.is_empty() || n < 2 {
        return c;
    }

    let gain: f64 = poles.iter().map(|z| (1.0 - z) * (1.0 - 1.0 / z)).product();
    c.mapv_inplace(|v| v * gain);

    for &z in &poles {
        c[0] = causal_init(&c, z);
        for k in 1..n {
            c[k] += z * c[k - 1];
        }
        c[n - 1] = (z / (z * z - 1.0)) * (c[n - 1] + z * c[n - 2]);
        for k in (0..n - 1).rev() {
            c[k] = z * (c[k + 1] - c[k]);
        }
    }
    c
}

fn causal_init(c: &Array1<f64>, z: f64) -> f64 {
    let n = c.len();
    let horizon = (PREFILTER_TOLERANCE.ln() / z.abs().ln()).ceil() as usize;
    if horizon < n {
        let mut zn = z;
        let mut sum = c[0];
        for value in c.iter().take(horizon).skip(1) {
            sum += zn * value;
            zn *= z;
        }
        return sum;
    }

    // Exact whole-sample symmetric initialisation.
    let iz = 1.0 / z;
    let mut zn = z;
    let mut z2n = z.powi(n as i32 - 1);
    let mut sum = c[0] + z2n * c[n - 1];
    z2n *= z2n * iz;
    for value in c.iter().take(n - 1).skip(1) {
        sum += (zn + z2n) * value;
        zn *= z;
        z2n *= iz;
    }
    sum / (1.0 - zn * zn)
}
