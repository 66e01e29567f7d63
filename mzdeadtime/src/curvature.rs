/*! Peak centroid traces and the curvature of a cubic fit through them

The intensity-weighted mean m/z of each scan of a peak cluster, taken as a function of
scan time, should follow a smooth path. A cubic polynomial

```math
m(t) = a_0 + a_1 t + a_2 t^2 + a_3 t^3
```

is fitted to the trace by least squares and its curvature

```math
\kappa(t) = \frac{|m''(t)|}{(1 + m'(t)^2)^{3/2}}
```

is evaluated at each observed scan time.
*/
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::spectrum::Spectrum;

/// The number of coefficients of the fitted polynomial
pub const CUBIC_TERMS: usize = 4;

/// An error that might occur while fitting a cubic to a centroid trace
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FitError {
    #[error("At least {CUBIC_TERMS} points are required to fit a cubic, got {0}")]
    InsufficientPoints(usize),
    #[error("The least squares system could not be solved")]
    Singular,
    #[error("The trace contains non-finite values")]
    NonFinite,
}

/// The intensity-weighted mean m/z of each scan of a spectrum, paired with scan time
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CentroidTrace {
    pub times: Vec<f64>,
    pub centroids: Vec<f64>,
}

impl CentroidTrace {
    /// Compute the trace of `spectrum`. Scans without any intensity are skipped.
    pub fn from_spectrum(spectrum: &Spectrum) -> Self {
        let (times, centroids) = spectrum
            .iter()
            .filter_map(|scan| scan.centroid().map(|c| (scan.time, c)))
            .unzip();
        Self { times, centroids }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn fit(&self) -> Result<CubicFit, FitError> {
        CubicFit::fit(&self.times, &self.centroids)
    }
}

/// A least squares cubic polynomial fit.
///
/// The polynomial is stored over the normalized variable `u = (t - center) / scale`
/// which keeps the normal equations well conditioned for large scan times.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubicFit {
    center: f64,
    scale: f64,
    coefficients: [f64; CUBIC_TERMS],
}

impl CubicFit {
    /// Fit `values` as a cubic function of `times`
    pub fn fit(times: &[f64], values: &[f64]) -> Result<Self, FitError> {
        let n = times.len().min(values.len());
        if n < CUBIC_TERMS {
            return Err(FitError::InsufficientPoints(n));
        }
        let times = &times[..n];
        let values = &values[..n];
        if times.iter().chain(values.iter()).any(|v| !v.is_finite()) {
            return Err(FitError::NonFinite);
        }

        let center = times.iter().sum::<f64>() / n as f64;
        let scale = times
            .iter()
            .map(|t| (t - center).abs())
            .fold(0.0, f64::max);
        let scale = if scale > 0.0 { scale } else { 1.0 };

        let design = DMatrix::from_fn(n, CUBIC_TERMS, |i, j| {
            ((times[i] - center) / scale).powi(j as i32)
        });
        let target = DVector::from_column_slice(values);

        let solution = design
            .svd(true, true)
            .solve(&target, f64::EPSILON)
            .map_err(|_| FitError::Singular)?;

        let mut coefficients = [0.0; CUBIC_TERMS];
        for (c, s) in coefficients.iter_mut().zip(solution.iter()) {
            *c = *s;
        }
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(FitError::Singular);
        }

        Ok(Self {
            center,
            scale,
            coefficients,
        })
    }

    #[inline]
    fn normalize(&self, t: f64) -> f64 {
        (t - self.center) / self.scale
    }

    pub fn evaluate(&self, t: f64) -> f64 {
        let u = self.normalize(t);
        let [b0, b1, b2, b3] = self.coefficients;
        b0 + u * (b1 + u * (b2 + u * b3))
    }

    /// The first derivative with respect to `t`
    pub fn first_derivative(&self, t: f64) -> f64 {
        let u = self.normalize(t);
        let [_, b1, b2, b3] = self.coefficients;
        (b1 + 2.0 * b2 * u + 3.0 * b3 * u * u) / self.scale
    }

    /// The second derivative with respect to `t`
    pub fn second_derivative(&self, t: f64) -> f64 {
        let u = self.normalize(t);
        let [_, _, b2, b3] = self.coefficients;
        (2.0 * b2 + 6.0 * b3 * u) / (self.scale * self.scale)
    }

    /// The unsigned curvature of the fitted curve at `t`
    pub fn curvature(&self, t: f64) -> f64 {
        let d1 = self.first_derivative(t);
        let d2 = self.second_derivative(t);
        d2.abs() / (1.0 + d1 * d1).powf(1.5)
    }

    /// The sum of [`CubicFit::curvature`] over `times`
    pub fn total_curvature(&self, times: &[f64]) -> f64 {
        times.iter().map(|t| self.curvature(*t)).sum()
    }

    /// The largest [`CubicFit::curvature`] over `times`
    pub fn max_curvature(&self, times: &[f64]) -> f64 {
        times.iter().map(|t| self.curvature(*t)).fold(0.0, f64::max)
    }

    /// The coefficients $`a_0 \ldots a_3`$ of the polynomial in `t` itself
    pub fn coefficients(&self) -> [f64; CUBIC_TERMS] {
        let [b0, b1, b2, b3] = self.coefficients;
        let s = self.scale;
        let c = self.center;
        // Expand b_k ((t - c) / s)^k
        let k1 = b1 / s;
        let k2 = b2 / (s * s);
        let k3 = b3 / (s * s * s);
        [
            b0 - k1 * c + k2 * c * c - k3 * c * c * c,
            k1 - 2.0 * k2 * c + 3.0 * k3 * c * c,
            k2 - 3.0 * k3 * c,
            k3,
        ]
    }
}

/// Fit the centroid trace of `spectrum` and sum the curvature over its scan times
pub fn spectrum_curvature(spectrum: &Spectrum) -> Result<f64, FitError> {
    let trace = CentroidTrace::from_spectrum(spectrum);
    let fit = trace.fit()?;
    Ok(fit.total_curvature(&trace.times))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spectrum::{MassPoint, Scan};

    macro_rules! assert_is_close {
        ($t1:expr, $t2:expr, $tol:expr, $label:literal) => {
            assert!(
                ($t1 - $t2).abs() < $tol,
                "Observed {} {}, expected {}, difference {}",
                $label,
                $t1,
                $t2,
                $t1 - $t2,
            );
        };
    }

    fn polynomial(a: [f64; 4], t: f64) -> f64 {
        a[0] + a[1] * t + a[2] * t * t + a[3] * t * t * t
    }

    #[test]
    fn test_exact_cubic_recovered() -> Result<(), FitError> {
        let a = [500.0, 0.02, -0.003, 0.0001];
        let times: Vec<f64> = (0..12).map(|i| 120.0 + i as f64 * 0.23).collect();
        let values: Vec<f64> = times.iter().map(|t| polynomial(a, *t - 120.0)).collect();
        let fit = CubicFit::fit(&times, &values)?;
        for t in times.iter() {
            assert_is_close!(fit.evaluate(*t), polynomial(a, *t - 120.0), 1e-8, "value");
        }
        let d1 = a[1] + 2.0 * a[2] * 0.5 + 3.0 * a[3] * 0.25;
        let d2 = 2.0 * a[2] + 6.0 * a[3] * 0.5;
        assert_is_close!(fit.first_derivative(120.5), d1, 1e-7, "first derivative");
        assert_is_close!(fit.second_derivative(120.5), d2, 1e-7, "second derivative");
        let expected = d2.abs() / (1.0 + d1 * d1).powf(1.5);
        assert_is_close!(fit.curvature(120.5), expected, 1e-7, "curvature");
        Ok(())
    }

    #[test]
    fn test_raw_coefficients() -> Result<(), FitError> {
        let a = [2.0, -1.0, 0.5, 0.25];
        let times: Vec<f64> = (0..8).map(|i| i as f64 - 3.0).collect();
        let values: Vec<f64> = times.iter().map(|t| polynomial(a, *t)).collect();
        let fit = CubicFit::fit(&times, &values)?;
        for (observed, expected) in fit.coefficients().iter().zip(a.iter()) {
            assert_is_close!(*observed, *expected, 1e-9, "coefficient");
        }
        Ok(())
    }

    #[test]
    fn test_line_has_no_curvature() -> Result<(), FitError> {
        let times: Vec<f64> = (0..10).map(|i| 300.0 + i as f64).collect();
        let values: Vec<f64> = times.iter().map(|t| 750.0 + 0.001 * t).collect();
        let fit = CubicFit::fit(&times, &values)?;
        assert!(fit.total_curvature(&times) < 1e-9);
        Ok(())
    }

    #[test]
    fn test_noisy_fit_is_least_squares() -> Result<(), FitError> {
        let times: Vec<f64> = (0..9).map(|i| i as f64).collect();
        let values: Vec<f64> = times
            .iter()
            .enumerate()
            .map(|(i, t)| 3.0 + t + if i % 2 == 0 { 0.1 } else { -0.1 })
            .collect();
        let fit = CubicFit::fit(&times, &values)?;
        let sse = |f: &dyn Fn(f64) -> f64| -> f64 {
            times
                .iter()
                .zip(values.iter())
                .map(|(t, v)| (f(*t) - v).powi(2))
                .sum()
        };
        let best = sse(&|t| fit.evaluate(t));
        let a = fit.coefficients();
        for (i, delta) in [(0, 0.01), (1, -0.01), (2, 0.001), (3, 0.0001)] {
            let mut b = a;
            b[i] += delta;
            assert!(sse(&|t| polynomial(b, t)) > best);
        }
        Ok(())
    }

    #[test]
    fn test_insufficient_points() {
        assert_eq!(
            CubicFit::fit(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]),
            Err(FitError::InsufficientPoints(3))
        );
        assert_eq!(
            CubicFit::fit(&[1.0, 2.0, 3.0, 4.0], &[1.0, f64::NAN, 3.0, 4.0]),
            Err(FitError::NonFinite)
        );
    }

    #[test]
    fn test_centroid_trace() {
        let spectrum: Spectrum = [
            Scan::new(
                1.0,
                1,
                vec![MassPoint::new(100.0, 1.0), MassPoint::new(101.0, 1.0)],
            ),
            Scan::new(2.0, 2, vec![MassPoint::new(100.0, 0.0)]),
            Scan::new(
                3.0,
                3,
                vec![MassPoint::new(100.0, 3.0), MassPoint::new(101.0, 1.0)],
            ),
        ]
        .into_iter()
        .collect();
        let trace = CentroidTrace::from_spectrum(&spectrum);
        assert_eq!(trace.times, vec![1.0, 3.0]);
        assert_eq!(trace.centroids, vec![100.5, 100.25]);
        assert_eq!(trace.fit(), Err(FitError::InsufficientPoints(2)));
    }

    #[test]
    fn test_spectrum_curvature_of_bent_trace() -> Result<(), FitError> {
        let make = |bend: f64| -> Spectrum {
            (0..9)
                .map(|i| {
                    let t = i as f64;
                    let shift = bend * (t - 4.0).powi(2);
                    Scan::new(
                        t,
                        i,
                        vec![
                            MassPoint::new(200.0 + shift, 10.0),
                            MassPoint::new(200.1 + shift, 10.0),
                        ],
                    )
                })
                .collect()
        };
        let flat = spectrum_curvature(&make(0.0))?;
        let bent = spectrum_curvature(&make(0.01))?;
        let more = spectrum_curvature(&make(0.02))?;
        assert!(flat < 1e-9, "{flat}");
        assert!(bent > flat);
        assert!(more > bent);
        // A parabola has constant second derivative 2 * bend
        assert_is_close!(bent, 9.0 * 0.02 / (1.0f64).powf(1.5), 0.05, "curvature");
        Ok(())
    }
}
