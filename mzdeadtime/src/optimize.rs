/*! Bounded derivative-free minimizers for black box objectives.

The dead time objective is noisy, non-smooth where corrections start failing and cheap
enough to evaluate many times, so only methods that need function values are offered.
*/
use std::cmp::Ordering;

use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, trace};

/// An error that might occur before a minimizer can start searching
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizationError {
    #[error("Expected a vector of {expected} parameters, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Invalid bounds for parameter {index}: [{lower}, {upper}]")]
    InvalidBounds { index: usize, lower: f64, upper: f64 },
    #[error("The search space has no dimensions")]
    Empty,
}

/// Inclusive box constraints on each parameter
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Bounds {
    lower: Vec<f64>,
    upper: Vec<f64>,
}

impl Bounds {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self, OptimizationError> {
        if lower.len() != upper.len() {
            return Err(OptimizationError::DimensionMismatch {
                expected: lower.len(),
                actual: upper.len(),
            });
        }
        if lower.is_empty() {
            return Err(OptimizationError::Empty);
        }
        for (index, (lo, hi)) in lower.iter().zip(upper.iter()).enumerate() {
            if !lo.is_finite() || !hi.is_finite() || lo > hi {
                return Err(OptimizationError::InvalidBounds {
                    index,
                    lower: *lo,
                    upper: *hi,
                });
            }
        }
        Ok(Self { lower, upper })
    }

    pub fn from_pairs(pairs: &[(f64, f64)]) -> Result<Self, OptimizationError> {
        let (lower, upper) = pairs.iter().copied().unzip();
        Self::new(lower, upper)
    }

    pub fn dimension(&self) -> usize {
        self.lower.len()
    }

    pub fn lower(&self) -> &[f64] {
        &self.lower
    }

    pub fn upper(&self) -> &[f64] {
        &self.upper
    }

    pub fn width(&self, index: usize) -> f64 {
        self.upper[index] - self.lower[index]
    }

    pub fn center(&self) -> Vec<f64> {
        self.lower
            .iter()
            .zip(self.upper.iter())
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect()
    }

    pub fn contains(&self, x: &[f64]) -> bool {
        x.len() == self.dimension()
            && x
                .iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .all(|(v, (lo, hi))| lo <= v && v <= hi)
    }

    /// Move every coordinate of `x` into its interval
    pub fn clamp(&self, x: &mut [f64]) {
        for (v, (lo, hi)) in x.iter_mut().zip(self.lower.iter().zip(self.upper.iter())) {
            *v = if v.is_nan() { *lo } else { v.clamp(*lo, *hi) };
        }
    }

    fn check(&self, x: &[f64]) -> Result<(), OptimizationError> {
        if x.len() != self.dimension() {
            Err(OptimizationError::DimensionMismatch {
                expected: self.dimension(),
                actual: x.len(),
            })
        } else {
            Ok(())
        }
    }
}

/// The best point found by a [`Minimizer`]
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OptimizationResult {
    pub x: Vec<f64>,
    pub value: f64,
    pub evaluations: usize,
    pub iterations: usize,
}

/// A method for finding a low point of a function inside a box
pub trait Minimizer {
    /// Search for the minimum of `objective` inside `bounds`, starting from `x0`.
    ///
    /// `x0` is clamped into `bounds` before it is evaluated. Non-finite objective values
    /// are treated as positive infinity.
    fn minimize<F: FnMut(&[f64]) -> f64>(
        &mut self,
        objective: F,
        x0: &[f64],
        bounds: &Bounds,
    ) -> Result<OptimizationResult, OptimizationError>;
}

/// Counts calls and maps NaN to infinity
struct Counted<F> {
    objective: F,
    evaluations: usize,
}

impl<F: FnMut(&[f64]) -> f64> Counted<F> {
    fn new(objective: F) -> Self {
        Self {
            objective,
            evaluations: 0,
        }
    }

    fn call(&mut self, x: &[f64]) -> f64 {
        self.evaluations += 1;
        let value = (self.objective)(x);
        if value.is_nan() {
            f64::INFINITY
        } else {
            value
        }
    }
}

fn by_value(a: &(Vec<f64>, f64), b: &(Vec<f64>, f64)) -> Ordering {
    a.1.total_cmp(&b.1)
}

/// The Nelder-Mead downhill simplex, with every vertex clamped to the bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NelderMead {
    pub max_evaluations: usize,
    /// Stop once both the spread of the vertex values and the largest vertex distance
    /// from the best vertex fall below this
    pub tolerance: f64,
    /// The initial simplex edge as a fraction of each parameter's bound width
    pub initial_step: f64,
    pub reflection: f64,
    pub expansion: f64,
    pub contraction: f64,
    pub shrink: f64,
}

impl Default for NelderMead {
    fn default() -> Self {
        Self {
            max_evaluations: 1000,
            tolerance: 1e-4,
            initial_step: 0.05,
            reflection: 1.0,
            expansion: 2.0,
            contraction: 0.5,
            shrink: 0.5,
        }
    }
}

impl NelderMead {
    pub fn new(max_evaluations: usize, tolerance: f64) -> Self {
        Self {
            max_evaluations,
            tolerance,
            ..Default::default()
        }
    }

    fn initial_simplex(&self, x0: &[f64], bounds: &Bounds) -> Vec<Vec<f64>> {
        let mut simplex = vec![x0.to_vec()];
        for i in 0..x0.len() {
            let mut vertex = x0.to_vec();
            let width = bounds.width(i);
            let step = if width > 0.0 {
                self.initial_step * width
            } else {
                0.0
            };
            vertex[i] = if x0[i] + step <= bounds.upper()[i] {
                x0[i] + step
            } else {
                x0[i] - step
            };
            simplex.push(vertex);
        }
        simplex
    }

    fn converged(&self, vertices: &[(Vec<f64>, f64)]) -> bool {
        let (best, best_value) = &vertices[0];
        let value_spread = vertices[1..]
            .iter()
            .map(|(_, v)| (v - best_value).abs())
            .fold(0.0, f64::max);
        let point_spread = vertices[1..]
            .iter()
            .flat_map(|(x, _)| x.iter().zip(best.iter()).map(|(a, b)| (a - b).abs()))
            .fold(0.0, f64::max);
        value_spread <= self.tolerance && point_spread <= self.tolerance
    }
}

/// `origin + scale * (target - origin)`, clamped
fn step_toward(origin: &[f64], target: &[f64], scale: f64, bounds: &Bounds) -> Vec<f64> {
    let mut x: Vec<f64> = origin
        .iter()
        .zip(target.iter())
        .map(|(o, t)| o + scale * (t - o))
        .collect();
    bounds.clamp(&mut x);
    x
}

impl Minimizer for NelderMead {
    fn minimize<F: FnMut(&[f64]) -> f64>(
        &mut self,
        objective: F,
        x0: &[f64],
        bounds: &Bounds,
    ) -> Result<OptimizationResult, OptimizationError> {
        bounds.check(x0)?;
        let mut f = Counted::new(objective);
        let n = x0.len();

        let mut start = x0.to_vec();
        bounds.clamp(&mut start);
        let mut vertices: Vec<(Vec<f64>, f64)> = self
            .initial_simplex(&start, bounds)
            .into_iter()
            .map(|x| {
                let v = f.call(&x);
                (x, v)
            })
            .collect();

        let mut iterations = 0;
        while f.evaluations < self.max_evaluations {
            vertices.sort_by(by_value);
            if self.converged(&vertices) {
                break;
            }
            iterations += 1;

            let mut centroid = vec![0.0; n];
            for (x, _) in vertices[..n].iter() {
                for (c, v) in centroid.iter_mut().zip(x.iter()) {
                    *c += v / n as f64;
                }
            }
            let best_value = vertices[0].1;
            let second_worst_value = vertices[n - 1].1;
            let (worst, worst_value) = vertices[n].clone();

            let reflected = step_toward(&centroid, &worst, -self.reflection, bounds);
            let reflected_value = f.call(&reflected);

            if reflected_value < best_value {
                let expanded = step_toward(&centroid, &reflected, self.expansion, bounds);
                let expanded_value = f.call(&expanded);
                vertices[n] = if expanded_value < reflected_value {
                    (expanded, expanded_value)
                } else {
                    (reflected, reflected_value)
                };
                continue;
            }
            if reflected_value < second_worst_value {
                vertices[n] = (reflected, reflected_value);
                continue;
            }

            let (contracted, threshold) = if reflected_value < worst_value {
                (
                    step_toward(&centroid, &reflected, self.contraction, bounds),
                    reflected_value,
                )
            } else {
                (
                    step_toward(&centroid, &worst, self.contraction, bounds),
                    worst_value,
                )
            };
            let contracted_value = f.call(&contracted);
            if contracted_value < threshold {
                vertices[n] = (contracted, contracted_value);
                continue;
            }

            let best = vertices[0].0.clone();
            for vertex in vertices[1..].iter_mut() {
                let x = step_toward(&best, &vertex.0, self.shrink, bounds);
                let v = f.call(&x);
                *vertex = (x, v);
            }
        }

        vertices.sort_by(by_value);
        let (x, value) = vertices.swap_remove(0);
        debug!(
            "Nelder-Mead finished after {iterations} iterations and {} evaluations at {value}",
            f.evaluations
        );
        Ok(OptimizationResult {
            x,
            value,
            evaluations: f.evaluations,
            iterations,
        })
    }
}

/// Simulated annealing with a fast (Cauchy-like) visiting distribution and
/// Metropolis acceptance.
///
/// Step sizes scale with the current temperature relative to the initial temperature,
/// so the search narrows as the system cools. The best point ever visited is returned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedAnnealing {
    pub seed: u64,
    pub max_evaluations: usize,
    /// When absent, estimated from a sample of random points in the bounds
    pub initial_temperature: Option<f64>,
    pub cooling: f64,
    pub steps_per_temperature: usize,
    /// The number of random points used to estimate the initial temperature
    pub temperature_samples: usize,
}

impl Default for SimulatedAnnealing {
    fn default() -> Self {
        Self {
            seed: 1,
            max_evaluations: 1000,
            initial_temperature: None,
            cooling: 0.95,
            steps_per_temperature: 10,
            temperature_samples: 10,
        }
    }
}

impl SimulatedAnnealing {
    pub fn new(seed: u64, max_evaluations: usize) -> Self {
        Self {
            seed,
            max_evaluations,
            ..Default::default()
        }
    }

    fn random_point(rng: &mut StdRng, bounds: &Bounds) -> Vec<f64> {
        bounds
            .lower()
            .iter()
            .zip(bounds.upper().iter())
            .map(|(lo, hi)| if lo < hi { rng.gen_range(*lo..=*hi) } else { *lo })
            .collect()
    }

    fn estimate_temperature<F: FnMut(&[f64]) -> f64>(
        &self,
        f: &mut Counted<F>,
        rng: &mut StdRng,
        bounds: &Bounds,
        best: &mut (Vec<f64>, f64),
    ) -> f64 {
        let mut samples = Vec::with_capacity(self.temperature_samples);
        for _ in 0..self.temperature_samples {
            if f.evaluations >= self.max_evaluations {
                break;
            }
            let x = Self::random_point(rng, bounds);
            let v = f.call(&x);
            if v < best.1 {
                *best = (x, v);
            }
            if v.is_finite() {
                samples.push(v);
            }
        }
        if samples.len() < 2 {
            return 1.0;
        }
        samples.sort_by(f64::total_cmp);
        let median = samples[samples.len() / 2];
        let temperature = 1.5 * (median - samples[0]);
        if temperature > 0.0 && temperature.is_finite() {
            temperature
        } else {
            1.0
        }
    }

    fn visit(&self, rng: &mut StdRng, x: &[f64], relative: f64, bounds: &Bounds) -> Vec<f64> {
        // A vanishing temperature ratio would turn the step into `0 * inf`
        let relative = relative.max(f64::EPSILON);
        let mut candidate: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, xi)| {
                let u: f64 = rng.gen();
                let sign = if u < 0.5 { -1.0 } else { 1.0 };
                let magnitude =
                    relative * ((1.0 + 1.0 / relative).powf((2.0 * u - 1.0).abs()) - 1.0);
                xi + sign * magnitude * bounds.width(i)
            })
            .collect();
        bounds.clamp(&mut candidate);
        candidate
    }
}

impl Minimizer for SimulatedAnnealing {
    fn minimize<F: FnMut(&[f64]) -> f64>(
        &mut self,
        objective: F,
        x0: &[f64],
        bounds: &Bounds,
    ) -> Result<OptimizationResult, OptimizationError> {
        bounds.check(x0)?;
        let mut f = Counted::new(objective);
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut current = x0.to_vec();
        bounds.clamp(&mut current);
        let mut current_value = f.call(&current);
        let mut best = (current.clone(), current_value);

        let initial_temperature = match self.initial_temperature {
            Some(t) if t > 0.0 && t.is_finite() => t,
            _ => self.estimate_temperature(&mut f, &mut rng, bounds, &mut best),
        };
        let mut temperature = initial_temperature;
        let steps = self.steps_per_temperature.max(1);
        let mut iterations = 0;
        trace!("Starting annealing at temperature {initial_temperature}");

        while f.evaluations < self.max_evaluations {
            iterations += 1;
            let relative = temperature / initial_temperature;
            for _ in 0..steps {
                if f.evaluations >= self.max_evaluations {
                    break;
                }
                let candidate = self.visit(&mut rng, &current, relative, bounds);
                let value = f.call(&candidate);
                let delta = value - current_value;
                let accept = delta <= 0.0
                    || (delta.is_finite() && rng.gen::<f64>() < (-delta / temperature).exp());
                if accept {
                    current = candidate;
                    current_value = value;
                    if current_value < best.1 {
                        best = (current.clone(), current_value);
                    }
                }
            }
            temperature *= self.cooling;
            if !(temperature > 0.0) {
                break;
            }
        }

        debug!(
            "Annealing finished after {iterations} temperature levels and {} evaluations at {}",
            f.evaluations, best.1
        );
        Ok(OptimizationResult {
            x: best.0,
            value: best.1,
            evaluations: f.evaluations,
            iterations,
        })
    }
}

/// Exhaustively evaluate a regular grid over the bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSearch {
    pub points_per_dim: usize,
}

impl Default for GridSearch {
    fn default() -> Self {
        Self { points_per_dim: 10 }
    }
}

impl GridSearch {
    pub fn new(points_per_dim: usize) -> Self {
        Self { points_per_dim }
    }

    fn axis(&self, lower: f64, upper: f64) -> Vec<f64> {
        let n = self.points_per_dim.max(1);
        if n == 1 || lower == upper {
            return vec![(lower + upper) / 2.0];
        }
        let step = (upper - lower) / (n - 1) as f64;
        (0..n).map(|i| lower + step * i as f64).collect()
    }

    /// Every grid point with its value, the last axis varying fastest
    pub fn evaluate_grid<F: FnMut(&[f64]) -> f64>(
        &self,
        mut objective: F,
        bounds: &Bounds,
    ) -> Vec<(Vec<f64>, f64)> {
        bounds
            .lower()
            .iter()
            .zip(bounds.upper().iter())
            .map(|(lo, hi)| self.axis(*lo, *hi))
            .multi_cartesian_product()
            .map(|x| {
                let v = objective(&x);
                (x, v)
            })
            .collect()
    }
}

impl Minimizer for GridSearch {
    fn minimize<F: FnMut(&[f64]) -> f64>(
        &mut self,
        objective: F,
        x0: &[f64],
        bounds: &Bounds,
    ) -> Result<OptimizationResult, OptimizationError> {
        bounds.check(x0)?;
        let mut f = Counted::new(objective);
        let grid = self.evaluate_grid(|x| f.call(x), bounds);
        let iterations = grid.len();
        let (x, value) = grid
            .into_iter()
            .min_by(by_value)
            .ok_or(OptimizationError::Empty)?;
        Ok(OptimizationResult {
            x,
            value,
            evaluations: f.evaluations,
            iterations,
        })
    }
}
