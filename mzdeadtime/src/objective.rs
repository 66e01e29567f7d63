/*! Score candidate dead time parameters by how smooth they make the centroid traces of
a set of peak clusters.

A peak cluster is a [`Spectrum`] holding one isotopic cluster across its elution. When
the dead time parameters are right, the corrected intensity-weighted centroid drifts
smoothly over time, and the summed curvature of its cubic fit is small.
*/
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::curvature::{CentroidTrace, FitError};
use crate::deadtime::{CorrectionError, DeadTimeCorrector, DeadTimeParams};
use crate::instrument::{InstrumentModel, InstrumentModelError};
use crate::optimize::{Bounds, OptimizationError};
use crate::spectrum::{ScanFilter, Spectrum};

/// The score contributed by a spectrum that could not be corrected or fitted
pub const CORRECTION_FAILURE_PENALTY: f64 = 1e10;

/// An error that might occur when turning a parameter vector into a correction
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterError {
    #[error("Expected {expected} parameters, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    InvalidModel(#[from] InstrumentModelError),
}

/// Which quantities a parameter vector holds
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParameterSpace {
    /// `[non_extending_ns, extending_ns]` with a fixed instrument model
    DeadTime { model: InstrumentModel },
    /// `[non_extending_ns, extending_ns, pulses_per_scan, flight_time_coefficient]`
    DeadTimeAndInstrument,
}

impl ParameterSpace {
    pub fn dimension(&self) -> usize {
        match self {
            Self::DeadTime { .. } => 2,
            Self::DeadTimeAndInstrument => 4,
        }
    }

    pub fn decode(&self, x: &[f64]) -> Result<(InstrumentModel, DeadTimeParams), ParameterError> {
        if x.len() != self.dimension() {
            return Err(ParameterError::DimensionMismatch {
                expected: self.dimension(),
                actual: x.len(),
            });
        }
        let params = DeadTimeParams::new(x[0], x[1]);
        let model = match self {
            Self::DeadTime { model } => *model,
            Self::DeadTimeAndInstrument => InstrumentModel::new(x[2], x[3])?,
        };
        Ok((model, params))
    }

    pub fn encode(&self, model: &InstrumentModel, params: &DeadTimeParams) -> Vec<f64> {
        match self {
            Self::DeadTime { .. } => vec![params.non_extending, params.extending],
            Self::DeadTimeAndInstrument => vec![
                params.non_extending,
                params.extending,
                model.pulses_per_scan(),
                model.flight_time_coefficient(),
            ],
        }
    }

    /// Search bounds around a starting point.
    ///
    /// Dead times range over `[0, 2 × initial]`, or `[0, 10]` and `[0, 4]` ns when the
    /// initial value is zero. The instrument parameters may move by 10%.
    pub fn default_bounds(
        &self,
        model: &InstrumentModel,
        params: &DeadTimeParams,
    ) -> Result<Bounds, OptimizationError> {
        let upper_or = |value: f64, fallback: f64| {
            if value > 0.0 {
                2.0 * value
            } else {
                fallback
            }
        };
        let mut pairs = vec![
            (0.0, upper_or(params.non_extending, 10.0)),
            (0.0, upper_or(params.extending, 4.0)),
        ];
        if let Self::DeadTimeAndInstrument = self {
            let pulses = model.pulses_per_scan();
            let coefficient = model.flight_time_coefficient();
            pairs.push((pulses * 0.9, pulses * 1.1));
            pairs.push((coefficient * 0.9, coefficient * 1.1));
        }
        Bounds::from_pairs(&pairs)
    }
}

/// The outcome of scoring a single spectrum
#[derive(Debug, Clone, PartialEq)]
pub enum SpectrumScore {
    Curvature(f64),
    CorrectionFailed(CorrectionError),
    FitFailed(FitError),
}

impl SpectrumScore {
    pub fn value(&self) -> f64 {
        match self {
            Self::Curvature(c) if c.is_finite() => c.abs(),
            _ => CORRECTION_FAILURE_PENALTY,
        }
    }

    pub fn is_penalty(&self) -> bool {
        !matches!(self, Self::Curvature(c) if c.is_finite())
    }
}

/// The summed curvature of corrected centroid traces as a function of a parameter
/// vector. Lower is better.
#[derive(Debug, Clone)]
pub struct CurvatureObjective {
    spectra: Vec<Spectrum>,
    space: ParameterSpace,
    parallel: bool,
}

impl CurvatureObjective {
    pub fn new(spectra: Vec<Spectrum>, space: ParameterSpace) -> Self {
        Self {
            spectra,
            space,
            parallel: false,
        }
    }

    /// Build the objective from the spectra that pass `filter`, dropping the rest
    pub fn with_filter(spectra: Vec<Spectrum>, space: ParameterSpace, filter: &ScanFilter) -> Self {
        let total = spectra.len();
        let spectra: Vec<Spectrum> = spectra
            .into_iter()
            .filter_map(|spectrum| filter.apply(spectrum))
            .collect();
        if spectra.len() < total {
            warn!(
                "{} of {total} spectra had too few usable scans and were dropped",
                total - spectra.len()
            );
        }
        Self::new(spectra, space)
    }

    /// Score spectra on the rayon thread pool. The total is identical either way.
    pub fn with_parallelism(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn spectra(&self) -> &[Spectrum] {
        &self.spectra
    }

    pub fn space(&self) -> &ParameterSpace {
        &self.space
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }

    fn score(corrector: &DeadTimeCorrector, spectrum: &Spectrum) -> SpectrumScore {
        let corrected = match corrector.correct(spectrum) {
            Ok(corrected) => corrected,
            Err(e) => return SpectrumScore::CorrectionFailed(e),
        };
        let trace = CentroidTrace::from_spectrum(&corrected);
        match trace.fit() {
            Ok(fit) => SpectrumScore::Curvature(fit.total_curvature(&trace.times)),
            Err(e) => SpectrumScore::FitFailed(e),
        }
    }

    /// The score of every spectrum for a correction
    pub fn breakdown_params(
        &self,
        model: InstrumentModel,
        params: DeadTimeParams,
    ) -> Vec<SpectrumScore> {
        let corrector = DeadTimeCorrector::new(model, params);
        if self.parallel {
            self.spectra
                .par_iter()
                .map(|spectrum| Self::score(&corrector, spectrum))
                .collect()
        } else {
            self.spectra
                .iter()
                .map(|spectrum| Self::score(&corrector, spectrum))
                .collect()
        }
    }

    /// The score of every spectrum for a parameter vector
    pub fn breakdown(&self, x: &[f64]) -> Result<Vec<SpectrumScore>, ParameterError> {
        let (model, params) = self.space.decode(x)?;
        Ok(self.breakdown_params(model, params))
    }

    pub fn evaluate_params(&self, model: InstrumentModel, params: DeadTimeParams) -> f64 {
        let scores = self.breakdown_params(model, params);
        let failures = scores.iter().filter(|s| s.is_penalty()).count();
        if failures > 0 {
            debug!(
                "{failures} of {} spectra failed with {params}",
                scores.len()
            );
        }
        scores.iter().map(SpectrumScore::value).sum()
    }

    /// Score a parameter vector. Vectors that do not decode to a valid correction
    /// receive the failure penalty for every spectrum.
    pub fn evaluate(&self, x: &[f64]) -> f64 {
        match self.space.decode(x) {
            Ok((model, params)) => self.evaluate_params(model, params),
            Err(e) => {
                debug!("Invalid parameters {x:?}: {e}");
                CORRECTION_FAILURE_PENALTY * self.spectra.len().max(1) as f64
            }
        }
    }
}
