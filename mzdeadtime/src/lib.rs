//! Dead time correction for time-of-flight mass spectra, and calibration of the dead
//! time parameters from the curvature of peak centroid traces.
//!
//! A time-of-flight detector that registers an ion is blind for a short period after it.
//! Ions of nearby m/z arriving during that window are lost, which depresses the
//! intensity of the later peaks of dense isotopic clusters. [`DeadTimeCorrector`]
//! inverts this using a non-extending and an extending dead time, and
//! [`CurvatureObjective`] scores candidate dead times for use with a [`Minimizer`].
pub mod curvature;
pub mod deadtime;
pub mod instrument;
pub mod objective;
pub mod optimize;
pub mod spectrum;

pub use crate::curvature::{spectrum_curvature, CentroidTrace, CubicFit, FitError};
pub use crate::deadtime::{
    apply_dead_time, correct_dead_time, CorrectionError, DeadTimeCorrector, DeadTimeParams,
    InvalidInputReason,
};
pub use crate::instrument::{InstrumentConstants, InstrumentModel, InstrumentModelError};
pub use crate::objective::{
    CurvatureObjective, ParameterError, ParameterSpace, SpectrumScore,
    CORRECTION_FAILURE_PENALTY,
};
pub use crate::optimize::{
    Bounds, GridSearch, Minimizer, NelderMead, OptimizationError, OptimizationResult,
    SimulatedAnnealing,
};
pub use crate::spectrum::{MassPoint, Scan, ScanFilter, Spectrum};
