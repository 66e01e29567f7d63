/*! Correction of time-of-flight detector dead time

An ion arriving at the detector shortly after another one may go unrecorded. Two
windows after each detected arrival are considered:

- the *non-extending* window, during which the detector cannot register a new arrival
  but is not itself re-triggered by one, and
- the *extending* window, inside the non-extending one, during which an arrival
  re-arms the dead time and so blocks the detector for longer.

The intensities of a scan are corrected in order of increasing flight time. The
correction of each m/z depends on the raw intensities of earlier m/z inside the
non-extending window and on the already corrected intensities of earlier m/z inside the
extending window.
*/
use std::fmt::Display;

use thiserror::Error;
use tracing::{debug, trace};

use crate::instrument::InstrumentModel;
use crate::spectrum::{Scan, Spectrum};

/// The non-extending and extending dead times of the detector, in nanoseconds.
///
/// The physical regime is `0 <= extending <= non_extending`, but this is not enforced
/// so that an optimizer may wander outside it. Correction remains well defined for any
/// finite values.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct DeadTimeParams {
    pub non_extending: f64,
    pub extending: f64,
}

impl DeadTimeParams {
    pub fn new(non_extending: f64, extending: f64) -> Self {
        Self {
            non_extending,
            extending,
        }
    }

    /// The non-extending dead time in seconds
    #[inline]
    pub fn non_extending_window(&self) -> f64 {
        self.non_extending * 1e-9
    }

    /// The extending dead time in seconds
    #[inline]
    pub fn extending_window(&self) -> f64 {
        self.extending * 1e-9
    }

    pub fn is_physical(&self) -> bool {
        self.extending >= 0.0 && self.extending <= self.non_extending
    }
}

impl Display for DeadTimeParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "non-extending={:.3} ns, extending={:.3} ns",
            self.non_extending, self.extending
        )
    }
}

/// Why a measured intensity could not be explained by the dead time model
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InvalidInputReason {
    /// The implied detection probability was not below 1
    ProbabilityOutOfRange(f64),
    /// Earlier arrivals consumed every pulse of the scan
    NoUnblockedPulses(f64),
}

impl Display for InvalidInputReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidInputReason::ProbabilityOutOfRange(p) => {
                write!(f, "detection probability {p} is not below 1")
            }
            InvalidInputReason::NoUnblockedPulses(n) => {
                write!(f, "only {n} pulses were left unblocked")
            }
        }
    }
}

/// An error that might occur during dead time correction
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CorrectionError {
    #[error("Invalid input for dead time correction at scan time {scan_time}, m/z {mz}: {reason}. The data may already be corrected or the dead times may be inconsistent with it")]
    InvalidCorrectionInput {
        scan_time: f64,
        mz: f64,
        reason: InvalidInputReason,
    },
}

impl CorrectionError {
    pub fn scan_time(&self) -> f64 {
        match self {
            CorrectionError::InvalidCorrectionInput { scan_time, .. } => *scan_time,
        }
    }

    pub fn mz(&self) -> f64 {
        match self {
            CorrectionError::InvalidCorrectionInput { mz, .. } => *mz,
        }
    }
}

/// Where an earlier arrival falls relative to the dead time windows of a later one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadTimeWindow {
    /// Too far back to interact with the current arrival, or anything before it
    Outside,
    /// Consumes pulses but does not extend the dead time
    NonExtending,
    /// Extends the dead time over the current arrival
    Extending,
}

/// Applies dead time correction with a fixed [`InstrumentModel`] and [`DeadTimeParams`].
///
/// Holds no state besides its parameters, so it is cheap to copy and may be shared
/// between threads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeadTimeCorrector {
    model: InstrumentModel,
    params: DeadTimeParams,
    non_extending_window: f64,
    extending_window: f64,
}

impl DeadTimeCorrector {
    pub fn new(model: InstrumentModel, params: DeadTimeParams) -> Self {
        Self {
            model,
            params,
            non_extending_window: params.non_extending_window(),
            extending_window: params.extending_window(),
        }
    }

    pub fn model(&self) -> &InstrumentModel {
        &self.model
    }

    pub fn params(&self) -> &DeadTimeParams {
        &self.params
    }

    #[inline]
    fn window_of(&self, delta: f64) -> DeadTimeWindow {
        if delta > self.non_extending_window {
            DeadTimeWindow::Outside
        } else if delta > self.extending_window {
            DeadTimeWindow::NonExtending
        } else {
            DeadTimeWindow::Extending
        }
    }

    fn flight_times(&self, scan: &Scan) -> Vec<f64> {
        scan.mzs().map(|mz| self.model.flight_time(mz)).collect()
    }

    /// Walk backwards from `position` over the earlier arrivals of a scan, accumulating
    /// the pulses still available to the arrival at `position` and the intensity
    /// blocking it.
    ///
    /// `consumed` holds the intensities that count against the available pulses and
    /// `blocking` the intensities that extend the dead time, both for indices before
    /// `position`.
    #[inline]
    fn exposure(
        &self,
        flight_times: &[f64],
        position: usize,
        consumed: impl Fn(usize) -> f64,
        blocking: impl Fn(usize) -> f64,
    ) -> (f64, f64) {
        let flight_time = flight_times[position];
        let mut pulses_not_hit = self.model.pulses_per_scan();
        let mut pulses_blocked = 0.0;
        for j in (0..position).rev() {
            match self.window_of(flight_time - flight_times[j]) {
                DeadTimeWindow::Outside => break,
                DeadTimeWindow::NonExtending => pulses_not_hit -= consumed(j),
                DeadTimeWindow::Extending => pulses_blocked += blocking(j),
            }
        }
        (pulses_not_hit, pulses_blocked)
    }

    /// Correct a single scan. The result has the same time, index and m/z keys.
    pub fn correct_scan(&self, scan: &Scan) -> Result<Scan, CorrectionError> {
        let pulses = self.model.pulses_per_scan();
        let points = scan.points();
        let flight_times = self.flight_times(scan);
        let mut corrected: Vec<f64> = Vec::with_capacity(points.len());

        for (i, point) in points.iter().enumerate() {
            let (pulses_not_hit, pulses_blocked) = self.exposure(
                &flight_times,
                i,
                |j| points[j].intensity,
                |j| corrected[j],
            );

            let invalid = |reason| CorrectionError::InvalidCorrectionInput {
                scan_time: scan.time,
                mz: point.mz,
                reason,
            };

            if !(pulses_not_hit > 0.0) || !pulses_not_hit.is_finite() {
                return Err(invalid(InvalidInputReason::NoUnblockedPulses(
                    pulses_not_hit,
                )));
            }

            let probability = point.intensity * (pulses_blocked / pulses).exp() / pulses_not_hit;
            if !(probability < 1.0) || !probability.is_finite() {
                return Err(invalid(InvalidInputReason::ProbabilityOutOfRange(
                    probability,
                )));
            }

            corrected.push(-(-probability).ln_1p() * pulses);
        }

        Ok(scan.with_intensities(corrected))
    }

    /// Correct every scan of `spectrum`.
    ///
    /// Either every scan is corrected or an error describing the first offending point
    /// is returned.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn correct(&self, spectrum: &Spectrum) -> Result<Spectrum, CorrectionError> {
        let scans = spectrum
            .iter()
            .map(|scan| self.correct_scan(scan))
            .collect::<Result<Vec<_>, _>>()?;
        trace!("Corrected {} scans with {}", scans.len(), self.params);
        Ok(Spectrum::new(scans))
    }

    /// Simulate the effect of dead time on a single scan of true intensities.
    ///
    /// This is the inverse of [`DeadTimeCorrector::correct_scan`].
    pub fn distort_scan(&self, scan: &Scan) -> Result<Scan, CorrectionError> {
        let pulses = self.model.pulses_per_scan();
        let points = scan.points();
        let flight_times = self.flight_times(scan);
        let mut measured: Vec<f64> = Vec::with_capacity(points.len());

        for (i, point) in points.iter().enumerate() {
            let (pulses_not_hit, pulses_blocked) = self.exposure(
                &flight_times,
                i,
                |j| measured[j],
                |j| points[j].intensity,
            );
            if !(pulses_not_hit > 0.0) || !pulses_not_hit.is_finite() {
                return Err(CorrectionError::InvalidCorrectionInput {
                    scan_time: scan.time,
                    mz: point.mz,
                    reason: InvalidInputReason::NoUnblockedPulses(pulses_not_hit),
                });
            }
            let probability = -(-point.intensity / pulses).exp_m1();
            measured.push(probability * pulses_not_hit / (pulses_blocked / pulses).exp());
        }

        Ok(scan.with_intensities(measured))
    }

    /// Simulate the effect of dead time on every scan of `spectrum`
    pub fn distort(&self, spectrum: &Spectrum) -> Result<Spectrum, CorrectionError> {
        let scans = spectrum
            .iter()
            .map(|scan| self.distort_scan(scan))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Spectrum::new(scans))
    }
}

/// Correct `spectrum` for dead time.
///
/// # Arguments
/// - `model`: The pulse rate and flight time relationship of the instrument
/// - `params`: The dead times to correct for
/// - `spectrum`: The measured intensities, left untouched
///
/// # Errors
/// [`CorrectionError::InvalidCorrectionInput`] if any measured intensity is too large to
/// be produced under `params`. No partially corrected spectrum is returned.
///
/// # See also
/// [`DeadTimeCorrector::correct`]
pub fn correct_dead_time(
    model: InstrumentModel,
    params: DeadTimeParams,
    spectrum: &Spectrum,
) -> Result<Spectrum, CorrectionError> {
    let corrector = DeadTimeCorrector::new(model, params);
    let result = corrector.correct(spectrum);
    if let Err(e) = &result {
        debug!("Dead time correction failed with {params}: {e}");
    }
    result
}

/// Produce the intensities a detector with dead time would measure for the true
/// intensities in `spectrum`.
///
/// # See also
/// [`DeadTimeCorrector::distort`]
pub fn apply_dead_time(
    model: InstrumentModel,
    params: DeadTimeParams,
    spectrum: &Spectrum,
) -> Result<Spectrum, CorrectionError> {
    DeadTimeCorrector::new(model, params).distort(spectrum)
}
