/*! Time-of-flight instrument constants and the flight time model derived from them */
use thiserror::Error;

/// The elementary charge per atomic mass unit, in C/kg.
pub const E_AMU: f64 = 96485333.7;

/// Default scan time in seconds
pub const DEFAULT_SCAN_TIME: f64 = 0.23;
/// Default extraction pulse cycle time in μs
pub const DEFAULT_CYCLE_TIME: f64 = 45.0;
/// Default effective flight path length in mm
pub const DEFAULT_PATH_LENGTH: f64 = 1078.0;
/// Default effective accelerating voltage in V
pub const DEFAULT_VOLTAGE: f64 = 5630.0;

/// An error that might occur when building an [`InstrumentModel`]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InstrumentModelError {
    #[error("The number of pulses per scan must be positive, got {0}")]
    NonPositivePulses(f64),
    #[error("The flight time coefficient must be positive, got {0}")]
    NonPositiveCoefficient(f64),
    #[error("The accelerating voltage must be positive, got {0} V")]
    NonPositiveVoltage(f64),
    #[error("The cycle time must be positive, got {0} μs")]
    NonPositiveCycleTime(f64),
    #[error("The flight path length must be positive, got {0} mm")]
    NonPositivePathLength(f64),
}

/// The raw acquisition settings of a time-of-flight instrument, in the units they are
/// usually reported in.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct InstrumentConstants {
    /// The time spent accumulating one scan, in seconds
    pub scan_time: f64,
    /// The time between extraction pulses, in μs
    pub cycle_time: f64,
    /// The effective flight path length, in mm
    pub path_length: f64,
    /// The effective accelerating voltage, in V
    pub voltage: f64,
}

impl Default for InstrumentConstants {
    fn default() -> Self {
        Self {
            scan_time: DEFAULT_SCAN_TIME,
            cycle_time: DEFAULT_CYCLE_TIME,
            path_length: DEFAULT_PATH_LENGTH,
            voltage: DEFAULT_VOLTAGE,
        }
    }
}

impl InstrumentConstants {
    pub fn new(scan_time: f64, cycle_time: f64, path_length: f64, voltage: f64) -> Self {
        Self {
            scan_time,
            cycle_time,
            path_length,
            voltage,
        }
    }

    /// The cycle time in seconds
    pub fn cycle_time_seconds(&self) -> f64 {
        self.cycle_time * 1e-6
    }

    /// Derive the [`InstrumentModel`] for these settings.
    ///
    /// ```math
    /// \begin{split}
    ///     P &= \frac{t_{scan}}{t_{cycle}} \\
    ///     A &= \frac{L}{\sqrt{2 (e/u) V}}
    /// \end{split}
    /// ```
    pub fn build(&self) -> Result<InstrumentModel, InstrumentModelError> {
        if !(self.cycle_time > 0.0) {
            return Err(InstrumentModelError::NonPositiveCycleTime(self.cycle_time));
        }
        if !(self.voltage > 0.0) {
            return Err(InstrumentModelError::NonPositiveVoltage(self.voltage));
        }
        if !(self.path_length > 0.0) {
            return Err(InstrumentModelError::NonPositivePathLength(
                self.path_length,
            ));
        }
        let pulses_per_scan = self.scan_time / self.cycle_time_seconds();
        let flight_time_coefficient =
            (self.path_length * 1e-3) / (2.0 * E_AMU * self.voltage).sqrt();
        InstrumentModel::new(pulses_per_scan, flight_time_coefficient)
    }
}

/// The pulsing rate and the flight time as a function of m/z of a time-of-flight
/// instrument.
///
/// The flight time is $`t = A \sqrt{m/z}`$, which is strictly increasing in m/z.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InstrumentModel {
    pulses_per_scan: f64,
    flight_time_coefficient: f64,
}

impl InstrumentModel {
    pub fn new(
        pulses_per_scan: f64,
        flight_time_coefficient: f64,
    ) -> Result<Self, InstrumentModelError> {
        if !(pulses_per_scan > 0.0) || !pulses_per_scan.is_finite() {
            return Err(InstrumentModelError::NonPositivePulses(pulses_per_scan));
        }
        if !(flight_time_coefficient > 0.0) || !flight_time_coefficient.is_finite() {
            return Err(InstrumentModelError::NonPositiveCoefficient(
                flight_time_coefficient,
            ));
        }
        Ok(Self {
            pulses_per_scan,
            flight_time_coefficient,
        })
    }

    /// The number of extraction pulses accumulated into one scan
    #[inline]
    pub fn pulses_per_scan(&self) -> f64 {
        self.pulses_per_scan
    }

    /// The flight time proportionality constant in s/√(m/z)
    #[inline]
    pub fn flight_time_coefficient(&self) -> f64 {
        self.flight_time_coefficient
    }

    /// The flight time of an ion of the given m/z, in seconds
    #[inline]
    pub fn flight_time(&self, mz: f64) -> f64 {
        self.flight_time_coefficient * mz.sqrt()
    }

    /// Whether an ion of `mz` is still in flight when the next extraction pulse fires
    pub fn exceeds_cycle_time(&self, mz: f64, cycle_time: f64) -> bool {
        self.flight_time(mz) > cycle_time
    }
}

impl TryFrom<InstrumentConstants> for InstrumentModel {
    type Error = InstrumentModelError;

    fn try_from(value: InstrumentConstants) -> Result<Self, Self::Error> {
        value.build()
    }
}
