use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use itertools::Itertools;
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use mzdata::io::MassSpectrometryFormat;

use mzdeadtime::{
    Bounds, CorrectionError, CurvatureObjective, DeadTimeCorrector, DeadTimeParams, GridSearch,
    InstrumentModel, InstrumentModelError, Minimizer, NelderMead, OptimizationError,
    OptimizationResult, ParameterError, ParameterSpace, SimulatedAnnealing, Spectrum,
};

use crate::args::{
    CalibrateArgs, ClusterInputArgs, Command, CorrectArgs, CurvatureArgs, MZDeadTimerArgs,
    MinimizerKind,
};
use crate::cluster::{
    corrected_path, read_cluster_file, read_list_file, write_cluster_file, ClusterParseError,
};
use crate::config::AppConfig;
use crate::progress::CorrectionRecord;

#[derive(Debug, Error)]
pub enum MZDeadTimerError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error(transparent)]
    ClusterError(#[from] ClusterParseError),
    #[error("Dead time correction of {} with {params} failed: {source}", path.display())]
    CorrectionError {
        path: PathBuf,
        params: DeadTimeParams,
        #[source]
        source: CorrectionError,
    },
    #[error("Dead time correction of spectrum {id} with {params} failed: {source}")]
    SpectrumCorrectionError {
        id: String,
        params: DeadTimeParams,
        #[source]
        source: CorrectionError,
    },
    #[error("Invalid instrument settings: {0}")]
    InstrumentError(#[from] InstrumentModelError),
    #[error("Failed to load the configuration: {0}")]
    ConfigurationError(#[from] Box<figment::Error>),
    #[error("The parameter search failed: {0}")]
    OptimizationError(#[from] OptimizationError),
    #[error("The parameter search produced unusable parameters: {0}")]
    ParameterError(#[from] ParameterError),
    #[error("Failed to serialize the calibrated parameters: {0}")]
    SerializationError(#[from] toml::ser::Error),
    #[error("The input file format for {0} was either unknown or not supported ({1:?})")]
    FormatUnknownOrNotSupportedError(String, MassSpectrometryFormat),
    #[error("The output file format for {0} was either unknown or not supported ({1:?})")]
    OutputFormatUnknownOrNotSupportedError(String, MassSpectrometryFormat),
    #[error("Failed to centroid spectrum {0}: {1}")]
    CentroidingError(String, String),
    #[error("No input cluster files were given")]
    NoInputs,
    #[error("None of the {0} clusters had enough usable scans")]
    NoUsableSpectra(usize),
}

impl From<figment::Error> for MZDeadTimerError {
    fn from(value: figment::Error) -> Self {
        Self::ConfigurationError(Box::new(value))
    }
}

/// The calibrated values written by `calibrate --output-file`, in the shape of the
/// configuration file so they can be passed back with `--config-file`.
#[derive(Debug, Clone, Serialize)]
struct CalibrationOutput {
    objective: f64,
    evaluations: usize,
    dead_time: DeadTimeParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    fitted_instrument: Option<InstrumentModel>,
}

/// The resolved configuration and the command to run with it
#[derive(Debug, Clone)]
pub struct MZDeadTimer {
    pub config: AppConfig,
    pub command: Command,
}

impl MZDeadTimer {
    pub fn new(config: AppConfig, command: Command) -> Self {
        Self { config, command }
    }

    pub fn from_args(args: &MZDeadTimerArgs) -> Result<Self, MZDeadTimerError> {
        if let Some(path) = args.config_file.as_deref() {
            if !path.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Configuration file {} does not exist", path.display()),
                )
                .into());
            }
        }
        let config = AppConfig::from_args(args)?;
        Ok(Self::new(config, args.command.clone()))
    }

    fn create_threadpool(&self) -> Result<rayon::ThreadPool, MZDeadTimerError> {
        let num_threads = if self.config.threads > 0 {
            self.config.threads as usize
        } else {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        };
        debug!("Using {} cores", num_threads);
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| io::Error::other(e).into())
    }

    pub(crate) fn instrument_model(&self) -> Result<InstrumentModel, MZDeadTimerError> {
        let model = self.config.instrument.build()?;
        debug!(
            "{} pulses per scan, flight time coefficient {:e} s",
            model.pulses_per_scan(),
            model.flight_time_coefficient()
        );
        Ok(model)
    }

    /// Warn when the heaviest ions would still be in flight at the next pulse
    pub(crate) fn check_cycle_time(&self, model: &InstrumentModel, max_mz: Option<f64>) {
        if let Some(mz) = max_mz {
            let cycle_time = self.config.instrument.cycle_time_seconds();
            if model.exceeds_cycle_time(mz, cycle_time) {
                warn!(
                    "The flight time of m/z {mz:0.3} ({:0.3e} s) exceeds the cycle time ({cycle_time:0.3e} s)",
                    model.flight_time(mz)
                );
            }
        }
    }

    pub fn main(&self) -> Result<(), MZDeadTimerError> {
        info!(
            "mzdeadtimer v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        debug!("{:?}", self.config);
        let pool = self.create_threadpool()?;
        pool.install(|| match &self.command {
            Command::Correct(args) => self.correct(args),
            Command::CorrectMS(args) => self.correct_ms(args),
            Command::Calibrate(args) => self.calibrate(args),
            Command::Curvature(args) => self.curvature(args),
        })
    }

    fn collect_inputs(input: &ClusterInputArgs) -> Result<Vec<PathBuf>, MZDeadTimerError> {
        let mut paths = input.inputs.clone();
        if let Some(list_file) = input.list_file.as_deref() {
            let listed = read_list_file(list_file)?;
            debug!("Read {} paths from {}", listed.len(), list_file.display());
            paths.extend(listed);
        }
        if paths.is_empty() {
            return Err(MZDeadTimerError::NoInputs);
        }
        Ok(paths)
    }

    fn load_cluster(input: &ClusterInputArgs, path: &Path) -> Result<Spectrum, MZDeadTimerError> {
        let mut spectrum = read_cluster_file(path)?;
        if let Some(time_range) = input.time_range {
            time_range.restrict(&mut spectrum);
        }
        Ok(spectrum)
    }

    fn load_clusters(
        input: &ClusterInputArgs,
        paths: &[PathBuf],
    ) -> Result<Vec<Spectrum>, MZDeadTimerError> {
        let start = Instant::now();
        let spectra: Vec<Spectrum> = paths
            .par_iter()
            .map(|path| Self::load_cluster(input, path))
            .collect::<Result<_, _>>()?;
        info!(
            "Loaded {} clusters with {} points in {:0.3?}",
            spectra.len(),
            spectra.iter().map(Spectrum::point_count).sum::<usize>(),
            start.elapsed()
        );
        Ok(spectra)
    }

    fn correct(&self, args: &CorrectArgs) -> Result<(), MZDeadTimerError> {
        let paths = Self::collect_inputs(&args.input)?;
        let model = self.instrument_model()?;
        let params = self.config.dead_time;
        let corrector = DeadTimeCorrector::new(model, params);
        info!("Correcting {} clusters with {params}", paths.len());

        let start = Instant::now();
        let corrected: Vec<(PathBuf, Spectrum, CorrectionRecord)> = paths
            .par_iter()
            .map(|path| -> Result<_, MZDeadTimerError> {
                let spectrum = Self::load_cluster(&args.input, path)?;
                self.check_cycle_time(&model, spectrum.max_mz());
                let corrected = corrector.correct(&spectrum).map_err(|source| {
                    MZDeadTimerError::CorrectionError {
                        path: path.clone(),
                        params,
                        source,
                    }
                })?;
                let record = CorrectionRecord {
                    files: 1,
                    spectra: 1,
                    scans: corrected.len(),
                    points: corrected.point_count(),
                    intensity_before: spectrum.total_intensity(),
                    intensity_after: corrected.total_intensity(),
                };
                Ok((corrected_path(path), corrected, record))
            })
            .collect::<Result<_, _>>()?;

        // Nothing is written unless every cluster was corrected
        let record = corrected
            .par_iter()
            .map(|(destination, spectrum, record)| -> Result<_, MZDeadTimerError> {
                write_cluster_file(destination, spectrum)?;
                debug!("Wrote {}", destination.display());
                Ok(*record)
            })
            .try_reduce(CorrectionRecord::default, |a, b| Ok(a + b))?;

        info!(
            "Corrected {} files | Scans={} Points={} | Intensity gained {:0.2}%",
            record.files,
            record.scans,
            record.points,
            record.gain() * 100.0
        );
        info!("Elapsed Time: {:0.3?}", start.elapsed());
        Ok(())
    }

    fn run_minimizer(
        &self,
        objective: &CurvatureObjective,
        x0: &[f64],
        bounds: &Bounds,
        repeat: usize,
    ) -> Result<OptimizationResult, OptimizationError> {
        let calibration = &self.config.calibration;
        let f = |x: &[f64]| objective.evaluate(x);
        match calibration.minimizer {
            MinimizerKind::NelderMead => {
                NelderMead::new(calibration.max_evaluations, calibration.tolerance)
                    .minimize(f, x0, bounds)
            }
            MinimizerKind::Annealing => SimulatedAnnealing::new(
                calibration.seed.wrapping_add(repeat as u64),
                calibration.max_evaluations,
            )
            .minimize(f, x0, bounds),
            MinimizerKind::Grid => {
                GridSearch::new(calibration.grid_points).minimize(f, x0, bounds)
            }
        }
    }

    /// Print the total curvature over a grid of dead times, one row per non-extending
    /// dead time
    fn print_grid_table(
        &self,
        objective: &CurvatureObjective,
        model: &InstrumentModel,
    ) -> Result<(), MZDeadTimerError> {
        let space = ParameterSpace::DeadTime { model: *model };
        let bounds = space.default_bounds(model, &self.config.dead_time)?;
        let search = GridSearch::new(self.config.calibration.grid_points.max(1));
        let grid = search.evaluate_grid(
            |x| objective.evaluate_params(*model, DeadTimeParams::new(x[0], x[1])),
            &bounds,
        );
        let row_length = grid.len() / search.points_per_dim.max(1);
        if row_length == 0 {
            return Ok(());
        }
        let header = grid
            .iter()
            .take(row_length)
            .map(|(x, _)| format!("{:>12.3}", x[1]))
            .join(" ");
        println!("{:>8} {header}", "DT");
        for row in grid.chunks(row_length) {
            let values = row.iter().map(|(_, v)| format!("{v:>12.5e}")).join(" ");
            println!("{:>8.3} {values}", row[0].0[0]);
        }
        Ok(())
    }

    fn calibrate(&self, args: &CalibrateArgs) -> Result<(), MZDeadTimerError> {
        let paths = Self::collect_inputs(&args.input)?;
        let spectra = Self::load_clusters(&args.input, &paths)?;
        let model = self.instrument_model()?;
        self.check_cycle_time(
            &model,
            spectra
                .iter()
                .filter_map(Spectrum::max_mz)
                .max_by(|a, b| a.total_cmp(b)),
        );

        let calibration = &self.config.calibration;
        let space = if calibration.fit_instrument {
            ParameterSpace::DeadTimeAndInstrument
        } else {
            ParameterSpace::DeadTime { model }
        };
        let objective = CurvatureObjective::with_filter(spectra, space, &self.config.filter)
            .with_parallelism(true);
        if objective.is_empty() {
            return Err(MZDeadTimerError::NoUsableSpectra(paths.len()));
        }
        info!("Calibrating on {} clusters", objective.len());

        let params = self.config.dead_time;
        let x0 = space.encode(&model, &params);
        let bounds = space.default_bounds(&model, &params)?;
        info!(
            "Starting from {params} with the {} minimizer within {:?} to {:?}",
            calibration.minimizer,
            bounds.lower(),
            bounds.upper()
        );

        if args.grid_table {
            self.print_grid_table(&objective, &model)?;
        }

        let repeats = match calibration.minimizer {
            MinimizerKind::Annealing => calibration.repeats.max(1),
            _ => {
                if calibration.repeats > 1 {
                    debug!(
                        "The {} minimizer is deterministic, running it once",
                        calibration.minimizer
                    );
                }
                1
            }
        };

        let start = Instant::now();
        let mut best: Option<OptimizationResult> = None;
        for repeat in 0..repeats {
            let result = self.run_minimizer(&objective, &x0, &bounds, repeat)?;
            let (fitted_model, fitted) = space.decode(&result.x)?;
            if repeats > 1 {
                println!("Repeat {}", repeat + 1);
            }
            println!("Non-extending DT: {:.3} ns", fitted.non_extending);
            println!("Extending DT: {:.3} ns", fitted.extending);
            if calibration.fit_instrument {
                println!("Pulses per scan: {:.3}", fitted_model.pulses_per_scan());
                println!(
                    "Flight time coefficient: {:.6e} s",
                    fitted_model.flight_time_coefficient()
                );
            }
            println!("minimum: {:.5}", result.value);
            debug!(
                "Repeat {} used {} evaluations over {} iterations",
                repeat + 1,
                result.evaluations,
                result.iterations
            );
            if !fitted.is_physical() {
                warn!("The extending dead time exceeds the non-extending dead time: {fitted}");
            }
            if best.as_ref().map_or(true, |b| result.value < b.value) {
                best = Some(result);
            }
        }
        info!("Elapsed Time: {:0.3?}", start.elapsed());

        if let (Some(best), Some(path)) = (best, args.output_file.as_deref()) {
            let (fitted_model, fitted) = space.decode(&best.x)?;
            let failures = objective
                .breakdown_params(fitted_model, fitted)
                .iter()
                .filter(|s| s.is_penalty())
                .count();
            if failures > 0 {
                warn!("{failures} clusters could not be corrected with {fitted}");
            }
            let output = CalibrationOutput {
                dead_time: fitted,
                fitted_instrument: calibration.fit_instrument.then_some(fitted_model),
                objective: best.value,
                evaluations: best.evaluations,
            };
            std::fs::write(path, toml::to_string_pretty(&output)?)?;
            info!("Wrote calibrated parameters to {}", path.display());
        }
        Ok(())
    }

    fn curvature(&self, args: &CurvatureArgs) -> Result<(), MZDeadTimerError> {
        let paths = Self::collect_inputs(&args.input)?;
        let corrector = if args.correct {
            let model = self.instrument_model()?;
            info!("Correcting clusters with {}", self.config.dead_time);
            Some(DeadTimeCorrector::new(model, self.config.dead_time))
        } else {
            None
        };
        let filter = self.config.filter;

        let measured: Vec<Result<Option<(f64, f64)>, MZDeadTimerError>> = paths
            .par_iter()
            .map(|path| {
                let spectrum = Self::load_cluster(&args.input, path)?;
                let Some(mut spectrum) = filter.apply(spectrum) else {
                    warn!("{} has too few usable scans", path.display());
                    return Ok(None);
                };
                if let Some(corrector) = corrector.as_ref() {
                    spectrum = corrector.correct(&spectrum).map_err(|source| {
                        MZDeadTimerError::CorrectionError {
                            path: path.clone(),
                            params: *corrector.params(),
                            source,
                        }
                    })?;
                }
                let trace = mzdeadtime::CentroidTrace::from_spectrum(&spectrum);
                match trace.fit() {
                    Ok(fit) => Ok(Some((
                        fit.max_curvature(&trace.times),
                        fit.total_curvature(&trace.times),
                    ))),
                    Err(e) => {
                        warn!("Failed to fit the centroid trace of {}: {e}", path.display());
                        Ok(None)
                    }
                }
            })
            .collect();

        for (path, result) in paths.iter().zip(measured) {
            if let Some((max_curvature, total_curvature)) = result? {
                println!(
                    "{}: {max_curvature:.6e} {total_curvature:.6e}",
                    path.display()
                );
            }
        }
        Ok(())
    }
}
