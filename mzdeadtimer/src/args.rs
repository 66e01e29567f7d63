use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::time_range::TimeRange;

pub(crate) fn non_negative_float(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|e| e.to_string())?;
    if value < 0.0 {
        Err(format!("`{s}` is less than zero"))
    } else if !value.is_finite() {
        Err(format!("`{s}` is not a finite number"))
    } else {
        Ok(value)
    }
}

pub(crate) fn positive_float(s: &str) -> Result<f64, String> {
    let value = non_negative_float(s)?;
    if value == 0.0 {
        Err(format!("`{s}` must be greater than zero"))
    } else {
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MinimizerKind {
    /// The Nelder-Mead downhill simplex, a fast local search
    NelderMead,
    #[default]
    /// Simulated annealing, a stochastic global search
    Annealing,
    /// Evaluate every point of a regular grid over the bounds
    Grid,
}

impl Display for MinimizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Time-of-flight acquisition settings, overriding the configuration
#[derive(Args, Debug, Clone, Default)]
pub struct InstrumentArgs {
    /// The scan time in seconds
    #[arg(short = 's', long = "scan-time", value_parser = positive_float)]
    pub scan_time: Option<f64>,

    /// The extraction pulse cycle time in μs
    #[arg(short = 'c', long = "cycle-time", value_parser = positive_float)]
    pub cycle_time: Option<f64>,

    /// The effective flight path length in mm
    #[arg(short = 'l', long = "path-length", value_parser = positive_float)]
    pub path_length: Option<f64>,

    /// The effective accelerating voltage in V
    #[arg(short = 'v', long = "voltage", value_parser = positive_float)]
    pub voltage: Option<f64>,
}

/// Dead times in ns, overriding the configuration
#[derive(Args, Debug, Clone, Default)]
pub struct DeadTimeArgs {
    /// The non-extending dead time in ns
    #[arg(short = 'D', long = "non-extending", value_parser = non_negative_float)]
    pub non_extending: Option<f64>,

    /// The extending dead time in ns
    #[arg(short = 'd', long = "extending", value_parser = non_negative_float)]
    pub extending: Option<f64>,
}

/// Scan and spectrum quality thresholds, overriding the configuration
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    /// The minimum number of points a scan must have to be used
    #[arg(long = "min-points")]
    pub min_points: Option<usize>,

    /// The minimum intensity the most intense point of a scan must have to be used
    #[arg(long = "min-intensity", value_parser = non_negative_float)]
    pub min_intensity: Option<f64>,

    /// The minimum number of usable scans a cluster must have to be used
    #[arg(long = "min-scans")]
    pub min_scans: Option<usize>,
}

/// Cluster files to read, named directly or through a list file
#[derive(Args, Debug, Clone, Default)]
pub struct ClusterInputArgs {
    /// Cluster files with one `scan_index scan_time mz intensity` point per line
    #[arg()]
    pub inputs: Vec<PathBuf>,

    /// A file listing more cluster file paths, separated by whitespace
    #[arg(short = 'f', long = "list-file")]
    pub list_file: Option<PathBuf>,

    /// The scan time range to use, denoted (start?)-(stop?)
    #[arg(
        short = 'r',
        long = "time-range",
        value_parser = TimeRange::from_str,
        value_name = "BEGIN-END",
    )]
    pub time_range: Option<TimeRange>,
}

/// Correct cluster files for dead time, writing each to `<input>.corr`
#[derive(Args, Debug, Clone, Default)]
pub struct CorrectArgs {
    #[command(flatten)]
    pub input: ClusterInputArgs,

    #[command(flatten)]
    pub instrument: InstrumentArgs,

    #[command(flatten)]
    pub dead_time: DeadTimeArgs,
}

/// Correct every spectrum of an mzML or MGF file for dead time and write mzML
#[derive(Args, Debug, Clone)]
pub struct CorrectMSArgs {
    /// The path to read the input spectra from
    #[arg()]
    pub input_file: String,

    /// The path to write the output file to, or if '-' is passed, write to STDOUT.
    ///
    /// The output is mzML, gzip compressed if the path ends with `.gz`.
    #[arg(short = 'o', long = "output-file", default_value = "-")]
    pub output_file: PathBuf,

    /// The time range to correct, denoted (start?)-(stop?). Other spectra are copied as-is.
    #[arg(
        short = 'r',
        long = "time-range",
        value_parser = TimeRange::from_str,
        value_name = "BEGIN-END",
    )]
    pub time_range: Option<TimeRange>,

    /// The minimum signal-to-noise ratio for picking peaks from profile spectra
    #[arg(long = "signal-to-noise", default_value_t = 1.0, value_parser = non_negative_float)]
    pub signal_to_noise: f64,

    #[command(flatten)]
    pub instrument: InstrumentArgs,

    #[command(flatten)]
    pub dead_time: DeadTimeArgs,
}

/// Search for the dead times that minimize the curvature of cluster centroid traces
#[derive(Args, Debug, Clone, Default)]
pub struct CalibrateArgs {
    #[command(flatten)]
    pub input: ClusterInputArgs,

    #[command(flatten)]
    pub instrument: InstrumentArgs,

    // The starting point, which also sets the search bounds
    #[command(flatten)]
    pub dead_time: DeadTimeArgs,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// The search strategy to use
    #[arg(short = 'm', long = "minimizer")]
    pub minimizer: Option<MinimizerKind>,

    /// The maximum number of objective evaluations per search
    #[arg(short = 'n', long = "max-evaluations")]
    pub max_evaluations: Option<usize>,

    /// The number of independent annealing runs, each with its own random seed. Defaults to 10.
    #[arg(long = "repeats")]
    pub repeats: Option<usize>,

    /// The random seed of the first search
    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// The number of grid points per parameter for grid searches and tables
    #[arg(long = "grid-points")]
    pub grid_points: Option<usize>,

    /// Also fit the pulses per scan and the flight time coefficient, within 10%
    #[arg(long = "fit-instrument")]
    pub fit_instrument: bool,

    /// Print the total curvature over a grid of dead times before searching
    #[arg(long = "grid-table")]
    pub grid_table: bool,

    /// Write the best parameters to this TOML file, usable with `--config-file`
    #[arg(short = 'o', long = "output-file")]
    pub output_file: Option<PathBuf>,
}

/// Report the largest curvature of each cluster's centroid trace
#[derive(Args, Debug, Clone, Default)]
pub struct CurvatureArgs {
    #[command(flatten)]
    pub input: ClusterInputArgs,

    #[command(flatten)]
    pub instrument: InstrumentArgs,

    #[command(flatten)]
    pub dead_time: DeadTimeArgs,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Correct each cluster for dead time before measuring its curvature
    #[arg(long = "correct")]
    pub correct: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Correct cluster files for dead time, writing each to `<input>.corr`
    Correct(CorrectArgs),
    /// Correct every spectrum of an mzML or MGF file for dead time and write mzML
    #[command(name = "correct-ms")]
    CorrectMS(CorrectMSArgs),
    /// Search for the dead times that minimize the curvature of cluster centroid traces
    Calibrate(CalibrateArgs),
    /// Report the largest curvature of each cluster's centroid trace
    Curvature(CurvatureArgs),
}

/// Dead time correction and calibration for time-of-flight mass spectrometry data.
///
/// Correct peak clusters or whole mzML/MGF files for detector dead time, or estimate the
/// dead times from how smoothly peak centroids drift across a cluster's elution.
#[derive(Parser, Debug, Clone)]
#[command(author, version)]
pub struct MZDeadTimerArgs {
    /// The path to write a log file to, in addition to STDERR
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `mzdeadtimer.toml` in the working directory.
    /// Environment variables prefixed with `MZDEADTIMER_` will be read too.
    #[arg(long = "config-file", global = true)]
    pub config_file: Option<PathBuf>,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(short = 't', long = "threads", global = true)]
    pub threads: Option<i32>,

    #[command(subcommand)]
    pub command: Command,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_float_parsers() {
        assert_eq!(non_negative_float("0"), Ok(0.0));
        assert_eq!(non_negative_float("2.5"), Ok(2.5));
        assert!(non_negative_float("-1").is_err());
        assert!(non_negative_float("inf").is_err());
        assert!(non_negative_float("five").is_err());
        assert!(positive_float("0").is_err());
        assert_eq!(positive_float("45"), Ok(45.0));
    }

    #[test]
    fn test_parse_calibrate() {
        let args = MZDeadTimerArgs::try_parse_from([
            "mzdeadtimer",
            "calibrate",
            "a.clust",
            "b.clust",
            "-D",
            "4.5",
            "-m",
            "nelder-mead",
            "--fit-instrument",
            "-t",
            "2",
        ])
        .unwrap();
        assert_eq!(args.threads, Some(2));
        match args.command {
            Command::Calibrate(calibrate) => {
                assert_eq!(calibrate.input.inputs.len(), 2);
                assert_eq!(calibrate.dead_time.non_extending, Some(4.5));
                assert_eq!(calibrate.dead_time.extending, None);
                assert_eq!(calibrate.minimizer, Some(MinimizerKind::NelderMead));
                assert!(calibrate.fit_instrument);
                assert!(!calibrate.grid_table);
            }
            other => panic!("Wrong command {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_negative() {
        assert!(MZDeadTimerArgs::try_parse_from([
            "mzdeadtimer",
            "correct",
            "a.clust",
            "-d",
            "-2"
        ])
        .is_err());
    }
}
