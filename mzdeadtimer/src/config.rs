use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use mzdeadtime::{DeadTimeParams, InstrumentConstants, ScanFilter};

use crate::args::{
    CalibrateArgs, Command, DeadTimeArgs, FilterArgs, InstrumentArgs, MZDeadTimerArgs,
    MinimizerKind,
};

/// The configuration file read from the working directory when present
pub const CONFIG_FILE_NAME: &str = "mzdeadtimer.toml";
/// The prefix of environment variables read into the configuration. Nested keys are
/// separated by `__`, e.g. `MZDEADTIMER_DEAD_TIME__EXTENDING`.
pub const ENV_PREFIX: &str = "MZDEADTIMER_";

/// Settings for the parameter search of the `calibrate` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub minimizer: MinimizerKind,
    pub max_evaluations: usize,
    pub tolerance: f64,
    pub repeats: usize,
    pub seed: u64,
    pub grid_points: usize,
    pub fit_instrument: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            minimizer: MinimizerKind::Annealing,
            max_evaluations: 1000,
            tolerance: 1e-4,
            repeats: 10,
            seed: 1,
            grid_points: 11,
            fit_instrument: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub threads: i32,
    pub instrument: InstrumentConstants,
    pub dead_time: DeadTimeParams,
    pub filter: ScanFilter,
    pub calibration: CalibrationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            threads: -1,
            instrument: InstrumentConstants::default(),
            dead_time: DeadTimeParams::new(5.0, 1.0),
            filter: ScanFilter::default(),
            calibration: CalibrationConfig::default(),
        }
    }
}

fn set<T: Serialize>(figment: Figment, key: &str, value: Option<T>) -> Figment {
    match value {
        Some(value) => figment.merge(Serialized::default(key, value)),
        None => figment,
    }
}

impl InstrumentArgs {
    fn merge_into(&self, figment: Figment) -> Figment {
        let figment = set(figment, "instrument.scan_time", self.scan_time);
        let figment = set(figment, "instrument.cycle_time", self.cycle_time);
        let figment = set(figment, "instrument.path_length", self.path_length);
        set(figment, "instrument.voltage", self.voltage)
    }
}

impl DeadTimeArgs {
    fn merge_into(&self, figment: Figment) -> Figment {
        let figment = set(figment, "dead_time.non_extending", self.non_extending);
        set(figment, "dead_time.extending", self.extending)
    }
}

impl FilterArgs {
    fn merge_into(&self, figment: Figment) -> Figment {
        let figment = set(figment, "filter.min_points", self.min_points);
        let figment = set(figment, "filter.min_intensity", self.min_intensity);
        set(figment, "filter.min_scans", self.min_scans)
    }
}

impl CalibrateArgs {
    fn merge_into(&self, figment: Figment) -> Figment {
        let figment = self.instrument.merge_into(figment);
        let figment = self.dead_time.merge_into(figment);
        let figment = self.filter.merge_into(figment);
        let figment = set(figment, "calibration.minimizer", self.minimizer);
        let figment = set(figment, "calibration.max_evaluations", self.max_evaluations);
        let figment = set(figment, "calibration.repeats", self.repeats);
        let figment = set(figment, "calibration.seed", self.seed);
        let figment = set(figment, "calibration.grid_points", self.grid_points);
        set(
            figment,
            "calibration.fit_instrument",
            self.fit_instrument.then_some(true),
        )
    }
}

impl Command {
    /// Layer the flags given on the command line over `figment`
    pub fn merge_into(&self, figment: Figment) -> Figment {
        match self {
            Command::Correct(args) => {
                let figment = args.instrument.merge_into(figment);
                args.dead_time.merge_into(figment)
            }
            Command::CorrectMS(args) => {
                let figment = args.instrument.merge_into(figment);
                args.dead_time.merge_into(figment)
            }
            Command::Calibrate(args) => args.merge_into(figment),
            Command::Curvature(args) => {
                let figment = args.instrument.merge_into(figment);
                let figment = args.dead_time.merge_into(figment);
                args.filter.merge_into(figment)
            }
        }
    }
}

impl AppConfig {
    /// The configuration sources in increasing order of precedence: built-in defaults,
    /// [`CONFIG_FILE_NAME`], `config_file`, then [`ENV_PREFIX`] environment variables.
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment =
            Figment::from(Serialized::defaults(AppConfig::default())).merge(Toml::file(CONFIG_FILE_NAME));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file_exact(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load the configuration with the command line arguments taking precedence over
    /// every other source
    pub fn from_args(args: &MZDeadTimerArgs) -> Result<Self, figment::Error> {
        let figment = Self::figment(args.config_file.as_deref());
        let figment = set(figment, "threads", args.threads);
        args.command.merge_into(figment).extract()
    }
}
