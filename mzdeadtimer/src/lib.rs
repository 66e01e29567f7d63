mod args;
pub mod cluster;
mod config;
mod driver;
mod ms;
mod progress;
mod time_range;

pub use args::*;
pub use config::{AppConfig, CalibrationConfig, CONFIG_FILE_NAME, ENV_PREFIX};
pub use driver::{MZDeadTimer, MZDeadTimerError};
pub use progress::CorrectionRecord;
pub use time_range::{TimeRange, TimeRangeParseError};
