pub mod config;
pub mod types;

pub use config::{ConfigError, ConfigResult, SporeConfig, parse_duration};
pub use types::*;
