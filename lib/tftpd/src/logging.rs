//! Thin facade over `slog`. Components receive a `Logger` and create
//! children with `log.new(o!(...))`; anything constructed without one
//! falls back to a discard root.

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

#[derive(Debug)]
pub enum ConfigError {
    Parse(serdeconv::Error),
    Build(sloggers::Error),
}

/// Builds the default terminal logger.
pub fn init() -> Logger {
    // The embedded config is a compile-time constant; failing to parse or
    // build it is a programming error.
    from_toml(DEFAULT_CONFIG).unwrap()
}

/// Builds a logger from a `sloggers` TOML configuration string.
pub fn from_toml(config: &str) -> Result<Logger, ConfigError> {
    let config: LoggerConfig = serdeconv::from_toml_str(config).map_err(ConfigError::Parse)?;

    config.build_logger().map_err(ConfigError::Build)
}

/// A logger that swallows everything.
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
