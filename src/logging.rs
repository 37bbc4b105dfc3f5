use chrono::{SecondsFormat, Utc};
use log::LevelFilter;
use std::str::FromStr;
use thiserror::Error;

use crate::config::LoggingConfig;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level '{0}'")]
    InvalidLevel(String),
    #[error("failed to open log file: {0}")]
    File(#[from] std::io::Error),
    #[error("logger already initialised: {0}")]
    AlreadyInitialised(#[from] log::SetLoggerError),
}

fn parse_level(level: &str) -> Result<LevelFilter, LoggingError> {
    LevelFilter::from_str(level.trim()).map_err(|_| LoggingError::InvalidLevel(level.to_string()))
}

/// Install the global `fern` logger. `tracing` events reach it through the
/// `log` compatibility feature.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(parse_level(&config.level)?);

    for (module, level) in &config.module_levels {
        dispatch = dispatch.level_for(module.clone(), parse_level(level)?);
    }

    dispatch = dispatch.chain(std::io::stdout());
    if let Some(path) = &config.file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}
